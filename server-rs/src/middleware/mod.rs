pub mod auth;
pub mod tenant;

pub use auth::*;
pub use tenant::*;
