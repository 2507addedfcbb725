pub mod operation;
pub mod plan;
pub mod subscription;
pub mod tenant;
pub mod usage;

pub use operation::*;
pub use plan::*;
pub use subscription::*;
pub use tenant::*;
pub use usage::*;
