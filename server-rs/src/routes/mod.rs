pub mod admin;
pub mod billing;
pub mod enforce;
pub mod health;
pub mod plans;
pub mod tenants;
pub mod webhooks;
