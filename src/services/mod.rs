pub mod auth;
pub mod calls;
pub mod notifications;
pub mod presence;
pub mod shop;
pub mod viewers;
