pub mod alerting;
pub mod collector;
pub mod health;
pub mod reporter;
