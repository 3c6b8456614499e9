pub mod health;
pub mod jobs;
pub mod schedulers;
pub mod shared;
pub mod webhooks;

pub use health::health_handler;
