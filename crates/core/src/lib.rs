pub mod config;
pub mod cron;
pub mod errors;
pub mod models;
pub mod traits;

pub use crate::config::*;
pub use crate::cron::CronExpression;
pub use errors::*;
pub use models::*;
pub use traits::*;
