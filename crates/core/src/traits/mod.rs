pub mod agent;
pub mod repository;

pub use agent::*;
pub use repository::*;
