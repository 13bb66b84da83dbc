pub mod config;
pub mod error;
pub mod logging;
pub mod materializer;
pub mod models;
pub mod resolver;
pub mod scheduler;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
