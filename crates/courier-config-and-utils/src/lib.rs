//! Configuration, paths, and logging for the Courier delivery core.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{
    Config, DlqSettings, IdempotencySettings, RetrySettings, WorkerSettings, DEFAULT_LOG_LEVEL,
};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, parse_level, LogFormat};
pub use paths::Paths;
