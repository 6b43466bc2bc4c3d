pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::ExoConfig;
pub use error::{ExoError, Result};
pub use types::*;
