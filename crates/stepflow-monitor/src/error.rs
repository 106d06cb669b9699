use stepflow_config::ConfigError;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}
