use slipway_core::NameError;
use thiserror::Error;

pub type ProxyResult<T> = Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid host name {0:?}")]
    InvalidHost(String),

    #[error(transparent)]
    InvalidLabel(#[from] NameError),

    #[error("proxy config i/o error: {0}")]
    Io(String),

    #[error("proxy rejected the configuration: {0}")]
    ConfigRejected(String),

    #[error("proxy reload failed: {0}")]
    ReloadFailed(String),

    #[error("failed to run `{command}`: {reason}")]
    Command { command: String, reason: String },
}

impl ProxyError {
    pub(crate) fn io(e: std::io::Error) -> Self {
        ProxyError::Io(e.to_string())
    }
}
