use thiserror::Error;

pub type ProxyResult<T> = Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("certificate error: {0}")]
    Certificate(String),
    #[error("no forward action defined")]
    NoForwardAction,
    #[error("request cancelled")]
    Cancelled,
    #[error("hook error: {0}")]
    Hook(String),
}

impl ProxyError {
    pub(crate) fn protocol(detail: impl Into<String>) -> Self {
        Self::Protocol(detail.into())
    }

    pub(crate) fn certificate(detail: impl std::fmt::Display) -> Self {
        Self::Certificate(detail.to_string())
    }
}

impl From<osmosis_certauth::CaError> for ProxyError {
    fn from(error: osmosis_certauth::CaError) -> Self {
        Self::Certificate(error.to_string())
    }
}

pub(crate) fn h2_error(context: &str, error: h2::Error) -> ProxyError {
    if let Some(io_error) = error.get_io() {
        return ProxyError::Transport(std::io::Error::new(
            io_error.kind(),
            format!("{context}: {error}"),
        ));
    }
    ProxyError::Transport(std::io::Error::other(format!("{context}: {error}")))
}
