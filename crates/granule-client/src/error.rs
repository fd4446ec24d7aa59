//! Client error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("invalid uri: {0}")]
    InvalidUri(#[from] granule_core::Error),

    #[error("malformed link-format payload: {0}")]
    LinkFormat(granule_core::Error),

    #[error("could not resolve {0}")]
    Resolve(String),

    #[error("endpoint does not serve {0}")]
    SchemeNotServed(granule_core::Scheme),

    #[error("request timed out")]
    Timeout,

    #[error("rejected by peer")]
    Rejected,

    #[error(transparent)]
    Engine(granule_engine::EngineError),

    #[error(transparent)]
    Transport(#[from] granule_transport::TransportError),

    #[error("response channel closed")]
    Closed,
}

impl From<granule_engine::EngineError> for ClientError {
    fn from(e: granule_engine::EngineError) -> Self {
        match e {
            granule_engine::EngineError::Rejected => ClientError::Rejected,
            other => ClientError::Engine(other),
        }
    }
}
