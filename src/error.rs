pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the scheduler core.
///
/// Every variant is fatal at this layer: callers surface the error and
/// stop, worker threads record it and fail the whole pool. There is no
/// soft-failure retry path below the pool's public surface.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("resource exhaustion: {0}")]
    Resource(String),

    #[error("kernel build failure: {0}")]
    Build(String),

    #[error("kernel launch failure: {0}")]
    Launch(String),

    #[error("internal consistency error: {0}")]
    InternalConsistency(String),
}

impl Error {
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn resource<S: Into<String>>(msg: S) -> Self {
        Error::Resource(msg.into())
    }

    pub fn build<S: Into<String>>(msg: S) -> Self {
        Error::Build(msg.into())
    }

    pub fn launch<S: Into<String>>(msg: S) -> Self {
        Error::Launch(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::InternalConsistency(msg.into())
    }
}
