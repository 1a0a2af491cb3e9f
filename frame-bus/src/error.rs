pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad dimensions, frame rate or format handed to a constructor.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Allocation, thread or synchronization primitive creation failed.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Scaler creation failed or the requested conversion is unsupported.
    #[error("conversion failure: {0}")]
    Conversion(String),

    /// Codec instance creation or encoding failed.
    #[error("codec failure: {0}")]
    Codec(String),

    /// Operation on a closed, destroyed or wrongly typed object.
    #[error("invalid state: {0}")]
    State(String),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidParameter(msg.into())
    }

    pub(crate) fn state(msg: impl Into<String>) -> Self {
        Error::State(msg.into())
    }

    pub(crate) fn codec(err: &anyhow::Error) -> Self {
        Error::Codec(format!("{:#}", err))
    }

    pub(crate) fn conversion(msg: impl Into<String>) -> Self {
        Error::Conversion(msg.into())
    }
}
