use crate::store::StateError;
use pantomime_tools::InvokeError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Invoke(#[from] InvokeError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("unknown app '{0}'")]
    UnknownApp(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed definition: {0}")]
    Json(#[from] serde_json::Error),
}
