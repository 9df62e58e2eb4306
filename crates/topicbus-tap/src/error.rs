use thiserror::Error;

#[derive(Debug, Error)]
pub enum TapError {
    #[error(transparent)]
    Bus(#[from] topicbus::Error),

    #[error("failed to start signal runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("failed to write output: {0}")]
    Output(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TapError>;
