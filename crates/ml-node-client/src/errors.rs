#[derive(Debug, thiserror::Error)]
pub enum NodeClientError {
    #[error("request cancelled")]
    Cancelled,

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("precondition not met: {0}")]
    Precondition(String),
}

pub type NodeClientResult<T> = Result<T, NodeClientError>;
