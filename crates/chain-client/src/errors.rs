#[derive(Debug, thiserror::Error)]
pub enum ChainClientError {
    #[error("chain unavailable: {0}")]
    Unavailable(String),

    #[error("unknown model {0}")]
    UnknownModel(String),
}

pub type ChainClientResult<T> = Result<T, ChainClientError>;
