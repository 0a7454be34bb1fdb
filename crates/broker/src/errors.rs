#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker dispatcher has shut down")]
    Closed,

    #[error("unknown node {0}")]
    UnknownNode(String),

    #[error("model {0} is not a governance-known model")]
    UnknownModel(String),

    #[error("phase not synced")]
    NotSynced,
}

pub type BrokerResult<T> = Result<T, BrokerError>;
