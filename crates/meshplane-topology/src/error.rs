use thiserror::Error;

pub type TopologyResult<T> = Result<T, TopologyError>;

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("invalid WireGuard key: {0}")]
    InvalidKey(String),
}
