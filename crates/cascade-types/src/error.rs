use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum DomainError {
    #[error("max fanout depth of {max} exceeded")]
    MaxFanoutDepthExceeded { max: usize },
}
