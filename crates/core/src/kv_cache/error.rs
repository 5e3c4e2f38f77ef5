use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("prompt too long: requires {required} cache positions, context holds {capacity}")]
    PromptTooLong { required: usize, capacity: usize },
}
