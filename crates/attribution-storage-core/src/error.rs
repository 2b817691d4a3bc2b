#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AttributionError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("storage error: {0}")]
    Storage(String),
}
