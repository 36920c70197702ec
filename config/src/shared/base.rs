use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A numeric field holds a value outside its allowed range.
    #[error("invalid value for `{field}`: {constraint}")]
    InvalidFieldValue {
        field: &'static str,
        constraint: &'static str,
    },
    /// The entity registry is empty after filtering.
    #[error("no entities are configured")]
    NoEntities,
    /// Two entities share the same name.
    #[error("duplicate entity name `{0}` in the registry")]
    DuplicateEntityName(String),
}
