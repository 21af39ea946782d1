//! Command error model.

use thiserror::Error;

use crate::attribute::AttributeKind;

/// Result type for attribute access.
pub type AttributeResult<T> = Result<T, AttributeError>;

/// Failure reading an attribute from a command.
///
/// Always surfaced synchronously to the caller; nothing retries these.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AttributeError {
    /// The command carries no attribute with this key.
    #[error("attribute '{attribute}' not found")]
    NotFound { attribute: String },

    /// The stored value is of a different kind than the one requested.
    #[error("attribute '{attribute}' is {found}, requested {expected}")]
    TypeMismatch {
        attribute: String,
        expected: AttributeKind,
        found: AttributeKind,
    },

    /// Both sides are lists, but their element kinds differ.
    #[error("attribute '{attribute}' is a list of {found}, requested a list of {expected}")]
    ListTypeMismatch {
        attribute: String,
        expected: AttributeKind,
        found: AttributeKind,
    },
}

impl AttributeError {
    pub fn not_found(attribute: impl Into<String>) -> Self {
        Self::NotFound {
            attribute: attribute.into(),
        }
    }

    /// Key of the attribute the failed access was about.
    pub fn attribute(&self) -> &str {
        match self {
            Self::NotFound { attribute }
            | Self::TypeMismatch { attribute, .. }
            | Self::ListTypeMismatch { attribute, .. } => attribute,
        }
    }
}

/// An identifier could not be parsed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid {kind}: {reason}")]
pub struct InvalidId {
    pub kind: &'static str,
    pub reason: String,
}
