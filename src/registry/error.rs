use std::{error::Error, fmt};

/// The registry module's result type.
pub type Result<T> = std::result::Result<T, RegistryErr>;

/// Registry and resolver failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryErr {
    TypeMismatch {
        key: String,
    },
    MalformedPattern {
        pattern: String,
        reason: &'static str,
    },
    NotFound {
        pattern: String,
    },
}

impl fmt::Display for RegistryErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryErr::TypeMismatch { key } => {
                write!(f, "value written to '{key}' is incompatible with its associated type")
            }
            RegistryErr::MalformedPattern { pattern, reason } => {
                write!(f, "malformed match identifier '{pattern}': {reason}")
            }
            RegistryErr::NotFound { pattern } => {
                write!(f, "no registry entry matches '{pattern}'")
            }
        }
    }
}

impl Error for RegistryErr {}
