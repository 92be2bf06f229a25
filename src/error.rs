use std::{error::Error, fmt};

use crate::{operator::OperatorState, registry::RegistryErr};

/// The operator's result type.
pub type Result<T> = std::result::Result<T, OperatorErr>;

/// Operator boundary failures.
#[derive(Debug)]
pub enum OperatorErr {
    BadState {
        attempted: &'static str,
        current: OperatorState,
    },
    RequiredByDependents {
        dependents: usize,
    },
    TooManyPushers {
        epoch: usize,
        worker: usize,
    },
    UnknownHook,
    UnassignedNetwork,
    InvalidHook {
        reason: String,
    },
    MergeMismatch {
        identifier: String,
    },
    SizeMismatch {
        got: usize,
        expected: usize,
    },
    UnsupportedNetwork {
        expected: &'static str,
    },
    InvalidData {
        reason: String,
    },
    OperatorDropped,
    Registry(RegistryErr),
}

impl fmt::Display for OperatorErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorErr::BadState { attempted, current } => {
                write!(f, "cannot {attempted}: operator is {current}")
            }
            OperatorErr::RequiredByDependents { dependents } => {
                write!(f, "hook is required by {dependents} attached dependents")
            }
            OperatorErr::TooManyPushers { epoch, worker } => {
                write!(
                    f,
                    "worker {worker} pushed into an already full network slot array for epoch {epoch}"
                )
            }
            OperatorErr::UnknownHook => write!(f, "hook is not attached to this operator"),
            OperatorErr::UnassignedNetwork => {
                write!(f, "no network has been assigned to the operator")
            }
            OperatorErr::InvalidHook { reason } => write!(f, "invalid hook: {reason}"),
            OperatorErr::MergeMismatch { identifier } => {
                write!(f, "pushed network is missing parameter '{identifier}'")
            }
            OperatorErr::SizeMismatch { got, expected } => {
                write!(f, "buffer length mismatch: got {got}, expected {expected}")
            }
            OperatorErr::UnsupportedNetwork { expected } => {
                write!(f, "training step expects a {expected} network")
            }
            OperatorErr::InvalidData { reason } => write!(f, "invalid dataset: {reason}"),
            OperatorErr::OperatorDropped => {
                write!(f, "the owning operator has been dropped")
            }
            OperatorErr::Registry(e) => write!(f, "registry error: {e}"),
        }
    }
}

impl Error for OperatorErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            OperatorErr::Registry(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RegistryErr> for OperatorErr {
    fn from(value: RegistryErr) -> Self {
        Self::Registry(value)
    }
}
