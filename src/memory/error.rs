use std::fmt;

use super::vm::VmError;

/// Which tier refused an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Pool,
    Heap,
    Arena,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Pool => write!(f, "pool"),
            Tier::Heap => write!(f, "heap"),
            Tier::Arena => write!(f, "arena"),
        }
    }
}

/// Allocation-path error. Ordinary exhaustion is a value, never a panic;
/// callers fall through to the next tier or surface `None`.
#[derive(Debug)]
pub enum AllocError {
    /// The tier has no room for this request.
    Exhausted { tier: Tier, size: usize },
    /// A record lookup failed validation (missing entry or bad tag).
    Corruption { addr: usize },
    /// The caller passed something the operation cannot serve.
    InvalidRequest(&'static str),
    /// The platform VM layer failed underneath us.
    Platform(VmError),
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::Exhausted { tier, size } => {
                write!(f, "{tier} tier exhausted serving {size} bytes")
            }
            AllocError::Corruption { addr } => {
                write!(f, "allocation record corrupt or missing for {addr:#x}")
            }
            AllocError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            AllocError::Platform(e) => write!(f, "platform VM error: {e}"),
        }
    }
}

impl std::error::Error for AllocError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AllocError::Platform(e) => Some(e),
            _ => None,
        }
    }
}

impl From<VmError> for AllocError {
    fn from(e: VmError) -> Self {
        AllocError::Platform(e)
    }
}
