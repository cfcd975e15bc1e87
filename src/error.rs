//! Unified error types for vmcow using thiserror

use thiserror::Error;

use crate::mach_vm::memory_object::PageRequest;

/// Status returned by every fallible VM operation
#[derive(Error, Debug, Clone)]
pub enum VmError {
    #[error("offset or length outside object bounds")]
    OutOfRange,

    #[error("operation not permitted in current state: {0}")]
    BadState(&'static str),

    #[error("slot already committed")]
    AlreadyExists,

    #[error("out of physical pages")]
    NoMemory,

    #[error("resource unavailable")]
    Unavailable,

    /// Not a failure: wait on the request, then retry the operation.
    #[error("content not yet available from pager")]
    ShouldWait(PageRequest),

    #[error("not found")]
    NotFound,

    #[error("invalid arguments")]
    InvalidArgs,

    #[error("pager reported an I/O failure")]
    Io,
}

/// Payload-free discriminant of [`VmError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    OutOfRange,
    BadState,
    AlreadyExists,
    NoMemory,
    Unavailable,
    ShouldWait,
    NotFound,
    InvalidArgs,
    Io,
}

impl VmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VmError::OutOfRange => ErrorKind::OutOfRange,
            VmError::BadState(_) => ErrorKind::BadState,
            VmError::AlreadyExists => ErrorKind::AlreadyExists,
            VmError::NoMemory => ErrorKind::NoMemory,
            VmError::Unavailable => ErrorKind::Unavailable,
            VmError::ShouldWait(_) => ErrorKind::ShouldWait,
            VmError::NotFound => ErrorKind::NotFound,
            VmError::InvalidArgs => ErrorKind::InvalidArgs,
            VmError::Io => ErrorKind::Io,
        }
    }

    /// Rebuild an error from its kind. `ShouldWait` has no request to carry
    /// and maps to `Unavailable`.
    pub fn from_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::OutOfRange => VmError::OutOfRange,
            ErrorKind::BadState => VmError::BadState("pager failure"),
            ErrorKind::AlreadyExists => VmError::AlreadyExists,
            ErrorKind::NoMemory => VmError::NoMemory,
            ErrorKind::Unavailable | ErrorKind::ShouldWait => VmError::Unavailable,
            ErrorKind::NotFound => VmError::NotFound,
            ErrorKind::InvalidArgs => VmError::InvalidArgs,
            ErrorKind::Io => VmError::Io,
        }
    }
}

pub type VmResult<T> = core::result::Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_error_kind_round_trip() {
        for kind in [
            ErrorKind::OutOfRange,
            ErrorKind::NoMemory,
            ErrorKind::NotFound,
            ErrorKind::Io,
        ] {
            assert_eq!(VmError::from_kind(kind).kind(), kind);
        }
        assert_eq!(
            VmError::from_kind(ErrorKind::ShouldWait).kind(),
            ErrorKind::Unavailable
        );
    }

    #[test]
    fn test_error_display() {
        let err = VmError::BadState("pinned pages in range");
        assert_eq!(
            err.to_string(),
            "operation not permitted in current state: pinned pages in range"
        );
    }
}
