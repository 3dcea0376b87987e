// SPDX-License-Identifier: MPL-2.0

//! Kernel error values.
//!
//! Recoverable failures are carried as an [`Error`]; conditions that mean the
//! kernel's own invariants are broken (non-owner mutex release, a kernel-mode
//! fault on an unmapped address with no recovery frame armed) are panics and
//! never appear here.

/// The kind of a kernel error.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A wait ran out its timeout.
    Timeout,
    /// An alertable wait was broken by an alert.
    Signalled,
    /// A caller-supplied argument was malformed.
    InvalidArgument,
    /// No physical pages (or no wired heap) to satisfy the request.
    OutOfMemory,
    /// A non-memory resource (address space, slots, queue room) ran out.
    ResourceExhausted,
    /// The named thing does not exist.
    NotPresent,
    /// The access violates the protection in force.
    PermissionDenied,
    /// Transient condition; the caller should back off and retry.
    Retry,
}

/// Error used across the kernel.
#[derive(Debug, Clone, Copy)]
pub struct Error {
    kind: ErrorKind,
    msg: Option<&'static str>,
}

impl Error {
    pub const fn new(kind: ErrorKind) -> Self {
        Error { kind, msg: None }
    }

    pub const fn with_message(kind: ErrorKind, msg: &'static str) -> Self {
        Error {
            kind,
            msg: Some(msg),
        }
    }

    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub const fn message(&self) -> Option<&'static str> {
        self.msg
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[macro_export]
macro_rules! return_error {
    ($kind: expr) => {
        return Err($crate::error::Error::new($kind))
    };
}

#[macro_export]
macro_rules! return_error_with_message {
    ($kind: expr, $message: expr) => {
        return Err($crate::error::Error::with_message($kind, $message))
    };
}
