//! Crate-wide status/error vocabulary.
//!
//! Every synchronous entry point in this crate returns `Result<T, CoreError>`.
//! Asynchronous entry points surface the same `CoreError` as the error half
//! of a fulfilled future — there is no separate "async error" type.
//! Synchronous operations get a status plus an optional human-readable
//! buffer, and asynchronous operations surface errors exclusively through
//! future fulfillment.

use std::fmt;

/// The fixed status vocabulary exposed at the crate boundary.
///
/// This mirrors the stable, small error-code set a C ABI would export
/// (`EINVAL`, `ENOENT`, `EEXIST`, `ETIMEDOUT`, `EAGAIN`, `ECONNRESET`, ...)
/// rather than growing an open-ended enum per module: callers that bridge to
/// POSIX errno or to RPC status codes can match on this exhaustively.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Status {
    Ok,
    Invalid,
    NotFound,
    Exists,
    Timeout,
    NoData,
    NoSpace,
    WouldBlock,
    ConnectionReset,
    AlreadySet,
    Interrupted,
}

impl Status {
    pub fn is_ok(self) -> bool {
        matches!(self, Status::Ok)
    }

    /// Best-effort mapping to a POSIX errno, for collaborators that need one.
    pub fn to_errno(self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::Invalid => libc_errno::EINVAL,
            Status::NotFound => libc_errno::ENOENT,
            Status::Exists => libc_errno::EEXIST,
            Status::Timeout => libc_errno::ETIMEDOUT,
            Status::NoData => libc_errno::ENODATA,
            Status::NoSpace => libc_errno::ENOSPC,
            Status::WouldBlock => libc_errno::EAGAIN,
            Status::ConnectionReset => libc_errno::ECONNRESET,
            Status::AlreadySet => libc_errno::EALREADY,
            Status::Interrupted => libc_errno::EINTR,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Ok => "ok",
            Status::Invalid => "invalid",
            Status::NotFound => "not-found",
            Status::Exists => "exists",
            Status::Timeout => "timeout",
            Status::NoData => "no-data",
            Status::NoSpace => "no-space",
            Status::WouldBlock => "would-block",
            Status::ConnectionReset => "connection-reset",
            Status::AlreadySet => "already-set",
            Status::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// A small, dependency-free errno table: we don't want a hard `libc` runtime
/// requirement just to stamp stable integer values on [`Status`].
mod libc_errno {
    pub const EINVAL: i32 = 22;
    pub const ENOENT: i32 = 2;
    pub const EEXIST: i32 = 17;
    pub const ETIMEDOUT: i32 = 110;
    pub const ENODATA: i32 = 61;
    pub const ENOSPC: i32 = 28;
    pub const EAGAIN: i32 = 11;
    pub const ECONNRESET: i32 = 104;
    pub const EALREADY: i32 = 114;
    pub const EINTR: i32 = 4;
}

/// The crate's error type: a [`Status`] plus a human-readable message and an
/// optional upstream cause, a "stable code + free-form message + cause
/// chain" shape.
pub struct CoreError {
    status: Status,
    message: String,
    cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl CoreError {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(
        mut self,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(Status::Invalid, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Status::NotFound, message)
    }

    pub fn exists(message: impl Into<String>) -> Self {
        Self::new(Status::Exists, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(Status::Timeout, message)
    }

    pub fn would_block(message: impl Into<String>) -> Self {
        Self::new(Status::WouldBlock, message)
    }

    pub fn connection_reset(message: impl Into<String>) -> Self {
        Self::new(Status::ConnectionReset, message)
    }

    pub fn already_set(message: impl Into<String>) -> Self {
        Self::new(Status::AlreadySet, message)
    }

    pub fn no_space(message: impl Into<String>) -> Self {
        Self::new(Status::NoSpace, message)
    }
}

impl fmt::Debug for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreError")
            .field("status", &self.status)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_ref().map(|c| c.as_ref() as &(dyn std::error::Error + 'static))
    }
}

pub type Result<T, E = CoreError> = std::result::Result<T, E>;
