//! Error kinds reported at the control interface and inside the stack.
use failure::Fail;

/// Stack error kinds. The set is part of the control-device contract.
#[derive(Clone, Copy, Debug, Eq, Fail, PartialEq)]
pub enum Error {
    /// Validation failure on a request or malformed message.
    #[fail(display = "invalid argument")]
    InvalidArg,
    /// The referenced object does not exist.
    #[fail(display = "no such object")]
    NotFound,
    /// The object is already in use or already configured.
    #[fail(display = "resource busy")]
    Busy,
    /// An id bitmap or a bounded queue is exhausted.
    #[fail(display = "no space available")]
    NoSpace,
    /// Allocation failure.
    #[fail(display = "out of memory")]
    NoMem,
    /// The IPCP does not implement the requested operation.
    #[fail(display = "operation not implemented")]
    NotImpl,
    /// The operation requires the administrative capability.
    #[fail(display = "permission denied")]
    Permission,
    /// A blocking operation was interrupted.
    #[fail(display = "interrupted")]
    Interrupted,
    /// The referenced device or endpoint is not usable.
    #[fail(display = "bad device reference")]
    BadFd,
    /// The caller's buffer is too small for the pending message.
    #[fail(display = "buffer too small")]
    NoBufs,
}

/// Stack result.
pub type Result<T> = std::result::Result<T, Error>;
