//! Status codes returned by the producer and consumer sides of a queue.
//!
//! Every operation of the queue returns an explicit status. Successful calls
//! return `Ok`, and failures one of the variants of [`Error`], which can be
//! converted into the stable numeric value used on the wire with
//! [`Error::status()`], or into the matching `Errno`.
use nix::errno::Errno;
use thiserror::Error;

/// Numeric status of a successful operation.
pub const OK: i32 = 0;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("not enough memory to allocate a buffer")]
    NoMemory,
    #[error("invalid argument or object state")]
    BadValue,
    #[error("operation not allowed in the current state")]
    InvalidOperation,
    #[error("queue is abandoned or not connected")]
    NoInit,
    #[error("operation would block")]
    WouldBlock,
    #[error("operation timed out")]
    TimedOut,
    #[error("producer already owns its maximum number of buffers")]
    Busy,
    #[error("already connected")]
    AlreadyConnected,
    #[error("slot does not contain the expected frame anymore")]
    StaleBufferSlot,
    #[error("no buffer is available for acquisition")]
    NoBufferAvailable,
    #[error("next buffer is due for presentation at {0}ns")]
    PresentLater(i64),
}

impl Error {
    /// Returns the stable numeric value for this status.
    pub fn status(&self) -> i32 {
        match self {
            Error::NoMemory => -(Errno::ENOMEM as i32),
            Error::BadValue => -(Errno::EINVAL as i32),
            Error::InvalidOperation => -(Errno::ENOSYS as i32),
            Error::NoInit => -(Errno::ENODEV as i32),
            Error::WouldBlock => -(Errno::EWOULDBLOCK as i32),
            Error::TimedOut => -(Errno::ETIMEDOUT as i32),
            Error::Busy => -(Errno::EBUSY as i32),
            Error::AlreadyConnected => -(Errno::EEXIST as i32),
            Error::StaleBufferSlot => 1,
            Error::NoBufferAvailable => 2,
            Error::PresentLater(_) => 3,
        }
    }
}

impl From<Error> for Errno {
    fn from(err: Error) -> Self {
        match err {
            Error::NoMemory => Errno::ENOMEM,
            Error::BadValue => Errno::EINVAL,
            Error::InvalidOperation => Errno::ENOSYS,
            Error::NoInit => Errno::ENODEV,
            Error::WouldBlock => Errno::EWOULDBLOCK,
            Error::TimedOut => Errno::ETIMEDOUT,
            Error::Busy => Errno::EBUSY,
            Error::AlreadyConnected => Errno::EEXIST,
            // Not errors per se, but the closest match for errno speakers.
            Error::StaleBufferSlot => Errno::ESTALE,
            Error::NoBufferAvailable | Error::PresentLater(_) => Errno::EAGAIN,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
