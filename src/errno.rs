//! POSIX-shaped error surface.
//!
//! Every fallible public operation in this crate returns a negated errno,
//! mirroring the C convention the blobstore's external API is modeled on
//! (§6, §7 of the design spec). Internally, each module defines its own
//! `quick_error!` enum describing *why* something failed; `Errno`
//! flattens any of those into the handful of codes callers are allowed to
//! match on.

use std::fmt;

/// A negated POSIX errno, or `Errno::OK` on success.
///
/// This is deliberately a thin wrapper and not a Rust-style error enum:
/// the point of the type is to be the boundary representation, not the
/// thing code branches on internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl Errno {
    pub const OK: Errno = Errno(0);
    pub const EPERM: Errno = Errno(-1);
    pub const ENOENT: Errno = Errno(-2);
    pub const EIO: Errno = Errno(-5);
    pub const ENOMEM: Errno = Errno(-12);
    pub const EEXIST: Errno = Errno(-17);
    pub const ENODEV: Errno = Errno(-19);
    pub const EINVAL: Errno = Errno(-22);
    pub const ENAMETOOLONG: Errno = Errno(-36);
    pub const EBADF: Errno = Errno(-9);
    pub const EBUSY: Errno = Errno(-16);
    pub const EILSEQ: Errno = Errno(-84);

    /// Is this the success value?
    pub fn is_ok(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            Errno::OK => "success",
            Errno::EPERM => "EPERM",
            Errno::ENOENT => "ENOENT",
            Errno::EIO => "EIO",
            Errno::ENOMEM => "ENOMEM",
            Errno::EEXIST => "EEXIST",
            Errno::ENODEV => "ENODEV",
            Errno::EINVAL => "EINVAL",
            Errno::ENAMETOOLONG => "ENAMETOOLONG",
            Errno::EBADF => "EBADF",
            Errno::EBUSY => "EBUSY",
            Errno::EILSEQ => "EILSEQ",
            _ => return write!(f, "errno {}", self.0),
        };
        write!(f, "{}", name)
    }
}

/// A semantic error category (§7), before it is flattened to an `Errno`.
///
/// Keeping this as a distinct type (rather than matching on `Errno`
/// everywhere) lets every module's `quick_error!` enum carry a
/// `description()`/`display()` that explains *what* happened, while this
/// enum only has to explain *which kind* it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadArgument,
    NotFound,
    AlreadyExists,
    ResourceExhausted,
    Busy,
    Permission,
    InvalidState,
    BadFd,
    DeviceFailure,
}

impl From<ErrorKind> for Errno {
    fn from(kind: ErrorKind) -> Errno {
        match kind {
            ErrorKind::BadArgument => Errno::EINVAL,
            ErrorKind::NotFound => Errno::ENOENT,
            ErrorKind::AlreadyExists => Errno::EEXIST,
            ErrorKind::ResourceExhausted => Errno::ENOMEM,
            ErrorKind::Busy => Errno::EBUSY,
            ErrorKind::Permission => Errno::EPERM,
            ErrorKind::InvalidState => Errno::EILSEQ,
            ErrorKind::BadFd => Errno::EBADF,
            ErrorKind::DeviceFailure => Errno::EIO,
        }
    }
}
