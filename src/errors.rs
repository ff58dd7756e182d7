use nix::errno::Errno;
use std::fmt::{self, Display};
use std::io::Error as IOError;
use std::result;

pub type Result<T> = result::Result<T, Error>;

/// The error kinds named in the tracing core's error handling design:
/// local recovery differs by kind, so unlike a flat errno wrapper this
/// needs to be matched on directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A debug-interface syscall failed; carries no further detail beyond
    /// the `Errno` already stored alongside it.
    OsError,
    /// A tracee memory read or write failed at a given address.
    MemoryError,
    /// A breakpoint operation referenced an address with no installed
    /// breakpoint.
    NoSuchBreakpoint,
    /// The PLT resolution step could not read or write the PLT slot.
    PltFail,
    /// Allocating or initializing a handler failed (e.g. `send_sigstop`
    /// failed partway through a stopping episode).
    HandlerInstallFail,
    /// An unrecoverable condition was hit; the caller should proceed
    /// straight to teardown.
    DetachRequired,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::OsError => "os-error",
            ErrorKind::MemoryError => "memory-error",
            ErrorKind::NoSuchBreakpoint => "no-such-breakpoint",
            ErrorKind::PltFail => "plt-fail",
            ErrorKind::HandlerInstallFail => "handler-install-fail",
            ErrorKind::DetachRequired => "detach-required",
        };
        write!(f, "{}", s)
    }
}

pub struct Error {
    kind: ErrorKind,
    errno: Option<Errno>,
    msg: Option<Box<dyn Display + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error {
            kind,
            errno: None,
            msg: None,
        }
    }

    pub fn os_error(errno: Errno) -> Self {
        Error {
            kind: ErrorKind::OsError,
            errno: Some(errno),
            msg: None,
        }
    }

    pub fn with_msg<M>(mut self, msg: M) -> Self
    where
        M: Display + Send + Sync + 'static,
    {
        self.msg = Some(Box::new(msg));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn errno(&self) -> Option<Errno> {
        self.errno
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(errno) = self.errno {
            write!(f, " ({})", errno)?;
        }
        if let Some(msg) = &self.msg {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error({})", self)
    }
}

impl std::error::Error for Error {}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Error {
        Error::os_error(errno)
    }
}

impl From<IOError> for Error {
    fn from(error: IOError) -> Error {
        let errno = error
            .raw_os_error()
            .map(Errno::from_raw)
            .unwrap_or(Errno::UnknownErrno);
        Error::os_error(errno).with_msg(error)
    }
}
