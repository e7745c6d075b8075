use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SocketError {
    #[error("operation not supported: {0}")]
    UnsupportedOperation(&'static str),
    #[error("socket fault: {0}")]
    SocketFault(#[from] io::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("none of the {candidates} candidate addresses matches the socket's address family")]
    AddressFamilyMismatch { candidates: usize },
    #[error("operation timed out")]
    TimedOut,
    #[error("failed to resolve {host}: {source}")]
    NameResolution {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("socket has been closed")]
    Disposed,
}

/// Discriminant of a [`SocketError`], for callers that only branch on the kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    UnsupportedOperation,
    SocketFault,
    InvalidArgument,
    AddressFamilyMismatch,
    TimedOut,
    NameResolution,
    Disposed,
}

impl SocketError {
    pub fn kind(&self) -> Kind {
        match self {
            SocketError::UnsupportedOperation(_) => Kind::UnsupportedOperation,
            SocketError::SocketFault(_) => Kind::SocketFault,
            SocketError::InvalidArgument(_) => Kind::InvalidArgument,
            SocketError::AddressFamilyMismatch { .. } => Kind::AddressFamilyMismatch,
            SocketError::TimedOut => Kind::TimedOut,
            SocketError::NameResolution { .. } => Kind::NameResolution,
            SocketError::Disposed => Kind::Disposed,
        }
    }

    /// Platform error code, when the failure was reported by the OS.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            SocketError::SocketFault(e) => e.raw_os_error(),
            SocketError::NameResolution { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    /// Mistakes in how the socket was configured or called. Retrying the same
    /// call will fail the same way.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self.kind(),
            Kind::InvalidArgument | Kind::UnsupportedOperation | Kind::AddressFamilyMismatch
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), Kind::SocketFault | Kind::TimedOut)
    }

    pub(crate) fn fault(kind: io::ErrorKind, message: &'static str) -> SocketError {
        SocketError::SocketFault(io::Error::new(kind, message))
    }

    /// The OS rejection for an address whose family the descriptor cannot use.
    pub(crate) fn family_fault() -> SocketError {
        #[cfg(unix)]
        let error = io::Error::from_raw_os_error(libc::EAFNOSUPPORT);
        #[cfg(not(unix))]
        let error = io::Error::new(
            io::ErrorKind::Unsupported,
            "address family not supported by this socket",
        );
        SocketError::SocketFault(error)
    }
}
