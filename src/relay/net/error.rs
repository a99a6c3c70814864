use std::{fmt, io};

use quinn::{ConnectError, ConnectionError, ReadExactError, WriteError};

use super::ContentHash;
use crate::relay::hex::HexDisplayExt;

/// Errors raised by the relay.
///
/// Request-local failures on a remote node travel back inside a
/// `SubmissionResponse` and surface here as [`Error::Remote`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("submission {} is already pending", .0.short())]
    AlreadyPending(ContentHash),
    #[error("not allowed: {0}")]
    NotAllowed(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid read: {0}")]
    InvalidRead(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("peer reported {kind}: {message}")]
    Remote { kind: ErrorKind, message: String },
    #[error("no peer accepted the submission{}", causes(.0))]
    Unsent(Vec<Error>),
    #[error("submission cancelled")]
    Cancelled,
    #[error("submission deadline exceeded")]
    DeadlineExceeded,
    #[error("relay is closed")]
    Closed,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MalformedMessage(_) => ErrorKind::MalformedMessage,
            Error::AlreadyPending(_) => ErrorKind::AlreadyPending,
            Error::NotAllowed(_) => ErrorKind::NotAllowed,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidRead(_) => ErrorKind::InvalidRead,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::Remote { kind, .. } => *kind,
            Error::Unsent(_) | Error::Transport(_) => ErrorKind::Transport,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            Error::Closed => ErrorKind::Closed,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The detail text without the kind prefix, as carried on the wire.
    pub fn message(&self) -> String {
        match self {
            Error::MalformedMessage(message)
            | Error::NotAllowed(message)
            | Error::NotFound(message)
            | Error::InvalidRead(message)
            | Error::InvalidInput(message)
            | Error::Internal(message)
            | Error::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

fn causes(errors: &[Error]) -> String {
    if errors.is_empty() {
        return String::new();
    }
    let causes = errors.iter().map(ToString::to_string).collect::<Vec<_>>();
    format!(": {}", causes.join("; "))
}

/// Error classes. The discriminant is the code carried on the wire.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Internal = 0,
    InvalidInput = 1,
    InvalidRead = 2,
    NotFound = 3,
    NotAllowed = 4,
    AlreadyPending = 5,
    MalformedMessage = 6,
    Transport = 7,
    Cancelled = 8,
    DeadlineExceeded = 9,
    Closed = 10,
}

impl ErrorKind {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Unknown codes from newer peers collapse into `Internal`.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => ErrorKind::InvalidInput,
            2 => ErrorKind::InvalidRead,
            3 => ErrorKind::NotFound,
            4 => ErrorKind::NotAllowed,
            5 => ErrorKind::AlreadyPending,
            6 => ErrorKind::MalformedMessage,
            7 => ErrorKind::Transport,
            8 => ErrorKind::Cancelled,
            9 => ErrorKind::DeadlineExceeded,
            10 => ErrorKind::Closed,
            _ => ErrorKind::Internal,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Internal => "internal",
            ErrorKind::InvalidInput => "invalid input",
            ErrorKind::InvalidRead => "invalid read",
            ErrorKind::NotFound => "not found",
            ErrorKind::NotAllowed => "not allowed",
            ErrorKind::AlreadyPending => "already pending",
            ErrorKind::MalformedMessage => "malformed message",
            ErrorKind::Transport => "transport",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::DeadlineExceeded => "deadline exceeded",
            ErrorKind::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Failures of the QUIC peer transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(#[from] ConnectError),
    #[error("connection failed: {0}")]
    Connection(#[from] ConnectionError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("write failed: {0}")]
    Write(#[from] WriteError),
    #[error("read failed: {0}")]
    ReadExact(#[from] ReadExactError),
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),
    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::RcgenError),
    #[error("peer presented no certificate")]
    MissingPeerIdentity,
    #[error("expected exactly one {0} in pem input")]
    BadPem(&'static str),
    #[error("frame of {0} bytes exceeds the configured limit")]
    FrameTooLarge(usize),
    #[error("frame of {0} bytes is too short to carry an address")]
    FrameTooShort(usize),
    #[error("axon is no longer writing")]
    WriterStopped,
}
