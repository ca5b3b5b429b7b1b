use std::{any::Any, fmt, io, rc::Rc};

use crate::pyref::PyRef;

/// Result type alias for bridge operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error type for bridge operations, separating failures by origin.
///
/// Keeping transport/protocol/remote/host failures distinct lets callers
/// handle recovery policy accurately without string matching: transport and
/// protocol errors are terminal for the session, raised and host errors are
/// ordinary control flow, and foreign-handle misuse never touches the wire.
#[derive(Debug)]
pub enum Error {
    /// Pipe I/O or subprocess-exit failure. Latched: once one occurs,
    /// every subsequent operation reports a transport error.
    Transport(TransportError),
    /// A received frame violated the wire protocol. Treated exactly like a
    /// transport failure.
    Protocol(String),
    /// The interpreter raised an exception while servicing a command.
    Raised(PyException),
    /// A host-originated payload re-raised after a round trip through the
    /// interpreter, or surfaced directly from a bound host function.
    Host(HostError),
    /// A proxy from one session was passed to a different session.
    ForeignHandle,
}

impl Error {
    /// Wraps an arbitrary host payload for identity-preserving tunneling.
    ///
    /// A bound host function that fails with `Error::host(value)` and is
    /// caught again on the host side observes the very same payload, not a
    /// copy; see [`HostError::same`].
    #[must_use]
    pub fn host<T: Any>(payload: T) -> Self {
        Self::Host(HostError::new(payload))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(error) => write!(f, "{error}"),
            Self::Protocol(detail) => write!(f, "protocol error: {detail}"),
            Self::Raised(exception) => write!(f, "{exception}"),
            Self::Host(error) => write!(f, "{error}"),
            Self::ForeignHandle => write!(f, "proxy does not belong to this session"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(error) => Some(error),
            _ => None,
        }
    }
}

impl From<TransportError> for Error {
    fn from(error: TransportError) -> Self {
        Self::Transport(error)
    }
}

impl From<PyException> for Error {
    fn from(exception: PyException) -> Self {
        Self::Raised(exception)
    }
}

/// Fatal pipe or subprocess failure.
#[derive(Debug)]
pub enum TransportError {
    /// The interpreter could not be spawned.
    Spawn(io::Error),
    /// Reading or writing a pipe failed, including unexpected EOF when the
    /// subprocess dies mid-conversation.
    Io(io::Error),
    /// The subprocess did not announce itself with the startup byte.
    Handshake,
    /// The subprocess exited with a nonzero status (or was killed; `None`).
    Exit(Option<i32>),
    /// A previous transport failure was latched; the operation was not
    /// attempted.
    Poisoned,
    /// The session was already terminated when the operation was issued, or
    /// every owning handle has been dropped.
    Terminated,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn(error) => write!(f, "cannot start interpreter subprocess: {error}"),
            Self::Io(error) => write!(f, "interpreter pipe failure: {error}"),
            Self::Handshake => write!(f, "interpreter subprocess failed the startup handshake"),
            Self::Exit(Some(code)) => write!(f, "interpreter subprocess exited with status {code}"),
            Self::Exit(None) => write!(f, "interpreter subprocess was killed by a signal"),
            Self::Poisoned => write!(f, "session unusable after an earlier transport failure"),
            Self::Terminated => write!(f, "session already terminated"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn(error) | Self::Io(error) => Some(error),
            _ => None,
        }
    }
}

/// An interpreter exception surfaced to the host.
///
/// Owns the exception proxy plus a description captured eagerly when the
/// exception crossed the boundary, so the description stays valid after the
/// session terminates. The proxy itself degrades to inert once the session
/// is gone; remote-interacting methods on it then fail with a transport
/// error.
#[derive(Debug)]
pub struct PyException {
    exception: PyRef,
    summary: String,
}

impl PyException {
    pub(crate) fn new(exception: PyRef, summary: String) -> Self {
        Self { exception, summary }
    }

    /// Wraps an exception object so a bound host function can raise it
    /// into the interpreter, capturing its description eagerly.
    ///
    /// # Errors
    /// Transport errors from the description round trip.
    pub fn capture(object: PyRef) -> Result<Self> {
        let session = object.session()?;
        let summary = session.describe(&object)?;
        Ok(Self::new(object, summary))
    }

    /// The remote exception object.
    #[must_use]
    pub fn object(&self) -> &PyRef {
        &self.exception
    }

    /// Consumes the error, yielding the exception proxy. Used to send a
    /// caught interpreter exception back into the interpreter.
    #[must_use]
    pub fn into_object(self) -> PyRef {
        self.exception
    }

    /// The `repr` of the exception, captured when it was raised.
    #[must_use]
    pub fn summary(&self) -> &str {
        &self.summary
    }
}

impl fmt::Display for PyException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "python exception: {}", self.summary)
    }
}

impl std::error::Error for PyException {}

/// Identity-preserving host error payload.
///
/// Cloning shares the payload; two values compare [`same`](Self::same) iff
/// they originate from one `new` call. This is what makes the exception
/// round trip identity-preserving: the payload registered when a bound host
/// function fails is the payload observed when the interpreter re-raises it
/// into host code.
#[derive(Clone)]
pub struct HostError(Rc<dyn Any>);

impl HostError {
    /// Captures a payload.
    #[must_use]
    pub fn new<T: Any>(payload: T) -> Self {
        Self(Rc::new(payload))
    }

    /// Downcasts the payload.
    #[must_use]
    pub fn get<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    /// True iff both values share one payload.
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HostError").field(&Rc::as_ptr(&self.0)).finish()
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host error payload crossed the interpreter boundary")
    }
}

impl std::error::Error for HostError {}
