//
use std::fmt;
use std::io;

use crate::api::{ApiProblem, ProblemType};

/// acme-core result.
pub type Result<T> = ::std::result::Result<T, Error>;

/// acme-core errors.
///
/// Callers are expected to branch on the variant. A resource that settles as
/// `invalid` is not an error, it is a normal status on the returned snapshot.
#[derive(Debug)]
pub enum Error {
    /// Connection or TLS failure. The request may be retried by the caller.
    Transport(String),
    /// The server answered with something that isn't the expected shape.
    Protocol(String),
    /// The server reported a problem document.
    Problem(ApiProblem),
    /// Input rejected before anything was sent over the wire.
    Validation(String),
    /// A polling loop ran out of attempts or time.
    Timeout(String),
    /// A polling loop was cancelled through its [`CancelToken`].
    ///
    /// [`CancelToken`]: order/struct.CancelToken.html
    Cancelled,
    /// The key can't produce the requested signature.
    Signing(String),
}

impl Error {
    /// The problem document, if this is an [`Error::Problem`].
    pub fn problem(&self) -> Option<&ApiProblem> {
        match self {
            Error::Problem(p) => Some(p),
            _ => None,
        }
    }

    /// Tell if this is a problem document of the given type.
    pub fn is_problem(&self, kind: ProblemType) -> bool {
        self.problem().map(|p| p.problem_type() == kind) == Some(true)
    }
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Transport(s) => write!(f, "transport: {}", s),
            Error::Protocol(s) => write!(f, "protocol: {}", s),
            Error::Problem(p) => write!(f, "{}", p),
            Error::Validation(s) => write!(f, "validation: {}", s),
            Error::Timeout(s) => write!(f, "timeout: {}", s),
            Error::Cancelled => write!(f, "cancelled"),
            Error::Signing(s) => write!(f, "signing: {}", s),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Error::Signing(e.to_string())
    }
}

impl From<ApiProblem> for Error {
    fn from(p: ApiProblem) -> Self {
        Error::Problem(p)
    }
}
