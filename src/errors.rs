use std::{error, fmt, io};

/// An enum of all error kinds.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The key does not exist, neither locally nor on the server.
    NotFound,
    /// The caller passed arguments the library cannot act on.
    InvalidArgs,
    /// No connection permit became available before the acquire deadline.
    PoolExhausted,
    /// The decoder failed to parse a frame or a notification record.
    Parse,
    /// An error reply returned by the server.
    Server,
    /// A reply did not have the type the operation expected.
    UnexpectedReturnType,
    /// The connection is no longer usable.
    ConnectionClosed,
    /// An in-flight request outlived its response deadline.
    Timeout,
    /// An error raised on the client before anything was sent.
    Client,
    /// Underlying transport failure.
    Io,
}

impl ErrorKind {
    fn description(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::InvalidArgs => "invalid arguments",
            ErrorKind::PoolExhausted => "pool exhausted",
            ErrorKind::Parse => "parse error",
            ErrorKind::Server => "server error",
            ErrorKind::UnexpectedReturnType => "unexpected return type",
            ErrorKind::ConnectionClosed => "connection closed",
            ErrorKind::Timeout => "request timed out",
            ErrorKind::Client => "client error",
            ErrorKind::Io => "I/O error",
        }
    }
}

/// Represents an error raised by the cache library or relayed from the
/// server.
///
/// For the most part callers match on [`Error::kind`] rather than the
/// struct itself.
pub struct Error {
    repr: ErrorRepr,
}

enum ErrorRepr {
    General(ErrorKind, &'static str),
    WithDetail(ErrorKind, &'static str, String),
    /// A `-ERR`-style reply line; the leading word is the server error code.
    Server(String),
    Io(io::Error),
}

/// Library-wide result alias.
pub type RimcuResult<T> = Result<T, Error>;

impl Error {
    /// The kind of the error.
    pub fn kind(&self) -> ErrorKind {
        match &self.repr {
            ErrorRepr::General(kind, _) => *kind,
            ErrorRepr::WithDetail(kind, _, _) => *kind,
            ErrorRepr::Server(_) => ErrorKind::Server,
            ErrorRepr::Io(_) => ErrorKind::Io,
        }
    }

    /// True when the key was absent.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Builds an error from a server error-reply line.
    pub(crate) fn from_server_reply(line: String) -> Error {
        Error {
            repr: ErrorRepr::Server(line),
        }
    }

    /// The code word of a server error reply (`NOSCRIPT`, `MOVED`, ...).
    pub(crate) fn server_code(&self) -> Option<&str> {
        match &self.repr {
            ErrorRepr::Server(line) => line.split(' ').next(),
            _ => None,
        }
    }

    /// True when the request cannot have left a usable connection behind:
    /// the reply slot is abandoned or the stream is broken.
    pub(crate) fn is_transport_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Io | ErrorKind::Parse | ErrorKind::ConnectionClosed | ErrorKind::Timeout
        )
    }
}

pub(crate) fn not_found_error() -> Error {
    Error::from((ErrorKind::NotFound, "no such key"))
}

pub(crate) fn closed_connection_error() -> Error {
    Error::from((ErrorKind::ConnectionClosed, "connection is gone"))
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error {
            repr: ErrorRepr::Io(err),
        }
    }
}

impl From<(ErrorKind, &'static str)> for Error {
    fn from((kind, desc): (ErrorKind, &'static str)) -> Error {
        Error {
            repr: ErrorRepr::General(kind, desc),
        }
    }
}

impl From<(ErrorKind, &'static str, String)> for Error {
    fn from((kind, desc, detail): (ErrorKind, &'static str, String)) -> Error {
        Error {
            repr: ErrorRepr::WithDetail(kind, desc, detail),
        }
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Error) -> bool {
        self.kind() == other.kind()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::General(kind, desc) => write!(f, "{}: {desc}", kind.description()),
            ErrorRepr::WithDetail(kind, desc, detail) => {
                write!(f, "{}: {desc} ({detail})", kind.description())
            }
            ErrorRepr::Server(line) => write!(f, "server error: {line}"),
            ErrorRepr::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Io(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_code_is_first_word() {
        let err = Error::from_server_reply("NOSCRIPT No matching script".into());
        assert_eq!(err.server_code(), Some("NOSCRIPT"));
        assert_eq!(err.kind(), ErrorKind::Server);
    }

    #[test]
    fn transport_errors_poison() {
        assert!(Error::from((ErrorKind::Timeout, "t")).is_transport_error());
        assert!(closed_connection_error().is_transport_error());
        assert!(!not_found_error().is_transport_error());
        assert!(!Error::from_server_reply("ERR oops".into()).is_transport_error());
    }
}
