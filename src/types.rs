use crate::errors::{not_found_error, Error, ErrorKind, RimcuResult};

/// A single decoded server frame.
///
/// Covers the RESP2 reply types plus the RESP3 additions the library
/// actually receives (maps from `HELLO`, push frames from tracking).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A nil reply (`$-1`, `*-1` or the RESP3 null).
    Nil,
    /// An integer reply.
    Int(i64),
    /// Binary-safe string data.
    BulkString(Vec<u8>),
    /// A nested reply.
    Array(Vec<Value>),
    /// A status line.
    SimpleString(String),
    /// The status line `+OK`.
    Okay,
    /// A RESP3 boolean.
    Boolean(bool),
    /// A RESP3 double.
    Double(f64),
    /// A RESP3 map, order preserved.
    Map(Vec<(Value, Value)>),
    /// A RESP3 out-of-band push frame.
    Push {
        /// The frame kind, decoded from the first element.
        kind: PushKind,
        /// The remaining elements.
        data: Vec<Value>,
    },
}

/// Kind of a RESP3 push frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushKind {
    /// Track invalidation for keys the connection has read.
    Invalidate,
    /// A pub/sub message.
    Message,
    /// A pattern pub/sub message.
    PMessage,
    /// Subscription confirmation.
    Subscribe,
    /// Unsubscription confirmation.
    Unsubscribe,
    /// Any other push kind; carried for logging.
    Other(String),
}

impl PushKind {
    pub(crate) fn from_name(name: &[u8]) -> PushKind {
        match name {
            b"invalidate" => PushKind::Invalidate,
            b"message" => PushKind::Message,
            b"pmessage" => PushKind::PMessage,
            b"subscribe" => PushKind::Subscribe,
            b"unsubscribe" => PushKind::Unsubscribe,
            other => PushKind::Other(String::from_utf8_lossy(other).into_owned()),
        }
    }
}

fn unexpected(what: &'static str, value: &Value) -> Error {
    Error::from((
        ErrorKind::UnexpectedReturnType,
        what,
        format!("got {value:?}"),
    ))
}

impl Value {
    /// Converts a reply into owned bytes. `Nil` maps to `NotFound`.
    pub(crate) fn into_bytes(self) -> RimcuResult<Vec<u8>> {
        match self {
            Value::BulkString(data) => Ok(data),
            Value::SimpleString(s) => Ok(s.into_bytes()),
            Value::Okay => Ok(b"OK".to_vec()),
            Value::Nil => Err(not_found_error()),
            other => Err(unexpected("expected string data", &other)),
        }
    }

    /// Converts a reply into a `String`.
    pub(crate) fn into_string(self) -> RimcuResult<String> {
        let bytes = self.into_bytes()?;
        String::from_utf8(bytes)
            .map_err(|_| Error::from((ErrorKind::UnexpectedReturnType, "reply is not utf-8")))
    }

    /// Converts a reply into an integer.
    pub(crate) fn into_i64(self) -> RimcuResult<i64> {
        match self {
            Value::Int(n) => Ok(n),
            Value::BulkString(data) => std::str::from_utf8(&data)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .ok_or_else(|| {
                    Error::from((ErrorKind::UnexpectedReturnType, "expected integer data"))
                }),
            other => Err(unexpected("expected integer", &other)),
        }
    }

    /// Converts a reply into its elements.
    pub(crate) fn into_array(self) -> RimcuResult<Vec<Value>> {
        match self {
            Value::Array(items) => Ok(items),
            Value::Nil => Ok(Vec::new()),
            other => Err(unexpected("expected array", &other)),
        }
    }

    /// Converts an array-of-strings reply.
    pub(crate) fn into_string_vec(self) -> RimcuResult<Vec<String>> {
        self.into_array()?
            .into_iter()
            .map(Value::into_string)
            .collect()
    }

    /// Expects a status reply (`+OK` or any status line).
    pub(crate) fn into_status(self) -> RimcuResult<()> {
        match self {
            Value::Okay | Value::SimpleString(_) | Value::BulkString(_) | Value::Int(_) => Ok(()),
            other => Err(unexpected("expected status reply", &other)),
        }
    }

    /// Looks up a key in a `HELLO`-style map reply.
    pub(crate) fn map_lookup(&self, wanted: &str) -> Option<&Value> {
        match self {
            Value::Map(pairs) => pairs.iter().find_map(|(k, v)| match k {
                Value::BulkString(name) if name == wanted.as_bytes() => Some(v),
                Value::SimpleString(name) if name == wanted => Some(v),
                _ => None,
            }),
            _ => None,
        }
    }
}
