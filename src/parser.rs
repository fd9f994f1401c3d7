use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::{Error, ErrorKind, RimcuResult};
use crate::types::{PushKind, Value};

const MAX_RECURSE_DEPTH: usize = 32;

/// Framed codec for RESP2/RESP3 frames.
///
/// Decoding is incremental: a partial frame yields `Ok(None)` and leaves
/// the buffer untouched until more bytes arrive. Error replies (`-ERR ...`)
/// are surfaced as `Err` items without terminating the stream; only
/// protocol violations are fatal.
#[derive(Default)]
pub(crate) struct ValueCodec;

impl Encoder<Vec<u8>> for ValueCodec {
    type Error = Error;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

impl Decoder for ValueCodec {
    type Item = RimcuResult<Value>;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut pos = 0usize;
        match parse_at(src, &mut pos, 0)? {
            Some(item) => {
                src.advance(pos);
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

fn protocol_error(detail: String) -> Error {
    Error::from((ErrorKind::Parse, "protocol violation", detail))
}

/// Reads up to the next CRLF, advancing `pos` past it.
fn read_line<'a>(buf: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let start = *pos;
    let end = buf.get(start..)?.windows(2).position(|w| w == b"\r\n")? + start;
    *pos = end + 2;
    Some(&buf[start..end])
}

fn parse_int(line: &[u8]) -> Result<i64, Error> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| protocol_error(format!("expected integer, got {line:?}")))
}

/// Attempts to parse one complete value starting at `pos`.
///
/// Returns `Ok(None)` when the buffer holds only a prefix of the value.
fn parse_at(
    buf: &[u8],
    pos: &mut usize,
    depth: usize,
) -> Result<Option<RimcuResult<Value>>, Error> {
    if depth > MAX_RECURSE_DEPTH {
        return Err(protocol_error("nesting too deep".into()));
    }
    let Some(&marker) = buf.get(*pos) else {
        return Ok(None);
    };
    *pos += 1;

    match marker {
        b'+' => {
            let Some(line) = read_line(buf, pos) else {
                return Ok(None);
            };
            let value = if line == b"OK" {
                Value::Okay
            } else {
                Value::SimpleString(String::from_utf8_lossy(line).into_owned())
            };
            Ok(Some(Ok(value)))
        }
        b'-' => {
            let Some(line) = read_line(buf, pos) else {
                return Ok(None);
            };
            Ok(Some(Err(Error::from_server_reply(
                String::from_utf8_lossy(line).into_owned(),
            ))))
        }
        b':' => {
            let Some(line) = read_line(buf, pos) else {
                return Ok(None);
            };
            Ok(Some(Ok(Value::Int(parse_int(line)?))))
        }
        b'$' | b'=' => {
            let Some(line) = read_line(buf, pos) else {
                return Ok(None);
            };
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some(Ok(Value::Nil)));
            }
            let len = len as usize;
            if buf.len() < *pos + len + 2 {
                return Ok(None);
            }
            let data = &buf[*pos..*pos + len];
            if &buf[*pos + len..*pos + len + 2] != b"\r\n" {
                return Err(protocol_error("bulk string not CRLF-terminated".into()));
            }
            *pos += len + 2;
            // Verbatim strings carry a 4-byte format prefix ("txt:").
            let data = if marker == b'=' && len >= 4 {
                &data[4..]
            } else {
                data
            };
            Ok(Some(Ok(Value::BulkString(data.to_vec()))))
        }
        b'*' | b'>' | b'~' => {
            let Some(line) = read_line(buf, pos) else {
                return Ok(None);
            };
            let count = parse_int(line)?;
            if count < 0 {
                return Ok(Some(Ok(Value::Nil)));
            }
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                match parse_at(buf, pos, depth + 1)? {
                    Some(Ok(value)) => items.push(value),
                    Some(Err(err)) => return Ok(Some(Err(err))),
                    None => return Ok(None),
                }
            }
            if marker != b'>' {
                return Ok(Some(Ok(Value::Array(items))));
            }
            if items.is_empty() {
                return Err(protocol_error("empty push frame".into()));
            }
            let kind = match items.remove(0) {
                Value::BulkString(name) => PushKind::from_name(&name),
                Value::SimpleString(name) => PushKind::from_name(name.as_bytes()),
                other => {
                    return Err(protocol_error(format!("push frame kind was {other:?}")));
                }
            };
            Ok(Some(Ok(Value::Push { kind, data: items })))
        }
        b'%' => {
            let Some(line) = read_line(buf, pos) else {
                return Ok(None);
            };
            let count = parse_int(line)?;
            if count < 0 {
                return Ok(Some(Ok(Value::Nil)));
            }
            let mut pairs = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let field = match parse_at(buf, pos, depth + 1)? {
                    Some(Ok(value)) => value,
                    Some(Err(err)) => return Ok(Some(Err(err))),
                    None => return Ok(None),
                };
                let value = match parse_at(buf, pos, depth + 1)? {
                    Some(Ok(value)) => value,
                    Some(Err(err)) => return Ok(Some(Err(err))),
                    None => return Ok(None),
                };
                pairs.push((field, value));
            }
            Ok(Some(Ok(Value::Map(pairs))))
        }
        b'#' => {
            let Some(line) = read_line(buf, pos) else {
                return Ok(None);
            };
            match line {
                b"t" => Ok(Some(Ok(Value::Boolean(true)))),
                b"f" => Ok(Some(Ok(Value::Boolean(false)))),
                other => Err(protocol_error(format!("bad boolean {other:?}"))),
            }
        }
        b',' => {
            let Some(line) = read_line(buf, pos) else {
                return Ok(None);
            };
            let parsed = std::str::from_utf8(line)
                .ok()
                .and_then(|s| s.parse::<f64>().ok())
                .ok_or_else(|| protocol_error(format!("bad double {line:?}")))?;
            Ok(Some(Ok(Value::Double(parsed))))
        }
        b'_' => {
            let Some(_) = read_line(buf, pos) else {
                return Ok(None);
            };
            Ok(Some(Ok(Value::Nil)))
        }
        b'(' => {
            // Big numbers are carried as their decimal text.
            let Some(line) = read_line(buf, pos) else {
                return Ok(None);
            };
            Ok(Some(Ok(Value::BulkString(line.to_vec()))))
        }
        b'!' => {
            // RESP3 blob error; same framing as a bulk string.
            let Some(line) = read_line(buf, pos) else {
                return Ok(None);
            };
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some(Ok(Value::Nil)));
            }
            let len = len as usize;
            if buf.len() < *pos + len + 2 {
                return Ok(None);
            }
            let data = &buf[*pos..*pos + len];
            *pos += len + 2;
            Ok(Some(Err(Error::from_server_reply(
                String::from_utf8_lossy(data).into_owned(),
            ))))
        }
        other => Err(protocol_error(format!(
            "unknown frame marker {:?}",
            other as char
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> (Vec<RimcuResult<Value>>, usize) {
        let mut codec = ValueCodec;
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(item) = codec.decode(&mut buf).unwrap() {
            out.push(item);
        }
        (out, buf.len())
    }

    fn decode_one(input: &[u8]) -> Value {
        let (mut items, rest) = decode_all(input);
        assert_eq!(rest, 0, "input not fully consumed");
        assert_eq!(items.len(), 1);
        items.pop().unwrap().unwrap()
    }

    #[test]
    fn decodes_scalars() {
        assert_eq!(decode_one(b"+OK\r\n"), Value::Okay);
        assert_eq!(
            decode_one(b"+PONG\r\n"),
            Value::SimpleString("PONG".into())
        );
        assert_eq!(decode_one(b":1234\r\n"), Value::Int(1234));
        assert_eq!(
            decode_one(b"$5\r\nhello\r\n"),
            Value::BulkString(b"hello".to_vec())
        );
        assert_eq!(decode_one(b"$-1\r\n"), Value::Nil);
        assert_eq!(decode_one(b"#t\r\n"), Value::Boolean(true));
        assert_eq!(decode_one(b",3.5\r\n"), Value::Double(3.5));
        assert_eq!(decode_one(b"_\r\n"), Value::Nil);
    }

    #[test]
    fn decodes_aggregates() {
        assert_eq!(
            decode_one(b"*2\r\n$1\r\na\r\n:2\r\n"),
            Value::Array(vec![Value::BulkString(b"a".to_vec()), Value::Int(2)])
        );
        assert_eq!(
            decode_one(b"%1\r\n$2\r\nid\r\n:7\r\n"),
            Value::Map(vec![(Value::BulkString(b"id".to_vec()), Value::Int(7))])
        );
    }

    #[test]
    fn decodes_push_frame() {
        let frame = b">2\r\n$10\r\ninvalidate\r\n*1\r\n$3\r\nfoo\r\n";
        assert_eq!(
            decode_one(frame),
            Value::Push {
                kind: PushKind::Invalidate,
                data: vec![Value::Array(vec![Value::BulkString(b"foo".to_vec())])],
            }
        );
    }

    #[test]
    fn error_reply_is_an_item_not_a_stream_failure() {
        let (items, rest) = decode_all(b"-ERR wrong number of arguments\r\n+OK\r\n");
        assert_eq!(rest, 0);
        assert_eq!(items.len(), 2);
        let err = items[0].as_ref().unwrap_err();
        assert_eq!(err.server_code(), Some("ERR"));
        assert_eq!(*items[1].as_ref().unwrap(), Value::Okay);
    }

    #[test]
    fn partial_input_yields_none_until_complete() {
        let mut codec = ValueCodec;
        let mut buf = BytesMut::new();
        let full = b"*2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n";
        for &byte in &full[..full.len() - 1] {
            buf.extend_from_slice(&[byte]);
            assert!(codec.decode(&mut buf).unwrap().is_none());
        }
        buf.extend_from_slice(&full[full.len() - 1..]);
        let value = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(
            value,
            Value::Array(vec![
                Value::BulkString(b"foo".to_vec()),
                Value::BulkString(b"bar".to_vec()),
            ])
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn unknown_marker_is_fatal() {
        let mut codec = ValueCodec;
        let mut buf = BytesMut::from(&b"?3\r\nerr\r\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
