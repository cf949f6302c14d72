// src/core/protocol/frame.rs

//! The wire framing codec: a self-describing, line-oriented encoding for
//! requests and responses exchanged over the admission socket.
//!
//! A frame is: an ASCII protocol-version line, a verb line (a command name
//! for requests, a three-digit status code for responses), a field count
//! line, that many `(name, value)` pairs, and a literal `EOM` terminator
//! line. Values are recursively tagged so the decoder never needs to
//! instantiate anything beyond integers, booleans, strings, lists, and sets.

use super::value::Value;
use crate::core::errors::QManagerError;
use bytes::{Buf, BufMut, BytesMut};
use std::collections::BTreeMap;
use tokio_util::codec::{Decoder, Encoder};

pub const PROTOCOL_VERSION: u32 = 1;

const EOM: &[u8] = b"EOM\n";
const MAX_LINE_LENGTH: usize = 4096;
const MAX_STRING_SIZE: usize = 1024 * 1024;
const MAX_FRAME_ELEMENTS: usize = 10_000;

/// The first line of the frame body: a command name for a request, or a
/// three-digit status code for a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verb {
    Command(String),
    Status(u16),
}

/// A complete, decoded wire frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub verb: Verb,
    pub fields: BTreeMap<String, Value>,
}

impl Frame {
    pub fn request(command: impl Into<String>, fields: BTreeMap<String, Value>) -> Self {
        Self {
            verb: Verb::Command(command.into()),
            fields,
        }
    }

    pub fn response(status: u16, fields: BTreeMap<String, Value>) -> Self {
        Self {
            verb: Verb::Status(status),
            fields,
        }
    }

    pub fn ok() -> Self {
        Self::response(201, BTreeMap::new())
    }

    pub fn error(err: &QManagerError) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("reason".to_string(), Value::Str(err.to_string()));
        match err {
            QManagerError::AlreadyExists(name)
            | QManagerError::NoSuchObject(name)
            | QManagerError::MachineBusy(name)
            | QManagerError::AclInUse(name) => {
                fields.insert("name".to_string(), Value::Str(name.clone()));
            }
            QManagerError::NoSuchJob(id)
            | QManagerError::JobNotRunning(id)
            | QManagerError::JobAlreadyRunning(id) => {
                fields.insert("id".to_string(), Value::Int(*id as i64));
            }
            _ => {}
        }
        Self::response(err.status_code(), fields)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Tokio-util codec implementing the framing described above.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = QManagerError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_slice(format!("{PROTOCOL_VERSION}\n").as_bytes());
        match &frame.verb {
            Verb::Command(name) => dst.put_slice(format!("{name}\n").as_bytes()),
            Verb::Status(code) => dst.put_slice(format!("{code:03}\n").as_bytes()),
        }
        dst.put_slice(format!("%{}\n", frame.fields.len()).as_bytes());
        for (name, value) in &frame.fields {
            encode_value(&Value::Str(name.clone()), dst);
            encode_value(value, dst);
        }
        dst.put_slice(EOM);
        Ok(())
    }
}

fn encode_value(value: &Value, dst: &mut BytesMut) {
    match value {
        Value::Int(i) => dst.put_slice(format!(":{i}\n").as_bytes()),
        Value::Bool(b) => dst.put_slice(if *b { b"#t\n".as_slice() } else { b"#f\n".as_slice() }),
        Value::Str(s) => {
            dst.put_slice(format!("${}\n", s.len()).as_bytes());
            dst.put_slice(s.as_bytes());
            dst.put_u8(b'\n');
        }
        Value::List(items) => {
            dst.put_slice(format!("*{}\n", items.len()).as_bytes());
            for item in items {
                encode_value(item, dst);
            }
        }
        Value::Set(items) => {
            dst.put_slice(format!("~{}\n", items.len()).as_bytes());
            for item in items {
                encode_value(&Value::Str(item.clone()), dst);
            }
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = QManagerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        let mut cursor = Cursor {
            buf: &src[..],
            pos: 0,
        };

        let Some(version_line) = cursor.read_line()? else {
            return Ok(None);
        };
        if version_line.parse::<u32>() != Ok(PROTOCOL_VERSION) {
            return Err(QManagerError::Protocol(format!(
                "unsupported protocol version '{version_line}'"
            )));
        }

        let Some(verb_line) = cursor.read_line()? else {
            return Ok(None);
        };
        let verb = match (verb_line.len(), verb_line.parse::<u16>()) {
            (3, Ok(code)) => Verb::Status(code),
            _ => Verb::Command(verb_line),
        };

        let Some(count_line) = cursor.read_line()? else {
            return Ok(None);
        };
        let count_str = count_line
            .strip_prefix('%')
            .ok_or_else(|| QManagerError::Protocol("expected field-count line".into()))?;
        let count: usize = count_str
            .parse()
            .map_err(|_| QManagerError::Protocol("bad field count".into()))?;
        if count > MAX_FRAME_ELEMENTS {
            return Err(QManagerError::Protocol("too many fields".into()));
        }

        let mut fields = BTreeMap::new();
        for _ in 0..count {
            let Some(name_value) = cursor.read_value()? else {
                return Ok(None);
            };
            let Value::Str(name) = name_value else {
                return Err(QManagerError::Protocol("field name must be a string".into()));
            };
            let Some(value) = cursor.read_value()? else {
                return Ok(None);
            };
            fields.insert(name, value);
        }

        let Some(terminator) = cursor.read_line()? else {
            return Ok(None);
        };
        if terminator != "EOM" {
            return Err(QManagerError::Protocol("missing EOM terminator".into()));
        }

        let consumed = cursor.pos;
        src.advance(consumed);
        Ok(Some(Frame { verb, fields }))
    }
}

/// A read-only, non-advancing scan over the receive buffer. Every read
/// returns `Ok(None)` rather than erroring when the buffer simply doesn't
/// have enough bytes yet; `decode` only commits (`src.advance`) once an
/// entire frame has parsed successfully.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn read_line(&mut self) -> Result<Option<String>, QManagerError> {
        let rest = &self.buf[self.pos..];
        let Some(nl) = rest.iter().position(|&b| b == b'\n') else {
            if rest.len() > MAX_LINE_LENGTH {
                return Err(QManagerError::Protocol("line too long".into()));
            }
            return Ok(None);
        };
        if nl > MAX_LINE_LENGTH {
            return Err(QManagerError::Protocol("line too long".into()));
        }
        let line = std::str::from_utf8(&rest[..nl])
            .map_err(|_| QManagerError::Protocol("invalid utf-8 in frame".into()))?
            .to_string();
        self.pos += nl + 1;
        Ok(Some(line))
    }

    fn read_exact(&mut self, len: usize) -> Option<&'a [u8]> {
        let rest = &self.buf[self.pos..];
        if rest.len() < len {
            return None;
        }
        let data = &rest[..len];
        self.pos += len;
        Some(data)
    }

    fn read_value(&mut self) -> Result<Option<Value>, QManagerError> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }
        let tag = self.buf[self.pos];
        match tag {
            b':' => {
                self.pos += 1;
                let Some(line) = self.read_line()? else {
                    return Ok(None);
                };
                let i: i64 = line
                    .parse()
                    .map_err(|_| QManagerError::Protocol("bad integer".into()))?;
                Ok(Some(Value::Int(i)))
            }
            b'#' => {
                if self.buf.len() < self.pos + 3 {
                    return Ok(None);
                }
                let c = self.buf[self.pos + 1];
                if self.buf[self.pos + 2] != b'\n' {
                    return Err(QManagerError::Protocol("malformed boolean".into()));
                }
                self.pos += 3;
                match c {
                    b't' => Ok(Some(Value::Bool(true))),
                    b'f' => Ok(Some(Value::Bool(false))),
                    _ => Err(QManagerError::Protocol("malformed boolean".into())),
                }
            }
            b'$' => {
                self.pos += 1;
                let Some(len_line) = self.read_line()? else {
                    return Ok(None);
                };
                let len: usize = len_line
                    .parse()
                    .map_err(|_| QManagerError::Protocol("bad string length".into()))?;
                if len > MAX_STRING_SIZE {
                    return Err(QManagerError::Protocol("string too long".into()));
                }
                let Some(data) = self.read_exact(len) else {
                    return Ok(None);
                };
                let s = std::str::from_utf8(data)
                    .map_err(|_| QManagerError::Protocol("invalid utf-8 string".into()))?
                    .to_string();
                let Some(nl) = self.read_exact(1) else {
                    return Ok(None);
                };
                if nl != b"\n" {
                    return Err(QManagerError::Protocol("string not newline-terminated".into()));
                }
                Ok(Some(Value::Str(s)))
            }
            b'*' => {
                self.pos += 1;
                let Some(count_line) = self.read_line()? else {
                    return Ok(None);
                };
                let count: usize = count_line
                    .parse()
                    .map_err(|_| QManagerError::Protocol("bad list count".into()))?;
                if count > MAX_FRAME_ELEMENTS {
                    return Err(QManagerError::Protocol("list too large".into()));
                }
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    let Some(item) = self.read_value()? else {
                        return Ok(None);
                    };
                    items.push(item);
                }
                Ok(Some(Value::List(items)))
            }
            b'~' => {
                self.pos += 1;
                let Some(count_line) = self.read_line()? else {
                    return Ok(None);
                };
                let count: usize = count_line
                    .parse()
                    .map_err(|_| QManagerError::Protocol("bad set count".into()))?;
                if count > MAX_FRAME_ELEMENTS {
                    return Err(QManagerError::Protocol("set too large".into()));
                }
                let mut items = std::collections::BTreeSet::new();
                for _ in 0..count {
                    let Some(item) = self.read_value()? else {
                        return Ok(None);
                    };
                    match item {
                        Value::Str(s) => {
                            items.insert(s);
                        }
                        _ => {
                            return Err(QManagerError::Protocol(
                                "set elements must be strings".into(),
                            ));
                        }
                    }
                }
                Ok(Some(Value::Set(items)))
            }
            other => Err(QManagerError::Protocol(format!(
                "unknown value tag '{}'",
                other as char
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().expect("complete frame")
    }

    #[test]
    fn roundtrips_a_request_with_mixed_fields() {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), Value::Str("j1".to_string()));
        fields.insert("priority".to_string(), Value::Int(10));
        fields.insert(
            "mdl".to_string(),
            Value::List(vec![Value::Str("arch = amd64".to_string())]),
        );
        let frame = Frame::request("acquire", fields.clone());
        let decoded = roundtrip(frame);
        assert_eq!(decoded.verb, Verb::Command("acquire".to_string()));
        assert_eq!(decoded.fields, fields);
    }

    #[test]
    fn roundtrips_a_status_response() {
        let mut fields = BTreeMap::new();
        fields.insert("machine".to_string(), Value::Str("m1".to_string()));
        fields.insert("id".to_string(), Value::Int(1));
        let frame = Frame::response(202, fields.clone());
        let decoded = roundtrip(frame);
        assert_eq!(decoded.verb, Verb::Status(202));
        assert_eq!(decoded.fields, fields);
    }

    #[test]
    fn decode_returns_none_on_partial_frame() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::request("jobs", BTreeMap::new()), &mut buf)
            .unwrap();
        let mut partial = BytesMut::from(&buf[..buf.len() - 2]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn rejects_bad_version() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&b"9\njobs\n%0\nEOM\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn rejects_unterminated_frame() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&b"1\njobs\n%0\nNOTEOM\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
