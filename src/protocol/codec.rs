//! Wire codec.
//!
//! Converts typed [`Field`]s and whole [`Request`]s to and from bytes. Two frame
//! encodings are supported, selected by [`Framing`]:
//!
//! - `Line`: one request per line of text, `<COMMAND> <field> ... <field>\n`. Field
//!   count and types come from the command's static schema.
//! - `Binary`: `[u32 payload length][u8 command id][fields]`, every field written in
//!   the fixed width binary sub-mode.
//!
//! The binary sub-mode is a big-endian, fixed-int [`bincode`] configuration: an int
//! is always 4 bytes, a double 8 bytes, a boolean 1 byte (`0x1`/`0x0`) and a string
//! an 8 byte length prefix followed by its UTF-8 bytes.
//!
//! A [`Codec`] holds no state between calls. It is `Copy`, so every connection and
//! thread simply carries its own.
use std::{fmt, str};

use bincode::config::{BigEndian, Configuration, Fixint};
use thiserror::Error;

use crate::{
    Command, CommandError,
    config::{DEFAULT_MAX_FRAME_LEN, Framing},
};

use super::{
    Field, FieldKind,
    request::{Origin, RawBody, Request},
};

const LENGTH_PREFIX_SIZE: usize = size_of::<u32>();
const COMMAND_ID_SIZE: usize = size_of::<u8>();
const STRING_PREFIX_SIZE: usize = size_of::<u64>();

/// Malformed payload conditions. Each one concerns a single request only.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("'{command}' expects {expected} fields, found {found}")]
    FieldCount {
        command: Command,
        expected: usize,
        found: usize,
    },

    #[error("field {index} of '{command}' should be {kind}, got '{token}'")]
    InvalidToken {
        command: Command,
        index: usize,
        kind: FieldKind,
        token: String,
    },

    #[error("field {index} of '{command}' should be {expected}, got {found}")]
    KindMismatch {
        command: Command,
        index: usize,
        expected: FieldKind,
        found: FieldKind,
    },

    #[error("{kind} field needs {expected} bytes, got {found}")]
    Width {
        kind: FieldKind,
        expected: usize,
        found: usize,
    },

    #[error("{count} unexpected trailing bytes after '{command}' fields")]
    TrailingBytes { command: Command, count: usize },

    #[error("invalid boolean byte {0:#04x}")]
    InvalidBool(u8),

    #[error("string {value:?} cannot be framed: {reason}")]
    InvalidString { value: String, reason: &'static str },

    #[error("frame is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] str::Utf8Error),

    #[error("empty frame")]
    Empty,

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("'{0}' request has not been decoded")]
    NotDecoded(Command),

    #[error("failed to encode field: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode field: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

#[derive(Clone, Copy)]
pub struct Codec {
    framing: Framing,
    max_frame_len: usize,
    config: Configuration<BigEndian, Fixint>,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(Framing::default())
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec")
            .field("framing", &self.framing)
            .field("max_frame_len", &self.max_frame_len)
            .finish()
    }
}

impl Codec {
    pub fn new(framing: Framing) -> Self {
        let config = bincode::config::standard()
            .with_big_endian()
            .with_fixed_int_encoding();
        Self {
            framing,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            config,
        }
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Encode a single field in the fixed width binary sub-mode.
    pub fn encode_field(&self, field: &Field) -> Result<Vec<u8>, CodecError> {
        let bytes = match field {
            Field::Int(v) => bincode::encode_to_vec(*v, self.config)?,
            Field::Double(v) => bincode::encode_to_vec(*v, self.config)?,
            Field::Bool(v) => bincode::encode_to_vec(*v, self.config)?,
            Field::Str(v) => bincode::encode_to_vec(v.as_str(), self.config)?,
        };
        Ok(bytes)
    }

    /// Decode a single binary field. `bytes` must hold exactly one encoded value.
    pub fn decode_field(&self, bytes: &[u8], kind: FieldKind) -> Result<Field, CodecError> {
        let (field, used) = self.read_field(bytes, kind)?;
        if used != bytes.len() {
            return Err(CodecError::Width {
                kind,
                expected: used,
                found: bytes.len(),
            });
        }
        Ok(field)
    }

    /// Encode a decoded request as one complete frame.
    pub fn encode(&self, request: &Request) -> Result<Vec<u8>, CodecError> {
        if !request.is_decoded() {
            return Err(CodecError::NotDecoded(request.command()));
        }
        check_schema(request.command(), request.fields())?;

        let frame = match self.framing {
            Framing::Line => self.encode_line(request.command(), request.fields())?,
            Framing::Binary => self.encode_binary(request.command(), request.fields())?,
        };

        if frame.len() > self.max_frame_len {
            return Err(CodecError::FrameTooLarge {
                len: frame.len(),
                max: self.max_frame_len,
            });
        }
        Ok(frame)
    }

    /// Length of the first complete frame at the start of `buf`, if one is buffered.
    ///
    /// Fails once the buffered bytes can no longer form a frame within the size limit;
    /// the stream cannot be resynchronised after that.
    pub fn split_frame(&self, buf: &[u8]) -> Result<Option<usize>, CodecError> {
        let len = match self.framing {
            Framing::Line => match buf.iter().position(|b| *b == b'\n') {
                Some(pos) => pos + 1,
                None if buf.len() > self.max_frame_len => {
                    return Err(CodecError::FrameTooLarge {
                        len: buf.len(),
                        max: self.max_frame_len,
                    });
                }
                None => return Ok(None),
            },
            Framing::Binary => {
                if buf.len() < LENGTH_PREFIX_SIZE {
                    return Ok(None);
                }
                let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
                prefix.copy_from_slice(&buf[..LENGTH_PREFIX_SIZE]);
                let payload = u32::from_be_bytes(prefix) as usize;
                LENGTH_PREFIX_SIZE.saturating_add(payload)
            }
        };

        if len > self.max_frame_len {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        Ok((buf.len() >= len).then_some(len))
    }

    /// Resolve the command of one frame and wrap the rest as an undecoded request.
    ///
    /// Returns `Ok(None)` for a blank line, which carries no request.
    pub fn decode_frame(
        &self,
        frame: &[u8],
        origin: Option<Origin>,
    ) -> Result<Option<Request>, CodecError> {
        match self.framing {
            Framing::Line => {
                let line = str::from_utf8(frame)?;
                let Some((command, body)) = split_line(line)? else {
                    return Ok(None);
                };
                Ok(Some(Request::inbound(
                    command,
                    RawBody::Text(body.to_string()),
                    origin,
                )))
            }
            Framing::Binary => {
                let payload = frame.get(LENGTH_PREFIX_SIZE..).unwrap_or_default();
                let Some((&id, body)) = payload.split_first() else {
                    return Err(CodecError::Empty);
                };
                let command = Command::from_id(id)?;
                Ok(Some(Request::inbound(
                    command,
                    RawBody::Binary(body.to_vec()),
                    origin,
                )))
            }
        }
    }

    /// Parse a raw body according to `command`'s schema.
    pub fn decode_body(&self, command: Command, body: &RawBody) -> Result<Vec<Field>, CodecError> {
        match body {
            RawBody::Text(text) => decode_text(command, text),
            RawBody::Binary(bytes) => self.decode_binary(command, bytes),
        }
    }

    /// Build a fully decoded request from one line of text, whatever the framing.
    pub fn parse_text(&self, line: &str) -> Result<Request, CodecError> {
        let Some((command, body)) = split_line(line)? else {
            return Err(CodecError::Empty);
        };
        let fields = decode_text(command, body)?;
        Request::new(command, fields)
    }

    fn encode_line(&self, command: Command, fields: &[Field]) -> Result<Vec<u8>, CodecError> {
        let mut line = String::from(command.token());
        for (index, field) in fields.iter().enumerate() {
            if let Field::Str(value) = field {
                check_text(value, index + 1 == fields.len())?;
            }
            line.push(' ');
            line.push_str(&field.to_string());
        }
        line.push('\n');
        Ok(line.into_bytes())
    }

    fn encode_binary(&self, command: Command, fields: &[Field]) -> Result<Vec<u8>, CodecError> {
        let mut payload = vec![command.id()];
        for field in fields {
            payload.extend(self.encode_field(field)?);
        }

        let len = u32::try_from(payload.len()).map_err(|_| CodecError::FrameTooLarge {
            len: payload.len(),
            max: self.max_frame_len,
        })?;

        let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend(payload);
        Ok(frame)
    }

    fn decode_binary(&self, command: Command, bytes: &[u8]) -> Result<Vec<Field>, CodecError> {
        let mut fields = Vec::with_capacity(command.schema().len());
        let mut offset = 0;

        for kind in command.schema() {
            let (field, used) = self.read_field(&bytes[offset..], *kind)?;
            fields.push(field);
            offset += used;
        }

        if offset != bytes.len() {
            return Err(CodecError::TrailingBytes {
                command,
                count: bytes.len() - offset,
            });
        }
        Ok(fields)
    }

    /// Decode one field from the front of `bytes`, returning it and the bytes consumed.
    fn read_field(&self, bytes: &[u8], kind: FieldKind) -> Result<(Field, usize), CodecError> {
        let expected = match kind.width() {
            Some(width) => width,
            None => {
                if bytes.len() < STRING_PREFIX_SIZE {
                    return Err(CodecError::Width {
                        kind,
                        expected: STRING_PREFIX_SIZE,
                        found: bytes.len(),
                    });
                }
                let mut prefix = [0u8; STRING_PREFIX_SIZE];
                prefix.copy_from_slice(&bytes[..STRING_PREFIX_SIZE]);
                let declared = usize::try_from(u64::from_be_bytes(prefix)).unwrap_or(usize::MAX);
                STRING_PREFIX_SIZE.saturating_add(declared)
            }
        };

        if bytes.len() < expected {
            return Err(CodecError::Width {
                kind,
                expected,
                found: bytes.len(),
            });
        }

        let chunk = &bytes[..expected];
        let field = match kind {
            FieldKind::Int => Field::Int(self.decode_value(chunk)?),
            FieldKind::Double => Field::Double(self.decode_value(chunk)?),
            FieldKind::Bool => match chunk[0] {
                0x0 => Field::Bool(false),
                0x1 => Field::Bool(true),
                other => return Err(CodecError::InvalidBool(other)),
            },
            FieldKind::Str => Field::Str(self.decode_value(chunk)?),
        };
        Ok((field, expected))
    }

    fn decode_value<T: bincode::Decode<()>>(&self, chunk: &[u8]) -> Result<T, CodecError> {
        let (value, _) = bincode::decode_from_slice(chunk, self.config)?;
        Ok(value)
    }
}

/// Check that `fields` match `command`'s schema exactly.
pub(crate) fn check_schema(command: Command, fields: &[Field]) -> Result<(), CodecError> {
    let schema = command.schema();
    if schema.len() != fields.len() {
        return Err(CodecError::FieldCount {
            command,
            expected: schema.len(),
            found: fields.len(),
        });
    }

    for (index, (expected, field)) in schema.iter().zip(fields).enumerate() {
        if *expected != field.kind() {
            return Err(CodecError::KindMismatch {
                command,
                index,
                expected: *expected,
                found: field.kind(),
            });
        }
    }
    Ok(())
}

/// Split a text line into its command and the unparsed remainder.
fn split_line(line: &str) -> Result<Option<(Command, &str)>, CodecError> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let line = line.strip_suffix('\r').unwrap_or(line);
    let line = line.trim_start();
    if line.trim_end().is_empty() {
        return Ok(None);
    }

    let (token, body) = line.split_at(line.find(char::is_whitespace).unwrap_or(line.len()));
    Ok(Some((token.parse()?, body)))
}

fn decode_text(command: Command, body: &str) -> Result<Vec<Field>, CodecError> {
    let schema = command.schema();
    let mut fields = Vec::with_capacity(schema.len());
    let mut rest = body;

    for (index, kind) in schema.iter().enumerate() {
        rest = rest.trim_start();

        // The last string of a schema runs to the end of the line.
        let rest_of_line = index + 1 == schema.len() && *kind == FieldKind::Str;
        let token = if rest_of_line {
            std::mem::take(&mut rest)
        } else {
            let (token, tail) = rest.split_at(rest.find(char::is_whitespace).unwrap_or(rest.len()));
            rest = tail;
            token
        };

        if token.is_empty() && !rest_of_line {
            return Err(CodecError::FieldCount {
                command,
                expected: schema.len(),
                found: index,
            });
        }
        fields.push(parse_token(command, index, *kind, token)?);
    }

    let extra = rest.split_whitespace().count();
    if extra > 0 {
        return Err(CodecError::FieldCount {
            command,
            expected: schema.len(),
            found: schema.len() + extra,
        });
    }
    Ok(fields)
}

fn parse_token(
    command: Command,
    index: usize,
    kind: FieldKind,
    token: &str,
) -> Result<Field, CodecError> {
    let field = match kind {
        FieldKind::Int => token.parse().ok().map(Field::Int),
        FieldKind::Double => token.parse().ok().map(Field::Double),
        FieldKind::Bool => match token {
            "1" => Some(Field::Bool(true)),
            "0" => Some(Field::Bool(false)),
            _ => None,
        },
        FieldKind::Str => Some(Field::Str(token.to_string())),
    };

    field.ok_or_else(|| CodecError::InvalidToken {
        command,
        index,
        kind,
        token: token.to_string(),
    })
}

fn check_text(value: &str, last: bool) -> Result<(), CodecError> {
    let reason = if value.contains(['\n', '\r']) {
        Some("contains a line break")
    } else if last && value.starts_with(char::is_whitespace) {
        Some("leading whitespace in the last field")
    } else if !last && value.is_empty() {
        Some("empty string before the last field")
    } else if !last && value.contains(char::is_whitespace) {
        Some("whitespace before the last field")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(CodecError::InvalidString {
            value: value.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(codec: &Codec, text: &str) -> Request {
        let mut request = codec
            .decode_frame(text.as_bytes(), None)
            .unwrap()
            .expect("frame carries a request");
        request.decode_body(codec).unwrap();
        request
    }

    #[test]
    fn binary_fields_have_fixed_widths() {
        let codec = Codec::default();

        assert_eq!(codec.encode_field(&Field::Int(1)).unwrap(), vec![0, 0, 0, 1]);
        assert_eq!(codec.encode_field(&Field::Double(0.5)).unwrap().len(), 8);
        assert_eq!(codec.encode_field(&Field::Bool(true)).unwrap(), vec![0x1]);
        assert_eq!(codec.encode_field(&Field::Bool(false)).unwrap(), vec![0x0]);

        let text = codec.encode_field(&Field::from("ab")).unwrap();
        assert_eq!(text, vec![0, 0, 0, 0, 0, 0, 0, 2, b'a', b'b']);
    }

    #[test]
    fn binary_fields_round_trip() {
        let codec = Codec::default();
        let values = vec![
            Field::Int(i32::MIN),
            Field::Int(-1),
            Field::Int(i32::MAX),
            Field::Double(-0.25),
            Field::Double(f64::MAX),
            Field::Bool(true),
            Field::Bool(false),
            Field::from(""),
            Field::from("learning rate"),
        ];

        for value in values {
            let bytes = codec.encode_field(&value).unwrap();
            assert_eq!(codec.decode_field(&bytes, value.kind()).unwrap(), value);
        }
    }

    #[test]
    fn binary_field_width_mismatch() {
        let codec = Codec::default();

        let err = codec.decode_field(&[0, 0, 1], FieldKind::Int).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Width {
                kind: FieldKind::Int,
                expected: 4,
                found: 3
            }
        ));

        let err = codec.decode_field(&[0; 9], FieldKind::Double).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Width {
                expected: 8,
                found: 9,
                ..
            }
        ));

        let err = codec.decode_field(&[0, 0, 0, 0, 0, 0, 0, 5, b'a'], FieldKind::Str);
        assert!(matches!(err, Err(CodecError::Width { .. })));
    }

    #[test]
    fn binary_bool_rejects_other_bytes() {
        let codec = Codec::default();
        let err = codec.decode_field(&[0x2], FieldKind::Bool).unwrap_err();
        assert!(matches!(err, CodecError::InvalidBool(0x2)));
    }

    #[test]
    fn text_tokens_round_trip() {
        let codec = Codec::default();
        let requests = vec![
            Request::set("speed", 0.5),
            Request::set("momentum", -1e-9),
            Request::transmit("loss", 42, 0.125, true),
            Request::ack(false, "unknown parameter 'x'"),
            Request::ack(true, ""),
            Request::ping(),
        ];

        for request in requests {
            let frame = codec.encode(&request).unwrap();
            assert_eq!(line(&codec, str::from_utf8(&frame).unwrap()), request);
        }
    }

    #[test]
    fn set_request_framing() {
        let codec = Codec::default();
        let request = Request::new(Command::Set, vec!["speed".into(), 0.5.into()]).unwrap();

        let frame = codec.encode(&request).unwrap();
        assert_eq!(frame, b"SET speed 0.5\n");

        let decoded = line(&codec, "SET speed 0.5\n");
        assert_eq!(decoded.command(), Command::Set);
        assert_eq!(decoded.fields(), &[Field::from("speed"), Field::from(0.5)]);
    }

    #[test]
    fn crlf_and_blank_lines() {
        let codec = Codec::default();

        let request = line(&codec, "get  speed\r\n");
        assert_eq!(request.str_at(0), Some("speed"));

        assert!(codec.decode_frame(b"   \r\n", None).unwrap().is_none());
    }

    #[test]
    fn unknown_command_is_malformed() {
        let codec = Codec::default();
        let err = codec
            .decode_frame(b"not-a-valid-command\n", None)
            .unwrap_err();
        assert!(matches!(err, CodecError::Command(_)));
    }

    #[test]
    fn wrong_field_count() {
        let codec = Codec::default();

        for text in ["SET speed\n", "SET speed 0.5 extra\n", "GET\n"] {
            let mut request = codec.decode_frame(text.as_bytes(), None).unwrap().unwrap();
            let err = request.decode_body(&codec).unwrap_err();
            assert!(matches!(err, CodecError::FieldCount { .. }), "{text}: {err}");
        }
    }

    #[test]
    fn invalid_text_tokens() {
        let codec = Codec::default();

        let mut request = codec
            .decode_frame(b"SET speed fast\n", None)
            .unwrap()
            .unwrap();
        let err = request.decode_body(&codec).unwrap_err();
        assert!(matches!(
            err,
            CodecError::InvalidToken {
                index: 1,
                kind: FieldKind::Double,
                ..
            }
        ));

        let mut request = codec
            .decode_frame(b"TRANSMIT loss 1 0.5 yes\n", None)
            .unwrap()
            .unwrap();
        assert!(request.decode_body(&codec).is_err());
    }

    #[test]
    fn unframeable_strings_are_rejected() {
        let codec = Codec::default();

        let requests = vec![
            Request::set("two words", 1.0),
            Request::transmit("", 1, 1.0, true),
            Request::ack(true, "line\nbreak"),
            Request::ack(true, " padded"),
        ];

        for request in requests {
            let err = codec.encode(&request).unwrap_err();
            assert!(matches!(err, CodecError::InvalidString { .. }), "{err}");
        }
    }

    #[test]
    fn line_split_and_limit() {
        let codec = Codec::default().with_max_frame_len(8);

        assert_eq!(codec.split_frame(b"PING\nGET").unwrap(), Some(5));
        assert_eq!(codec.split_frame(b"PIN").unwrap(), None);
        assert!(matches!(
            codec.split_frame(b"GET abcdefgh"),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn binary_frames() {
        let codec = Codec::new(Framing::Binary);
        let request = Request::transmit("loss", 3, 0.75, false);

        let frame = codec.encode(&request).unwrap();
        assert_eq!(&frame[..4], &((frame.len() - 4) as u32).to_be_bytes());
        assert_eq!(frame[4], Command::Transmit.id());

        assert_eq!(codec.split_frame(&frame[..frame.len() - 1]).unwrap(), None);
        assert_eq!(codec.split_frame(&frame).unwrap(), Some(frame.len()));

        let mut decoded = codec.decode_frame(&frame, None).unwrap().unwrap();
        decoded.decode_body(&codec).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn binary_frame_errors() {
        let codec = Codec::new(Framing::Binary);

        let err = codec.decode_frame(&[0, 0, 0, 1, 0xee], None).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Command(CommandError::UnrecognizedId(0xee))
        ));

        let err = codec.decode_frame(&[0, 0, 0, 0], None).unwrap_err();
        assert!(matches!(err, CodecError::Empty));

        let mut request = codec
            .decode_frame(&[0, 0, 0, 3, Command::Ping.id(), 0xa, 0xb], None)
            .unwrap()
            .unwrap();
        let err = request.decode_body(&codec).unwrap_err();
        assert!(matches!(err, CodecError::TrailingBytes { count: 2, .. }));

        let oversized = (DEFAULT_MAX_FRAME_LEN as u32).to_be_bytes();
        assert!(matches!(
            codec.split_frame(&oversized),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn parse_text_ignores_framing() {
        let codec = Codec::new(Framing::Binary);
        let request = codec.parse_text("ack 1 all good").unwrap();

        assert!(request.is_decoded());
        assert_eq!(request, Request::ack(true, "all good"));
        assert!(matches!(codec.parse_text(""), Err(CodecError::Empty)));
    }
}
