use std::{fmt, net::SocketAddr};

use log::debug;

use crate::Command;

use super::{
    Codec, Field,
    codec::{CodecError, check_schema},
};

/// Identifier a server assigns to each accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Connection a request arrived on, used to route responses back to the same peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    pub connection: ConnectionId,
    pub peer: Option<SocketAddr>,
}

impl Origin {
    pub fn new(connection: ConnectionId, peer: Option<SocketAddr>) -> Self {
        Self { connection, peer }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer {
            Some(peer) => write!(f, "{} ({peer})", self.connection),
            None => write!(f, "{}", self.connection),
        }
    }
}

/// Undecoded payload exactly as it was read off the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawBody {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    Pending,
    Decoded,
    Failed,
}

/// A command plus its typed fields.
///
/// Outbound requests are built decoded. Inbound requests carry only the raw body
/// until [`Request::decode_body`] succeeds; `fields` is never partially populated.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    command: Command,
    raw_body: Option<RawBody>,
    fields: Vec<Field>,
    state: DecodeState,
    origin: Option<Origin>,
}

impl Request {
    /// Compose an outbound request; `fields` must match the command's schema.
    pub fn new(command: Command, fields: Vec<Field>) -> Result<Self, CodecError> {
        check_schema(command, &fields)?;
        Ok(Self {
            command,
            raw_body: None,
            fields,
            state: DecodeState::Decoded,
            origin: None,
        })
    }

    /// Wrap a payload received from `origin`; nothing is parsed yet.
    pub fn inbound(command: Command, raw_body: RawBody, origin: Option<Origin>) -> Self {
        Self {
            command,
            raw_body: Some(raw_body),
            fields: Vec::new(),
            state: DecodeState::Pending,
            origin,
        }
    }

    pub fn close() -> Self {
        Self::typed(Command::CloseConnection, vec![])
    }

    pub fn ping() -> Self {
        Self::typed(Command::Ping, vec![])
    }

    pub fn pong() -> Self {
        Self::typed(Command::Pong, vec![])
    }

    pub fn get(key: impl Into<String>) -> Self {
        Self::typed(Command::Get, vec![Field::Str(key.into())])
    }

    pub fn set(key: impl Into<String>, value: f64) -> Self {
        Self::typed(Command::Set, vec![Field::Str(key.into()), Field::Double(value)])
    }

    pub fn transmit(key: impl Into<String>, step: i32, value: f64, last: bool) -> Self {
        Self::typed(
            Command::Transmit,
            vec![
                Field::Str(key.into()),
                Field::Int(step),
                Field::Double(value),
                Field::Bool(last),
            ],
        )
    }

    pub fn value(key: impl Into<String>, value: f64) -> Self {
        Self::typed(
            Command::Value,
            vec![Field::Str(key.into()), Field::Double(value)],
        )
    }

    pub fn ack(ok: bool, detail: impl Into<String>) -> Self {
        Self::typed(Command::Ack, vec![Field::Bool(ok), Field::Str(detail.into())])
    }

    /// Address `response` to the peer this request came from.
    pub fn reply(&self, mut response: Request) -> Request {
        response.origin = self.origin;
        response
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    // Constructors above always match the schema.
    fn typed(command: Command, fields: Vec<Field>) -> Self {
        debug_assert!(check_schema(command, &fields).is_ok());
        Self {
            command,
            raw_body: None,
            fields,
            state: DecodeState::Decoded,
            origin: None,
        }
    }

    /// Parse the raw body into fields. Calling it on a decoded request is a no-op.
    ///
    /// On failure the fields stay empty and the raw body is kept, so a second call
    /// reports the same error.
    pub fn decode_body(&mut self, codec: &Codec) -> Result<(), CodecError> {
        if self.state == DecodeState::Decoded {
            return Ok(());
        }

        let Some(body) = self.raw_body.as_ref() else {
            self.state = DecodeState::Failed;
            return Err(CodecError::NotDecoded(self.command));
        };

        match codec.decode_body(self.command, body) {
            Ok(fields) => {
                self.fields = fields;
                self.raw_body = None;
                self.state = DecodeState::Decoded;
                Ok(())
            }
            Err(e) => {
                debug!("failed to decode '{}' body {body:?}: {e}", self.command);
                self.state = DecodeState::Failed;
                Err(e)
            }
        }
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> Option<&Field> {
        self.fields.get(index)
    }

    pub fn str_at(&self, index: usize) -> Option<&str> {
        self.field(index).and_then(Field::as_str)
    }

    pub fn int_at(&self, index: usize) -> Option<i32> {
        self.field(index).and_then(Field::as_int)
    }

    pub fn double_at(&self, index: usize) -> Option<f64> {
        self.field(index).and_then(Field::as_double)
    }

    pub fn bool_at(&self, index: usize) -> Option<bool> {
        self.field(index).and_then(Field::as_bool)
    }

    pub fn raw_body(&self) -> Option<&RawBody> {
        self.raw_body.as_ref()
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    pub fn is_decoded(&self) -> bool {
        self.state == DecodeState::Decoded
    }

    pub fn origin(&self) -> Option<Origin> {
        self.origin
    }
}

/// Text line form, without the trailing newline.
impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command.token())?;
        match (&self.state, &self.raw_body) {
            (DecodeState::Decoded, _) => {
                for field in &self.fields {
                    write!(f, " {field}")?;
                }
                Ok(())
            }
            (_, Some(RawBody::Text(text))) => write!(f, "{text}"),
            (_, Some(RawBody::Binary(bytes))) => write!(f, " <{} bytes>", bytes.len()),
            (_, None) => Ok(()),
        }
    }
}
