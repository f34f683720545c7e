//! Protocol command set.
//!
//! This module defines the [`Command`] enumeration, the closed set of message kinds
//! a peer may send, together with the static field schema attached to each command.
//! Both sides of a connection know the schemas at compile time, so a frame never
//! carries per-field type tags.
//!
//! # Overview
//! The commands fall into two groups:
//!
//! - Control: `CLOSE_CONNECTION`, `PING`, `PONG`. Answered by the connection itself.
//! - Data: `GET`, `SET`, `TRANSMIT` from clients, `VALUE` and `ACK` from servers.
//!   Routed to the registered [`Processor`](crate::protocol::Processor).
//!
//! # Example
//! ```rust
//! use tether::{Command, FieldKind};
//!
//! let cmd: Command = "set".parse().unwrap();
//! assert_eq!(cmd, Command::Set);
//! assert_eq!(cmd.schema(), &[FieldKind::Str, FieldKind::Double]);
//! ```
use std::{fmt, str::FromStr};

use thiserror::Error;

use crate::protocol::FieldKind;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("unrecognized command '{0}'")]
    UnrecognizedToken(String),

    #[error("unrecognized command id {0:#04x}")]
    UnrecognizedId(u8),
}

/// Message kinds understood by both peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Ask the peer to tear the connection down.
    CloseConnection,
    /// Liveness check; always answered with [`Command::Pong`].
    Ping,
    Pong,
    /// Read a named parameter.
    Get,
    /// Write a named parameter.
    Set,
    /// Stream one sample of a named series.
    Transmit,
    /// Parameter value sent in answer to [`Command::Get`].
    Value,
    /// Generic acknowledgement carrying a success flag and a detail text.
    Ack,
}

impl Command {
    pub const ALL: [Command; 8] = [
        Command::CloseConnection,
        Command::Ping,
        Command::Pong,
        Command::Get,
        Command::Set,
        Command::Transmit,
        Command::Value,
        Command::Ack,
    ];

    /// Upper-case token used by the line framing.
    pub fn token(&self) -> &'static str {
        match self {
            Command::CloseConnection => "CLOSE_CONNECTION",
            Command::Ping => "PING",
            Command::Pong => "PONG",
            Command::Get => "GET",
            Command::Set => "SET",
            Command::Transmit => "TRANSMIT",
            Command::Value => "VALUE",
            Command::Ack => "ACK",
        }
    }

    /// Stable one byte identifier used by the binary framing.
    pub fn id(&self) -> u8 {
        match self {
            Command::CloseConnection => 0x0,
            Command::Ping => 0x1,
            Command::Pong => 0x2,
            Command::Get => 0x3,
            Command::Set => 0x4,
            Command::Transmit => 0x5,
            Command::Value => 0x6,
            Command::Ack => 0x7,
        }
    }

    pub fn from_id(id: u8) -> Result<Self, CommandError> {
        Self::ALL
            .into_iter()
            .find(|c| c.id() == id)
            .ok_or(CommandError::UnrecognizedId(id))
    }

    /// Field types, in wire order, carried by this command.
    pub fn schema(&self) -> &'static [FieldKind] {
        use FieldKind::*;

        match self {
            Command::CloseConnection | Command::Ping | Command::Pong => &[],
            Command::Get => &[Str],
            Command::Set | Command::Value => &[Str, Double],
            Command::Transmit => &[Str, Int, Double, Bool],
            Command::Ack => &[Bool, Str],
        }
    }

    /// Control commands are answered by the connection and never reach a processor.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Command::CloseConnection | Command::Ping | Command::Pong
        )
    }
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|c| c.token().eq_ignore_ascii_case(s))
            .ok_or_else(|| CommandError::UnrecognizedToken(s.to_string()))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_from_string() {
        let inputs = vec![
            ("CLOSE_CONNECTION", Command::CloseConnection),
            ("ping", Command::Ping),
            ("Get", Command::Get),
            (" SET ", Command::Set),
            ("TRANSMIT", Command::Transmit),
        ];

        for (token, expected) in inputs {
            let command: Command = token.parse().unwrap();
            assert_eq!(command, expected);
        }
    }

    #[test]
    fn unknown_token_is_rejected() {
        let err = "not-a-valid-command".parse::<Command>().unwrap_err();
        assert_eq!(
            err,
            CommandError::UnrecognizedToken("not-a-valid-command".to_string())
        );
    }

    #[test]
    fn ids_are_unique_and_reversible() {
        for command in Command::ALL {
            assert_eq!(Command::from_id(command.id()).unwrap(), command);
        }
        assert_eq!(
            Command::from_id(0xff).unwrap_err(),
            CommandError::UnrecognizedId(0xff)
        );
    }

    #[test]
    fn control_commands_carry_no_fields() {
        for command in Command::ALL.into_iter().filter(Command::is_control) {
            assert!(command.schema().is_empty(), "{command} has fields");
        }
    }
}
