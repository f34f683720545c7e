//! CLI utilities for tether.
//!
//! The utilities present in this module can be used to build an interactive client
//! that reads protocol requests as text lines.
use std::io::{self, BufRead, Write};

use thiserror::Error;

use crate::protocol::{Codec, CodecError, Request};

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("{0}")]
    Parse(#[from] CodecError),
    #[error("terminal error: {0}")]
    Io(#[from] io::Error),
}

/// Possible inputs from a user.
#[derive(Clone, Debug, PartialEq)]
pub enum Input {
    /// `.exit` or end of input.
    Exit,
    /// Nothing but whitespace.
    Blank,
    /// A request to send, e.g. `SET speed 0.5`.
    Send(Request),
}

/// Prompt the user for a request line.
pub fn prompt<R, W>(mut reader: R, mut writer: W, codec: &Codec) -> Result<Input, PromptError>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ")?;
    writer.flush()?;

    if reader.read_line(&mut s)? == 0 {
        return Ok(Input::Exit);
    }

    match s.trim() {
        ".exit" => Ok(Input::Exit),
        "" => Ok(Input::Blank),
        line => Ok(Input::Send(codec.parse_text(line)?)),
    }
}
