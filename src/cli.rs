//! CLI utilities for MaazDB.
//!
//! The utilities present in this module back the `maazdb_cli` REPL.
use std::io::{self, BufRead, Write};

use thiserror::Error;

/// Possible inputs from a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Input {
    /// Exit command `.exit`, or end of input
    Exit,
    /// Blank line
    Empty,
    /// Command text to send to the server
    Statement(String),
}

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("failed to read input: {0}")]
    Io(#[from] io::Error),
    #[error("unrecognized command '{0}'")]
    Unrecognized(String),
}

/// Prompt user for a command.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Input, PromptError>
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
        "" => Ok(Input::Empty),
        ".exit" => Ok(Input::Exit),
        s if !s.starts_with('.') => Ok(Input::Statement(s.to_string())),
        s => Err(PromptError::Unrecognized(s.to_string())),
    }
}
