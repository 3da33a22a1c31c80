//! Template engine errors and control-flow sentinels.
//!
//! Execution distinguishes four outcomes: normal completion, a clean early
//! exit ([`ExecError::Return`]), a hand-off of response production to a
//! canned action ([`ExecError::Handler`]), and genuine failure. The
//! executors translate these into transaction finalization and HTTP
//! responses; the engine itself only carries them.

use std::path::PathBuf;
use std::time::SystemTime;
use thiserror::Error;

/// Errors raised while parsing a template source into trees.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{name}:{line}: unclosed action")]
    UnclosedAction { name: String, line: usize },

    #[error("{name}:{line}: unclosed string literal")]
    UnclosedString { name: String, line: usize },

    #[error("{name}:{line}: unclosed comment")]
    UnclosedComment { name: String, line: usize },

    #[error("{name}:{line}: bad number literal '{lit}'")]
    BadNumber {
        name: String,
        line: usize,
        lit: String,
    },

    #[error("{name}:{line}: unexpected character '{ch}'")]
    UnexpectedChar { name: String, line: usize, ch: char },

    #[error("{name}:{line}: unexpected '{tok}' {ctx}")]
    Unexpected {
        name: String,
        line: usize,
        tok: String,
        ctx: String,
    },

    #[error("{name}:{line}: unexpected end of input, missing {{{{end}}}}")]
    UnexpectedEof { name: String, line: usize },

    #[error("{name}:{line}: function '{func}' not defined")]
    UnknownFunction {
        name: String,
        line: usize,
        func: String,
    },
}

/// A canned response action carried by the handler sentinel.
///
/// Raised by dot methods like `ServeFile`; the executor commits the pending
/// transaction and then produces the response from the action instead of
/// from the template's buffered output.
#[derive(Debug)]
pub enum HandlerAction {
    /// Serve a file from the context filesystem.
    ServeFile(PathBuf),
    /// Serve literal bytes with a name used for content-type detection.
    ServeContent {
        name: String,
        modtime: Option<SystemTime>,
        body: Vec<u8>,
    },
    /// Redirect to another location.
    Redirect { status: u16, location: String },
}

impl std::fmt::Display for HandlerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerAction::ServeFile(p) => write!(f, "serve file {}", p.display()),
            HandlerAction::ServeContent { name, .. } => write!(f, "serve content {name}"),
            HandlerAction::Redirect { status, location } => {
                write!(f, "redirect {status} {location}")
            }
        }
    }
}

/// Errors raised while executing a template.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Clean early exit; the executor treats this as success.
    #[error("returned")]
    Return,

    /// The template elected custom response handling.
    #[error("handler: {0}")]
    Handler(HandlerAction),

    /// Genuine execution failure.
    #[error("{0}")]
    Failure(String),

    /// Output writer failure (client gone on the streaming path).
    #[error("write: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    /// Build a failure with source position attached.
    pub fn fail(tmpl: &str, line: usize, msg: impl std::fmt::Display) -> Self {
        ExecError::Failure(format!("template {tmpl}:{line}: {msg}"))
    }
}

/// Result alias for executor paths.
pub type ExecResult<T> = Result<T, ExecError>;
