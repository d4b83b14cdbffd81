use std::io;

use thiserror::Error;

/// Malformed pipeline text. Parsing aborts; nothing is spawned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyntaxError {
    #[error("unterminated quote")]
    UnterminatedQuote,
    #[error("missing command around '|'")]
    MissingCommand,
    #[error("redirection without a target")]
    RedirectWithoutTarget,
    #[error("'&' must end the pipeline")]
    BackgroundNotLast,
}

/// A redirection target could not be opened. Detected before any fork.
#[derive(Debug, Error)]
#[error("cannot redirect to {path}: {source}")]
pub struct RedirectError {
    pub path: String,
    #[source]
    pub source: io::Error,
}

/// Process or pipe creation failed on the launching side.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("pipe creation failed: {0}")]
    Pipe(nix::errno::Errno),
    #[error("fork failed: {0}")]
    Fork(nix::errno::Errno),
}

#[derive(Debug, Error)]
pub enum ShellError {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),
    #[error(transparent)]
    Redirect(#[from] RedirectError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
}
