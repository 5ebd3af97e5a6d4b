use std::fmt::Display;
use std::io::Write;
use thiserror::Error;

/// Everything that can go wrong while driving a TPM command.
///
/// The variants keep "wrong secret or state" ([`Error::Authorization`]) apart
/// from "the device refused or broke" ([`Error::Device`]).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed flag or argument, caught before the device is touched.
    #[error("invalid flag '{flag}': {reason}")]
    Input { flag: String, reason: String },
    /// Opening or closing the channel to the device failed.
    #[error("{0}")]
    Transport(String),
    /// The device rejected a command.
    #[error("{0}")]
    Device(String),
    /// Policy, PCR state or password did not match.
    #[error("{0}")]
    Authorization(String),
    /// A blob could not be read from or written to its backing store.
    #[error("{context} {path:?}: {reason}")]
    Storage {
        context: String,
        path: String,
        reason: String,
    },
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

impl Error {
    pub fn input(flag: impl Into<String>, reason: impl Display) -> Self {
        Self::Input {
            flag: flag.into(),
            reason: reason.to_string(),
        }
    }

    /// Prefixes the message with `context`, keeping the error kind.
    pub fn context(self, context: impl Display) -> Self {
        match self {
            Self::Transport(msg) => Self::Transport(format!("{context}: {msg}")),
            Self::Device(msg) => Self::Device(format!("{context}: {msg}")),
            Self::Authorization(msg) => Self::Authorization(format!("{context}: {msg}")),
            other => other,
        }
    }

    pub fn is_input(&self) -> bool {
        matches!(self, Self::Input { .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub fn is_device(&self) -> bool {
        matches!(self, Self::Device(_))
    }

    pub fn is_authorization(&self) -> bool {
        matches!(self, Self::Authorization(_))
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }
}

/// Ordered list of every error a command ran into.
///
/// Drivers push into this instead of returning early, so a cleanup failure
/// (flushing a session, closing the device) shows up next to the failure that
/// caused the command to stop.
#[derive(Debug, Default)]
pub struct Errors(Vec<Error>);

impl Errors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: Error) {
        log::debug!("recorded error: {error}");
        self.0.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Error> {
        self.0.iter()
    }

    pub fn into_inner(self) -> Vec<Error> {
        self.0
    }

    /// Records the error of `result`, if any, and hands back the value.
    pub fn collect<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(error) => {
                self.push(error);
                None
            }
        }
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_empty() {
            0
        } else {
            1
        }
    }

    /// Writes one `Error: ...` line per recorded error.
    pub fn report(&self, out: &mut impl Write) -> std::io::Result<()> {
        for error in &self.0 {
            writeln!(out, "Error: {error}")?;
        }
        Ok(())
    }
}
