use std::path::PathBuf;

use thiserror::Error;

use crate::finding::Source;

/// Malformed inputs detected before any adapter runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("artifact reference must not be blank")]
    EmptyArtifact,
    #[error("invalid artifact reference `{artifact}`: {reason}")]
    InvalidArtifact { artifact: String, reason: String },
    #[error("allow-list entry #{index} has a blank {field}")]
    BlankAllowEntry { index: usize, field: &'static str },
    #[error("allow-list entry for `{id}` on `{subject}` is declared more than once")]
    DuplicateAllowEntry { id: String, subject: String },
    #[error("policy requires source `{0}` but no adapter for it is enabled")]
    MissingRequiredSource(Source),
    #[error("no adapters are enabled")]
    NoAdapters,
    #[error("failed to read policy file {path}")]
    PolicyRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse policy file {path}: {message}")]
    PolicyParse { path: PathBuf, message: String },
}

/// Misuse of the gate controller itself.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("gate has already been started (state: {0})")]
    AlreadyStarted(&'static str),
}
