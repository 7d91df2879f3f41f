//! Status codes shared by the catalog, executor, and RPC layers.
//!
//! Interior layers keep plain `anyhow` ergonomics; the router downcasts to
//! `StatusError` when it needs the code (e.g. for tests) and the wire server
//! only ever sees the message text.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    NotFound,
    AlreadyExists,
    InvalidArgument,
    Unsupported,
    Unimplemented,
    Internal,
    Io,
    Rpc,
    MalformedValue,
}

#[derive(Debug, Clone)]
pub struct StatusError {
    pub kind: StatusKind,
    pub message: String,
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for StatusError {}

fn build(kind: StatusKind, message: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(StatusError {
        kind,
        message: message.into(),
    })
}

pub fn not_found(message: impl Into<String>) -> anyhow::Error {
    build(StatusKind::NotFound, message)
}

pub fn already_exists(message: impl Into<String>) -> anyhow::Error {
    build(StatusKind::AlreadyExists, message)
}

pub fn invalid_argument(message: impl Into<String>) -> anyhow::Error {
    build(StatusKind::InvalidArgument, message)
}

pub fn unsupported(message: impl Into<String>) -> anyhow::Error {
    build(StatusKind::Unsupported, message)
}

pub fn unimplemented(message: impl Into<String>) -> anyhow::Error {
    build(StatusKind::Unimplemented, message)
}

pub fn internal(message: impl Into<String>) -> anyhow::Error {
    build(StatusKind::Internal, message)
}

pub fn io(message: impl Into<String>) -> anyhow::Error {
    build(StatusKind::Io, message)
}

pub fn rpc(message: impl Into<String>) -> anyhow::Error {
    build(StatusKind::Rpc, message)
}

pub fn malformed_value(message: impl Into<String>) -> anyhow::Error {
    build(StatusKind::MalformedValue, message)
}

/// Status kind of an error, if it carries one.
pub fn kind_of(err: &anyhow::Error) -> Option<StatusKind> {
    err.downcast_ref::<StatusError>().map(|status| status.kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_message_only() {
        let err = not_found("table not found: nope.nope");
        assert_eq!(err.to_string(), "table not found: nope.nope");
        assert_eq!(kind_of(&err), Some(StatusKind::NotFound));
    }

    #[test]
    fn kind_of_plain_error_is_none() {
        let err = anyhow::anyhow!("plain");
        assert_eq!(kind_of(&err), None);
    }
}
