//! Error types for protocol parsing

use thiserror::Error;

/// Errors that can occur when parsing recorder replies
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Reply line does not start with a three digit status code
    #[error("Missing status code in reply '{0}'")]
    MissingStatusCode(String),

    /// Status code outside of the 100..=999 range
    #[error("Invalid status code {0}")]
    InvalidStatusCode(u16),

    /// The device greeted us with something other than a ready banner
    #[error("Unexpected welcome: expected 5xx banner, got '{0}'")]
    BadWelcome(String),

    /// Clip listing line that cannot be split into its fields
    #[error("Malformed clip line '{0}'")]
    MalformedClip(String),

    /// Reply arrived with an unexpected status code for the request
    #[error("Unexpected reply {code} to '{request}'")]
    UnexpectedReply { code: u16, request: String },
}
