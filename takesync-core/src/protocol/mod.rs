//! Recorder text protocol: reply framing and classification.
//!
//! Every reply starts with a three digit status code. The code band decides
//! what the engine does with it:
//!
//! | Band      | Class                          |
//! |-----------|--------------------------------|
//! | 100 - 199 | [`ReplyClass::Error`]          |
//! | 500 - 599 | [`ReplyClass::Notification`]   |
//! | anything  | [`ReplyClass::Success`]        |
//!
//! A first line ending in `:` opens a multi-line reply that runs until the
//! next blank line. Any other reply is exactly one line.

pub mod command;
pub mod report;

pub use command::Command;
pub use report::{parse_clips, parse_welcome, Clip, DeviceInfo, TransportInfo};

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Default TCP port for recorders speaking this protocol
pub const DEFAULT_PORT: u16 = 9993;

/// Line terminator appended to every request
pub const LINE_END: &str = "\r\n";

// =============================================================================
// Classification
// =============================================================================

/// How a reply relates to the command that is currently outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyClass {
    /// Device rejected the request, resolves the pending command as failed
    Error,
    /// Unsolicited push, must not resolve the pending command
    Notification,
    /// Resolves the pending command successfully
    Success,
}

impl ReplyClass {
    pub fn of(code: u16) -> ReplyClass {
        match code {
            100..=199 => ReplyClass::Error,
            500..=599 => ReplyClass::Notification,
            _ => ReplyClass::Success,
        }
    }

    /// Whether a reply of this class completes the outstanding command.
    pub fn resolves_command(&self) -> bool {
        !matches!(self, ReplyClass::Notification)
    }
}

// =============================================================================
// Response
// =============================================================================

/// One complete reply as read off the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Status code from the first line
    pub code: u16,
    /// Remainder of the first line, without the trailing colon of a multi-line header
    pub message: String,
    /// Body lines of a multi-line reply (empty for single-line replies)
    pub lines: Vec<String>,
}

impl Response {
    pub fn class(&self) -> ReplyClass {
        ReplyClass::of(self.code)
    }

    pub fn is_multiline(&self) -> bool {
        !self.lines.is_empty()
    }

    /// Iterate `key: value` pairs of the body. Lines without a colon are skipped.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.lines
            .iter()
            .filter_map(|l| l.split_once(':'))
            .map(|(k, v)| (k.trim(), v.trim()))
    }

    /// Value of the first body line with the given key.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields().find(|(k, _)| *k == key).map(|(_, v)| v)
    }
}

impl std::fmt::Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

/// Split a status line into its code and message.
pub fn parse_status_line(line: &str) -> Result<(u16, &str), ProtocolError> {
    let line = line.trim_start();
    let digits = line.get(..3).filter(|d| d.bytes().all(|b| b.is_ascii_digit()));
    let Some(digits) = digits else {
        return Err(ProtocolError::MissingStatusCode(line.to_string()));
    };
    let rest = &line[3..];
    if !rest.is_empty() && !rest.starts_with(' ') {
        return Err(ProtocolError::MissingStatusCode(line.to_string()));
    }
    let code: u16 = digits
        .parse()
        .map_err(|_| ProtocolError::MissingStatusCode(line.to_string()))?;
    if code < 100 {
        return Err(ProtocolError::InvalidStatusCode(code));
    }
    Ok((code, rest.trim()))
}

// =============================================================================
// Framing
// =============================================================================

/// Assembles replies from individual lines.
///
/// Feed every received line (without its line terminator) to [`push`](Self::push).
/// A complete [`Response`] is returned as soon as one is available.
#[derive(Debug, Default)]
pub struct ResponseAssembler {
    partial: Option<Response>,
}

impl ResponseAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a multi-line reply is waiting for its blank terminator.
    pub fn in_progress(&self) -> bool {
        self.partial.is_some()
    }

    pub fn push(&mut self, line: &str) -> Result<Option<Response>, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);

        if let Some(partial) = self.partial.as_mut() {
            if line.trim().is_empty() {
                return Ok(self.partial.take());
            }
            partial.lines.push(line.to_string());
            return Ok(None);
        }

        // Stray blank lines between replies carry nothing
        if line.trim().is_empty() {
            return Ok(None);
        }

        let (code, message) = parse_status_line(line)?;
        match message.strip_suffix(':') {
            Some(header) => {
                self.partial = Some(Response {
                    code,
                    message: header.to_string(),
                    lines: Vec::new(),
                });
                Ok(None)
            }
            None => Ok(Some(Response {
                code,
                message: message.to_string(),
                lines: Vec::new(),
            })),
        }
    }

    pub fn reset(&mut self) {
        self.partial = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_bands() {
        for code in [100, 104, 150, 199] {
            assert_eq!(ReplyClass::of(code), ReplyClass::Error, "{}", code);
        }
        for code in [500, 502, 508, 511, 599] {
            assert_eq!(ReplyClass::of(code), ReplyClass::Notification, "{}", code);
            assert!(!ReplyClass::of(code).resolves_command());
        }
        for code in [200, 202, 205, 208, 300, 499, 600, 999] {
            assert_eq!(ReplyClass::of(code), ReplyClass::Success, "{}", code);
            assert!(ReplyClass::of(code).resolves_command());
        }
    }

    #[test]
    fn test_parse_status_line() {
        assert_eq!(parse_status_line("200 ok").unwrap(), (200, "ok"));
        assert_eq!(
            parse_status_line("500 connection info:").unwrap(),
            (500, "connection info:")
        );
        assert_eq!(parse_status_line("200").unwrap(), (200, ""));
        assert!(matches!(
            parse_status_line("ok 200"),
            Err(ProtocolError::MissingStatusCode(_))
        ));
        assert!(matches!(
            parse_status_line("2000 nope"),
            Err(ProtocolError::MissingStatusCode(_))
        ));
        assert_eq!(
            parse_status_line("042 weird"),
            Err(ProtocolError::InvalidStatusCode(42))
        );
    }

    #[test]
    fn test_single_line_reply() {
        let mut a = ResponseAssembler::new();
        let r = a.push("200 ok\r\n").unwrap().unwrap();
        assert_eq!(r.code, 200);
        assert_eq!(r.message, "ok");
        assert!(!r.is_multiline());
        assert!(!a.in_progress());
    }

    #[test]
    fn test_multiline_reply_needs_blank_line() {
        let mut a = ResponseAssembler::new();
        assert_eq!(a.push("208 transport info:").unwrap(), None);
        assert!(a.in_progress());
        assert_eq!(a.push("status: record").unwrap(), None);
        assert_eq!(a.push("speed: 100").unwrap(), None);

        let r = a.push("").unwrap().unwrap();
        assert_eq!(r.code, 208);
        assert_eq!(r.message, "transport info");
        assert_eq!(r.lines, vec!["status: record", "speed: 100"]);
        assert_eq!(r.field("status"), Some("record"));
        assert_eq!(r.field("speed"), Some("100"));
        assert_eq!(r.field("slot id"), None);
    }

    #[test]
    fn test_stray_blank_lines_ignored() {
        let mut a = ResponseAssembler::new();
        assert_eq!(a.push("").unwrap(), None);
        assert_eq!(a.push("\r\n").unwrap(), None);
        assert!(!a.in_progress());
        assert_eq!(a.push("200 ok").unwrap().unwrap().code, 200);
    }

    #[test]
    fn test_garbage_does_not_poison_assembler() {
        let mut a = ResponseAssembler::new();
        assert!(a.push("hello there").is_err());
        assert_eq!(a.push("100 syntax error").unwrap().unwrap().code, 100);
    }
}
