//! Parsing of the multi-line reports a recorder sends back.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{ReplyClass, Response};
use crate::error::ProtocolError;

/// Transport status value reported while a recorder is recording.
pub const STATUS_RECORD: &str = "record";

// =============================================================================
// Welcome banner
// =============================================================================

/// Identity reported in the `500 connection info:` banner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub model: Option<String>,
    pub protocol_version: Option<String>,
}

/// Validate the welcome banner. Anything but a 5xx banner is refused.
pub fn parse_welcome(response: &Response) -> Result<DeviceInfo, ProtocolError> {
    if response.class() != ReplyClass::Notification {
        return Err(ProtocolError::BadWelcome(response.to_string()));
    }
    Ok(DeviceInfo {
        model: response.field("model").map(str::to_string),
        protocol_version: response.field("protocol version").map(str::to_string),
    })
}

// =============================================================================
// Transport info
// =============================================================================

/// Body of a `208 transport info:` reply or `508 transport info:` push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportInfo {
    pub fields: BTreeMap<String, String>,
}

impl TransportInfo {
    pub fn from_response(response: &Response) -> Self {
        TransportInfo {
            fields: response
                .fields()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn status(&self) -> Option<&str> {
        self.fields.get("status").map(String::as_str)
    }

    pub fn is_recording(&self) -> bool {
        self.status() == Some(STATUS_RECORD)
    }
}

/// True when a reply carries transport info, either as answer or as push.
pub fn is_transport_info(response: &Response) -> bool {
    matches!(response.code, 208 | 508)
}

// =============================================================================
// Clips
// =============================================================================

/// One entry of a `205 clips info:` listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clip {
    pub id: u32,
    pub name: String,
    pub timecode: String,
    pub duration: String,
}

impl Clip {
    /// Parse `"<id>: <name...> <timecode> <duration>"`. Names may contain spaces.
    pub fn parse(line: &str) -> Result<Clip, ProtocolError> {
        let malformed = || ProtocolError::MalformedClip(line.to_string());

        let (id, rest) = line.split_once(':').ok_or_else(malformed)?;
        let id: u32 = id.trim().parse().map_err(|_| malformed())?;

        let mut parts: Vec<&str> = rest.split_whitespace().collect();
        if parts.len() < 3 {
            return Err(malformed());
        }
        let duration = parts.pop().ok_or_else(malformed)?.to_string();
        let timecode = parts.pop().ok_or_else(malformed)?.to_string();

        Ok(Clip {
            id,
            name: parts.join(" "),
            timecode,
            duration,
        })
    }
}

/// Parse every clip line of a listing, skipping the `clip count:` header.
pub fn parse_clips(response: &Response) -> Result<Vec<Clip>, ProtocolError> {
    response
        .lines
        .iter()
        .filter(|l| !l.trim_start().starts_with("clip count"))
        .filter(|l| !l.trim().is_empty())
        .map(|l| Clip::parse(l))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResponseAssembler;

    fn assemble(lines: &[&str]) -> Response {
        let mut a = ResponseAssembler::new();
        for line in lines {
            if let Some(r) = a.push(line).unwrap() {
                return r;
            }
        }
        panic!("incomplete reply");
    }

    #[test]
    fn test_welcome() {
        let r = assemble(&[
            "500 connection info:",
            "protocol version: 1.11",
            "model: HyperDeck Studio HD Plus",
            "",
        ]);
        let info = parse_welcome(&r).unwrap();
        assert_eq!(info.model.as_deref(), Some("HyperDeck Studio HD Plus"));
        assert_eq!(info.protocol_version.as_deref(), Some("1.11"));
    }

    #[test]
    fn test_welcome_rejects_other_bands() {
        let r = assemble(&["200 ok"]);
        assert!(matches!(parse_welcome(&r), Err(ProtocolError::BadWelcome(_))));
        let r = assemble(&["120 connection rejected"]);
        assert!(parse_welcome(&r).is_err());
    }

    #[test]
    fn test_transport_info_recording() {
        let r = assemble(&["208 transport info:", "status: record", "speed: 0", ""]);
        let info = TransportInfo::from_response(&r);
        assert!(is_transport_info(&r));
        assert!(info.is_recording());
        assert_eq!(info.fields.get("speed").map(String::as_str), Some("0"));

        let r = assemble(&["508 transport info:", "status: stopped", ""]);
        assert!(is_transport_info(&r));
        assert!(!TransportInfo::from_response(&r).is_recording());
    }

    #[test]
    fn test_clip_listing() {
        let r = assemble(&[
            "205 clips info:",
            "clip count: 2",
            "1: Take_001.mov 00:00:00:00 00:00:12:10",
            "2: Warm up take.mov 01:00:00:00 00:02:00:00",
            "",
        ]);
        let clips = parse_clips(&r).unwrap();
        assert_eq!(clips.len(), 2);
        assert_eq!(clips[0].id, 1);
        assert_eq!(clips[0].name, "Take_001.mov");
        assert_eq!(clips[1].name, "Warm up take.mov");
        assert_eq!(clips[1].timecode, "01:00:00:00");
        assert_eq!(clips[1].duration, "00:02:00:00");
    }

    #[test]
    fn test_malformed_clip() {
        assert!(Clip::parse("x: a b c").is_err());
        assert!(Clip::parse("3: 00:00:00:00").is_err());
        assert!(Clip::parse("no colon here").is_err());
    }
}
