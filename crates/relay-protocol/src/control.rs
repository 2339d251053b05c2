//! WebSocket control envelope.
//!
//! Binary frames on the terminal socket carry raw PTY bytes in both
//! directions. Text frames carry a small JSON control envelope; `resize`
//! is the only recognized type today. The `version` field is reserved so
//! the envelope can evolve without breaking older clients; absent means
//! version 1.

use serde::{Deserialize, Serialize};

/// Current control envelope version.
pub const CONTROL_VERSION: u16 = 1;

fn default_version() -> u16 {
    CONTROL_VERSION
}

/// Client-to-server control messages sent as WebSocket text frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Resize the server-side PTY to the client's terminal dimensions.
    Resize {
        #[serde(default = "default_version", skip_serializing_if = "is_current")]
        version: u16,
        cols: u16,
        rows: u16,
    },
}

fn is_current(v: &u16) -> bool {
    *v == CONTROL_VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_round_trip() {
        let msg = ControlMessage::Resize {
            version: CONTROL_VERSION,
            cols: 120,
            rows: 40,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"resize","cols":120,"rows":40}"#);

        let parsed: ControlMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_resize_accepts_missing_version() {
        let parsed: ControlMessage =
            serde_json::from_str(r#"{"type":"resize","cols":80,"rows":24}"#).unwrap();
        let ControlMessage::Resize { version, cols, rows } = parsed;
        assert_eq!(version, CONTROL_VERSION);
        assert_eq!((cols, rows), (80, 24));
    }

    #[test]
    fn test_unrecognized_type_is_rejected() {
        let result = serde_json::from_str::<ControlMessage>(r#"{"type":"paste","data":"x"}"#);
        assert!(result.is_err());
    }
}
