//! Control frames multiplexed alongside raw terminal bytes.
//!
//! One attach connection carries two frame kinds: binary frames are raw
//! PTY bytes (both directions), text frames are JSON objects tagged by
//! `type`. A text frame without a client `type` is terminal input typed
//! as text, never a protocol error.

use crate::error::HubResult;
use serde::{Deserialize, Serialize};

/// Smallest accepted terminal width.
pub const MIN_COLS: u16 = 2;
/// Largest accepted terminal width.
pub const MAX_COLS: u16 = 1000;
/// Smallest accepted terminal height.
pub const MIN_ROWS: u16 = 1;
/// Largest accepted terminal height.
pub const MAX_ROWS: u16 = 500;

/// Largest accepted idle threshold (one day).
pub const MAX_IDLE_THRESHOLD_MS: u64 = 24 * 60 * 60 * 1000;

/// Normal closure (process exited, session destroyed).
pub const CLOSE_NORMAL: u16 = 1000;
/// Server is shutting down.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// The addressed session does not exist.
pub const CLOSE_SESSION_NOT_FOUND: u16 = 4004;

/// Frames a client may send as JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    /// Terminal dimension change. Values are clamped by the server.
    Resize { cols: f64, rows: f64 },
    /// Liveness probe, answered with [`ServerFrame::Pong`].
    Ping,
    /// Change the silence threshold of the idle detector. Clamped with
    /// [`clamp_idle_threshold`].
    Configure {
        #[serde(rename = "idleThresholdMs")]
        idle_threshold_ms: f64,
    },
}

/// `type` tags of [`ClientFrame`].
const CLIENT_TYPES: [&str; 3] = ["resize", "ping", "configure"];

/// Frames the server sends as JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    Pong,
    /// Absolute stream offset the client has now received up to.
    Cursor { cursor: u64 },
    Idle,
    Active,
    /// Precedes a replay burst covering `[from, to)`.
    ReplayStart { from: u64, to: u64, truncated: bool },
    ReplayDone,
    /// The session's process has exited.
    Exit { code: Option<u32> },
}

impl ServerFrame {
    /// Encode as the JSON text carried in a text frame.
    pub fn to_json(&self) -> HubResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A decoded inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientText {
    Control(ClientFrame),
    /// A control `type` with a payload that does not fit it. Dropped.
    Malformed { kind: String, reason: String },
    /// Not a control frame: forward to the terminal verbatim.
    Input(String),
}

/// Classify an inbound text frame.
///
/// Text that is not JSON, or JSON without a client `type`, falls back to
/// terminal input. A client `type` with a bad payload is never typed.
pub fn decode_client_text(text: &str) -> ClientText {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        return ClientText::Input(text.to_string());
    };
    let kind = match value.get("type").and_then(|t| t.as_str()) {
        Some(kind) if CLIENT_TYPES.contains(&kind) => kind.to_string(),
        _ => return ClientText::Input(text.to_string()),
    };
    match serde_json::from_value::<ClientFrame>(value) {
        Ok(frame) => ClientText::Control(frame),
        Err(e) => ClientText::Malformed {
            kind,
            reason: e.to_string(),
        },
    }
}

/// Round a requested idle threshold into `0..=MAX_IDLE_THRESHOLD_MS`.
pub fn clamp_idle_threshold(ms: f64) -> u64 {
    if ms.is_nan() {
        return 0;
    }
    ms.round().clamp(0.0, MAX_IDLE_THRESHOLD_MS as f64) as u64
}

/// Clamp requested terminal dimensions into the accepted range.
pub fn clamp_size(cols: f64, rows: f64) -> (u16, u16) {
    (
        clamp_dim(cols, MIN_COLS, MAX_COLS),
        clamp_dim(rows, MIN_ROWS, MAX_ROWS),
    )
}

fn clamp_dim(value: f64, min: u16, max: u16) -> u16 {
    if value.is_nan() {
        return min;
    }
    value.round().clamp(min as f64, max as f64) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_resize() {
        let text = r#"{"type":"resize","cols":120,"rows":40}"#;
        assert_eq!(
            decode_client_text(text),
            ClientText::Control(ClientFrame::Resize {
                cols: 120.0,
                rows: 40.0
            })
        );
    }

    #[test]
    fn decode_ping_and_configure() {
        assert_eq!(
            decode_client_text(r#"{"type":"ping"}"#),
            ClientText::Control(ClientFrame::Ping)
        );
        assert_eq!(
            decode_client_text(r#"{"type":"configure","idleThresholdMs":2500}"#),
            ClientText::Control(ClientFrame::Configure {
                idle_threshold_ms: 2500.0
            })
        );
    }

    #[test]
    fn garbage_is_terminal_input() {
        assert_eq!(
            decode_client_text("ls -la\r"),
            ClientText::Input("ls -la\r".into())
        );
        assert_eq!(
            decode_client_text("{not json"),
            ClientText::Input("{not json".into())
        );
    }

    #[test]
    fn unknown_type_is_terminal_input() {
        let text = r#"{"type":"explode","now":true}"#;
        assert_eq!(decode_client_text(text), ClientText::Input(text.into()));
    }

    #[test]
    fn server_only_frames_are_not_client_controls() {
        let text = r#"{"type":"cursor","cursor":5}"#;
        assert_eq!(decode_client_text(text), ClientText::Input(text.into()));
    }

    #[test]
    fn known_type_with_bad_payload_is_dropped() {
        for text in [
            r#"{"type":"resize","cols":80}"#,
            r#"{"type":"resize","cols":"80","rows":24}"#,
            r#"{"type":"configure","idleThresholdMs":"soon"}"#,
            r#"{"type":"configure"}"#,
        ] {
            assert!(
                matches!(decode_client_text(text), ClientText::Malformed { .. }),
                "{text} was not dropped"
            );
        }
        match decode_client_text(r#"{"type":"resize","cols":"80","rows":24}"#) {
            ClientText::Malformed { kind, .. } => assert_eq!(kind, "resize"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fractional_and_negative_thresholds_are_controls() {
        let frac = decode_client_text(r#"{"type":"configure","idleThresholdMs":1500.5}"#);
        assert_eq!(
            frac,
            ClientText::Control(ClientFrame::Configure {
                idle_threshold_ms: 1500.5
            })
        );
        let neg = decode_client_text(r#"{"type":"configure","idleThresholdMs":-1}"#);
        assert_eq!(
            neg,
            ClientText::Control(ClientFrame::Configure {
                idle_threshold_ms: -1.0
            })
        );
    }

    #[test]
    fn idle_threshold_clamp() {
        assert_eq!(clamp_idle_threshold(1500.5), 1501);
        assert_eq!(clamp_idle_threshold(1499.4), 1499);
        assert_eq!(clamp_idle_threshold(-1.0), 0);
        assert_eq!(clamp_idle_threshold(f64::NAN), 0);
        assert_eq!(clamp_idle_threshold(1e30), MAX_IDLE_THRESHOLD_MS);
    }

    #[test]
    fn non_object_json_is_terminal_input() {
        assert_eq!(decode_client_text("42"), ClientText::Input("42".into()));
        let text = r#"{"type":7}"#;
        assert_eq!(decode_client_text(text), ClientText::Input(text.into()));
    }

    #[test]
    fn server_frame_wire_shape() {
        assert_eq!(ServerFrame::Pong.to_json().unwrap(), r#"{"type":"pong"}"#);
        assert_eq!(
            ServerFrame::Cursor { cursor: 42 }.to_json().unwrap(),
            r#"{"type":"cursor","cursor":42}"#
        );
        assert_eq!(
            ServerFrame::ReplayStart {
                from: 10,
                to: 20,
                truncated: true
            }
            .to_json()
            .unwrap(),
            r#"{"type":"replay-start","from":10,"to":20,"truncated":true}"#
        );
        assert_eq!(
            ServerFrame::ReplayDone.to_json().unwrap(),
            r#"{"type":"replay-done"}"#
        );
    }

    #[test]
    fn clamp_bounds() {
        assert_eq!(clamp_size(0.0, 0.0), (2, 1));
        assert_eq!(clamp_size(5000.0, 9000.0), (1000, 500));
        assert_eq!(clamp_size(80.4, 23.6), (80, 24));
        assert_eq!(clamp_size(-3.0, f64::NAN), (2, 1));
    }
}
