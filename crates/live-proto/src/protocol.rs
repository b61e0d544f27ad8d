use serde::{Deserialize, Serialize};
use std::fmt;

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  The embedding shell checks this on connect and can refuse to
/// talk to an incompatible engine.
pub const PROTOCOL_VERSION: u32 = 1;

// ── stream metadata ───────────────────────────────────────────────────────────

/// Endpoint hints for the tiers that need one.  A missing hint means the tier
/// is unavailable for this snapshot, not that something went wrong.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TransportHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_latency_base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segmented_url: Option<String>,
}

/// One snapshot of a channel as published by the metadata collaborator.
///
/// Snapshots are immutable; a newer one replaces the previous one wholesale.
/// `viewer_count` and `title` ride along for the shell but never influence
/// playback decisions (see [`StreamMetadata::same_playback`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StreamMetadata {
    pub channel_id: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(flatten)]
    pub hints: TransportHints,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewer_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl StreamMetadata {
    /// The snapshot handed out when nothing better is known.
    pub fn offline(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            ..Self::default()
        }
    }

    /// True when `other` would lead to exactly the same tier decision.
    pub fn same_playback(&self, other: &StreamMetadata) -> bool {
        self.channel_id == other.channel_id
            && self.is_active == other.is_active
            && self.hints == other.hints
    }

    /// Endpoint hint for `tier`.  Legacy never carries one.
    pub fn hint_for(&self, tier: TransportTier) -> Option<&str> {
        let hint = match tier {
            TransportTier::LowLatency => self.hints.low_latency_base_url.as_deref(),
            TransportTier::Segmented => self.hints.segmented_url.as_deref(),
            TransportTier::Legacy => None,
        };
        hint.filter(|h| !h.trim().is_empty())
    }
}

// ── tiers / machine states ────────────────────────────────────────────────────

/// Delivery strategies in strict priority order (`LowLatency` is best).
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum TransportTier {
    LowLatency,
    Segmented,
    Legacy,
}

impl TransportTier {
    pub const ALL: [TransportTier; 3] = [
        TransportTier::LowLatency,
        TransportTier::Segmented,
        TransportTier::Legacy,
    ];

    /// Whether this tier can be mounted without an endpoint hint.
    pub fn needs_hint(self) -> bool {
        !matches!(self, TransportTier::Legacy)
    }

    /// Short label for badges / logs.
    pub fn label(self) -> &'static str {
        match self {
            TransportTier::LowLatency => "low-latency",
            TransportTier::Segmented => "segmented",
            TransportTier::Legacy => "legacy",
        }
    }
}

impl fmt::Display for TransportTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Low-latency connection state.
///
/// Transitions:
///   Idle -> Connecting -> Connected -> AwaitingMedia -> Live
///   any  -> Reconnecting -> Connecting ...
///   Connecting | AwaitingMedia -> Failed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    AwaitingMedia,
    Live,
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CodecMode {
    #[default]
    Primary,
    Fallback,
}

/// How the foreground surface fits the video into its container.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FitMode {
    #[default]
    Contain,
    Cover,
}

// ── lifecycle signals ─────────────────────────────────────────────────────────

/// Lifecycle signals for the embedding shell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum PlaybackSignal {
    Offline,
    Connecting,
    Live,
    TransportDegraded { tier: TransportTier },
    Fatal { reason: String },
}

/// What the engine is currently showing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    /// `enabled = false`; nothing mounted, nothing subscribed.
    Suspended,
    #[default]
    Offline,
    Connecting,
    Live,
    /// Mounted tier reported a transient loss and is recovering.
    Degraded,
    /// Every tier failed, or configuration is unusable.  Retryable.
    Fatal,
}

/// Full observable state of the engine.  `rev` increments on every change so
/// clients can detect missed updates and request a resync.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineState {
    #[serde(default)]
    pub rev: u64,
    pub channel_id: String,
    pub enabled: bool,
    pub active: bool,
    pub status: EngineStatus,
    pub current_tier: Option<TransportTier>,
    #[serde(default)]
    pub failed_tiers: Vec<TransportTier>,
    pub connection_state: ConnectionState,
    pub codec_mode: CodecMode,
    #[serde(default)]
    pub viewer_count: Option<u64>,
    #[serde(default)]
    pub fatal_reason: Option<String>,
}

// ── shell <-> engine messages ─────────────────────────────────────────────────

/// Messages sent from the shell to the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd")]
pub enum Command {
    /// User-triggered "try again": clears failed tiers, restarts from tier 1.
    Retry,
    SetEnabled { enabled: bool },
    SetChannel { channel_id: String },
    GetState,
}

/// Messages sent from the engine to the shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + full state snapshot.
    Hello {
        protocol_version: u32,
        engine_rev: u64,
        state: EngineState,
    },
    State {
        data: EngineState,
    },
    Signal {
        signal: PlaybackSignal,
    },
    Log {
        message: String,
    },
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_input_contract() {
        let raw = r#"{
            "channelId": "main",
            "isActive": true,
            "segmentedUrl": "https://cdn.example/main.m3u8",
            "viewerCount": 120
        }"#;
        let meta: StreamMetadata = serde_json::from_str(raw).unwrap();
        assert_eq!(meta.channel_id, "main");
        assert!(meta.is_active);
        assert_eq!(meta.hint_for(TransportTier::LowLatency), None);
        assert_eq!(
            meta.hint_for(TransportTier::Segmented),
            Some("https://cdn.example/main.m3u8")
        );
        assert_eq!(meta.viewer_count, Some(120));
    }

    #[test]
    fn test_viewer_count_is_not_playback_relevant() {
        let a = StreamMetadata {
            channel_id: "main".into(),
            is_active: true,
            viewer_count: Some(1),
            ..Default::default()
        };
        let mut b = a.clone();
        b.viewer_count = Some(99);
        b.title = Some("new title".into());
        assert!(a.same_playback(&b));

        b.hints.segmented_url = Some("https://cdn.example/x.m3u8".into());
        assert!(!a.same_playback(&b));
    }

    #[test]
    fn test_blank_hint_is_absent() {
        let mut meta = StreamMetadata::offline("main");
        meta.hints.low_latency_base_url = Some("   ".into());
        assert_eq!(meta.hint_for(TransportTier::LowLatency), None);
    }

    #[test]
    fn test_tier_priority_order() {
        assert!(TransportTier::LowLatency < TransportTier::Segmented);
        assert!(TransportTier::Segmented < TransportTier::Legacy);
        assert!(!TransportTier::Legacy.needs_hint());
    }

    #[test]
    fn test_signal_message_encode_decode() {
        let msg = Message::Broadcast(Broadcast::Signal {
            signal: PlaybackSignal::TransportDegraded {
                tier: TransportTier::Segmented,
            },
        });
        let encoded = msg.encode().unwrap();
        let (decoded, len) = Message::decode(&encoded).unwrap();
        assert_eq!(len, encoded.len());
        match decoded {
            Message::Broadcast(Broadcast::Signal { signal }) => assert_eq!(
                signal,
                PlaybackSignal::TransportDegraded {
                    tier: TransportTier::Segmented
                }
            ),
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_command_decode() {
        let msg = Message::Command(Command::SetChannel {
            channel_id: "backstage".into(),
        });
        let encoded = msg.encode().unwrap();
        let (decoded, _) = Message::decode(&encoded).unwrap();
        match decoded {
            Message::Command(Command::SetChannel { channel_id }) => {
                assert_eq!(channel_id, "backstage")
            }
            _ => panic!("Wrong message type"),
        }
    }
}
