use thiserror::Error;

/// Raw failures as transports report them.  Never crosses the tier boundary:
/// tiers call [`TransportError::normalize`] before reporting upward.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("join rejected: {0}")]
    Rejected(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("network failure: {0}")]
    Network(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("decode failure: {0}")]
    Decode(String),
    /// Optional capability missing on this transport.  Callers treat it as a no-op.
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("session closed")]
    Closed,
}

impl TransportError {
    /// Whether a reconnect with the same tier might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Network(_) | TransportError::Timeout(_) | TransportError::Closed
        )
    }

    pub fn normalize(self) -> TierFailure {
        match self {
            TransportError::Rejected(m) => TierFailure::Transport(format!("rejected: {m}")),
            TransportError::Unauthorized(m) => {
                TierFailure::Transport(format!("unauthorized: {m}"))
            }
            TransportError::Network(m) => TierFailure::Transport(m),
            TransportError::Closed => TierFailure::Transport("session closed".into()),
            TransportError::Timeout(m) => TierFailure::Timeout(m),
            TransportError::Decode(m) => TierFailure::Decode(m),
            TransportError::Unsupported(m) => {
                TierFailure::Configuration(format!("unsupported transport: {m}"))
            }
        }
    }
}

/// Transport-agnostic failure of a mounted tier, as seen by the orchestrator.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TierFailure {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("timeout: {0}")]
    Timeout(String),
}

impl TierFailure {
    pub fn is_configuration(&self) -> bool {
        matches!(self, TierFailure::Configuration(_))
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("metadata request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("metadata endpoint returned HTTP {0}")]
    Status(u16),
    #[error("metadata unavailable: {0}")]
    Unavailable(String),
}

/// Session-terminal conditions surfaced to the shell as `Fatal`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("all transports failed (last: {last})")]
    Exhausted { last: TierFailure },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_maps_every_shape_into_taxonomy() {
        assert!(matches!(
            TransportError::Unauthorized("bad token".into()).normalize(),
            TierFailure::Transport(_)
        ));
        assert!(matches!(
            TransportError::Timeout("join".into()).normalize(),
            TierFailure::Timeout(_)
        ));
        assert!(matches!(
            TransportError::Decode("h264".into()).normalize(),
            TierFailure::Decode(_)
        ));
        assert!(TransportError::Unsupported("whep".into())
            .normalize()
            .is_configuration());
    }

    #[test]
    fn test_only_network_shapes_are_retryable() {
        assert!(TransportError::Network("reset".into()).is_retryable());
        assert!(TransportError::Closed.is_retryable());
        assert!(!TransportError::Rejected("full".into()).is_retryable());
        assert!(!TransportError::Unauthorized("expired".into()).is_retryable());
    }
}
