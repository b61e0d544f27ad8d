//! Resilient live-playback engine.
//!
//! Resolves stream metadata for a channel, mounts the best available
//! transport tier, falls back tier by tier on failure and renders the
//! resulting track through the compositor.  All state is owned by
//! [`core::EngineCore`].
pub mod compositor;
pub mod core;
pub mod error;
pub mod lifecycle;
pub mod lowlatency;
pub mod resolver;
pub mod tier;
pub mod transport;

/// Per-mount options: fit mode, muted, enabled, mobile viewport.
pub use live_proto::config::MountConfig as MountOptions;

pub use crate::core::{EngineBroadcast, EngineCore, EngineDeps, EngineEvent, TierSelector};
