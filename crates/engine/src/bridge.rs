//! Component B — SIP/Media Bridge Adapter (spec §4.B). The orchestrator only
//! needs the channel lifecycle and event stream; the actual RTP relay runs in
//! `services/media`, adapted from the teacher's UDP `Relay`.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{EngineError, EngineResult};

/// Fixed per spec §4.B: µ-law or A-law at 8 kHz, 20 ms frames.
pub const FRAME_DURATION_MS: u32 = 20;
pub const SAMPLE_RATE_HZ: u32 = 8_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    MuLaw,
    ALaw,
}

#[derive(Debug, Clone)]
pub enum BridgeEvent {
    StasisStart { channel_id: String },
    StasisEnd { channel_id: String },
    Dtmf { channel_id: String, digit: char },
    Error { channel_id: String, detail: String },
}

#[async_trait]
pub trait BridgeAdapter: Send + Sync {
    /// Opens a channel for a placed call and returns its opaque id.
    async fn open_channel(&self, call_sid: &str) -> EngineResult<String>;

    /// Idempotent; succeeds if the channel is already closed.
    async fn close_channel(&self, channel_id: &str, reason: &str) -> EngineResult<()>;
}

/// Counts frames dropped because a downstream consumer could not keep up
/// within the one-frame buffering budget spec §4.B allows. One counter per
/// direction, shared across the adapter's lifetime.
#[derive(Default)]
pub struct FrameDropCounters {
    inbound_dropped: AtomicU64,
    outbound_dropped: AtomicU64,
}

impl FrameDropCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_inbound_drop(&self) {
        self.inbound_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outbound_drop(&self) {
        self.outbound_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inbound_dropped(&self) -> u64 {
        self.inbound_dropped.load(Ordering::Relaxed)
    }

    pub fn outbound_dropped(&self) -> u64 {
        self.outbound_dropped.load(Ordering::Relaxed)
    }
}

/// HTTP control-plane client for `services/media`'s channel lifecycle
/// endpoints; the actual RTP relay loop lives in that service, not here.
pub struct HttpBridgeAdapter {
    client: reqwest::Client,
    media_base_url: String,
}

impl HttpBridgeAdapter {
    pub fn new(media_base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            media_base_url,
        }
    }
}

#[async_trait]
impl BridgeAdapter for HttpBridgeAdapter {
    async fn open_channel(&self, call_sid: &str) -> EngineResult<String> {
        #[derive(serde::Deserialize)]
        struct OpenChannelResponse {
            channel_id: String,
        }

        let response = self
            .client
            .post(format!("{}/channels", self.media_base_url))
            .json(&serde_json::json!({ "call_sid": call_sid }))
            .send()
            .await
            .map_err(|err| EngineError::Transient {
                component: "bridge",
                detail: err.to_string(),
            })?;

        response
            .json::<OpenChannelResponse>()
            .await
            .map(|body| body.channel_id)
            .map_err(|err| EngineError::Transient {
                component: "bridge",
                detail: err.to_string(),
            })
    }

    async fn close_channel(&self, channel_id: &str, reason: &str) -> EngineResult<()> {
        let result = self
            .client
            .post(format!("{}/channels/{}/close", self.media_base_url, channel_id))
            .json(&serde_json::json!({ "reason": reason }))
            .send()
            .await;
        if let Err(err) = result {
            tracing::warn!(?err, channel_id, "bridge channel close request failed, treating as already closed");
        }
        Ok(())
    }
}

/// In-memory bridge adapter used by unit tests; opens/closes channels without
/// touching a real socket.
pub struct MockBridgeAdapter;

#[async_trait]
impl BridgeAdapter for MockBridgeAdapter {
    async fn open_channel(&self, call_sid: &str) -> EngineResult<String> {
        Ok(format!("CH-{call_sid}"))
    }

    async fn close_channel(&self, _channel_id: &str, _reason: &str) -> EngineResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_drop_counters_are_independent_per_direction() {
        let counters = FrameDropCounters::new();
        counters.record_inbound_drop();
        counters.record_inbound_drop();
        counters.record_outbound_drop();
        assert_eq!(counters.inbound_dropped(), 2);
        assert_eq!(counters.outbound_dropped(), 1);
    }

    #[tokio::test]
    async fn channel_close_is_idempotent() {
        let adapter = MockBridgeAdapter;
        let channel_id = adapter.open_channel("CS1").await.unwrap();
        adapter.close_channel(&channel_id, "call ended").await.unwrap();
        adapter.close_channel(&channel_id, "call ended").await.unwrap();
    }
}
