//! Component C — Realtime AI Session (spec §4.C). A session is a bidirectional
//! duplex to an external realtime voice model. The orchestrator drives it
//! through the `RealtimeAiSession` trait so it never depends on a concrete
//! WebSocket client; `MockAiSession` scripts events for tests.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::EngineResult;

#[derive(Debug, Clone)]
pub enum AiSessionEvent {
    AudioDelta(Vec<u8>),
    UserTranscriptPartial(String),
    UserTranscriptCompleted(String),
    AssistantTranscriptCompleted(String),
    SpeechStarted,
    SpeechStopped,
    Error(String),
}

#[async_trait]
pub trait RealtimeAiSession: Send + Sync {
    async fn audio_append(&self, pcm_frame: &[u8]) -> EngineResult<()>;
    async fn commit(&self) -> EngineResult<()>;
    /// Cancels in-flight generation; used both for explicit cancellation and
    /// for barge-in (spec §4.C).
    async fn cancel(&self) -> EngineResult<()>;
    async fn interrupt(&self) -> EngineResult<()>;
    /// Drains inbound queues with a bounded deadline and releases the
    /// underlying socket. Idempotent.
    async fn close(&self) -> EngineResult<()>;
}

/// Scripted session for tests: events are pushed in up-front, `recv` drains
/// them in order exactly like a real duplex's inbound stream would.
pub struct MockAiSession {
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<AiSessionEvent>>,
    inbound_tx: mpsc::UnboundedSender<AiSessionEvent>,
    outbound_cancel_count: std::sync::atomic::AtomicU32,
}

impl MockAiSession {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inbound_rx: tokio::sync::Mutex::new(rx),
            inbound_tx: tx,
            outbound_cancel_count: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub fn push(&self, event: AiSessionEvent) {
        let _ = self.inbound_tx.send(event);
    }

    pub async fn recv(&self) -> Option<AiSessionEvent> {
        self.inbound_rx.lock().await.recv().await
    }

    pub fn cancel_count(&self) -> u32 {
        self.outbound_cancel_count.load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl Default for MockAiSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RealtimeAiSession for MockAiSession {
    async fn audio_append(&self, _pcm_frame: &[u8]) -> EngineResult<()> {
        Ok(())
    }

    async fn commit(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn cancel(&self) -> EngineResult<()> {
        self.outbound_cancel_count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    async fn interrupt(&self) -> EngineResult<()> {
        self.cancel().await
    }

    async fn close(&self) -> EngineResult<()> {
        Ok(())
    }
}

/// Barge-in policy (spec §4.C): when `SpeechStarted` arrives while assistant
/// audio is playing, the session must cancel generation and any further
/// assistant audio for the cancelled turn must be discarded. This tracks that
/// per-turn discard flag; the orchestrator calls `on_speech_started` /
/// `should_discard_delta` as it drains the event stream.
#[derive(Default)]
pub struct BargeInGuard {
    assistant_playing: std::sync::atomic::AtomicBool,
    discarding_turn: std::sync::atomic::AtomicBool,
}

impl BargeInGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_assistant_audio_started(&self) {
        self.assistant_playing
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn on_assistant_turn_completed(&self) {
        self.assistant_playing
            .store(false, std::sync::atomic::Ordering::SeqCst);
        self.discarding_turn
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }

    /// Returns `true` if barge-in should fire (assistant was mid-utterance).
    pub fn on_user_speech_started(&self) -> bool {
        if self.assistant_playing.load(std::sync::atomic::Ordering::SeqCst) {
            self.discarding_turn
                .store(true, std::sync::atomic::Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn should_discard_delta(&self) -> bool {
        self.discarding_turn.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn barge_in_only_fires_while_assistant_is_playing() {
        let guard = BargeInGuard::new();
        assert!(!guard.on_user_speech_started());

        guard.on_assistant_audio_started();
        assert!(guard.on_user_speech_started());
        assert!(guard.should_discard_delta());

        guard.on_assistant_turn_completed();
        assert!(!guard.should_discard_delta());
    }

    #[tokio::test]
    async fn cancel_is_observed_by_the_guard_count() {
        let session = MockAiSession::new();
        session.cancel().await.unwrap();
        session.interrupt().await.unwrap();
        assert_eq!(session.cancel_count(), 2);
    }
}
