//! Component E — Emergency Detector (spec §4.E). A two-stage, fire-and-forget
//! detector off the realtime transcript pipeline: localized phrase matching
//! with a hypothetical-framing filter, severity grading with specificity
//! tie-breaking, per-patient debounce + hourly cap, and a CRITICAL/HIGH/MEDIUM
//! fan-out trigger. The phrase table is a copy-on-write snapshot
//! (`arc_swap::ArcSwap`) so admin reloads never block readers (spec §5).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use models::{Alert, EmergencyPhrase, PatientId, Severity};
use tokio::sync::mpsc;
use uuid::Uuid;

const DETECTION_QUEUE_CAPACITY: usize = 512;
const DEDUP_HISTORY_PER_PATIENT: usize = 64;

fn normalize(utterance: &str) -> String {
    let lower = utterance.to_lowercase();
    let mut out = String::with_capacity(lower.len());
    let mut last_was_space = true;
    for ch in lower.chars() {
        if ch.is_alphanumeric() || ch.is_whitespace() {
            if ch.is_whitespace() {
                if !last_was_space {
                    out.push(' ');
                    last_was_space = true;
                }
            } else {
                out.push(ch);
                last_was_space = false;
            }
        }
        // punctuation is dropped but does not re-merge adjacent words, matching
        // "strip punctuation but preserve word boundaries" (spec §4.E).
    }
    out.trim_end().to_string()
}

#[derive(Debug, Clone)]
struct CompiledPhrase {
    phrase: EmergencyPhrase,
    normalized: String,
}

/// Copy-on-write snapshot of the detector's vocabulary, loaded at engine start
/// and swapped wholesale on admin change (spec §4.E).
pub struct PhraseTable {
    by_language: HashMap<String, Vec<CompiledPhrase>>,
    language_agnostic: Vec<CompiledPhrase>,
    hypothetical_markers: HashMap<String, Vec<String>>,
}

impl PhraseTable {
    pub fn build(phrases: Vec<EmergencyPhrase>, hypothetical_markers: HashMap<String, Vec<String>>) -> Self {
        let mut by_language: HashMap<String, Vec<CompiledPhrase>> = HashMap::new();
        let mut language_agnostic = Vec::new();
        for phrase in phrases {
            let compiled = CompiledPhrase {
                normalized: normalize(&phrase.phrase),
                phrase: phrase.clone(),
            };
            if phrase.language == "*" {
                language_agnostic.push(compiled);
            } else {
                by_language.entry(phrase.language.clone()).or_default().push(compiled);
            }
        }
        Self {
            by_language,
            language_agnostic,
            hypothetical_markers,
        }
    }

    pub fn empty() -> Self {
        Self {
            by_language: HashMap::new(),
            language_agnostic: Vec::new(),
            hypothetical_markers: HashMap::new(),
        }
    }

    fn candidates_for(&self, language: &str) -> impl Iterator<Item = &CompiledPhrase> {
        self.by_language
            .get(language)
            .into_iter()
            .flatten()
            .chain(self.language_agnostic.iter())
    }

    fn markers_for(&self, language: &str) -> &[String] {
        self.hypothetical_markers
            .get(language)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

fn default_hypothetical_markers() -> Vec<&'static str> {
    vec!["if", "what if", "suppose", "imagine", "pretend"]
}

/// Returns `true` if the normalized utterance evidences hypothetical framing,
/// interrogative framing about an emergency, or reported speech, preceding
/// the matched phrase (spec §4.E, false-positive filter).
fn is_hypothetical(normalized_utterance: &str, matched_phrase: &str, markers: &[String]) -> bool {
    let marker_words: Vec<&str> = if markers.is_empty() {
        default_hypothetical_markers()
    } else {
        markers.iter().map(String::as_str).collect()
    };

    let Some(match_index) = normalized_utterance.find(matched_phrase) else {
        return false;
    };
    let preceding = &normalized_utterance[..match_index];

    if marker_words.iter().any(|marker| preceding.contains(marker)) {
        return true;
    }

    if preceding.trim_start().starts_with("what")
        || normalized_utterance.trim_end().ends_with('?')
        || normalized_utterance.contains("what would")
    {
        return true;
    }

    if preceding.contains("the doctor said") || preceding.contains("she said") || preceding.contains("he said") {
        return true;
    }

    false
}

#[derive(Debug, Clone)]
pub struct DetectionCandidate {
    pub severity: Severity,
    pub category: String,
    pub phrase: String,
}

/// Runs stages 1 and 2 as a pure function so they are trivially unit-testable
/// without spinning up the async detector.
pub fn evaluate(
    table: &PhraseTable,
    utterance: &str,
    language: &str,
    suppress_hypothetical_for_critical: bool,
) -> Option<DetectionCandidate> {
    let normalized_utterance = normalize(utterance);
    let markers = table.markers_for(language);

    let mut best: Option<DetectionCandidate> = None;
    for compiled in table.candidates_for(language) {
        if !normalized_utterance.contains(&compiled.normalized) {
            continue;
        }

        let hypothetical = is_hypothetical(&normalized_utterance, &compiled.normalized, markers);
        if hypothetical && (compiled.phrase.severity != Severity::Critical || suppress_hypothetical_for_critical) {
            continue;
        }

        let candidate = DetectionCandidate {
            severity: compiled.phrase.severity,
            category: compiled.phrase.category.clone(),
            phrase: compiled.phrase.phrase.clone(),
        };

        best = Some(match best {
            None => candidate,
            Some(current) => {
                if candidate.severity.rank() > current.severity.rank() {
                    candidate
                } else if candidate.severity.rank() == current.severity.rank()
                    && candidate.phrase.len() > current.phrase.len()
                {
                    candidate
                } else {
                    current
                }
            }
        });
    }

    best
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    Fired,
    SuppressedDebounce,
    SuppressedHourlyCap,
}

struct PatientDedupState {
    recent: VecDeque<(String, String, DateTime<Utc>)>,
    hourly_fires: VecDeque<DateTime<Utc>>,
}

/// Per-patient dedup ledger: a bounded LRU of `(category, normalizedPhrase,
/// lastFiredAt)` plus an independent hourly fire cap (spec §4.E). Keyed
/// per-patient via `DashMap` rather than one global lock (spec §5).
pub struct DedupLedger {
    state: DashMap<PatientId, PatientDedupState>,
    debounce: ChronoDuration,
    max_alerts_per_hour: u32,
}

impl DedupLedger {
    pub fn new(debounce_minutes: i64, max_alerts_per_hour: u32) -> Self {
        Self {
            state: DashMap::new(),
            debounce: ChronoDuration::minutes(debounce_minutes),
            max_alerts_per_hour,
        }
    }

    pub fn try_register(
        &self,
        patient_id: PatientId,
        category: &str,
        normalized_phrase: &str,
        now: DateTime<Utc>,
    ) -> DedupOutcome {
        let mut entry = self.state.entry(patient_id).or_insert_with(|| PatientDedupState {
            recent: VecDeque::new(),
            hourly_fires: VecDeque::new(),
        });

        if let Some((_, _, last_fired)) = entry
            .recent
            .iter()
            .find(|(c, p, _)| c == category && p == normalized_phrase)
        {
            if now - *last_fired < self.debounce {
                return DedupOutcome::SuppressedDebounce;
            }
        }

        let hour_ago = now - ChronoDuration::hours(1);
        while matches!(entry.hourly_fires.front(), Some(t) if *t < hour_ago) {
            entry.hourly_fires.pop_front();
        }
        if entry.hourly_fires.len() as u32 >= self.max_alerts_per_hour {
            return DedupOutcome::SuppressedHourlyCap;
        }

        entry.recent.retain(|(c, p, _)| !(c == category && p == normalized_phrase));
        entry
            .recent
            .push_back((category.to_string(), normalized_phrase.to_string(), now));
        while entry.recent.len() > DEDUP_HISTORY_PER_PATIENT {
            entry.recent.pop_front();
        }
        entry.hourly_fires.push_back(now);

        DedupOutcome::Fired
    }
}

#[derive(Debug, Clone)]
pub struct DetectionRequest {
    pub patient_id: PatientId,
    pub conversation_id: Option<Uuid>,
    pub utterance: String,
    pub language: String,
}

/// Invoked with every alert that survives detection and dedup. Implementors
/// (Notification Fan-out) must never propagate errors back to the detector
/// (spec §4.E/§7) — hence the `()` return rather than a `Result`.
#[async_trait::async_trait]
pub trait AlertSink: Send + Sync {
    async fn handle_alert(&self, alert: Alert);
    async fn handle_suppressed(&self, patient_id: PatientId, category: &str, reason: DedupOutcome);
}

pub struct EmergencyDetector {
    phrase_table: ArcSwap<PhraseTable>,
    dedup: DedupLedger,
    suppress_hypothetical_for_critical: bool,
    queue_tx: mpsc::Sender<DetectionRequest>,
}

impl EmergencyDetector {
    /// Spawns the background consumer task and returns the detector handle.
    /// `enqueue` below is the only hot-path entry point; it never awaits the
    /// consumer and never blocks the realtime transcript pipeline (spec §4.E,
    /// "never-blocks rule").
    pub fn spawn(
        phrase_table: PhraseTable,
        debounce_minutes: i64,
        max_alerts_per_hour: u32,
        suppress_hypothetical_for_critical: bool,
        sink: Arc<dyn AlertSink>,
    ) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel(DETECTION_QUEUE_CAPACITY);
        let detector = Arc::new(Self {
            phrase_table: ArcSwap::from_pointee(phrase_table),
            dedup: DedupLedger::new(debounce_minutes, max_alerts_per_hour),
            suppress_hypothetical_for_critical,
            queue_tx: tx,
        });

        let worker = detector.clone();
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                worker.process(request, sink.clone()).await;
            }
        });

        detector
    }

    /// Fire-and-forget enqueue. Overflow is logged and the utterance is
    /// dropped rather than backpressuring the call (spec §4.E).
    pub fn enqueue(&self, request: DetectionRequest) {
        if let Err(err) = self.queue_tx.try_send(request) {
            tracing::warn!(?err, "emergency detector queue overflow, utterance dropped");
        }
    }

    pub fn reload_phrases(&self, table: PhraseTable) {
        self.phrase_table.store(Arc::new(table));
    }

    async fn process(&self, request: DetectionRequest, sink: Arc<dyn AlertSink>) {
        let table = self.phrase_table.load();
        let Some(candidate) = evaluate(
            &table,
            &request.utterance,
            &request.language,
            self.suppress_hypothetical_for_critical,
        ) else {
            return;
        };

        let normalized_phrase = normalize(&candidate.phrase);
        let now = Utc::now();
        match self
            .dedup
            .try_register(request.patient_id, &candidate.category, &normalized_phrase, now)
        {
            DedupOutcome::Fired => {
                let alert = Alert {
                    id: Uuid::new_v4(),
                    patient_id: request.patient_id,
                    conversation_id: request.conversation_id,
                    severity: candidate.severity,
                    category: candidate.category,
                    phrase: candidate.phrase,
                    raw_utterance: request.utterance,
                    detected_at: now,
                };
                sink.handle_alert(alert).await;
            }
            outcome => {
                sink.handle_suppressed(request.patient_id, &candidate.category, outcome).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phrase(language: &str, severity: Severity, category: &str, text: &str) -> EmergencyPhrase {
        EmergencyPhrase {
            id: Uuid::new_v4(),
            language: language.to_string(),
            severity,
            category: category.to_string(),
            phrase: text.to_string(),
        }
    }

    fn english_table() -> PhraseTable {
        PhraseTable::build(
            vec![
                phrase("en", Severity::Critical, "medical", "heart attack"),
                phrase("en", Severity::Critical, "medical", "having a stroke"),
                phrase("en", Severity::High, "fall", "i fell and i cannot get up"),
            ],
            HashMap::new(),
        )
    }

    #[test]
    fn matches_critical_phrase() {
        let table = english_table();
        let candidate = evaluate(&table, "I think I'm having a heart attack.", "en", true).unwrap();
        assert_eq!(candidate.severity, Severity::Critical);
        assert_eq!(candidate.category, "medical");
    }

    #[test]
    fn hypothetical_framing_suppresses_the_match() {
        let table = english_table();
        let candidate = evaluate(
            &table,
            "What if I had a heart attack, what would you do?",
            "en",
            true,
        );
        assert!(candidate.is_none());
    }

    #[test]
    fn two_candidates_take_the_higher_severity() {
        let table = PhraseTable::build(
            vec![
                phrase("en", Severity::Medium, "general", "not feeling well"),
                phrase("en", Severity::Critical, "medical", "heart attack"),
            ],
            HashMap::new(),
        );
        let candidate = evaluate(&table, "I'm not feeling well, I think it's a heart attack", "en", true).unwrap();
        assert_eq!(candidate.severity, Severity::Critical);
    }

    #[test]
    fn dedup_suppresses_within_debounce_window() {
        let ledger = DedupLedger::new(5, 10);
        let patient = Uuid::new_v4();
        let now = Utc::now();
        assert_eq!(
            ledger.try_register(patient, "medical", "having a stroke", now),
            DedupOutcome::Fired
        );
        assert_eq!(
            ledger.try_register(patient, "medical", "having a stroke", now + ChronoDuration::seconds(90)),
            DedupOutcome::SuppressedDebounce
        );
        assert_eq!(
            ledger.try_register(
                patient,
                "medical",
                "having a stroke",
                now + ChronoDuration::minutes(10)
            ),
            DedupOutcome::Fired
        );
    }

    #[test]
    fn hourly_cap_is_independent_of_debounce() {
        let ledger = DedupLedger::new(0, 2);
        let patient = Uuid::new_v4();
        let now = Utc::now();
        assert_eq!(ledger.try_register(patient, "a", "x", now), DedupOutcome::Fired);
        assert_eq!(
            ledger.try_register(patient, "b", "y", now + ChronoDuration::seconds(1)),
            DedupOutcome::Fired
        );
        assert_eq!(
            ledger.try_register(patient, "c", "z", now + ChronoDuration::seconds(2)),
            DedupOutcome::SuppressedHourlyCap
        );
    }
}
