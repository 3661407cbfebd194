//! Ingest Router (C2, §4.2).
//!
//! Accepts raw vendor messages, normalizes them into `Envelope`s, and
//! enforces three things before anything reaches the shard dispatcher:
//! deduplication by `(source, vendorSequence)`, bounded reordering per
//! `(source, key)`, and priority-ordered conflict resolution for
//! reference-data fields. The vendor adapter contract itself
//! (`next`/`commit`/`subscribe`) is an external collaborator (§6) — this
//! module only defines the trait shape so a caller can plug one in; it
//! never implements a concrete transport.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::config::EngineConfig;
use crate::envelope::{Envelope, EventType, ShardKey};
use crate::error::EngineError;
use crate::telemetry::metrics;

/// A raw message as handed off by a vendor adapter, before normalization.
/// `body` is already-parsed JSON in the target `Envelope`/`EventPayload`
/// shape; the vendor-specific wire format is the adapter's concern, not
/// this router's (§4.2, §6 "agnostic to the transport").
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub source: String,
    pub vendor_sequence: u64,
    pub body: Value,
}

/// External collaborator contract (§4.2, §6). Not implemented by this
/// crate — a concrete adapter (Reuters, Bloomberg, …) lives outside the
/// core and is handed to the router by the operator wiring.
#[async_trait]
pub trait VendorAdapter: Send {
    async fn next(&mut self) -> Option<RawMessage>;
    async fn commit(&mut self, offset: u64);
    fn subscribe(&mut self, symbols: &[String]);
}

/// Bounded `(source, vendorSequence)` dedup set with FIFO eviction, used as
/// the "LRU keyed by (source, vendorSequence)" §4.2 describes. A true LRU
/// (promote-on-access) isn't needed here: entries are only ever inserted
/// once and never re-touched, so FIFO eviction gives the same bounded-window
/// behavior with a plain `VecDeque` instead of pulling in a cache crate.
pub struct DedupWindow {
    capacity: usize,
    seen: HashSet<(String, u64)>,
    order: VecDeque<(String, u64)>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns `true` if this `(source, vendorSequence)` was already seen
    /// within the window (and therefore should be dropped), inserting it
    /// otherwise.
    pub fn check_and_insert(&mut self, source: &str, vendor_sequence: u64) -> bool {
        let key = (source.to_string(), vendor_sequence);
        if self.seen.contains(&key) {
            return true;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.seen.insert(key);
        false
    }
}

/// One out-of-order arrival pending release, with the wall-clock time it
/// entered the buffer so the max-skew timeout can be enforced.
struct Pending {
    envelope: Envelope,
    buffered_at: Instant,
}

/// Per-`(source, key)` reordering window (§4.2: "small reorder window
/// (default 256) holds out-of-order arrivals up to a maximum skew"). Gaps
/// older than the skew are filled with an explicit marker rather than
/// blocking the live stream forever.
pub struct ReorderBuffer {
    window: usize,
    max_skew: Duration,
    next_expected: HashMap<(String, ShardKey), u64>,
    pending: HashMap<(String, ShardKey), BTreeMap<u64, Pending>>,
}

#[derive(Debug, Clone)]
pub struct GapMarker {
    pub source: String,
    pub key: ShardKey,
    pub from_sequence: u64,
    pub to_sequence: u64,
}

impl ReorderBuffer {
    pub fn new(window: usize, max_skew: Duration) -> Self {
        Self {
            window: window.max(1),
            max_skew,
            next_expected: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Admits one envelope. Returns the envelopes now safe to release in
    /// order (possibly more than one, if this arrival filled a hole) and
    /// any gaps that had to be skipped because the buffer or skew budget
    /// was exhausted (§4.2: "older gaps are filled with explicit
    /// `GapDetected` markers").
    pub fn admit(&mut self, source: &str, envelope: Envelope) -> (Vec<Envelope>, Vec<GapMarker>) {
        let bucket_key = (source.to_string(), envelope.key());
        let seq = envelope.vendor_sequence;
        let next = *self.next_expected.entry(bucket_key.clone()).or_insert(seq);

        let mut ready = Vec::new();
        let mut gaps = Vec::new();

        if seq < next {
            // Already delivered (or superseded by a gap-skip below); drop.
            return (ready, gaps);
        }

        if seq == next {
            ready.push(envelope);
            let mut cursor = next + 1;
            if let Some(buffered) = self.pending.get_mut(&bucket_key) {
                while let Some(p) = buffered.remove(&cursor) {
                    ready.push(p.envelope);
                    cursor += 1;
                }
                if buffered.is_empty() {
                    self.pending.remove(&bucket_key);
                }
            }
            self.next_expected.insert(bucket_key, cursor);
        } else {
            let buffered = self.pending.entry(bucket_key.clone()).or_default();
            buffered.insert(seq, Pending {
                envelope,
                buffered_at: Instant::now(),
            });

            if buffered.len() > self.window {
                if let Some((&oldest_seq, _)) = buffered.iter().next() {
                    gaps.push(GapMarker {
                        source: source.to_string(),
                        key: bucket_key.1.clone(),
                        from_sequence: next,
                        to_sequence: oldest_seq,
                    });
                }
            }
        }

        // Age out any bucket whose oldest pending arrival has sat longer
        // than the max skew: the gap is permanent, advance past it so the
        // stream doesn't stall forever on a message that never arrives.
        if let Some(buffered) = self.pending.get_mut(&bucket_key) {
            if let Some((&oldest_seq, p)) = buffered.iter().next() {
                if p.buffered_at.elapsed() >= self.max_skew {
                    let skip_from = self.next_expected.get(&bucket_key).copied().unwrap_or(next);
                    gaps.push(GapMarker {
                        source: source.to_string(),
                        key: bucket_key.1.clone(),
                        from_sequence: skip_from,
                        to_sequence: oldest_seq,
                    });
                    let mut cursor = oldest_seq;
                    while let Some(p) = buffered.remove(&cursor) {
                        ready.push(p.envelope);
                        cursor += 1;
                    }
                    self.next_expected.insert(bucket_key.clone(), cursor);
                    if buffered.is_empty() {
                        self.pending.remove(&bucket_key);
                    }
                }
            }
        }

        (ready, gaps)
    }
}

/// Reference-data field-level conflict resolution (§4.2): a lower-priority
/// source's update to a field is merged only if the higher-priority source
/// has no value for that field within the staleness window.
pub struct ReferenceMerger {
    priority: Vec<String>,
    staleness_window: Duration,
    /// Per `(security, field)`, the highest-priority source that has
    /// supplied a value, and when.
    field_sources: HashMap<(String, String), (String, Instant)>,
}

impl ReferenceMerger {
    pub fn new(priority: Vec<String>, staleness_window: Duration) -> Self {
        Self {
            priority,
            staleness_window,
            field_sources: HashMap::new(),
        }
    }

    fn rank(&self, source: &str) -> usize {
        self.priority
            .iter()
            .position(|s| s.eq_ignore_ascii_case(source))
            .unwrap_or(self.priority.len())
    }

    /// Returns `true` if `source`'s value for `(security_id, field)` should
    /// be applied now.
    pub fn should_apply(&mut self, security_id: &str, field: &str, source: &str) -> bool {
        let key = (security_id.to_string(), field.to_string());
        let candidate_rank = self.rank(source);

        match self.field_sources.get(&key) {
            None => {
                self.field_sources.insert(key, (source.to_string(), Instant::now()));
                true
            }
            Some((incumbent, last_seen)) => {
                let incumbent_rank = self.rank(incumbent);
                let incumbent_stale = last_seen.elapsed() >= self.staleness_window;
                if candidate_rank <= incumbent_rank || incumbent_stale {
                    self.field_sources.insert(key, (source.to_string(), Instant::now()));
                    true
                } else {
                    false
                }
            }
        }
    }
}

/// Outcome of routing one raw message through decode → dedup → reorder.
pub enum IngestOutcome {
    /// Envelopes ready for shard dispatch, in the order they must be sent.
    Ready(Vec<Envelope>),
    /// Dropped silently (duplicate); metric-only per §7.
    Duplicate,
    /// Routed to the dead-letter sink; §7 "Decode" — never blocks the live
    /// stream.
    DecodeFailed { source: String, raw: Value },
}

pub struct IngestRouter {
    dedup: DedupWindow,
    reorder: ReorderBuffer,
    pub reference_merger: ReferenceMerger,
}

impl IngestRouter {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            dedup: DedupWindow::new(config.dedup_window),
            reorder: ReorderBuffer::new(config.reorder_window, config.reorder_max_skew),
            reference_merger: ReferenceMerger::new(
                config.reference_priority.clone(),
                config.reference_staleness_window,
            ),
        }
    }

    /// Normalizes, dedups, and reorders one raw vendor message. Gap markers
    /// produced internally are logged here (§4.2: "downstream consumers
    /// surface but do not block on") and reflected in the gap-detected
    /// metric; the caller is responsible for also emitting a
    /// `GapDetected` domain event via the publisher if desired.
    pub fn ingest(&mut self, raw: RawMessage) -> IngestOutcome {
        let envelope: Envelope = match serde_json::from_value(raw.body.clone()) {
            Ok(e) => e,
            Err(err) => {
                warn!(source = %raw.source, error = %err, "decode failure, routing to dead-letter");
                metrics::record_decode_failure();
                return IngestOutcome::DecodeFailed {
                    source: raw.source,
                    raw: raw.body,
                };
            }
        };

        if self.dedup.check_and_insert(&raw.source, raw.vendor_sequence) {
            metrics::record_duplicate_dropped();
            return IngestOutcome::Duplicate;
        }

        // Market-data ticks are exempt from reordering: §4.3 already sheds
        // them first under backpressure, so holding them up for strict
        // per-key order buys nothing and only adds latency to a type of
        // event downstream consumers already treat as best-effort.
        if envelope.event_type() == EventType::MarketPriceTick {
            return IngestOutcome::Ready(vec![envelope]);
        }

        let (ready, gaps) = self.reorder.admit(&raw.source, envelope);
        for gap in &gaps {
            metrics::record_gap_detected();
            warn!(
                source = %gap.source,
                from = gap.from_sequence,
                to = gap.to_sequence,
                "gap detected in ordered stream"
            );
        }
        IngestOutcome::Ready(ready)
    }
}

/// Exponential backoff with jitter for vendor transport errors (§4.2: base
/// 1s, cap 30s, jitter ±20%). Grounded on the same xorshift64 PRNG and
/// attempt-counter shape as the teacher's `BackoffCalculator`, scaled to
/// this router's default parameters instead of a WebSocket session's.
pub struct TransportBackoff {
    base: Duration,
    cap: Duration,
    jitter_factor: f64,
    attempt: u32,
    rng_state: u64,
}

impl TransportBackoff {
    pub fn new(base: Duration, cap: Duration, jitter_factor: f64) -> Self {
        Self {
            base,
            cap,
            jitter_factor,
            attempt: 0,
            rng_state: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64 | 1)
                .unwrap_or(0x9E3779B97F4A7C15),
        }
    }

    fn next_random(&mut self) -> f64 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        (self.rng_state as f64) / (u64::MAX as f64)
    }

    pub fn next_backoff(&mut self) -> Duration {
        let base_ms = self.base.as_millis() as f64;
        let cap_ms = self.cap.as_millis() as f64;
        let scaled = base_ms * 2f64.powi(self.attempt as i32);
        let capped = scaled.min(cap_ms);
        let jitter_range = capped * self.jitter_factor;
        let jitter = (self.next_random() * 2.0 - 1.0) * jitter_range;
        let final_ms = (capped + jitter).max(base_ms);
        self.attempt += 1;
        Duration::from_millis(final_ms as u64)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

pub fn default_backoff() -> TransportBackoff {
    TransportBackoff::new(Duration::from_secs(1), Duration::from_secs(30), 0.2)
}
