//! Publisher (C10, §4.10).
//!
//! Fan-out of derived events onto an in-process bus. Uses
//! `tokio::sync::broadcast`, the same primitive the teacher uses for its
//! `WsServerEvent` fan-out in `main.rs` — at-least-once, per-key ordering
//! preserved because a single shard only ever publishes its own key's
//! events in the order it produced them. Batches by count or flush
//! interval, whichever comes first (§4.10: default 32 events / 5 ms).

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::ids::{AggregationUnitId, BusinessDate, ClientId, EventId, LocateId, ReservationId, SecurityId};
use crate::inventory::CalculationType;
use crate::position::{CalculationStatus, PositionKey};

#[derive(Debug, Clone, Serialize)]
pub enum DomainEvent {
    PositionChanged {
        key: PositionKey,
        version: u64,
        status: CalculationStatus,
    },
    InventoryChanged {
        security_id: SecurityId,
        business_date: BusinessDate,
        calculation_type: CalculationType,
        value: Decimal,
    },
    LimitChanged {
        entity: LimitEntityWire,
        security_id: SecurityId,
        business_date: BusinessDate,
        limit: Decimal,
        used: Decimal,
    },
    LocateDecided {
        locate_id: LocateId,
        state: String,
        reservation_id: Option<ReservationId>,
    },
    OrderValidated {
        order_id: String,
        status: String,
        reservation_ids: Vec<ReservationId>,
        reason: Option<String>,
    },
    PositionDrift {
        key: PositionKey,
        detail: String,
    },
    PositionInvalid {
        key: PositionKey,
        detail: String,
    },
    GapDetected {
        source: String,
        key: String,
        from_sequence: u64,
        to_sequence: u64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub enum LimitEntityWire {
    Client(ClientId),
    AggregationUnit(AggregationUnitId),
}

impl DomainEvent {
    /// Idempotent consumer key (§4.10): `(eventType, key, version)`.
    /// Non-versioned events (locate/order/gap) use a synthetic version of 0
    /// since each already carries a globally unique id in its key.
    fn idempotent_key(&self) -> (&'static str, String, u64) {
        match self {
            DomainEvent::PositionChanged { key, version, .. } => {
                ("PositionChanged", format!("{}:{}:{}", key.book_id, key.security_id, key.business_date), *version)
            }
            DomainEvent::InventoryChanged {
                security_id,
                business_date,
                calculation_type,
                ..
            } => (
                "InventoryChanged",
                format!("{security_id}:{business_date}:{calculation_type:?}"),
                0,
            ),
            DomainEvent::LimitChanged {
                security_id,
                business_date,
                ..
            } => ("LimitChanged", format!("{security_id}:{business_date}"), 0),
            DomainEvent::LocateDecided { locate_id, .. } => ("LocateDecided", locate_id.to_string(), 0),
            DomainEvent::OrderValidated { order_id, .. } => ("OrderValidated", order_id.clone(), 0),
            DomainEvent::PositionDrift { key, .. } => {
                ("PositionDrift", format!("{}:{}:{}", key.book_id, key.security_id, key.business_date), 0)
            }
            DomainEvent::PositionInvalid { key, .. } => {
                ("PositionInvalid", format!("{}:{}:{}", key.book_id, key.security_id, key.business_date), 0)
            }
            DomainEvent::GapDetected { source, key, .. } => {
                ("GapDetected", format!("{source}:{key}"), 0)
            }
        }
    }
}

pub struct PublisherConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
}

/// Batches `DomainEvent`s per §4.10 and flushes to the broadcast channel.
/// The idempotency map means a caller retrying a publish for the same
/// `(eventType, key, version)` after a crash mid-flush is harmless: the
/// duplicate is dropped rather than re-delivered.
pub struct Publisher {
    tx: broadcast::Sender<DomainEvent>,
    buffer: Vec<DomainEvent>,
    batch_size: usize,
    flush_interval: Duration,
    last_flush: Instant,
    last_published_version: HashMap<(&'static str, String), u64>,
}

impl Publisher {
    pub fn new(config: PublisherConfig) -> (Self, broadcast::Receiver<DomainEvent>) {
        let (tx, rx) = broadcast::channel(4096);
        (
            Self {
                tx,
                buffer: Vec::with_capacity(config.batch_size),
                batch_size: config.batch_size,
                flush_interval: config.flush_interval,
                last_flush: Instant::now(),
                last_published_version: HashMap::new(),
            },
            rx,
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }

    /// Enqueues an event, deduping against `(eventType, key, version)`
    /// before it ever reaches the buffer, and flushes if the batch is full
    /// or the flush interval has elapsed.
    pub fn publish(&mut self, event: DomainEvent) {
        let (event_type, key, version) = event.idempotent_key();
        let dedup_key = (event_type, key);
        if let Some(&last) = self.last_published_version.get(&dedup_key) {
            if version != 0 && version <= last {
                return;
            }
        }
        self.last_published_version.insert(dedup_key, version);
        self.buffer.push(event);

        if self.buffer.len() >= self.batch_size || self.last_flush.elapsed() >= self.flush_interval {
            self.flush();
        }
    }

    /// Forces out whatever is buffered, regardless of batch/interval state.
    /// At-least-once: a `send` error (no subscribers) is not propagated as
    /// a failure — downstream consumers that aren't listening yet simply
    /// miss events, the same tolerance the teacher's `broadcast::Sender`
    /// usage assumes for `WsServerEvent`.
    pub fn flush(&mut self) {
        for event in self.buffer.drain(..) {
            let _ = self.tx.send(event);
        }
        self.last_flush = Instant::now();
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Helper used by operators/tests to render a flushed event's wall-clock
/// arrival time without threading `Utc::now()` through every call site.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}
