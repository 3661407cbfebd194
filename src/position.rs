//! Position Engine (C4, §4.4).
//!
//! Per-shard state machine. A `PositionBook` owns every `Position` row for
//! the keys hashed onto its shard (§4.3) and is only ever touched from that
//! shard's single-threaded loop (§5) — there is no internal locking here,
//! by construction rather than by `Mutex`.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::envelope::{Envelope, EventPayload, PositionType, Side};
use crate::error::EngineError;
use crate::ids::{BookId, BusinessDate, EventId, SecurityId};

pub const LADDER_DEPTH: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalculationStatus {
    Pending,
    Valid,
    Invalid,
    Error,
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct PositionKey {
    pub book_id: BookId,
    pub security_id: SecurityId,
    pub business_date: BusinessDate,
}

/// Delta applied by a single event, stashed so `TradeAmended`/`TradeCancelled`
/// can reverse the exact original effect (§4.4, Open Question #2) instead of
/// recomputing it from amended fields that may no longer match.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct AppliedTradeDelta {
    contractual_qty: Decimal,
    ladder_bucket: Option<(usize, bool)>, // (day index 0..4, true=receipt)
    beyond_ladder_receipt: Decimal,
    beyond_ladder_deliver: Decimal,
    settled_qty: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub key: PositionKey,
    pub contractual_qty: Decimal,
    pub settled_qty: Decimal,
    pub sd_deliver: [Decimal; LADDER_DEPTH],
    pub sd_receipt: [Decimal; LADDER_DEPTH],
    /// Settlements further out than sd4 (§4.4): credited here rather than
    /// dropped, and rolled onto sd4 as the ladder shifts left (Open
    /// Question #1 — decided: accumulate, do not discard).
    pub beyond_ladder_deliver: Decimal,
    pub beyond_ladder_receipt: Decimal,
    pub position_type: PositionType,
    pub is_hypothecatable: bool,
    pub is_reserved: bool,
    pub version: u64,
    pub last_event_id: Option<EventId>,
    pub status: CalculationStatus,
    /// Highest `vendor_sequence` seen per source, for idempotency (§4.4).
    source_watermarks: HashMap<String, u64>,
    /// Per-event deltas, keyed by `event_id`, kept only for trade events that
    /// remain amendable/cancellable.
    applied_deltas: HashMap<EventId, AppliedTradeDelta>,
}

impl Position {
    pub fn new(key: PositionKey) -> Self {
        Self {
            key,
            contractual_qty: Decimal::ZERO,
            settled_qty: Decimal::ZERO,
            sd_deliver: [Decimal::ZERO; LADDER_DEPTH],
            sd_receipt: [Decimal::ZERO; LADDER_DEPTH],
            beyond_ladder_deliver: Decimal::ZERO,
            beyond_ladder_receipt: Decimal::ZERO,
            position_type: PositionType::Trading,
            is_hypothecatable: false,
            is_reserved: false,
            version: 0,
            last_event_id: None,
            status: CalculationStatus::Pending,
            source_watermarks: HashMap::new(),
            applied_deltas: HashMap::new(),
        }
    }

    pub fn current_net_position(&self) -> Decimal {
        self.settled_qty
    }

    fn invariants_hold(&self) -> bool {
        self.sd_deliver.iter().all(|v| *v >= Decimal::ZERO)
            && self.sd_receipt.iter().all(|v| *v >= Decimal::ZERO)
            && self.beyond_ladder_deliver >= Decimal::ZERO
            && self.beyond_ladder_receipt >= Decimal::ZERO
    }

    /// Idempotency gate (§4.4): drop if this exact event id was already the
    /// last one applied, or if the source's vendor sequence has already
    /// advanced past this event.
    fn is_duplicate(&self, envelope: &Envelope) -> bool {
        if self.last_event_id == Some(envelope.event_id) {
            return true;
        }
        if let Some(&watermark) = self.source_watermarks.get(envelope.source.name()) {
            if envelope.vendor_sequence <= watermark {
                return true;
            }
        }
        false
    }

    fn bump_watermark(&mut self, envelope: &Envelope) {
        let entry = self
            .source_watermarks
            .entry(envelope.source.name().to_string())
            .or_insert(0);
        *entry = (*entry).max(envelope.vendor_sequence);
        self.last_event_id = Some(envelope.event_id);
        self.version += 1;
    }

    /// Apply a single envelope. Handles the event types that need no
    /// caller-supplied context (`SettlementAdvance`, `PositionSnapshot`,
    /// `TradeCancelled`). `TradeCreated`/`TradeAmended` are resolved by
    /// `PositionBook::apply_event`, which knows the envelope's
    /// `business_date` needed to place the ladder offset, and call
    /// `apply_resolved` directly instead of this method.
    ///
    /// Returns `Ok(true)` if state changed (a `PositionChanged` should be
    /// emitted), `Ok(false)` if the event was a no-op (duplicate or unknown
    /// type), `Err` only for a fatal overflow — invariant violations mark
    /// the position `INVALID` and return `Ok(true)` rather than erroring,
    /// per §4.4/§7.
    pub fn apply(&mut self, envelope: &Envelope) -> Result<bool, EngineError> {
        if self.is_duplicate(envelope) {
            return Ok(false);
        }

        let changed = match &envelope.payload {
            EventPayload::TradeCancelled {
                original_event_id, ..
            } => {
                if let Some(original) = self.applied_deltas.remove(original_event_id) {
                    self.reverse_delta(&original);
                    true
                } else {
                    false
                }
            }
            EventPayload::SettlementAdvance { .. } => {
                self.roll_ladder()?;
                true
            }
            EventPayload::PositionSnapshot {
                contractual_qty,
                settled_qty,
                sd_deliver,
                sd_receipt,
                position_type,
                is_hypothecatable,
                is_reserved,
                ..
            } => {
                // Overwrite, not adjust (§4.4): a resync replaces derived
                // state wholesale rather than folding in as a delta.
                self.contractual_qty = *contractual_qty;
                self.settled_qty = *settled_qty;
                self.sd_deliver = *sd_deliver;
                self.sd_receipt = *sd_receipt;
                self.beyond_ladder_deliver = Decimal::ZERO;
                self.beyond_ladder_receipt = Decimal::ZERO;
                self.position_type = *position_type;
                self.is_hypothecatable = *is_hypothecatable;
                self.is_reserved = *is_reserved;
                self.applied_deltas.clear();
                true
            }
            _ => return Ok(false),
        };

        if changed {
            self.bump_watermark(envelope);
            self.status = if self.invariants_hold() {
                CalculationStatus::Valid
            } else {
                CalculationStatus::Invalid
            };
        }

        Ok(changed)
    }

    fn overflow_error(&self) -> EngineError {
        EngineError::Overflow {
            key: format!(
                "{}:{}:{}",
                self.key.book_id, self.key.security_id, self.key.business_date
            ),
            event_id: self.last_event_id.map(|e| e.to_string()).unwrap_or_default(),
        }
    }

    fn apply_delta(&mut self, delta: &AppliedTradeDelta) {
        self.contractual_qty += delta.contractual_qty;
        if let Some((day, is_receipt)) = delta.ladder_bucket {
            if is_receipt {
                self.sd_receipt[day] += delta.contractual_qty.abs();
            } else {
                self.sd_deliver[day] += delta.contractual_qty.abs();
            }
        }
        self.beyond_ladder_receipt += delta.beyond_ladder_receipt;
        self.beyond_ladder_deliver += delta.beyond_ladder_deliver;
        self.settled_qty += delta.settled_qty;
    }

    fn reverse_delta(&mut self, delta: &AppliedTradeDelta) {
        self.contractual_qty -= delta.contractual_qty;
        if let Some((day, is_receipt)) = delta.ladder_bucket {
            if is_receipt {
                self.sd_receipt[day] -= delta.contractual_qty.abs();
            } else {
                self.sd_deliver[day] -= delta.contractual_qty.abs();
            }
        }
        self.beyond_ladder_receipt -= delta.beyond_ladder_receipt;
        self.beyond_ladder_deliver -= delta.beyond_ladder_deliver;
        self.settled_qty -= delta.settled_qty;
    }

    /// Business-day roll (§4.4): sd0 settles into `settled_qty`, the ladder
    /// shifts left one day, and sd4 is refilled from the beyond-ladder
    /// aggregate.
    fn roll_ladder(&mut self) -> Result<(), EngineError> {
        let net_today = self.sd_receipt[0] - self.sd_deliver[0];
        self.settled_qty = self
            .settled_qty
            .checked_add(net_today)
            .ok_or_else(|| self.overflow_error())?;

        for day in 0..LADDER_DEPTH - 1 {
            self.sd_deliver[day] = self.sd_deliver[day + 1];
            self.sd_receipt[day] = self.sd_receipt[day + 1];
        }
        self.sd_deliver[LADDER_DEPTH - 1] = self.beyond_ladder_deliver;
        self.sd_receipt[LADDER_DEPTH - 1] = self.beyond_ladder_receipt;
        self.beyond_ladder_deliver = Decimal::ZERO;
        self.beyond_ladder_receipt = Decimal::ZERO;
        Ok(())
    }
}

/// Builds the trade delta for a freshly created trade, resolving the ladder
/// offset against `business_date`. Kept as a free function (rather than a
/// `Position` method) because it needs no existing state — it is pure over
/// the event fields, which is what `TradeAmended` needs to recompute too.
pub fn resolve_trade_delta(
    business_date: BusinessDate,
    settlement_date: BusinessDate,
    side: Side,
    qty: Decimal,
) -> AppliedTradeDeltaPublic {
    let signed_qty = match side {
        Side::Buy => qty,
        Side::Sell => -qty,
    };
    let offset = (settlement_date - business_date).num_days();

    let mut out = AppliedTradeDeltaPublic {
        contractual_qty: signed_qty,
        ladder_bucket: None,
        beyond_ladder_receipt: Decimal::ZERO,
        beyond_ladder_deliver: Decimal::ZERO,
        settled_qty: Decimal::ZERO,
        late_settlement: false,
    };

    let is_receipt = signed_qty >= Decimal::ZERO;
    let magnitude = signed_qty.abs();

    if (0..LADDER_DEPTH as i64).contains(&offset) {
        out.ladder_bucket = Some((offset as usize, is_receipt));
    } else if offset >= LADDER_DEPTH as i64 {
        if is_receipt {
            out.beyond_ladder_receipt = magnitude;
        } else {
            out.beyond_ladder_deliver = magnitude;
        }
    } else {
        // d < 0: already due: immediate settledQty adjustment, flagged
        // LateSettlement for operator visibility (§4.4).
        out.settled_qty = signed_qty;
        out.late_settlement = true;
    }

    out
}

/// Public mirror of the private `AppliedTradeDelta` so callers building a
/// `TradeCreated` envelope can compute the delta up front (used by tests and
/// by `position_engine::apply_trade_created` below).
#[derive(Debug, Clone, Copy)]
pub struct AppliedTradeDeltaPublic {
    pub contractual_qty: Decimal,
    pub ladder_bucket: Option<(usize, bool)>,
    pub beyond_ladder_receipt: Decimal,
    pub beyond_ladder_deliver: Decimal,
    pub settled_qty: Decimal,
    pub late_settlement: bool,
}

/// Owns every `Position` row hashed onto one shard (§3 "ownership",
/// §4.3, §4.4). `apply_event` is the single mutation entry point the shard
/// loop calls.
#[derive(Debug, Default)]
pub struct PositionBook {
    positions: HashMap<PositionKey, Position>,
}

pub struct PositionChanged {
    pub key: PositionKey,
    pub version: u64,
    pub status: CalculationStatus,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &PositionKey) -> Option<&Position> {
        self.positions.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn snapshot_all(&self) -> Vec<Position> {
        self.positions.values().cloned().collect()
    }

    pub fn restore(&mut self, positions: Vec<Position>) {
        self.positions.clear();
        for p in positions {
            self.positions.insert(p.key.clone(), p);
        }
    }

    /// Applies one envelope to the position row it keys, creating the row
    /// (all zero) on first touch, per §4.4. For `TradeCreated`/`TradeAmended`
    /// the ladder-offset resolution (`resolve_trade_delta`) happens here,
    /// where `business_date` is known, rather than inside `Position::apply`.
    pub fn apply_event(
        &mut self,
        book_id: &BookId,
        security_id: &SecurityId,
        envelope: &Envelope,
    ) -> Result<Option<PositionChanged>, EngineError> {
        let key = PositionKey {
            book_id: book_id.clone(),
            security_id: security_id.clone(),
            business_date: envelope.business_date,
        };
        let position = self
            .positions
            .entry(key.clone())
            .or_insert_with(|| Position::new(key.clone()));

        let changed = match &envelope.payload {
            EventPayload::TradeCreated { fields, .. } => {
                if position.is_duplicate(envelope) {
                    false
                } else {
                    let delta = resolve_trade_delta(
                        envelope.business_date,
                        fields.settlement_date,
                        fields.side,
                        fields.qty,
                    );
                    apply_resolved(position, envelope, delta)?
                }
            }
            EventPayload::TradeAmended {
                original_event_id,
                fields,
                ..
            } => {
                if position.is_duplicate(envelope) {
                    false
                } else {
                    if let Some(original) = position.applied_deltas.remove(original_event_id) {
                        position.reverse_delta(&original);
                    }
                    let delta = resolve_trade_delta(
                        envelope.business_date,
                        fields.settlement_date,
                        fields.side,
                        fields.qty,
                    );
                    apply_resolved(position, envelope, delta)?
                }
            }
            _ => position.apply(envelope)?,
        };

        if !changed {
            return Ok(None);
        }

        Ok(Some(PositionChanged {
            key: position.key.clone(),
            version: position.version,
            status: position.status,
        }))
    }

    /// Applies an envelope to the position row already known by `key`,
    /// without re-deriving the key from `envelope.business_date`. Used for
    /// broadcast events like `SettlementAdvance` (§4.3: shard key
    /// `Security("*")`), which carry the new business date rather than any
    /// individual position's key — rolling the ladder must target the
    /// position's own existing key, not spawn a new row dated on the
    /// envelope.
    pub fn apply_at_key(
        &mut self,
        key: &PositionKey,
        envelope: &Envelope,
    ) -> Result<Option<PositionChanged>, EngineError> {
        let Some(position) = self.positions.get_mut(key) else {
            return Ok(None);
        };
        let changed = position.apply(envelope)?;
        if !changed {
            return Ok(None);
        }
        Ok(Some(PositionChanged {
            key: position.key.clone(),
            version: position.version,
            status: position.status,
        }))
    }
}

fn apply_resolved(
    position: &mut Position,
    envelope: &Envelope,
    resolved: AppliedTradeDeltaPublic,
) -> Result<bool, EngineError> {
    let delta = AppliedTradeDelta {
        contractual_qty: resolved.contractual_qty,
        ladder_bucket: resolved.ladder_bucket,
        beyond_ladder_receipt: resolved.beyond_ladder_receipt,
        beyond_ladder_deliver: resolved.beyond_ladder_deliver,
        settled_qty: resolved.settled_qty,
    };
    position
        .contractual_qty
        .checked_add(delta.contractual_qty)
        .ok_or_else(|| position.overflow_error())?;
    position.apply_delta(&delta);
    position.applied_deltas.insert(envelope.event_id, delta);
    position.bump_watermark(envelope);
    position.status = if position.invariants_hold() {
        CalculationStatus::Valid
    } else {
        CalculationStatus::Invalid
    };
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EventPayload, Source, TradeFields};
    use crate::ids::EventId;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> BusinessDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn trade_created_envelope(
        book_id: &str,
        security_id: &str,
        business_date: BusinessDate,
        settlement_date: BusinessDate,
        side: Side,
        qty: Decimal,
        event_id: EventId,
        vendor_sequence: u64,
    ) -> Envelope {
        Envelope {
            event_id,
            source: Source::Internal("test"),
            ingest_timestamp: chrono::Utc::now(),
            business_date,
            vendor_sequence,
            idempotency_token: event_id.to_string(),
            schema_version: crate::envelope::CURRENT_SCHEMA_VERSION,
            payload: EventPayload::TradeCreated {
                book_id: BookId::from(book_id),
                security_id: SecurityId::from(security_id),
                fields: TradeFields {
                    side,
                    qty,
                    trade_date: business_date,
                    settlement_date,
                },
            },
            extra: HashMap::new(),
        }
    }

    /// Scenario 1 (spec §8): simple buy, T+2.
    #[test]
    fn scenario_simple_buy_t_plus_2() {
        let mut book = PositionBook::new();
        let env = trade_created_envelope(
            "EQUITY-01",
            "SEC-EQ-001",
            date(2023, 6, 15),
            date(2023, 6, 17),
            Side::Buy,
            Decimal::new(1000, 0),
            EventId::new(),
            1,
        );
        let changed = book
            .apply_event(&BookId::from("EQUITY-01"), &SecurityId::from("SEC-EQ-001"), &env)
            .unwrap()
            .expect("position changed");

        let pos = book.get(&changed.key).unwrap();
        assert_eq!(pos.contractual_qty, Decimal::new(1000, 0));
        assert_eq!(pos.settled_qty, Decimal::ZERO);
        assert_eq!(pos.sd_receipt[2], Decimal::new(1000, 0));
        assert_eq!(pos.sd_deliver[2], Decimal::ZERO);
        assert_eq!(pos.current_net_position(), Decimal::ZERO);
    }

    /// Scenario 2 (spec §8): settlement roll.
    #[test]
    fn scenario_settlement_roll() {
        let mut book = PositionBook::new();
        let book_id = BookId::from("EQUITY-01");
        let security_id = SecurityId::from("SEC-EQ-001");
        let trade = trade_created_envelope(
            "EQUITY-01",
            "SEC-EQ-001",
            date(2023, 6, 15),
            date(2023, 6, 17),
            Side::Buy,
            Decimal::new(1000, 0),
            EventId::new(),
            1,
        );
        book.apply_event(&book_id, &security_id, &trade).unwrap();

        let key = PositionKey {
            book_id,
            security_id,
            business_date: date(2023, 6, 15),
        };

        // Advance business date twice to roll sd2 -> sd0. A roll always
        // targets the position's own existing key, never the envelope's
        // (new) business date, so `apply_at_key` is used here exactly as
        // the shard loop does.
        for (i, d) in [date(2023, 6, 16), date(2023, 6, 17)].into_iter().enumerate() {
            let advance = Envelope {
                event_id: EventId::new(),
                source: Source::Internal("clock"),
                ingest_timestamp: chrono::Utc::now(),
                business_date: d,
                vendor_sequence: 2 + i as u64,
                idempotency_token: format!("advance-{i}"),
                schema_version: crate::envelope::CURRENT_SCHEMA_VERSION,
                payload: EventPayload::SettlementAdvance { business_date: d },
                extra: HashMap::new(),
            };
            book.apply_at_key(&key, &advance).unwrap();
        }

        let pos = book.get(&key).unwrap();
        assert_eq!(pos.settled_qty, Decimal::new(1000, 0));
        assert_eq!(pos.sd_receipt[0], Decimal::ZERO);
        assert_eq!(pos.sd_deliver[0], Decimal::ZERO);
        assert_eq!(pos.current_net_position(), Decimal::new(1000, 0));
    }

    /// Scenario 6 (spec §8): duplicate event is a no-op.
    #[test]
    fn scenario_duplicate_event_is_noop() {
        let mut book = PositionBook::new();
        let book_id = BookId::from("EQUITY-01");
        let security_id = SecurityId::from("SEC-EQ-001");
        let event_id = EventId::new();
        let trade = trade_created_envelope(
            "EQUITY-01",
            "SEC-EQ-001",
            date(2023, 6, 15),
            date(2023, 6, 17),
            Side::Buy,
            Decimal::new(1000, 0),
            event_id,
            1,
        );
        let first = book.apply_event(&book_id, &security_id, &trade).unwrap();
        assert!(first.is_some());
        let second = book.apply_event(&book_id, &security_id, &trade).unwrap();
        assert!(second.is_none(), "duplicate must not re-emit PositionChanged");

        let key = PositionKey {
            book_id,
            security_id,
            business_date: date(2023, 6, 15),
        };
        let pos = book.get(&key).unwrap();
        assert_eq!(pos.contractual_qty, Decimal::new(1000, 0));
        assert_eq!(pos.version, 1);
    }

    #[test]
    fn negative_ladder_marks_invalid_not_panic() {
        let mut pos = Position::new(PositionKey {
            book_id: BookId::from("B"),
            security_id: SecurityId::from("S"),
            business_date: date(2023, 1, 1),
        });
        pos.sd_deliver[0] = Decimal::new(-1, 0);
        assert!(!pos.invariants_hold());
    }
}
