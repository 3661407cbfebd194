//! Event Envelope & Codec (C1, §4.1).
//!
//! Every domain event is wrapped in an `Envelope` carrying the fields §4.1
//! enumerates. The payload is a closed enum rather than a generic type
//! parameter: the event-type set is fixed by the spec, and a closed enum
//! lets the position engine and ingest router match exhaustively instead of
//! downcasting `dyn Any`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{
    AggregationUnitId, BookId, BusinessDate, ClientId, EventId, LocateId, MarketCode, SecurityId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionType {
    Trading,
    Financing,
    Client,
    Proprietary,
    MarketMaking,
    Hedging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocateType {
    ShortSell,
    PreBorrow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    LongSell,
    ShortSell,
}

/// Who produced an event: a named vendor feed, or an internal service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Source {
    Vendor(String),
    Internal(&'static str),
}

impl Source {
    pub fn name(&self) -> &str {
        match self {
            Source::Vendor(s) => s,
            Source::Internal(s) => s,
        }
    }
}

/// The sharding key carried by an event (§4.3). Determines which shard owns
/// the mutation and the FIFO ordering domain it participates in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardKey {
    Security(SecurityId),
    Position(BookId, SecurityId),
    Limit(LimitEntity, SecurityId),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitEntity {
    Client(ClientId),
    AggregationUnit(AggregationUnitId),
}

impl ShardKey {
    /// Stable 64-bit hash independent of process/run (FNV-1a over a
    /// canonical string form), used by the shard dispatcher (§4.3) to
    /// assign a fixed, reproducible shard for a given key.
    pub fn stable_hash(&self) -> u64 {
        let canonical = match self {
            ShardKey::Security(s) => format!("sec:{}", s.as_str()),
            ShardKey::Position(b, s) => format!("pos:{}:{}", b.as_str(), s.as_str()),
            ShardKey::Limit(LimitEntity::Client(c), s) => format!("lim:c:{}:{}", c.as_str(), s.as_str()),
            ShardKey::Limit(LimitEntity::AggregationUnit(a), s) => {
                format!("lim:a:{}:{}", a.as_str(), s.as_str())
            }
        };
        fnv1a64(canonical.as_bytes())
    }
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeFields {
    pub side: Side,
    pub qty: Decimal,
    pub trade_date: BusinessDate,
    pub settlement_date: BusinessDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractFields {
    pub contract_id: String,
    pub qty: Decimal,
    pub borrowed: bool,
    pub repo_pledged: bool,
    pub financing_swap: bool,
    pub external_lender_available: bool,
    pub cross_border_eligible: bool,
    pub slab_lending_out: bool,
    pub pay_to_hold: bool,
    pub reserved_client_asset: bool,
    pub corporate_action_locked: bool,
    pub hypothecatable: bool,
}

/// Closed set of event types (§4.1). The payload below carries the same
/// information; this is kept as an explicit discriminant because §4.1
/// calls it out by name and downstream consumers match on it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    TradeCreated,
    TradeAmended,
    TradeCancelled,
    PositionSnapshot,
    ContractOpened,
    ContractClosed,
    SettlementAdvance,
    ReferenceDataUpsert,
    MarketPriceTick,
    LocateRequested,
    LocateDecided,
    OrderValidateRequested,
    LimitOverride,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    TradeCreated {
        book_id: BookId,
        security_id: SecurityId,
        fields: TradeFields,
    },
    TradeAmended {
        book_id: BookId,
        security_id: SecurityId,
        original_event_id: EventId,
        fields: TradeFields,
    },
    TradeCancelled {
        book_id: BookId,
        security_id: SecurityId,
        original_event_id: EventId,
    },
    PositionSnapshot {
        book_id: BookId,
        security_id: SecurityId,
        contractual_qty: Decimal,
        settled_qty: Decimal,
        sd_deliver: [Decimal; 5],
        sd_receipt: [Decimal; 5],
        position_type: PositionType,
        is_hypothecatable: bool,
        is_reserved: bool,
    },
    ContractOpened {
        security_id: SecurityId,
        fields: ContractFields,
    },
    ContractClosed {
        security_id: SecurityId,
        contract_id: String,
    },
    SettlementAdvance {
        business_date: BusinessDate,
    },
    ReferenceDataUpsert {
        security_id: SecurityId,
        market: MarketCode,
        fields: HashMap<String, Value>,
    },
    MarketPriceTick {
        security_id: SecurityId,
        price: Decimal,
    },
    LocateRequested {
        locate_id: LocateId,
        security_id: SecurityId,
        client_id: ClientId,
        requestor_id: String,
        requested_quantity: Decimal,
        locate_type: LocateType,
    },
    LocateDecided {
        locate_id: LocateId,
        approved: bool,
        manual: bool,
    },
    OrderValidateRequested {
        order_id: String,
        security_id: SecurityId,
        client_id: ClientId,
        aggregation_unit_id: AggregationUnitId,
        order_type: OrderType,
        quantity: Decimal,
    },
    LimitOverride {
        entity: LimitEntity,
        security_id: SecurityId,
        business_date: BusinessDate,
        long_sell_limit: Option<Decimal>,
        short_sell_limit: Option<Decimal>,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::TradeCreated { .. } => EventType::TradeCreated,
            EventPayload::TradeAmended { .. } => EventType::TradeAmended,
            EventPayload::TradeCancelled { .. } => EventType::TradeCancelled,
            EventPayload::PositionSnapshot { .. } => EventType::PositionSnapshot,
            EventPayload::ContractOpened { .. } => EventType::ContractOpened,
            EventPayload::ContractClosed { .. } => EventType::ContractClosed,
            EventPayload::SettlementAdvance { .. } => EventType::SettlementAdvance,
            EventPayload::ReferenceDataUpsert { .. } => EventType::ReferenceDataUpsert,
            EventPayload::MarketPriceTick { .. } => EventType::MarketPriceTick,
            EventPayload::LocateRequested { .. } => EventType::LocateRequested,
            EventPayload::LocateDecided { .. } => EventType::LocateDecided,
            EventPayload::OrderValidateRequested { .. } => EventType::OrderValidateRequested,
            EventPayload::LimitOverride { .. } => EventType::LimitOverride,
        }
    }

    /// The shard key this payload routes on (§4.3).
    pub fn shard_key(&self) -> ShardKey {
        match self {
            EventPayload::TradeCreated { book_id, security_id, .. }
            | EventPayload::TradeAmended { book_id, security_id, .. }
            | EventPayload::TradeCancelled { book_id, security_id, .. }
            | EventPayload::PositionSnapshot { book_id, security_id, .. } => {
                ShardKey::Position(book_id.clone(), security_id.clone())
            }
            EventPayload::ContractOpened { security_id, .. }
            | EventPayload::ContractClosed { security_id, .. }
            | EventPayload::ReferenceDataUpsert { security_id, .. }
            | EventPayload::MarketPriceTick { security_id, .. }
            | EventPayload::LocateRequested { security_id, .. } => {
                ShardKey::Security(security_id.clone())
            }
            EventPayload::SettlementAdvance { .. } => {
                // Broadcast event; callers fan this out to every shard rather
                // than routing it through the dispatcher's key hash.
                ShardKey::Security(SecurityId::new("*"))
            }
            EventPayload::LocateDecided { .. } => ShardKey::Security(SecurityId::new("*")),
            EventPayload::OrderValidateRequested {
                client_id,
                security_id,
                ..
            } => ShardKey::Limit(LimitEntity::Client(client_id.clone()), security_id.clone()),
            EventPayload::LimitOverride {
                entity,
                security_id,
                ..
            } => ShardKey::Limit(entity.clone(), security_id.clone()),
        }
    }
}

/// Canonical envelope wrapping every event flowing through the engine
/// (§4.1). `extra` preserves unknown/forward-compatible fields from the
/// wire format without participating in equality, per §4.1's schema
/// versioning note.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event_id: EventId,
    pub source: Source,
    pub ingest_timestamp: DateTime<Utc>,
    pub business_date: BusinessDate,
    pub vendor_sequence: u64,
    pub idempotency_token: String,
    pub schema_version: u16,
    pub payload: EventPayload,
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.event_id == other.event_id
            && self.source == other.source
            && self.ingest_timestamp == other.ingest_timestamp
            && self.business_date == other.business_date
            && self.vendor_sequence == other.vendor_sequence
            && self.idempotency_token == other.idempotency_token
            && self.schema_version == other.schema_version
            && self.payload == other.payload
        // `extra` intentionally excluded.
    }
}

impl Envelope {
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    pub fn key(&self) -> ShardKey {
        self.payload.shard_key()
    }
}

pub const CURRENT_SCHEMA_VERSION: u16 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extra_fields_excluded_from_equality() {
        let mut a = sample_envelope();
        let mut b = sample_envelope();
        a.extra.insert("vendor_note".into(), Value::String("x".into()));
        b.extra.insert("vendor_note".into(), Value::String("y".into()));
        assert_eq!(a, b);
    }

    #[test]
    fn stable_hash_is_deterministic() {
        let k1 = ShardKey::Position(BookId::from("EQUITY-01"), SecurityId::from("SEC-EQ-001"));
        let k2 = ShardKey::Position(BookId::from("EQUITY-01"), SecurityId::from("SEC-EQ-001"));
        assert_eq!(k1.stable_hash(), k2.stable_hash());
    }

    fn sample_envelope() -> Envelope {
        Envelope {
            event_id: EventId::new(),
            source: Source::Vendor("INTERNAL".into()),
            ingest_timestamp: Utc::now(),
            business_date: chrono::NaiveDate::from_ymd_opt(2023, 6, 15).unwrap(),
            vendor_sequence: 1,
            idempotency_token: "t1".into(),
            schema_version: CURRENT_SCHEMA_VERSION,
            payload: EventPayload::TradeCreated {
                book_id: BookId::from("EQUITY-01"),
                security_id: SecurityId::from("SEC-EQ-001"),
                fields: TradeFields {
                    side: Side::Buy,
                    qty: Decimal::new(1000, 0),
                    trade_date: chrono::NaiveDate::from_ymd_opt(2023, 6, 15).unwrap(),
                    settlement_date: chrono::NaiveDate::from_ymd_opt(2023, 6, 17).unwrap(),
                },
            },
            extra: HashMap::new(),
        }
    }
}
