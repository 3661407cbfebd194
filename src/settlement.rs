//! Settlement Ladder & Projection (C5, §4.5).
//!
//! A pure function of a `Position` snapshot: no state of its own, no I/O.
//! Scheduled synchronously on the same shard loop immediately after every
//! `PositionChanged` (§4.5, §5 — "same-loop, synchronous").

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::position::{CalculationStatus, Position, LADDER_DEPTH};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SettlementProjection {
    pub net_settlement_today: Decimal,
    pub net_settlement: Decimal,
    pub projected_settled_qty: Decimal,
    pub projected_position: Decimal,
    pub total_deliveries: Decimal,
    pub total_receipts: Decimal,
    pub status: CalculationStatus,
}

/// Recomputes the derived ladder fields from a `Position`. Never stores
/// anything independently (§3's invariant) — callers keep the result as a
/// throwaway projection, recomputed on every change.
pub fn project(position: &Position) -> SettlementProjection {
    let net_settlement_today = position.sd_receipt[0] - position.sd_deliver[0];
    let net_settlement: Decimal = (0..LADDER_DEPTH)
        .map(|n| position.sd_receipt[n] - position.sd_deliver[n])
        .sum();
    let total_receipts: Decimal = position.sd_receipt.iter().copied().sum();
    let total_deliveries: Decimal = position.sd_deliver.iter().copied().sum();

    let status = match position.status {
        CalculationStatus::Invalid => CalculationStatus::Invalid,
        CalculationStatus::Stale => CalculationStatus::Stale,
        _ => CalculationStatus::Valid,
    };

    SettlementProjection {
        net_settlement_today,
        net_settlement,
        projected_settled_qty: position.settled_qty + net_settlement_today,
        projected_position: position.settled_qty + net_settlement,
        total_deliveries,
        total_receipts,
        status,
    }
}
