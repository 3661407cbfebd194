//! Short-Sell Validator (C8, §4.8).
//!
//! Synchronous, hot-path RPC: cache lookup → reserve (aggregation-unit
//! first, then client) → reply, with a hard p99 ≤ 150 ms budget. Every
//! limit row is already in memory (owned by the shard's `LimitBook`) so
//! this module performs no I/O of its own — persistence of the resulting
//! `OrderValidated` event is the publisher's job, acknowledged after reply
//! (§4.8(b)).

use std::time::Instant;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::bulkhead::Bulkhead;
use crate::envelope::OrderType;
use crate::error::{HotPathError, RejectionReason};
use crate::ids::{AggregationUnitId, BusinessDate, ClientId, ReservationId, SecurityId, ValidationId};
use crate::limits::{CheckOutcome, LimitBook, OrderSide};
use crate::telemetry::LatencyHistogram;

#[derive(Debug, Clone)]
pub struct ValidationRequest {
    pub validation_id: ValidationId,
    pub order_id: String,
    pub security_id: SecurityId,
    pub client_id: ClientId,
    pub aggregation_unit_id: AggregationUnitId,
    pub business_date: BusinessDate,
    pub order_type: OrderType,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ValidationStatus {
    Approved { reservation_ids: Vec<ReservationId> },
    Rejected { reason: RejectionReasonWire },
    Error { code: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RejectionReasonWire {
    InsufficientClientLimit,
    InsufficientAuLimit,
    UnknownSecurity,
    InactiveClient,
    MarketClosed,
}

impl From<RejectionReason> for RejectionReasonWire {
    fn from(r: RejectionReason) -> Self {
        match r {
            RejectionReason::InsufficientClientLimit => Self::InsufficientClientLimit,
            RejectionReason::InsufficientAuLimit => Self::InsufficientAuLimit,
            RejectionReason::UnknownSecurity => Self::UnknownSecurity,
            RejectionReason::InactiveClient => Self::InactiveClient,
            RejectionReason::MarketClosed => Self::MarketClosed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationReply {
    pub validation_id: ValidationId,
    pub status: ValidationStatus,
    pub processing_time_us: u64,
}

pub struct ShortSellValidator {
    bulkhead: Bulkhead,
    deadline: std::time::Duration,
    latency: LatencyHistogram,
}

impl ShortSellValidator {
    pub fn new(bulkhead_capacity: usize, deadline: std::time::Duration) -> Self {
        Self {
            bulkhead: Bulkhead::new(bulkhead_capacity),
            deadline,
            latency: LatencyHistogram::new(),
        }
    }

    pub fn latency_histogram(&self) -> &LatencyHistogram {
        &self.latency
    }

    pub fn in_flight(&self) -> usize {
        self.bulkhead.in_flight()
    }

    /// Runs the validation pipeline against `limits` (the shard's in-memory
    /// `LimitBook`). Must be called from the owning shard's loop — there is
    /// no locking here because `LimitBook` is not `Sync`-shared.
    pub fn validate(&self, limits: &mut LimitBook, req: &ValidationRequest) -> ValidationReply {
        let start = Instant::now();
        let permit = match self.bulkhead.try_enter() {
            Ok(p) => p,
            Err(e) => return self.finish(req, start, error_status(e)),
        };

        if start.elapsed() > self.deadline {
            drop(permit);
            return self.finish(req, start, error_status(HotPathError::Timeout));
        }

        let side = match req.order_type {
            OrderType::LongSell => OrderSide::LongSell,
            OrderType::ShortSell => OrderSide::ShortSell,
        };

        // Aggregation-unit first (the broader resource, §4.8.2): reserving
        // order matters because if the client-side reservation were taken
        // first and the AU check then failed, we'd need to release the
        // client reservation anyway — starting with the broader resource
        // means a failure there never touches client state at all.
        let reservation_id_au = ReservationId::new();
        let au_result = limits.reserve_au(
            req.aggregation_unit_id.clone(),
            req.security_id.clone(),
            req.business_date,
            side,
            req.quantity,
            reservation_id_au,
        );

        let au_used = match au_result {
            Ok(used) => used,
            Err(CheckOutcome::Insufficient) => {
                drop(permit);
                return self.finish(
                    req,
                    start,
                    ValidationStatus::Rejected {
                        reason: RejectionReason::InsufficientAuLimit.into(),
                    },
                );
            }
            Err(CheckOutcome::Ok) => unreachable!("reserve only errors with Insufficient"),
        };
        let _ = au_used;

        let reservation_id_client = ReservationId::new();
        let client_result = limits.reserve_client(
            req.client_id.clone(),
            req.security_id.clone(),
            req.business_date,
            side,
            req.quantity,
            reservation_id_client,
        );

        match client_result {
            Ok(_) => {
                drop(permit);
                self.finish(
                    req,
                    start,
                    ValidationStatus::Approved {
                        reservation_ids: vec![reservation_id_au, reservation_id_client],
                    },
                )
            }
            Err(CheckOutcome::Insufficient) => {
                // Compensate: release the AU reservation we already took.
                limits.release(reservation_id_au);
                drop(permit);
                self.finish(
                    req,
                    start,
                    ValidationStatus::Rejected {
                        reason: RejectionReason::InsufficientClientLimit.into(),
                    },
                )
            }
            Err(CheckOutcome::Ok) => unreachable!("reserve only errors with Insufficient"),
        }
    }

    fn finish(
        &self,
        req: &ValidationRequest,
        start: Instant,
        status: ValidationStatus,
    ) -> ValidationReply {
        let elapsed = start.elapsed();
        self.latency.record_duration(elapsed);
        crate::telemetry::metrics::record_validation(status_label(&status));
        ValidationReply {
            validation_id: req.validation_id,
            status,
            processing_time_us: elapsed.as_micros() as u64,
        }
    }
}

fn error_status(e: HotPathError) -> ValidationStatus {
    ValidationStatus::Error { code: e.as_code() }
}

fn status_label(status: &ValidationStatus) -> &'static str {
    match status {
        ValidationStatus::Approved { .. } => "approved",
        ValidationStatus::Rejected { .. } => "rejected",
        ValidationStatus::Error { .. } => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::time::Duration;

    fn date() -> BusinessDate {
        NaiveDate::from_ymd_opt(2023, 6, 15).unwrap()
    }

    fn setup(client_short: Decimal, au_short: Decimal) -> (LimitBook, ClientId, AggregationUnitId, SecurityId) {
        let mut limits = LimitBook::new();
        let client = ClientId::from("CP-00001");
        let au = AggregationUnitId::from("AU-1");
        let security = SecurityId::from("SEC-EQ-001");
        limits.upsert_client_limit(client.clone(), security.clone(), date(), None, Some(client_short));
        limits.upsert_au_limit(au.clone(), security.clone(), date(), None, Some(au_short));
        (limits, client, au, security)
    }

    /// Scenario 3 (spec §8).
    #[test]
    fn scenario_approved_short_sell() {
        let (mut limits, client, au, security) =
            setup(Decimal::new(500, 0), Decimal::new(10_000, 0));
        let validator = ShortSellValidator::new(256, Duration::from_millis(150));
        let req = ValidationRequest {
            validation_id: ValidationId::new(),
            order_id: "O-1".into(),
            security_id: security.clone(),
            client_id: client.clone(),
            aggregation_unit_id: au.clone(),
            business_date: date(),
            order_type: OrderType::ShortSell,
            quantity: Decimal::new(300, 0),
        };
        let reply = validator.validate(&mut limits, &req);
        match reply.status {
            ValidationStatus::Approved { reservation_ids } => {
                assert_eq!(reservation_ids.len(), 2);
            }
            other => panic!("expected approved, got {other:?}"),
        }
        assert_eq!(
            limits.client_limit(&client, &security, date()).unwrap().short_sell_used,
            Decimal::new(300, 0)
        );
        assert_eq!(
            limits.au_limit(&au, &security, date()).unwrap().short_sell_used,
            Decimal::new(300, 0)
        );
    }

    /// Scenario 4 (spec §8): client limit insufficient, AU sufficient ->
    /// rejected, and the AU reservation must be released (no mutation on
    /// either side).
    #[test]
    fn scenario_rejected_releases_au_reservation() {
        let (mut limits, client, au, security) = setup(Decimal::new(200, 0), Decimal::new(10_000, 0));
        let validator = ShortSellValidator::new(256, Duration::from_millis(150));
        let req = ValidationRequest {
            validation_id: ValidationId::new(),
            order_id: "O-2".into(),
            security_id: security.clone(),
            client_id: client.clone(),
            aggregation_unit_id: au.clone(),
            business_date: date(),
            order_type: OrderType::ShortSell,
            quantity: Decimal::new(300, 0),
        };
        let reply = validator.validate(&mut limits, &req);
        assert_eq!(
            reply.status,
            ValidationStatus::Rejected {
                reason: RejectionReasonWire::InsufficientClientLimit
            }
        );
        assert_eq!(
            limits.client_limit(&client, &security, date()).unwrap().short_sell_used,
            Decimal::ZERO
        );
        assert_eq!(
            limits.au_limit(&au, &security, date()).unwrap().short_sell_used,
            Decimal::ZERO
        );
    }

    #[test]
    fn bulkhead_busy_replies_error_without_blocking() {
        let validator = ShortSellValidator::new(1, Duration::from_millis(150));
        let mut limits = LimitBook::new();
        let _permit = validator.bulkhead.try_enter().unwrap();
        let req = ValidationRequest {
            validation_id: ValidationId::new(),
            order_id: "O-3".into(),
            security_id: SecurityId::from("SEC-X"),
            client_id: ClientId::from("CP-X"),
            aggregation_unit_id: AggregationUnitId::from("AU-X"),
            business_date: date(),
            order_type: OrderType::ShortSell,
            quantity: Decimal::new(1, 0),
        };
        let reply = validator.validate(&mut limits, &req);
        assert_eq!(reply.status, ValidationStatus::Error { code: "BUSY" });
    }
}
