//! Locate Workflow (C9, §4.9).
//!
//! A rule-evaluated state machine: `Pending -> AutoApproved | AutoRejected |
//! ManualReview -> (ManualApproved | ManualRejected) -> Expired`. Rules are
//! data — an ordered list sorted by `priority`, re-evaluated fresh per
//! request — rather than a hosted BPMN engine (§9's "framework-bound
//! patterns to re-architect"). Conditions/actions are pure over a context
//! map, matching §4.9's "must not perform I/O" contract.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::envelope::LocateType;
use crate::error::LocateRejectionReason;
use crate::ids::{ClientId, LocateId, MarketCode, ReservationId, SecurityId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocateState {
    Pending,
    AutoApproved,
    AutoRejected,
    ManualReview,
    ManualApproved,
    ManualRejected,
    Expired,
}

#[derive(Debug, Clone)]
pub struct LocateRequest {
    pub locate_id: LocateId,
    pub security_id: SecurityId,
    pub client_id: ClientId,
    pub requestor_id: String,
    pub requested_quantity: Decimal,
    pub locate_type: LocateType,
    pub request_timestamp: DateTime<Utc>,
}

/// Context a rule condition/action evaluates over (§4.9). Deliberately a
/// flat struct rather than a `HashMap<String, Value>` bag: the field set is
/// closed and known, and a struct lets the rule DSL below be type-checked
/// instead of stringly keyed.
#[derive(Debug, Clone)]
pub struct RuleContext {
    pub market: MarketCode,
    pub security_id: SecurityId,
    pub client_id: ClientId,
    pub requested_qty: Decimal,
    pub available_qty: Decimal,
    pub client_long_position: Decimal,
    pub now: DateTime<Utc>,
}

/// A condition in the locate rule DSL (§4.9: "builder-style rule DSL is
/// sufficient — this spec does not mandate a specific syntax").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RuleCondition {
    QuantityLte(Decimal),
    AvailableAtLeastTimesRequested(f64),
    ClientLongPositionGte(Decimal),
    And(Vec<RuleCondition>),
    Or(Vec<RuleCondition>),
    Always,
}

impl RuleCondition {
    pub fn evaluate(&self, ctx: &RuleContext) -> bool {
        match self {
            RuleCondition::QuantityLte(max) => ctx.requested_qty <= *max,
            RuleCondition::AvailableAtLeastTimesRequested(ratio) => {
                let needed = ctx.requested_qty * Decimal::try_from(*ratio).unwrap_or(Decimal::ZERO);
                ctx.available_qty >= needed
            }
            RuleCondition::ClientLongPositionGte(min) => ctx.client_long_position >= *min,
            RuleCondition::And(conds) => conds.iter().all(|c| c.evaluate(ctx)),
            RuleCondition::Or(conds) => conds.iter().any(|c| c.evaluate(ctx)),
            RuleCondition::Always => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RuleAction {
    Approve { terminal: bool },
    Reject { terminal: bool },
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocateRule {
    pub market: MarketCode,
    pub rule_type: String,
    pub priority: i32,
    pub condition: RuleCondition,
    pub action: RuleAction,
    pub effective_from: DateTime<Utc>,
    pub effective_to: Option<DateTime<Utc>>,
    pub status: RuleStatus,
    /// Reservation expiry override for this rule's approvals; falls back to
    /// the engine-wide default (§4.9 "configurable per rule").
    pub expiry_hours: Option<i64>,
}

impl LocateRule {
    fn is_in_effect(&self, now: DateTime<Utc>) -> bool {
        self.status == RuleStatus::Active
            && self.effective_from <= now
            && self.effective_to.map(|to| now < to).unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    AutoApproved { expiry_hours: i64 },
    AutoRejected { reason: LocateRejectionReason },
    PendingManualReview,
}

/// Evaluates the ordered, active rule list for `ctx.market` against `ctx`
/// (§4.9): rules are tried in descending `priority`; the first whose
/// condition is true executes its action; if it's `terminal` that decides
/// the request, otherwise evaluation continues to the next rule. No
/// deciding rule -> manual review.
pub fn evaluate(rules: &[LocateRule], ctx: &RuleContext, default_expiry_hours: i64) -> Decision {
    let mut ordered: Vec<&LocateRule> = rules
        .iter()
        .filter(|r| r.market.as_str() == ctx.market.as_str() && r.is_in_effect(ctx.now))
        .collect();
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

    for rule in ordered {
        if !rule.condition.evaluate(ctx) {
            continue;
        }
        match &rule.action {
            RuleAction::Approve { terminal } => {
                if *terminal {
                    return Decision::AutoApproved {
                        expiry_hours: rule.expiry_hours.unwrap_or(default_expiry_hours),
                    };
                }
            }
            RuleAction::Reject { terminal } => {
                if *terminal {
                    return Decision::AutoRejected {
                        reason: LocateRejectionReason::RuleBlocked,
                    };
                }
            }
            RuleAction::Continue => {}
        }
    }

    Decision::PendingManualReview
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocateReservation {
    pub reservation_id: ReservationId,
    pub locate_id: LocateId,
    pub security_id: SecurityId,
    pub quantity: Decimal,
    pub expires_at: DateTime<Utc>,
}

/// Per-shard locate workflow state: pending manual-review requests and live
/// reservations against `InventoryAvailability.LOCATE`.
#[derive(Debug, Default)]
pub struct LocateWorkflow {
    manual_review_queue: Vec<(LocateRequest, DateTime<Utc>)>,
    reservations: Vec<LocateReservation>,
}

impl LocateWorkflow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the auto-decision rule set; on no terminal rule, queues for
    /// manual review with `timeout` from `now` (§4.9, default 60 min).
    pub fn decide(
        &mut self,
        request: LocateRequest,
        market: MarketCode,
        rules: &[LocateRule],
        available_qty: Decimal,
        client_long_position: Decimal,
        default_expiry_hours: i64,
        manual_review_timeout: chrono::Duration,
        now: DateTime<Utc>,
    ) -> (LocateState, Option<LocateReservation>, Option<LocateRejectionReason>) {
        let ctx = RuleContext {
            market,
            security_id: request.security_id.clone(),
            client_id: request.client_id.clone(),
            requested_qty: request.requested_quantity,
            available_qty,
            client_long_position,
            now,
        };

        match evaluate(rules, &ctx, default_expiry_hours) {
            Decision::AutoApproved { expiry_hours } => {
                let reservation = LocateReservation {
                    reservation_id: ReservationId::new(),
                    locate_id: request.locate_id,
                    security_id: request.security_id.clone(),
                    quantity: request.requested_quantity,
                    expires_at: now + ChronoDuration::hours(expiry_hours),
                };
                self.reservations.push(reservation.clone());
                (LocateState::AutoApproved, Some(reservation), None)
            }
            Decision::AutoRejected { reason } => {
                (LocateState::AutoRejected, None, Some(reason))
            }
            Decision::PendingManualReview => {
                self.manual_review_queue
                    .push((request, now + manual_review_timeout));
                (LocateState::ManualReview, None, None)
            }
        }
    }

    /// Releases any reservation whose expiry has passed `now`, returning
    /// the released ids so the caller can update inventory/`LocateRequest`
    /// state to `Expired` (§4.9, §3).
    pub fn expire_reservations(&mut self, now: DateTime<Utc>) -> Vec<LocateReservation> {
        let (expired, live): (Vec<_>, Vec<_>) =
            self.reservations.drain(..).partition(|r| r.expires_at <= now);
        self.reservations = live;
        expired
    }

    /// Auto-rejects any manual-review request whose timeout has elapsed
    /// with `TIMEOUT` (§4.9).
    pub fn expire_manual_reviews(&mut self, now: DateTime<Utc>) -> Vec<LocateRequest> {
        let mut timed_out = Vec::new();
        self.manual_review_queue.retain(|(req, deadline)| {
            if *deadline <= now {
                timed_out.push(req.clone());
                false
            } else {
                true
            }
        });
        timed_out
    }

    pub fn pending_manual_review_count(&self) -> usize {
        self.manual_review_queue.len()
    }

    pub fn live_reservation_count(&self) -> usize {
        self.reservations.len()
    }

    /// Live reservations, for snapshotting (§4.4 recovery). The manual
    /// review queue is intentionally not persisted: it is re-derived from
    /// replaying the `LocateRequested` events a snapshot skips past, the
    /// same way in-flight validations aren't persisted either (§4.8(b)).
    pub fn reservations(&self) -> &[LocateReservation] {
        &self.reservations
    }

    pub fn restore_reservations(&mut self, reservations: Vec<LocateReservation>) {
        self.reservations = reservations;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 6, 15, 10, 0, 0).unwrap()
    }

    /// Scenario 7 (spec §8): `qty <= 20000 AND availableQty >= 2*qty =>
    /// APPROVE terminal`.
    #[test]
    fn scenario_locate_auto_approval() {
        let rule = LocateRule {
            market: MarketCode::new("US"),
            rule_type: "qty_and_coverage".into(),
            priority: 100,
            condition: RuleCondition::And(vec![
                RuleCondition::QuantityLte(Decimal::new(20_000, 0)),
                RuleCondition::AvailableAtLeastTimesRequested(2.0),
            ]),
            action: RuleAction::Approve { terminal: true },
            effective_from: now() - ChronoDuration::days(1),
            effective_to: None,
            status: RuleStatus::Active,
            expiry_hours: None,
        };

        let mut workflow = LocateWorkflow::new();
        let request = LocateRequest {
            locate_id: LocateId::new(),
            security_id: SecurityId::from("SEC-EQ-001"),
            client_id: ClientId::from("CP-1"),
            requestor_id: "trader-1".into(),
            requested_quantity: Decimal::new(5000, 0),
            locate_type: LocateType::ShortSell,
            request_timestamp: now(),
        };

        let ctx = RuleContext {
            market: MarketCode::new("US"),
            security_id: request.security_id.clone(),
            client_id: request.client_id.clone(),
            requested_qty: request.requested_quantity,
            available_qty: Decimal::new(15_000, 0),
            client_long_position: Decimal::ZERO,
            now: now(),
        };
        assert!(rule.condition.evaluate(&ctx));

        let (state, reservation, reason) = workflow.decide(
            request,
            MarketCode::new("US"),
            std::slice::from_ref(&rule),
            Decimal::new(15_000, 0),
            Decimal::ZERO,
            24,
            ChronoDuration::minutes(60),
            now(),
        );

        assert_eq!(state, LocateState::AutoApproved);
        assert!(reason.is_none());
        let reservation = reservation.expect("expected reservation on approval");
        assert_eq!(reservation.quantity, Decimal::new(5000, 0));
        assert_eq!(reservation.expires_at, now() + ChronoDuration::hours(24));
        assert_eq!(workflow.live_reservation_count(), 1);
    }

    #[test]
    fn no_deciding_rule_queues_manual_review() {
        let mut workflow = LocateWorkflow::new();
        let request = LocateRequest {
            locate_id: LocateId::new(),
            security_id: SecurityId::from("SEC-EQ-002"),
            client_id: ClientId::from("CP-2"),
            requestor_id: "trader-2".into(),
            requested_quantity: Decimal::new(50_000, 0),
            locate_type: LocateType::ShortSell,
            request_timestamp: now(),
        };
        let (state, reservation, _) = workflow.decide(
            request,
            MarketCode::new("US"),
            &[],
            Decimal::ZERO,
            Decimal::ZERO,
            24,
            ChronoDuration::minutes(60),
            now(),
        );
        assert_eq!(state, LocateState::ManualReview);
        assert!(reservation.is_none());
        assert_eq!(workflow.pending_manual_review_count(), 1);
    }

    #[test]
    fn expired_reservations_are_released() {
        let mut workflow = LocateWorkflow::new();
        workflow.reservations.push(LocateReservation {
            reservation_id: ReservationId::new(),
            locate_id: LocateId::new(),
            security_id: SecurityId::from("SEC-1"),
            quantity: Decimal::new(100, 0),
            expires_at: now(),
        });
        let expired = workflow.expire_reservations(now() + ChronoDuration::seconds(1));
        assert_eq!(expired.len(), 1);
        assert_eq!(workflow.live_reservation_count(), 0);
    }
}
