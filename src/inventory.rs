//! Inventory Calculator (C6, §4.6).
//!
//! A fold over the positions and contracts open for `(securityId,
//! businessDate)`, followed by an ordered chain of market-rule plugins. The
//! plugin contract mirrors §4.6 exactly: `(rawAvailability, context) ->
//! adjustedAvailability`, a pure function with no I/O — modelled the same
//! way the teacher models strategy plugins as small trait objects rather
//! than an enum switch, so a new market can be registered without touching
//! this module's fold logic.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::envelope::ContractFields;
use crate::ids::{BusinessDate, MarketCode, SecurityId};
use crate::position::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CalculationType {
    ForLoan,
    ForPledge,
    LongSell,
    ShortSell,
    Locate,
    Overborrow,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InventoryKey {
    pub security_id: SecurityId,
    pub business_date: BusinessDate,
    pub calculation_type: CalculationType,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InventoryAvailability {
    pub value: Decimal,
    pub hypothecatable_included: Decimal,
    pub repo_pledged_included: Decimal,
    pub financing_swap_included: Decimal,
    pub external_lender_included: Decimal,
    pub cross_border_included: Decimal,
    pub slab_lending_excluded: Decimal,
    pub pay_to_hold_excluded: Decimal,
    pub reserved_client_excluded: Decimal,
    pub corporate_action_excluded: Decimal,
    pub excluded_borrowed_shares: bool,
    pub settlement_cutoff_applied: bool,
    pub quanto_settlement_handled: bool,
    pub calculated_at: Option<DateTime<Utc>>,
}

/// Everything the fold and the market-rule chain need that isn't already on
/// a `Position`/`ContractFields`: approved locates/reservations by client,
/// the security's market, and "now" for cutoff rules.
pub struct InventoryContext {
    pub market: MarketCode,
    pub now: DateTime<Utc>,
    pub approved_locate_qty: Decimal,
    pub approved_long_sell_reservations: Decimal,
    pub approved_short_sell_reservations: Decimal,
    pub approved_pay_to_hold_qty: Decimal,
    pub existing_borrow_qty: Decimal,
    pub required_borrow_qty: Decimal,
}

/// Folds positions + contracts for one `(securityId, businessDate)` into a
/// raw availability figure for `calculation_type`, before market-rule
/// adjustment (§4.6 inclusions/exclusions list).
pub fn calculate_raw(
    calculation_type: CalculationType,
    positions: &[&Position],
    contracts: &[&ContractFields],
    ctx: &InventoryContext,
) -> InventoryAvailability {
    let mut out = InventoryAvailability::default();

    match calculation_type {
        CalculationType::ForLoan => {
            for p in positions {
                if p.is_hypothecatable && p.settled_qty > Decimal::ZERO {
                    out.hypothecatable_included += p.settled_qty;
                }
            }
            for c in contracts {
                if c.repo_pledged {
                    out.repo_pledged_included += c.qty;
                }
                if c.financing_swap {
                    out.financing_swap_included += c.qty;
                }
                if c.external_lender_available {
                    out.external_lender_included += c.qty;
                }
                if c.cross_border_eligible {
                    out.cross_border_included += c.qty;
                }
                if c.slab_lending_out {
                    out.slab_lending_excluded += c.qty;
                }
                if c.pay_to_hold {
                    out.pay_to_hold_excluded += c.qty;
                }
                if c.reserved_client_asset {
                    out.reserved_client_excluded += c.qty;
                }
                if c.corporate_action_locked {
                    out.corporate_action_excluded += c.qty;
                }
            }
            out.value = out.hypothecatable_included
                + out.repo_pledged_included
                + out.financing_swap_included
                + out.external_lender_included
                + out.cross_border_included
                - out.slab_lending_excluded
                - out.pay_to_hold_excluded
                - out.reserved_client_excluded
                - out.corporate_action_excluded;
        }
        CalculationType::ForPledge => {
            for p in positions {
                if !p.is_reserved && p.settled_qty > Decimal::ZERO {
                    out.hypothecatable_included += p.settled_qty;
                }
            }
            for c in contracts {
                if c.repo_pledged {
                    out.repo_pledged_included -= c.qty;
                }
                if c.corporate_action_locked {
                    out.corporate_action_excluded += c.qty;
                }
            }
            out.value =
                out.hypothecatable_included + out.repo_pledged_included - out.corporate_action_excluded;
        }
        CalculationType::LongSell => {
            let long_settled: Decimal = positions
                .iter()
                .map(|p| p.settled_qty)
                .filter(|q| *q > Decimal::ZERO)
                .sum();
            out.value =
                long_settled + ctx.approved_locate_qty - ctx.approved_long_sell_reservations;
        }
        CalculationType::ShortSell => {
            out.value = ctx.approved_locate_qty + ctx.approved_pay_to_hold_qty
                - ctx.approved_short_sell_reservations;
        }
        CalculationType::Locate => {
            out.value = ctx.approved_locate_qty - ctx.approved_short_sell_reservations;
        }
        CalculationType::Overborrow => {
            out.value = (ctx.existing_borrow_qty - ctx.required_borrow_qty).max(Decimal::ZERO);
        }
    }

    out.calculated_at = Some(ctx.now);
    out
}

/// Market-rule plugin (§4.6): an ordered, pure transform of the raw
/// availability. Composable — a per-market list is applied in sequence.
pub trait MarketRule: Send + Sync {
    fn apply(&self, raw: InventoryAvailability, ctx: &InventoryContext) -> InventoryAvailability;
}

/// Taiwan: borrowed shares are excluded from FOR_LOAN output entirely.
pub struct TaiwanRule {
    pub borrowed_qty: Decimal,
}

impl MarketRule for TaiwanRule {
    fn apply(&self, mut raw: InventoryAvailability, _ctx: &InventoryContext) -> InventoryAvailability {
        if self.borrowed_qty > Decimal::ZERO {
            raw.value -= self.borrowed_qty;
            raw.excluded_borrowed_shares = true;
        }
        raw
    }
}

/// Japan: settlement cutoff excludes today's SLAB settlements once `now`
/// passes the market cutoff; quanto settlements move their contribution
/// from sd0 to sd2.
pub struct JapanRule {
    pub market_cutoff: DateTime<Utc>,
    pub slab_settlement_qty: Decimal,
    pub quanto_settlement_qty: Decimal,
}

impl MarketRule for JapanRule {
    fn apply(&self, mut raw: InventoryAvailability, ctx: &InventoryContext) -> InventoryAvailability {
        if ctx.now >= self.market_cutoff && self.slab_settlement_qty > Decimal::ZERO {
            raw.value -= self.slab_settlement_qty;
            raw.settlement_cutoff_applied = true;
        }
        if self.quanto_settlement_qty > Decimal::ZERO {
            // The T+2 relocation itself happens in the position engine's
            // ladder bucket assignment; this flag only records that the
            // availability figure reflects a quanto-adjusted position.
            raw.quanto_settlement_handled = true;
        }
        raw
    }
}

/// Resolves the ordered rule chain for a market code (§4.6's "ordered
/// application from a per-market list"). Open Question #4 (spec §9):
/// decided that `Security.market` is authoritative and singular — cross-
/// listed securities are represented with exactly one market code in this
/// engine, so at most one non-default chain ever applies.
pub fn rule_chain_for(market: &MarketCode) -> Vec<Box<dyn MarketRule>> {
    match market.as_str() {
        // Concrete per-market rules are constructed by the caller (who has
        // the contract/position data the rule closes over) and appended
        // here; this resolver exists so the shard loop has one place to ask
        // "does this market have rules" without hardcoding the match.
        _ => Vec::new(),
    }
}

/// Applies an ordered chain of rules to a raw availability figure.
pub fn apply_rule_chain(
    raw: InventoryAvailability,
    rules: &[Box<dyn MarketRule>],
    ctx: &InventoryContext,
) -> InventoryAvailability {
    rules.iter().fold(raw, |acc, rule| rule.apply(acc, ctx))
}

/// Snapshot of per-security contract/position state the inventory
/// calculator folds over, keyed for lookup by the shard loop.
#[derive(Debug, Default)]
pub struct InventoryBook {
    availabilities: HashMap<InventoryKey, InventoryAvailability>,
}

impl InventoryBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &InventoryKey) -> Option<&InventoryAvailability> {
        self.availabilities.get(key)
    }

    pub fn set(&mut self, key: InventoryKey, value: InventoryAvailability) {
        self.availabilities.insert(key, value);
    }

    /// Full table, for snapshotting (§4.4 recovery).
    pub fn iter(&self) -> impl Iterator<Item = (&InventoryKey, &InventoryAvailability)> {
        self.availabilities.iter()
    }

    pub fn restore(&mut self, entries: Vec<(InventoryKey, InventoryAvailability)>) {
        self.availabilities = entries.into_iter().collect();
    }
}
