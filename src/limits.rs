//! Limit Book (C7, §4.7).
//!
//! Two limit tables — client and aggregation-unit — each row carrying
//! `{limit, used, version}`. All three operations (`check`, `reserve`,
//! `release`/`commit`) execute inside the owning shard's loop, so they are
//! atomic by construction rather than by a `Mutex` or a real CAS loop (§5):
//! there is only ever one caller touching a given row at a time.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ids::{AggregationUnitId, BusinessDate, ClientId, ReservationId, SecurityId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LimitStatus {
    Active,
    Suspended,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Limit {
    pub long_sell_limit: Decimal,
    pub short_sell_limit: Decimal,
    pub long_sell_used: Decimal,
    pub short_sell_used: Decimal,
    pub status: LimitStatus,
    pub version: u64,
}

impl Limit {
    pub fn new(long_sell_limit: Decimal, short_sell_limit: Decimal) -> Self {
        Self {
            long_sell_limit,
            short_sell_limit,
            long_sell_used: Decimal::ZERO,
            short_sell_used: Decimal::ZERO,
            status: LimitStatus::Active,
            version: 0,
        }
    }

    fn invariants_hold(&self) -> bool {
        self.long_sell_used <= self.long_sell_limit && self.short_sell_used <= self.short_sell_limit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    LongSell,
    ShortSell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Ok,
    Insufficient,
}

#[derive(Debug, Clone)]
struct Reservation {
    entity_is_client: bool,
    client_id: Option<ClientId>,
    au_id: Option<AggregationUnitId>,
    security_id: SecurityId,
    business_date: BusinessDate,
    side: OrderSide,
    qty: Decimal,
}

/// Owns every client and aggregation-unit `Limit` row hashed onto one shard.
#[derive(Debug, Default)]
pub struct LimitBook {
    client_limits: HashMap<(ClientId, SecurityId, BusinessDate), Limit>,
    au_limits: HashMap<(AggregationUnitId, SecurityId, BusinessDate), Limit>,
    reservations: HashMap<ReservationId, Reservation>,
}

impl LimitBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_client_limit(
        &mut self,
        client_id: ClientId,
        security_id: SecurityId,
        business_date: BusinessDate,
        long_sell_limit: Option<Decimal>,
        short_sell_limit: Option<Decimal>,
    ) {
        let limit = self
            .client_limits
            .entry((client_id, security_id, business_date))
            .or_insert_with(|| Limit::new(Decimal::ZERO, Decimal::ZERO));
        if let Some(v) = long_sell_limit {
            limit.long_sell_limit = v;
        }
        if let Some(v) = short_sell_limit {
            limit.short_sell_limit = v;
        }
        limit.version += 1;
    }

    pub fn upsert_au_limit(
        &mut self,
        au_id: AggregationUnitId,
        security_id: SecurityId,
        business_date: BusinessDate,
        long_sell_limit: Option<Decimal>,
        short_sell_limit: Option<Decimal>,
    ) {
        let limit = self
            .au_limits
            .entry((au_id, security_id, business_date))
            .or_insert_with(|| Limit::new(Decimal::ZERO, Decimal::ZERO));
        if let Some(v) = long_sell_limit {
            limit.long_sell_limit = v;
        }
        if let Some(v) = short_sell_limit {
            limit.short_sell_limit = v;
        }
        limit.version += 1;
    }

    /// Full client-limit table, for snapshotting (§4.4 recovery).
    pub fn iter_client(
        &self,
    ) -> impl Iterator<Item = (&(ClientId, SecurityId, BusinessDate), &Limit)> {
        self.client_limits.iter()
    }

    /// Full aggregation-unit-limit table, for snapshotting.
    pub fn iter_au(
        &self,
    ) -> impl Iterator<Item = (&(AggregationUnitId, SecurityId, BusinessDate), &Limit)> {
        self.au_limits.iter()
    }

    /// Restores both limit tables from a snapshot, discarding any
    /// in-flight reservations (a resync, like `PositionSnapshot`, replaces
    /// derived state wholesale rather than folding in as a delta).
    pub fn restore(
        &mut self,
        client_limits: Vec<((ClientId, SecurityId, BusinessDate), Limit)>,
        au_limits: Vec<((AggregationUnitId, SecurityId, BusinessDate), Limit)>,
    ) {
        self.client_limits = client_limits.into_iter().collect();
        self.au_limits = au_limits.into_iter().collect();
        self.reservations.clear();
    }

    pub fn client_limit(
        &self,
        client_id: &ClientId,
        security_id: &SecurityId,
        business_date: BusinessDate,
    ) -> Option<&Limit> {
        self.client_limits
            .get(&(client_id.clone(), security_id.clone(), business_date))
    }

    pub fn au_limit(
        &self,
        au_id: &AggregationUnitId,
        security_id: &SecurityId,
        business_date: BusinessDate,
    ) -> Option<&Limit> {
        self.au_limits
            .get(&(au_id.clone(), security_id.clone(), business_date))
    }

    pub fn check_client(
        &self,
        client_id: &ClientId,
        security_id: &SecurityId,
        business_date: BusinessDate,
        side: OrderSide,
        qty: Decimal,
    ) -> CheckOutcome {
        match self.client_limit(client_id, security_id, business_date) {
            Some(limit) => outcome_for(limit, side, qty),
            None => CheckOutcome::Insufficient,
        }
    }

    pub fn check_au(
        &self,
        au_id: &AggregationUnitId,
        security_id: &SecurityId,
        business_date: BusinessDate,
        side: OrderSide,
        qty: Decimal,
    ) -> CheckOutcome {
        match self.au_limit(au_id, security_id, business_date) {
            Some(limit) => outcome_for(limit, side, qty),
            None => CheckOutcome::Insufficient,
        }
    }

    /// Reserve against a client's limit. On success records a `Reservation`
    /// under `reservation_id` so `release`/`commit` can find it later.
    pub fn reserve_client(
        &mut self,
        client_id: ClientId,
        security_id: SecurityId,
        business_date: BusinessDate,
        side: OrderSide,
        qty: Decimal,
        reservation_id: ReservationId,
    ) -> Result<Decimal, CheckOutcome> {
        let limit = self
            .client_limits
            .get_mut(&(client_id.clone(), security_id.clone(), business_date))
            .ok_or(CheckOutcome::Insufficient)?;
        let new_used = reserve_on(limit, side, qty)?;
        self.reservations.insert(
            reservation_id,
            Reservation {
                entity_is_client: true,
                client_id: Some(client_id),
                au_id: None,
                security_id,
                business_date,
                side,
                qty,
            },
        );
        Ok(new_used)
    }

    pub fn reserve_au(
        &mut self,
        au_id: AggregationUnitId,
        security_id: SecurityId,
        business_date: BusinessDate,
        side: OrderSide,
        qty: Decimal,
        reservation_id: ReservationId,
    ) -> Result<Decimal, CheckOutcome> {
        let limit = self
            .au_limits
            .get_mut(&(au_id.clone(), security_id.clone(), business_date))
            .ok_or(CheckOutcome::Insufficient)?;
        let new_used = reserve_on(limit, side, qty)?;
        self.reservations.insert(
            reservation_id,
            Reservation {
                entity_is_client: false,
                client_id: None,
                au_id: Some(au_id),
                security_id,
                business_date,
                side,
                qty,
            },
        );
        Ok(new_used)
    }

    /// Reverses the `used` delta of a reservation and drops the record.
    /// Idempotent: releasing an id that no longer exists (already released
    /// or committed) is a no-op, so retrying callers never double-effect.
    pub fn release(&mut self, reservation_id: ReservationId) {
        let Some(r) = self.reservations.remove(&reservation_id) else {
            return;
        };
        self.unwind(&r);
    }

    /// Finalizes a reservation: drops the record but keeps `used` as-is
    /// (§4.7 — "finalize, drop the reservation record but keep `used`").
    pub fn commit(&mut self, reservation_id: ReservationId) {
        self.reservations.remove(&reservation_id);
    }

    fn unwind(&mut self, r: &Reservation) {
        let limit = if r.entity_is_client {
            self.client_limits
                .get_mut(&(r.client_id.clone().unwrap(), r.security_id.clone(), r.business_date))
        } else {
            self.au_limits
                .get_mut(&(r.au_id.clone().unwrap(), r.security_id.clone(), r.business_date))
        };
        let Some(limit) = limit else { return };
        match r.side {
            OrderSide::LongSell => limit.long_sell_used -= r.qty,
            OrderSide::ShortSell => limit.short_sell_used -= r.qty,
        }
        limit.version += 1;
    }
}

fn outcome_for(limit: &Limit, side: OrderSide, qty: Decimal) -> CheckOutcome {
    let (used, cap) = match side {
        OrderSide::LongSell => (limit.long_sell_used, limit.long_sell_limit),
        OrderSide::ShortSell => (limit.short_sell_used, limit.short_sell_limit),
    };
    if used + qty > cap {
        CheckOutcome::Insufficient
    } else {
        CheckOutcome::Ok
    }
}

fn reserve_on(limit: &mut Limit, side: OrderSide, qty: Decimal) -> Result<Decimal, CheckOutcome> {
    let (used, cap) = match side {
        OrderSide::LongSell => (limit.long_sell_used, limit.long_sell_limit),
        OrderSide::ShortSell => (limit.short_sell_used, limit.short_sell_limit),
    };
    if used + qty > cap {
        return Err(CheckOutcome::Insufficient);
    }
    match side {
        OrderSide::LongSell => limit.long_sell_used += qty,
        OrderSide::ShortSell => limit.short_sell_used += qty,
    }
    limit.version += 1;
    debug_assert!(limit.invariants_hold());
    Ok(match side {
        OrderSide::LongSell => limit.long_sell_used,
        OrderSide::ShortSell => limit.short_sell_used,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date() -> BusinessDate {
        NaiveDate::from_ymd_opt(2023, 6, 15).unwrap()
    }

    /// Scenario 3 (spec §8): short-sell with sufficient client+AU limit.
    #[test]
    fn scenario_short_sell_within_limits() {
        let mut book = LimitBook::new();
        let client = ClientId::from("CP-00001");
        let security = SecurityId::from("SEC-EQ-001");
        book.upsert_client_limit(
            client.clone(),
            security.clone(),
            date(),
            None,
            Some(Decimal::new(500, 0)),
        );

        let reservation_id = ReservationId::new();
        let used = book
            .reserve_client(
                client.clone(),
                security.clone(),
                date(),
                OrderSide::ShortSell,
                Decimal::new(300, 0),
                reservation_id,
            )
            .unwrap();
        assert_eq!(used, Decimal::new(300, 0));
        assert_eq!(
            book.client_limit(&client, &security, date()).unwrap().short_sell_used,
            Decimal::new(300, 0)
        );
    }

    /// Scenario 4 (spec §8): rejected reservation must not mutate `used`.
    #[test]
    fn scenario_reject_leaves_used_unchanged() {
        let mut book = LimitBook::new();
        let client = ClientId::from("CP-00002");
        let security = SecurityId::from("SEC-EQ-001");
        book.upsert_client_limit(
            client.clone(),
            security.clone(),
            date(),
            None,
            Some(Decimal::new(200, 0)),
        );

        let err = book
            .reserve_client(
                client.clone(),
                security.clone(),
                date(),
                OrderSide::ShortSell,
                Decimal::new(300, 0),
                ReservationId::new(),
            )
            .unwrap_err();
        assert_eq!(err, CheckOutcome::Insufficient);
        assert_eq!(
            book.client_limit(&client, &security, date()).unwrap().short_sell_used,
            Decimal::ZERO
        );
    }

    #[test]
    fn release_reverses_used_exactly_once() {
        let mut book = LimitBook::new();
        let client = ClientId::from("CP-1");
        let security = SecurityId::from("SEC-1");
        book.upsert_client_limit(
            client.clone(),
            security.clone(),
            date(),
            None,
            Some(Decimal::new(1000, 0)),
        );
        let id = ReservationId::new();
        book.reserve_client(
            client.clone(),
            security.clone(),
            date(),
            OrderSide::ShortSell,
            Decimal::new(400, 0),
            id,
        )
        .unwrap();
        book.release(id);
        assert_eq!(
            book.client_limit(&client, &security, date()).unwrap().short_sell_used,
            Decimal::ZERO
        );
        // Releasing again is a no-op, not a double-reversal.
        book.release(id);
        assert_eq!(
            book.client_limit(&client, &security, date()).unwrap().short_sell_used,
            Decimal::ZERO
        );
    }

    #[test]
    fn commit_keeps_used_and_drops_reservation() {
        let mut book = LimitBook::new();
        let au = AggregationUnitId::from("AU-1");
        let security = SecurityId::from("SEC-1");
        book.upsert_au_limit(
            au.clone(),
            security.clone(),
            date(),
            None,
            Some(Decimal::new(1000, 0)),
        );
        let id = ReservationId::new();
        book.reserve_au(
            au.clone(),
            security.clone(),
            date(),
            OrderSide::ShortSell,
            Decimal::new(400, 0),
            id,
        )
        .unwrap();
        book.commit(id);
        assert_eq!(
            book.au_limit(&au, &security, date()).unwrap().short_sell_used,
            Decimal::new(400, 0)
        );
        // Commit already dropped the reservation; a second commit is a no-op.
        book.commit(id);
    }
}
