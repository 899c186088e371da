//! Balance Reservation Ledger
//!
//! Process-local accounting of per-(party, asset) amounts spoken for by open
//! orders. The on-chain balance alone cannot prevent overselling because
//! locally pending orders have not yet moved funds; the reservation is
//! established before the order contract is created and released only after
//! the corresponding ledger effect is observed.
#![allow(dead_code)]

use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ReservationError {
    #[error("Order {0} already holds a reservation")]
    AlreadyReserved(Uuid),

    #[error("Reservation amount must be positive, got {0}")]
    NonPositiveAmount(Decimal),
}

/// Outstanding reservation bound to one order
#[derive(Debug, Clone)]
pub struct Reservation {
    pub order_id: Uuid,
    pub party_id: String,
    pub asset: String,
    /// Outstanding (not yet released) amount
    pub amount: Decimal,
}

pub struct BalanceReserver {
    /// Running totals per (party, asset)
    totals: DashMap<(String, String), Decimal>,
    /// Outstanding reservations by order id
    reservations: DashMap<Uuid, Reservation>,
    /// Mutations on one party are serialised through this lock table
    party_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl BalanceReserver {
    pub fn new() -> Self {
        Self {
            totals: DashMap::new(),
            reservations: DashMap::new(),
            party_locks: DashMap::new(),
        }
    }

    fn party_lock(&self, party: &str) -> Arc<Mutex<()>> {
        self.party_locks
            .entry(party.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn add_to_total(&self, party: &str, asset: &str, delta: Decimal) {
        let key = (party.to_string(), asset.to_string());
        let mut entry = self.totals.entry(key).or_insert(Decimal::ZERO);
        // Clamped at zero; a release can never drive the total negative
        *entry = (*entry + delta).max(Decimal::ZERO);
    }

    /// Record a new reservation. A second reserve for the same order id is a
    /// programming error in the caller and is rejected.
    pub fn reserve(
        &self,
        order_id: Uuid,
        party: &str,
        asset: &str,
        amount: Decimal,
    ) -> Result<(), ReservationError> {
        if amount <= Decimal::ZERO {
            return Err(ReservationError::NonPositiveAmount(amount));
        }
        let lock = self.party_lock(party);
        let _guard = lock.lock();

        if self.reservations.contains_key(&order_id) {
            return Err(ReservationError::AlreadyReserved(order_id));
        }
        self.reservations.insert(
            order_id,
            Reservation {
                order_id,
                party_id: party.to_string(),
                asset: asset.to_string(),
                amount,
            },
        );
        self.add_to_total(party, asset, amount);
        debug!("Reserved {} {} for {} (order {})", amount, asset, party, order_id);
        Ok(())
    }

    /// Release the full outstanding reservation for an order and forget it.
    /// Returns the released amount; a second release is a no-op.
    pub fn release(&self, order_id: Uuid) -> Decimal {
        let reservation = match self.reservations.get(&order_id) {
            Some(r) => r.clone(),
            None => return Decimal::ZERO,
        };
        let lock = self.party_lock(&reservation.party_id);
        let _guard = lock.lock();

        match self.reservations.remove(&order_id) {
            Some((_, reservation)) => {
                self.add_to_total(
                    &reservation.party_id,
                    &reservation.asset,
                    -reservation.amount,
                );
                debug!(
                    "Released {} {} for {} (order {})",
                    reservation.amount, reservation.asset, reservation.party_id, order_id
                );
                reservation.amount
            }
            None => Decimal::ZERO,
        }
    }

    /// Release `filled_amount` of the outstanding reservation, clamped to
    /// what is outstanding. When the outstanding falls to zero the order is
    /// forgotten. Returns the released amount.
    pub fn release_partial(&self, order_id: Uuid, filled_amount: Decimal) -> Decimal {
        if filled_amount <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let reservation = match self.reservations.get(&order_id) {
            Some(r) => r.clone(),
            None => return Decimal::ZERO,
        };
        let lock = self.party_lock(&reservation.party_id);
        let _guard = lock.lock();

        let mut entry = match self.reservations.get_mut(&order_id) {
            Some(entry) => entry,
            None => return Decimal::ZERO,
        };
        let released = filled_amount.min(entry.amount);
        entry.amount -= released;
        let exhausted = entry.amount <= Decimal::ZERO;
        let (party, asset) = (entry.party_id.clone(), entry.asset.clone());
        drop(entry);

        if exhausted {
            self.reservations.remove(&order_id);
        }
        self.add_to_total(&party, &asset, -released);
        debug!(
            "Partially released {} {} for {} (order {}, exhausted: {})",
            released, asset, party, order_id, exhausted
        );
        released
    }

    /// Current running total reserved by `party` in `asset`; never negative
    pub fn reserved(&self, party: &str, asset: &str) -> Decimal {
        self.totals
            .get(&(party.to_string(), asset.to_string()))
            .map(|total| *total)
            .unwrap_or(Decimal::ZERO)
    }

    /// Outstanding reservation for an order, if any
    pub fn reservation(&self, order_id: Uuid) -> Option<Reservation> {
        self.reservations.get(&order_id).map(|r| r.clone())
    }
}

impl Default for BalanceReserver {
    fn default() -> Self {
        Self::new()
    }
}
