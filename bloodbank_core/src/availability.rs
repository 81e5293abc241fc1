//! Availability engine: usable units per blood group.
//!
//! Availability for a group is the units of its unexpired donations minus
//! every unit ever issued from it, floored at zero. Two paths compute it:
//! - [`StockCounter`], maintained incrementally under the group lock and
//!   used on the hot path
//! - [`recompute_available`], a from-scratch fold over the ledger records,
//!   kept as the consistency oracle and repair primitive
//!
//! Both must agree for identical ledger contents.

use crate::{
    BloodGroup, DonationRecord, InventoryRow, IssueRecord, Ledger, LowStock, Result,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Fold a group's records into its available units at `as_of`
pub fn recompute_available<'a, D, I>(donations: D, issues: I, as_of: DateTime<Utc>) -> u64
where
    D: IntoIterator<Item = &'a DonationRecord>,
    I: IntoIterator<Item = &'a IssueRecord>,
{
    let donated: u64 = donations
        .into_iter()
        .filter(|d| d.is_usable(as_of))
        .map(|d| u64::from(d.units))
        .sum();
    let issued: u64 = issues.into_iter().map(|i| u64::from(i.units)).sum();
    donated.saturating_sub(issued)
}

/// Incrementally maintained availability for one group
///
/// Unexpired donations are bucketed by expiry instant. Reading at `as_of`
/// drops every bucket that expired before it and advances the watermark,
/// so reads are amortised `O(log n)`. A read older than the watermark
/// cannot be served from the counter and returns `None`.
#[derive(Clone, Debug)]
pub struct StockCounter {
    live: BTreeMap<DateTime<Utc>, u64>,
    live_units: u64,
    issued_units: u64,
    watermark: DateTime<Utc>,
}

impl Default for StockCounter {
    fn default() -> Self {
        Self {
            live: BTreeMap::new(),
            live_units: 0,
            issued_units: 0,
            watermark: DateTime::<Utc>::MIN_UTC,
        }
    }
}

impl StockCounter {
    /// Build a counter from existing records
    pub fn from_records<'a, D, I>(donations: D, issues: I) -> Self
    where
        D: IntoIterator<Item = &'a DonationRecord>,
        I: IntoIterator<Item = &'a IssueRecord>,
    {
        let mut counter = Self::default();
        for d in donations {
            counter.add_donation(d.expires_at, d.units);
        }
        for i in issues {
            counter.add_issue(i.units);
        }
        counter
    }

    pub fn add_donation(&mut self, expires_at: DateTime<Utc>, units: u32) {
        // Already expired for every read this counter can still answer
        if expires_at < self.watermark {
            return;
        }
        *self.live.entry(expires_at).or_insert(0) += u64::from(units);
        self.live_units += u64::from(units);
    }

    pub fn add_issue(&mut self, units: u32) {
        self.issued_units += u64::from(units);
    }

    /// Available units at `as_of`, or `None` if `as_of` precedes the watermark
    pub fn available(&mut self, as_of: DateTime<Utc>) -> Option<u64> {
        if as_of < self.watermark {
            return None;
        }
        self.expire_before(as_of);
        Some(self.live_units.saturating_sub(self.issued_units))
    }

    fn expire_before(&mut self, as_of: DateTime<Utc>) {
        let still_live = self.live.split_off(&as_of);
        let expired = std::mem::replace(&mut self.live, still_live);
        let gone: u64 = expired.values().sum();
        if gone > 0 {
            tracing::debug!("Expired {} unit(s) before {}", gone, as_of);
        }
        self.live_units -= gone;
        self.watermark = as_of;
    }
}

/// A group whose counter disagrees with the from-scratch recompute
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Drift {
    pub blood_group: BloodGroup,
    pub counter: u64,
    pub recomputed: u64,
}

impl LowStock {
    /// Partition inventory rows into low and out-of-stock groups
    pub fn from_rows(rows: &[InventoryRow], threshold: u64) -> Self {
        let mut report = LowStock::default();
        for row in rows {
            if row.available_units == 0 {
                report.out.push(row.blood_group);
            } else if row.available_units < threshold {
                report.low.push(row.blood_group);
            }
        }
        report
    }
}

/// Read-side view over a [`Ledger`]
pub struct AvailabilityEngine<'a> {
    ledger: &'a Ledger,
}

impl<'a> AvailabilityEngine<'a> {
    pub fn new(ledger: &'a Ledger) -> Self {
        Self { ledger }
    }

    pub fn available(&self, group: BloodGroup) -> Result<u64> {
        self.available_at(group, Utc::now())
    }

    /// Available units of `group` at `as_of`, served from the counter
    pub fn available_at(&self, group: BloodGroup, as_of: DateTime<Utc>) -> Result<u64> {
        Ok(self.ledger.lock(group)?.available(as_of))
    }

    /// Available units of `group` at `as_of`, folded from the raw records
    pub fn recompute_at(&self, group: BloodGroup, as_of: DateTime<Utc>) -> Result<u64> {
        Ok(self.ledger.lock(group)?.recompute(as_of))
    }

    pub fn row_at(&self, group: BloodGroup, as_of: DateTime<Utc>) -> Result<InventoryRow> {
        let mut guard = self.ledger.lock(group)?;
        Ok(InventoryRow {
            blood_group: group,
            available_units: guard.available(as_of),
            updated_at: guard.updated_at(),
        })
    }

    /// The full 8-row availability table in canonical group order
    pub fn snapshot_at(&self, as_of: DateTime<Utc>) -> Result<Vec<InventoryRow>> {
        BloodGroup::ALL
            .into_iter()
            .map(|g| self.row_at(g, as_of))
            .collect()
    }

    pub fn low_stock(&self, threshold: u64) -> Result<LowStock> {
        self.low_stock_at(threshold, Utc::now())
    }

    pub fn low_stock_at(&self, threshold: u64, as_of: DateTime<Utc>) -> Result<LowStock> {
        let rows = self.snapshot_at(as_of)?;
        Ok(LowStock::from_rows(&rows, threshold))
    }

    /// Compare every group's counter against the recompute
    pub fn verify_at(&self, as_of: DateTime<Utc>) -> Result<Vec<Drift>> {
        let mut drifts = Vec::new();
        for group in BloodGroup::ALL {
            let mut guard = self.ledger.lock(group)?;
            let recomputed = guard.recompute(as_of);
            let Some(counter) = guard.counter_available(as_of) else {
                continue;
            };
            if counter != recomputed {
                tracing::warn!(
                    "Availability drift for {}: counter {} vs ledger {}",
                    group,
                    counter,
                    recomputed
                );
                drifts.push(Drift {
                    blood_group: group,
                    counter,
                    recomputed,
                });
            }
        }
        Ok(drifts)
    }

    /// Rebuild every group's counter from its records
    pub fn repair(&self) -> Result<()> {
        for group in BloodGroup::ALL {
            self.ledger.lock(group)?.rebuild_counter();
        }
        tracing::info!("Rebuilt availability counters from ledger");
        Ok(())
    }
}
