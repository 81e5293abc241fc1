//! Allocation engine for issuance requests.
//!
//! Requests are filled first-fit: candidate donor groups are tried in
//! compatibility order (exact match first) and the first one holding enough
//! units is debited. A request is never split across groups.

use crate::{BloodGroup, Error, IssueRecord, Ledger, RecipientId, Result};
use chrono::{DateTime, Utc};

pub struct AllocationEngine<'a> {
    ledger: &'a Ledger,
}

impl<'a> AllocationEngine<'a> {
    pub fn new(ledger: &'a Ledger) -> Self {
        Self { ledger }
    }

    /// Issue `units` of blood compatible with `requested` to a recipient
    pub fn issue(
        &self,
        recipient_id: RecipientId,
        requested: BloodGroup,
        units: u32,
    ) -> Result<IssueRecord> {
        self.issue_at(recipient_id, requested, units, Utc::now())
    }

    /// Issue against the ledger as it stands at `at`
    ///
    /// For each candidate the sufficiency check and the append run under
    /// that group's lock, so two requests racing for the same stock cannot
    /// both pass the check. On failure nothing is written.
    pub fn issue_at(
        &self,
        recipient_id: RecipientId,
        requested: BloodGroup,
        units: u32,
        at: DateTime<Utc>,
    ) -> Result<IssueRecord> {
        self.validate(recipient_id, units)?;

        for &candidate in self.ledger.table().compatible_donors(requested) {
            let mut guard = self.ledger.lock(candidate)?;
            let available = guard.available(at);
            if available < u64::from(units) {
                tracing::debug!(
                    "{} has {} unit(s), need {} for {} request",
                    candidate,
                    available,
                    units,
                    requested
                );
                continue;
            }

            let record = guard.append_issue(recipient_id, requested, units, at)?;
            debug_assert!(record.compatible);
            tracing::info!(
                "Issued {} unit(s) of {} to recipient {} (requested {})",
                units,
                candidate,
                recipient_id,
                requested
            );
            return Ok(record);
        }

        tracing::info!(
            "No compatible stock for {} unit(s) of {} (recipient {})",
            units,
            requested,
            recipient_id
        );
        Err(Error::InsufficientStock { requested, units })
    }

    /// The group [`Self::issue_at`] would pick right now, without committing
    ///
    /// Locks are released between candidates, so the answer may be stale by
    /// the time a real issue runs.
    pub fn plan(
        &self,
        requested: BloodGroup,
        units: u32,
        as_of: DateTime<Utc>,
    ) -> Result<Option<BloodGroup>> {
        if units == 0 {
            return Err(Error::NonPositiveUnits(0));
        }
        for &candidate in self.ledger.table().compatible_donors(requested) {
            if self.ledger.lock(candidate)?.available(as_of) >= u64::from(units) {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    fn validate(&self, recipient_id: RecipientId, units: u32) -> Result<()> {
        if units == 0 {
            return Err(Error::NonPositiveUnits(0));
        }
        if !self.ledger.directory().recipient_exists(recipient_id) {
            return Err(Error::RecipientNotFound(recipient_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::tests::open_directory;
    use crate::{parse_date, AvailabilityEngine};
    use chrono::Duration;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn day(n: i64) -> DateTime<Utc> {
        parse_date("2026-01-01").unwrap() + Duration::days(n)
    }

    fn ledger() -> Ledger {
        Ledger::in_memory(Arc::new(open_directory()))
    }

    fn donate(ledger: &Ledger, group: BloodGroup, units: u32, on: i64) {
        ledger.append_donation(1, group, units, Some(day(on))).unwrap();
    }

    #[test]
    fn test_universal_donor_fills_ab_positive() {
        let ledger = ledger();
        donate(&ledger, BloodGroup::ONeg, 5, 0);

        let engine = AllocationEngine::new(&ledger);
        let record = engine.issue_at(1, BloodGroup::AbPos, 3, day(1)).unwrap();

        assert_eq!(record.issued_group, BloodGroup::ONeg);
        assert_eq!(record.requested_group, BloodGroup::AbPos);
        let availability = AvailabilityEngine::new(&ledger);
        assert_eq!(availability.available_at(BloodGroup::ONeg, day(1)).unwrap(), 2);
    }

    #[test]
    fn test_exact_match_preferred_over_substitute() {
        let ledger = ledger();
        donate(&ledger, BloodGroup::APos, 2, 0);
        donate(&ledger, BloodGroup::ONeg, 1, 0);

        let engine = AllocationEngine::new(&ledger);
        let record = engine.issue_at(1, BloodGroup::APos, 2, day(1)).unwrap();
        assert_eq!(record.issued_group, BloodGroup::APos);
    }

    #[test]
    fn test_exact_match_wins_even_when_substitute_is_larger() {
        let ledger = ledger();
        donate(&ledger, BloodGroup::BPos, 4, 0);
        donate(&ledger, BloodGroup::ONeg, 50, 0);

        let engine = AllocationEngine::new(&ledger);
        let record = engine.issue_at(1, BloodGroup::BPos, 4, day(1)).unwrap();
        assert_eq!(record.issued_group, BloodGroup::BPos);
    }

    #[test]
    fn test_substitutes_in_table_order() {
        let ledger = ledger();
        donate(&ledger, BloodGroup::APos, 1, 0);
        donate(&ledger, BloodGroup::OPos, 5, 0);
        donate(&ledger, BloodGroup::ANeg, 5, 0);

        let engine = AllocationEngine::new(&ledger);
        // A+ has too little; O- is empty; O+ is next in order
        let record = engine.issue_at(1, BloodGroup::APos, 3, day(1)).unwrap();
        assert_eq!(record.issued_group, BloodGroup::OPos);
    }

    #[test]
    fn test_no_stock_fails_without_side_effects() {
        let ledger = ledger();
        let engine = AllocationEngine::new(&ledger);

        let result = engine.issue_at(1, BloodGroup::ONeg, 1, day(0));
        assert!(matches!(
            result,
            Err(Error::InsufficientStock {
                requested: BloodGroup::ONeg,
                units: 1
            })
        ));
        assert!(ledger.issues().unwrap().is_empty());
    }

    #[test]
    fn test_incompatible_stock_is_never_used() {
        let ledger = ledger();
        donate(&ledger, BloodGroup::AbPos, 10, 0);
        donate(&ledger, BloodGroup::APos, 10, 0);

        let engine = AllocationEngine::new(&ledger);
        assert!(matches!(
            engine.issue_at(1, BloodGroup::ONeg, 1, day(1)),
            Err(Error::InsufficientStock { .. })
        ));
        assert!(matches!(
            engine.issue_at(1, BloodGroup::BNeg, 1, day(1)),
            Err(Error::InsufficientStock { .. })
        ));
    }

    #[test]
    fn test_issued_group_always_compatible() {
        let ledger = ledger();
        for g in BloodGroup::ALL {
            donate(&ledger, g, 3, 0);
        }

        let engine = AllocationEngine::new(&ledger);
        let table = ledger.table();
        for requested in BloodGroup::ALL {
            while let Ok(record) = engine.issue_at(1, requested, 1, day(1)) {
                assert!(record.compatible);
                assert!(table.allows(requested, record.issued_group));
            }
        }

        let availability = AvailabilityEngine::new(&ledger);
        for g in BloodGroup::ALL {
            assert_eq!(availability.available_at(g, day(1)).unwrap(), 0);
        }
    }

    #[test]
    fn test_expired_stock_is_not_issued() {
        let ledger = ledger();
        donate(&ledger, BloodGroup::ONeg, 5, 0);

        let engine = AllocationEngine::new(&ledger);
        assert!(matches!(
            engine.issue_at(1, BloodGroup::ONeg, 1, day(43)),
            Err(Error::InsufficientStock { .. })
        ));
    }

    #[test]
    fn test_request_validation() {
        let ledger = ledger();
        donate(&ledger, BloodGroup::ONeg, 5, 0);
        let engine = AllocationEngine::new(&ledger);

        assert!(matches!(
            engine.issue_at(1, BloodGroup::ONeg, 0, day(1)),
            Err(Error::NonPositiveUnits(0))
        ));
        assert!(matches!(
            engine.issue_at(77, BloodGroup::ONeg, 1, day(1)),
            Err(Error::RecipientNotFound(77))
        ));
    }

    #[test]
    fn test_plan_does_not_commit() {
        let ledger = ledger();
        donate(&ledger, BloodGroup::ONeg, 2, 0);

        let engine = AllocationEngine::new(&ledger);
        assert_eq!(
            engine.plan(BloodGroup::AbNeg, 2, day(1)).unwrap(),
            Some(BloodGroup::ONeg)
        );
        assert_eq!(engine.plan(BloodGroup::AbNeg, 3, day(1)).unwrap(), None);
        assert!(ledger.issues().unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_requests_for_all_stock() {
        const THREADS: usize = 12;
        let ledger = Arc::new(ledger());
        donate(&ledger, BloodGroup::ONeg, 7, 0);

        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    AllocationEngine::new(&ledger).issue_at(
                        (i % 16) as u64 + 1,
                        BloodGroup::ONeg,
                        7,
                        day(1),
                    )
                })
            })
            .collect();

        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("issuer thread panicked"))
            .collect();

        let successes = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);
        assert!(results.iter().filter(|r| r.is_err()).all(|r| matches!(
            r,
            Err(Error::InsufficientStock { .. })
        )));

        let availability = AvailabilityEngine::new(&ledger);
        assert_eq!(availability.available_at(BloodGroup::ONeg, day(1)).unwrap(), 0);
        assert!(availability.verify_at(day(1)).unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_groups_never_overdraw() {
        let ledger = Arc::new(ledger());
        for g in BloodGroup::ALL {
            donate(&ledger, g, 20, 0);
        }

        let handles: Vec<_> = BloodGroup::ALL
            .into_iter()
            .flat_map(|g| [g, g, g])
            .enumerate()
            .map(|(i, requested)| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    let engine = AllocationEngine::new(&ledger);
                    let mut issued = 0u64;
                    while let Ok(r) = engine.issue_at((i % 16) as u64 + 1, requested, 3, day(1)) {
                        issued += u64::from(r.units);
                    }
                    issued
                })
            })
            .collect();

        let total: u64 = handles
            .into_iter()
            .map(|h| h.join().expect("issuer thread panicked"))
            .sum();

        // 8 groups x 20 units, drawn in 3-unit requests: each group ends with 2 left
        assert_eq!(total, 8 * 18);
        let availability = AvailabilityEngine::new(&ledger);
        for g in BloodGroup::ALL {
            let left = availability.available_at(g, day(1)).unwrap();
            assert_eq!(left, 2, "{} should keep its 2-unit remainder", g);
        }
        assert!(availability.verify_at(day(1)).unwrap().is_empty());
    }
}
