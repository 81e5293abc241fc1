//! Append-only ledger of donation and issue events.
//!
//! The ledger is partitioned into one book per blood group, each behind its
//! own mutex. A donation touches the book of its group; an issue touches the
//! book of the group it was issued from. Operations on different groups never
//! contend, while every check-then-append against one group is serialised by
//! holding that group's [`GroupGuard`].
//!
//! When opened on a WAL path, each event is persisted before it is applied in
//! memory, and the books are rebuilt from the log on open.

use crate::availability::{recompute_available, StockCounter};
use crate::compatibility::{get_default_table, CompatibilityTable};
use crate::directory::Directory;
use crate::wal::{read_events, EventSink, JsonlSink};
use crate::{
    expiry_for, BloodGroup, DonationRecord, DonorId, Error, IssueRecord, IssueStatus,
    LedgerEvent, RecipientId, Result,
};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Records and cached availability for one blood group
#[derive(Debug, Default)]
struct GroupBook {
    donations: Vec<DonationRecord>,
    issues: Vec<IssueRecord>,
    counter: StockCounter,
    updated_at: Option<DateTime<Utc>>,
}

impl GroupBook {
    fn apply(&mut self, event: LedgerEvent) {
        let at = match &event {
            LedgerEvent::Donation(d) => d.donated_at,
            LedgerEvent::Issue(i) => i.issued_at,
        };
        self.updated_at = Some(self.updated_at.map_or(at, |prev| prev.max(at)));

        match event {
            LedgerEvent::Donation(d) => {
                self.counter.add_donation(d.expires_at, d.units);
                self.donations.push(d);
            }
            LedgerEvent::Issue(i) => {
                self.counter.add_issue(i.units);
                self.issues.push(i);
            }
        }
    }
}

/// The shared ledger
pub struct Ledger {
    books: [Mutex<GroupBook>; 8],
    sink: Option<Box<dyn EventSink>>,
    directory: Arc<dyn Directory>,
    table: &'static CompatibilityTable,
    next_donation_id: AtomicU64,
    next_issue_id: AtomicU64,
}

impl Ledger {
    /// A ledger that lives only in memory
    pub fn in_memory(directory: Arc<dyn Directory>) -> Self {
        Self {
            books: std::array::from_fn(|_| Mutex::new(GroupBook::default())),
            sink: None,
            directory,
            table: get_default_table(),
            next_donation_id: AtomicU64::new(1),
            next_issue_id: AtomicU64::new(1),
        }
    }

    /// Open a WAL-backed ledger, replaying any events already in the log
    pub fn open(wal_path: &Path, directory: Arc<dyn Directory>) -> Result<Self> {
        let events = read_events(wal_path)?;
        Self::with_sink(Box::new(JsonlSink::new(wal_path)), events, directory)
    }

    /// Build a ledger from already-persisted `events`, appending new ones to `sink`
    pub fn with_sink(
        sink: Box<dyn EventSink>,
        events: Vec<LedgerEvent>,
        directory: Arc<dyn Directory>,
    ) -> Result<Self> {
        let mut ledger = Self::in_memory(directory);
        ledger.replay(events)?;
        ledger.sink = Some(sink);
        Ok(ledger)
    }

    fn replay(&mut self, events: Vec<LedgerEvent>) -> Result<()> {
        let count = events.len();
        let mut max_donation = 0;
        let mut max_issue = 0;

        for event in events {
            match &event {
                LedgerEvent::Donation(d) => max_donation = max_donation.max(d.id),
                LedgerEvent::Issue(i) => max_issue = max_issue.max(i.id),
            }
            let group = event.group();
            self.books[group.index()]
                .get_mut()
                .map_err(|_| Error::State(format!("{} book poisoned during replay", group)))?
                .apply(event);
        }

        *self.next_donation_id.get_mut() = max_donation + 1;
        *self.next_issue_id.get_mut() = max_issue + 1;
        tracing::debug!("Replayed {} ledger events", count);
        Ok(())
    }

    pub fn table(&self) -> &'static CompatibilityTable {
        self.table
    }

    pub fn directory(&self) -> &dyn Directory {
        self.directory.as_ref()
    }

    /// Take the exclusive lock on one group's book
    pub fn lock(&self, group: BloodGroup) -> Result<GroupGuard<'_>> {
        let book = self.books[group.index()]
            .lock()
            .map_err(|_| Error::State(format!("{} ledger lock poisoned", group)))?;
        Ok(GroupGuard {
            ledger: self,
            group,
            book,
        })
    }

    /// Record a donation and return it, including its generated code
    ///
    /// `donated_at` defaults to now. The counter for `group` is updated under
    /// the same lock as the append.
    pub fn append_donation(
        &self,
        donor_id: DonorId,
        group: BloodGroup,
        units: u32,
        donated_at: Option<DateTime<Utc>>,
    ) -> Result<DonationRecord> {
        if units == 0 {
            return Err(Error::NonPositiveUnits(0));
        }
        if !self.directory.donor_exists(donor_id) {
            return Err(Error::DonorNotFound(donor_id));
        }
        let donated_at = donated_at.unwrap_or_else(Utc::now);

        let record = self.lock(group)?.append_donation(donor_id, units, donated_at)?;
        tracing::info!(
            "Recorded donation {}: {} unit(s) of {} from donor {}",
            record.code,
            record.units,
            record.blood_group,
            record.donor_id
        );
        Ok(record)
    }

    /// Record an issue without checking stock
    ///
    /// The caller must already have established sufficiency; use
    /// [`crate::AllocationEngine`] for the checked path.
    pub fn append_issue(
        &self,
        recipient_id: RecipientId,
        requested: BloodGroup,
        issued: BloodGroup,
        units: u32,
        issued_at: DateTime<Utc>,
    ) -> Result<IssueRecord> {
        if !self.directory.recipient_exists(recipient_id) {
            return Err(Error::RecipientNotFound(recipient_id));
        }
        self.lock(issued)?
            .append_issue(recipient_id, requested, units, issued_at)
    }

    /// Every donation across all groups, in id order
    pub fn donations(&self) -> Result<Vec<DonationRecord>> {
        let mut all = Vec::new();
        for group in BloodGroup::ALL {
            all.extend(self.lock(group)?.donations_of(None).cloned());
        }
        all.sort_by_key(|d| d.id);
        Ok(all)
    }

    /// Every issue across all groups, in id order
    pub fn issues(&self) -> Result<Vec<IssueRecord>> {
        let mut all = Vec::new();
        for group in BloodGroup::ALL {
            all.extend(self.lock(group)?.issues_of().cloned());
        }
        all.sort_by_key(|i| i.id);
        Ok(all)
    }

    fn persist(&self, event: &LedgerEvent) -> Result<()> {
        match &self.sink {
            Some(sink) => sink.append(event),
            None => Ok(()),
        }
    }
}

/// Exclusive access to one group's book
///
/// Everything read through a guard is consistent with everything appended
/// through it until the guard drops.
pub struct GroupGuard<'a> {
    ledger: &'a Ledger,
    group: BloodGroup,
    book: MutexGuard<'a, GroupBook>,
}

impl<'a> GroupGuard<'a> {
    pub fn group(&self) -> BloodGroup {
        self.group
    }

    /// Donations of this group, restricted to those usable at `as_of` if given
    pub fn donations_of(
        &self,
        as_of: Option<DateTime<Utc>>,
    ) -> impl Iterator<Item = &DonationRecord> + '_ {
        self.book
            .donations
            .iter()
            .filter(move |d| as_of.map_or(true, |t| d.is_usable(t)))
    }

    /// Issues drawn from this group
    pub fn issues_of(&self) -> impl Iterator<Item = &IssueRecord> + '_ {
        self.book.issues.iter()
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.book.updated_at
    }

    /// Available units at `as_of`
    ///
    /// Served by the incremental counter; reads older than the counter's
    /// watermark are recomputed from the records instead.
    pub fn available(&mut self, as_of: DateTime<Utc>) -> u64 {
        match self.book.counter.available(as_of) {
            Some(units) => units,
            None => self.recompute(as_of),
        }
    }

    /// Available units at `as_of` folded from the raw records
    pub fn recompute(&self, as_of: DateTime<Utc>) -> u64 {
        recompute_available(&self.book.donations, &self.book.issues, as_of)
    }

    pub(crate) fn counter_available(&mut self, as_of: DateTime<Utc>) -> Option<u64> {
        self.book.counter.available(as_of)
    }

    pub(crate) fn rebuild_counter(&mut self) {
        let book = &mut *self.book;
        book.counter = StockCounter::from_records(&book.donations, &book.issues);
    }

    #[cfg(test)]
    pub(crate) fn counter_mut(&mut self) -> &mut StockCounter {
        &mut self.book.counter
    }

    pub(crate) fn append_donation(
        &mut self,
        donor_id: DonorId,
        units: u32,
        donated_at: DateTime<Utc>,
    ) -> Result<DonationRecord> {
        let id = self.ledger.next_donation_id.fetch_add(1, Ordering::SeqCst);
        let record = DonationRecord {
            id,
            code: format!(
                "D-{}-{}-{:06}",
                donated_at.format("%Y%m%d%H%M%S"),
                donor_id,
                id
            ),
            donor_id,
            blood_group: self.group,
            units,
            donated_at,
            expires_at: expiry_for(donated_at),
        };

        let event = LedgerEvent::Donation(record.clone());
        self.ledger.persist(&event)?;
        self.book.apply(event);
        Ok(record)
    }

    pub(crate) fn append_issue(
        &mut self,
        recipient_id: RecipientId,
        requested: BloodGroup,
        units: u32,
        issued_at: DateTime<Utc>,
    ) -> Result<IssueRecord> {
        if units == 0 {
            return Err(Error::NonPositiveUnits(0));
        }
        let compatible = self.ledger.table.allows(requested, self.group);
        if !compatible {
            return Err(Error::IncompatibleGroup {
                requested,
                issued: self.group,
            });
        }

        let record = IssueRecord {
            id: self.ledger.next_issue_id.fetch_add(1, Ordering::SeqCst),
            recipient_id,
            requested_group: requested,
            issued_group: self.group,
            units,
            issued_at,
            compatible,
            status: IssueStatus::Issued,
        };

        let event = LedgerEvent::Issue(record.clone());
        self.ledger.persist(&event)?;
        self.book.apply(event);
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::tests::open_directory;
    use crate::{parse_date, wal::read_events};
    use chrono::Duration;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    fn day(n: i64) -> DateTime<Utc> {
        parse_date("2026-01-01").unwrap() + Duration::days(n)
    }

    fn ledger() -> Ledger {
        Ledger::in_memory(Arc::new(open_directory()))
    }

    /// Sink that refuses every write
    struct BrokenSink;

    impl EventSink for BrokenSink {
        fn append(&self, _event: &LedgerEvent) -> Result<()> {
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        }
    }

    /// Sink that remembers what it was given
    #[derive(Default)]
    struct MemorySink(StdMutex<Vec<LedgerEvent>>);

    impl EventSink for Arc<MemorySink> {
        fn append(&self, event: &LedgerEvent) -> Result<()> {
            self.0.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    #[test]
    fn test_append_donation_sets_expiry_and_code() {
        let ledger = ledger();
        let record = ledger
            .append_donation(2, BloodGroup::APos, 4, Some(day(0)))
            .unwrap();

        assert_eq!(record.expires_at, day(42));
        assert_eq!(record.code, "D-20260101000000-2-000001");
        assert_eq!(record.blood_group, BloodGroup::APos);
    }

    #[test]
    fn test_donation_codes_are_unique() {
        let ledger = ledger();
        let codes: HashSet<_> = (0..20)
            .map(|_| {
                ledger
                    .append_donation(1, BloodGroup::OPos, 1, Some(day(0)))
                    .unwrap()
                    .code
            })
            .collect();
        assert_eq!(codes.len(), 20);
    }

    #[test]
    fn test_donation_validation() {
        let ledger = ledger();
        assert!(matches!(
            ledger.append_donation(1, BloodGroup::ONeg, 0, None),
            Err(Error::NonPositiveUnits(0))
        ));
        assert!(matches!(
            ledger.append_donation(999, BloodGroup::ONeg, 1, None),
            Err(Error::DonorNotFound(999))
        ));
        assert_eq!(ledger.donations().unwrap().len(), 0);
    }

    #[test]
    fn test_issue_outside_compatibility_is_rejected() {
        let ledger = ledger();
        ledger
            .append_donation(1, BloodGroup::APos, 5, Some(day(0)))
            .unwrap();
        let result = ledger.append_issue(1, BloodGroup::ONeg, BloodGroup::APos, 1, day(1));
        assert!(matches!(
            result,
            Err(Error::IncompatibleGroup {
                requested: BloodGroup::ONeg,
                issued: BloodGroup::APos
            })
        ));
        assert!(ledger.issues().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_recipient_is_rejected() {
        let ledger = ledger();
        assert!(matches!(
            ledger.append_issue(404, BloodGroup::ONeg, BloodGroup::ONeg, 1, day(0)),
            Err(Error::RecipientNotFound(404))
        ));
    }

    #[test]
    fn test_donations_of_filters_by_expiry() {
        let ledger = ledger();
        ledger
            .append_donation(1, BloodGroup::BNeg, 1, Some(day(0)))
            .unwrap();
        ledger
            .append_donation(1, BloodGroup::BNeg, 2, Some(day(30)))
            .unwrap();

        let guard = ledger.lock(BloodGroup::BNeg).unwrap();
        assert_eq!(guard.donations_of(None).count(), 2);
        let usable: Vec<u32> = guard.donations_of(Some(day(50))).map(|d| d.units).collect();
        assert_eq!(usable, vec![2]);
        // Restartable: a second pass sees the same records
        assert_eq!(guard.donations_of(None).count(), 2);
    }

    #[test]
    fn test_failed_persist_leaves_no_trace() {
        let ledger = Ledger::with_sink(
            Box::new(BrokenSink),
            Vec::new(),
            Arc::new(open_directory()),
        )
        .unwrap();

        assert!(ledger
            .append_donation(1, BloodGroup::ONeg, 3, Some(day(0)))
            .is_err());

        let mut guard = ledger.lock(BloodGroup::ONeg).unwrap();
        assert_eq!(guard.donations_of(None).count(), 0);
        assert_eq!(guard.available(day(0)), 0);
        assert_eq!(guard.updated_at(), None);
    }

    #[test]
    fn test_events_reach_sink_in_commit_order() {
        let sink = Arc::new(MemorySink::default());
        let ledger = Ledger::with_sink(
            Box::new(Arc::clone(&sink)),
            Vec::new(),
            Arc::new(open_directory()),
        )
        .unwrap();

        ledger
            .append_donation(1, BloodGroup::ONeg, 3, Some(day(0)))
            .unwrap();
        ledger
            .append_issue(1, BloodGroup::AbPos, BloodGroup::ONeg, 1, day(1))
            .unwrap();

        let seen = sink.0.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(matches!(seen[0], LedgerEvent::Donation(_)));
        assert!(matches!(seen[1], LedgerEvent::Issue(_)));
    }

    #[test]
    fn test_reopen_replays_wal() {
        let temp_dir = tempfile::tempdir().unwrap();
        let wal_path = temp_dir.path().join("wal").join("ledger.wal");
        let directory = Arc::new(open_directory());

        {
            let ledger = Ledger::open(&wal_path, directory.clone()).unwrap();
            ledger
                .append_donation(1, BloodGroup::ONeg, 5, Some(day(0)))
                .unwrap();
            ledger
                .append_issue(1, BloodGroup::AbPos, BloodGroup::ONeg, 3, day(1))
                .unwrap();
        }
        assert_eq!(read_events(&wal_path).unwrap().len(), 2);

        let ledger = Ledger::open(&wal_path, directory).unwrap();
        let mut guard = ledger.lock(BloodGroup::ONeg).unwrap();
        assert_eq!(guard.available(day(2)), 2);
        assert_eq!(guard.updated_at(), Some(day(1)));
        drop(guard);

        // Ids continue after the replayed maximum
        let next = ledger
            .append_donation(1, BloodGroup::ONeg, 1, Some(day(2)))
            .unwrap();
        assert_eq!(next.id, 2);
        let issue = ledger
            .append_issue(1, BloodGroup::ONeg, BloodGroup::ONeg, 1, day(2))
            .unwrap();
        assert_eq!(issue.id, 2);
    }
}
