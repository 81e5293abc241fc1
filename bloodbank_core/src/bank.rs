//! Request/response surface over the ledger.
//!
//! [`BloodBank`] accepts the loosely typed requests a presentation layer
//! hands over (group names as strings, units as signed integers, optional
//! `YYYY-MM-DD` dates), validates them in a fixed order and turns them into
//! ledger operations. Receipts and reads serialize in camelCase.

use crate::allocation::AllocationEngine;
use crate::availability::AvailabilityEngine;
use crate::config::Config;
use crate::directory::Directory;
use crate::{
    parse_date, validate_units, BloodGroup, DonationRecord, DonorId, InventoryRow, IssueRecord,
    Ledger, LowStock, RecipientId, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DonationRequest {
    pub donor_id: DonorId,
    pub blood_group: String,
    pub units: i64,
    #[serde(default)]
    pub date: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DonationReceipt {
    pub code: String,
}

impl From<&DonationRecord> for DonationReceipt {
    fn from(record: &DonationRecord) -> Self {
        Self {
            code: record.code.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IssueRequest {
    pub recipient_id: RecipientId,
    pub requested_group: String,
    pub units: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IssueReceipt {
    pub issued_group: BloodGroup,
}

impl From<&IssueRecord> for IssueReceipt {
    fn from(record: &IssueRecord) -> Self {
        Self {
            issued_group: record.issued_group,
        }
    }
}

/// A ledger plus the configuration it runs under
pub struct BloodBank {
    ledger: Ledger,
    config: Config,
}

impl BloodBank {
    /// Open the WAL-backed ledger under `config.data.data_dir`
    pub fn open(config: Config, directory: Arc<dyn Directory>) -> Result<Self> {
        let wal_path = config.data.wal_path();
        let ledger = Ledger::open(&wal_path, directory)?;
        tracing::debug!("Opened ledger at {:?}", wal_path);
        Ok(Self { ledger, config })
    }

    /// A bank whose ledger never touches disk
    pub fn in_memory(config: Config, directory: Arc<dyn Directory>) -> Self {
        Self {
            ledger: Ledger::in_memory(directory),
            config,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Record a donation and return its receipt
    pub fn donate(&self, request: &DonationRequest) -> Result<DonationReceipt> {
        self.record_donation(request)
            .map(|record| DonationReceipt::from(&record))
    }

    /// Record a donation and return the full ledger record
    ///
    /// Checks run in order: blood group, units, date, donor.
    pub fn record_donation(&self, request: &DonationRequest) -> Result<DonationRecord> {
        let group = BloodGroup::normalize(&request.blood_group)?;
        let units = validate_units(request.units)?;
        let donated_at = request.date.as_deref().map(parse_date).transpose()?;
        self.ledger
            .append_donation(request.donor_id, group, units, donated_at)
    }

    pub fn issue(&self, request: &IssueRequest) -> Result<IssueReceipt> {
        self.issue_at(request, Utc::now())
    }

    /// Fill an issuance request as of `at`
    ///
    /// Checks run in order: blood group, units, recipient, stock.
    pub fn issue_at(&self, request: &IssueRequest, at: DateTime<Utc>) -> Result<IssueReceipt> {
        let (group, units) = parse_issue(request)?;
        let record =
            AllocationEngine::new(&self.ledger).issue_at(request.recipient_id, group, units, at)?;
        Ok(IssueReceipt::from(&record))
    }

    /// The group an issuance request would draw from, without committing
    pub fn plan(&self, request: &IssueRequest) -> Result<Option<BloodGroup>> {
        self.plan_at(request, Utc::now())
    }

    pub fn plan_at(
        &self,
        request: &IssueRequest,
        at: DateTime<Utc>,
    ) -> Result<Option<BloodGroup>> {
        let (group, units) = parse_issue(request)?;
        AllocationEngine::new(&self.ledger).plan(group, units, at)
    }

    /// One row for `group`, or the full 8-row table when `group` is `None`
    pub fn inventory(&self, group: Option<&str>) -> Result<Vec<InventoryRow>> {
        self.inventory_at(group, Utc::now())
    }

    pub fn inventory_at(
        &self,
        group: Option<&str>,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<InventoryRow>> {
        let engine = AvailabilityEngine::new(&self.ledger);
        match group {
            Some(name) => {
                let group = BloodGroup::normalize(name)?;
                Ok(vec![engine.row_at(group, as_of)?])
            }
            None => engine.snapshot_at(as_of),
        }
    }

    /// Low and out-of-stock groups; `threshold` defaults to the configured one
    pub fn low_stock(&self, threshold: Option<u64>) -> Result<LowStock> {
        self.low_stock_at(threshold, Utc::now())
    }

    pub fn low_stock_at(&self, threshold: Option<u64>, as_of: DateTime<Utc>) -> Result<LowStock> {
        let threshold = threshold.unwrap_or(self.config.stock.low_stock_threshold);
        AvailabilityEngine::new(&self.ledger).low_stock_at(threshold, as_of)
    }
}

fn parse_issue(request: &IssueRequest) -> Result<(BloodGroup, u32)> {
    let group = BloodGroup::normalize(&request.requested_group)?;
    let units = validate_units(request.units)?;
    Ok((group, units))
}
