//! CSV export of the ledger.
//!
//! Writes `donations.csv`, `issues.csv` and `inventory.csv` into an output
//! directory. Each file is rewritten in full, always carries a header row and
//! is synced to disk before the next one is started.

use crate::availability::AvailabilityEngine;
use crate::{DonationRecord, InventoryRow, IssueRecord, Ledger, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize)]
struct DonationRow {
    id: u64,
    code: String,
    donor_id: u64,
    blood_group: &'static str,
    units: u32,
    donated_at: String,
    expires_at: String,
}

impl DonationRow {
    const HEADERS: [&'static str; 7] = [
        "id",
        "code",
        "donor_id",
        "blood_group",
        "units",
        "donated_at",
        "expires_at",
    ];
}

impl From<&DonationRecord> for DonationRow {
    fn from(d: &DonationRecord) -> Self {
        DonationRow {
            id: d.id,
            code: d.code.clone(),
            donor_id: d.donor_id,
            blood_group: d.blood_group.as_str(),
            units: d.units,
            donated_at: d.donated_at.to_rfc3339(),
            expires_at: d.expires_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
struct IssueRow {
    id: u64,
    recipient_id: u64,
    requested_group: &'static str,
    issued_group: &'static str,
    units: u32,
    issued_at: String,
    compatible: bool,
}

impl IssueRow {
    const HEADERS: [&'static str; 7] = [
        "id",
        "recipient_id",
        "requested_group",
        "issued_group",
        "units",
        "issued_at",
        "compatible",
    ];
}

impl From<&IssueRecord> for IssueRow {
    fn from(i: &IssueRecord) -> Self {
        IssueRow {
            id: i.id,
            recipient_id: i.recipient_id,
            requested_group: i.requested_group.as_str(),
            issued_group: i.issued_group.as_str(),
            units: i.units,
            issued_at: i.issued_at.to_rfc3339(),
            compatible: i.compatible,
        }
    }
}

#[derive(Debug, Serialize)]
struct InventoryCsvRow {
    blood_group: &'static str,
    available_units: u64,
    updated_at: Option<String>,
}

impl InventoryCsvRow {
    const HEADERS: [&'static str; 3] = ["blood_group", "available_units", "updated_at"];
}

impl From<&InventoryRow> for InventoryCsvRow {
    fn from(row: &InventoryRow) -> Self {
        InventoryCsvRow {
            blood_group: row.blood_group.as_str(),
            available_units: row.available_units,
            updated_at: row.updated_at.map(|t| t.to_rfc3339()),
        }
    }
}

/// What an export wrote and where
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    pub out_dir: PathBuf,
    pub donations: usize,
    pub issues: usize,
    pub inventory_rows: usize,
}

/// Export every donation, every issue and the availability table at `as_of`
pub fn export_ledger(ledger: &Ledger, out_dir: &Path, as_of: DateTime<Utc>) -> Result<ExportSummary> {
    std::fs::create_dir_all(out_dir)?;

    let donations = ledger.donations()?;
    write_csv(
        &out_dir.join("donations.csv"),
        &DonationRow::HEADERS,
        donations.iter().map(DonationRow::from),
    )?;

    let issues = ledger.issues()?;
    write_csv(
        &out_dir.join("issues.csv"),
        &IssueRow::HEADERS,
        issues.iter().map(IssueRow::from),
    )?;

    let snapshot = AvailabilityEngine::new(ledger).snapshot_at(as_of)?;
    write_csv(
        &out_dir.join("inventory.csv"),
        &InventoryCsvRow::HEADERS,
        snapshot.iter().map(InventoryCsvRow::from),
    )?;

    tracing::info!(
        "Exported {} donation(s) and {} issue(s) to {:?}",
        donations.len(),
        issues.len(),
        out_dir
    );

    Ok(ExportSummary {
        out_dir: out_dir.to_path_buf(),
        donations: donations.len(),
        issues: issues.len(),
        inventory_rows: snapshot.len(),
    })
}

fn write_csv<R, I>(path: &Path, headers: &[&str], rows: I) -> Result<()>
where
    R: Serialize,
    I: IntoIterator<Item = R>,
{
    let file = File::create(path)?;

    // Header written by hand so an empty table still gets one
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    writer.write_record(headers)?;
    for row in rows {
        writer.serialize(row)?;
    }

    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    file.sync_all()?;

    tracing::debug!("Wrote {:?}", path);
    Ok(())
}
