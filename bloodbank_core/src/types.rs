//! Core domain types for the blood bank ledger.
//!
//! This module defines the fundamental types used throughout the system:
//! - Blood groups and their boundary normalisation
//! - Donation and issue records (the two ledger event kinds)
//! - Derived availability views

use crate::{Error, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Days a donated unit stays usable after the donation timestamp
pub const SHELF_LIFE_DAYS: i64 = 42;

pub type DonorId = u64;
pub type RecipientId = u64;

// ============================================================================
// Blood Groups
// ============================================================================

/// One of the eight ABO/RhD groups tracked by the bank
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BloodGroup {
    #[serde(rename = "O-")]
    ONeg,
    #[serde(rename = "O+")]
    OPos,
    #[serde(rename = "A-")]
    ANeg,
    #[serde(rename = "A+")]
    APos,
    #[serde(rename = "B-")]
    BNeg,
    #[serde(rename = "B+")]
    BPos,
    #[serde(rename = "AB-")]
    AbNeg,
    #[serde(rename = "AB+")]
    AbPos,
}

impl BloodGroup {
    /// All groups in canonical table order
    pub const ALL: [BloodGroup; 8] = [
        BloodGroup::ONeg,
        BloodGroup::OPos,
        BloodGroup::ANeg,
        BloodGroup::APos,
        BloodGroup::BNeg,
        BloodGroup::BPos,
        BloodGroup::AbNeg,
        BloodGroup::AbPos,
    ];

    /// Position in [`BloodGroup::ALL`]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BloodGroup::ONeg => "O-",
            BloodGroup::OPos => "O+",
            BloodGroup::ANeg => "A-",
            BloodGroup::APos => "A+",
            BloodGroup::BNeg => "B-",
            BloodGroup::BPos => "B+",
            BloodGroup::AbNeg => "AB-",
            BloodGroup::AbPos => "AB+",
        }
    }

    /// Normalise free-form input (`" ab+ "` -> `AB+`), rejecting anything else
    pub fn normalize(input: &str) -> Result<Self> {
        input.parse()
    }
}

impl FromStr for BloodGroup {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_uppercase();
        BloodGroup::ALL
            .into_iter()
            .find(|g| g.as_str() == wanted)
            .ok_or_else(|| Error::InvalidBloodGroup(s.to_string()))
    }
}

impl fmt::Display for BloodGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Boundary validation
// ============================================================================

/// Validate a unit count coming from outside the core
///
/// Records store units as `u32`, so anything above `u32::MAX` is refused.
pub fn validate_units(units: i64) -> Result<u32> {
    if units <= 0 {
        return Err(Error::NonPositiveUnits(units));
    }
    u32::try_from(units).map_err(|_| Error::TooManyUnits(units))
}

/// Parse a `YYYY-MM-DD` date into midnight UTC of that day
pub fn parse_date(input: &str) -> Result<DateTime<Utc>> {
    let day = NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d")
        .map_err(|_| Error::InvalidDate(input.to_string()))?;
    Ok(day.and_time(chrono::NaiveTime::MIN).and_utc())
}

/// Expiry timestamp for a donation made at `donated_at`
pub fn expiry_for(donated_at: DateTime<Utc>) -> DateTime<Utc> {
    donated_at + Duration::days(SHELF_LIFE_DAYS)
}

// ============================================================================
// Ledger Records
// ============================================================================

/// A donation event. Immutable once appended.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DonationRecord {
    pub id: u64,
    pub code: String,
    pub donor_id: DonorId,
    pub blood_group: BloodGroup,
    pub units: u32,
    pub donated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DonationRecord {
    /// Whether the units still count toward availability at `as_of`
    pub fn is_usable(&self, as_of: DateTime<Utc>) -> bool {
        self.expires_at >= as_of
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Issued,
}

/// An issuance event. Immutable once appended.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IssueRecord {
    pub id: u64,
    pub recipient_id: RecipientId,
    pub requested_group: BloodGroup,
    pub issued_group: BloodGroup,
    pub units: u32,
    pub issued_at: DateTime<Utc>,
    pub compatible: bool,
    pub status: IssueStatus,
}

/// One line of the write-ahead log
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LedgerEvent {
    Donation(DonationRecord),
    Issue(IssueRecord),
}

impl LedgerEvent {
    /// The group whose stock this event moves
    pub fn group(&self) -> BloodGroup {
        match self {
            LedgerEvent::Donation(d) => d.blood_group,
            LedgerEvent::Issue(i) => i.issued_group,
        }
    }
}

// ============================================================================
// Derived Views
// ============================================================================

/// One row of the availability table
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InventoryRow {
    pub blood_group: BloodGroup,
    pub available_units: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Groups running low (`0 < available < threshold`) or out (`available == 0`)
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct LowStock {
    pub low: Vec<BloodGroup>,
    pub out: Vec<BloodGroup>,
}
