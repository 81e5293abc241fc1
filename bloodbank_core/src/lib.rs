#![forbid(unsafe_code)]

//! Core stock ledger and allocation logic for the blood bank.
//!
//! This crate provides:
//! - Domain types (blood groups, donation and issue records)
//! - The compatibility table and first-fit allocation
//! - A per-group locked ledger with incremental availability counters
//! - Persistence (WAL, registry file, CSV export)
//! - The donor/recipient directory

pub mod types;
pub mod error;
pub mod compatibility;
pub mod config;
pub mod logging;
pub mod wal;
pub mod ledger;
pub mod availability;
pub mod allocation;
pub mod directory;
pub mod bank;
pub mod export;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use compatibility::{get_default_table, CompatibilityTable};
pub use config::Config;
pub use wal::{DataDirLock, EventSink, JsonlSink};
pub use ledger::{GroupGuard, Ledger};
pub use availability::{AvailabilityEngine, Drift};
pub use allocation::AllocationEngine;
pub use directory::{Directory, Registry};
pub use bank::{BloodBank, DonationReceipt, DonationRequest, IssueReceipt, IssueRequest};
pub use export::{export_ledger, ExportSummary};
