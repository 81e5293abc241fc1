//! Error types for the bloodbank_core library.

use crate::BloodGroup;
use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for bloodbank_core operations
///
/// The first block of variants are business-rule and validation failures.
/// They are reported synchronously and never retried. The rest wrap
/// infrastructure failures from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Input is not one of the eight recognised blood groups
    #[error("Invalid blood group {0:?}. Allowed: O-, O+, A-, A+, B-, B+, AB-, AB+")]
    InvalidBloodGroup(String),

    /// Units must be a strictly positive integer
    #[error("Units must be positive, got {0}")]
    NonPositiveUnits(i64),

    /// Units beyond what a single record can hold
    #[error("Units must be at most {}, got {0}", u32::MAX)]
    TooManyUnits(i64),

    /// Date input could not be parsed as YYYY-MM-DD
    #[error("Invalid date {0:?}, expected YYYY-MM-DD")]
    InvalidDate(String),

    #[error("Donor {0} not found")]
    DonorNotFound(u64),

    #[error("Recipient {0} not found")]
    RecipientNotFound(u64),

    /// No compatible group holds enough stock for the request
    #[error("Insufficient compatible stock for {units} unit(s) of {requested}")]
    InsufficientStock { requested: BloodGroup, units: u32 },

    /// An issue was attempted from a group outside the compatibility set
    #[error("{issued} cannot be issued against a {requested} request")]
    IncompatibleGroup {
        requested: BloodGroup,
        issued: BloodGroup,
    },

    /// Directory field validation error
    #[error("Invalid field: {0}")]
    InvalidField(String),

    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Ledger state error (poisoned locks, broken invariants)
    #[error("State error: {0}")]
    State(String),
}

impl Error {
    /// True for the validation and business-rule kinds a caller can act on.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::InvalidBloodGroup(_)
                | Error::NonPositiveUnits(_)
                | Error::TooManyUnits(_)
                | Error::InvalidDate(_)
                | Error::DonorNotFound(_)
                | Error::RecipientNotFound(_)
                | Error::InsufficientStock { .. }
                | Error::IncompatibleGroup { .. }
                | Error::InvalidField(_)
        )
    }
}
