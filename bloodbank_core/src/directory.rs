//! Donor and recipient directory.
//!
//! The ledger only needs to know whether a donor or recipient exists; that
//! question is answered through the [`Directory`] trait. [`Registry`] is the
//! file-backed implementation the CLI uses, persisted as JSON with file
//! locking and atomic replacement.

use crate::compatibility::get_default_table;
use crate::{BloodGroup, DonorId, Error, LedgerEvent, RecipientId, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tempfile::NamedTempFile;

/// Existence checks the ledger relies on
pub trait Directory: Send + Sync {
    fn donor_exists(&self, id: DonorId) -> bool;
    fn recipient_exists(&self, id: RecipientId) -> bool;
}

// ============================================================================
// Records
// ============================================================================

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Gender {
    Male,
    Female,
    Other,
}

impl FromStr for Gender {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "male" | "m" => Ok(Gender::Male),
            "female" | "f" => Ok(Gender::Female),
            "other" => Ok(Gender::Other),
            _ => Err(Error::InvalidField(format!(
                "gender must be Male, Female or Other, got {:?}",
                s
            ))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Donor {
    pub id: DonorId,
    pub name: String,
    pub age: u32,
    pub gender: Option<Gender>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub blood_group: BloodGroup,
    pub last_donation_date: Option<NaiveDate>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Recipient {
    pub id: RecipientId,
    pub name: String,
    pub age: u32,
    pub required_blood_group: BloodGroup,
    pub quantity_needed: u32,
    pub hospital_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields for a new donor
#[derive(Clone, Debug)]
pub struct NewDonor {
    pub name: String,
    pub age: u32,
    pub gender: Option<Gender>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub blood_group: BloodGroup,
    pub last_donation_date: Option<NaiveDate>,
}

/// Partial donor edit; `None` leaves the field untouched
#[derive(Clone, Debug, Default)]
pub struct DonorUpdate {
    pub name: Option<String>,
    pub age: Option<u32>,
    pub gender: Option<Gender>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub blood_group: Option<BloodGroup>,
    pub last_donation_date: Option<NaiveDate>,
}

/// Fields for a new recipient
#[derive(Clone, Debug)]
pub struct NewRecipient {
    pub name: String,
    pub age: u32,
    pub required_blood_group: BloodGroup,
    pub quantity_needed: u32,
    pub hospital_name: Option<String>,
}

/// Partial recipient edit; `None` leaves the field untouched
#[derive(Clone, Debug, Default)]
pub struct RecipientUpdate {
    pub name: Option<String>,
    pub age: Option<u32>,
    pub required_blood_group: Option<BloodGroup>,
    pub quantity_needed: Option<u32>,
    pub hospital_name: Option<String>,
}

fn clean_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidField("name must not be empty".into()));
    }
    Ok(trimmed.to_string())
}

fn positive(field: &str, value: u32) -> Result<u32> {
    if value == 0 {
        return Err(Error::InvalidField(format!("{} must be positive", field)));
    }
    Ok(value)
}

// ============================================================================
// Registry
// ============================================================================

/// All known donors and recipients
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Registry {
    #[serde(default)]
    donors: BTreeMap<DonorId, Donor>,
    #[serde(default)]
    recipients: BTreeMap<RecipientId, Recipient>,
    #[serde(default = "first_id")]
    next_donor_id: DonorId,
    #[serde(default = "first_id")]
    next_recipient_id: RecipientId,
}

fn first_id() -> u64 {
    1
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            donors: BTreeMap::new(),
            recipients: BTreeMap::new(),
            next_donor_id: first_id(),
            next_recipient_id: first_id(),
        }
    }
}

impl Directory for Registry {
    fn donor_exists(&self, id: DonorId) -> bool {
        self.donors.contains_key(&id)
    }

    fn recipient_exists(&self, id: RecipientId) -> bool {
        self.recipients.contains_key(&id)
    }
}

impl Registry {
    pub fn add_donor(&mut self, new: NewDonor) -> Result<DonorId> {
        let donor = Donor {
            id: 0,
            name: clean_name(&new.name)?,
            age: positive("age", new.age)?,
            gender: new.gender,
            phone: new.phone,
            address: new.address,
            blood_group: new.blood_group,
            last_donation_date: new.last_donation_date,
        };

        // Ids are never reused, even after removal
        let id = self
            .next_donor_id
            .max(self.donors.keys().next_back().map_or(1, |k| k + 1));
        self.next_donor_id = id + 1;
        self.donors.insert(id, Donor { id, ..donor });
        Ok(id)
    }

    /// Apply `update`, validating every field before touching the record
    pub fn update_donor(&mut self, id: DonorId, update: DonorUpdate) -> Result<()> {
        let name = update.name.as_deref().map(clean_name).transpose()?;
        let age = update.age.map(|a| positive("age", a)).transpose()?;

        let donor = self.donors.get_mut(&id).ok_or(Error::DonorNotFound(id))?;
        if let Some(name) = name {
            donor.name = name;
        }
        if let Some(age) = age {
            donor.age = age;
        }
        if let Some(gender) = update.gender {
            donor.gender = Some(gender);
        }
        if let Some(phone) = update.phone {
            donor.phone = Some(phone);
        }
        if let Some(address) = update.address {
            donor.address = Some(address);
        }
        if let Some(group) = update.blood_group {
            donor.blood_group = group;
        }
        if let Some(date) = update.last_donation_date {
            donor.last_donation_date = Some(date);
        }
        Ok(())
    }

    /// Remove a donor. Ledger events that reference it are left intact.
    pub fn remove_donor(&mut self, id: DonorId) -> Result<Donor> {
        self.donors.remove(&id).ok_or(Error::DonorNotFound(id))
    }

    pub fn donor(&self, id: DonorId) -> Option<&Donor> {
        self.donors.get(&id)
    }

    /// Donors sorted by name
    pub fn donors(&self) -> Vec<&Donor> {
        let mut donors: Vec<_> = self.donors.values().collect();
        donors.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        donors
    }

    /// Note that `id` donated on `date`
    pub fn record_donation_date(&mut self, id: DonorId, date: NaiveDate) -> Result<()> {
        let donor = self.donors.get_mut(&id).ok_or(Error::DonorNotFound(id))?;
        donor.last_donation_date = Some(date);
        Ok(())
    }

    /// Donors who have never donated or last donated at least `days` before `today`
    pub fn eligible_donors(&self, today: NaiveDate, days: i64) -> Vec<&Donor> {
        self.donors()
            .into_iter()
            .filter(|d| match d.last_donation_date {
                None => true,
                Some(last) => today - last >= Duration::days(days),
            })
            .collect()
    }

    /// Donors whose blood a `recipient_group` patient may receive
    pub fn compatible_donors(&self, recipient_group: BloodGroup) -> Vec<&Donor> {
        let table = get_default_table();
        self.donors()
            .into_iter()
            .filter(|d| table.allows(recipient_group, d.blood_group))
            .collect()
    }

    /// Donors matching every given filter, sorted by name
    ///
    /// `term` matches a substring of the name or phone and `location` a
    /// substring of the address, both ignoring case. Blank filters match all.
    pub fn search_donors(
        &self,
        term: Option<&str>,
        group: Option<BloodGroup>,
        location: Option<&str>,
    ) -> Vec<&Donor> {
        let needle = |s: Option<&str>| {
            s.map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
        };
        let contains = |field: Option<&str>, needle: &str| {
            field.is_some_and(|f| f.to_lowercase().contains(needle))
        };
        let term = needle(term);
        let location = needle(location);

        self.donors()
            .into_iter()
            .filter(|d| {
                term.as_deref().map_or(true, |t| {
                    contains(Some(d.name.as_str()), t) || contains(d.phone.as_deref(), t)
                })
            })
            .filter(|d| group.map_or(true, |g| d.blood_group == g))
            .filter(|d| {
                location
                    .as_deref()
                    .map_or(true, |l| contains(d.address.as_deref(), l))
            })
            .collect()
    }

    pub fn add_recipient(&mut self, new: NewRecipient) -> Result<RecipientId> {
        self.add_recipient_at(new, Utc::now())
    }

    pub fn add_recipient_at(
        &mut self,
        new: NewRecipient,
        created_at: DateTime<Utc>,
    ) -> Result<RecipientId> {
        let id = self
            .next_recipient_id
            .max(self.recipients.keys().next_back().map_or(1, |k| k + 1));
        let recipient = Recipient {
            id,
            name: clean_name(&new.name)?,
            age: positive("age", new.age)?,
            required_blood_group: new.required_blood_group,
            quantity_needed: positive("quantity_needed", new.quantity_needed)?,
            hospital_name: new.hospital_name,
            created_at,
        };
        self.next_recipient_id = id + 1;
        self.recipients.insert(id, recipient);
        Ok(id)
    }

    pub fn update_recipient(&mut self, id: RecipientId, update: RecipientUpdate) -> Result<()> {
        let name = update.name.as_deref().map(clean_name).transpose()?;
        let age = update.age.map(|a| positive("age", a)).transpose()?;
        let quantity = update
            .quantity_needed
            .map(|q| positive("quantity_needed", q))
            .transpose()?;

        let recipient = self
            .recipients
            .get_mut(&id)
            .ok_or(Error::RecipientNotFound(id))?;
        if let Some(name) = name {
            recipient.name = name;
        }
        if let Some(age) = age {
            recipient.age = age;
        }
        if let Some(group) = update.required_blood_group {
            recipient.required_blood_group = group;
        }
        if let Some(quantity) = quantity {
            recipient.quantity_needed = quantity;
        }
        if let Some(hospital) = update.hospital_name {
            recipient.hospital_name = Some(hospital);
        }
        Ok(())
    }

    pub fn remove_recipient(&mut self, id: RecipientId) -> Result<Recipient> {
        self.recipients
            .remove(&id)
            .ok_or(Error::RecipientNotFound(id))
    }

    pub fn recipient(&self, id: RecipientId) -> Option<&Recipient> {
        self.recipients.get(&id)
    }

    /// Recipients, newest first
    pub fn recipients(&self) -> Vec<&Recipient> {
        let mut recipients: Vec<_> = self.recipients.values().collect();
        recipients.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        recipients
    }
}

// ============================================================================
// Persistence
// ============================================================================

impl Registry {
    /// Load the registry for reading
    ///
    /// Returns an empty registry if the file doesn't exist.
    /// If the file is unreadable or corrupted, logs a warning and returns an
    /// empty registry. Mutations go through [`Registry::update`], which
    /// refuses a corrupt file instead.
    pub fn load(path: &Path) -> Result<Self> {
        match Self::read(path) {
            Ok(registry) => Ok(registry),
            Err(e) => {
                tracing::warn!("{}. Starting empty.", e);
                Ok(Self::default())
            }
        }
    }

    /// Load the registry, failing on anything but a missing file
    fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No registry file found, starting empty");
            return Ok(Self::default());
        }

        let file = File::open(path)?;
        file.lock_shared()?;

        let mut contents = String::new();
        let read = std::io::BufReader::new(&file).read_to_string(&mut contents);
        file.unlock()?;
        read?;

        let registry = serde_json::from_str::<Registry>(&contents).map_err(|e| {
            Error::State(format!("Registry {:?} is corrupt: {}", path, e))
        })?;
        tracing::debug!("Loaded registry from {:?}", path);
        Ok(registry)
    }

    /// Move a corrupt registry aside and start a fresh one
    ///
    /// The fresh registry hands out ids above every donor and recipient id
    /// in `events`, so ledger records never point at a newly added party.
    /// Returns where the old file went, or `None` if it was readable and
    /// nothing was done.
    pub fn recover(path: &Path, events: &[LedgerEvent]) -> Result<Option<PathBuf>> {
        if !path.exists() || Self::read(path).is_ok() {
            return Ok(None);
        }

        let mut aside = path.as_os_str().to_owned();
        aside.push(format!(".corrupt-{}", Utc::now().format("%Y%m%d%H%M%S")));
        let aside = PathBuf::from(aside);
        std::fs::rename(path, &aside)?;

        let mut registry = Self::default();
        for event in events {
            match event {
                LedgerEvent::Donation(d) => registry.reserve_donor_id(d.donor_id),
                LedgerEvent::Issue(i) => registry.reserve_recipient_id(i.recipient_id),
            }
        }
        registry.save(path)?;

        tracing::warn!(
            "Moved corrupt registry to {:?}; new ids start at donor {} and recipient {}",
            aside,
            registry.next_donor_id,
            registry.next_recipient_id
        );
        Ok(Some(aside))
    }

    fn reserve_donor_id(&mut self, used: DonorId) {
        self.next_donor_id = self.next_donor_id.max(used + 1);
    }

    fn reserve_recipient_id(&mut self, used: RecipientId) {
        self.next_recipient_id = self.next_recipient_id.max(used + 1);
    }

    /// Save the registry atomically: temp file, sync, rename over the original
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path.parent().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "registry path missing parent")
        })?;
        std::fs::create_dir_all(parent)?;

        let temp = NamedTempFile::new_in(parent)?;
        temp.as_file().lock_exclusive()?;

        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            let contents = serde_json::to_string_pretty(self)?;
            writer.write_all(contents.as_bytes())?;
            writer.flush()?;
        }

        temp.as_file().sync_all()?;
        temp.as_file().unlock()?;

        temp.persist(path).map_err(|e| Error::Io(e.error))?;

        tracing::debug!("Saved registry to {:?}", path);
        Ok(())
    }

    /// Load, modify and save back, returning the modified registry
    ///
    /// A corrupt file is never overwritten; see [`Registry::recover`].
    pub fn update<F, T>(path: &Path, f: F) -> Result<(Self, T)>
    where
        F: FnOnce(&mut Registry) -> Result<T>,
    {
        let mut registry = Self::read(path)?;
        let out = f(&mut registry)?;
        registry.save(path)?;
        Ok((registry, out))
    }
}
