use bloodbank_core::directory::{
    DonorUpdate, Gender, NewDonor, NewRecipient, RecipientUpdate, Registry,
};
use bloodbank_core::*;
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "bbank")]
#[command(about = "Blood bank stock ledger", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Read configuration from this file instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Log at info level instead of warn
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage donors
    Donor {
        #[command(subcommand)]
        action: DonorCommand,
    },

    /// Manage recipients
    Recipient {
        #[command(subcommand)]
        action: RecipientCommand,
    },

    /// Record a donation
    Donate {
        #[arg(long)]
        donor: DonorId,

        /// Blood group of the donated units (O-, O+, A-, A+, B-, B+, AB-, AB+)
        #[arg(long)]
        group: String,

        #[arg(long, allow_hyphen_values = true)]
        units: i64,

        /// Donation date (YYYY-MM-DD), defaults to now
        #[arg(long)]
        date: Option<String>,
    },

    /// Issue blood to a recipient, substituting compatible groups if needed
    Issue {
        #[arg(long)]
        recipient: RecipientId,

        /// Requested blood group
        #[arg(long)]
        group: String,

        #[arg(long, allow_hyphen_values = true)]
        units: i64,

        /// Show which group would be issued without recording anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Show available units per blood group
    Inventory {
        #[arg(long)]
        group: Option<String>,
    },

    /// List groups running low or out of stock
    LowStock {
        /// Defaults to stock.low_stock_threshold from the config
        #[arg(long)]
        threshold: Option<u64>,
    },

    /// Show which donor groups a recipient group can receive
    Compat { group: String },

    /// List recorded donations
    Donations {
        #[arg(long)]
        group: Option<String>,
    },

    /// List recorded issues
    Issues {
        /// Filter by the group the units were issued from
        #[arg(long)]
        group: Option<String>,
    },

    /// Check the availability counters against the ledger
    ///
    /// Every run rebuilds the counters by replaying the WAL event by event,
    /// then compares each group's counter with a full recompute over the
    /// same events. Drift therefore points at the incremental bookkeeping,
    /// not at a stale cache left by an earlier run.
    Verify {
        /// Rebuild any counter that disagrees
        #[arg(long)]
        repair: bool,
    },

    /// Export the ledger and current inventory to CSV
    Export {
        /// Output directory, defaults to <data_dir>/export
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Move an unreadable registry aside and start a fresh one
    ///
    /// New donor and recipient ids continue above every id the ledger
    /// already references.
    RecoverRegistry,
}

#[derive(Subcommand)]
enum DonorCommand {
    /// Register a donor
    Add(DonorFields),
    /// List donors by name
    List,
    /// Change fields of an existing donor
    Update {
        id: DonorId,
        #[command(flatten)]
        fields: DonorEdit,
    },
    /// Remove a donor (recorded donations are kept)
    Remove { id: DonorId },
    /// Donors who may donate again
    Eligible {
        /// Reference day (YYYY-MM-DD), defaults to today
        #[arg(long)]
        date: Option<String>,
    },
    /// Donors whose blood a recipient group can receive
    Compatible { group: String },
    /// Find donors by name or phone, group and address
    Search {
        /// Part of the name or phone number
        #[arg(long)]
        term: Option<String>,
        #[arg(long)]
        group: Option<String>,
        /// Part of the address
        #[arg(long)]
        location: Option<String>,
    },
}

#[derive(Args)]
struct DonorFields {
    #[arg(long)]
    name: String,
    #[arg(long)]
    age: u32,
    #[arg(long)]
    group: String,
    #[arg(long)]
    gender: Option<String>,
    #[arg(long)]
    phone: Option<String>,
    #[arg(long)]
    address: Option<String>,
    /// Last donation date (YYYY-MM-DD)
    #[arg(long)]
    last_donation: Option<String>,
}

#[derive(Args)]
struct DonorEdit {
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    age: Option<u32>,
    #[arg(long)]
    group: Option<String>,
    #[arg(long)]
    gender: Option<String>,
    #[arg(long)]
    phone: Option<String>,
    #[arg(long)]
    address: Option<String>,
    #[arg(long)]
    last_donation: Option<String>,
}

#[derive(Subcommand)]
enum RecipientCommand {
    /// Register a recipient
    Add(RecipientFields),
    /// List recipients, newest first
    List,
    /// Change fields of an existing recipient
    Update {
        id: RecipientId,
        #[command(flatten)]
        fields: RecipientEdit,
    },
    /// Remove a recipient (recorded issues are kept)
    Remove { id: RecipientId },
}

#[derive(Args)]
struct RecipientFields {
    #[arg(long)]
    name: String,
    #[arg(long)]
    age: u32,
    /// Required blood group
    #[arg(long)]
    group: String,
    /// Units needed
    #[arg(long)]
    quantity: u32,
    #[arg(long)]
    hospital: Option<String>,
}

#[derive(Args)]
struct RecipientEdit {
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    age: Option<u32>,
    #[arg(long)]
    group: Option<String>,
    #[arg(long)]
    quantity: Option<u32>,
    #[arg(long)]
    hospital: Option<String>,
}

/// Settings resolved from flags and the config file
struct Session {
    config: Config,
    json: bool,
}

impl Session {
    fn data_dir(&self) -> &PathBuf {
        &self.config.data.data_dir
    }

    fn registry_path(&self) -> PathBuf {
        self.config.data.registry_path()
    }

    fn open_bank(&self, registry: Registry) -> Result<BloodBank> {
        BloodBank::open(self.config.clone(), Arc::new(registry))
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.verbose {
        bloodbank_core::logging::init();
    } else {
        bloodbank_core::logging::init_with_level("warn");
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            if e.is_rejection() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(data_dir) = cli.data_dir {
        config.data.data_dir = data_dir;
    }

    let errors = get_default_table().validate();
    if !errors.is_empty() {
        eprintln!("Compatibility table validation errors:");
        for error in errors {
            eprintln!("  - {}", error);
        }
        return Err(Error::State("Invalid compatibility table".into()));
    }

    let session = Session {
        config,
        json: cli.json,
    };

    match cli.command {
        Commands::Donor { action } => cmd_donor(&session, action),
        Commands::Recipient { action } => cmd_recipient(&session, action),
        Commands::Donate {
            donor,
            group,
            units,
            date,
        } => cmd_donate(
            &session,
            DonationRequest {
                donor_id: donor,
                blood_group: group,
                units,
                date,
            },
        ),
        Commands::Issue {
            recipient,
            group,
            units,
            dry_run,
        } => cmd_issue(
            &session,
            IssueRequest {
                recipient_id: recipient,
                requested_group: group,
                units,
            },
            dry_run,
        ),
        Commands::Inventory { group } => cmd_inventory(&session, group),
        Commands::LowStock { threshold } => cmd_low_stock(&session, threshold),
        Commands::Compat { group } => cmd_compat(&session, &group),
        Commands::Donations { group } => cmd_donations(&session, group),
        Commands::Issues { group } => cmd_issues(&session, group),
        Commands::Verify { repair } => cmd_verify(&session, repair),
        Commands::Export { out } => cmd_export(&session, out),
        Commands::RecoverRegistry => cmd_recover_registry(&session),
    }
}

// ============================================================================
// Directory commands
// ============================================================================

fn cmd_donor(session: &Session, action: DonorCommand) -> Result<()> {
    let path = session.registry_path();

    match action {
        DonorCommand::Add(fields) => {
            let new = NewDonor {
                name: fields.name,
                age: fields.age,
                gender: parse_gender(fields.gender)?,
                phone: fields.phone,
                address: fields.address,
                blood_group: BloodGroup::normalize(&fields.group)?,
                last_donation_date: parse_day(fields.last_donation)?,
            };
            let _lock = DataDirLock::exclusive(session.data_dir())?;
            let (registry, id) = Registry::update(&path, |r| r.add_donor(new))?;
            match registry.donor(id) {
                Some(donor) if session.json => print_json(donor)?,
                _ => println!("✓ Donor {} registered", id),
            }
        }
        DonorCommand::List => {
            let _lock = DataDirLock::shared(session.data_dir())?;
            let registry = Registry::load(&path)?;
            let donors = registry.donors();
            if session.json {
                return print_json(&donors);
            }
            if donors.is_empty() {
                println!("No donors registered.");
            }
            for d in donors {
                println!(
                    "{:>4}  {:<24} {:<4} age {:<3} last donation {}",
                    d.id,
                    d.name,
                    d.blood_group,
                    d.age,
                    d.last_donation_date
                        .map_or_else(|| "never".to_string(), |day| day.to_string())
                );
            }
        }
        DonorCommand::Update { id, fields } => {
            let update = DonorUpdate {
                name: fields.name,
                age: fields.age,
                gender: parse_gender(fields.gender)?,
                phone: fields.phone,
                address: fields.address,
                blood_group: fields
                    .group
                    .as_deref()
                    .map(BloodGroup::normalize)
                    .transpose()?,
                last_donation_date: parse_day(fields.last_donation)?,
            };
            let _lock = DataDirLock::exclusive(session.data_dir())?;
            Registry::update(&path, |r| r.update_donor(id, update))?;
            println!("✓ Donor {} updated", id);
        }
        DonorCommand::Remove { id } => {
            let _lock = DataDirLock::exclusive(session.data_dir())?;
            let (_, donor) = Registry::update(&path, |r| r.remove_donor(id))?;
            println!("✓ Donor {} ({}) removed", donor.id, donor.name);
        }
        DonorCommand::Eligible { date } => {
            let today = parse_day(date)?.unwrap_or_else(|| Utc::now().date_naive());
            let days = session.config.donors.eligibility_days;
            let _lock = DataDirLock::shared(session.data_dir())?;
            let registry = Registry::load(&path)?;
            let donors = registry.eligible_donors(today, days);
            if session.json {
                return print_json(&donors);
            }
            println!("Donors eligible on {} ({} day gap):", today, days);
            for d in donors {
                println!("{:>4}  {:<24} {}", d.id, d.name, d.blood_group);
            }
        }
        DonorCommand::Compatible { group } => {
            let group = BloodGroup::normalize(&group)?;
            let _lock = DataDirLock::shared(session.data_dir())?;
            let registry = Registry::load(&path)?;
            let donors = registry.compatible_donors(group);
            if session.json {
                return print_json(&donors);
            }
            println!("Donors compatible with a {} recipient:", group);
            for d in donors {
                println!("{:>4}  {:<24} {}", d.id, d.name, d.blood_group);
            }
        }
        DonorCommand::Search {
            term,
            group,
            location,
        } => {
            let group = group.as_deref().map(BloodGroup::normalize).transpose()?;
            let _lock = DataDirLock::shared(session.data_dir())?;
            let registry = Registry::load(&path)?;
            let donors = registry.search_donors(term.as_deref(), group, location.as_deref());
            if session.json {
                return print_json(&donors);
            }
            if donors.is_empty() {
                println!("No matching donors.");
            }
            for d in donors {
                println!(
                    "{:>4}  {:<24} {:<4} {:<14} {}",
                    d.id,
                    d.name,
                    d.blood_group,
                    d.phone.as_deref().unwrap_or("-"),
                    d.address.as_deref().unwrap_or("-")
                );
            }
        }
    }
    Ok(())
}

fn cmd_recipient(session: &Session, action: RecipientCommand) -> Result<()> {
    let path = session.registry_path();

    match action {
        RecipientCommand::Add(fields) => {
            let new = NewRecipient {
                name: fields.name,
                age: fields.age,
                required_blood_group: BloodGroup::normalize(&fields.group)?,
                quantity_needed: fields.quantity,
                hospital_name: fields.hospital,
            };
            let _lock = DataDirLock::exclusive(session.data_dir())?;
            let (registry, id) = Registry::update(&path, |r| r.add_recipient(new))?;
            match registry.recipient(id) {
                Some(recipient) if session.json => print_json(recipient)?,
                _ => println!("✓ Recipient {} registered", id),
            }
        }
        RecipientCommand::List => {
            let _lock = DataDirLock::shared(session.data_dir())?;
            let registry = Registry::load(&path)?;
            let recipients = registry.recipients();
            if session.json {
                return print_json(&recipients);
            }
            if recipients.is_empty() {
                println!("No recipients registered.");
            }
            for r in recipients {
                println!(
                    "{:>4}  {:<24} {:<4} needs {:<3} {}",
                    r.id,
                    r.name,
                    r.required_blood_group,
                    r.quantity_needed,
                    r.hospital_name.as_deref().unwrap_or("-")
                );
            }
        }
        RecipientCommand::Update { id, fields } => {
            let update = RecipientUpdate {
                name: fields.name,
                age: fields.age,
                required_blood_group: fields
                    .group
                    .as_deref()
                    .map(BloodGroup::normalize)
                    .transpose()?,
                quantity_needed: fields.quantity,
                hospital_name: fields.hospital,
            };
            let _lock = DataDirLock::exclusive(session.data_dir())?;
            Registry::update(&path, |r| r.update_recipient(id, update))?;
            println!("✓ Recipient {} updated", id);
        }
        RecipientCommand::Remove { id } => {
            let _lock = DataDirLock::exclusive(session.data_dir())?;
            let (_, recipient) = Registry::update(&path, |r| r.remove_recipient(id))?;
            println!("✓ Recipient {} ({}) removed", recipient.id, recipient.name);
        }
    }
    Ok(())
}

// ============================================================================
// Ledger commands
// ============================================================================

fn cmd_donate(session: &Session, request: DonationRequest) -> Result<()> {
    let path = session.registry_path();
    let _lock = DataDirLock::exclusive(session.data_dir())?;

    let bank = session.open_bank(Registry::load(&path)?)?;
    let record = bank.record_donation(&request)?;

    // The ledger entry is already durable; a failure here only loses the date
    if let Err(e) = Registry::update(&path, |r| {
        r.record_donation_date(record.donor_id, record.donated_at.date_naive())
    }) {
        tracing::warn!(
            "Recorded {} but could not update donor {}: {}",
            record.code,
            record.donor_id,
            e
        );
    }

    if session.json {
        return print_json(&DonationReceipt::from(&record));
    }
    println!("✓ Donation recorded: {}", record.code);
    println!(
        "  {} unit(s) of {}, usable until {}",
        record.units,
        record.blood_group,
        record.expires_at.format("%Y-%m-%d")
    );
    Ok(())
}

fn cmd_issue(session: &Session, request: IssueRequest, dry_run: bool) -> Result<()> {
    if dry_run {
        let _lock = DataDirLock::shared(session.data_dir())?;
        let bank = session.open_bank(Registry::load(&session.registry_path())?)?;
        let group = BloodGroup::normalize(&request.requested_group)?;
        let units = validate_units(request.units)?;
        let Some(issued_group) = bank.plan(&request)? else {
            return Err(Error::InsufficientStock {
                requested: group,
                units,
            });
        };
        if session.json {
            return print_json(&IssueReceipt { issued_group });
        }
        println!(
            "Would issue {} unit(s) of {} for a {} request [dry run]",
            units, issued_group, group
        );
        return Ok(());
    }

    let _lock = DataDirLock::exclusive(session.data_dir())?;
    let bank = session.open_bank(Registry::load(&session.registry_path())?)?;
    let receipt = bank.issue(&request)?;

    if session.json {
        return print_json(&receipt);
    }
    println!(
        "✓ Issued {} unit(s) of {} for a {} request",
        request.units,
        receipt.issued_group,
        request.requested_group.trim().to_uppercase()
    );
    Ok(())
}

fn cmd_inventory(session: &Session, group: Option<String>) -> Result<()> {
    let _lock = DataDirLock::shared(session.data_dir())?;
    let bank = session.open_bank(Registry::load(&session.registry_path())?)?;
    let rows = bank.inventory(group.as_deref())?;

    if session.json {
        return match (group, rows.as_slice()) {
            (Some(_), [row]) => print_json(row),
            _ => print_json(&rows),
        };
    }

    println!("{:<5} {:>9}  UPDATED", "GROUP", "AVAILABLE");
    for row in rows {
        println!(
            "{:<5} {:>9}  {}",
            row.blood_group,
            row.available_units,
            row.updated_at
                .map_or_else(|| "-".to_string(), |t| t.to_rfc3339())
        );
    }
    Ok(())
}

fn cmd_low_stock(session: &Session, threshold: Option<u64>) -> Result<()> {
    let _lock = DataDirLock::shared(session.data_dir())?;
    let bank = session.open_bank(Registry::load(&session.registry_path())?)?;
    let report = bank.low_stock(threshold)?;

    if session.json {
        return print_json(&report);
    }
    println!(
        "Threshold: {} unit(s)",
        threshold.unwrap_or(session.config.stock.low_stock_threshold)
    );
    println!("Low: {}", join(&report.low));
    println!("Out: {}", join(&report.out));
    Ok(())
}

fn cmd_compat(session: &Session, group: &str) -> Result<()> {
    let group = BloodGroup::normalize(group)?;
    let donors = get_default_table().compatible_donors(group);

    if session.json {
        return print_json(donors);
    }
    println!("{} can receive from: {}", group, join(donors));
    Ok(())
}

fn cmd_donations(session: &Session, group: Option<String>) -> Result<()> {
    let group = group.as_deref().map(BloodGroup::normalize).transpose()?;
    let _lock = DataDirLock::shared(session.data_dir())?;
    let bank = session.open_bank(Registry::load(&session.registry_path())?)?;

    let donations: Vec<_> = bank
        .ledger()
        .donations()?
        .into_iter()
        .filter(|d| group.map_or(true, |g| d.blood_group == g))
        .collect();

    if session.json {
        return print_json(&donations);
    }
    if donations.is_empty() {
        println!("No donations recorded.");
    }
    for d in donations {
        println!(
            "{}  {:<4} {:>3} unit(s)  donor {:<4} expires {}",
            d.code,
            d.blood_group,
            d.units,
            d.donor_id,
            d.expires_at.format("%Y-%m-%d")
        );
    }
    Ok(())
}

fn cmd_issues(session: &Session, group: Option<String>) -> Result<()> {
    let group = group.as_deref().map(BloodGroup::normalize).transpose()?;
    let _lock = DataDirLock::shared(session.data_dir())?;
    let bank = session.open_bank(Registry::load(&session.registry_path())?)?;

    let issues: Vec<_> = bank
        .ledger()
        .issues()?
        .into_iter()
        .filter(|i| group.map_or(true, |g| i.issued_group == g))
        .collect();

    if session.json {
        return print_json(&issues);
    }
    if issues.is_empty() {
        println!("No issues recorded.");
    }
    for i in issues {
        println!(
            "#{:<5} {:<4} for {:<4} {:>3} unit(s)  recipient {:<4} {}",
            i.id,
            i.issued_group,
            i.requested_group,
            i.units,
            i.recipient_id,
            i.issued_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

fn cmd_verify(session: &Session, repair: bool) -> Result<()> {
    let _lock = DataDirLock::shared(session.data_dir())?;
    let bank = session.open_bank(Registry::load(&session.registry_path())?)?;
    let engine = AvailabilityEngine::new(bank.ledger());

    let now = Utc::now();
    let drifts = engine.verify_at(now)?;

    if repair && !drifts.is_empty() {
        engine.repair()?;
        let remaining = engine.verify_at(now)?;
        if !remaining.is_empty() {
            return Err(Error::State(format!(
                "{} group(s) still drift after repair",
                remaining.len()
            )));
        }
    }

    if session.json {
        print_json(&drifts)?;
    } else if drifts.is_empty() {
        println!("✓ Availability consistent for all {} groups", BloodGroup::ALL.len());
    } else {
        for d in &drifts {
            println!(
                "✗ {}: counter {} vs ledger {}",
                d.blood_group, d.counter, d.recomputed
            );
        }
        if repair {
            println!("✓ Counters rebuilt from ledger");
        }
    }

    if !drifts.is_empty() && !repair {
        return Err(Error::State(format!(
            "{} group(s) drifted; rerun with --repair",
            drifts.len()
        )));
    }
    Ok(())
}

fn cmd_export(session: &Session, out: Option<PathBuf>) -> Result<()> {
    let out_dir = out.unwrap_or_else(|| session.data_dir().join("export"));
    let _lock = DataDirLock::shared(session.data_dir())?;
    let bank = session.open_bank(Registry::load(&session.registry_path())?)?;

    let summary = export_ledger(bank.ledger(), &out_dir, Utc::now())?;

    if session.json {
        return print_json(&summary);
    }
    println!(
        "✓ Exported {} donation(s), {} issue(s), {} inventory row(s)",
        summary.donations, summary.issues, summary.inventory_rows
    );
    println!("  Directory: {}", summary.out_dir.display());
    Ok(())
}

fn cmd_recover_registry(session: &Session) -> Result<()> {
    let path = session.registry_path();
    let _lock = DataDirLock::exclusive(session.data_dir())?;

    let events = bloodbank_core::wal::read_events(&session.config.data.wal_path())?;
    match Registry::recover(&path, &events)? {
        Some(aside) => {
            println!("✓ Registry reset; the old file is at {}", aside.display());
            println!("  Re-register donors and recipients to continue");
        }
        None => println!("Registry is readable, nothing to recover"),
    }
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

fn parse_gender(input: Option<String>) -> Result<Option<Gender>> {
    input.as_deref().map(str::parse::<Gender>).transpose()
}

fn parse_day(input: Option<String>) -> Result<Option<NaiveDate>> {
    input
        .as_deref()
        .map(|s| parse_date(s).map(|t| t.date_naive()))
        .transpose()
}

fn join(groups: &[BloodGroup]) -> String {
    if groups.is_empty() {
        return "-".to_string();
    }
    groups
        .iter()
        .map(|g| g.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
