use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use membership_ledger::{
    action_log::entries_for_target, db, ensure_category, expiring_memberships,
    insert_membership_type, list_memberships, rebuild_current_state, setup_database,
    write_unmatched, Collaborators, ImportOptions, ImportReport, InMemoryDirectory, LedgerConfig,
    Roster, RosterImporter, Target, TargetKind,
};
use rusqlite::Connection;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "membership-ledger", version, about = "Membership action log, projection and roster import")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "MEMBERSHIP_LEDGER_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database (overrides `database_path` from the config)
    #[arg(long, global = true, env = "MEMBERSHIP_LEDGER_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database schema
    Init,

    /// Create or update a membership type. The category is created on
    /// first use; an existing category is left as it is.
    SeedType {
        #[arg(long)]
        code: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        category: String,
        /// Directory group granted on approval
        #[arg(long, default_value = "")]
        group: String,
        /// Category admits individual users
        #[arg(long)]
        individual: bool,
        /// Category admits organizations
        #[arg(long)]
        organization: bool,
        #[arg(long, default_value_t = 0)]
        sort_order: i64,
        /// Sort order of a newly created category
        #[arg(long, default_value_t = 0)]
        category_sort_order: i64,
    },

    /// Preview (default) or confirm a roster import
    Import {
        #[arg(long)]
        file: PathBuf,
        #[arg(long = "type")]
        membership_type: String,
        /// JSON directory snapshot; written back after --confirm
        #[arg(long)]
        directory: PathBuf,
        #[arg(long)]
        match_names: bool,
        /// Roster lists organizations (matched by id or name) instead of users
        #[arg(long)]
        organizations: bool,
        #[arg(long)]
        confirm: bool,
        #[arg(long, default_value = "importer")]
        actor: String,
        /// Write rows without a directory match to this CSV file
        #[arg(long)]
        unmatched: Option<PathBuf>,
        /// Column override, e.g. --column email="Contact Address"
        #[arg(long = "column", value_parser = parse_column_override)]
        columns: Vec<(String, String)>,
        /// Only apply these data rows (1-based, comma separated)
        #[arg(long, value_delimiter = ',')]
        rows: Vec<usize>,
    },

    /// Print current memberships of a user
    Memberships {
        #[arg(long)]
        user: String,
    },

    /// Print the action log of a user
    Log {
        #[arg(long)]
        user: String,
    },

    /// Print memberships expiring soon
    Expiring {
        /// Window in days (defaults to `expiring_soon_days`)
        #[arg(long)]
        days: Option<i64>,
    },

    /// Rebuild current state by replaying the action log
    Rebuild,
}

fn parse_column_override(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((field, header)) if !field.trim().is_empty() && !header.trim().is_empty() => {
            Ok((field.trim().to_string(), header.trim().to_string()))
        }
        _ => Err(format!("expected FIELD=Header, got '{raw}'")),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => LedgerConfig::from_file(path)?,
        None => LedgerConfig::default(),
    };
    let db_path = cli.db.clone().unwrap_or_else(|| config.database_path.clone());

    match cli.command {
        Command::Init => {
            let conn = open_database(&db_path)?;
            setup_database(&conn)?;
            println!("✓ Database initialized: {:?}", db_path);
        }
        Command::SeedType {
            code,
            name,
            category,
            group,
            individual,
            organization,
            sort_order,
            category_sort_order,
        } => {
            let conn = open_database(&db_path)?;
            let created = if category_exists(&conn, &category)? {
                false
            } else {
                if !individual && !organization {
                    bail!("a new category must admit individuals, organizations or both");
                }
                ensure_category(&conn, &category, individual, organization, category_sort_order)?
            };
            insert_membership_type(&conn, &code, &name, &category, &group, sort_order)?;
            if created {
                println!("✓ Created category '{}'", category);
            }
            println!("✓ Membership type '{}' in category '{}'", code, category);
        }
        Command::Import {
            file,
            membership_type,
            directory,
            match_names,
            organizations,
            confirm,
            actor,
            unmatched,
            columns,
            rows,
        } => {
            let options = ImportOptions {
                membership_type,
                match_names,
                target_kind: if organizations { TargetKind::Organization } else { TargetKind::User },
                column_overrides: columns.into_iter().collect::<BTreeMap<_, _>>(),
                actor,
                only_rows: (!rows.is_empty()).then(|| rows.into_iter().collect::<BTreeSet<_>>()),
            };
            run_import(&config, &db_path, &file, &directory, &options, confirm, unmatched.as_deref())?;
        }
        Command::Memberships { user } => {
            let conn = open_database(&db_path)?;
            let now = db::now();
            for membership in list_memberships(&conn, &Target::user(&user))? {
                let expires = membership
                    .expires_at
                    .map(|e| e.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                let status = if membership.is_active_at(now) { "active" } else { "expired" };
                println!(
                    "{:<24} {:<8} since {}  expires {}",
                    membership.membership_type,
                    status,
                    membership.created_at.to_rfc3339(),
                    expires
                );
            }
        }
        Command::Log { user } => {
            let conn = open_database(&db_path)?;
            for entry in entries_for_target(&conn, &Target::user(&user))? {
                let expires = entry.expires_at.map(|e| e.to_rfc3339()).unwrap_or_default();
                let batch = entry.import_batch_id.map(|b| b.to_string()).unwrap_or_default();
                println!(
                    "{:>6} {} {:<22} {:<20} by {:<12} {} {}",
                    entry.id,
                    entry.created_at.to_rfc3339(),
                    entry.action,
                    entry.membership_type,
                    entry.actor,
                    expires,
                    batch
                );
            }
        }
        Command::Expiring { days } => {
            let conn = open_database(&db_path)?;
            let within = days.unwrap_or(config.expiring_soon_days);
            for membership in expiring_memberships(&conn, db::now(), within)? {
                println!(
                    "{:<24} {:<24} {}",
                    membership.target,
                    membership.membership_type,
                    membership.expires_at.map(|e| e.to_rfc3339()).unwrap_or_default()
                );
            }
        }
        Command::Rebuild => {
            let conn = open_database(&db_path)?;
            let summary = rebuild_current_state(&conn)?;
            println!(
                "✓ Replayed {} log entries into {} memberships",
                summary.entries_replayed, summary.memberships
            );
        }
    }

    Ok(())
}

fn category_exists(conn: &Connection, name: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM membership_type_categories WHERE name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn open_database(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).with_context(|| format!("Failed to open database {:?}", path))?;
    setup_database(&conn).context("Failed to prepare database schema")?;
    Ok(conn)
}

fn run_import(
    config: &LedgerConfig,
    db_path: &Path,
    file: &Path,
    directory_path: &Path,
    options: &ImportOptions,
    confirm: bool,
    unmatched: Option<&Path>,
) -> Result<()> {
    let conn = open_database(db_path)?;
    let directory = InMemoryDirectory::load(directory_path)?;
    let roster = Roster::from_path(file).with_context(|| format!("Failed to load roster {:?}", file))?;
    let importer = RosterImporter::new(&conn, Collaborators::from_one(&directory), config);

    let report = if confirm {
        importer.confirm(&roster, options)?
    } else {
        importer.preview(&roster, options)?
    };
    print_report(&report, confirm);

    if let Some(out) = unmatched {
        let writer = File::create(out).with_context(|| format!("Failed to create {:?}", out))?;
        let written = write_unmatched(writer, &roster, &report.plans)?;
        println!("✓ Wrote {} unmatched rows to {:?}", written, out);
    }

    if confirm {
        directory.save(directory_path)?;
    }
    Ok(())
}

fn print_report(report: &ImportReport, confirm: bool) {
    println!("\n📋 Roster {}", if confirm { "import" } else { "preview" });
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for plan in &report.plans {
        println!(
            "row {:>4}  {:<6} {:<24} {}",
            plan.row,
            plan.decision.kind,
            plan.holder().unwrap_or_else(|| "-".to_string()),
            plan.decision.reason
        );
    }
    println!(
        "\nRows: {}  import: {}  skip: {}  matched: {:.1}% ({} by email, {} by id, {} by name)",
        report.rows_total,
        report.imports,
        report.skips,
        report.match_percent,
        report.matched_by_email,
        report.matched_by_id,
        report.matched_by_name
    );
    for (reason, count) in report.skip_reasons.iter().take(8) {
        println!("  {:>4} × {}", count, reason);
    }

    if report.undecided > 0 {
        println!("  {:>4} × could not be decided", report.undecided);
    }

    if let Some(batch_id) = report.batch_id {
        println!(
            "\n✓ Batch {}: {} applied, {} failed",
            batch_id,
            report.applied.len(),
            report.failed
        );
    }
    for failure in &report.failures {
        println!(
            "  ❌ row {} ({}): {}",
            failure.row,
            failure.holder.as_deref().unwrap_or("-"),
            failure.error
        );
    }
}
