mod db;
mod digest;
mod enrich;
mod ingest;
mod logging;
mod matcher;
mod models;
mod reconcile;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use db::Database;
use enrich::LocationIndex;
use models::{EmploymentType, Filter, SubscriptionStatus, SwedishLocation, User};
use reconcile::{AuthenticatedUser, QueueReconciler, SystemClock};
use std::collections::BTreeSet;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "digest")]
#[command(about = "Job digest matcher - route scraped postings to subscribers")]
struct Cli {
    /// Path to the SQLite database
    #[arg(long, global = true, env = "DIGEST_DB")]
    db: Option<PathBuf>,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Manage user accounts
    User {
        #[command(subcommand)]
        command: UserCommands,
    },

    /// Show or change a user's filters
    Prefs {
        #[command(subcommand)]
        command: PrefsCommands,
    },

    /// Manage the municipality lookup table
    Locations {
        #[command(subcommand)]
        command: LocationCommands,
    },

    /// Import and list jobs
    Jobs {
        #[command(subcommand)]
        command: JobCommands,
    },

    /// Work with delivery queues
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Write today's digests and mark them sent
    Digest {
        /// ISO weekday to deliver for (1 = Monday); defaults to today
        #[arg(short, long, value_parser = clap::value_parser!(u8).range(1..=7))]
        weekday: Option<u8>,

        /// Print digests without marking anything sent
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// Create an account with default preferences
    Add {
        email: String,

        /// Initial subscription status
        #[arg(short, long, default_value = "trialing")]
        status: String,
    },

    /// Show an account
    Show { email: String },

    /// Change subscription status (trialing, active, past_due, canceled, inactive)
    Status { email: String, status: String },

    /// Delete an account and everything queued for it
    Delete { email: String },
}

#[derive(Subcommand)]
enum PrefsCommands {
    /// Show current filters
    Show { email: String },

    /// Replace individual filters; pass an empty string to clear one
    Set {
        email: String,

        /// Comma-separated include keywords
        #[arg(long)]
        include: Option<String>,

        /// Comma-separated exclude keywords
        #[arg(long)]
        exclude: Option<String>,

        /// Comma-separated source identifiers
        #[arg(long)]
        sources: Option<String>,

        /// Comma-separated country codes
        #[arg(long)]
        countries: Option<String>,

        /// Comma-separated län codes
        #[arg(long)]
        regions: Option<String>,

        /// Comma-separated municipality codes
        #[arg(long)]
        municipalities: Option<String>,

        /// Comma-separated employment types (permanent, interim)
        #[arg(long)]
        employment_types: Option<String>,

        /// Comma-separated ISO weekdays (1 = Monday)
        #[arg(long)]
        days: Option<String>,
    },
}

#[derive(Subcommand)]
enum LocationCommands {
    /// Replace the lookup table from a JSON array of municipalities
    Import { file: PathBuf },
}

#[derive(Subcommand)]
enum JobCommands {
    /// Import scraped postings from a JSON array and queue new matches
    Import { file: PathBuf },

    /// List stored jobs
    List {
        /// Filter by source
        #[arg(short, long)]
        source: Option<String>,
    },

    /// Remove a job; it disappears from every queue
    Remove { id: String },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Fill an empty queue from the last 14 days of jobs
    Bootstrap {
        /// Account to act as
        #[arg(long = "as")]
        caller: String,

        /// Queue to fill; defaults to the caller's own
        #[arg(short, long)]
        user: Option<String>,
    },

    /// List a user's queue
    List {
        email: String,

        /// Only entries not yet delivered
        #[arg(long)]
        unsent: bool,
    },

    /// Remove one job from a user's queue
    Dismiss { email: String, job_id: String },
}

fn require_user(db: &Database, email: &str) -> Result<User> {
    db.get_user_by_email(email)?
        .ok_or_else(|| anyhow!("User '{}' not found", email))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_days(raw: &str) -> Result<BTreeSet<u8>> {
    split_list(raw)
        .iter()
        .map(|d| {
            d.parse::<u8>()
                .with_context(|| format!("Invalid weekday: {}", d))
        })
        .collect()
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let db = Database::open(&Database::resolve_path(cli.db))?;

    match cli.command {
        Commands::Init => {
            db.init()?;
            println!("Database initialized at {}", db.path().display());
        }

        Commands::User { command } => {
            db.ensure_initialized()?;
            match command {
                UserCommands::Add { email, status } => {
                    let status: SubscriptionStatus = status.parse()?;
                    let id = db.create_user(&email, status, Utc::now())?;
                    println!("Created user #{} <{}> ({})", id, email, status);
                }

                UserCommands::Show { email } => {
                    let user = require_user(&db, &email)?;
                    let queue = db.queue_entries(user.id)?;
                    let unsent = queue.iter().filter(|e| e.sent_at.is_none()).count();
                    println!("User #{}", user.id);
                    println!("Email: {}", user.email);
                    println!("Subscription: {}", user.subscription);
                    println!("Created: {}", user.created_at.format("%Y-%m-%d %H:%M"));
                    println!("Queue: {} entries ({} unsent)", queue.len(), unsent);
                }

                UserCommands::Status { email, status } => {
                    let user = require_user(&db, &email)?;
                    let status: SubscriptionStatus = status.parse()?;
                    db.set_subscription_status(user.id, status)?;
                    println!("Marked '{}' as {}.", email, status);
                }

                UserCommands::Delete { email } => {
                    let user = require_user(&db, &email)?;
                    db.delete_user(user.id)?;
                    println!("Deleted user '{}'.", email);
                }
            }
        }

        Commands::Prefs { command } => {
            db.ensure_initialized()?;
            match command {
                PrefsCommands::Show { email } => {
                    let user = require_user(&db, &email)?;
                    let prefs = db
                        .get_preferences(user.id)?
                        .ok_or_else(|| anyhow!("No preferences for '{}'", email))?;
                    let days: Vec<String> = prefs.delivery_days.iter().map(|d| d.to_string()).collect();
                    println!("Delivery days:    {}", days.join(", "));
                    println!("Include:          {}", prefs.keywords_include);
                    println!("Exclude:          {}", prefs.keywords_exclude);
                    println!("Sources:          {}", prefs.sources);
                    println!("Countries:        {}", prefs.countries);
                    println!("Regions:          {}", prefs.regions);
                    println!("Municipalities:   {}", prefs.municipalities);
                    println!("Employment types: {}", prefs.employment_types);
                }

                PrefsCommands::Set {
                    email,
                    include,
                    exclude,
                    sources,
                    countries,
                    regions,
                    municipalities,
                    employment_types,
                    days,
                } => {
                    let user = require_user(&db, &email)?;
                    let mut prefs = db
                        .get_preferences(user.id)?
                        .unwrap_or_else(|| models::UserPreferences::signup_defaults(user.id));

                    if let Some(raw) = include {
                        prefs.keywords_include = Filter::from_values(split_list(&raw));
                    }
                    if let Some(raw) = exclude {
                        prefs.keywords_exclude = Filter::from_values(split_list(&raw));
                    }
                    if let Some(raw) = sources {
                        prefs.sources = Filter::from_values(split_list(&raw));
                    }
                    if let Some(raw) = countries {
                        prefs.countries = Filter::from_values(split_list(&raw));
                    }
                    if let Some(raw) = regions {
                        prefs.regions = Filter::from_values(split_list(&raw));
                    }
                    if let Some(raw) = municipalities {
                        prefs.municipalities = Filter::from_values(split_list(&raw));
                    }
                    if let Some(raw) = employment_types {
                        let types = split_list(&raw)
                            .iter()
                            .map(|t| t.parse::<EmploymentType>())
                            .collect::<Result<Vec<_>, _>>()?;
                        prefs.employment_types = Filter::from_values(types);
                    }
                    if let Some(raw) = days {
                        prefs.delivery_days = parse_days(&raw)?;
                    }

                    db.save_preferences(prefs, Utc::now())?;
                    println!("Updated preferences for '{}'.", email);
                }
            }
        }

        Commands::Locations { command } => {
            db.ensure_initialized()?;
            match command {
                LocationCommands::Import { file } => {
                    let raw = std::fs::read_to_string(&file)
                        .with_context(|| format!("Failed to read {}", file.display()))?;
                    let rows: Vec<SwedishLocation> = serde_json::from_str(&raw)
                        .with_context(|| format!("Failed to parse {}", file.display()))?;
                    let count = db.replace_locations(&rows)?;
                    println!("Loaded {} municipalities.", count);
                }
            }
        }

        Commands::Jobs { command } => {
            db.ensure_initialized()?;
            match command {
                JobCommands::Import { file } => {
                    let postings = ingest::read_postings(&file)?;
                    let locations = LocationIndex::new(&db.fetch_locations()?);
                    if locations.is_empty() {
                        tracing::warn!("location table is empty; jobs will carry no region");
                    }
                    let stats = ingest::import_postings(&db, &locations, &postings, SystemClock)?;

                    println!("\nResults:");
                    println!("  Postings:     {}", stats.postings);
                    println!("  Jobs added:   {}", stats.jobs_added);
                    println!("  Already seen: {}", stats.already_seen);
                    if stats.skipped > 0 {
                        println!("  Skipped:      {}", stats.skipped);
                    }
                    println!("  Queued:       {} (for {} active users)", stats.queued, db.count_active_users()?);
                }

                JobCommands::Remove { id } => {
                    if db.delete_job(&id)? {
                        println!("Removed job {}.", id);
                    } else {
                        println!("Job {} not found.", id);
                    }
                }

                JobCommands::List { source } => {
                    let jobs = db.list_jobs(source.as_deref())?;
                    if jobs.is_empty() {
                        println!("No jobs found.");
                    } else {
                        println!("{:<34} {:<14} {:<30} {:<4} {:<6}", "ID", "SOURCE", "TITLE", "CC", "REGION");
                        println!("{}", "-".repeat(92));
                        for job in jobs {
                            println!(
                                "{:<34} {:<14} {:<30} {:<4} {:<6}",
                                job.id,
                                truncate(&job.source, 12),
                                truncate(&job.title, 28),
                                job.country_code(),
                                job.region_code.as_deref().unwrap_or("-"),
                            );
                        }
                    }
                }
            }
        }

        Commands::Queue { command } => {
            db.ensure_initialized()?;
            match command {
                QueueCommands::Bootstrap { caller, user } => {
                    let caller = AuthenticatedUser {
                        user_id: require_user(&db, &caller)?.id,
                    };
                    let reconciler = QueueReconciler::new(&db, SystemClock);
                    let inserted = match user {
                        Some(email) => {
                            let target = require_user(&db, &email)?;
                            reconciler.bootstrap_for(&caller, target.id)?
                        }
                        None => reconciler.bootstrap(&caller)?,
                    };
                    println!("Queued {} job(s).", inserted);
                }

                QueueCommands::List { email, unsent } => {
                    let user = require_user(&db, &email)?;
                    let entries = db.queue_entries(user.id)?;
                    let entries: Vec<_> = entries
                        .into_iter()
                        .filter(|e| !unsent || e.sent_at.is_none())
                        .collect();
                    if entries.is_empty() {
                        println!("Queue is empty.");
                    } else {
                        println!("{:<34} {:<30} {:<17} {:<17}", "JOB", "TITLE", "QUEUED", "SENT");
                        println!("{}", "-".repeat(101));
                        for entry in entries {
                            let title = db
                                .get_job(&entry.job_id)?
                                .map(|j| j.title)
                                .unwrap_or_default();
                            println!(
                                "{:<34} {:<30} {:<17} {:<17}",
                                entry.job_id,
                                truncate(&title, 28),
                                entry.queued_at.format("%Y-%m-%d %H:%M"),
                                entry
                                    .sent_at
                                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                                    .unwrap_or_else(|| "-".to_string()),
                            );
                        }
                    }
                }

                QueueCommands::Dismiss { email, job_id } => {
                    let user = require_user(&db, &email)?;
                    if db.dismiss_queue_entry(user.id, &job_id)? {
                        println!("Dismissed {} for '{}'.", job_id, email);
                    } else {
                        println!("Job {} is not queued for '{}'.", job_id, email);
                    }
                }
            }
        }

        Commands::Digest { weekday, dry_run } => {
            db.ensure_initialized()?;
            let stdout = std::io::stdout();
            let stats = digest::deliver_digests(&db, weekday, Utc::now(), dry_run, &mut stdout.lock())?;
            println!(
                "Delivered {} digest(s) with {} job(s) to {} recipient(s).",
                stats.delivered, stats.jobs_sent, stats.recipients
            );
            if dry_run {
                println!("\n(Dry run - nothing was marked sent)");
            }
        }
    }

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
