use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use activitydw::{
    ActivityDW, ActivityEntry, ArtifactStore, Database, Granularity, Period, ReportScheduler,
};

#[derive(Parser)]
#[command(name = "activitydw", about = "Activity report warehouse CLI")]
struct Cli {
    /// Database path (default: ~/.activitydw/activitydw.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate (or fetch from cache) a report
    Report {
        /// Granularity: daily, weekly, monthly, quarterly, annual
        granularity: String,
        /// Period key (e.g. 2024-07-27, 2024-W30, 2024-07, 2024-Q3, 2024).
        /// Defaults to the most recent complete period.
        period: Option<String>,
        /// Regenerate even if a cached report exists
        #[arg(long)]
        force: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Drop a cached report
    Invalidate {
        /// Granularity: daily, weekly, monthly, quarterly, annual
        granularity: String,
        /// Period key
        period: String,
    },
    /// Run the report scheduler in the foreground
    Schedule,
    /// Manage activity log entries
    Log {
        #[command(subcommand)]
        action: LogAction,
    },
    /// Manage category configuration
    Categories {
        #[command(subcommand)]
        action: CategoriesAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show warehouse status
    Status,
}

#[derive(Subcommand)]
enum LogAction {
    /// Add an activity entry
    Add {
        /// Duration in minutes
        #[arg(long)]
        minutes: u32,
        /// Activity group (e.g. coding, meetings)
        #[arg(long)]
        group: String,
        /// Timestamp (YYYY-MM-DD HH:MM:SS, default: now)
        #[arg(long)]
        at: Option<String>,
        /// Free-form description
        #[arg(long, default_value = "")]
        description: String,
    },
    /// List recent entries
    List {
        /// Maximum entries
        #[arg(long, default_value = "20")]
        limit: u32,
    },
    /// Remove an entry by id
    Remove { id: i64 },
}

#[derive(Subcommand)]
enum CategoriesAction {
    /// Show the category configuration
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Replace the category configuration from a JSON file
    Set {
        /// Path to a JSON file: {"categories": [{"name": ..., "groups": [...]}]}
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let (db, data_dir) = match &cli.db {
        Some(path) => {
            let path = PathBuf::from(path);
            let dir = path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from("."));
            (Database::open_at(&path).await?, dir)
        }
        None => {
            let dir = dirs::home_dir()
                .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?
                .join(".activitydw");
            (Database::open().await?, dir)
        }
    };

    match cli.command {
        Commands::Report {
            granularity,
            period,
            force,
            json,
        } => {
            let dw = connect(db, &data_dir).await?;
            handle_report(&dw, &granularity, period.as_deref(), force, json).await?;
        }
        Commands::Invalidate {
            granularity,
            period,
        } => {
            let dw = connect(db, &data_dir).await?;
            let granularity = Granularity::parse(&granularity)?;
            let period = Period::parse_for(granularity, &period)?;
            if dw.invalidate_report(period).await? {
                println!("Invalidated {granularity} report {period}.");
            } else {
                println!("No cached {granularity} report for {period}.");
            }
        }
        Commands::Schedule => {
            let dw = connect(db, &data_dir).await?;
            run_scheduler(&dw).await?;
        }
        Commands::Log { action } => {
            let dw = ActivityDW::with_gateway(db, unused_gateway(), None);
            handle_log(&dw, action).await?;
        }
        Commands::Categories { action } => {
            let dw = ActivityDW::with_gateway(db, unused_gateway(), None);
            handle_categories(&dw, action).await?;
        }
        Commands::Config { action } => {
            let dw = ActivityDW::with_gateway(db, unused_gateway(), None);
            handle_config(&dw, action).await?;
        }
        Commands::Status => {
            let dw = ActivityDW::with_gateway(db, unused_gateway(), None);
            print_status(&dw).await?;
        }
    }

    Ok(())
}

async fn connect(db: Database, data_dir: &std::path::Path) -> anyhow::Result<ActivityDW> {
    Ok(ActivityDW::connect(db, Some(ArtifactStore::new(data_dir))).await?)
}

/// Commands that never touch the model still need a gateway to build the
/// facade; give them one that refuses to be called.
fn unused_gateway() -> Arc<dyn activitydw::Gateway> {
    struct Unreachable;

    #[async_trait::async_trait]
    impl activitydw::Gateway for Unreachable {
        async fn complete(&self, _prompt: &str) -> activitydw::Result<activitydw::Completion> {
            Err(activitydw::Error::Config(
                "this command does not use the model gateway".into(),
            ))
        }
    }

    Arc::new(Unreachable)
}

async fn handle_report(
    dw: &ActivityDW,
    granularity: &str,
    period: Option<&str>,
    force: bool,
    json: bool,
) -> anyhow::Result<()> {
    let granularity = Granularity::parse(granularity)?;
    let period = match period {
        Some(key) => Period::parse_for(granularity, key)?,
        None => Period::previous_complete(granularity, chrono::Local::now().date_naive()),
    };

    let doc = dw.generate_report(period, force).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        println!("{}", doc.markdown_report);
        if !doc.executive_summary.progress_report.is_empty() {
            println!("\nProgress: {}", doc.executive_summary.progress_report);
        }
    }
    Ok(())
}

async fn run_scheduler(dw: &ActivityDW) -> anyhow::Result<()> {
    let scheduler = ReportScheduler::new(dw.engine());
    scheduler.start().await?;

    println!("Scheduler running. Jobs:");
    for status in scheduler.status().await {
        let next = status
            .next_run
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "unknown".to_string());
        println!(
            "  {:<10} {}  next: {next}",
            status.granularity.as_str(),
            status.cron
        );
    }
    println!("Press Ctrl-C to stop.");

    tokio::signal::ctrl_c().await?;
    scheduler.stop().await?;
    Ok(())
}

async fn handle_log(dw: &ActivityDW, action: LogAction) -> anyhow::Result<()> {
    match action {
        LogAction::Add {
            minutes,
            group,
            at,
            description,
        } => {
            let timestamp = match at {
                Some(s) => chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S")
                    .map_err(|_| anyhow::anyhow!("invalid timestamp: {s}"))?,
                None => chrono::Local::now().naive_local(),
            };
            let id = dw
                .log_activity(ActivityEntry {
                    id: 0,
                    timestamp,
                    duration_minutes: minutes,
                    category: "others".to_string(),
                    group,
                    description,
                })
                .await?;
            println!("Logged entry {id}.");
        }
        LogAction::List { limit } => {
            let entries = dw.recent_activities(limit).await?;
            if entries.is_empty() {
                println!("No activity logged.");
            } else {
                for e in entries {
                    println!(
                        "{:>6}  {}  {:>4}m  {}  {}",
                        e.id,
                        e.timestamp.format("%Y-%m-%d %H:%M"),
                        e.duration_minutes,
                        e.group,
                        e.description
                    );
                }
            }
        }
        LogAction::Remove { id } => {
            if dw.remove_activity(id).await? {
                println!("Removed entry {id}.");
            } else {
                println!("No entry with id {id}.");
            }
        }
    }
    Ok(())
}

async fn handle_categories(dw: &ActivityDW, action: CategoriesAction) -> anyhow::Result<()> {
    match action {
        CategoriesAction::Show { json } => {
            let config = dw.categories().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else if config.categories.is_empty() {
                println!("No categories configured.");
            } else {
                for category in &config.categories {
                    println!("{}: {}", category.name, category.groups.join(", "));
                }
            }
        }
        CategoriesAction::Set { file } => {
            let content = tokio::fs::read_to_string(&file).await?;
            let config: activitydw::CategoryConfig = serde_json::from_str(&content)?;
            let count = config.categories.len();
            dw.set_categories(config).await?;
            println!("Saved {count} categories.");
        }
    }
    Ok(())
}

async fn handle_config(dw: &ActivityDW, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => match dw.config_get(&key).await? {
            Some(v) => println!("{key} = {v}"),
            None => println!("{key} is not set"),
        },
        ConfigAction::Set { key, value } => {
            dw.config_set(&key, &value).await?;
            println!("Config updated.");
        }
        ConfigAction::List => {
            let items = dw.config_list().await?;
            if items.is_empty() {
                println!("No configuration set.");
            } else {
                for (k, v) in items {
                    println!("{k} = {v}");
                }
            }
        }
    }
    Ok(())
}

async fn print_status(dw: &ActivityDW) -> anyhow::Result<()> {
    let status = dw.status().await?;
    println!("Warehouse Status");
    println!("  Activity entries: {}", status.activity_count);
    println!("  Cached reports:   {}", status.cached_reports.len());
    for (granularity, key, generated_at) in &status.cached_reports {
        println!("    {granularity:<10} {key:<12} generated {generated_at}");
    }
    println!("  Scheduler cadences:");
    for granularity in Granularity::ALL {
        println!(
            "    {:<10} {}",
            granularity.as_str(),
            activitydw::scheduler::default_cron(granularity)
        );
    }
    Ok(())
}
