use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use buoy_service::config::ServiceConfig;
use buoy_service::ingest::ndbc::{Month, NdbcClient};
use buoy_service::ingest::parse_normalize_filter;
use buoy_service::logging::{self, init_logger, log_backfill_summary};
use buoy_service::model::{FEET_PER_METER, FeedError};
use buoy_service::report::{self, LatestOutcome};
use buoy_service::store::Store;
use buoy_service::store::batch::BatchWriter;
use buoy_service::store::memory::MemoryStore;
use buoy_service::store::pg::PgStore;
use buoy_service::table::BuoyTable;

/// NDBC buoy observation loader
#[derive(Parser)]
#[command(name = "buoy")]
#[command(version)]
#[command(about = "Loads NDBC buoy observations into a key-value table", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// NOAA buoy identifier (overrides config)
    #[arg(short, long, global = true)]
    buoy: Option<String>,

    /// Log file prefix (overrides config)
    #[arg(short, long, value_name = "PREFIX", global = true)]
    prefix: Option<String>,

    /// Use the in-process store instead of PostgreSQL (dry run)
    #[arg(long, global = true)]
    memory: bool,

    /// Debug logging for the store and feed modules
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Backfill consecutive historical years
    Years {
        /// Four-digit year
        #[arg(short, long)]
        year: i32,
        /// Number of consecutive years
        #[arg(short = 'n', long)]
        count: usize,
    },
    /// Backfill consecutive months of one year
    Months {
        /// Four-digit year
        #[arg(short, long)]
        year: i32,
        /// Three-letter month name
        #[arg(short, long)]
        month: String,
        /// Number of consecutive months
        #[arg(short = 'n', long)]
        count: usize,
    },
    /// Load one month of the current year
    Month {
        /// Three-letter month name
        #[arg(short, long)]
        month: String,
    },
    /// Load recent observations, raising the period index where needed
    Recent {
        /// Use the 45-day window instead of the last five days
        #[arg(long)]
        last45: bool,
    },
    /// Summarize the newest observation and store what is new
    Latest,
    /// Percentile rank of a wave height for a month or month-day
    Stats {
        /// Calendar month, 1-12
        #[arg(long, required_unless_present = "month_day", conflicts_with = "month_day")]
        month: Option<u32>,
        /// Month-day as MMDD
        #[arg(long)]
        month_day: Option<String>,
        /// Wave height in meters
        #[arg(long)]
        wave_height: f64,
    },
    /// Most recent observation at or above a wave height
    Last {
        /// Wave height in meters
        #[arg(long)]
        wave_height: f64,
    },
    /// Highest wave height on record
    Max,
}

type Table = BuoyTable<Box<dyn Store>>;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ServiceConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(buoy) = &cli.buoy {
        config.buoy = buoy.clone();
    }
    if let Some(prefix) = &cli.prefix {
        config.logging.file_prefix = Some(prefix.clone());
    }
    config.logging.verbose |= cli.verbose;
    config.validate()?;

    init_logger(&config.logging).context("Failed to initialize logging")?;
    info!("buoy {} table {}", config.buoy, config.table.name);

    let mut table = open_table(&config, cli.memory)?;
    let feed = NdbcClient::new(&config.feed.base_url, config.feed.timeout())?;

    match cli.command {
        Commands::Years { year, count } => load_years(&mut table, &feed, year, count),
        Commands::Months { year, month, count } => {
            load_months(&mut table, &feed, year, resolve_month(&month)?, count)
        }
        Commands::Month { month } => {
            let month = resolve_month(&month)?;
            let fetched = feed.fetch_month(&config.buoy, month);
            let ok = load_one(&mut table, fetched, &format!("{} (current year)", month.name()))?;
            log_backfill_summary("month", 1, usize::from(ok), usize::from(!ok));
            Ok(())
        }
        Commands::Recent { last45 } => {
            let data = if last45 {
                feed.fetch_last45(&config.buoy)?
            } else {
                feed.fetch_last5(&config.buoy)?
            };
            let records = parse_normalize_filter(&data);
            let summary = table.write_conditional(&records)?;
            info!("{:?}", summary);
            Ok(())
        }
        Commands::Latest => {
            let zone = config.report.zone()?;
            let records = parse_normalize_filter(&feed.fetch_last5(&config.buoy)?);
            match report::run_latest(&mut table, &records, zone)? {
                LatestOutcome::UpToDate => {}
                LatestOutcome::Written { summary, new_records, written } => {
                    println!("{}", summary);
                    info!("stored {} new observations: {:?}", new_records, written);
                }
            }
            Ok(())
        }
        Commands::Stats { month, month_day, wave_height } => {
            let (label, rank) = match (month, month_day) {
                (Some(month), _) => (format!("month {}", month), table.query_month_percentile(month, wave_height)?),
                (None, Some(md)) => (format!("month-day {}", md), table.query_month_day_percentile(&md, wave_height)?),
                (None, None) => bail!("one of --month or --month-day is required"),
            };
            println!(
                "{} m exceeds {} percent of records for {} ({} of {})",
                wave_height, rank.percentile, label, rank.count, rank.total
            );
            Ok(())
        }
        Commands::Last { wave_height } => {
            match table.find_last_occurrence_of(wave_height)? {
                Some(found) => println!(
                    "{} m last reached at {} ({:.1} ft)",
                    wave_height,
                    found.sort_key,
                    found.wave_height * FEET_PER_METER
                ),
                None => println!("{} m has not been recorded", wave_height),
            }
            Ok(())
        }
        Commands::Max => {
            match table.find_max_wave_height()? {
                Some(max) => println!(
                    "highest wave height {} m ({:.1} ft) at {}",
                    max.wave_height,
                    max.wave_height * FEET_PER_METER,
                    max.time_key()
                ),
                None => println!("no observations stored"),
            }
            Ok(())
        }
    }
}

fn resolve_month(name: &str) -> Result<Month> {
    match Month::from_name(name) {
        Some(month) => Ok(month),
        None => bail!("unknown month '{}', expected a three-letter name like Jan", name),
    }
}

fn open_table(config: &ServiceConfig, memory: bool) -> Result<Table> {
    let store: Box<dyn Store> = if memory {
        info!("using in-process store, nothing will persist");
        Box::new(MemoryStore::new())
    } else {
        let Some(url) = config.database_url.as_deref() else {
            bail!("DATABASE_URL is not set; use --memory for a dry run");
        };
        Box::new(PgStore::connect(url, &config.table.name).context("Failed to open table")?)
    };
    let writer = BatchWriter::with_sleeper(
        config.batch.backoff_policy(),
        config.batch.chunk_size,
        Default::default(),
    );
    Ok(BuoyTable::with_writer(store, &config.buoy, &config.table.index_suffix, writer))
}

/// Fetch failures are counted and skipped; store failures abort.
fn load_one(table: &mut Table, fetched: Result<String, FeedError>, what: &str) -> Result<bool> {
    let data = match fetched {
        Ok(data) => data,
        Err(e) => {
            logging::log_feed_failure(table.buoy(), what, &e);
            return Ok(false);
        }
    };
    let records = parse_normalize_filter(&data);
    let summary = table.write(&records)?;
    info!("{}: {} items, {} index items", what, summary.items_written, summary.index_written);
    Ok(true)
}

fn load_years(table: &mut Table, feed: &NdbcClient, year: i32, count: usize) -> Result<()> {
    let buoy = table.buoy().to_string();
    let mut successful = 0;
    for n in 0..count {
        let year = year + n as i32;
        if load_one(table, feed.fetch_year(&buoy, year), &format!("year {}", year))? {
            successful += 1;
        }
    }
    log_backfill_summary("year", count, successful, count - successful);
    Ok(())
}

fn load_months(table: &mut Table, feed: &NdbcClient, year: i32, month: Month, count: usize) -> Result<()> {
    let buoy = table.buoy().to_string();
    let months: Vec<Month> = month.run(count).collect();
    if months.len() < count {
        info!("month run stops at December, loading {} months", months.len());
    }
    let mut successful = 0;
    for m in &months {
        let what = format!("{} {}", m.name(), year);
        if load_one(table, feed.fetch_year_month(&buoy, year, *m), &what)? {
            successful += 1;
        }
    }
    log_backfill_summary("month", months.len(), successful, months.len() - successful);
    Ok(())
}
