//! rusty-pipeline CLI - run factor pipelines over CSV market data
//!
//! ## Example Usage
//!
//! ```bash
//! # Evaluate a definition and write CSV to stdout
//! rusty-pipeline run -d momentum.toml --data prices.csv --start 2024-01-02 --end 2024-03-29
//!
//! # Show the execution order and lookback of each term
//! rusty-pipeline describe -d momentum.toml
//!
//! # List the built-in dataset columns
//! rusty-pipeline columns
//! ```

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use rusty_pipeline::calendar::{SessionCalendar, TradingCalendar, WeekdayCalendar};
use rusty_pipeline::data::InMemoryDataSource;
use rusty_pipeline::pipeline::{
    Catalog, EngineConfig, EngineOverrides, Evaluation, ExecutionResult, PipelineDefinition,
    PipelineEngine, TermGraph, WindowSchedule,
};
use rusty_pipeline::universe::{DatedUniverse, UniverseSource};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// rusty-pipeline: cross-sectional factor pipelines
#[derive(Parser)]
#[command(name = "rusty-pipeline")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Evaluate cross-sectional factor pipelines", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Engine configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a pipeline definition over a date range
    Run {
        /// Pipeline definition (TOML)
        #[arg(short = 'd', long, value_name = "FILE")]
        definition: PathBuf,

        /// Long-format data file: date,asset,column,value
        #[arg(long, value_name = "FILE")]
        data: PathBuf,

        /// Universe file: date,asset (defaults to assets observed in the data)
        #[arg(short = 'u', long, value_name = "FILE")]
        universe: Option<PathBuf>,

        /// Start date (YYYY-MM-DD)
        #[arg(short = 's', long)]
        start: NaiveDate,

        /// End date (YYYY-MM-DD)
        #[arg(short = 'e', long)]
        end: NaiveDate,

        /// Trading calendar
        #[arg(long, value_enum, default_value_t = CalendarKind::Sessions)]
        calendar: CalendarKind,

        /// Output file (stdout when omitted)
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        /// Output format
        #[arg(short = 'f', long, value_enum, default_value_t = OutputFormat::Csv)]
        format: OutputFormat,

        /// Date chunks evaluated concurrently
        #[arg(short = 'p', long)]
        parallel: Option<usize>,

        /// Per-attempt fetch timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Retries after a failed fetch
        #[arg(long)]
        retries: Option<u32>,
    },

    /// Show execution order and lookback of a definition's terms
    Describe {
        /// Pipeline definition (TOML)
        #[arg(short = 'd', long, value_name = "FILE")]
        definition: PathBuf,
    },

    /// List the built-in dataset columns
    Columns,
}

#[derive(Clone, Copy, ValueEnum)]
enum CalendarKind {
    /// Dates present in the data file
    Sessions,
    /// Monday to Friday
    Weekdays,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Csv,
    Json,
}

struct RunConfig {
    definition: PathBuf,
    data: PathBuf,
    universe: Option<PathBuf>,
    start: NaiveDate,
    end: NaiveDate,
    calendar: CalendarKind,
    output: Option<PathBuf>,
    format: OutputFormat,
    parallel: Option<usize>,
    timeout_ms: Option<u64>,
    retries: Option<u32>,
    verbose: bool,
    config: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let result = match cli.command {
        Commands::Run {
            definition,
            data,
            universe,
            start,
            end,
            calendar,
            output,
            format,
            parallel,
            timeout_ms,
            retries,
        } => run_pipeline(RunConfig {
            definition,
            data,
            universe,
            start,
            end,
            calendar,
            output,
            format,
            parallel,
            timeout_ms,
            retries,
            verbose: cli.verbose,
            config: cli.config,
        }),
        Commands::Describe { definition } => describe(&definition),
        Commands::Columns => list_columns(),
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

/// Engine settings: defaults, then the config file, then the definition's
/// `[engine]` table, then command-line flags
fn engine_config(cfg: &RunConfig, definition: &PipelineDefinition) -> Result<EngineConfig> {
    let file = cfg.config.clone().or_else(|| {
        dirs::config_dir()
            .map(|dir| dir.join("rusty-pipeline").join("engine.toml"))
            .filter(|path| path.exists())
    });

    let base = match file {
        Some(path) => EngineConfig::from_path(&path)
            .with_context(|| format!("reading engine config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let config = definition.engine_config(&base)?;
    let flags = EngineOverrides {
        max_parallel_dates: cfg.parallel,
        fetch_timeout_ms: cfg.timeout_ms,
        fetch_retries: cfg.retries,
        retry_backoff_ms: None,
    };
    let config = flags.apply(&config);
    config.validate()?;
    Ok(config)
}

fn run_pipeline(cfg: RunConfig) -> Result<()> {
    if cfg.start > cfg.end {
        bail!("start date {} is after end date {}", cfg.start, cfg.end);
    }

    let definition = PipelineDefinition::from_path(&cfg.definition)
        .with_context(|| format!("reading definition {}", cfg.definition.display()))?;
    let pipeline = definition.compile(&Catalog::standard())?;
    let config = engine_config(&cfg, &definition)?;

    let data = InMemoryDataSource::from_csv_path(&cfg.data)
        .with_context(|| format!("loading data {}", cfg.data.display()))?;

    let calendar: Arc<dyn TradingCalendar> = match cfg.calendar {
        CalendarKind::Sessions => Arc::new(SessionCalendar::new(data.dates())),
        CalendarKind::Weekdays => {
            let first = data.dates().first().copied();
            match first {
                Some(first) => Arc::new(WeekdayCalendar::new().with_first_session(first)),
                None => Arc::new(WeekdayCalendar::new()),
            }
        }
    };
    let universe: Arc<dyn UniverseSource> = match &cfg.universe {
        Some(path) => Arc::new(
            DatedUniverse::from_csv_path(path)
                .with_context(|| format!("loading universe {}", path.display()))?,
        ),
        None => Arc::new(data.clone()),
    };

    if cfg.verbose {
        eprintln!("{}", "Running pipeline...".cyan().bold());
        eprintln!("  {} {}", "Definition:".bold(), cfg.definition.display());
        eprintln!("  {} {}", "Columns:".bold(), pipeline.column_names().join(", "));
        eprintln!("  {} {} to {}", "Range:".bold(), cfg.start, cfg.end);
        eprintln!("  {} {}", "Parallel dates:".bold(), config.max_parallel_dates);
    }

    let engine = PipelineEngine::new(config, Arc::new(data), calendar, universe);

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}")?);
    spinner.set_message("Evaluating pipeline...");
    spinner.enable_steady_tick(Duration::from_millis(100));

    let started = Instant::now();
    let result = engine.evaluate(&pipeline, cfg.start, cfg.end);
    spinner.finish_and_clear();
    let result = result?;

    write_result(&result, cfg.output.as_deref(), cfg.format)?;

    eprintln!(
        "{} {} rows over {} dates in {:.2?}",
        "✓".green().bold(),
        result.len(),
        result.dates().len(),
        started.elapsed()
    );
    if result.missing_cells() > 0 {
        eprintln!(
            "  {} {} cells have no value",
            "Note:".yellow(),
            result.missing_cells()
        );
    }
    for gap in result.gaps() {
        eprintln!(
            "  {} {} skipped: {} ({} attempts)",
            "Warning:".yellow(),
            gap.date,
            gap.reason,
            gap.attempts
        );
    }

    Ok(())
}

fn write_result(result: &ExecutionResult, output: Option<&Path>, format: OutputFormat) -> Result<()> {
    let mut writer: Box<dyn Write> = match output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        )),
        None => Box::new(io::stdout().lock()),
    };

    match format {
        OutputFormat::Csv => result.write_csv(&mut writer)?,
        OutputFormat::Json => {
            writer.write_all(result.to_json()?.as_bytes())?;
            writeln!(writer)?;
        }
    }
    writer.flush()?;
    Ok(())
}

fn describe(path: &Path) -> Result<()> {
    let definition = PipelineDefinition::from_path(path)
        .with_context(|| format!("reading definition {}", path.display()))?;
    let pipeline = definition.compile(&Catalog::standard())?;
    let graph = TermGraph::build(&pipeline)?;
    let schedule = WindowSchedule::compute(&graph);

    println!("{}", "Execution Order".cyan().bold());
    println!("{}", "===============".cyan());
    for term in graph.ordered_terms() {
        let strategy = match term.kind().evaluation() {
            Evaluation::Leaf => "fetch",
            Evaluation::PerAsset => "per-asset",
            Evaluation::CrossSectional => "cross-section",
        };
        println!(
            "  [{}] {} {} {} {}",
            graph.depth(term.id()),
            term.name().bold(),
            format!("<{}>", term.dtype()).dimmed(),
            strategy.yellow(),
            format!("lookback={}", schedule.extra_lookback(term.id())).dimmed()
        );
    }
    println!();
    println!(
        "{} {} dates before the first output date",
        "Lookback:".bold(),
        schedule.max_lookback()
    );
    Ok(())
}

fn list_columns() -> Result<()> {
    let catalog = Catalog::standard();
    println!("{}", "Available Columns".cyan().bold());
    println!("{}", "=================".cyan());
    for (name, dtype) in catalog.entries() {
        println!("  {} {}", name.bold(), format!("<{}>", dtype).dimmed());
    }
    Ok(())
}
