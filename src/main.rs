//! CLI entry point for the transit adherence tool.
//!
//! Provides subcommands for measuring punctuality against the timetable,
//! deriving and summarising vehicle speeds, and locating speeding hotspots.

use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};
use transit_adherence::{
    config::{AnalysisConfig, LatLon},
    geo::{DEFAULT_BIN_ORIGIN, bin_size},
    output::{append_delay_records, print_json, print_pretty, write_json},
    pipeline::{
        SpeedBatch, calc_speed_archive, check_monotonic, punctuality_batch, speed_batch,
        speed_batch_from_files,
    },
    schedule::StopCatalog,
};

#[derive(Parser)]
#[command(name = "transit_adherence")]
#[command(about = "Schedule adherence and speed analysis of vehicle position archives", long_about = None)]
struct Cli {
    /// JSON file with analysis parameters
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Fail when any trace could not be processed
    #[arg(long, global = true, default_value_t = false)]
    strict: bool,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

/// Command-line values that take precedence over the config file.
#[derive(Args)]
struct Overrides {
    /// Maximum number of trace files processed at once
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Speed in km/h above which a sample counts as a violation
    #[arg(long, global = true)]
    speed_threshold: Option<f64>,

    /// Speed in km/h at or above which a sample is discarded
    #[arg(long, global = true)]
    outlier_speed: Option<f64>,

    /// Decimal places used for hotspot binning
    #[arg(long, global = true)]
    round_to: Option<u32>,

    /// Number of hotspots to report
    #[arg(long, global = true)]
    top_n: Option<usize>,
}

impl Overrides {
    fn apply(&self, config: &mut AnalysisConfig) {
        if let Some(v) = self.concurrency {
            config.concurrency = v;
        }
        if let Some(v) = self.speed_threshold {
            config.speed_threshold = v;
        }
        if let Some(v) = self.outlier_speed {
            config.outlier_speed = Some(v);
        }
        if let Some(v) = self.round_to {
            config.round_to = v;
        }
        if let Some(v) = self.top_n {
            config.top_n = v;
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Estimate per-stop delays for every trace in an archive
    Punctuality {
        /// Root of the trace archive (<route>/<brigade>/<vehicle>.txt)
        #[arg(value_name = "TRACES")]
        traces: PathBuf,

        /// Root of the timetable archive (<route>/<stopId>_<stopNr>.json)
        #[arg(short, long)]
        timetables: PathBuf,

        /// Stop catalog JSON
        #[arg(short, long)]
        stops: PathBuf,

        /// CSV file to append every matched stop to
        #[arg(short, long)]
        export: Option<PathBuf>,

        /// File to write the JSON report to
        #[arg(short, long)]
        report: Option<PathBuf>,
    },
    /// Write a speed file for every trace into a mirror archive
    CalcSpeed {
        #[arg(value_name = "TRACES")]
        traces: PathBuf,

        /// Output root, defaults to <TRACES>_with_speed
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Summarise the speed distribution of an archive
    SpeedStats {
        #[arg(value_name = "ARCHIVE")]
        archive: PathBuf,

        /// Read speed files written by calc-speed instead of raw traces
        #[arg(long, default_value_t = false)]
        from_speed_files: bool,

        #[arg(short, long)]
        report: Option<PathBuf>,
    },
    /// Rank location bins by the share of speeding samples
    Hotspots {
        #[arg(value_name = "ARCHIVE")]
        archive: PathBuf,

        #[arg(long, default_value_t = false)]
        from_speed_files: bool,

        /// List every bin whose violation ratio exceeds this value instead of the top N
        #[arg(long)]
        min_ratio: Option<f64>,
    },
    /// Print the physical size of a grid cell at the given precision
    BinSize {
        #[arg(long, default_value_t = 2)]
        decimals: u32,

        #[arg(long, default_value_t = DEFAULT_BIN_ORIGIN.lat)]
        lat: f64,

        #[arg(long, default_value_t = DEFAULT_BIN_ORIGIN.lon)]
        lon: f64,
    },
    /// Report traces whose timestamps do not strictly increase
    Check {
        #[arg(value_name = "TRACES")]
        traces: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path = std::env::var("LOG_FILE_PATH")
        .unwrap_or_else(|_| "logs/transit_adherence.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("transit_adherence.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    let mut config = AnalysisConfig::load_or_default(cli.config.as_deref())?;
    cli.overrides.apply(&mut config);
    print_pretty(&config);

    match cli.command {
        Commands::Punctuality {
            traces,
            timetables,
            stops,
            export,
            report,
        } => {
            let (catalog, skipped) = StopCatalog::load(&stops)?;
            if !skipped.is_empty() {
                warn!(skipped = skipped.len(), "Stop catalog entries skipped");
            }
            info!(stops = catalog.len(), "Stop catalog loaded");

            let batch = punctuality_batch(&traces, &timetables, Arc::new(catalog), &config).await?;

            if let Some(path) = export {
                append_delay_records(&path, &batch.records)?;
                info!(path = %path.display(), rows = batch.records.len(), "Delay records exported");
            }

            let summary = batch.report();
            print_json(&summary)?;
            if let Some(path) = report {
                write_json(&path, &summary)?;
            }
            fail_if_strict(cli.strict, summary.failed.len())?;
        }
        Commands::CalcSpeed { traces, output } => {
            let report =
                calc_speed_archive(&traces, output.as_deref(), config.concurrency).await?;
            print_json(&report)?;
            fail_if_strict(cli.strict, report.failed.len())?;
        }
        Commands::SpeedStats {
            archive,
            from_speed_files,
            report,
        } => {
            let batch = load_speed_batch(&archive, from_speed_files, &config).await?;
            let summary = batch.report(&config);
            print_json(&summary)?;
            if let Some(path) = report {
                write_json(&path, &summary)?;
            }
            fail_if_strict(cli.strict, summary.failed.len())?;
        }
        Commands::Hotspots {
            archive,
            from_speed_files,
            min_ratio,
        } => {
            let batch = load_speed_batch(&archive, from_speed_files, &config).await?;
            let origin = config.reference_point.unwrap_or(DEFAULT_BIN_ORIGIN);
            print_json(&batch.grid.cell_size(origin))?;

            let hotspots = match min_ratio {
                Some(min) => batch.grid.above_ratio(min),
                None => batch.grid.top(config.top_n, config.search_area()),
            };
            info!(
                bins = batch.grid.len(),
                listed = hotspots.len(),
                "Hotspot ranking"
            );
            print_json(&hotspots)?;
            fail_if_strict(cli.strict, batch.failed.len())?;
        }
        Commands::BinSize { decimals, lat, lon } => {
            print_json(&bin_size(decimals, LatLon { lat, lon }))?;
        }
        Commands::Check { traces } => {
            let issues = check_monotonic(&traces, config.concurrency).await?;
            if issues.is_empty() {
                info!("All timestamps strictly increase");
            } else {
                warn!(traces = issues.len(), "Traces with non-increasing timestamps");
                print_json(&issues)?;
            }
        }
    }

    Ok(())
}

async fn load_speed_batch(
    archive: &Path,
    from_speed_files: bool,
    config: &AnalysisConfig,
) -> Result<SpeedBatch> {
    let batch = if from_speed_files {
        speed_batch_from_files(archive, config).await?
    } else {
        speed_batch(archive, config).await?
    };
    Ok(batch)
}

fn fail_if_strict(strict: bool, failed: usize) -> Result<()> {
    if strict && failed > 0 {
        bail!("{failed} trace(s) could not be processed");
    }
    Ok(())
}
