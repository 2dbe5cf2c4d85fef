//! Repack comic book archives into uncompressed cbz files.
//!
//! Every `.cbr` and `.cbz` file below the input root is extracted and written again as Zip
//! archive without compression, at the same relative path below the output root. Archives whose
//! name lies about their content are recovered by trying the other format. Inputs that cannot be
//! converted at all are copied into the `_failed` directory of the output root.

mod convert;
mod discover;
mod distribute;
mod error;
#[cfg(test)]
mod test_support;

use std::fs::{self, File};
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;

use anyhow::{Context as _, anyhow, bail};
use clap::Parser;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{Layer as _, fmt};

use crate::convert::{ConversionConfig, ExistingOutput};
use crate::discover::{discover, nested_output};
use crate::distribute::{Distributor, DistributorConfig};

/// Exit status for problems before any conversion started.
const SETUP_FAILURE: u8 = 2;

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory that is searched recursively for cbr and cbz files.
    input_root: PathBuf,

    /// Directory the converted archives are written to, created if missing.
    output_root: PathBuf,

    /// Number of archives converted in parallel [default: number of CPUs].
    #[arg(short = 'j', long)]
    threads: Option<NonZeroUsize>,

    /// What to do if a converted archive already exists.
    #[arg(long, value_enum, default_value_t)]
    existing: ExistingOutput,

    /// File that receives a log line for every processed archive.
    #[arg(long, default_value = "conversion.log")]
    log_file: PathBuf,

    /// Print more details to the console, can be given twice.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Do not draw a progress bar.
    #[arg(long)]
    no_progress: bool,
}

/// Print a message for the user.
fn stdout(msg: impl AsRef<str>) {
    println!("{}", msg.as_ref());
}

/// Send logs to the console and to `log_file`.
///
/// The returned guard flushes the log file when dropped.
fn init_logging(log_file: &Path, verbose: u8) -> anyhow::Result<WorkerGuard> {
    let file = File::options()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("Cannot open log file {}", log_file.display()))?;
    let (file_writer, guard) = tracing_appender::non_blocking(file);

    let console_level = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    };
    let console = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_filter(console_level);
    let file = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(LevelFilter::DEBUG);

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .context("Cannot install the logger")?;
    Ok(guard)
}

/// Raise a flag on the first interrupt and terminate on the second.
fn register_interrupt() -> anyhow::Result<Arc<AtomicBool>> {
    let interrupted = Arc::new(AtomicBool::new(false));
    for signal in TERM_SIGNALS {
        // order matters: the shutdown only triggers if the flag was set before
        flag::register_conditional_shutdown(*signal, 130, Arc::clone(&interrupted))
            .context("Cannot register signal handler")?;
        flag::register(*signal, Arc::clone(&interrupted))
            .context("Cannot register signal handler")?;
    }
    Ok(interrupted)
}

/// Set everything up, run all conversions and return the exit status.
fn run(args: Args) -> anyhow::Result<u8> {
    let _guard = init_logging(&args.log_file, args.verbose)?;
    let interrupted = register_interrupt()?;

    if !args.input_root.is_dir() {
        bail!("Input root is not a directory: {}", args.input_root.display());
    }
    fs::create_dir_all(&args.output_root).with_context(|| {
        let output = args.output_root.display();
        format!("Cannot create output root {output}")
    })?;

    let exclude =
        nested_output(&args.input_root, &args.output_root).map_err(|exn| anyhow!("{exn:?}"))?;
    let tasks =
        discover(&args.input_root, exclude.as_deref()).map_err(|exn| anyhow!("{exn:?}"))?;

    let n_workers = args.threads.unwrap_or_else(|| {
        thread::available_parallelism().unwrap_or(NonZeroUsize::MIN)
    });
    let conversion = ConversionConfig {
        output_root: args.output_root,
        existing: args.existing,
    };
    let config = DistributorConfig {
        n_workers,
        show_progress: !args.no_progress,
    };

    stdout(format!("Converting {} archives with {n_workers} workers...", tasks.len()));
    info!("starting conversion of {} archives", tasks.len());

    let report = Distributor::new(&conversion, config, interrupted)
        .run(tasks)
        .map_err(|exn| anyhow!("{exn:?}"))?;

    for (path, reason) in &report.relocation_failures {
        stdout(format!("Could not keep a copy of {}: {reason}", path.display()));
    }
    let summary = report.summary();
    info!("{summary}");
    stdout(summary);
    Ok(report.exit_status())
}

/// Exits with 0 if all archives were converted, 1 if some failed and 130 when interrupted.
fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(status) => ExitCode::from(status),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(SETUP_FAILURE)
        }
    }
}
