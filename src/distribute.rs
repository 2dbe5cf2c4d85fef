//! Running all conversions on a pool of worker threads.

use std::any::Any;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use exn::{Exn, ResultExt as _};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, error, info, warn};

use crate::convert::relocate::relocate;
use crate::convert::scratch::ScratchSpace;
use crate::convert::{ConversionConfig, ConversionOutcome, InputTask, Status, convert_single};
use crate::error::ErrorMessage;

/// Layout of the progress bar.
const BAR_TEMPLATE: &str = "{spinner} [{elapsed_precise}] {wide_bar} {pos}/{len} archives";

/// Settings of the worker pool.
#[derive(Debug, Clone)]
pub struct DistributorConfig {
    /// How many archives get converted at the same time.
    pub n_workers: NonZeroUsize,
    /// Whether to draw a progress bar.
    pub show_progress: bool,
}

/// Runs conversions in parallel and collects their outcomes.
pub struct Distributor<'a> {
    /// How each archive gets converted.
    conversion: &'a ConversionConfig,
    /// How the work is distributed.
    config: DistributorConfig,
    /// Set once the user asked us to stop.
    interrupted: Arc<AtomicBool>,
}

/// What a worker tells the distributor about a finished task.
#[derive(Debug)]
struct TaskReport {
    /// How the conversion went.
    outcome: ConversionOutcome,
    /// Why the copy into the `_failed` tree did not work, if it was needed and failed.
    relocation_error: Option<String>,
}

/// The count of processed archives, shown as progress bar.
///
/// Only the distributor thread writes to it.
struct Progress {
    /// The visual representation, possibly hidden.
    bar: ProgressBar,
    /// Archives processed so far.
    processed: usize,
}

impl Progress {
    /// Start counting up to `total`.
    fn new(total: usize, visible: bool) -> Self {
        let bar = match visible {
            true => ProgressBar::new(total as u64),
            false => ProgressBar::hidden(),
        };
        match ProgressStyle::with_template(BAR_TEMPLATE) {
            Ok(style) => bar.set_style(style),
            Err(e) => debug!("keeping default progress style: {e}"),
        }
        Self { bar, processed: 0 }
    }

    /// Count one more processed archive.
    fn advance(&mut self) {
        self.processed += 1;
        self.bar.set_position(self.processed as u64);
    }

    /// Remove the bar from the terminal.
    fn finish(self) -> usize {
        self.bar.finish_and_clear();
        self.processed
    }
}

/// The summary of a whole run.
#[derive(Debug, Default)]
pub struct RunReport {
    /// One outcome per started task, in order of completion.
    pub outcomes: Vec<ConversionOutcome>,
    /// Failed inputs that could not be copied into the `_failed` tree, with the reason.
    pub relocation_failures: Vec<(PathBuf, String)>,
    /// Tasks never started because the run was interrupted.
    pub not_started: usize,
}

impl RunReport {
    /// Number of outcomes with the given status, ignoring failure details.
    fn count(&self, pred: impl Fn(&Status) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.status)).count()
    }

    /// Whether the run ended before every task got started.
    pub const fn interrupted(&self) -> bool {
        self.not_started > 0
    }

    /// The process exit status for this run.
    pub fn exit_status(&self) -> u8 {
        if self.interrupted() {
            return 130;
        }
        match self.outcomes.iter().any(ConversionOutcome::is_failed) {
            true => 1,
            false => 0,
        }
    }

    /// A one-line description of how the run went.
    pub fn summary(&self) -> String {
        let processed = self.outcomes.len();
        let converted = self.count(|s| matches!(s, Status::Success));
        let recovered = self.count(|s| matches!(s, Status::Recovered));
        let skipped = self.count(|s| matches!(s, Status::Skipped));
        let failed = self.count(|s| matches!(s, Status::Failed(_)));

        let mut summary = format!(
            "processed: {processed}, converted: {converted}, recovered: {recovered}, \
             skipped: {skipped}, failed: {failed}"
        );
        if self.interrupted() {
            let not_started = self.not_started;
            summary.push_str(&format!(", not started: {not_started}"));
        }
        summary
    }
}

impl<'a> Distributor<'a> {
    /// Prepare a pool that converts archives according to `conversion`.
    ///
    /// Workers stop picking up new tasks once `interrupted` is set.
    pub const fn new(
        conversion: &'a ConversionConfig,
        config: DistributorConfig,
        interrupted: Arc<AtomicBool>,
    ) -> Self {
        Self {
            conversion,
            config,
            interrupted,
        }
    }

    /// Convert all `tasks` and wait until every started conversion finished.
    ///
    /// Only fails if the shared scratch space cannot be set up. Failures of single conversions
    /// are part of the returned report.
    pub fn run(&self, tasks: Vec<InputTask>) -> Result<RunReport, Exn<ErrorMessage>> {
        let output_root = &self.conversion.output_root;
        let err = || ErrorMessage::new("Could not prepare the conversion");
        let scratch = ScratchSpace::new(output_root).or_raise(err)?;

        let total = tasks.len();
        let n_workers = self.config.n_workers.get().min(total);
        debug!("converting {total} archives with {n_workers} workers");

        let queue = Mutex::new(VecDeque::from(tasks));
        let mut progress = Progress::new(total, self.config.show_progress);
        let mut report = RunReport::default();

        thread::scope(|s| {
            let (tx, rx) = mpsc::channel();
            for _ in 0..n_workers {
                let tx = tx.clone();
                let (queue, scratch) = (&queue, &scratch);
                s.spawn(move || self.work(queue, scratch, &tx));
            }
            // the loop below ends once all workers dropped their sender
            drop(tx);

            for TaskReport {
                outcome,
                relocation_error,
            } in rx
            {
                info!("{}", outcome.log_line());
                if let Some(reason) = relocation_error {
                    let path = outcome.task.relative().to_path_buf();
                    report.relocation_failures.push((path, reason));
                }
                report.outcomes.push(outcome);
                progress.advance();
            }
        });

        let processed = progress.finish();
        debug_assert_eq!(processed, report.outcomes.len(), "one report per started task");

        report.not_started = queue.into_inner().unwrap_or_else(PoisonError::into_inner).len();
        if report.interrupted() {
            warn!("interrupted, {} archives were not started", report.not_started);
        }
        Ok(report)
    }

    /// Take tasks from `queue` until it is empty or we got interrupted.
    fn work(
        &self,
        queue: &Mutex<VecDeque<InputTask>>,
        scratch: &ScratchSpace,
        reports: &Sender<TaskReport>,
    ) {
        loop {
            if self.interrupted.load(Ordering::Relaxed) {
                debug!("worker stops after interrupt");
                return;
            }
            let next = queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
            let Some(task) = next else {
                return;
            };

            let report = self.process(task, scratch);
            if reports.send(report).is_err() {
                return;
            }
        }
    }

    /// Convert a single archive and keep a copy of the input if that failed.
    fn process(&self, task: InputTask, scratch: &ScratchSpace) -> TaskReport {
        let attempt = task.clone();
        let converted = panic::catch_unwind(AssertUnwindSafe(|| {
            convert_single(attempt, self.conversion, scratch)
        }));
        let outcome = converted.unwrap_or_else(|payload| {
            let reason = panic_reason(payload.as_ref());
            error!("conversion of {:?} panicked: {reason}", task.relative());
            ConversionOutcome {
                task,
                status: Status::Failed(format!("conversion panicked: {reason}")),
            }
        });

        let relocation_error = match outcome.is_failed() {
            true => relocate(&outcome.task, &self.conversion.output_root)
                .err()
                .map(|exn| {
                    error!("{exn}");
                    exn.to_string()
                }),
            false => None,
        };
        TaskReport {
            outcome,
            relocation_error,
        }
    }
}

/// The message a panic was raised with.
fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return (*msg).to_owned();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "unknown cause".to_owned()
}
