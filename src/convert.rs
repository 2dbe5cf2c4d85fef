//! Conversion of a single comic archive into an uncompressed cbz.
//!
//! The conversion is a small state machine:
//!
//! ```text
//! Start -> Sniffing -> Extracting -> Repacking -> Done(Success)
//!              \           \             \
//!               +-----------+-------------+--> RecoveryAttempt -> Extracting -> ... -> Done
//! ```
//!
//! The recovery attempt is entered at most once per task. It tries the alternative archive
//! kind(s) for files whose extension lies about their content.

pub mod extract;
pub mod relocate;
pub mod repack;
pub mod scratch;
pub mod sniff;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use derive_more::Display;
use exn::Exn;
use tracing::{debug, warn};

use crate::convert::extract::{ExtractedTree, extract};
use crate::convert::repack::repack;
use crate::convert::scratch::ScratchSpace;
use crate::convert::sniff::{ArchiveKind, sniff};
use crate::error::SniffIndeterminate;

/// A single archive to convert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputTask {
    /// Where the archive is located.
    source: PathBuf,
    /// The path of the archive relative to the input root.
    relative: PathBuf,
}

impl InputTask {
    /// Create a task for the archive at `source`, found at `relative` below the input root.
    pub const fn new(source: PathBuf, relative: PathBuf) -> Self {
        Self { source, relative }
    }

    /// The archive to convert.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// The location of the archive relative to the input root.
    pub fn relative(&self) -> &Path {
        &self.relative
    }
}

/// What to do when the destination of a conversion already exists.
#[derive(clap::ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExistingOutput {
    /// Replace the existing file.
    #[default]
    Overwrite,
    /// Leave the existing file alone and skip the conversion.
    Skip,
}

/// Settings shared by all conversions of a run.
#[derive(Debug, Clone)]
pub struct ConversionConfig {
    /// The root below which converted archives are written.
    pub output_root: PathBuf,
    /// How to handle already existing output files.
    pub existing: ExistingOutput,
}

impl ConversionConfig {
    /// Where the converted archive of `task` gets written.
    pub fn destination(&self, task: &InputTask) -> PathBuf {
        self.output_root.join(task.relative())
    }
}

/// The final state of a conversion.
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum Status {
    /// Converted as the archive kind its content and name agree on.
    #[display("success")]
    Success,
    /// Converted after the first attempt failed, using another archive kind.
    #[display("recovered")]
    Recovered,
    /// The destination existed already and was left alone.
    #[display("skipped")]
    Skipped,
    /// Nothing worked; holds a description of every attempt.
    #[display("failed")]
    Failed(String),
}

/// The result of running the conversion for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionOutcome {
    /// The task that was processed.
    pub task: InputTask,
    /// How it ended.
    pub status: Status,
}

impl ConversionOutcome {
    /// The reason of a failure, present exactly for failed conversions.
    pub fn error_detail(&self) -> Option<&str> {
        match &self.status {
            Status::Failed(detail) => Some(detail),
            _ => None,
        }
    }

    /// Whether the conversion failed.
    pub const fn is_failed(&self) -> bool {
        matches!(self.status, Status::Failed(_))
    }

    /// The line describing this outcome in the log.
    pub fn log_line(&self) -> String {
        let path = self.task.relative().display();
        let status = &self.status;
        match self.error_detail() {
            Some(detail) => format!("{path}: {status}: {detail}"),
            None => format!("{path}: {status}"),
        }
    }
}

/// Run the whole conversion for `task`.
///
/// Never fails: every error ends up in the returned outcome. All temporary files created on the
/// way are gone once this returns.
pub fn convert_single(
    task: InputTask,
    config: &ConversionConfig,
    scratch: &ScratchSpace,
) -> ConversionOutcome {
    let job = Job {
        task: &task,
        destination: config.destination(&task),
        scratch,
    };

    let mut state = State::Start;
    let status = loop {
        state = match state {
            State::Done(status) => break status,
            state => job.step(state, config.existing),
        };
    };
    debug!("{} ended with {status}", task.relative().display());
    ConversionOutcome { task, status }
}

/// Everything the state machine needs to know about the task at hand.
struct Job<'a> {
    /// The task being converted.
    task: &'a InputTask,
    /// The final location of the converted archive.
    destination: PathBuf,
    /// Where extractions take place.
    scratch: &'a ScratchSpace,
}

/// The states of a single conversion.
enum State {
    /// Nothing happened yet.
    Start,
    /// Find out which kind of archive we deal with.
    Sniffing,
    /// Extract the archive as the given kind.
    Extracting(Attempt),
    /// Write the extracted members into the new archive.
    Repacking(Attempt, ExtractedTree),
    /// The first attempt failed, try the alternatives.
    RecoveryAttempt {
        /// Why the first attempt failed.
        cause: String,
        /// The kinds to try, in order.
        candidates: VecDeque<ArchiveKind>,
    },
    /// The conversion ended.
    Done(Status),
}

/// Which attempt is currently running and with which archive kind.
struct Attempt {
    /// The archive kind this attempt uses.
    kind: ArchiveKind,
    /// `None` for the first attempt, otherwise the state of the recovery.
    recovery: Option<Recovery>,
}

/// Bookkeeping of the recovery attempt.
struct Recovery {
    /// The kinds not tried yet.
    remaining: VecDeque<ArchiveKind>,
    /// Descriptions of all failures so far.
    failures: Vec<String>,
}

impl Job<'_> {
    /// Advance the state machine by one transition.
    fn step(&self, state: State, existing: ExistingOutput) -> State {
        match state {
            State::Start => self.start(existing),
            State::Sniffing => self.sniffing(),
            State::Extracting(attempt) => self.extracting(attempt),
            State::Repacking(attempt, tree) => self.repacking(attempt, tree),
            State::RecoveryAttempt { cause, candidates } => self.recovery(cause, candidates),
            State::Done(status) => State::Done(status),
        }
    }

    /// Check if there is anything to do at all.
    fn start(&self, existing: ExistingOutput) -> State {
        if existing == ExistingOutput::Skip && self.destination.exists() {
            debug!("destination {:?} exists, skipping", self.destination);
            return State::Done(Status::Skipped);
        }
        State::Sniffing
    }

    /// Compare the content of the archive with what its name claims.
    fn sniffing(&self) -> State {
        let path = self.task.source();
        let claimed = ArchiveKind::claimed_by(path);
        let sniffed = match sniff(path) {
            Ok(kind) => kind,
            Err(exn) => return State::Done(Status::Failed(exn.to_string())),
        };

        use ArchiveKind::*;
        match (claimed, sniffed) {
            (claimed, sniffed) if sniffed.is_known() && (claimed == sniffed || claimed == Unknown) => {
                State::Extracting(Attempt {
                    kind: sniffed,
                    recovery: None,
                })
            }
            (claimed, Unknown) => {
                let cause = SniffIndeterminate::new(path).to_string();
                let candidates = match claimed {
                    Unknown => VecDeque::from([ZipLike, RarLike]),
                    claimed => VecDeque::from([claimed, claimed.other()]),
                };
                State::RecoveryAttempt { cause, candidates }
            }
            (claimed, sniffed) => {
                let cause = format!("content is a {sniffed} archive, but the name claims {claimed}");
                let candidates = VecDeque::from([sniffed]);
                State::RecoveryAttempt { cause, candidates }
            }
        }
    }

    /// Extract the archive into a fresh scratch directory.
    fn extracting(&self, attempt: Attempt) -> State {
        let dir = match self.scratch.allocate() {
            Ok(dir) => dir,
            Err(exn) => return self.failed(attempt, exn.to_string()),
        };
        match extract(self.task.source(), attempt.kind, dir) {
            Ok(tree) => {
                debug!("extracted {} members as {}", tree.len(), attempt.kind);
                State::Repacking(attempt, tree)
            }
            Err(exn) => self.failed(attempt, Self::describe(&exn)),
        }
    }

    /// Write the new archive. The extracted tree is dropped when this returns.
    fn repacking(&self, attempt: Attempt, tree: ExtractedTree) -> State {
        match repack(&tree, &self.destination) {
            Ok(()) => match attempt.recovery {
                None => State::Done(Status::Success),
                Some(_) => State::Done(Status::Recovered),
            },
            Err(exn) => {
                drop(tree);
                self.failed(attempt, Self::describe(&exn))
            }
        }
    }

    /// Start the recovery with the first candidate.
    fn recovery(&self, cause: String, mut candidates: VecDeque<ArchiveKind>) -> State {
        let path = self.task.relative().display();
        warn!("{path}: {cause}, trying to recover");

        let recovery = Recovery {
            remaining: VecDeque::new(),
            failures: vec![cause],
        };
        match candidates.pop_front() {
            Some(kind) => State::Extracting(Attempt {
                kind,
                recovery: Some(Recovery {
                    remaining: candidates,
                    ..recovery
                }),
            }),
            None => State::Done(Status::Failed(recovery.failures.join("; "))),
        }
    }

    /// Decide where to go after an attempt failed with `reason`.
    fn failed(&self, attempt: Attempt, reason: String) -> State {
        let Attempt { kind, recovery } = attempt;
        match recovery {
            // the first attempt failed, recover with the other kind
            None => State::RecoveryAttempt {
                cause: format!("as {kind}: {reason}"),
                candidates: VecDeque::from([kind.other()]),
            },
            Some(Recovery {
                mut remaining,
                mut failures,
            }) => {
                failures.push(format!("recovery as {kind}: {reason}"));
                match remaining.pop_front() {
                    Some(kind) => State::Extracting(Attempt {
                        kind,
                        recovery: Some(Recovery {
                            remaining,
                            failures,
                        }),
                    }),
                    None => State::Done(Status::Failed(failures.join("; "))),
                }
            }
        }
    }

    /// One-line description of a stage error.
    fn describe<E>(exn: &Exn<E>) -> String
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        debug!("{exn:?}");
        exn.to_string()
    }
}
