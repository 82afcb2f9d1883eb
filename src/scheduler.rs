// src/scheduler.rs

use indicatif::{ProgressBar, ProgressStyle};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::time::Instant;
use tracing::{info, warn};

use crate::error::{FailureKind, Result};
use crate::model::{Outcome, RunCounters, Status, WorkItem};
use crate::runner::Runner;

pub struct Scheduler {
    pool: ThreadPool,
    limit: usize,
}

impl Scheduler {
    pub fn new(limit: usize) -> Result<Self> {
        let limit = limit.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(limit)
            .thread_name(|i| format!("refmine-worker-{i}"))
            .build()?;
        Ok(Self { pool, limit })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Run `op` inside the bounded pool, so rayon iterators it starts are
    /// capped at `limit` threads too.
    pub fn install<OP, T>(&self, op: OP) -> T
    where
        OP: FnOnce() -> T + Send,
        T: Send,
    {
        self.pool.install(op)
    }

    /// Run every item, returning exactly one outcome per item in completion order.
    pub fn run_all<R: Runner>(&self, items: Vec<WorkItem>, runner: &R) -> Vec<Outcome> {
        self.run_all_with(items, runner, |_, _| {})
    }

    /// Like [`run_all`](Self::run_all), calling `on_complete` on the calling
    /// thread as each outcome arrives, with the running tally.
    pub fn run_all_with<R, F>(&self, items: Vec<WorkItem>, runner: &R, mut on_complete: F) -> Vec<Outcome>
    where
        R: Runner,
        F: FnMut(&Outcome, &RunCounters),
    {
        let total = items.len();
        let (tx, rx) = mpsc::channel::<Outcome>();

        self.pool.in_place_scope(|scope| {
            for item in items {
                let tx = tx.clone();
                scope.spawn(move |_| {
                    let started = Instant::now();
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| runner.run(&item)))
                        .unwrap_or_else(|_| {
                            Outcome::failure(item, FailureKind::Transport, "runner panicked", started.elapsed())
                        });
                    // The receiver outlives every spawned job.
                    let _ = tx.send(outcome);
                });
            }
            drop(tx);

            let mut counters = RunCounters::default();
            let mut outcomes = Vec::with_capacity(total);
            for outcome in rx {
                match outcome.status {
                    Status::Success => counters.succeeded += 1,
                    Status::Failure | Status::Timeout => counters.failed += 1,
                }
                on_complete(&outcome, &counters);
                outcomes.push(outcome);
            }
            outcomes
        })
    }
}

/// Terminal progress for one batch: `ok N/total, failed M/total`.
pub struct Progress {
    bar: ProgressBar,
    label: &'static str,
    total: usize,
}

impl Progress {
    pub fn new(label: &'static str, total: usize) -> Self {
        let bar = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::with_template("{prefix:>10} [{bar:30}] {pos}/{len} {msg}") {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.set_prefix(label);
        Self { bar, label, total }
    }

    pub fn observe(&self, outcome: &Outcome, counters: &RunCounters) {
        if !outcome.is_success() {
            self.bar.suspend(|| warn!("{} {} failed: {}", self.label, outcome.item, outcome.reason()));
        }
        self.bar.set_message(format!(
            "ok {}/{}, failed {}/{}",
            counters.succeeded, self.total, counters.failed, self.total
        ));
        self.bar.inc(1);
    }

    pub fn finish(self, counters: &RunCounters) {
        self.bar.finish_and_clear();
        info!(
            "{} finished: {} succeeded, {} failed, {} skipped",
            self.label, counters.succeeded, counters.failed, counters.skipped
        );
    }
}

/// Run a batch with a progress bar, returning the outcomes and the tally.
pub fn run_with_progress<R: Runner>(
    scheduler: &Scheduler,
    label: &'static str,
    items: Vec<WorkItem>,
    runner: &R,
) -> (Vec<Outcome>, RunCounters) {
    let progress = Progress::new(label, items.len());
    let mut last = RunCounters::default();
    let outcomes = scheduler.run_all_with(items, runner, |outcome, counters| {
        progress.observe(outcome, counters);
        last = *counters;
    });
    progress.finish(&last);
    (outcomes, last)
}
