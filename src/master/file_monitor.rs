//! File monitor: reports changes under the project root
//!
//! Events from `notify` are filtered through the ignore globs, collected for
//! a short window, and handed to a callback one batch at a time.

use crate::master::supervisor::{Subsystem, SubsystemContext};
use anyhow::{bail, Context, Result};
use glob::Pattern;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long changes are collected before a batch is reported
pub const BATCH_WINDOW: Duration = Duration::from_millis(100);

/// How often the monitor checks for a stop request while idle
const POLL_INTERVAL: Duration = Duration::from_millis(50);

type ChangeCallback = Box<dyn FnMut(&[PathBuf]) + Send>;

pub struct FileMonitor {
    root: PathBuf,
    ignore: Vec<Pattern>,
    on_change: ChangeCallback,
}

impl FileMonitor {
    pub fn new(
        root: impl Into<PathBuf>,
        ignore: &[String],
        on_change: impl FnMut(&[PathBuf]) + Send + 'static,
    ) -> Result<Self> {
        let root = root.into();
        let root = root.canonicalize().unwrap_or(root);

        let ignore = ignore
            .iter()
            .map(|p| Pattern::new(p).with_context(|| format!("invalid ignore pattern {:?}", p)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            root,
            ignore,
            on_change: Box::new(on_change),
        })
    }

    /// Whether `path` (absolute, or relative to the root) should be skipped
    pub fn is_ignored(&self, path: &Path) -> bool {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let relative = relative.to_string_lossy();
        self.ignore.iter().any(|pattern| pattern.matches(&relative))
    }

    fn collect(&self, event: Event, pending: &mut BTreeSet<PathBuf>) {
        if event.kind.is_access() || event.kind.is_other() {
            return;
        }
        for path in event.paths {
            if !self.is_ignored(&path) {
                pending.insert(path);
            }
        }
    }
}

impl Subsystem for FileMonitor {
    fn name(&self) -> &'static str {
        "file-monitor"
    }

    fn run(mut self: Box<Self>, ctx: SubsystemContext) -> Result<()> {
        let (tx, rx) = mpsc::channel::<notify::Result<Event>>();
        let mut watcher =
            RecommendedWatcher::new(tx, Config::default()).context("failed to create file watcher")?;
        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch {}", self.root.display()))?;
        info!(root = %self.root.display(), "watching for file changes");

        let mut pending = BTreeSet::new();
        let mut batch_started: Option<Instant> = None;

        while !ctx.stop.is_stopped() {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(Ok(event)) => {
                    debug!(?event, "file event");
                    self.collect(event, &mut pending);
                    if !pending.is_empty() && batch_started.is_none() {
                        batch_started = Some(Instant::now());
                    }
                }
                Ok(Err(e)) => warn!("file watch error: {}", e),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => bail!("file watcher stopped unexpectedly"),
            }

            if batch_started.is_some_and(|started| started.elapsed() >= BATCH_WINDOW) {
                let changed: Vec<PathBuf> = std::mem::take(&mut pending).into_iter().collect();
                batch_started = None;
                (self.on_change)(&changed);
            }
        }

        drop(watcher);
        debug!("file monitor stopped");
        Ok(())
    }
}
