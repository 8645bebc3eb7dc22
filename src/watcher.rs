use crate::config::Config;
use crate::path::HistoryPath;
use crate::store::{FileInfo, HistoryStore, Resource, ResourceKind};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use regex::RegexSet;
use std::fs;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::time::{Duration, Instant};

/// What a filesystem event means for the history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Record(PathBuf),
    Remove(PathBuf),
    Rename { from: PathBuf, to: PathBuf },
}

/// Maps files under a workspace root to history paths, skipping ignored ones.
pub struct Filter {
    root: PathBuf,
    ignore: Option<RegexSet>,
}

impl Filter {
    pub fn new<P: Into<PathBuf>>(root: P, patterns: &[String]) -> Self {
        let ignore = match RegexSet::new(patterns) {
            Ok(set) => Some(set),
            Err(e) => {
                log::warn!("Invalid ignore pattern, watching everything: {}", e);
                None
            }
        };
        Self {
            root: root.into(),
            ignore,
        }
    }

    /// `None` for paths outside the root, the root itself, or ignored paths.
    pub fn history_path(&self, path: &Path) -> Option<HistoryPath> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let relative = relative.to_string_lossy().replace('\\', "/");
        if let Some(set) = &self.ignore {
            if set.is_match(&relative) {
                return None;
            }
        }
        let key = HistoryPath::new(&relative);
        (!key.is_root()).then_some(key)
    }
}

/// How long the first half of a rename waits for its partner.
const RENAME_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug)]
struct PendingRename {
    tracker: Option<usize>,
    from: PathBuf,
    to: Option<PathBuf>,
    since: Instant,
}

/// Turns raw events into history changes.
///
/// Some backends report one rename as a `From` event, a `To` event and a
/// final `Both` event sharing a tracker id. The halves are held back until
/// the pair completes, so a rename never reads as a delete plus a new file.
/// A half left unpaired past [`RENAME_GRACE`] is released on its own: a
/// lone `From` means the file left the workspace.
#[derive(Debug, Default)]
pub struct Planner {
    renames: Vec<PendingRename>,
}

impl Planner {
    pub fn has_pending(&self) -> bool {
        !self.renames.is_empty()
    }

    pub fn plan(&mut self, event: &Event, filter: &Filter) -> Vec<Change> {
        let mut changes = self.expire(filter, RENAME_GRACE);
        let tracked = |p: &PathBuf| filter.history_path(p).is_some();
        match event.kind {
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
                let (from, to) = (&event.paths[0], &event.paths[1]);
                let tracker = event.tracker();
                self.renames.retain(|r| {
                    !(r.from == *from || (tracker.is_some() && r.tracker == tracker))
                });
                changes.extend(rename(filter, from, to));
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                let since = Instant::now();
                self.renames
                    .extend(event.paths.iter().map(|from| PendingRename {
                        tracker: event.tracker(),
                        from: from.clone(),
                        to: None,
                        since,
                    }));
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                let tracker = event.tracker();
                for to in &event.paths {
                    let partner = self
                        .renames
                        .iter_mut()
                        .find(|r| r.to.is_none() && tracker.is_some() && r.tracker == tracker);
                    match partner {
                        Some(r) => r.to = Some(to.clone()),
                        None if tracked(to) => changes.push(Change::Record(to.clone())),
                        None => {}
                    }
                }
            }
            EventKind::Remove(_) => changes.extend(
                event
                    .paths
                    .iter()
                    .filter(|p| tracked(*p))
                    .map(|p| Change::Remove(p.clone())),
            ),
            EventKind::Modify(ModifyKind::Metadata(_)) => {}
            EventKind::Modify(_) | EventKind::Create(_) => changes.extend(
                event
                    .paths
                    .iter()
                    .filter(|p| tracked(*p))
                    .map(|p| Change::Record(p.clone())),
            ),
            _ => {}
        }
        changes
    }

    /// Releases rename halves that have waited at least `older_than`.
    pub fn expire(&mut self, filter: &Filter, older_than: Duration) -> Vec<Change> {
        let (stale, fresh) = mem::take(&mut self.renames)
            .into_iter()
            .partition::<Vec<_>, _>(|r| r.since.elapsed() >= older_than);
        self.renames = fresh;

        let mut changes = Vec::new();
        for r in stale {
            match r.to {
                Some(to) => changes.extend(rename(filter, &r.from, &to)),
                None if filter.history_path(&r.from).is_some() => {
                    changes.push(Change::Remove(r.from))
                }
                None => {}
            }
        }
        changes
    }
}

fn rename(filter: &Filter, from: &Path, to: &Path) -> Option<Change> {
    let tracked = |p: &Path| filter.history_path(p).is_some();
    match (tracked(from), tracked(to)) {
        (true, true) => Some(Change::Rename {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
        }),
        (true, false) => Some(Change::Remove(from.to_path_buf())),
        (false, true) => Some(Change::Record(to.to_path_buf())),
        (false, false) => None,
    }
}

pub fn apply(store: &HistoryStore, filter: &Filter, change: &Change) {
    match change {
        Change::Record(path) => {
            let Some(key) = filter.history_path(path) else {
                return;
            };
            match fs::metadata(path) {
                Ok(meta) if meta.is_file() => {
                    let info = FileInfo::from_metadata(&meta);
                    if store.add_state(&key, path, info, false).is_some() {
                        log::debug!("Recorded state for {}", key);
                    }
                }
                Ok(_) => {}
                Err(e) => log::debug!("Skipping {}: {}", path.display(), e),
            }
        }
        Change::Remove(path) => {
            if let Some(key) = filter.history_path(path) {
                store.remove(&key);
            }
        }
        Change::Rename { from, to } => {
            let (Some(src), Some(dst)) = (filter.history_path(from), filter.history_path(to))
            else {
                return;
            };
            let kind = if !to.is_dir() {
                ResourceKind::File
            } else if dst.segment_count() == 1 {
                ResourceKind::Project
            } else {
                ResourceKind::Folder
            };
            let source = Resource {
                path: src.clone(),
                kind,
            };
            let destination = Resource { path: dst, kind };
            store.copy_history(&source, &destination, true);
            store.remove(&src);
        }
    }
}

/// Records every change under `root` until the event channel closes, running
/// a cleanup sweep whenever the workspace has been quiet for a while.
pub fn watch<P: AsRef<Path>>(root: P, config: &Config) -> anyhow::Result<()> {
    let root = root.as_ref();
    if !config.store.enabled {
        log::info!("History store disabled for {}", root.display());
        return Ok(());
    }

    let store = HistoryStore::open(root, config)?;
    store.startup();
    let filter = Filter::new(root, &config.watcher.ignore_patterns);

    let (tx, rx) = channel();
    let mut watcher = RecommendedWatcher::new(tx, notify::Config::default())?;
    watcher.watch(root, RecursiveMode::Recursive)?;

    let idle = Duration::from_secs(config.watcher.clean_interval_secs.max(1));
    let mut planner = Planner::default();
    loop {
        let timeout = if planner.has_pending() { RENAME_GRACE } else { idle };
        match rx.recv_timeout(timeout) {
            Ok(Ok(event)) => {
                for change in planner.plan(&event, &filter) {
                    apply(&store, &filter, &change);
                }
            }
            Ok(Err(e)) => log::warn!("Watch error: {:?}", e),
            Err(RecvTimeoutError::Timeout) if planner.has_pending() => {
                for change in planner.expire(&filter, Duration::ZERO) {
                    apply(&store, &filter, &change);
                }
            }
            Err(RecvTimeoutError::Timeout) => store.clean(),
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    for change in planner.expire(&filter, Duration::ZERO) {
        apply(&store, &filter, &change);
    }

    store.shutdown()?;
    Ok(())
}
