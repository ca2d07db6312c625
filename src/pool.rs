//! Work pool and file selector
//!
//! The pool directory is shared by every session of one coordinator. Each file is
//! claimed at most once, ever: the claim registry is a single check-and-set keyed
//! by absolute path and it never shrinks.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::protocol::FIELD_SEP;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    Claimed,
    Transferring,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub path: PathBuf,
    pub size: u64,
}

pub struct WorkPool {
    dir: PathBuf,
    max_file_size: u64,
    // Files never present here are Available
    claims: Mutex<HashMap<PathBuf, WorkState>>,
}

impl WorkPool {
    pub fn open(dir: &Path, max_file_size: u64) -> Result<Self> {
        let dir = dir
            .canonicalize()
            .with_context(|| format!("pool directory {}", dir.display()))?;
        if !dir.is_dir() {
            bail!("pool path is not a directory: {}", dir.display());
        }
        if dir.to_string_lossy().contains(FIELD_SEP) {
            bail!("pool path cannot contain '{}': {}", FIELD_SEP, dir.display());
        }
        Ok(WorkPool {
            dir,
            max_file_size,
            claims: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Claim the first unclaimed eligible file, or `None` when the pool is
    /// exhausted. Oversized files stay invisible until something shrinks them.
    pub fn select_file(&self) -> Result<Option<WorkItem>> {
        for candidate in self.scan()? {
            if self.try_claim(&candidate.path) {
                debug!(path = %candidate.path.display(), size = candidate.size, "claimed pool file");
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Eligible files in name order, claimed or not
    fn scan(&self) -> Result<Vec<WorkItem>> {
        let mut items = Vec::new();
        let walker = WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .follow_links(true)
            .sort_by_file_name();
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) if e.depth() == 0 => {
                    return Err(e).with_context(|| format!("scan {}", self.dir.display()))
                }
                Err(e) => {
                    warn!("skipping unreadable pool entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.into_path();
            // Names the control frame cannot carry are never eligible
            match path.file_name().and_then(|n| n.to_str()) {
                Some(name) if !name.contains([FIELD_SEP, '<', '>']) => {}
                _ => {
                    debug!(path = %path.display(), "skipping unframeable file name");
                    continue;
                }
            }
            let size = match std::fs::metadata(&path) {
                Ok(m) => m.len(),
                Err(e) => {
                    debug!(path = %path.display(), "file vanished during scan: {}", e);
                    continue;
                }
            };
            if size > self.max_file_size {
                continue;
            }
            items.push(WorkItem { path, size });
        }
        Ok(items)
    }

    // Single lock acquisition: check and set happen together
    fn try_claim(&self, path: &Path) -> bool {
        match self.claims.lock().entry(path.to_path_buf()) {
            Entry::Vacant(slot) => {
                slot.insert(WorkState::Claimed);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    pub fn state(&self, path: &Path) -> Option<WorkState> {
        self.claims.lock().get(path).copied()
    }

    pub fn claimed_count(&self) -> usize {
        self.claims.lock().len()
    }

    pub fn mark_transferring(&self, item: &WorkItem) {
        self.set_state(item, WorkState::Transferring);
    }

    /// Transfer finished: the work file leaves the pool
    pub fn complete(&self, item: &WorkItem) -> Result<()> {
        self.set_state(item, WorkState::Done);
        std::fs::remove_file(&item.path)
            .with_context(|| format!("remove transferred pool file {}", item.path.display()))
    }

    /// Transfer aborted. The claim is kept and the file stays where it is.
    pub fn fail(&self, item: &WorkItem) {
        self.set_state(item, WorkState::Failed);
    }

    fn set_state(&self, item: &WorkItem, state: WorkState) {
        // Only claimed files change state; the registry never loses an entry
        if let Some(current) = self.claims.lock().get_mut(&item.path) {
            *current = state;
        }
    }
}
