//! Disk budget monitor
//!
//! Samples free/total space for the staging filesystem and derives how much a
//! worker may still admit after keeping a fixed headroom. Samples are not
//! transactional: they predate writes already in flight, which is what the
//! `pending` correction approximates.

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::shutdown::Shutdown;

/// Raw filesystem sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSpace {
    pub total: u64,
    pub free: u64,
}

/// Source of disk samples; swapped out in tests
pub trait DiskProbe: Send + Sync {
    fn sample(&self, path: &Path) -> Result<DiskSpace>;
}

/// Samples the mounted filesystem that holds a path, via sysinfo
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDisks;

impl DiskProbe for SystemDisks {
    fn sample(&self, path: &Path) -> Result<DiskSpace> {
        use sysinfo::Disks;
        let target = path
            .canonicalize()
            .with_context(|| format!("canonicalize {}", path.display()))?;
        let disks = Disks::new_with_refreshed_list();
        // Longest mount point that prefixes the path wins (/ vs /mnt/scratch)
        disks
            .list()
            .iter()
            .filter(|d| target.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| DiskSpace {
                total: d.total_space(),
                free: d.available_space(),
            })
            .ok_or_else(|| anyhow!("no mounted filesystem contains {}", target.display()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskBudget {
    pub total: u64,
    pub free: u64,
    pub headroom: u64,
    /// free - headroom, floored at zero
    pub admissible: u64,
}

impl DiskBudget {
    pub fn from_sample(space: DiskSpace, headroom: u64) -> Self {
        DiskBudget {
            total: space.total,
            free: space.free,
            headroom,
            admissible: space.free.saturating_sub(headroom),
        }
    }
}

/// Names one `set_pending` call; only the latest ticket may clear the slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTicket(u64);

#[derive(Debug, Default)]
struct PendingSlot {
    seq: u64,
    bytes: u64,
}

pub struct BudgetMonitor {
    probe: Arc<dyn DiskProbe>,
    path: PathBuf,
    headroom: u64,
    /// Declared size of the latest requested transfer not yet written out
    pending: Mutex<PendingSlot>,
}

impl BudgetMonitor {
    pub fn new(probe: Arc<dyn DiskProbe>, path: impl Into<PathBuf>, headroom: u64) -> Self {
        BudgetMonitor {
            probe,
            path: path.into(),
            headroom,
            pending: Mutex::new(PendingSlot::default()),
        }
    }

    pub fn sample(&self) -> Result<DiskBudget> {
        let space = self.probe.sample(&self.path)?;
        Ok(DiskBudget::from_sample(space, self.headroom))
    }

    pub fn pending(&self) -> u64 {
        self.pending.lock().bytes
    }

    pub fn set_pending(&self, bytes: u64) -> PendingTicket {
        let mut slot = self.pending.lock();
        slot.seq += 1;
        slot.bytes = bytes;
        PendingTicket(slot.seq)
    }

    /// Clear `pending` if `ticket` is still the latest; a newer request has
    /// already replaced it otherwise.
    pub fn clear_pending(&self, ticket: PendingTicket) {
        let mut slot = self.pending.lock();
        if slot.seq == ticket.0 {
            slot.bytes = 0;
        }
    }

    /// admissible - pending >= requested
    pub fn admits(&self, budget: &DiskBudget, requested: u64) -> bool {
        match budget.admissible.checked_sub(self.pending()) {
            Some(room) => room >= requested,
            None => false,
        }
    }

    pub fn check(&self, requested: u64) -> Result<bool> {
        let budget = self.sample()?;
        let ok = self.admits(&budget, requested);
        debug!(
            free = budget.free,
            headroom = budget.headroom,
            pending = self.pending(),
            requested,
            admitted = ok,
            "disk budget check"
        );
        Ok(ok)
    }

    /// Poll until `requested` bytes are admissible. Returns `false` when shutdown
    /// interrupts the wait.
    pub async fn wait_for_room(&self, requested: u64, poll: Duration, shutdown: &mut Shutdown) -> Result<bool> {
        loop {
            if shutdown.is_triggered() {
                return Ok(false);
            }
            if self.check(requested)? {
                return Ok(true);
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = shutdown.cancelled() => return Ok(false),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Fixed(u64);
    impl DiskProbe for Fixed {
        fn sample(&self, _path: &Path) -> Result<DiskSpace> {
            Ok(DiskSpace {
                total: 1_000,
                free: self.0,
            })
        }
    }

    struct Rising(AtomicU64);
    impl DiskProbe for Rising {
        fn sample(&self, _path: &Path) -> Result<DiskSpace> {
            let free = self.0.fetch_add(100, Ordering::SeqCst);
            Ok(DiskSpace { total: 1_000, free })
        }
    }

    fn monitor(free: u64, headroom: u64) -> BudgetMonitor {
        BudgetMonitor::new(Arc::new(Fixed(free)), "/", headroom)
    }

    #[test]
    fn admissible_subtracts_headroom() {
        let budget = monitor(500, 200).sample().unwrap();
        assert_eq!(budget.admissible, 300);
        assert_eq!(budget.total, 1_000);

        let starved = monitor(100, 200).sample().unwrap();
        assert_eq!(starved.admissible, 0);
    }

    #[test]
    fn gate_is_free_minus_headroom_minus_pending() {
        let m = monitor(500, 200);
        assert!(m.check(300).unwrap());
        assert!(!m.check(301).unwrap());

        m.set_pending(100);
        assert!(m.check(200).unwrap());
        assert!(!m.check(201).unwrap());

        m.set_pending(400);
        assert!(!m.check(0).unwrap());
    }

    #[test]
    fn clear_pending_only_clears_latest_transfer() {
        let m = monitor(500, 0);
        let first = m.set_pending(10);
        let second = m.set_pending(20);
        m.clear_pending(first);
        assert_eq!(m.pending(), 20);
        m.clear_pending(second);
        assert_eq!(m.pending(), 0);
    }

    #[test]
    fn equal_sized_transfers_keep_the_newer_pending() {
        let m = monitor(500, 0);
        let first = m.set_pending(10);
        let second = m.set_pending(10);
        m.clear_pending(first);
        assert_eq!(m.pending(), 10);
        assert!(!m.check(491).unwrap());
        m.clear_pending(second);
        assert_eq!(m.pending(), 0);
    }

    #[tokio::test]
    async fn wait_for_room_polls_until_admitted() {
        let m = BudgetMonitor::new(Arc::new(Rising(AtomicU64::new(0))), "/", 0);
        let (_trigger, mut stop) = shutdown::channel();
        let ok = m
            .wait_for_room(250, Duration::from_millis(5), &mut stop)
            .await
            .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn wait_for_room_yields_to_shutdown() {
        let m = monitor(0, 0);
        let (trigger, mut stop) = shutdown::channel();
        let waiter = tokio::spawn(async move {
            m.wait_for_room(1, Duration::from_secs(60), &mut stop).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.trigger();
        assert!(!waiter.await.unwrap().unwrap());
    }

    #[test]
    fn system_disks_sample_root() {
        // Containers without a visible mount table are tolerated
        if let Ok(space) = SystemDisks.sample(Path::new("/")) {
            assert!(space.free <= space.total);
        }
    }
}
