//! Fleet listener and admission
//!
//! The coordinator accepts control connections while fewer than `capacity`
//! sessions are open. Once it sees the fleet full it stops accepting for good:
//! excess connection attempts get no reply, they are simply never accepted.

use anyhow::{bail, Context, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::buffer::BufferSizer;
use crate::config::CoordinatorConfig;
use crate::ledger::TransferLedger;
use crate::pool::WorkPool;
use crate::protocol::FIELD_SEP;
use crate::session::coordinator::{CoordinatorContext, CoordinatorReport, CoordinatorSession, ResultSink};
use crate::session::Role;
use crate::shutdown::Shutdown;
use crate::transport::Transport;

pub struct FleetCapacity {
    max: usize,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl FleetCapacity {
    pub fn new(max: usize) -> Self {
        FleetCapacity {
            max,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Highest concurrent session count seen so far
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn is_full(&self) -> bool {
        self.current() >= self.max
    }

    /// Take a slot if one is free; the slot gives it back when dropped
    pub fn try_acquire(self: &Arc<Self>) -> Option<FleetSlot> {
        let max = self.max;
        let previous = self
            .current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .ok()?;
        self.peak.fetch_max(previous + 1, Ordering::SeqCst);
        Some(FleetSlot {
            fleet: Arc::clone(self),
        })
    }
}

pub struct FleetSlot {
    fleet: Arc<FleetCapacity>,
}

impl Drop for FleetSlot {
    fn drop(&mut self) {
        self.fleet.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One coordinator instance: pool, claim registry and fleet counter are all
/// owned here, so independent coordinators never share state.
pub struct Coordinator {
    ctx: Arc<CoordinatorContext>,
    fleet: Arc<FleetCapacity>,
    listen: String,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, transport: Transport) -> Result<Self> {
        config.validate()?;
        let pool = WorkPool::open(&config.pool_dir, config.max_file_size)?;
        let hash_file = config
            .hash_file
            .canonicalize()
            .with_context(|| format!("hash file {}", config.hash_file.display()))?;
        match hash_file.to_str() {
            Some(s) if !s.contains([FIELD_SEP, '<', '>']) => {}
            _ => bail!("hash file path cannot be carried in a frame: {}", hash_file.display()),
        }

        let ctx = CoordinatorContext {
            pool,
            hash_file,
            results: ResultSink::new(&config.results_path),
            ledger: config.ledger_path.as_deref().map(TransferLedger::new),
            buffers: BufferSizer::default(),
            timeouts: config.timeouts(),
            transport,
        };
        Ok(Coordinator {
            ctx: Arc::new(ctx),
            fleet: Arc::new(FleetCapacity::new(config.capacity)),
            listen: config.listen,
        })
    }

    pub fn fleet(&self) -> &Arc<FleetCapacity> {
        &self.fleet
    }

    pub fn pool(&self) -> &WorkPool {
        &self.ctx.pool
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(&self.listen)
            .await
            .with_context(|| format!("bind {}", self.listen))
    }

    /// Accept until the fleet is full or shutdown fires, then wait for every
    /// session to close. Session failures are logged, never fatal here; a
    /// session that got past the handshake always yields a report.
    pub async fn serve(&self, listener: TcpListener, shutdown: Shutdown) -> Result<Vec<CoordinatorReport>> {
        let local = listener.local_addr()?;
        info!(%local, capacity = self.fleet.max(), tls = self.ctx.transport.is_tls(), "fleet listener accepting");

        let mut stop = shutdown.clone();
        let mut sessions = JoinSet::new();
        loop {
            if self.fleet.is_full() {
                info!(capacity = self.fleet.max(), "fleet capacity reached; no longer accepting");
                break;
            }
            let accepted = tokio::select! {
                r = listener.accept() => Some(r),
                _ = stop.cancelled() => None,
            };
            let Some(accepted) = accepted else {
                info!("shutdown requested; listener closed");
                break;
            };
            let (tcp, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            };
            // Only this loop acquires, so a slot is always free here
            let Some(slot) = self.fleet.try_acquire() else {
                break;
            };

            let id = Uuid::new_v4();
            let ctx = self.ctx.clone();
            let session_shutdown = shutdown.clone();
            let active = self.fleet.current();
            let span = info_span!("session", role = %Role::Coordinator, %id, %peer);
            sessions.spawn(
                async move {
                    let _slot = slot;
                    info!(active, "worker connected");
                    let stream = match ctx.transport.accept(tcp, ctx.timeouts.reply).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!("handshake failed: {:#}", e);
                            return None;
                        }
                    };
                    Some(
                        CoordinatorSession::new(id, ctx, stream, peer)
                            .run(session_shutdown)
                            .await,
                    )
                }
                .instrument(span),
            );
        }
        drop(listener);

        let mut reports = Vec::new();
        while let Some(joined) = sessions.join_next().await {
            match joined {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(e) => warn!("session task panicked: {}", e),
            }
        }
        info!(sessions = reports.len(), claimed = self.ctx.pool.claimed_count(), "fleet drained");
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_bounded_and_returned_on_drop() {
        let fleet = Arc::new(FleetCapacity::new(2));
        let a = fleet.try_acquire().unwrap();
        let b = fleet.try_acquire().unwrap();
        assert!(fleet.try_acquire().is_none());
        assert!(fleet.is_full());
        drop(a);
        assert_eq!(fleet.current(), 1);
        let _c = fleet.try_acquire().unwrap();
        drop(b);
        assert_eq!(fleet.peak(), 2);
    }

    #[test]
    fn concurrent_acquires_never_exceed_max() {
        let fleet = Arc::new(FleetCapacity::new(3));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let fleet = fleet.clone();
                std::thread::spawn(move || fleet.try_acquire())
            })
            .collect();
        let slots: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(slots.len(), 3);
        assert_eq!(fleet.current(), 3);
        drop(slots);
        assert_eq!(fleet.current(), 0);
        assert_eq!(fleet.peak(), 3);
    }
}
