//! Worker side of a fleet session
//!
//! `SendHashFile -> Ready`, then while the disk budget admits another file:
//! `TRANSFER_REQUEST` and wait for the reply.
//! - `START_TRANSFER`: open a data-plane listener, send its port, receive in background
//! - `END_TRANSFER`: close the processing queue and drain
//!
//! Draining ends once every received file has been processed and its output sent;
//! then `PROCESSING_COMPLETE` closes the session.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::buffer::BufferSizer;
use crate::codec::{read_frame, write_frame, write_port, Frame};
use crate::config::WorkerConfig;
use crate::data_plane::{pump, DataListener};
use crate::disk::{BudgetMonitor, DiskProbe, PendingTicket};
use crate::error::ProtocolError;
use crate::pipeline::{Pipeline, PipelineReport, ProcessingCommand};
use crate::session::{Role, SessionState};
use crate::shutdown::Shutdown;
use crate::transport::{resolve, Transport};

/// Subdirectory of the staging dir that holds the pushed hash file
pub const HASHES_DIR: &str = "hashes";

#[derive(Debug, Default, Clone)]
pub struct WorkerReport {
    pub start_transfers: usize,
    pub end_transfer: bool,
    pub received: usize,
    pub receive_failures: usize,
    pub processing: PipelineReport,
    /// PROCESSING_COMPLETE was sent
    pub completed: bool,
}

/// A configured worker node, ready to dial its coordinator
pub struct Worker {
    config: Arc<WorkerConfig>,
    transport: Transport,
    budget: Arc<BudgetMonitor>,
}

impl Worker {
    pub fn new(config: WorkerConfig, transport: Transport, probe: Arc<dyn DiskProbe>) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.staging_dir)
            .with_context(|| format!("create staging dir {}", config.staging_dir.display()))?;
        let budget = BudgetMonitor::new(probe, &config.staging_dir, config.reserved_headroom);
        Ok(Worker {
            config: Arc::new(config),
            transport,
            budget: Arc::new(budget),
        })
    }

    pub fn budget(&self) -> &Arc<BudgetMonitor> {
        &self.budget
    }

    pub async fn run(&self, shutdown: Shutdown) -> Result<WorkerReport> {
        let (addr, host) = resolve(&self.config.coordinator).await?;
        let stream = self.transport.connect(addr, &host).await?;
        let span = info_span!("session", role = %Role::Worker, id = %Uuid::new_v4(), coordinator = %addr);
        WorkerSession::new(
            self.config.clone(),
            self.transport.clone(),
            self.budget.clone(),
            stream,
            addr,
        )
        .run(shutdown)
        .instrument(span)
        .await
    }
}

enum LoopExit {
    EndTransfer,
    Shutdown,
}

pub struct WorkerSession<S> {
    config: Arc<WorkerConfig>,
    transport: Transport,
    budget: Arc<BudgetMonitor>,
    coordinator: SocketAddr,
    reader: BufReader<ReadHalf<S>>,
    // Shared with the pipeline; whoever writes holds it for the whole exchange
    writer: Arc<Mutex<WriteHalf<S>>>,
    state: SessionState,
    buffers: BufferSizer,
    receives: JoinSet<bool>,
    report: WorkerReport,
}

impl<S> WorkerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        config: Arc<WorkerConfig>,
        transport: Transport,
        budget: Arc<BudgetMonitor>,
        stream: S,
        coordinator: SocketAddr,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        WorkerSession {
            config,
            transport,
            budget,
            coordinator,
            reader: BufReader::new(read_half),
            writer: Arc::new(Mutex::new(write_half)),
            state: SessionState::SendHashFile,
            buffers: BufferSizer::default(),
            receives: JoinSet::new(),
            report: WorkerReport::default(),
        }
    }

    pub async fn run(mut self, mut shutdown: Shutdown) -> Result<WorkerReport> {
        let hashes = self.receive_hash_file().await?;
        self.state = SessionState::Ready;

        let (tx, mut pipeline) = Pipeline::new(
            ProcessingCommand::new(self.config.command.clone()),
            hashes,
            self.writer.clone(),
            self.config.timeouts().frame,
        )
        .spawn();

        match self.request_loop(tx, &mut shutdown).await {
            Ok(LoopExit::EndTransfer) => {}
            Ok(LoopExit::Shutdown) => {
                info!("shutdown requested; abandoning session");
                self.abort(&pipeline);
                return Ok(self.report);
            }
            Err(e) => {
                self.abort(&pipeline);
                return Err(e);
            }
        }

        self.state = SessionState::Draining;
        let drained = tokio::select! {
            r = self.drain(&mut pipeline) => Some(r),
            _ = shutdown.cancelled() => None,
        };
        match drained {
            Some(result) => result?,
            None => {
                info!("shutdown requested while draining");
                self.abort(&pipeline);
                return Ok(self.report);
            }
        }

        let t = self.config.timeouts();
        let mut w = self.writer.lock().await;
        write_frame(&mut *w, &Frame::ProcessingComplete, t.frame).await?;
        let _ = w.shutdown().await;
        drop(w);
        self.state = SessionState::Closed;
        self.report.completed = true;
        info!(
            received = self.report.received,
            processed = self.report.processing.processed,
            "processing complete sent; session closed"
        );
        Ok(self.report)
    }

    fn abort(&mut self, pipeline: &JoinHandle<Result<PipelineReport>>) {
        self.receives.abort_all();
        pipeline.abort();
        self.state = SessionState::Closed;
    }

    async fn receive_hash_file(&mut self) -> Result<PathBuf> {
        let t = self.config.timeouts();
        let announce = match read_frame(&mut self.reader, Some(t.reply), t.frame).await? {
            Frame::HashFileAnnounce(a) => a,
            other => {
                return Err(ProtocolError::Unexpected {
                    state: self.state.as_str(),
                    got: other.name(),
                }
                .into())
            }
        };
        let name = announce
            .file_name()
            .ok_or_else(|| ProtocolError::Malformed(announce.path.clone()))?;
        // Own directory, so no work file of the same name can replace it
        let dir = self.config.staging_dir.join(HASHES_DIR);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create {}", dir.display()))?;
        let dest = dir.join(name);
        let mut file = tokio::fs::File::create(&dest)
            .await
            .with_context(|| format!("create {}", dest.display()))?;
        let received = pump(
            &mut self.reader,
            &mut file,
            Some(announce.size),
            self.buffers.buffer_size(announce.size),
            t.frame,
        )
        .await?;
        if received != announce.size {
            return Err(ProtocolError::ConnectionClosed.into());
        }
        info!(path = %dest.display(), bytes = received, "hash file received");
        Ok(dest)
    }

    async fn request_loop(&mut self, tx: mpsc::Sender<PathBuf>, shutdown: &mut Shutdown) -> Result<LoopExit> {
        let t = self.config.timeouts();
        loop {
            let admitted = self
                .budget
                .wait_for_room(self.config.max_file_size, self.config.poll_interval(), shutdown)
                .await?;
            if !admitted {
                return Ok(LoopExit::Shutdown);
            }

            // Held from request through port so pipeline output cannot interleave
            let writer = self.writer.clone();
            let mut w = writer.lock().await;
            write_frame(&mut *w, &Frame::TransferRequest, t.frame).await?;
            self.state = SessionState::RequestSent;

            match read_frame(&mut self.reader, Some(t.reply), t.frame).await? {
                Frame::StartTransfer(announce) => {
                    self.report.start_transfers += 1;
                    let name = announce
                        .file_name()
                        .ok_or_else(|| ProtocolError::Malformed(announce.path.clone()))?;
                    let dest = self.config.staging_dir.join(name);
                    let listener = DataListener::open(self.config.data_bind_ip).await?;
                    write_port(&mut *w, listener.port(), t.frame).await?;
                    drop(w);
                    let ticket = self.budget.set_pending(announce.size);
                    info!(path = %announce.path, size = announce.size, port = listener.port(), "transfer offered");
                    self.spawn_receive(listener, announce.size, ticket, dest, tx.clone());
                    self.state = SessionState::Ready;
                }
                Frame::EndTransfer => {
                    drop(w);
                    self.report.end_transfer = true;
                    info!("coordinator has no more work; draining");
                    // tx drops here: the queue closes once in-flight receives finish
                    return Ok(LoopExit::EndTransfer);
                }
                other => {
                    return Err(ProtocolError::Unexpected {
                        state: self.state.as_str(),
                        got: other.name(),
                    }
                    .into())
                }
            }
        }
    }

    fn spawn_receive(
        &mut self,
        listener: DataListener,
        size: u64,
        ticket: PendingTicket,
        dest: PathBuf,
        tx: mpsc::Sender<PathBuf>,
    ) {
        let transport = self.transport.clone();
        let budget = self.budget.clone();
        let buffers = self.buffers.clone();
        let coordinator_ip = self.coordinator.ip();
        let accept_timeout = self.config.accept_timeout();
        let stall = self.config.timeouts().reply;
        self.receives.spawn(
            async move {
                let result = listener
                    .receive_file(&transport, coordinator_ip, &dest, size, &buffers, accept_timeout, stall)
                    .await;
                budget.clear_pending(ticket);
                match result {
                    Ok(bytes) => {
                        info!(path = %dest.display(), bytes, "work file received");
                        tx.send(dest).await.is_ok()
                    }
                    Err(e) => {
                        warn!(path = %dest.display(), "transfer aborted: {:#}", e);
                        false
                    }
                }
            }
            .instrument(Span::current()),
        );
    }

    async fn drain(&mut self, pipeline: &mut JoinHandle<Result<PipelineReport>>) -> Result<()> {
        while let Some(joined) = self.receives.join_next().await {
            match joined {
                Ok(true) => self.report.received += 1,
                Ok(false) => self.report.receive_failures += 1,
                Err(e) => {
                    warn!("receive task ended abnormally: {}", e);
                    self.report.receive_failures += 1;
                }
            }
        }
        self.report.processing = pipeline.await.context("processing pipeline task")??;
        Ok(())
    }
}
