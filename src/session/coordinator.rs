//! Coordinator side of a fleet session
//!
//! `SendHashFile -> Ready`, then per worker frame:
//! - `TRANSFER_REQUEST` with work left: `START_TRANSFER`, read port, dial, stream in background
//! - `TRANSFER_REQUEST` with the pool exhausted: `END_TRANSFER`, stay Ready
//! - `PROCESSING_OUTPUT`: append the inline payload to the results file
//! - `PROCESSING_COMPLETE`: close

use anyhow::{anyhow, bail, Context, Result};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{info, warn, Instrument, Span};
use uuid::Uuid;

use crate::buffer::BufferSizer;
use crate::codec::{read_frame, read_port, write_frame, FileAnnounce, Frame};
use crate::config::ControlTimeouts;
use crate::data_plane::{self, pump};
use crate::error::ProtocolError;
use crate::ledger::{LedgerEntry, TransferLedger, TransferStatus};
use crate::pool::{WorkItem, WorkPool};
use crate::session::SessionState;
use crate::shutdown::Shutdown;
use crate::transport::Transport;

/// Appends worker processing output to one results file shared by all sessions
pub struct ResultSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ResultSink {
    pub fn new(path: &Path) -> Self {
        ResultSink {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `header` then exactly `size` bytes from `reader`; returns bytes copied
    pub async fn append<R>(
        &self,
        header: &str,
        reader: &mut R,
        size: u64,
        buffer_size: usize,
        stall: Duration,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("open results file {}", self.path.display()))?;
        file.write_all(header.as_bytes()).await?;
        let copied = pump(reader, &mut file, Some(size), buffer_size, stall).await?;
        if copied > 0 && copied == size {
            file.write_all(b"\n").await?;
        }
        file.flush().await?;
        Ok(copied)
    }
}

/// State shared by every session of one coordinator
pub struct CoordinatorContext {
    pub pool: WorkPool,
    pub hash_file: PathBuf,
    pub results: ResultSink,
    pub ledger: Option<TransferLedger>,
    pub buffers: BufferSizer,
    pub timeouts: ControlTimeouts,
    pub transport: Transport,
}

impl CoordinatorContext {
    fn record(&self, session: &str, worker: &str, item: &WorkItem, status: TransferStatus, error: Option<&anyhow::Error>) {
        let Some(ledger) = &self.ledger else {
            return;
        };
        let mut entry = LedgerEntry::new(session, worker, item, status);
        if let Some(e) = error {
            entry = entry.with_error(format!("{:#}", e));
        }
        if let Err(e) = ledger.add_entry(&entry) {
            warn!("transfer ledger write failed: {:#}", e);
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorReport {
    pub session_id: String,
    pub peer: SocketAddr,
    pub assigned: Vec<PathBuf>,
    pub transferred: usize,
    pub failed: usize,
    pub end_sent: bool,
    pub outputs: usize,
    pub output_bytes: u64,
    /// PROCESSING_COMPLETE arrived
    pub completed: bool,
    /// Why the session ended early, if it did
    pub error: Option<String>,
}

pub struct CoordinatorSession<S> {
    id: Uuid,
    peer: SocketAddr,
    ctx: Arc<CoordinatorContext>,
    stream: BufReader<S>,
    state: SessionState,
    transfers: JoinSet<bool>,
    report: CoordinatorReport,
}

impl<S> CoordinatorSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(id: Uuid, ctx: Arc<CoordinatorContext>, stream: S, peer: SocketAddr) -> Self {
        CoordinatorSession {
            id,
            peer,
            ctx,
            stream: BufReader::new(stream),
            state: SessionState::SendHashFile,
            transfers: JoinSet::new(),
            report: CoordinatorReport {
                session_id: id.to_string(),
                peer,
                assigned: Vec::new(),
                transferred: 0,
                failed: 0,
                end_sent: false,
                outputs: 0,
                output_bytes: 0,
                completed: false,
                error: None,
            },
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session to its end. Errors are carried in the report so work
    /// already finished is still accounted for.
    pub async fn run(mut self, mut shutdown: Shutdown) -> CoordinatorReport {
        let outcome = self.drive(&mut shutdown).await;

        // Data-plane streams outlive the control loop; let them land
        self.state = SessionState::Draining;
        while let Some(joined) = self.transfers.join_next().await {
            match joined {
                Ok(true) => self.report.transferred += 1,
                Ok(false) => self.report.failed += 1,
                Err(e) => {
                    warn!("transfer task ended abnormally: {}", e);
                    self.report.failed += 1;
                }
            }
        }
        self.state = SessionState::Closed;
        let _ = self.stream.get_mut().shutdown().await;
        if let Err(e) = outcome {
            warn!("session ended with error: {:#}", e);
            self.report.error = Some(format!("{:#}", e));
        }
        info!(
            assigned = self.report.assigned.len(),
            transferred = self.report.transferred,
            failed = self.report.failed,
            outputs = self.report.outputs,
            "session closed"
        );
        self.report
    }

    async fn drive(&mut self, shutdown: &mut Shutdown) -> Result<()> {
        self.send_hash_file().await?;
        self.state = SessionState::Ready;

        loop {
            let t = self.ctx.timeouts;
            let next = tokio::select! {
                frame = read_frame(&mut self.stream, t.idle, t.frame) => Some(frame),
                _ = shutdown.cancelled() => None,
            };
            let Some(frame) = next else {
                info!("shutdown requested; closing session");
                return Ok(());
            };
            match frame? {
                Frame::TransferRequest => self.dispatch().await?,
                Frame::ProcessingOutput(announce) => self.receive_output(announce).await?,
                Frame::ProcessingComplete => {
                    info!("worker reported processing complete");
                    self.report.completed = true;
                    return Ok(());
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

    async fn send_hash_file(&mut self) -> Result<()> {
        let t = self.ctx.timeouts;
        let path = &self.ctx.hash_file;
        let mut file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("open hash file {}", path.display()))?;
        let size = file.metadata().await?.len();
        let name = path
            .to_str()
            .ok_or_else(|| ProtocolError::UnencodablePath(path.to_string_lossy().into_owned()))?;

        write_frame(
            &mut self.stream,
            &Frame::HashFileAnnounce(FileAnnounce::new(name, size)),
            t.frame,
        )
        .await?;
        let sent = pump(
            &mut file,
            &mut self.stream,
            Some(size),
            self.ctx.buffers.buffer_size(size),
            t.frame,
        )
        .await?;
        if sent != size {
            bail!("hash file {} shrank while sending ({} of {} bytes)", path.display(), sent, size);
        }
        info!(bytes = size, "hash file pushed");
        Ok(())
    }

    async fn dispatch(&mut self) -> Result<()> {
        let t = self.ctx.timeouts;
        let Some(item) = self.ctx.pool.select_file()? else {
            write_frame(&mut self.stream, &Frame::EndTransfer, t.frame).await?;
            self.report.end_sent = true;
            info!("pool exhausted; sent END_TRANSFER");
            return Ok(());
        };
        let session = self.id.to_string();
        let worker = self.peer.to_string();
        self.ctx.record(&session, &worker, &item, TransferStatus::Claimed, None);

        let port = match self.offer(&item).await {
            Ok(port) => port,
            Err(e) => {
                // The claim stands; the file is not handed to anyone else
                self.ctx.pool.fail(&item);
                self.ctx.record(&session, &worker, &item, TransferStatus::Failed, Some(&e));
                return Err(e);
            }
        };
        self.state = SessionState::Ready;

        let addr = SocketAddr::new(self.peer.ip(), port);
        self.ctx.pool.mark_transferring(&item);
        self.report.assigned.push(item.path.clone());
        info!(path = %item.path.display(), size = item.size, %addr, "streaming work file");

        let ctx = self.ctx.clone();
        self.transfers.spawn(
            async move {
                let stall = ctx.timeouts.reply;
                let result = data_plane::send_file(&ctx.transport, addr, &item.path, item.size, &ctx.buffers, stall)
                    .await
                    .and_then(|sent| {
                        if sent == item.size {
                            Ok(sent)
                        } else {
                            Err(anyhow!("sent {} of {} bytes; file changed in the pool", sent, item.size))
                        }
                    });
                match result {
                    Ok(sent) => {
                        info!(path = %item.path.display(), bytes = sent, "transfer complete");
                        if let Err(e) = ctx.pool.complete(&item) {
                            warn!("{:#}", e);
                        }
                        ctx.record(&session, &worker, &item, TransferStatus::Transferred, None);
                        true
                    }
                    Err(e) => {
                        warn!(path = %item.path.display(), "transfer aborted: {:#}", e);
                        ctx.pool.fail(&item);
                        ctx.record(&session, &worker, &item, TransferStatus::Failed, Some(&e));
                        false
                    }
                }
            }
            .instrument(Span::current()),
        );
        Ok(())
    }

    /// START_TRANSFER, then the worker's port
    async fn offer(&mut self, item: &WorkItem) -> Result<u16> {
        let t = self.ctx.timeouts;
        let path = item
            .path
            .to_str()
            .ok_or_else(|| ProtocolError::UnencodablePath(item.path.to_string_lossy().into_owned()))?;
        let frame = Frame::StartTransfer(FileAnnounce::new(path, item.size));
        write_frame(&mut self.stream, &frame, t.frame).await?;
        self.state = SessionState::RequestSent;
        read_port(&mut self.stream, t.reply).await
    }

    async fn receive_output(&mut self, announce: FileAnnounce) -> Result<()> {
        let t = self.ctx.timeouts;
        self.state = SessionState::Receiving;
        let header = format!(
            "# worker={} session={} source={} bytes={}\n",
            self.peer, self.id, announce.path, announce.size
        );
        let copied = self
            .ctx
            .results
            .append(
                &header,
                &mut self.stream,
                announce.size,
                self.ctx.buffers.buffer_size(announce.size),
                t.frame,
            )
            .await?;
        if copied != announce.size {
            return Err(ProtocolError::ConnectionClosed.into());
        }
        self.report.outputs += 1;
        self.report.output_bytes += copied;
        self.state = SessionState::Ready;
        Ok(())
    }
}
