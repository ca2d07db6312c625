//! Worker-side processing pipeline
//!
//! A background consumer fed by completed data-plane transfers. For each staged
//! wordlist it runs the configured command, ships stdout+stderr upstream as a
//! `PROCESSING_OUTPUT` frame, and deletes the wordlist. The queue closing is the
//! "no more input" signal: once every sender is gone the consumer drains and
//! returns.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::buffer::BufferSizer;
use crate::codec::{write_frame, FileAnnounce, Frame};
use crate::data_plane::pump;

pub const HASHES_PLACEHOLDER: &str = "{hashes}";
pub const WORDLIST_PLACEHOLDER: &str = "{wordlist}";

/// Capacity of the completed-file queue
pub const QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct ProcessingCommand {
    argv: Vec<String>,
}

impl ProcessingCommand {
    pub fn new(argv: Vec<String>) -> Self {
        ProcessingCommand { argv }
    }

    /// Substitute placeholders; returns program and arguments
    pub fn render(&self, hashes: &Path, wordlist: &Path) -> Option<(String, Vec<String>)> {
        let hashes = hashes.to_string_lossy();
        let wordlist = wordlist.to_string_lossy();
        let mut parts = self.argv.iter().map(|arg| {
            arg.replace(HASHES_PLACEHOLDER, &hashes)
                .replace(WORDLIST_PLACEHOLDER, &wordlist)
        });
        let program = parts.next()?;
        Some((program, parts.collect()))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub processed: usize,
    pub failed: usize,
    pub output_bytes: u64,
}

pub struct Pipeline<W> {
    command: ProcessingCommand,
    hash_file: PathBuf,
    upstream: Arc<Mutex<W>>,
    frame_timeout: Duration,
    buffers: BufferSizer,
}

impl<W> Pipeline<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        command: ProcessingCommand,
        hash_file: PathBuf,
        upstream: Arc<Mutex<W>>,
        frame_timeout: Duration,
    ) -> Self {
        Pipeline {
            command,
            hash_file,
            upstream,
            frame_timeout,
            buffers: BufferSizer::default(),
        }
    }

    /// Start the consumer; the returned sender side feeds it staged wordlists
    pub fn spawn(self) -> (mpsc::Sender<PathBuf>, JoinHandle<Result<PipelineReport>>) {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        (tx, tokio::spawn(self.run(rx)))
    }

    async fn run(self, mut rx: mpsc::Receiver<PathBuf>) -> Result<PipelineReport> {
        let mut report = PipelineReport::default();
        while let Some(wordlist) = rx.recv().await {
            match self.process(&wordlist).await {
                Ok(Some(bytes)) => {
                    report.processed += 1;
                    report.output_bytes += bytes;
                }
                Ok(None) => report.failed += 1,
                // Upstream is gone; nothing left to report results to
                Err(e) => return Err(e),
            }
            if let Err(e) = tokio::fs::remove_file(&wordlist).await {
                warn!(path = %wordlist.display(), "could not delete processed wordlist: {}", e);
            }
        }
        info!(
            processed = report.processed,
            failed = report.failed,
            "processing queue drained"
        );
        Ok(report)
    }

    /// `Ok(None)` when the command could not run; errors only for upstream I/O
    async fn process(&self, wordlist: &Path) -> Result<Option<u64>> {
        let Some((program, args)) = self.command.render(&self.hash_file, wordlist) else {
            return Ok(None);
        };
        debug!(%program, ?args, "running processing command");
        let output = match Command::new(&program).args(&args).output().await {
            Ok(o) => o,
            Err(e) => {
                warn!(%program, wordlist = %wordlist.display(), "processing command failed to start: {}", e);
                return Ok(None);
            }
        };
        if !output.status.success() {
            warn!(status = %output.status, wordlist = %wordlist.display(), "processing command exited unsuccessfully");
        }

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        let name = wordlist
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("output")
            .to_string();
        self.send_output(&name, &combined).await?;
        Ok(Some(combined.len() as u64))
    }

    async fn send_output(&self, name: &str, payload: &[u8]) -> Result<()> {
        let frame = Frame::ProcessingOutput(FileAnnounce::new(name, payload.len() as u64));
        // Frame and payload go out under one lock so nothing interleaves
        let mut upstream = self.upstream.lock().await;
        write_frame(&mut *upstream, &frame, self.frame_timeout).await?;
        let mut body = payload;
        pump(
            &mut body,
            &mut *upstream,
            None,
            self.buffers.buffer_size(payload.len() as u64),
            self.frame_timeout,
        )
        .await?;
        Ok(())
    }
}
