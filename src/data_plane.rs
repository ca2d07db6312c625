//! Data-plane connector
//!
//! One dedicated TCP stream per work file, so multi-gigabyte payloads never sit in
//! front of control frames. The worker opens an ephemeral listener and reports its
//! port over the control channel; the coordinator dials back to the worker's
//! control-peer IP and streams the file until EOF.

use anyhow::{Context, Result};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::debug;

use crate::buffer::BufferSizer;
use crate::error::TransferError;
use crate::transport::Transport;

/// Copy `reader` into `writer` until EOF, or until `limit` bytes when given.
/// Each read and each write must make progress within `stall`.
pub async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    limit: Option<u64>,
    buffer_size: usize,
    stall: Duration,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut copied = 0u64;
    loop {
        let want = match limit {
            Some(limit) if copied >= limit => break,
            Some(limit) => buf.len().min((limit - copied) as usize),
            None => buf.len(),
        };
        let n = timeout(stall, reader.read(&mut buf[..want]))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read stalled"))??;
        if n == 0 {
            break;
        }
        timeout(stall, writer.write_all(&buf[..n]))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write stalled"))??;
        copied += n as u64;
    }
    writer.flush().await?;
    Ok(copied)
}

/// Worker end: an ephemeral listener that takes exactly one connection
pub struct DataListener {
    listener: TcpListener,
    port: u16,
}

impl DataListener {
    /// Bind port 0 on `bind_ip`; the OS hands out an unused non-privileged port
    pub async fn open(bind_ip: IpAddr) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(bind_ip, 0))
            .await
            .with_context(|| format!("bind data-plane listener on {}", bind_ip))?;
        let port = listener.local_addr()?.port();
        Ok(DataListener { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept the coordinator's stream and write it to `dest`. The file must come
    /// from `expected_peer` and match `declared` bytes; a partial file is removed.
    #[allow(clippy::too_many_arguments)]
    pub async fn receive_file(
        self,
        transport: &Transport,
        expected_peer: IpAddr,
        dest: &Path,
        declared: u64,
        buffers: &BufferSizer,
        accept_timeout: Duration,
        stall: Duration,
    ) -> Result<u64> {
        let (tcp, peer) = match timeout(accept_timeout, self.listener.accept()).await {
            Ok(accepted) => accepted.context("accept data-plane connection")?,
            Err(_) => {
                return Err(TransferError::AcceptTimeout {
                    ms: accept_timeout.as_millis() as u64,
                }
                .into())
            }
        };
        // Exactly one connection per listener
        drop(self.listener);
        if peer.ip() != expected_peer {
            return Err(TransferError::UnexpectedPeer {
                expected: expected_peer,
                got: peer.ip(),
            }
            .into());
        }
        debug!(%peer, port = self.port, dest = %dest.display(), "data-plane connection accepted");
        let mut stream = transport.accept(tcp, stall).await?;

        let result = async {
            let mut file = tokio::fs::File::create(dest).await?;
            let n = pump(
                &mut stream,
                &mut file,
                None,
                buffers.buffer_size(declared),
                stall,
            )
            .await?;
            file.sync_all().await?;
            Ok::<u64, io::Error>(n)
        }
        .await;

        match result {
            Ok(received) if received == declared => Ok(received),
            Ok(received) => {
                let _ = tokio::fs::remove_file(dest).await;
                Err(TransferError::SizeMismatch {
                    path: dest.to_path_buf(),
                    declared,
                    received,
                }
                .into())
            }
            Err(source) => {
                let _ = tokio::fs::remove_file(dest).await;
                Err(TransferError::Io {
                    path: dest.to_path_buf(),
                    source,
                }
                .into())
            }
        }
    }
}

/// Coordinator end: dial the worker's data-plane port and stream `path` to EOF
pub async fn send_file(
    transport: &Transport,
    addr: SocketAddr,
    path: &Path,
    size: u64,
    buffers: &BufferSizer,
    stall: Duration,
) -> Result<u64> {
    let mut stream = transport.connect(addr, &addr.ip().to_string()).await?;
    let result = async {
        let mut file = tokio::fs::File::open(path).await?;
        let n = pump(&mut file, &mut stream, None, buffers.buffer_size(size), stall).await?;
        stream.shutdown().await?;
        Ok::<u64, io::Error>(n)
    }
    .await;
    result.map_err(|source| {
        TransferError::Io {
            path: path.to_path_buf(),
            source,
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    const LOCAL: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    const T: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn pump_honours_limit() {
        let src = vec![7u8; 10_000];
        let mut out = Vec::new();
        let n = pump(&mut &src[..], &mut out, Some(4_096), 1_000, T).await.unwrap();
        assert_eq!(n, 4_096);
        assert_eq!(out.len(), 4_096);

        let mut all = Vec::new();
        let n = pump(&mut &src[..], &mut all, None, 333, T).await.unwrap();
        assert_eq!(n, 10_000);
    }

    #[tokio::test]
    async fn streams_a_file_over_an_ephemeral_port() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("wordlist.txt");
        let payload: Vec<u8> = (0..3_000_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&src, &payload).unwrap();
        let dest = tmp.path().join("staged.txt");

        let listener = DataListener::open(LOCAL).await.unwrap();
        let port = listener.port();
        assert!(port >= 1024);

        let buffers = BufferSizer::default();
        let dest2 = dest.clone();
        let receiver = tokio::spawn(async move {
            listener
                .receive_file(&Transport::Plain, LOCAL, &dest2, 3_000_000, &BufferSizer::default(), T, T)
                .await
        });
        let sent = send_file(
            &Transport::Plain,
            SocketAddr::new(LOCAL, port),
            &src,
            3_000_000,
            &buffers,
            T,
        )
        .await
        .unwrap();
        assert_eq!(sent, 3_000_000);
        assert_eq!(receiver.await.unwrap().unwrap(), 3_000_000);
        assert_eq!(std::fs::read(&dest).unwrap(), payload);
    }

    #[tokio::test]
    async fn short_stream_is_a_size_mismatch_and_leaves_nothing() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("short.txt");
        std::fs::write(&src, b"only-a-few-bytes").unwrap();
        let dest = tmp.path().join("staged.txt");

        let listener = DataListener::open(LOCAL).await.unwrap();
        let addr = SocketAddr::new(LOCAL, listener.port());
        let dest2 = dest.clone();
        let receiver = tokio::spawn(async move {
            listener
                .receive_file(&Transport::Plain, LOCAL, &dest2, 1_000, &BufferSizer::default(), T, T)
                .await
        });
        send_file(&Transport::Plain, addr, &src, 1_000, &BufferSizer::default(), T)
            .await
            .unwrap();

        let err = receiver.await.unwrap().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TransferError>(),
            Some(TransferError::SizeMismatch { received: 16, .. })
        ));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn listener_gives_up_without_a_connection() {
        let tmp = TempDir::new().unwrap();
        let listener = DataListener::open(LOCAL).await.unwrap();
        let err = listener
            .receive_file(
                &Transport::Plain,
                LOCAL,
                &tmp.path().join("never.txt"),
                1,
                &BufferSizer::default(),
                Duration::from_millis(50),
                T,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TransferError>(),
            Some(TransferError::AcceptTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn rejects_connections_from_other_hosts() {
        let tmp = TempDir::new().unwrap();
        let listener = DataListener::open(LOCAL).await.unwrap();
        let addr = SocketAddr::new(LOCAL, listener.port());
        let stranger: IpAddr = "10.255.255.1".parse().unwrap();
        let dest = tmp.path().join("x.txt");
        let receiver = tokio::spawn(async move {
            listener
                .receive_file(&Transport::Plain, stranger, &dest, 1, &BufferSizer::default(), T, T)
                .await
        });
        let _conn = tokio::net::TcpStream::connect(addr).await.unwrap();
        let err = receiver.await.unwrap().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TransferError>(),
            Some(TransferError::UnexpectedPeer { .. })
        ));
    }
}
