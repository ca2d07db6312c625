//! Byte-stream transport for control and data-plane connections
//!
//! Sessions only see an ordered byte stream. Whether it is plain TCP or mutual
//! TLS is decided here, once per socket.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::TlsSettings;
use crate::error::ProtocolError;
use crate::protocol::timeouts::{CONNECT_MS, HANDSHAKE_MS};
use crate::tls::TlsContext;

pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

pub type BoxedStream = Box<dyn ByteStream>;

#[derive(Clone)]
pub enum Transport {
    Plain,
    Tls(Arc<TlsContext>),
}

impl Transport {
    pub fn from_settings(tls: Option<&TlsSettings>) -> Result<Self> {
        match tls {
            Some(settings) => Ok(Transport::Tls(Arc::new(TlsContext::from_settings(settings)?))),
            None => Ok(Transport::Plain),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    /// Wrap an accepted socket (we are the TLS server). A peer that does not
    /// finish the handshake within `handshake` is dropped.
    pub async fn accept(&self, tcp: TcpStream, handshake: Duration) -> Result<BoxedStream> {
        let _ = tcp.set_nodelay(true);
        match self {
            Transport::Plain => Ok(Box::new(tcp)),
            Transport::Tls(ctx) => {
                let stream = timeout(handshake, ctx.acceptor.accept(tcp))
                    .await
                    .map_err(|_| handshake_timeout(handshake))?
                    .context("tls accept")?;
                Ok(Box::new(stream))
            }
        }
    }

    /// Dial `addr`; `host` is the name the peer was addressed by
    pub async fn connect(&self, addr: SocketAddr, host: &str) -> Result<BoxedStream> {
        let tcp = timeout(Duration::from_millis(CONNECT_MS), TcpStream::connect(addr))
            .await
            .with_context(|| format!("connect {} timed out", addr))?
            .with_context(|| format!("connect {}", addr))?;
        let _ = tcp.set_nodelay(true);
        match self {
            Transport::Plain => Ok(Box::new(tcp)),
            Transport::Tls(ctx) => {
                let name = ctx.server_name_for(host)?;
                let limit = Duration::from_millis(HANDSHAKE_MS);
                let stream = timeout(limit, ctx.connector.connect(name, tcp))
                    .await
                    .map_err(|_| handshake_timeout(limit))?
                    .with_context(|| format!("tls connect {}", addr))?;
                Ok(Box::new(stream))
            }
        }
    }
}

fn handshake_timeout(limit: Duration) -> ProtocolError {
    ProtocolError::Timeout {
        what: "tls handshake",
        ms: limit.as_millis() as u64,
    }
}

/// Resolve `host:port` to the first address tokio finds
pub async fn resolve(target: &str) -> Result<(SocketAddr, String)> {
    let addr = tokio::net::lookup_host(target)
        .await
        .with_context(|| format!("resolve {}", target))?
        .next()
        .with_context(|| format!("no address for {}", target))?;
    let host = target
        .rsplit_once(':')
        .map(|(h, _)| h.trim_start_matches('[').trim_end_matches(']').to_string())
        .unwrap_or_else(|| target.to_string());
    Ok((addr, host))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const T: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn plain_transport_round_trips_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut s = Transport::Plain.accept(tcp, T).await.unwrap();
            let mut buf = [0u8; 5];
            s.read_exact(&mut buf).await.unwrap();
            buf
        });
        let mut c = Transport::Plain.connect(addr, "127.0.0.1").await.unwrap();
        c.write_all(b"kraken").await.unwrap();
        assert_eq!(&server.await.unwrap(), b"krake");
    }

    #[tokio::test]
    async fn resolve_splits_host_from_port() {
        let (addr, host) = resolve("127.0.0.1:7600").await.unwrap();
        assert_eq!(addr.port(), 7600);
        assert_eq!(host, "127.0.0.1");
    }
}
