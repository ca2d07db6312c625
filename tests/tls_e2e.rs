use anyhow::Result;
use kraken::disk::{DiskProbe, DiskSpace};
use kraken::{Coordinator, CoordinatorConfig, Shutdown, TlsSettings, Transport, Worker, WorkerConfig};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;

struct Plenty;
impl DiskProbe for Plenty {
    fn sample(&self, _path: &Path) -> Result<DiskSpace> {
        Ok(DiskSpace {
            total: 1 << 40,
            free: 1 << 40,
        })
    }
}

fn write_file(path: &Path, size: usize) -> Result<()> {
    let mut f = std::fs::File::create(path)?;
    let mut buf = vec![0u8; 1024 * 64];
    let mut remaining = size;
    let mut val: u8 = 0;
    while remaining > 0 {
        for b in buf.iter_mut() {
            *b = val;
            val = val.wrapping_add(1);
        }
        let n = remaining.min(buf.len());
        f.write_all(&buf[..n])?;
        remaining -= n;
    }
    Ok(())
}

/// One self-signed identity serves as CA and leaf for both ends
fn write_identity(dir: &Path) -> Result<TlsSettings> {
    let cert = rcgen::generate_simple_self_signed(vec!["kraken.local".to_string()])?;
    let cert_path = dir.join("fleet-cert.pem");
    let key_path = dir.join("fleet-key.pem");
    std::fs::write(&cert_path, cert.serialize_pem()?)?;
    std::fs::write(&key_path, cert.serialize_private_key_pem())?;
    Ok(TlsSettings {
        ca: cert_path.clone(),
        cert: cert_path,
        key: key_path,
        server_name: Some("kraken.local".to_string()),
    })
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mutual_tls_session_transfers_and_reports() -> Result<()> {
    let pki = tempfile::tempdir()?;
    let pool = tempfile::tempdir()?;
    let brain_dir = tempfile::tempdir()?;
    let staging = tempfile::tempdir()?;

    let tls = write_identity(pki.path())?;
    write_file(&pool.path().join("small.txt"), 8 * 1024)?;
    write_file(&pool.path().join("crosses.bin"), 1_100_000)?;
    let hashes = brain_dir.path().join("hashes.txt");
    std::fs::write(&hashes, "h1\nh2\n")?;
    let results = brain_dir.path().join("results.txt");

    let mut brain_config = CoordinatorConfig::new(pool.path(), &hashes, &results, 1, 2 * 1024 * 1024);
    brain_config.listen = "127.0.0.1:0".to_string();
    brain_config.tls = Some(tls.clone());
    let brain_transport = Transport::from_settings(brain_config.tls.as_ref())?;
    let coordinator = Arc::new(Coordinator::new(brain_config, brain_transport)?);
    let listener = coordinator.bind().await?;
    let addr = listener.local_addr()?;
    let c = coordinator.clone();
    let serving = tokio::spawn(async move { c.serve(listener, Shutdown::never()).await });

    let mut worker_config = WorkerConfig::new(
        addr.to_string(),
        staging.path(),
        2 * 1024 * 1024,
        vec!["wc".into(), "-c".into(), "{wordlist}".into()],
    );
    worker_config.data_bind_ip = "127.0.0.1".parse()?;
    worker_config.tls = Some(tls);
    let worker_transport = Transport::from_settings(worker_config.tls.as_ref())?;
    let worker = Worker::new(worker_config, worker_transport, Arc::new(Plenty))?;

    let report = tokio::time::timeout(Duration::from_secs(30), worker.run(Shutdown::never())).await??;
    assert_eq!(report.received, 2);
    assert_eq!(report.processing.processed, 2);
    assert!(report.completed);

    let sessions = serving.await??;
    assert_eq!(sessions[0].transferred, 2);
    assert!(!pool.path().join("small.txt").exists());
    assert!(!pool.path().join("crosses.bin").exists());

    let mut text = String::new();
    tokio::fs::File::open(&results).await?.read_to_string(&mut text).await?;
    assert!(text.contains("8192"));
    assert!(text.contains("1100000"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn plain_worker_cannot_talk_to_tls_brain() -> Result<()> {
    let pki = tempfile::tempdir()?;
    let pool = tempfile::tempdir()?;
    let brain_dir = tempfile::tempdir()?;
    let staging = tempfile::tempdir()?;
    let hashes = brain_dir.path().join("hashes.txt");
    std::fs::write(&hashes, "h\n")?;

    let mut brain_config =
        CoordinatorConfig::new(pool.path(), &hashes, brain_dir.path().join("results.txt"), 1, 1024);
    brain_config.listen = "127.0.0.1:0".to_string();
    brain_config.tls = Some(write_identity(pki.path())?);
    let brain_transport = Transport::from_settings(brain_config.tls.as_ref())?;
    let coordinator = Arc::new(Coordinator::new(brain_config, brain_transport)?);
    let listener = coordinator.bind().await?;
    let addr = listener.local_addr()?;
    let c = coordinator.clone();
    let serving = tokio::spawn(async move { c.serve(listener, Shutdown::never()).await });

    let mut worker_config = WorkerConfig::new(addr.to_string(), staging.path(), 1024, vec!["wc".into(), "{wordlist}".into()]);
    worker_config.reply_timeout_ms = 2_000;
    let worker = Worker::new(worker_config, Transport::Plain, Arc::new(Plenty))?;
    assert!(worker.run(Shutdown::never()).await.is_err());

    // The failed handshake ends the only session without a report
    let sessions = serving.await??;
    assert!(sessions.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_peer_cannot_hold_a_slot_through_the_handshake() -> Result<()> {
    let pki = tempfile::tempdir()?;
    let pool = tempfile::tempdir()?;
    let brain_dir = tempfile::tempdir()?;
    let hashes = brain_dir.path().join("hashes.txt");
    std::fs::write(&hashes, "h\n")?;

    let mut brain_config =
        CoordinatorConfig::new(pool.path(), &hashes, brain_dir.path().join("results.txt"), 1, 1024);
    brain_config.listen = "127.0.0.1:0".to_string();
    brain_config.frame_timeout_ms = 200;
    brain_config.reply_timeout_ms = 200;
    brain_config.tls = Some(write_identity(pki.path())?);
    let brain_transport = Transport::from_settings(brain_config.tls.as_ref())?;
    let coordinator = Arc::new(Coordinator::new(brain_config, brain_transport)?);
    let listener = coordinator.bind().await?;
    let addr = listener.local_addr()?;
    let c = coordinator.clone();
    let serving = tokio::spawn(async move { c.serve(listener, Shutdown::never()).await });

    // Opens TCP and never sends a ClientHello
    let _silent = tokio::net::TcpStream::connect(addr).await?;

    let sessions = tokio::time::timeout(Duration::from_secs(4), serving).await???;
    assert!(sessions.is_empty());
    assert_eq!(coordinator.fleet().current(), 0);
    assert_eq!(coordinator.fleet().peak(), 1);
    Ok(())
}
