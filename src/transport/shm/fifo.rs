//! Named-pipe control channel between producer and consumer.
//!
//! The consumer (acceptor) creates two FIFOs, one per direction, opens
//! its receiving end, and advertises the paths through negotiation
//! properties. The producer (connector) opens its sending and receiving
//! ends and then writes a single sync byte; only once the acceptor reads
//! that byte does it open its own sending end, so neither side ever
//! opens a pipe with no reader. The acceptor unlinks both paths as soon
//! as the handshake completes.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tracing::{debug, trace};

use crate::error::{Result, StreamError};

const SYNC_TOKEN: u8 = 0x5a;

/// Both directions of an established control channel.
pub struct PipeChannel {
    pub tx: pipe::Sender,
    pub rx: pipe::Receiver,
}

fn mkfifo(path: &Path) -> Result<()> {
    let cpath = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| StreamError::shm("fifo path contains an interior nul"))?;
    // SAFETY: cpath is a valid C string
    let rc = unsafe { libc::mkfifo(cpath.as_ptr(), 0o600) };
    if rc != 0 {
        return Err(StreamError::io("mkfifo", io::Error::last_os_error()));
    }
    Ok(())
}

fn unlink(path: &Path) {
    let _ = std::fs::remove_file(path);
}

/// Open a FIFO for writing, waiting briefly for a reader to appear.
async fn open_sender(path: &Path) -> Result<pipe::Sender> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        match pipe::OpenOptions::new().open_sender(path) {
            Ok(sender) => return Ok(sender),
            Err(err) if err.raw_os_error() == Some(libc::ENXIO) => {
                if tokio::time::Instant::now() >= deadline {
                    return Err(StreamError::io("open fifo sender", err));
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Err(err) => return Err(StreamError::io("open fifo sender", err)),
        }
    }
}

/// Consumer half of the handshake: FIFOs created, receiving end open,
/// waiting for the connector's sync byte.
pub struct PipeAcceptor {
    to_acceptor: PathBuf,
    to_connector: PathBuf,
    rx: Option<pipe::Receiver>,
}

impl Drop for PipeAcceptor {
    fn drop(&mut self) {
        // Covers every exit: completed handshake, handshake error, and a
        // connector that never showed up
        unlink(&self.to_acceptor);
        unlink(&self.to_connector);
    }
}

impl PipeAcceptor {
    /// Create both FIFOs under the system temp directory and open the
    /// inbound end.
    pub fn create() -> Result<PipeAcceptor> {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir();
        let base = format!("sampleio-{}-{}", std::process::id(), seq);
        let to_acceptor = dir.join(format!("{base}-in"));
        let to_connector = dir.join(format!("{base}-out"));

        mkfifo(&to_acceptor)?;
        if let Err(err) = mkfifo(&to_connector) {
            unlink(&to_acceptor);
            return Err(err);
        }
        let rx = match pipe::OpenOptions::new().open_receiver(&to_acceptor) {
            Ok(rx) => rx,
            Err(err) => {
                unlink(&to_acceptor);
                unlink(&to_connector);
                return Err(StreamError::io("open fifo receiver", err));
            }
        };
        debug!(inbound = %to_acceptor.display(), outbound = %to_connector.display(),
               "fifo pair created");
        Ok(PipeAcceptor { to_acceptor, to_connector, rx: Some(rx) })
    }

    /// The paths the connector must open: (connector-to-acceptor,
    /// acceptor-to-connector).
    pub fn paths(&self) -> (&Path, &Path) {
        (&self.to_acceptor, &self.to_connector)
    }

    /// Complete the handshake: read the sync byte and open the outbound
    /// end. The pipe files are unlinked on return, success or not.
    pub async fn accept(mut self) -> Result<PipeChannel> {
        let mut rx = self
            .rx
            .take()
            .ok_or_else(|| StreamError::shm("fifo acceptor already consumed"))?;
        let mut token = [0u8; 1];
        rx.read_exact(&mut token)
            .await
            .map_err(|err| StreamError::io("read handshake token", err))?;
        if token[0] != SYNC_TOKEN {
            return Err(StreamError::shm("bad handshake token"));
        }
        // The connector opened its receiving end before writing the
        // token, so this open cannot race
        let tx = open_sender(&self.to_connector).await?;
        trace!("fifo handshake accepted");
        Ok(PipeChannel { tx, rx })
    }
}

/// Producer half of the handshake.
pub async fn connect(to_acceptor: &Path, to_connector: &Path) -> Result<PipeChannel> {
    // The acceptor's receiving end is already open, so the sender opens
    // immediately; our receiver must be open before the sync byte goes
    // out
    let mut tx = open_sender(to_acceptor).await?;
    let rx = pipe::OpenOptions::new()
        .open_receiver(to_connector)
        .map_err(|err| StreamError::io("open fifo receiver", err))?;
    tx.write_all(&[SYNC_TOKEN])
        .await
        .map_err(|err| StreamError::io("write handshake token", err))?;
    trace!(path = %to_acceptor.display(), "fifo handshake sent");
    Ok(PipeChannel { tx, rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handshake_establishes_both_directions() {
        let acceptor = PipeAcceptor::create().unwrap();
        let (to_acceptor, to_connector) =
            (acceptor.paths().0.to_path_buf(), acceptor.paths().1.to_path_buf());

        let accept = tokio::spawn(acceptor.accept());
        let mut connector = connect(&to_acceptor, &to_connector).await.unwrap();
        let mut accepted = accept.await.unwrap().unwrap();

        connector.tx.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        accepted.rx.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        accepted.tx.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        connector.rx.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Handshake completion removed the filesystem entries
        assert!(!to_acceptor.exists());
        assert!(!to_connector.exists());
    }

    #[tokio::test]
    async fn failed_handshake_removes_the_pipe_files() {
        let acceptor = PipeAcceptor::create().unwrap();
        let (to_acceptor, to_connector) =
            (acceptor.paths().0.to_path_buf(), acceptor.paths().1.to_path_buf());

        let accept = tokio::spawn(acceptor.accept());
        // A connector that opens both ends but sends a corrupt token
        let mut tx = pipe::OpenOptions::new().open_sender(&to_acceptor).unwrap();
        let _rx = pipe::OpenOptions::new().open_receiver(&to_connector).unwrap();
        tx.write_all(&[0x00]).await.unwrap();

        assert!(accept.await.unwrap().is_err());
        assert!(!to_acceptor.exists());
        assert!(!to_connector.exists());
    }

    #[tokio::test]
    async fn abandoned_acceptor_removes_the_pipe_files() {
        let acceptor = PipeAcceptor::create().unwrap();
        let (to_acceptor, to_connector) =
            (acceptor.paths().0.to_path_buf(), acceptor.paths().1.to_path_buf());
        drop(acceptor);
        assert!(!to_acceptor.exists());
        assert!(!to_connector.exists());
    }
}
