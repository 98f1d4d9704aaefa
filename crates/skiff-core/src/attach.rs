//! Attach session multiplexing.
//!
//! Bridges a client connection to the interaction streams of one container:
//! stdout/stderr are pumped into the client (framed when no tty is
//! allocated), stdin is scanned for the detach sequence on its way to the
//! remote side. A completed detach sequence surfaces as
//! [`EngineError::Detach`] so the caller can unbind and report `detach`
//! instead of an error.

use std::sync::Arc;
use std::time::Duration;

use skiff_error::{EngineError, Result};
use skiff_portlayer::PortLayer;
use skiff_portlayer::stream::{ByteReader, ByteWriter};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::debug;

/// Handshake bytes written to the interaction channel before any session
/// traffic.
pub const PRIMER: &[u8] = b"v1c#>";

/// Default detach sequence: ctrl-P ctrl-Q.
pub const DEFAULT_DETACH_KEYS: &[u8] = &[0x10, 0x11];

/// Connect timeout for interaction endpoints.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Deadline for a single attach attempt against the remote side.
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(40);
/// Margin by which the personality gives up before the remote deadline.
pub const DEADLINE_SLACK: Duration = Duration::from_secs(10);
/// Ceiling on one attach session.
pub const SESSION_CEILING: Duration = Duration::from_secs(2 * 60 * 60);

/// Stream types in the client demux framing.
pub const FRAME_STDIN: u8 = 0;
pub const FRAME_STDOUT: u8 = 1;
pub const FRAME_STDERR: u8 = 2;

/// Demux frame header: `[stream_type, 0, 0, 0, len_be…]`.
#[must_use]
pub fn frame_header(stream: u8, len: usize) -> [u8; 8] {
    let mut header = [0_u8; 8];
    header[0] = stream;
    let len = u32::try_from(len).expect("frame length fits u32");
    header[4..].copy_from_slice(&len.to_be_bytes());
    header
}

/// Incremental matcher for the detach key sequence.
///
/// Bytes stream through unchanged until a full match; a partial match that
/// breaks is flushed verbatim, re-checking the breaking byte against the
/// start of the sequence.
pub struct DetachScanner {
    keys: Vec<u8>,
    matched: usize,
}

impl DetachScanner {
    #[must_use]
    pub fn new(keys: &[u8]) -> Self {
        let keys = if keys.is_empty() {
            DEFAULT_DETACH_KEYS.to_vec()
        } else {
            keys.to_vec()
        };
        Self { keys, matched: 0 }
    }

    /// Scans one chunk, appending forwardable bytes to `out`. Returns true
    /// when the detach sequence completed; bytes after the sequence are
    /// discarded.
    pub fn scan(&mut self, input: &[u8], out: &mut Vec<u8>) -> bool {
        for &byte in input {
            if byte == self.keys[self.matched] {
                self.matched += 1;
                if self.matched == self.keys.len() {
                    return true;
                }
                continue;
            }
            if self.matched > 0 {
                out.extend_from_slice(&self.keys[..self.matched]);
                self.matched = 0;
                if byte == self.keys[0] {
                    self.matched = 1;
                    continue;
                }
            }
            out.push(byte);
        }
        false
    }
}

/// Which streams one attach request asked for.
#[derive(Debug, Clone)]
pub struct AttachConfig {
    pub tty: bool,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    pub detach_keys: Vec<u8>,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            tty: false,
            stdin: false,
            stdout: true,
            stderr: true,
            detach_keys: DEFAULT_DETACH_KEYS.to_vec(),
        }
    }
}

/// Runs one attach session until the output streams end, the client
/// detaches, or the session ceiling elapses.
///
/// With a tty the single output stream passes through raw; without one,
/// stdout and stderr are interleaved into the client connection under the
/// demux framing. Output exhaustion (container exit or remote deadline)
/// ends the session and cancels the stdin pump.
pub async fn attach_streams<CI, CO>(
    portlayer: Arc<dyn PortLayer>,
    id: &str,
    config: AttachConfig,
    client_in: CI,
    client_out: CO,
) -> Result<()>
where
    CI: AsyncRead + Send + Unpin + 'static,
    CO: AsyncWrite + Send + Unpin + 'static,
{
    let deadline = SESSION_CEILING.saturating_sub(DEADLINE_SLACK);
    let out = Arc::new(Mutex::new(client_out));

    let mut outputs: JoinSet<Result<()>> = JoinSet::new();
    if config.stdout {
        let reader = portlayer.stdout_reader(id, deadline).await?;
        let frame = (!config.tty).then_some(FRAME_STDOUT);
        outputs.spawn(pump_output(reader, Arc::clone(&out), frame));
    }
    if config.stderr && !config.tty {
        let reader = portlayer.stderr_reader(id, deadline).await?;
        outputs.spawn(pump_output(reader, Arc::clone(&out), Some(FRAME_STDERR)));
    }

    let stdin_task = if config.stdin {
        let writer = portlayer.stdin_writer(id, deadline).await?;
        let scanner = DetachScanner::new(&config.detach_keys);
        Some(tokio::spawn(pump_stdin(client_in, writer, scanner)))
    } else {
        None
    };

    let session = async {
        match stdin_task {
            Some(stdin) if outputs.is_empty() => join_flatten(stdin).await,
            Some(stdin) => {
                let abort_stdin = stdin.abort_handle();
                tokio::select! {
                    result = drain_outputs(&mut outputs) => {
                        abort_stdin.abort();
                        result
                    }
                    result = join_flatten(stdin) => {
                        match result {
                            // Client stdin closed; outputs decide the end.
                            Ok(()) => drain_outputs(&mut outputs).await,
                            Err(e) => Err(e),
                        }
                    }
                }
            }
            None => drain_outputs(&mut outputs).await,
        }
    };

    match tokio::time::timeout(SESSION_CEILING, session).await {
        Ok(result) => result,
        Err(_) => {
            debug!(id, "attach session ceiling reached");
            Ok(())
        }
    }
}

async fn join_flatten(task: tokio::task::JoinHandle<Result<()>>) -> Result<()> {
    match task.await {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(EngineError::internal(format!("attach pump panicked: {e}"))),
    }
}

async fn drain_outputs(outputs: &mut JoinSet<Result<()>>) -> Result<()> {
    let mut first_err = None;
    while let Some(joined) = outputs.join_next().await {
        let result = match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(EngineError::internal(format!("attach pump panicked: {e}"))),
        };
        if let Err(e) = result {
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}

async fn pump_output<W>(
    mut reader: ByteReader,
    writer: Arc<Mutex<W>>,
    frame: Option<u8>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = [0_u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let mut out = writer.lock().await;
        if let Some(stream_type) = frame {
            out.write_all(&frame_header(stream_type, n)).await?;
        }
        out.write_all(&buf[..n]).await?;
        out.flush().await?;
    }
}

async fn pump_stdin<CI>(
    mut client: CI,
    mut remote: ByteWriter,
    mut scanner: DetachScanner,
) -> Result<()>
where
    CI: AsyncRead + Unpin,
{
    remote.write_all(PRIMER).await?;
    remote.flush().await?;

    let mut buf = [0_u8; 4096];
    let mut forward = Vec::with_capacity(buf.len());
    loop {
        let n = client.read(&mut buf).await?;
        if n == 0 {
            remote.shutdown().await?;
            return Ok(());
        }
        forward.clear();
        let detached = scanner.scan(&buf[..n], &mut forward);
        if !forward.is_empty() {
            remote.write_all(&forward).await?;
            remote.flush().await?;
        }
        if detached {
            return Err(EngineError::Detach);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakePortLayer;

    fn scan_all(scanner: &mut DetachScanner, input: &[u8]) -> (Vec<u8>, bool) {
        let mut out = Vec::new();
        let detached = scanner.scan(input, &mut out);
        (out, detached)
    }

    #[test]
    fn detach_sequence_is_recognized_and_swallowed() {
        let mut scanner = DetachScanner::new(DEFAULT_DETACH_KEYS);
        let (out, detached) = scan_all(&mut scanner, b"hello\x10\x11world");
        assert!(detached);
        assert_eq!(out, b"hello");
    }

    #[test]
    fn broken_partial_match_is_flushed_verbatim() {
        let mut scanner = DetachScanner::new(DEFAULT_DETACH_KEYS);
        let (out, detached) = scan_all(&mut scanner, b"\x10a");
        assert!(!detached);
        assert_eq!(out, b"\x10a");

        // The breaking byte can itself restart the sequence.
        let mut scanner = DetachScanner::new(DEFAULT_DETACH_KEYS);
        let (out, detached) = scan_all(&mut scanner, b"\x10\x10\x11");
        assert!(detached);
        assert_eq!(out, b"\x10");
    }

    #[test]
    fn sequence_split_across_chunks_still_matches() {
        let mut scanner = DetachScanner::new(DEFAULT_DETACH_KEYS);
        let (out, detached) = scan_all(&mut scanner, b"ab\x10");
        assert!(!detached);
        assert_eq!(out, b"ab");
        let (out, detached) = scan_all(&mut scanner, b"\x11");
        assert!(detached);
        assert!(out.is_empty());
    }

    #[test]
    fn frame_header_layout() {
        let header = frame_header(FRAME_STDERR, 0x0102);
        assert_eq!(header, [2, 0, 0, 0, 0, 0, 1, 2]);
    }

    #[tokio::test]
    async fn detach_surfaces_from_a_stdin_only_session() {
        let fake = FakePortLayer::new();
        let portlayer: Arc<dyn PortLayer> = fake.clone();

        let (mut client_writer, client_in) = {
            let (a, b) = tokio::io::duplex(1024);
            (a, b)
        };
        let (client_out, _peer) = tokio::io::duplex(1024);

        let session = tokio::spawn(attach_streams(
            portlayer,
            "c1",
            AttachConfig {
                stdin: true,
                stdout: false,
                stderr: false,
                ..AttachConfig::default()
            },
            client_in,
            client_out,
        ));

        client_writer.write_all(b"ab\x10\x11").await.unwrap();
        client_writer.flush().await.unwrap();

        let result = session.await.unwrap();
        assert!(result.unwrap_err().is_detach());

        // The remote stdin saw the primer and the forwardable bytes only.
        for _ in 0..50 {
            if fake.stdin_sink.lock().unwrap().contains_key("c1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let sink = fake.stdin_sink.lock().unwrap();
        let bytes = sink.get("c1").expect("stdin forwarded");
        let mut expected = PRIMER.to_vec();
        expected.extend_from_slice(b"ab");
        assert_eq!(bytes, &expected);
    }

    #[tokio::test]
    async fn output_streams_are_framed_when_no_tty() {
        let fake = FakePortLayer::new();
        fake.stdout
            .lock()
            .unwrap()
            .insert("c1".to_string(), b"out!".to_vec());
        fake.stderr
            .lock()
            .unwrap()
            .insert("c1".to_string(), b"err".to_vec());
        let portlayer: Arc<dyn PortLayer> = fake.clone();

        let (client_out, mut peer) = tokio::io::duplex(4096);
        let (_unused, client_in) = tokio::io::duplex(16);
        attach_streams(portlayer, "c1", AttachConfig::default(), client_in, client_out)
            .await
            .unwrap();

        let mut framed = Vec::new();
        peer.read_to_end(&mut framed).await.unwrap();

        // Frame order between the two pumps is not fixed; collect per type.
        let mut by_type: std::collections::HashMap<u8, Vec<u8>> = std::collections::HashMap::new();
        let mut rest = framed.as_slice();
        while !rest.is_empty() {
            let header: [u8; 8] = rest[..8].try_into().unwrap();
            let len = u32::from_be_bytes(header[4..].try_into().unwrap()) as usize;
            by_type
                .entry(header[0])
                .or_default()
                .extend_from_slice(&rest[8..8 + len]);
            rest = &rest[8 + len..];
        }
        assert_eq!(by_type.get(&FRAME_STDOUT).unwrap(), b"out!");
        assert_eq!(by_type.get(&FRAME_STDERR).unwrap(), b"err");
    }

    #[tokio::test]
    async fn tty_output_passes_through_raw() {
        let fake = FakePortLayer::new();
        fake.stdout
            .lock()
            .unwrap()
            .insert("c1".to_string(), b"raw bytes".to_vec());
        let portlayer: Arc<dyn PortLayer> = fake.clone();

        let (client_out, mut peer) = tokio::io::duplex(4096);
        let (_unused, client_in) = tokio::io::duplex(16);
        attach_streams(
            portlayer,
            "c1",
            AttachConfig {
                tty: true,
                stderr: false,
                ..AttachConfig::default()
            },
            client_in,
            client_out,
        )
        .await
        .unwrap();

        let mut raw = Vec::new();
        peer.read_to_end(&mut raw).await.unwrap();
        assert_eq!(raw, b"raw bytes");
    }
}
