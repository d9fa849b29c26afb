//! Per-client connection handler.
//!
//! Each TCP connection gets three tasks:
//! - the read loop in [`handle_io`], which relays lines to the broadcaster
//! - a [`writer`] pump draining the client's outgoing queue
//! - an [`idle`] watchdog that ends the read loop after a silent window
//!
//! Whatever ends the read loop (EOF, read error, idle timeout), the handler
//! leaves the room, announces the departure and closes the connection. A
//! writer still stuck on a peer that stopped reading gets one idle period to
//! finish before it is torn down with the transport.

pub mod idle;
pub mod writer;

use std::borrow::Cow;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::broadcaster::{BroadcasterHandle, Client};
use crate::config::ServerConfig;

/// Handle a plain TCP connection. The client is named after its peer address.
pub async fn handle(
    stream: TcpStream,
    broadcaster: BroadcasterHandle,
    config: Arc<ServerConfig>,
) -> Result<()> {
    let who = stream.peer_addr()?.to_string();
    tracing::info!(client = %who, "New connection");
    let (reader, writer) = tokio::io::split(stream);
    handle_io(BufReader::new(reader), writer, who, broadcaster, &config).await
}

/// Run one client session over any line-capable stream halves.
pub async fn handle_io<R, W>(
    mut reader: BufReader<R>,
    writer: W,
    who: String,
    broadcaster: BroadcasterHandle,
    config: &ServerConfig,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<String>(config.client_queue);
    let mut write_handle = writer::spawn(writer, rx, who.clone());

    // Best-effort snapshot: a client joining right now may be missing.
    let names = broadcaster.names().await?;
    tx.send(format!("Current set of clients: {}", names.join(" ")))
        .await?;
    tx.send(format!("You are {who}")).await?;

    broadcaster.broadcast(format!("{who} has arrived")).await?;
    // From here on the broadcaster holds the only sender for this queue.
    let client = Client::new(who.clone(), tx);
    let id = client.id;
    broadcaster.join(client).await?;

    let (activity, mut expired) = idle::spawn(config.idle_ticks, config.idle_period());

    // One byte past the limit is enough to tell an over-long line apart.
    let read_limit = config.max_line_len as u64 + 1;
    let mut buf = Vec::new();
    // Set while skipping the remainder of an over-long line.
    let mut discarding = false;
    loop {
        buf.clear();
        let mut limited = (&mut reader).take(read_limit);
        tokio::select! {
            read = limited.read_until(b'\n', &mut buf) => match read {
                Ok(0) => {
                    tracing::debug!(client = %who, "Closed by peer");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(client = %who, error = %e, "Read error");
                    break;
                }
            },
            _ = &mut expired => {
                tracing::info!(client = %who, "Idle timeout");
                break;
            }
        }

        activity.signal();

        let complete = buf.ends_with(b"\n");
        if discarding {
            discarding = !complete;
            continue;
        }
        if buf.len() > config.max_line_len {
            tracing::warn!(client = %who, limit = config.max_line_len, "Line too long, dropping");
            discarding = !complete;
            continue;
        }

        let line = decode_line(&buf);
        tracing::debug!(client = %who, "<- {line}");
        if broadcaster.broadcast(format!("{who}: {line}")).await.is_err() {
            break;
        }
    }

    drop(activity);
    drop(reader);

    if let Err(e) = broadcaster.leave(id).await {
        tracing::warn!(client = %who, "Leave not delivered: {e}");
    }
    let _ = broadcaster.broadcast(format!("{who} has left")).await;

    // Leave closed the queue; give the pump one idle period to flush. Aborting
    // it drops the write half, which closes the connection.
    match tokio::time::timeout(config.idle_period(), &mut write_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(client = %who, "Writer task failed: {e}"),
        Err(_) => {
            tracing::debug!(client = %who, "Writer stalled, closing connection");
            write_handle.abort();
            let _ = write_handle.await;
        }
    }
    tracing::info!(client = %who, "Connection closed");
    Ok(())
}

/// Strip the line terminator (`\n` or `\r\n`) and decode as UTF-8, replacing
/// invalid sequences.
fn decode_line(raw: &[u8]) -> Cow<'_, str> {
    let line = raw.strip_suffix(b"\n").unwrap_or(raw);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream, Lines, ReadBuf, ReadHalf, WriteHalf};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    use crate::broadcaster;

    const TIMEOUT: Duration = Duration::from_secs(5);

    type PeerLines = Lines<BufReader<ReadHalf<DuplexStream>>>;

    #[test]
    fn decode_line_strips_terminators() {
        assert_eq!(decode_line(b"hello\n"), "hello");
        assert_eq!(decode_line(b"hello\r\n"), "hello");
        assert_eq!(decode_line(b"no newline"), "no newline");
        assert_eq!(decode_line(b"\n"), "");
        assert_eq!(decode_line(b"a\rb\n"), "a\rb");
    }

    #[test]
    fn decode_line_is_lossy_on_bad_utf8() {
        assert_eq!(decode_line(b"caf\xff\n"), "caf\u{fffd}");
    }

    /// Reader fed chunk by chunk from a channel, so a test can end it with an
    /// arbitrary I/O error.
    struct ScriptedReader {
        rx: mpsc::UnboundedReceiver<io::Result<Vec<u8>>>,
    }

    impl AsyncRead for ScriptedReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    buf.put_slice(&chunk);
                    Poll::Ready(Ok(()))
                }
                Poll::Ready(Some(Err(e))) => Poll::Ready(Err(e)),
                Poll::Ready(None) => Poll::Ready(Ok(())),
                Poll::Pending => Poll::Pending,
            }
        }
    }

    /// Start a session over an in-memory stream with `capacity` bytes of
    /// buffering each way. Returns the peer's line reader, the peer's write
    /// half, and the session task.
    fn session(
        who: &str,
        broadcaster: &BroadcasterHandle,
        config: ServerConfig,
        capacity: usize,
    ) -> (PeerLines, WriteHalf<DuplexStream>, JoinHandle<Result<()>>) {
        let (peer, local) = tokio::io::duplex(capacity);
        let (local_read, local_write) = tokio::io::split(local);
        let (peer_read, peer_write) = tokio::io::split(peer);
        let who = who.to_string();
        let broadcaster = broadcaster.clone();
        let task = tokio::spawn(async move {
            handle_io(BufReader::new(local_read), local_write, who, broadcaster, &config).await
        });
        (BufReader::new(peer_read).lines(), peer_write, task)
    }

    async fn next_line(lines: &mut PeerLines) -> Option<String> {
        timeout(TIMEOUT, lines.next_line())
            .await
            .expect("timed out waiting for line")
            .unwrap()
    }

    #[tokio::test]
    async fn greets_then_relays_and_announces_departure() {
        let (handle, _task) = broadcaster::spawn(64);
        let config = ServerConfig::default();

        let (mut lines, mut write, task) = session("alice", &handle, config, 4096);
        assert_eq!(next_line(&mut lines).await.unwrap(), "Current set of clients: ");
        assert_eq!(next_line(&mut lines).await.unwrap(), "You are alice");

        write.write_all(b"hello\r\n").await.unwrap();
        assert_eq!(next_line(&mut lines).await.unwrap(), "alice: hello");

        write.shutdown().await.unwrap();
        // Queue closed by leave: the writer shuts down and the peer sees EOF.
        assert_eq!(next_line(&mut lines).await, None);
        task.await.unwrap().unwrap();
        assert!(handle.names().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn overlong_line_is_dropped_but_session_survives() {
        let (handle, _task) = broadcaster::spawn(64);
        let config = ServerConfig {
            max_line_len: 8,
            ..Default::default()
        };

        let (mut lines, mut write, task) = session("bob", &handle, config, 4096);
        next_line(&mut lines).await.unwrap();
        next_line(&mut lines).await.unwrap();

        write.write_all(b"this line is far too long\nok\n").await.unwrap();
        assert_eq!(next_line(&mut lines).await.unwrap(), "bob: ok");

        write.shutdown().await.unwrap();
        assert_eq!(next_line(&mut lines).await, None);
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_is_closed() {
        let (handle, _task) = broadcaster::spawn(64);
        let config = ServerConfig {
            idle_ticks: 3,
            tick_ms: 1000,
            ..Default::default()
        };

        let (mut lines, _write, task) = session("carol", &handle, config, 4096);
        next_line(&mut lines).await.unwrap();
        next_line(&mut lines).await.unwrap();

        // Nothing sent: the watchdog ends the session and the peer sees EOF.
        assert_eq!(next_line(&mut lines).await, None);
        task.await.unwrap().unwrap();
        assert!(handle.names().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_close_tears_down_peer_that_stopped_reading() {
        let (handle, _task) = broadcaster::spawn(64);
        let config = ServerConfig {
            idle_ticks: 3,
            tick_ms: 1000,
            ..Default::default()
        };

        // Eight bytes of buffering: the greeting alone blocks the writer.
        let (lines, _write, task) = session("dave", &handle, config, 8);

        let finished = timeout(Duration::from_secs(60), task).await;
        assert!(finished.is_ok(), "session never finished");
        finished.unwrap().unwrap().unwrap();
        assert!(handle.names().await.unwrap().is_empty());

        // Transport closed: what was buffered is readable, then EOF.
        let mut peer = lines.into_inner();
        let mut rest = Vec::new();
        timeout(TIMEOUT, peer.read_to_end(&mut rest))
            .await
            .expect("connection left open")
            .unwrap();
        assert_eq!(rest.len(), 8);
    }

    #[tokio::test]
    async fn read_error_is_announced_once() {
        let (handle, _task) = broadcaster::spawn(64);

        let (mut watcher, mut watcher_write, _watcher_task) =
            session("erin", &handle, ServerConfig::default(), 4096);
        next_line(&mut watcher).await.unwrap();
        next_line(&mut watcher).await.unwrap();
        watcher_write.write_all(b"ready\n").await.unwrap();
        assert_eq!(next_line(&mut watcher).await.unwrap(), "erin: ready");

        let (script, rx) = mpsc::unbounded_channel();
        let (_peer, local) = tokio::io::duplex(4096);
        let broken = {
            let handle = handle.clone();
            tokio::spawn(async move {
                let config = ServerConfig::default();
                let reader = BufReader::new(ScriptedReader { rx });
                handle_io(reader, local, "frank".into(), handle, &config).await
            })
        };

        assert_eq!(next_line(&mut watcher).await.unwrap(), "frank has arrived");
        script.send(Ok(b"hi\n".to_vec())).unwrap();
        assert_eq!(next_line(&mut watcher).await.unwrap(), "frank: hi");

        script
            .send(Err(io::Error::from(io::ErrorKind::ConnectionReset)))
            .unwrap();
        assert_eq!(next_line(&mut watcher).await.unwrap(), "frank has left");
        broken.await.unwrap().unwrap();

        // Nothing else, in particular no second departure.
        let extra = timeout(Duration::from_millis(200), watcher.next_line()).await;
        assert!(extra.is_err(), "unexpected line: {extra:?}");
        assert_eq!(handle.names().await.unwrap(), vec!["erin"]);
    }

    #[tokio::test]
    async fn unterminated_flood_is_discarded_in_bounded_reads() {
        let (handle, _task) = broadcaster::spawn(64);
        let config = ServerConfig {
            max_line_len: 8,
            ..Default::default()
        };

        let (mut lines, mut write, task) = session("gina", &handle, config, 4096);
        next_line(&mut lines).await.unwrap();
        next_line(&mut lines).await.unwrap();

        // Far past the limit, spread over many reads before the newline.
        let flood = vec![b'x'; 20_000];
        write.write_all(&flood).await.unwrap();
        write.write_all(b"\nok\n").await.unwrap();
        assert_eq!(next_line(&mut lines).await.unwrap(), "gina: ok");

        write.shutdown().await.unwrap();
        assert_eq!(next_line(&mut lines).await, None);
        task.await.unwrap().unwrap();
    }
}
