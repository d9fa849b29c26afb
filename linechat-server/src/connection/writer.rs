//! Writer pump: the only task that writes to a connection.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Queued lines written before a flush.
const MAX_BATCH: usize = 64;

/// Spawn a pump that writes every queued message as one `\n`-terminated line.
///
/// The task ends when the queue is closed, shutting the writer down so the
/// peer sees end of stream.
pub fn spawn<W>(writer: W, rx: mpsc::Receiver<String>, client: String) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(run(writer, rx, client))
}

async fn run<W>(mut writer: W, mut rx: mpsc::Receiver<String>, client: String)
where
    W: AsyncWrite + Unpin,
{
    let mut broken = false;

    while let Some(line) = rx.recv().await {
        if broken {
            // Keep draining so the broadcaster never sees this queue fill up.
            continue;
        }

        let mut result = write_line(&mut writer, &line).await;
        let mut batch_count = 0;
        while result.is_ok() && batch_count < MAX_BATCH {
            let Ok(queued) = rx.try_recv() else { break };
            result = write_line(&mut writer, &queued).await;
            batch_count += 1;
        }
        if result.is_ok() {
            result = writer.flush().await;
        }

        if let Err(e) = result {
            tracing::debug!(%client, error = %e, "Write failed, discarding further output");
            broken = true;
        }
    }

    if !broken {
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(%client, error = %e, "Shutdown failed");
        }
    }
    tracing::trace!(%client, "Writer stopped");
}

async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}
