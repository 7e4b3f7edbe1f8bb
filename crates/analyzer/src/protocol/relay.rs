//! Per-process relay of the instrumentation's behaviour log.
//!
//! Every injected process gets its own channel, named in its injection
//! configuration. Whatever a client writes there is streamed unchanged to
//! the result server, one result server connection per client.

use super::transport::{Acceptor, Channel, Connection};
use crate::error::Error;
use crate::sink::ResultSink;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

const CHUNK: usize = 16 * 1024;

/// Log relays started during one run.
///
/// [`LogRelays::start`] is synchronous so the loader can call it from the
/// blocking pool; the listeners run on the runtime captured at construction.
pub struct LogRelays {
    handle: Option<Handle>,
    dir: PathBuf,
    sink: Arc<dyn ResultSink>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    drain_timeout: Duration,
}

impl LogRelays {
    /// `dir` is where non-Windows hosts put the sockets.
    pub fn new(dir: impl Into<PathBuf>, sink: Arc<dyn ResultSink>, drain_timeout: Duration) -> Self {
        let handle = Handle::try_current().ok();
        if handle.is_none() {
            warn!("no async runtime, behaviour logs will not be relayed");
        }
        Self {
            handle,
            dir: dir.into(),
            sink,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            drain_timeout,
        }
    }

    /// Listen on `name` until [`LogRelays::stop`].
    pub fn start(&self, name: &str) -> Result<(), Error> {
        let Some(handle) = &self.handle else {
            return Err(Error::Unsupported("log relay without a runtime"));
        };
        if self.cancel.is_cancelled() {
            return Err(Error::Unsupported("log relay after shutdown"));
        }

        let acceptor = {
            let _runtime = handle.enter();
            let channel = Arc::new(Channel::bind_stream(name, &self.dir)?);
            channel.acceptor()?
        };
        self.tracker.spawn_on(
            listen(
                name.to_owned(),
                acceptor,
                Arc::clone(&self.sink),
                self.cancel.clone(),
                self.tracker.clone(),
            ),
            handle,
        );
        debug!(name, "log relay listening");
        Ok(())
    }

    /// Stop accepting and give open streams up to the drain timeout to end.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tracker.close();
        if tokio::time::timeout(self.drain_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(remaining = self.tracker.len(), "log relays still streaming at shutdown");
        } else {
            info!("log relays stopped");
        }
    }
}

async fn listen(
    name: String,
    mut acceptor: Acceptor,
    sink: Arc<dyn ResultSink>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = acceptor.accept() => accepted,
        };
        match accepted {
            Ok(connection) => {
                let name = name.clone();
                let sink = Arc::clone(&sink);
                tracker.spawn(async move {
                    match forward(connection, sink).await {
                        Ok(bytes) => debug!(%name, bytes, "log stream closed"),
                        Err(err) => warn!(%name, %err, "log relay failed"),
                    }
                });
            }
            Err(err) => {
                warn!(%name, %err, "log relay listener failed");
                break;
            }
        }
    }
}

/// Copy one client's stream to a fresh result server connection.
async fn forward(mut connection: Connection, sink: Arc<dyn ResultSink>) -> Result<u64, Error> {
    let mut buf = vec![0u8; CHUNK];
    let mut out: Option<Box<dyn Write + Send>> = None;
    let mut total = 0u64;
    loop {
        let read = connection.read_chunk(&mut buf).await?;
        if read == 0 {
            break;
        }
        let chunk = buf[..read].to_vec();
        let sink = Arc::clone(&sink);
        let writer = out.take();
        // The sink is blocking, keep it off the async workers.
        out = Some(
            tokio::task::spawn_blocking(move || -> Result<_, Error> {
                let mut writer = match writer {
                    Some(writer) => writer,
                    None => sink.open_stream()?,
                };
                writer.write_all(&chunk)?;
                writer.flush()?;
                Ok(writer)
            })
            .await
            .map_err(std::io::Error::other)??,
        );
        total += read as u64;
    }
    Ok(total)
}
