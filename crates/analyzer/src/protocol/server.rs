use super::command::Command;
use super::dispatch::{Dispatcher, OK};
use super::transport::{Acceptor, Channel, Connection};
use crate::error::Error;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Number of listeners accepting concurrently.
    pub listeners: usize,
    /// Upper bound on reading one message.
    pub handler_timeout: Duration,
    /// How long [`PipeServer::stop`] waits for in-flight handlers.
    pub drain_timeout: Duration,
}

/// Pool of listeners on the notification channel.
///
/// Every accepted connection gets its own handler task, tracked so that
/// stopping can wait for the ones still running.
pub struct PipeServer {
    address: String,
    cancel: CancellationToken,
    tracker: TaskTracker,
    drain_timeout: Duration,
}

impl PipeServer {
    /// Bind `name` and start the listeners. Must be called inside a tokio
    /// runtime. `dir` is where non-Windows hosts put the socket.
    pub fn start(
        name: &str,
        dir: &Path,
        dispatcher: Dispatcher,
        options: ServerOptions,
    ) -> Result<Self, Error> {
        let channel = Arc::new(Channel::bind(name, dir)?);
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let listeners = options.listeners.max(1);

        for id in 0..listeners {
            let acceptor = channel.acceptor()?;
            tracker.spawn(listen(
                id,
                acceptor,
                dispatcher.clone(),
                cancel.clone(),
                tracker.clone(),
                options.handler_timeout,
            ));
        }

        info!(address = channel.address(), listeners, "notification server started");
        Ok(Self {
            address: channel.address().to_owned(),
            cancel,
            tracker,
            drain_timeout: options.drain_timeout,
        })
    }

    /// Where clients connect.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Stop accepting connections and give running handlers up to the
    /// drain timeout to finish. Handlers are never aborted.
    pub async fn stop(self) {
        self.cancel.cancel();
        self.tracker.close();
        if tokio::time::timeout(self.drain_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.tracker.len(),
                "notification handlers still running at shutdown"
            );
        } else {
            info!("notification server stopped");
        }
    }
}

async fn listen(
    id: usize,
    mut acceptor: Acceptor,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
    tracker: TaskTracker,
    handler_timeout: Duration,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = acceptor.accept() => accepted,
        };
        match accepted {
            Ok(connection) => {
                tracker.spawn(handle(connection, dispatcher.clone(), handler_timeout));
            }
            Err(err) => {
                error!(listener = id, %err, "notification listener failed");
                break;
            }
        }
    }
    debug!(listener = id, "notification listener stopped");
}

async fn handle(mut connection: Connection, dispatcher: Dispatcher, timeout: Duration) {
    let message = match tokio::time::timeout(timeout, connection.read_message()).await {
        Ok(Ok(message)) => message,
        Ok(Err(err)) => {
            debug!(%err, "failed to read notification");
            return;
        }
        Err(_) => {
            warn!("timed out reading notification");
            return;
        }
    };

    let response = if message.is_empty() {
        OK.to_vec()
    } else {
        let command = Command::parse(&message);
        match tokio::task::spawn_blocking(move || dispatcher.dispatch(command)).await {
            Ok(response) => response,
            Err(err) => {
                error!(%err, "notification handler failed");
                OK.to_vec()
            }
        }
    };

    if let Err(err) = connection.respond(&response).await {
        debug!(%err, "failed to answer notification");
    }
}
