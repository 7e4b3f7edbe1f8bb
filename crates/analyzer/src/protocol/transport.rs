//! Local channel carrying notifications.
//!
//! Windows uses a message-mode named pipe, so one read is one message.
//! Elsewhere a Unix domain socket stands in for it: the client writes the
//! message and shuts down its write half.
//!
//! Log relay channels carry a byte stream instead and are read with
//! [`Connection::read_chunk`] until the client disconnects.

use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Upper bound on one notification.
pub const MAX_MESSAGE: usize = 64 * 1024;

#[cfg(windows)]
pub use self::windows::{Acceptor, Channel, Connection, request};

#[cfg(unix)]
pub use self::unix::{Acceptor, Channel, Connection, request};

#[cfg(windows)]
mod windows {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::net::windows::named_pipe::{
        ClientOptions, NamedPipeServer, PipeMode, ServerOptions,
    };
    use tracing::debug;

    const ERROR_PIPE_BUSY: i32 = 231;
    const ERROR_BROKEN_PIPE: i32 = 109;

    pub struct Channel {
        name: String,
        mode: PipeMode,
        first: AtomicBool,
    }

    impl Channel {
        /// `name` is the full pipe path, e.g. `\\.\PIPE\abc`.
        pub fn bind(name: &str, _dir: &Path) -> io::Result<Self> {
            Ok(Self {
                name: name.to_owned(),
                mode: PipeMode::Message,
                first: AtomicBool::new(true),
            })
        }

        /// Byte-mode pipe for streamed data.
        pub fn bind_stream(name: &str, _dir: &Path) -> io::Result<Self> {
            Ok(Self {
                name: name.to_owned(),
                mode: PipeMode::Byte,
                first: AtomicBool::new(true),
            })
        }

        pub fn address(&self) -> &str {
            &self.name
        }

        fn create(&self) -> io::Result<NamedPipeServer> {
            let first = self.first.swap(false, Ordering::AcqRel);
            ServerOptions::new()
                .first_pipe_instance(first)
                .pipe_mode(self.mode)
                .in_buffer_size(MAX_MESSAGE as u32)
                .out_buffer_size(MAX_MESSAGE as u32)
                .create(&self.name)
        }

        /// A new listening instance of the pipe.
        pub fn acceptor(self: &Arc<Self>) -> io::Result<Acceptor> {
            let server = self.create()?;
            Ok(Acceptor {
                channel: Arc::clone(self),
                server,
            })
        }
    }

    pub struct Acceptor {
        channel: Arc<Channel>,
        server: NamedPipeServer,
    }

    impl Acceptor {
        /// Wait for a client, then replace the connected instance with a
        /// fresh one for the next client.
        pub async fn accept(&mut self) -> io::Result<Connection> {
            self.server.connect().await?;
            let next = self.channel.create()?;
            Ok(Connection(std::mem::replace(&mut self.server, next)))
        }
    }

    pub struct Connection(NamedPipeServer);

    impl Connection {
        /// Next piece of a streamed channel, `0` once the client is gone.
        pub async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.read(buf).await {
                Err(err) if err.raw_os_error() == Some(ERROR_BROKEN_PIPE) => Ok(0),
                other => other,
            }
        }

        pub async fn read_message(&mut self) -> io::Result<Vec<u8>> {
            let mut buf = vec![0u8; MAX_MESSAGE];
            let read = self.0.read(&mut buf).await?;
            buf.truncate(read);
            Ok(buf)
        }

        pub async fn respond(mut self, data: &[u8]) -> io::Result<()> {
            self.0.write_all(data).await?;
            self.0.flush().await
        }
    }

    /// Send one message and wait for the response.
    pub async fn request(address: &str, message: &[u8]) -> io::Result<Vec<u8>> {
        let mut client = loop {
            match ClientOptions::new().open(address) {
                Ok(client) => break client,
                Err(err) if err.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
                    debug!(address, "pipe busy, retrying");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(err) => return Err(err),
            }
        };
        client.write_all(message).await?;
        let mut buf = vec![0u8; MAX_MESSAGE];
        let read = client.read(&mut buf).await?;
        buf.truncate(read);
        Ok(buf)
    }
}

#[cfg(unix)]
mod unix {
    use super::*;
    use std::path::PathBuf;
    use tokio::net::{UnixListener, UnixStream};
    use tracing::{info, warn};

    pub struct Channel {
        listener: UnixListener,
        path: PathBuf,
        address: String,
    }

    impl Channel {
        /// Bind `<dir>/<name>.sock`, where only the last `\` separated
        /// component of `name` is used.
        pub fn bind(name: &str, dir: &Path) -> io::Result<Self> {
            let file = name.rsplit(['\\', '/']).next().unwrap_or(name);
            let path = dir.join(format!("{file}.sock"));
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            let listener = UnixListener::bind(&path).map_err(|err| {
                io::Error::new(
                    err.kind(),
                    format!("failed to bind socket {}: {err}", path.display()),
                )
            })?;
            info!(socket = %path.display(), "socket bound");
            Ok(Self {
                listener,
                address: path.display().to_string(),
                path,
            })
        }

        /// Same socket type as [`Channel::bind`]; streams need nothing else.
        pub fn bind_stream(name: &str, dir: &Path) -> io::Result<Self> {
            Self::bind(name, dir)
        }

        pub fn address(&self) -> &str {
            &self.address
        }

        pub fn acceptor(self: &Arc<Self>) -> io::Result<Acceptor> {
            Ok(Acceptor {
                channel: Arc::clone(self),
            })
        }
    }

    impl Drop for Channel {
        fn drop(&mut self) {
            if let Err(err) = std::fs::remove_file(&self.path) {
                warn!(socket = %self.path.display(), %err, "failed to remove socket");
            }
        }
    }

    pub struct Acceptor {
        channel: Arc<Channel>,
    }

    impl Acceptor {
        pub async fn accept(&mut self) -> io::Result<Connection> {
            let (stream, _addr) = self.channel.listener.accept().await?;
            Ok(Connection(stream))
        }
    }

    pub struct Connection(UnixStream);

    impl Connection {
        /// Next piece of a streamed channel, `0` once the client is gone.
        pub async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.read(buf).await
        }

        pub async fn read_message(&mut self) -> io::Result<Vec<u8>> {
            let mut buf = Vec::new();
            (&mut self.0)
                .take(MAX_MESSAGE as u64)
                .read_to_end(&mut buf)
                .await?;
            Ok(buf)
        }

        pub async fn respond(mut self, data: &[u8]) -> io::Result<()> {
            self.0.write_all(data).await?;
            self.0.shutdown().await
        }
    }

    /// Send one message and wait for the response.
    pub async fn request(address: &str, message: &[u8]) -> io::Result<Vec<u8>> {
        let mut stream = UnixStream::connect(address).await?;
        stream.write_all(message).await?;
        stream.shutdown().await?;
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}
