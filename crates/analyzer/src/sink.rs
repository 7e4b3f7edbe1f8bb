#![forbid(unsafe_code)]

use crate::error::Error;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Destination of everything the analysis collects: dropped files and
/// memory images.
pub trait ResultSink: Send + Sync {
    /// Store the contents of `data` under `remote`.
    fn upload(&self, remote: &str, data: &mut dyn Read) -> Result<(), Error>;

    /// Record that `local` has the same contents as the already stored
    /// `remote`.
    fn duplicate(&self, remote: &str, local: &str) -> Result<(), Error>;

    fn upload_file(&self, local: &Path, remote: &str) -> Result<(), Error> {
        let mut file = std::fs::File::open(local).map_err(|source| Error::Upload {
            path: remote.to_owned(),
            source,
        })?;
        self.upload(remote, &mut file)
    }

    /// Raw connection to the result server for a relayed behaviour log. The
    /// instrumentation writes its own protocol header.
    fn open_stream(&self) -> Result<Box<dyn Write + Send>, Error> {
        Err(Error::Unsupported("log streams"))
    }
}

/// Streams results to the result server, one TCP connection per item.
#[derive(Debug, Clone)]
pub struct NetlogSink {
    address: String,
    connect_timeout: Duration,
}

impl NetlogSink {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    fn connect(&self, remote: &str) -> Result<TcpStream, Error> {
        let upload_error = |source| Error::Upload {
            path: remote.to_owned(),
            source,
        };
        let addr = std::net::ToSocketAddrs::to_socket_addrs(&self.address)
            .map_err(upload_error)?
            .next()
            .ok_or_else(|| {
                upload_error(std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    "result server address did not resolve",
                ))
            })?;
        TcpStream::connect_timeout(&addr, self.connect_timeout).map_err(upload_error)
    }

    fn send(&self, remote: &str, header: &[u8], data: Option<&mut dyn Read>) -> Result<(), Error> {
        let upload_error = |source| Error::Upload {
            path: remote.to_owned(),
            source,
        };
        let mut stream = self.connect(remote)?;
        stream.write_all(header).map_err(upload_error)?;
        if let Some(data) = data {
            let sent = std::io::copy(data, &mut stream).map_err(upload_error)?;
            debug!(remote, bytes = sent, "uploaded to result server");
        }
        stream.flush().map_err(upload_error)?;
        Ok(())
    }
}

impl ResultSink for NetlogSink {
    fn upload(&self, remote: &str, data: &mut dyn Read) -> Result<(), Error> {
        let header = format!("FILE\n{remote}\n");
        self.send(remote, header.as_bytes(), Some(data))
    }

    fn duplicate(&self, remote: &str, local: &str) -> Result<(), Error> {
        let header = format!("DUPLICATE\n{remote}\n{local}\n");
        self.send(remote, header.as_bytes(), None)
    }

    fn open_stream(&self) -> Result<Box<dyn Write + Send>, Error> {
        Ok(Box::new(self.connect("log")?))
    }
}
