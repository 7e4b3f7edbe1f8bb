//! Completion report to the host controller.

#![forbid(unsafe_code)]

use crate::error::Error;
use reqwest::header::CONTENT_TYPE;
use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Result of a run as reported to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub success: bool,
    /// Message of the fatal error that ended the run, empty otherwise.
    pub error: String,
}

impl Completion {
    pub fn success() -> Self {
        Self {
            success: true,
            error: String::new(),
        }
    }

    pub fn failure(error: impl ToString) -> Self {
        Self {
            success: false,
            error: error.to_string(),
        }
    }
}

/// Calls `complete(success, error, results)` on the controller over XML-RPC.
pub struct HostReporter {
    url: String,
    client: reqwest::Client,
}

impl HostReporter {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Send the report once. Failures are logged, never retried.
    pub async fn report(&self, completion: &Completion, results: &Path) {
        match self.send(completion, results).await {
            Ok(()) => info!(success = completion.success, "reported completion to the host"),
            Err(err) => error!(url = %self.url, %err, "failed to report completion to the host"),
        }
    }

    async fn send(&self, completion: &Completion, results: &Path) -> Result<(), Error> {
        let body = complete_call(completion, &results.display().to_string());
        self.client
            .post(&self.url)
            .header(CONTENT_TYPE, "text/xml")
            .timeout(TIMEOUT)
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

fn complete_call(completion: &Completion, results: &str) -> String {
    let mut body = String::from(
        "<?xml version=\"1.0\"?>\n<methodCall><methodName>complete</methodName><params>",
    );
    let _ = write!(
        body,
        "<param><value><boolean>{}</boolean></value></param>",
        u8::from(completion.success)
    );
    for value in [completion.error.as_str(), results] {
        let _ = write!(
            body,
            "<param><value><string>{}</string></value></param>",
            escape(value)
        );
    }
    body.push_str("</params></methodCall>\n");
    body
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn call_escapes_the_error_message() {
        let body = complete_call(&Completion::failure("a < b & c"), "C:\\results");
        assert!(body.contains("<methodName>complete</methodName>"));
        assert!(body.contains("<boolean>0</boolean>"));
        assert!(body.contains("<string>a &lt; b &amp; c</string>"));
        assert!(body.contains("<string>C:\\results</string>"));
    }

    #[tokio::test]
    async fn report_posts_to_the_controller() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !String::from_utf8_lossy(&request).contains("</methodCall>") {
                let read = stream.read(&mut buf).await.unwrap();
                assert!(read > 0);
                request.extend_from_slice(&buf[..read]);
            }
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8(request).unwrap()
        });

        HostReporter::new(url)
            .report(&Completion::success(), Path::new("/tmp/results"))
            .await;

        let request = server.await.unwrap();
        assert!(request.starts_with("POST / HTTP/1.1"));
        assert!(request.contains("<boolean>1</boolean>"));
        assert!(request.contains("<string>/tmp/results</string>"));
    }

    #[tokio::test]
    async fn unreachable_controller_is_not_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        drop(listener);

        HostReporter::new(url)
            .report(&Completion::failure("boom"), Path::new("results"))
            .await;
    }
}
