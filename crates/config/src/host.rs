use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Host {
    /// Address of the result server on the host side. Written into every
    /// injection configuration so the instrumentation can log there too.
    pub ip: String,

    /// Port of the result server.
    pub port: u16,

    /// Endpoint of the in-guest agent that relays completion to the host.
    pub controller_url: String,
}

impl Default for Host {
    fn default() -> Self {
        Self {
            ip: "192.168.56.1".into(),
            port: 2042,
            controller_url: "http://127.0.0.1:8000/".into(),
        }
    }
}

impl Host {
    /// `ip:port` of the result server.
    pub fn result_server(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}
