use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Monitor {
    /// Name of the notification channel. A random name is generated at
    /// startup when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipe: Option<String>,

    /// Number of concurrent listeners on the notification channel.
    pub pipe_servers: usize,

    /// Name of the global mutex created at shutdown. Random when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_marker: Option<String>,

    /// Prefix of the per-pid termination event names. Random when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminate_event: Option<String>,

    /// Interval of the poll loop. **Measured in milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub poll_interval: Duration,

    /// How long after the last injection the monitored set may be considered
    /// empty. **Measured in seconds**.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub injection_settle: Duration,

    /// How long the monitored set has to stay empty before the analysis is
    /// declared complete. **Measured in seconds**.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub empty_confirmation: Duration,

    /// Delay before resuming a thread suspended at creation. **Measured in
    /// milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub resume_delay: Duration,

    /// Upper bound on reading one notification. **Measured in
    /// milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub handler_timeout: Duration,

    /// How long stopping the listener pool waits for in-flight handlers.
    /// **Measured in milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub drain_timeout: Duration,

    /// Pause after signalling a termination event so the target can flush
    /// its logs. **Measured in milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub terminate_flush: Duration,

    /// Pause after creating the shutdown marker so polling processes notice
    /// it. **Measured in milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub shutdown_grace: Duration,

    /// Names of processes whose pids are hidden from the sample.
    pub hide_processes: Vec<String>,

    /// Name of the service host process injected on the first `SERVICE:`
    /// notification.
    pub service_host: String,
}

impl Default for Monitor {
    fn default() -> Self {
        Self {
            pipe: None,
            pipe_servers: 4,
            shutdown_marker: None,
            terminate_event: None,
            poll_interval: Duration::from_secs(1),
            injection_settle: Duration::from_secs(15),
            empty_confirmation: Duration::from_secs(5),
            resume_delay: Duration::from_secs(2),
            handler_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_millis(500),
            terminate_flush: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(1),
            hide_processes: [
                "vmwareuser.exe",
                "vmwareservice.exe",
                "vboxservice.exe",
                "vboxtray.exe",
                "sandboxiedcomlaunch.exe",
                "sandboxierpcss.exe",
                "procmon.exe",
                "regmon.exe",
                "filemon.exe",
                "wireshark.exe",
                "netmon.exe",
                "prl_tools_service.exe",
                "prl_tools.exe",
                "prl_cc.exe",
                "sharedintapp.exe",
                "vmtoolsd.exe",
                "vmsrvc.exe",
                "python.exe",
                "perl.exe",
            ]
            .map(String::from)
            .to_vec(),
            service_host: "services.exe".into(),
        }
    }
}
