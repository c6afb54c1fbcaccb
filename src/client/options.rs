// ABOUTME: Option builders for connecting, sending and subscribing
// ABOUTME: Collects optional headers and tuning knobs without widening the core API surface

use crate::header::Headers;
use crate::version::{Version, SUPPORTED};
use std::time::Duration;

/// Options for [`dial`](crate::client::dial) and
/// [`connect`](crate::client::connect).
///
/// The defaults advertise every supported protocol version and offer
/// heart-beats of one minute in each direction.
///
/// # Example
///
/// ```rust,no_run
/// use stomp::client::ConnectOptions;
/// use std::time::Duration;
///
/// let options = ConnectOptions::new()
///     .with_login("guest", "guest")
///     .with_host("broker")
///     .with_heart_beat(Duration::from_secs(30), Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub(crate) login: Option<String>,
    pub(crate) passcode: Option<String>,
    pub(crate) host: Option<String>,
    pub(crate) accept_versions: Vec<Version>,
    pub(crate) send_interval: Duration,
    pub(crate) recv_interval: Duration,
    pub(crate) heart_beat_error: Duration,
    pub(crate) headers: Headers,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            login: None,
            passcode: None,
            host: None,
            accept_versions: SUPPORTED.to_vec(),
            send_interval: Duration::from_secs(60),
            recv_interval: Duration::from_secs(60),
            heart_beat_error: Duration::from_secs(5),
            headers: Headers::new(),
        }
    }
}

impl ConnectOptions {
    pub fn new() -> ConnectOptions {
        ConnectOptions::default()
    }

    /// Login and passcode sent in the CONNECT frame.
    pub fn with_login(mut self, login: impl Into<String>, passcode: impl Into<String>) -> Self {
        self.login = Some(login.into());
        self.passcode = Some(passcode.into());
        self
    }

    /// Virtual host name for the `host` header. `dial` defaults this to the
    /// host portion of the dialled address when unset.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Restrict the advertised protocol versions. Replaces the default list.
    pub fn with_accept_versions(mut self, versions: &[Version]) -> Self {
        self.accept_versions = versions.to_vec();
        self
    }

    /// Heart-beat intervals: how often this client is willing to send a
    /// keep-alive, and how often it wants to hear from the server. Zero
    /// disables the respective direction.
    pub fn with_heart_beat(mut self, send: Duration, recv: Duration) -> Self {
        self.send_interval = send;
        self.recv_interval = recv;
        self
    }

    /// Slack added to the negotiated receive interval before a silent server
    /// is declared dead.
    pub fn with_heart_beat_error(mut self, margin: Duration) -> Self {
        self.heart_beat_error = margin;
        self
    }

    /// Extra header entry for the CONNECT frame. Appended after the standard
    /// headers, so it cannot override them.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.add(name, value);
        self
    }

    pub(crate) fn accept_version_header(&self) -> String {
        let mut versions: Vec<Version> = self.accept_versions.clone();
        versions.sort();
        versions.dedup();
        versions
            .iter()
            .map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Options for [`Connection::send`](crate::client::Connection::send).
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub(crate) receipt: bool,
    pub(crate) suppress_content_length: bool,
    pub(crate) transaction: Option<String>,
    pub(crate) headers: Headers,
}

impl SendOptions {
    pub fn new() -> SendOptions {
        SendOptions::default()
    }

    /// Request a RECEIPT frame; the send call completes only once the server
    /// has confirmed processing.
    pub fn with_receipt(mut self) -> Self {
        self.receipt = true;
        self
    }

    /// Leave the `content-length` header off the SEND frame. Some brokers
    /// treat frames without it as text messages.
    pub fn without_content_length(mut self) -> Self {
        self.suppress_content_length = true;
        self
    }

    /// Extra header entry for the SEND frame.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.add(name, value);
        self
    }

    pub(crate) fn in_transaction(mut self, tx_id: &str) -> Self {
        self.transaction = Some(tx_id.to_string());
        self
    }
}

/// Options for [`Connection::subscribe`](crate::client::Connection::subscribe).
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub(crate) headers: Headers,
}

impl SubscribeOptions {
    pub fn new() -> SubscribeOptions {
        SubscribeOptions::default()
    }

    /// Extra header entry for the SUBSCRIBE frame.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.add(name, value);
        self
    }
}
