use std::sync::Mutex as StdMutex;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE, REFERER};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::logger::{MessageLogMode, MessageLogger};
use crate::protocol::{
    base_url, device_rows, event_rows, is_success_result, panel_payload, referer, row_label,
    set_mode_form, EventLogEndpoint, ENDPOINT_DEVICE_LIST, ENDPOINT_PANEL_SET,
    ENDPOINT_PANEL_STATUS,
};
use crate::types::*;
use crate::{Error, Result};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_EVENT_LOG_LIMIT: usize = 50;

const BODY_SNIPPET_LEN: usize = 200;

pub struct VestaClientBuilder {
    host: String,
    username: String,
    password: String,
    use_tls: bool,
    verify_tls: bool,
    timeout: Duration,
    max_retries: u32,
    retry_base_delay: Duration,
    event_log_endpoint: EventLogEndpoint,
    log_mode: Option<MessageLogMode>,
    log_path: Option<String>,
}

impl VestaClientBuilder {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: String::new(),
            password: String::new(),
            use_tls: false,
            verify_tls: false,
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            event_log_endpoint: EventLogEndpoint::default(),
            log_mode: None,
            log_path: None,
        }
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Talk HTTPS instead of plain HTTP.
    pub fn use_tls(mut self, enabled: bool) -> Self {
        self.use_tls = enabled;
        self
    }

    /// Verify the panel certificate. Off by default; panels ship self-signed certs.
    pub fn verify_tls(mut self, enabled: bool) -> Self {
        self.verify_tls = enabled;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Extra attempts for connection failures. Auth and API errors are never retried.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Delay before the first retry; doubles on each further attempt.
    pub fn retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn event_log_endpoint(mut self, endpoint: EventLogEndpoint) -> Self {
        self.event_log_endpoint = endpoint;
        self
    }

    pub fn message_log(mut self, mode: MessageLogMode, path: impl Into<String>) -> Self {
        self.log_mode = Some(mode);
        self.log_path = Some(path.into());
        self
    }

    pub fn build(self) -> Result<VestaClient> {
        let host = self.host.trim().trim_end_matches('/').to_string();
        if host.is_empty() {
            return Err(Error::InvalidConfig("host must not be empty".to_string()));
        }
        let scheme = if self.use_tls { "https" } else { "http" };

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-requested-with"),
            HeaderValue::from_static("XMLHttpRequest"),
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let referer_value = HeaderValue::from_str(&referer(scheme, &host))
            .map_err(|e| Error::InvalidConfig(format!("invalid host {host:?}: {e}")))?;
        headers.insert(REFERER, referer_value);

        let logger = match (self.log_mode, self.log_path) {
            (Some(mode), Some(path)) => Some(StdMutex::new(
                MessageLogger::new(mode, &path)
                    .map_err(|e| Error::InvalidConfig(format!("cannot open message log {path}: {e}")))?,
            )),
            _ => None,
        };

        Ok(VestaClient {
            base_url: base_url(scheme, &host),
            host,
            username: self.username,
            password: self.password,
            verify_tls: self.verify_tls,
            timeout: self.timeout,
            max_retries: self.max_retries,
            retry_base_delay: self.retry_base_delay,
            event_log_endpoint: self.event_log_endpoint,
            headers,
            session: Mutex::new(None),
            logger,
        })
    }
}

#[derive(Clone)]
struct Session {
    http: reqwest::Client,
    closed: CancellationToken,
}

/// Client for the panel's `/action/<endpoint>` CGI interface.
///
/// All methods take `&self`; the underlying HTTP session is created on first
/// use and shared until [`close`](Self::close).
pub struct VestaClient {
    host: String,
    base_url: String,
    username: String,
    password: String,
    verify_tls: bool,
    timeout: Duration,
    max_retries: u32,
    retry_base_delay: Duration,
    event_log_endpoint: EventLogEndpoint,
    headers: HeaderMap,
    session: Mutex<Option<Session>>,
    logger: Option<StdMutex<MessageLogger>>,
}

impl VestaClient {
    pub fn builder(host: impl Into<String>) -> VestaClientBuilder {
        VestaClientBuilder::new(host)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn event_log_endpoint(&self) -> EventLogEndpoint {
        self.event_log_endpoint
    }

    /// Probe `panelCondGet` to check the credentials.
    pub async fn authenticate(&self) -> Result<()> {
        debug!(host = %self.host, "testing authentication");
        match self.request(Method::GET, ENDPOINT_PANEL_STATUS, None).await {
            Ok(_) => {
                debug!(host = %self.host, "authentication successful");
                Ok(())
            }
            Err(e) => {
                if e.is_auth() {
                    error!(host = %self.host, "authentication failed");
                }
                Err(e)
            }
        }
    }

    pub async fn get_panel_status(&self) -> Result<PanelStatus> {
        debug!(host = %self.host, "fetching panel status");
        let body = self.request(Method::GET, ENDPOINT_PANEL_STATUS, None).await?;
        PanelStatus::deserialize(panel_payload(&body)).map_err(|e| {
            error!(error = %e, "failed to parse panel status");
            Error::api(format!("failed to parse panel status: {e}"))
        })
    }

    /// Device list; malformed rows are logged and dropped.
    pub async fn get_devices(&self) -> Result<Vec<DeviceStatus>> {
        debug!(host = %self.host, "fetching device list");
        let body = self.request(Method::GET, ENDPOINT_DEVICE_LIST, None).await?;
        let rows = device_rows(&body).map_err(|e| {
            error!(error = %e, "failed to parse device list");
            Error::api(format!("failed to parse device list: {e}"))
        })?;
        Ok(parse_rows(rows, usize::MAX, "device"))
    }

    /// Up to `limit` history rows, most recent first.
    pub async fn get_event_log(&self, limit: usize) -> Result<Vec<EventLogEntry>> {
        let endpoint = self.event_log_endpoint.as_str();
        debug!(host = %self.host, endpoint, limit, "fetching event log");
        let body = self.request(Method::GET, endpoint, None).await?;
        let rows = event_rows(&body).map_err(|e| {
            error!(error = %e, "failed to parse event log");
            Error::api(format!("failed to parse event log: {e}"))
        })?;
        Ok(parse_rows(rows, limit, "event log"))
    }

    /// Returns `Ok(false)` when the panel answers but does not confirm the
    /// change; transport failures are still errors.
    pub async fn set_alarm_mode(&self, mode: ArmMode, area: u32) -> Result<bool> {
        info!(host = %self.host, mode = mode.as_key(), area, "setting alarm mode");
        if let Some(logger) = &self.logger
            && let Ok(mut logger) = logger.lock()
        {
            logger.log_command("set_alarm_mode", area, mode.code());
        }

        let form = set_mode_form(mode, area);
        let body = self.request(Method::POST, ENDPOINT_PANEL_SET, Some(form.as_slice())).await?;
        if is_success_result(&body) {
            debug!("alarm mode set successfully");
            Ok(true)
        } else {
            error!(response = %body, "panel did not confirm alarm mode change");
            Ok(false)
        }
    }

    /// Panel status and device list, fetched concurrently. The event log is
    /// left empty.
    pub async fn get_all_data(&self) -> Result<VestaData> {
        debug!(host = %self.host, "fetching all data");
        let (panel, devices) = tokio::try_join!(self.get_panel_status(), self.get_devices())?;
        Ok(VestaData {
            panel,
            devices,
            event_log: Vec::new(),
        })
    }

    /// Drop the HTTP session. In-flight requests fail with [`Error::Closed`];
    /// the next request opens a fresh session.
    pub async fn close(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.closed.cancel();
            debug!(host = %self.host, "client session closed");
        }
    }

    /// One logical request with retry on connection failures.
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        form: Option<&[(&str, String)]>,
    ) -> Result<Value> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let mut attempt: u32 = 0;

        loop {
            let session = self.session().await?;
            let result = tokio::select! {
                biased;
                _ = session.closed.cancelled() => Err(Error::Closed),
                res = self.send_once(&session.http, &method, &url, endpoint, form) => res,
            };

            match result {
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let wait = self
                        .retry_base_delay
                        .saturating_mul(2u32.saturating_pow(attempt));
                    debug!(
                        endpoint,
                        attempt = attempt + 1,
                        max_attempts = self.max_retries + 1,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "request failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = session.closed.cancelled() => return Err(Error::Closed),
                        _ = tokio::time::sleep(wait) => {}
                    }
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn session(&self) -> Result<Session> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref()
            && !session.closed.is_cancelled()
        {
            return Ok(session.clone());
        }

        let http = reqwest::Client::builder()
            .default_headers(self.headers.clone())
            .timeout(self.timeout)
            .danger_accept_invalid_certs(!self.verify_tls)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(Error::Client)?;
        debug!(host = %self.host, "opened HTTP session");

        let session = Session {
            http,
            closed: CancellationToken::new(),
        };
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn send_once(
        &self,
        http: &reqwest::Client,
        method: &Method,
        url: &str,
        endpoint: &str,
        form: Option<&[(&str, String)]>,
    ) -> Result<Value> {
        if let Some(logger) = &self.logger
            && let Ok(mut logger) = logger.lock()
        {
            logger.log_request(method.as_str(), endpoint, form);
        }

        let mut req = http
            .request(method.clone(), url)
            .basic_auth(&self.username, Some(&self.password));
        if let Some(form) = form {
            req = req.form(form);
        }

        let resp = req.send().await.map_err(|e| self.transport_error(e))?;
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(Error::Authentication(format!(
                "panel {} rejected the credentials",
                self.host
            )));
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        let body = resp.bytes().await.map_err(|e| self.transport_error(e))?;

        if status.as_u16() >= 400 {
            return Err(Error::Api {
                status: Some(status.as_u16()),
                message: snippet(&body),
            });
        }

        let labeled_json =
            content_type.contains("application/json") || content_type.contains("text/json");
        match serde_json::from_slice::<Value>(&body) {
            Ok(json) => {
                if let Some(logger) = &self.logger
                    && let Ok(mut logger) = logger.lock()
                {
                    logger.log_response(endpoint, status.as_u16(), &json);
                }
                Ok(json)
            }
            Err(e) if labeled_json => Err(Error::Api {
                status: Some(status.as_u16()),
                message: format!("invalid JSON from {endpoint}: {e}"),
            }),
            Err(_) => Err(Error::Api {
                status: Some(status.as_u16()),
                message: format!(
                    "unexpected response type '{content_type}' from {endpoint}: {}",
                    snippet(&body)
                ),
            }),
        }
    }

    fn transport_error(&self, e: reqwest::Error) -> Error {
        if e.is_builder() {
            return Error::InvalidConfig(format!("cannot build request for {}: {e}", self.host));
        }
        let message = if e.is_timeout() {
            format!("connection to {} timed out", self.host)
        } else if e.is_connect() {
            format!("connection to {} failed: {e}", self.host)
        } else {
            format!("HTTP error for {}: {e}", self.host)
        };
        warn!(host = %self.host, "{message}");
        Error::Connection {
            message,
            source: Some(e),
        }
    }
}

fn parse_rows<'a, T: Deserialize<'a>>(rows: &'a [Value], limit: usize, what: &str) -> Vec<T> {
    rows.iter()
        .take(limit)
        .filter_map(|row| match T::deserialize(row) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!(row = %row_label(row), error = %e, "skipping malformed {what} row");
                None
            }
        })
        .collect()
}

fn snippet(body: &[u8]) -> String {
    String::from_utf8_lossy(body)
        .chars()
        .take(BODY_SNIPPET_LEN)
        .collect()
}
