use crate::error::ClientError;
use crate::wire::DEFAULT_MAX_FRAME_BYTES;
use std::env;
use std::time::Duration;
use url::Url;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_SEND_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_MAX_RECONNECTS: u32 = 8;

#[derive(Clone, Debug, PartialEq)]
pub struct ClientConfig {
    pub api_url: Url,
    pub ws_url: Url,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_frame_bytes: usize,
}

impl ClientConfig {
    pub fn new(api_url: &str, ws_url: &str) -> Result<Self, ClientError> {
        Ok(Self {
            api_url: parse_url("api url", api_url, &["http", "https"])?,
            ws_url: parse_url("websocket url", ws_url, &["ws", "wss"])?,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            send_timeout: Duration::from_secs(DEFAULT_SEND_TIMEOUT_SECS),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECTS,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        })
    }

    pub fn from_env() -> Result<Self, ClientError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from `GBCMS_*` variables, falling back to the
    /// dashboard's `REACT_APP_*` names for the two URLs.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ClientError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_url = first_non_empty(&lookup, &["GBCMS_API_URL", "REACT_APP_API_URL"]);
        let ws_url = first_non_empty(&lookup, &["GBCMS_WS_URL", "REACT_APP_WEBSOCKET_URL"]);
        let mut config = Self::new(&api_url.unwrap_or_default(), &ws_url.unwrap_or_default())?;
        if let Some(secs) = parse_u64(&lookup, "GBCMS_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64(&lookup, "GBCMS_CONNECT_TIMEOUT_SECS")? {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(attempts) = parse_u64(&lookup, "GBCMS_MAX_RECONNECTS")? {
            config.max_reconnect_attempts = u32::try_from(attempts).map_err(|_| {
                ClientError::Config(format!("GBCMS_MAX_RECONNECTS out of range: {attempts}"))
            })?;
        }
        Ok(config)
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.api_url
            .join(path.trim_start_matches('/'))
            .map_err(|err| ClientError::Config(format!("invalid endpoint {path}: {err}")))
    }
}

fn parse_url(label: &str, raw: &str, schemes: &[&str]) -> Result<Url, ClientError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ClientError::Config(format!("{label} is not set")));
    }
    let mut url = Url::parse(raw).map_err(|err| ClientError::Config(format!("invalid {label} '{raw}': {err}")))?;
    if !schemes.contains(&url.scheme()) {
        return Err(ClientError::Config(format!(
            "{label} must use one of {schemes:?}, got '{}'",
            url.scheme()
        )));
    }
    // Url::join drops the last segment unless the base ends with a slash.
    if schemes.contains(&"http") && !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn first_non_empty<F>(lookup: &F, keys: &[&str]) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    keys.iter()
        .filter_map(|key| lookup(key))
        .find(|value| !value.trim().is_empty())
}

fn parse_u64<F>(lookup: &F, key: &str) -> Result<Option<u64>, ClientError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|err| ClientError::Config(format!("{key}='{value}': {err}"))),
        _ => Ok(None),
    }
}
