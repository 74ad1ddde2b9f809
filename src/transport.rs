use std::{
    future::Future,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use tracing::debug;

use crate::{config::Config, domain::LedPayload};

pub const DEFAULT_DEVICE_PORT: u16 = 80;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(300);
/// Pushes recur every propagation interval, so one retry is the most that is useful.
pub const MAX_RETRIES: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    InvalidAddress { address: String },
    Timeout,
    Connect(String),
    Status(u16),
    Request(String),
}

impl TransportError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Connect(_))
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidAddress { address } => write!(f, "invalid device address: {address}"),
            Self::Timeout => write!(f, "device did not answer in time"),
            Self::Connect(details) => write!(f, "connect failed: {details}"),
            Self::Status(status) => write!(f, "device answered with http {status}"),
            Self::Request(details) => write!(f, "request failed: {details}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<reqwest::Error> for TransportError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            Self::Timeout
        } else if value.is_connect() {
            Self::Connect(value.to_string())
        } else if let Some(status) = value.status() {
            Self::Status(status.as_u16())
        } else {
            Self::Request(value.to_string())
        }
    }
}

pub type SendFuture = Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send>>;

/// Delivers one desired-state payload to one device. Implementations must bound their own
/// latency; callers never add a deadline of their own.
pub trait DeviceTransport: Send + Sync {
    fn send(&self, address: &str, payload: LedPayload) -> SendFuture;
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub timeout: Duration,
    pub retries: u32,
    pub device_port: u16,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            retries: MAX_RETRIES,
            device_port: DEFAULT_DEVICE_PORT,
        }
    }
}

impl TransportOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: Duration::from_millis(config.device_timeout_ms),
            retries: config.device_retries.min(MAX_RETRIES),
            device_port: config.device_port,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpDeviceTransport {
    client: reqwest::Client,
    options: Arc<TransportOptions>,
}

impl HttpDeviceTransport {
    pub fn new(options: TransportOptions) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(format!("ledhub/{}", crate::version::VERSION))
            .connect_timeout(options.timeout)
            .timeout(options.timeout)
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(Self {
            client,
            options: Arc::new(TransportOptions {
                retries: options.retries.min(MAX_RETRIES),
                ..options
            }),
        })
    }
}

impl DeviceTransport for HttpDeviceTransport {
    fn send(&self, address: &str, payload: LedPayload) -> SendFuture {
        let client = self.client.clone();
        let options = self.options.clone();
        let url = leds_url(address, options.device_port);
        Box::pin(async move {
            let url = url?;
            let attempts = 1 + options.retries;
            let mut attempt = 1;
            loop {
                match put_once(&client, &url, &payload).await {
                    Ok(()) => return Ok(()),
                    Err(err) if err.is_retryable() && attempt < attempts => {
                        debug!(%url, attempt, error = %err, "device push failed; retrying");
                        attempt += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        })
    }
}

async fn put_once(
    client: &reqwest::Client,
    url: &reqwest::Url,
    payload: &LedPayload,
) -> Result<(), TransportError> {
    client
        .put(url.clone())
        .json(payload)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

/// `http://<address>:<port>/leds`. An explicit port inside `address` wins over `default_port`.
pub fn leds_url(address: &str, default_port: u16) -> Result<reqwest::Url, TransportError> {
    let invalid = || TransportError::InvalidAddress {
        address: address.to_string(),
    };

    let authority = if let Ok(addr) = address.parse::<SocketAddr>() {
        addr.to_string()
    } else if let Ok(ip) = address.parse::<IpAddr>() {
        SocketAddr::new(ip, default_port).to_string()
    } else if let Some((host, port)) = address.rsplit_once(':') {
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(invalid());
        }
        address.to_string()
    } else if address.is_empty() {
        return Err(invalid());
    } else {
        format!("{address}:{default_port}")
    };

    reqwest::Url::parse(&format!("http://{authority}/leds")).map_err(|_| invalid())
}
