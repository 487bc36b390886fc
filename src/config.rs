use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::time::Duration;
use url::Url;

const DEFAULT_DATABASE_URL: &str = "sqlite://serial-forwarder.db";
const DEFAULT_SERIAL_PORT: &str = "/dev/ttyS0";
const DEFAULT_BAUD_RATE: u32 = 9600;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,

    pub serial_port: String,
    pub baud_rate: u32,
    pub delimiter: u8,
    pub serial_read_timeout: Duration,
    pub stall_timeout: Duration,

    pub api_endpoint: Option<String>,
    pub api_url_ping: Option<String>,
    pub hostname: Option<String>,
    pub http_timeout: Duration,

    pub batch_size: usize,
    pub poll_interval: Duration,
    pub sweep_interval: Duration,
    pub ping_interval: Duration,
    pub mark_workers: usize,
    pub mark_queue: usize,

    pub http_bind: Option<String>,
}

/// Settings the producer side cannot run without.
#[derive(Debug, Clone)]
pub struct ProducerTarget {
    pub api_endpoint: String,
    pub hostname: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let database_url = env.string("DATABASE_URL", Some(DEFAULT_DATABASE_URL.to_string()))?;

        let serial_port = env.string("SERIAL_PORT", Some(DEFAULT_SERIAL_PORT.to_string()))?;
        let baud_rate = match env.optional("SERIAL_BAUDRATE") {
            Some(raw) => match raw.parse::<u32>() {
                Ok(value) if value > 0 => value,
                _ => {
                    tracing::warn!(
                        value = %raw,
                        "invalid SERIAL_BAUDRATE; using default of {DEFAULT_BAUD_RATE}"
                    );
                    DEFAULT_BAUD_RATE
                }
            },
            None => DEFAULT_BAUD_RATE,
        };
        // A bare newline is trimmed away by `optional`, so read the raw value here.
        let delimiter = match (env.lookup)("SERIAL_DELIMITER").filter(|v| !v.is_empty()) {
            Some(raw) => parse_delimiter(&raw).context("invalid SERIAL_DELIMITER")?,
            None => b'\n',
        };
        let serial_read_timeout =
            Duration::from_millis(env.nonzero_u64("SERIAL_READ_TIMEOUT_MS", 1000)?);
        let stall_timeout = Duration::from_secs(env.nonzero_u64("STALL_TIMEOUT_SECS", 120)?);

        let api_endpoint = env.optional("API_ENDPOINT");
        if let Some(endpoint) = api_endpoint.as_deref() {
            validate_http_url(endpoint).context("invalid API_ENDPOINT")?;
        }
        let api_url_ping = env.optional("API_URL_PING");
        if let Some(endpoint) = api_url_ping.as_deref() {
            validate_http_url(endpoint).context("invalid API_URL_PING")?;
        }
        let hostname = env.optional("HOSTNAME");
        let http_timeout = Duration::from_secs(env.u64("HTTP_TIMEOUT_SECS", Some(30))?);

        let batch_size = env.u64("BATCH_SIZE", Some(25))? as usize;
        if batch_size == 0 {
            bail!("BATCH_SIZE must be greater than zero");
        }
        let poll_interval = Duration::from_millis(env.u64("POLL_INTERVAL_MS", Some(500))?);
        let sweep_interval = Duration::from_secs(env.nonzero_u64("SWEEP_INTERVAL_SECS", 60)?);
        let ping_interval = Duration::from_secs(env.nonzero_u64("PING_INTERVAL_SECS", 60)?);
        let mark_workers = env.u64("MARK_WORKERS", Some(0))? as usize;
        let mark_queue = (env.u64("MARK_QUEUE", Some(16))? as usize).max(1);

        let http_bind = match (env.lookup)("FORWARDER_HTTP_BIND") {
            Some(value) => Some(value.trim().to_string()).filter(|v| !v.is_empty()),
            None => Some("127.0.0.1:9102".to_string()),
        };

        Ok(Self {
            database_url,
            serial_port,
            baud_rate,
            delimiter,
            serial_read_timeout,
            stall_timeout,
            api_endpoint,
            api_url_ping,
            hostname,
            http_timeout,
            batch_size,
            poll_interval,
            sweep_interval,
            ping_interval,
            mark_workers,
            mark_queue,
            http_bind,
        })
    }

    pub fn producer_target(&self) -> Result<ProducerTarget> {
        let api_endpoint = self
            .api_endpoint
            .clone()
            .ok_or_else(|| anyhow!("API_ENDPOINT is required for the producer"))?;
        let hostname = self
            .hostname
            .clone()
            .ok_or_else(|| anyhow!("HOSTNAME is required for the producer"))?;
        Ok(ProducerTarget {
            api_endpoint,
            hostname,
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str, default: Option<String>) -> Result<String> {
        match self.optional(key) {
            Some(value) => Ok(value),
            None => default.ok_or_else(|| anyhow!("missing env var {key}")),
        }
    }

    fn u64(&self, key: &str, default: Option<u64>) -> Result<u64> {
        match self.optional(key) {
            Some(value) => value.parse::<u64>().with_context(|| format!("invalid {key}")),
            None => default.ok_or_else(|| anyhow!("missing env var {key}")),
        }
    }

    fn nonzero_u64(&self, key: &str, default: u64) -> Result<u64> {
        let value = self.u64(key, Some(default))?;
        if value == 0 {
            bail!("{key} must be greater than zero");
        }
        Ok(value)
    }

    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

/// Parses a single delimiter byte: a literal character, one of the escapes
/// `\n` `\r` `\t` `\0`, or a hex byte such as `0x0A`.
pub fn parse_delimiter(raw: &str) -> Result<u8> {
    let value = match raw {
        "\\n" => return Ok(b'\n'),
        "\\r" => return Ok(b'\r'),
        "\\t" => return Ok(b'\t'),
        "\\0" => return Ok(0),
        other => other,
    };

    if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        return u8::from_str_radix(hex, 16).with_context(|| format!("bad hex byte {value:?}"));
    }

    match value.as_bytes() {
        [byte] => Ok(*byte),
        _ => bail!("delimiter must be a single byte, got {value:?}"),
    }
}

fn validate_http_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw)?;
    match url.scheme() {
        "http" | "https" => {}
        other => bail!("unsupported scheme {other}"),
    }
    if url.host_str().is_none() {
        bail!("missing host");
    }
    Ok(())
}
