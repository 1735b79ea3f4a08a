use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::codec::DEFAULT_MAX_FRAME_SIZE;
use crate::command::Command;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 6379;
const DEFAULT_POOL_SIZE: usize = 8;
const DEFAULT_POOL_WAIT: Duration = Duration::from_secs(5);

/// Settings for a pooled client.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Upper bound on a single round trip. When it elapses the connection is closed, since a reply
    /// cannot be abandoned halfway without breaking the framing of everything after it.
    pub response_timeout: Option<Duration>,
    pub max_frame_size: usize,
    /// Handshake sent once on every new connection.
    pub hello: Option<Hello>,
    pub pool: PoolConfig,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_size: usize,
    /// How long `Pool::get` waits for a free connection. Zero means fail immediately.
    pub wait_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            response_timeout: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            hello: None,
            pool: PoolConfig::default(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_POOL_SIZE,
            wait_timeout: DEFAULT_POOL_WAIT,
        }
    }
}

impl Config {
    pub fn new(host: impl Into<String>, port: u16) -> Config {
        Config {
            host: host.into(),
            port,
            ..Config::default()
        }
    }

    /// Defaults overridden by `REDIS_HOST`, `REDIS_PORT`, `REDIS_POOL_SIZE`,
    /// `REDIS_POOL_WAIT_MS`, `REDIS_RESPONSE_TIMEOUT_MS` and `MAX_FRAME_SIZE`.
    /// Values that do not parse are ignored.
    pub fn from_env() -> Config {
        let mut config = Config::default();

        if let Ok(host) = env::var("REDIS_HOST") {
            config.host = host;
        }
        if let Some(port) = parse_var("REDIS_PORT") {
            config.port = port;
        }
        if let Some(size) = parse_var("REDIS_POOL_SIZE") {
            config.pool.max_size = size;
        }
        if let Some(ms) = parse_var("REDIS_POOL_WAIT_MS") {
            config.pool.wait_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var("REDIS_RESPONSE_TIMEOUT_MS") {
            config.response_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(size) = parse_var("MAX_FRAME_SIZE") {
            config.max_frame_size = size;
        }

        config
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let value = env::var(name).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(variable = name, value = %value, "ignoring unparsable environment variable");
            None
        }
    }
}

/// `HELLO` handshake: selects the protocol version and optionally authenticates and names the
/// connection in the same round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub protocol: u8,
    pub auth: Option<(String, String)>,
    pub client_name: Option<String>,
}

impl Default for Hello {
    fn default() -> Self {
        Self {
            protocol: 3,
            auth: None,
            client_name: None,
        }
    }
}

impl Hello {
    pub fn command(&self) -> Command {
        let mut cmd = Command::new("HELLO").arg(self.protocol);

        if let Some((username, password)) = &self.auth {
            cmd = cmd.arg("AUTH").arg(username).arg(password);
        }
        if let Some(name) = &self.client_name {
            cmd = cmd.arg("SETNAME").arg(name);
        }

        cmd
    }
}
