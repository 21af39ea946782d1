//! Configuration loading and representation.
//!
//! Settings come from environment variables. Every loader also has a
//! `from_lookup` form taking a key → value function, so tests can feed a map
//! instead of touching the process environment.
//!
//! A component whose `BOOTSTRAP_SERVER` is unset is disabled (`None`). Once it
//! is enabled, missing or malformed settings are fatal [`ConfigError`]s.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use petstore_messaging::{AckPolicy, OffsetReset};

pub const PRODUCER_PREFIX: &str = "PETSTORE_COMMANDS_PRODUCER_";
pub const CONSUMER_PREFIX: &str = "PETSTORE_COMMANDS_CONSUMER_";
pub const BROKER_KEY: &str = "PETSTORE_BROKER";
pub const DATABASE_URL_KEY: &str = "DATABASE_URL";
pub const DATABASE_MAX_CONNECTIONS_KEY: &str = "DATABASE_MAX_CONNECTIONS";

const DEFAULT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_WORKERS: usize = 4;
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {key}")]
    Missing { key: String },

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, value: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// How many broker replicas must confirm a publish.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Acks {
    None,
    Leader,
    #[default]
    All,
}

impl Acks {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "0",
            Self::Leader => "1",
            Self::All => "all",
        }
    }
}

impl FromStr for Acks {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "0" | "none" => Ok(Self::None),
            "1" | "leader" => Ok(Self::Leader),
            "all" | "-1" => Ok(Self::All),
            _ => Err("expected one of 0, 1, all".to_string()),
        }
    }
}

/// Which transport carries the commands topic.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BrokerKind {
    Kafka,
    Redis,
    /// Process-local; dev and tests only.
    Memory,
}

/// The first transport compiled into this build: Kafka, then Redis, then
/// memory.
impl Default for BrokerKind {
    fn default() -> Self {
        if cfg!(feature = "kafka") {
            Self::Kafka
        } else if cfg!(feature = "redis") {
            Self::Redis
        } else {
            Self::Memory
        }
    }
}

impl BrokerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kafka => "kafka",
            Self::Redis => "redis",
            Self::Memory => "memory",
        }
    }
}

impl FromStr for BrokerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kafka" => Ok(Self::Kafka),
            "redis" => Ok(Self::Redis),
            "memory" | "in-memory" => Ok(Self::Memory),
            _ => Err("expected one of kafka, redis, memory".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerConfig {
    pub bootstrap_server: String,
    pub topic: String,
    pub client_id: String,
    pub ack: Acks,
    pub timeout: Duration,
}

impl ProducerConfig {
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let settings = Settings::new(PRODUCER_PREFIX, &lookup);
        let Some(bootstrap_server) = settings.optional("BOOTSTRAP_SERVER") else {
            return Ok(None);
        };

        Ok(Some(Self {
            bootstrap_server,
            topic: settings.required("TOPIC")?,
            client_id: settings.required("CLIENT_ID")?,
            ack: settings.parsed("ACK")?.unwrap_or_default(),
            timeout: settings.millis("TIMEOUT_MS")?,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub bootstrap_server: String,
    pub topic: String,
    pub client_id: String,
    pub group_id: String,
    pub offset_reset: OffsetReset,
    pub timeout: Duration,
    pub ack_policy: AckPolicy,
    /// Concurrent dispatch workers in the sink.
    pub workers: usize,
}

impl ConsumerConfig {
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let settings = Settings::new(CONSUMER_PREFIX, &lookup);
        let Some(bootstrap_server) = settings.optional("BOOTSTRAP_SERVER") else {
            return Ok(None);
        };

        let offset_reset = match settings.optional("OFFSET_RESET") {
            None => OffsetReset::default(),
            Some(v) => parse_offset_reset(&v)
                .ok_or_else(|| ConfigError::invalid(&settings.key("OFFSET_RESET"), &v, "expected earliest or latest"))?,
        };

        let ack_policy = match settings.optional("ACK_POLICY") {
            None => AckPolicy::default(),
            Some(v) => parse_ack_policy(&v).ok_or_else(|| {
                ConfigError::invalid(
                    &settings.key("ACK_POLICY"),
                    &v,
                    "expected on_receive or after_processing",
                )
            })?,
        };

        let workers: usize = settings.parsed("WORKERS")?.unwrap_or(DEFAULT_WORKERS);
        if workers == 0 {
            return Err(ConfigError::invalid(&settings.key("WORKERS"), "0", "must be at least 1"));
        }

        Ok(Some(Self {
            bootstrap_server,
            topic: settings.required("TOPIC")?,
            client_id: settings.required("CLIENT_ID")?,
            group_id: settings.required("GROUP_ID")?,
            offset_reset,
            timeout: settings.millis("TIMEOUT_MS")?,
            ack_policy,
            workers,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// `None` selects the in-memory store.
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl StoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let settings = Settings::new("", &lookup);
        Ok(Self {
            database_url: settings.optional(DATABASE_URL_KEY),
            max_connections: settings
                .parsed(DATABASE_MAX_CONNECTIONS_KEY)?
                .unwrap_or(DEFAULT_MAX_CONNECTIONS),
        })
    }
}

/// Everything the stream service needs at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub broker: BrokerKind,
    pub consumer: Option<ConsumerConfig>,
    pub producer: Option<ProducerConfig>,
    pub store: StoreConfig,
}

impl StreamConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let broker = Settings::new("", &lookup)
            .parsed(BROKER_KEY)?
            .unwrap_or_default();

        Ok(Self {
            broker,
            consumer: ConsumerConfig::from_lookup(&lookup)?,
            producer: ProducerConfig::from_lookup(&lookup)?,
            store: StoreConfig::from_lookup(&lookup)?,
        })
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn parse_offset_reset(v: &str) -> Option<OffsetReset> {
    match v.trim().to_ascii_lowercase().as_str() {
        "earliest" => Some(OffsetReset::Earliest),
        "latest" => Some(OffsetReset::Latest),
        _ => None,
    }
}

fn parse_ack_policy(v: &str) -> Option<AckPolicy> {
    match v.trim().to_ascii_lowercase().as_str() {
        "on_receive" => Some(AckPolicy::OnReceive),
        "after_processing" => Some(AckPolicy::AfterProcessing),
        _ => None,
    }
}

/// Prefixed view over a lookup function. Blank values count as unset.
struct Settings<'a, F> {
    prefix: &'a str,
    lookup: &'a F,
}

impl<'a, F> Settings<'a, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn new(prefix: &'a str, lookup: &'a F) -> Self {
        Self { prefix, lookup }
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn optional(&self, name: &str) -> Option<String> {
        (self.lookup)(&self.key(name))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, name: &str) -> Result<String, ConfigError> {
        self.optional(name)
            .ok_or_else(|| ConfigError::Missing { key: self.key(name) })
    }

    fn parsed<T>(&self, name: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: ToString,
    {
        match self.optional(name) {
            None => Ok(None),
            Some(v) => v
                .parse()
                .map(Some)
                .map_err(|e: T::Err| ConfigError::invalid(&self.key(name), &v, e.to_string())),
        }
    }

    fn millis(&self, name: &str) -> Result<Duration, ConfigError> {
        let ms: u64 = self.parsed(name)?.unwrap_or(DEFAULT_TIMEOUT_MS);
        Ok(Duration::from_millis(ms))
    }
}
