//! Bus configuration and transport security.
//!
//! Configuration is assembled from explicit values or from the environment:
//!
//! | Variable | Meaning |
//! |---|---|
//! | `KAFKA_BROKERS` | comma separated bootstrap servers; empty disables messaging |
//! | `KAFKA_VERSION` | broker protocol version, e.g. `2.8.0` |
//! | `KAFKA_SASL_USERNAME` | SASL username |
//! | `KAFKA_SASL_PASSWORD` | SASL password |
//! | `KAFKA_SASL_MECHANISM` | one of `PLAIN`, `SCRAM`, `OAUTH2` |
//! | `KAFKA_GROUP_ID` | consumer group id |
//!
//! SASL is only enabled when username, password and a recognized mechanism
//! are all present.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use rdkafka::ClientConfig;

use crate::error::{BusError, BusResult};

pub const ENV_BROKERS: &str = "KAFKA_BROKERS";
pub const ENV_VERSION: &str = "KAFKA_VERSION";
pub const ENV_SASL_USERNAME: &str = "KAFKA_SASL_USERNAME";
pub const ENV_SASL_PASSWORD: &str = "KAFKA_SASL_PASSWORD";
pub const ENV_SASL_MECHANISM: &str = "KAFKA_SASL_MECHANISM";
pub const ENV_GROUP_ID: &str = "KAFKA_GROUP_ID";

/// Protocol version assumed when none is configured.
pub const DEFAULT_KAFKA_VERSION: &str = "2.8.0";

/// Attempts made for a record before the producer gives up on it.
pub const PRODUCER_RETRIES: u32 = 10;

/// Upper bound for metadata requests.
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(30);

const CLIENT_ID_PREFIX: &str = "quorum";

/// Broker releases the client accepts as a protocol version.
const KNOWN_VERSIONS: &[&str] = &[
    "0.10.0.0", "0.10.0.1", "0.10.1.0", "0.10.1.1", "0.10.2.0", "0.10.2.1", "0.10.2.2",
    "0.11.0.0", "0.11.0.1", "0.11.0.2", "1.0.0", "1.0.1", "1.0.2", "1.1.0", "1.1.1", "2.0.0",
    "2.0.1", "2.1.0", "2.1.1", "2.2.0", "2.2.1", "2.2.2", "2.3.0", "2.3.1", "2.4.0", "2.4.1",
    "2.5.0", "2.5.1", "2.6.0", "2.6.1", "2.6.2", "2.7.0", "2.7.1", "2.8.0", "2.8.1", "2.8.2",
    "3.0.0", "3.0.1", "3.1.0", "3.1.1", "3.2.0", "3.2.1", "3.2.3", "3.3.1", "3.3.2", "3.4.0",
    "3.4.1", "3.5.0", "3.5.1", "3.6.0", "3.6.1", "3.7.0", "3.8.0",
];

/// A validated Kafka protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KafkaVersion(&'static str);

impl KafkaVersion {
    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl FromStr for KafkaVersion {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        KNOWN_VERSIONS
            .iter()
            .find(|known| **known == s)
            .map(|known| KafkaVersion(*known))
            .ok_or_else(|| BusError::UnknownVersion(s.to_string()))
    }
}

impl Default for KafkaVersion {
    fn default() -> Self {
        KafkaVersion(DEFAULT_KAFKA_VERSION)
    }
}

impl fmt::Display for KafkaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// SASL mechanisms recognized in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    /// SASL/PLAIN.
    Plain,
    /// SASL/SCRAM-SHA-512.
    Scram,
    /// Recognized but rejected at setup.
    OAuth2,
}

impl SaslMechanism {
    /// The librdkafka `sasl.mechanism` value, if the mechanism is usable.
    pub fn librdkafka_name(&self) -> BusResult<&'static str> {
        match self {
            SaslMechanism::Plain => Ok("PLAIN"),
            SaslMechanism::Scram => Ok("SCRAM-SHA-512"),
            SaslMechanism::OAuth2 => Err(BusError::UnsupportedMechanism(*self)),
        }
    }
}

impl FromStr for SaslMechanism {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PLAIN" => Ok(SaslMechanism::Plain),
            "SCRAM" => Ok(SaslMechanism::Scram),
            "OAUTH2" => Ok(SaslMechanism::OAuth2),
            _ => Err(()),
        }
    }
}

impl fmt::Display for SaslMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaslMechanism::Plain => write!(f, "PLAIN"),
            SaslMechanism::Scram => write!(f, "SCRAM"),
            SaslMechanism::OAuth2 => write!(f, "OAUTH2"),
        }
    }
}

/// Credentials for a SASL handshake over TLS.
#[derive(Clone, PartialEq, Eq)]
pub struct SaslCredentials {
    pub mechanism: SaslMechanism,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for SaslCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaslCredentials")
            .field("mechanism", &self.mechanism)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// SASL settings derived from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslAuthentication {
    Disabled,
    Enabled(SaslCredentials),
}

impl SaslAuthentication {
    /// Reads the SASL variables from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolves SASL settings through `lookup`.
    ///
    /// A missing or empty username or password, or an unrecognized mechanism,
    /// disables SASL regardless of the other values.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let (Some(username), Some(password)) =
            (non_empty(ENV_SASL_USERNAME), non_empty(ENV_SASL_PASSWORD))
        else {
            return SaslAuthentication::Disabled;
        };

        match non_empty(ENV_SASL_MECHANISM).and_then(|m| m.parse::<SaslMechanism>().ok()) {
            Some(mechanism) => SaslAuthentication::Enabled(SaslCredentials {
                mechanism,
                username,
                password,
            }),
            None => SaslAuthentication::Disabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, SaslAuthentication::Enabled(_))
    }

    pub fn mechanism(&self) -> Option<SaslMechanism> {
        match self {
            SaslAuthentication::Enabled(creds) => Some(creds.mechanism),
            SaslAuthentication::Disabled => None,
        }
    }
}

/// Transport security for a bus client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Security {
    #[default]
    Plaintext,
    SaslTls(SaslCredentials),
}

impl From<SaslAuthentication> for Security {
    fn from(auth: SaslAuthentication) -> Self {
        match auth {
            SaslAuthentication::Enabled(creds) => Security::SaslTls(creds),
            SaslAuthentication::Disabled => Security::Plaintext,
        }
    }
}

impl Security {
    /// Writes the security settings into a librdkafka configuration.
    ///
    /// Fails fast on a mechanism that cannot be used instead of downgrading
    /// to plaintext.
    pub fn apply(&self, config: &mut ClientConfig) -> BusResult<()> {
        match self {
            Security::Plaintext => {
                config.set("security.protocol", "plaintext");
            }
            Security::SaslTls(creds) => {
                let mechanism = creds.mechanism.librdkafka_name()?;
                config
                    .set("security.protocol", "sasl_ssl")
                    .set("sasl.mechanism", mechanism)
                    .set("sasl.username", &creds.username)
                    .set("sasl.password", &creds.password);
            }
        }
        Ok(())
    }
}

/// Client id shared by every client in this process: a fixed prefix plus a
/// suffix generated once at first use.
pub fn client_id(role: &str) -> String {
    static SUFFIX: OnceLock<String> = OnceLock::new();
    let suffix = SUFFIX.get_or_init(|| uuid::Uuid::new_v4().to_string());
    format!("{CLIENT_ID_PREFIX}-{role}-{suffix}")
}

/// Parses `KAFKA_BROKERS`-style input, dropping empty entries.
pub fn parse_brokers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn base_client_config(brokers: &[String], version: &str, security: &Security) -> BusResult<ClientConfig> {
    let version: KafkaVersion = version.parse()?;

    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", brokers.join(","))
        .set("api.version.request", "true")
        .set("broker.version.fallback", version.as_str());
    security.apply(&mut config)?;
    Ok(config)
}

/// Producer configuration.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Bootstrap servers. Empty disables messaging.
    pub brokers: Vec<String>,

    /// Broker protocol version.
    pub version: String,

    pub security: Security,

    /// Per-record retry budget.
    pub retries: u32,

    /// Upper bound for metadata requests.
    pub metadata_timeout: Duration,

    /// How long a synchronous send may wait for queue space and acknowledgment.
    pub send_timeout: Duration,

    /// Capacity of each delivery report channel.
    pub report_capacity: usize,
}

impl ProducerConfig {
    /// Plaintext configuration for `brokers`.
    pub fn new(brokers: Vec<String>) -> Self {
        Self {
            brokers,
            version: DEFAULT_KAFKA_VERSION.to_string(),
            security: Security::Plaintext,
            retries: PRODUCER_RETRIES,
            metadata_timeout: METADATA_TIMEOUT,
            send_timeout: Duration::from_secs(30),
            report_capacity: 256,
        }
    }

    /// Configuration with brokers, version and SASL taken from the environment.
    pub fn from_env() -> Self {
        let brokers = parse_brokers(&std::env::var(ENV_BROKERS).unwrap_or_default());
        let mut config = Self::new(brokers).with_security(SaslAuthentication::from_env().into());
        if let Ok(version) = std::env::var(ENV_VERSION) {
            config.version = version;
        }
        config
    }

    pub fn with_security(mut self, security: Security) -> Self {
        self.security = security;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Returns false when no brokers are configured.
    pub fn is_enabled(&self) -> bool {
        !self.brokers.is_empty()
    }

    /// Builds the librdkafka producer configuration.
    pub fn client_config(&self) -> BusResult<ClientConfig> {
        let mut config = base_client_config(&self.brokers, &self.version, &self.security)?;
        config
            .set("client.id", client_id("producer"))
            .set("acks", "all")
            .set("retries", self.retries.to_string())
            // Hash of the key; records without a key are spread randomly.
            .set("partitioner", "murmur2_random")
            // librdkafka bounds metadata requests by the socket timeout.
            .set("socket.timeout.ms", self.metadata_timeout.as_millis().to_string())
            .set("message.timeout.ms", self.send_timeout.as_millis().to_string());
        Ok(config)
    }
}

/// Consumer group configuration.
#[derive(Debug, Clone)]
pub struct ConsumerGroupConfig {
    pub brokers: Vec<String>,
    pub topics: Vec<String>,
    pub group_id: String,
    pub version: String,
    pub security: Security,

    /// Pause between a failed consume session and the next attempt.
    pub retry_backoff: Duration,
}

impl ConsumerGroupConfig {
    /// Plaintext configuration.
    pub fn new(brokers: Vec<String>, topics: Vec<String>, group_id: impl Into<String>) -> Self {
        Self {
            brokers,
            topics,
            group_id: group_id.into(),
            version: DEFAULT_KAFKA_VERSION.to_string(),
            security: Security::Plaintext,
            retry_backoff: Duration::from_secs(1),
        }
    }

    /// Configuration with brokers, version and SASL taken from the environment.
    ///
    /// `group_id` falls back to `KAFKA_GROUP_ID` and must be non-empty.
    pub fn from_env(topics: Vec<String>, group_id: Option<String>) -> BusResult<Self> {
        let group_id = group_id
            .or_else(|| std::env::var(ENV_GROUP_ID).ok())
            .filter(|g| !g.trim().is_empty())
            .ok_or(BusError::MissingGroupId)?;
        let brokers = parse_brokers(&std::env::var(ENV_BROKERS).unwrap_or_default());

        let mut config = Self::new(brokers, topics, group_id)
            .with_security(SaslAuthentication::from_env().into());
        if let Ok(version) = std::env::var(ENV_VERSION) {
            config.version = version;
        }
        Ok(config)
    }

    pub fn with_security(mut self, security: Security) -> Self {
        self.security = security;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Builds the librdkafka consumer configuration.
    ///
    /// Offsets are stored only after a record has been handed to the worker and
    /// committed in the background.
    pub fn client_config(&self) -> BusResult<ClientConfig> {
        if self.group_id.trim().is_empty() {
            return Err(BusError::MissingGroupId);
        }

        let mut config = base_client_config(&self.brokers, &self.version, &self.security)?;
        config
            .set("client.id", client_id("consumer"))
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false");
        Ok(config)
    }
}

/// Watcher configuration: a single plaintext client for ad hoc tailing.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub brokers: Vec<String>,
    pub topics: Vec<String>,
    pub group: String,
    pub security: Security,
}

impl WatcherConfig {
    pub fn new(brokers: Vec<String>, topics: Vec<String>, group: impl Into<String>) -> Self {
        Self {
            brokers,
            topics,
            group: group.into(),
            security: Security::Plaintext,
        }
    }

    pub fn with_security(mut self, security: Security) -> Self {
        self.security = security;
        self
    }

    pub fn client_config(&self) -> BusResult<ClientConfig> {
        if self.group.trim().is_empty() {
            return Err(BusError::MissingGroupId);
        }

        let mut config = base_client_config(&self.brokers, DEFAULT_KAFKA_VERSION, &self.security)?;
        config
            .set("client.id", client_id("watcher"))
            .set("group.id", &self.group)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "latest");
        Ok(config)
    }
}
