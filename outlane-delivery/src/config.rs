//! Zone and engine configuration
//!
//! Everything here is loaded once and then shared read-only by every worker
//! of a lane.

use std::{fmt, net::IpAddr, str::FromStr, time::Duration};

use outlane_smtp::Mechanism;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid throttling rate '{0}', expected '<N> messages/<second|minute|hour>'")]
    InvalidRate(String),

    #[error("Zone name must not be empty")]
    EmptyZoneName,

    #[error("Zone '{0}' has an empty address pool")]
    EmptyPool(String),

    #[error("Zone '{0}' must run at least one connection")]
    NoConnections(String),
}

/// One local address a zone may send from, and the name it announces in EHLO.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolAddress {
    pub address: IpAddr,
    pub name: String,
}

impl PoolAddress {
    #[must_use]
    pub fn new(address: IpAddr, name: impl Into<String>) -> Self {
        Self {
            address,
            name: name.into(),
        }
    }
}

/// Credentials for a smart host.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub user: String,
    pub pass: String,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("user", &self.user)
            .field("pass", &"********")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interval {
    Second,
    Minute,
    Hour,
}

impl Interval {
    #[must_use]
    pub const fn duration(self) -> Duration {
        match self {
            Self::Second => Duration::from_secs(1),
            Self::Minute => Duration::from_secs(60),
            Self::Hour => Duration::from_secs(3600),
        }
    }
}

/// A throttling rate such as `"100 messages/second"`.
///
/// A rate without a unit (`"100 messages"`) is per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Throttle {
    pub messages: u32,
    pub per: Interval,
}

impl Throttle {
    /// Minimum spacing between two admitted attempts.
    #[must_use]
    pub fn spacing(&self) -> Duration {
        self.per.duration() / self.messages
    }

    /// Admissions per second.
    #[must_use]
    pub fn per_second(&self) -> f64 {
        f64::from(self.messages) / self.per.duration().as_secs_f64()
    }
}

impl FromStr for Throttle {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidRate(value.to_string());

        let (amount, unit) = value
            .split_once('/')
            .map_or((value, None), |(amount, unit)| (amount, Some(unit.trim())));

        let mut words = amount.split_whitespace();
        let messages = words
            .next()
            .and_then(|count| count.parse::<u32>().ok())
            .filter(|count| *count > 0)
            .ok_or_else(invalid)?;

        match words.next() {
            None | Some("message" | "messages") => {}
            Some(_) => return Err(invalid()),
        }
        if words.next().is_some() {
            return Err(invalid());
        }

        let per = match unit.map(str::to_ascii_lowercase).as_deref() {
            None | Some("s" | "sec" | "second" | "seconds") => Interval::Second,
            Some("m" | "min" | "minute" | "minutes") => Interval::Minute,
            Some("h" | "hour" | "hours") => Interval::Hour,
            Some(_) => return Err(invalid()),
        };

        Ok(Self { messages, per })
    }
}

impl TryFrom<String> for Throttle {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Throttle> for String {
    fn from(throttle: Throttle) -> Self {
        throttle.to_string()
    }
}

impl fmt::Display for Throttle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self.per {
            Interval::Second => "second",
            Interval::Minute => "minute",
            Interval::Hour => "hour",
        };
        write!(f, "{} messages/{unit}", self.messages)
    }
}

/// SMTP operation timeout configuration
///
/// Every network step of a delivery is bounded by one of these, so a stalled
/// peer surfaces as an ordinary connection failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpTimeouts {
    /// Timeout for establishing the TCP connection (and implicit TLS)
    ///
    /// Default: 30 seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_secs: u64,

    /// Timeout for the server greeting
    ///
    /// Default: 30 seconds
    #[serde(default = "default_greeting_timeout")]
    pub greeting_secs: u64,

    /// Timeout for EHLO/HELO commands
    ///
    /// Default: 30 seconds
    #[serde(default = "default_ehlo_timeout")]
    pub ehlo_secs: u64,

    /// Timeout for STARTTLS command and TLS upgrade
    ///
    /// Default: 30 seconds
    #[serde(default = "default_starttls_timeout")]
    pub starttls_secs: u64,

    /// Timeout for AUTH against a smart host
    ///
    /// Default: 30 seconds
    #[serde(default = "default_auth_timeout")]
    pub auth_secs: u64,

    /// Timeout for MAIL FROM command
    ///
    /// Default: 30 seconds
    #[serde(default = "default_mail_from_timeout")]
    pub mail_from_secs: u64,

    /// Timeout for RCPT TO command
    ///
    /// Default: 30 seconds
    #[serde(default = "default_rcpt_to_timeout")]
    pub rcpt_to_secs: u64,

    /// Timeout for DATA command and message transmission
    ///
    /// This is longer than other timeouts to accommodate large messages.
    /// Default: 120 seconds (2 minutes)
    #[serde(default = "default_data_timeout")]
    pub data_secs: u64,

    /// Timeout for QUIT command
    ///
    /// Default: 10 seconds
    #[serde(default = "default_quit_timeout")]
    pub quit_secs: u64,
}

impl Default for SmtpTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_timeout(),
            greeting_secs: default_greeting_timeout(),
            ehlo_secs: default_ehlo_timeout(),
            starttls_secs: default_starttls_timeout(),
            auth_secs: default_auth_timeout(),
            mail_from_secs: default_mail_from_timeout(),
            rcpt_to_secs: default_rcpt_to_timeout(),
            data_secs: default_data_timeout(),
            quit_secs: default_quit_timeout(),
        }
    }
}

const fn default_connect_timeout() -> u64 {
    30
}

const fn default_greeting_timeout() -> u64 {
    30
}

const fn default_ehlo_timeout() -> u64 {
    30
}

const fn default_starttls_timeout() -> u64 {
    30
}

const fn default_auth_timeout() -> u64 {
    30
}

const fn default_mail_from_timeout() -> u64 {
    30
}

const fn default_rcpt_to_timeout() -> u64 {
    30
}

const fn default_data_timeout() -> u64 {
    120
}

const fn default_quit_timeout() -> u64 {
    10
}

/// Configuration for one sending zone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    /// Filled in from the key the zone is configured under
    #[serde(skip)]
    pub name: String,

    /// Relay everything through this host instead of the recipient's MX
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Try IPv6 addresses before IPv4 ones
    #[serde(default)]
    pub prefer_ipv6: bool,

    /// Never connect over IPv6
    #[serde(default)]
    pub ignore_ipv6: bool,

    /// Implicit TLS from the first byte (e.g. port 465)
    #[serde(default)]
    pub secure: bool,

    #[serde(default)]
    pub auth_method: Mechanism,

    #[serde(default)]
    pub auth: Option<AuthConfig>,

    #[serde(default)]
    pub throttling: Option<Throttle>,

    /// Number of concurrent workers for this zone
    #[serde(default = "default_connections")]
    pub connections: usize,

    #[serde(default = "default_pool")]
    pub pool: Vec<PoolAddress>,

    /// Overrides the engine-wide SMTP transcript setting
    #[serde(default)]
    pub logger: Option<bool>,
}

const fn default_port() -> u16 {
    25
}

const fn default_connections() -> usize {
    5
}

fn default_pool() -> Vec<PoolAddress> {
    let name = outlane_common::hostname::local();
    vec![
        PoolAddress::new(IpAddr::from([0, 0, 0, 0]), name),
        PoolAddress::new(IpAddr::from([0u16; 8]), name),
    ]
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            name: String::from("default"),
            host: None,
            port: default_port(),
            prefer_ipv6: false,
            ignore_ipv6: false,
            secure: false,
            auth_method: Mechanism::default(),
            auth: None,
            throttling: None,
            connections: default_connections(),
            pool: default_pool(),
            logger: None,
        }
    }
}

impl ZoneConfig {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Whether SMTP transcripts are logged for this zone.
    #[must_use]
    pub fn transcript(&self, default: bool) -> bool {
        self.logger.unwrap_or(default)
    }

    /// Checks the invariants serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns an error for an unnamed zone, an empty pool, or zero connections.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyZoneName);
        }
        if self.pool.is_empty() {
            return Err(ConfigError::EmptyPool(self.name.clone()));
        }
        if self.connections == 0 {
            return Err(ConfigError::NoConnections(self.name.clone()));
        }
        Ok(())
    }
}

/// Sender of bounce notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailerDaemon {
    #[serde(default = "default_daemon_name")]
    pub name: String,
    #[serde(default = "default_daemon_address")]
    pub address: String,
}

fn default_daemon_name() -> String {
    String::from("Mail Delivery Subsystem")
}

fn default_daemon_address() -> String {
    format!("mailer-daemon@{}", outlane_common::hostname::local())
}

impl Default for MailerDaemon {
    fn default() -> Self {
        Self {
            name: default_daemon_name(),
            address: default_daemon_address(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BounceConfig {
    #[serde(default = "default_bounces_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub mailer_daemon: MailerDaemon,

    /// Zone the notification is sent through, reported in `X-Sending-Zone`
    #[serde(default = "default_sending_zone")]
    pub sending_zone: String,
}

const fn default_bounces_enabled() -> bool {
    true
}

fn default_sending_zone() -> String {
    String::from("bounces")
}

impl Default for BounceConfig {
    fn default() -> Self {
        Self {
            enabled: default_bounces_enabled(),
            mailer_daemon: MailerDaemon::default(),
            sending_zone: default_sending_zone(),
        }
    }
}

/// Engine-wide settings shared by every zone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Name of this MTA, used in Received headers
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Product name used in Received headers
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Log SMTP transcripts for zones that do not say otherwise
    #[serde(default)]
    pub log_mx: bool,

    #[serde(default)]
    pub timeouts: SmtpTimeouts,

    #[serde(default)]
    pub bounces: BounceConfig,
}

fn default_hostname() -> String {
    outlane_common::hostname::local().to_string()
}

fn default_app_name() -> String {
    String::from("Outlane")
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            app_name: default_app_name(),
            log_mx: false,
            timeouts: SmtpTimeouts::default(),
            bounces: BounceConfig::default(),
        }
    }
}
