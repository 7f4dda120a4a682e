// Local crates
use crate::broker::{
    address::BrokerAddress,
    error::BrokerError,
    session::{ReconnectPolicy, SessionOptions},
};
use crate::cli::cli::RunArgs;
use crate::logger::{
    facility::{DEFAULT_FACILITY, facility_from_name},
    logger::LoggerError,
};
use crate::pool::worker_pool::{OverflowPolicy, QueueLimits};

// External crates
use anyhow::{Context, Result};
use rumqttc::QoS;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;
use syslog::Facility;
use thiserror::Error;
use tracing::instrument;

/// Topic filter subscribed when none is configured: everything.
pub const DEFAULT_TOPIC: &str = "#";
/// Name the process logs under.
pub const DEFAULT_IDENT: &str = "mqtt-logger";

/// Invalid or incomplete settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No broker address from the command line, environment or file.
    #[error("no broker given, use --broker, $BROKER or [broker].address")]
    MissingBroker,
    /// Broker address did not parse.
    #[error(transparent)]
    Broker(#[from] BrokerError),
    /// Facility name is not in the lookup table.
    #[error(transparent)]
    Facility(#[from] LoggerError),
    /// A value is out of range.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Dotted name of the offending key.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// `[broker]` table.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    /// Broker address, same forms as `--broker`.
    pub address: Option<String>,
    /// Topic filter, `#` when absent.
    pub topic: Option<String>,
    /// Subscription QoS, 0 to 2.
    pub qos: Option<u8>,
    /// MQTT client identifier; a random `mqtt-logger-*` id when absent.
    pub client_id: Option<String>,
    /// Keep-alive interval, at least 5.
    pub keep_alive_secs: Option<u64>,
    /// Bound on the initial connect.
    pub connect_timeout_secs: Option<u64>,
    /// Bound on the disconnect at shutdown.
    pub disconnect_timeout_secs: Option<u64>,
    /// Discard broker-side session state on connect.
    pub clean_session: Option<bool>,
    /// First reconnect delay.
    pub reconnect_min_secs: Option<u64>,
    /// Largest reconnect delay.
    pub reconnect_max_secs: Option<u64>,
    /// Capacity of the client request channel.
    pub request_capacity: Option<usize>,
}

/// `[pool]` table.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Number of executors.
    pub workers: Option<usize>,
    /// Queue bound; unbounded when absent.
    pub max_queue_depth: Option<usize>,
    /// What a full queue does to new messages.
    pub overflow_policy: Option<OverflowPolicy>,
}

/// `[logging]` table.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Syslog facility name.
    pub facility: Option<String>,
    /// Mirror log lines to stderr.
    pub log_to_stderr: Option<bool>,
    /// Process name in syslog records.
    pub ident: Option<String>,
}

/// `[metrics]` table.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    /// Listen address of the `/metrics` endpoint.
    pub address: Option<SocketAddr>,
}

/// Optional TOML configuration file. Every key may be omitted.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// `[broker]`
    pub broker: BrokerConfig,
    /// `[pool]`
    pub pool: PoolConfig,
    /// `[logging]`
    pub logging: LoggingConfig,
    /// `[metrics]`
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load and parse the configuration file
    #[instrument(
        name = "config_loader",
        target = "helpers::load_config",
        level = "trace",
        skip_all
    )]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();

        tracing::trace!(
            configuration_file_path = %path_ref.display(),
            "Loading mqtt-logger configuration file"
        );

        let config_str = match fs::read_to_string(path_ref) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read configuration file");
                return Err(e)
                    .with_context(|| format!("Failed to read config file at {:?}", path_ref));
            }
        };
        let config: Config = match toml::from_str(&config_str) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::error!(error = %e, "Failed to parse TOML configuration");
                return Err(e)
                    .with_context(|| format!("Failed to parse TOML from {:?}", path_ref));
            }
        };

        tracing::trace!(configuration_file_path = %path_ref.display(), "Configuration file loaded successfully");
        Ok(config)
    }

    /// Check the values that can be checked without the command line.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(address) = &self.broker.address {
            address.parse::<BrokerAddress>()?;
        }
        if let Some(qos) = self.broker.qos {
            qos_from_level(qos)?;
        }
        if let Some(facility) = &self.logging.facility {
            facility_from_name(facility)?;
        }
        if self.pool.workers == Some(0) {
            return Err(invalid("pool.workers", "must be at least 1"));
        }
        if self.pool.max_queue_depth == Some(0) {
            return Err(invalid("pool.max_queue_depth", "must be at least 1"));
        }
        if let Some(secs) = self.broker.keep_alive_secs {
            keep_alive(secs)?;
        }
        Ok(())
    }
}

fn qos_from_level(level: u8) -> Result<QoS, ConfigError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(invalid("qos", format!("{other} is not one of 0, 1, 2"))),
    }
}

fn keep_alive(secs: u64) -> Result<Duration, ConfigError> {
    if secs < 5 {
        return Err(invalid(
            "broker.keep_alive_secs",
            "the MQTT client requires at least 5 seconds",
        ));
    }
    Ok(Duration::from_secs(secs))
}

fn positive_secs(field: &'static str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(invalid(field, "must be at least 1 second"));
    }
    Ok(Duration::from_secs(secs))
}

fn default_workers() -> NonZeroUsize {
    std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN)
}

fn default_client_id() -> String {
    format!("{DEFAULT_IDENT}-{:08x}", rand::random::<u32>())
}

/// Fully resolved runtime settings.
///
/// Precedence per value: command line, then environment (both handled by
/// clap), then the configuration file, then the built-in default.
#[derive(Debug, Clone)]
pub struct Settings {
    /// MQTT connection parameters.
    pub session: SessionOptions,
    /// Topic filter to subscribe after each connect.
    pub topic: String,
    /// QoS requested for the subscription.
    pub qos: QoS,
    /// Syslog facility.
    pub facility: Facility,
    /// Mirror log lines to stderr.
    pub log_to_stderr: bool,
    /// Process name used in syslog records.
    pub ident: String,
    /// Number of pool executors.
    pub workers: NonZeroUsize,
    /// Bound of the task queue.
    pub queue: QueueLimits,
    /// Where to serve `/metrics`, if anywhere.
    pub metrics_addr: Option<SocketAddr>,
}

impl Settings {
    /// Merge command line/environment values over `file`.
    pub fn resolve(args: &RunArgs, file: &Config) -> Result<Self, ConfigError> {
        file.validate()?;

        let address = args
            .broker
            .as_deref()
            .or(file.broker.address.as_deref())
            .ok_or(ConfigError::MissingBroker)?
            .parse::<BrokerAddress>()?;

        let topic = args
            .topic
            .clone()
            .or_else(|| file.broker.topic.clone())
            .unwrap_or_else(|| DEFAULT_TOPIC.to_string());
        if topic.is_empty() {
            return Err(invalid("topic", "must not be empty"));
        }

        let qos = qos_from_level(args.qos.or(file.broker.qos).unwrap_or(0))?;

        let facility_name = args
            .facility
            .as_deref()
            .or(file.logging.facility.as_deref())
            .unwrap_or(DEFAULT_FACILITY);
        let facility = facility_from_name(facility_name)?;

        let log_to_stderr = !args.no_log_to_stderr && file.logging.log_to_stderr.unwrap_or(true);

        let workers = match args.workers {
            Some(workers) => workers,
            None => match file.pool.workers {
                Some(n) => NonZeroUsize::new(n)
                    .ok_or_else(|| invalid("pool.workers", "must be at least 1"))?,
                None => default_workers(),
            },
        };

        let queue = match file.pool.max_queue_depth.and_then(NonZeroUsize::new) {
            Some(depth) => {
                QueueLimits::bounded(depth, file.pool.overflow_policy.unwrap_or_default())
            }
            None => QueueLimits::unbounded(),
        };

        let broker = &file.broker;
        let reconnect = ReconnectPolicy {
            min: positive_secs("broker.reconnect_min_secs", broker.reconnect_min_secs.unwrap_or(1))?,
            max: positive_secs("broker.reconnect_max_secs", broker.reconnect_max_secs.unwrap_or(2))?,
        };
        if reconnect.max < reconnect.min {
            return Err(invalid(
                "broker.reconnect_max_secs",
                "must not be smaller than reconnect_min_secs",
            ));
        }

        let session = SessionOptions {
            address,
            client_id: broker.client_id.clone().unwrap_or_else(default_client_id),
            username: args.username.clone().filter(|u| !u.is_empty()),
            password: args.password.clone().filter(|p| !p.is_empty()),
            keep_alive: keep_alive(broker.keep_alive_secs.unwrap_or(5))?,
            clean_session: broker.clean_session.unwrap_or(true),
            connect_timeout: positive_secs(
                "broker.connect_timeout_secs",
                broker.connect_timeout_secs.unwrap_or(30),
            )?,
            disconnect_timeout: positive_secs(
                "broker.disconnect_timeout_secs",
                broker.disconnect_timeout_secs.unwrap_or(10),
            )?,
            reconnect,
            request_capacity: broker.request_capacity.unwrap_or(65_536).max(1),
        };

        Ok(Self {
            session,
            topic,
            qos,
            facility,
            log_to_stderr,
            ident: file
                .logging
                .ident
                .clone()
                .unwrap_or_else(|| DEFAULT_IDENT.to_string()),
            workers,
            queue,
            metrics_addr: args.metrics_addr.or(file.metrics.address),
        })
    }
}
