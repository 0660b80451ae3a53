// Greeter is open-source under the Apache License 2.0; see LICENSE for usage and contributions.
// Process configuration: TOML file or environment, resolved into immutable per-transport settings.

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ServerError;

pub const DEFAULT_NETWORK: &str = "tcp";
pub const DEFAULT_HTTP_ADDR: &str = ":8000";
pub const DEFAULT_GRPC_ADDR: &str = ":9000";
pub const DEFAULT_METRICS_ADDR: &str = ":8080";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_METRICS_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
pub const DEFAULT_METRICS_NAMESPACE: &str = "default";

const SUPPORTED_NETWORKS: [&str; 3] = ["tcp", "tcp4", "tcp6"];

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub version: String,
    pub server: ServerSection,
    pub metrics: Option<MetricsSection>,
    pub log: LogConfig,
    pub shutdown: ShutdownSection,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service_name: "greeter".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            server: ServerSection::default(),
            metrics: None,
            log: LogConfig::default(),
            shutdown: ShutdownSection::default(),
        }
    }
}

/// Optional transport blocks; an absent block disables that transport.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub http: Option<TransportSection>,
    pub grpc: Option<TransportSection>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportSection {
    pub network: Option<String>,
    pub addr: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsSection {
    pub addr: Option<String>,
    pub disable: bool,
    pub namespace: Option<String>,
    pub subsystem: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShutdownSection {
    pub grace_ms: Option<u64>,
}

/// Resolved settings for one transport. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    network: String,
    address: String,
    timeout: Duration,
}

impl ServerConfig {
    pub fn new(
        network: impl Into<String>,
        address: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ServerError> {
        let network = network.into();
        let address = address.into();

        if !SUPPORTED_NETWORKS.contains(&network.as_str()) {
            return Err(ServerError::config(format!(
                "unsupported network {network:?} (expected one of tcp, tcp4, tcp6)"
            )));
        }
        if address.trim().is_empty() {
            return Err(ServerError::config("listen address must not be empty"));
        }
        let has_port = address
            .rsplit_once(':')
            .is_some_and(|(_, port)| port.parse::<u16>().is_ok());
        if !has_port {
            return Err(ServerError::config(format!(
                "listen address {address:?} is missing a port"
            )));
        }
        if timeout.is_zero() {
            return Err(ServerError::config(format!(
                "timeout for {address} must be greater than zero"
            )));
        }

        Ok(Self {
            network,
            address,
            timeout,
        })
    }

    /// Applies defaults for absent or empty fields, then validates.
    pub fn from_section(
        section: &TransportSection,
        default_address: &str,
        default_timeout: Duration,
    ) -> Result<Self, ServerError> {
        let network = non_empty(section.network.as_deref()).unwrap_or(DEFAULT_NETWORK);
        let address = non_empty(section.addr.as_deref()).unwrap_or(default_address);
        let timeout = section
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(default_timeout);

        Self::new(network, address, timeout)
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl AppConfig {
    /// Reads `path` when given, otherwise falls back to the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ServerError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Self::from_env(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ServerError> {
        let raw = fs::read_to_string(path).map_err(|err| {
            ServerError::config(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ServerError> {
        let cfg: Self = toml::from_str(raw)
            .map_err(|err| ServerError::config(format!("invalid configuration: {err}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self, ServerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from `KEY -> value` lookups. Both transports
    /// are enabled unless `HTTP_DISABLE` / `GRPC_DISABLE` is set.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ServerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(name) = lookup("SERVICE_NAME") {
            cfg.service_name = name;
        }
        if let Some(version) = lookup("SERVICE_VERSION") {
            cfg.version = version;
        }

        if !parse_flag(&lookup, "HTTP_DISABLE")? {
            cfg.server.http = Some(transport_from_lookup(&lookup, "HTTP")?);
        }
        if !parse_flag(&lookup, "GRPC_DISABLE")? {
            cfg.server.grpc = Some(transport_from_lookup(&lookup, "GRPC")?);
        }

        cfg.metrics = Some(MetricsSection {
            addr: lookup("METRICS_ADDR"),
            disable: parse_flag(&lookup, "METRICS_DISABLE")?,
            namespace: lookup("METRICS_NAMESPACE"),
            subsystem: lookup("METRICS_SUBSYSTEM"),
        });

        if let Some(level) = lookup("LOG_LEVEL") {
            cfg.log.level = level;
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            cfg.log.format = match format.to_ascii_lowercase().as_str() {
                "text" => LogFormat::Text,
                "json" => LogFormat::Json,
                other => {
                    return Err(ServerError::config(format!(
                        "invalid LOG_FORMAT {other:?} (expected text or json)"
                    )))
                }
            };
        }
        cfg.shutdown.grace_ms = parse_millis(&lookup, "SHUTDOWN_GRACE_MS")?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Resolves every enabled transport so bad settings fail before startup.
    pub fn validate(&self) -> Result<(), ServerError> {
        self.http_server()?;
        self.grpc_server()?;
        self.metrics_server()?;
        Ok(())
    }

    pub fn http_server(&self) -> Result<Option<ServerConfig>, ServerError> {
        self.server
            .http
            .as_ref()
            .map(|section| ServerConfig::from_section(section, DEFAULT_HTTP_ADDR, DEFAULT_TIMEOUT))
            .transpose()
    }

    pub fn grpc_server(&self) -> Result<Option<ServerConfig>, ServerError> {
        self.server
            .grpc
            .as_ref()
            .map(|section| ServerConfig::from_section(section, DEFAULT_GRPC_ADDR, DEFAULT_TIMEOUT))
            .transpose()
    }

    /// The scrape endpoint; `None` when the block is absent or disabled.
    pub fn metrics_server(&self) -> Result<Option<ServerConfig>, ServerError> {
        match &self.metrics {
            Some(metrics) if !metrics.disable => {
                let address = non_empty(metrics.addr.as_deref()).unwrap_or(DEFAULT_METRICS_ADDR);
                ServerConfig::new(DEFAULT_NETWORK, address, DEFAULT_METRICS_TIMEOUT).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Namespace and subsystem for the request metric families.
    pub fn metrics_names(&self) -> (String, String) {
        let section = self.metrics.as_ref();
        let namespace = section
            .and_then(|m| non_empty(m.namespace.as_deref()))
            .unwrap_or(DEFAULT_METRICS_NAMESPACE);
        let subsystem = section
            .and_then(|m| non_empty(m.subsystem.as_deref()))
            .unwrap_or_default();
        (namespace.to_string(), subsystem.to_string())
    }

    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown
            .grace_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_SHUTDOWN_GRACE)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn transport_from_lookup<F>(lookup: &F, prefix: &str) -> Result<TransportSection, ServerError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(TransportSection {
        network: lookup(&format!("{prefix}_NETWORK")),
        addr: lookup(&format!("{prefix}_ADDR")),
        timeout_ms: parse_millis(lookup, &format!("{prefix}_TIMEOUT_MS"))?,
    })
}

fn parse_millis<F>(lookup: &F, key: &str) -> Result<Option<u64>, ServerError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map_err(|err| ServerError::config(format!("invalid {key} {raw:?}: {err}")))
        })
        .transpose()
}

fn parse_flag<F>(lookup: &F, key: &str) -> Result<bool, ServerError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|raw| raw.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(raw) => match raw.as_str() {
            "" | "0" | "false" | "no" => Ok(false),
            "1" | "true" | "yes" => Ok(true),
            _ => Err(ServerError::config(format!("invalid {key} {raw:?}"))),
        },
    }
}
