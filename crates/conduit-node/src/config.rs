//! Node configuration.
//!
//! Loaded from a TOML file; every field has a default so an empty file (or
//! no file) yields a working in-memory node.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use conduit_core::{
    Capability, ConduitError, HandlerEndpoint, OwnerId, Quantity, StatePrecedence, TargetId,
};
use conduit_handler::HandlerRole;
use conduit_router::{DispatchConfig, ResolverConfig};
use serde::{Deserialize, Serialize};

use crate::aggregator::AggregatorConfig;

/// Main node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address the API listens on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Default log filter, overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub resolver: ResolverConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub aggregator: AggregatorConfig,

    /// Worst-first ordering used to aggregate sub-intent states.
    #[serde(default)]
    pub precedence: StatePrecedence,

    #[serde(default)]
    pub twin: TwinSettings,

    /// Report intake URL per owner.
    #[serde(default)]
    pub owners: HashMap<OwnerId, String>,

    /// Intake for owners without an entry in `owners`.
    #[serde(default)]
    pub default_owner_url: Option<String>,

    /// Endpoints registered into the twin store at startup.
    #[serde(default)]
    pub endpoints: Vec<HandlerEndpoint>,

    #[serde(default)]
    pub handler: HandlerSettings,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3000))
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            log_level: default_log_level(),
            resolver: ResolverConfig::default(),
            dispatch: DispatchConfig::default(),
            aggregator: AggregatorConfig::default(),
            precedence: StatePrecedence::default(),
            twin: TwinSettings::default(),
            owners: HashMap::new(),
            default_owner_url: None,
            endpoints: Vec::new(),
            handler: HandlerSettings::default(),
        }
    }
}

/// Which twin store to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TwinKind {
    /// Process-local store; lost on restart.
    #[default]
    Memory,
    /// Remote store reached over HTTP.
    Http,
}

/// Twin store settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TwinSettings {
    #[serde(default)]
    pub kind: TwinKind,

    /// Base URL, required for `http`.
    #[serde(default)]
    pub url: Option<String>,
}

/// Settings for the reference handler hosted by the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Target served by the hosted handler.
    #[serde(default = "default_handler_target")]
    pub target: TargetId,

    #[serde(default = "default_capability")]
    pub capability: Capability,

    #[serde(default)]
    pub role: HandlerRole,

    /// Address advertised in the twin store. Defaults to the listen address.
    #[serde(default)]
    pub address: Option<String>,

    /// Downstream handler address, required for the forwarding role.
    #[serde(default)]
    pub downstream: Option<String>,

    /// Pause between `received` and realization.
    #[serde(default)]
    pub progress_delay_ms: u64,

    /// Metric samples the hosted handler reports.
    #[serde(default)]
    pub samples: HashMap<String, Quantity>,
}

fn default_handler_target() -> TargetId {
    TargetId::new("local")
}
fn default_capability() -> Capability {
    Capability::Both
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            target: default_handler_target(),
            capability: default_capability(),
            role: HandlerRole::default(),
            address: None,
            downstream: None,
            progress_delay_ms: 0,
            samples: HashMap::new(),
        }
    }
}

impl NodeConfig {
    /// Load from a TOML file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConduitError> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    ConduitError::Config(format!("cannot read {}: {}", path.display(), e))
                })?;
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConduitError> {
        toml::from_str(text).map_err(|e| ConduitError::Config(e.to_string()))
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConduitError> {
        for policy in [
            &self.resolver.retry,
            &self.dispatch.retry,
            &self.aggregator.sink_retry,
        ] {
            policy.validate()?;
        }
        if self.dispatch.timeout_ms == 0 || self.resolver.timeout_ms == 0 {
            return Err(ConduitError::Config("timeouts must be positive".to_string()));
        }
        if self.aggregator.queue_capacity == 0 {
            return Err(ConduitError::Config(
                "aggregator queue capacity must be positive".to_string(),
            ));
        }
        if self.twin.kind == TwinKind::Http && self.twin.url.is_none() {
            return Err(ConduitError::Config(
                "twin.url is required for an http twin store".to_string(),
            ));
        }
        if self.handler.enabled
            && self.handler.role == HandlerRole::Forwarding
            && self.handler.downstream.is_none()
        {
            return Err(ConduitError::Config(
                "handler.downstream is required for a forwarding handler".to_string(),
            ));
        }
        Ok(())
    }

    /// Address the hosted handler advertises.
    pub fn handler_address(&self) -> String {
        self.handler
            .address
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.listen))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::LifecycleState;

    #[test]
    fn test_empty_config_is_valid() {
        let config = NodeConfig::from_toml("").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen.port(), 3000);
        assert_eq!(config.twin.kind, TwinKind::Memory);
        assert!(!config.handler.enabled);
    }

    #[test]
    fn test_full_config() {
        let config = NodeConfig::from_toml(
            r#"
            listen = "127.0.0.1:4000"
            log_level = "debug"
            precedence = ["degraded", "received", "finalizing", "compliant"]
            default_owner_url = "http://owner/reports"

            [resolver]
            ttl_secs = 30
            retry = { max_attempts = 2 }

            [aggregator]
            reorder_window_ms = 50
            sink_retry = { max_attempts = 0, max_delay_ms = 10000 }

            [owners]
            ops = "http://ops/reports"

            [[endpoints]]
            target = "EC21"
            address = "http://ec21:3000"
            capability = "workload"

            [handler]
            enabled = true
            target = "EC21"
            capability = "workload"
            samples = { "p99-latency" = 12.5 }
            "#,
        )
        .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.resolver.ttl_secs, 30);
        assert_eq!(config.resolver.retry.max_attempts, 2);
        assert!(!config.aggregator.sink_retry.is_exhausted(1_000));
        assert_eq!(config.endpoints[0].capability, Capability::Workload);
        assert_eq!(config.owners[&OwnerId::new("ops")], "http://ops/reports");
        assert_eq!(
            config.precedence.reduce([LifecycleState::Received, LifecycleState::Finalizing]),
            Some(LifecycleState::Received)
        );
        assert_eq!(config.handler_address(), "http://127.0.0.1:4000");
    }

    #[test]
    fn test_invalid_configs() {
        assert!(NodeConfig::from_toml(r#"precedence = ["degraded"]"#).is_err());

        let http_without_url = NodeConfig::from_toml("[twin]\nkind = \"http\"").unwrap();
        assert!(http_without_url.validate().is_err());

        let forwarding = NodeConfig::from_toml(
            "[handler]\nenabled = true\nrole = \"forwarding\"",
        )
        .unwrap();
        assert!(forwarding.validate().is_err());

        let bad_retry = NodeConfig::from_toml("[dispatch]\nretry = { multiplier = 0.5 }").unwrap();
        assert!(bad_retry.validate().is_err());
    }
}
