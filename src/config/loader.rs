//! Configuration Loader
//!
//! Layers, lowest to highest precedence:
//!
//! 1. compiled defaults ([`LanesConfig::default`])
//! 2. an optional TOML file (explicit path or `TASKER_LANES_CONFIG`)
//! 3. `TASKER_LANES_<SECTION>__<KEY>` environment variables
//! 4. the broker/worker variables used by existing deployments
//!    (`RABBITMQ_HOST`, `WORKER_PREFETCH_COUNT`, ...)
//!
//! Tables merge key by key across layers, except `routing`: a routing table
//! from the file or the environment replaces the compiled routes outright, so
//! a deployment can drop a default route. The compiled routes apply only when
//! no layer supplies a non-empty table.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use tracing::{debug, warn};

use super::error::{ConfigResult, ConfigurationError};
use super::LanesConfig;
use crate::constants::env;

const ENV_PREFIX: &str = "TASKER_LANES";

#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    /// Replaces the process environment when set
    env_vars: Option<HashMap<String, String>>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load this file on top of the defaults; it must exist
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    pub fn with_optional_file(mut self, path: Option<PathBuf>) -> Self {
        self.file = path;
        self
    }

    /// Read variables from this map instead of the process environment
    pub fn with_env_vars(mut self, vars: HashMap<String, String>) -> Self {
        self.env_vars = Some(vars);
        self
    }

    pub fn load(&self) -> ConfigResult<LanesConfig> {
        let mut base = LanesConfig::default();
        base.routing.clear();
        let mut builder = Config::builder().add_source(Config::try_from(&base)?);

        if let Some(path) = self.config_file() {
            if !path.is_file() {
                return Err(ConfigurationError::file_not_found(path));
            }
            debug!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(File::from(path.as_path()));
        }

        builder = builder.add_source(self.environment_source());

        for (key, value) in self.legacy_overrides()? {
            builder = builder.set_override(key, value)?;
        }

        let built = builder.build()?;
        let routing_supplied = built.get_table("routing").is_ok_and(|table| !table.is_empty());
        let mut config: LanesConfig = built.try_deserialize()?;
        if !routing_supplied {
            config.routing = LanesConfig::default().routing;
        }
        debug!(routes = config.routing.len(), routing_supplied, "Routing table resolved");
        config.validate()?;

        for warning in config.warnings() {
            warn!("{warning}");
        }
        debug!(config = ?config, "Configuration loaded");

        Ok(config)
    }

    /// Load a single file with no environment layering
    pub fn load_file(path: impl AsRef<Path>) -> ConfigResult<LanesConfig> {
        Self::new()
            .with_file(path.as_ref())
            .with_env_vars(HashMap::new())
            .load()
    }

    fn config_file(&self) -> Option<PathBuf> {
        self.file
            .clone()
            .or_else(|| self.var(env::CONFIG_PATH).map(PathBuf::from))
    }

    fn var(&self, name: &str) -> Option<String> {
        match &self.env_vars {
            Some(vars) => vars.get(name).cloned(),
            None => std::env::var(name).ok(),
        }
        .filter(|value| !value.is_empty())
    }

    fn environment_source(&self) -> Environment {
        let source = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("channels")
            .with_list_parse_key("orchestrator.command");

        match &self.env_vars {
            Some(vars) => source.source(Some(vars.clone().into_iter().collect())),
            None => source,
        }
    }

    fn legacy_overrides(&self) -> ConfigResult<Vec<(&'static str, config::Value)>> {
        let mut overrides: Vec<(&'static str, config::Value)> = Vec::new();

        if let Some(host) = self.var(env::RABBITMQ_HOST) {
            overrides.push(("broker.host", host.into()));
        }
        if let Some(raw) = self.var(env::RABBITMQ_PORT) {
            let port: u16 = parse_legacy(env::RABBITMQ_PORT, &raw)?;
            overrides.push(("broker.port", i64::from(port).into()));
        }
        if let Some(user) = self.var(env::RABBITMQ_USER) {
            overrides.push(("broker.username", user.into()));
        }
        if let Some(pass) = self.var(env::RABBITMQ_PASS) {
            overrides.push(("broker.password", pass.into()));
        }
        if let Some(raw) = self.var(env::WORKER_PREFETCH_COUNT) {
            let prefetch: u16 = parse_legacy(env::WORKER_PREFETCH_COUNT, &raw)?;
            overrides.push(("worker.prefetch_count", i64::from(prefetch).into()));
        }
        if let Some(raw) = self.var(env::WORKER_RECONNECT_DELAY) {
            let seconds: u32 = parse_legacy(env::WORKER_RECONNECT_DELAY, &raw)?;
            overrides.push(("worker.reconnect_delay_ms", (i64::from(seconds) * 1000).into()));
        }

        Ok(overrides)
    }
}

fn parse_legacy<T: std::str::FromStr>(name: &str, raw: &str) -> ConfigResult<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigurationError::invalid_value(name, raw, e.to_string()))
}
