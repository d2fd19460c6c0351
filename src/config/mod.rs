use std::fs;
use std::net::SocketAddr;

use log::{debug, trace};
use pingora::server::configuration::{Opt, ServerConf};
use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;
use validator::{Validate, ValidationError};

use crate::config_error;
use crate::core::{GatewayError, GatewayResult};
use crate::store::{BackendState, FrontendSettings, FrontendState};

#[derive(Default, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Config::validate_callback_rewrite"))]
pub struct Config {
    #[serde(default)]
    pub pingora: ServerConf,

    #[serde(default)]
    #[validate(nested)]
    pub server: Server,

    #[serde(default)]
    #[validate(nested)]
    pub store: StoreConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    #[validate(nested)]
    pub controller: Controller,

    #[serde(default)]
    #[validate(nested)]
    pub backends: Vec<BackendSeed>,

    #[serde(default)]
    #[validate(nested)]
    pub frontends: Vec<FrontendSeed>,

    pub log: Option<Log>,
}

// Config file load and validation
impl Config {
    pub fn load_from_yaml<P>(path: P) -> GatewayResult<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path)
            .map_err(|e| config_error!("Unable to read conf file from {path}: {e}"))?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    // config file load entry point
    pub fn load_yaml_with_opt_override(opt: &Opt) -> GatewayResult<Self> {
        if let Some(path) = &opt.conf {
            let mut conf = Self::load_from_yaml(path)?;
            conf.merge_with_opt(opt);
            Ok(conf)
        } else {
            Err(config_error!("No path specified"))
        }
    }

    pub fn from_yaml(conf_str: &str) -> GatewayResult<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str)?;

        trace!("Loaded conf: {conf:?}");

        conf.validate()?;

        Ok(conf)
    }

    pub fn merge_with_opt(&mut self, opt: &Opt) {
        if opt.daemon {
            self.pingora.daemon = true;
        }
    }

    fn validate_callback_rewrite(&self) -> Result<(), ValidationError> {
        let enabled = self
            .gateway
            .middlewares
            .iter()
            .any(|m| m.name == "rewrite_meta_callback_urls");
        if enabled && (self.server.api_url.is_none() || self.server.jwt_secret.is_none()) {
            return Err(ValidationError::new("callback_rewrite_requires_api_url_and_jwt_secret"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Server {
    #[serde(default = "Server::default_listen")]
    pub listen: SocketAddr,

    /// Worker threads of the API service, pingora's default when unset
    #[validate(range(min = 1))]
    pub threads: Option<usize>,

    /// Public base url of this gateway
    #[validate(url)]
    pub api_url: Option<String>,

    pub jwt_secret: Option<String>,

    /// Seconds until an inbound request is abandoned
    #[serde(default = "Server::default_request_timeout")]
    #[validate(range(min = 1))]
    pub request_timeout: u64,

    /// Largest accepted request body in bytes
    #[serde(default = "Server::default_max_body_size")]
    #[validate(range(min = 1))]
    pub max_body_size: usize,
}

impl Server {
    fn default_listen() -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], 42353))
    }

    fn default_request_timeout() -> u64 {
        30
    }

    fn default_max_body_size() -> usize {
        32 * 1024 * 1024
    }
}

impl Default for Server {
    fn default() -> Self {
        Self {
            listen: Self::default_listen(),
            threads: None,
            api_url: None,
            jwt_secret: None,
            request_timeout: Self::default_request_timeout(),
            max_body_size: Self::default_max_body_size(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, Validate)]
pub struct StoreConfig {
    /// Without etcd the state is kept in process.
    #[validate(nested)]
    pub etcd: Option<Etcd>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Etcd {
    #[validate(length(min = 1))]
    pub host: Vec<String>,
    #[serde(default = "Etcd::default_prefix")]
    pub prefix: String,
    pub timeout: Option<u32>,
    pub connect_timeout: Option<u32>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Etcd {
    fn default_prefix() -> String {
        "/roomscale".to_string()
    }
}

/// A configured pipeline stage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MiddlewareConfig {
    pub name: String,
    #[serde(default)]
    pub config: YamlValue,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub middlewares: Vec<MiddlewareConfig>,
}

impl GatewayConfig {
    pub const DEFAULT_MIDDLEWARES: [&'static str; 10] = [
        "rewrite_unique_meeting_id",
        "attendees_limit",
        "default_presentation",
        "set_create_params",
        "set_join_params",
        "set_meta_frontend",
        "bind_meeting_frontend",
        "admin_handler",
        "meetings_handler",
        "recordings_handler",
    ];

    /// Configured stages, or the default pipeline when none are listed.
    pub fn pipeline(&self) -> Vec<MiddlewareConfig> {
        if !self.middlewares.is_empty() {
            return self.middlewares.clone();
        }
        Self::DEFAULT_MIDDLEWARES
            .iter()
            .map(|name| MiddlewareConfig {
                name: name.to_string(),
                config: YamlValue::Null,
            })
            .collect()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub filters: Vec<String>,
}

impl RouterConfig {
    pub const DEFAULT_FILTERS: [&'static str; 4] =
        ["lookup", "required_tags", "sort_load", "resource_rules"];

    pub fn filter_names(&self) -> Vec<String> {
        if self.filters.is_empty() {
            Self::DEFAULT_FILTERS.iter().map(|s| s.to_string()).collect()
        } else {
            self.filters.clone()
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Controller {
    /// Seconds between reconciliation rounds
    #[serde(default = "Controller::default_refresh_interval")]
    #[validate(range(min = 1))]
    pub refresh_interval: u64,

    /// Seconds a worker waits for a queue notification before polling
    #[serde(default = "Controller::default_queue_wait")]
    #[validate(range(min = 1))]
    pub queue_wait: u64,

    #[serde(default = "Controller::default_command_deadline")]
    #[validate(range(min = 1))]
    pub command_deadline: u64,

    /// Seconds finished commands are kept before they are swept
    #[serde(default = "Controller::default_command_retention")]
    #[validate(range(min = 1))]
    pub command_retention: u64,
}

impl Controller {
    fn default_refresh_interval() -> u64 {
        60
    }

    fn default_queue_wait() -> u64 {
        2
    }

    fn default_command_deadline() -> u64 {
        600
    }

    fn default_command_retention() -> u64 {
        3600
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self {
            refresh_interval: Self::default_refresh_interval(),
            queue_wait: Self::default_queue_wait(),
            command_deadline: Self::default_command_deadline(),
            command_retention: Self::default_command_retention(),
        }
    }
}

/// Backend written to the store at boot.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct BackendSeed {
    #[validate(length(min = 1))]
    pub id: String,
    #[validate(url)]
    pub host: String,
    #[validate(length(min = 1))]
    pub secret: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[validate(range(min = 0.0))]
    pub load_factor: Option<f64>,
}

impl BackendSeed {
    /// Apply the seed to an existing record, keeping its runtime state.
    pub fn apply(&self, existing: Option<BackendState>) -> BackendState {
        let mut state = existing
            .unwrap_or_else(|| BackendState::new(&self.id, &self.host, &self.secret));
        state.host = self.host.clone();
        state.secret = self.secret.clone();
        state.tags = self.tags.clone();
        if let Some(load_factor) = self.load_factor {
            state.load_factor = load_factor;
        }
        state
    }
}

/// Frontend written to the store at boot.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct FrontendSeed {
    #[validate(length(min = 1))]
    pub id: String,
    #[validate(length(min = 1))]
    pub key: String,
    #[validate(length(min = 1))]
    pub secret: String,
    #[serde(default = "FrontendSeed::default_active")]
    pub active: bool,
    #[serde(default)]
    pub settings: FrontendSettings,
}

impl FrontendSeed {
    fn default_active() -> bool {
        true
    }

    pub fn apply(&self, existing: Option<FrontendState>) -> FrontendState {
        let mut state = existing
            .unwrap_or_else(|| FrontendState::new(&self.id, &self.key, &self.secret));
        state.key = self.key.clone();
        state.secret = self.secret.clone();
        state.active = self.active;
        state.settings = self.settings.clone();
        state.updated_at = chrono::Utc::now();
        state
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Log {
    #[validate(length(min = 1))]
    pub path: String,

    /// Default level when RUST_LOG is unset
    #[serde(default = "Log::default_level")]
    pub level: log::LevelFilter,
}

impl Log {
    fn default_level() -> log::LevelFilter {
        log::LevelFilter::Info
    }
}

/// Deserialize an optional stage config, empty means defaults.
pub fn stage_config<T>(value: &YamlValue) -> GatewayResult<T>
where
    T: serde::de::DeserializeOwned + Default + Validate,
{
    if value.is_null() {
        return Ok(T::default());
    }
    let config: T = serde_yaml::from_value(value.clone())
        .map_err(|e| GatewayError::Configuration(format!("invalid stage config: {e}")))?;
    config.validate()?;
    Ok(config)
}
