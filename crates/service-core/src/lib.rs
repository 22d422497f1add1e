use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppEnv {
    Local,
    Dev,
    Test,
    Prod,
}

impl AppEnv {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Dev => "dev",
            Self::Test => "test",
            Self::Prod => "prod",
        }
    }
}

impl std::str::FromStr for AppEnv {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "dev" | "development" => Ok(Self::Dev),
            "test" => Ok(Self::Test),
            "prod" | "production" => Ok(Self::Prod),
            other => Err(ConfigError::InvalidEnv(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub app: AppSection,
    pub escrow: EscrowSection,
    pub gateway: GatewaySection,
    pub database: DatabaseSection,
    pub observability: ObservabilitySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSection {
    pub env: AppEnv,
    pub service_name: String,
    pub http_bind_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowSection {
    pub currency: String,
    pub min_stake_cents: u64,
    pub max_stake_cents: u64,
    pub fee_bps: u16,
}

/// Secrets default to empty in the files and are expected to arrive through
/// `GATEWAY__SECRET_KEY` / `GATEWAY__WEBHOOK_SECRET`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySection {
    pub base_url: String,
    pub request_timeout_ms: u64,
    pub secret_key: String,
    pub webhook_secret: String,
    pub webhook_tolerance_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    /// Postgres connection string; empty selects the in-memory store.
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilitySection {
    pub log_filter: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid APP_ENV value: {0}")]
    InvalidEnv(String),
    #[error("invalid value for {name}: {value}")]
    InvalidOverride { name: &'static str, value: String },
    #[error("unable to locate config directory (expected config/default.toml)")]
    ConfigDirNotFound,
    #[error("failed reading config file {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed parsing config file {path}: {source}")]
    ParseToml {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Default, Deserialize)]
struct PartialAppConfig {
    app: Option<PartialAppSection>,
    escrow: Option<PartialEscrowSection>,
    gateway: Option<PartialGatewaySection>,
    database: Option<PartialDatabaseSection>,
    observability: Option<PartialObservabilitySection>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialAppSection {
    env: Option<AppEnv>,
    service_name: Option<String>,
    http_bind_addr: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialEscrowSection {
    currency: Option<String>,
    min_stake_cents: Option<u64>,
    max_stake_cents: Option<u64>,
    fee_bps: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialGatewaySection {
    base_url: Option<String>,
    request_timeout_ms: Option<u64>,
    secret_key: Option<String>,
    webhook_secret: Option<String>,
    webhook_tolerance_secs: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialDatabaseSection {
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialObservabilitySection {
    log_filter: Option<String>,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let app_env = env::var("APP_ENV")
            .ok()
            .map(|value| value.parse())
            .transpose()?
            .unwrap_or(AppEnv::Local);
        let config_dir = resolve_config_dir()?;
        Self::load_from_dir_for_env(config_dir, app_env)
    }

    /// Layering: built-in defaults, then `default.toml`, then `{env}.toml`
    /// (if present), then environment variables.
    pub fn load_from_dir_for_env(
        config_dir: impl AsRef<Path>,
        app_env: AppEnv,
    ) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let mut config = Self::default_for_env(app_env);
        merge_file(&mut config, &config_dir.join("default.toml"))?;
        let env_file = config_dir.join(format!("{}.toml", app_env.as_str()));
        if env_file.exists() {
            merge_file(&mut config, &env_file)?;
        }
        config.app.env = app_env;
        config.apply_env_overrides()?;
        Ok(config)
    }

    #[must_use]
    pub fn default_for_env(app_env: AppEnv) -> Self {
        Self {
            app: AppSection {
                env: app_env,
                service_name: "escrow-server".to_string(),
                http_bind_addr: "127.0.0.1:8080".to_string(),
            },
            escrow: EscrowSection {
                currency: "usd".to_string(),
                min_stake_cents: 50_00,
                max_stake_cents: 5000_00,
                fee_bps: 2_000,
            },
            gateway: GatewaySection {
                base_url: "https://api.gateway.localhost".to_string(),
                request_timeout_ms: 10_000,
                secret_key: String::new(),
                webhook_secret: String::new(),
                webhook_tolerance_secs: 300,
            },
            database: DatabaseSection { url: String::new() },
            observability: ObservabilitySection {
                log_filter: "info".to_string(),
            },
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(raw_env) = env::var("APP_ENV") {
            self.app.env = raw_env.parse()?;
        }
        if let Ok(service_name) = env::var("APP_SERVER__SERVICE_NAME") {
            self.app.service_name = service_name;
        }
        if let Ok(bind_addr) = env::var("APP_SERVER__HTTP_BIND_ADDR") {
            self.app.http_bind_addr = bind_addr;
        }
        if let Ok(fee_bps) = env::var("ESCROW__FEE_BPS") {
            self.escrow.fee_bps =
                fee_bps
                    .parse()
                    .map_err(|_| ConfigError::InvalidOverride {
                        name: "ESCROW__FEE_BPS",
                        value: fee_bps,
                    })?;
        }
        if let Ok(base_url) = env::var("GATEWAY__BASE_URL") {
            self.gateway.base_url = base_url;
        }
        if let Ok(secret_key) = env::var("GATEWAY__SECRET_KEY") {
            self.gateway.secret_key = secret_key;
        }
        if let Ok(webhook_secret) = env::var("GATEWAY__WEBHOOK_SECRET") {
            self.gateway.webhook_secret = webhook_secret;
        }
        if let Ok(url) = env::var("DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(log_filter) = env::var("OBSERVABILITY__LOG_FILTER") {
            self.observability.log_filter = log_filter;
        } else if let Ok(log_filter) = env::var("RUST_LOG") {
            self.observability.log_filter = log_filter;
        }
        Ok(())
    }

    fn merge_partial(&mut self, partial: PartialAppConfig) {
        if let Some(app) = partial.app {
            if let Some(value) = app.env {
                self.app.env = value;
            }
            if let Some(value) = app.service_name {
                self.app.service_name = value;
            }
            if let Some(value) = app.http_bind_addr {
                self.app.http_bind_addr = value;
            }
        }
        if let Some(escrow) = partial.escrow {
            if let Some(value) = escrow.currency {
                self.escrow.currency = value;
            }
            if let Some(value) = escrow.min_stake_cents {
                self.escrow.min_stake_cents = value;
            }
            if let Some(value) = escrow.max_stake_cents {
                self.escrow.max_stake_cents = value;
            }
            if let Some(value) = escrow.fee_bps {
                self.escrow.fee_bps = value;
            }
        }
        if let Some(gateway) = partial.gateway {
            if let Some(value) = gateway.base_url {
                self.gateway.base_url = value;
            }
            if let Some(value) = gateway.request_timeout_ms {
                self.gateway.request_timeout_ms = value;
            }
            if let Some(value) = gateway.secret_key {
                self.gateway.secret_key = value;
            }
            if let Some(value) = gateway.webhook_secret {
                self.gateway.webhook_secret = value;
            }
            if let Some(value) = gateway.webhook_tolerance_secs {
                self.gateway.webhook_tolerance_secs = value;
            }
        }
        if let Some(database) = partial.database {
            if let Some(value) = database.url {
                self.database.url = value;
            }
        }
        if let Some(observability) = partial.observability {
            if let Some(value) = observability.log_filter {
                self.observability.log_filter = value;
            }
        }
    }
}

fn merge_file(config: &mut AppConfig, path: &Path) -> Result<(), ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.display().to_string(),
        source,
    })?;
    let partial =
        toml::from_str::<PartialAppConfig>(&content).map_err(|source| ConfigError::ParseToml {
            path: path.display().to_string(),
            source,
        })?;
    config.merge_partial(partial);
    Ok(())
}

fn resolve_config_dir() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = env::var("ESCROW_CONFIG_DIR") {
        return Ok(PathBuf::from(path));
    }

    let mut current_dir = env::current_dir().map_err(|_| ConfigError::ConfigDirNotFound)?;
    loop {
        let candidate = current_dir.join("config");
        if candidate.join("default.toml").exists() {
            return Ok(candidate);
        }
        if !current_dir.pop() {
            break;
        }
    }

    Err(ConfigError::ConfigDirNotFound)
}

pub fn init_tracing(service_name: &str, log_filter: &str) {
    let env_filter = EnvFilter::try_new(log_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt()
        .with_target(false)
        .with_env_filter(env_filter)
        .compact()
        .try_init();

    tracing::info!(service = service_name, "tracing initialized");
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope<T> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<ErrorBody>,
}

impl<T> ResponseEnvelope<T> {
    #[must_use]
    pub fn ok(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    #[must_use]
    pub fn err(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Public error vocabulary of the escrow API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RequestInvalid,
    InvalidAmount,
    BetNotFound,
    NotActive,
    AlreadyResolved,
    MissingPayeeDestination,
    PaymentFailed,
    InvalidSignature,
    GatewayUnavailable,
    InternalError,
}

impl ErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestInvalid => "REQUEST_INVALID",
            Self::InvalidAmount => "INVALID_AMOUNT",
            Self::BetNotFound => "BET_NOT_FOUND",
            Self::NotActive => "NOT_ACTIVE",
            Self::AlreadyResolved => "ALREADY_RESOLVED",
            Self::MissingPayeeDestination => "MISSING_PAYEE_DESTINATION",
            Self::PaymentFailed => "PAYMENT_FAILED",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::GatewayUnavailable => "GATEWAY_UNAVAILABLE",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}
