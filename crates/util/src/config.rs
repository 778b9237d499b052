use std::{env, fmt, net::SocketAddr, time::Duration};

use super::server_bind_address;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://mailcheck.db?mode=rwc";
pub const DEFAULT_JOB_WORKERS: usize = 4;
pub const DEFAULT_JOB_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_HEARTBEAT_MESSAGE: &str = "scheduled task heartbeat";

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Cadence and argument for the periodic diagnostic heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatSchedule {
    pub interval: Duration,
    pub message: String,
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub job_workers: usize,
    pub job_queue_capacity: usize,
    /// When set, the homepage also submits a populate job of this size.
    pub homepage_populate_count: Option<i64>,
    pub heartbeat: Option<HeartbeatSchedule>,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        let job_workers = positive_var("JOB_WORKERS")?.unwrap_or(DEFAULT_JOB_WORKERS);
        let job_queue_capacity =
            positive_var("JOB_QUEUE_CAPACITY")?.unwrap_or(DEFAULT_JOB_QUEUE_CAPACITY);

        let homepage_populate_count = match env::var("HOMEPAGE_POPULATE_COUNT") {
            Ok(raw) => Some(raw.trim().parse::<i64>().map_err(|_| ConfigError::InvalidNumber {
                name: "HOMEPAGE_POPULATE_COUNT",
                value: raw,
            })?),
            Err(_) => None,
        };

        let heartbeat = positive_var("HEARTBEAT_INTERVAL_SECS")?.map(|secs| HeartbeatSchedule {
            interval: Duration::from_secs(secs as u64),
            message: env::var("HEARTBEAT_MESSAGE")
                .unwrap_or_else(|_| DEFAULT_HEARTBEAT_MESSAGE.to_string()),
        });

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            job_workers,
            job_queue_capacity,
            homepage_populate_count,
            heartbeat,
        })
    }
}

fn positive_var(name: &'static str) -> Result<Option<usize>, ConfigError> {
    let Ok(raw) = env::var(name) else {
        return Ok(None);
    };
    match raw.trim().parse::<usize>() {
        Ok(0) => Err(ConfigError::MustBePositive(name)),
        Ok(value) => Ok(Some(value)),
        Err(_) => Err(ConfigError::InvalidNumber { name, value: raw }),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    InvalidNumber { name: &'static str, value: String },
    MustBePositive(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::InvalidNumber { name, value } => {
                write!(f, "{name} must be an integer (got {value})")
            }
            Self::MustBePositive(name) => write!(f, "{name} must be at least 1"),
        }
    }
}

impl std::error::Error for ConfigError {}
