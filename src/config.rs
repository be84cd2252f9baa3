use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use config::{Config, Environment};
use serde::Deserialize;
use std::env;

use crate::coordination::redis::RedisSettings;
use crate::executor::ExecutorSettings;
use crate::executor::worker::WorkerSettings;
use crate::runs::admission::AdmissionSettings;
use crate::runs::reaper::ReaperSettings;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Require JWT authentication
    #[arg(long, env = "JWT_REQUIRED")]
    pub jwt_required: Option<bool>,

    /// Bypass admission control (trusted/development mode)
    #[arg(long, env = "TRUSTED_MODE")]
    pub trusted_mode: Option<bool>,

    /// Coordination store URL (e.g. redis://127.0.0.1:6379)
    #[arg(long, env = "COORDINATION_URL")]
    pub coordination_url: Option<String>,

    /// Run record store URL
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    pub resilience: ResilienceConfig,
    pub coordination: CoordinationConfig,
    pub persistence: PersistenceConfig,
    pub admission: AdmissionConfig,
    pub executor: ExecutorConfig,
    pub reaper: ReaperConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SecurityConfig {
    pub jwt_required: bool,
    pub jwt_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResilienceConfig {
    pub timeout_disabled: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CoordinationConfig {
    /// "redis" or "memory" (single-node / test deployments).
    pub provider: String,
    pub url: String,
    pub connect_timeout_secs: u64,
    pub response_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PersistenceConfig {
    /// "postgres" or "memory".
    pub provider: String,
    pub database_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdmissionConfig {
    pub max_concurrent_runs: i64,
    pub window_hours: u64,
    pub trusted_mode: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecutorConfig {
    pub max_retries: u32,
    pub hard_timeout_secs: u64,
    pub retry_delay_secs: u64,
    pub presence_ttl_secs: u64,
    pub response_ttl_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReaperConfig {
    pub interval_secs: u64,
    pub stale_after_secs: u64,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        let mut builder = Config::builder();

        // 1. Defaults
        builder = builder
            .set_default("server.port", 3000)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("security.jwt_required", true)?
            .set_default("security.jwt_secret", "")?
            .set_default("resilience.timeout_disabled", false)?
            .set_default("coordination.provider", "memory")?
            .set_default("coordination.url", "redis://127.0.0.1:6379")?
            .set_default("coordination.connect_timeout_secs", 10)?
            .set_default("coordination.response_timeout_secs", 15)?
            .set_default("persistence.provider", "memory")?
            .set_default("persistence.database_url", "")?
            .set_default("admission.max_concurrent_runs", 5)?
            .set_default("admission.window_hours", 24)?
            .set_default("admission.trusted_mode", false)?
            .set_default("executor.max_retries", 3)?
            .set_default("executor.hard_timeout_secs", 600)?
            .set_default("executor.retry_delay_secs", 5)?
            .set_default("executor.presence_ttl_secs", 24 * 60 * 60)?
            .set_default("executor.response_ttl_secs", 24 * 60 * 60)?
            .set_default("reaper.interval_secs", 3600)?
            .set_default("reaper.stale_after_secs", 3600)?;

        // 2. Config file (optional)
        if let Some(path) = &cli.config {
            builder = builder.add_source(config::File::with_name(path));
        }

        // 3. Environment Variables (prefixed with RUNPLANE_)
        // E.g. RUNPLANE_SERVER__PORT=8000
        builder = builder.add_source(
            Environment::with_prefix("RUNPLANE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        // 4. Manual Environment Overrides
        if let Ok(val) = env::var("RUNPLANE_PERSISTENCE__PROVIDER") {
            builder = builder.set_override("persistence.provider", val)?;
        }
        if let Ok(val) = env::var("RUNPLANE_PERSISTENCE__DATABASE_URL") {
            builder = builder.set_override("persistence.database_url", val)?;
        }

        // 5. Manual CLI Overrides
        // Priority: CLI Flag > CLI Env Var > RUNPLANE_ env > Config File > Defaults.
        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", port)?;
        }
        if let Some(required) = cli.jwt_required {
            builder = builder.set_override("security.jwt_required", required)?;
        }
        if let Some(trusted) = cli.trusted_mode {
            builder = builder.set_override("admission.trusted_mode", trusted)?;
        }
        if let Some(url) = cli.coordination_url {
            builder = builder
                .set_override("coordination.provider", "redis")?
                .set_override("coordination.url", url)?;
        }
        if let Some(url) = cli.database_url {
            builder = builder
                .set_override("persistence.provider", "postgres")?
                .set_override("persistence.database_url", url)?;
        }

        let cfg = builder.build()?;
        cfg.try_deserialize()
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn redis_settings(&self) -> RedisSettings {
        RedisSettings {
            url: self.coordination.url.clone(),
            connect_timeout: Duration::from_secs(self.coordination.connect_timeout_secs),
            response_timeout: Duration::from_secs(self.coordination.response_timeout_secs),
        }
    }

    pub fn admission_settings(&self) -> AdmissionSettings {
        AdmissionSettings {
            max_concurrent_runs: self.admission.max_concurrent_runs,
            window: Duration::from_secs(self.admission.window_hours * 60 * 60),
            trusted_mode: self.admission.trusted_mode,
        }
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            max_retries: self.executor.max_retries,
            hard_timeout: Duration::from_secs(self.executor.hard_timeout_secs),
            retry_delay: Duration::from_secs(self.executor.retry_delay_secs),
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            response_ttl: Duration::from_secs(self.executor.response_ttl_secs),
        }
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.executor.presence_ttl_secs)
    }

    pub fn reaper_settings(&self) -> ReaperSettings {
        ReaperSettings {
            interval: Duration::from_secs(self.reaper.interval_secs),
            stale_after: Duration::from_secs(self.reaper.stale_after_secs),
        }
    }
}
