//! Configuration for the hookwire batch binary.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Data, Env, Format, Serialized, Toml},
    Figment,
};
use hookwire_core::{storage::PgSubjectResolver, TriggerEvent, WebhookConfig, WebhookRegistry};
use hookwire_delivery::{ClientConfig, DeliveryConfig};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

const CONFIG_FILE: &str = "hookwire.toml";
const ENV_PREFIX: &str = "HOOKWIRE_";

/// Batch configuration with defaults, file and environment overrides.
///
/// Configuration is loaded in priority order:
/// 1. `HOOKWIRE_`-prefixed environment variables (highest priority)
/// 2. `DATABASE_URL`
/// 3. Configuration file (`hookwire.toml`)
/// 4. Built-in defaults (lowest priority)
///
/// Registrations live in `[[webhooks]]` tables of the configuration file:
///
/// ```toml
/// [[webhooks]]
/// subject_types = ["article"]
/// table = "articles"
/// fields = ["title", "status"]
/// trigger = "saved"
/// max_attempts = 3
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// PostgreSQL connection URL.
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,

    /// HTTP request timeout for each delivery attempt in seconds.
    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_seconds: u64,
    /// Maximum simultaneous delivery attempts.
    #[serde(default = "default_concurrency")]
    pub delivery_concurrency: usize,
    /// Treat non-2xx responses as failed attempts.
    #[serde(default)]
    pub require_success_status: bool,
    /// User agent sent with every delivery.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Lifetime of the batch lease in seconds.
    #[serde(default = "default_lease_seconds")]
    pub batch_lease_seconds: u64,

    /// Log filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub rust_log: String,

    /// Webhook registrations.
    #[serde(default)]
    pub webhooks: Vec<WebhookEntry>,
}

/// One `[[webhooks]]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEntry {
    /// Subject types bound to this registration.
    pub subject_types: Vec<String>,
    /// Table holding the subjects' rows, optionally schema-qualified.
    pub table: String,
    /// Fields included in the payload, in order.
    pub fields: Vec<String>,
    /// Mutation the registration fires on.
    #[serde(default)]
    pub trigger: TriggerEvent,
    /// Attempt ceiling per delivery task.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Process inline at capture time.
    #[serde(default)]
    pub synchronous: bool,
}

impl Config {
    /// Loads configuration from `hookwire.toml` in the working directory.
    pub fn load() -> Result<Self> {
        Self::load_with(Toml::file(CONFIG_FILE))
    }

    fn load_with(file: Data<Toml>) -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(file)
            .merge(Env::raw().only(&["DATABASE_URL"]))
            .merge(Env::prefixed(ENV_PREFIX));

        let config: Self = figment.extract().context("failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Delivery engine configuration.
    pub fn to_delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            client_config: self.to_client_config(),
            concurrency: self.delivery_concurrency,
            lease_ttl: Duration::from_secs(self.batch_lease_seconds),
        }
    }

    /// HTTP client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.delivery_timeout_seconds),
            user_agent: self.user_agent.clone(),
            require_success_status: self.require_success_status,
        }
    }

    /// Builds the webhook registry from the `[[webhooks]]` tables.
    pub fn build_registry(&self) -> Result<WebhookRegistry> {
        let mut builder = WebhookRegistry::builder();
        for (index, entry) in self.webhooks.iter().enumerate() {
            let config = WebhookConfig::new(entry.fields.iter().cloned())
                .trigger(entry.trigger)
                .max_attempts(entry.max_attempts)
                .synchronous(entry.synchronous);
            builder
                .register(entry.subject_types.iter().map(String::as_str), config)
                .with_context(|| format!("invalid webhook registration #{}", index + 1))?;
        }
        Ok(builder.build())
    }

    /// Builds the subject resolver mapping each subject type to its table.
    pub fn build_subject_resolver(&self, pool: Arc<PgPool>) -> Result<PgSubjectResolver> {
        let mut resolver = PgSubjectResolver::new(pool);
        for entry in &self.webhooks {
            for subject_type in &entry.subject_types {
                resolver = resolver
                    .with_table(subject_type.as_str(), entry.table.as_str())
                    .with_context(|| format!("invalid table for subject type '{subject_type}'"))?;
            }
        }
        Ok(resolver)
    }

    /// Database URL with the password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                let scheme_end = self.database_url.find("://").map_or(0, |i| i + 3);
                if colon_pos >= scheme_end {
                    let mut masked = self.database_url.clone();
                    masked.replace_range(colon_pos + 1..at_pos, "***");
                    return masked;
                }
            }
        }
        self.database_url.clone()
    }

    fn validate(&self) -> Result<()> {
        if self.database_max_connections == 0 {
            anyhow::bail!("database_max_connections must be greater than 0");
        }

        if self.delivery_timeout_seconds == 0 {
            anyhow::bail!("delivery_timeout_seconds must be greater than 0");
        }

        if self.delivery_concurrency == 0 {
            anyhow::bail!("delivery_concurrency must be greater than 0");
        }

        if self.batch_lease_seconds == 0 {
            anyhow::bail!("batch_lease_seconds must be greater than 0");
        }

        if let Some(entry) = self.webhooks.iter().find(|entry| entry.max_attempts == 0) {
            anyhow::bail!(
                "max_attempts must be greater than 0 for {}",
                entry.subject_types.join(", ")
            );
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            delivery_timeout_seconds: default_delivery_timeout(),
            delivery_concurrency: default_concurrency(),
            require_success_status: false,
            user_agent: default_user_agent(),
            batch_lease_seconds: default_lease_seconds(),
            rust_log: default_log_level(),
            webhooks: Vec::new(),
        }
    }
}

fn default_database_url() -> String {
    "postgresql://localhost/hookwire".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_delivery_timeout() -> u64 {
    hookwire_delivery::client::DEFAULT_TIMEOUT_SECONDS
}

fn default_concurrency() -> usize {
    hookwire_delivery::engine::DEFAULT_CONCURRENCY
}

fn default_user_agent() -> String {
    ClientConfig::default().user_agent
}

fn default_lease_seconds() -> u64 {
    hookwire_delivery::engine::DEFAULT_LEASE_TTL.as_secs()
}

fn default_max_attempts() -> u32 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}
