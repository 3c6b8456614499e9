use std::env;

use anyhow::{Context, Result};

/// Process configuration, loaded once at startup. Mirrors
/// `packages/server/src/config.rs`'s `from_env` idiom: required settings
/// fail startup via `anyhow::Context`, optional integrations degrade to
/// `None` instead of aborting (§6 Environment: "a missing secret disables
/// the affected integration rather than failing startup").
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub app_env: AppEnv,

    /// Global worker pool size (§5 "global_workers cap").
    pub global_workers: usize,
    /// Default per-domain concurrency cap, overridable per job (§4.3).
    pub default_domain_concurrency: usize,

    /// Expected single-probe timeout; lease duration is always >= 2x this
    /// (§4.9).
    pub probe_timeout_secs: u64,

    /// Third-party integration used by the Analytics Priority Feed. Absent
    /// disables ingestion without failing startup.
    pub google_analytics_api_key: Option<String>,
    /// Shared secret validating the Webflow publish webhook.
    pub webflow_webhook_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Development,
    Production,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let app_env = match env::var("APP_ENV").as_deref() {
            Ok("production") => AppEnv::Production,
            _ => AppEnv::Development,
        };

        let global_workers = env::var("GLOBAL_WORKERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let default_domain_concurrency = env::var("DEFAULT_DOMAIN_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(20);

        let probe_timeout_secs = env::var("PROBE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(15);

        let google_analytics_api_key = env::var("GOOGLE_ANALYTICS_API_KEY").ok();
        let webflow_webhook_token = env::var("WEBFLOW_WEBHOOK_TOKEN").ok();

        Ok(Self {
            database_url,
            app_env,
            global_workers,
            default_domain_concurrency,
            probe_timeout_secs,
            google_analytics_api_key,
            webflow_webhook_token,
        })
    }

    pub fn lease_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.probe_timeout_secs as i64 * 2)
    }
}

/// Logs a secret's presence without leaking its value, matching
/// `bin/server.rs`'s `mask_env` helper.
pub fn mask_env(name: &str) -> String {
    match env::var(name) {
        Ok(val) if val.len() > 4 => format!("{}={}...", name, &val[..4]),
        Ok(_) => format!("{}=***", name),
        Err(_) => format!("{}=<unset>", name),
    }
}
