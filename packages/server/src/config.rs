use std::env;

use anyhow::{Context, Result};

use engine::Config as EngineConfig;

/// Process configuration for the HTTP façade. Mirrors the teacher's
/// `packages/server/src/config.rs::Config::from_env` idiom — required
/// settings fail startup via `anyhow::Context`, optional integrations
/// degrade to `None` instead of aborting (§6 Environment).
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub app_url: String,
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let port = env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .context("PORT must be a valid number")?;

        let app_url = env::var("APP_URL").unwrap_or_else(|_| format!("http://localhost:{port}"));

        let engine = EngineConfig::from_env()?;

        Ok(Self { port, app_url, engine })
    }
}
