use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use quill_domain::config::{Config, ConfigSeverity};
use quill_gateway::api;
use quill_gateway::bootstrap::build_app_state;
use quill_providers::{AnthropicProvider, LlmProvider};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ──────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("QUILL_LOG")
                .unwrap_or_else(|_| EnvFilter::new("info,quill_gateway=debug")),
        )
        .json()
        .init();

    tracing::info!("quilld starting");

    // ── Config ───────────────────────────────────────────────────────
    let config_path = std::env::var("QUILL_CONFIG").unwrap_or_else(|_| "quill.toml".into());

    let config: Config = if std::path::Path::new(&config_path).exists() {
        let raw = std::fs::read_to_string(&config_path)
            .with_context(|| format!("reading {config_path}"))?;
        toml::from_str(&raw).with_context(|| format!("parsing {config_path}"))?
    } else {
        tracing::warn!(path = %config_path, "config file not found, using defaults");
        Config::default()
    };

    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }
    let config = Arc::new(config);

    // ── Provider ─────────────────────────────────────────────────────
    let provider = Arc::new(
        AnthropicProvider::from_config(&config.llm).context("initializing LLM provider")?,
    );
    tracing::info!(model = %provider.default_model(), "LLM provider ready");

    // ── App state + HTTP ─────────────────────────────────────────────
    let state = build_app_state(config.clone(), provider);
    let app = api::router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(addr = %addr, "quilld listening");

    axum::serve(listener, app).await.context("serving HTTP")?;
    Ok(())
}
