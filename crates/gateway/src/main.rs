use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use tess_domain::config::{Config, ConfigSeverity, EnvConfig};
use tess_engine::{CancelMap, QuotaTracker};
use tess_gateway::host::McpHost;
use tess_gateway::state::AppState;
use tess_providers::registry::ProviderRegistry;
use tess_sessions::SessionStore;

#[derive(Parser)]
#[command(name = "tessera", about = "Tessera agentic execution gateway")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "tessera.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the gateway (default).
    Serve,
    /// Validate the configuration and exit.
    ConfigValidate,
    /// Print the version.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = load_config(&cli.config)?;
            run_server(Arc::new(config)).await
        }
        Some(Command::ConfigValidate) => {
            let config = load_config(&cli.config)?;
            let issues = config.validate();
            for issue in &issues {
                println!(
                    "{}: {issue}",
                    match issue.severity {
                        ConfigSeverity::Warning => "warning",
                        ConfigSeverity::Error => "error",
                    }
                );
            }
            if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
                std::process::exit(1);
            }
            println!("configuration ok");
            Ok(())
        }
        Some(Command::Version) => {
            println!("tessera {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tess_engine=debug")),
        )
        .json()
        .init();
}

fn load_config(path: &PathBuf) -> anyhow::Result<Config> {
    let mut config: Config = if path.exists() {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
    } else {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        Config::default()
    };
    config.env = EnvConfig::from_env();
    Ok(config)
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("Tessera starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!("config validation failed");
    }
    if config.env.production {
        tracing::info!("production marker set");
    }

    // ── LLM providers ────────────────────────────────────────────────
    let registry = Arc::new(
        ProviderRegistry::from_config(&config.llm).context("initializing LLM providers")?,
    );
    if registry.is_empty() {
        tracing::warn!("no LLM providers initialized — turns will fail until configured");
    } else {
        tracing::info!(providers = registry.len(), "LLM provider registry ready");
    }

    // ── Session store ────────────────────────────────────────────────
    let sessions = Arc::new(
        SessionStore::new(&config.storage.state_path).context("initializing session store")?,
    );

    // ── MCP servers + catalogs ───────────────────────────────────────
    let (host, base_tools, base_prompts) = if config.mcp.servers.is_empty() {
        tracing::info!("no MCP servers configured");
        (McpHost::empty(), Default::default(), Default::default())
    } else {
        McpHost::connect(&config.mcp).await
    };
    let host = Arc::new(host);

    // ── Runtime services ─────────────────────────────────────────────
    let cancel_map = Arc::new(CancelMap::new());
    let quota = Arc::new(QuotaTracker::new(config.limits.quota.clone()));

    let state = AppState {
        config: config.clone(),
        registry,
        sessions: sessions.clone(),
        cancel_map,
        quota,
        host,
        base_tools,
        base_prompts,
    };

    // ── Periodic session flush ───────────────────────────────────────
    {
        let sessions = sessions.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                if let Err(e) = sessions.flush() {
                    tracing::warn!(error = %e, "session store flush failed");
                }
            }
        });
    }

    // ── Router ───────────────────────────────────────────────────────
    let cors = build_cors_layer(&config.server.cors.allowed_origins);
    let app = tess_gateway::api::router()
        .layer(cors)
        .layer(tower::limit::ConcurrencyLimitLayer::new(256))
        .with_state(state);

    // ── Bind ─────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "Tessera listening");

    axum::serve(listener, app).await.context("axum server error")?;
    Ok(())
}

fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    use axum::http::{header, HeaderValue, Method};

    if allowed_origins.len() == 1 && allowed_origins[0] == "*" {
        tracing::warn!("CORS configured with wildcard \"*\" — all origins allowed");
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(hv) => Some(hv),
            Err(_) => {
                tracing::warn!(origin = %origin, "invalid CORS origin, skipping");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}
