use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use finchat_gateway::config::GatewayConfig;
use finchat_gateway::engine::Orchestrator;
use finchat_gateway::llm_api::openai::client::OpenAiClient;
use finchat_gateway::logger::{init_dev_logger, init_prod_logger};
use finchat_gateway::tools::ToolInvoker;
use finchat_gateway::web::WebServer;

#[tokio::main]
async fn main() -> Result<()> {
    //*
    //* Initialize logger
    //*
    let production = std::env::var("APP_ENV").is_ok_and(|env| env == "production");
    let _log_guard = if production {
        init_prod_logger()?
    } else {
        init_dev_logger()?
    };
    info!("Logger initialized successfully");

    //*
    //* Load configuration
    //*
    let config = GatewayConfig::from_env().context("failed to load gateway configuration")?;
    info!(
        credentials = config.key_pool.api_keys.len(),
        model_tiers = ?config.provider.model_tiers,
        gate_capacity = config.gate.capacity,
        "Configuration loaded"
    );

    //*
    //* Build provider, tools and orchestrator
    //*
    let provider = OpenAiClient::from_config(&config.provider).context("failed to build provider client")?;
    let tools = ToolInvoker::with_default_tools(&config.tools).context("failed to build tool invoker")?;
    if config.tools.search_api_key.is_none() || config.tools.search_cse_id.is_none() {
        warn!("Search engine credentials not set, search_information will report itself unavailable");
    }
    info!(tools = tools.len(), "Tools registered");

    let orchestrator = Arc::new(Orchestrator::new(&config, Arc::new(provider), tools));

    //*
    //* Idle session eviction
    //*
    if let Some(idle_ttl) = config.session.idle_ttl {
        let sessions = orchestrator.sessions().clone();
        let every = config.session.eviction_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = sessions.evict_idle(idle_ttl);
                if evicted > 0 {
                    info!(evicted, "Idle sessions evicted");
                }
            }
        });
    }

    //*
    //* Start HTTP server
    //*
    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.bind_addr))?;
    WebServer::new(orchestrator).start(addr).await?;

    info!("Server stopped");
    Ok(())
}
