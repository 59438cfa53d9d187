//! ==============================================================================
//! main.rs - greenhouse hub entry point
//! ==============================================================================
//!
//! purpose:
//!     starts the hub: logging, configuration, the hub core tasks, and the
//!     dashboard api. runs until ctrl-c.
//!
//! relationships:
//!     - uses: greenhouse_hub::{config, hub, web}
//!
//! architecture:
//!
//! ```text
//!     ┌──────────────────────────────────────────────────────────┐
//!     │                     hub process                          │
//!     │  ┌──────────────┐  ┌──────────────┐  ┌───────────────┐   │
//!     │  │ udp :6842    │  │ device       │  │ dashboard api │   │
//!     │  │ heartbeats   │  │ websockets   │  │ (port 5702)   │   │
//!     │  └──────┬───────┘  └──────┬───────┘  └───────┬───────┘   │
//!     │         └─────────────────┼──────────────────┘           │
//!     │                     ┌─────┴─────┐                        │
//!     │                     │    hub    │ <- hub.rs              │
//!     │                     └───────────┘                        │
//!     └──────────────────────────────────────────────────────────┘
//!                    ▲                        ▲
//!              udp heartbeat           ws://<ip>/ws
//!                    │                        │
//!             ┌──────┴──────┐          ┌──────┴──────┐
//!             │ greenhouse1 │   ...    │ greenhouseN │
//!             └─────────────┘          └─────────────┘
//! ```
//!
//! ==============================================================================

use anyhow::Result;
use greenhouse_hub::{web, Hub, HubConfig};
use std::net::SocketAddr;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

/// RUST_LOG wins; otherwise start at info until the config file says otherwise.
fn init_logging() -> (reload::Handle<EnvFilter, Registry>, bool) {
    let from_env = EnvFilter::try_from_default_env().ok();
    let pinned = from_env.is_some();
    let (filter, handle) = reload::Layer::new(from_env.unwrap_or_else(|| EnvFilter::new("info")));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
    (handle, pinned)
}

#[tokio::main]
async fn main() -> Result<()> {
    // step 1: logging
    let (log_filter, pinned) = init_logging();
    info!("greenhouse hub starting");

    // step 2: configuration
    let config = HubConfig::load_or_default();
    if !pinned {
        if let Err(e) = log_filter.reload(EnvFilter::new(&config.logging.level)) {
            warn!(error = %e, "could not apply logging.level");
        }
    }
    config.validate()?;
    config.log_summary();

    // step 3: hub core
    let hub = Hub::new(config.clone());
    let tasks = hub.start().await?;

    // step 4: dashboard api in background
    if config.dashboard.enabled {
        let addr = SocketAddr::new(config.dashboard.bind, config.dashboard.port);
        let web_hub = hub.clone();
        tokio::spawn(async move {
            if let Err(e) = web::serve(web_hub, addr).await {
                error!(error = %e, "dashboard api stopped");
            }
        });
    }

    // step 5: run until interrupted
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    tasks.shutdown();
    Ok(())
}
