use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use folio_engine::access::OwnerAccess;
use folio_engine::limits::RuntimeLimits;
use folio_engine::store::MemoryContentStore;
use folio_mcp_runtime::{RuntimeConfig, run};

#[derive(Parser)]
#[command(
    name = "folio-mcp",
    version,
    about = "Folio MCP server: staged content mutations over stdio"
)]
struct Cli {
    /// Actor identity for this connection; generated when omitted
    #[arg(long, env = "FOLIO_ACTOR_ID")]
    actor_id: Option<Uuid>,

    /// JSON library seed (array of records) loaded into the in-memory store
    #[arg(long, env = "FOLIO_LIBRARY_PATH")]
    library: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // Stdout carries the protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let store = match &cli.library {
        Some(path) => match load_library(path) {
            Ok(store) => store,
            Err(message) => {
                eprintln!("folio-mcp: {message}");
                std::process::exit(1);
            }
        },
        None => MemoryContentStore::new(),
    };
    let store = Arc::new(store);
    let access = Arc::new(OwnerAccess::new(store.clone()));

    let actor_id = cli.actor_id.unwrap_or_else(|| {
        let generated = Uuid::now_v7();
        tracing::warn!(actor_id = %generated, "FOLIO_ACTOR_ID not set, generated a fresh actor");
        generated
    });

    let config = RuntimeConfig {
        actor_id,
        limits: RuntimeLimits::from_env(),
    };

    let code = run(config, store, access).await;
    std::process::exit(code);
}

fn load_library(path: &PathBuf) -> Result<MemoryContentStore, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read library seed {}: {e}", path.display()))?;
    let store = MemoryContentStore::from_json(&raw)
        .map_err(|e| format!("invalid library seed {}: {e}", path.display()))?;
    tracing::info!(records = store.len(), path = %path.display(), "library seed loaded");
    Ok(store)
}
