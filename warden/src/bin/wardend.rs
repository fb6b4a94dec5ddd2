use std::env;
use std::sync::Arc;
use tracing::info;
use warden::{
    auth::{Authenticator, StoreAuthenticator},
    adapter::LeaseStoreAdapter,
    cell::Cell,
    config::{CellConfig, CellTopology},
    store::{MemoryStore, Store},
    Result,
};

/// Starts a single cell over an in-process store. The transport shim in
/// front of a production deployment is wired separately; this binary
/// exists to run a cell standalone for local work.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cell_name = env::var("WARDEN_CELL").unwrap_or_else(|_| "local".to_string());

    let topology = match env::var("WARDEN_TOPOLOGY") {
        Ok(path) => CellTopology::load(&path)?,
        Err(_) => CellTopology::default(),
    };
    match topology.endpoints(&cell_name) {
        Some(endpoints) => info!(cell = %cell_name, ?endpoints, "cell endpoints resolved"),
        None => {
            eprintln!("unknown cell {cell_name:?}; known cells: {:?}", topology.cells.keys());
            std::process::exit(1);
        }
    }

    let config = match env::var("WARDEN_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str::<CellConfig>(&raw).map_err(anyhow::Error::from)?
        }
        Err(_) => CellConfig::named(cell_name.clone()),
    };

    let store = Arc::new(MemoryStore::new()) as Arc<dyn Store>;

    let adapter = Arc::new(LeaseStoreAdapter::new(store.clone()));
    let auth = StoreAuthenticator::new(
        config.name.clone(),
        adapter,
        config.keep_alive_timeout(),
    );
    if let Ok(seed) = env::var("WARDEN_SEED_USERS") {
        // Comma-separated user:password pairs for local bring-up.
        for pair in seed.split(',') {
            if let Some((user, password)) = pair.split_once(':') {
                auth.provision(user.trim(), password.trim()).await?;
                info!(user = user.trim(), "seeded credentials");
            }
        }
    }

    let cell = Cell::new(config, store, Arc::new(auth) as Arc<dyn Authenticator>);
    cell.start();
    info!(cell = %cell_name, "wardend running, ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    cell.shutdown();
    Ok(())
}
