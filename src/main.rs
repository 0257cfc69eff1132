use std::sync::Arc;

use tracing::info;

use sottovoce::client::ChatClient;
use sottovoce::http;
use sottovoce::pseudonym::PseudonymRegistry;
use sottovoce::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    if let Err(e) = dotenvy::dotenv() {
        // It's not fatal if .env doesn't exist, but good to know
        info!("No .env file found or failed to load: {}", e);
    }

    // Initialize logging with default filter if RUST_LOG is not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    info!("Sottovoce daemon starting...");

    // Initialize the Store
    // We use ~/.sottovoce/sottovoce.db unless SOTTOVOCE_DB overrides it
    let db_path = match std::env::var("SOTTOVOCE_DB") {
        Ok(path) => std::path::PathBuf::from(path),
        Err(_) => {
            let home_dir = std::env::var("HOME").unwrap_or_else(|_| ".".into());
            std::path::Path::new(&home_dir)
                .join(".sottovoce")
                .join("sottovoce.db")
        }
    };

    info!("Initializing store at {}", db_path.display());
    let store = Store::new(&db_path).await?;
    store.init().await?;

    // One registry for the life of the process; ordinals reset on restart
    let pseudonyms = Arc::new(PseudonymRegistry::new());

    let client = Arc::new(ChatClient::new(store, pseudonyms));

    // Restore the configured identity, if any. With SOTTOVOCE_EMAIL unset
    // the client starts signed out.
    let email = std::env::var("SOTTOVOCE_EMAIL").ok();
    let display_name = std::env::var("SOTTOVOCE_DISPLAY_NAME").ok();
    client
        .bootstrap(email.as_deref(), display_name.as_deref())
        .await;

    let app = http::router(client.clone());

    let port = std::env::var("SOTTOVOCE_PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(3000);
    info!("Starting API server on port {}", port);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        res = axum::serve(listener, app) => {
            if let Err(e) = res {
                info!("Server stopped with error: {}", e);
            }
        }
    }

    Ok(())
}
