use approvion::config;
use approvion::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Load configuration (never overwrite existing file on failure)
    let config = match config::load_config() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(
                "Failed to load config: {}. Using in-memory defaults (not saving).",
                e
            );
            config::AppConfig::default()
        }
    };

    let port = config.server.listen_port;
    let state = AppState::new(config);
    state.spawn_background();

    approvion::api::run_server(state, port).await?;
    Ok(())
}
