use fieldcal::{AppError, AppState, Server, Settings};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let settings = Settings::load()?;
    init_logging(&settings.log_level);
    info!(
        "Calibration data under {:?}, relay chunk size {} bytes",
        settings.data_root, settings.relay_chunk_size
    );

    let state = AppState::from_settings(&settings)?;
    Server::new(settings.bind_addr.clone(), state).start().await
}
