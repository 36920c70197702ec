use std::sync::Arc;

use config::shared::AppConfig;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing("api");

    let app_config: AppConfig = config::load_config()?;
    app_config.validate()?;

    let config = Arc::new(app_config);
    info!(
        host = %config.api.host,
        port = config.api.port,
        "starting sync trigger server"
    );

    let server = api::run_server(config)?;
    server.await?;

    Ok(())
}
