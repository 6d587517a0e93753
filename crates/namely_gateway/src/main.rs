// Namely Gateway Server
//
// Browser-facing OAuth2 client and authenticated API proxy for Namely tenants

use namely_gateway::{start_server, GatewayConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "namely_gateway=info,tower_http=info".into()),
        )
        .init();

    // Missing credentials are fatal here, never per request.
    let config = GatewayConfig::from_env()?;
    tracing::info!(
        "Namely Gateway v{} (client {})",
        env!("CARGO_PKG_VERSION"),
        config.client_id
    );

    start_server(config).await?;

    Ok(())
}
