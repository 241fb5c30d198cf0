use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,local_relay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let state = local_relay::build_state()?;
    let app = local_relay::build_app(state);

    let addr = local_relay::bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "relay listening");

    axum::serve(listener, app).await?;
    Ok(())
}
