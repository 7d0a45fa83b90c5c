use huawei_solar_api::{establish, Config, InverterError, InverterReader};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Huawei solar API");
    let config = Config::from_env()?;
    let inverter = config.inverter.clone();

    huawei_solar_api::run(config, move || async move {
        let session = establish(&inverter.host, inverter.port, inverter.timeout).await?;
        Ok::<_, InverterError>(Arc::new(session) as Arc<dyn InverterReader>)
    })
    .await
}
