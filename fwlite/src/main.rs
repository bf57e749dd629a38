use fwlite_config::FwliteConfig;
use fwlite_core::Master;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fwlite=info")),
        )
        .init();

    let cfg = FwliteConfig::from_file_or_default("fwlite.conf");
    info!(
        target: "fwlite::master",
        listen = %cfg.fwlite.listen,
        profile = %cfg.fwlite.profile,
        "starting"
    );

    let master = Master::new(cfg);
    master.run().await
}
