use anyhow::Context;
use restmailer::{config::Config, init_tracing, run};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let _ = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider().install_default();

    init_tracing();

    let config = Config::from_env().context("failed to load configuration")?;

    run(config).await
}
