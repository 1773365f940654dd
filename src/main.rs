use anyhow::Context;
use tracing::info;

use tradeloop::app::App;
use tradeloop::config::Config;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => {
            Config::load(&path).with_context(|| format!("loading config from {path}"))?
        }
        None => {
            eprintln!("no config file given, using defaults");
            Config::default()
        }
    };
    config.init_logging();
    info!("Configuration loaded");

    let app = App::new(config).context("building engine")?;
    app.run().await.context("running engine")?;
    Ok(())
}
