use std::path::PathBuf;

use clap::Parser;
use keyrelay::Config;
use keyrelay::config::LogFormat;
use tracing_subscriber::EnvFilter;

/// Multi-key LLM reverse proxy: key-pool scheduler and request dispatcher.
#[derive(Debug, Parser)]
#[command(name = "keyrelay", version, about)]
struct Cli {
	/// Path to the YAML or JSON config file.
	#[arg(long, env = "KEYRELAY_CONFIG", default_value = "config.yaml")]
	config: PathBuf,
}

fn init_tracing(format: LogFormat) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let registry = tracing_subscriber::fmt().with_env_filter(filter);
	match format {
		LogFormat::Json => registry.json().init(),
		LogFormat::Text => registry.init(),
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	let config = Config::load(&cli.config)?;
	init_tracing(config.log_format);

	tracing::info!(config = %cli.config.display(), "starting keyrelay");
	let server = keyrelay::ProxyServer::build(config).await?;
	server.run().await
}
