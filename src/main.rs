use clap::{Parser, Subcommand};
use tracing::info;

use agmai::config::Config;
use agmai::runtime;
use agmai_storage::db::Database;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "agmai", version = VERSION, about = "Telegram AI chatbot gateway")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the bot
    Start,
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,agmai=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging();

    match cli.command {
        Command::Start => {
            let config = Config::load().map_err(|e| {
                anyhow::anyhow!("Failed to load config (set AGMAI_CONFIG or create agmai.config.yaml): {e}")
            })?;
            let db = Database::new(&config.data_dir)?;
            info!("agmai v{VERSION} starting, data dir {}", config.data_dir);
            runtime::run(config, db).await
        }
    }
}
