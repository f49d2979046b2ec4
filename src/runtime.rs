use std::sync::Arc;

use tracing::info;

use agmai_storage::db::Database;

use crate::config::Config;
use crate::personas::PersonaCatalog;
use crate::session::SessionMap;

pub struct AppState {
    pub config: Config,
    pub db: Arc<Database>,
    pub personas: PersonaCatalog,
    pub sessions: SessionMap,
}

pub async fn run(config: Config, db: Database) -> anyhow::Result<()> {
    let personas = PersonaCatalog::load(&config.personas_dir);
    let state = Arc::new(AppState {
        config,
        db: Arc::new(db),
        personas,
        sessions: SessionMap::new(),
    });

    info!("Starting Telegram dispatcher");
    crate::telegram::start_bot(state).await
}
