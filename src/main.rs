pub mod access;
pub mod capacity;
pub mod config;
pub mod err;
pub mod extract;
pub mod links;
pub mod models;
pub mod notify;
pub mod parent;
pub mod registry;
pub mod retry;
pub mod routes;
pub mod sessions;
pub mod store;
pub mod students;
pub mod token;

use std::sync::Arc;

use serde::Serialize;

use crate::config::Config;
use crate::err::{Error, Fine, Maybe, Nothing};
use crate::notify::LogNotifier;
use crate::retry::Retrying;
use crate::routes::AppContext;
use crate::store::{MemoryStore, PgStore, RecordStore};

pub type Payload<T> = axum::response::Result<Maybe<T>, Error>;

pub fn proceeds<V>(value: V) -> Payload<V>
where
    V: Serialize,
{
    Ok(Fine(value))
}

pub fn breaks<V>(err: Error) -> Payload<V>
where
    V: Serialize,
{
    log::debug!("request refused: {}", err.kind());
    Ok(Nothing(err))
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn RecordStore>> {
    let store: Arc<dyn RecordStore> = match &config.database_url {
        Some(url) => {
            let pg = PgStore::connect(url, config.max_connections).await?;
            pg.migrate().await?;
            log::info!("Connected to Postgres record store");
            Arc::new(Retrying::new(pg, config.retry))
        }
        None => {
            log::warn!("DATABASE_URL is not set, records are kept in memory only");
            Arc::new(Retrying::new(MemoryStore::new(), config.retry))
        }
    };
    Ok(store)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = Config::from_env()?;
    let ctx = AppContext {
        store: open_store(&config).await?,
        notifier: Arc::new(LogNotifier),
        capacity: config.capacity,
        tokens: config.tokens,
    };
    let app = routes::app(ctx, config.request_timeout);

    log::info!(
        "Starting TutorDesk HTTP Server on http://{} (active student limit {})",
        config.bind,
        config.capacity.limit
    );
    axum::Server::bind(&config.bind)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}
