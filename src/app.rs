use std::sync::Arc;

use teloxide::dispatching::UpdateHandler;
use teloxide::dispatching::dialogue::InMemStorage;
use teloxide::dptree;
use teloxide::prelude::*;

use crate::bot;
use crate::bot::AppContext;
use crate::bot::DialogueStorage;
use crate::config::Config;
use crate::config::StoreBackend;
use crate::db::Db;
use crate::db::Store;
use crate::db::memory::MemoryStore;
use crate::db::pg::PgStore;
use crate::guard::ContentGuard;
use crate::relay::Relay;
use crate::session::Sessions;
use crate::transport::TelegramTransport;
use crate::transport::Transport;

pub struct App {
  bot: Bot,
  context: Arc<AppContext>,
  handler: UpdateHandler<anyhow::Error>,
}

impl App {
  pub fn new(bot: Bot, config: Config) -> Self {
    let store: Arc<dyn Store> = match config.store {
      StoreBackend::Postgres {
        database_url,
        ensure_indexes,
      } => Arc::new(PgStore::new(database_url, ensure_indexes)),
      StoreBackend::Memory => Arc::new(MemoryStore::new()),
    };
    let db = Db::new(store);
    let transport: Arc<dyn Transport> = Arc::new(TelegramTransport::new(bot.clone()));
    let guard = match config.block_phrases {
      Some(phrases) => ContentGuard::new(phrases),
      None => ContentGuard::default(),
    };

    let sessions = Arc::new(Sessions::new(db.clone(), transport.clone(), config.currency));
    let relay = Arc::new(Relay::new(
      db.clone(),
      sessions.clone(),
      transport.clone(),
      guard,
      config.admin_id,
      config.relay_cache_size,
    ));
    let context = Arc::new(AppContext::new(db, transport, sessions, relay, config.admin_id));
    let handler = bot::build_schema();
    Self { bot, context, handler }
  }

  pub async fn run(self) -> anyhow::Result<()> {
    let storage: Arc<DialogueStorage> = InMemStorage::new();

    let me = self.bot.get_me().await?;

    Dispatcher::builder(self.bot.clone(), self.handler)
      .dependencies(dptree::deps![self.context.clone(), storage.clone(), me])
      .enable_ctrlc_handler()
      .build()
      .dispatch()
      .await;

    Ok(())
  }
}
