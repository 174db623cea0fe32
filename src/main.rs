mod app;
mod bot;
mod config;
mod db;
mod guard;
mod models;
mod relay;
mod session;
mod telemetry;
mod transport;
mod util;

use anyhow::Result;
use teloxide::prelude::Bot;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
  telemetry::init()?;
  let config = config::Config::from_env()?;
  info!(
    admin_id = config.admin_id,
    store = config.store_kind(),
    currency = %config.currency,
    "starting bot"
  );

  let bot = Bot::new(config.bot_token.clone());
  let app = app::App::new(bot, config);
  app.run().await
}
