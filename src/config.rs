use std::env;
use std::str::FromStr;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;

use crate::relay::DEFAULT_CACHE_SIZE;

pub const DEFAULT_CURRENCY: &str = "UAH";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
  Postgres { database_url: String, ensure_indexes: bool },
  Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
  pub bot_token: String,
  pub store: StoreBackend,
  pub admin_id: i64,
  pub block_phrases: Option<Vec<String>>,
  pub relay_cache_size: usize,
  pub currency: String,
}

impl Config {
  pub fn from_env() -> Result<Self> {
    let bot_token = env::var("BOT_TOKEN")
      .or_else(|_| env::var("TELOXIDE_TOKEN"))
      .context("BOT_TOKEN or TELOXIDE_TOKEN must be set")?;
    let admin_id = env::var("ADMIN_ID")
      .context("ADMIN_ID must be set")?
      .trim()
      .parse::<i64>()
      .context("ADMIN_ID must be an integer")?;

    let store = match env::var("STORE").unwrap_or_default().trim().to_lowercase().as_str() {
      "" | "postgres" => StoreBackend::Postgres {
        database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
        ensure_indexes: parse_or("DB_INDEXES", env::var("DB_INDEXES").ok(), true),
      },
      "memory" => StoreBackend::Memory,
      other => bail!("unknown STORE backend: {other}"),
    };

    let block_phrases = env::var("BLOCK_PHRASES").ok().and_then(|raw| {
      let phrases = parse_phrases(&raw);
      (!phrases.is_empty()).then_some(phrases)
    });

    Ok(Self {
      bot_token,
      store,
      admin_id,
      block_phrases,
      relay_cache_size: parse_or("RELAY_CACHE_SIZE", env::var("RELAY_CACHE_SIZE").ok(), DEFAULT_CACHE_SIZE),
      currency: env::var("CURRENCY")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
    })
  }

  pub fn store_kind(&self) -> &'static str {
    match self.store {
      StoreBackend::Postgres { .. } => "postgres",
      StoreBackend::Memory => "memory",
    }
  }
}

/// Optional setting: a malformed value is reported and replaced by the default.
fn parse_or<T: FromStr>(name: &str, raw: Option<String>, default: T) -> T
where
  T::Err: std::fmt::Display,
{
  let Some(raw) = raw else {
    return default;
  };
  match raw.trim().parse::<T>() {
    Ok(value) => value,
    Err(err) => {
      tracing::warn!(name, value = raw, error = %err, "invalid setting, using default");
      default
    },
  }
}

fn parse_phrases(raw: &str) -> Vec<String> {
  raw
    .split(',')
    .map(str::trim)
    .filter(|phrase| !phrase.is_empty())
    .map(str::to_string)
    .collect()
}
