use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::Pool;
use sqlx::Postgres;
use sqlx::QueryBuilder;
use sqlx::Row;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use tokio::sync::OnceCell;
use tracing::info;
use tracing::instrument;

use crate::db::Collection;
use crate::db::Condition;
use crate::db::Filter;
use crate::db::Store;
use crate::db::UpdateOp;
use crate::db::document;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Postgres-backed store: one `(id, body jsonb)` table per collection. The
/// pool is created on first use and shared by every handler afterwards.
pub struct PgStore {
  database_url: String,
  ensure_indexes: bool,
  pool: OnceCell<Pool<Postgres>>,
}

impl PgStore {
  pub fn new(database_url: impl Into<String>, ensure_indexes: bool) -> Self {
    Self {
      database_url: database_url.into(),
      ensure_indexes,
      pool: OnceCell::new(),
    }
  }

  async fn pool(&self) -> Result<&Pool<Postgres>> {
    self
      .pool
      .get_or_try_init(|| async {
        let pool = PgPoolOptions::new()
          .max_connections(10)
          .connect(&self.database_url)
          .await?;
        MIGRATOR.run(&pool).await?;
        if self.ensure_indexes {
          apply_indexes(&pool).await?;
        }
        info!(indexes = self.ensure_indexes, "store connection established");
        Ok::<_, anyhow::Error>(pool)
      })
      .await
  }
}

fn index_name(collection: Collection, field: &str) -> String {
  format!("{}_{}_idx", collection.name(), field.replace('.', "_"))
}

fn path_literal(field: &str) -> String {
  format!("{{{}}}", field.replace('.', ","))
}

fn path_segments(field: &str) -> Vec<String> {
  field.split('.').map(str::to_string).collect()
}

fn is_plain_path(field: &str) -> bool {
  !field.is_empty()
    && field
      .split('.')
      .all(|segment| !segment.is_empty() && segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
}

/// `body #> '{a,b}'`, the same expression the indexes are built on. Paths
/// with other characters are bound instead of inlined.
fn push_path<'a>(builder: &mut QueryBuilder<'a, Postgres>, field: &str) {
  builder.push("body #> ");
  if is_plain_path(field) {
    builder.push(format!("'{}'", path_literal(field)));
  } else {
    builder.push_bind(path_segments(field));
  }
}

/// Safe to repeat: every statement is `IF NOT EXISTS`.
#[instrument(skip(pool))]
pub async fn apply_indexes(pool: &Pool<Postgres>) -> Result<()> {
  for collection in Collection::ALL {
    for field in collection.indexed_fields() {
      let statement = format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} ((body #> '{}'))",
        index_name(collection, field),
        collection.name(),
        path_literal(field),
      );
      sqlx::query(&statement).execute(pool).await?;
    }
  }
  Ok(())
}

fn push_where<'a>(builder: &mut QueryBuilder<'a, Postgres>, filter: &Filter) {
  builder.push(" WHERE TRUE");
  for (path, condition) in filter.conditions() {
    builder.push(" AND ");
    if path == document::ID_FIELD {
      match condition {
        Condition::Eq(value) => {
          builder.push("id = ").push_bind(document::id_key(value));
        },
        Condition::In(values) => {
          let keys: Vec<String> = values.iter().filter_map(document::id_key).collect();
          builder.push("id = ANY(").push_bind(keys).push(")");
        },
      }
      continue;
    }
    match condition {
      Condition::Eq(Value::Null) => {
        builder.push("(");
        push_path(builder, path);
        builder.push(" IS NULL OR ");
        push_path(builder, path);
        builder.push(" = 'null'::jsonb)");
      },
      Condition::Eq(value) => {
        push_path(builder, path);
        builder.push(" = ").push_bind(Json(value.clone()));
      },
      Condition::In(values) => {
        push_path(builder, path);
        builder
          .push(" IN (SELECT jsonb_array_elements(")
          .push_bind(Json(Value::Array(values.clone())))
          .push("))");
      },
    }
  }
}

fn select<'a>(collection: Collection, filter: &Filter) -> QueryBuilder<'a, Postgres> {
  let mut builder = QueryBuilder::new(format!("SELECT id, body FROM {}", collection.name()));
  push_where(&mut builder, filter);
  builder
}

#[async_trait]
impl Store for PgStore {
  #[instrument(skip(self, payload), fields(collection = collection.name()))]
  async fn insert(&self, collection: Collection, mut payload: Value) -> Result<String> {
    let pool = self.pool().await?;
    let key = document::prepare_insert(&mut payload)?;
    sqlx::query(&format!("INSERT INTO {} (id, body) VALUES ($1, $2)", collection.name()))
      .bind(&key)
      .bind(Json(&payload))
      .execute(pool)
      .await?;
    Ok(key)
  }

  #[instrument(skip(self, filter), fields(collection = collection.name()))]
  async fn find_one(&self, collection: Collection, filter: &Filter) -> Result<Option<Value>> {
    let pool = self.pool().await?;
    let mut builder = select(collection, filter);
    builder.push(" LIMIT 1");
    let row = builder.build().fetch_optional(pool).await?;
    match row {
      Some(row) => Ok(Some(row.try_get::<Json<Value>, _>("body")?.0)),
      None => Ok(None),
    }
  }

  #[instrument(skip(self, filter), fields(collection = collection.name()))]
  async fn find_many(&self, collection: Collection, filter: &Filter) -> Result<Vec<Value>> {
    let pool = self.pool().await?;
    let mut builder = select(collection, filter);
    builder.push(" ORDER BY created_at ASC");
    let rows = builder.build().fetch_all(pool).await?;
    rows
      .into_iter()
      .map(|row| Ok(row.try_get::<Json<Value>, _>("body")?.0))
      .collect()
  }

  #[instrument(skip(self, filter), fields(collection = collection.name()))]
  async fn delete_one(&self, collection: Collection, filter: &Filter) -> Result<bool> {
    let pool = self.pool().await?;
    let mut builder = QueryBuilder::new(format!(
      "DELETE FROM {table} WHERE id IN (SELECT id FROM {table}",
      table = collection.name()
    ));
    push_where(&mut builder, filter);
    builder.push(" LIMIT 1)");
    let result = builder.build().execute(pool).await?;
    Ok(result.rows_affected() > 0)
  }

  #[instrument(skip(self, filter, update), fields(collection = collection.name()))]
  async fn update_one(&self, collection: Collection, filter: &Filter, update: UpdateOp, upsert: bool) -> Result<()> {
    let pool = self.pool().await?;
    let mut tx = pool.begin().await?;
    let table = collection.name();

    // An upsert keyed by identity seeds the row first so the locked
    // read-modify-write below covers concurrent first writers too.
    let keyed_upsert = upsert && filter.conditions().iter().any(|(path, _)| path == document::ID_FIELD);
    if keyed_upsert {
      let mut seed = document::seed_from_filter(filter)?;
      let key = document::prepare_insert(&mut seed)?;
      sqlx::query(&format!(
        "INSERT INTO {table} (id, body) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING"
      ))
      .bind(&key)
      .bind(Json(&seed))
      .execute(&mut *tx)
      .await?;
    }

    let mut builder = select(collection, filter);
    builder.push(" LIMIT 1 FOR UPDATE");
    let row = builder.build().fetch_optional(&mut *tx).await?;

    match row {
      Some(row) => {
        let id: String = row.try_get("id")?;
        let mut body = row.try_get::<Json<Value>, _>("body")?.0;
        document::apply_update(&mut body, &update)?;
        sqlx::query(&format!("UPDATE {table} SET body = $1 WHERE id = $2"))
          .bind(Json(&body))
          .bind(&id)
          .execute(&mut *tx)
          .await?;
      },
      None if upsert => {
        let mut body = document::seed_from_filter(filter)?;
        document::apply_update(&mut body, &update)?;
        let key = document::prepare_insert(&mut body)?;
        sqlx::query(&format!("INSERT INTO {table} (id, body) VALUES ($1, $2)"))
          .bind(&key)
          .bind(Json(&body))
          .execute(&mut *tx)
          .await?;
      },
      None => {},
    }

    tx.commit().await?;
    Ok(())
  }
}
