use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::MutexGuard;

use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use async_trait::async_trait;
use serde_json::Value;

use crate::db::Collection;
use crate::db::Filter;
use crate::db::Store;
use crate::db::UpdateOp;
use crate::db::document;

type Documents = HashMap<Collection, Vec<(String, Value)>>;

/// Process-local store with the same document semantics as the Postgres one.
#[derive(Default)]
pub struct MemoryStore {
  documents: Mutex<Documents>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, Documents>> {
    self.documents.lock().map_err(|_| anyhow!("memory store lock poisoned"))
  }
}

fn insert_into(documents: &mut Documents, collection: Collection, mut payload: Value) -> Result<String> {
  let key = document::prepare_insert(&mut payload)?;
  let rows = documents.entry(collection).or_default();
  if rows.iter().any(|(existing, _)| existing == &key) {
    bail!("duplicate id {key} in {}", collection.name());
  }
  rows.push((key.clone(), payload));
  Ok(key)
}

#[async_trait]
impl Store for MemoryStore {
  async fn insert(&self, collection: Collection, payload: Value) -> Result<String> {
    let mut documents = self.lock()?;
    insert_into(&mut documents, collection, payload)
  }

  async fn find_one(&self, collection: Collection, filter: &Filter) -> Result<Option<Value>> {
    let documents = self.lock()?;
    Ok(
      documents
        .get(&collection)
        .and_then(|rows| rows.iter().find(|(_, doc)| document::matches(doc, filter)))
        .map(|(_, doc)| doc.clone()),
    )
  }

  async fn find_many(&self, collection: Collection, filter: &Filter) -> Result<Vec<Value>> {
    let documents = self.lock()?;
    Ok(
      documents
        .get(&collection)
        .map(|rows| {
          rows
            .iter()
            .filter(|(_, doc)| document::matches(doc, filter))
            .map(|(_, doc)| doc.clone())
            .collect()
        })
        .unwrap_or_default(),
    )
  }

  async fn delete_one(&self, collection: Collection, filter: &Filter) -> Result<bool> {
    let mut documents = self.lock()?;
    let Some(rows) = documents.get_mut(&collection) else {
      return Ok(false);
    };
    match rows.iter().position(|(_, doc)| document::matches(doc, filter)) {
      Some(index) => {
        rows.remove(index);
        Ok(true)
      },
      None => Ok(false),
    }
  }

  async fn update_one(&self, collection: Collection, filter: &Filter, update: UpdateOp, upsert: bool) -> Result<()> {
    let mut documents = self.lock()?;
    let existing = documents
      .get_mut(&collection)
      .and_then(|rows| rows.iter_mut().find(|(_, doc)| document::matches(doc, filter)));
    if let Some((_, doc)) = existing {
      // apply to a copy so a failed operator leaves the document untouched
      let mut updated = doc.clone();
      document::apply_update(&mut updated, &update)?;
      *doc = updated;
      return Ok(());
    }
    if upsert {
      let mut seeded = document::seed_from_filter(filter)?;
      document::apply_update(&mut seeded, &update)?;
      insert_into(&mut documents, collection, seeded)?;
    }
    Ok(())
  }
}
