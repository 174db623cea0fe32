use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::instrument;
use tracing::warn;

use crate::models::Account;
use crate::models::Bid;
use crate::models::Entity;
use crate::models::PairedChannel;
use crate::models::Profile;
use crate::models::Project;
use crate::models::ProjectStatus;
use crate::models::Review;

pub mod document;
pub mod ledger;
pub mod memory;
pub mod pg;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
  Accounts,
  Projects,
  Channels,
  Bids,
  Reviews,
}

impl Collection {
  pub const ALL: [Collection; 5] = [
    Collection::Accounts,
    Collection::Projects,
    Collection::Channels,
    Collection::Bids,
    Collection::Reviews,
  ];

  pub fn name(self) -> &'static str {
    match self {
      Self::Accounts => "accounts",
      Self::Projects => "projects",
      Self::Channels => "channels",
      Self::Bids => "bids",
      Self::Reviews => "reviews",
    }
  }

  /// Secondary lookup fields. Advisory only, queries work without them.
  pub fn indexed_fields(self) -> &'static [&'static str] {
    match self {
      Self::Projects => &["client_id", "worker_id", "data.subject"],
      Self::Bids => &["client_id", "worker_id"],
      Self::Reviews => &["worker_id"],
      Self::Accounts | Self::Channels => &[],
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
  Eq(Value),
  In(Vec<Value>),
}

/// Exact-match filter over dotted field paths. `_id` addresses the identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
  conditions: Vec<(String, Condition)>,
}

impl Filter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn by_id(id: impl Into<Value>) -> Self {
    Self::new().eq(document::ID_FIELD, id)
  }

  pub fn eq(mut self, path: &str, value: impl Into<Value>) -> Self {
    self.conditions.push((path.to_string(), Condition::Eq(value.into())));
    self
  }

  pub fn one_of(mut self, path: &str, values: Vec<Value>) -> Self {
    self.conditions.push((path.to_string(), Condition::In(values)));
    self
  }

  pub fn conditions(&self) -> &[(String, Condition)] {
    &self.conditions
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
  Set(Vec<(String, Value)>),
  Inc(Vec<(String, i64)>),
}

impl UpdateOp {
  pub fn set(path: &str, value: impl Into<Value>) -> Self {
    Self::Set(vec![(path.to_string(), value.into())])
  }

  pub fn inc(path: &str, delta: i64) -> Self {
    Self::Inc(vec![(path.to_string(), delta)])
  }
}

/// Document storage. Every single-document operation is atomic; sequences of
/// operations are not.
#[async_trait]
pub trait Store: Send + Sync {
  /// Inserts the document and returns its identity, generating one if needed.
  async fn insert(&self, collection: Collection, document: Value) -> Result<String>;

  async fn find_one(&self, collection: Collection, filter: &Filter) -> Result<Option<Value>>;

  async fn find_many(&self, collection: Collection, filter: &Filter) -> Result<Vec<Value>>;

  async fn delete_one(&self, collection: Collection, filter: &Filter) -> Result<bool>;

  async fn update_one(&self, collection: Collection, filter: &Filter, update: UpdateOp, upsert: bool) -> Result<()>;
}

#[derive(Clone)]
pub struct Db {
  store: Arc<dyn Store>,
}

impl Db {
  pub fn new(store: Arc<dyn Store>) -> Self {
    Self { store }
  }

  #[cfg(test)]
  pub fn in_memory() -> Self {
    Self::new(Arc::new(memory::MemoryStore::new()))
  }

  pub fn store(&self) -> &Arc<dyn Store> {
    &self.store
  }

  async fn add<T: Entity>(&self, collection: Collection, entity: &T) -> Result<String> {
    let payload = entity.to_payload()?;
    self.store.insert(collection, payload).await
  }

  async fn get<T: Entity>(&self, collection: Collection, filter: Filter) -> Result<Option<T>> {
    let payload = self.store.find_one(collection, &filter).await?;
    Ok(T::from_payload(payload)?)
  }

  async fn get_many<T: Entity>(&self, collection: Collection, filter: Filter) -> Result<Vec<T>> {
    let payloads = self.store.find_many(collection, &filter).await?;
    let mut entities = Vec::with_capacity(payloads.len());
    for payload in payloads {
      match T::from_payload(Some(payload)) {
        Ok(Some(entity)) => entities.push(entity),
        Ok(None) => {},
        Err(err) => warn!(error = %err, collection = collection.name(), "skipping malformed record"),
      }
    }
    Ok(entities)
  }

  async fn set(&self, collection: Collection, filter: Filter, path: &str, value: Value, upsert: bool) -> Result<()> {
    self
      .store
      .update_one(collection, &filter, UpdateOp::set(path, value), upsert)
      .await
  }

  // accounts

  /// Creates an empty account on first interaction and returns the stored one.
  #[instrument(skip(self))]
  pub async fn ensure_account(&self, user_id: i64) -> Result<Account> {
    self
      .store
      .update_one(Collection::Accounts, &Filter::by_id(user_id), UpdateOp::inc("balance", 0), true)
      .await?;
    Ok(self.get_account(user_id).await?.unwrap_or_else(|| Account::new(user_id)))
  }

  #[instrument(skip(self))]
  pub async fn get_account(&self, user_id: i64) -> Result<Option<Account>> {
    self.get(Collection::Accounts, Filter::by_id(user_id)).await
  }

  #[instrument(skip(self))]
  pub async fn delete_account(&self, user_id: i64) -> Result<bool> {
    self
      .store
      .delete_one(Collection::Accounts, &Filter::by_id(user_id))
      .await
  }

  #[instrument(skip(self))]
  pub async fn update_account_subjects(&self, user_id: i64, subjects: &BTreeSet<String>) -> Result<()> {
    let value = serde_json::to_value(subjects)?;
    self
      .set(Collection::Accounts, Filter::by_id(user_id), "subjects", value, true)
      .await
  }

  #[instrument(skip(self, profile))]
  pub async fn update_account_profile(&self, user_id: i64, profile: &Profile) -> Result<()> {
    let value = profile.to_payload()?;
    self
      .set(Collection::Accounts, Filter::by_id(user_id), "profile", value, true)
      .await
  }

  #[instrument(skip(self))]
  pub async fn update_account_page_url(&self, user_id: i64, page_url: &str) -> Result<()> {
    self
      .set(Collection::Accounts, Filter::by_id(user_id), "page_url", page_url.into(), false)
      .await
  }

  #[instrument(skip(self, value))]
  pub async fn update_profile_field(&self, user_id: i64, field: &str, value: Value) -> Result<()> {
    self
      .set(Collection::Accounts, Filter::by_id(user_id), &format!("profile.{field}"), value, true)
      .await
  }

  // projects

  #[instrument(skip(self, project))]
  pub async fn add_project(&self, project: &Project) -> Result<String> {
    self.add(Collection::Projects, project).await
  }

  #[instrument(skip(self))]
  pub async fn get_project(&self, project_id: &str) -> Result<Option<Project>> {
    self.get(Collection::Projects, Filter::by_id(project_id)).await
  }

  #[instrument(skip(self))]
  pub async fn get_projects_by_client(&self, client_id: i64) -> Result<Vec<Project>> {
    self
      .get_many(Collection::Projects, Filter::new().eq("client_id", client_id))
      .await
  }

  #[instrument(skip(self))]
  pub async fn get_projects_by_worker(&self, worker_id: i64) -> Result<Vec<Project>> {
    self
      .get_many(Collection::Projects, Filter::new().eq("worker_id", worker_id))
      .await
  }

  /// Flat subject filter, no ranking.
  #[instrument(skip(self))]
  pub async fn get_projects_by_subjects(&self, subjects: &BTreeSet<String>, only_open: bool) -> Result<Vec<Project>> {
    if subjects.is_empty() {
      return Ok(Vec::new());
    }
    let values = subjects.iter().cloned().map(Value::from).collect();
    let mut filter = Filter::new().one_of("data.subject", values);
    if only_open {
      filter = filter.eq("status", ProjectStatus::Open.as_str());
    }
    self.get_many(Collection::Projects, filter).await
  }

  #[instrument(skip(self))]
  pub async fn delete_project(&self, project_id: &str) -> Result<bool> {
    self
      .store
      .delete_one(Collection::Projects, &Filter::by_id(project_id))
      .await
  }

  /// Sets one project field. Never creates the project.
  #[instrument(skip(self, value))]
  pub async fn update_project(&self, project_id: &str, field: &str, value: Value) -> Result<()> {
    self
      .set(Collection::Projects, Filter::by_id(project_id), field, value, false)
      .await
  }

  pub async fn set_project_status(&self, project_id: &str, status: ProjectStatus) -> Result<()> {
    self.update_project(project_id, "status", status.as_str().into()).await
  }

  pub async fn set_project_worker(&self, project_id: &str, worker_id: i64) -> Result<()> {
    self.update_project(project_id, "worker_id", worker_id.into()).await
  }

  pub async fn set_project_price(&self, project_id: &str, price: i64) -> Result<()> {
    self.update_project(project_id, "data.price", price.into()).await
  }

  pub async fn set_project_channels(&self, project_id: &str, client_chat_id: i64, worker_chat_id: i64) -> Result<()> {
    self
      .store
      .update_one(
        Collection::Projects,
        &Filter::by_id(project_id),
        UpdateOp::Set(vec![
          ("client_chat_id".to_string(), client_chat_id.into()),
          ("worker_chat_id".to_string(), worker_chat_id.into()),
        ]),
        false,
      )
      .await
  }

  // channels

  #[instrument(skip(self, channel))]
  pub async fn add_channel(&self, channel: &PairedChannel) -> Result<String> {
    self.add(Collection::Channels, channel).await
  }

  #[instrument(skip(self))]
  pub async fn get_channel(&self, chat_id: i64) -> Result<Option<PairedChannel>> {
    self.get(Collection::Channels, Filter::by_id(chat_id)).await
  }

  #[instrument(skip(self))]
  pub async fn find_pair(&self, chat_id: i64) -> Result<Option<i64>> {
    Ok(self.get_channel(chat_id).await?.map(|channel| channel.pair_id))
  }

  #[instrument(skip(self))]
  pub async fn delete_channel(&self, chat_id: i64) -> Result<bool> {
    self
      .store
      .delete_one(Collection::Channels, &Filter::by_id(chat_id))
      .await
  }

  // bids

  #[instrument(skip(self, bid))]
  pub async fn add_bid(&self, bid: &Bid) -> Result<String> {
    self.add(Collection::Bids, bid).await
  }

  #[instrument(skip(self))]
  pub async fn get_bids_by_project(&self, project_id: &str) -> Result<Vec<Bid>> {
    self
      .get_many(Collection::Bids, Filter::new().eq("project_id", project_id))
      .await
  }

  // reviews

  #[instrument(skip(self, review))]
  pub async fn add_review(&self, review: &Review) -> Result<String> {
    self.add(Collection::Reviews, review).await
  }

  #[instrument(skip(self))]
  pub async fn get_review_by_project(&self, project_id: &str) -> Result<Option<Review>> {
    self
      .get(Collection::Reviews, Filter::new().eq("project_id", project_id))
      .await
  }

  #[instrument(skip(self))]
  pub async fn get_reviews_by_worker(&self, worker_id: i64) -> Result<Vec<Review>> {
    self
      .get_many(Collection::Reviews, Filter::new().eq("worker_id", worker_id))
      .await
  }
}
