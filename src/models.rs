use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EntityError {
  #[error("failed to construct {entity}: {source}")]
  Construction {
    entity: &'static str,
    #[source]
    source: serde_json::Error,
  },
  #[error("failed to serialize {entity}: {source}")]
  Serialization {
    entity: &'static str,
    #[source]
    source: serde_json::Error,
  },
  #[error("{0} does not have an id field")]
  NoIdentity(&'static str),
  #[error("{0} has not been stored yet")]
  Unsaved(&'static str),
  #[error("score {0} is outside 1..=5")]
  ScoreOutOfRange(u8),
}

/// Stored document identity. Projects, bids and reviews get a generated id on
/// insert; accounts and channels are keyed by their telegram id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocId {
  Int(i64),
  Generated(Uuid),
}

impl DocId {
  pub fn generate() -> Self {
    Self::Generated(Uuid::new_v4())
  }
}

/// Single reading of an identity regardless of how it is stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdValue {
  Int(i64),
  Str(String),
}

impl From<&DocId> for IdValue {
  fn from(id: &DocId) -> Self {
    match id {
      DocId::Int(value) => Self::Int(*value),
      DocId::Generated(uuid) => Self::Str(uuid.to_string()),
    }
  }
}

impl fmt::Display for IdValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Int(value) => write!(f, "{value}"),
      Self::Str(value) => f.write_str(value),
    }
  }
}

pub trait Entity: Serialize + DeserializeOwned {
  const NAME: &'static str;

  /// Raw identity. Entities without an identity field keep the default.
  fn doc_id(&self) -> Result<Option<DocId>, EntityError> {
    Err(EntityError::NoIdentity(Self::NAME))
  }

  fn id(&self) -> Result<Option<IdValue>, EntityError> {
    Ok(self.doc_id()?.as_ref().map(IdValue::from))
  }

  /// Identity rendered as a string key, for stored entities only.
  fn key(&self) -> Result<String, EntityError> {
    self
      .id()?
      .map(|id| id.to_string())
      .ok_or(EntityError::Unsaved(Self::NAME))
  }

  /// Builds the entity from an untyped payload. Unknown keys are dropped and an
  /// absent or empty payload yields `None`.
  fn from_payload(payload: Option<Value>) -> Result<Option<Self>, EntityError> {
    match payload {
      None | Some(Value::Null) => Ok(None),
      Some(Value::Object(map)) if map.is_empty() => Ok(None),
      Some(value) => serde_json::from_value(value)
        .map(Some)
        .map_err(|source| EntityError::Construction {
          entity: Self::NAME,
          source,
        }),
    }
  }

  fn to_payload(&self) -> Result<Value, EntityError> {
    serde_json::to_value(self).map_err(|source| EntityError::Serialization {
      entity: Self::NAME,
      source,
    })
  }
}

fn nested<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
  D: Deserializer<'de>,
  T: DeserializeOwned,
{
  match Option::<Value>::deserialize(deserializer)? {
    None | Some(Value::Null) => Ok(None),
    Some(Value::Object(map)) if map.is_empty() => Ok(None),
    Some(value) => serde_json::from_value(value).map(Some).map_err(serde::de::Error::custom),
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
  pub nickname: String,
  pub phone: String,
  pub email: String,
  pub biography: String,
  #[serde(default)]
  pub completed_works: i64,
  #[serde(default)]
  pub works: Vec<String>,
}

impl Profile {
  /// Placeholder profile, created before the first field edit.
  pub fn blank() -> Self {
    Self {
      nickname: "-".to_string(),
      phone: "-".to_string(),
      email: "-".to_string(),
      biography: "-".to_string(),
      completed_works: 0,
      works: Vec::new(),
    }
  }
}

impl Entity for Profile {
  const NAME: &'static str = "Profile";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
  #[serde(rename = "_id")]
  pub id: i64, // tg id
  #[serde(default)]
  pub balance: i64,
  #[serde(default)]
  pub subjects: BTreeSet<String>,
  #[serde(default, deserialize_with = "nested")]
  pub profile: Option<Profile>,
  #[serde(default)]
  pub page_url: Option<String>,
}

impl Account {
  pub fn new(id: i64) -> Self {
    Self {
      id,
      balance: 0,
      subjects: BTreeSet::new(),
      profile: None,
      page_url: None,
    }
  }
}

impl Entity for Account {
  const NAME: &'static str = "Account";

  fn doc_id(&self) -> Result<Option<DocId>, EntityError> {
    Ok(Some(DocId::Int(self.id)))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
  Open,
  InProgress,
  Completed,
}

impl ProjectStatus {
  pub fn label(self) -> &'static str {
    match self {
      Self::Open => "Open",
      Self::InProgress => "In progress",
      Self::Completed => "Completed",
    }
  }

  pub fn emoji(self) -> &'static str {
    match self {
      Self::Open => "🔥",
      Self::InProgress => "⏳",
      Self::Completed => "✅",
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Open => "open",
      Self::InProgress => "in_progress",
      Self::Completed => "completed",
    }
  }

  /// Status only ever moves forward.
  pub fn can_advance_to(self, next: ProjectStatus) -> bool {
    next > self
  }
}

impl FromStr for ProjectStatus {
  type Err = String;

  fn from_str(value: &str) -> Result<Self, Self::Err> {
    match value.trim().to_lowercase().as_str() {
      "open" => Ok(Self::Open),
      "in_progress" | "inprogress" => Ok(Self::InProgress),
      "completed" => Ok(Self::Completed),
      other => Err(format!("unknown status: {other}")),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectData {
  pub work_type: String,
  pub subject: String,
  pub date: String,
  pub description: String,
  #[serde(default)]
  pub price: Option<i64>,
  #[serde(default)]
  pub note: Option<String>,
  #[serde(default)]
  pub files: Vec<String>,
}

impl Entity for ProjectData {
  const NAME: &'static str = "ProjectData";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
  #[serde(rename = "_id", default)]
  pub id: Option<DocId>,
  #[serde(default, deserialize_with = "nested")]
  pub data: Option<ProjectData>,
  pub status: ProjectStatus,
  pub client_id: i64,
  #[serde(default)]
  pub worker_id: Option<i64>,
  #[serde(default)]
  pub post_url: Option<String>,
  #[serde(default)]
  pub client_chat_id: Option<i64>,
  #[serde(default)]
  pub worker_chat_id: Option<i64>,
}

impl Project {
  pub fn new(client_id: i64, data: ProjectData) -> Self {
    Self {
      id: None,
      data: Some(data),
      status: ProjectStatus::Open,
      client_id,
      worker_id: None,
      post_url: None,
      client_chat_id: None,
      worker_chat_id: None,
    }
  }

  pub fn price(&self) -> Option<i64> {
    self.data.as_ref().and_then(|data| data.price)
  }
}

impl Entity for Project {
  const NAME: &'static str = "Project";

  fn doc_id(&self) -> Result<Option<DocId>, EntityError> {
    Ok(self.id.clone())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelRole {
  Client,
  Worker,
}

impl ChannelRole {
  pub fn counterpart(self) -> Self {
    match self {
      Self::Client => Self::Worker,
      Self::Worker => Self::Client,
    }
  }
}

impl fmt::Display for ChannelRole {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Client => f.write_str("client"),
      Self::Worker => f.write_str("worker"),
    }
  }
}

/// One of the two group chats bound to a project. `pair_id` always points at
/// the other chat of the same project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairedChannel {
  #[serde(rename = "_id")]
  pub id: i64, // tg chat id
  pub project_id: String,
  pub role: ChannelRole,
  pub owner_user_id: i64,
  pub external_link: String,
  pub pair_id: i64,
}

impl Entity for PairedChannel {
  const NAME: &'static str = "PairedChannel";

  fn doc_id(&self) -> Result<Option<DocId>, EntityError> {
    Ok(Some(DocId::Int(self.id)))
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
  #[serde(rename = "_id", default)]
  pub id: Option<DocId>,
  pub client_id: i64,
  pub project_id: String,
  #[serde(default)]
  pub worker_id: Option<i64>,
  #[serde(default)]
  pub text: Option<String>,
}

impl Entity for Bid {
  const NAME: &'static str = "Bid";

  fn doc_id(&self) -> Result<Option<DocId>, EntityError> {
    Ok(self.id.clone())
  }
}

/// Scores are bounded on every construction path, stored payloads included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRating")]
pub struct Rating {
  pub quality: u8,
  pub contact: u8,
  pub terms: u8,
}

impl Rating {
  pub const MAX_SCORE: u8 = 5;

  pub fn new(quality: u8, contact: u8, terms: u8) -> Result<Self, EntityError> {
    for score in [quality, contact, terms] {
      check_score(score)?;
    }
    Ok(Self {
      quality,
      contact,
      terms,
    })
  }

  pub fn average(&self) -> f32 {
    let total = u16::from(self.quality) + u16::from(self.contact) + u16::from(self.terms);
    f32::from(total) / 3.0
  }
}

#[derive(Deserialize)]
struct RawRating {
  quality: u8,
  contact: u8,
  terms: u8,
}

impl TryFrom<RawRating> for Rating {
  type Error = EntityError;

  fn try_from(raw: RawRating) -> Result<Self, Self::Error> {
    Self::new(raw.quality, raw.contact, raw.terms)
  }
}

pub fn check_score(score: u8) -> Result<u8, EntityError> {
  if (1 ..= Rating::MAX_SCORE).contains(&score) {
    Ok(score)
  } else {
    Err(EntityError::ScoreOutOfRange(score))
  }
}

impl Entity for Rating {
  const NAME: &'static str = "Rating";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
  #[serde(rename = "_id", default)]
  pub id: Option<DocId>,
  pub client_id: i64,
  pub client_name: String,
  pub worker_id: i64,
  pub project_id: String,
  #[serde(default, deserialize_with = "nested")]
  pub rating: Option<Rating>,
  pub text: String,
}

impl Entity for Review {
  const NAME: &'static str = "Review";

  fn doc_id(&self) -> Result<Option<DocId>, EntityError> {
    Ok(self.id.clone())
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn project_payload() -> Value {
    json!({
      "_id": "6f1c1a52-8f8b-4c38-9a2b-0d6d1f7e4a10",
      "data": {
        "work_type": "Essay",
        "subject": "History",
        "date": "2024-05-17",
        "description": "Ten pages",
        "price": null,
        "note": "cite sources",
        "files": [],
      },
      "status": "open",
      "client_id": 1,
      "worker_id": null,
      "post_url": null,
      "client_chat_id": null,
      "worker_chat_id": null,
    })
  }

  #[test]
  fn absent_or_empty_payload_yields_none() {
    assert!(Account::from_payload(None).unwrap().is_none());
    assert!(Account::from_payload(Some(Value::Null)).unwrap().is_none());
    assert!(Account::from_payload(Some(json!({}))).unwrap().is_none());
  }

  #[test]
  fn unknown_keys_are_dropped() {
    let account = Account::from_payload(Some(json!({"_id": 7, "balance": 30, "legacy": true})))
      .unwrap()
      .unwrap();
    assert_eq!(account.balance, 30);
    let payload = account.to_payload().unwrap();
    assert!(payload.get("legacy").is_none());
  }

  #[test]
  fn absent_nested_payload_is_none() {
    let account = Account::from_payload(Some(json!({"_id": 7, "profile": null}))).unwrap().unwrap();
    assert!(account.profile.is_none());

    let review = Review::from_payload(Some(json!({
      "client_id": 1,
      "client_name": "Ann",
      "worker_id": 2,
      "project_id": "p",
      "text": "ok",
    })))
    .unwrap()
    .unwrap();
    assert!(review.rating.is_none());
  }

  #[test]
  fn nested_payload_is_built_first() {
    let account = Account::from_payload(Some(json!({
      "_id": 7,
      "profile": {
        "nickname": "nick",
        "phone": "-",
        "email": "-",
        "biography": "bio",
        "unknown": 1,
      },
    })))
    .unwrap()
    .unwrap();
    let profile = account.profile.unwrap();
    assert_eq!(profile.nickname, "nick");
    assert_eq!(profile.completed_works, 0);
  }

  #[test]
  fn missing_required_field_is_a_construction_error() {
    let err = Project::from_payload(Some(json!({"status": "open"}))).unwrap_err();
    assert!(matches!(err, EntityError::Construction { entity: "Project", .. }));

    let err = Account::from_payload(Some(json!({"_id": 1, "profile": {"nickname": "x"}}))).unwrap_err();
    assert!(matches!(err, EntityError::Construction { entity: "Account", .. }));
  }

  #[test]
  fn full_payload_survives_reserialization() {
    let mut payload = project_payload();
    let project = Project::from_payload(Some(payload.clone())).unwrap().unwrap();
    payload["extra"] = json!("dropped");
    let reserialized = project.to_payload().unwrap();
    payload.as_object_mut().unwrap().remove("extra");
    assert_eq!(reserialized, payload);
  }

  #[test]
  fn identities_normalize_to_string_or_integer() {
    let project = Project::from_payload(Some(project_payload())).unwrap().unwrap();
    assert_eq!(
      project.id().unwrap(),
      Some(IdValue::Str("6f1c1a52-8f8b-4c38-9a2b-0d6d1f7e4a10".to_string()))
    );
    assert_eq!(Account::new(42).id().unwrap(), Some(IdValue::Int(42)));
    assert_eq!(Account::new(42).key().unwrap(), "42");
  }

  #[test]
  fn entities_without_identity_reject_id_access() {
    let rating = Rating::new(5, 4, 3).unwrap();
    assert!(matches!(rating.id(), Err(EntityError::NoIdentity("Rating"))));
  }

  #[test]
  fn unsaved_entities_have_no_key() {
    let project = Project::from_payload(Some(project_payload())).unwrap().unwrap();
    let unsaved = Project { id: None, ..project };
    assert!(matches!(unsaved.key(), Err(EntityError::Unsaved("Project"))));
  }

  #[test]
  fn status_only_advances() {
    assert!(ProjectStatus::Open.can_advance_to(ProjectStatus::InProgress));
    assert!(ProjectStatus::InProgress.can_advance_to(ProjectStatus::Completed));
    assert!(!ProjectStatus::Completed.can_advance_to(ProjectStatus::Open));
    assert!(!ProjectStatus::InProgress.can_advance_to(ProjectStatus::InProgress));
  }

  #[test]
  fn stored_rating_out_of_range_is_a_construction_error() {
    let payload = json!({
      "_id": 4,
      "client_id": 1,
      "client_name": "Olena",
      "worker_id": 2,
      "project_id": "p",
      "rating": {"quality": 200, "contact": 200, "terms": 200},
      "text": "ok",
    });
    assert!(matches!(
      Review::from_payload(Some(payload)),
      Err(EntityError::Construction { entity: "Review", .. })
    ));

    let rating = Rating::from_payload(Some(json!({"quality": 5, "contact": 5, "terms": 5})))
      .unwrap()
      .unwrap();
    assert_eq!(rating.average(), 5.0);
  }

  #[test]
  fn rating_scores_are_bounded() {
    assert!(Rating::new(1, 5, 3).is_ok());
    assert!(matches!(Rating::new(0, 5, 3), Err(EntityError::ScoreOutOfRange(0))));
    assert!(matches!(Rating::new(1, 6, 3), Err(EntityError::ScoreOutOfRange(6))));
  }
}
