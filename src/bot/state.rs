use serde::Deserialize;
use serde::Serialize;

use crate::models::ProjectData;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case", tag = "kind", content = "data")]
pub enum ConversationState {
  #[default]
  Idle,
  AwaitingPrice {
    worker_id: i64,
  },
  AddProject(ProjectDraft),
  Review(ReviewDraft),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectDraft {
  pub stage: ProjectStage,
  pub client_id: i64,
  pub work_type: Option<String>,
  pub subject: Option<String>,
  pub date: Option<String>,
  pub description: Option<String>,
}

impl ProjectDraft {
  pub fn new(client_id: i64) -> Self {
    Self {
      stage: ProjectStage::WorkType,
      client_id,
      work_type: None,
      subject: None,
      date: None,
      description: None,
    }
  }

  /// Completes the draft once every stage before the note is filled.
  pub fn finish(self, note: Option<String>) -> Option<ProjectData> {
    Some(ProjectData {
      work_type: self.work_type?,
      subject: self.subject?,
      date: self.date?,
      description: self.description?,
      price: None,
      note,
      files: Vec::new(),
    })
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProjectStage {
  WorkType,
  Subject,
  Date,
  Description,
  Note,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReviewDraft {
  pub stage: ReviewStage,
  pub client_id: i64,
  pub quality: Option<u8>,
  pub contact: Option<u8>,
  pub terms: Option<u8>,
}

impl ReviewDraft {
  pub fn new(client_id: i64) -> Self {
    Self {
      stage: ReviewStage::Quality,
      client_id,
      quality: None,
      contact: None,
      terms: None,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReviewStage {
  Quality,
  Contact,
  Terms,
  Text,
}
