//! Project lifecycle for a pair of linked channels.
//!
//! Role and status are resolved per event from the channel record and its
//! project. Every action is checked against [`Action::actor`] and
//! [`Action::allows`] before anything is written.

use std::sync::Arc;

use futures::future::try_join;
use teloxide::types::ChatId;
use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::bot::keyboards;
use crate::bot::templates;
use crate::db::Db;
use crate::models::Bid;
use crate::models::ChannelRole;
use crate::models::PairedChannel;
use crate::models::Project;
use crate::models::ProjectStatus;
use crate::models::Rating;
use crate::models::Review;
use crate::transport::Transport;
use crate::util::PriceError;
use crate::util::format_price;
use crate::util::parse_price;

#[derive(Debug, Error)]
pub enum SessionError {
  #[error("action requires the {0} side")]
  WrongRole(ChannelRole),
  #[error("action not allowed while project is {0:?}")]
  WrongStatus(ProjectStatus),
  #[error(transparent)]
  InvalidPrice(#[from] PriceError),
  #[error("price {price} exceeds balance {balance}")]
  InsufficientFunds { price: i64, balance: i64 },
  #[error("callback does not match the current session")]
  PayloadMismatch,
  #[error("session is missing its {0}")]
  Incomplete(&'static str),
  #[error("project already has a review")]
  AlreadyReviewed,
  #[error("status cannot move from {from:?} to {to:?}")]
  StatusRegression { from: ProjectStatus, to: ProjectStatus },
  #[error("project {0} not found")]
  ProjectNotFound(String),
  #[error("chat {0} is already paired")]
  AlreadyPaired(i64),
  #[error("client and worker chats must differ")]
  SameChat,
  #[error(transparent)]
  Internal(#[from] anyhow::Error),
}

impl SessionError {
  /// Role and status mismatches mean the event does not apply here.
  pub fn is_not_applicable(&self) -> bool {
    matches!(self, Self::WrongRole(_) | Self::WrongStatus(_))
  }

  pub fn user_message(&self, currency: &str) -> String {
    match self {
      Self::WrongRole(role) => format!("Only the {role} can do this."),
      Self::WrongStatus(status) => format!("Not available while the project is {}.", status.label().to_lowercase()),
      Self::InvalidPrice(PriceError::InvalidFormat) => "⚠️ The price must be a whole number, e.g. 500.".to_string(),
      Self::InvalidPrice(PriceError::Zero) => "⚠️ The price must be greater than zero.".to_string(),
      Self::InvalidPrice(PriceError::OutOfRange) => "⚠️ That price is too large.".to_string(),
      Self::InsufficientFunds { price, balance } => format!(
        "💸 Not enough funds: the price is {} and your balance is {}.",
        format_price(*price, currency),
        format_price(*balance, currency)
      ),
      Self::PayloadMismatch => "⚠️ This button is no longer valid.".to_string(),
      Self::Incomplete(what) => format!("⚠️ The session is not set up yet ({what} missing). Please call the admin."),
      Self::AlreadyReviewed => "⭐ You have already reviewed this project.".to_string(),
      Self::StatusRegression { from, to } => {
        format!("Status cannot go back from {} to {}.", from.label(), to.label())
      },
      Self::ProjectNotFound(id) => format!("Project {id} not found."),
      Self::AlreadyPaired(chat) => format!("Chat {chat} is already paired."),
      Self::SameChat => "Client and worker chats must be different.".to_string(),
      Self::Internal(_) => "Temporary error, try again later.".to_string(),
    }
  }
}

/// Lifecycle phase. `PricedAssigned` is not stored: it is an open project
/// that already has a worker and a price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  Open,
  PricedAssigned,
  InProgress,
  Completed,
}

pub fn phase(project: &Project) -> Phase {
  match project.status {
    ProjectStatus::Open if project.worker_id.is_some() && project.price().is_some() => Phase::PricedAssigned,
    ProjectStatus::Open => Phase::Open,
    ProjectStatus::InProgress => Phase::InProgress,
    ProjectStatus::Completed => Phase::Completed,
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
  OfferPrice,
  Pay,
  RequestCompletion,
  ConfirmCompletion,
  LeaveReview,
}

impl Action {
  pub fn actor(self) -> ChannelRole {
    match self {
      Self::OfferPrice => ChannelRole::Worker,
      Self::Pay | Self::RequestCompletion | Self::ConfirmCompletion | Self::LeaveReview => ChannelRole::Client,
    }
  }

  pub fn allows(self, phase: Phase) -> bool {
    match self {
      Self::OfferPrice => phase == Phase::Open,
      Self::Pay => matches!(phase, Phase::Open | Phase::PricedAssigned),
      Self::RequestCompletion | Self::ConfirmCompletion => phase == Phase::InProgress,
      Self::LeaveReview => phase == Phase::Completed,
    }
  }
}

/// One side of a running session: the channel an event came from and the
/// project it belongs to.
#[derive(Debug, Clone)]
pub struct SessionContext {
  pub channel: PairedChannel,
  pub project: Project,
}

impl SessionContext {
  /// `None` when the chat is not paired or its project is gone.
  #[instrument(skip(db))]
  pub async fn resolve(db: &Db, chat_id: i64) -> anyhow::Result<Option<Self>> {
    let Some(channel) = db.get_channel(chat_id).await? else {
      return Ok(None);
    };
    let Some(project) = db.get_project(&channel.project_id).await? else {
      debug!(chat_id, project_id = %channel.project_id, "paired chat references a missing project");
      return Ok(None);
    };
    Ok(Some(Self { channel, project }))
  }

  pub fn role(&self) -> ChannelRole {
    self.channel.role
  }

  pub fn project_id(&self) -> &str {
    &self.channel.project_id
  }

  pub fn chat(&self) -> ChatId {
    ChatId(self.channel.id)
  }

  pub fn pair_chat(&self) -> ChatId {
    ChatId(self.channel.pair_id)
  }

  pub fn phase(&self) -> Phase {
    phase(&self.project)
  }

  pub fn authorize(&self, action: Action) -> Result<(), SessionError> {
    if self.role() != action.actor() {
      return Err(SessionError::WrongRole(action.actor()));
    }
    if !action.allows(self.phase()) {
      return Err(SessionError::WrongStatus(self.project.status));
    }
    Ok(())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Payment {
  pub client_id: i64,
  pub worker_id: i64,
  pub price: i64,
  pub balance_after: i64,
}

pub struct Sessions {
  db: Db,
  transport: Arc<dyn Transport>,
  currency: String,
}

impl Sessions {
  pub fn new(db: Db, transport: Arc<dyn Transport>, currency: impl Into<String>) -> Self {
    Self {
      db,
      transport,
      currency: currency.into(),
    }
  }

  pub fn currency(&self) -> &str {
    &self.currency
  }

  pub async fn resolve(&self, chat_id: i64) -> anyhow::Result<Option<SessionContext>> {
    SessionContext::resolve(&self.db, chat_id).await
  }

  /// Project summary as seen from one side of the pair.
  pub fn summary(&self, session: &SessionContext) -> Result<String, SessionError> {
    let data = session.project.data.as_ref().ok_or(SessionError::Incomplete("project data"))?;
    let show_note = session.role() == ChannelRole::Client;
    Ok(templates::render_project(session.project.status, data, show_note, &self.currency))
  }

  async fn notify_both(&self, session: &SessionContext, own: &str, pair: &str) -> anyhow::Result<()> {
    try_join(
      self.transport.send_text(session.chat(), own, None),
      self.transport.send_text(session.pair_chat(), pair, None),
    )
    .await?;
    Ok(())
  }

  #[instrument(skip(self, session), fields(chat_id = session.channel.id, project_id = %session.project_id()))]
  pub async fn show_menu(&self, session: &SessionContext) -> Result<(), SessionError> {
    let text = self.summary(session)?;
    let keyboard = keyboards::session_keyboard(session.role(), session.phase());
    self.transport.send_text(session.chat(), &text, Some(keyboard)).await?;
    Ok(())
  }

  #[instrument(skip(self, session), fields(chat_id = session.channel.id, project_id = %session.project_id()))]
  pub async fn begin_offer(&self, session: &SessionContext) -> Result<(), SessionError> {
    session.authorize(Action::OfferPrice)?;
    self
      .transport
      .send_text(
        session.chat(),
        &format!("💰 Send your price in {} as a whole number:", self.currency),
        Some(keyboards::cancel_keyboard()),
      )
      .await?;
    info!(worker_id = session.channel.owner_user_id, "awaiting price offer");
    Ok(())
  }

  /// Sends the worker's price to the client side. Nothing about the project
  /// changes until the client pays.
  #[instrument(skip(self, session), fields(chat_id = session.channel.id, project_id = %session.project_id()))]
  pub async fn submit_offer(&self, session: &SessionContext, input: &str) -> Result<i64, SessionError> {
    session.authorize(Action::OfferPrice)?;
    let price = parse_price(input)?;

    self
      .db
      .add_bid(&Bid {
        id: None,
        client_id: session.project.client_id,
        project_id: session.project_id().to_string(),
        worker_id: Some(session.channel.owner_user_id),
        text: Some(price.to_string()),
      })
      .await?;

    self
      .transport
      .send_text(
        session.pair_chat(),
        &templates::offer_text(price, &self.currency),
        Some(keyboards::pay_keyboard(price, session.project_id())),
      )
      .await?;
    self
      .transport
      .send_text(session.chat(), "📨 Your offer was sent to the client.", None)
      .await?;
    info!(price, worker_id = session.channel.owner_user_id, "price offer sent");
    Ok(price)
  }

  /// Debits the client, then records price, worker and status in that order.
  /// A failure part way leaves the earlier writes in place.
  #[instrument(skip(self, session), fields(chat_id = session.channel.id, project_id = %session.project_id()))]
  pub async fn pay(
    &self,
    session: &SessionContext,
    user_id: i64,
    price: i64,
    project_id: &str,
  ) -> Result<Payment, SessionError> {
    session.authorize(Action::Pay)?;
    if user_id != session.channel.owner_user_id {
      return Err(SessionError::WrongRole(ChannelRole::Client));
    }
    if project_id != session.project_id() {
      return Err(SessionError::PayloadMismatch);
    }

    let worker_channel = self
      .db
      .get_channel(session.channel.pair_id)
      .await?
      .ok_or(SessionError::Incomplete("worker chat"))?;
    let worker_id = worker_channel.owner_user_id;

    let offered = self.db.get_bids_by_project(project_id).await?.into_iter().any(|bid| {
      bid.worker_id == Some(worker_id) && bid.text.as_deref().and_then(|text| text.parse::<i64>().ok()) == Some(price)
    });
    if !offered {
      warn!(user_id, price, "payment for a price the worker never offered");
      return Err(SessionError::PayloadMismatch);
    }

    let balance = self.db.balance(user_id).await?;
    if price > balance {
      info!(user_id, price, balance, "payment rejected: insufficient funds");
      return Err(SessionError::InsufficientFunds { price, balance });
    }

    ensure_forward(&session.project, ProjectStatus::InProgress)?;
    self.db.incr_balance(user_id, -price).await?;
    self.db.set_project_price(project_id, price).await?;
    self.db.set_project_worker(project_id, worker_id).await?;
    self.db.set_project_status(project_id, ProjectStatus::InProgress).await?;
    let balance_after = balance - price;
    info!(user_id, worker_id, price, "payment captured, project in progress");

    self
      .notify_both(
        session,
        &templates::payment_done_client(price, balance_after, &self.currency),
        &templates::payment_done_worker(price, &self.currency),
      )
      .await?;

    Ok(Payment {
      client_id: user_id,
      worker_id,
      price,
      balance_after,
    })
  }

  #[instrument(skip(self, session), fields(chat_id = session.channel.id, project_id = %session.project_id()))]
  pub async fn request_completion(&self, session: &SessionContext) -> Result<(), SessionError> {
    session.authorize(Action::RequestCompletion)?;
    self
      .transport
      .send_text(
        session.chat(),
        templates::completion_prompt(),
        Some(keyboards::confirm_keyboard(session.project_id())),
      )
      .await?;
    Ok(())
  }

  /// Marks the project completed and releases the price to the worker.
  #[instrument(skip(self, session), fields(chat_id = session.channel.id, project_id = %session.project_id()))]
  pub async fn confirm_completion(
    &self,
    session: &SessionContext,
    user_id: i64,
    project_id: &str,
  ) -> Result<Payment, SessionError> {
    session.authorize(Action::ConfirmCompletion)?;
    if user_id != session.channel.owner_user_id {
      return Err(SessionError::WrongRole(ChannelRole::Client));
    }
    if project_id != session.project_id() {
      return Err(SessionError::PayloadMismatch);
    }
    let price = session.project.price().ok_or(SessionError::Incomplete("price"))?;
    let worker_id = session.project.worker_id.ok_or(SessionError::Incomplete("worker"))?;

    ensure_forward(&session.project, ProjectStatus::Completed)?;
    self.db.set_project_status(project_id, ProjectStatus::Completed).await?;
    self.db.incr_balance(worker_id, price).await?;
    info!(user_id, worker_id, price, "project completed, worker credited");

    self
      .notify_both(
        session,
        templates::completed_client(),
        &templates::completed_worker(price, &self.currency),
      )
      .await?;

    Ok(Payment {
      client_id: user_id,
      worker_id,
      price,
      balance_after: self.db.balance(user_id).await?,
    })
  }

  /// Checks that a review may be started; the text is collected afterwards.
  pub async fn begin_review(&self, session: &SessionContext) -> Result<(), SessionError> {
    session.authorize(Action::LeaveReview)?;
    if self.db.get_review_by_project(session.project_id()).await?.is_some() {
      return Err(SessionError::AlreadyReviewed);
    }
    Ok(())
  }

  #[instrument(skip(self, session, text), fields(chat_id = session.channel.id, project_id = %session.project_id()))]
  pub async fn submit_review(
    &self,
    session: &SessionContext,
    client_name: &str,
    rating: Rating,
    text: &str,
  ) -> Result<String, SessionError> {
    self.begin_review(session).await?;
    let worker_id = session.project.worker_id.ok_or(SessionError::Incomplete("worker"))?;
    let review = Review {
      id: None,
      client_id: session.project.client_id,
      client_name: client_name.to_string(),
      worker_id,
      project_id: session.project_id().to_string(),
      rating: Some(rating),
      text: text.trim().to_string(),
    };
    let review_id = self.db.add_review(&review).await?;
    info!(worker_id, review_id = %review_id, average = rating.average(), "review stored");

    self
      .notify_both(
        session,
        "⭐ Thank you for your review!",
        &format!("⭐ The client rated your work {:.1}/{}.", rating.average(), Rating::MAX_SCORE),
      )
      .await?;
    Ok(review_id)
  }

  #[instrument(skip(self, session), fields(chat_id = session.channel.id, project_id = %session.project_id()))]
  pub async fn call_admin(&self, session: &SessionContext, admin_id: i64) -> Result<(), SessionError> {
    let role = session.role().to_string();
    self
      .transport
      .send_text(
        ChatId(admin_id),
        &templates::admin_called(&session.channel.external_link, &role, session.project_id()),
        None,
      )
      .await?;
    self
      .transport
      .send_text(session.chat(), "🆘 The admin has been notified and will join shortly.", None)
      .await?;
    self
      .transport
      .send_text(session.pair_chat(), &format!("🆘 The {role} called the admin."), None)
      .await?;
    info!(admin_id, role = %role, "admin called into session");
    Ok(())
  }

  /// Binds two chats to an open project: one channel record per side, each
  /// pointing at the other, plus the worker and chat ids on the project.
  #[instrument(skip(self))]
  pub async fn provision(
    &self,
    project_id: &str,
    worker_id: i64,
    client_chat_id: i64,
    worker_chat_id: i64,
  ) -> Result<(), SessionError> {
    if client_chat_id == worker_chat_id {
      return Err(SessionError::SameChat);
    }
    let project = self
      .db
      .get_project(project_id)
      .await?
      .ok_or_else(|| SessionError::ProjectNotFound(project_id.to_string()))?;
    if project.status != ProjectStatus::Open {
      return Err(SessionError::WrongStatus(project.status));
    }
    for chat_id in [client_chat_id, worker_chat_id] {
      if self.db.get_channel(chat_id).await?.is_some() {
        return Err(SessionError::AlreadyPaired(chat_id));
      }
    }

    let client_link = self.transport.export_invite_link(ChatId(client_chat_id)).await?;
    let worker_link = self.transport.export_invite_link(ChatId(worker_chat_id)).await?;

    self
      .db
      .add_channel(&PairedChannel {
        id: client_chat_id,
        project_id: project_id.to_string(),
        role: ChannelRole::Client,
        owner_user_id: project.client_id,
        external_link: client_link.clone(),
        pair_id: worker_chat_id,
      })
      .await?;
    self
      .db
      .add_channel(&PairedChannel {
        id: worker_chat_id,
        project_id: project_id.to_string(),
        role: ChannelRole::Worker,
        owner_user_id: worker_id,
        external_link: worker_link.clone(),
        pair_id: client_chat_id,
      })
      .await?;
    self.db.set_project_worker(project_id, worker_id).await?;
    self
      .db
      .set_project_channels(project_id, client_chat_id, worker_chat_id)
      .await?;
    info!(
      client_id = project.client_id,
      worker_id, client_chat_id, worker_chat_id, "session provisioned"
    );

    self
      .transport
      .send_text(
        ChatId(project.client_id),
        &format!("🤝 A worker was found for your project. Join your chat: {client_link}"),
        None,
      )
      .await?;
    self
      .transport
      .send_text(
        ChatId(worker_id),
        &format!("🤝 You were assigned to a project. Join your chat: {worker_link}"),
        None,
      )
      .await?;
    Ok(())
  }

  /// Removes both channel records of a pair. Returns false for unknown chats.
  #[instrument(skip(self))]
  pub async fn unpair(&self, chat_id: i64) -> anyhow::Result<bool> {
    let Some(channel) = self.db.get_channel(chat_id).await? else {
      return Ok(false);
    };
    self.db.delete_channel(channel.id).await?;
    self.db.delete_channel(channel.pair_id).await?;
    info!(chat_id, pair_id = channel.pair_id, project_id = %channel.project_id, "session unpaired");
    Ok(true)
  }

  /// Deletes the project and releases its chat pair, if it has one.
  #[instrument(skip(self))]
  pub async fn remove_project(&self, project_id: &str) -> anyhow::Result<bool> {
    let Some(project) = self.db.get_project(project_id).await? else {
      return Ok(false);
    };
    if let Some(chat_id) = project.client_chat_id.or(project.worker_chat_id) {
      self.unpair(chat_id).await?;
    }
    let removed = self.db.delete_project(project_id).await?;
    warn!(project_id, status = ?project.status, "project removed by admin");
    Ok(removed)
  }

  /// Administrative override. Skips every guard, including the forward-only
  /// status rule.
  #[instrument(skip(self))]
  pub async fn force_status(&self, project_id: &str, status: ProjectStatus) -> Result<(), SessionError> {
    let project = self
      .db
      .get_project(project_id)
      .await?
      .ok_or_else(|| SessionError::ProjectNotFound(project_id.to_string()))?;
    self.db.set_project_status(project_id, status).await?;
    warn!(from = ?project.status, to = ?status, "project status force-updated by admin");
    Ok(())
  }
}

fn ensure_forward(project: &Project, next: ProjectStatus) -> Result<(), SessionError> {
  if project.status.can_advance_to(next) {
    Ok(())
  } else {
    Err(SessionError::StatusRegression {
      from: project.status,
      to: next,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::ProjectData;
  use crate::transport::testing::RecordingTransport;
  use crate::transport::testing::Sent;

  const CLIENT: i64 = 1;
  const WORKER: i64 = 2;
  const CLIENT_CHAT: i64 = -100;
  const WORKER_CHAT: i64 = -200;

  fn data() -> ProjectData {
    ProjectData {
      work_type: "Essay".to_string(),
      subject: "History".to_string(),
      date: "2024-05-17".to_string(),
      description: "Ten pages".to_string(),
      price: None,
      note: None,
      files: Vec::new(),
    }
  }

  struct Fixture {
    db: Db,
    transport: Arc<RecordingTransport>,
    sessions: Sessions,
    project_id: String,
  }

  impl Fixture {
    async fn new() -> Self {
      let db = Db::in_memory();
      let transport = Arc::new(RecordingTransport::new());
      let sessions = Sessions::new(db.clone(), transport.clone(), "UAH");
      let project_id = db.add_project(&Project::new(CLIENT, data())).await.unwrap();
      sessions.provision(&project_id, WORKER, CLIENT_CHAT, WORKER_CHAT).await.unwrap();
      Self {
        db,
        transport,
        sessions,
        project_id,
      }
    }

    async fn session(&self, chat: i64) -> SessionContext {
      self.sessions.resolve(chat).await.unwrap().unwrap()
    }

    async fn project(&self) -> Project {
      self.db.get_project(&self.project_id).await.unwrap().unwrap()
    }

    async fn offer(&self, input: &str) -> i64 {
      let worker = self.session(WORKER_CHAT).await;
      self.sessions.submit_offer(&worker, input).await.unwrap()
    }
  }

  #[tokio::test]
  async fn provisioning_links_both_chats() {
    let fx = Fixture::new().await;
    assert_eq!(fx.db.find_pair(CLIENT_CHAT).await.unwrap(), Some(WORKER_CHAT));
    assert_eq!(fx.db.find_pair(WORKER_CHAT).await.unwrap(), Some(CLIENT_CHAT));
    let project = fx.project().await;
    assert_eq!(project.worker_id, Some(WORKER));
    assert_eq!(project.client_chat_id, Some(CLIENT_CHAT));
    assert_eq!(project.worker_chat_id, Some(WORKER_CHAT));
    assert_eq!(phase(&project), Phase::Open);

    let again = fx.sessions.provision(&fx.project_id, WORKER, CLIENT_CHAT, -300).await;
    assert!(matches!(again, Err(SessionError::AlreadyPaired(CLIENT_CHAT))));
  }

  #[tokio::test]
  async fn unpaired_chat_resolves_to_nothing() {
    let fx = Fixture::new().await;
    assert!(fx.sessions.resolve(-999).await.unwrap().is_none());
    assert!(fx.sessions.unpair(WORKER_CHAT).await.unwrap());
    assert!(fx.sessions.resolve(CLIENT_CHAT).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn removing_a_project_releases_its_chats() {
    let fx = Fixture::new().await;
    assert!(fx.sessions.remove_project(&fx.project_id).await.unwrap());
    assert!(fx.db.get_project(&fx.project_id).await.unwrap().is_none());
    assert!(fx.sessions.resolve(CLIENT_CHAT).await.unwrap().is_none());
    assert!(fx.sessions.resolve(WORKER_CHAT).await.unwrap().is_none());
    assert!(!fx.sessions.remove_project(&fx.project_id).await.unwrap());
  }

  #[tokio::test]
  async fn full_session_moves_money_once() {
    let fx = Fixture::new().await;
    fx.db.incr_balance(CLIENT, 800).await.unwrap();

    assert_eq!(fx.offer("500").await, 500);
    let offers = fx.transport.to_chat(ChatId(CLIENT_CHAT));
    let Some(Sent::Text {
      keyboard: Some(keyboard), ..
    }) = offers.last()
    else {
      panic!("offer not delivered to client: {offers:?}");
    };
    let pay_payload = format!("pay_for_project_500_{}", fx.project_id);
    assert!(keyboard.payloads().any(|payload| payload == pay_payload));
    assert_eq!(fx.project().await.status, ProjectStatus::Open);

    let client = fx.session(CLIENT_CHAT).await;
    let payment = fx.sessions.pay(&client, CLIENT, 500, &fx.project_id).await.unwrap();
    assert_eq!(payment.balance_after, 300);
    assert_eq!(fx.db.balance(CLIENT).await.unwrap(), 300);
    assert_eq!(fx.db.balance(WORKER).await.unwrap(), 0);
    let project = fx.project().await;
    assert_eq!(project.status, ProjectStatus::InProgress);
    assert_eq!(project.worker_id, Some(WORKER));
    assert_eq!(project.price(), Some(500));

    let client = fx.session(CLIENT_CHAT).await;
    fx.sessions.request_completion(&client).await.unwrap();
    fx.sessions.confirm_completion(&client, CLIENT, &fx.project_id).await.unwrap();
    assert_eq!(fx.project().await.status, ProjectStatus::Completed);
    assert_eq!(fx.db.balance(WORKER).await.unwrap(), 500);
    assert_eq!(fx.db.balance(CLIENT).await.unwrap(), 300);
  }

  #[tokio::test]
  async fn insufficient_balance_changes_nothing() {
    let fx = Fixture::new().await;
    fx.db.incr_balance(CLIENT, 100).await.unwrap();
    fx.offer("500").await;

    let client = fx.session(CLIENT_CHAT).await;
    let err = fx.sessions.pay(&client, CLIENT, 500, &fx.project_id).await.unwrap_err();
    assert!(matches!(err, SessionError::InsufficientFunds { price: 500, balance: 100 }));
    assert!(err.user_message("UAH").contains("500 UAH"));
    assert_eq!(fx.db.balance(CLIENT).await.unwrap(), 100);
    let project = fx.project().await;
    assert_eq!(project.status, ProjectStatus::Open);
    assert_eq!(project.price(), None);
  }

  #[tokio::test]
  async fn non_numeric_offer_is_rejected() {
    let fx = Fixture::new().await;
    let worker = fx.session(WORKER_CHAT).await;
    let err = fx.sessions.submit_offer(&worker, "five hundred").await.unwrap_err();
    assert!(matches!(err, SessionError::InvalidPrice(PriceError::InvalidFormat)));
    assert!(fx.transport.to_chat(ChatId(CLIENT_CHAT)).is_empty());
    assert!(fx.db.get_bids_by_project(&fx.project_id).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn oversized_offer_is_rejected_before_recording() {
    let fx = Fixture::new().await;
    let worker = fx.session(WORKER_CHAT).await;
    let err = fx.sessions.submit_offer(&worker, "100000000000").await.unwrap_err();
    assert!(matches!(err, SessionError::InvalidPrice(PriceError::OutOfRange)));
    assert!(fx.transport.to_chat(ChatId(CLIENT_CHAT)).is_empty());
    assert!(fx.db.get_bids_by_project(&fx.project_id).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn payment_must_match_an_offer() {
    let fx = Fixture::new().await;
    fx.db.incr_balance(CLIENT, 1000).await.unwrap();
    fx.offer("500").await;
    let client = fx.session(CLIENT_CHAT).await;

    let forged = fx.sessions.pay(&client, CLIENT, 1, &fx.project_id).await;
    assert!(matches!(forged, Err(SessionError::PayloadMismatch)));
    let other = fx.sessions.pay(&client, CLIENT, 500, "other").await;
    assert!(matches!(other, Err(SessionError::PayloadMismatch)));
    assert_eq!(fx.db.balance(CLIENT).await.unwrap(), 1000);
  }

  #[tokio::test]
  async fn roles_are_enforced() {
    let fx = Fixture::new().await;
    let client = fx.session(CLIENT_CHAT).await;
    let worker = fx.session(WORKER_CHAT).await;

    let err = fx.sessions.submit_offer(&client, "500").await.unwrap_err();
    assert!(matches!(err, SessionError::WrongRole(ChannelRole::Worker)));
    assert!(err.is_not_applicable());

    let err = fx.sessions.pay(&worker, WORKER, 500, &fx.project_id).await.unwrap_err();
    assert!(matches!(err, SessionError::WrongRole(ChannelRole::Client)));
  }

  #[tokio::test]
  async fn completion_requires_work_in_progress() {
    let fx = Fixture::new().await;
    let client = fx.session(CLIENT_CHAT).await;
    let err = fx
      .sessions
      .confirm_completion(&client, CLIENT, &fx.project_id)
      .await
      .unwrap_err();
    assert!(matches!(err, SessionError::WrongStatus(ProjectStatus::Open)));
    assert_eq!(fx.db.balance(WORKER).await.unwrap(), 0);
  }

  #[tokio::test]
  async fn no_public_operation_moves_status_backwards() {
    let fx = Fixture::new().await;
    fx.db.incr_balance(CLIENT, 500).await.unwrap();
    fx.offer("500").await;
    let client = fx.session(CLIENT_CHAT).await;
    fx.sessions.pay(&client, CLIENT, 500, &fx.project_id).await.unwrap();

    let client = fx.session(CLIENT_CHAT).await;
    assert!(fx.sessions.pay(&client, CLIENT, 500, &fx.project_id).await.is_err());
    let worker = fx.session(WORKER_CHAT).await;
    assert!(fx.sessions.submit_offer(&worker, "10").await.is_err());

    let project = fx.project().await;
    let err = ensure_forward(&project, ProjectStatus::Open).unwrap_err();
    assert!(matches!(err, SessionError::StatusRegression { .. }));
    assert_eq!(fx.project().await.status, ProjectStatus::InProgress);
  }

  #[tokio::test]
  async fn review_is_accepted_once() {
    let fx = Fixture::new().await;
    fx.db.incr_balance(CLIENT, 500).await.unwrap();
    fx.offer("500").await;
    let client = fx.session(CLIENT_CHAT).await;
    fx.sessions.pay(&client, CLIENT, 500, &fx.project_id).await.unwrap();
    let client = fx.session(CLIENT_CHAT).await;
    assert!(matches!(
      fx.sessions.begin_review(&client).await,
      Err(SessionError::WrongStatus(ProjectStatus::InProgress))
    ));
    fx.sessions.confirm_completion(&client, CLIENT, &fx.project_id).await.unwrap();

    let client = fx.session(CLIENT_CHAT).await;
    let rating = Rating::new(5, 4, 5).unwrap();
    fx.sessions.submit_review(&client, "Ann", rating, "great").await.unwrap();
    let review = fx.db.get_review_by_project(&fx.project_id).await.unwrap().unwrap();
    assert_eq!(review.worker_id, WORKER);
    assert_eq!(review.rating, Some(rating));

    let again = fx.sessions.submit_review(&client, "Ann", rating, "again").await;
    assert!(matches!(again, Err(SessionError::AlreadyReviewed)));
  }

  #[tokio::test]
  async fn call_admin_notifies_admin_and_pair() {
    let fx = Fixture::new().await;
    let worker = fx.session(WORKER_CHAT).await;
    fx.sessions.call_admin(&worker, 42).await.unwrap();
    let admin = fx.transport.texts_to(ChatId(42));
    assert_eq!(admin.len(), 1);
    assert!(admin[0].contains(&worker.channel.external_link));
    assert!(
      fx.transport
        .texts_to(ChatId(CLIENT_CHAT))
        .iter()
        .any(|text| text.contains("worker called the admin"))
    );
  }

  #[tokio::test]
  async fn admin_override_skips_guards() {
    let fx = Fixture::new().await;
    fx.sessions.force_status(&fx.project_id, ProjectStatus::Completed).await.unwrap();
    fx.sessions.force_status(&fx.project_id, ProjectStatus::Open).await.unwrap();
    assert_eq!(fx.project().await.status, ProjectStatus::Open);
    assert!(matches!(
      fx.sessions.force_status("missing", ProjectStatus::Open).await,
      Err(SessionError::ProjectNotFound(_))
    ));
  }

  #[test]
  fn guard_table() {
    assert!(Action::Pay.allows(Phase::PricedAssigned));
    assert!(!Action::Pay.allows(Phase::InProgress));
    assert!(!Action::OfferPrice.allows(Phase::PricedAssigned));
    assert!(Action::LeaveReview.allows(Phase::Completed));
    assert_eq!(Action::OfferPrice.actor(), ChannelRole::Worker);
  }
}
