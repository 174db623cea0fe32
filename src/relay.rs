//! Message relay between the two chats of a session.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Result;
use lru::LruCache;
use teloxide::types::ChatId;
use teloxide::types::MessageId;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::bot::keyboards;
use crate::bot::templates;
use crate::db::Db;
use crate::guard::ContentGuard;
use crate::guard::Verdict;
use crate::guard::Violation;
use crate::session::Sessions;
use crate::transport::Transport;

pub const DEFAULT_CACHE_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
  pub chat: ChatId,
  pub message_id: MessageId,
  pub sender_id: i64,
  pub sender_name: String,
  /// Text or caption; `None` for media without a caption.
  pub text: Option<String>,
  pub reply_to: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
  NotPaired,
  Relayed(MessageId),
  Blocked(Violation),
  Notified,
}

/// Relayed-message index, both directions: `(chat, message)` maps to the
/// matching message id in the paired chat.
struct ReplyMap {
  entries: Mutex<LruCache<(i64, i32), i32>>,
}

impl ReplyMap {
  fn new(capacity: usize) -> Self {
    Self {
      entries: Mutex::new(LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN))),
    }
  }

  fn link(&self, source: (ChatId, MessageId), relayed: (ChatId, MessageId)) {
    if let Ok(mut entries) = self.entries.lock() {
      entries.put((source.0.0, source.1.0), relayed.1.0);
      entries.put((relayed.0.0, relayed.1.0), source.1.0);
    }
  }

  fn counterpart(&self, chat: ChatId, message_id: MessageId) -> Option<MessageId> {
    let mut entries = self.entries.lock().ok()?;
    entries.get(&(chat.0, message_id.0)).copied().map(MessageId)
  }
}

pub struct Relay {
  db: Db,
  sessions: Arc<Sessions>,
  transport: Arc<dyn Transport>,
  guard: ContentGuard,
  admin_id: i64,
  replies: ReplyMap,
}

impl Relay {
  pub fn new(
    db: Db,
    sessions: Arc<Sessions>,
    transport: Arc<dyn Transport>,
    guard: ContentGuard,
    admin_id: i64,
    cache_size: usize,
  ) -> Self {
    Self {
      db,
      sessions,
      transport,
      guard,
      admin_id,
      replies: ReplyMap::new(cache_size),
    }
  }

  /// Copies a message to the paired chat unless the content guard blocks it.
  /// Admin messages skip the guard and arrive as forwards.
  #[instrument(skip(self, message), fields(chat_id = %message.chat, sender_id = message.sender_id))]
  pub async fn relay_message(&self, message: &Incoming) -> Result<RelayOutcome> {
    let Some(pair) = self.db.find_pair(message.chat.0).await? else {
      return Ok(RelayOutcome::NotPaired);
    };
    let pair = ChatId(pair);

    if message.sender_id == self.admin_id {
      return self.forward_admin(message, pair).await;
    }

    if let Some(violation) = self.check(message) {
      return self.reject(message, violation).await;
    }

    let reply_to = match message.reply_to {
      Some(original) => {
        let counterpart = self.replies.counterpart(message.chat, original);
        if counterpart.is_none() {
          debug!(reply_to = original.0, "no relayed counterpart, sending as plain message");
        }
        counterpart
      },
      None => None,
    };

    let relayed = self
      .transport
      .copy_message(pair, message.chat, message.message_id, reply_to)
      .await?;
    self.replies.link((message.chat, message.message_id), (pair, relayed));
    debug!(pair_id = %pair, relayed_id = relayed.0, "message relayed");
    Ok(RelayOutcome::Relayed(relayed))
  }

  /// Edited content goes out as a notice followed by the new version. Admin
  /// edits are forwarded like any other admin message.
  #[instrument(skip(self, message), fields(chat_id = %message.chat, sender_id = message.sender_id))]
  pub async fn relay_edit(&self, message: &Incoming) -> Result<RelayOutcome> {
    let Some(channel) = self.db.get_channel(message.chat.0).await? else {
      return Ok(RelayOutcome::NotPaired);
    };
    let pair = ChatId(channel.pair_id);

    if message.sender_id == self.admin_id {
      return self.forward_admin(message, pair).await;
    }
    if let Some(violation) = self.check(message) {
      return self.reject(message, violation).await;
    }

    self
      .transport
      .send_text(pair, &templates::counterpart_edited(&channel.role.to_string()), None)
      .await?;
    let relayed = self
      .transport
      .copy_message(pair, message.chat, message.message_id, None)
      .await?;
    self.replies.link((message.chat, message.message_id), (pair, relayed));
    info!(pair_id = %pair, "edited message relayed");
    Ok(RelayOutcome::Relayed(relayed))
  }

  /// Sends the joiner the pinned session summary with its menu and tells the
  /// other side. The admin joins silently.
  #[instrument(skip(self))]
  pub async fn member_joined(&self, chat: ChatId, user_id: i64) -> Result<RelayOutcome> {
    let Some(session) = self.sessions.resolve(chat.0).await? else {
      return Ok(RelayOutcome::NotPaired);
    };
    if user_id == self.admin_id {
      return Ok(RelayOutcome::Notified);
    }

    match self.sessions.summary(&session) {
      Ok(summary) => {
        let keyboard = keyboards::session_keyboard(session.role(), session.phase());
        let summary_id = self.transport.send_text(chat, &summary, Some(keyboard)).await?;
        if let Err(err) = self.transport.pin_message(chat, summary_id).await {
          warn!(error = %err, chat_id = %chat, "cannot pin session summary");
        }
      },
      Err(err) => warn!(error = %err, project_id = %session.project_id(), "cannot render session summary"),
    }

    let role = session.role().to_string();
    self
      .transport
      .send_text(session.pair_chat(), &templates::counterpart_joined(&role), None)
      .await?;
    info!(user_id, role = %role, project_id = %session.project_id(), "member joined session chat");
    Ok(RelayOutcome::Notified)
  }

  /// The session stays open when a member leaves.
  #[instrument(skip(self))]
  pub async fn member_left(&self, chat: ChatId, user_id: i64) -> Result<RelayOutcome> {
    let Some(channel) = self.db.get_channel(chat.0).await? else {
      return Ok(RelayOutcome::NotPaired);
    };
    if user_id == self.admin_id {
      return Ok(RelayOutcome::Notified);
    }
    let role = channel.role.to_string();
    self
      .transport
      .send_text(ChatId(channel.pair_id), &templates::counterpart_left(&role), None)
      .await?;
    info!(user_id, role = %role, project_id = %channel.project_id, "member left session chat");
    Ok(RelayOutcome::Notified)
  }

  async fn forward_admin(&self, message: &Incoming, pair: ChatId) -> Result<RelayOutcome> {
    let relayed = self
      .transport
      .forward_message(pair, message.chat, message.message_id)
      .await?;
    self.replies.link((message.chat, message.message_id), (pair, relayed));
    info!(pair_id = %pair, "admin message relayed");
    Ok(RelayOutcome::Relayed(relayed))
  }

  fn check(&self, message: &Incoming) -> Option<Violation> {
    let text = message.text.as_deref()?;
    match self.guard.check(text, &message.sender_name) {
      Verdict::Allowed => None,
      Verdict::Blocked(violation) => Some(violation),
    }
  }

  async fn reject(&self, message: &Incoming, violation: Violation) -> Result<RelayOutcome> {
    warn!(
      chat_id = %message.chat,
      sender_id = message.sender_id,
      violation = ?violation,
      "message blocked by content guard"
    );
    self
      .transport
      .send_text(message.chat, &violation.user_message(), None)
      .await?;
    Ok(RelayOutcome::Blocked(violation))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::Project;
  use crate::models::ProjectData;
  use crate::transport::testing::RecordingTransport;
  use crate::transport::testing::Sent;

  const CLIENT_CHAT: ChatId = ChatId(-100);
  const WORKER_CHAT: ChatId = ChatId(-200);
  const ADMIN: i64 = 99;

  struct Fixture {
    transport: Arc<RecordingTransport>,
    relay: Relay,
  }

  async fn fixture(cache_size: usize) -> Fixture {
    fixture_with(RecordingTransport::new(), cache_size).await
  }

  async fn fixture_with(transport: RecordingTransport, cache_size: usize) -> Fixture {
    let db = Db::in_memory();
    let transport = Arc::new(transport);
    let sessions = Arc::new(Sessions::new(db.clone(), transport.clone(), "UAH"));
    let data = ProjectData {
      work_type: "Essay".to_string(),
      subject: "History".to_string(),
      date: "2024-05-17".to_string(),
      description: "Ten pages".to_string(),
      price: None,
      note: Some("private".to_string()),
      files: Vec::new(),
    };
    let project_id = db.add_project(&Project::new(1, data)).await.unwrap();
    sessions.provision(&project_id, 2, CLIENT_CHAT.0, WORKER_CHAT.0).await.unwrap();
    let relay = Relay::new(db, sessions, transport.clone(), ContentGuard::default(), ADMIN, cache_size);
    Fixture { transport, relay }
  }

  fn message(chat: ChatId, id: i32, sender: i64, text: &str) -> Incoming {
    Incoming {
      chat,
      message_id: MessageId(id),
      sender_id: sender,
      sender_name: "Olena".to_string(),
      text: Some(text.to_string()),
      reply_to: None,
    }
  }

  #[tokio::test]
  async fn clean_text_is_copied_verbatim() {
    let fx = fixture(16).await;
    let outcome = fx
      .relay
      .relay_message(&message(CLIENT_CHAT, 10, 1, "Can you add sources?"))
      .await
      .unwrap();
    assert!(matches!(outcome, RelayOutcome::Relayed(_)));
    assert_eq!(
      fx.transport.to_chat(WORKER_CHAT),
      vec![Sent::Copy {
        to: WORKER_CHAT,
        from: CLIENT_CHAT,
        message_id: MessageId(10),
        reply_to: None,
      }]
    );
  }

  #[tokio::test]
  async fn blocked_text_only_reaches_sender() {
    let fx = fixture(16).await;
    for text in ["380501234567", "(050) 123-45-67", "ping me on telegram", "I am Olena"] {
      let outcome = fx.relay.relay_message(&message(WORKER_CHAT, 11, 2, text)).await.unwrap();
      assert!(matches!(outcome, RelayOutcome::Blocked(_)), "{text}");
    }
    assert!(fx.transport.to_chat(CLIENT_CHAT).is_empty());
    assert_eq!(fx.transport.texts_to(WORKER_CHAT).len(), 4);
  }

  #[tokio::test]
  async fn unpaired_chat_is_ignored() {
    let fx = fixture(16).await;
    let outcome = fx.relay.relay_message(&message(ChatId(-5), 1, 1, "hi")).await.unwrap();
    assert_eq!(outcome, RelayOutcome::NotPaired);
    assert!(fx.transport.sent().iter().all(|sent| !matches!(sent, Sent::Copy { .. })));
  }

  #[tokio::test]
  async fn admin_messages_skip_the_guard() {
    let fx = fixture(16).await;
    let outcome = fx
      .relay
      .relay_message(&message(CLIENT_CHAT, 12, ADMIN, "my number is 380501234567"))
      .await
      .unwrap();
    assert!(matches!(outcome, RelayOutcome::Relayed(_)));
    assert!(matches!(
      fx.transport.to_chat(WORKER_CHAT).as_slice(),
      [Sent::Forward { .. }]
    ));
  }

  #[tokio::test]
  async fn replies_point_at_the_relayed_copy() {
    let fx = fixture(16).await;
    let RelayOutcome::Relayed(copy) = fx.relay.relay_message(&message(CLIENT_CHAT, 20, 1, "question")).await.unwrap()
    else {
      panic!("not relayed");
    };

    let mut reply = message(WORKER_CHAT, 30, 2, "answer");
    reply.reply_to = Some(copy);
    fx.relay.relay_message(&reply).await.unwrap();

    let mut follow_up = message(CLIENT_CHAT, 21, 1, "thanks");
    follow_up.reply_to = Some(MessageId(20));
    fx.relay.relay_message(&follow_up).await.unwrap();

    let copies: Vec<Option<MessageId>> = fx
      .transport
      .sent()
      .into_iter()
      .filter_map(|sent| match sent {
        Sent::Copy { reply_to, .. } => Some(reply_to),
        _ => None,
      })
      .collect();
    assert_eq!(copies, vec![None, Some(MessageId(20)), Some(copy)]);
  }

  #[tokio::test]
  async fn missing_reply_mapping_sends_plain_message() {
    let fx = fixture(16).await;
    let mut reply = message(WORKER_CHAT, 30, 2, "answer");
    reply.reply_to = Some(MessageId(7));
    fx.relay.relay_message(&reply).await.unwrap();
    assert!(matches!(
      fx.transport.to_chat(CLIENT_CHAT).as_slice(),
      [Sent::Copy { reply_to: None, .. }]
    ));
  }

  #[tokio::test]
  async fn edits_arrive_as_notice_and_copy() {
    let fx = fixture(16).await;
    fx.relay.relay_edit(&message(WORKER_CHAT, 40, 2, "fixed typo")).await.unwrap();
    let sent = fx.transport.to_chat(CLIENT_CHAT);
    assert_eq!(sent.len(), 2);
    assert!(matches!(&sent[0], Sent::Text { text, .. } if text.contains("worker edited")));
    assert!(matches!(&sent[1], Sent::Copy { message_id: MessageId(40), .. }));
  }

  #[tokio::test]
  async fn join_pins_summary_and_notifies_pair() {
    let fx = fixture(16).await;
    fx.relay.member_joined(WORKER_CHAT, 2).await.unwrap();
    let joiner = fx.transport.to_chat(WORKER_CHAT);
    let [Sent::Text { text, keyboard, .. }, Sent::Pin { .. }] = joiner.as_slice() else {
      panic!("unexpected messages: {joiner:?}");
    };
    assert!(text.contains("#History"));
    assert!(!text.contains("private"));
    assert!(keyboard.as_ref().unwrap().payloads().any(|payload| payload == "offer_price"));
    assert!(fx.transport.texts_to(CLIENT_CHAT).iter().any(|text| text.contains("worker joined")));
  }

  #[tokio::test]
  async fn join_notice_survives_missing_pin_rights() {
    let fx = fixture_with(RecordingTransport::without_pin_rights(), 16).await;
    let outcome = fx.relay.member_joined(WORKER_CHAT, 2).await.unwrap();
    assert_eq!(outcome, RelayOutcome::Notified);
    assert!(matches!(fx.transport.to_chat(WORKER_CHAT).as_slice(), [Sent::Text { .. }]));
    assert!(fx.transport.texts_to(CLIENT_CHAT).iter().any(|text| text.contains("worker joined")));
  }

  #[tokio::test]
  async fn admin_edits_are_forwarded() {
    let fx = fixture(16).await;
    let outcome = fx
      .relay
      .relay_edit(&message(CLIENT_CHAT, 41, ADMIN, "call 380501234567"))
      .await
      .unwrap();
    assert!(matches!(outcome, RelayOutcome::Relayed(_)));
    assert_eq!(
      fx.transport.to_chat(WORKER_CHAT),
      vec![Sent::Forward {
        to: WORKER_CHAT,
        from: CLIENT_CHAT,
        message_id: MessageId(41),
      }]
    );
  }

  #[tokio::test]
  async fn leave_notifies_pair_only() {
    let fx = fixture(16).await;
    fx.relay.member_left(CLIENT_CHAT, 1).await.unwrap();
    assert!(fx.transport.to_chat(CLIENT_CHAT).is_empty());
    assert!(fx.transport.texts_to(WORKER_CHAT).iter().any(|text| text.contains("client left")));
  }

  #[test]
  fn reply_map_evicts_oldest_entries() {
    let map = ReplyMap::new(2);
    map.link((CLIENT_CHAT, MessageId(1)), (WORKER_CHAT, MessageId(2)));
    map.link((CLIENT_CHAT, MessageId(3)), (WORKER_CHAT, MessageId(4)));
    assert_eq!(map.counterpart(CLIENT_CHAT, MessageId(1)), None);
    assert_eq!(map.counterpart(CLIENT_CHAT, MessageId(3)), Some(MessageId(4)));
    assert_eq!(map.counterpart(WORKER_CHAT, MessageId(4)), Some(MessageId(3)));
  }
}
