use anyhow::Result;
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::CallbackQueryId;
use teloxide::types::ChatId;
use teloxide::types::InlineKeyboardButton;
use teloxide::types::InlineKeyboardMarkup;
use teloxide::types::MessageId;
use teloxide::types::ParseMode;
use teloxide::types::ReplyParameters;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
  pub label: String,
  pub payload: String,
}

impl Button {
  pub fn new(label: impl Into<String>, payload: impl Into<String>) -> Self {
    Self {
      label: label.into(),
      payload: payload.into(),
    }
  }
}

/// Rows of callback buttons attached to an outgoing message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keyboard {
  pub rows: Vec<Vec<Button>>,
}

impl Keyboard {
  pub fn single_column(buttons: Vec<Button>) -> Self {
    Self {
      rows: buttons.into_iter().map(|button| vec![button]).collect(),
    }
  }

  #[cfg(test)]
  pub fn payloads(&self) -> impl Iterator<Item = &str> {
    self.rows.iter().flatten().map(|button| button.payload.as_str())
  }
}

impl From<Keyboard> for InlineKeyboardMarkup {
  fn from(keyboard: Keyboard) -> Self {
    InlineKeyboardMarkup::new(keyboard.rows.into_iter().map(|row| {
      row
        .into_iter()
        .map(|button| InlineKeyboardButton::callback(button.label, button.payload))
        .collect::<Vec<_>>()
    }))
  }
}

/// Outbound commands of the messaging transport. Texts are HTML.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send_text(&self, chat: ChatId, text: &str, keyboard: Option<Keyboard>) -> Result<MessageId>;

  async fn copy_message(
    &self,
    to: ChatId,
    from: ChatId,
    message_id: MessageId,
    reply_to: Option<MessageId>,
  ) -> Result<MessageId>;

  async fn forward_message(&self, to: ChatId, from: ChatId, message_id: MessageId) -> Result<MessageId>;

  async fn pin_message(&self, chat: ChatId, message_id: MessageId) -> Result<()>;

  async fn delete_message(&self, chat: ChatId, message_id: MessageId) -> Result<()>;

  async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<()>;

  async fn export_invite_link(&self, chat: ChatId) -> Result<String>;
}

pub struct TelegramTransport {
  bot: Bot,
}

impl TelegramTransport {
  pub fn new(bot: Bot) -> Self {
    Self { bot }
  }
}

#[async_trait]
impl Transport for TelegramTransport {
  async fn send_text(&self, chat: ChatId, text: &str, keyboard: Option<Keyboard>) -> Result<MessageId> {
    let mut request = self.bot.send_message(chat, text).parse_mode(ParseMode::Html);
    if let Some(keyboard) = keyboard {
      request = request.reply_markup(InlineKeyboardMarkup::from(keyboard));
    }
    Ok(request.await?.id)
  }

  async fn copy_message(
    &self,
    to: ChatId,
    from: ChatId,
    message_id: MessageId,
    reply_to: Option<MessageId>,
  ) -> Result<MessageId> {
    let mut request = self.bot.copy_message(to, from, message_id);
    if let Some(reply_to) = reply_to {
      request = request.reply_parameters(ReplyParameters::new(reply_to).allow_sending_without_reply());
    }
    Ok(request.await?)
  }

  async fn forward_message(&self, to: ChatId, from: ChatId, message_id: MessageId) -> Result<MessageId> {
    Ok(self.bot.forward_message(to, from, message_id).await?.id)
  }

  async fn pin_message(&self, chat: ChatId, message_id: MessageId) -> Result<()> {
    self.bot.pin_chat_message(chat, message_id).await?;
    Ok(())
  }

  async fn delete_message(&self, chat: ChatId, message_id: MessageId) -> Result<()> {
    self.bot.delete_message(chat, message_id).await?;
    Ok(())
  }

  async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
    let mut request = self.bot.answer_callback_query(CallbackQueryId(callback_id.to_string()));
    if let Some(text) = text {
      request = request.text(text);
    }
    request.await?;
    Ok(())
  }

  async fn export_invite_link(&self, chat: ChatId) -> Result<String> {
    Ok(self.bot.export_chat_invite_link(chat).await?)
  }
}

#[cfg(test)]
pub mod testing {
  use std::sync::Mutex;

  use super::*;

  #[derive(Debug, Clone, PartialEq, Eq)]
  pub enum Sent {
    Text {
      chat: ChatId,
      text: String,
      keyboard: Option<Keyboard>,
    },
    Copy {
      to: ChatId,
      from: ChatId,
      message_id: MessageId,
      reply_to: Option<MessageId>,
    },
    Forward {
      to: ChatId,
      from: ChatId,
      message_id: MessageId,
    },
    Pin {
      chat: ChatId,
      message_id: MessageId,
    },
    Delete {
      chat: ChatId,
      message_id: MessageId,
    },
    Answer {
      text: Option<String>,
    },
    InviteLink {
      chat: ChatId,
    },
  }

  /// Records every outbound command; message ids count up from 1000.
  #[derive(Default)]
  pub struct RecordingTransport {
    sent: Mutex<Vec<Sent>>,
    refuse_pins: bool,
  }

  impl RecordingTransport {
    pub fn new() -> Self {
      Self::default()
    }

    /// Pin requests fail, as in a chat where the bot has no pin rights.
    pub fn without_pin_rights() -> Self {
      Self {
        refuse_pins: true,
        ..Self::default()
      }
    }

    pub fn sent(&self) -> Vec<Sent> {
      self.sent.lock().unwrap().clone()
    }

    pub fn texts_to(&self, chat: ChatId) -> Vec<String> {
      self
        .sent()
        .into_iter()
        .filter_map(|sent| match sent {
          Sent::Text { chat: to, text, .. } if to == chat => Some(text),
          _ => None,
        })
        .collect()
    }

    pub fn to_chat(&self, chat: ChatId) -> Vec<Sent> {
      self
        .sent()
        .into_iter()
        .filter(|sent| match sent {
          Sent::Text { chat: to, .. } | Sent::Pin { chat: to, .. } | Sent::Delete { chat: to, .. } => *to == chat,
          Sent::Copy { to, .. } | Sent::Forward { to, .. } => *to == chat,
          Sent::Answer { .. } | Sent::InviteLink { .. } => false,
        })
        .collect()
    }

    fn record(&self, sent: Sent) -> MessageId {
      let mut log = self.sent.lock().unwrap();
      log.push(sent);
      MessageId(1000 + log.len() as i32)
    }
  }

  #[async_trait]
  impl Transport for RecordingTransport {
    async fn send_text(&self, chat: ChatId, text: &str, keyboard: Option<Keyboard>) -> Result<MessageId> {
      Ok(self.record(Sent::Text {
        chat,
        text: text.to_string(),
        keyboard,
      }))
    }

    async fn copy_message(
      &self,
      to: ChatId,
      from: ChatId,
      message_id: MessageId,
      reply_to: Option<MessageId>,
    ) -> Result<MessageId> {
      Ok(self.record(Sent::Copy {
        to,
        from,
        message_id,
        reply_to,
      }))
    }

    async fn forward_message(&self, to: ChatId, from: ChatId, message_id: MessageId) -> Result<MessageId> {
      Ok(self.record(Sent::Forward { to, from, message_id }))
    }

    async fn pin_message(&self, chat: ChatId, message_id: MessageId) -> Result<()> {
      if self.refuse_pins {
        anyhow::bail!("not enough rights to pin a message");
      }
      self.record(Sent::Pin { chat, message_id });
      Ok(())
    }

    async fn delete_message(&self, chat: ChatId, message_id: MessageId) -> Result<()> {
      self.record(Sent::Delete { chat, message_id });
      Ok(())
    }

    async fn answer_callback(&self, _callback_id: &str, text: Option<&str>) -> Result<()> {
      self.record(Sent::Answer {
        text: text.map(str::to_string),
      });
      Ok(())
    }

    async fn export_invite_link(&self, chat: ChatId) -> Result<String> {
      self.record(Sent::InviteLink { chat });
      Ok(format!("https://t.me/+invite{}", chat.0.unsigned_abs()))
    }
  }
}
