//! Content guard for relayed traffic: blocks attempts to swap contact details
//! through the paired channels.

use once_cell::sync::Lazy;
use regex::Regex;

/// Candidate runs of digits with common phone separators, optionally prefixed
/// by `+`. The digit count is checked separately.
static PHONE_CANDIDATE: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"\+?\(?\d[\d\s\-().]*\d").expect("valid regex"));

const MIN_PHONE_DIGITS: usize = 9;

pub const DEFAULT_BLOCK_PHRASES: &[&str] = &[
  "telegram",
  "viber",
  "whatsapp",
  "instagram",
  "skype",
  "discord",
  "t.me/",
  "@gmail",
  "e-mail",
  "email",
  "my number",
  "phone number",
  "call me",
  "write me directly",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
  BlockedPhrase(String),
  SelfMention,
  PhoneNumber,
}

impl Violation {
  pub fn user_message(&self) -> String {
    match self {
      Self::BlockedPhrase(phrase) => {
        format!("🚫 Message not delivered: \"{phrase}\" looks like an attempt to move the conversation off the platform.")
      },
      Self::SelfMention => "🚫 Message not delivered: please do not share your name.".to_string(),
      Self::PhoneNumber => "🚫 Message not delivered: phone numbers are not allowed.".to_string(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
  Allowed,
  Blocked(Violation),
}

#[derive(Debug, Clone)]
pub struct ContentGuard {
  phrases: Vec<String>,
}

impl Default for ContentGuard {
  fn default() -> Self {
    Self::new(DEFAULT_BLOCK_PHRASES.iter().map(|phrase| phrase.to_string()))
  }
}

impl ContentGuard {
  pub fn new(phrases: impl IntoIterator<Item = String>) -> Self {
    let phrases = phrases
      .into_iter()
      .map(|phrase| phrase.trim().to_lowercase())
      .filter(|phrase| !phrase.is_empty())
      .collect();
    Self { phrases }
  }

  /// First matching rule wins: block list, then self mention, then phone number.
  pub fn check(&self, text: &str, sender_name: &str) -> Verdict {
    let lowered = text.to_lowercase();

    if let Some(phrase) = self.phrases.iter().find(|phrase| lowered.contains(phrase.as_str())) {
      return Verdict::Blocked(Violation::BlockedPhrase(phrase.clone()));
    }

    let name = sender_name.trim().to_lowercase();
    if !name.is_empty() && lowered.contains(&name) {
      return Verdict::Blocked(Violation::SelfMention);
    }

    if contains_phone_number(text) {
      return Verdict::Blocked(Violation::PhoneNumber);
    }

    Verdict::Allowed
  }
}

pub fn contains_phone_number(text: &str) -> bool {
  PHONE_CANDIDATE.find_iter(text).any(|candidate| {
    candidate
      .as_str()
      .chars()
      .filter(char::is_ascii_digit)
      .count()
      >= MIN_PHONE_DIGITS
  })
}
