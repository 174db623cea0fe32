use teloxide::utils::html;

use crate::models::Account;
use crate::models::Entity;
use crate::models::Project;
use crate::models::ProjectData;
use crate::models::ProjectStatus;
use crate::util::format_price;
use crate::util::render_due_date;

pub const NEGOTIABLE: &str = "negotiable";

fn hashtag(value: &str) -> String {
  let tag: String = value
    .trim()
    .chars()
    .map(|c| if c.is_whitespace() || c == '-' { '_' } else { c })
    .collect();
  format!("#{}", html::escape(&tag))
}

/// Session summary. The note is only shown to the project's client.
pub fn render_project(status: ProjectStatus, data: &ProjectData, show_note: bool, currency: &str) -> String {
  let price = match data.price {
    Some(amount) => format_price(amount, currency),
    None => NEGOTIABLE.to_string(),
  };
  let mut text = format!(
    "{} <b>{}</b>\n\n{} {}\n\n{}\n\n📅 Due: {}\n💰 Price: {}",
    status.emoji(),
    status.label(),
    hashtag(&data.work_type),
    hashtag(&data.subject),
    html::escape(&data.description),
    html::escape(&render_due_date(&data.date)),
    price,
  );
  if show_note && let Some(note) = data.note.as_deref().filter(|note| !note.trim().is_empty()) {
    text.push_str(&format!("\n📝 Note: {}", html::escape(note)));
  }
  text
}

/// One-line entry for listings.
pub fn render_project_line(project: &Project, currency: &str) -> String {
  let key = project.key().unwrap_or_else(|_| "-".to_string());
  let (subject, price) = match project.data.as_ref() {
    Some(data) => (
      html::escape(&data.subject),
      data
        .price
        .map(|amount| format_price(amount, currency))
        .unwrap_or_else(|| NEGOTIABLE.to_string()),
    ),
    None => ("-".to_string(), NEGOTIABLE.to_string()),
  };
  format!(
    "{} <code>{}</code> {} ({})",
    project.status.emoji(),
    key,
    subject,
    price
  )
}

pub fn offer_text(price: i64, currency: &str) -> String {
  format!("💬 The worker offers to do this project for <b>{}</b>.", format_price(price, currency))
}

pub fn payment_done_client(price: i64, balance: i64, currency: &str) -> String {
  format!(
    "✅ Payment of {} received. Work has started.\nRemaining balance: {}",
    format_price(price, currency),
    format_price(balance, currency)
  )
}

pub fn payment_done_worker(price: i64, currency: &str) -> String {
  format!(
    "⏳ The client paid {}. You can start working.",
    format_price(price, currency)
  )
}

pub fn completion_prompt() -> &'static str {
  "Has the worker delivered everything? Confirming releases the payment to the worker."
}

pub fn completed_client() -> &'static str {
  "✅ Project completed. Thank you! You can now leave a review from /menu."
}

pub fn completed_worker(price: i64, currency: &str) -> String {
  format!(
    "✅ The client confirmed completion. {} was credited to your balance.",
    format_price(price, currency)
  )
}

pub fn counterpart_joined(role: &str) -> String {
  format!("👋 The {role} joined the chat.")
}

pub fn counterpart_left(role: &str) -> String {
  format!("🚪 The {role} left the chat.")
}

pub fn counterpart_edited(role: &str) -> String {
  format!("✏️ The {role} edited a message:")
}

pub fn admin_called(link: &str, role: &str, project_id: &str) -> String {
  format!(
    "🆘 Admin requested by the {role} of project <code>{}</code>.\n{}",
    html::escape(project_id),
    html::escape(link)
  )
}

pub fn profile_card(account: &Account, rating: Option<f32>, review_count: usize, currency: &str) -> String {
  let mut lines = vec![format!("👤 <b>Profile</b> <code>{}</code>", account.id)];
  match &account.profile {
    Some(profile) => {
      lines.push(format!("Nickname: {}", html::escape(&profile.nickname)));
      lines.push(format!("Phone: {}", html::escape(&profile.phone)));
      lines.push(format!("Email: {}", html::escape(&profile.email)));
      lines.push(format!("Bio: {}", html::escape(&profile.biography)));
    },
    None => lines.push("No profile details yet.".to_string()),
  }
  if let Some(page) = &account.page_url {
    lines.push(format!("Page: {}", html::escape(page)));
  }
  lines.push(format!("💰 Balance: {}", format_price(account.balance, currency)));
  match rating {
    Some(rating) => lines.push(format!("⭐ {rating:.1} from {review_count} reviews")),
    None => lines.push("⭐ No reviews yet".to_string()),
  }
  lines.join("\n")
}
