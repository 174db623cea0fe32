use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use teloxide::dispatching::UpdateHandler;
use teloxide::dispatching::dialogue::Dialogue;
use teloxide::dptree;
use teloxide::prelude::*;
use teloxide::types::CallbackQuery;
use teloxide::types::ChatId;
use teloxide::types::Message;
use teloxide::types::MessageId;
use teloxide::types::MessageKind;
use teloxide::types::ParseMode;
use teloxide::types::User;
use teloxide::utils::command::BotCommands;
use teloxide::utils::html;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::bot::Command;
use crate::bot::DialogueStorage;
use crate::bot::HandlerResult;
use crate::bot::callback::CallbackData;
use crate::bot::context::AppContext;
use crate::bot::state::ConversationState;
use crate::bot::state::ProjectDraft;
use crate::bot::state::ProjectStage;
use crate::bot::state::ReviewDraft;
use crate::bot::state::ReviewStage;
use crate::bot::templates;
use crate::models::Account;
use crate::models::Bid;
use crate::models::Profile;
use crate::models::Project;
use crate::models::ProjectStatus;
use crate::models::Rating;
use crate::models::check_score;
use crate::relay::Incoming;
use crate::relay::RelayOutcome;
use crate::session::SessionError;
use crate::util::format_price;
use crate::util::parse_due_date;

type SharedContext = Arc<AppContext>;
type BotDialogue = Dialogue<ConversationState, DialogueStorage>;

const PROFILE_USAGE: &str = "Usage: /profile <nickname|phone|email|bio|page> <value>";

const HELP_FOOTER: &str = "Project chats are opened by the admin once a worker is matched. Inside a project chat use /menu for \
                           the available actions.";

pub fn build_schema() -> UpdateHandler<anyhow::Error> {
  let dialogue_branch = dptree::filter(|msg: Message, state: ConversationState| is_dialogue_owner(sender_id(&msg), &state))
    .branch(dptree::filter(|msg: Message| is_cancel_text(&msg)).endpoint(handle_cancel))
    .branch(dptree::case![ConversationState::AwaitingPrice { worker_id }].endpoint(handle_price_message))
    .branch(dptree::case![ConversationState::AddProject(draft)].endpoint(handle_project_draft_message))
    .branch(dptree::case![ConversationState::Review(draft)].endpoint(handle_review_message));

  let message_handler = Update::filter_message()
    .enter_dialogue::<Message, DialogueStorage, ConversationState>()
    .branch(command_branch())
    .branch(dialogue_branch)
    .branch(dptree::filter(|msg: Message| msg.new_chat_members().is_some()).endpoint(handle_members_joined))
    .branch(dptree::filter(|msg: Message| msg.left_chat_member().is_some()).endpoint(handle_member_left))
    .branch(dptree::filter(|msg: Message| is_relayable(&msg)).endpoint(handle_relay_message))
    .branch(dptree::endpoint(handle_idle_text));

  let edited_handler = Update::filter_edited_message()
    .filter(|msg: Message| is_relayable(&msg))
    .endpoint(handle_edited_message);

  let callback_handler = Update::filter_callback_query()
    .enter_dialogue::<CallbackQuery, DialogueStorage, ConversationState>()
    .endpoint(handle_callback_query);

  dptree::entry()
    .branch(message_handler)
    .branch(edited_handler)
    .branch(callback_handler)
}

fn command_branch() -> UpdateHandler<anyhow::Error> {
  dptree::entry()
    .filter_command::<Command>()
    .branch(dptree::case![Command::Start].endpoint(handle_start))
    .branch(dptree::case![Command::Help].endpoint(handle_help))
    .branch(dptree::case![Command::Menu].endpoint(handle_menu))
    .branch(dptree::case![Command::Cancel].endpoint(handle_cancel))
    .branch(dptree::case![Command::NewProject].endpoint(handle_new_project))
    .branch(dptree::case![Command::Projects].endpoint(handle_projects))
    .branch(dptree::case![Command::Find].endpoint(handle_find))
    .branch(dptree::case![Command::Subjects(args)].endpoint(handle_subjects))
    .branch(dptree::case![Command::Balance].endpoint(handle_balance))
    .branch(dptree::case![Command::Profile(args)].endpoint(handle_profile))
    .branch(dptree::case![Command::Bid(args)].endpoint(handle_bid))
    .branch(admin_branch())
    .branch(dptree::endpoint(handle_admin_only))
}

fn admin_branch() -> UpdateHandler<anyhow::Error> {
  dptree::filter(|msg: Message, ctx: SharedContext| sender_id(&msg).is_some_and(|id| ctx.is_admin(id)))
    .branch(dptree::case![Command::Pair(args)].endpoint(handle_pair))
    .branch(dptree::case![Command::Unpair(args)].endpoint(handle_unpair))
    .branch(dptree::case![Command::Topup(args)].endpoint(handle_topup))
    .branch(dptree::case![Command::SetStatus(args)].endpoint(handle_set_status))
    .branch(dptree::case![Command::DelUser(args)].endpoint(handle_delete_user))
    .branch(dptree::case![Command::DelProject(args)].endpoint(handle_delete_project))
}

#[instrument(skip(bot, msg))]
async fn handle_admin_only(bot: Bot, msg: Message) -> HandlerResult {
  warn!(chat_id = %msg.chat.id, sender_id = ?sender_id(&msg), "admin command from non-admin");
  bot.send_message(msg.chat.id, "🛡️ Admins only.").await?;
  Ok(())
}

#[instrument(skip(bot, ctx, dialogue, msg))]
async fn handle_start(bot: Bot, dialogue: BotDialogue, ctx: SharedContext, msg: Message) -> HandlerResult {
  dialogue.reset().await?;
  let user = msg.from.as_ref().context("message missing sender")?;
  let account = ensure_account(&ctx, user).await?;
  let username = user.username.as_deref().unwrap_or("-");
  info!(user_id = account.id, chat_id = %msg.chat.id, username, "received /start command");
  let text = format!(
    "👋 Welcome!\n\nBalance: {}\n\n{}",
    format_price(account.balance, ctx.currency()),
    Command::descriptions()
  );
  bot.send_message(msg.chat.id, text).await?;
  Ok(())
}

#[instrument(skip(bot, msg))]
async fn handle_help(bot: Bot, msg: Message) -> HandlerResult {
  info!(chat_id = %msg.chat.id, "received /help command");
  let mut text = Command::descriptions().to_string();
  text.push_str("\n\n");
  text.push_str(HELP_FOOTER);
  bot.send_message(msg.chat.id, text).await?;
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
async fn handle_menu(bot: Bot, ctx: SharedContext, msg: Message) -> HandlerResult {
  let Some(session) = ctx.sessions().resolve(msg.chat.id.0).await? else {
    bot
      .send_message(msg.chat.id, "ℹ️ /menu works inside a project chat.")
      .await?;
    return Ok(());
  };
  if let Err(err) = ctx.sessions().show_menu(&session).await {
    report_session_error(&ctx, msg.chat.id, err).await?;
  }
  Ok(())
}

#[instrument(skip(bot, dialogue, msg))]
async fn handle_cancel(bot: Bot, dialogue: BotDialogue, msg: Message) -> HandlerResult {
  let state = dialogue.get().await?.unwrap_or_default();
  dialogue.reset().await?;
  info!(chat_id = %msg.chat.id, state = ?state, "pending interaction cancelled");
  let text = if state == ConversationState::Idle {
    "Nothing to cancel."
  } else {
    "❌ Cancelled."
  };
  bot.send_message(msg.chat.id, text).await?;
  Ok(())
}

#[instrument(skip(bot, dialogue, ctx, msg))]
async fn handle_new_project(bot: Bot, dialogue: BotDialogue, ctx: SharedContext, msg: Message) -> HandlerResult {
  if !msg.chat.is_private() {
    bot
      .send_message(msg.chat.id, "📝 Projects are created in a private chat with the bot.")
      .await?;
    return Ok(());
  }
  let user = msg.from.as_ref().context("message missing sender")?;
  let account = ensure_account(&ctx, user).await?;
  dialogue
    .update(ConversationState::AddProject(ProjectDraft::new(account.id)))
    .await?;
  info!(user_id = account.id, "started project draft");
  bot
    .send_message(msg.chat.id, "📝 What kind of work is it? (essay, course work, ...)\nSend \"cancel\" to stop.")
    .await?;
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
async fn handle_projects(bot: Bot, ctx: SharedContext, msg: Message) -> HandlerResult {
  let user_id = sender_id(&msg).context("message missing sender")?;
  let as_client = ctx.db().get_projects_by_client(user_id).await?;
  let as_worker = ctx.db().get_projects_by_worker(user_id).await?;
  info!(
    user_id,
    client_count = as_client.len(),
    worker_count = as_worker.len(),
    "listing projects"
  );

  if as_client.is_empty() && as_worker.is_empty() {
    bot.send_message(msg.chat.id, "📂 You have no projects yet. Use /newproject.").await?;
    return Ok(());
  }

  let mut text = String::new();
  if !as_client.is_empty() {
    text.push_str("📂 <b>Your projects</b>\n");
    push_project_lines(&mut text, &as_client, ctx.currency());
  }
  if !as_worker.is_empty() {
    if !text.is_empty() {
      text.push('\n');
    }
    text.push_str("🛠 <b>Your work</b>\n");
    push_project_lines(&mut text, &as_worker, ctx.currency());
  }
  bot.send_message(msg.chat.id, text).parse_mode(ParseMode::Html).await?;
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
async fn handle_find(bot: Bot, ctx: SharedContext, msg: Message) -> HandlerResult {
  let user = msg.from.as_ref().context("message missing sender")?;
  let account = ensure_account(&ctx, user).await?;
  if account.subjects.is_empty() {
    bot
      .send_message(msg.chat.id, "🔎 Set your subjects first: /subjects math, physics")
      .await?;
    return Ok(());
  }

  let projects = ctx.db().get_projects_by_subjects(&account.subjects, true).await?;
  info!(user_id = account.id, count = projects.len(), "matched open projects");
  if projects.is_empty() {
    bot
      .send_message(msg.chat.id, "🔎 No open projects in your subjects right now.")
      .await?;
    return Ok(());
  }

  let mut text = format!("🔎 <b>Open projects ({})</b>\n", projects.len());
  push_project_lines(&mut text, &projects, ctx.currency());
  text.push_str("\nOffer to take one with /bid &lt;project_id&gt; &lt;message&gt;");
  bot.send_message(msg.chat.id, text).parse_mode(ParseMode::Html).await?;
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
async fn handle_subjects(bot: Bot, ctx: SharedContext, msg: Message, args: String) -> HandlerResult {
  let user = msg.from.as_ref().context("message missing sender")?;
  let account = ensure_account(&ctx, user).await?;
  let subjects = parse_subjects(&args);
  if subjects.is_empty() {
    let current = if account.subjects.is_empty() {
      "none".to_string()
    } else {
      account.subjects.iter().cloned().collect::<Vec<_>>().join(", ")
    };
    bot
      .send_message(
        msg.chat.id,
        format!("📚 Your subjects: {current}\nUsage: /subjects math, physics"),
      )
      .await?;
    return Ok(());
  }

  ctx.db().update_account_subjects(account.id, &subjects).await?;
  info!(user_id = account.id, count = subjects.len(), "subjects updated");
  bot
    .send_message(
      msg.chat.id,
      format!(
        "📚 Subjects saved: {}",
        subjects.into_iter().collect::<Vec<_>>().join(", ")
      ),
    )
    .await?;
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
async fn handle_balance(bot: Bot, ctx: SharedContext, msg: Message) -> HandlerResult {
  let user = msg.from.as_ref().context("message missing sender")?;
  let account = ensure_account(&ctx, user).await?;
  bot
    .send_message(
      msg.chat.id,
      format!("💰 Balance: {}", format_price(account.balance, ctx.currency())),
    )
    .await?;
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
async fn handle_profile(bot: Bot, ctx: SharedContext, msg: Message, args: String) -> HandlerResult {
  let user = msg.from.as_ref().context("message missing sender")?;
  let account = ensure_account(&ctx, user).await?;
  let args = args.trim();

  if args.is_empty() {
    let reviews = ctx.db().get_reviews_by_worker(account.id).await?;
    let scores: Vec<f32> = reviews
      .iter()
      .filter_map(|review| review.rating.as_ref().map(Rating::average))
      .collect();
    let rating = (!scores.is_empty()).then(|| scores.iter().sum::<f32>() / scores.len() as f32);
    let text = templates::profile_card(&account, rating, reviews.len(), ctx.currency());
    bot.send_message(msg.chat.id, text).parse_mode(ParseMode::Html).await?;
    return Ok(());
  }

  let Some((field, value)) = args.split_once(char::is_whitespace) else {
    bot.send_message(msg.chat.id, PROFILE_USAGE).await?;
    return Ok(());
  };
  let value = value.trim();
  let Some(field) = ProfileField::parse(field) else {
    bot.send_message(msg.chat.id, PROFILE_USAGE).await?;
    return Ok(());
  };

  match field {
    ProfileField::Page => ctx.db().update_account_page_url(account.id, value).await?,
    ProfileField::Stored(path) => {
      if account.profile.is_none() {
        ctx.db().update_account_profile(account.id, &Profile::blank()).await?;
      }
      ctx.db().update_profile_field(account.id, path, value.into()).await?;
    },
  }
  info!(user_id = account.id, field = ?field, "profile updated");
  bot.send_message(msg.chat.id, "👤 Profile updated.").await?;
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
async fn handle_bid(bot: Bot, ctx: SharedContext, msg: Message, args: String) -> HandlerResult {
  let user = msg.from.as_ref().context("message missing sender")?;
  let worker_id = user.id.0 as i64;
  let Some((project_id, text)) = args.trim().split_once(char::is_whitespace) else {
    bot
      .send_message(msg.chat.id, "Usage: /bid <project_id> <message>")
      .await?;
    return Ok(());
  };

  let Some(project) = ctx.db().get_project(project_id).await? else {
    bot.send_message(msg.chat.id, "Project not found.").await?;
    return Ok(());
  };
  if project.status != ProjectStatus::Open {
    bot
      .send_message(msg.chat.id, "This project is no longer open.")
      .await?;
    return Ok(());
  }
  if project.client_id == worker_id {
    bot
      .send_message(msg.chat.id, "You cannot bid on your own project.")
      .await?;
    return Ok(());
  }

  let bid_id = ctx
    .db()
    .add_bid(&Bid {
      id: None,
      client_id: project.client_id,
      project_id: project_id.to_string(),
      worker_id: Some(worker_id),
      text: Some(text.trim().to_string()),
    })
    .await?;
  info!(worker_id, project_id, bid_id = %bid_id, "bid recorded");

  bot
    .send_message(msg.chat.id, "📨 Your bid was sent to the client.")
    .await?;
  let notice = format!(
    "📨 New bid on project <code>{}</code>:\n{}",
    html::escape(project_id),
    html::escape(text.trim())
  );
  if let Err(err) = ctx
    .transport()
    .send_text(ChatId(project.client_id), &notice, None)
    .await
  {
    warn!(error = %err, client_id = project.client_id, "failed to notify client about bid");
  }
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
async fn handle_pair(bot: Bot, ctx: SharedContext, msg: Message, args: String) -> HandlerResult {
  let parts: Vec<&str> = args.split_whitespace().collect();
  let [project_id, worker_id, client_chat, worker_chat] = parts.as_slice() else {
    bot
      .send_message(msg.chat.id, "Usage: /pair <project_id> <worker_id> <client_chat_id> <worker_chat_id>")
      .await?;
    return Ok(());
  };
  let (Ok(worker_id), Ok(client_chat), Ok(worker_chat)) =
    (worker_id.parse::<i64>(), client_chat.parse::<i64>(), worker_chat.parse::<i64>())
  else {
    bot.send_message(msg.chat.id, "Ids must be integers.").await?;
    return Ok(());
  };

  match ctx
    .sessions()
    .provision(project_id, worker_id, client_chat, worker_chat)
    .await
  {
    Ok(()) => {
      bot
        .send_message(msg.chat.id, format!("🤝 Project {project_id} paired."))
        .await?;
    },
    Err(err) => report_session_error(&ctx, msg.chat.id, err).await?,
  }
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
async fn handle_unpair(bot: Bot, ctx: SharedContext, msg: Message, args: String) -> HandlerResult {
  let Ok(chat_id) = args.trim().parse::<i64>() else {
    bot.send_message(msg.chat.id, "Usage: /unpair <chat_id>").await?;
    return Ok(());
  };
  let text = if ctx.sessions().unpair(chat_id).await? {
    format!("🔓 Chat {chat_id} and its pair were released.")
  } else {
    format!("Chat {chat_id} is not paired.")
  };
  bot.send_message(msg.chat.id, text).await?;
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
async fn handle_topup(bot: Bot, ctx: SharedContext, msg: Message, args: String) -> HandlerResult {
  let parts: Vec<&str> = args.split_whitespace().collect();
  let [user_id, delta] = parts.as_slice() else {
    bot.send_message(msg.chat.id, "Usage: /topup <user_id> <delta>").await?;
    return Ok(());
  };
  let (Ok(user_id), Ok(delta)) = (user_id.parse::<i64>(), delta.parse::<i64>()) else {
    bot.send_message(msg.chat.id, "Ids and amounts must be integers.").await?;
    return Ok(());
  };

  ctx.db().incr_balance(user_id, delta).await?;
  let balance = ctx.db().balance(user_id).await?;
  bot
    .send_message(
      msg.chat.id,
      format!(
        "💰 Balance of {user_id} is now {}.",
        format_price(balance, ctx.currency())
      ),
    )
    .await?;
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
async fn handle_set_status(bot: Bot, ctx: SharedContext, msg: Message, args: String) -> HandlerResult {
  let parts: Vec<&str> = args.split_whitespace().collect();
  let [project_id, status] = parts.as_slice() else {
    bot
      .send_message(msg.chat.id, "Usage: /setstatus <project_id> <open|in_progress|completed>")
      .await?;
    return Ok(());
  };
  let status = match status.parse::<ProjectStatus>() {
    Ok(status) => status,
    Err(err) => {
      bot.send_message(msg.chat.id, err).await?;
      return Ok(());
    },
  };

  match ctx.sessions().force_status(project_id, status).await {
    Ok(()) => {
      bot
        .send_message(
          msg.chat.id,
          format!("{} Project {project_id} is now {}.", status.emoji(), status.label()),
        )
        .await?;
    },
    Err(err) => report_session_error(&ctx, msg.chat.id, err).await?,
  }
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
async fn handle_delete_user(bot: Bot, ctx: SharedContext, msg: Message, args: String) -> HandlerResult {
  let Ok(user_id) = args.trim().parse::<i64>() else {
    bot.send_message(msg.chat.id, "Usage: /deluser <user_id>").await?;
    return Ok(());
  };
  let text = if ctx.db().delete_account(user_id).await? {
    warn!(user_id, "account removed by admin");
    format!("🗑 Account {user_id} removed.")
  } else {
    format!("Account {user_id} not found.")
  };
  bot.send_message(msg.chat.id, text).await?;
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
async fn handle_delete_project(bot: Bot, ctx: SharedContext, msg: Message, args: String) -> HandlerResult {
  let project_id = args.trim();
  if project_id.is_empty() {
    bot.send_message(msg.chat.id, "Usage: /delproject <project_id>").await?;
    return Ok(());
  }
  let text = if ctx.sessions().remove_project(project_id).await? {
    format!("🗑 Project {project_id} removed.")
  } else {
    format!("Project {project_id} not found.")
  };
  bot.send_message(msg.chat.id, text).await?;
  Ok(())
}

#[instrument(skip(bot, dialogue, ctx, msg))]
async fn handle_price_message(
  bot: Bot,
  dialogue: BotDialogue,
  ctx: SharedContext,
  msg: Message,
  worker_id: i64,
) -> HandlerResult {
  let chat_id = msg.chat.id;
  let Some(session) = ctx.sessions().resolve(chat_id.0).await? else {
    dialogue.reset().await?;
    return Ok(());
  };
  let input = message_text(&msg).unwrap_or_default();
  info!(worker_id, chat_id = %chat_id, "handling price input");

  match ctx.sessions().submit_offer(&session, input).await {
    Ok(_) => dialogue.reset().await?,
    Err(err @ SessionError::InvalidPrice(_)) => {
      bot.send_message(chat_id, err.user_message(ctx.currency())).await?;
    },
    Err(err) => {
      dialogue.reset().await?;
      report_session_error(&ctx, chat_id, err).await?;
    },
  }
  Ok(())
}

#[instrument(skip(bot, dialogue, ctx, msg, draft))]
async fn handle_project_draft_message(
  bot: Bot,
  dialogue: BotDialogue,
  ctx: SharedContext,
  msg: Message,
  mut draft: ProjectDraft,
) -> HandlerResult {
  let chat_id = msg.chat.id;
  let Some(text) = message_text(&msg).map(str::trim).filter(|text| !text.is_empty()) else {
    bot.send_message(chat_id, "Please answer with text.").await?;
    return Ok(());
  };
  info!(client_id = draft.client_id, chat_id = %chat_id, stage = ?draft.stage, "handling project draft input");

  match draft.stage {
    ProjectStage::WorkType => {
      draft.work_type = Some(text.to_string());
      draft.stage = ProjectStage::Subject;
      dialogue.update(ConversationState::AddProject(draft)).await?;
      bot.send_message(chat_id, "📚 Which subject?").await?;
    },
    ProjectStage::Subject => {
      draft.subject = Some(text.to_string());
      draft.stage = ProjectStage::Date;
      dialogue.update(ConversationState::AddProject(draft)).await?;
      bot.send_message(chat_id, "📅 Due date (YYYY-MM-DD):").await?;
    },
    ProjectStage::Date => {
      if parse_due_date(text).is_none() {
        bot
          .send_message(chat_id, "📅 Use the YYYY-MM-DD format, e.g. 2024-05-17.")
          .await?;
        return Ok(());
      }
      draft.date = Some(text.to_string());
      draft.stage = ProjectStage::Description;
      dialogue.update(ConversationState::AddProject(draft)).await?;
      bot.send_message(chat_id, "🧾 Describe the task:").await?;
    },
    ProjectStage::Description => {
      draft.description = Some(text.to_string());
      draft.stage = ProjectStage::Note;
      dialogue.update(ConversationState::AddProject(draft)).await?;
      bot
        .send_message(chat_id, "📝 Any private note for the worker chat? (or '-' to skip)")
        .await?;
    },
    ProjectStage::Note => {
      let note = (text != "-").then(|| text.to_string());
      let client_id = draft.client_id;
      let data = draft.finish(note).context("project draft finished with missing fields")?;
      let project = Project::new(client_id, data);
      let project_id = ctx.db().add_project(&project).await?;
      dialogue.reset().await?;
      info!(client_id, project_id = %project_id, "project created");

      let summary = project
        .data
        .as_ref()
        .map(|data| templates::render_project(project.status, data, true, ctx.currency()))
        .unwrap_or_default();
      bot
        .send_message(
          chat_id,
          format!("✅ Project created: <code>{}</code>\n\n{summary}", html::escape(&project_id)),
        )
        .parse_mode(ParseMode::Html)
        .await?;
    },
  }
  Ok(())
}

#[instrument(skip(bot, dialogue, ctx, msg, draft))]
async fn handle_review_message(
  bot: Bot,
  dialogue: BotDialogue,
  ctx: SharedContext,
  msg: Message,
  mut draft: ReviewDraft,
) -> HandlerResult {
  let chat_id = msg.chat.id;
  let Some(session) = ctx.sessions().resolve(chat_id.0).await? else {
    dialogue.reset().await?;
    return Ok(());
  };
  let text = message_text(&msg).map(str::trim).unwrap_or_default();
  info!(client_id = draft.client_id, chat_id = %chat_id, stage = ?draft.stage, "handling review input");

  if draft.stage != ReviewStage::Text {
    let Some(score) = text.parse::<u8>().ok().and_then(|score| check_score(score).ok()) else {
      bot
        .send_message(chat_id, format!("Send a number from 1 to {}.", Rating::MAX_SCORE))
        .await?;
      return Ok(());
    };
    let next_prompt = match draft.stage {
      ReviewStage::Quality => {
        draft.quality = Some(score);
        draft.stage = ReviewStage::Contact;
        "🤝 How was the communication? (1-5)"
      },
      ReviewStage::Contact => {
        draft.contact = Some(score);
        draft.stage = ReviewStage::Terms;
        "⏱ Were the deadlines met? (1-5)"
      },
      _ => {
        draft.terms = Some(score);
        draft.stage = ReviewStage::Text;
        "✍️ A few words about the work:"
      },
    };
    dialogue.update(ConversationState::Review(draft)).await?;
    bot.send_message(chat_id, next_prompt).await?;
    return Ok(());
  }

  if text.is_empty() {
    bot.send_message(chat_id, "✍️ Please write a short review.").await?;
    return Ok(());
  }
  let (Some(quality), Some(contact), Some(terms)) = (draft.quality, draft.contact, draft.terms) else {
    dialogue.reset().await?;
    warn!(chat_id = %chat_id, "review draft lost its scores");
    return Ok(());
  };
  let rating = Rating::new(quality, contact, terms)?;
  let client_name = msg
    .from
    .as_ref()
    .map(|user| user.first_name.clone())
    .unwrap_or_default();

  dialogue.reset().await?;
  if let Err(err) = ctx
    .sessions()
    .submit_review(&session, &client_name, rating, text)
    .await
  {
    report_session_error(&ctx, chat_id, err).await?;
  }
  Ok(())
}

#[instrument(skip(ctx, msg))]
async fn handle_members_joined(ctx: SharedContext, msg: Message) -> HandlerResult {
  let members = msg.new_chat_members().unwrap_or_default();
  for member in members.iter().filter(|member| !member.is_bot) {
    ctx
      .relay()
      .member_joined(msg.chat.id, member.id.0 as i64)
      .await?;
  }
  Ok(())
}

#[instrument(skip(ctx, msg))]
async fn handle_member_left(ctx: SharedContext, msg: Message) -> HandlerResult {
  if let Some(member) = msg.left_chat_member()
    && !member.is_bot
  {
    ctx.relay().member_left(msg.chat.id, member.id.0 as i64).await?;
  }
  Ok(())
}

#[instrument(skip(ctx, msg))]
async fn handle_relay_message(ctx: SharedContext, msg: Message) -> HandlerResult {
  let Some(incoming) = incoming(&msg) else {
    return Ok(());
  };
  let outcome = ctx.relay().relay_message(&incoming).await?;
  log_relay_outcome(msg.chat.id, &outcome);
  Ok(())
}

#[instrument(skip(ctx, msg))]
async fn handle_edited_message(ctx: SharedContext, msg: Message) -> HandlerResult {
  let Some(incoming) = incoming(&msg) else {
    return Ok(());
  };
  let outcome = ctx.relay().relay_edit(&incoming).await?;
  log_relay_outcome(msg.chat.id, &outcome);
  Ok(())
}

fn log_relay_outcome(chat: ChatId, outcome: &RelayOutcome) {
  match outcome {
    RelayOutcome::Relayed(copy_id) => debug!(chat_id = %chat, copy_id = copy_id.0, "message relayed"),
    RelayOutcome::Blocked(violation) => debug!(chat_id = %chat, violation = ?violation, "message blocked"),
    RelayOutcome::Notified => debug!(chat_id = %chat, "pair notified"),
    RelayOutcome::NotPaired => {},
  }
}

#[instrument(skip(bot, msg))]
async fn handle_idle_text(bot: Bot, msg: Message, state: ConversationState) -> HandlerResult {
  if matches!(state, ConversationState::Idle)
    && msg.chat.is_private()
    && let Some(text) = msg.text()
  {
    if text.starts_with('/') {
      // unknown command, ignore to let telegram handle
    } else {
      info!(chat_id = %msg.chat.id, "idle state received unrecognized message");
      bot
        .send_message(msg.chat.id, "I did not understand that. Use /help.")
        .await?;
    }
  }
  Ok(())
}

#[instrument(skip(ctx, query, dialogue))]
async fn handle_callback_query(ctx: SharedContext, query: CallbackQuery, dialogue: BotDialogue) -> HandlerResult {
  let user_id = query.from.id.0 as i64;
  let callback_data = query.data.as_deref().unwrap_or("<empty>");
  let Some((chat, message_id)) = query.message.as_ref().map(|message| (message.chat().id, message.id())) else {
    info!(user_id, callback = callback_data, "callback query without message context");
    ctx.transport().answer_callback(&query.id.0, None).await?;
    return Ok(());
  };
  info!(user_id, chat_id = %chat, callback = callback_data, "handling callback query");

  let press = ButtonPress {
    user_id,
    chat,
    message_id,
  };
  let reply = run_callback(&ctx, press, callback_data).await?;
  match reply.dialogue {
    DialogueChange::Keep => {},
    DialogueChange::Reset => dialogue.reset().await?,
    DialogueChange::Enter(state) => dialogue.update(state).await?,
  }
  ctx
    .transport()
    .answer_callback(&query.id.0, reply.notice.as_deref())
    .await?;
  Ok(())
}

#[derive(Debug, Clone, Copy)]
struct ButtonPress {
  user_id: i64,
  chat: ChatId,
  message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DialogueChange {
  Keep,
  Reset,
  Enter(ConversationState),
}

/// Outcome of a button press: the dialogue change and an optional ephemeral
/// notice for the callback answer.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CallbackReply {
  dialogue: DialogueChange,
  notice: Option<String>,
}

impl CallbackReply {
  fn silent(dialogue: DialogueChange) -> Self {
    Self { dialogue, notice: None }
  }
}

/// Decodes a button payload and runs the session action behind it.
/// Validation errors are answered in the chat; role and status mismatches
/// only get an ephemeral notice.
async fn run_callback(ctx: &AppContext, press: ButtonPress, payload: &str) -> Result<CallbackReply> {
  let ButtonPress {
    user_id,
    chat,
    message_id,
  } = press;
  let data = match CallbackData::decode(payload) {
    Ok(data) => data,
    Err(err) => {
      warn!(error = %err, user_id, "rejected callback payload");
      ctx
        .transport()
        .send_text(chat, &html::escape(err.user_message()), None)
        .await?;
      return Ok(CallbackReply::silent(DialogueChange::Keep));
    },
  };

  if data == CallbackData::DeleteMessage {
    ctx.transport().delete_message(chat, message_id).await?;
    return Ok(CallbackReply::silent(DialogueChange::Reset));
  }

  let Some(session) = ctx.sessions().resolve(chat.0).await? else {
    debug!(chat_id = %chat, "callback outside a paired chat");
    return Ok(CallbackReply::silent(DialogueChange::Keep));
  };

  let consumes_message = matches!(data, CallbackData::Pay { .. } | CallbackData::ConfirmProject { .. });
  let sessions = ctx.sessions();
  let result = match data {
    CallbackData::CallAdmin => sessions
      .call_admin(&session, ctx.admin_id())
      .await
      .map(|()| DialogueChange::Keep),
    CallbackData::OfferPrice => sessions
      .begin_offer(&session)
      .await
      .map(|()| DialogueChange::Enter(ConversationState::AwaitingPrice { worker_id: user_id })),
    CallbackData::RequestCompletion => sessions
      .request_completion(&session)
      .await
      .map(|()| DialogueChange::Keep),
    CallbackData::Feedback => match sessions.begin_review(&session).await {
      Ok(()) => {
        ctx
          .transport()
          .send_text(chat, "⭐ Rate the quality of the work (1-5):", None)
          .await?;
        Ok(DialogueChange::Enter(ConversationState::Review(ReviewDraft::new(user_id))))
      },
      Err(err) => Err(err),
    },
    CallbackData::Pay { price, project_id } => sessions.pay(&session, user_id, price, &project_id).await.map(|payment| {
      info!(
        client_id = payment.client_id,
        worker_id = payment.worker_id,
        price = payment.price,
        balance_after = payment.balance_after,
        "payment handled"
      );
      DialogueChange::Keep
    }),
    CallbackData::ConfirmProject { project_id } => sessions
      .confirm_completion(&session, user_id, &project_id)
      .await
      .map(|payment| {
        info!(price = payment.price, worker_id = payment.worker_id, "completion handled");
        DialogueChange::Keep
      }),
    CallbackData::DeleteMessage => Ok(DialogueChange::Keep),
  };

  match result {
    Ok(dialogue) => {
      if consumes_message
        && let Err(err) = ctx.transport().delete_message(chat, message_id).await
      {
        warn!(error = %err, chat_id = %chat, "failed to remove used action message");
      }
      Ok(CallbackReply::silent(dialogue))
    },
    Err(SessionError::Internal(err)) => Err(err),
    Err(err) if err.is_not_applicable() => {
      debug!(error = %err, user_id, chat_id = %chat, "session action not applicable");
      Ok(CallbackReply {
        dialogue: DialogueChange::Keep,
        notice: Some(err.user_message(ctx.currency())),
      })
    },
    Err(err) => {
      debug!(error = %err, user_id, chat_id = %chat, "session action refused");
      ctx
        .transport()
        .send_text(chat, &html::escape(&err.user_message(ctx.currency())), None)
        .await?;
      Ok(CallbackReply::silent(DialogueChange::Keep))
    },
  }
}

/// Validation errors are answered in the chat; lookup-style mismatches are
/// only logged; store and transport failures propagate.
async fn report_session_error(ctx: &SharedContext, chat: ChatId, err: SessionError) -> HandlerResult {
  match err {
    SessionError::Internal(err) => Err(err),
    err if err.is_not_applicable() => {
      debug!(error = %err, chat_id = %chat, "session action not applicable");
      Ok(())
    },
    err => {
      ctx
        .transport()
        .send_text(chat, &html::escape(&err.user_message(ctx.currency())), None)
        .await?;
      Ok(())
    },
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProfileField {
  /// Dotted path inside the stored profile.
  Stored(&'static str),
  Page,
}

impl ProfileField {
  fn parse(name: &str) -> Option<Self> {
    match name.to_lowercase().as_str() {
      "nickname" | "nick" => Some(Self::Stored("nickname")),
      "phone" => Some(Self::Stored("phone")),
      "email" => Some(Self::Stored("email")),
      "bio" | "biography" => Some(Self::Stored("biography")),
      "page" => Some(Self::Page),
      _ => None,
    }
  }
}

async fn ensure_account(ctx: &SharedContext, user: &User) -> Result<Account> {
  ctx
    .db()
    .ensure_account(user.id.0 as i64)
    .await
    .context("failed to ensure account record")
}

fn push_project_lines(text: &mut String, projects: &[Project], currency: &str) {
  for project in projects {
    text.push_str(&templates::render_project_line(project, currency));
    text.push('\n');
  }
}

fn parse_subjects(args: &str) -> BTreeSet<String> {
  args
    .split(',')
    .map(str::trim)
    .filter(|subject| !subject.is_empty())
    .map(str::to_string)
    .collect()
}

fn sender_id(msg: &Message) -> Option<i64> {
  msg.from.as_ref().map(|user| user.id.0 as i64)
}

fn message_text(msg: &Message) -> Option<&str> {
  msg.text().or_else(|| msg.caption())
}

fn is_cancel_text(msg: &Message) -> bool {
  message_text(msg).is_some_and(|text| text.trim().eq_ignore_ascii_case("cancel"))
}

/// Only the user who started a pending interaction may answer it. Everyone
/// else in the chat falls through to the relay.
fn is_dialogue_owner(sender: Option<i64>, state: &ConversationState) -> bool {
  let owner = match state {
    ConversationState::Idle => return false,
    ConversationState::AwaitingPrice { worker_id } => *worker_id,
    ConversationState::AddProject(draft) => draft.client_id,
    ConversationState::Review(draft) => draft.client_id,
  };
  sender == Some(owner)
}

/// Ordinary user content in a group chat. Service messages cannot be copied.
fn is_relayable(msg: &Message) -> bool {
  !msg.chat.is_private()
    && matches!(msg.kind, MessageKind::Common(_))
    && msg.from.as_ref().is_some_and(|user| !user.is_bot)
}

fn incoming(msg: &Message) -> Option<Incoming> {
  let user = msg.from.as_ref()?;
  Some(Incoming {
    chat: msg.chat.id,
    message_id: msg.id,
    sender_id: user.id.0 as i64,
    sender_name: user.first_name.clone(),
    text: message_text(msg).map(str::to_string),
    reply_to: msg.reply_to_message().map(|reply| reply.id),
  })
}
