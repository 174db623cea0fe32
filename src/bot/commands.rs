use teloxide::utils::command::BotCommands;

#[derive(BotCommands, Clone, Debug)]
#[command(rename_rule = "lowercase", description = "Available commands:")]
pub enum Command {
  /// Register and show the help text
  Start,
  /// Show the help text
  Help,
  /// Show the session menu in a project chat
  Menu,
  /// Abort the current input
  Cancel,
  /// Create a new project
  NewProject,
  /// List your projects
  Projects,
  /// Find open projects in your subjects
  Find,
  /// Set your subjects: /subjects math, physics
  Subjects(String),
  /// Show your balance
  Balance,
  /// Show or edit your profile: /profile <nickname|phone|email|bio|page> <value>
  Profile(String),
  /// Offer to take a project: /bid <project_id> <text>
  Bid(String),
  /// Admin: /pair <project_id> <worker_id> <client_chat_id> <worker_chat_id>
  Pair(String),
  /// Admin: /unpair <chat_id>
  Unpair(String),
  /// Admin: /topup <user_id> <delta>
  Topup(String),
  /// Admin: /deluser <user_id>
  DelUser(String),
  /// Admin: /delproject <project_id>
  DelProject(String),
  /// Admin: /setstatus <project_id> <open|in_progress|completed>
  SetStatus(String),
}
