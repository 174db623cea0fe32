use std::sync::Arc;

use crate::db::Db;
use crate::relay::Relay;
use crate::session::Sessions;
use crate::transport::Transport;

#[derive(Clone)]
pub struct AppContext {
  db: Db,
  transport: Arc<dyn Transport>,
  sessions: Arc<Sessions>,
  relay: Arc<Relay>,
  admin_id: i64,
}

impl AppContext {
  pub fn new(db: Db, transport: Arc<dyn Transport>, sessions: Arc<Sessions>, relay: Arc<Relay>, admin_id: i64) -> Self {
    Self {
      db,
      transport,
      sessions,
      relay,
      admin_id,
    }
  }

  pub fn db(&self) -> &Db {
    &self.db
  }

  pub fn transport(&self) -> &dyn Transport {
    self.transport.as_ref()
  }

  pub fn sessions(&self) -> &Sessions {
    &self.sessions
  }

  pub fn relay(&self) -> &Relay {
    &self.relay
  }

  pub fn admin_id(&self) -> i64 {
    self.admin_id
  }

  pub fn is_admin(&self, tg_id: i64) -> bool {
    tg_id == self.admin_id
  }

  pub fn currency(&self) -> &str {
    self.sessions.currency()
  }
}
