use anyhow::Result;
use tracing::info;
use tracing::instrument;

use crate::db::Collection;
use crate::db::Db;
use crate::db::Filter;
use crate::db::UpdateOp;

impl Db {
  /// Balance of the account, zero when the account does not exist yet.
  #[instrument(skip(self))]
  pub async fn balance(&self, user_id: i64) -> Result<i64> {
    Ok(self.get_account(user_id).await?.map(|account| account.balance).unwrap_or(0))
  }

  /// Atomic add on the stored balance, creating the account if needed. The
  /// delta may be negative; callers spending money check the balance first.
  #[instrument(skip(self))]
  pub async fn incr_balance(&self, user_id: i64, delta: i64) -> Result<()> {
    self
      .store()
      .update_one(Collection::Accounts, &Filter::by_id(user_id), UpdateOp::inc("balance", delta), true)
      .await?;
    info!(user_id, delta, "balance incremented");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use crate::db::Db;

  #[tokio::test]
  async fn missing_account_has_zero_balance() {
    let db = Db::in_memory();
    assert_eq!(db.balance(11).await.unwrap(), 0);
  }

  #[tokio::test]
  async fn increment_applies_delta_exactly_once() {
    let db = Db::in_memory();
    db.incr_balance(11, 500).await.unwrap();
    let before = db.balance(11).await.unwrap();
    db.incr_balance(11, -120).await.unwrap();
    assert_eq!(db.balance(11).await.unwrap(), before - 120);
  }

  #[tokio::test]
  async fn concurrent_increments_are_not_lost() {
    let db = Db::in_memory();
    let tasks: Vec<_> = (0 .. 20)
      .map(|_| {
        let db = db.clone();
        tokio::spawn(async move { db.incr_balance(3, 5).await })
      })
      .collect();
    for task in tasks {
      task.await.unwrap().unwrap();
    }
    assert_eq!(db.balance(3).await.unwrap(), 100);
  }
}
