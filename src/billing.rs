use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ChatError, ChatResult};
use crate::metrics::{BILLED_COINS_TOTAL, REVENUE_CREDITED_TOTAL};
use crate::storage::{RevenueEvent, WalletStore};

pub const EVENT_MODEL_CALL_ROLE: &str = "model_call_role";
pub const EVENT_MODEL_CALL_PRESET: &str = "model_call_preset";

/// A creator entitled to a cut of a billed generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Beneficiary {
    pub creator_id: String,
    pub share_pct: f64,
    pub event_type: &'static str,
}

impl Beneficiary {
    pub fn persona_creator(creator_id: &str, share_pct: f64) -> Self {
        Self { creator_id: creator_id.to_string(), share_pct, event_type: EVENT_MODEL_CALL_ROLE }
    }

    pub fn preset_creator(creator_id: &str, share_pct: f64) -> Self {
        Self { creator_id: creator_id.to_string(), share_pct, event_type: EVENT_MODEL_CALL_PRESET }
    }

    /// `floor(price * pct)`.
    pub fn share_of(&self, price: i64) -> i64 {
        (price as f64 * self.share_pct).floor() as i64
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Settlement {
    pub charged: i64,
    pub balance_after: Option<i64>,
    pub credits: Vec<(String, i64)>,
}

/// Per-call charging against the caller's wallet plus creator revenue credits.
#[derive(Clone)]
pub struct BillingLedger {
    wallets: Arc<dyn WalletStore>,
}

impl BillingLedger {
    pub fn new(wallets: Arc<dyn WalletStore>) -> Self {
        Self { wallets }
    }

    /// Fails with `InsufficientBalance` when the caller cannot cover `price`.
    pub async fn precheck(&self, user_id: &str, price: i64) -> ChatResult<()> {
        if price <= 0 {
            return Ok(());
        }
        let balance = self.wallets.balance(user_id).await?;
        if balance < price {
            return Err(ChatError::InsufficientBalance { required: price });
        }
        Ok(())
    }

    /// Debits `price` once, then credits each beneficiary's share.
    ///
    /// The debit is a conditional update, so a balance drained by a concurrent
    /// call since the precheck yields `InsufficientBalance` and nothing is
    /// credited. Credit failures are logged and do not undo the debit.
    pub async fn settle(
        &self,
        user_id: &str,
        persona_id: &str,
        price: i64,
        beneficiaries: &[Beneficiary],
    ) -> ChatResult<Settlement> {
        if price <= 0 {
            return Ok(Settlement::default());
        }
        let Some(balance_after) = self.wallets.debit_if_sufficient(user_id, price).await? else {
            warn!(user_id = %user_id, price, "balance drained before settlement");
            return Err(ChatError::InsufficientBalance { required: price });
        };
        counter!(BILLED_COINS_TOTAL).increment(price as u64);

        let mut credits = Vec::new();
        for b in beneficiaries {
            let amount = b.share_of(price);
            if amount <= 0 || b.creator_id.trim().is_empty() {
                continue;
            }
            let event = RevenueEvent {
                id: Uuid::new_v4(),
                creator_id: b.creator_id.clone(),
                user_id: user_id.to_string(),
                persona_id: persona_id.to_string(),
                event_type: b.event_type.to_string(),
                amount,
                created_at: Utc::now(),
            };
            match self.wallets.record_revenue(&event).await {
                Ok(_) => {
                    counter!(REVENUE_CREDITED_TOTAL, "event_type" => b.event_type).increment(amount as u64);
                    credits.push((b.creator_id.clone(), amount));
                }
                Err(e) => {
                    warn!(creator_id = %b.creator_id, amount, error = %e, "failed to credit creator");
                }
            }
        }
        info!(user_id = %user_id, persona_id = %persona_id, price, balance_after, "generation billed");
        Ok(Settlement { charged: price, balance_after: Some(balance_after), credits })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStore;
    use tempfile::tempdir;

    async fn ledger() -> (tempfile::TempDir, Arc<SqliteStore>, BillingLedger) {
        let dir = tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("billing.db").display());
        let store = Arc::new(SqliteStore::initialize(Some(url)).await.unwrap());
        let ledger = BillingLedger::new(store.clone());
        (dir, store, ledger)
    }

    #[test]
    fn shares_round_down() {
        assert_eq!(Beneficiary::persona_creator("c", 0.3).share_of(10), 3);
        assert_eq!(Beneficiary::persona_creator("c", 0.35).share_of(10), 3);
        assert_eq!(Beneficiary::preset_creator("c", 0.05).share_of(10), 0);
    }

    #[tokio::test]
    async fn precheck_and_settle() {
        let (_dir, store, ledger) = ledger().await;
        store.set_balance("u1", 15).await.unwrap();
        ledger.precheck("u1", 10).await.unwrap();
        assert!(matches!(
            ledger.precheck("u1", 20).await,
            Err(ChatError::InsufficientBalance { required: 20 })
        ));

        let beneficiaries = [
            Beneficiary::persona_creator("creator-a", 0.35),
            Beneficiary::preset_creator("creator-b", 0.2),
            Beneficiary::preset_creator("", 0.2),
        ];
        let s = ledger.settle("u1", "nova", 10, &beneficiaries).await.unwrap();
        assert_eq!(s.charged, 10);
        assert_eq!(s.balance_after, Some(5));
        assert_eq!(s.credits, vec![("creator-a".to_string(), 3), ("creator-b".to_string(), 2)]);

        assert_eq!(store.balance("u1").await.unwrap(), 5);
        let wallet = store.creator_wallet("creator-a").await.unwrap();
        assert_eq!((wallet.available_balance, wallet.total_earned), (3, 3));
        let events = store.list_revenue_events("creator-b", 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EVENT_MODEL_CALL_PRESET);
        assert_eq!(events[0].persona_id, "nova");
    }

    #[tokio::test]
    async fn drained_balance_is_not_debited_twice() {
        let (_dir, store, ledger) = ledger().await;
        store.set_balance("u1", 10).await.unwrap();
        let b = [Beneficiary::persona_creator("creator-a", 0.5)];
        ledger.settle("u1", "nova", 10, &b).await.unwrap();
        let err = ledger.settle("u1", "nova", 10, &b).await.unwrap_err();
        assert!(matches!(err, ChatError::InsufficientBalance { .. }));
        assert_eq!(store.balance("u1").await.unwrap(), 0);
        assert_eq!(store.creator_wallet("creator-a").await.unwrap().total_earned, 5);
    }

    #[tokio::test]
    async fn free_models_skip_billing() {
        let (_dir, store, ledger) = ledger().await;
        ledger.precheck("nobody", 0).await.unwrap();
        let s = ledger.settle("nobody", "nova", 0, &[Beneficiary::persona_creator("c", 1.0)]).await.unwrap();
        assert_eq!(s, Settlement::default());
        assert!(store.list_revenue_events("c", 10).await.unwrap().is_empty());
    }
}
