use super::{
    config::CheckCarVinConfig,
    driver::{AuthPair, Driver, token_preview},
};
use crate::store::{
    Filter, Query, RecordStore, StoreError,
    records::{APP_SETTINGS, AppSetting, UPSTREAM_ACCOUNTS, UpstreamAccount, find, list},
};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

const XSRF_SETTING: &str = "check_car_vin_xsrf_token";
const INCREMENT_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("account {account_id} token is {age_hours}h old")]
    StaleToken { account_id: String, age_hours: i64 },
    #[error("account {0} has no token")]
    MissingToken(String),
    #[error("account {0} not found")]
    NotFound(String),
    #[error("usage update for account {0} kept conflicting")]
    Contention(String),
}

#[derive(Debug, Default, Serialize)]
pub struct RefreshSummary {
    pub refreshed: Vec<String>,
    pub failed: Vec<RefreshFailure>,
}

#[derive(Debug, Serialize)]
pub struct RefreshFailure {
    pub account_id: String,
    pub error: String,
}

/// One report of quota already counted against `account`.
pub struct Reservation {
    pub account: UpstreamAccount,
    pub count: i64,
}

pub struct AccountPool {
    store: Arc<dyn RecordStore>,
    driver: Arc<Driver>,
    config: CheckCarVinConfig,
}

impl AccountPool {
    pub fn new(
        store: Arc<dyn RecordStore>,
        driver: Arc<Driver>,
        config: CheckCarVinConfig,
    ) -> Self {
        Self {
            store,
            driver,
            config,
        }
    }

    /// Least recently used account still under the daily limit. Counters of
    /// accounts last used on an earlier local day are reset on the way.
    pub async fn get_available_account(&self) -> Result<Option<UpstreamAccount>, PoolError> {
        self.get_available_account_at(Utc::now()).await
    }

    pub async fn get_available_account_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<UpstreamAccount>, PoolError> {
        let accounts: Vec<UpstreamAccount> = list(
            self.store.as_ref(),
            UPSTREAM_ACCOUNTS,
            &Query::all().order_by("last_used_at", true),
        )
        .await?;
        for account in accounts {
            let account = if is_new_day(account.last_used_at, now) {
                self.reset_daily_count(account, now).await?
            } else {
                account
            };
            if account.daily_report_count < self.config.daily_limit {
                return Ok(Some(account));
            }
        }
        warn!(target = "vinrelay.accounts", limit = self.config.daily_limit, "account_pool_exhausted");
        Ok(None)
    }

    async fn reset_daily_count(
        &self,
        account: UpstreamAccount,
        now: DateTime<Utc>,
    ) -> Result<UpstreamAccount, PoolError> {
        let guard = Filter::new().eq("daily_report_count", account.daily_report_count);
        let patch = json!({ "daily_report_count": 0, "last_used_at": now.to_rfc3339() });
        let updated = self
            .store
            .update_where(UPSTREAM_ACCOUNTS, &account.id, &guard, patch)
            .await?;
        if updated.is_some() {
            info!(target = "vinrelay.accounts", account_id = %account.id, previous = account.daily_report_count, "account_quota_reset");
            return Ok(UpstreamAccount {
                daily_report_count: 0,
                last_used_at: Some(now),
                ..account
            });
        }
        // someone else touched it first; take what is stored now
        self.load(&account.id).await
    }

    async fn load(&self, account_id: &str) -> Result<UpstreamAccount, PoolError> {
        find(
            self.store.as_ref(),
            UPSTREAM_ACCOUNTS,
            &Query::new(Filter::new().eq("id", account_id)),
        )
        .await?
        .ok_or_else(|| PoolError::NotFound(account_id.to_string()))
    }

    /// Account with the freshest token, for calls that do not spend quota.
    pub async fn get_latest_token_account(&self) -> Result<Option<UpstreamAccount>, PoolError> {
        let accounts: Vec<UpstreamAccount> = list(
            self.store.as_ref(),
            UPSTREAM_ACCOUNTS,
            &Query::all().order_by("token_generated_at", false),
        )
        .await?;
        let Some(account) = accounts
            .into_iter()
            .find(|a| a.token.as_deref().is_some_and(|t| !t.is_empty()))
        else {
            return Ok(None);
        };
        let age_hours = account
            .token_generated_at
            .map(|at| (Utc::now() - at).num_hours())
            .unwrap_or(i64::MAX);
        if age_hours >= self.config.token_max_age_hours {
            warn!(target = "vinrelay.accounts", account_id = %account.id, age_hours, hard_fail = self.config.token_hard_fail, "account_token_stale");
            if self.config.token_hard_fail {
                return Err(PoolError::StaleToken {
                    account_id: account.id,
                    age_hours,
                });
            }
        }
        Ok(Some(account))
    }

    /// Adds one to the account's daily count with a compare-and-swap retry.
    /// With a `ceiling`, an account already at it is left alone and `None`
    /// comes back.
    pub async fn increment_usage(
        &self,
        account_id: &str,
        ceiling: Option<i64>,
    ) -> Result<Option<i64>, PoolError> {
        self.adjust_usage(account_id, 1, ceiling).await
    }

    async fn adjust_usage(
        &self,
        account_id: &str,
        delta: i64,
        ceiling: Option<i64>,
    ) -> Result<Option<i64>, PoolError> {
        for attempt in 1..=INCREMENT_ATTEMPTS {
            let current = self.load(account_id).await?.daily_report_count;
            if ceiling.is_some_and(|limit| current + delta > limit) {
                return Ok(None);
            }
            let next = (current + delta).max(0);
            if next == current {
                return Ok(Some(current));
            }
            let mut guard = Filter::new().eq("daily_report_count", current);
            if let Some(limit) = ceiling {
                guard = guard.lte("daily_report_count", limit - delta);
            }
            let patch = json!({
                "daily_report_count": next,
                "last_used_at": Utc::now().to_rfc3339(),
            });
            if self
                .store
                .update_where(UPSTREAM_ACCOUNTS, account_id, &guard, patch)
                .await?
                .is_some()
            {
                info!(target = "vinrelay.accounts", account_id = %account_id, count = next, delta, "account_usage_updated");
                return Ok(Some(next));
            }
            warn!(target = "vinrelay.accounts", account_id = %account_id, attempt, "account_usage_conflict");
        }
        Err(PoolError::Contention(account_id.to_string()))
    }

    /// Claims one report of daily quota on the least recently used account
    /// that has any left. The claim is a guarded write on the stored counter,
    /// so pools in other processes sharing the store see it at once. Hand it
    /// back with [`release`] when the purchase does not go through.
    ///
    /// [`release`]: AccountPool::release
    pub async fn reserve(&self) -> Result<Option<Reservation>, PoolError> {
        for _ in 0..INCREMENT_ATTEMPTS {
            let Some(account) = self.get_available_account().await? else {
                return Ok(None);
            };
            let limit = self.config.daily_limit;
            if let Some(count) = self.increment_usage(&account.id, Some(limit)).await? {
                info!(target = "vinrelay.accounts", account_id = %account.id, count, limit, "account_quota_claimed");
                return Ok(Some(Reservation {
                    account: UpstreamAccount {
                        daily_report_count: count,
                        ..account
                    },
                    count,
                }));
            }
            // filled up between selection and claim; pick again
        }
        Err(PoolError::Contention("account pool".to_string()))
    }

    pub async fn release(&self, reservation: Reservation) -> Result<i64, PoolError> {
        let account_id = reservation.account.id;
        let count = self.adjust_usage(&account_id, -1, None).await?.unwrap_or_default();
        info!(target = "vinrelay.accounts", account_id = %account_id, count, "account_quota_released");
        Ok(count)
    }

    pub async fn auth_for(&self, account: &UpstreamAccount) -> Result<AuthPair, PoolError> {
        let token = account
            .token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| PoolError::MissingToken(account.id.clone()))?;
        let xsrf = self.xsrf_for(account).await?.unwrap_or_default();
        Ok(AuthPair { token, xsrf })
    }

    async fn xsrf_for(&self, account: &UpstreamAccount) -> Result<Option<String>, PoolError> {
        if let Some(xsrf) = account.xsrf_token.clone().filter(|v| !v.is_empty()) {
            return Ok(Some(xsrf));
        }
        let setting: Option<AppSetting> = find(
            self.store.as_ref(),
            APP_SETTINGS,
            &Query::new(Filter::new().eq("prop_name", XSRF_SETTING)),
        )
        .await?;
        Ok(setting.and_then(|s| s.prop_value).filter(|v| !v.is_empty()))
    }

    /// Logs every account in again. A failed login is recorded and the loop
    /// moves on; store failures abort.
    pub async fn refresh_all_tokens(&self) -> Result<RefreshSummary, PoolError> {
        let accounts: Vec<UpstreamAccount> =
            list(self.store.as_ref(), UPSTREAM_ACCOUNTS, &Query::all()).await?;
        let mut summary = RefreshSummary::default();
        for account in accounts {
            let xsrf = self.xsrf_for(&account).await?;
            match self
                .driver
                .login(&account.email, &account.password, xsrf.as_deref())
                .await
            {
                Ok(login) => {
                    let mut patch = json!({
                        "token": login.token,
                        "token_generated_at": Utc::now().to_rfc3339(),
                    });
                    if let Some(xsrf) = login.xsrf {
                        patch["xsrf_token"] = json!(xsrf);
                    }
                    self.store.update(UPSTREAM_ACCOUNTS, &account.id, patch).await?;
                    info!(target = "vinrelay.accounts", account_id = %account.id, token = %token_preview(&login.token), "account_token_refreshed");
                    summary.refreshed.push(account.id);
                }
                Err(err) => {
                    warn!(target = "vinrelay.accounts", account_id = %account.id, error = %err, "account_token_refresh_failed");
                    summary.failed.push(RefreshFailure {
                        account_id: account.id,
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(summary)
    }
}

fn is_new_day(last_used_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match last_used_at {
        Some(at) => at.with_timezone(&Local).date_naive() != now.with_timezone(&Local).date_naive(),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkcarvin::session::scripted::{Reply, ScriptedFactory};
    use crate::store::MemoryStore;
    use chrono::Duration as ChronoDuration;
    use serde_json::Value;
    use std::time::Duration;

    fn pool_with(
        store: &MemoryStore,
        factory: ScriptedFactory,
        config: CheckCarVinConfig,
    ) -> AccountPool {
        let store: Arc<dyn RecordStore> = Arc::new(store.clone());
        let driver = Arc::new(Driver::new(config.clone(), Arc::new(factory), store.clone()));
        AccountPool::new(store, driver, config)
    }

    fn config() -> CheckCarVinConfig {
        CheckCarVinConfig {
            settle: Duration::ZERO,
            login_settle: Duration::ZERO,
            ..CheckCarVinConfig::default()
        }
    }

    fn account(id: &str, count: i64, last_used: Option<DateTime<Utc>>) -> Value {
        json!({
            "id": id,
            "email": format!("{id}@pool.test"),
            "password": "secret",
            "token": format!("token-{id}"),
            "daily_report_count": count,
            "last_used_at": last_used.map(|t| t.to_rfc3339()),
        })
    }

    #[tokio::test]
    async fn exhausted_pool_resets_only_the_stale_account() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .seed(
                UPSTREAM_ACCOUNTS,
                vec![
                    account("a", 15, Some(now - ChronoDuration::minutes(5))),
                    account("b", 15, Some(now - ChronoDuration::days(1))),
                    account("c", 15, Some(now - ChronoDuration::minutes(1))),
                ],
            )
            .await;
        let pool = pool_with(&store, ScriptedFactory::default(), config());

        let chosen = pool.get_available_account_at(now).await.unwrap().unwrap();
        assert_eq!(chosen.id, "b");
        assert_eq!(chosen.daily_report_count, 0);

        let stored = pool.load("b").await.unwrap();
        assert_eq!(stored.daily_report_count, 0);
        assert_eq!(pool.load("a").await.unwrap().daily_report_count, 15);
    }

    #[tokio::test]
    async fn never_returns_account_at_limit() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .seed(
                UPSTREAM_ACCOUNTS,
                vec![account("a", 15, Some(now)), account("b", 16, Some(now))],
            )
            .await;
        let pool = pool_with(&store, ScriptedFactory::default(), config());
        assert!(pool.get_available_account_at(now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let store = MemoryStore::new();
        store
            .seed(UPSTREAM_ACCOUNTS, vec![account("a", 3, Some(Utc::now()))])
            .await;
        let pool = Arc::new(pool_with(&store, ScriptedFactory::default(), config()));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.increment_usage("a", None).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(pool.load("a").await.unwrap().daily_report_count, 6);
    }

    #[tokio::test]
    async fn stale_token_warns_or_fails_per_config() {
        let store = MemoryStore::new();
        let mut row = account("a", 0, None);
        row["token_generated_at"] = json!((Utc::now() - ChronoDuration::hours(30)).to_rfc3339());
        store.seed(UPSTREAM_ACCOUNTS, vec![row]).await;

        let lenient = pool_with(&store, ScriptedFactory::default(), config());
        assert_eq!(lenient.get_latest_token_account().await.unwrap().unwrap().id, "a");

        let strict = pool_with(
            &store,
            ScriptedFactory::default(),
            CheckCarVinConfig {
                token_hard_fail: true,
                ..config()
            },
        );
        assert!(matches!(
            strict.get_latest_token_account().await,
            Err(PoolError::StaleToken { .. })
        ));
    }

    #[tokio::test]
    async fn refresh_continues_past_failed_login() {
        let store = MemoryStore::new();
        store
            .seed(UPSTREAM_ACCOUNTS, vec![account("a", 0, None), account("b", 0, None)])
            .await;
        store
            .seed(APP_SETTINGS, vec![json!({"prop_name": XSRF_SETTING, "prop_value": "shared%3D"})])
            .await;
        let factory = ScriptedFactory::new(vec![
            Reply::Json(401, json!({"message": "Unauthenticated."})),
            Reply::Json(200, json!({"token": "fresh-b"})),
        ]);
        let pool = pool_with(&store, factory.clone(), config());

        let summary = pool.refresh_all_tokens().await.unwrap();
        assert_eq!(summary.refreshed, vec!["b".to_string()]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].account_id, "a");

        let b = pool.load("b").await.unwrap();
        assert_eq!(b.token.as_deref(), Some("fresh-b"));
        assert!(b.token_generated_at.is_some());
        assert_eq!(pool.load("a").await.unwrap().token.as_deref(), Some("token-a"));
        assert!(factory.calls()[1]
            .headers
            .contains(&("x-xsrf-token".into(), "shared=".into())));
    }

    #[tokio::test]
    async fn pools_sharing_a_store_cannot_overspend_the_last_report() {
        let store = MemoryStore::new();
        store
            .seed(UPSTREAM_ACCOUNTS, vec![account("a", 14, Some(Utc::now()))])
            .await;
        let first = pool_with(&store, ScriptedFactory::default(), config());
        let second = pool_with(&store, ScriptedFactory::default(), config());

        let (left, right) = tokio::join!(first.reserve(), second.reserve());
        let claimed: Vec<_> = [left.unwrap(), right.unwrap()]
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].count, 15);
        assert_eq!(first.load("a").await.unwrap().daily_report_count, 15);
        assert!(second.reserve().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn released_claim_returns_quota() {
        let store = MemoryStore::new();
        store
            .seed(UPSTREAM_ACCOUNTS, vec![account("a", 14, Some(Utc::now()))])
            .await;
        let pool = pool_with(&store, ScriptedFactory::default(), config());

        let reservation = pool.reserve().await.unwrap().unwrap();
        assert_eq!(reservation.account.id, "a");
        assert!(pool.reserve().await.unwrap().is_none());

        assert_eq!(pool.release(reservation).await.unwrap(), 14);
        assert_eq!(pool.reserve().await.unwrap().unwrap().count, 15);
    }

    #[tokio::test]
    async fn increment_respects_ceiling() {
        let store = MemoryStore::new();
        store
            .seed(UPSTREAM_ACCOUNTS, vec![account("a", 15, Some(Utc::now()))])
            .await;
        let pool = pool_with(&store, ScriptedFactory::default(), config());
        assert_eq!(pool.increment_usage("a", Some(15)).await.unwrap(), None);
        assert_eq!(pool.increment_usage("a", None).await.unwrap(), Some(16));
    }
}
