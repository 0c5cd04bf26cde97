use rand::Rng;
use std::{
    collections::HashSet,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::http::env_secs;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

const MIN_TTL: Duration = Duration::from_secs(3);

const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return 0
"#;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("redis lock failed: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Per-inspection advisory locks. Redis `SET NX PX` when `REDIS_URL` is set
/// so several instances exclude each other; otherwise an in-process set.
/// A held Redis lock is extended every third of its TTL until released, so
/// an advance that outlives the TTL (slow report conversions) keeps it.
#[derive(Clone)]
pub struct InspectionLocks {
    redis: Option<redis::Client>,
    local: Arc<Mutex<HashSet<String>>>,
    ttl: Duration,
}

pub struct LockGuard {
    key: String,
    held: Held,
}

enum Held {
    Redis {
        client: redis::Client,
        token: String,
        renewal: CancellationToken,
    },
    Local(Arc<Mutex<HashSet<String>>>),
    Released,
}

impl InspectionLocks {
    pub fn new(redis: Option<redis::Client>, ttl: Duration) -> Self {
        Self {
            redis,
            local: Arc::new(Mutex::new(HashSet::new())),
            ttl: ttl.max(MIN_TTL),
        }
    }

    pub fn from_env(redis: Option<redis::Client>) -> Self {
        Self::new(redis, Duration::from_secs(env_secs("LOCK_TTL_SECS", 900)))
    }

    #[cfg(test)]
    pub fn in_process() -> Self {
        Self::new(None, Duration::from_secs(900))
    }

    /// `Ok(None)` when another caller holds the lock.
    pub async fn acquire(&self, inspection_id: &str) -> Result<Option<LockGuard>, LockError> {
        let key = format!("vinrelay:lock:inspection:{inspection_id}");
        match &self.redis {
            Some(client) => self.acquire_redis(client, key).await,
            None => Ok(self.acquire_local(key)),
        }
    }

    async fn acquire_redis(
        &self,
        client: &redis::Client,
        key: String,
    ) -> Result<Option<LockGuard>, LockError> {
        let mut conn = client.get_multiplexed_async_connection().await?;
        let token = lock_token();
        let reply: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        if reply.is_none() {
            debug!(target = "vinrelay.pipeline", key = %key, "lock_busy");
            return Ok(None);
        }
        let renewal = CancellationToken::new();
        let (renew_client, renew_key, renew_token, ttl) =
            (client.clone(), key.clone(), token.clone(), self.ttl);
        keep_alive(key.clone(), self.ttl / 3, renewal.clone(), move || {
            let (client, key, token) =
                (renew_client.clone(), renew_key.clone(), renew_token.clone());
            async move { extend(&client, &key, &token, ttl).await }
        });
        Ok(Some(LockGuard {
            key,
            held: Held::Redis {
                client: client.clone(),
                token,
                renewal,
            },
        }))
    }

    fn acquire_local(&self, key: String) -> Option<LockGuard> {
        let mut held = self.local.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !held.insert(key.clone()) {
            debug!(target = "vinrelay.pipeline", key = %key, "lock_busy");
            return None;
        }
        Some(LockGuard {
            key,
            held: Held::Local(self.local.clone()),
        })
    }
}

impl LockGuard {
    /// Releases the lock. A Redis lock is only deleted while it still
    /// carries this guard's token; an expired one is left alone.
    pub async fn release(mut self) {
        match std::mem::replace(&mut self.held, Held::Released) {
            Held::Redis {
                client,
                token,
                renewal,
            } => {
                renewal.cancel();
                let result = async {
                    let mut conn = client.get_multiplexed_async_connection().await?;
                    redis::Script::new(RELEASE_SCRIPT)
                        .key(&self.key)
                        .arg(&token)
                        .invoke_async::<i64>(&mut conn)
                        .await
                }
                .await;
                if let Err(err) = result {
                    warn!(target = "vinrelay.pipeline", key = %self.key, error = %err, "lock_release_failed");
                }
            }
            Held::Local(set) => remove_local(&set, &self.key),
            Held::Released => {}
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match &self.held {
            // stops extending; the key then expires with its TTL
            Held::Redis { renewal, .. } => renewal.cancel(),
            Held::Local(set) => remove_local(set, &self.key),
            Held::Released => {}
        }
    }
}

fn remove_local(set: &Mutex<HashSet<String>>, key: &str) {
    set.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .remove(key);
}

async fn extend(
    client: &redis::Client,
    key: &str,
    token: &str,
    ttl: Duration,
) -> Result<bool, redis::RedisError> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    let extended: i64 = redis::Script::new(EXTEND_SCRIPT)
        .key(key)
        .arg(token)
        .arg(ttl.as_millis() as u64)
        .invoke_async(&mut conn)
        .await?;
    Ok(extended == 1)
}

/// Calls `renew` every `period` until `stop` fires or `renew` reports the
/// lock is no longer ours. Transient errors are logged and retried.
fn keep_alive<F, Fut>(
    key: String,
    period: Duration,
    stop: CancellationToken,
    mut renew: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<bool, redis::RedisError>> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => match renew().await {
                    Ok(true) => debug!(target = "vinrelay.pipeline", key = %key, "lock_extended"),
                    Ok(false) => {
                        warn!(target = "vinrelay.pipeline", key = %key, "lock_lost");
                        break;
                    }
                    Err(err) => warn!(target = "vinrelay.pipeline", key = %key, error = %err, "lock_extend_failed"),
                },
            }
        }
    })
}

fn lock_token() -> String {
    let mut rng = rand::rng();
    format!("{:016x}{:016x}", rng.random::<u64>(), rng.random::<u64>())
}
