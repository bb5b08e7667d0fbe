use crate::backend::{Admission, CounterStore, RateLimitPolicy};
use async_trait::async_trait;
use redis::aio::Connection;
use std::borrow::Cow;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// How many times a conflicted transaction is re-attempted before the check is
/// reported as an infrastructure error.
const MAX_TXN_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(
        #[source]
        #[from]
        redis::RedisError,
    ),
    #[error("malformed counter entry {raw:?} stored for rate limit key")]
    MalformedEntry { raw: String },
    #[error("transaction conflict not resolved after {} attempts", MAX_TXN_ATTEMPTS)]
    ConflictRetriesExhausted,
}

/// A durable [CounterStore] that keeps fixed-window counters in Redis, shared
/// across every process of a deployment.
///
/// One string value is stored per key, `"{count}:{reset_at_unix_ms}"`, with a
/// `PX` expiry matching the window so Redis retention tracks the entry
/// lifecycle. Each check runs as an optimistic `WATCH`/`MULTI`/`EXEC`
/// read-modify-write, so two concurrent checks against a key with one
/// admission remaining cannot both commit an increment; a conflicted
/// transaction is retried, bounded at three attempts.
///
/// `WATCH` is connection-stateful, so the store holds a [redis::Client] and
/// opens a dedicated connection per check rather than sharing a multiplexed
/// connection.
#[derive(Clone)]
pub struct RedisCounterStore {
    client: redis::Client,
    key_prefix: Option<String>,
}

impl RedisCounterStore {
    /// Create a RedisCounterStore builder.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use windowed_rate_limit::backend::RedisCounterStore;
    /// let client = redis::Client::open("redis://127.0.0.1/").unwrap();
    /// let store = RedisCounterStore::builder(client).build();
    /// ```
    pub fn builder(client: redis::Client) -> Builder {
        Builder {
            client,
            key_prefix: None,
        }
    }

    fn make_key<'t>(&self, key: &'t str) -> Cow<'t, str> {
        match &self.key_prefix {
            None => Cow::Borrowed(key),
            Some(prefix) => Cow::Owned(format!("{prefix}{key}")),
        }
    }
}

pub struct Builder {
    client: redis::Client,
    key_prefix: Option<String>,
}

impl Builder {
    /// Apply an optional prefix to all rate limit keys given to this store.
    ///
    /// This may be useful when the Redis instance is being used for other
    /// purposes; the prefix acts as a namespace to avoid collision with other
    /// keys inside Redis.
    pub fn key_prefix(mut self, key_prefix: Option<&str>) -> Self {
        self.key_prefix = key_prefix.map(ToOwned::to_owned);
        self
    }

    pub fn build(self) -> RedisCounterStore {
        RedisCounterStore {
            client: self.client,
            key_prefix: self.key_prefix,
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    type Error = Error;

    async fn check_and_consume(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
    ) -> Result<Admission, Self::Error> {
        let key = self.make_key(key);
        let mut con = self.client.get_async_connection().await?;

        for _ in 0..MAX_TXN_ATTEMPTS {
            match run_transaction(&mut con, key.as_ref(), policy).await? {
                Some(admission) => return Ok(admission),
                // Nil EXEC: another writer touched the key, re-run the
                // read-modify-write against the new state.
                None => continue,
            }
        }
        Err(Error::ConflictRetriesExhausted)
    }
}

/// One optimistic read-modify-write attempt. Returns `None` when the
/// transaction was aborted by a concurrent write to the watched key.
async fn run_transaction(
    con: &mut Connection,
    key: &str,
    policy: &RateLimitPolicy,
) -> Result<Option<Admission>, Error> {
    let () = redis::cmd("WATCH").arg(key).query_async(con).await?;
    let raw: Option<String> = redis::cmd("GET").arg(key).query_async(con).await?;

    let now_ms = unix_millis();
    let live = match raw.as_deref().map(parse_entry).transpose()? {
        Some((count, reset_at_ms)) if reset_at_ms > now_ms => Some((count, reset_at_ms)),
        // Absent, or recorded window already over: treated as no entry.
        _ => None,
    };

    let (count, reset_at_ms) = match live {
        None => (1, now_ms + policy.window.as_millis() as u64),
        Some((count, reset_at_ms)) if count < policy.max_admissions => (count + 1, reset_at_ms),
        Some((_, reset_at_ms)) => {
            // At the limit: release the watch without writing anything.
            let () = redis::cmd("UNWATCH").query_async(con).await?;
            return Ok(Some(Admission::Denied {
                retry_after: Duration::from_millis(reset_at_ms - now_ms),
            }));
        }
    };

    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("SET")
        .arg(key)
        .arg(encode_entry(count, reset_at_ms))
        .arg("PX")
        .arg(reset_at_ms - now_ms)
        .ignore();
    let exec: Option<()> = pipe.query_async(con).await?;
    Ok(exec.map(|()| Admission::Allowed))
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System clock before Unix epoch")
        .as_millis() as u64
}

fn encode_entry(count: u64, reset_at_ms: u64) -> String {
    format!("{count}:{reset_at_ms}")
}

fn parse_entry(raw: &str) -> Result<(u64, u64), Error> {
    let malformed = || Error::MalformedEntry {
        raw: raw.to_owned(),
    };
    let (count, reset_at_ms) = raw.split_once(':').ok_or_else(malformed)?;
    Ok((
        count.parse().map_err(|_| malformed())?,
        reset_at_ms.parse().map_err(|_| malformed())?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::AsyncCommands;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_entry_codec() {
        assert_eq!(encode_entry(3, 1700000000000), "3:1700000000000");
        assert_eq!(parse_entry("3:1700000000000").unwrap(), (3, 1700000000000));
        assert!(matches!(
            parse_entry("garbage"),
            Err(Error::MalformedEntry { .. })
        ));
        assert!(matches!(
            parse_entry("3:not-a-number"),
            Err(Error::MalformedEntry { .. })
        ));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_error() {
        // Nothing listens on this port; the check must surface an error
        // rather than an admit or deny.
        let client = redis::Client::open("redis://127.0.0.1:9/").unwrap();
        let store = RedisCounterStore::builder(client).build();
        let result = store
            .check_and_consume("unreachable", &RateLimitPolicy::per_minute(1))
            .await;
        assert!(matches!(result, Err(Error::Redis(_))));
    }

    // Each test must use non-overlapping keys (because the tests may be run
    // concurrently), and resets its key on each run for a clean state.
    async fn make_store(clear_test_key: &str) -> Builder {
        let host = option_env!("REDIS_HOST").unwrap_or("127.0.0.1");
        let port = option_env!("REDIS_PORT").unwrap_or("6379");
        let client = redis::Client::open(format!("redis://{host}:{port}")).unwrap();
        let mut con = client.get_async_connection().await.unwrap();
        con.del::<_, ()>(clear_test_key).await.unwrap();
        RedisCounterStore::builder(client)
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_allow_deny() {
        let store = make_store("test_allow_deny").await.build();
        let policy = RateLimitPolicy::new(MINUTE, 5);
        for _ in 0..5 {
            // First 5 should be allowed
            let admission = store
                .check_and_consume("test_allow_deny", &policy)
                .await
                .unwrap();
            assert!(admission.is_allowed());
        }
        // Sixth should be denied
        let admission = store
            .check_and_consume("test_allow_deny", &policy)
            .await
            .unwrap();
        match admission {
            Admission::Denied { retry_after } => {
                assert!(retry_after > Duration::ZERO && retry_after <= MINUTE);
            }
            Admission::Allowed => panic!("expected denial"),
        }
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_reset() {
        let store = make_store("test_reset").await.build();
        let policy = RateLimitPolicy::new(Duration::from_millis(500), 1);
        let admission = store.check_and_consume("test_reset", &policy).await.unwrap();
        assert!(admission.is_allowed());

        // Immediately afterwards, should be denied
        let admission = store.check_and_consume("test_reset", &policy).await.unwrap();
        let retry_after = match admission {
            Admission::Denied { retry_after } => retry_after,
            Admission::Allowed => panic!("expected denial"),
        };

        // Sleep until past the reset, should be allowed again
        tokio::time::sleep(retry_after + Duration::from_millis(50)).await;
        let admission = store.check_and_consume("test_reset", &policy).await.unwrap();
        assert!(admission.is_allowed());
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_denial_does_not_mutate() {
        let store = make_store("test_denial_no_mutate").await.build();
        let policy = RateLimitPolicy::new(MINUTE, 1);
        assert!(store
            .check_and_consume("test_denial_no_mutate", &policy)
            .await
            .unwrap()
            .is_allowed());
        for _ in 0..3 {
            assert!(store
                .check_and_consume("test_denial_no_mutate", &policy)
                .await
                .unwrap()
                .is_denied());
        }
        // Repeated denials must not have grown the stored count
        let mut con = store.client.get_async_connection().await.unwrap();
        let raw: String = con.get("test_denial_no_mutate").await.unwrap();
        let (count, _) = parse_entry(&raw).unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore = "requires a running Redis server"]
    async fn test_no_double_admission_under_concurrency() {
        let store = make_store("test_concurrent").await.build();
        let policy = RateLimitPolicy::new(MINUTE, 2);
        // 3 genuinely concurrent checks, each over its own connection, with
        // 2 admissions available: exactly 2 must be admitted.
        let tasks = (0..3).map(|_| {
            let store = store.clone();
            let policy = policy.clone();
            tokio::spawn(async move {
                store
                    .check_and_consume("test_concurrent", &policy)
                    .await
                    .unwrap()
            })
        });
        let admissions = futures::future::join_all(tasks).await;
        let allowed = admissions
            .iter()
            .filter(|a| a.as_ref().unwrap().is_allowed())
            .count();
        assert_eq!(allowed, 2);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_key_prefix() {
        let store = make_store("prefix:test_key_prefix")
            .await
            .key_prefix(Some("prefix:"))
            .build();
        store
            .check_and_consume("test_key_prefix", &RateLimitPolicy::per_minute(5))
            .await
            .unwrap();
        let mut con = store.client.get_async_connection().await.unwrap();
        assert!(con
            .exists::<_, bool>("prefix:test_key_prefix")
            .await
            .unwrap());
    }
}
