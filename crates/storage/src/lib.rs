use courier_proto::{ContentKind, DeliveryStatus, DirectMessage};
use deadpool_postgres::{Hook, HookError, Manager, ManagerConfig, Pool, RecyclingMethod};
use rand::{rngs::OsRng, RngCore};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_postgres::NoTls;

const INIT_SQL: &str = include_str!("../migrations/001_init.sql");
const MARKER_LENGTH: usize = 14;
const MARKER_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
// Tuned for ~30 concurrent writers per service instance: at most 30 open
// connections, at most 15 kept idle, none reused past one hour.
const POOL_MAX_OPEN: usize = 30;
const POOL_MAX_IDLE: usize = 15;
const POOL_MAX_LIFETIME: Duration = Duration::from_secs(60 * 60);
const POOL_REAP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub enum StorageError {
    Postgres,
    Redis,
    Serialization,
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres failure"),
            Self::Redis => write!(f, "redis failure"),
            Self::Serialization => write!(f, "serialization failure"),
        }
    }
}

impl Error for StorageError {}

pub struct Storage {
    pool: Pool,
    _reaper: JoinHandle<()>,
    redis: Arc<Mutex<redis::aio::MultiplexedConnection>>,
}

/// Connects to PostgreSQL and Redis; either being unreachable is fatal.
pub async fn connect(postgres_dsn: &str, redis_url: &str) -> Result<Storage, StorageError> {
    let pg_config = postgres_dsn
        .parse::<tokio_postgres::Config>()
        .map_err(|_| StorageError::Postgres)?;
    let manager = Manager::from_config(
        pg_config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    let pool = Pool::builder(manager)
        .max_size(POOL_MAX_OPEN)
        .pre_recycle(Hook::sync_fn(|_, metrics| {
            if metrics.age() > POOL_MAX_LIFETIME {
                return Err(HookError::message("connection exceeded max lifetime"));
            }
            Ok(())
        }))
        .build()
        .map_err(|_| StorageError::Postgres)?;
    pool.get().await.map_err(|_| StorageError::Postgres)?;
    // The pre-recycle hook only runs on checkout; the reaper sweeps parked
    // connections so the idle cap and the age ceiling hold while quiet.
    let reaper_pool = pool.clone();
    let reaper = tokio::spawn(async move {
        let mut ticker = interval(POOL_REAP_INTERVAL);
        loop {
            ticker.tick().await;
            let mut spare = POOL_MAX_IDLE;
            let _ = reaper_pool.retain(|_, metrics| retain_connection(metrics.age(), &mut spare));
        }
    });
    let redis_client = redis::Client::open(redis_url).map_err(|_| StorageError::Redis)?;
    let redis_connection = redis_client
        .get_multiplexed_async_connection()
        .await
        .map_err(|_| StorageError::Redis)?;
    Ok(Storage {
        pool,
        _reaper: reaper,
        redis: Arc::new(Mutex::new(redis_connection)),
    })
}

impl Storage {
    /// Applies bundled migrations to PostgreSQL.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        let client = self.pool.get().await.map_err(|_| StorageError::Postgres)?;
        client
            .batch_execute(INIT_SQL)
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Executes lightweight probes across PostgreSQL and Redis.
    pub async fn readiness(&self) -> Result<(), StorageError> {
        let client = self.pool.get().await.map_err(|_| StorageError::Postgres)?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|_| StorageError::Postgres)?;
        let mut conn = self.redis.lock().await;
        let _: String = redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(())
    }

    /// Persists one direct message inside a transaction.
    pub async fn insert_message(&self, message: &DirectMessage) -> Result<(), StorageError> {
        let mut client = self.pool.get().await.map_err(|_| StorageError::Postgres)?;
        let tx = client
            .transaction()
            .await
            .map_err(|_| StorageError::Postgres)?;
        tx.execute(
            "INSERT INTO direct_message (sender_id, receiver_id, content, content_type, file_path, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)",
            &[
                &message.sender_id,
                &message.receiver_id,
                &message.content,
                &message.content_type.as_str(),
                &message.file_path,
                &message.status.as_i32(),
                &message.created_at,
            ],
        )
        .await
        .map_err(|_| StorageError::Postgres)?;
        tx.commit().await.map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Loads every message exchanged between the two users, oldest first.
    /// Unpaginated; session open streams the whole list.
    pub async fn history(&self, a: &str, b: &str) -> Result<Vec<DirectMessage>, StorageError> {
        let client = self.pool.get().await.map_err(|_| StorageError::Postgres)?;
        let rows = client
            .query(
                "SELECT sender_id, receiver_id, content, content_type, file_path, status, created_at
                FROM direct_message
                WHERE (sender_id = $1 AND receiver_id = $2)
                   OR (sender_id = $2 AND receiver_id = $1)
                ORDER BY created_at ASC",
                &[&a, &b],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        rows.into_iter()
            .map(|row| {
                let kind: String = row.get(3);
                let status: i32 = row.get(5);
                Ok(DirectMessage {
                    sender_id: row.get(0),
                    receiver_id: row.get(1),
                    content: row.get(2),
                    content_type: ContentKind::from(kind.as_str()),
                    file_path: row.get(4),
                    status: DeliveryStatus::from_i32(status)
                        .ok_or(StorageError::Serialization)?,
                    created_at: row.get(6),
                })
            })
            .collect()
    }

    /// Writes a fresh presence mark for the user. No expiry: stale marks
    /// after a crash are reconciled by takeover on the next connect.
    pub async fn mark_presence(&self, user_id: &str) -> Result<String, StorageError> {
        let marker = generate_session_marker();
        let mut conn = self.redis.lock().await;
        redis::cmd("SET")
            .arg(presence_key(user_id))
            .arg(&marker)
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(marker)
    }

    /// True iff some engine holds an active session for the user.
    pub async fn is_present(&self, user_id: &str) -> Result<bool, StorageError> {
        let mut conn = self.redis.lock().await;
        let exists: bool = redis::cmd("EXISTS")
            .arg(presence_key(user_id))
            .query_async::<bool>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(exists)
    }

    /// Deletes the user's presence mark. Idempotent.
    pub async fn clear_presence(&self, user_id: &str) -> Result<(), StorageError> {
        let mut conn = self.redis.lock().await;
        let _: () = redis::cmd("DEL")
            .arg(presence_key(user_id))
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(())
    }
}

/// One reaper sweep keeps an idle connection only while it is under the age
/// ceiling and the idle allowance has not been spent.
fn retain_connection(age: Duration, spare: &mut usize) -> bool {
    if age > POOL_MAX_LIFETIME {
        return false;
    }
    if *spare == 0 {
        return false;
    }
    *spare -= 1;
    true
}

fn presence_key(user_id: &str) -> String {
    format!("user:{}", user_id)
}

fn generate_session_marker() -> String {
    let mut seed = [0u8; MARKER_LENGTH];
    OsRng.fill_bytes(&mut seed);
    let mut output = String::with_capacity(MARKER_LENGTH);
    for byte in seed.iter() {
        let symbol = MARKER_ALPHABET[(*byte as usize) % MARKER_ALPHABET.len()] as char;
        output.push(symbol);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_sql_declares_message_table() {
        assert!(INIT_SQL.contains("CREATE TABLE IF NOT EXISTS direct_message"));
        assert!(INIT_SQL.contains("direct_message_pair_idx"));
        assert!(INIT_SQL.contains("created_at BIGINT"));
    }

    #[test]
    fn presence_key_format() {
        assert_eq!(presence_key("u42"), "user:u42");
    }

    #[test]
    fn session_marker_shape() {
        let marker = generate_session_marker();
        assert_eq!(marker.len(), MARKER_LENGTH);
        assert!(marker.bytes().all(|b| MARKER_ALPHABET.contains(&b)));
    }

    #[test]
    fn session_markers_differ() {
        assert_ne!(generate_session_marker(), generate_session_marker());
    }

    #[test]
    fn storage_error_display() {
        assert_eq!(StorageError::Postgres.to_string(), "postgres failure");
        assert_eq!(StorageError::Redis.to_string(), "redis failure");
    }

    #[test]
    fn reaper_keeps_fresh_connections_within_idle_cap() {
        let mut spare = POOL_MAX_IDLE;
        for _ in 0..POOL_MAX_IDLE {
            assert!(retain_connection(Duration::from_secs(1), &mut spare));
        }
        assert_eq!(spare, 0);
        assert!(!retain_connection(Duration::from_secs(1), &mut spare));
    }

    #[test]
    fn reaper_drops_connections_past_max_lifetime() {
        let mut spare = POOL_MAX_IDLE;
        assert!(!retain_connection(
            POOL_MAX_LIFETIME + Duration::from_secs(1),
            &mut spare
        ));
        assert_eq!(spare, POOL_MAX_IDLE);
        assert!(retain_connection(POOL_MAX_LIFETIME, &mut spare));
    }

    #[test]
    fn pool_discipline_constants() {
        assert_eq!(POOL_MAX_OPEN, 30);
        assert_eq!(POOL_MAX_IDLE, 15);
        assert_eq!(POOL_MAX_LIFETIME, Duration::from_secs(3600));
    }
}
