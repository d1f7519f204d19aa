use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager as RedisConnectionManager;
use tokio::time::{timeout, Duration};
use tracing::debug;

use convrelay_core::models::{ConversationId, ServerId};

use crate::error::{Error, Result};

/// Timeout for Redis operations in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Shared map of conversation -> owning instance.
///
/// One entry per canonical conversation identifier, written when a client
/// joins the conversation on some instance and removed when it leaves or
/// disconnects. Writes are unconditional: concurrent joins from different
/// instances race and the last writer wins. There is no TTL; lifecycle is
/// owner-managed.
#[async_trait]
pub trait ConversationRegistry: Send + Sync {
    /// Whether any instance currently owns the conversation
    async fn exists(&self, conversation: &ConversationId) -> Result<bool>;

    /// Look up the owning instance, if any
    async fn owner(&self, conversation: &ConversationId) -> Result<Option<ServerId>>;

    /// Record `server` as the owner, replacing any previous owner
    async fn claim(&self, conversation: &ConversationId, server: &ServerId) -> Result<()>;

    /// Remove the entries for the given conversations. Missing entries are
    /// not errors, and entries are removed even if another instance has
    /// since claimed them.
    async fn release(&self, conversations: &[ConversationId]) -> Result<()>;
}

/// Registry backed by the shared Redis instance all replicas point at
#[derive(Clone)]
pub struct RedisRegistry {
    redis: RedisConnectionManager,
    op_timeout: Duration,
}

impl RedisRegistry {
    #[must_use]
    pub fn new(redis: RedisConnectionManager) -> Self {
        Self {
            redis,
            op_timeout: Duration::from_secs(REDIS_TIMEOUT_SECS),
        }
    }

    /// Connect to Redis and build a registry on a managed connection
    pub async fn connect(redis_url: &str, connect_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let redis = timeout(connect_timeout, RedisConnectionManager::new(client))
            .await
            .map_err(|_| Error::Timeout("connecting to Redis".to_string()))??;

        Ok(Self::new(redis))
    }
}

#[async_trait]
impl ConversationRegistry for RedisRegistry {
    async fn exists(&self, conversation: &ConversationId) -> Result<bool> {
        let mut conn = self.redis.clone();
        let exists: bool = timeout(
            self.op_timeout,
            redis::cmd("EXISTS")
                .arg(conversation.as_str())
                .query_async(&mut conn),
        )
        .await
        .map_err(|_| Error::Timeout("EXISTS".to_string()))??;

        Ok(exists)
    }

    async fn owner(&self, conversation: &ConversationId) -> Result<Option<ServerId>> {
        let mut conn = self.redis.clone();
        let value: Option<String> = timeout(
            self.op_timeout,
            redis::cmd("GET")
                .arg(conversation.as_str())
                .query_async(&mut conn),
        )
        .await
        .map_err(|_| Error::Timeout("GET".to_string()))??;

        Ok(value.map(ServerId::from_string))
    }

    async fn claim(&self, conversation: &ConversationId, server: &ServerId) -> Result<()> {
        let mut conn = self.redis.clone();
        let () = timeout(
            self.op_timeout,
            redis::cmd("SET")
                .arg(conversation.as_str())
                .arg(server.as_str())
                .query_async(&mut conn),
        )
        .await
        .map_err(|_| Error::Timeout("SET".to_string()))??;

        debug!(
            conversation = %conversation,
            server = %server,
            "Ownership entry written"
        );

        Ok(())
    }

    async fn release(&self, conversations: &[ConversationId]) -> Result<()> {
        if conversations.is_empty() {
            return Ok(());
        }

        let mut conn = self.redis.clone();
        let mut cmd = redis::cmd("DEL");
        for conversation in conversations {
            cmd.arg(conversation.as_str());
        }

        let removed: usize = timeout(self.op_timeout, cmd.query_async(&mut conn))
            .await
            .map_err(|_| Error::Timeout("DEL".to_string()))??;

        debug!(
            requested = conversations.len(),
            removed = removed,
            "Ownership entries released"
        );

        Ok(())
    }
}

/// In-process registry for single-instance deployments without Redis.
///
/// Every conversation with a local session is owned by this instance, so a
/// plain map is enough. Also convenient in tests.
#[derive(Default)]
pub struct MemoryRegistry {
    entries: DashMap<ConversationId, ServerId>,
}

impl MemoryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationRegistry for MemoryRegistry {
    async fn exists(&self, conversation: &ConversationId) -> Result<bool> {
        Ok(self.entries.contains_key(conversation))
    }

    async fn owner(&self, conversation: &ConversationId) -> Result<Option<ServerId>> {
        Ok(self.entries.get(conversation).map(|e| e.value().clone()))
    }

    async fn claim(&self, conversation: &ConversationId, server: &ServerId) -> Result<()> {
        self.entries.insert(conversation.clone(), server.clone());
        Ok(())
    }

    async fn release(&self, conversations: &[ConversationId]) -> Result<()> {
        for conversation in conversations {
            self.entries.remove(conversation);
        }
        Ok(())
    }
}
