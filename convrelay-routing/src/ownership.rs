use std::sync::Arc;
use tracing::{debug, info};

use convrelay_core::models::{ConversationId, ServerId};

use crate::error::Result;
use crate::registry::ConversationRegistry;
use crate::rooms::RoomHub;

/// Keeps the shared ownership registry in step with the local session
/// lifecycle.
///
/// Join, leave and disconnect all operate on the canonical conversation
/// identifier; the registry never sees the location-qualified form. The
/// registry writes are unconditional: a join replaces any previous owner
/// without a handshake, and a leave removes the entry even if another
/// instance has claimed it since. Both races are accepted (last writer
/// wins) rather than guarded with distributed locking.
pub struct OwnershipManager {
    server_id: ServerId,
    registry: Arc<dyn ConversationRegistry>,
    hub: Arc<RoomHub>,
}

impl OwnershipManager {
    #[must_use]
    pub fn new(
        server_id: ServerId,
        registry: Arc<dyn ConversationRegistry>,
        hub: Arc<RoomHub>,
    ) -> Self {
        Self {
            server_id,
            registry,
            hub,
        }
    }

    /// Identity of this instance, fixed for the process lifetime
    #[must_use]
    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    /// Attach a connection to a conversation and take ownership of it.
    ///
    /// Returns the canonical identifier for the client acknowledgment.
    pub async fn join(
        &self,
        connection_id: &str,
        raw_conversation: &str,
    ) -> Result<ConversationId> {
        let conversation = ConversationId::canonical(raw_conversation);

        self.hub.join(connection_id, conversation.clone());
        self.registry.claim(&conversation, &self.server_id).await?;

        info!(
            conversation = %conversation,
            connection_id = %connection_id,
            server_id = %self.server_id,
            "Conversation joined, ownership claimed"
        );

        Ok(conversation)
    }

    /// Detach a connection from a conversation and drop its ownership entry.
    ///
    /// Returns the canonical identifier for the client acknowledgment.
    pub async fn leave(
        &self,
        connection_id: &str,
        raw_conversation: &str,
    ) -> Result<ConversationId> {
        let conversation = ConversationId::canonical(raw_conversation);

        self.hub.leave(connection_id, &conversation);
        self.registry.release(std::slice::from_ref(&conversation)).await?;

        info!(
            conversation = %conversation,
            connection_id = %connection_id,
            "Conversation left, ownership released"
        );

        Ok(conversation)
    }

    /// Release every conversation the connection had joined.
    ///
    /// Best-effort: not transactional with joins happening concurrently on
    /// other instances.
    pub async fn disconnect(&self, connection_id: &str) -> Result<()> {
        let joined = self.hub.unregister(connection_id);
        if joined.is_empty() {
            debug!(
                connection_id = %connection_id,
                "Disconnect cleanup: no joined conversations"
            );
            return Ok(());
        }

        self.registry.release(&joined).await?;

        info!(
            connection_id = %connection_id,
            released = joined.len(),
            "Disconnect cleanup released ownership entries"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;

    fn manager() -> (OwnershipManager, Arc<dyn ConversationRegistry>, Arc<RoomHub>) {
        let registry: Arc<dyn ConversationRegistry> = Arc::new(MemoryRegistry::new());
        let hub = Arc::new(RoomHub::new());
        let manager = OwnershipManager::new(
            ServerId::from_string("s1".to_string()),
            registry.clone(),
            hub.clone(),
        );
        (manager, registry, hub)
    }

    #[tokio::test]
    async fn test_join_canonicalizes_and_claims() {
        let (manager, registry, hub) = manager();
        let _rx = hub.register("conn1".to_string());

        let conversation = manager
            .join("conn1", "projects/p1/locations/global/conversations/c1")
            .await
            .unwrap();

        assert_eq!(conversation.as_str(), "projects/p1/conversations/c1");
        assert_eq!(
            registry.owner(&conversation).await.unwrap(),
            Some(ServerId::from_string("s1".to_string()))
        );
        assert_eq!(hub.member_count(&conversation), 1);
    }

    #[tokio::test]
    async fn test_join_overwrites_foreign_owner() {
        let (manager, registry, hub) = manager();
        let _rx = hub.register("conn1".to_string());

        let conversation =
            ConversationId::from_string("projects/p1/conversations/c1".to_string());
        registry
            .claim(&conversation, &ServerId::from_string("other".to_string()))
            .await
            .unwrap();

        manager
            .join("conn1", "projects/p1/conversations/c1")
            .await
            .unwrap();

        assert_eq!(
            registry.owner(&conversation).await.unwrap(),
            Some(ServerId::from_string("s1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_leave_releases_entry() {
        let (manager, registry, hub) = manager();
        let _rx = hub.register("conn1".to_string());

        let conversation = manager
            .join("conn1", "projects/p1/locations/global/conversations/c1")
            .await
            .unwrap();
        let left = manager
            .leave("conn1", "projects/p1/locations/global/conversations/c1")
            .await
            .unwrap();

        assert_eq!(left, conversation);
        assert_eq!(registry.owner(&conversation).await.unwrap(), None);
        assert_eq!(hub.member_count(&conversation), 0);
    }

    #[tokio::test]
    async fn test_leave_releases_even_when_owned_elsewhere() {
        // Known race semantics: the delete is unconditional
        let (manager, registry, hub) = manager();
        let _rx = hub.register("conn1".to_string());

        let conversation = manager
            .join("conn1", "projects/p1/conversations/c1")
            .await
            .unwrap();
        registry
            .claim(&conversation, &ServerId::from_string("other".to_string()))
            .await
            .unwrap();

        manager
            .leave("conn1", "projects/p1/conversations/c1")
            .await
            .unwrap();

        assert_eq!(registry.owner(&conversation).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_disconnect_releases_joined_set_only() {
        let (manager, registry, hub) = manager();
        let _rx1 = hub.register("conn1".to_string());
        let _rx2 = hub.register("conn2".to_string());

        let a = manager
            .join("conn1", "projects/p1/conversations/a")
            .await
            .unwrap();
        let b = manager
            .join("conn1", "projects/p1/conversations/b")
            .await
            .unwrap();
        let other = manager
            .join("conn2", "projects/p1/conversations/other")
            .await
            .unwrap();

        manager.disconnect("conn1").await.unwrap();

        assert_eq!(registry.owner(&a).await.unwrap(), None);
        assert_eq!(registry.owner(&b).await.unwrap(), None);
        assert!(registry.exists(&other).await.unwrap());
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_with_no_rooms() {
        let (manager, _registry, hub) = manager();
        let _rx = hub.register("conn1".to_string());

        assert!(manager.disconnect("conn1").await.is_ok());
        assert_eq!(hub.connection_count(), 0);
    }
}
