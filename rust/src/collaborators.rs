// Narrow interfaces to everything outside the authorization core: secure identity storage,
// the messaging SDK, the app backend, local persistence and background sync.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::{BackendError, ClientError, IdentityError, StorageError};
use crate::model::{
    AuthRequest, BackendSession, CreateUserRequest, CreatedUser, Identity, Inbox, InboxReadyResult,
    InboxType, LinkedIdentity, Profile, User, UsernameCheck,
};
use crate::session::LeftConversation;

#[async_trait]
pub trait SigningKey: Send + Sync {
    /// Public identifier of the key.
    fn identifier(&self) -> LinkedIdentity;

    async fn sign(&self, message: &[u8]) -> Result<Vec<u8>, IdentityError>;
}

/// Generates identities or loads them from secure device storage.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn generate(&self, inbox_type: InboxType) -> Result<Identity, IdentityError>;

    async fn load(&self, provider_id: &str) -> Result<Identity, IdentityError>;

    async fn delete(&self, provider_id: &str) -> Result<(), IdentityError>;

    async fn delete_all(&self) -> Result<(), IdentityError>;
}

/// A client bound to one inbox/installation on the messaging network.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    fn inbox_id(&self) -> String;

    fn installation_id(&self) -> String;

    async fn sign_with_installation_key(&self, message: &[u8]) -> Result<Vec<u8>, ClientError>;
}

#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Builds a client from a locally cached identity. Fails when the local cache is missing.
    async fn build(
        &self,
        identity: &Identity,
        inbox_id: Option<&str>,
    ) -> Result<Arc<dyn MessagingClient>, ClientError>;

    /// Creates (or recovers) a client from the signing key alone.
    async fn create(&self, identity: &Identity) -> Result<Arc<dyn MessagingClient>, ClientError>;
}

#[async_trait]
pub trait AttestationProvider: Send + Sync {
    async fn attestation_token(&self) -> Result<String, BackendError>;
}

#[async_trait]
pub trait BackendAuthClient: Send + Sync {
    async fn authenticate(&self, request: &AuthRequest) -> Result<BackendSession, BackendError>;

    async fn get_user(&self, session: &BackendSession) -> Result<User, BackendError>;

    async fn get_profile(
        &self,
        session: &BackendSession,
        inbox_id: &str,
    ) -> Result<Profile, BackendError>;

    async fn create_user(
        &self,
        session: &BackendSession,
        request: &CreateUserRequest,
    ) -> Result<CreatedUser, BackendError>;

    async fn check_username(
        &self,
        session: &BackendSession,
        candidate: &str,
    ) -> Result<UsernameCheck, BackendError>;
}

#[async_trait]
pub trait InboxWriter: Send + Sync {
    /// Upserts by inbox id in a single transaction.
    async fn store_inbox(&self, inbox: &Inbox) -> Result<(), StorageError>;
}

#[async_trait]
pub trait InboxStore: Send + Sync {
    async fn all_inboxes(&self) -> Result<Vec<Inbox>, StorageError>;

    async fn inbox(&self, inbox_id: &str) -> Result<Option<Inbox>, StorageError>;

    /// Live view of every persisted inbox.
    fn observe_inboxes(&self) -> watch::Receiver<Vec<Inbox>>;

    async fn delete_inbox(&self, inbox_id: &str) -> Result<(), StorageError>;

    async fn delete_all(&self) -> Result<(), StorageError>;
}

/// Background synchronization. Fire-and-forget.
pub trait SyncingManager: Send + Sync {
    fn start(&self, ready: &InboxReadyResult);

    fn stop(&self, inbox_id: &str);
}

pub trait ConversationExplodedNotifier: Send + Sync {
    fn conversation_exploded(&self, signal: &LeftConversation);
}
