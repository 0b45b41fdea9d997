use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::collaborators::{MessagingClient, SigningKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxType {
    /// Durable, backend-registered identity.
    Standard,
    /// Local-only, disposable identity.
    Ephemeral,
}

impl InboxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Ephemeral => "ephemeral",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "standard" => Some(Self::Standard),
            "ephemeral" => Some(Self::Ephemeral),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxProvider {
    Local,
    External,
}

impl InboxProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::External => "external",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "local" => Some(Self::Local),
            "external" => Some(Self::External),
            _ => None,
        }
    }
}

/// A public identifier linked to an inbox (wallet address, passkey, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkedIdentity {
    pub kind: String,
    pub identifier: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub inbox_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl Profile {
    pub fn empty(inbox_id: impl Into<String>) -> Self {
        Self {
            inbox_id: inbox_id.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub identities: Vec<LinkedIdentity>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserRequest {
    pub inbox_id: String,
    pub installation_id: String,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedUser {
    pub id: String,
    pub username: String,
    pub profile: Profile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsernameCheck {
    pub taken: bool,
}

/// Payload exchanged for a backend session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub installation_id: String,
    pub inbox_id: String,
    pub attestation_token: String,
    /// Hex-encoded installation-key signature over the attestation digest.
    pub signature: String,
}

impl fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthRequest")
            .field("installation_id", &self.installation_id)
            .field("inbox_id", &self.inbox_id)
            .finish_non_exhaustive()
    }
}

/// Authenticated handle to the application backend.
#[derive(Clone, PartialEq, Eq)]
pub struct BackendSession {
    pub id: String,
    pub inbox_id: String,
    pub token: String,
}

impl fmt::Debug for BackendSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the bearer token.
        f.debug_struct("BackendSession")
            .field("id", &self.id)
            .field("inbox_id", &self.inbox_id)
            .finish_non_exhaustive()
    }
}

/// Signing capability plus local encryption key for one account.
#[derive(Clone)]
pub struct Identity {
    pub signing_key: Arc<dyn SigningKey>,
    pub database_key: Vec<u8>,
    pub inbox_type: InboxType,
    pub provider: InboxProvider,
    pub provider_id: String,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("signer", &self.signing_key.identifier())
            .field("inbox_type", &self.inbox_type)
            .field("provider", &self.provider)
            .field("provider_id", &self.provider_id)
            .finish_non_exhaustive()
    }
}

/// Persisted record for one logical account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inbox {
    pub inbox_id: String,
    pub user_id: String,
    pub identities: Vec<LinkedIdentity>,
    pub profile: Profile,
    pub inbox_type: InboxType,
    pub provider: InboxProvider,
    pub provider_id: String,
    pub created_at: i64,
}

impl Inbox {
    /// Row for an inbox that just finished authorizing. `inbox_id` comes from the messaging
    /// client and wins over whatever the backend echoed back in the profile.
    pub fn from_authorization(
        identity: &Identity,
        inbox_id: String,
        user: User,
        mut profile: Profile,
    ) -> Self {
        let mut identities = user.identities;
        let signer = identity.signing_key.identifier();
        if !identities.contains(&signer) {
            identities.push(signer);
        }
        profile.inbox_id = inbox_id.clone();
        Self {
            inbox_id,
            user_id: user.id,
            identities,
            profile,
            inbox_type: identity.inbox_type,
            provider: identity.provider,
            provider_id: identity.provider_id.clone(),
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Client plus backend session, produced once authorization completes.
#[derive(Clone)]
pub struct InboxReadyResult {
    pub client: Arc<dyn MessagingClient>,
    pub session: BackendSession,
}

impl InboxReadyResult {
    pub fn inbox_id(&self) -> String {
        self.client.inbox_id()
    }

    pub fn installation_id(&self) -> String {
        self.client.installation_id()
    }

    /// Identity used for `ready` equality: inbox, installation and backend session.
    pub fn identity_key(&self) -> (String, String, &str) {
        (self.inbox_id(), self.installation_id(), &self.session.id)
    }
}

impl fmt::Debug for InboxReadyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboxReadyResult")
            .field("inbox_id", &self.inbox_id())
            .field("installation_id", &self.installation_id())
            .field("session", &self.session)
            .finish()
    }
}
