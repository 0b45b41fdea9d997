use std::fmt;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("no identity stored for provider id {0}")]
    NotFound(String),
    #[error("secure storage failure: {0}")]
    Storage(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("no local client database for inbox {0}")]
    NoLocalDatabase(String),
    #[error("identity is not registered on the network")]
    NotRegistered,
    #[error("messaging client error: {0}")]
    Sdk(String),
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("invalid backend url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("backend url cannot be used as a base: {0}")]
    InvalidBase(String),
    #[error("backend rejected credentials")]
    Unauthorized,
    #[error("no stored credentials to renew session for inbox {0}")]
    NoCredentials(String),
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("attestation unavailable: {0}")]
    Attestation(String),
    #[error("backend rejected request: {0}")]
    Rejected(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt row for inbox {inbox_id}: {reason}")]
    Corrupt { inbox_id: String, reason: String },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("blocking task failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),
}

/// Failure of a single state-machine step. Surfaced as `AuthorizationState::Error`.
#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    #[error("identity: {0}")]
    Identity(#[from] IdentityError),
    #[error("client: {0}")]
    Client(#[from] ClientError),
    #[error("backend: {0}")]
    Backend(#[from] BackendError),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("state machine is no longer running")]
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("unknown inbox {0}")]
    UnknownInbox(String),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("authorization failed: {0}")]
    Authorization(Arc<InboxError>),
    #[error("inbox {0} is being deleted")]
    Deleting(String),
    #[error("account creation cancelled: all accounts were deleted")]
    Cancelled,
}

/// Non-fatal finding from the best-effort wipe in `delete_all_accounts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupWarning {
    pub step: &'static str,
    pub message: String,
}

impl CleanupWarning {
    pub fn new(step: &'static str, err: impl fmt::Display) -> Self {
        Self {
            step,
            message: err.to_string(),
        }
    }
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.message)
    }
}
