#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use inbox_core::{
    AuthRequest, AuthorizationState, BackendAuthClient, BackendError, BackendSession,
    ClientError, ClientFactory, ConversationExplodedNotifier, CreateUserRequest, CreatedUser,
    Identity, IdentityError, IdentityProvider, Inbox, InboxDb, InboxProvider, InboxReadyResult,
    InboxType, LeftConversation, LinkedIdentity, MemoryConversations, MessagingClient,
    NonceAttestation, Profile, SessionDependencies, SigningKey, StateMachineDependencies,
    StateStream, SyncingManager, User, UsernameCheck,
};
use tempfile::TempDir;

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub async fn within<T>(what: &str, fut: impl Future<Output = T>) -> T {
    match tokio::time::timeout(TIMEOUT, fut).await {
        Ok(v) => v,
        Err(_) => panic!("{what}: not done within {TIMEOUT:?}"),
    }
}

/// Names of every state seen until `stop_at` matches (inclusive).
pub async fn states_until(
    stream: &mut StateStream,
    mut stop_at: impl FnMut(&AuthorizationState) -> bool,
) -> Vec<&'static str> {
    within("state sequence", async {
        let mut seen = Vec::new();
        while let Some(state) = stream.next().await {
            seen.push(state.name());
            if stop_at(&state) {
                break;
            }
        }
        seen
    })
    .await
}

pub fn inbox_id_for(signer: &str) -> String {
    format!("inbox-{signer}")
}

fn signer_of(identity: &Identity) -> String {
    identity.signing_key.identifier().identifier
}

pub struct FakeSigningKey {
    identifier: String,
}

#[async_trait]
impl SigningKey for FakeSigningKey {
    fn identifier(&self) -> LinkedIdentity {
        LinkedIdentity {
            kind: "ethereum".into(),
            identifier: self.identifier.clone(),
        }
    }

    async fn sign(&self, message: &[u8]) -> Result<Vec<u8>, IdentityError> {
        Ok([self.identifier.as_bytes(), message].concat())
    }
}

#[derive(Default)]
pub struct FakeIdentityProvider {
    identities: Mutex<HashMap<String, Identity>>,
    counter: AtomicU32,
    pub fail_delete_all: AtomicBool,
    pub delete_delay_ms: AtomicU64,
    pub delete_calls: AtomicU32,
}

impl FakeIdentityProvider {
    pub fn make(&self, inbox_type: InboxType) -> Identity {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let identity = Identity {
            signing_key: Arc::new(FakeSigningKey {
                identifier: format!("0xsigner{n}"),
            }),
            database_key: vec![n as u8; 32],
            inbox_type,
            provider: InboxProvider::Local,
            provider_id: format!("provider-{n}"),
        };
        self.identities
            .lock()
            .unwrap()
            .insert(identity.provider_id.clone(), identity.clone());
        identity
    }

    pub fn contains(&self, provider_id: &str) -> bool {
        self.identities.lock().unwrap().contains_key(provider_id)
    }

    pub fn len(&self) -> usize {
        self.identities.lock().unwrap().len()
    }

    pub fn generated(&self) -> u32 {
        self.counter.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> u32 {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentityProvider {
    async fn generate(&self, inbox_type: InboxType) -> Result<Identity, IdentityError> {
        Ok(self.make(inbox_type))
    }

    async fn load(&self, provider_id: &str) -> Result<Identity, IdentityError> {
        self.identities
            .lock()
            .unwrap()
            .get(provider_id)
            .cloned()
            .ok_or_else(|| IdentityError::NotFound(provider_id.to_string()))
    }

    async fn delete(&self, provider_id: &str) -> Result<(), IdentityError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delete_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        match self.identities.lock().unwrap().remove(provider_id) {
            Some(_) => Ok(()),
            None => Err(IdentityError::NotFound(provider_id.to_string())),
        }
    }

    async fn delete_all(&self) -> Result<(), IdentityError> {
        if self.fail_delete_all.load(Ordering::SeqCst) {
            return Err(IdentityError::Storage("keychain locked".into()));
        }
        self.identities.lock().unwrap().clear();
        Ok(())
    }
}

pub struct FakeClient {
    signer: String,
}

#[async_trait]
impl MessagingClient for FakeClient {
    fn inbox_id(&self) -> String {
        inbox_id_for(&self.signer)
    }

    fn installation_id(&self) -> String {
        format!("inst-{}", self.signer)
    }

    async fn sign_with_installation_key(&self, message: &[u8]) -> Result<Vec<u8>, ClientError> {
        Ok([b"inst:".as_slice(), message].concat())
    }
}

/// Local client databases are keyed by signer; `build` only succeeds when one exists.
#[derive(Default)]
pub struct FakeClientFactory {
    local_cache: Mutex<HashSet<String>>,
    pub builds: AtomicU32,
    pub creates: AtomicU32,
    pub fail_create: AtomicBool,
}

impl FakeClientFactory {
    pub fn seed_local_cache(&self, identity: &Identity) {
        self.local_cache.lock().unwrap().insert(signer_of(identity));
    }
}

#[async_trait]
impl ClientFactory for FakeClientFactory {
    async fn build(
        &self,
        identity: &Identity,
        inbox_id: Option<&str>,
    ) -> Result<Arc<dyn MessagingClient>, ClientError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let signer = signer_of(identity);
        if !self.local_cache.lock().unwrap().contains(&signer) {
            return Err(ClientError::NoLocalDatabase(
                inbox_id.unwrap_or("-").to_string(),
            ));
        }
        Ok(Arc::new(FakeClient { signer }))
    }

    async fn create(&self, identity: &Identity) -> Result<Arc<dyn MessagingClient>, ClientError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ClientError::Sdk("network unreachable".into()));
        }
        let signer = signer_of(identity);
        self.local_cache.lock().unwrap().insert(signer.clone());
        Ok(Arc::new(FakeClient { signer }))
    }
}

#[derive(Default)]
pub struct FakeBackend {
    accounts: Mutex<HashMap<String, (User, Profile)>>,
    taken_usernames: Mutex<HashSet<String>>,
    pub fail_authenticate: AtomicBool,
    pub auth_delay_ms: AtomicU64,
    /// Answer `get_profile` with an all-default profile, inbox id included.
    pub blank_profiles: AtomicBool,
    pub authenticate_calls: AtomicU32,
    pub create_user_calls: AtomicU32,
}

impl FakeBackend {
    pub fn seed_user(&self, inbox_id: &str, name: &str) {
        let user = User {
            id: format!("user-{inbox_id}"),
            identities: Vec::new(),
        };
        let profile = Profile {
            inbox_id: inbox_id.to_string(),
            name: Some(name.to_string()),
            username: Some(name.to_lowercase()),
            avatar_url: None,
        };
        self.accounts
            .lock()
            .unwrap()
            .insert(inbox_id.to_string(), (user, profile));
    }

    pub fn take_username(&self, username: &str) {
        self.taken_usernames
            .lock()
            .unwrap()
            .insert(username.to_string());
    }

    pub fn authenticate_calls(&self) -> u32 {
        self.authenticate_calls.load(Ordering::SeqCst)
    }

    pub fn create_user_calls(&self) -> u32 {
        self.create_user_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendAuthClient for FakeBackend {
    async fn authenticate(&self, request: &AuthRequest) -> Result<BackendSession, BackendError> {
        self.authenticate_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.auth_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_authenticate.load(Ordering::SeqCst) {
            return Err(BackendError::Rejected("attestation rejected".into()));
        }
        if request.signature.is_empty() || request.attestation_token.is_empty() {
            return Err(BackendError::Unauthorized);
        }
        Ok(BackendSession {
            id: format!("session-{}", request.inbox_id),
            inbox_id: request.inbox_id.clone(),
            token: format!("token-{}", request.installation_id),
        })
    }

    async fn get_user(&self, session: &BackendSession) -> Result<User, BackendError> {
        Ok(self
            .accounts
            .lock()
            .unwrap()
            .get(&session.inbox_id)
            .map(|(user, _)| user.clone())
            .unwrap_or_else(|| User {
                id: format!("user-{}", session.inbox_id),
                identities: Vec::new(),
            }))
    }

    async fn get_profile(
        &self,
        _session: &BackendSession,
        inbox_id: &str,
    ) -> Result<Profile, BackendError> {
        if self.blank_profiles.load(Ordering::SeqCst) {
            return Ok(Profile::default());
        }
        Ok(self
            .accounts
            .lock()
            .unwrap()
            .get(inbox_id)
            .map(|(_, profile)| profile.clone())
            .unwrap_or_else(|| Profile::empty(inbox_id)))
    }

    async fn create_user(
        &self,
        _session: &BackendSession,
        request: &CreateUserRequest,
    ) -> Result<CreatedUser, BackendError> {
        self.create_user_calls.fetch_add(1, Ordering::SeqCst);
        self.take_username(&request.username);
        let user = User {
            id: format!("user-{}", request.inbox_id),
            identities: Vec::new(),
        };
        let profile = Profile {
            inbox_id: request.inbox_id.clone(),
            name: request.display_name.clone(),
            username: Some(request.username.clone()),
            avatar_url: None,
        };
        self.accounts
            .lock()
            .unwrap()
            .insert(request.inbox_id.clone(), (user.clone(), profile.clone()));
        Ok(CreatedUser {
            id: user.id,
            username: request.username.clone(),
            profile,
        })
    }

    async fn check_username(
        &self,
        _session: &BackendSession,
        candidate: &str,
    ) -> Result<UsernameCheck, BackendError> {
        Ok(UsernameCheck {
            taken: self.taken_usernames.lock().unwrap().contains(candidate),
        })
    }
}

#[derive(Default)]
pub struct RecordingSyncing {
    pub started: Mutex<Vec<String>>,
    pub stopped: Mutex<Vec<String>>,
    /// Blocks inside `stop`, like a sync layer joining its worker.
    pub stop_delay_ms: AtomicU64,
    stopping_now: AtomicU32,
    max_stopping: AtomicU32,
}

impl RecordingSyncing {
    /// Most `stop` calls seen running at the same time.
    pub fn max_concurrent_stops(&self) -> u32 {
        self.max_stopping.load(Ordering::SeqCst)
    }
}

impl SyncingManager for RecordingSyncing {
    fn start(&self, ready: &InboxReadyResult) {
        self.started.lock().unwrap().push(ready.inbox_id());
    }

    fn stop(&self, inbox_id: &str) {
        let now = self.stopping_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_stopping.fetch_max(now, Ordering::SeqCst);
        let delay = self.stop_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        self.stopped.lock().unwrap().push(inbox_id.to_string());
        self.stopping_now.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Records each signal along with whether the inbox row still existed when it arrived.
pub struct RecordingNotifier {
    db: Arc<InboxDb>,
    pub seen: Mutex<Vec<(String, bool)>>,
}

impl ConversationExplodedNotifier for RecordingNotifier {
    fn conversation_exploded(&self, signal: &LeftConversation) {
        let still_stored = self.db.get(&signal.inbox_id).unwrap().is_some();
        self.seen
            .lock()
            .unwrap()
            .push((signal.conversation_id.clone(), still_stored));
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub identities: Arc<FakeIdentityProvider>,
    pub clients: Arc<FakeClientFactory>,
    pub backend: Arc<FakeBackend>,
    pub db: Arc<InboxDb>,
    pub syncing: Arc<RecordingSyncing>,
    pub conversations: Arc<MemoryConversations>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(InboxDb::open(dir.path()).unwrap());
        Self {
            identities: Arc::new(FakeIdentityProvider::default()),
            clients: Arc::new(FakeClientFactory::default()),
            backend: Arc::new(FakeBackend::default()),
            syncing: Arc::new(RecordingSyncing::default()),
            conversations: Arc::new(MemoryConversations::new()),
            notifier: Arc::new(RecordingNotifier {
                db: db.clone(),
                seen: Mutex::new(Vec::new()),
            }),
            db,
            dir,
        }
    }

    pub fn machine_deps(&self) -> StateMachineDependencies {
        StateMachineDependencies {
            client_factory: self.clients.clone(),
            backend: self.backend.clone(),
            attestation: Arc::new(NonceAttestation),
            writer: self.db.clone(),
            syncing: self.syncing.clone(),
        }
    }

    pub fn session_deps(&self) -> SessionDependencies {
        SessionDependencies {
            identities: self.identities.clone(),
            client_factory: self.clients.clone(),
            backend: self.backend.clone(),
            attestation: Arc::new(NonceAttestation),
            writer: self.db.clone(),
            store: self.db.clone(),
            syncing: self.syncing.clone(),
            conversations: self.conversations.clone(),
            notifier: self.notifier.clone(),
        }
    }

    /// Identity with a remote account and a local client cache. Returns its inbox id.
    pub fn registered_identity(&self, name: &str) -> (Identity, String) {
        let identity = self.identities.make(InboxType::Standard);
        let inbox_id = inbox_id_for(&signer_of(&identity));
        self.clients.seed_local_cache(&identity);
        self.backend.seed_user(&inbox_id, name);
        (identity, inbox_id)
    }

    /// Writes the inbox row a previous app run would have left behind.
    pub fn persist(&self, identity: &Identity, inbox_id: &str, name: &str) {
        self.db
            .upsert(&Inbox {
                inbox_id: inbox_id.to_string(),
                user_id: format!("user-{inbox_id}"),
                identities: vec![identity.signing_key.identifier()],
                profile: Profile {
                    inbox_id: inbox_id.to_string(),
                    name: Some(name.to_string()),
                    username: None,
                    avatar_url: None,
                },
                inbox_type: identity.inbox_type,
                provider: identity.provider,
                provider_id: identity.provider_id.clone(),
                created_at: 1_700_000_000,
            })
            .unwrap();
    }
}
