// Supervises one InboxStateMachine per inbox for the lifetime of the app session.
//
// Machines are owned by the registry (running inboxes plus registrations still in flight) or by
// the unused-inbox slot. Every insert and remove goes through the registry's async mutex, so two
// callers racing on the same inbox cannot both stop a machine or leave a stale entry behind, and
// `delete_all_accounts` sees every machine that could still write an inbox row. Authorization
// itself runs on each machine's own actor task and never holds the registry lock.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::collaborators::{
    AttestationProvider, BackendAuthClient, ClientFactory, ConversationExplodedNotifier,
    IdentityProvider, InboxStore, InboxWriter, SyncingManager,
};
use crate::config::AppConfig;
use crate::conversations::{Conversation, ConversationFilter, ConversationsRepository};
use crate::error::{CleanupWarning, IdentityError, SessionError};
use crate::model::{Identity, Inbox, InboxReadyResult, InboxType};
use crate::state::{AuthorizationState, StateStream};
use crate::state_machine::{InboxStateMachine, StateMachineConfig, StateMachineDependencies};

const CLIENTS_DIR: &str = "clients";

/// Where messaging clients keep their per-inbox local databases.
pub fn client_data_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(CLIENTS_DIR)
}

/// The current user left (or was removed from) a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeftConversation {
    pub inbox_id: String,
    pub conversation_id: String,
    pub conversation_name: Option<String>,
}

/// Handle to one inbox's messaging session, handed to the rest of the app.
#[derive(Clone)]
pub struct MessagingService {
    inbox_id: Arc<str>,
    machine: InboxStateMachine,
}

impl MessagingService {
    fn new(inbox_id: &str, machine: InboxStateMachine) -> Self {
        Self {
            inbox_id: Arc::from(inbox_id),
            machine,
        }
    }

    pub fn inbox_id(&self) -> &str {
        &self.inbox_id
    }

    pub fn provider_id(&self) -> &str {
        self.machine.provider_id()
    }

    pub fn state(&self) -> AuthorizationState {
        self.machine.state()
    }

    pub fn subscribe(&self) -> StateStream {
        self.machine.subscribe()
    }

    /// Waits until the inbox is ready or its authorization fails.
    pub async fn ready(&self) -> Result<InboxReadyResult, SessionError> {
        self.machine
            .wait_for_ready()
            .await
            .map_err(SessionError::Authorization)
    }
}

#[derive(Debug, Default)]
pub struct DeleteAllReport {
    /// Running state machines and in-flight registrations that were shut down.
    pub stopped: usize,
    /// Best-effort wipe steps that failed. Never fatal.
    pub warnings: Vec<CleanupWarning>,
}

#[derive(Clone)]
pub struct SessionDependencies {
    pub identities: Arc<dyn IdentityProvider>,
    pub client_factory: Arc<dyn ClientFactory>,
    pub backend: Arc<dyn BackendAuthClient>,
    pub attestation: Arc<dyn AttestationProvider>,
    pub writer: Arc<dyn InboxWriter>,
    pub store: Arc<dyn InboxStore>,
    pub syncing: Arc<dyn SyncingManager>,
    pub conversations: Arc<dyn ConversationsRepository>,
    pub notifier: Arc<dyn ConversationExplodedNotifier>,
}

impl SessionDependencies {
    fn machine_deps(&self) -> StateMachineDependencies {
        StateMachineDependencies {
            client_factory: self.client_factory.clone(),
            backend: self.backend.clone(),
            attestation: self.attestation.clone(),
            writer: self.writer.clone(),
            syncing: self.syncing.clone(),
        }
    }
}

pub struct SessionManager {
    data_dir: PathBuf,
    deps: SessionDependencies,
    machine_config: StateMachineConfig,
    teardown_concurrency: usize,
    keep_unused_inbox: bool,
    registry: tokio::sync::Mutex<Registry>,
    // Pre-registered ephemeral inbox waiting to be handed out by `add_account`.
    // Lock order: `registry` first, then `unused_inbox`.
    unused_inbox: tokio::sync::Mutex<Option<InboxStateMachine>>,
    // Inboxes with a delete in progress. Only changed while `registry` is held, except for the
    // removal when a delete finishes.
    deleting: Mutex<HashSet<String>>,
    left_listener: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct Registry {
    running: HashMap<String, InboxStateMachine>,
    // Registrations started by `add_account` that are not ready yet, by provider id.
    pending: HashMap<String, InboxStateMachine>,
    // Bumped by every `delete_all_accounts`.
    generation: u64,
}

/// Clears an inbox's delete marker when the delete finishes or its future is dropped.
struct DeleteMarker<'a> {
    deleting: &'a Mutex<HashSet<String>>,
    inbox_id: &'a str,
}

impl Drop for DeleteMarker<'_> {
    fn drop(&mut self) {
        lock(self.deleting).remove(self.inbox_id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poison) => poison.into_inner(),
    }
}

async fn remove_dir(path: PathBuf) -> std::io::Result<()> {
    let result = tokio::task::spawn_blocking(move || std::fs::remove_dir_all(&path))
        .await
        .map_err(std::io::Error::other)?;
    match result {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

impl SessionManager {
    /// Starts a machine for every persisted inbox and begins listening for left conversations.
    pub async fn start(
        data_dir: impl Into<PathBuf>,
        config: &AppConfig,
        deps: SessionDependencies,
        left_conversations: Option<flume::Receiver<LeftConversation>>,
    ) -> Result<Arc<Self>, SessionError> {
        crate::logging::init_logging();

        let manager = Arc::new(Self {
            data_dir: data_dir.into(),
            deps,
            machine_config: StateMachineConfig::from(config),
            teardown_concurrency: config.teardown_concurrency(),
            keep_unused_inbox: config.prepare_unused_inbox(),
            registry: tokio::sync::Mutex::new(Registry::default()),
            unused_inbox: tokio::sync::Mutex::new(None),
            deleting: Mutex::new(HashSet::new()),
            left_listener: Mutex::new(None),
        });

        let started = manager.bootstrap().await?;
        tracing::info!(started, data_dir = %manager.data_dir.display(), "session manager started");

        if let Some(rx) = left_conversations {
            manager.spawn_left_listener(rx);
        }
        if manager.keep_unused_inbox {
            if let Err(err) = manager.prepare_unused_inbox().await {
                tracing::warn!(%err, "failed to prepare unused inbox");
            }
        }
        Ok(manager)
    }

    async fn bootstrap(&self) -> Result<usize, SessionError> {
        let inboxes = self.deps.store.all_inboxes().await?;
        let mut registry = self.registry.lock().await;
        for inbox in inboxes {
            if registry.running.contains_key(&inbox.inbox_id) {
                continue;
            }
            let identity = match self.deps.identities.load(&inbox.provider_id).await {
                Ok(identity) => identity,
                Err(err) => {
                    tracing::warn!(inbox_id = %inbox.inbox_id, %err, "no identity for persisted inbox; skipping");
                    continue;
                }
            };
            let machine = self.start_existing(identity, &inbox);
            registry.running.insert(inbox.inbox_id, machine);
        }
        Ok(registry.running.len())
    }

    fn start_existing(&self, identity: Identity, inbox: &Inbox) -> InboxStateMachine {
        let machine = InboxStateMachine::spawn(
            identity,
            Some(inbox.inbox_id.clone()),
            self.deps.machine_deps(),
            self.machine_config.clone(),
        );
        machine.authorize();
        machine
    }

    /// Spawns an idle machine for a freshly generated ephemeral identity. The caller sends
    /// `register` once the machine is tracked somewhere `delete_all_accounts` can see it.
    async fn spawn_unregistered(&self) -> Result<InboxStateMachine, SessionError> {
        let identity = self.deps.identities.generate(InboxType::Ephemeral).await?;
        Ok(InboxStateMachine::spawn(
            identity,
            None,
            self.deps.machine_deps(),
            self.machine_config.clone(),
        ))
    }

    fn spawn_left_listener(self: &Arc<Self>, rx: flume::Receiver<LeftConversation>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Ok(signal) = rx.recv_async().await {
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.handle_left_conversation(signal).await;
            }
        });
        *lock(&self.left_listener) = Some(handle);
    }

    async fn handle_left_conversation(&self, signal: LeftConversation) {
        // The notification needs the inbox's data, so it goes out before the teardown.
        self.deps.notifier.conversation_exploded(&signal);
        if let Err(err) = self.delete_account(&signal.inbox_id).await {
            tracing::warn!(inbox_id = %signal.inbox_id, %err, "failed to delete inbox after leaving conversation");
        }
    }

    /// Registers a new ephemeral inbox and returns its service once ready.
    ///
    /// A prepared unused inbox is handed out when no display name is requested. Fails with
    /// `SessionError::Cancelled` when `delete_all_accounts` runs before the inbox is ready.
    pub async fn add_account(
        &self,
        display_name: Option<String>,
    ) -> Result<MessagingService, SessionError> {
        let (generation, prepared) = {
            let mut registry = self.registry.lock().await;
            let prepared = match display_name {
                None => self.unused_inbox.lock().await.take(),
                Some(_) => None,
            };
            if let Some(machine) = &prepared {
                registry
                    .pending
                    .insert(machine.provider_id().to_string(), machine.clone());
            }
            (registry.generation, prepared)
        };

        if let Some(machine) = prepared {
            match self.finish_registration(machine).await {
                Err(SessionError::Authorization(err)) => {
                    tracing::warn!(%err, "unused inbox failed to register; starting a fresh one");
                }
                done => return self.account_added(done).await,
            }
        }

        let machine = self.spawn_unregistered().await?;
        {
            let mut registry = self.registry.lock().await;
            if registry.generation != generation {
                drop(registry);
                self.discard(&machine).await;
                tracing::info!("account creation cancelled by delete-all");
                return Err(SessionError::Cancelled);
            }
            registry
                .pending
                .insert(machine.provider_id().to_string(), machine.clone());
        }
        machine.register(display_name);
        let done = self.finish_registration(machine).await;
        self.account_added(done).await
    }

    /// Waits for a pending registration and moves it into the running set. A machine that
    /// `delete_all_accounts` took out of `pending` meanwhile was already shut down and wiped.
    async fn finish_registration(
        &self,
        machine: InboxStateMachine,
    ) -> Result<MessagingService, SessionError> {
        let result = machine.wait_for_ready().await;

        let mut registry = self.registry.lock().await;
        if registry.pending.remove(machine.provider_id()).is_none() {
            tracing::info!(provider_id = machine.provider_id(), "account creation cancelled by delete-all");
            return Err(SessionError::Cancelled);
        }
        let ready = match result {
            Ok(ready) => ready,
            Err(err) => {
                drop(registry);
                self.discard(&machine).await;
                return Err(SessionError::Authorization(err));
            }
        };
        let inbox_id = ready.inbox_id();
        let replaced = registry.running.insert(inbox_id.clone(), machine.clone());
        drop(registry);

        if let Some(old) = replaced {
            old.shutdown().await;
        }
        Ok(MessagingService::new(&inbox_id, machine))
    }

    async fn account_added(
        &self,
        done: Result<MessagingService, SessionError>,
    ) -> Result<MessagingService, SessionError> {
        let service = done?;
        tracing::info!(inbox_id = service.inbox_id(), "account added");
        if self.keep_unused_inbox {
            if let Err(err) = self.prepare_unused_inbox().await {
                tracing::warn!(%err, "failed to replenish unused inbox");
            }
        }
        Ok(service)
    }

    /// Shuts down a machine that never made it into the registry and drops its identity.
    async fn discard(&self, machine: &InboxStateMachine) {
        machine.shutdown().await;
        match self.deps.identities.delete(machine.provider_id()).await {
            Ok(()) | Err(IdentityError::NotFound(_)) => {}
            Err(err) => {
                tracing::warn!(provider_id = machine.provider_id(), %err, "failed to delete identity");
            }
        }
    }

    /// Starts registering an ephemeral inbox in the background, unless one is already pending.
    pub async fn prepare_unused_inbox(&self) -> Result<(), SessionError> {
        let mut slot = self.unused_inbox.lock().await;
        if slot.is_some() {
            return Ok(());
        }
        let machine = self.spawn_unregistered().await?;
        machine.register(None);
        tracing::debug!(provider_id = machine.provider_id(), "unused inbox preparing");
        *slot = Some(machine);
        Ok(())
    }

    pub async fn unused_inbox_prepared(&self) -> bool {
        self.unused_inbox.lock().await.is_some()
    }

    async fn take_unused_if(
        &self,
        pred: impl Fn(&InboxStateMachine) -> bool,
    ) -> Option<InboxStateMachine> {
        let mut slot = self.unused_inbox.lock().await;
        match slot.as_ref() {
            Some(machine) if pred(machine) => slot.take(),
            _ => None,
        }
    }

    /// Stops the inbox's machine and deletes its identity and local data. Absent inboxes are
    /// not an error.
    ///
    /// While the delete runs, `messaging_service` refuses the inbox instead of restarting it
    /// from storage. A second delete of the same inbox during that time returns at once.
    pub async fn delete_account(&self, inbox_id: &str) -> Result<(), SessionError> {
        let removed = {
            let mut registry = self.registry.lock().await;
            if !lock(&self.deleting).insert(inbox_id.to_string()) {
                tracing::debug!(inbox_id, "delete already in progress");
                return Ok(());
            }
            registry.running.remove(inbox_id)
        };
        let _marker = DeleteMarker {
            deleting: &self.deleting,
            inbox_id,
        };

        let machine = match removed {
            Some(machine) => Some(machine),
            None => {
                self.take_unused_if(|m| m.inbox_id().as_deref() == Some(inbox_id))
                    .await
            }
        };

        let provider_id = match &machine {
            Some(machine) => {
                machine.shutdown().await;
                Some(machine.provider_id().to_string())
            }
            None => self
                .deps
                .store
                .inbox(inbox_id)
                .await?
                .map(|inbox| inbox.provider_id),
        };

        let Some(provider_id) = provider_id else {
            tracing::info!(inbox_id, "delete requested for unknown inbox; nothing to do");
            return Ok(());
        };
        self.forget(inbox_id, &provider_id).await?;
        tracing::info!(inbox_id, "account deleted");
        Ok(())
    }

    pub async fn delete_account_by_provider_id(&self, provider_id: &str) -> Result<(), SessionError> {
        let running = self
            .registry
            .lock()
            .await
            .running
            .iter()
            .find(|(_, m)| m.provider_id() == provider_id)
            .map(|(inbox_id, _)| inbox_id.clone());

        let inbox_id = match running {
            Some(inbox_id) => Some(inbox_id),
            None => self
                .deps
                .store
                .all_inboxes()
                .await?
                .into_iter()
                .find(|inbox| inbox.provider_id == provider_id)
                .map(|inbox| inbox.inbox_id),
        };
        if let Some(inbox_id) = inbox_id {
            return self.delete_account(&inbox_id).await;
        }

        match self.take_unused_if(|m| m.provider_id() == provider_id).await {
            Some(machine) => self.discard(&machine).await,
            None => tracing::info!(provider_id, "delete requested for unknown provider id; nothing to do"),
        }
        Ok(())
    }

    async fn forget(&self, inbox_id: &str, provider_id: &str) -> Result<(), SessionError> {
        match self.deps.identities.delete(provider_id).await {
            Ok(()) | Err(IdentityError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }
        self.deps.store.delete_inbox(inbox_id).await?;
        self.deps.conversations.remove_inbox(inbox_id);

        let client_dir = client_data_dir(&self.data_dir).join(inbox_id);
        if let Err(err) = remove_dir(client_dir.clone()).await {
            tracing::warn!(inbox_id, path = %client_dir.display(), %err, "failed to remove client data");
        }
        Ok(())
    }

    /// Shuts down every machine, including registrations still in flight, then wipes
    /// identities, stored inboxes and client files.
    ///
    /// The wipe is best-effort: its failures are reported as warnings.
    pub async fn delete_all_accounts(&self) -> DeleteAllReport {
        let (machines, unused) = {
            let mut guard = self.registry.lock().await;
            let registry = &mut *guard;
            registry.generation += 1;
            let machines: Vec<InboxStateMachine> = registry
                .running
                .drain()
                .chain(registry.pending.drain())
                .map(|(_, machine)| machine)
                .collect();
            (machines, self.unused_inbox.lock().await.take())
        };
        let stopped = machines.len();

        // Shutdown waits for each machine's in-flight flow, so nothing it persists can land
        // after the wipe below.
        futures::stream::iter(machines.into_iter().chain(unused))
            .for_each_concurrent(self.teardown_concurrency, |machine| async move {
                machine.shutdown().await;
            })
            .await;

        let mut warnings = Vec::new();
        if let Err(err) = self.deps.identities.delete_all().await {
            warnings.push(CleanupWarning::new("identities", err));
        }
        if let Err(err) = self.deps.store.delete_all().await {
            warnings.push(CleanupWarning::new("inbox_store", err));
        }
        self.deps.conversations.clear();
        if let Err(err) = remove_dir(client_data_dir(&self.data_dir)).await {
            warnings.push(CleanupWarning::new("client_files", err));
        }

        for warning in &warnings {
            tracing::warn!(step = warning.step, message = %warning.message, "cleanup step failed");
        }
        tracing::info!(stopped, warnings = warnings.len(), "all accounts deleted");
        DeleteAllReport { stopped, warnings }
    }

    /// Running service for the inbox, starting its machine from storage when needed.
    ///
    /// Fails with `SessionError::Deleting` while the inbox is being deleted.
    pub async fn messaging_service(&self, inbox_id: &str) -> Result<MessagingService, SessionError> {
        let mut registry = self.registry.lock().await;
        if lock(&self.deleting).contains(inbox_id) {
            return Err(SessionError::Deleting(inbox_id.to_string()));
        }
        if let Some(machine) = registry.running.get(inbox_id) {
            return Ok(MessagingService::new(inbox_id, machine.clone()));
        }

        if let Some(machine) = self
            .take_unused_if(|m| m.inbox_id().as_deref() == Some(inbox_id))
            .await
        {
            registry.running.insert(inbox_id.to_string(), machine.clone());
            return Ok(MessagingService::new(inbox_id, machine));
        }

        let inbox = self
            .deps
            .store
            .inbox(inbox_id)
            .await?
            .ok_or_else(|| SessionError::UnknownInbox(inbox_id.to_string()))?;
        let identity = self.deps.identities.load(&inbox.provider_id).await?;
        let machine = self.start_existing(identity, &inbox);
        registry.running.insert(inbox.inbox_id.clone(), machine.clone());
        tracing::info!(inbox_id, "messaging service started on demand");
        Ok(MessagingService::new(inbox_id, machine))
    }

    pub async fn active_inbox_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registry.lock().await.running.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn observe_inboxes(&self) -> watch::Receiver<Vec<Inbox>> {
        self.deps.store.observe_inboxes()
    }

    pub fn conversations(&self, filter: ConversationFilter) -> watch::Receiver<Vec<Conversation>> {
        self.deps.conversations.conversations(filter)
    }

    pub fn conversations_count(&self, filter: ConversationFilter) -> watch::Receiver<usize> {
        self.deps.conversations.count(filter)
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        let slot = match self.left_listener.get_mut() {
            Ok(slot) => slot.take(),
            Err(poison) => poison.into_inner().take(),
        };
        if let Some(handle) = slot {
            handle.abort();
        }
    }
}
