// Authorization sequencer for one inbox.
//
// Callers talk to a cheap, cloneable handle; all state lives in a private actor task that
// drains a mailbox one command at a time. Handlers never call each other: a step that needs a
// next step pushes a follow-up `Action` onto the actor's queue, and follow-ups are drained
// before the mailbox is read again. A multi-step flow therefore runs to completion before any
// later caller command (including `stop`) is looked at.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::actions::{Action, Command};
use crate::attestation::attestation_digest;
use crate::collaborators::{
    AttestationProvider, BackendAuthClient, ClientFactory, InboxWriter, MessagingClient,
    SyncingManager,
};
use crate::config::AppConfig;
use crate::error::InboxError;
use crate::model::{
    AuthRequest, BackendSession, CreateUserRequest, Identity, Inbox, InboxReadyResult,
};
use crate::state::{AuthorizationState, StateCell, StateStream};
use crate::username;

/// Collaborators a state machine drives.
#[derive(Clone)]
pub struct StateMachineDependencies {
    pub client_factory: Arc<dyn ClientFactory>,
    pub backend: Arc<dyn BackendAuthClient>,
    pub attestation: Arc<dyn AttestationProvider>,
    pub writer: Arc<dyn InboxWriter>,
    pub syncing: Arc<dyn SyncingManager>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMachineConfig {
    pub username_max_attempts: u32,
    pub state_event_capacity: usize,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for StateMachineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            username_max_attempts: config.username_max_attempts(),
            state_event_capacity: config.state_event_capacity(),
        }
    }
}

/// Handle to one inbox's authorization actor. Cloning shares the same actor.
#[derive(Clone)]
pub struct InboxStateMachine {
    commands: flume::Sender<Command>,
    state: Arc<StateCell>,
    provider_id: Arc<str>,
}

impl InboxStateMachine {
    /// Spawns the actor on the current tokio runtime. `inbox_id` is the remote inbox this
    /// identity is known to own, if any.
    pub fn spawn(
        identity: Identity,
        inbox_id: Option<String>,
        deps: StateMachineDependencies,
        config: StateMachineConfig,
    ) -> Self {
        let (commands, mailbox) = flume::unbounded();
        let state = Arc::new(StateCell::new(config.state_event_capacity));
        let provider_id: Arc<str> = Arc::from(identity.provider_id.as_str());

        let actor = Actor {
            identity,
            known_inbox_id: inbox_id,
            deps,
            config,
            state: state.clone(),
            queue: VecDeque::new(),
        };
        tokio::spawn(actor.run(mailbox));

        Self {
            commands,
            state,
            provider_id,
        }
    }

    /// Sign in with the existing identity.
    pub fn authorize(&self) {
        self.dispatch(Action::Authorize);
    }

    /// Fresh registration that also creates a backend user.
    pub fn register(&self, display_name: Option<String>) {
        self.dispatch(Action::Register { display_name });
    }

    /// Back to `uninitialized` once any in-flight flow finishes.
    pub fn stop(&self) {
        self.dispatch(Action::Stop);
    }

    fn dispatch(&self, action: Action) {
        tracing::info!(provider_id = %self.provider_id, action = action.tag(), "dispatch");
        // Contract: never block the caller.
        if self.commands.send(Command::Action(action)).is_err() {
            tracing::warn!(provider_id = %self.provider_id, "state machine shut down; action dropped");
        }
    }

    pub fn state(&self) -> AuthorizationState {
        self.state.get()
    }

    pub fn subscribe(&self) -> StateStream {
        self.state.subscribe()
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    /// Inbox id while the machine is ready.
    pub fn inbox_id(&self) -> Option<String> {
        self.state().ready().map(InboxReadyResult::inbox_id)
    }

    /// Resolves on the next `ready` or `error`, starting from the current state.
    pub async fn wait_for_ready(&self) -> Result<InboxReadyResult, Arc<InboxError>> {
        self.subscribe().wait_for_ready().await
    }

    /// Queues a stop behind everything already pending and waits for the actor to exit.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack)).is_err() {
            return;
        }
        let _ = done.await;
    }
}

struct Actor {
    identity: Identity,
    known_inbox_id: Option<String>,
    deps: StateMachineDependencies,
    config: StateMachineConfig,
    state: Arc<StateCell>,
    queue: VecDeque<Action>,
}

impl Actor {
    async fn run(mut self, mailbox: flume::Receiver<Command>) {
        while let Ok(command) = mailbox.recv_async().await {
            match command {
                Command::Action(action) => {
                    self.queue.push_back(action);
                    self.drain().await;
                }
                Command::Shutdown(ack) => {
                    self.queue.push_back(Action::Stop);
                    self.drain().await;
                    let _ = ack.send(());
                    break;
                }
            }
        }
        tracing::debug!(provider_id = %self.identity.provider_id, "state machine actor exited");
    }

    async fn drain(&mut self) {
        while let Some(action) = self.queue.pop_front() {
            self.process(action).await;
        }
    }

    async fn process(&mut self, action: Action) {
        use AuthorizationState as S;

        let tag = action.tag();
        let current = self.state.get();
        let result = match (&current, action) {
            (S::Uninitialized | S::Error(_), Action::Authorize) => self.handle_authorize().await,
            (S::Uninitialized | S::Error(_), Action::Register { display_name }) => {
                self.handle_register(display_name).await
            }
            (S::Initializing, Action::ClientInitialized { client }) => {
                self.handle_client_initialized(client).await
            }
            (S::Initializing, Action::ClientRegistered {
                client,
                display_name,
            }) => self.handle_client_registered(client, display_name).await,
            (S::Authorizing | S::Registering, Action::Authorized { client, session }) => {
                self.handle_authorized(client, session).await
            }
            (S::Ready(_) | S::Error(_), Action::Stop) => {
                self.handle_stop();
                Ok(())
            }
            (S::Uninitialized, Action::Stop) => Ok(()),
            (state, action) => {
                tracing::warn!(
                    provider_id = %self.identity.provider_id,
                    state = state.name(),
                    action = action.tag(),
                    "invalid transition; dropping action"
                );
                Ok(())
            }
        };

        if let Err(err) = result {
            tracing::warn!(provider_id = %self.identity.provider_id, action = tag, %err, "transition failed");
            self.transition(AuthorizationState::Error(Arc::new(err)));
        }
    }

    fn transition(&self, next: AuthorizationState) -> AuthorizationState {
        let to = next.name();
        let previous = self.state.set(next);
        tracing::debug!(
            provider_id = %self.identity.provider_id,
            inbox_id = self.known_inbox_id.as_deref().unwrap_or("-"),
            from = previous.name(),
            to,
            "state transition"
        );
        previous
    }

    async fn handle_authorize(&mut self) -> Result<(), InboxError> {
        self.transition(AuthorizationState::Initializing);
        let client = match self
            .deps
            .client_factory
            .build(&self.identity, self.known_inbox_id.as_deref())
            .await
        {
            Ok(client) => client,
            Err(build_err) => {
                // Local cache may be gone while the remote identity still exists.
                tracing::warn!(
                    provider_id = %self.identity.provider_id,
                    %build_err,
                    "building client failed; creating from signing key"
                );
                self.deps.client_factory.create(&self.identity).await?
            }
        };
        self.queue.push_back(Action::ClientInitialized { client });
        Ok(())
    }

    async fn handle_register(&mut self, display_name: Option<String>) -> Result<(), InboxError> {
        self.transition(AuthorizationState::Initializing);
        let client = self.deps.client_factory.create(&self.identity).await?;
        self.queue.push_back(Action::ClientRegistered {
            client,
            display_name,
        });
        Ok(())
    }

    async fn handle_client_initialized(
        &mut self,
        client: Arc<dyn MessagingClient>,
    ) -> Result<(), InboxError> {
        self.transition(AuthorizationState::Authorizing);
        let session = self.authenticate(client.as_ref()).await?;
        self.queue.push_back(Action::Authorized { client, session });
        Ok(())
    }

    async fn handle_client_registered(
        &mut self,
        client: Arc<dyn MessagingClient>,
        display_name: Option<String>,
    ) -> Result<(), InboxError> {
        self.transition(AuthorizationState::Authorizing);
        let session = self.authenticate(client.as_ref()).await?;

        self.transition(AuthorizationState::Registering);
        let username = username::find_available_username(
            self.deps.backend.as_ref(),
            &session,
            display_name.as_deref(),
            self.config.username_max_attempts,
        )
        .await?;
        let request = CreateUserRequest {
            inbox_id: client.inbox_id(),
            installation_id: client.installation_id(),
            username,
            display_name,
        };
        let created = self.deps.backend.create_user(&session, &request).await?;
        tracing::info!(inbox_id = %request.inbox_id, user_id = %created.id, "backend user created");

        self.queue.push_back(Action::Authorized { client, session });
        Ok(())
    }

    async fn authenticate(&self, client: &dyn MessagingClient) -> Result<BackendSession, InboxError> {
        let inbox_id = client.inbox_id();
        let installation_id = client.installation_id();
        let attestation_token = self.deps.attestation.attestation_token().await?;
        let digest = attestation_digest(&inbox_id, &installation_id, &attestation_token);
        let signature = client.sign_with_installation_key(&digest).await?;

        let request = AuthRequest {
            installation_id,
            inbox_id,
            attestation_token,
            signature: hex::encode(signature),
        };
        Ok(self.deps.backend.authenticate(&request).await?)
    }

    async fn handle_authorized(
        &mut self,
        client: Arc<dyn MessagingClient>,
        session: BackendSession,
    ) -> Result<(), InboxError> {
        let inbox_id = client.inbox_id();
        let user = self.deps.backend.get_user(&session).await?;
        let profile = self.deps.backend.get_profile(&session, &inbox_id).await?;

        let inbox = Inbox::from_authorization(&self.identity, inbox_id.clone(), user, profile);
        self.deps.writer.store_inbox(&inbox).await?;
        self.known_inbox_id = Some(inbox_id);

        let ready = InboxReadyResult { client, session };
        self.transition(AuthorizationState::Ready(ready.clone()));
        self.deps.syncing.start(&ready);
        Ok(())
    }

    fn handle_stop(&mut self) {
        let previous = self.transition(AuthorizationState::Stopping);
        if let AuthorizationState::Ready(ready) = previous {
            self.deps.syncing.stop(&ready.inbox_id());
            // Dropping `ready` releases this machine's hold on the client.
        }
        self.transition(AuthorizationState::Uninitialized);
    }
}
