use std::fmt;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::collaborators::MessagingClient;
use crate::model::BackendSession;

/// Command queued to an `InboxStateMachine`.
///
/// `Authorize`, `Register` and `Stop` come from callers; the rest are follow-ups a handler
/// queues to drive the next step of a flow.
#[derive(Clone)]
pub enum Action {
    Authorize,
    Register {
        display_name: Option<String>,
    },
    ClientInitialized {
        client: Arc<dyn MessagingClient>,
    },
    ClientRegistered {
        client: Arc<dyn MessagingClient>,
        display_name: Option<String>,
    },
    Authorized {
        client: Arc<dyn MessagingClient>,
        session: BackendSession,
    },
    Stop,
}

impl Action {
    /// Log-safe action tag (never includes display names or credentials).
    pub fn tag(&self) -> &'static str {
        match self {
            Action::Authorize => "Authorize",
            Action::Register { .. } => "Register",
            Action::ClientInitialized { .. } => "ClientInitialized",
            Action::ClientRegistered { .. } => "ClientRegistered",
            Action::Authorized { .. } => "Authorized",
            Action::Stop => "Stop",
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Mailbox envelope for the state-machine actor.
#[derive(Debug)]
pub(crate) enum Command {
    Action(Action),
    /// Stop behind everything already queued, then exit the actor loop.
    Shutdown(oneshot::Sender<()>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_is_the_tag_only() {
        let action = Action::Register {
            display_name: Some("Alice Secret".into()),
        };
        assert_eq!(format!("{action:?}"), "Register");
        assert_eq!(Action::Stop.tag(), "Stop");
    }
}
