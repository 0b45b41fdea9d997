mod actions;
mod attestation;
mod backend;
mod collaborators;
mod config;
mod conversations;
mod error;
mod inbox_db;
mod logging;
mod model;
mod session;
mod state;
mod state_machine;
mod username;

pub use actions::Action;
pub use attestation::{attestation_digest, NonceAttestation};
pub use backend::HttpBackendClient;
pub use collaborators::*;
pub use config::{load_app_config, write_app_config, AppConfig, CONFIG_FILE_NAME};
pub use conversations::*;
pub use error::*;
pub use inbox_db::{InboxDb, DB_FILE_NAME};
pub use logging::init_logging;
pub use model::*;
pub use session::{
    client_data_dir, DeleteAllReport, LeftConversation, MessagingService, SessionDependencies,
    SessionManager,
};
pub use state::{AuthorizationState, StateStream};
pub use state_machine::{InboxStateMachine, StateMachineConfig, StateMachineDependencies};
pub use username::{base_username, find_available_username};
