//! Username selection for freshly registered users.
//!
//! Candidates derive from the display name and are checked against the backend. After
//! `max_attempts` taken candidates a randomized suffix is used instead of failing registration.

use rand::Rng;

use crate::collaborators::BackendAuthClient;
use crate::error::BackendError;
use crate::model::BackendSession;

const MAX_BASE_LEN: usize = 20;
const FALLBACK_BASE: &str = "user";

/// Lowercase ASCII alphanumerics of the display name, capped in length.
pub fn base_username(display_name: Option<&str>) -> String {
    let base: String = display_name
        .unwrap_or_default()
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .take(MAX_BASE_LEN)
        .collect();
    if base.is_empty() {
        FALLBACK_BASE.to_string()
    } else {
        base
    }
}

/// First attempt is the bare base; later attempts append four random digits.
pub fn candidate(base: &str, attempt: u32) -> String {
    if attempt == 0 {
        return base.to_string();
    }
    let suffix: u32 = rand::thread_rng().gen_range(0..10_000);
    format!("{base}{suffix:04}")
}

pub fn randomized_fallback(base: &str) -> String {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("{base}_{}", &nonce[..8])
}

pub async fn find_available_username(
    backend: &dyn BackendAuthClient,
    session: &BackendSession,
    display_name: Option<&str>,
    max_attempts: u32,
) -> Result<String, BackendError> {
    let base = base_username(display_name);
    for attempt in 0..max_attempts {
        let name = candidate(&base, attempt);
        if !backend.check_username(session, &name).await?.taken {
            return Ok(name);
        }
        tracing::debug!(attempt, "username candidate taken");
    }
    tracing::info!(max_attempts, "username candidates exhausted; using randomized suffix");
    Ok(randomized_fallback(&base))
}
