// HTTP client for the application backend.
//
// Tokens are tracked per inbox. On a 401 the last authentication request for that inbox is
// replayed once and the original request retried with the renewed token.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use crate::collaborators::BackendAuthClient;
use crate::error::BackendError;
use crate::model::{
    AuthRequest, BackendSession, CreateUserRequest, CreatedUser, Profile, User, UsernameCheck,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    token: String,
    session_id: String,
}

#[derive(Default)]
struct Credentials {
    requests: HashMap<String, AuthRequest>,
    tokens: HashMap<String, String>,
}

pub struct HttpBackendClient {
    http: reqwest::Client,
    base_url: Url,
    credentials: Mutex<Credentials>,
}

impl HttpBackendClient {
    pub fn new(base_url: &str) -> Result<Self, BackendError> {
        let base_url = Url::parse(base_url.trim())?;
        if base_url.cannot_be_a_base() {
            return Err(BackendError::InvalidBase(base_url.to_string()));
        }
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url,
            credentials: Mutex::new(Credentials::default()),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn credentials(&self) -> MutexGuard<'_, Credentials> {
        match self.credentials.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }

    pub(crate) fn endpoint(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::InvalidBase(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn current_token(&self, session: &BackendSession) -> String {
        self.credentials()
            .tokens
            .get(&session.inbox_id)
            .cloned()
            .unwrap_or_else(|| session.token.clone())
    }

    async fn exchange(&self, request: &AuthRequest) -> Result<BackendSession, BackendError> {
        let url = self.endpoint(&["v2", "auth", "token"])?;
        let response = self.http.post(url).json(request).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(BackendError::Unauthorized);
        }
        let body: TokenResponse = decode(response).await?;

        let mut creds = self.credentials();
        creds
            .requests
            .insert(request.inbox_id.clone(), request.clone());
        creds
            .tokens
            .insert(request.inbox_id.clone(), body.token.clone());
        Ok(BackendSession {
            id: body.session_id,
            inbox_id: request.inbox_id.clone(),
            token: body.token,
        })
    }

    async fn reauthenticate(&self, inbox_id: &str) -> Result<String, BackendError> {
        let request = self
            .credentials()
            .requests
            .get(inbox_id)
            .cloned()
            .ok_or_else(|| BackendError::NoCredentials(inbox_id.to_string()))?;
        tracing::info!(inbox_id, "backend token rejected; re-authenticating");
        Ok(self.exchange(&request).await?.token)
    }

    async fn send_authorized<F>(
        &self,
        session: &BackendSession,
        build: F,
    ) -> Result<Response, BackendError>
    where
        F: Fn(&str) -> RequestBuilder + Send + Sync,
    {
        let token = self.current_token(session);
        let response = build(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        let renewed = self.reauthenticate(&session.inbox_id).await?;
        let response = build(&renewed).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(BackendError::Unauthorized);
        }
        Ok(response)
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, BackendError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(BackendError::Status {
            status: status.as_u16(),
            body,
        });
    }
    response
        .json::<T>()
        .await
        .map_err(|e| BackendError::Decode(e.to_string()))
}

#[async_trait]
impl BackendAuthClient for HttpBackendClient {
    async fn authenticate(&self, request: &AuthRequest) -> Result<BackendSession, BackendError> {
        self.exchange(request).await
    }

    async fn get_user(&self, session: &BackendSession) -> Result<User, BackendError> {
        let url = self.endpoint(&["v1", "users", "me"])?;
        let response = self
            .send_authorized(session, |token| self.http.get(url.clone()).bearer_auth(token))
            .await?;
        decode(response).await
    }

    async fn get_profile(
        &self,
        session: &BackendSession,
        inbox_id: &str,
    ) -> Result<Profile, BackendError> {
        let url = self.endpoint(&["v1", "profiles", inbox_id])?;
        let response = self
            .send_authorized(session, |token| self.http.get(url.clone()).bearer_auth(token))
            .await?;
        // No profile yet is a valid answer for a fresh inbox.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Profile::empty(inbox_id));
        }
        let mut profile: Profile = decode(response).await?;
        if profile.inbox_id.is_empty() {
            profile.inbox_id = inbox_id.to_string();
        }
        Ok(profile)
    }

    async fn create_user(
        &self,
        session: &BackendSession,
        request: &CreateUserRequest,
    ) -> Result<CreatedUser, BackendError> {
        let url = self.endpoint(&["v1", "users"])?;
        let response = self
            .send_authorized(session, |token| {
                self.http.post(url.clone()).bearer_auth(token).json(request)
            })
            .await?;
        decode(response).await
    }

    async fn check_username(
        &self,
        session: &BackendSession,
        candidate: &str,
    ) -> Result<UsernameCheck, BackendError> {
        let url = self.endpoint(&["v1", "users", "username", candidate])?;
        let response = self
            .send_authorized(session, |token| self.http.get(url.clone()).bearer_auth(token))
            .await?;
        decode(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_and_non_base_urls() {
        assert!(matches!(
            HttpBackendClient::new("not a url"),
            Err(BackendError::InvalidUrl(_))
        ));
        assert!(matches!(
            HttpBackendClient::new("mailto:ops@example.test"),
            Err(BackendError::InvalidBase(_))
        ));
    }

    #[test]
    fn endpoints_append_escaped_segments() {
        let client = HttpBackendClient::new("https://api.example.test/api/").unwrap();
        assert_eq!(
            client.endpoint(&["v1", "profiles", "inbox/1"]).unwrap().as_str(),
            "https://api.example.test/api/v1/profiles/inbox%2F1"
        );

        let bare = HttpBackendClient::new("https://api.example.test").unwrap();
        assert_eq!(
            bare.endpoint(&["v2", "auth", "token"]).unwrap().as_str(),
            "https://api.example.test/v2/auth/token"
        );
    }

    #[test]
    fn token_falls_back_to_session_until_renewed() {
        let client = HttpBackendClient::new("https://api.example.test").unwrap();
        let session = BackendSession {
            id: "s".into(),
            inbox_id: "inbox".into(),
            token: "original".into(),
        };
        assert_eq!(client.current_token(&session), "original");

        client
            .credentials()
            .tokens
            .insert("inbox".into(), "renewed".into());
        assert_eq!(client.current_token(&session), "renewed");
    }
}
