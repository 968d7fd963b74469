//! The remote note service a backup is replayed into.
use std::fmt;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{AuthError, UploadError};
use crate::session::Credentials;

/// Identifier the remote service assigned to a created note.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(String);

impl RemoteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two operations a migration needs from a note service.
pub trait RemoteNoteStore {
    type Session;

    fn login(&self, credentials: &Credentials) -> Result<Self::Session, AuthError>;

    /// Create one note. Calls made after the session was invalidated must fail, not panic.
    fn create_note(
        &self,
        session: &Self::Session,
        title: &str,
        body: &str,
    ) -> Result<RemoteId, UploadError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct HttpSession {
    token: String,
}

impl fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSession")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    identity: &'a str,
    secret: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Serialize)]
struct CreateNoteRequest<'a> {
    title: &'a str,
    body: &'a str,
}

#[derive(Deserialize)]
struct CreateNoteResponse {
    id: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(alias = "error")]
    message: String,
}

/// JSON-over-HTTP note service:
/// `POST {endpoint}/v1/sessions` then `POST {endpoint}/v1/notes` with a bearer token.
pub struct HttpNoteStore {
    sessions_url: Url,
    notes_url: Url,
    client: Client,
}

impl HttpNoteStore {
    /// `timeout` bounds every request, login and note creation alike.
    pub fn new(endpoint: &Url, timeout: Duration) -> Result<Self, AuthError> {
        let base = normalize_endpoint(endpoint);
        Ok(Self {
            sessions_url: base.join("v1/sessions")?,
            notes_url: base.join("v1/notes")?,
            client: Client::builder()
                .user_agent(concat!("apple-notes-migrate/", env!("CARGO_PKG_VERSION")))
                .timeout(timeout)
                .build()?,
        })
    }
}

/// Ensure the endpoint path ends in `/` so relative joins extend it rather than replace it.
pub fn normalize_endpoint(endpoint: &Url) -> Url {
    let mut base = endpoint.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base
}

/// Pull a human-readable message out of an error response, falling back to the status text.
fn error_message(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .map(|e| e.message)
        .ok()
        .filter(|m| !m.trim().is_empty())
        .or_else(|| {
            let trimmed = body.trim();
            (!trimmed.is_empty() && trimmed.len() <= 200).then(|| trimmed.to_string())
        })
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string()
        })
}

fn read_error(response: Response) -> (StatusCode, String) {
    let status = response.status();
    let body = response.text().unwrap_or_default();
    (status, error_message(status, &body))
}

impl RemoteNoteStore for HttpNoteStore {
    type Session = HttpSession;

    fn login(&self, credentials: &Credentials) -> Result<HttpSession, AuthError> {
        let response = self
            .client
            .post(self.sessions_url.clone())
            .json(&LoginRequest {
                identity: &credentials.identity,
                secret: &credentials.secret,
            })
            .send()?;

        if !response.status().is_success() {
            let (status, message) = read_error(response);
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AuthError::Rejected(message),
                _ => AuthError::Service {
                    status: status.as_u16(),
                    message,
                },
            });
        }

        let body: LoginResponse = response.json()?;
        Ok(HttpSession { token: body.token })
    }

    fn create_note(
        &self,
        session: &HttpSession,
        title: &str,
        body: &str,
    ) -> Result<RemoteId, UploadError> {
        let response = self
            .client
            .post(self.notes_url.clone())
            .bearer_auth(&session.token)
            .json(&CreateNoteRequest { title, body })
            .send()
            .map_err(|e| UploadError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let (status, message) = read_error(response);
            return Err(if status == StatusCode::UNAUTHORIZED {
                UploadError::SessionExpired
            } else {
                UploadError::Rejected {
                    status: Some(status.as_u16()),
                    message,
                }
            });
        }

        let created: CreateNoteResponse = response
            .json()
            .map_err(|e| UploadError::InvalidResponse(e.to_string()))?;
        Ok(RemoteId(created.id))
    }
}
