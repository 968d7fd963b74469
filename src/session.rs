//! Credentials and the single authenticated session a run replays under.
use std::fmt;

use tracing::info;

use crate::error::AuthError;
use crate::remote::RemoteNoteStore;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub identity: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(identity: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            identity: identity.into().trim().to_string(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("identity", &self.identity)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Log in once; the returned session is threaded explicitly through every replay call.
pub fn authenticate<S: RemoteNoteStore>(
    store: &S,
    credentials: &Credentials,
) -> Result<S::Session, AuthError> {
    if credentials.identity.is_empty() {
        return Err(AuthError::MissingIdentity);
    }
    let session = store.login(credentials)?;
    info!(identity = %credentials.identity, "authenticated with note service");
    Ok(session)
}
