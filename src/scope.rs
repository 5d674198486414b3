use std::ops::Deref;

use tracing::{debug, warn};

use crate::client::SessionClient;
use crate::error::SessionError;
use crate::session::{Session, SessionState};

/// Owns a session for a scope and deletes it when the scope ends.
///
/// Prefer [`SessionGuard::close`], which reports the delete result. Dropping
/// the guard instead cancels any open stream right away and deletes the
/// session on the current tokio runtime in the background.
#[derive(Debug)]
pub struct SessionGuard {
    client: SessionClient,
    session: Session,
    closed: bool,
}

impl SessionGuard {
    pub(crate) fn new(client: SessionClient, session: Session) -> Self {
        Self {
            client,
            session,
            closed: false,
        }
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Delete the session and wait for the server to confirm.
    pub async fn close(mut self) -> Result<(), SessionError> {
        self.closed = true;
        self.client.delete_session(&self.session).await
    }
}

impl Deref for SessionGuard {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.closed || self.session.state() == SessionState::Deleted {
            return;
        }
        self.session.cancel_open_stream();

        let client = self.client.clone();
        let session = self.session.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(session_id = %session.id(), "deleting dropped session in background");
                handle.spawn(async move {
                    if let Err(error) = client.delete_session(&session).await {
                        warn!(session_id = %session.id(), error = %error, "background session delete failed");
                    }
                });
            }
            Err(_) => {
                warn!(
                    session_id = %session.id(),
                    "session guard dropped outside a tokio runtime; session left on server"
                );
            }
        }
    }
}
