// ABOUTME: One-way Active -> Closed state for a session plus per-generation stream tokens.
// ABOUTME: The first close records the terminal error; later closes are no-ops.

use std::sync::OnceLock;

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::error::SessionError;

/// Session-wide closure signal and stored terminal error.
#[derive(Debug, Default)]
pub struct Closure {
    token: CancellationToken,
    cause: OnceLock<SessionError>,
}

impl Closure {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transition to Closed. Returns true only for the call that performed it.
    pub fn close(&self, cause: SessionError) -> bool {
        let first = self.cause.set(cause).is_ok();
        self.token.cancel();
        first
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the session is closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// The error that closed the session.
    pub fn cause(&self) -> Option<SessionError> {
        self.cause.get().cloned()
    }

    /// The error reported by operations on a closed session.
    pub fn terminal_error(&self) -> SessionError {
        SessionError::connection_closed(self.cause().unwrap_or(SessionError::Closed))
    }

    /// Token for one stream generation. Cancelled with the session.
    pub fn generation_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_close_is_once_only() {
        let closure = Closure::new();
        assert!(!closure.is_closed());
        assert!(closure.cause().is_none());

        assert!(closure.close(SessionError::TransportUnavailable("first".to_string())));
        assert!(!closure.close(SessionError::Closed));

        assert!(closure.is_closed());
        assert!(matches!(
            closure.cause(),
            Some(SessionError::TransportUnavailable(m)) if m == "first"
        ));
        assert!(matches!(
            closure.terminal_error().close_cause(),
            Some(SessionError::TransportUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let closure = Arc::new(Closure::new());
        let waiter = {
            let closure = closure.clone();
            tokio::spawn(async move {
                closure.closed().await;
                closure.terminal_error()
            })
        };

        closure.close(SessionError::Closed);
        let err = waiter.await.unwrap();
        assert!(err.is_terminal());
    }

    #[test]
    fn test_generation_token_follows_session() {
        let closure = Closure::new();
        let first = closure.generation_token();
        let second = closure.generation_token();

        first.cancel();
        assert!(!closure.is_closed());
        assert!(!second.is_cancelled());

        closure.close(SessionError::Closed);
        assert!(second.is_cancelled());
    }
}
