// ABOUTME: Retry and backoff policies for stream recreation and message sends.
// ABOUTME: Pure state machines so the receive loop and send wrapper stay free of timing arithmetic.

use std::time::Duration;

use tonic::Code;

use crate::error::SessionError;

/// Ceiling on the ResourceExhausted reconnect sleep.
pub const MAX_RESOURCE_EXHAUSTED_DELAY: Duration = Duration::from_secs(10);

/// Consecutive Unavailable errors that trigger a reconnect; one more is fatal.
pub const MAX_UNAVAILABLE_RETRIES: u32 = 6;

/// Attempts made by [`Session::send`](crate::Session::send).
pub const SEND_ATTEMPTS: u32 = 5;

const RESOURCE_EXHAUSTED_STEP: Duration = Duration::from_secs(1);
const UNAVAILABLE_STEP: Duration = Duration::from_millis(200);
const SEND_BACKOFF_STEP: Duration = Duration::from_millis(250);

/// How a stream generation ended.
#[derive(Debug, Clone)]
pub enum StreamEnd {
    /// The server closed the stream cleanly.
    Eof,
    /// The read failed with a status.
    Status(tonic::Status),
}

/// What to do after a stream generation ends.
#[derive(Debug)]
pub enum ReconnectDecision {
    /// Sleep for `delay`, then open a new stream.
    Recreate { delay: Duration },
    /// Close the session with this error.
    Fatal(SessionError),
}

/// Consecutive-failure counters carried from one stream generation to the next.
///
/// Any successful read resets both counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectBackoff {
    resource_exhausted: u32,
    unavailable: u32,
}

impl ReconnectBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// A read succeeded.
    pub fn reset(&mut self) {
        self.resource_exhausted = 0;
        self.unavailable = 0;
    }

    pub fn resource_exhausted_retries(&self) -> u32 {
        self.resource_exhausted
    }

    pub fn unavailable_retries(&self) -> u32 {
        self.unavailable
    }

    /// Classify how the stream ended and advance the counters.
    pub fn on_stream_end(&mut self, end: &StreamEnd) -> ReconnectDecision {
        let status = match end {
            StreamEnd::Eof => {
                return ReconnectDecision::Recreate {
                    delay: Duration::ZERO,
                }
            }
            StreamEnd::Status(status) => status,
        };

        match status.code() {
            Code::ResourceExhausted => {
                let delay = (RESOURCE_EXHAUSTED_STEP * (self.resource_exhausted + 1))
                    .min(MAX_RESOURCE_EXHAUSTED_DELAY);
                self.resource_exhausted = self.resource_exhausted.saturating_add(1);
                ReconnectDecision::Recreate { delay }
            }
            Code::Unavailable => {
                if self.unavailable >= MAX_UNAVAILABLE_RETRIES {
                    return ReconnectDecision::Fatal(SessionError::TransportUnavailable(
                        status.message().to_string(),
                    ));
                }
                let delay = UNAVAILABLE_STEP * self.unavailable;
                self.unavailable += 1;
                ReconnectDecision::Recreate { delay }
            }
            // Cancelled is the server's idle timeout, DeadlineExceeded our own stream deadline.
            Code::Cancelled | Code::DeadlineExceeded => ReconnectDecision::Recreate {
                delay: Duration::ZERO,
            },
            code => ReconnectDecision::Fatal(SessionError::UnexpectedTransportError {
                code,
                message: status.message().to_string(),
            }),
        }
    }
}

/// Delay before retrying a send that came back ResourceExhausted on `attempt` (1-based).
pub fn send_backoff(attempt: u32) -> Duration {
    SEND_BACKOFF_STEP * attempt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delay(decision: ReconnectDecision) -> Duration {
        match decision {
            ReconnectDecision::Recreate { delay } => delay,
            ReconnectDecision::Fatal(err) => panic!("unexpected fatal: {}", err),
        }
    }

    fn exhausted() -> StreamEnd {
        StreamEnd::Status(tonic::Status::resource_exhausted("throttled"))
    }

    fn unavailable() -> StreamEnd {
        StreamEnd::Status(tonic::Status::unavailable("connection reset"))
    }

    #[test]
    fn test_resource_exhausted_sequence_is_linear_and_capped() {
        let mut backoff = ReconnectBackoff::new();
        let delays: Vec<u64> = (0..12)
            .map(|_| delay(backoff.on_stream_end(&exhausted())).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 10, 10]);
        assert_eq!(backoff.resource_exhausted_retries(), 12);
    }

    #[test]
    fn test_resource_exhausted_resets_after_success() {
        let mut backoff = ReconnectBackoff::new();
        for _ in 0..3 {
            backoff.on_stream_end(&exhausted());
        }
        assert_eq!(
            delay(backoff.on_stream_end(&exhausted())),
            Duration::from_secs(4)
        );

        backoff.reset();
        assert_eq!(
            delay(backoff.on_stream_end(&exhausted())),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_unavailable_sequence_then_fatal() {
        let mut backoff = ReconnectBackoff::new();
        let delays: Vec<u64> = (0..6)
            .map(|_| delay(backoff.on_stream_end(&unavailable())).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![0, 200, 400, 600, 800, 1000]);

        match backoff.on_stream_end(&unavailable()) {
            ReconnectDecision::Fatal(SessionError::TransportUnavailable(m)) => {
                assert_eq!(m, "connection reset")
            }
            other => panic!("expected fatal, got {:?}", other),
        }
    }

    #[test]
    fn test_counters_are_independent() {
        let mut backoff = ReconnectBackoff::new();
        backoff.on_stream_end(&unavailable());
        backoff.on_stream_end(&unavailable());
        assert_eq!(
            delay(backoff.on_stream_end(&exhausted())),
            Duration::from_secs(1)
        );
        assert_eq!(backoff.unavailable_retries(), 2);
    }

    #[test]
    fn test_normal_close_reconnects_immediately() {
        let mut backoff = ReconnectBackoff::new();
        for end in [
            StreamEnd::Eof,
            StreamEnd::Status(tonic::Status::cancelled("idle")),
            StreamEnd::Status(tonic::Status::deadline_exceeded("deadline")),
        ] {
            assert_eq!(delay(backoff.on_stream_end(&end)), Duration::ZERO);
        }
        assert_eq!(backoff, ReconnectBackoff::new());
    }

    #[test]
    fn test_other_codes_are_fatal() {
        let mut backoff = ReconnectBackoff::new();
        for status in [
            tonic::Status::permission_denied("denied"),
            tonic::Status::internal("boom"),
            tonic::Status::unauthenticated("token"),
        ] {
            let code = status.code();
            match backoff.on_stream_end(&StreamEnd::Status(status)) {
                ReconnectDecision::Fatal(SessionError::UnexpectedTransportError {
                    code: got,
                    ..
                }) => assert_eq!(got, code),
                other => panic!("expected fatal, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_send_backoff() {
        let delays: Vec<u64> = (1..=SEND_ATTEMPTS)
            .map(|a| send_backoff(a).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![250, 500, 750, 1000, 1250]);
    }
}
