use std::time::Duration;

use session_transport::{BackoffSchedule, RetryDecision, TransportError};

/// Per-stream retry bookkeeping on top of a shared [`BackoffSchedule`].
///
/// Connect failures count toward the retry budget only until the first frame
/// arrives. Resumes count consecutive reconnects without progress; any frame
/// received on a resumed connection resets that counter.
#[derive(Debug, Clone)]
pub(crate) struct Reconnector {
    schedule: BackoffSchedule,
    connect_failures: u32,
    resumes: u32,
}

impl Reconnector {
    pub(crate) fn new(schedule: BackoffSchedule) -> Self {
        Self {
            schedule,
            connect_failures: 0,
            resumes: 0,
        }
    }

    /// Connection attempts made so far, the failed ones included.
    pub(crate) fn attempts(&self) -> u32 {
        self.connect_failures.max(1)
    }

    pub(crate) fn resumes(&self) -> u32 {
        self.resumes
    }

    pub(crate) fn on_connect_failure(&mut self, error: &TransportError) -> RetryDecision {
        self.connect_failures += 1;
        self.schedule.on_connect_failure(error, self.connect_failures)
    }

    pub(crate) fn on_mid_stream_failure(
        &mut self,
        error: &TransportError,
        last_event_id: Option<&str>,
        retry_hint_ms: Option<u64>,
    ) -> RetryDecision {
        let decision = self.schedule.on_mid_stream_failure(
            error,
            self.resumes,
            last_event_id,
            retry_hint_ms.map(Duration::from_millis),
        );
        if matches!(decision, RetryDecision::Resume { .. }) {
            self.resumes += 1;
        }
        decision
    }

    pub(crate) fn on_frame(&mut self) {
        self.resumes = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use session_transport::{BackoffSchedule, RetryConfig, RetryDecision, TransportError};

    use super::Reconnector;

    fn reconnector(config: RetryConfig) -> Reconnector {
        Reconnector::new(BackoffSchedule::new(
            config.with_base_delay(Duration::from_millis(10)),
        ))
    }

    #[test]
    fn connect_budget_allows_max_retries_after_first_attempt() {
        let mut reconnector = reconnector(RetryConfig::default().with_max_retries(2));
        let error = TransportError::Connect("refused".into());

        assert_eq!(
            reconnector.on_connect_failure(&error),
            RetryDecision::Retry {
                delay: Duration::from_millis(10)
            }
        );
        assert_eq!(
            reconnector.on_connect_failure(&error),
            RetryDecision::Retry {
                delay: Duration::from_millis(20)
            }
        );
        assert_eq!(reconnector.on_connect_failure(&error), RetryDecision::Fail);
        assert_eq!(reconnector.attempts(), 3);
    }

    #[test]
    fn non_retryable_status_fails_immediately() {
        let mut reconnector = reconnector(RetryConfig::default());
        let error = TransportError::Status {
            status: 401,
            message: "unauthorized".into(),
        };
        assert_eq!(reconnector.on_connect_failure(&error), RetryDecision::Fail);
        assert_eq!(reconnector.attempts(), 1);
    }

    #[test]
    fn progress_resets_the_resume_budget() {
        let mut reconnector = reconnector(RetryConfig::default().with_max_resumes(1));
        let error = TransportError::Read("reset".into());

        assert_matches::assert_matches!(
            reconnector.on_mid_stream_failure(&error, Some("4"), None),
            RetryDecision::Resume { last_event_id, .. } if last_event_id == "4"
        );
        assert_eq!(
            reconnector.on_mid_stream_failure(&error, Some("4"), None),
            RetryDecision::Fail
        );

        reconnector.on_frame();
        assert_matches::assert_matches!(
            reconnector.on_mid_stream_failure(&error, Some("5"), Some(3)),
            RetryDecision::Resume { delay, .. } if delay == Duration::from_millis(3)
        );
    }

    #[test]
    fn resume_needs_an_event_id() {
        let mut reconnector = reconnector(RetryConfig::default());
        let error = TransportError::IdleTimeout(Duration::from_secs(1));
        assert_eq!(
            reconnector.on_mid_stream_failure(&error, None, None),
            RetryDecision::Fail
        );
        assert_eq!(reconnector.resumes(), 0);
    }
}
