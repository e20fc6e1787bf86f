//! Retry coordination for retryable reads and writes.
//!
//! A logical operation gets at most two attempts. [`RetryState`] is the
//! two-state machine deciding what happens after each attempt; the loop
//! driving attempts lives in [`crate::operation::execute_with_retries`].

use crate::connection::ConnectionDescription;
use crate::error::{FailureStage, MongoError, NO_WRITES_PERFORMED};
use crate::session::ClientSession;

/// How an operation may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    /// Single attempt.
    None,
    /// Retried once on transient read errors.
    Read,
    /// Retried once on transient write errors, with a stable `txnNumber`.
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    First,
    Last,
}

/// A failed attempt and the stage at which it failed.
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    /// The error the attempt failed with.
    pub error: MongoError,
    /// Whether any byte of the command left the client.
    pub stage: FailureStage,
}

impl AttemptFailure {
    /// A failure while selecting a server or checking out a connection.
    pub fn acquisition(error: MongoError) -> Self {
        Self {
            error,
            stage: FailureStage::Acquisition,
        }
    }

    /// A failure while sending the command or awaiting its reply.
    pub fn transmission(error: MongoError) -> Self {
        Self {
            error,
            stage: FailureStage::Transmission,
        }
    }
}

/// Outcome of one attempt as judged by the coordinator.
#[derive(Debug)]
pub enum AttemptResult<T> {
    /// The attempt succeeded.
    Success(T),
    /// The attempt failed and one more attempt will be made.
    RetryableFailure(MongoError),
    /// The operation failed; this is the error to surface.
    FinalFailure(MongoError),
}

/// Per-operation retry bookkeeping.
#[derive(Debug)]
pub struct RetryState {
    retryability: Retryability,
    attempt: Attempt,
    first_failure: Option<AttemptFailure>,
    txn_number: Option<i64>,
}

impl RetryState {
    /// State for the first attempt of an operation.
    pub fn new(retryability: Retryability) -> Self {
        let attempt = match retryability {
            Retryability::None => Attempt::Last,
            _ => Attempt::First,
        };
        Self {
            retryability,
            attempt,
            first_failure: None,
            txn_number: None,
        }
    }

    /// Whether no attempt has failed yet.
    pub fn is_first_attempt(&self) -> bool {
        self.first_failure.is_none()
    }

    /// Whether the current attempt is the last one.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt == Attempt::Last
    }

    /// Prevent any further retry.
    pub fn mark_last_attempt(&mut self) {
        self.attempt = Attempt::Last;
    }

    /// Check the selected server before sending, and pick the `txnNumber`.
    ///
    /// A server without retryable-write support turns the first attempt into
    /// the last one and sends no `txnNumber`. Discovering that only on the
    /// retry fails the attempt before anything is sent.
    pub fn prepare_attempt(
        &mut self,
        description: &ConnectionDescription,
        session: Option<&ClientSession>,
    ) -> Result<Option<i64>, AttemptFailure> {
        if self.retryability != Retryability::Write {
            return Ok(None);
        }
        if !description.supports_retryable_writes() {
            if self.is_first_attempt() {
                self.mark_last_attempt();
                return Ok(None);
            }
            return Err(AttemptFailure::acquisition(MongoError::illegal_state(
                "selected server does not support retryable writes",
            )));
        }
        if self.txn_number.is_none() {
            self.txn_number = session.map(ClientSession::next_txn_number);
        }
        Ok(self.txn_number)
    }

    /// Judge the outcome of an attempt.
    pub fn complete<T>(&mut self, outcome: Result<T, AttemptFailure>) -> AttemptResult<T> {
        let failure = match outcome {
            Ok(value) => return AttemptResult::Success(value),
            Err(failure) => failure,
        };

        if let Some(first) = self.first_failure.take() {
            return AttemptResult::FinalFailure(choose_error(first, failure));
        }

        if self.is_last_attempt() || !self.is_retryable(&failure.error) {
            return AttemptResult::FinalFailure(failure.error);
        }

        self.attempt = Attempt::Last;
        let error = failure.error.clone();
        self.first_failure = Some(failure);
        AttemptResult::RetryableFailure(error)
    }

    fn is_retryable(&self, error: &MongoError) -> bool {
        match self.retryability {
            Retryability::None => false,
            Retryability::Read => error.is_retryable_read(),
            Retryability::Write => error.is_retryable_write(),
        }
    }
}

/// Pick the error to surface after both attempts failed.
///
/// The retry's error wins only when both attempts reached the wire and the
/// server did not report that the retry wrote nothing.
fn choose_error(first: AttemptFailure, second: AttemptFailure) -> MongoError {
    if first.stage == FailureStage::Acquisition
        || second.stage == FailureStage::Acquisition
        || second.error.has_label(NO_WRITES_PERFORMED)
    {
        first.error
    } else {
        second.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ServerAddress, ServerType};
    use rstest::rstest;

    fn primary() -> ConnectionDescription {
        ConnectionDescription::new(ServerAddress::default(), ServerType::ReplicaSetPrimary)
    }

    fn standalone() -> ConnectionDescription {
        ConnectionDescription::new(ServerAddress::default(), ServerType::Standalone)
    }

    fn labelled(code: i32, label: &str) -> MongoError {
        MongoError::Command {
            code,
            code_name: String::new(),
            message: "retry failed".to_string(),
            labels: vec![label.to_string()],
        }
    }

    #[test]
    fn test_success_on_first_attempt() {
        let mut state = RetryState::new(Retryability::Write);
        assert!(matches!(state.complete(Ok(5)), AttemptResult::Success(5)));
    }

    #[test]
    fn test_network_error_is_retried_once() {
        let mut state = RetryState::new(Retryability::Write);
        let first = state.complete::<()>(Err(AttemptFailure::transmission(MongoError::network("reset"))));
        assert!(matches!(first, AttemptResult::RetryableFailure(_)));
        assert!(state.is_last_attempt());

        let second = state.complete::<()>(Err(AttemptFailure::transmission(MongoError::network("again"))));
        match second {
            AttemptResult::FinalFailure(err) => assert_eq!(err.to_string(), "network error: again"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[rstest]
    #[case(FailureStage::Acquisition, FailureStage::Transmission, "first")]
    #[case(FailureStage::Transmission, FailureStage::Acquisition, "first")]
    #[case(FailureStage::Acquisition, FailureStage::Acquisition, "first")]
    #[case(FailureStage::Transmission, FailureStage::Transmission, "second")]
    fn test_error_choice(
        #[case] first_stage: FailureStage,
        #[case] second_stage: FailureStage,
        #[case] expected: &str,
    ) {
        let mut state = RetryState::new(Retryability::Write);
        let first = AttemptFailure {
            error: MongoError::network("first"),
            stage: first_stage,
        };
        let second = AttemptFailure {
            error: MongoError::network("second"),
            stage: second_stage,
        };

        assert!(matches!(state.complete::<()>(Err(first)), AttemptResult::RetryableFailure(_)));
        match state.complete::<()>(Err(second)) {
            AttemptResult::FinalFailure(err) => {
                assert_eq!(err.to_string(), format!("network error: {expected}"))
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_no_writes_performed_keeps_first_error() {
        let mut state = RetryState::new(Retryability::Write);
        let _ = state.complete::<()>(Err(AttemptFailure::transmission(MongoError::network("first"))));
        let outcome = state.complete::<()>(Err(AttemptFailure::transmission(labelled(
            91,
            NO_WRITES_PERFORMED,
        ))));
        match outcome {
            AttemptResult::FinalFailure(err) => assert!(err.is_network_error()),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_command_errors_are_final() {
        let mut state = RetryState::new(Retryability::Write);
        let outcome = state.complete::<()>(Err(AttemptFailure::transmission(MongoError::command(
            11000,
            "duplicate key",
        ))));
        assert!(matches!(outcome, AttemptResult::FinalFailure(_)));
    }

    #[test]
    fn test_no_retryability_means_single_attempt() {
        let mut state = RetryState::new(Retryability::None);
        let outcome = state.complete::<()>(Err(AttemptFailure::transmission(MongoError::network("x"))));
        assert!(matches!(outcome, AttemptResult::FinalFailure(_)));
        assert_eq!(state.prepare_attempt(&primary(), None).unwrap(), None);
    }

    #[test]
    fn test_txn_number_is_stable_across_attempts() {
        let session = ClientSession::new(false);
        let mut state = RetryState::new(Retryability::Write);

        let first = state.prepare_attempt(&primary(), Some(&session)).unwrap();
        let _ = state.complete::<()>(Err(AttemptFailure::transmission(MongoError::network("x"))));
        let second = state.prepare_attempt(&primary(), Some(&session)).unwrap();

        assert_eq!(first, Some(1));
        assert_eq!(second, Some(1));
        assert_eq!(state.txn_number, Some(1));
        assert_eq!(session.txn_number(), 1);
    }

    #[test]
    fn test_standalone_disables_retry() {
        let session = ClientSession::new(false);
        let mut state = RetryState::new(Retryability::Write);

        assert_eq!(state.prepare_attempt(&standalone(), Some(&session)).unwrap(), None);
        assert!(state.is_last_attempt());
        let outcome = state.complete::<()>(Err(AttemptFailure::transmission(MongoError::network("x"))));
        assert!(matches!(outcome, AttemptResult::FinalFailure(_)));
        assert_eq!(session.txn_number(), 0);
    }

    #[test]
    fn test_retry_against_unsupported_server_surfaces_first_error() {
        let session = ClientSession::new(false);
        let mut state = RetryState::new(Retryability::Write);
        let _ = state.prepare_attempt(&primary(), Some(&session)).unwrap();
        let _ = state.complete::<()>(Err(AttemptFailure::transmission(MongoError::network("first"))));

        let failure = state.prepare_attempt(&standalone(), Some(&session)).unwrap_err();
        match state.complete::<()>(Err(failure)) {
            AttemptResult::FinalFailure(err) => assert_eq!(err.to_string(), "network error: first"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_read_retry_ignores_write_labels() {
        let mut state = RetryState::new(Retryability::Read);
        let outcome = state.complete::<()>(Err(AttemptFailure::transmission(labelled(
            112,
            "RetryableWriteError",
        ))));
        assert!(matches!(outcome, AttemptResult::FinalFailure(_)));
    }
}
