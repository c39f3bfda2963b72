//! Crate-wide error classification. Generalized from the teacher's
//! `lib.rs::ErrorClassification`/`Error` pair: each module keeps its own
//! `thiserror` enum, and implements this trait so the Retry Manager can
//! dispatch on any of them without knowing the concrete type.

/// Captures whether a failure is worth retrying. Errors caused by
/// corrupt/invalid input or a permanent precondition (bad config, circuit
/// open) are not retryable; I/O errors, timeouts and 5xx/429 responses are.
pub trait ErrorClassification {
    fn is_retryable(&self) -> bool;
}

/// The only caller-visible failure from [`crate::logger::Logger`]: a
/// submission made after [`crate::logger::Logger::close`] (or the owning
/// [`crate::shutdown::ShutdownCoordinator`]) has started tearing sinks down.
/// See `spec.md` §7.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("logger is closed, submissions are rejected")]
pub struct ShutdownError;
