//! Error types for parwork
//!
//! Every fault raised inside a worker is captured as a [`Failure`] record at
//! its origin and surfaced exactly once, as an [`AggregatedError`], at the
//! join point the caller is blocked on.

use std::fmt;

use thiserror::Error;

use crate::parallel::fork_join::NodePath;

/// All error types that can occur in parwork
#[derive(Debug, Clone, Error)]
pub enum ParallelError {
    /// Break requested after stop, or stop after break, on one loop state
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Every failure recorded during one execution call
    #[error("{0}")]
    Aggregation(AggregatedError),

    /// The call observed its cancellation token before finishing
    #[error("Operation was cancelled")]
    Cancelled,

    /// Caller supplied an argument outside the accepted domain
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Worker pool could not be built
    #[error("Worker pool error: {0}")]
    Pool(String),
}

/// Result type alias for parwork operations
pub type Result<T> = std::result::Result<T, ParallelError>;

/// Category of a recorded failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    InvalidTransition,
    ItemFailure,
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::InvalidTransition => write!(f, "invalid transition"),
            FailureKind::ItemFailure => write!(f, "item failure"),
            FailureKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Where a failure happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Loop or aggregation iteration index
    Index(usize),
    /// Tree node reached by a walk
    Node(NodePath),
    /// Position of an action or future in the submitted list
    Task(usize),
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Index(index) => write!(f, "index {index}"),
            Origin::Node(path) => write!(f, "node {path}"),
            Origin::Task(position) => write!(f, "task {position}"),
        }
    }
}

/// A single captured fault
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    pub origin: Origin,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>, origin: Origin) -> Self {
        Self {
            kind,
            message: message.into(),
            origin,
        }
    }

    /// Classify a callback error. Loop-state violations keep their kind,
    /// everything else is an item failure.
    pub fn from_callback(err: &anyhow::Error, origin: Origin) -> Self {
        match err.downcast_ref::<ParallelError>() {
            Some(ParallelError::InvalidTransition(message)) => {
                Self::new(FailureKind::InvalidTransition, message.clone(), origin)
            }
            Some(ParallelError::Cancelled) => Self::new(FailureKind::Cancelled, err.to_string(), origin),
            _ => Self::new(FailureKind::ItemFailure, format!("{err:#}"), origin),
        }
    }

    /// Build a failure from a caught panic payload
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>, origin: Origin) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            format!("panicked: {s}")
        } else if let Some(s) = payload.downcast_ref::<String>() {
            format!("panicked: {s}")
        } else {
            "panicked".to_string()
        };
        Self::new(FailureKind::ItemFailure, message, origin)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}: {}", self.kind, self.origin, self.message)
    }
}

/// Ordered collection of failures captured during one execution call.
///
/// Nested joins merge their children's collections with [`AggregatedError::absorb`],
/// so the list is already flat when it reaches the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatedError {
    failures: Vec<Failure>,
}

impl AggregatedError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(failure: Failure) -> Self {
        Self {
            failures: vec![failure],
        }
    }

    pub fn push(&mut self, failure: Failure) {
        self.failures.push(failure);
    }

    /// Move every failure of `other` to the end of this collection
    pub fn absorb(&mut self, other: AggregatedError) {
        self.failures.extend(other.failures);
    }

    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    pub fn into_failures(self) -> Vec<Failure> {
        self.failures
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// First recorded failure of the given kind
    pub fn first_of(&self, kind: FailureKind) -> Option<&Failure> {
        self.failures.iter().find(|f| f.kind == kind)
    }

    /// Failures sorted by origin for stable reporting
    pub fn sorted(mut self) -> Self {
        self.failures.sort_by_key(|f| match &f.origin {
            Origin::Index(i) => (0, *i, String::new()),
            Origin::Task(i) => (1, *i, String::new()),
            Origin::Node(path) => (2, path.depth(), path.to_string()),
        });
        self
    }

    pub(crate) fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(ParallelError::Aggregation(self))
        }
    }
}

impl fmt::Display for AggregatedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "One or more errors occurred ({} failure", self.failures.len())?;
        if self.failures.len() != 1 {
            write!(f, "s")?;
        }
        write!(f, ")")?;
        for failure in &self.failures {
            write!(f, "\n  - {failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregatedError {}

impl From<Failure> for AggregatedError {
    fn from(failure: Failure) -> Self {
        Self::single(failure)
    }
}

impl ParallelError {
    /// Aggregated failures carried by this error, if any
    pub fn aggregated(&self) -> Option<&AggregatedError> {
        match self {
            ParallelError::Aggregation(agg) => Some(agg),
            _ => None,
        }
    }
}
