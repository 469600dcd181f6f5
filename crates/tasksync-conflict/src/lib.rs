//! TaskSync Conflict - Conflict detection and resolution
//!
//! Provides:
//! - Value-and-timestamp conflict detection (pure, no I/O)
//! - Resolution policies: automatic last-writer-wins and manual choices
//! - A resolver that settles operations and their entity writes in one commit
//! - The manual resolution use case driven by a `ConflictResolutionRequest`

pub mod detector;
pub mod error;
pub mod policy;
pub mod resolver;
pub mod use_cases;

pub use detector::{ConflictDetector, DetectionOutcome};
pub use error::ConflictError;
pub use policy::ResolutionPolicy;
pub use resolver::{AppliedResolution, ConflictResolver, MAX_COMMIT_ATTEMPTS};
pub use use_cases::ResolveConflictUseCase;
