//! Signal ensemble
//!
//! Turns heterogeneous model outputs into one consensus decision per
//! instrument: sources are polled concurrently under per-source timeouts,
//! their raw outputs normalized against a declared schema, and the
//! surviving votes aggregated by simple majority, weighted score or
//! unanimity.

pub mod collector;
pub mod normalizer;
pub mod voter;

pub use collector::{CollectedVotes, SignalCollector, SourceConfig};
pub use normalizer::normalize;
pub use voter::{EnsembleConfig, EnsembleVoter, ScoreBreakdown, VotingMode};
