//! Deterministic experiment assignment, targeting and statistics for prompt experiments.
//!
//! # Overview
//!
//! An [`Experiment`] compares a control prompt configuration against one or more treatments.
//! [`AssignmentEngine`] buckets an [`ExperimentContext`] (a session, optionally a user and device)
//! into one of its variants. Assignment is a pure function of the experiment and the context's
//! identity: the same inputs yield the same variant across calls and process restarts. Targeting
//! rules ([`targeting`]) and reusable user segments ([`segments`]) decide eligibility.
//!
//! Outcomes are recorded as [`events::ExperimentEvent`]s through an [`events::EventStore`].
//! [`statistics::StatisticsEngine`] turns per-variant conversion counts into Wilson intervals,
//! z-tests and chi-square tests against the control and declares a winner once every comparison
//! is significant. It also sizes experiments before they start.
//!
//! [`ExperimentClient`] wires everything together with a [`BackendClient`] that fetches
//! experiment definitions over HTTP and an [`experiment_store::ExperimentStore`] that caches them.
//!
//! # Error Handling
//!
//! Assignment never fails: evaluation errors fall back to the control variant and are logged.
//! Errors of I/O and configuration are represented by the [`Error`] enum.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate with structured key-values
//! under the `experiments` target. Consider integrating a `log`-compatible logger implementation
//! for better visibility into assignment decisions.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod assignment;
mod assignment_cache;
pub mod backend;
mod client;
mod config;
mod context;
mod error;
pub mod events;
mod experiment;
pub mod experiment_store;
mod feature_flag;
pub mod rules;
pub mod segments;
pub mod sharder;
pub mod statistics;
pub mod targeting;

pub use assignment::AssignmentEngine;
pub use assignment_cache::AssignmentCache;
pub use backend::{BackendClient, VariantPerformance};
pub use client::ExperimentClient;
pub use config::EngineConfig;
pub use context::{ExperimentContext, Location, Metadata};
pub use error::{Error, Result};
pub use experiment::{
    AllocationStrategy, AssignmentReason, Experiment, ExperimentAssignment, ExperimentStatus,
    ExperimentVariant, GeographicTargeting, TargetAudience,
};
pub use feature_flag::FeatureFlag;
pub use segments::UserSegment;
pub use statistics::{ExperimentResult, ExperimentStatistics, InsufficientData, StatisticsEngine};

/// Point in time used for assignment and event timestamps.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
