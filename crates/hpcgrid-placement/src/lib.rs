//! HPCGrid scheduling engine — cluster scoring and scheduling decisions.
//!
//! This crate chooses the cluster a job should run on. It does NOT place
//! the job (that is the routing enforcer's approval plus the keeper's
//! capacity allocation). Instead, it scores candidate clusters and emits an
//! immutable `SchedulingDecision` that routing later checks placements
//! against.
//!
//! # Components
//!
//! - **`scorer`** — Candidate filtering and integer weighted scoring
//!   (proximity, price against budget, reliability)
//! - **`scheduler`** — Deterministic ranking and decision construction
//! - **`convert`** — Conversions from state store types

pub mod convert;
pub mod error;
pub mod scheduler;
pub mod scorer;

pub use convert::{job_to_request, load_candidates};
pub use error::{PlacementError, PlacementResult};
pub use scheduler::{DecisionMeta, Scheduler};
pub use scorer::{ClusterCandidate, ClusterScore, PlacementRequest, ScoreBreakdown, score_candidate};
