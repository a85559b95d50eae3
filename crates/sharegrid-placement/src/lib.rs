//! sharegrid peer selection: decides which storage server receives
//! which share of an upload, and proves the result is "happy".
//!
//! Happiness is the size of a maximum matching between shares and the
//! servers holding (or about to hold) them: the number of servers that
//! can be shown to each hold a distinct share at the same time.
//!
//! # Components
//!
//! - **`matcher`**: maximum bipartite matching (iterative Kuhn)
//! - **`graph`**: share/server graph with existing and tentative edges
//! - **`negotiator`**: per-server reserve/write/close/abort with fault classification
//! - **`selector`**: query, plan, negotiate, re-plan
//! - **`outcome`**: placement plans and failure diagnostics
//!
//! # Flow
//!
//! ```text
//! ServerSelector::select_and_place
//!   ├── query every candidate (concurrent, timeout-bounded) → ServerRecord
//!   ├── baseline matching over existing shares
//!   ├── greedy extension: unplaced shares, then unmatched shares to idle servers
//!   ├── matching over existing + tentative
//!   ├── reserve on every server (joined) → re-plan on rejection
//!   ├── write every reserved share (joined) → re-plan on rejection
//!   └── close everything → plan; any failure before this aborts all buckets
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod matcher;
pub mod negotiator;
pub mod outcome;
pub mod selector;
pub mod types;

pub use config::SelectorConfig;
pub use error::{PlacementError, PlacementResult};
pub use graph::{EdgeKind, PlacementGraph};
pub use matcher::{Matching, maximum_matching};
pub use negotiator::{AllocationNegotiator, RejectReason, ReserveOutcome, ServerFault};
pub use outcome::{Diagnostics, Outcome, PlacementPlan, ServerCounts};
pub use selector::ServerSelector;
pub use types::{Candidate, EncodingParams, ServerRank, ServerRecord, ServerState, UploadParams};
