// ============================================================================
// Linting
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // All public items must be documented
#![warn(unused_imports)]              // Unused imports
#![warn(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(nonstandard_style)]           // Non-standard code style is forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Converge
//!
//! A declarative, idempotent reconciliation engine for remote resources.
//!
//! ## Overview
//!
//! Converge takes a desired-state document describing typed resources and
//! the references between them, and drives remote APIs until they match:
//!
//! - Resource types are registered with a schema and CRUD operations
//! - References between resources form a dependency graph
//! - Read-only data sources are looked up on every plan
//! - Plans diff the graph against versioned, last-known state
//! - Plans apply concurrently, dependencies first, with retries
//! - Results can be verified, refreshed, imported and destroyed
//!
//! ## Architecture
//!
//! 1. **Desired State**: a YAML document of `{ type, name, attributes }` blocks
//! 2. **Recorded State**: the last observed remote state, in a [`state::StateStore`]
//! 3. **Reconciler**: plans the difference and applies it
//!
//! ## Modules
//!
//! - [`registry`]: Resource schemas and remote operations
//! - [`graph`]: Document parsing, validation and dependency ordering
//! - [`planner`]: Diffing, plans and the concurrent apply executor
//! - [`state`]: Versioned state storage backends (memory, local file)
//! - [`reconciler`]: Plan/apply orchestration, refresh, import and drift
//! - [`verify`]: Post-apply remote checks
//! - [`config`]: Engine configuration
//! - [`report`]: Text and JSON rendering
//!
//! ## Example
//!
//! ```yaml
//! resources:
//!   - type: kx_environment
//!     name: env
//!     attributes:
//!       name: acceptance-env
//!   - type: kx_database
//!     name: db
//!     attributes:
//!       name: acceptance-db
//!       environment_id: ${kx_environment.env.id}
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod config;
pub mod error;
pub mod graph;
pub mod planner;
pub mod reconciler;
pub mod registry;
pub mod report;
pub mod state;
pub mod telemetry;
pub mod verify;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{ConfigParser, ConfigValidator, EngineConfig};
pub use error::{ConvergeError, ErrorKind, Result};
pub use graph::{DependencyGraph, DesiredStateDocument, DocumentParser, GraphBuilder};
pub use planner::{
    ApplyOutcome, ApplyReport, ChangeAction, FailurePolicy, Plan, PlanExecutor, Planner,
    RetryPolicy,
};
pub use reconciler::{DriftReport, Reconciler, RefreshReport};
pub use registry::{
    DataSourceOperations, ExecutionContext, MemoryDataSource, MemoryProvider, RemoteObject,
    RemoteOperations, ResourceRegistry, ResourceSchema,
};
pub use report::{OutputFormat, OutputFormatter};
pub use state::{LocalStateStore, MemoryStateStore, RemoteStateRecord, ResourceAddress, StateStore};
pub use verify::Verifier;
