//! # Virtual Cluster Engine
//!
//! An in-memory stand-in for a container cluster. Manifests are parsed into
//! simulated resources that move from Pending to Running or Failed on their own
//! timers, and every tick produces synthetic service telemetry shaped by time
//! of day, noise and transient incidents.
//!
//! ## Features
//!
//! - **Manifest parsing**: multi-document YAML into resource declarations
//! - **Lifecycle simulation**: per-resource completion timers with a configurable failure rate
//! - **Telemetry synthesis**: per-service CPU, memory, disk, network and request metrics
//! - **Incidents**: stochastic or operator-injected faults that scale metrics for a while
//! - **SLA tracking**: availability over a sliding window of cluster health
//! - **Streaming**: snapshot fan-out to subscribers over newline-delimited JSON
//!
//! ## Quick Start
//!
//! ```no_run
//! use vcluster::{ClusterEngine, EngineConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = ClusterEngine::new(EngineConfig::default())?;
//! engine.start()?;
//!
//! let summary = engine.deploy("kind: Deployment\nmetadata:\n  name: web\nspec:\n  replicas: 2\n")?;
//! println!("accepted {} resources", summary.deployed_count);
//!
//! let snapshot = engine.get_snapshot()?;
//! println!("cluster health: {:?}", snapshot.summary.overall_health);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`engine`] - Owned engine instance, tick driver and query surface
//! - [`manifest`] / [`resources`] / [`store`] - Declarations and the resource map
//! - [`lifecycle`] - Pending → Running/Failed simulation
//! - [`baseline`] / [`traffic`] / [`incidents`] / [`telemetry`] - Metric synthesis
//! - [`sla`] - Availability aggregation
//! - [`hub`] / [`protocol`] / [`server`] - Subscriber fan-out and the wire surface

pub mod baseline;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod export;
pub mod hub;
pub mod incidents;
pub mod lifecycle;
pub mod manifest;
pub mod protocol;
pub mod random;
pub mod resources;
pub mod server;
pub mod sla;
pub mod store;
pub mod telemetry;
pub mod traffic;

// Re-export main public types for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::{ClusterEngine, DeleteReport, DeleteStatus, EngineStatus};
pub use error::{ConfigError, EngineError, EngineResult};
pub use protocol::{Command, CommandResponse, CommandType};
pub use random::{FixedRandom, RandomSource, SeededRandom};
pub use resources::{ResourceKind, ResourceStatus, SimulatedResource};
pub use server::ClusterServer;
pub use telemetry::{HealthStatus, MetricSnapshot};
