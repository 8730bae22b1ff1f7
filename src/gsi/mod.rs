//! Layers 3-6: Global single instance protocol
//!
//! - `precedence`, `response`, `outcome`: race-breaking order, wire replies
//!   and the aggregation of replies into a decision
//! - `registrar`, `registrar_manager`: registration strategies
//! - `endpoint`: the per-silo service answering other clusters
//! - `maintainer`: the background reconciliation agent

pub mod endpoint;
pub mod maintainer;
pub mod outcome;
pub mod precedence;
pub mod registrar;
pub mod registrar_manager;
pub mod response;

pub use endpoint::{ClusterGrainDirectory, EndpointOptions};
pub use maintainer::{
    ActivationCatalog, ActivationMaintainer, ChannelActivationCatalog, DeactivationRequest,
    MaintenanceReport,
};
pub use outcome::{ActivationOutcome, ResponseTracker};
pub use precedence::precedes;
pub use registrar::{
    ClusterLocalRegistrar, GlobalSingleInstanceRegistrar, GsiOptions, Registrar,
    RegistrationStrategy,
};
pub use registrar_manager::RegistrarManager;
pub use response::{ActivationResponseStatus, RemoteClusterActivationResponse};
