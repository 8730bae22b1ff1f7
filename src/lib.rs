pub mod config;
pub mod directory;
pub mod errors;
pub mod federation;
pub mod gsi;
pub mod logging;
pub mod runtime;
pub mod transport;

pub use config::{DirectoryConfig, MultiClusterOptions};
pub use directory::{
    ActivationAddress, ActivationId, ClusterId, DirectoryEntryStatus, GrainId, HostId,
    UnregistrationCause,
};
pub use errors::{ConfigError, DirectoryError, TransportError};
pub use federation::{InMemoryMultiClusterOracle, MultiClusterConfiguration, MultiClusterOracle};
pub use gsi::{
    precedes, ActivationMaintainer, ActivationOutcome, GlobalSingleInstanceRegistrar,
    RegistrationStrategy, RemoteClusterActivationResponse,
};
pub use runtime::{oracle_from_config, DirectoryRuntime};
