pub mod config;
pub mod dataset;
pub mod error;
pub mod manifest;
pub mod model;
pub mod observability;
pub mod pipeline;
pub mod resolver;
pub mod run_state;
pub mod server;
pub mod serving;
pub mod source;
pub mod stages;
pub mod store;
pub mod timestamp;

pub use config::{Config, Schema};
pub use error::{PipelineError, ResolveError, ServeError, StageError};
pub use pipeline::{PipelineOrchestrator, RunReport, RunStatus};
pub use resolver::{ModelResolver, ModelVersion};
pub use run_state::{RunPermit, RunState};
pub use serving::Predictor;
pub use stages::{Stage, StageArtifact, StageInput, StageKind, StageRegistry};
pub use store::{ArtifactStore, RunDirectory};
pub use timestamp::Timestamp;
