pub mod config;
pub mod envelope;
pub mod error;
pub mod event;
pub mod metadata;
pub mod metrics;
pub mod report;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use envelope::{HandoffEnvelope, SpecialistOutputs, StageOutput, StageResult};
pub use error::{CadenceError, Result};
pub use event::{EventBus, PipelineEvent};
pub use metadata::{CampaignMetadata, CampaignStatus};
pub use metrics::{HandoffMetrics, HandoffSummary};
pub use report::{ContinuityReport, ValidationLayer, ValidationResult};
pub use traits::StageWorker;
pub use types::*;
