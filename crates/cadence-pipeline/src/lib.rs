pub mod builder;
pub mod context;
pub mod continuity;
pub mod handoff_log;
pub mod io;
pub mod metrics_store;
pub mod monitor;
pub mod orchestrator;
pub mod path;
pub mod store;
pub mod validator;

pub use builder::{BuiltHandoff, HandoffBuilder};
pub use context::{CampaignRequest, ContextManager, RequestIdentity};
pub use continuity::ContinuityAnalyzer;
pub use handoff_log::HandoffLogger;
pub use metrics_store::MetricsStore;
pub use monitor::{summarize_records, HandoffMonitor};
pub use orchestrator::{Advance, CampaignPipeline, HaltReport, RunReport};
pub use path::{CampaignPathResolver, PathShape, ResolvedPath};
pub use store::{CampaignStore, HandoffLock, LockInfo};
pub use validator::HandoffValidator;
