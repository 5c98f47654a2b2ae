use futures::future::BoxFuture;

use crate::envelope::{SpecialistOutputs, StageResult};
use crate::error::Result;
use crate::types::{CampaignContext, Stage};

/// A specialist stage: the only contract the orchestration core needs from
/// the content, design, pricing and delivery collaborators.
///
/// A worker reads the current context plus every prior stage's outputs and
/// returns its own deliverables. It must not write handoff files itself.
pub trait StageWorker: Send + Sync + 'static {
    /// Which stage this worker implements.
    fn stage(&self) -> Stage;

    /// Perform the stage's work.
    fn run<'a>(
        &'a self,
        context: &'a CampaignContext,
        prior_outputs: &'a SpecialistOutputs,
    ) -> BoxFuture<'a, Result<StageResult>>;

    /// Soft timeout in seconds for one run (0 = unbounded).
    fn timeout_secs(&self) -> u64 {
        0
    }
}
