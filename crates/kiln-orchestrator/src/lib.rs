//! Pipeline step sequencing for Kiln.
//!
//! Runs checkout, image build, optional test stages and artifact export as
//! one linear sequence per trigger event. A failed step stops the run.

pub mod orchestrator;

pub use orchestrator::{PipelineEvent, PipelineOrchestrator, PipelineResult};
