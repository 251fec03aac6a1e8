pub mod fhir;
pub mod firewall;
pub mod orchestrator;
pub mod parser;
pub mod types;

pub use orchestrator::{IngestOutcome, Pipeline, SourceFile};
pub use types::{Modality, SubmissionStatus};
