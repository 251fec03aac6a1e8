//! Pipeline orchestrator: classify, extract, sanitize, validate, repair
//! within a bounded budget, and fall back to a safety-mode bundle when
//! the budget is exhausted. An ingest never fails outright; degraded
//! results are reported through the submission status.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::config::AppConfig;
use crate::llm::{
    prompts, ChatClient, ChatMessage, ChatParams, ContentPart, LlmError, MAX_IMAGES_PER_CALL,
};

use super::fhir;
use super::firewall::{self, FirewallConfig};
use super::parser::{self, ParseOutcome};
use super::types::{
    ClassificationResult, Extraction, ExtractedPatient, Modality, SubmissionStatus,
    ValidationIssue,
};

/// One uploaded source document.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub filename: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// Result of one ingest run. `repair_notes` and timing are kept for the
/// audit log; they are not persisted.
#[derive(Debug)]
pub struct IngestOutcome {
    pub bundle: Value,
    pub raw_extraction: String,
    pub status: SubmissionStatus,
    pub modality: Modality,
    pub attempts: u32,
    pub repair_notes: Vec<String>,
    pub elapsed: Duration,
}

pub struct Pipeline {
    chat: Arc<dyn ChatClient>,
    config: Arc<AppConfig>,
}

impl Pipeline {
    pub fn new(chat: Arc<dyn ChatClient>, config: Arc<AppConfig>) -> Self {
        Self { chat, config }
    }

    fn chat_params(&self) -> ChatParams {
        ChatParams {
            temperature: 0.0,
            max_tokens: 2500,
            timeout: Duration::from_secs(self.config.llm_timeout_secs),
        }
    }

    /// Run the full pipeline for one submission.
    pub async fn ingest(&self, patient_id: &str, files: &[SourceFile]) -> IngestOutcome {
        let started = Instant::now();
        let classification = self.classify(files).await;
        let modality = classification.modality;
        tracing::info!(
            patient_id = %patient_id,
            modality = modality.as_str(),
            files = files.len(),
            "Starting extraction"
        );

        let firewall_config = FirewallConfig::from_app(&self.config);
        let mut attempts = 0u32;
        let mut raw_latest = String::new();
        let mut repair_notes: Vec<String> = Vec::new();
        let mut last_extraction: Option<Extraction> = None;
        let mut open_issues: Vec<ValidationIssue> = Vec::new();

        while attempts < self.config.max_attempts.max(1) {
            attempts += 1;
            let messages = if attempts == 1 {
                let mut parts = vec![ContentPart::text(prompts::extraction_prompt(modality))];
                parts.extend(image_parts(files));
                vec![ChatMessage::user(parts)]
            } else {
                // Repairs carry the prior output and the error list; the
                // images are already in the model's context window.
                vec![ChatMessage::user_text(prompts::repair_prompt(
                    &raw_latest,
                    &open_issues,
                ))]
            };

            let response = match self.chat.chat(&messages, &self.chat_params()).await {
                Ok(outcome) => outcome.text,
                Err(e) => {
                    tracing::warn!(error = %e, attempt = attempts, "Extraction call failed");
                    open_issues = vec![ValidationIssue::new(
                        "llm",
                        "upstream_error",
                        e.to_string(),
                    )];
                    continue;
                }
            };
            raw_latest = response;

            let mut issues;
            match parser::parse_llm_output(
                &raw_latest,
                modality,
                &self.config.thinking_open,
                &self.config.thinking_close,
            ) {
                ParseOutcome::Structured(extraction) => {
                    let sanitized = firewall::sanitize(extraction, &firewall_config);
                    repair_notes.extend(sanitized.notes);
                    let effective = sanitized.extraction.modality.unwrap_or(modality);
                    issues = firewall::check_completeness(
                        &sanitized.extraction,
                        effective,
                        &firewall_config,
                    );
                    last_extraction = Some(sanitized.extraction);
                }
                ParseOutcome::Raw(_) => {
                    issues = vec![ValidationIssue::new(
                        "output",
                        "unparseable",
                        "response was neither JSON nor a recognizable table",
                    )];
                }
            }

            if issues.is_empty() {
                let extraction = last_extraction
                    .as_ref()
                    .cloned()
                    .unwrap_or_default();
                let bundle = fhir::bundle_from_extraction(&extraction, patient_id);
                match fhir::validate_bundle_minimal(&bundle) {
                    None => {
                        tracing::info!(
                            patient_id = %patient_id,
                            attempts,
                            notes = repair_notes.len(),
                            "Extraction completed"
                        );
                        return IngestOutcome {
                            bundle,
                            raw_extraction: raw_latest,
                            status: SubmissionStatus::Completed,
                            modality,
                            attempts,
                            repair_notes,
                            elapsed: started.elapsed(),
                        };
                    }
                    Some(path) => {
                        issues.push(ValidationIssue::new(
                            path,
                            "invalid_bundle",
                            "assembled bundle failed minimal FHIR validation",
                        ));
                    }
                }
            }

            tracing::warn!(
                attempt = attempts,
                issues = issues.len(),
                "Extraction attempt rejected"
            );
            open_issues = issues;
        }

        self.fallback_outcome(
            patient_id,
            last_extraction,
            raw_latest,
            modality,
            attempts,
            repair_notes,
            started,
        )
    }

    /// Build the safety-mode outcome: whatever survived extraction plus
    /// a degraded-extraction annotation, or a patient-only bundle when
    /// nothing was usable.
    #[allow(clippy::too_many_arguments)]
    fn fallback_outcome(
        &self,
        patient_id: &str,
        last_extraction: Option<Extraction>,
        raw_extraction: String,
        modality: Modality,
        attempts: u32,
        mut repair_notes: Vec<String>,
        started: Instant,
    ) -> IngestOutcome {
        repair_notes.push("fallback_bundle_emitted".to_string());
        let detail = format!("extraction incomplete after {attempts} attempts");

        let (bundle, status) = match last_extraction {
            Some(extraction) if !extraction.is_empty() => {
                let mut bundle = fhir::bundle_from_extraction(&extraction, patient_id);
                fhir::append_degraded_note(&mut bundle, &detail);
                if fhir::validate_bundle_minimal(&bundle).is_some() {
                    bundle = fhir::fallback_bundle(&extraction.patient, patient_id, &detail);
                }
                (bundle, SubmissionStatus::Partial)
            }
            Some(extraction) if extraction.patient.has_name() => (
                fhir::fallback_bundle(&extraction.patient, patient_id, &detail),
                SubmissionStatus::Partial,
            ),
            _ => (
                fhir::fallback_bundle(&ExtractedPatient::default(), patient_id, &detail),
                SubmissionStatus::Failed,
            ),
        };

        tracing::warn!(
            patient_id = %patient_id,
            attempts,
            status = status.as_str(),
            "Falling back to safety-mode bundle"
        );
        IngestOutcome {
            bundle,
            raw_extraction,
            status,
            modality,
            attempts,
            repair_notes,
            elapsed: started.elapsed(),
        }
    }

    /// Single classification call over all images. Any upstream failure
    /// degrades to UNKNOWN; the pipeline continues with the lab prompt.
    async fn classify(&self, files: &[SourceFile]) -> ClassificationResult {
        let mut parts = vec![ContentPart::text(prompts::classification_prompt())];
        parts.extend(image_parts(files));
        let messages = vec![ChatMessage::user(parts)];

        match self.chat.chat(&messages, &self.chat_params()).await {
            Ok(outcome) => {
                let modality = Modality::from_label(outcome.text.trim());
                ClassificationResult {
                    modality,
                    confidence: 1.0,
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Classification failed, continuing as UNKNOWN");
                ClassificationResult {
                    modality: Modality::Unknown,
                    confidence: 0.0,
                }
            }
        }
    }

    /// Clinical synthesis over the stored bundle and the reviewer's
    /// notes. Regenerated on every call.
    pub async fn synthesize(
        &self,
        bundle: &Value,
        doctor_notes: &str,
    ) -> Result<String, LlmError> {
        let bundle_json = serde_json::to_string(bundle)
            .map_err(|e| LlmError::ResponseParsing(e.to_string()))?;
        let messages = vec![ChatMessage::user_text(prompts::synthesis_prompt(
            &bundle_json,
            doctor_notes,
        ))];
        let outcome = self.chat.chat(&messages, &self.chat_params()).await?;
        Ok(outcome.text.trim().to_string())
    }
}

fn image_parts(files: &[SourceFile]) -> Vec<ContentPart> {
    if files.len() > MAX_IMAGES_PER_CALL {
        tracing::warn!(
            files = files.len(),
            cap = MAX_IMAGES_PER_CALL,
            "Truncating image attachments"
        );
    }
    files
        .iter()
        .take(MAX_IMAGES_PER_CALL)
        .map(|f| ContentPart::image(&f.mime, &f.bytes))
        .collect()
}
