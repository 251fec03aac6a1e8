//! Prompt builders for every pipeline stage. All builders are pure
//! `context -> String` functions; the orchestrator attaches images.

use crate::pipeline::types::{Modality, ValidationIssue};

/// Classifier: one uppercase token, nothing else.
pub fn classification_prompt() -> String {
    "Analyze the attached medical document image(s). Classify the document type.\n\
     Return EXACTLY one of these tokens and nothing else:\n\
     LAB\n\
     RADIOLOGY\n\
     PRESCRIPTION\n\
     VITALS\n\
     \n\
     Rules:\n\
     - Tabular blood test results: LAB.\n\
     - A scan, or findings about Lungs/Heart/Bones/Pleura: RADIOLOGY.\n\
     - A list of drugs with dosage: PRESCRIPTION.\n\
     - Heart rate, blood pressure, temperature, SpO2 readings: VITALS.\n\
     - Output the single token only. No markdown, no explanation."
        .to_string()
}

/// Select the extraction prompt for a modality. UNKNOWN falls back to
/// the lab prompt, which tolerates the widest range of tabular input.
pub fn extraction_prompt(modality: Modality) -> String {
    match modality {
        Modality::Radiology => radiology_prompt(),
        Modality::Prescription => prescription_prompt(),
        Modality::Vitals => vitals_prompt(),
        Modality::Lab | Modality::Unknown => lab_prompt(),
    }
}

fn lab_prompt() -> String {
    "You are an expert medical OCR assistant. Extract the lab results from this image \
     into STRICT TSV (tab separated values). No markdown, no commentary.\n\
     \n\
     1. METADATA: first, emit these lines when visible in the report:\n\
     PATIENT_NAME: <full name>\n\
     PATIENT_ID: <id or MRN>\n\
     REPORT_DATE: <date>\n\
     \n\
     2. TABLE: one row per test, tab-separated, with this exact header:\n\
     TEST\tVALUE\tUNIT\tRANGE\tFLAG\n\
     - VALUE holds the number only; strip units and flags from it.\n\
     - RANGE is the reference range exactly as printed (e.g. 13.0-17.0).\n\
     - FLAG is H or L when the report marks the result, otherwise empty.\n\
     \n\
     Example rows (CBC with Differential):\n\
     TEST\tVALUE\tUNIT\tRANGE\tFLAG\n\
     Hemoglobin\t13.2\tg/dL\t13.0-17.0\t\n\
     WBC Count\t11200\t/uL\t4000-11000\tH\n\
     Neutrophils\t62\t%\t40-80\t\n\
     Platelet Count\t250\t10^3/uL\t150-450\t\n\
     \n\
     CRITICAL:\n\
     - Extract ONLY text visible in the image. Never reuse example values.\n\
     - Include every row of the table, including the Differential section.\n\
     - Leave unknown fields empty; do not invent values."
        .to_string()
}

fn radiology_prompt() -> String {
    "You are a senior radiologist. Provide a structured reading of this scan as STRICT TSV.\n\
     \n\
     Header: FINDING\tVALUE\tFLAG\n\
     - One row per anatomical region (Lungs, Heart, Pleura, Bones, ...).\n\
     - VALUE is the narrative finding for that region, as free text.\n\
     - FLAG is H for an abnormal finding, empty otherwise.\n\
     - The LAST row must be IMPRESSION with the overall diagnostic impression.\n\
     \n\
     Metadata lines before the table when visible:\n\
     PATIENT_NAME: <name>\n\
     \n\
     Example structure:\n\
     FINDING\tVALUE\tFLAG\n\
     Lungs\tPatchy opacities in the right lower lobe\tH\n\
     Heart\tNormal cardiac silhouette\t\n\
     IMPRESSION\tRight lower lobe pneumonia\tH\n\
     \n\
     Extract only what the scan and its printed report support. No markdown."
        .to_string()
}

fn prescription_prompt() -> String {
    "You are an expert pharmacist. Extract the medication list from this prescription.\n\
     \n\
     Return a JSON array, one object per drug:\n\
     [{\"medication\": \"Amoxicillin 500mg\", \"dosage\": \"1 tab\", \
     \"frequency\": \"bid\", \"duration\": \"7 days\"}]\n\
     \n\
     Rules:\n\
     - Preserve frequency wording verbatim (\"bid\", \"twice daily\", \"TID\").\n\
     - Include dosage strength with the medication name when printed that way.\n\
     - Use null for fields not visible on the prescription.\n\
     - Output the JSON array only. Never invent drugs."
        .to_string()
}

fn vitals_prompt() -> String {
    "Extract the vital signs from this sheet into STRICT TSV. No markdown.\n\
     \n\
     Header: TEST\tVALUE\tUNIT\tRANGE\tFLAG\n\
     Recognized vitals: HR, BP, Temp, SpO2, BMI, Weight, Height, RR.\n\
     - BP stays as printed (e.g. 120/80) in VALUE with unit mmHg.\n\
     - Leave RANGE and FLAG empty unless the sheet prints them.\n\
     \n\
     Example:\n\
     TEST\tVALUE\tUNIT\tRANGE\tFLAG\n\
     Heart Rate\t72\tbpm\t\t\n\
     BP\t120/80\tmmHg\t\t\n\
     \n\
     Extract only readings visible on the sheet."
        .to_string()
}

/// Repair pass: prior output plus the machine-readable error list.
/// Images are deliberately not re-sent; the model corrects its own text.
pub fn repair_prompt(prev_output: &str, issues: &[ValidationIssue]) -> String {
    let errors = if issues.is_empty() {
        "- unknown error".to_string()
    } else {
        issues
            .iter()
            .map(|i| format!("- {} [{}]: {}", i.path, i.code, i.message))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "The previous extraction was invalid or incomplete. Fix it and re-emit the FULL \
         corrected output in the same format (TSV table or JSON array) with no commentary.\n\
         Do not ask for the image again; rely on your previous reading.\n\
         Carry PATIENT_NAME / PATIENT_ID / REPORT_DATE lines forward unchanged if present.\n\
         Include every data row; never emit placeholder or example values.\n\
         \n\
         Errors to fix:\n{errors}\n\
         \n\
         Previous output:\n{prev_output}"
    )
}

/// Clinical synthesis: bundle JSON plus the reviewer's notes, rendered
/// as markdown with fixed section headings.
pub fn synthesis_prompt(bundle_json: &str, doctor_notes: &str) -> String {
    let notes_block = if doctor_notes.trim().is_empty() {
        String::new()
    } else {
        format!("DOCTOR'S NOTES:\n{doctor_notes}\n\n")
    };
    format!(
        "You are an expert medical consultant. Below is a FHIR bundle extracted from a \
         clinical document, followed by the reviewing clinician's notes (if any).\n\
         \n\
         FHIR BUNDLE:\n{bundle_json}\n\
         \n\
         {notes_block}\
         Produce a structured markdown summary with exactly these H2 sections:\n\
         ## Findings — key values and abnormalities from the bundle.\n\
         ## Correlations — how the findings and the notes relate; note agreements \
         and contradictions.\n\
         ## Recommendations — one or two follow-up actions or tests, if warranted.\n\
         \n\
         Be concise and factual. Do not restate the raw JSON."
    )
}
