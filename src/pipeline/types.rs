use serde::{Deserialize, Serialize};

/// Document modality decided by the classifier pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Lab,
    Radiology,
    Prescription,
    Vitals,
    Unknown,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Lab => "LAB",
            Modality::Radiology => "RADIOLOGY",
            Modality::Prescription => "PRESCRIPTION",
            Modality::Vitals => "VITALS",
            Modality::Unknown => "UNKNOWN",
        }
    }

    /// Classify a raw model label. Substring matching tolerates chatty
    /// responses like "This is a RADIOLOGY_REPORT (chest X-ray)".
    pub fn from_label(label: &str) -> Modality {
        let upper = label.to_uppercase();
        if upper.contains("RADIOLOGY")
            || upper.contains("X-RAY")
            || upper.contains("XRAY")
            || upper.contains("MRI")
            || upper.contains("ULTRASOUND")
        {
            Modality::Radiology
        } else if upper.contains("PRESCRIPTION") || upper.contains("MEDICATION") {
            Modality::Prescription
        } else if upper.contains("VITALS") || upper.contains("VITAL") {
            Modality::Vitals
        } else if upper.contains("LAB") {
            Modality::Lab
        } else {
            Modality::Unknown
        }
    }

    /// FHIR observation category code for this modality.
    pub fn category_code(&self) -> &'static str {
        match self {
            Modality::Radiology => "imaging",
            Modality::Vitals => "vital-signs",
            _ => "laboratory",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassificationResult {
    pub modality: Modality,
    pub confidence: f32,
}

/// Abnormality flag on a row: high, low, or within range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Flag {
    H,
    L,
    N,
}

impl Flag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Flag::H => "H",
            Flag::L => "L",
            Flag::N => "N",
        }
    }

    /// Parse loose flag spellings from model output.
    pub fn from_label(label: &str) -> Option<Flag> {
        let cleaned = label
            .trim()
            .trim_matches(['[', ']', '*'])
            .to_uppercase();
        match cleaned.as_str() {
            "H" | "HI" | "HIGH" | "A" | "ABN" | "ABNORMAL" => Some(Flag::H),
            "L" | "LO" | "LOW" => Some(Flag::L),
            "N" | "NORMAL" => Some(Flag::N),
            _ => None,
        }
    }
}

/// A row value: numeric when the cell parses as a number, text otherwise
/// (radiology findings, "Positive", blood pressure "120/80").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RowValue {
    Number(f64),
    Text(String),
}

impl RowValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            RowValue::Number(n) => Some(*n),
            RowValue::Text(_) => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, RowValue::Number(_))
    }
}

/// One extracted observation row, before FHIR assembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRow {
    pub test_name: String,
    pub value: RowValue,
    pub unit: Option<String>,
    pub ref_low: Option<f64>,
    pub ref_high: Option<f64>,
    /// Free-text range when low/high did not parse ("< 5.0", "negative").
    pub ref_text: Option<String>,
    pub flag: Option<Flag>,
    /// Row index in the raw table, for audit.
    pub source_row: Option<usize>,
}

impl ExtractedRow {
    pub fn new(test_name: impl Into<String>, value: RowValue) -> Self {
        Self {
            test_name: test_name.into(),
            value,
            unit: None,
            ref_low: None,
            ref_high: None,
            ref_text: None,
            flag: None,
            source_row: None,
        }
    }
}

/// One prescription line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicationRow {
    pub medication: String,
    #[serde(default)]
    pub dosage: Option<String>,
    #[serde(default)]
    pub frequency: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
}

/// Patient identity as extracted from the document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedPatient {
    /// Raw name before the identity-cleanup rewrite.
    pub name: Option<String>,
    pub given: Vec<String>,
    pub family: Option<String>,
    pub identifier: Option<String>,
}

impl ExtractedPatient {
    pub fn has_name(&self) -> bool {
        !self.given.is_empty()
            || self.family.is_some()
            || self.name.as_deref().is_some_and(|n| !n.trim().is_empty())
    }
}

/// Full structured extraction for one submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub patient: ExtractedPatient,
    pub rows: Vec<ExtractedRow>,
    pub medications: Vec<MedicationRow>,
    pub report_date: Option<String>,
    pub modality: Option<Modality>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.medications.is_empty()
    }
}

/// Machine-readable validation failure, fed back to the repair prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub path: String,
    pub code: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(
        path: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Terminal status of a persisted submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Completed,
    Failed,
    Partial,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Completed => "completed",
            SubmissionStatus::Failed => "failed",
            SubmissionStatus::Partial => "partial",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "completed" => Some(SubmissionStatus::Completed),
            "failed" => Some(SubmissionStatus::Failed),
            "partial" => Some(SubmissionStatus::Partial),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modality_from_chatty_labels() {
        assert_eq!(Modality::from_label("LAB_REPORT"), Modality::Lab);
        assert_eq!(
            Modality::from_label("This looks like a RADIOLOGY report (chest X-ray)"),
            Modality::Radiology
        );
        assert_eq!(Modality::from_label("PRESCRIPTION"), Modality::Prescription);
        assert_eq!(Modality::from_label("vitals sheet"), Modality::Vitals);
        assert_eq!(Modality::from_label("shrug"), Modality::Unknown);
    }

    #[test]
    fn radiology_wins_over_lab_in_mixed_labels() {
        // "X-RAY LAB" mentions both; imaging keywords take priority.
        assert_eq!(Modality::from_label("X-RAY LAB"), Modality::Radiology);
    }

    #[test]
    fn flag_parses_loose_spellings() {
        assert_eq!(Flag::from_label("High"), Some(Flag::H));
        assert_eq!(Flag::from_label("[L]"), Some(Flag::L));
        assert_eq!(Flag::from_label(" normal "), Some(Flag::N));
        assert_eq!(Flag::from_label(""), None);
        assert_eq!(Flag::from_label("??"), None);
    }

    #[test]
    fn category_codes() {
        assert_eq!(Modality::Lab.category_code(), "laboratory");
        assert_eq!(Modality::Radiology.category_code(), "imaging");
        assert_eq!(Modality::Vitals.category_code(), "vital-signs");
        assert_eq!(Modality::Unknown.category_code(), "laboratory");
    }

    #[test]
    fn status_round_trips() {
        for s in [
            SubmissionStatus::Completed,
            SubmissionStatus::Failed,
            SubmissionStatus::Partial,
        ] {
            assert_eq!(SubmissionStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(SubmissionStatus::parse("bogus"), None);
    }

    #[test]
    fn row_value_numeric_accessor() {
        assert_eq!(RowValue::Number(4.2).as_number(), Some(4.2));
        assert_eq!(RowValue::Text("positive".into()).as_number(), None);
    }
}
