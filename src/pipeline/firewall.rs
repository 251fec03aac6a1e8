//! Semantic firewall: deterministic rewrites that enforce medical axioms
//! on model output before FHIR assembly. Each rewrite records a repair
//! note for the audit trail. Rewrites are idempotent: running the
//! firewall on its own output changes nothing.

use crate::config::AppConfig;
use crate::terminology;

use super::parser::is_section_banner;
use super::types::{
    Extraction, ExtractedRow, Flag, Modality, RowValue, ValidationIssue,
};

/// Names that are prompt-example artifacts, never real tests.
const PLACEHOLDER_TESTS: &[&str] = &["test name", "<test name>", "example", "sample"];

/// Name spellings that mean "no patient name was readable".
const PLACEHOLDER_NAMES: &[&str] = &["unknown", "na", "n/a", "none", "<empty>", "not found"];

/// Honorifics stripped from patient names.
const HONORIFICS: &[&str] = &[
    "dr", "dr.", "mr", "mr.", "mrs", "mrs.", "ms", "ms.", "md", "m.d.", "phd", "ph.d.",
];

/// MPV plausible range (fL) and platelet count plausible range (10^3/uL),
/// used by the swap detector.
const MPV_RANGE: (f64, f64) = (6.0, 12.0);
const PLATELET_RANGE: (f64, f64) = (150.0, 450.0);

/// Subset of `AppConfig` the firewall consults.
#[derive(Debug, Clone)]
pub struct FirewallConfig {
    pub strict_extraction: bool,
    pub require_expected_tests: bool,
    pub require_patient: bool,
    pub allow_report_date: bool,
    pub min_observations: usize,
}

impl FirewallConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            strict_extraction: config.strict_extraction,
            require_expected_tests: config.require_expected_tests,
            require_patient: config.require_patient,
            allow_report_date: config.allow_report_date,
            min_observations: config.min_observations,
        }
    }

    /// Permissive defaults for tests.
    pub fn lenient() -> Self {
        Self {
            strict_extraction: false,
            require_expected_tests: false,
            require_patient: false,
            allow_report_date: false,
            min_observations: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SanitizeOutcome {
    pub extraction: Extraction,
    pub notes: Vec<String>,
}

/// Apply the rewrite pipeline. Order matters: names and units normalize
/// first so later rules see canonical spellings; the platelet/MPV swap
/// runs before platelet scaling so a swapped-in thousands value is
/// rescaled correctly.
pub fn sanitize(mut extraction: Extraction, config: &FirewallConfig) -> SanitizeOutcome {
    let mut notes = Vec::new();

    normalize_rows(&mut extraction.rows, &mut notes);
    dedup_rows(&mut extraction.rows, &mut notes);
    drop_banner_rows(&mut extraction.rows, &mut notes);
    swap_platelet_mpv(&mut extraction.rows, &mut notes);
    scale_platelets(&mut extraction.rows, &mut notes);
    rescale_absolute_counts(&mut extraction.rows, &mut notes);
    clean_patient_identity(&mut extraction, &mut notes);
    prune_report_date(&mut extraction, config, &mut notes);
    derive_flags(&mut extraction.rows);

    SanitizeOutcome { extraction, notes }
}

fn normalize_rows(rows: &mut Vec<ExtractedRow>, notes: &mut Vec<String>) {
    rows.retain(|row| {
        let keep = !row.test_name.trim().is_empty()
            && !PLACEHOLDER_TESTS.contains(&row.test_name.trim().to_lowercase().as_str());
        if !keep {
            notes.push(format!("dropped_placeholder_row:{}", row.test_name.trim()));
        }
        keep
    });

    for row in rows.iter_mut() {
        row.test_name = terminology::canonical_name(&row.test_name);
        row.unit = row
            .unit
            .as_deref()
            .and_then(terminology::canonical_unit);

        // A "Platelet Count" reported in femtoliters is MPV mislabeled.
        if row.test_name == "Platelet Count" && row.unit.as_deref() == Some("fL") {
            row.test_name = "MPV".to_string();
            notes.push("platelet_relabeled_mpv".to_string());
        }

        match row.test_name.as_str() {
            "MPV" => row.unit = Some("fL".to_string()),
            "Immature Platelet Fraction" => row.unit = Some("%".to_string()),
            _ => {
                if row.unit.is_none() && row.value.is_numeric() {
                    row.unit = terminology::expected_unit(&row.test_name)
                        .map(str::to_string);
                }
            }
        }
    }
}

/// Keep one row per canonical name: numeric beats text, then a row with
/// a reference range beats one without, then first wins.
fn dedup_rows(rows: &mut Vec<ExtractedRow>, notes: &mut Vec<String>) {
    let mut kept: Vec<ExtractedRow> = Vec::with_capacity(rows.len());
    for row in rows.drain(..) {
        match kept.iter_mut().find(|k| k.test_name == row.test_name) {
            None => kept.push(row),
            Some(existing) => {
                let replace = match (row.value.is_numeric(), existing.value.is_numeric()) {
                    (true, false) => true,
                    (false, true) => false,
                    _ => has_range(&row) && !has_range(existing),
                };
                notes.push(format!("deduplicated:{}", row.test_name));
                if replace {
                    *existing = row;
                }
            }
        }
    }
    *rows = kept;
}

fn has_range(row: &ExtractedRow) -> bool {
    (row.ref_low.is_some() && row.ref_high.is_some()) || row.ref_text.is_some()
}

fn drop_banner_rows(rows: &mut Vec<ExtractedRow>, notes: &mut Vec<String>) {
    rows.retain(|row| {
        let empty_text = matches!(&row.value, RowValue::Text(t) if t.trim().is_empty());
        let keep = !(is_section_banner(&row.test_name) && empty_text);
        if !keep {
            notes.push(format!("dropped_section_banner:{}", row.test_name));
        }
        keep
    });
}

/// Detect a platelet-count/MPV value swap: the two rows sit next to each
/// other on CBC printouts and OCR routinely crosses them.
fn swap_platelet_mpv(rows: &mut [ExtractedRow], notes: &mut Vec<String>) {
    let platelet_idx = rows.iter().position(|r| r.test_name == "Platelet Count");
    let mpv_idx = rows.iter().position(|r| r.test_name == "MPV");
    let (Some(p), Some(m)) = (platelet_idx, mpv_idx) else {
        return;
    };
    let (Some(platelet_value), Some(mpv_value)) =
        (rows[p].value.as_number(), rows[m].value.as_number())
    else {
        return;
    };

    let platelet_looks_like_mpv =
        platelet_value >= MPV_RANGE.0 && platelet_value <= MPV_RANGE.1;
    let mpv_looks_like_platelet =
        mpv_value >= PLATELET_RANGE.0 && mpv_value <= PLATELET_RANGE.1;
    if platelet_looks_like_mpv && mpv_looks_like_platelet {
        rows[p].value = RowValue::Number(mpv_value);
        rows[m].value = RowValue::Number(platelet_value);
        notes.push("platelet_mpv_swapped".to_string());
    }
}

/// Repair thousands-shorthand platelet counts: "370 /uL" on a CBC means
/// 370 x 10^3/uL. Scales the reference range with the value and clears
/// any stale flag (re-derived later when a range is present).
fn scale_platelets(rows: &mut [ExtractedRow], notes: &mut Vec<String>) {
    for row in rows.iter_mut() {
        if row.test_name != "Platelet Count" {
            continue;
        }
        let Some(value) = row.value.as_number() else {
            continue;
        };
        let thousands_unit = row.unit.as_deref() == Some("10*3/uL");
        let bare_unit = row.unit.is_none() || row.unit.as_deref() == Some("/uL");
        let shorthand = bare_unit && value > 0.0 && value < 1000.0;
        if !(thousands_unit || shorthand) {
            continue;
        }

        row.value = RowValue::Number(value * 1000.0);
        row.unit = Some("/uL".to_string());
        for bound in [&mut row.ref_low, &mut row.ref_high] {
            if let Some(b) = bound {
                if *b < 1000.0 {
                    *b *= 1000.0;
                }
            }
        }
        row.flag = None;
        notes.push("platelet_scaled".to_string());
    }
}

/// Fix off-by-factor-of-10 absolute differential counts, cross-checked
/// against WBC total x percentage.
fn rescale_absolute_counts(rows: &mut [ExtractedRow], notes: &mut Vec<String>) {
    let wbc = rows
        .iter()
        .find(|r| r.test_name == "WBC Count")
        .and_then(|r| r.value.as_number());
    let Some(wbc) = wbc.filter(|w| *w > 0.0) else {
        return;
    };

    for cell in terminology::DIFFERENTIAL_CELLS {
        let percent = rows
            .iter()
            .find(|r| r.test_name == *cell)
            .and_then(|r| r.value.as_number());
        let Some(percent) = percent else {
            continue;
        };
        let absolute_name = format!("Absolute {cell}");
        let Some(abs_row) = rows.iter_mut().find(|r| r.test_name == absolute_name) else {
            continue;
        };
        let Some(actual) = abs_row.value.as_number() else {
            continue;
        };
        let (Some(low), Some(high)) = (abs_row.ref_low, abs_row.ref_high) else {
            continue;
        };

        let midpoint = (low + high) / 2.0;
        if midpoint < actual * 10.0 {
            continue;
        }
        let expected = wbc * percent / 100.0;
        if expected <= 0.0 {
            continue;
        }
        if ((actual * 10.0 - expected) / expected).abs() < 0.25 {
            abs_row.value = RowValue::Number(actual * 10.0);
            notes.push(format!("absolute_count_rescaled:{absolute_name}"));
        }
    }
}

/// Strip honorifics, reject placeholder names, split into given/family
/// on the last whitespace.
fn clean_patient_identity(extraction: &mut Extraction, notes: &mut Vec<String>) {
    let patient = &mut extraction.patient;
    let Some(raw) = patient.name.take() else {
        return;
    };
    if PLACEHOLDER_NAMES.contains(&raw.trim().to_lowercase().as_str()) {
        notes.push("dropped_placeholder_patient_name".to_string());
        return;
    }

    let tokens: Vec<&str> = raw
        .split_whitespace()
        .filter(|t| {
            let stripped = t.trim_end_matches(',').to_lowercase();
            !HONORIFICS.contains(&stripped.as_str())
        })
        .collect();
    if tokens.is_empty() {
        notes.push("dropped_placeholder_patient_name".to_string());
        return;
    }

    let cleaned = tokens.join(" ");
    if cleaned != raw.trim() {
        notes.push("patient_name_cleaned".to_string());
    }
    if tokens.len() >= 2 {
        patient.given = tokens[..tokens.len() - 1]
            .iter()
            .map(|t| t.to_string())
            .collect();
        patient.family = Some(tokens[tokens.len() - 1].to_string());
    } else {
        patient.given = vec![tokens[0].to_string()];
        patient.family = None;
    }
    patient.name = Some(cleaned);

    if let Some(identifier) = patient.identifier.take() {
        let trimmed = identifier.trim().to_string();
        if !trimmed.is_empty() {
            patient.identifier = Some(trimmed);
        }
    }
}

fn prune_report_date(
    extraction: &mut Extraction,
    config: &FirewallConfig,
    notes: &mut Vec<String>,
) {
    let Some(date) = extraction.report_date.take() else {
        return;
    };
    let iso = chrono::NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").is_ok();
    if config.allow_report_date && iso {
        extraction.report_date = Some(date.trim().to_string());
    } else {
        notes.push("report_date_pruned".to_string());
    }
}

/// Derive H/L/N flags wherever the value and both range bounds are
/// numeric; extracted flags on range-less rows are left alone.
fn derive_flags(rows: &mut [ExtractedRow]) {
    for row in rows.iter_mut() {
        let (Some(value), Some(low), Some(high)) =
            (row.value.as_number(), row.ref_low, row.ref_high)
        else {
            continue;
        };
        row.flag = Some(if value < low {
            Flag::L
        } else if value > high {
            Flag::H
        } else {
            Flag::N
        });
    }
}

/// Completeness rules. Failures feed the repair prompt.
pub fn check_completeness(
    extraction: &Extraction,
    modality: Modality,
    config: &FirewallConfig,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    match modality {
        Modality::Prescription => {
            if extraction.medications.is_empty() {
                issues.push(ValidationIssue::new(
                    "medications",
                    "no_medications",
                    "prescription extraction must contain at least one medication row",
                ));
            }
        }
        Modality::Lab | Modality::Unknown => {
            if config.strict_extraction && extraction.rows.len() < config.min_observations {
                issues.push(ValidationIssue::new(
                    "rows",
                    "too_few_rows",
                    format!(
                        "extraction must include at least {} rows (found {})",
                        config.min_observations,
                        extraction.rows.len()
                    ),
                ));
            }
            if config.require_expected_tests && looks_like_cbc(extraction) {
                let missing: Vec<&str> = terminology::CBC_PANEL
                    .iter()
                    .filter(|name| {
                        !extraction.rows.iter().any(|r| r.test_name == **name)
                    })
                    .copied()
                    .collect();
                if !missing.is_empty() {
                    issues.push(ValidationIssue::new(
                        "rows",
                        "missing_expected_tests",
                        format!("missing expected CBC rows: {}", missing.join(", ")),
                    ));
                }
            }
        }
        Modality::Radiology | Modality::Vitals => {
            if config.strict_extraction && extraction.rows.is_empty() {
                issues.push(ValidationIssue::new(
                    "rows",
                    "empty_extraction",
                    "extraction must contain at least one finding row",
                ));
            }
        }
    }

    if config.require_patient {
        if !extraction.patient.has_name() {
            issues.push(ValidationIssue::new(
                "patient.name",
                "missing_patient_name",
                "patient name is required",
            ));
        }
        if extraction.patient.identifier.is_none() {
            issues.push(ValidationIssue::new(
                "patient.identifier",
                "missing_patient_identifier",
                "at least one patient identifier is required",
            ));
        }
    }

    issues
}

fn looks_like_cbc(extraction: &Extraction) -> bool {
    extraction
        .rows
        .iter()
        .any(|r| r.test_name == "Hemoglobin" || r.test_name == "WBC Count")
}
