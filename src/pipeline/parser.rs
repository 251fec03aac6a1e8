//! Hybrid parser for raw model output: strip chain-of-thought tokens and
//! markdown fences, try JSON, fall back to TSV, otherwise hand the raw
//! text back to the orchestrator as a failure.
//!
//! The parser never mutates the raw text it is given; callers keep the
//! original for the audit trail.

use std::sync::OnceLock;

use regex::Regex;

use super::types::{Extraction, ExtractedRow, Flag, MedicationRow, Modality, RowValue};

#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Structured(Extraction),
    /// Neither JSON nor TSV matched; the orchestrator treats this as an
    /// extraction failure.
    Raw(String),
}

/// Header cell names that mark the start of a data table.
const HEADER_CELLS: &[&str] = &[
    "TEST",
    "NAME",
    "ANALYTE",
    "FINDING",
    "ANATOMY",
    "REGION",
    "OBSERVATION",
    "VITAL",
    "DRUG",
    "MEDICATION",
];

/// Section banners that appear as standalone uppercase lines inside lab
/// tables and carry no data.
const SECTION_BANNERS: &[&str] = &[
    "DIFFERENTIAL COUNT",
    "DIFFERENTIAL",
    "COMPLETE BLOOD COUNT",
    "CBC",
    "IMPRESSION",
    "HEMATOLOGY",
    "PLATELET INDICES",
    "RBC INDICES",
    "ABSOLUTE COUNTS",
];

pub fn is_section_banner(cell: &str) -> bool {
    let upper = cell.trim().trim_end_matches(':').to_uppercase();
    SECTION_BANNERS.contains(&upper.as_str())
}

/// Parse one model response for the given modality.
pub fn parse_llm_output(
    raw: &str,
    modality: Modality,
    thinking_open: &str,
    thinking_close: &str,
) -> ParseOutcome {
    let stripped = strip_thinking(raw, thinking_open, thinking_close);
    let unfenced = strip_fences(&stripped);

    if let Some(extraction) = try_json(&unfenced, modality) {
        return ParseOutcome::Structured(extraction);
    }
    if let Some(extraction) = try_tsv(&unfenced, modality) {
        return ParseOutcome::Structured(extraction);
    }
    ParseOutcome::Raw(raw.to_string())
}

/// Remove chain-of-thought spans delimited by the configured token pair,
/// non-greedily, across line boundaries.
pub fn strip_thinking(text: &str, open: &str, close: &str) -> String {
    if open.is_empty() || close.is_empty() {
        return text.to_string();
    }
    let pattern = format!("(?s){}.*?{}", regex::escape(open), regex::escape(close));
    match Regex::new(&pattern) {
        Ok(re) => re.replace_all(text, "").trim().to_string(),
        Err(_) => text.to_string(),
    }
}

/// Unwrap a markdown code fence, tolerating a language hint on the
/// opening line (```json). Text outside a fence passes through.
pub fn strip_fences(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let after_open = match trimmed.find('\n') {
        Some(idx) => &trimmed[idx + 1..],
        None => return trimmed.trim_matches('`').trim().to_string(),
    };
    match after_open.rfind("```") {
        Some(idx) => after_open[..idx].trim().to_string(),
        None => after_open.trim().to_string(),
    }
}

// ── JSON path ────────────────────────────────────────────────

fn try_json(text: &str, modality: Modality) -> Option<Extraction> {
    let candidate = json_candidate(text)?;
    let value: serde_json::Value = serde_json::from_str(candidate).ok()?;
    extraction_from_json(&value, modality)
}

/// Slice out the first balanced `{...}` or `[...]` block so that prose
/// around the JSON does not break `serde_json`.
fn json_candidate(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let start = trimmed.find(['{', '['])?;
    let open = trimmed.as_bytes()[start];
    let close = if open == b'{' { b'}' } else { b']' };
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, b) in trimmed.bytes().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b if b == open => depth += 1,
            b if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&trimmed[start..=i]);
                }
            }
            _ => {}
        }
    }
    Some(&trimmed[start..])
}

fn extraction_from_json(value: &serde_json::Value, modality: Modality) -> Option<Extraction> {
    // A bare array is a prescription list.
    if let Some(items) = value.as_array() {
        let medications = medications_from_json(items);
        if medications.is_empty() {
            return None;
        }
        return Some(Extraction {
            medications,
            modality: Some(Modality::Prescription),
            ..Extraction::default()
        });
    }

    let object = value.as_object()?;
    let mut extraction = Extraction {
        modality: Some(modality),
        ..Extraction::default()
    };

    if let Some(meds) = object.get("medications").and_then(|m| m.as_array()) {
        extraction.medications = medications_from_json(meds);
    }

    if let Some(patient) = object.get("patient").and_then(|p| p.as_object()) {
        extraction.patient.name = patient
            .get("name")
            .and_then(|n| n.as_str())
            .map(str::to_string);
        extraction.patient.identifier = patient
            .get("identifier")
            .or_else(|| patient.get("id"))
            .and_then(json_scalar_to_string);
    }

    extraction.report_date = object
        .get("report_date")
        .and_then(|d| d.as_str())
        .map(str::to_string);

    let rows = object
        .get("observations")
        .or_else(|| object.get("rows"))
        .or_else(|| object.get("results"))
        .and_then(|o| o.as_array());
    if let Some(rows) = rows {
        for (idx, row) in rows.iter().enumerate() {
            if let Some(parsed) = row_from_json(row, idx) {
                extraction.rows.push(parsed);
            } else {
                tracing::warn!(index = idx, "Dropped unparseable observation row");
            }
        }
    }

    if extraction.is_empty() && !extraction.patient.has_name() {
        return None;
    }
    Some(extraction)
}

fn medications_from_json(items: &[serde_json::Value]) -> Vec<MedicationRow> {
    items
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let medication = obj
                .get("medication")
                .or_else(|| obj.get("drug"))
                .or_else(|| obj.get("name"))
                .and_then(|v| v.as_str())?
                .trim()
                .to_string();
            if medication.is_empty() {
                return None;
            }
            Some(MedicationRow {
                medication,
                dosage: obj.get("dosage").and_then(json_scalar_to_string),
                frequency: obj.get("frequency").and_then(json_scalar_to_string),
                duration: obj.get("duration").and_then(json_scalar_to_string),
            })
        })
        .collect()
}

fn row_from_json(value: &serde_json::Value, index: usize) -> Option<ExtractedRow> {
    let obj = value.as_object()?;
    let name = obj
        .get("name")
        .or_else(|| obj.get("test"))
        .or_else(|| obj.get("test_name"))
        .or_else(|| obj.get("analyte"))
        .and_then(|v| v.as_str())?
        .trim();
    if name.is_empty() {
        return None;
    }

    let raw_value = obj.get("value").or_else(|| obj.get("result"))?;
    let (value, mut unit, mut flag) = match raw_value {
        serde_json::Value::Number(n) => (RowValue::Number(n.as_f64()?), None, None),
        serde_json::Value::String(s) => split_value_unit(s),
        _ => return None,
    };
    if let Some(u) = obj.get("unit").and_then(|v| v.as_str()) {
        if !u.trim().is_empty() {
            unit = Some(u.trim().to_string());
        }
    }
    if let Some(f) = obj
        .get("flag")
        .and_then(|v| v.as_str())
        .and_then(Flag::from_label)
    {
        flag = Some(f);
    }

    let mut row = ExtractedRow::new(name, value);
    row.unit = unit;
    row.flag = flag;
    row.source_row = Some(index);
    row.ref_low = obj
        .get("ref_low")
        .or_else(|| obj.get("low"))
        .and_then(json_to_f64);
    row.ref_high = obj
        .get("ref_high")
        .or_else(|| obj.get("high"))
        .and_then(json_to_f64);
    if row.ref_low.is_none() && row.ref_high.is_none() {
        if let Some(range) = obj
            .get("range")
            .or_else(|| obj.get("reference_range"))
            .and_then(|v| v.as_str())
        {
            apply_range_cell(&mut row, range);
        }
    }
    Some(row)
}

fn json_to_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => parse_number(s),
        _ => None,
    }
}

fn json_scalar_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ── TSV path ─────────────────────────────────────────────────

fn try_tsv(text: &str, modality: Modality) -> Option<Extraction> {
    // Models occasionally emit literal escapes instead of real tabs.
    let normalized = text.replace("\\t", "\t").replace("\\n", "\n");
    let lines: Vec<&str> = normalized
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .collect();
    if lines.is_empty() {
        return None;
    }

    let mut extraction = Extraction {
        modality: Some(modality),
        ..Extraction::default()
    };
    let mut header_idx: Option<usize> = None;
    let mut table_modality = modality;

    for (idx, line) in lines.iter().enumerate() {
        if let Some((key, rest)) = metadata_line(line) {
            match key {
                "PATIENT_NAME" => extraction.patient.name = non_empty(rest),
                "PATIENT_ID" | "SAMPLE_ID" | "ID" | "MRN" => {
                    extraction.patient.identifier = non_empty(rest)
                }
                "REPORT_DATE" => extraction.report_date = non_empty(rest),
                "MODALITY" => {
                    let detected = Modality::from_label(rest);
                    if detected != Modality::Unknown {
                        table_modality = detected;
                        extraction.modality = Some(detected);
                    }
                }
                _ => {}
            }
            continue;
        }

        let cells = split_cells(line);
        if cells.len() >= 2 && HEADER_CELLS.contains(&cells[0].to_uppercase().as_str()) {
            header_idx = Some(idx);
            if matches!(
                cells[0].to_uppercase().as_str(),
                "FINDING" | "ANATOMY" | "REGION"
            ) && table_modality != Modality::Radiology
            {
                table_modality = Modality::Radiology;
                extraction.modality = Some(Modality::Radiology);
            }
            if matches!(cells[0].to_uppercase().as_str(), "DRUG" | "MEDICATION") {
                table_modality = Modality::Prescription;
                extraction.modality = Some(Modality::Prescription);
            }
            break;
        }
    }

    let start = header_idx.map(|i| i + 1).unwrap_or(0);
    for (row_idx, line) in lines.iter().enumerate().skip(start) {
        if metadata_line(line).is_some() {
            continue;
        }
        let cells = split_cells(line);
        if cells.is_empty() {
            continue;
        }
        // Header repeats and standalone section banners carry no data.
        if HEADER_CELLS.contains(&cells[0].to_uppercase().as_str()) {
            continue;
        }
        if cells.len() == 1 {
            continue;
        }
        if cells[1..].iter().all(|c| c.trim().is_empty()) && is_section_banner(&cells[0]) {
            continue;
        }

        match table_modality {
            Modality::Prescription => {
                let medication = cells[0].trim().to_string();
                if medication.is_empty() {
                    continue;
                }
                extraction.medications.push(MedicationRow {
                    medication,
                    dosage: cells.get(1).and_then(|c| non_empty(c)),
                    frequency: cells.get(2).and_then(|c| non_empty(c)),
                    duration: cells.get(3).and_then(|c| non_empty(c)),
                });
            }
            Modality::Radiology => {
                let finding = cells.get(1).map(|c| c.trim()).unwrap_or_default();
                if finding.is_empty() {
                    continue;
                }
                let mut row =
                    ExtractedRow::new(cells[0].trim(), RowValue::Text(finding.to_string()));
                row.flag = cells.get(2).and_then(|c| Flag::from_label(c));
                row.source_row = Some(row_idx);
                extraction.rows.push(row);
            }
            _ => {
                if let Some(row) = lab_row_from_cells(&cells, row_idx) {
                    extraction.rows.push(row);
                }
            }
        }
    }

    if extraction.is_empty() {
        return None;
    }
    Some(extraction)
}

/// Lab/vitals row: TEST VALUE [UNIT] [RANGE] [FLAG], with a tolerance
/// for six-column output that splits the range into low and high.
fn lab_row_from_cells(cells: &[String], row_idx: usize) -> Option<ExtractedRow> {
    let name = cells[0].trim();
    let value_cell = cells.get(1)?.trim();
    if name.is_empty() || value_cell.is_empty() {
        return None;
    }

    let (value, inline_unit, inline_flag) = split_value_unit(value_cell);
    let mut row = ExtractedRow::new(name, value);
    row.unit = inline_unit;
    row.flag = inline_flag;
    row.source_row = Some(row_idx);

    if let Some(unit) = cells.get(2).and_then(|c| non_empty(c)) {
        row.unit = Some(unit);
    }

    let six_column = cells.len() >= 6
        && parse_number(cells[3].trim()).is_some()
        && parse_number(cells[4].trim()).is_some();
    if six_column {
        row.ref_low = parse_number(cells[3].trim());
        row.ref_high = parse_number(cells[4].trim());
        if let Some(flag) = cells.get(5).and_then(|c| Flag::from_label(c)) {
            row.flag = Some(flag);
        }
    } else {
        if let Some(range_cell) = cells.get(3) {
            apply_range_cell(&mut row, range_cell);
        }
        if let Some(flag) = cells.get(4).and_then(|c| Flag::from_label(c)) {
            row.flag = Some(flag);
        }
    }
    Some(row)
}

fn apply_range_cell(row: &mut ExtractedRow, range_cell: &str) {
    let trimmed = range_cell.trim();
    if trimmed.is_empty() {
        return;
    }
    match parse_range(trimmed) {
        Some((low, high)) => {
            row.ref_low = Some(low);
            row.ref_high = Some(high);
        }
        None => row.ref_text = Some(trimmed.to_string()),
    }
}

/// Recognize `KEY: value` metadata lines ahead of the table.
fn metadata_line(line: &str) -> Option<(&'static str, &str)> {
    let (key, rest) = line.split_once(':')?;
    let key_upper = key.trim().to_uppercase();
    let known: &[&'static str] = &[
        "PATIENT_NAME",
        "PATIENT_ID",
        "SAMPLE_ID",
        "ID",
        "MRN",
        "REPORT_DATE",
        "MODALITY",
    ];
    known
        .iter()
        .find(|k| **k == key_upper)
        .map(|k| (*k, rest.trim()))
}

/// Split a table line into cells: tabs first, then pipes, then runs of
/// two or more spaces.
fn split_cells(line: &str) -> Vec<String> {
    if line.contains('\t') {
        return line.split('\t').map(|c| c.trim().to_string()).collect();
    }
    if line.contains('|') {
        return line
            .split('|')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
    }
    static TWO_SPACES: OnceLock<Regex> = OnceLock::new();
    let re = TWO_SPACES.get_or_init(|| Regex::new(r"\s{2,}").unwrap());
    re.split(line)
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

/// Split a value cell into (value, unit, flag): "12.5 g/dL [H]" becomes
/// `(Number(12.5), Some("g/dL"), Some(H))`. Non-numeric cells stay text.
pub fn split_value_unit(cell: &str) -> (RowValue, Option<String>, Option<Flag>) {
    let mut text = cell.trim().to_string();
    let mut flag = None;
    for (marker, parsed) in [("[H]", Flag::H), ("[L]", Flag::L)] {
        if text.contains(marker) {
            flag = Some(parsed);
            text = text.replace(marker, "").trim().to_string();
        }
    }

    static VALUE_UNIT: OnceLock<Regex> = OnceLock::new();
    let re = VALUE_UNIT
        .get_or_init(|| Regex::new(r"^([-+]?\d[\d,]*(?:\.\d+)?)\s*(.*)$").unwrap());

    if let Some(caps) = re.captures(&text) {
        let number_text = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let trailing = caps.get(2).map(|m| m.as_str().trim()).unwrap_or_default();
        // "120/80" must stay text: the trailing part starting with '/'
        // followed by digits marks a compound reading, not a unit.
        let compound = trailing.starts_with('/')
            && trailing[1..].chars().next().is_some_and(|c| c.is_ascii_digit());
        if !compound {
            if let Some(number) = parse_number(number_text) {
                let unit = if trailing.is_empty() {
                    None
                } else {
                    Some(trailing.to_string())
                };
                return (RowValue::Number(number), unit, flag);
            }
        }
    }
    (RowValue::Text(text), None, flag)
}

/// Parse a number, tolerating thousands separators.
pub fn parse_number(text: &str) -> Option<f64> {
    let cleaned = text.trim().replace(',', "");
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

/// Parse "150-450" or "13.0 - 17.0" into (low, high).
pub fn parse_range(text: &str) -> Option<(f64, f64)> {
    let cleaned = text.trim().replace(['–', '—'], "-");
    // Split on the first '-' that is not a leading sign.
    let split_at = cleaned
        .char_indices()
        .skip(1)
        .find(|(_, c)| *c == '-')
        .map(|(i, _)| i)?;
    let low = parse_number(&cleaned[..split_at])?;
    let high = parse_number(&cleaned[split_at + 1..])?;
    Some((low, high))
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
