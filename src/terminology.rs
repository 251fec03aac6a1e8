//! Static terminology tables: test-name canonicalization, LOINC codes,
//! unit normalization, and expected units for common CBC parameters.
//!
//! Lookups are pure and allocation-light; unknown inputs pass through
//! unchanged so downstream resources can still be emitted with text-only
//! codes.

/// Reduce a raw test name to a lookup key: casefold, strip punctuation
/// and whitespace. "Total W.B.C. Count" and "total wbc count" collide.
pub fn lookup_key(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Canonicalize a test name via the synonym table.
/// Unresolved names are returned trimmed but otherwise verbatim.
pub fn canonical_name(raw: &str) -> String {
    match synonym(&lookup_key(raw)) {
        Some(canonical) => canonical.to_string(),
        None => raw.trim().to_string(),
    }
}

fn synonym(key: &str) -> Option<&'static str> {
    let canonical = match key {
        "haemoglobin" | "hemoglobin" | "hb" | "hgb" => "Hemoglobin",
        "wbc" | "wbccount" | "totalwbc" | "totalwbccount" | "totalleucocytecount"
        | "totalleukocytecount" | "leukocytes" | "leucocytes" | "whitebloodcellcount" => {
            "WBC Count"
        }
        "rbc" | "rbccount" | "totalrbc" | "totalrbccount" | "erythrocytes"
        | "redbloodcellcount" => "RBC Count",
        "platelet" | "platelets" | "plateletcount" | "plt" => "Platelet Count",
        "haematocrit" | "hematocrit" | "hct" | "pcv" | "packedcellvolume"
        | "haematocritpcv" | "hematocritpcv" => "Hematocrit",
        "mcv" | "meancorpuscularvolume" | "meancorpuscularvolumemcv" => "MCV",
        "mch" | "meancorpuscularhb" | "meancorpuscularhaemoglobin"
        | "meancorpuscularhemoglobin" | "meancorpuscularhbmch" => "MCH",
        "mchc" | "meancorpuscularhbconc" | "meancorpuscularhbconcmchc"
        | "meancorpuscularhemoglobinconcentration" => "MCHC",
        "rdw" | "rdwcv" | "redcelldistributionwidth" | "redcelldistributionwidthrdw"
        | "redcelldistributionwidthrdwcv" => "RDW",
        "neutrophil" | "neutrophils" => "Neutrophils",
        "lymphocyte" | "lymphocytes" => "Lymphocytes",
        "monocyte" | "monocytes" => "Monocytes",
        "eosinophil" | "eosinophils" => "Eosinophils",
        "basophil" | "basophils" => "Basophils",
        "neutrophilsabs" | "absneutrophils" | "absoluteneutrophils"
        | "absoluteneutrophilcount" => "Absolute Neutrophils",
        "lymphocytesabs" | "abslymphocytes" | "absolutelymphocytes"
        | "absolutelymphocytecount" => "Absolute Lymphocytes",
        "monocytesabs" | "absmonocytes" | "absolutemonocytes" | "absolutemonocytecount" => {
            "Absolute Monocytes"
        }
        "eosinophilsabs" | "abseosinophils" | "absoluteeosinophils"
        | "absoluteeosinophilcount" => "Absolute Eosinophils",
        "basophilsabs" | "absbasophils" | "absolutebasophils" | "absolutebasophilcount" => {
            "Absolute Basophils"
        }
        "mpv" | "meanplateletvolume" => "MPV",
        "ipf" | "immatureplateletfraction" => "Immature Platelet Fraction",
        "bp" | "bloodpressure" => "Blood Pressure",
        "hr" | "heartrate" | "pulse" | "pulserate" => "Heart Rate",
        "temp" | "temperature" => "Temperature",
        "spo2" | "oxygensaturation" | "o2saturation" => "SpO2",
        "bmi" | "bodymassindex" => "BMI",
        "weight" | "bodyweight" => "Weight",
        "height" => "Height",
        "rr" | "respiratoryrate" | "resprate" => "Respiratory Rate",
        _ => return None,
    };
    Some(canonical)
}

/// LOINC code for a canonical test name, when known.
pub fn loinc_code(canonical: &str) -> Option<&'static str> {
    let code = match canonical {
        "Hemoglobin" => "718-7",
        "WBC Count" => "6690-2",
        "RBC Count" => "789-8",
        "Platelet Count" => "777-3",
        "Hematocrit" => "4544-3",
        "MCV" => "787-2",
        "MCH" => "785-6",
        "MCHC" => "786-4",
        "RDW" => "14563-1",
        "Neutrophils" => "770-8",
        "Lymphocytes" => "731-0",
        "Monocytes" => "742-7",
        "Eosinophils" => "711-2",
        "Basophils" => "704-7",
        "MPV" => "32623-1",
        "Heart Rate" => "8867-4",
        "Respiratory Rate" => "9279-1",
        "Temperature" => "8310-5",
        "SpO2" => "59408-5",
        "BMI" => "39156-5",
        "Weight" => "29463-7",
        "Height" => "8302-2",
        _ => return None,
    };
    Some(code)
}

/// Normalize a unit string to its canonical form.
///
/// Empty or whitespace-only input maps to `None`. Unknown units are
/// returned cleaned (inline flags removed, `µ` folded to `u`) but
/// otherwise untouched.
pub fn canonical_unit(raw: &str) -> Option<String> {
    let cleaned = raw
        .replace("[H]", "")
        .replace("[L]", "")
        .replace('µ', "u")
        .replace('³', "3")
        .trim()
        .to_string();
    if cleaned.is_empty() {
        return None;
    }

    let unit = match cleaned.to_lowercase().as_str() {
        "g/dl" | "gm/dl" | "g%" | "gm%" => "g/dL",
        "mill/cumm" | "mill/cmm" | "mill/mm3" | "million/mm3" | "million/cumm"
        | "million/cmm" | "x10^6/ul" | "10^6/ul" | "x106/ul" | "10*6/ul" => "10*6/uL",
        "x10^3/ul" | "10^3/ul" | "x103/ul" | "thou/ul" | "k/ul" | "10*3/ul" => "10*3/uL",
        "/ul" | "ul" | "/cumm" | "cumm" | "/cmm" | "/mm3" | "cells/cumm" | "cells/ul"
        | "percumm" => "/uL",
        "fl" => "fL",
        "pg" => "pg",
        "%" => "%",
        "mmol/l" => "mmol/L",
        "mg/dl" => "mg/dL",
        "mmhg" => "mmHg",
        "bpm" | "beats/min" => "bpm",
        "/min" | "breaths/min" => "/min",
        "kg" => "kg",
        "lbs" | "lb" => "lbs",
        "cm" => "cm",
        "c" | "°c" | "degc" | "celsius" => "°C",
        "f" | "°f" | "degf" | "fahrenheit" => "°F",
        "kg/m2" | "kg/m^2" => "kg/m2",
        _ => return Some(cleaned),
    };
    Some(unit.to_string())
}

/// The closed set of canonical units the pipeline emits for known tests.
pub const CANONICAL_UNITS: &[&str] = &[
    "g/dL", "10*6/uL", "10*3/uL", "/uL", "fL", "pg", "%", "mmol/L", "mg/dL", "mmHg", "bpm",
    "/min", "kg", "lbs", "cm", "°C", "°F", "kg/m2",
];

pub fn is_canonical_unit(unit: &str) -> bool {
    CANONICAL_UNITS.contains(&unit)
}

/// Expected unit for a canonical test name, used to fill missing units.
pub fn expected_unit(canonical: &str) -> Option<&'static str> {
    let unit = match canonical {
        "Hemoglobin" | "MCHC" => "g/dL",
        "RBC Count" => "10*6/uL",
        "Hematocrit" | "RDW" | "Neutrophils" | "Lymphocytes" | "Monocytes" | "Eosinophils"
        | "Basophils" | "Immature Platelet Fraction" | "SpO2" => "%",
        "MCV" | "MPV" => "fL",
        "MCH" => "pg",
        "WBC Count" | "Platelet Count" | "Absolute Neutrophils" | "Absolute Lymphocytes"
        | "Absolute Monocytes" | "Absolute Eosinophils" | "Absolute Basophils" => "/uL",
        "Blood Pressure" => "mmHg",
        "Heart Rate" => "bpm",
        "Respiratory Rate" => "/min",
        "Temperature" => "°C",
        "BMI" => "kg/m2",
        "Weight" => "kg",
        "Height" => "cm",
        _ => return None,
    };
    Some(unit)
}

/// The full CBC + Differential + Platelet panel used by the completeness
/// check when `require_expected_tests` is on.
pub const CBC_PANEL: &[&str] = &[
    "Hemoglobin",
    "RBC Count",
    "Hematocrit",
    "MCV",
    "MCH",
    "MCHC",
    "RDW",
    "WBC Count",
    "Neutrophils",
    "Lymphocytes",
    "Eosinophils",
    "Monocytes",
    "Basophils",
    "Platelet Count",
];

/// Differential cell types with percentage and absolute-count rows.
pub const DIFFERENTIAL_CELLS: &[&str] = &[
    "Neutrophils",
    "Lymphocytes",
    "Monocytes",
    "Eosinophils",
    "Basophils",
];
