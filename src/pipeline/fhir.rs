//! FHIR R4 bundle assembly and minimal validation.
//!
//! Bundles are built as `serde_json::Value` trees: the wire format is
//! JSON-first and the minimal validator enforces the shape invariants
//! the rest of the system relies on.

use serde_json::{json, Value};

use crate::terminology;

use super::types::{Extraction, ExtractedPatient, Modality, RowValue};

const OBSERVATION_CATEGORY_SYSTEM: &str =
    "http://terminology.hl7.org/CodeSystem/observation-category";
const INTERPRETATION_SYSTEM: &str =
    "http://terminology.hl7.org/CodeSystem/v3-ObservationInterpretation";
const LOINC_SYSTEM: &str = "http://loinc.org";
const UCUM_SYSTEM: &str = "http://unitsofmeasure.org";
const PATIENT_REF: &str = "Patient/patient-1";

/// Build a collection bundle from a sanitized extraction.
pub fn bundle_from_extraction(extraction: &Extraction, patient_id: &str) -> Value {
    let modality = extraction.modality.unwrap_or(Modality::Unknown);
    let mut entries = vec![json!({ "resource": patient_resource(&extraction.patient, patient_id) })];

    for (idx, row) in extraction.rows.iter().enumerate() {
        let mut obs = json!({
            "resourceType": "Observation",
            "id": format!("obs-{}", idx + 1),
            "status": "final",
            "category": [{
                "coding": [{
                    "system": OBSERVATION_CATEGORY_SYSTEM,
                    "code": modality.category_code(),
                }]
            }],
            "code": code_concept(&row.test_name),
            "subject": { "reference": PATIENT_REF },
        });

        match &row.value {
            // A quantity needs a unit; unit-less numerics degrade to a
            // string value rather than an uncoded quantity.
            RowValue::Number(n) => match &row.unit {
                Some(unit) => {
                    obs["valueQuantity"] = json!({
                        "value": n,
                        "unit": unit,
                        "system": UCUM_SYSTEM,
                        "code": unit,
                    });
                }
                None => {
                    obs["valueString"] = json!(n.to_string());
                }
            },
            RowValue::Text(t) => {
                obs["valueString"] = json!(t);
            }
        }

        if row.ref_low.is_some() || row.ref_high.is_some() {
            let mut range = json!({});
            if let Some(low) = row.ref_low {
                range["low"] = quantity_with_unit(low, row.unit.as_deref());
            }
            if let Some(high) = row.ref_high {
                range["high"] = quantity_with_unit(high, row.unit.as_deref());
            }
            obs["referenceRange"] = json!([range]);
        } else if let Some(text) = &row.ref_text {
            obs["referenceRange"] = json!([{ "text": text }]);
        }

        if let Some(flag) = row.flag {
            obs["interpretation"] = json!([{
                "coding": [{ "system": INTERPRETATION_SYSTEM, "code": flag.as_str() }]
            }]);
        }

        if let Some(date) = &extraction.report_date {
            obs["effectiveDateTime"] = json!(date);
        }

        entries.push(json!({ "resource": obs }));
    }

    for (idx, med) in extraction.medications.iter().enumerate() {
        let mut request = json!({
            "resourceType": "MedicationRequest",
            "id": format!("med-{}", idx + 1),
            "status": "active",
            "intent": "order",
            "medicationCodeableConcept": { "text": med.medication },
            "subject": { "reference": PATIENT_REF },
            "dosageInstruction": [{ "text": dosage_text(med) }],
        });
        if let Some(date) = &extraction.report_date {
            request["authoredOn"] = json!(date);
        }
        entries.push(json!({ "resource": request }));
    }

    json!({
        "resourceType": "Bundle",
        "type": "collection",
        "entry": entries,
    })
}

/// Safety-mode bundle emitted when the repair budget is exhausted:
/// the patient (whatever identity survived) plus a single annotation
/// observation marking the extraction as degraded.
pub fn fallback_bundle(
    patient: &ExtractedPatient,
    patient_id: &str,
    detail: &str,
) -> Value {
    json!({
        "resourceType": "Bundle",
        "type": "collection",
        "entry": [
            { "resource": patient_resource(patient, patient_id) },
            { "resource": {
                "resourceType": "Observation",
                "id": "obs-degraded",
                "status": "final",
                "category": [{
                    "coding": [{
                        "system": OBSERVATION_CATEGORY_SYSTEM,
                        "code": "laboratory",
                    }]
                }],
                "code": { "text": "Extraction Status" },
                "subject": { "reference": PATIENT_REF },
                "valueString": format!("Degraded extraction: {detail}"),
            }}
        ],
    })
}

/// Append the degraded-extraction annotation to an existing bundle
/// (used when partial data survives an exhausted repair budget).
pub fn append_degraded_note(bundle: &mut Value, detail: &str) {
    let note = json!({ "resource": {
        "resourceType": "Observation",
        "id": "obs-degraded",
        "status": "final",
        "category": [{
            "coding": [{
                "system": OBSERVATION_CATEGORY_SYSTEM,
                "code": "laboratory",
            }]
        }],
        "code": { "text": "Extraction Status" },
        "subject": { "reference": PATIENT_REF },
        "valueString": format!("Degraded extraction: {detail}"),
    }});
    if let Some(entries) = bundle.get_mut("entry").and_then(Value::as_array_mut) {
        entries.push(note);
    }
}

fn patient_resource(patient: &ExtractedPatient, patient_id: &str) -> Value {
    let mut resource = json!({
        "resourceType": "Patient",
        "id": "patient-1",
        "identifier": [{ "value": patient_id }],
    });
    if !patient.given.is_empty() || patient.family.is_some() {
        let mut name = json!({});
        if !patient.given.is_empty() {
            name["given"] = json!(patient.given);
        }
        if let Some(family) = &patient.family {
            name["family"] = json!(family);
        }
        resource["name"] = json!([name]);
    }
    if let Some(identifier) = &patient.identifier {
        if let Some(identifiers) = resource["identifier"].as_array_mut() {
            identifiers.push(json!({ "value": identifier }));
        }
    }
    resource
}

fn code_concept(test_name: &str) -> Value {
    match terminology::loinc_code(test_name) {
        Some(code) => json!({
            "text": test_name,
            "coding": [{
                "system": LOINC_SYSTEM,
                "code": code,
                "display": test_name,
            }]
        }),
        None => json!({ "text": test_name }),
    }
}

fn quantity_with_unit(value: f64, unit: Option<&str>) -> Value {
    match unit {
        Some(unit) => json!({ "value": value, "unit": unit }),
        None => json!({ "value": value }),
    }
}

/// Dosage text joins the prescription fields, preserving the colloquial
/// frequency exactly as extracted.
fn dosage_text(med: &super::types::MedicationRow) -> String {
    [med.dosage.as_deref(), med.frequency.as_deref(), med.duration.as_deref()]
        .iter()
        .flatten()
        .copied()
        .collect::<Vec<_>>()
        .join(", ")
}

/// Minimal R4 compliance check. Returns the path of the first violation.
pub fn validate_bundle_minimal(bundle: &Value) -> Option<String> {
    if bundle.get("resourceType").and_then(Value::as_str) != Some("Bundle") {
        return Some("resourceType".into());
    }
    if bundle.get("type").and_then(Value::as_str) != Some("collection") {
        return Some("type".into());
    }
    let Some(entries) = bundle.get("entry").and_then(Value::as_array) else {
        return Some("entry".into());
    };
    if entries.is_empty() {
        return Some("entry".into());
    }

    let mut patient_count = 0usize;
    for (i, entry) in entries.iter().enumerate() {
        let Some(resource) = entry.get("resource").and_then(Value::as_object) else {
            return Some(format!("entry[{i}].resource"));
        };
        let rtype = resource.get("resourceType").and_then(Value::as_str);
        match rtype {
            Some("Patient") => patient_count += 1,
            Some("Observation") => {
                if let Some(path) = validate_observation(resource, i) {
                    return Some(path);
                }
            }
            Some("MedicationRequest") => {
                if let Some(path) = validate_medication_request(resource, i) {
                    return Some(path);
                }
            }
            _ => return Some(format!("entry[{i}].resource.resourceType")),
        }
    }

    if patient_count != 1 {
        return Some("entry".into());
    }
    None
}

fn validate_observation(
    resource: &serde_json::Map<String, Value>,
    index: usize,
) -> Option<String> {
    let code_text = resource
        .get("code")
        .and_then(|c| c.get("text"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if code_text.trim().is_empty() {
        return Some(format!("entry[{index}].resource.code.text"));
    }

    let has_quantity = resource.contains_key("valueQuantity");
    let has_string = resource.contains_key("valueString");
    if has_quantity == has_string {
        return Some(format!("entry[{index}].resource.valueQuantity"));
    }
    if has_quantity {
        let numeric = resource
            .get("valueQuantity")
            .and_then(|q| q.get("value"))
            .map(Value::is_number)
            .unwrap_or(false);
        if !numeric {
            return Some(format!("entry[{index}].resource.valueQuantity.value"));
        }
    }

    if let Some(date) = resource.get("effectiveDateTime") {
        if !is_iso_date(date) {
            return Some(format!("entry[{index}].resource.effectiveDateTime"));
        }
    }
    None
}

fn validate_medication_request(
    resource: &serde_json::Map<String, Value>,
    index: usize,
) -> Option<String> {
    let text = resource
        .get("medicationCodeableConcept")
        .and_then(|m| m.get("text"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Some(format!(
            "entry[{index}].resource.medicationCodeableConcept.text"
        ));
    }
    if let Some(date) = resource.get("authoredOn") {
        if !is_iso_date(date) {
            return Some(format!("entry[{index}].resource.authoredOn"));
        }
    }
    None
}

fn is_iso_date(value: &Value) -> bool {
    let Some(text) = value.as_str() else {
        return false;
    };
    chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d").is_ok()
        || chrono::DateTime::parse_from_rfc3339(text).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{ExtractedRow, Flag, MedicationRow};

    fn lab_extraction() -> Extraction {
        let mut hemoglobin =
            ExtractedRow::new("Hemoglobin", RowValue::Number(11.0));
        hemoglobin.unit = Some("g/dL".into());
        hemoglobin.ref_low = Some(13.0);
        hemoglobin.ref_high = Some(17.0);
        hemoglobin.flag = Some(Flag::L);

        let mut impression =
            ExtractedRow::new("IMPRESSION", RowValue::Text("unremarkable".into()));
        impression.ref_text = Some("n/a".into());

        Extraction {
            rows: vec![hemoglobin, impression],
            modality: Some(Modality::Lab),
            ..Extraction::default()
        }
    }

    fn observations(bundle: &Value) -> Vec<&Value> {
        bundle["entry"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| &e["resource"])
            .filter(|r| r["resourceType"] == "Observation")
            .collect()
    }

    #[test]
    fn bundle_has_exactly_one_patient() {
        let bundle = bundle_from_extraction(&lab_extraction(), "PT-77");
        let patients: Vec<_> = bundle["entry"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|e| e["resource"]["resourceType"] == "Patient")
            .collect();
        assert_eq!(patients.len(), 1);
        assert_eq!(patients[0]["resource"]["identifier"][0]["value"], "PT-77");
    }

    #[test]
    fn value_type_exclusivity() {
        let bundle = bundle_from_extraction(&lab_extraction(), "PT-77");
        for obs in observations(&bundle) {
            let quantity = obs.get("valueQuantity").is_some();
            let string = obs.get("valueString").is_some();
            assert!(quantity ^ string, "exactly one value type per observation");
        }
    }

    #[test]
    fn numeric_rows_carry_ucum_coded_quantities() {
        let bundle = bundle_from_extraction(&lab_extraction(), "PT-77");
        let obs = observations(&bundle);
        assert_eq!(obs[0]["valueQuantity"]["value"], 11.0);
        assert_eq!(obs[0]["valueQuantity"]["unit"], "g/dL");
        assert_eq!(obs[0]["valueQuantity"]["system"], UCUM_SYSTEM);
        assert_eq!(obs[0]["valueQuantity"]["code"], "g/dL");
    }

    #[test]
    fn unitless_numeric_rows_fall_back_to_value_string() {
        let mut ferritin = ExtractedRow::new("Ferritin", RowValue::Number(82.0));
        ferritin.ref_text = Some("30-400".into());
        let extraction = Extraction {
            rows: vec![ferritin],
            modality: Some(Modality::Lab),
            ..Extraction::default()
        };
        let bundle = bundle_from_extraction(&extraction, "PT-1");
        let obs = observations(&bundle);
        assert!(obs[0].get("valueQuantity").is_none());
        assert_eq!(obs[0]["valueString"], "82");
        assert!(validate_bundle_minimal(&bundle).is_none());
    }

    #[test]
    fn loinc_coding_attached_when_known() {
        let bundle = bundle_from_extraction(&lab_extraction(), "PT-77");
        let obs = observations(&bundle);
        assert_eq!(obs[0]["code"]["coding"][0]["system"], LOINC_SYSTEM);
        assert_eq!(obs[0]["code"]["coding"][0]["code"], "718-7");
        // Unknown test: text only, no coding array.
        assert_eq!(obs[1]["code"]["text"], "IMPRESSION");
        assert!(obs[1]["code"].get("coding").is_none());
    }

    #[test]
    fn interpretation_and_reference_range() {
        let bundle = bundle_from_extraction(&lab_extraction(), "PT-77");
        let obs = observations(&bundle);
        assert_eq!(obs[0]["interpretation"][0]["coding"][0]["code"], "L");
        assert_eq!(obs[0]["referenceRange"][0]["low"]["value"], 13.0);
        assert_eq!(obs[0]["referenceRange"][0]["high"]["unit"], "g/dL");
        assert_eq!(obs[1]["referenceRange"][0]["text"], "n/a");
    }

    #[test]
    fn flag_consistency_against_ranges() {
        let bundle = bundle_from_extraction(&lab_extraction(), "PT-77");
        for obs in observations(&bundle) {
            let (Some(value), Some(low), Some(high)) = (
                obs["valueQuantity"]["value"].as_f64(),
                obs["referenceRange"][0]["low"]["value"].as_f64(),
                obs["referenceRange"][0]["high"]["value"].as_f64(),
            ) else {
                continue;
            };
            let code = obs["interpretation"][0]["coding"][0]["code"]
                .as_str()
                .unwrap();
            if value < low {
                assert_eq!(code, "L");
            } else if value > high {
                assert_eq!(code, "H");
            } else {
                assert_eq!(code, "N");
            }
        }
    }

    #[test]
    fn medication_request_preserves_colloquial_frequency() {
        let extraction = Extraction {
            medications: vec![MedicationRow {
                medication: "Amoxicillin 500mg".into(),
                dosage: Some("1 tab".into()),
                frequency: Some("bid".into()),
                duration: Some("7 days".into()),
            }],
            modality: Some(Modality::Prescription),
            ..Extraction::default()
        };
        let bundle = bundle_from_extraction(&extraction, "PT-1");
        let meds: Vec<_> = bundle["entry"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| &e["resource"])
            .filter(|r| r["resourceType"] == "MedicationRequest")
            .collect();
        assert_eq!(meds.len(), 1);
        assert_eq!(meds[0]["status"], "active");
        assert_eq!(meds[0]["medicationCodeableConcept"]["text"], "Amoxicillin 500mg");
        let text = meds[0]["dosageInstruction"][0]["text"].as_str().unwrap();
        assert!(text.contains("bid"));
        assert!(text.contains("1 tab"));
        assert!(text.contains("7 days"));
    }

    #[test]
    fn report_date_flows_into_effective_and_authored() {
        let mut extraction = lab_extraction();
        extraction.report_date = Some("2026-01-15".into());
        extraction.medications.push(MedicationRow {
            medication: "Metformin".into(),
            dosage: None,
            frequency: Some("twice daily".into()),
            duration: None,
        });
        let bundle = bundle_from_extraction(&extraction, "PT-1");
        assert_eq!(observations(&bundle)[0]["effectiveDateTime"], "2026-01-15");
        let med = &bundle["entry"].as_array().unwrap().last().unwrap()["resource"];
        assert_eq!(med["authoredOn"], "2026-01-15");
        assert!(validate_bundle_minimal(&bundle).is_none());
    }

    #[test]
    fn built_bundle_passes_minimal_validation() {
        let bundle = bundle_from_extraction(&lab_extraction(), "PT-77");
        assert_eq!(validate_bundle_minimal(&bundle), None);
    }

    #[test]
    fn fallback_bundle_is_valid_and_marked_degraded() {
        let patient = ExtractedPatient {
            given: vec!["Asha".into()],
            family: Some("Rao".into()),
            ..ExtractedPatient::default()
        };
        let bundle = fallback_bundle(&patient, "PT-9", "repair budget exhausted");
        assert_eq!(validate_bundle_minimal(&bundle), None);
        let obs = observations(&bundle);
        assert_eq!(obs.len(), 1);
        assert!(obs[0]["valueString"]
            .as_str()
            .unwrap()
            .starts_with("Degraded extraction"));
        let patient_entry = &bundle["entry"][0]["resource"];
        assert_eq!(patient_entry["name"][0]["family"], "Rao");
    }

    #[test]
    fn round_trip_preserves_bundle() {
        let mut extraction = lab_extraction();
        extraction.report_date = Some("2026-01-15".into());
        let bundle = bundle_from_extraction(&extraction, "PT-77");
        let serialized = serde_json::to_string(&bundle).unwrap();
        let reparsed: Value = serde_json::from_str(&serialized).unwrap();
        assert_eq!(bundle, reparsed);
    }

    #[test]
    fn validator_rejects_both_value_types() {
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "collection",
            "entry": [
                { "resource": { "resourceType": "Patient", "id": "patient-1" } },
                { "resource": {
                    "resourceType": "Observation",
                    "code": { "text": "Hemoglobin" },
                    "valueQuantity": { "value": 11.0 },
                    "valueString": "11.0",
                }},
            ],
        });
        let path = validate_bundle_minimal(&bundle).unwrap();
        assert!(path.contains("valueQuantity"));
    }

    #[test]
    fn validator_rejects_missing_value() {
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "collection",
            "entry": [
                { "resource": { "resourceType": "Patient", "id": "patient-1" } },
                { "resource": {
                    "resourceType": "Observation",
                    "code": { "text": "Hemoglobin" },
                }},
            ],
        });
        assert!(validate_bundle_minimal(&bundle).is_some());
    }

    #[test]
    fn validator_rejects_empty_code_text() {
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "collection",
            "entry": [
                { "resource": { "resourceType": "Patient", "id": "patient-1" } },
                { "resource": {
                    "resourceType": "Observation",
                    "code": { "text": "  " },
                    "valueString": "x",
                }},
            ],
        });
        let path = validate_bundle_minimal(&bundle).unwrap();
        assert!(path.ends_with("code.text"));
    }

    #[test]
    fn validator_rejects_multiple_patients() {
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "collection",
            "entry": [
                { "resource": { "resourceType": "Patient", "id": "patient-1" } },
                { "resource": { "resourceType": "Patient", "id": "patient-2" } },
            ],
        });
        assert_eq!(validate_bundle_minimal(&bundle), Some("entry".into()));
    }

    #[test]
    fn validator_rejects_bad_dates() {
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "collection",
            "entry": [
                { "resource": { "resourceType": "Patient", "id": "patient-1" } },
                { "resource": {
                    "resourceType": "Observation",
                    "code": { "text": "Hemoglobin" },
                    "valueString": "x",
                    "effectiveDateTime": "15/01/2026",
                }},
            ],
        });
        let path = validate_bundle_minimal(&bundle).unwrap();
        assert!(path.ends_with("effectiveDateTime"));
    }

    #[test]
    fn validator_rejects_unknown_resource_types() {
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "collection",
            "entry": [
                { "resource": { "resourceType": "Patient", "id": "patient-1" } },
                { "resource": { "resourceType": "Device" } },
            ],
        });
        let path = validate_bundle_minimal(&bundle).unwrap();
        assert!(path.ends_with("resourceType"));
    }

    #[test]
    fn validator_rejects_non_bundle() {
        assert_eq!(
            validate_bundle_minimal(&json!({"resourceType": "Patient"})),
            Some("resourceType".into())
        );
        assert_eq!(
            validate_bundle_minimal(&json!({"resourceType": "Bundle", "type": "batch"})),
            Some("type".into())
        );
    }
}
