use std::collections::BTreeMap;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::commands::extract::CLEAN_RECORDS_FILE;
use crate::config::CityTarget;
use crate::error::PipelineError;
use crate::model::{CleanupResultRecord, ExtractionPlan, SelectionReport, SourceDescriptor, Target};
use crate::runtime::artifacts::{EXTRACTION_PLAN, RunLayout, SELECTION_REPORT};
use crate::runtime::commit::staged_file;
use crate::util::{now_utc_string, read_json, read_ndjson, write_json_pretty};

/// Turns a primary source's clean records into the dataset document for one target.
pub trait DatasetConverter {
    fn convert(
        &self,
        city: &CityTarget,
        target: Target,
        source: &SourceDescriptor,
        records: &[CleanupResultRecord],
    ) -> Result<Value, PipelineError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DatasetRecord<'a> {
    record_id: &'a str,
    text: &'a str,
    fields: &'a BTreeMap<String, String>,
    confidence: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DatasetDocument<'a> {
    target: Target,
    city_id: &'a str,
    prefecture_id: &'a str,
    source: &'a str,
    generated_at: String,
    records: Vec<DatasetRecord<'a>>,
}

/// Passes clean records through unchanged. The day-of-week and sorting-rule shapes are
/// built downstream from this document.
#[derive(Debug, Default)]
pub struct CleanRecordConverter;

impl DatasetConverter for CleanRecordConverter {
    fn convert(
        &self,
        city: &CityTarget,
        target: Target,
        source: &SourceDescriptor,
        records: &[CleanupResultRecord],
    ) -> Result<Value, PipelineError> {
        let document = DatasetDocument {
            target,
            city_id: &city.city_id,
            prefecture_id: &city.prefecture_id,
            source: &source.url,
            generated_at: now_utc_string(),
            records: records
                .iter()
                .filter(|record| record.action.is_clean())
                .map(|record| DatasetRecord {
                    record_id: &record.record_id,
                    text: &record.text,
                    fields: &record.fields,
                    confidence: record.confidence,
                })
                .collect(),
        };
        let value = serde_json::to_value(&document)
            .map_err(|err| PipelineError::Schema(format!("failed to encode {target} dataset: {err}")))?;
        check_structure(target, &value)?;
        Ok(value)
    }
}

/// Minimal structural check on a converted document: a matching target and at least one
/// record.
pub fn check_structure(target: Target, document: &Value) -> Result<(), PipelineError> {
    if document.get("target").and_then(Value::as_str) != Some(target.as_str()) {
        return Err(PipelineError::Schema(format!(
            "{target} dataset has a missing or mismatched target field"
        )));
    }
    match document.get("records").and_then(Value::as_array) {
        Some(records) if !records.is_empty() => Ok(()),
        _ => Err(PipelineError::Schema(format!("{target} dataset has no records"))),
    }
}

/// Stages one document per target and returns the source URL each was built from.
pub fn run(
    layout: &RunLayout,
    city: &CityTarget,
    converter: &dyn DatasetConverter,
) -> Result<BTreeMap<Target, String>> {
    let selection: SelectionReport = read_json(&layout.file(SELECTION_REPORT))?;
    let plan: ExtractionPlan = read_json(&layout.file(EXTRACTION_PLAN))?;

    let mut sources = BTreeMap::new();
    for target in Target::ALL {
        let decision = selection.decision(target).ok_or_else(|| {
            PipelineError::Pipeline(format!("selection report has no decision for {target}"))
        })?;
        let source = plan.source(&decision.primary_source_id).ok_or_else(|| {
            PipelineError::Pipeline(format!(
                "primary {} for {target} is missing from the extraction plan",
                decision.primary_source_id
            ))
        })?;

        let records: Vec<CleanupResultRecord> = read_ndjson(
            &layout
                .extract_dir(&decision.primary_source_id, target)
                .join(CLEAN_RECORDS_FILE),
        )?;
        let document = converter.convert(city, target, source, &records)?;

        let path = staged_file(&layout.staging_dir(), target);
        write_json_pretty(&path, &document)?;
        info!(target = %target, source = %source.url, records = records.len(), path = %path.display(), "staged dataset");
        sources.insert(target, source.url.clone());
    }

    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CleanupAction, SourceType};

    fn city() -> CityTarget {
        CityTarget {
            city_id: "131016".to_string(),
            prefecture_id: "13".to_string(),
            city_name: "千代田区".to_string(),
            prefecture_name: None,
            official_url: None,
            official_domains: Vec::new(),
        }
    }

    fn source() -> SourceDescriptor {
        SourceDescriptor {
            id: "cand-a".to_string(),
            url: "https://www.city.example.lg.jp/a.csv".to_string(),
            local_path: "sources/cand-a.csv".to_string(),
            source_type: SourceType::Csv,
            mime: Some("text/csv".to_string()),
            charset: None,
            trust_score: 1.0,
        }
    }

    fn record(id: &str, action: CleanupAction) -> CleanupResultRecord {
        CleanupResultRecord {
            record_id: id.to_string(),
            source_id: "cand-a".to_string(),
            target: Target::Schedule,
            action,
            text: "燃やすごみ 月曜日".to_string(),
            confidence: 0.9,
            reason_tags: Vec::new(),
            fields: BTreeMap::new(),
            decided_by: "deterministic".to_string(),
        }
    }

    #[test]
    fn dropped_records_never_reach_the_dataset() {
        let value = CleanRecordConverter
            .convert(
                &city(),
                Target::Schedule,
                &source(),
                &[record("r1", CleanupAction::Keep), record("r2", CleanupAction::Drop)],
            )
            .unwrap();
        assert_eq!(value["cityId"], "131016");
        assert_eq!(value["source"], "https://www.city.example.lg.jp/a.csv");
        assert_eq!(value["records"].as_array().unwrap().len(), 1);
        assert_eq!(value["records"][0]["recordId"], "r1");
    }

    #[test]
    fn empty_dataset_is_a_schema_error() {
        let err = CleanRecordConverter
            .convert(
                &city(),
                Target::Separation,
                &source(),
                &[record("r1", CleanupAction::Drop)],
            )
            .unwrap_err();
        assert_eq!(err.code(), "schema");
        assert!(!err.retryable());
    }

    #[test]
    fn structure_check_rejects_a_mismatched_target() {
        let document = serde_json::json!({"target": "schedule", "records": [{"text": "x"}]});
        assert!(check_structure(Target::Schedule, &document).is_ok());
        assert!(check_structure(Target::Separation, &document).is_err());
    }
}
