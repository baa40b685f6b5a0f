use super::*;

const MAX_API_RECORDS: usize = 300;

fn field_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(normalize_whitespace(text)),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(number) => Some(number.to_string()),
        nested => Some(nested.to_string()),
    }
}

pub(super) fn flatten_object(value: &Value) -> BTreeMap<String, String> {
    match value {
        Value::Object(map) => map
            .iter()
            .filter_map(|(key, value)| field_value(value).map(|text| (key.clone(), text)))
            .filter(|(_, text)| !text.is_empty())
            .collect(),
        other => field_value(other)
            .map(|text| BTreeMap::from([("value".to_string(), text)]))
            .unwrap_or_default(),
    }
}

pub(super) fn execute_api(input: &ExecutorInput<'_>) -> Result<ExecutorOutput, PipelineError> {
    let text = input.text();
    let body: Value = serde_json::from_str(text.trim_start_matches('\u{feff}'))
        .map_err(|err| PipelineError::Extraction(format!("{} is not JSON: {err}", input.local_path)))?;

    let items = match body {
        Value::Array(items) => items,
        single => vec![single],
    };

    let mut records = Vec::new();
    for item in items.iter().take(MAX_API_RECORDS) {
        let fields = flatten_object(item);
        if fields.is_empty() {
            continue;
        }
        let text = fields.values().cloned().collect::<Vec<String>>().join(" ");
        records.push(input.record(records.len(), RecordOrigin::ApiObject, fields, text));
    }

    Ok(ExecutorOutput {
        records,
        links: Vec::new(),
    })
}
