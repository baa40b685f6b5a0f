use super::*;

const PRIMARY_PARSE_SUCCESS: f64 = 1.0;
const FALLBACK_PARSE_SUCCESS: f64 = 0.6;

pub(super) struct Dispatched {
    pub executor: Option<ExecutorType>,
    pub used_fallback: bool,
    pub output: ExecutorOutput,
    pub attempts: Vec<ExecutorAttempt>,
}

impl Dispatched {
    pub fn parse_success(&self) -> f64 {
        match (self.executor, self.used_fallback) {
            (Some(_), false) => PRIMARY_PARSE_SUCCESS,
            (Some(_), true) => FALLBACK_PARSE_SUCCESS,
            (None, _) => 0.0,
        }
    }
}

/// Size/path stub for a type without a local parser. No records are produced.
pub(super) fn placeholder_stub(executor: ExecutorType, input: &ExecutorInput<'_>) -> String {
    format!(
        "no local {executor} parser; {} bytes at {} left for a model-native extractor",
        input.bytes.len(),
        input.local_path
    )
}

fn run_executor(
    executor: ExecutorType,
    input: &ExecutorInput<'_>,
) -> Option<Result<ExecutorOutput, PipelineError>> {
    match executor {
        ExecutorType::Csv => Some(execute_csv(input)),
        ExecutorType::Html => Some(execute_html(input)),
        ExecutorType::Api => Some(execute_api(input)),
        ExecutorType::Xlsx | ExecutorType::Pdf | ExecutorType::Image => None,
    }
}

/// Walks the primary executor and then the fallbacks in order; the first one that yields
/// records wins. Links found by an executor that produced nothing are kept so the page
/// can still be followed.
pub(super) fn dispatch(
    primary: ExecutorType,
    fallback: &[ExecutorType],
    input: &ExecutorInput<'_>,
) -> Dispatched {
    let mut attempts = Vec::new();
    let mut links = Vec::new();

    let chain = std::iter::once(primary).chain(fallback.iter().copied());
    for (position, executor) in chain.enumerate() {
        let Some(result) = run_executor(executor, input) else {
            attempts.push(ExecutorAttempt {
                executor,
                status: "unsupported".to_string(),
                records: 0,
                detail: Some(placeholder_stub(executor, input)),
            });
            continue;
        };

        match result {
            Ok(output) if !output.records.is_empty() => {
                attempts.push(ExecutorAttempt {
                    executor,
                    status: "ok".to_string(),
                    records: output.records.len(),
                    detail: None,
                });
                return Dispatched {
                    executor: Some(executor),
                    used_fallback: position > 0,
                    output,
                    attempts,
                };
            }
            Ok(output) => {
                attempts.push(ExecutorAttempt {
                    executor,
                    status: "empty".to_string(),
                    records: 0,
                    detail: None,
                });
                if links.is_empty() {
                    links = output.links;
                }
            }
            Err(err) => {
                debug!(executor = %executor, source_id = input.source_id, error = %err, "executor failed");
                attempts.push(ExecutorAttempt {
                    executor,
                    status: "failed".to_string(),
                    records: 0,
                    detail: Some(err.to_string()),
                });
            }
        }
    }

    Dispatched {
        executor: None,
        used_fallback: false,
        output: ExecutorOutput {
            records: Vec::new(),
            links,
        },
        attempts,
    }
}
