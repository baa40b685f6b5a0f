use super::*;

const MAIN_CONTAINERS: &[&str] = &[
    "#main",
    "#contents",
    "#content",
    "#main-content",
    "#tmp_contents",
    "main",
    "article",
];
const SKIPPED_ANCESTORS: &[&str] = &["nav", "header", "footer", "script", "style", "noscript", "aside"];

/// Cells that only ever appear in a table's heading row.
const HEADER_CELL_WORDS: &[&str] = &[
    "品目", "品名", "分別区分", "区分", "出し方", "収集日", "収集曜日", "曜日", "地区", "地区名",
    "町名", "備考", "種類", "ごみの種類", "no", "番号", "item", "category", "day",
];

const BLOCK_MIN_CHARS: usize = 4;
const BLOCK_MAX_CHARS: usize = 400;
const BLOCK_MIN_SCORE: f64 = 0.4;
const MAX_TEXT_LINES: usize = 500;
const MAX_LINK_CANDIDATES: usize = 30;

fn element_text(element: ElementRef<'_>) -> String {
    normalize_whitespace(&element.text().collect::<Vec<&str>>().join(" "))
}

fn has_ancestor(element: ElementRef<'_>, names: &[&str]) -> bool {
    element.ancestors().any(|node| {
        node.value()
            .as_element()
            .map(|parent| names.contains(&parent.name()))
            .unwrap_or(false)
    })
}

fn main_slice(document: &Html) -> Option<ElementRef<'_>> {
    for container in MAIN_CONTAINERS.iter().chain(["body"].iter()) {
        let Ok(selector) = Selector::parse(container) else {
            continue;
        };
        if let Some(found) = document.select(&selector).next() {
            return Some(found);
        }
    }
    None
}

fn target_hits(text: &str, target: Target) -> usize {
    let own = match target {
        Target::Schedule => vocab::distinct_hits(text, vocab::SCHEDULE_KEYWORDS),
        Target::Separation => {
            vocab::distinct_hits(text, vocab::SEPARATION_KEYWORDS)
                + vocab::distinct_hits(text, vocab::CATEGORY_KEYWORDS)
        }
    };
    own + vocab::distinct_hits(text, vocab::WASTE_KEYWORDS)
}

fn is_header_cell(text: &str) -> bool {
    let lowered = text.to_lowercase();
    HEADER_CELL_WORDS.iter().any(|word| lowered == *word)
}

/// All non-empty cells are `<th>`, or every one of them is a known column heading.
pub(super) fn is_header_row(cells: &[(bool, String)]) -> bool {
    let filled = cells
        .iter()
        .filter(|(_, text)| !text.is_empty())
        .collect::<Vec<_>>();
    if filled.is_empty() {
        return true;
    }
    (filled.len() > 1 && filled.iter().all(|(is_th, _)| *is_th))
        || filled.iter().all(|(_, text)| is_header_cell(text))
}

/// Length window, keyword evidence and date/weekday tokens raise the score; URLs and
/// navigation boilerplate lower it.
pub(super) fn score_block(text: &str, target: Target) -> f64 {
    let chars = text.chars().count();
    if !(BLOCK_MIN_CHARS..=BLOCK_MAX_CHARS).contains(&chars) {
        return 0.0;
    }
    let mut score = 0.2 + 0.15 * target_hits(text, target).min(4) as f64;
    if vocab::has_date_or_weekday(text) {
        score += 0.2;
    }
    if text.contains("http://") || text.contains("https://") || text.contains("www.") {
        score -= 0.3;
    }
    if vocab::is_noise_text(text) {
        score -= 0.6;
    }
    clamp_unit(score)
}

fn table_rows(slice: ElementRef<'_>) -> Vec<(BTreeMap<String, String>, String)> {
    let (Ok(table_sel), Ok(row_sel), Ok(cell_sel)) = (
        Selector::parse("table"),
        Selector::parse("tr"),
        Selector::parse("th, td"),
    ) else {
        return Vec::new();
    };

    let mut rows = Vec::new();
    for table in slice.select(&table_sel) {
        if has_ancestor(table, SKIPPED_ANCESTORS) || has_ancestor(table, &["table"]) {
            continue;
        }
        let mut header: Vec<String> = Vec::new();
        for row in table.select(&row_sel) {
            let cells = row
                .select(&cell_sel)
                .map(|cell| (cell.value().name() == "th", element_text(cell)))
                .collect::<Vec<(bool, String)>>();
            if is_header_row(&cells) {
                if cells.iter().any(|(_, text)| !text.is_empty()) {
                    header = cells.into_iter().map(|(_, text)| text).collect();
                }
                continue;
            }

            let text = cells
                .iter()
                .map(|(_, text)| text.as_str())
                .filter(|text| !text.is_empty())
                .collect::<Vec<&str>>()
                .join(" ");
            if vocab::is_noise_text(&text) {
                continue;
            }

            let fields = cells
                .iter()
                .enumerate()
                .filter(|(_, (_, value))| !value.is_empty())
                .map(|(column, (_, value))| {
                    let key = header
                        .get(column)
                        .filter(|name| !name.is_empty())
                        .cloned()
                        .unwrap_or_else(|| format!("column{}", column + 1));
                    (key, value.clone())
                })
                .collect::<BTreeMap<String, String>>();
            rows.push((fields, text));
        }
    }
    rows
}

fn text_blocks(slice: ElementRef<'_>, target: Target) -> Vec<String> {
    let Ok(block_sel) = Selector::parse("p, li, dd, dt, h2, h3, h4") else {
        return Vec::new();
    };
    slice
        .select(&block_sel)
        .filter(|block| !has_ancestor(*block, SKIPPED_ANCESTORS) && !has_ancestor(*block, &["table"]))
        .map(element_text)
        .filter(|text| score_block(text, target) >= BLOCK_MIN_SCORE)
        .collect()
}

fn text_lines(slice: ElementRef<'_>) -> Vec<String> {
    let mut lines = Vec::new();
    for node in slice.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let inside_skipped = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .map(|element| SKIPPED_ANCESTORS.contains(&element.name()))
                .unwrap_or(false)
        });
        if inside_skipped {
            continue;
        }
        let line = normalize_whitespace(text);
        if line.chars().count() >= 2 && !vocab::is_noise_text(&line) {
            lines.push(line);
        }
        if lines.len() >= MAX_TEXT_LINES {
            break;
        }
    }
    lines
}

fn link_directness(source_type: SourceType) -> f64 {
    match source_type {
        SourceType::Csv | SourceType::Xlsx | SourceType::Api => 1.0,
        SourceType::Pdf => 0.6,
        SourceType::Html => 0.4,
        SourceType::Image => 0.3,
        SourceType::Unknown => 0.2,
    }
}

/// `0.5·directness + 0.5·min(1, 0.5·keyword hits)` over the anchor text and URL.
pub(super) fn score_link(url: &str, text: &str, target: Target) -> (SourceType, f64) {
    let source_type = source_type_from_url(url).unwrap_or(SourceType::Html);
    let hits = target_hits(&format!("{text} {url}"), target);
    let relevance = (0.5 * hits as f64).min(1.0);
    (source_type, 0.5 * link_directness(source_type) + 0.5 * relevance)
}

fn link_candidates(slice: ElementRef<'_>, base_url: &str, target: Target) -> Vec<LinkCandidate> {
    let Ok(anchor_sel) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let base = url::Url::parse(base_url).ok();

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for anchor in slice.select(&anchor_sel) {
        if has_ancestor(anchor, SKIPPED_ANCESTORS) {
            continue;
        }
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let resolved = match &base {
            Some(base) => base.join(href.trim()).ok(),
            None => url::Url::parse(href.trim()).ok(),
        };
        let Some(mut resolved) = resolved else {
            continue;
        };
        if !matches!(resolved.scheme(), "http" | "https") {
            continue;
        }
        resolved.set_fragment(None);
        let url = resolved.to_string();
        if url == base_url || vocab::is_utility_url(&url) || !seen.insert(url.clone()) {
            continue;
        }

        let text = element_text(anchor);
        let (source_type, score) = score_link(&url, &text, target);
        links.push(LinkCandidate {
            url,
            text,
            source_type,
            score,
        });
    }

    links.sort_by(|left, right| {
        right
            .score
            .total_cmp(&left.score)
            .then_with(|| left.url.cmp(&right.url))
    });
    links.truncate(MAX_LINK_CANDIDATES);
    links
}

fn looks_binary(bytes: &[u8]) -> bool {
    bytes.iter().take(1024).any(|byte| *byte == 0)
}

/// Tables first, then scored text blocks; flattened text lines only when neither
/// produced anything. Lines are deduplicated by normalised text.
pub(super) fn execute_html(input: &ExecutorInput<'_>) -> Result<ExecutorOutput, PipelineError> {
    if looks_binary(input.bytes) {
        return Err(PipelineError::Extraction(format!(
            "{} is not a text document",
            input.local_path
        )));
    }

    let document = Html::parse_document(&input.text());
    let Some(slice) = main_slice(&document) else {
        return Ok(ExecutorOutput::default());
    };

    let mut extracted = table_rows(slice)
        .into_iter()
        .map(|(fields, text)| (RecordOrigin::TableRow, fields, text))
        .collect::<Vec<_>>();
    extracted.extend(
        text_blocks(slice, input.target)
            .into_iter()
            .map(|text| (RecordOrigin::TextBlock, BTreeMap::new(), text)),
    );
    if extracted.is_empty() {
        extracted.extend(
            text_lines(slice)
                .into_iter()
                .map(|text| (RecordOrigin::TextLine, BTreeMap::new(), text)),
        );
    }

    let mut seen = HashSet::new();
    let mut records = Vec::new();
    for (origin, fields, text) in extracted {
        if text.is_empty() || !seen.insert(text.to_lowercase()) {
            continue;
        }
        records.push(input.record(records.len(), origin, fields, text));
    }

    let links = if input.depth == 0 {
        link_candidates(slice, input.base_url, input.target)
    } else {
        Vec::new()
    };

    Ok(ExecutorOutput { records, links })
}
