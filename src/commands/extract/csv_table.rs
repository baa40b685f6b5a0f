use super::*;

const HEADER_SCAN_ROWS: usize = 8;
const MAX_CSV_RECORDS: usize = 5_000;
const DELIMITERS: [u8; 3] = [b',', b'\t', b';'];

/// Column-name vocabulary; a cell earns the column bonus when it names a column
/// ("収集曜日") rather than holding a value ("月曜日").
const HEADER_CELL_KEYWORDS: &[&str] = &[
    "曜日", "収集日", "品目", "品名", "分別", "区分", "地区", "地域", "町名", "種類", "出し方",
    "備考", "weekday", "day", "item", "category", "area",
];

pub(super) fn detect_delimiter(text: &str) -> u8 {
    let sample = text.lines().take(5).collect::<Vec<&str>>();
    let mut best = (b',', 0_usize);
    for delimiter in DELIMITERS {
        let count = sample
            .iter()
            .map(|line| line.matches(delimiter as char).count())
            .sum::<usize>();
        if count > best.1 {
            best = (delimiter, count);
        }
    }
    best.0
}

fn names_weekday(cell: &str) -> bool {
    vocab::has_any(cell, vocab::WEEKDAY_KEYWORDS)
}

fn names_column(cell: &str) -> bool {
    vocab::has_any(cell, HEADER_CELL_KEYWORDS) && !names_weekday(cell)
}

/// Non-empty cells plus two points per weekday cell, plus two per cell naming a column.
pub(super) fn header_score(row: &[String]) -> usize {
    let non_empty = row.iter().filter(|cell| !cell.is_empty()).count();
    let weekday_cells = row.iter().filter(|cell| names_weekday(cell)).count();
    let column_cells = row.iter().filter(|cell| names_column(cell)).count();
    non_empty + 2 * weekday_cells + 2 * column_cells
}

/// Best-scoring row among the first few; ties go to the earlier row.
pub(super) fn pick_header_row(rows: &[Vec<String>]) -> Option<usize> {
    let mut best: Option<(usize, usize)> = None;
    for (index, row) in rows.iter().take(HEADER_SCAN_ROWS).enumerate() {
        let score = header_score(row);
        if best.map(|(_, top)| score > top).unwrap_or(true) {
            best = Some((index, score));
        }
    }
    best.map(|(index, _)| index)
}

fn header_keys(header: &[String], width: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    (0..width)
        .map(|column| {
            let base = header
                .get(column)
                .map(|cell| normalize_whitespace(cell))
                .filter(|cell| !cell.is_empty())
                .unwrap_or_else(|| format!("column{}", column + 1));
            let mut key = base.clone();
            let mut suffix = 2;
            while !seen.insert(key.clone()) {
                key = format!("{base}_{suffix}");
                suffix += 1;
            }
            key
        })
        .collect()
}

pub(super) fn read_rows(text: &str) -> Result<Vec<Vec<String>>, PipelineError> {
    let mut reader = ::csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(detect_delimiter(text))
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|err| PipelineError::Extraction(format!("csv parse failed: {err}")))?;
        let cells = row
            .iter()
            .map(|cell| normalize_whitespace(cell))
            .collect::<Vec<String>>();
        if cells.iter().any(|cell| !cell.is_empty()) {
            rows.push(cells);
        }
    }
    Ok(rows)
}

pub(super) fn execute_csv(input: &ExecutorInput<'_>) -> Result<ExecutorOutput, PipelineError> {
    let rows = read_rows(&input.text())?;
    let Some(header_index) = pick_header_row(&rows) else {
        return Ok(ExecutorOutput::default());
    };

    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    let keys = header_keys(&rows[header_index], width);

    let mut records = Vec::new();
    for row in rows.iter().skip(header_index + 1).take(MAX_CSV_RECORDS) {
        let fields = row
            .iter()
            .enumerate()
            .filter(|(_, cell)| !cell.is_empty())
            .map(|(column, cell)| (keys[column].clone(), cell.clone()))
            .collect::<BTreeMap<String, String>>();
        let text = row
            .iter()
            .filter(|cell| !cell.is_empty())
            .cloned()
            .collect::<Vec<String>>()
            .join(" ");
        records.push(input.record(records.len(), RecordOrigin::CsvRow, fields, text));
    }

    debug!(
        source_id = input.source_id,
        header_row = header_index,
        records = records.len(),
        "csv rows extracted"
    );
    Ok(ExecutorOutput {
        records,
        links: Vec::new(),
    })
}
