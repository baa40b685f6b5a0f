use super::*;

const BULLET_CHARS: &[char] = &[
    '・', '･', '•', '●', '○', '◆', '◇', '■', '□', '▪', '▫', '◎', '〇', '※', '→', '＞', '>', '-',
    '*', '+', '–', '—', '―', '‐', '－',
];

static PAREN_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\(\[【〔]\s*\d{1,3}\s*[\)\]】〕]").expect("valid paren number regex")
});

static MARKED_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,3}[.)、:]").expect("valid marked number regex"));

fn is_enclosed_numeral(ch: char) -> bool {
    matches!(ch, '\u{2460}'..='\u{24FF}' | '\u{2776}'..='\u{2793}' | '\u{3251}'..='\u{325F}' | '\u{32B1}'..='\u{32BF}')
}

fn strip_enclosed_numerals(value: &str) -> &str {
    value.trim_start().trim_start_matches(is_enclosed_numeral)
}

/// Removes one leading list marker: bullets, `(1)` or `1.`/`1)`/`1、` when the marker
/// is not the start of a decimal number like `1.5kg`.
fn strip_prefix_once(value: &str) -> &str {
    let trimmed = value.trim_start();

    let without_bullets = trimmed.trim_start_matches(BULLET_CHARS);
    if without_bullets.len() != trimmed.len() {
        return without_bullets.trim_start();
    }

    if let Some(found) = PAREN_NUMBER.find(trimmed) {
        return trimmed[found.end()..].trim_start();
    }

    if let Some(found) = MARKED_NUMBER.find(trimmed) {
        let rest = &trimmed[found.end()..];
        let continues_number = rest
            .chars()
            .next()
            .map(|ch| ch.is_ascii_digit())
            .unwrap_or(false);
        if !continues_number {
            return rest.trim_start();
        }
    }

    trimmed
}

fn canonicalize_once(value: &str) -> String {
    let enclosed_free = strip_enclosed_numerals(value);
    let normalized = enclosed_free.nfkc().collect::<String>();
    let collapsed = normalize_whitespace(&normalized);
    strip_prefix_once(&collapsed).trim().to_string()
}

/// Width/compatibility normalisation, whitespace collapse and list-marker removal,
/// repeated until the text stops changing. `canonicalize(canonicalize(x)) ==
/// canonicalize(x)` for every input.
pub fn canonicalize(value: &str) -> String {
    let mut current = canonicalize_once(value);
    loop {
        let next = canonicalize_once(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}
