use super::*;

static PAGE_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:-\s*\d+\s*-|\d+\s*/\s*\d+|p\.?\s*\d+|page\s*\d+|\d+ページ)$")
        .expect("valid page number regex")
});

const AMBIGUOUS_MAX_CHARS: usize = 200;

fn symbol_ratio(text: &str) -> f64 {
    let total = text.chars().filter(|ch| !ch.is_whitespace()).count();
    if total == 0 {
        return 0.0;
    }
    let symbols = text
        .chars()
        .filter(|ch| !ch.is_whitespace() && !ch.is_alphanumeric())
        .count();
    symbols as f64 / total as f64
}

pub(super) fn is_layout_like(text: &str) -> bool {
    let lowered = text.to_lowercase();
    text.chars().count() <= 1 || PAGE_NUMBER.is_match(&lowered) || symbol_ratio(text) > 0.6
}

/// Whether a record carries evidence for `target` in its text or field names.
pub(crate) fn record_has_signal(
    text: &str,
    fields: &BTreeMap<String, String>,
    target: Target,
) -> bool {
    if vocab::has_target_signal(text, target) {
        return true;
    }
    fields.iter().any(|(key, value)| {
        vocab::has_target_signal(key, target)
            || (target == Target::Separation && vocab::has_any(key, vocab::ITEM_FIELD_KEYWORDS) && !value.is_empty())
    })
}

pub(crate) fn candidate_from_record(record: &ExtractedRecord) -> CleanupCandidateRecord {
    let canonical_text = canonicalize(&record.text);
    let fields = record
        .fields
        .iter()
        .map(|(key, value)| (canonicalize(key), canonicalize(value)))
        .filter(|(key, _)| !key.is_empty())
        .collect::<BTreeMap<String, String>>();

    let mut flags = Vec::new();
    if canonical_text.is_empty() {
        flags.push(CleanupFlag::Empty);
    } else {
        if canonical_text != record.text.trim() {
            flags.push(CleanupFlag::Canonicalized);
        }
        if vocab::is_noise_text(&canonical_text) {
            flags.push(CleanupFlag::Noise);
        }
        if is_layout_like(&canonical_text) {
            flags.push(CleanupFlag::LayoutLike);
        }
        let has_signal = record_has_signal(&canonical_text, &fields, record.target);
        if !has_signal || canonical_text.chars().count() > AMBIGUOUS_MAX_CHARS {
            flags.push(CleanupFlag::Ambiguous);
        }
    }

    CleanupCandidateRecord {
        record_id: record.record_id.clone(),
        source_id: record.source_id.clone(),
        target: record.target,
        raw_text: record.text.clone(),
        canonical_text,
        fields,
        flags,
    }
}

/// Deterministic decision: empty or noise drops, everything else is kept (renamed when
/// canonicalisation changed the text). Uncertain records keep a low confidence so the
/// hybrid pass can revisit them.
pub(crate) fn decide(candidate: &CleanupCandidateRecord) -> CleanupResultRecord {
    let (action, confidence, reason) = if candidate.has_flag(CleanupFlag::Empty) {
        (CleanupAction::Drop, 0.99, "empty")
    } else if candidate.has_flag(CleanupFlag::Noise) {
        (CleanupAction::Drop, 0.9, "noise-pattern")
    } else if candidate.has_flag(CleanupFlag::LayoutLike) {
        (keep_or_rename(candidate), 0.4, "layout-like")
    } else if candidate.has_flag(CleanupFlag::Ambiguous) {
        (keep_or_rename(candidate), 0.5, "ambiguous")
    } else {
        (keep_or_rename(candidate), 0.9, "schema-signal")
    };

    let mut reason_tags = vec![reason.to_string()];
    if candidate.has_flag(CleanupFlag::Canonicalized) && action == CleanupAction::Rename {
        reason_tags.push("canonicalized".to_string());
    }

    CleanupResultRecord {
        record_id: candidate.record_id.clone(),
        source_id: candidate.source_id.clone(),
        target: candidate.target,
        action,
        text: candidate.canonical_text.clone(),
        confidence,
        reason_tags,
        fields: candidate.fields.clone(),
        decided_by: "deterministic".to_string(),
    }
}

fn keep_or_rename(candidate: &CleanupCandidateRecord) -> CleanupAction {
    if candidate.has_flag(CleanupFlag::Canonicalized) {
        CleanupAction::Rename
    } else {
        CleanupAction::Keep
    }
}

pub(super) fn needs_review(candidate: &CleanupCandidateRecord, result: &CleanupResultRecord) -> bool {
    result.action != CleanupAction::Drop
        && (candidate.has_flag(CleanupFlag::Ambiguous) || candidate.has_flag(CleanupFlag::LayoutLike))
}
