//! Keyword vocabularies for Japanese municipal waste pages and the signal detectors built
//! on them. Discovery, extraction and cleanup all score text with the same lists.

use std::sync::LazyLock;

use regex::Regex;

use crate::model::Target;

pub const WASTE_KEYWORDS: &[&str] = &[
    "ごみ", "ゴミ", "資源", "可燃", "不燃", "燃やす", "燃える", "燃えない", "粗大", "プラ",
    "びん", "缶", "ペットボトル", "古紙", "有害", "waste", "garbage", "recycl", "trash",
];

pub const CATEGORY_KEYWORDS: &[&str] = &[
    "可燃", "不燃", "燃やす", "燃える", "燃えない", "資源", "粗大", "プラスチック", "容器包装",
    "びん", "缶", "ペットボトル", "古紙", "有害", "危険", "burnable", "non-burnable",
    "recyclable", "oversized",
];

pub const SCHEDULE_KEYWORDS: &[&str] = &[
    "収集日", "収集カレンダー", "ごみカレンダー", "カレンダー", "収集曜日", "曜日", "収集日程",
    "地区別", "schedule", "calendar", "collection day",
];

pub const SEPARATION_KEYWORDS: &[&str] = &[
    "分別", "出し方", "分け方", "品目", "品名", "五十音", "辞典", "早見表", "separation",
    "sorting", "how to sort",
];

pub const WEEKDAY_KEYWORDS: &[&str] = &[
    "月曜", "火曜", "水曜", "木曜", "金曜", "土曜", "日曜", "(月)", "(火)", "(水)", "(木)",
    "(金)", "(土)", "(日)", "monday", "tuesday", "wednesday", "thursday", "friday",
    "saturday", "sunday",
];

pub const ITEM_FIELD_KEYWORDS: &[&str] = &["品目", "品名", "item", "name", "名称"];

pub const NOISE_PATTERNS: &[&str] = &[
    "copyright", "©", "all rights reserved", "ページの先頭", "ページトップ", "サイトマップ",
    "お問い合わせ", "問い合わせ先", "javascript", "cookie", "ログイン", "プライバシー",
    "アクセシビリティ", "ウェブアクセシビリティ", "このページ", "印刷", "facebook", "twitter",
    "line で送る", "シェア", "本文へ", "メニュー", "english", "文字サイズ", "背景色",
    "adobe", "acrobat reader", "pdfファイルを", "よくある質問",
];

pub const UTILITY_URL_PATTERNS: &[&str] = &[
    "/search", "sitemap", "/login", "/contact", "inquiry", "toiawase", "privacy", "/english",
    "/en/", "accessibility", "/rss", "facebook.com", "twitter.com", "//x.com/", "youtube.com",
    "instagram.com", "line.me", "mailto:", "javascript:", "/faq", "/link/",
];

static DATE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{1,2}月\d{1,2}日|\d{4}[/\-.]\d{1,2}[/\-.]\d{1,2}|\d{1,2}/\d{1,2}|第[1-5１-５][月火水木金土日]")
        .expect("valid date regex")
});

/// Number of distinct vocabulary entries that appear in `text` (case-insensitive).
pub fn distinct_hits(text: &str, vocabulary: &[&str]) -> usize {
    let lowered = text.to_lowercase();
    vocabulary
        .iter()
        .filter(|keyword| lowered.contains(&keyword.to_lowercase()))
        .count()
}

pub fn has_any(text: &str, vocabulary: &[&str]) -> bool {
    distinct_hits(text, vocabulary) > 0
}

pub fn has_date_or_weekday(text: &str) -> bool {
    has_any(text, WEEKDAY_KEYWORDS) || DATE_PATTERN.is_match(text)
}

pub fn is_noise_text(text: &str) -> bool {
    has_any(text, NOISE_PATTERNS)
}

pub fn is_utility_url(url: &str) -> bool {
    has_any(url, UTILITY_URL_PATTERNS)
}

/// Whether `text` carries vocabulary that belongs to `target`.
pub fn has_target_signal(text: &str, target: Target) -> bool {
    match target {
        Target::Schedule => {
            has_any(text, SCHEDULE_KEYWORDS)
                || (has_date_or_weekday(text) && has_any(text, WASTE_KEYWORDS))
        }
        Target::Separation => {
            has_any(text, SEPARATION_KEYWORDS) || has_any(text, CATEGORY_KEYWORDS)
        }
    }
}

/// Keyword relevance in [0, 1] plus the targets the text looks like it serves.
pub fn relevance(text: &str) -> (f64, Vec<Target>) {
    let waste = distinct_hits(text, WASTE_KEYWORDS);
    let schedule = distinct_hits(text, SCHEDULE_KEYWORDS) + distinct_hits(text, WEEKDAY_KEYWORDS).min(2);
    let separation = distinct_hits(text, SEPARATION_KEYWORDS);

    let score = 0.15 * waste as f64 + 0.2 * schedule as f64 + 0.2 * separation as f64;
    let mut hints = Vec::new();
    if schedule > 0 {
        hints.push(Target::Schedule);
    }
    if separation > 0 {
        hints.push(Target::Separation);
    }
    (score.min(1.0), hints)
}
