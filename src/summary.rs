use crate::client::Fields;
use crate::history::NewRecord;
use serde_json::Value;

const TITLES: &[(&str, &str)] = &[
    ("bazi", "八字命理"),
    ("ziwei", "紫微斗数"),
    ("tarot", "塔罗占卜"),
    ("yijing", "周易卦象"),
    ("daily", "每日运势"),
    ("almanac", "老黄历"),
    ("zodiac", "生肖配对"),
    ("name", "姓名测算"),
    ("dream", "周公解梦"),
    ("fengshui", "风水堪舆"),
];

// Fields worth keeping with a saved reading, in display order.
const METADATA_KEYS: &[&str] = &[
    "question",
    "name",
    "partnerName",
    "gender",
    "birthDate",
    "birthTime",
    "birthPlace",
    "date",
    "cards",
    "spread",
    "hexagram",
    "zodiac",
    "partnerZodiac",
    "dream",
];

const SUMMARY_KEYS: &[&str] = &["question", "name", "birthDate", "date"];

const SUMMARY_CHARS: usize = 50;
const METADATA_TEXT_CHARS: usize = 200;

pub fn title_for(kind: &str) -> String {
    TITLES
        .iter()
        .find(|(known, _)| *known == kind)
        .map_or_else(|| kind.to_string(), |(_, title)| (*title).to_string())
}

pub fn is_known_kind(kind: &str) -> bool {
    TITLES.iter().any(|(known, _)| *known == kind)
}

/// Short line describing what was asked.
pub fn prompt_summary(kind: &str, fields: &Fields) -> String {
    SUMMARY_KEYS
        .iter()
        .filter_map(|key| fields.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|text| !text.is_empty())
        .map_or_else(|| title_for(kind), |text| truncate(text, SUMMARY_CHARS))
}

pub fn metadata(fields: &Fields) -> Fields {
    METADATA_KEYS
        .iter()
        .filter_map(|key| {
            let value = match fields.get(*key)? {
                Value::Null => return None,
                Value::String(text) => Value::String(truncate(text, METADATA_TEXT_CHARS)),
                other => other.clone(),
            };
            Some(((*key).to_string(), value))
        })
        .collect()
}

pub fn record_for(kind: &str, fields: &Fields, result_text: &str) -> NewRecord {
    NewRecord {
        title: title_for(kind),
        prompt_summary: prompt_summary(kind, fields),
        result_text: result_text.to_string(),
        metadata: metadata(fields),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}…", &text[..end]),
        None => text.to_string(),
    }
}
