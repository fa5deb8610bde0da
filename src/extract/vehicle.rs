use once_cell::sync::Lazy;
use regex::Regex;

use super::strip_emphasis;

/// A pure extraction strategy; `None` means "did not match".
pub type Strategy = fn(&str) -> Option<String>;

/// Tried in order, first match wins.
pub const STRATEGIES: &[(&str, Strategy)] = &[
    ("bold_label", bold_label),
    ("plain_label", plain_label),
    ("key_value", key_value),
];

static BOLD_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\*\*[ \t]*vehicle[ _-]?id[ \t]*:?[ \t]*\*\*[ \t]*:?[ \t]*([^\n]*)").expect("valid pattern")
});

static PLAIN_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bvehicle[ -]id[ \t]*:[ \t]*([^\n]*)").expect("valid pattern")
});

static KEY_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)"?\bvehicle_?id"?[ \t]*[=:][ \t]*"?([A-Za-z0-9][A-Za-z0-9_.:\-]*)"?"#).expect("valid pattern")
});

static SUMMARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)vehicle[ _-]?id[^\n–—]*[–—][ \t]*([^\n]+)").expect("valid pattern")
});

/// Run the strategies in order.
pub fn vehicle_id(text: &str) -> Option<String> {
    STRATEGIES.iter().find_map(|(name, strategy)| {
        let found = strategy(text);
        if let Some(ref id) = found {
            tracing::trace!(strategy = name, vehicle_id = %id, "Vehicle id extracted");
        }
        found
    })
}

/// `**Vehicle ID:** VH001 – Electric Vehicle`
pub fn bold_label(text: &str) -> Option<String> {
    capture(&BOLD_LABEL, text).and_then(clean_value)
}

/// `Vehicle ID: VH001`
pub fn plain_label(text: &str) -> Option<String> {
    capture(&PLAIN_LABEL, text).and_then(clean_value)
}

/// `vehicle_id = VH001` or `"vehicle_id": "VH001"`
pub fn key_value(text: &str) -> Option<String> {
    capture(&KEY_VALUE, text).and_then(clean_value)
}

/// Text after the dash on the vehicle id line
pub fn summary(text: &str) -> Option<String> {
    capture(&SUMMARY, text).and_then(|s| {
        let s = strip_emphasis(s);
        (!s.is_empty()).then_some(s)
    })
}

fn capture<'t>(re: &Regex, text: &'t str) -> Option<&'t str> {
    re.captures(text)?.get(1).map(|m| m.as_str())
}

/// Cut at a dash separator or cell delimiter and strip emphasis.
fn clean_value(raw: &str) -> Option<String> {
    let cut = raw
        .split(['–', '—', '|'])
        .next()
        .unwrap_or_default();
    let cut = cut.split(" - ").next().unwrap_or_default();
    let value = strip_emphasis(cut)
        .trim_end_matches([',', ';', '.'])
        .trim()
        .to_string();
    (!value.is_empty()).then_some(value)
}
