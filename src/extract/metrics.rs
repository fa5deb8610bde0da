use std::collections::BTreeMap;

use super::strip_emphasis;

/// Explode a "key values" cell such as `SOC 67.68 %, Pack 371.1 V` into
/// `{"SOC": "67.68 %", "Pack": "371.1 V"}`.
///
/// Tokens are separated by commas or semicolons, or only by whitespace
/// (`SOC 67% SoH 96%`). Values keep their literal text, units included.
/// Later duplicates of a key replace earlier ones.
pub fn explode(cell: &str) -> BTreeMap<String, String> {
    let mut metrics = BTreeMap::new();

    for part in cell.split([',', ';']) {
        let part = strip_emphasis(part);
        for (key, value) in pairs(&part) {
            metrics.insert(key.to_string(), value.to_string());
        }
    }

    metrics
}

/// Byte spans of whitespace-separated words
fn words(s: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = None;
    for (i, c) in s.char_indices() {
        match (c.is_whitespace(), start) {
            (true, Some(st)) => {
                spans.push((st, i));
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(st) = start {
        spans.push((st, s.len()));
    }
    spans
}

fn is_numeric(word: &str) -> bool {
    let mut chars = word.chars();
    match chars.next() {
        Some(c) if c.is_ascii_digit() => true,
        Some('-' | '+' | '.' | '~' | '≈') => chars.next().is_some_and(|c| c.is_ascii_digit() || c == '.'),
        _ => false,
    }
}

/// Units are short or symbol-bearing words that are not themselves a key
/// followed by a number. `rest` is every word after `word` in the part.
fn is_unit(word: &str, rest: &[&str]) -> bool {
    if rest.first().is_some_and(|w| is_numeric(w)) {
        return false;
    }
    if !word.chars().all(char::is_alphabetic) {
        return true;
    }
    word.chars().count() <= 3 && !(is_name(word) && rest.iter().any(|w| is_numeric(w)))
}

/// Capitalized word such as `Pad` or `SoH`, as opposed to `V`, `Nm` or `kWh`
fn is_name(word: &str) -> bool {
    let mut chars = word.chars();
    word.chars().count() >= 3
        && chars.next().is_some_and(char::is_uppercase)
        && chars.any(char::is_lowercase)
}

fn pairs(part: &str) -> Vec<(&str, &str)> {
    let spans = words(part);
    let all: Vec<&str> = spans.iter().map(|&(s, e)| &part[s..e]).collect();
    let word = |i: usize| all[i];
    let mut out = Vec::new();
    let mut i = 0;

    while i < spans.len() {
        // key: words up to the first numeric word
        let key_start = i;
        while i < spans.len() && !is_numeric(word(i)) {
            i += 1;
        }
        if i == spans.len() || i == key_start {
            // no value, or a value with no key
            if i == key_start {
                i += 1;
            }
            continue;
        }
        let key = &part[spans[key_start].0..spans[i - 1].1];

        // value: the numeric word plus following numbers and units
        let value_start = i;
        i += 1;
        while i < spans.len() {
            if is_numeric(word(i)) || is_unit(word(i), &all[i + 1..]) {
                i += 1;
            } else {
                break;
            }
        }
        let value = &part[spans[value_start].0..spans[i - 1].1];
        out.push((key, value));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comma_separated_values_keep_units() {
        let m = explode("SOC 67.68 %, SoH 96.8 %, Pack 371.1 V, Pack Curr 114 A, Temp avg 33.1 °C");
        assert_eq!(m["SOC"], "67.68 %");
        assert_eq!(m["SoH"], "96.8 %");
        assert_eq!(m["Pack"], "371.1 V");
        assert_eq!(m["Pack Curr"], "114 A");
        assert_eq!(m["Temp avg"], "33.1 °C");
        assert_eq!(m.len(), 5);
    }

    #[test]
    fn whitespace_separated_pairs() {
        let m = explode("SOC 67% SoH 96% Pack 371.1 V");
        assert_eq!(m["SOC"], "67%");
        assert_eq!(m["SoH"], "96%");
        assert_eq!(m["Pack"], "371.1 V");
    }

    #[test]
    fn literal_value_text_is_preserved() {
        let m = explode("RPM 7 420, Steering 4.6°/3.8 Nm, Suspension travel 18–19 mm, Stress 0.38");
        assert_eq!(m["RPM"], "7 420");
        assert_eq!(m["Steering"], "4.6°/3.8 Nm");
        assert_eq!(m["Suspension travel"], "18–19 mm");
        assert_eq!(m["Stress"], "0.38");
    }

    #[test]
    fn unit_then_key_without_separator() {
        let m = explode("Temp 30 C Pad wear 72 %");
        assert_eq!(m.len(), 2);
        assert_eq!(m["Temp"], "30 C");
        assert_eq!(m["Pad wear"], "72 %");

        let m = explode("Torque 120 Nm Speed 54 km/h");
        assert_eq!(m["Torque"], "120 Nm");
        assert_eq!(m["Speed"], "54 km/h");
    }

    #[test]
    fn text_without_numbers_yields_nothing() {
        assert!(explode("Stable, nominal").is_empty());
        assert!(explode("").is_empty());
    }

    #[test]
    fn negative_and_emphasized_values() {
        let m = explode("**Coolant flow** -15 %, Yaw **0.86°**");
        assert_eq!(m["Coolant flow"], "-15 %");
        assert_eq!(m["Yaw"], "0.86°");
    }
}
