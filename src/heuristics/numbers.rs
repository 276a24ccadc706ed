use regex::Regex;
use std::sync::LazyLock;

static AMOUNT_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+-]?[\d.,]*\d[\d.,]*$").expect("valid amount regex"));

const CURRENCY_MARKERS: [&str; 5] = ["€", "EUR", "eur", "$", "£"];

/// Parses a printed amount such as `1 234,56 €`, `1,234.56` or `-12.5`.
///
/// Separator rules:
/// - both `,` and `.` present: the later one is the decimal separator;
/// - only `,`: the last one is decimal when exactly two digits follow it, and
///   every comma then becomes a dot; otherwise all commas are thousands;
/// - several `.`: all but the last are folded into the integer part.
pub fn parse_amount(text: &str) -> Option<f64> {
    let mut s = text.trim();
    for marker in CURRENCY_MARKERS {
        s = s.trim_start_matches(marker).trim_end_matches(marker).trim();
    }
    let compact: String = s
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\'' && *c != '\u{202f}')
        .collect();
    if !AMOUNT_SHAPE.is_match(&compact) {
        return None;
    }

    let normalized = match (compact.rfind(','), compact.rfind('.')) {
        (Some(comma), Some(dot)) if comma > dot => compact.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => compact.replace(',', ""),
        (Some(comma), None) => {
            let decimals = &compact[comma + 1..];
            if decimals.len() == 2 {
                compact.replace(',', ".")
            } else {
                compact.replace(',', "")
            }
        }
        (None, _) => compact,
    };

    fold_extra_dots(&normalized).parse::<f64>().ok()
}

fn fold_extra_dots(s: &str) -> String {
    match s.rsplit_once('.') {
        Some((int_part, frac)) if int_part.contains('.') => {
            format!("{}.{}", int_part.replace('.', ""), frac)
        }
        _ => s.to_string(),
    }
}

/// Rounds half away from zero to two decimals.
pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
