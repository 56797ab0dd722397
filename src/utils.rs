use crate::error::{IntakeError, Result};
use crate::schema::CellValue;
use chrono::{Datelike, Days, NaiveDate};
use regex::Regex;
use std::sync::LazyLock;

static AMOUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\d{1,3}(?:,\d{3})+|\d+)?(?:\.\d+)?$").expect("valid regex")
});

static YEAR_MONTH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4})[-/.](\d{1,2})(?:[-/.](\d{1,2}))?(?:[ T].*)?$")
        .expect("valid regex")
});

static MONTH_YEAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2})[-/.](\d{4})$").expect("valid regex"));

static DAY_MONTH_YEAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,2})[-/.](\d{1,2})[-/.](\d{4})$").expect("valid regex")
});

static NAMED_MONTH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(\d{4})[\s\-/]+([a-z]+)|([a-z]+)[\s\-/,]+(\d{4}))$")
        .expect("valid regex")
});

const CURRENCY_TOKENS: [&str; 11] = [
    "ر.س", "ريال", "sar", "sr", "usd", "eur", "gbp", "$", "€", "£", "﷼",
];

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

pub fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let next_month = if month == 12 { 1 } else { month + 1 };
    let next_year = if month == 12 { year + 1 } else { year };

    NaiveDate::from_ymd_opt(next_year, next_month, 1)?.checked_sub_days(Days::new(1))
}

/// Parses a period string in the format "YYYY-MM" or "YYYY-MM:YYYY-MM".
/// Returns (first day, last day) inclusive.
pub fn parse_period_string(period: &str) -> Result<(NaiveDate, NaiveDate)> {
    let parts: Vec<&str> = period.split(':').collect();
    let (first, last) = match parts.as_slice() {
        [single] => (*single, *single),
        [start, end] => (*start, *end),
        _ => {
            return Err(IntakeError::Configuration(format!(
                "Invalid period format: {}. Expected 'YYYY-MM' or 'YYYY-MM:YYYY-MM'",
                period
            )))
        }
    };

    let start = NaiveDate::parse_from_str(&format!("{}-01", first.trim()), "%Y-%m-%d")
        .map_err(|_| {
            IntakeError::Configuration(format!(
                "Invalid date format in period: {}. Expected YYYY-MM",
                first
            ))
        })?;
    let end_ref = NaiveDate::parse_from_str(&format!("{}-01", last.trim()), "%Y-%m-%d")
        .map_err(|_| {
            IntakeError::Configuration(format!(
                "Invalid date format in period: {}. Expected YYYY-MM",
                last
            ))
        })?;
    let end = last_day_of_month(end_ref.year(), end_ref.month()).ok_or_else(|| {
        IntakeError::Configuration(format!("Period out of range: {}", period))
    })?;

    Ok((start, end))
}

pub fn period_contains(period: &str, date: NaiveDate) -> bool {
    parse_period_string(period)
        .map(|(start, end)| start <= date && date <= end)
        .unwrap_or(false)
}

fn month_from_name(name: &str) -> Option<u32> {
    let name = name.trim().to_lowercase();
    if name.len() < 3 {
        return None;
    }
    MONTHS
        .iter()
        .position(|m| name.starts_with(m))
        .map(|i| i as u32 + 1)
}

fn year_month(year: i32, month: u32) -> Option<String> {
    if (1..=12).contains(&month) && (1900..=2200).contains(&year) {
        Some(format!("{:04}-{:02}", year, month))
    } else {
        None
    }
}

/// Normalises a period cell to `YYYY-MM`.
///
/// Accepts dates, `2024-03`, `2024/03/15`, `03/2024`, `15/03/2024` (day first),
/// `Mar 2024` and `2024 March`.
pub fn normalize_period(cell: &CellValue) -> Option<String> {
    match cell {
        CellValue::Date(d) => year_month(d.year(), d.month()),
        CellValue::Text(s) => normalize_period_str(s),
        CellValue::Number(_) | CellValue::Blank => None,
    }
}

pub fn normalize_period_str(raw: &str) -> Option<String> {
    let s = to_ascii_digits(raw.trim()).to_lowercase();
    if let Some(c) = YEAR_MONTH_RE.captures(&s) {
        return year_month(c[1].parse().ok()?, c[2].parse().ok()?);
    }
    if let Some(c) = MONTH_YEAR_RE.captures(&s) {
        return year_month(c[2].parse().ok()?, c[1].parse().ok()?);
    }
    if let Some(c) = DAY_MONTH_YEAR_RE.captures(&s) {
        return year_month(c[3].parse().ok()?, c[2].parse().ok()?);
    }
    if let Some(c) = NAMED_MONTH_RE.captures(&s) {
        return match (c.get(1), c.get(2), c.get(3), c.get(4)) {
            (Some(y), Some(m), _, _) | (_, _, Some(m), Some(y)) => {
                year_month(y.as_str().parse().ok()?, month_from_name(m.as_str())?)
            }
            _ => None,
        };
    }
    None
}

/// Parses a calendar date written in one of the common export formats.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    const FORMATS: [&str; 9] = [
        "%Y-%m-%d",
        "%Y/%m/%d",
        "%d/%m/%Y",
        "%d-%m-%Y",
        "%d.%m.%Y",
        "%d %b %Y",
        "%d %B %Y",
        "%b %d, %Y",
        "%B %d, %Y",
    ];
    let s = to_ascii_digits(raw.trim());
    // ISO timestamps: keep the date part
    let s = match s.get(10..11) {
        Some("T") | Some(" ") if s.as_bytes().get(4) == Some(&b'-') => &s[..10],
        _ => s.as_str(),
    };
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

pub fn coerce_date(cell: &CellValue) -> Option<NaiveDate> {
    match cell {
        CellValue::Date(d) => Some(*d),
        CellValue::Text(s) => parse_date(s),
        _ => None,
    }
}

fn to_ascii_digits(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '\u{0660}'..='\u{0669}' => char::from(b'0' + (c as u32 - 0x0660) as u8),
            '\u{06F0}'..='\u{06F9}' => char::from(b'0' + (c as u32 - 0x06F0) as u8),
            '\u{066B}' => '.',
            '\u{066C}' => ',',
            other => other,
        })
        .collect()
}

/// Locale-aware amount parsing.
///
/// Handles thousands separators, `(1,200)` and trailing-minus negatives, currency
/// symbols and codes, and Arabic-Indic digits. Anything else is rejected.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let mut s = to_ascii_digits(raw.trim()).to_lowercase();
    for token in CURRENCY_TOKENS {
        s = s.replace(token, "");
    }
    let mut s: String = s
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}')
        .collect();
    if s.is_empty() {
        return None;
    }

    let mut negative = false;
    if s.starts_with('(') && s.ends_with(')') && s.len() > 2 {
        negative = true;
        s = s[1..s.len() - 1].to_string();
    }
    if let Some(rest) = s.strip_suffix('-') {
        negative = !negative;
        s = rest.to_string();
    }
    if let Some(rest) = s.strip_prefix('-') {
        negative = !negative;
        s = rest.to_string();
    } else if let Some(rest) = s.strip_prefix('+') {
        s = rest.to_string();
    }

    if s.is_empty() || s == "." || !AMOUNT_RE.is_match(&s) {
        return None;
    }
    let value: f64 = s.replace(',', "").parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(if negative { -value } else { value })
}

pub fn coerce_number(cell: &CellValue) -> Option<f64> {
    match cell {
        CellValue::Number(n) if n.is_finite() => Some(*n),
        CellValue::Text(s) => parse_amount(s),
        _ => None,
    }
}

/// Lowercases, drops punctuation and collapses whitespace. Unicode letters survive.
pub fn normalize_label(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .to_lowercase();
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whether a row label marks a total or subtotal line.
pub fn is_total_label(raw: &str) -> bool {
    let label = normalize_label(raw);
    matches!(
        label.as_str(),
        "total" | "totals" | "subtotal" | "sub total" | "grand total" | "الإجمالي" | "المجموع"
    ) || label.starts_with("total ")
        || label.starts_with("subtotal ")
        || label.starts_with("sub total ")
        || label.starts_with("grand total")
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Formats an amount with thousands separators, e.g. `1,234,567.50`.
pub fn format_amount(value: f64, decimals: usize) -> String {
    let formatted = format!("{:.*}", decimals, value.abs());
    let (int_part, frac_part) = match formatted.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (formatted.as_str(), None),
    };

    let mut grouped = String::new();
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let sign = if value < 0.0 && formatted.chars().any(|c| c != '0' && c != '.') {
        "-"
    } else {
        ""
    };
    match frac_part {
        Some(f) => format!("{}{}.{}", sign, grouped, f),
        None => format!("{}{}", sign, grouped),
    }
}
