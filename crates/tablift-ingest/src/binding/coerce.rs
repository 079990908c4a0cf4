//! Smart cell-value coercion.
//!
//! Raw cell text arrives in whatever shape the spreadsheet application
//! left it: identifiers mangled into scientific notation, dates as serial
//! numbers or half a dozen textual layouts, integers with a `.0` tail.
//! The decision of *which* normalization applies is made once per field at
//! [`BindingSet`](super::BindingSet) construction and recorded as a
//! [`CoercePolicy`]; the per-cell path just executes it.

use std::sync::LazyLock;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use regex::Regex;

use tablift_common::types::{CellFormatHint, FieldKind};

use super::{normalize_label, ColumnBinding, FieldValue};

/// Field-name fragments that mark a column as carrying an identifier.
/// Matched against the normalized (folded, lowercased, separator-free)
/// field name.
const IDENTIFIER_NAME_PARTS: &[&str] = &[
    "identity",
    "identitycard",
    "cmnd",
    "cccd",
    "passport",
    "phone",
    "phonenumber",
    "mobile",
    "tax",
    "taxcode",
    "mst",
    "account",
    "accountnumber",
    "code",
];

static SCIENTIFIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([+-]?)(\d+)(?:\.(\d+))?[eE]([+-]?\d+)$").expect("scientific pattern")
});
static LONG_DIGITS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{9,15}$").expect("long digits pattern"));
static DECIMAL_TAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\.0+$").expect("decimal tail pattern"));
static NUMERIC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+-]?\d+(\.\d+)?$").expect("numeric pattern"));

/// Serial dates live on the 1899-12-30 epoch.
const SERIAL_EPOCH: (i32, u32, u32) = (1899, 12, 30);
const SERIAL_MAX: f64 = 3_000_000.0;

/// Precomputed normalization rule for one field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoercePolicy {
    /// Always run identifier normalization (hinted, or the field name
    /// marks it as an identifier carrier)
    Identifier,
    /// Normalize into an ISO-8601 date/datetime string
    DateLike,
    /// Plain numeric parse
    Numeric,
    /// Pass the text through untouched
    Verbatim,
    /// General string field: inspect each value's shape
    Shape,
}

impl CoercePolicy {
    pub fn for_binding(binding: &ColumnBinding) -> Self {
        match binding.hint {
            CellFormatHint::Identifier => CoercePolicy::Identifier,
            CellFormatHint::Text => CoercePolicy::Verbatim,
            CellFormatHint::Date => CoercePolicy::DateLike,
            CellFormatHint::Number => CoercePolicy::Numeric,
            CellFormatHint::General => match binding.kind {
                FieldKind::Date | FieldKind::DateTime => CoercePolicy::DateLike,
                FieldKind::String if is_identifier_name(&binding.field_name) => {
                    CoercePolicy::Identifier
                }
                FieldKind::String => CoercePolicy::Shape,
                FieldKind::Integer | FieldKind::Decimal => CoercePolicy::Numeric,
                FieldKind::Bool | FieldKind::Enum => CoercePolicy::Verbatim,
            },
        }
    }
}

/// True when the normalized field name names an identifier carrier.
pub fn is_identifier_name(field_name: &str) -> bool {
    let name = normalize_label(field_name);
    if IDENTIFIER_NAME_PARTS.iter().any(|part| name.contains(part)) {
        return true;
    }
    name.contains("number") && name.contains("card")
}

/// True when the value itself looks like a mangled identifier: scientific
/// notation expanding past 9 integer digits, a 9-15 digit run, or an
/// integer with a `.0` tail.
pub fn value_shape_is_identifier(value: &str) -> bool {
    if let Some(caps) = SCIENTIFIC_RE.captures(value) {
        let int_digits = caps[2].len() as i64;
        let exponent: i64 = caps[4].parse().unwrap_or(0);
        return int_digits + exponent > 9;
    }
    LONG_DIGITS_RE.is_match(value) || DECIMAL_TAIL_RE.is_match(value)
}

/// Expand scientific notation into plain digits, exactly. Digit-string
/// arithmetic only; no float round-trips that would clobber an identifier.
pub fn expand_scientific(value: &str) -> Option<String> {
    let caps = SCIENTIFIC_RE.captures(value)?;
    let sign = &caps[1];
    let int_digits = &caps[2];
    let frac_digits = caps.get(3).map(|m| m.as_str()).unwrap_or("");
    let exponent: i64 = caps[4].parse().ok()?;

    let digits: String = format!("{int_digits}{frac_digits}");
    let point = int_digits.len() as i64 + exponent;

    let mut out = String::new();
    if !sign.is_empty() && sign != "+" {
        out.push('-');
    }

    if point <= 0 {
        out.push_str("0.");
        for _ in 0..(-point) {
            out.push('0');
        }
        out.push_str(digits.trim_end_matches('0'));
        if out.ends_with('.') {
            out.push('0');
        }
    } else if (point as usize) >= digits.len() {
        out.push_str(&digits);
        for _ in 0..(point as usize - digits.len()) {
            out.push('0');
        }
    } else {
        let (head, tail) = digits.split_at(point as usize);
        out.push_str(head);
        let tail = tail.trim_end_matches('0');
        if !tail.is_empty() {
            out.push('.');
            out.push_str(tail);
        }
    }

    Some(out)
}

/// Identifier normalization: expand scientific notation, strip a trailing
/// `.0+` fractional tail, otherwise leave the text alone.
pub fn normalize_identifier(value: &str) -> String {
    if let Some(expanded) = expand_scientific(value) {
        return strip_decimal_tail(&expanded);
    }
    strip_decimal_tail(value)
}

fn strip_decimal_tail(value: &str) -> String {
    match DECIMAL_TAIL_RE.captures(value) {
        Some(caps) => caps[1].to_string(),
        None => value.to_string(),
    }
}

/// Convert a serial day count into a calendar date. Serial 0 is
/// 1899-12-30; fractional days carry the time of day.
pub fn serial_to_datetime(serial: f64) -> Option<NaiveDateTime> {
    if !(1.0..SERIAL_MAX).contains(&serial) {
        return None;
    }
    let days = serial.trunc() as i64;
    let secs = (serial.fract() * 86_400.0).round() as i64;
    let epoch = NaiveDate::from_ymd_opt(SERIAL_EPOCH.0, SERIAL_EPOCH.1, SERIAL_EPOCH.2)?;
    let date = epoch.checked_add_signed(Duration::days(days))?;
    date.and_hms_opt(0, 0, 0)?
        .checked_add_signed(Duration::seconds(secs))
}

/// Normalize a raw cell into an ISO-8601 date or datetime string.
///
/// Purely numeric values in `[1, 3_000_000)` are serial dates; textual
/// values go through the short-year pattern table. Returns `None` when
/// nothing matched.
pub fn normalize_date(value: &str, want_time: bool) -> Option<String> {
    let value = value.trim();

    if NUMERIC_RE.is_match(value) {
        let serial: f64 = value.parse().ok()?;
        let dt = serial_to_datetime(serial)?;
        return Some(if want_time {
            dt.format("%Y-%m-%dT%H:%M:%S").to_string()
        } else {
            dt.format("%Y-%m-%d").to_string()
        });
    }

    let date = parse_textual_date(value)?;
    Some(if want_time {
        date.and_hms_opt(0, 0, 0)?
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string()
    } else {
        date.format("%Y-%m-%d").to_string()
    })
}

/// Textual date patterns: ISO `YYYY-MM-DD`, `M/D/YY[YY]`, `D-M-YY[YY]`,
/// `D-MMM-YYYY`, `D-MMM-YY` with English and Vietnamese month names.
fn parse_textual_date(value: &str) -> Option<NaiveDate> {
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(date);
    }

    // Slash layout is month-first.
    let slash: Vec<&str> = value.split('/').collect();
    if slash.len() == 3 {
        let month: u32 = slash[0].trim().parse().ok()?;
        let day: u32 = slash[1].trim().parse().ok()?;
        let year = expand_year(slash[2].trim())?;
        return NaiveDate::from_ymd_opt(year, month, day);
    }

    // Dash layout is day-first; the middle part may be a month name.
    let dash: Vec<&str> = value.split('-').collect();
    if dash.len() == 3 {
        let day: u32 = dash[0].trim().parse().ok()?;
        let month = match dash[1].trim().parse::<u32>() {
            Ok(m) => m,
            Err(_) => month_from_name(dash[1].trim())?,
        };
        let year = expand_year(dash[2].trim())?;
        return NaiveDate::from_ymd_opt(year, month, day);
    }

    None
}

/// 2-digit years pivot at 30: `<= 30` lands in 2000-2030, the rest in the
/// 1900s.
fn expand_year(raw: &str) -> Option<i32> {
    let year: i32 = raw.parse().ok()?;
    Some(match raw.len() {
        2 => {
            if year <= 30 {
                2000 + year
            } else {
                1900 + year
            }
        }
        _ => year,
    })
}

/// Resolve an English (full or abbreviated) or Vietnamese month name.
fn month_from_name(name: &str) -> Option<u32> {
    const ENGLISH: [&str; 12] = [
        "january",
        "february",
        "march",
        "april",
        "may",
        "june",
        "july",
        "august",
        "september",
        "october",
        "november",
        "december",
    ];
    // Ordered so "tháng mười một/hai" are checked before "tháng mười".
    const VIETNAMESE: [(&str, u32); 12] = [
        ("thang muoi mot", 11),
        ("thang muoi hai", 12),
        ("thang muoi", 10),
        ("thang mot", 1),
        ("thang hai", 2),
        ("thang ba", 3),
        ("thang tu", 4),
        ("thang nam", 5),
        ("thang sau", 6),
        ("thang bay", 7),
        ("thang tam", 8),
        ("thang chin", 9),
    ];

    let folded: String = name
        .chars()
        .map(fold_diacritic)
        .collect::<String>()
        .to_lowercase();
    let folded = folded.trim();

    for (idx, month) in ENGLISH.iter().enumerate() {
        if folded == *month || (folded.len() == 3 && month.starts_with(folded)) {
            return Some(idx as u32 + 1);
        }
    }
    for (vn, number) in VIETNAMESE {
        if folded == vn {
            return Some(number);
        }
    }
    None
}

/// Fold a single accented Latin character to its base letter. Covers the
/// Vietnamese alphabet; anything unknown passes through.
pub fn fold_diacritic(c: char) -> char {
    match c {
        'à' | 'á' | 'ả' | 'ã' | 'ạ' | 'ă' | 'ằ' | 'ắ' | 'ẳ' | 'ẵ' | 'ặ' | 'â' | 'ầ' | 'ấ'
        | 'ẩ' | 'ẫ' | 'ậ' => 'a',
        'À' | 'Á' | 'Ả' | 'Ã' | 'Ạ' | 'Ă' | 'Ằ' | 'Ắ' | 'Ẳ' | 'Ẵ' | 'Ặ' | 'Â' | 'Ầ' | 'Ấ'
        | 'Ẩ' | 'Ẫ' | 'Ậ' => 'A',
        'è' | 'é' | 'ẻ' | 'ẽ' | 'ẹ' | 'ê' | 'ề' | 'ế' | 'ể' | 'ễ' | 'ệ' => 'e',
        'È' | 'É' | 'Ẻ' | 'Ẽ' | 'Ẹ' | 'Ê' | 'Ề' | 'Ế' | 'Ể' | 'Ễ' | 'Ệ' => 'E',
        'ì' | 'í' | 'ỉ' | 'ĩ' | 'ị' => 'i',
        'Ì' | 'Í' | 'Ỉ' | 'Ĩ' | 'Ị' => 'I',
        'ò' | 'ó' | 'ỏ' | 'õ' | 'ọ' | 'ô' | 'ồ' | 'ố' | 'ổ' | 'ỗ' | 'ộ' | 'ơ' | 'ờ' | 'ớ'
        | 'ở' | 'ỡ' | 'ợ' => 'o',
        'Ò' | 'Ó' | 'Ỏ' | 'Õ' | 'Ọ' | 'Ô' | 'Ồ' | 'Ố' | 'Ổ' | 'Ỗ' | 'Ộ' | 'Ơ' | 'Ờ' | 'Ớ'
        | 'Ở' | 'Ỡ' | 'Ợ' => 'O',
        'ù' | 'ú' | 'ủ' | 'ũ' | 'ụ' | 'ư' | 'ừ' | 'ứ' | 'ử' | 'ữ' | 'ự' => 'u',
        'Ù' | 'Ú' | 'Ủ' | 'Ũ' | 'Ụ' | 'Ư' | 'Ừ' | 'Ứ' | 'Ử' | 'Ữ' | 'Ự' => 'U',
        'ỳ' | 'ý' | 'ỷ' | 'ỹ' | 'ỵ' => 'y',
        'Ỳ' | 'Ý' | 'Ỷ' | 'Ỹ' | 'Ỵ' => 'Y',
        'đ' => 'd',
        'Đ' => 'D',
        other => other,
    }
}

/// Coerce one non-empty raw cell string into the typed value for a field.
///
/// Errors are plain messages; the caller decides whether they abort the
/// row or just count.
pub fn coerce_value(
    binding: &ColumnBinding,
    policy: &CoercePolicy,
    raw: &str,
) -> Result<FieldValue, String> {
    let raw = raw.trim();

    let normalized: String = match policy {
        CoercePolicy::Identifier => normalize_identifier(raw),
        CoercePolicy::DateLike => normalize_date(
            raw,
            matches!(binding.kind, FieldKind::DateTime),
        )
        .ok_or_else(|| format!("'{raw}' is not a recognizable date"))?,
        CoercePolicy::Shape => {
            if value_shape_is_identifier(raw) {
                normalize_identifier(raw)
            } else {
                raw.to_string()
            }
        }
        CoercePolicy::Numeric | CoercePolicy::Verbatim => raw.to_string(),
    };

    typed_value(binding, &normalized)
}

fn typed_value(binding: &ColumnBinding, text: &str) -> Result<FieldValue, String> {
    match binding.kind {
        FieldKind::String => Ok(FieldValue::Text(text.to_string())),
        FieldKind::Integer => {
            let stripped = strip_decimal_tail(text);
            if let Ok(i) = stripped.parse::<i64>() {
                return Ok(FieldValue::Integer(i));
            }
            let f: f64 = text
                .parse()
                .map_err(|_| format!("'{text}' is not an integer"))?;
            if f.fract() == 0.0 {
                Ok(FieldValue::Integer(f as i64))
            } else {
                Err(format!("'{text}' has a fractional part"))
            }
        }
        FieldKind::Decimal => text
            .parse::<f64>()
            .map(FieldValue::Decimal)
            .map_err(|_| format!("'{text}' is not a number")),
        FieldKind::Bool => match text.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(FieldValue::Bool(true)),
            "0" | "false" | "no" => Ok(FieldValue::Bool(false)),
            _ => Err(format!("'{text}' is not a boolean")),
        },
        FieldKind::Date => NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .map(FieldValue::Date)
            .map_err(|_| format!("'{text}' is not an ISO date")),
        FieldKind::DateTime => NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S")
            .or_else(|_| {
                NaiveDate::parse_from_str(text, "%Y-%m-%d")
                    .map(|d| d.and_hms_opt(0, 0, 0).expect("midnight"))
            })
            .map(FieldValue::DateTime)
            .map_err(|_| format!("'{text}' is not an ISO datetime")),
        FieldKind::Enum => {
            if let Some(allowed) = &binding.allowed_values {
                if !allowed.contains(text) {
                    return Err(format!(
                        "'{text}' is not one of the {} allowed values",
                        allowed.len()
                    ));
                }
            }
            Ok(FieldValue::Text(text.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn string_binding(name: &str) -> ColumnBinding {
        ColumnBinding::new(name, name, FieldKind::String)
    }

    #[test]
    fn identifier_names_are_detected() {
        assert!(is_identifier_name("identity_card"));
        assert!(is_identifier_name("soCmnd"));
        assert!(is_identifier_name("tax_code"));
        assert!(is_identifier_name("phoneNumber"));
        assert!(is_identifier_name("card_number"));
        assert!(!is_identifier_name("full_name"));
        assert!(!is_identifier_name("salary"));
    }

    #[test]
    fn scientific_notation_expands_exactly() {
        assert_eq!(expand_scientific("1.234567E+11").unwrap(), "123456700000");
        assert_eq!(expand_scientific("9.87e2").unwrap(), "987");
        assert_eq!(expand_scientific("5E3").unwrap(), "5000");
        assert_eq!(expand_scientific("1.5e0").unwrap(), "1.5");
        assert_eq!(expand_scientific("-2.5E+3").unwrap(), "-2500");
        assert_eq!(expand_scientific("not a number"), None);
    }

    #[test]
    fn identifier_normalization_keeps_all_digits() {
        // The motivating case: a 12-digit identity number mangled by the
        // spreadsheet into scientific notation.
        assert_eq!(normalize_identifier("1.234567E+11"), "123456700000");
        assert_eq!(normalize_identifier("123456789.0"), "123456789");
        assert_eq!(normalize_identifier("0912345678"), "0912345678");
    }

    #[test]
    fn value_shapes_that_mark_identifiers() {
        assert!(value_shape_is_identifier("1.234567E+11"));
        assert!(value_shape_is_identifier("123456789"));
        assert!(value_shape_is_identifier("42.000"));
        assert!(!value_shape_is_identifier("1.2E+3"));
        assert!(!value_shape_is_identifier("12345678"));
        assert!(!value_shape_is_identifier("hello"));
    }

    #[test]
    fn serial_44927_is_new_year_2023() {
        let dt = serial_to_datetime(44927.0).unwrap();
        assert_eq!(dt.date(), NaiveDate::from_ymd_opt(2023, 1, 1).unwrap());
    }

    #[test]
    fn serial_range_is_enforced() {
        assert!(serial_to_datetime(0.5).is_none());
        assert!(serial_to_datetime(3_000_000.0).is_none());
        assert!(serial_to_datetime(1.0).is_some());
    }

    #[test]
    fn serial_fraction_carries_time() {
        let dt = serial_to_datetime(44927.5).unwrap();
        assert_eq!(dt.format("%H:%M:%S").to_string(), "12:00:00");
    }

    #[test]
    fn textual_dates_short_and_long_years() {
        assert_eq!(normalize_date("1/15/23", false).unwrap(), "2023-01-15");
        assert_eq!(normalize_date("12/31/1999", false).unwrap(), "1999-12-31");
        assert_eq!(normalize_date("15-1-23", false).unwrap(), "2023-01-15");
        assert_eq!(normalize_date("5-Mar-2021", false).unwrap(), "2021-03-05");
        assert_eq!(normalize_date("5-March-21", false).unwrap(), "2021-03-05");
        assert_eq!(normalize_date("2020-02-29", false).unwrap(), "2020-02-29");
        assert!(normalize_date("not a date", false).is_none());
    }

    #[test]
    fn two_digit_year_pivot() {
        assert_eq!(normalize_date("1/1/30", false).unwrap(), "2030-01-01");
        assert_eq!(normalize_date("1/1/31", false).unwrap(), "1931-01-01");
    }

    #[test]
    fn vietnamese_month_names() {
        assert_eq!(
            normalize_date("5-tháng ba-2021", false).unwrap(),
            "2021-03-05"
        );
        assert_eq!(
            normalize_date("1-tháng mười hai-23", false).unwrap(),
            "2023-12-01"
        );
        assert_eq!(
            normalize_date("1-tháng mười-23", false).unwrap(),
            "2023-10-01"
        );
    }

    #[test]
    fn hint_overrides_auto_detection() {
        let binding = string_binding("note").hint(CellFormatHint::Text);
        let policy = CoercePolicy::for_binding(&binding);
        assert_eq!(policy, CoercePolicy::Verbatim);
        // Without the hint, this shape would be identifier-normalized.
        let value = coerce_value(&binding, &policy, "1.234567E+11").unwrap();
        assert_eq!(value, FieldValue::Text("1.234567E+11".into()));
    }

    #[test]
    fn shape_policy_normalizes_only_identifier_shapes() {
        let binding = string_binding("note");
        let policy = CoercePolicy::for_binding(&binding);
        assert_eq!(policy, CoercePolicy::Shape);

        let mangled = coerce_value(&binding, &policy, "1.234567E+11").unwrap();
        assert_eq!(mangled, FieldValue::Text("123456700000".into()));

        let plain = coerce_value(&binding, &policy, "hello world").unwrap();
        assert_eq!(plain, FieldValue::Text("hello world".into()));
    }

    #[test]
    fn date_field_accepts_serials_and_text() {
        let binding = ColumnBinding::new("Birth", "birth_date", FieldKind::Date);
        let policy = CoercePolicy::for_binding(&binding);

        let from_serial = coerce_value(&binding, &policy, "44927").unwrap();
        assert_eq!(
            from_serial,
            FieldValue::Date(NaiveDate::from_ymd_opt(2023, 1, 1).unwrap())
        );

        let from_text = coerce_value(&binding, &policy, "1/15/23").unwrap();
        assert_eq!(
            from_text,
            FieldValue::Date(NaiveDate::from_ymd_opt(2023, 1, 15).unwrap())
        );

        assert!(coerce_value(&binding, &policy, "garbage").is_err());
    }

    #[test]
    fn integer_field_tolerates_decimal_tail() {
        let binding = ColumnBinding::new("Count", "count", FieldKind::Integer);
        let policy = CoercePolicy::for_binding(&binding);
        assert_eq!(
            coerce_value(&binding, &policy, "42.0").unwrap(),
            FieldValue::Integer(42)
        );
        assert!(coerce_value(&binding, &policy, "42.5").is_err());
    }

    #[test]
    fn enum_field_enforces_allowed_values() {
        let binding = ColumnBinding::new("Status", "status", FieldKind::Enum)
            .allowed_values(["ACTIVE", "INACTIVE"]);
        let policy = CoercePolicy::for_binding(&binding);
        assert!(coerce_value(&binding, &policy, "ACTIVE").is_ok());
        assert!(coerce_value(&binding, &policy, "UNKNOWN").is_err());
    }

    proptest! {
        /// Canonical integer forms survive a coerce round-trip.
        #[test]
        fn integer_canonical_round_trip(n in any::<i64>()) {
            let binding = ColumnBinding::new("N", "n", FieldKind::Integer);
            let policy = CoercePolicy::for_binding(&binding);
            let value = coerce_value(&binding, &policy, &n.to_string()).unwrap();
            prop_assert_eq!(value.canonical(), n.to_string());
        }

        /// Canonical ISO dates survive a coerce round-trip.
        #[test]
        fn date_canonical_round_trip(days in 1i64..100_000) {
            let date = NaiveDate::from_ymd_opt(1899, 12, 30).unwrap()
                + Duration::days(days);
            let binding = ColumnBinding::new("D", "d", FieldKind::Date);
            let policy = CoercePolicy::for_binding(&binding);
            let iso = date.format("%Y-%m-%d").to_string();
            let value = coerce_value(&binding, &policy, &iso).unwrap();
            prop_assert_eq!(value.canonical(), iso);
        }

        /// Expansion of scientific notation never loses leading digits.
        #[test]
        fn scientific_expansion_matches_float(mantissa in 1u64..=9_999_999u64, exp in 1u32..6) {
            let text = format!("{}.{}E+{}", mantissa / 1_000_000, mantissa % 1_000_000, exp);
            if let Some(expanded) = expand_scientific(&text) {
                let reparsed: f64 = expanded.parse().unwrap();
                let original: f64 = text.parse().unwrap();
                prop_assert!((reparsed - original).abs() <= original.abs() * 1e-12);
            }
        }
    }
}
