//! Parameter ranges replayed by the `full_incremental_refresh` policy.

use crate::error::{Error, Result};
use chrono::{Duration, Months, NaiveDate, NaiveDateTime};
use regex::Regex;
use std::cmp::Ordering;
use std::fmt;
use std::sync::OnceLock;

/// Safety ceiling on the number of chunks a single backfill may execute.
pub const MAX_CHUNKS: usize = 10_000;

const AGGREGATE_KEYWORDS: &[&str] = &[
    "max",
    "min",
    "count",
    "sum",
    "avg",
    "current_date",
    "current_timestamp",
    "now",
    "select",
];

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    Integer(i64),
    Float(f64),
}

impl ParamValue {
    /// Parse a literal, tolerating surrounding quotes and a `DATE`/`TIMESTAMP` prefix.
    pub fn parse(raw: &str) -> Option<ParamValue> {
        let mut s = raw.trim();
        for prefix in ["DATE ", "TIMESTAMP ", "date ", "timestamp "] {
            if let Some(rest) = s.strip_prefix(prefix) {
                s = rest.trim();
            }
        }
        let s = strip_quotes(s);
        if s.is_empty() {
            return None;
        }
        if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return Some(ParamValue::Date(d));
        }
        if let Some(ts) = parse_timestamp(s) {
            return Some(ParamValue::Timestamp(ts));
        }
        if let Ok(i) = s.parse::<i64>() {
            return Some(ParamValue::Integer(i));
        }
        if let Ok(f) = s.parse::<f64>() {
            if f.is_finite() {
                return Some(ParamValue::Float(f));
            }
        }
        None
    }

    pub fn render(&self) -> String {
        match self {
            ParamValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            ParamValue::Timestamp(ts) => ts.format("%Y-%m-%d %H:%M:%S").to_string(),
            ParamValue::Integer(i) => i.to_string(),
            ParamValue::Float(f) => f.to_string(),
        }
    }

    fn is_temporal(&self) -> bool {
        matches!(self, ParamValue::Date(_) | ParamValue::Timestamp(_))
    }

    fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            ParamValue::Date(d) => d.and_hms_opt(0, 0, 0),
            ParamValue::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Integer(i) => Some(*i as f64),
            ParamValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Dates compare with timestamps at midnight; numbers compare with numbers.
    pub fn compare(&self, other: &ParamValue) -> Option<Ordering> {
        if self.is_temporal() && other.is_temporal() {
            return Some(self.as_timestamp()?.cmp(&other.as_timestamp()?));
        }
        self.as_f64()?.partial_cmp(&other.as_f64()?)
    }

    pub fn advance(&self, step: &Step) -> Result<ParamValue> {
        let overflow = || Error::rewrite(format!("chunk parameter overflow advancing {self}"));
        match (self, step) {
            (ParamValue::Date(d), Step::Interval { amount, unit }) => match unit {
                IntervalUnit::Minute | IntervalUnit::Hour => {
                    let ts = d.and_hms_opt(0, 0, 0).ok_or_else(overflow)?;
                    ParamValue::Timestamp(ts).advance(step)
                }
                IntervalUnit::Day => d
                    .checked_add_signed(Duration::days(*amount))
                    .map(ParamValue::Date)
                    .ok_or_else(overflow),
                IntervalUnit::Week => d
                    .checked_add_signed(Duration::days(amount * 7))
                    .map(ParamValue::Date)
                    .ok_or_else(overflow),
                IntervalUnit::Month => d
                    .checked_add_months(Months::new(*amount as u32))
                    .map(ParamValue::Date)
                    .ok_or_else(overflow),
                IntervalUnit::Year => d
                    .checked_add_months(Months::new(*amount as u32 * 12))
                    .map(ParamValue::Date)
                    .ok_or_else(overflow),
            },
            (ParamValue::Timestamp(ts), Step::Interval { amount, unit }) => {
                let next = match unit {
                    IntervalUnit::Minute => ts.checked_add_signed(Duration::minutes(*amount)),
                    IntervalUnit::Hour => ts.checked_add_signed(Duration::hours(*amount)),
                    IntervalUnit::Day => ts.checked_add_signed(Duration::days(*amount)),
                    IntervalUnit::Week => ts.checked_add_signed(Duration::days(amount * 7)),
                    IntervalUnit::Month => ts.checked_add_months(Months::new(*amount as u32)),
                    IntervalUnit::Year => ts.checked_add_months(Months::new(*amount as u32 * 12)),
                };
                next.map(ParamValue::Timestamp).ok_or_else(overflow)
            }
            (ParamValue::Integer(i), Step::Numeric(n)) => {
                if n.fract() == 0.0 {
                    i.checked_add(*n as i64)
                        .map(ParamValue::Integer)
                        .ok_or_else(overflow)
                } else {
                    Ok(ParamValue::Float(*i as f64 + n))
                }
            }
            (ParamValue::Float(f), Step::Numeric(n)) => Ok(ParamValue::Float(f + n)),
            _ => Err(Error::rewrite(format!(
                "step {step} cannot advance value {self}"
            ))),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalUnit {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl IntervalUnit {
    fn parse(s: &str) -> Option<IntervalUnit> {
        let lower = s.to_lowercase();
        let unit = lower.strip_suffix('s').unwrap_or(&lower);
        match unit {
            "minute" | "min" => Some(IntervalUnit::Minute),
            "hour" => Some(IntervalUnit::Hour),
            "day" => Some(IntervalUnit::Day),
            "week" => Some(IntervalUnit::Week),
            "month" => Some(IntervalUnit::Month),
            "year" => Some(IntervalUnit::Year),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            IntervalUnit::Minute => "MINUTE",
            IntervalUnit::Hour => "HOUR",
            IntervalUnit::Day => "DAY",
            IntervalUnit::Week => "WEEK",
            IntervalUnit::Month => "MONTH",
            IntervalUnit::Year => "YEAR",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Interval { amount: i64, unit: IntervalUnit },
    Numeric(f64),
}

impl Step {
    /// Accepts `INTERVAL 1 DAY`, `INTERVAL '1 day'`, `7 days` or a plain number.
    pub fn parse(raw: &str) -> Option<Step> {
        static INTERVAL_RE: OnceLock<Regex> = OnceLock::new();
        let re = INTERVAL_RE.get_or_init(|| {
            Regex::new(r"(?i)^\s*(?:interval\s+)?'?\s*(\d+)\s*'?\s*([a-z]+)\s*'?\s*$")
                .expect("valid interval regex")
        });
        if let Some(caps) = re.captures(raw) {
            let amount: i64 = caps[1].parse().ok()?;
            let unit = IntervalUnit::parse(&caps[2])?;
            return Some(Step::Interval { amount, unit });
        }
        strip_quotes(raw.trim()).parse::<f64>().ok().map(Step::Numeric)
    }

    fn is_positive(&self) -> bool {
        match self {
            Step::Interval { amount, .. } => *amount > 0,
            Step::Numeric(n) => *n > 0.0,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Interval { amount, unit } => write!(f, "INTERVAL {} {}", amount, unit.as_str()),
            Step::Numeric(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EndValue {
    Literal(ParamValue),
    /// Evaluated as a scalar query against the first source table of the model.
    Expression(String),
}

impl EndValue {
    /// Anything that is not clearly a literal takes the evaluated path.
    pub fn parse(raw: &str) -> EndValue {
        if looks_like_expression(raw) {
            return EndValue::Expression(raw.trim().to_string());
        }
        match ParamValue::parse(raw) {
            Some(v) => EndValue::Literal(v),
            None => EndValue::Expression(raw.trim().to_string()),
        }
    }
}

/// Function-call pattern or a known aggregate keyword.
pub fn looks_like_expression(raw: &str) -> bool {
    static CALL_RE: OnceLock<Regex> = OnceLock::new();
    let re = CALL_RE.get_or_init(|| {
        Regex::new(r"[A-Za-z_][A-Za-z0-9_]*\s*\(").expect("valid call regex")
    });
    if re.is_match(raw) {
        return true;
    }
    let lower = raw.to_lowercase();
    lower
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .any(|word| AGGREGATE_KEYWORDS.contains(&word))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkParameter {
    pub name: String,
    pub start: ParamValue,
    pub end: EndValue,
    pub step: Step,
}

impl ChunkParameter {
    pub fn parse(model: &str, name: &str, start: &str, end: &str, step: &str) -> Result<Self> {
        let start_value = ParamValue::parse(start).ok_or_else(|| {
            Error::config(
                model,
                format!("parameter '{name}' has an unparseable start_value '{start}'"),
            )
        })?;
        let step_value = Step::parse(step).ok_or_else(|| {
            Error::config(
                model,
                format!("parameter '{name}' has an unparseable step '{step}'"),
            )
        })?;
        if !step_value.is_positive() {
            return Err(Error::config(
                model,
                format!("parameter '{name}' must have a positive step, got '{step}'"),
            ));
        }
        let compatible = match step_value {
            Step::Interval { .. } => start_value.is_temporal(),
            Step::Numeric(_) => !start_value.is_temporal(),
        };
        if !compatible {
            return Err(Error::config(
                model,
                format!("parameter '{name}': step '{step}' does not fit start value '{start}'"),
            ));
        }
        let end_value = EndValue::parse(end);
        if let EndValue::Literal(lit) = &end_value {
            if start_value.compare(lit).is_none() {
                return Err(Error::config(
                    model,
                    format!("parameter '{name}': end '{end}' is not comparable with start '{start}'"),
                ));
            }
        }
        Ok(ChunkParameter {
            name: name.to_string(),
            start: start_value,
            end: end_value,
            step: step_value,
        })
    }
}

/// Replace `{{name}}` / `{{ name }}` and `@name` placeholders with rendered values.
pub fn substitute_placeholders(sql: &str, values: &[(String, String)]) -> String {
    let mut ordered: Vec<&(String, String)> = values.iter().collect();
    ordered.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    let mut out = sql.to_string();
    for (name, value) in ordered {
        let escaped = regex::escape(name);
        if let Ok(braces) = Regex::new(&format!(r"\{{\{{\s*{escaped}\s*\}}\}}")) {
            out = braces.replace_all(&out, value.as_str()).into_owned();
        }
        if let Ok(at) = Regex::new(&format!(r"@{escaped}\b")) {
            out = at.replace_all(&out, value.as_str()).into_owned();
        }
    }
    out
}

pub(crate) fn strip_quotes(s: &str) -> &str {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('\'') && s.ends_with('\'')) || (s.starts_with('"') && s.ends_with('"')))
    {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

pub(crate) fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    for fmt in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(ts);
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(dt) = chrono::DateTime::parse_from_str(s, fmt) {
            return Some(dt.naive_utc());
        }
    }
    None
}
