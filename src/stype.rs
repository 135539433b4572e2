//! Statistical-type inference from observed values.
//!
//! Both the [`SchemaAnalyzer`](crate::analyzer::SchemaAnalyzer) (over sampled
//! source values) and the graph builder (over materialized Arrow columns, for
//! columns the schema leaves as `Omit`) summarize a column into a
//! [`ValueProfile`] and decide from it.

use std::collections::HashSet;

use arrow::array::{Array, AsArray};
use arrow::datatypes::{DataType, Float64Type, Int64Type};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use crate::common::Stype;
use crate::convert::array_to_strings;

// ============================================================================
// Thresholds
// ============================================================================

/// When a column with repeated values counts as categorical.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CategoricalThreshold {
    /// At most this many distinct values.
    pub max_distinct: usize,
    /// Or at most this fraction of distinct values among non-null values.
    pub max_ratio: f64,
}

impl Default for CategoricalThreshold {
    fn default() -> Self {
        Self {
            max_distinct: 10,
            max_ratio: 0.05,
        }
    }
}

// ============================================================================
// Value parsing
// ============================================================================

const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

/// Parse a datetime literal. Date-only literals parse as midnight.
pub fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    parse_date(s).and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Parse a `TIME`-style literal (`HH:MM:SS[.f]`, hours may exceed 23 and
/// carry a sign) into seconds.
pub fn parse_duration_secs(s: &str) -> Option<f64> {
    let s = s.trim();
    if let Ok(t) = NaiveTime::parse_from_str(s, "%H:%M:%S%.f") {
        return Some(t.num_seconds_from_midnight() as f64 + t.nanosecond() as f64 * 1e-9);
    }
    let (sign, body) = match s.strip_prefix('-') {
        Some(rest) => (-1.0, rest),
        None => (1.0, s),
    };
    let mut parts = body.split(':');
    let h: f64 = parts.next()?.parse().ok()?;
    let m: f64 = parts.next()?.parse().ok()?;
    let sec: f64 = parts.next().map_or(Some(0.0), |p| p.parse().ok())?;
    if parts.next().is_some() || !(0.0..60.0).contains(&m) || !(0.0..60.0).contains(&sec) {
        return None;
    }
    Some(sign * (h * 3600.0 + m * 60.0 + sec))
}

// ============================================================================
// Profiles
// ============================================================================

/// Summary of a column's observed values.
#[derive(Debug, Clone, Default)]
pub struct ValueProfile {
    distinct: HashSet<String>,
    pub num_values: u64,
    pub num_nulls: u64,
    /// Every non-null number observed was integral.
    pub all_integral: bool,
    /// Every non-null text value parsed as a number.
    pub all_numeric_text: bool,
    /// Every non-null text value parsed as a date (`YYYY-MM-DD`).
    pub all_date_text: bool,
    /// Every non-null text value parsed as a datetime.
    pub all_datetime_text: bool,
}

impl ValueProfile {
    pub fn new() -> Self {
        Self {
            all_integral: true,
            all_numeric_text: true,
            all_date_text: true,
            all_datetime_text: true,
            ..Default::default()
        }
    }

    pub fn observe_null(&mut self) {
        self.num_values += 1;
        self.num_nulls += 1;
    }

    pub fn observe_int(&mut self, v: i64) {
        self.num_values += 1;
        self.distinct.insert(v.to_string());
    }

    pub fn observe_float(&mut self, v: f64) {
        self.num_values += 1;
        if v.fract() != 0.0 || !v.is_finite() {
            self.all_integral = false;
        }
        self.distinct.insert(v.to_string());
    }

    pub fn observe_text(&mut self, s: &str) {
        self.num_values += 1;
        if self.all_numeric_text && s.trim().parse::<f64>().is_err() {
            self.all_numeric_text = false;
        }
        if self.all_date_text && parse_date(s).is_none() {
            self.all_date_text = false;
        }
        if self.all_datetime_text && parse_datetime(s).is_none() {
            self.all_datetime_text = false;
        }
        self.distinct.insert(s.to_string());
    }

    pub fn num_non_null(&self) -> u64 {
        self.num_values - self.num_nulls
    }

    pub fn num_distinct(&self) -> usize {
        self.distinct.len()
    }

    /// A column is categorical when it repeats values and has few distinct
    /// values in absolute or relative terms.
    pub fn is_low_cardinality(&self, threshold: &CategoricalThreshold) -> bool {
        let non_null = self.num_non_null();
        let distinct = self.num_distinct() as u64;
        if non_null == 0 || distinct >= non_null {
            return false;
        }
        distinct <= threshold.max_distinct as u64
            || (distinct as f64 / non_null as f64) <= threshold.max_ratio
    }

    /// Build a profile of an Arrow column.
    pub fn of_array(array: &dyn Array) -> Self {
        let mut profile = Self::new();
        match array.data_type() {
            dt if dt.is_integer() => {
                if let Ok(cast) = arrow::compute::cast(array, &DataType::Int64) {
                    for v in cast.as_primitive::<Int64Type>().iter() {
                        match v {
                            Some(v) => profile.observe_int(v),
                            None => profile.observe_null(),
                        }
                    }
                }
            }
            dt if dt.is_floating() || matches!(dt, DataType::Decimal128(..)) => {
                if let Ok(cast) = arrow::compute::cast(array, &DataType::Float64) {
                    for v in cast.as_primitive::<Float64Type>().iter() {
                        match v {
                            Some(v) => profile.observe_float(v),
                            None => profile.observe_null(),
                        }
                    }
                }
            }
            _ => {
                for v in array_to_strings(array) {
                    match v {
                        Some(s) => profile.observe_text(&s),
                        None => profile.observe_null(),
                    }
                }
            }
        }
        profile
    }
}

// ============================================================================
// Inference
// ============================================================================

/// Infer the statistical type of a materialized column, or `None` when the
/// storage type has no statistical interpretation (binary data, all-null
/// columns, nested types).
pub fn infer_stype(array: &dyn Array, threshold: &CategoricalThreshold) -> Option<Stype> {
    let dt = array.data_type();
    match dt {
        DataType::Null => None,
        DataType::Boolean | DataType::Dictionary(_, _) => Some(Stype::Categorical),
        DataType::Date32 | DataType::Date64 | DataType::Timestamp(_, _) => Some(Stype::Timestamp),
        DataType::Time32(_) | DataType::Time64(_) | DataType::Duration(_) => {
            Some(Stype::Numerical)
        }
        DataType::Decimal128(..) | DataType::Decimal256(..) => Some(Stype::Numerical),
        _ if dt.is_integer() || dt.is_floating() => {
            let profile = ValueProfile::of_array(array);
            if profile.num_non_null() == 0 {
                return None;
            }
            if profile.all_integral && profile.is_low_cardinality(threshold) {
                Some(Stype::Categorical)
            } else {
                Some(Stype::Numerical)
            }
        }
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => {
            let profile = ValueProfile::of_array(array);
            infer_text_stype(&profile, threshold)
        }
        _ => None,
    }
}

/// Decide the statistical type of a text column from its profile.
pub fn infer_text_stype(profile: &ValueProfile, threshold: &CategoricalThreshold) -> Option<Stype> {
    if profile.num_non_null() == 0 {
        return None;
    }
    if profile.all_datetime_text {
        Some(Stype::Timestamp)
    } else if profile.all_numeric_text && !profile.is_low_cardinality(threshold) {
        Some(Stype::Numerical)
    } else if profile.is_low_cardinality(threshold) {
        Some(Stype::Categorical)
    } else {
        Some(Stype::TextEmbedded)
    }
}
