//! Per-column statistics, computed once per materialization.

use std::collections::HashMap;

use arrow::array::Array;

use crate::common::{ColumnStats, Stype};
use crate::convert::{ConvertError, array_to_strings, numeric_values, timestamp_values};

/// Compute the statistics of `column` for the given statistical type.
///
/// `max_categories` truncates a categorical vocabulary to its most frequent
/// entries; `text_dim` is recorded for text columns.
pub fn compute_stats(
    stype: Stype,
    column: &dyn Array,
    max_categories: Option<usize>,
    text_dim: usize,
) -> Result<ColumnStats, ConvertError> {
    let stats = match stype {
        Stype::Numerical => numerical_stats(&numeric_values(column)?),
        Stype::Timestamp => timestamp_stats(&timestamp_values(column)?),
        Stype::Categorical => categorical_stats(column, max_categories),
        Stype::TextEmbedded => ColumnStats::TextEmbedded {
            num_nulls: column.null_count() as u64,
            dim: text_dim as u32,
        },
    };
    Ok(stats)
}

/// Mean and sample standard deviation; `std` falls back to 1.0 with fewer
/// than two values. Non-finite values count as nulls.
pub fn numerical_stats(values: &[Option<f64>]) -> ColumnStats {
    let mut num_nulls = 0u64;
    let mut sum = 0.0f64;
    let mut count = 0u64;
    let mut min_val = f64::MAX;
    let mut max_val = f64::MIN;
    for v in values {
        match v {
            Some(v) if v.is_finite() => {
                sum += v;
                count += 1;
                min_val = min_val.min(*v);
                max_val = max_val.max(*v);
            }
            _ => num_nulls += 1,
        }
    }
    let mean = if count > 0 { sum / count as f64 } else { 0.0 };
    let var_sum: f64 = values
        .iter()
        .flatten()
        .filter(|v| v.is_finite())
        .map(|v| (v - mean) * (v - mean))
        .sum();
    let std = if count > 1 {
        (var_sum / (count - 1) as f64).sqrt()
    } else {
        1.0
    };
    ColumnStats::Numerical {
        num_nulls,
        min: if count > 0 { min_val } else { 0.0 },
        max: if count > 0 { max_val } else { 0.0 },
        mean,
        std,
    }
}

pub fn timestamp_stats(values: &[Option<i64>]) -> ColumnStats {
    let mut num_nulls = 0u64;
    let mut sum = 0.0f64;
    let mut count = 0u64;
    let mut min_val = i64::MAX;
    let mut max_val = i64::MIN;
    for v in values {
        match *v {
            Some(v) => {
                sum += v as f64;
                count += 1;
                min_val = min_val.min(v);
                max_val = max_val.max(v);
            }
            None => num_nulls += 1,
        }
    }
    let mean_us = if count > 0 { sum / count as f64 } else { 0.0 };
    let var_sum: f64 = values
        .iter()
        .flatten()
        .map(|&v| {
            let d = v as f64 - mean_us;
            d * d
        })
        .sum();
    let std_us = if count > 1 {
        (var_sum / (count - 1) as f64).sqrt()
    } else {
        1.0
    };
    ColumnStats::Timestamp {
        num_nulls,
        min_us: if count > 0 { min_val } else { 0 },
        max_us: if count > 0 { max_val } else { 0 },
        mean_us,
        std_us,
    }
}

/// Vocabulary ordered by descending count, ties broken by value.
pub fn categorical_stats(column: &dyn Array, max_categories: Option<usize>) -> ColumnStats {
    let mut num_nulls = 0u64;
    let mut counts: HashMap<String, u64> = HashMap::new();
    for v in array_to_strings(column) {
        match v {
            Some(s) => *counts.entry(s).or_default() += 1,
            None => num_nulls += 1,
        }
    }
    let mut entries: Vec<(String, u64)> = counts.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    if let Some(max) = max_categories {
        entries.truncate(max);
    }
    let (categories, counts) = entries.into_iter().unzip();
    ColumnStats::Categorical {
        num_nulls,
        categories,
        counts,
    }
}
