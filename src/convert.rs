//! Column converters: raw Arrow columns to aligned encoded series.
//!
//! Every converter returns one or more output arrays, each with exactly the
//! input's row count and order. The converter for a column is chosen by
//! [`converter_for`] from the column's statistical type.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::*;
use arrow::datatypes::{DataType, Int32Type, TimeUnit};
use arrow::error::ArrowError;
use thiserror::Error;

use crate::common::{ColumnStats, Stype, TIMESTAMP_DIM, encode_timestamp};
use crate::config::{BuilderConfig, CategoricalEncoding};
use crate::embedder::{EmbedderError, TextEmbedder};
use crate::schema::ColumnDef;
use crate::stype::{parse_datetime, parse_duration_secs};

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("{stats} statistics cannot drive a {expected} converter")]
    StatsMismatch { expected: Stype, stats: Stype },

    #[error("cannot read {data_type} as {target}")]
    Unsupported {
        data_type: DataType,
        target: &'static str,
    },

    #[error("embedder returned {got} values, expected {expected}")]
    EmbeddingCount { expected: usize, got: usize },

    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error(transparent)]
    Embedder(#[from] EmbedderError),
}

// ============================================================================
// Value extraction
// ============================================================================

/// Extract string values from an Arrow array (handles Utf8, LargeUtf8, Dictionary).
pub fn array_to_strings(array: &dyn Array) -> Vec<Option<String>> {
    let n = array.len();

    if let Some(sa) = array.as_any().downcast_ref::<StringArray>() {
        return sa.iter().map(|v| v.map(str::to_string)).collect();
    }
    if let Some(sa) = array.as_any().downcast_ref::<LargeStringArray>() {
        return sa.iter().map(|v| v.map(str::to_string)).collect();
    }
    if let Some(da) = array.as_any().downcast_ref::<DictionaryArray<Int32Type>>() {
        if let Some(sv) = da.values().as_any().downcast_ref::<StringArray>() {
            return (0..n)
                .map(|i| {
                    if da.is_null(i) {
                        None
                    } else {
                        Some(sv.value(da.keys().value(i) as usize).to_string())
                    }
                })
                .collect();
        }
    }
    // Try generic cast to Utf8
    if let Ok(cast) = arrow::compute::cast(array, &DataType::Utf8) {
        if let Some(sa) = cast.as_any().downcast_ref::<StringArray>() {
            return sa.iter().map(|v| v.map(str::to_string)).collect();
        }
    }
    vec![None; n]
}

/// Numeric view of a column. Text is parsed as a number or, failing that, as
/// a `HH:MM:SS` duration in seconds; unparseable text reads as null.
pub fn numeric_values(array: &dyn Array) -> Result<Vec<Option<f64>>, ConvertError> {
    match array.data_type() {
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => Ok(array_to_strings(array)
            .into_iter()
            .map(|v| {
                v.and_then(|s| {
                    s.trim()
                        .parse::<f64>()
                        .ok()
                        .or_else(|| parse_duration_secs(&s))
                })
            })
            .collect()),
        dt => {
            if !arrow::compute::can_cast_types(dt, &DataType::Float64) {
                return Err(ConvertError::Unsupported {
                    data_type: dt.clone(),
                    target: "numbers",
                });
            }
            let cast = arrow::compute::cast(array, &DataType::Float64)?;
            Ok(cast.as_primitive::<arrow::datatypes::Float64Type>().iter().collect())
        }
    }
}

/// Timestamp view of a column in epoch microseconds. Text is parsed as a
/// datetime; unparseable text reads as null.
pub fn timestamp_values(array: &dyn Array) -> Result<Vec<Option<i64>>, ConvertError> {
    match array.data_type() {
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => Ok(array_to_strings(array)
            .into_iter()
            .map(|v| v.and_then(|s| parse_datetime(&s)).map(|dt| dt.and_utc().timestamp_micros()))
            .collect()),
        dt => {
            let target = DataType::Timestamp(TimeUnit::Microsecond, None);
            if !arrow::compute::can_cast_types(dt, &target) {
                return Err(ConvertError::Unsupported {
                    data_type: dt.clone(),
                    target: "timestamps",
                });
            }
            let cast = arrow::compute::cast(array, &target)?;
            Ok(cast
                .as_primitive::<arrow::datatypes::TimestampMicrosecondType>()
                .iter()
                .collect())
        }
    }
}

// ============================================================================
// Converters
// ============================================================================

pub trait SeriesConverter {
    fn convert(
        &self,
        def: &ColumnDef,
        stats: &ColumnStats,
        column: &ArrayRef,
    ) -> Result<Vec<ArrayRef>, ConvertError>;
}

/// Pass-through.
pub struct IdentityConverter;

impl SeriesConverter for IdentityConverter {
    fn convert(
        &self,
        _def: &ColumnDef,
        _stats: &ColumnStats,
        column: &ArrayRef,
    ) -> Result<Vec<ArrayRef>, ConvertError> {
        Ok(vec![Arc::clone(column)])
    }
}

/// Vocabulary codes (`-1` for null or out-of-vocabulary values), or one
/// indicator series per category.
pub struct CategoricalConverter {
    pub encoding: CategoricalEncoding,
}

fn vocabulary(stats: &ColumnStats) -> Result<&[String], ConvertError> {
    match stats {
        ColumnStats::Categorical { categories, .. } => Ok(categories),
        other => Err(ConvertError::StatsMismatch {
            expected: Stype::Categorical,
            stats: other.stype(),
        }),
    }
}

fn codes_in(categories: &[String], column: &dyn Array) -> Vec<Option<usize>> {
    let index: HashMap<&str, usize> = categories
        .iter()
        .enumerate()
        .map(|(i, c)| (c.as_str(), i))
        .collect();
    array_to_strings(column)
        .into_iter()
        .map(|v| v.and_then(|s| index.get(s.as_str()).copied()))
        .collect()
}

impl SeriesConverter for CategoricalConverter {
    fn convert(
        &self,
        _def: &ColumnDef,
        stats: &ColumnStats,
        column: &ArrayRef,
    ) -> Result<Vec<ArrayRef>, ConvertError> {
        let categories = vocabulary(stats)?;
        let codes = codes_in(categories, column.as_ref());
        match self.encoding {
            CategoricalEncoding::Code => {
                let out: Float32Array = codes
                    .iter()
                    .map(|c| Some(c.map_or(-1.0, |c| c as f32)))
                    .collect();
                Ok(vec![Arc::new(out)])
            }
            CategoricalEncoding::OneHot => Ok((0..categories.len())
                .map(|k| {
                    let out: Float32Array = codes
                        .iter()
                        .map(|c| Some(if *c == Some(k) { 1.0 } else { 0.0 }))
                        .collect();
                    Arc::new(out) as ArrayRef
                })
                .collect()),
        }
    }
}

/// z-scored `f64`, nulls filled before scaling.
pub struct NumericConverter {
    /// `None` fills with the column mean.
    pub fill: Option<f64>,
}

impl SeriesConverter for NumericConverter {
    fn convert(
        &self,
        _def: &ColumnDef,
        stats: &ColumnStats,
        column: &ArrayRef,
    ) -> Result<Vec<ArrayRef>, ConvertError> {
        let &ColumnStats::Numerical { mean, std, .. } = stats else {
            return Err(ConvertError::StatsMismatch {
                expected: Stype::Numerical,
                stats: stats.stype(),
            });
        };
        let fill = self.fill.unwrap_or(mean);
        let out: Float64Array = numeric_values(column.as_ref())?
            .into_iter()
            .map(|v| {
                let v = v.filter(|v| v.is_finite()).unwrap_or(fill);
                Some(if std > 0.0 { (v - mean) / std } else { 0.0 })
            })
            .collect();
        Ok(vec![Arc::new(out)])
    }
}

/// The 15-wide cyclic timestamp encoding; null rows encode as zeros.
pub struct TimestampConverter;

impl SeriesConverter for TimestampConverter {
    fn convert(
        &self,
        _def: &ColumnDef,
        stats: &ColumnStats,
        column: &ArrayRef,
    ) -> Result<Vec<ArrayRef>, ConvertError> {
        let &ColumnStats::Timestamp { mean_us, std_us, .. } = stats else {
            return Err(ConvertError::StatsMismatch {
                expected: Stype::Timestamp,
                stats: stats.stype(),
            });
        };
        let values = timestamp_values(column.as_ref())?;
        let mut slots: Vec<Vec<f32>> = vec![Vec::with_capacity(values.len()); TIMESTAMP_DIM];
        for v in values {
            let enc = match v {
                Some(us) => encode_timestamp(us, mean_us, std_us),
                None => [0.0; TIMESTAMP_DIM],
            };
            for (slot, x) in slots.iter_mut().zip(enc) {
                slot.push(x);
            }
        }
        Ok(slots
            .into_iter()
            .map(|s| Arc::new(Float32Array::from(s)) as ArrayRef)
            .collect())
    }
}

/// One series per embedding component.
pub struct TextConverter<'a> {
    pub embedder: &'a dyn TextEmbedder,
    pub batch_size: usize,
    /// Replaces null text before embedding.
    pub fill: String,
}

impl SeriesConverter for TextConverter<'_> {
    fn convert(
        &self,
        _def: &ColumnDef,
        _stats: &ColumnStats,
        column: &ArrayRef,
    ) -> Result<Vec<ArrayRef>, ConvertError> {
        let texts: Vec<String> = array_to_strings(column.as_ref())
            .into_iter()
            .map(|v| v.unwrap_or_else(|| self.fill.clone()))
            .collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let flat = self.embedder.embed_all(&refs, self.batch_size)?;

        let dim = self.embedder.dim();
        let n = texts.len();
        if flat.len() != n * dim {
            return Err(ConvertError::EmbeddingCount {
                expected: n * dim,
                got: flat.len(),
            });
        }
        let mut slots: Vec<Vec<f32>> = vec![Vec::with_capacity(n); dim];
        for row in flat.chunks_exact(dim.max(1)).take(n) {
            for (slot, x) in slots.iter_mut().zip(row) {
                slot.push(x.to_f32());
            }
        }
        Ok(slots
            .into_iter()
            .map(|s| Arc::new(Float32Array::from(s)) as ArrayRef)
            .collect())
    }
}

/// Feature converter for a statistical type.
pub fn converter_for<'a>(
    stype: Stype,
    config: &BuilderConfig,
    embedder: &'a dyn TextEmbedder,
) -> Box<dyn SeriesConverter + 'a> {
    match stype {
        Stype::Categorical => Box::new(CategoricalConverter {
            encoding: config.categorical_encoding,
        }),
        Stype::Numerical => Box::new(NumericConverter {
            fill: config.numeric_fill,
        }),
        Stype::Timestamp => Box::new(TimestampConverter),
        Stype::TextEmbedded => Box::new(TextConverter {
            embedder,
            batch_size: config.text_batch_size,
            fill: config.text_fill.clone(),
        }),
    }
}
