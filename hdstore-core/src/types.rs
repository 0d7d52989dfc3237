//! Core types for hdstore

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{HdError, Result};

/// Timestamp in milliseconds since Unix epoch
pub type Timestamp = i64;

/// Payload type stored by a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    /// 64-bit signed integer
    Long,
    /// 64-bit float
    Double,
}

impl DataType {
    /// Tag byte used in the fragment header
    pub fn tag(self) -> u8 {
        match self {
            DataType::Long => 1,
            DataType::Double => 2,
        }
    }

    /// Decode a header tag byte
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(DataType::Long),
            2 => Ok(DataType::Double),
            _ => Err(HdError::InvalidFormat(format!("Invalid data type tag: {}", tag))),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Long => f.write_str("LONG"),
            DataType::Double => f.write_str("DOUBLE"),
        }
    }
}

impl FromStr for DataType {
    type Err = HdError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "LONG" | "INT64" => Ok(DataType::Long),
            "DOUBLE" | "FLOAT64" => Ok(DataType::Double),
            other => Err(HdError::Config(format!("Unknown data type: {}", other))),
        }
    }
}

/// Aggregation function that derives one level from the level below it.
///
/// `Native` marks the raw level 0 and never aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CalculationMethod {
    Native,
    Average,
    Minimum,
    Maximum,
}

impl CalculationMethod {
    /// Short label used in file names and configuration
    pub fn label(self) -> &'static str {
        match self {
            CalculationMethod::Native => "NATIVE",
            CalculationMethod::Average => "AVG",
            CalculationMethod::Minimum => "MIN",
            CalculationMethod::Maximum => "MAX",
        }
    }

    /// Tag byte used in the fragment header
    pub fn tag(self) -> u8 {
        match self {
            CalculationMethod::Native => 0,
            CalculationMethod::Average => 1,
            CalculationMethod::Minimum => 2,
            CalculationMethod::Maximum => 3,
        }
    }

    /// Decode a header tag byte
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(CalculationMethod::Native),
            1 => Ok(CalculationMethod::Average),
            2 => Ok(CalculationMethod::Minimum),
            3 => Ok(CalculationMethod::Maximum),
            _ => Err(HdError::InvalidFormat(format!(
                "Invalid calculation method tag: {}",
                tag
            ))),
        }
    }
}

impl fmt::Display for CalculationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for CalculationMethod {
    type Err = HdError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "NATIVE" => Ok(CalculationMethod::Native),
            "AVG" | "AVERAGE" => Ok(CalculationMethod::Average),
            "MIN" | "MINIMUM" => Ok(CalculationMethod::Minimum),
            "MAX" | "MAXIMUM" => Ok(CalculationMethod::Maximum),
            other => Err(HdError::Config(format!(
                "Unknown calculation method: {}",
                other
            ))),
        }
    }
}

/// Numeric payload that can be stored in a fragment slot
pub trait SampleValue: Copy + PartialOrd + fmt::Debug + Send + Sync + 'static {
    /// Data type tag of this payload
    const DATA_TYPE: DataType;

    /// Raw 64-bit representation written to disk
    fn to_bits(self) -> u64;

    /// Rebuild from the raw 64-bit representation
    fn from_bits(bits: u64) -> Self;

    /// Widen to f64 for weighted arithmetic
    fn to_f64(self) -> f64;

    /// Narrow an aggregate back to the payload type
    fn from_f64(value: f64) -> Self;
}

impl SampleValue for i64 {
    const DATA_TYPE: DataType = DataType::Long;

    fn to_bits(self) -> u64 {
        self as u64
    }

    fn from_bits(bits: u64) -> Self {
        bits as i64
    }

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(value: f64) -> Self {
        value.round() as i64
    }
}

impl SampleValue for f64 {
    const DATA_TYPE: DataType = DataType::Double;

    fn to_bits(self) -> u64 {
        f64::to_bits(self)
    }

    fn from_bits(bits: u64) -> Self {
        f64::from_bits(bits)
    }

    fn to_f64(self) -> f64 {
        self
    }

    fn from_f64(value: f64) -> Self {
        value
    }
}

fn normalize_fraction(fraction: f32) -> f32 {
    if fraction.is_nan() {
        0.0
    } else {
        fraction.clamp(0.0, 1.0)
    }
}

/// A quality-tagged value addressed by its slot inside a fragment
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Value<T> {
    /// Slot position within the fragment
    pub index: i64,
    /// Payload
    pub value: T,
    /// Fraction of the represented interval flagged erroneous
    pub error_indicator: f32,
    /// Fraction of the represented interval manually overridden
    pub manual_indicator: f32,
    /// Number of underlying samples folded into this value
    pub base_value_count: u32,
}

/// Long slot value
pub type LongValue = Value<i64>;

/// Double slot value
pub type DoubleValue = Value<f64>;

impl<T: SampleValue> Value<T> {
    /// Create a clean raw value
    pub fn new(index: i64, value: T) -> Self {
        Self::with_quality(index, value, 0.0, 0.0, 1)
    }

    /// Create a value with explicit quality information
    pub fn with_quality(
        index: i64,
        value: T,
        error_indicator: f32,
        manual_indicator: f32,
        base_value_count: u32,
    ) -> Self {
        Self {
            index,
            value,
            error_indicator: normalize_fraction(error_indicator),
            manual_indicator: normalize_fraction(manual_indicator),
            base_value_count: base_value_count.max(1),
        }
    }

    /// Resolve the slot back to a timestamp
    pub fn at_time(&self, fragment_start: Timestamp, slot_span: i64) -> Sample<T> {
        Sample {
            time: fragment_start + self.index * slot_span,
            value: self.value,
            error_indicator: self.error_indicator,
            manual_indicator: self.manual_indicator,
            base_value_count: self.base_value_count,
        }
    }
}

/// A quality-tagged value addressed by its timestamp
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample<T> {
    /// Start of the represented interval
    pub time: Timestamp,
    /// Payload
    pub value: T,
    /// Fraction of the represented interval flagged erroneous
    pub error_indicator: f32,
    /// Fraction of the represented interval manually overridden
    pub manual_indicator: f32,
    /// Number of underlying samples folded into this value
    pub base_value_count: u32,
}

impl<T: SampleValue> Sample<T> {
    /// Create a clean raw sample
    pub fn new(time: Timestamp, value: T) -> Self {
        Self::aggregate(time, value, 0.0, 0.0, 1)
    }

    /// Create a raw sample with boolean quality flags
    pub fn raw(time: Timestamp, value: T, error: bool, manual: bool) -> Self {
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        Self::aggregate(time, value, flag(error), flag(manual), 1)
    }

    /// Create a sample carrying fractional quality information
    pub fn aggregate(
        time: Timestamp,
        value: T,
        error_indicator: f32,
        manual_indicator: f32,
        base_value_count: u32,
    ) -> Self {
        Self {
            time,
            value,
            error_indicator: normalize_fraction(error_indicator),
            manual_indicator: normalize_fraction(manual_indicator),
            base_value_count: base_value_count.max(1),
        }
    }

    /// Address this sample relative to a fragment start.
    ///
    /// The index may fall outside the fragment; the back end drops such writes.
    pub fn at_index(&self, fragment_start: Timestamp, slot_span: i64) -> Value<T> {
        Value {
            index: (self.time - fragment_start).div_euclid(slot_span),
            value: self.value,
            error_indicator: self.error_indicator,
            manual_indicator: self.manual_indicator,
            base_value_count: self.base_value_count,
        }
    }
}

/// Half-open time range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,
    /// End timestamp (exclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// The span-aligned range of length `span` containing `time`
    pub fn aligned(time: Timestamp, span: i64) -> Self {
        let start = align_down(time, span);
        Self::new(start, start + span)
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Check if two ranges overlap
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Length of the intersection with `other` in milliseconds
    pub fn overlap(&self, other: &TimeRange) -> i64 {
        self.end.min(other.end).saturating_sub(self.start.max(other.start)).max(0)
    }

    /// Duration in milliseconds
    pub fn duration(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }

    /// True for empty or reversed ranges
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Largest multiple of `span` (counted from the epoch) not after `time`,
/// saturating at `Timestamp::MIN`
pub fn align_down(time: Timestamp, span: i64) -> Timestamp {
    time.saturating_sub(time.rem_euclid(span))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range() {
        let range1 = TimeRange::new(100, 200);
        let range2 = TimeRange::new(150, 250);
        let range3 = TimeRange::new(200, 400);

        assert!(range1.overlaps(&range2));
        assert!(!range1.overlaps(&range3));
        assert!(range1.contains(100));
        assert!(!range1.contains(200));
        assert_eq!(range1.overlap(&range2), 50);
        assert_eq!(range1.overlap(&range3), 0);
        assert!(TimeRange::new(10, 10).is_empty());
        assert!(TimeRange::new(10, 5).is_empty());
    }

    #[test]
    fn test_alignment_handles_negative_times() {
        assert_eq!(align_down(1_500, 1_000), 1_000);
        assert_eq!(align_down(-1, 1_000), -1_000);
        assert_eq!(TimeRange::aligned(-1_000, 1_000), TimeRange::new(-1_000, 0));
    }

    #[test]
    fn test_alignment_saturates_at_the_minimum() {
        assert_eq!(align_down(i64::MIN, 1_000), i64::MIN);
        assert_eq!(align_down(i64::MIN, 1), i64::MIN);
        assert_eq!(align_down(i64::MAX, 1_000), i64::MAX - 807);
    }

    #[test]
    fn test_index_time_conversion() {
        let sample = Sample::new(10_500, 7i64);
        let value = sample.at_index(10_000, 100);
        assert_eq!(value.index, 5);
        assert_eq!(value.at_time(10_000, 100).time, 10_500);

        let before = Sample::new(9_950, 7i64).at_index(10_000, 100);
        assert_eq!(before.index, -1);
    }

    #[test]
    fn test_quality_normalization() {
        let v = Value::with_quality(0, 1.0f64, 1.5, f32::NAN, 0);
        assert_eq!(v.error_indicator, 1.0);
        assert_eq!(v.manual_indicator, 0.0);
        assert_eq!(v.base_value_count, 1);

        let raw = Sample::raw(0, 3i64, true, false);
        assert_eq!(raw.error_indicator, 1.0);
        assert_eq!(raw.manual_indicator, 0.0);
    }

    #[test]
    fn test_label_parsing() {
        assert_eq!("avg".parse::<CalculationMethod>().unwrap(), CalculationMethod::Average);
        assert_eq!(" Maximum ".parse::<CalculationMethod>().unwrap(), CalculationMethod::Maximum);
        assert!("median".parse::<CalculationMethod>().is_err());
        assert_eq!("double".parse::<DataType>().unwrap(), DataType::Double);
        assert_eq!(DataType::from_tag(DataType::Long.tag()).unwrap(), DataType::Long);
        assert!(CalculationMethod::from_tag(9).is_err());
    }

    #[test]
    fn test_long_payload_rounds_to_nearest() {
        assert_eq!(<i64 as SampleValue>::from_f64(2.5), 3);
        assert_eq!(<i64 as SampleValue>::from_f64(-2.4), -2);
        assert_eq!(<i64 as SampleValue>::from_bits((-5i64).to_bits()), -5);
    }
}
