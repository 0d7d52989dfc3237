//! Calculation logic: derive one higher-level sample from a window of
//! lower-level samples
//!
//! Every input represents the interval `[time, time + input_span)`. Its
//! value weighs with the raw time it stands for (`base_value_count` raw
//! slots), capped by the part of its interval lying inside the output
//! window, so a sparse aggregate does not count like a dense one.
//! Quality indicators are the overlap-weighted share of the *whole* window,
//! so time without any input counts as neither erroneous nor manual.

use crate::{CalculationMethod, Sample, SampleValue, TimeRange};

/// Weighted sums over the inputs of one window
#[derive(Debug)]
struct WindowAccumulator<T> {
    covered: i64,
    weighted_value: f64,
    weighted_error: f64,
    weighted_manual: f64,
    base_value_count: u64,
    min: Option<T>,
    max: Option<T>,
}

impl<T: SampleValue> WindowAccumulator<T> {
    fn new() -> Self {
        Self {
            covered: 0,
            weighted_value: 0.0,
            weighted_error: 0.0,
            weighted_manual: 0.0,
            base_value_count: 0,
            min: None,
            max: None,
        }
    }

    fn add(&mut self, sample: &Sample<T>, weight: i64, overlap: i64) {
        let o = overlap as f64;
        self.covered += weight;
        self.weighted_value += sample.value.to_f64() * weight as f64;
        self.weighted_error += sample.error_indicator as f64 * o;
        self.weighted_manual += sample.manual_indicator as f64 * o;
        self.base_value_count += sample.base_value_count as u64;

        self.min = match self.min {
            Some(current) if current <= sample.value => Some(current),
            _ => Some(sample.value),
        };
        self.max = match self.max {
            Some(current) if current >= sample.value => Some(current),
            _ => Some(sample.value),
        };
    }
}

impl CalculationMethod {
    /// Aggregate `inputs` into one sample stamped with the window start.
    ///
    /// `input_span` is the slot span of the inputs and `raw_span` the slot
    /// span of the raw level their base value counts refer to.
    ///
    /// Returns `None` when no input overlaps the window, and always for
    /// `Native`, which stores raw data and never aggregates.
    pub fn generate_value<T: SampleValue>(
        self,
        inputs: &[Sample<T>],
        window: &TimeRange,
        input_span: i64,
        raw_span: i64,
    ) -> Option<Sample<T>> {
        let duration = window.duration();
        if duration <= 0 || input_span <= 0 || raw_span <= 0 {
            return None;
        }

        let mut acc = WindowAccumulator::new();
        for input in inputs {
            let end = input.time.saturating_add(input_span);
            let overlap = window.overlap(&TimeRange::new(input.time, end));
            if overlap > 0 {
                let represented = (input.base_value_count as i64).saturating_mul(raw_span);
                acc.add(input, represented.min(overlap), overlap);
            }
        }
        if acc.covered == 0 {
            return None;
        }

        let value = match self {
            CalculationMethod::Native => return None,
            CalculationMethod::Average => T::from_f64(acc.weighted_value / acc.covered as f64),
            CalculationMethod::Minimum => acc.min?,
            CalculationMethod::Maximum => acc.max?,
        };

        Some(Sample::aggregate(
            window.start,
            value,
            (acc.weighted_error / duration as f64) as f32,
            (acc.weighted_manual / duration as f64) as f32,
            acc.base_value_count.min(u32::MAX as u64) as u32,
        ))
    }
}
