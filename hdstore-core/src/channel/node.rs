//! One (method, level) node of a calculating channel

use crate::multiplexer::BackEndMultiplexer;
use crate::{align_down, CalculationMethod, Result, Sample, SampleValue, TimeRange, Timestamp};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

/// Tracks which parent window is accumulating and whether it was emitted
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WindowCursor {
    current: Option<i64>,
    emitted: bool,
}

impl WindowCursor {
    /// Cursor for a node that already holds data in `window`
    pub(crate) fn resume(window: i64) -> Self {
        Self {
            current: Some(window),
            emitted: false,
        }
    }

    /// Record a write into `window`; returns the windows to emit, oldest first.
    ///
    /// `completes` is set when the write filled the last slot of `window`.
    pub(crate) fn advance(&mut self, window: i64, completes: bool) -> Vec<i64> {
        match self.current {
            None => {
                self.current = Some(window);
                self.emitted = completes;
                if completes {
                    vec![window]
                } else {
                    Vec::new()
                }
            }
            Some(current) if window > current => {
                let mut emit = Vec::with_capacity(2);
                if !self.emitted {
                    emit.push(current);
                }
                self.current = Some(window);
                self.emitted = completes;
                if completes {
                    emit.push(window);
                }
                emit
            }
            Some(current) if window == current => {
                if completes || self.emitted {
                    self.emitted = true;
                    vec![window]
                } else {
                    Vec::new()
                }
            }
            // Late write into a window that was already closed
            Some(_) => vec![window],
        }
    }
}

/// Storage of one level for one method, plus the nodes it feeds
pub(crate) struct LevelNode {
    pub(crate) method: CalculationMethod,
    pub(crate) level: u32,
    pub(crate) slot_span: i64,
    /// Slot span of the raw level, the unit of base value counts
    raw_span: i64,
    /// Slot span of the children; `None` at the top of the chain
    window_span: Option<i64>,
    pub(crate) multiplexer: BackEndMultiplexer,
    children: Vec<Arc<LevelNode>>,
    cursor: Mutex<WindowCursor>,
}

impl LevelNode {
    pub(crate) fn new(
        method: CalculationMethod,
        level: u32,
        slot_span: i64,
        raw_span: i64,
        multiplexer: BackEndMultiplexer,
        children: Vec<Arc<LevelNode>>,
    ) -> Self {
        let window_span = children.first().map(|c| c.slot_span);
        Self {
            method,
            level,
            slot_span,
            raw_span,
            window_span,
            multiplexer,
            children,
            cursor: Mutex::new(WindowCursor::default()),
        }
    }

    /// Load fragments and resume the window cursor from the newest sample
    pub(crate) fn initialize<T: SampleValue>(&self) -> Result<usize> {
        let count = self.multiplexer.initialize()?;
        let latest = self.multiplexer.latest_time::<T>()?;
        if let (Some(window_span), Some(time)) = (self.window_span, latest) {
            *self.cursor.lock() = WindowCursor::resume(time.div_euclid(window_span));
        }
        Ok(count)
    }

    /// Newest stored sample time
    pub(crate) fn latest_time<T: SampleValue>(&self) -> Result<Option<Timestamp>> {
        self.multiplexer.latest_time::<T>()
    }

    /// Store `sample` and emit every window the write completes or corrects
    pub(crate) fn write<T: SampleValue>(&self, sample: &Sample<T>) -> Result<bool> {
        let mut cursor = self.cursor.lock();

        if !self.multiplexer.update(sample)? {
            return Ok(false);
        }
        let Some(window_span) = self.window_span else {
            return Ok(true);
        };

        let window = sample.time.div_euclid(window_span);
        let slot_end = align_down(sample.time, self.slot_span) + self.slot_span;
        let completes = slot_end == (window + 1) * window_span;

        for w in cursor.advance(window, completes) {
            self.emit::<T>(w, window_span)?;
        }
        Ok(true)
    }

    fn emit<T: SampleValue>(&self, window: i64, window_span: i64) -> Result<()> {
        let range = TimeRange::new(window * window_span, (window + 1) * window_span);
        let inputs = self.multiplexer.get_values::<T>(&range)?;

        trace!(
            "Level {} {} emitting window {} from {} samples",
            self.level,
            self.method,
            range.start,
            inputs.len()
        );

        for child in &self.children {
            let aggregate = child
                .method
                .generate_value(&inputs, &range, self.slot_span, self.raw_span);
            if let Some(aggregate) = aggregate {
                child.write(&aggregate)?;
            }
        }
        Ok(())
    }
}
