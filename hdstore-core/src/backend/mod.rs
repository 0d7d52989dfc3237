//! Fragment back ends
//!
//! A back end is one bounded, fixed-capacity file holding the value slots of a
//! single channel level for a single time window (a fragment):
//!
//! - **Header**: fixed-size, CRC-protected copy of the [`StorageChannelMetaData`]
//! - **Slots**: `capacity` fixed-size records addressed purely by index
//! - **Handles**: open files are shared through an LRU-bounded [`HandlePool`]

mod file;
mod handles;
mod layout;

pub use file::FileBackEnd;
pub use handles::{HandlePool, SharedFile};
pub use layout::{
    FORMAT_VERSION, HEADER_SIZE, MAGIC, MAX_CONFIGURATION_ID_LEN, RECORD_SIZE,
};

use crate::{CalculationMethod, DataType, TimeRange, Timestamp};

/// Identity of one fragment: which channel, level and method it belongs to
/// and which time window it covers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageChannelMetaData {
    /// Configuration id of the owning channel
    pub configuration_id: String,
    /// Method that produced the values (NATIVE for raw data)
    pub calculation_method: CalculationMethod,
    /// Payload type of every slot
    pub data_type: DataType,
    /// Compression level (0 = raw)
    pub level: u32,
    /// Time represented by one slot in milliseconds
    pub slot_span: i64,
    /// Start of the fragment window
    pub start_time: Timestamp,
    /// Number of slots (`MAX_COUNT`)
    pub capacity: u32,
}

impl StorageChannelMetaData {
    /// End of the fragment window (exclusive)
    pub fn end_time(&self) -> Timestamp {
        self.start_time + self.capacity as i64 * self.slot_span
    }

    /// Time window covered by the fragment
    pub fn time_range(&self) -> TimeRange {
        TimeRange::new(self.start_time, self.end_time())
    }

    /// Check if the fragment may hold data in the given range
    pub fn overlaps_time(&self, range: &TimeRange) -> bool {
        self.time_range().overlaps(range)
    }
}
