//! Heap occupancy and slot-check statistics

/// Point-in-time statistics of a hash index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Occupied slots (tombstones included)
    pub elements: u64,
    pub slot_capacity: u64,
    /// Bytes of the record region in use
    pub data_used: u64,
    pub data_capacity: u64,
    /// Chain walks since the last reset
    pub lookups: u64,
    /// Slots inspected by those walks
    pub slot_checks: u64,
}

impl HeapStats {
    /// Average slots inspected per walk
    pub fn avg_slot_checks(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.slot_checks as f64 / self.lookups as f64
        }
    }

    /// Fraction of slots in use
    pub fn load_factor(&self) -> f64 {
        if self.slot_capacity == 0 {
            0.0
        } else {
            self.elements as f64 / self.slot_capacity as f64
        }
    }
}
