//! Record allocator sizing.

use serde::{Deserialize, Serialize};
use validator::{self, Validate};

use crate::validation;

/// Largest record count one allocator instance manages.
pub const MAX_RECORDS: u32 = 64 * 1024 * 1024;

/// Parameters for one record allocator instance.
#[derive(Debug, Serialize, Deserialize, Validate, Clone, PartialEq, Eq)]
pub struct RecordConfig {
    /// Records managed; rounded up to a multiple of `max_contig_records` at open.
    #[serde(default = "default_max_records")]
    #[validate(range(min = 1, max = MAX_RECORDS))]
    pub max_records: u32,

    /// Largest contiguous group handed out (power of two, at most 8).
    #[serde(default = "default_max_contig_records")]
    #[validate(range(min = 1, max = 8))]
    #[validate(custom(function = validation::validate_power_of_two))]
    pub max_contig_records: u16,
}

fn default_max_records() -> u32 {
    64 * 1024
}

fn default_max_contig_records() -> u16 {
    8
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
            max_contig_records: default_max_contig_records(),
        }
    }
}
