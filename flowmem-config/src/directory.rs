//! Instance directory sizing.

use serde::{Deserialize, Serialize};
use validator::{self, Validate};

#[derive(Debug, Serialize, Deserialize, Validate, Clone, PartialEq, Eq)]
pub struct DirectoryConfig {
    #[serde(default = "default_max_table_scopes")]
    #[validate(range(min = 1))]
    pub max_table_scopes: u8,

    /// Regions per table scope (lookup and action by default).
    #[serde(default = "default_max_regions")]
    #[validate(range(min = 1))]
    pub max_regions: u8,
}

fn default_max_table_scopes() -> u8 {
    32
}

fn default_max_regions() -> u8 {
    2
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            max_table_scopes: default_max_table_scopes(),
            max_regions: default_max_regions(),
        }
    }
}
