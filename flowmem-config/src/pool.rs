//! Pool manager sizing.

use serde::{Deserialize, Serialize};
use validator::{self, Validate};

#[derive(Debug, Serialize, Deserialize, Validate, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Size of the pool-id universe.
    #[serde(default = "default_max_pools")]
    #[validate(range(min = 1, max = 1040))]
    pub max_pools: u16,

    /// log2 of the records per pool, stored opaquely by the manager.
    #[serde(default = "default_pool_size_exp")]
    #[validate(range(max = 26))]
    pub pool_size_exp: u8,
}

fn default_max_pools() -> u16 {
    1040
}

fn default_pool_size_exp() -> u8 {
    6
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pools: default_max_pools(),
            pool_size_exp: default_pool_size_exp(),
        }
    }
}
