/*!
# Flowmem Simulator

Deterministic workload driver for the flowmem allocators. A seeded `StdRng`
drives record and pool operations against a live `RecordAllocator` and
`PoolManager`; a shadow model checks every outcome, and every outcome is
folded into a BLAKE3 hash so a run can be reproduced bit for bit from its
seed.

## Key Components:
- **Workload:** one run over freshly opened allocators, checked step by step.
- **Audits:** periodic `verify()` plus owner scans compared to the shadow.
- **Report:** counters and the hex state hash.
*/

use serde::Serialize;
use tracing::info;

use flowmem_core::pool::PoolManager;
use flowmem_core::record::RecordAllocator;
use flowmem_telemetry::MetricsRecorder;

pub mod config;
mod error;
mod workload;

pub use config::SimulatorConfig;
pub use error::SimulationError;

use workload::Workload;

/// Outcome of one [`Simulator::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SimulationReport {
    pub seed: u64,
    pub ops: u64,
    pub record_allocs: u64,
    pub record_frees: u64,
    pub record_alloc_failures: u64,
    pub pool_allocs: u64,
    pub pool_frees: u64,
    /// Pool operations the manager refused as expected.
    pub pool_rejections: u64,
    pub ownership_changes: u64,
    pub peak_records_in_use: u32,
    pub final_records_in_use: u32,
    pub final_pools_in_use: u16,
    pub audits: u64,
    pub state_hash: String,
}

/// Owns the backing memory for one record allocator and one pool manager.
pub struct Simulator {
    config: SimulatorConfig,
    seed: u64,
    record_memory: Vec<u8>,
    pool_memory: Vec<u8>,
    metrics: Option<MetricsRecorder>,
}

impl Simulator {
    pub fn new(config: SimulatorConfig, seed: u64) -> Result<Self, SimulationError> {
        if config.fids == 0 {
            return Err(SimulationError::Config("fids must be at least 1".into()));
        }
        let record_bytes =
            RecordAllocator::size_query(config.max_records, config.max_contig_records)?;
        let pool_bytes = PoolManager::size_query(config.max_pools)?;
        Ok(Self {
            config,
            seed,
            record_memory: vec![0; record_bytes],
            pool_memory: vec![0; pool_bytes],
            metrics: None,
        })
    }

    /// Publishes usage and operation counts while running.
    pub fn with_metrics(mut self, metrics: MetricsRecorder) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Runs `ops` random steps over freshly opened allocators.
    ///
    /// Every run starts from the seed, so repeated runs return the same report.
    pub fn run(&mut self, ops: usize) -> Result<SimulationReport, SimulationError> {
        let records = RecordAllocator::open(
            &mut self.record_memory,
            self.config.max_records,
            self.config.max_contig_records,
        )?;
        let pools = PoolManager::open(&mut self.pool_memory, self.config.max_pools)?;
        let mut workload = Workload::new(
            records,
            pools,
            self.config.fids,
            self.seed,
            self.metrics.clone(),
        );

        let verify_every = self.config.verify_every;
        for step in 0..ops {
            workload.step(step)?;
            if verify_every > 0 && (step + 1) % verify_every == 0 {
                workload.audit(step)?;
            }
        }
        workload.audit(ops)?;

        let report = workload.finish();
        info!(
            seed = report.seed,
            ops = report.ops,
            state_hash = %report.state_hash,
            "simulation finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn small() -> SimulatorConfig {
        SimulatorConfig {
            max_records: 256,
            max_contig_records: 8,
            max_pools: 16,
            fids: 4,
            verify_every: 32,
        }
    }

    #[test]
    fn test_same_seed_same_hash() {
        let a = Simulator::new(small(), 42).unwrap().run(2000).unwrap();
        let b = Simulator::new(small(), 42).unwrap().run(2000).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.state_hash.len(), 64);
    }

    #[test]
    fn test_rerun_is_repeatable() {
        let mut simulator = Simulator::new(small(), 9).unwrap();
        let first = simulator.run(500).unwrap();
        let second = simulator.run(500).unwrap();
        assert_eq!(first.state_hash, second.state_hash);
    }

    #[test]
    fn test_different_seeds_diverge() {
        let a = Simulator::new(small(), 1).unwrap().run(1000).unwrap();
        let b = Simulator::new(small(), 2).unwrap().run(1000).unwrap();
        assert_ne!(a.state_hash, b.state_hash);
    }

    #[test]
    fn test_pressure_reaches_exhaustion() {
        let config = SimulatorConfig {
            max_records: 16,
            max_pools: 2,
            ..small()
        };
        let report = Simulator::new(config, 7).unwrap().run(3000).unwrap();
        assert!(report.record_alloc_failures > 0);
        assert!(report.pool_rejections > 0);
        assert!(report.peak_records_in_use <= 16);
        assert_eq!(report.ops, 3000);
    }

    #[test]
    fn test_metrics_follow_the_run() {
        let metrics = MetricsRecorder::new().unwrap();
        let report = Simulator::new(small(), 5)
            .unwrap()
            .with_metrics(metrics.clone())
            .run(400)
            .unwrap();
        assert_eq!(metrics.records_in_use.get(), i64::from(report.final_records_in_use));
        assert_eq!(metrics.pools_in_use.get(), i64::from(report.final_pools_in_use));
    }

    #[test]
    fn test_rejects_bad_config() {
        let zero_fids = SimulatorConfig { fids: 0, ..small() };
        assert!(matches!(
            Simulator::new(zero_fids, 0),
            Err(SimulationError::Config(_))
        ));
        let bad_contig = SimulatorConfig {
            max_contig_records: 3,
            ..small()
        };
        assert!(matches!(
            Simulator::new(bad_contig, 0),
            Err(SimulationError::Alloc(_))
        ));
    }

    #[traced_test]
    #[test]
    fn test_run_is_logged() {
        Simulator::new(small(), 3).unwrap().run(10).unwrap();
        assert!(logs_contain("simulation finished"));
    }
}
