//! One seeded run against a record allocator and a pool manager, checked
//! step by step against a plain shadow model.

use std::collections::BTreeMap;

use blake3::Hasher;
use flowmem_core::prelude::*;
use flowmem_telemetry::{Component, MetricsRecorder};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use crate::{SimulationError, SimulationReport};

// Tags folded into the state hash ahead of each outcome.
const TAG_RECORD_ALLOC: u8 = 1;
const TAG_RECORD_FREE: u8 = 2;
const TAG_POOL_ALLOC: u8 = 3;
const TAG_POOL_FREE: u8 = 4;
const TAG_OWNER_ADD: u8 = 5;
const TAG_OWNER_REMOVE: u8 = 6;
const TAG_RELEASE: u8 = 7;
const TAG_EXHAUSTED: u8 = 0xE0;
const TAG_REJECTED: u8 = 0xE1;
const TAG_IDLE: u8 = 0xFF;

#[derive(Default)]
struct Shadow {
    occupied: Vec<bool>,
    live: Vec<(u32, u16)>,
    records_in_use: u32,
    pools: BTreeMap<PoolId, Option<Fid>>,
}

pub(crate) struct Workload<'a> {
    records: RecordAllocator<'a>,
    pools: PoolManager<'a>,
    fids: u16,
    metrics: Option<MetricsRecorder>,
    rng: StdRng,
    hasher: Hasher,
    shadow: Shadow,
    report: SimulationReport,
}

fn diverged(step: usize, detail: impl Into<String>) -> SimulationError {
    SimulationError::Divergence {
        step,
        detail: detail.into(),
    }
}

impl<'a> Workload<'a> {
    pub(crate) fn new(
        records: RecordAllocator<'a>,
        pools: PoolManager<'a>,
        fids: u16,
        seed: u64,
        metrics: Option<MetricsRecorder>,
    ) -> Self {
        let shadow = Shadow {
            occupied: vec![false; records.max_records() as usize],
            ..Shadow::default()
        };
        Self {
            records,
            pools,
            fids,
            metrics,
            rng: StdRng::seed_from_u64(seed),
            hasher: Hasher::new(),
            shadow,
            report: SimulationReport {
                seed,
                ..SimulationReport::default()
            },
        }
    }

    fn fold(&mut self, tag: u8, payload: &[u8]) {
        self.hasher.update(&[tag]);
        self.hasher.update(payload);
    }

    fn count_alloc(&self, component: Component, succeeded: bool) {
        match &self.metrics {
            Some(metrics) if succeeded => metrics.inc_alloc(component),
            Some(metrics) => metrics.inc_alloc_failure(component),
            None => {}
        }
    }

    pub(crate) fn step(&mut self, step: usize) -> Result<(), SimulationError> {
        match self.rng.random_range(0..100u32) {
            0..=39 => self.alloc_records(step)?,
            40..=69 => self.free_records(step)?,
            70..=79 => self.alloc_pool(step)?,
            80..=86 => self.own_pool(step)?,
            87..=92 => self.disown_pool(step)?,
            93..=96 => self.free_pool(step)?,
            _ => self.release_fid(step)?,
        }
        self.report.ops += 1;
        self.check_usage(step)
    }

    fn alloc_records(&mut self, step: usize) -> Result<(), SimulationError> {
        let max_exp = self.records.max_contig_records().trailing_zeros();
        let n = 1u16 << self.rng.random_range(0..=max_exp);
        match self.records.alloc(n) {
            Ok(allocation) => {
                let start = allocation.offset as usize;
                let range = start..start + usize::from(n);
                if self.shadow.occupied[range.clone()].iter().any(|&taken| taken) {
                    return Err(diverged(
                        step,
                        format!("records {}..+{} handed out twice", allocation.offset, n),
                    ));
                }
                let class = self.records.entry_size_get(allocation.offset)?;
                if class.records() != n {
                    return Err(diverged(
                        step,
                        format!("record {} reports {} records, expected {}", allocation.offset, class.records(), n),
                    ));
                }
                self.shadow.occupied[range].fill(true);
                self.shadow.live.push((allocation.offset, n));
                self.shadow.records_in_use += u32::from(n);
                self.report.record_allocs += 1;
                self.report.peak_records_in_use =
                    self.report.peak_records_in_use.max(allocation.used);
                self.count_alloc(Component::Record, true);
                trace!(step, offset = allocation.offset, records = n, "records allocated");
                self.fold(TAG_RECORD_ALLOC, &allocation.offset.to_le_bytes());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::Exhaustion => {
                self.report.record_alloc_failures += 1;
                self.count_alloc(Component::Record, false);
                self.fold(TAG_EXHAUSTED, &n.to_le_bytes());
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn free_records(&mut self, step: usize) -> Result<(), SimulationError> {
        if self.shadow.live.is_empty() {
            self.fold(TAG_IDLE, &[]);
            return Ok(());
        }
        let pick = self.rng.random_range(0..self.shadow.live.len());
        let (offset, n) = self.shadow.live.swap_remove(pick);
        let used = self.records.free(offset, n)?;
        self.shadow.records_in_use -= u32::from(n);
        if used != self.shadow.records_in_use {
            return Err(diverged(
                step,
                format!("free reported {} in use, expected {}", used, self.shadow.records_in_use),
            ));
        }
        let start = offset as usize;
        self.shadow.occupied[start..start + usize::from(n)].fill(false);
        if self.records.entry_size_get(offset) != Err(AllocError::NotFound) {
            return Err(diverged(step, format!("record {} still reported after free", offset)));
        }
        self.report.record_frees += 1;
        if let Some(metrics) = &self.metrics {
            metrics.inc_free(Component::Record);
        }
        self.fold(TAG_RECORD_FREE, &offset.to_le_bytes());
        Ok(())
    }

    fn alloc_pool(&mut self, step: usize) -> Result<(), SimulationError> {
        let lowest_free = (0..self.pools.max_pools()).find(|id| !self.shadow.pools.contains_key(id));
        match self.pools.alloc() {
            Ok(pool) => {
                if lowest_free != Some(pool) {
                    return Err(diverged(
                        step,
                        format!("pool {} allocated, expected {:?}", pool, lowest_free),
                    ));
                }
                self.shadow.pools.insert(pool, None);
                self.report.pool_allocs += 1;
                self.count_alloc(Component::Pool, true);
                self.fold(TAG_POOL_ALLOC, &pool.to_le_bytes());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::Exhaustion => {
                if lowest_free.is_some() {
                    return Err(diverged(step, "pool exhaustion with free ids left"));
                }
                self.report.pool_rejections += 1;
                self.count_alloc(Component::Pool, false);
                self.fold(TAG_EXHAUSTED, &[]);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn pick_pool(&mut self, owned_only: bool) -> Option<(PoolId, Option<Fid>)> {
        let candidates: Vec<_> = self
            .shadow
            .pools
            .iter()
            .filter(|(_, owner)| !owned_only || owner.is_some())
            .map(|(&pool, &owner)| (pool, owner))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        Some(candidates[self.rng.random_range(0..candidates.len())])
    }

    fn own_pool(&mut self, step: usize) -> Result<(), SimulationError> {
        let Some((pool, owner)) = self.pick_pool(false) else {
            self.fold(TAG_IDLE, &[]);
            return Ok(());
        };
        let fid = self.rng.random_range(0..self.fids);
        let result = self.pools.owner_add(pool, fid);
        match (owner, result) {
            (None, Ok(())) => {
                self.shadow.pools.insert(pool, Some(fid));
                self.report.ownership_changes += 1;
                self.fold(TAG_OWNER_ADD, &[pool.to_le_bytes(), fid.to_le_bytes()].concat());
                Ok(())
            }
            (Some(current), Ok(())) if current == fid => {
                self.fold(TAG_OWNER_ADD, &[pool.to_le_bytes(), fid.to_le_bytes()].concat());
                Ok(())
            }
            (Some(current), Err(AllocError::OwnerConflict { owner, .. })) if owner == current => {
                self.report.pool_rejections += 1;
                self.fold(TAG_REJECTED, &pool.to_le_bytes());
                Ok(())
            }
            (expected, result) => Err(diverged(
                step,
                format!("owner_add({}, {}) gave {:?} with owner {:?}", pool, fid, result, expected),
            )),
        }
    }

    fn disown_pool(&mut self, step: usize) -> Result<(), SimulationError> {
        let Some((pool, Some(owner))) = self.pick_pool(true) else {
            self.fold(TAG_IDLE, &[]);
            return Ok(());
        };
        // A stranger is always refused before the owner succeeds.
        let stranger = owner.wrapping_add(1) % self.fids.max(2);
        if stranger != owner && self.pools.owner_remove(pool, stranger).is_ok() {
            return Err(diverged(step, format!("fid {} removed owner {} from pool {}", stranger, owner, pool)));
        }
        self.pools.owner_remove(pool, owner)?;
        self.shadow.pools.insert(pool, None);
        self.report.ownership_changes += 1;
        self.fold(TAG_OWNER_REMOVE, &pool.to_le_bytes());
        Ok(())
    }

    fn free_pool(&mut self, step: usize) -> Result<(), SimulationError> {
        let Some((pool, owner)) = self.pick_pool(false) else {
            self.fold(TAG_IDLE, &[]);
            return Ok(());
        };
        match (owner, self.pools.free(pool)) {
            (None, Ok(())) => {
                self.shadow.pools.remove(&pool);
                self.report.pool_frees += 1;
                if let Some(metrics) = &self.metrics {
                    metrics.inc_free(Component::Pool);
                }
                self.fold(TAG_POOL_FREE, &pool.to_le_bytes());
                Ok(())
            }
            (Some(fid), Err(AllocError::PoolOwned { owner, .. })) if owner == fid => {
                self.report.pool_rejections += 1;
                self.fold(TAG_REJECTED, &pool.to_le_bytes());
                Ok(())
            }
            (expected, result) => Err(diverged(
                step,
                format!("free({}) gave {:?} with owner {:?}", pool, result, expected),
            )),
        }
    }

    fn release_fid(&mut self, step: usize) -> Result<(), SimulationError> {
        let fid = self.rng.random_range(0..self.fids);
        let mut expected = 0;
        for owner in self.shadow.pools.values_mut() {
            if *owner == Some(fid) {
                *owner = None;
                expected += 1;
            }
        }
        let released = self.pools.release_owner(fid);
        if released != expected {
            return Err(diverged(
                step,
                format!("release_owner({}) freed {} pools, expected {}", fid, released, expected),
            ));
        }
        self.report.ownership_changes += released as u64;
        self.fold(TAG_RELEASE, &[fid.to_le_bytes(), (released as u16).to_le_bytes()].concat());
        Ok(())
    }

    fn check_usage(&self, step: usize) -> Result<(), SimulationError> {
        let used = self.records.records_in_use();
        if used != self.shadow.records_in_use {
            return Err(diverged(
                step,
                format!("{} records in use, expected {}", used, self.shadow.records_in_use),
            ));
        }
        let pools = self.pools.pools_in_use();
        if usize::from(pools) != self.shadow.pools.len() {
            return Err(diverged(
                step,
                format!("{} pools in use, expected {}", pools, self.shadow.pools.len()),
            ));
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_records_in_use(used);
            metrics.set_pools_in_use(pools);
        }
        Ok(())
    }

    /// Full structural audit plus owner scans against the shadow model.
    pub(crate) fn audit(&mut self, step: usize) -> Result<(), SimulationError> {
        self.records.verify()?;
        for fid in 0..self.fids {
            let expected: Vec<PoolId> = self
                .shadow
                .pools
                .iter()
                .filter(|(_, owner)| **owner == Some(fid))
                .map(|(&pool, _)| pool)
                .collect();
            let found: Vec<PoolId> = self.pools.find_pools_by_owner(fid).collect();
            if found != expected {
                return Err(diverged(
                    step,
                    format!("fid {} owns {:?}, expected {:?}", fid, found, expected),
                ));
            }
        }
        self.report.audits += 1;
        Ok(())
    }

    /// Closes both allocators and seals the report with the state hash.
    pub(crate) fn finish(self) -> SimulationReport {
        let Self {
            records,
            pools,
            hasher,
            mut report,
            ..
        } = self;
        report.final_records_in_use = records.records_in_use();
        report.final_pools_in_use = pools.pools_in_use();
        records.close();
        pools.close();
        report.state_hash = hex::encode(hasher.finalize().as_bytes());
        report
    }
}
