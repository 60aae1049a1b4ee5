//! ## flowmem-telemetry::metrics
//! **Prometheus usage gauges and operation counters**

use prometheus::{IntCounterVec, IntGauge, Opts, Registry};

/// Allocator a counter sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Record,
    Pool,
}

impl Component {
    fn label(self) -> &'static str {
        match self {
            Component::Record => "record",
            Component::Pool => "pool",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    pub registry: Registry,
    pub records_in_use: IntGauge,
    pub pools_in_use: IntGauge,
    pub allocs: IntCounterVec,
    pub alloc_failures: IntCounterVec,
    pub frees: IntCounterVec,
}

impl MetricsRecorder {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let records_in_use =
            IntGauge::new("flowmem_records_in_use", "Records currently allocated")?;
        let pools_in_use = IntGauge::new("flowmem_pools_in_use", "Pool ids currently allocated")?;
        let allocs = IntCounterVec::new(
            Opts::new("flowmem_alloc_total", "Successful allocations"),
            &["component"],
        )?;
        let alloc_failures = IntCounterVec::new(
            Opts::new("flowmem_alloc_failures_total", "Rejected allocations"),
            &["component"],
        )?;
        let frees = IntCounterVec::new(
            Opts::new("flowmem_free_total", "Successful frees"),
            &["component"],
        )?;

        registry.register(Box::new(records_in_use.clone()))?;
        registry.register(Box::new(pools_in_use.clone()))?;
        registry.register(Box::new(allocs.clone()))?;
        registry.register(Box::new(alloc_failures.clone()))?;
        registry.register(Box::new(frees.clone()))?;

        Ok(Self {
            registry,
            records_in_use,
            pools_in_use,
            allocs,
            alloc_failures,
            frees,
        })
    }

    pub fn gather_metrics(&self) -> Result<String, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::<u8>::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|err| prometheus::Error::Msg(err.to_string()))
    }

    pub fn inc_alloc(&self, component: Component) {
        self.allocs.with_label_values(&[component.label()]).inc();
    }

    pub fn inc_alloc_failure(&self, component: Component) {
        self.alloc_failures
            .with_label_values(&[component.label()])
            .inc();
    }

    pub fn inc_free(&self, component: Component) {
        self.frees.with_label_values(&[component.label()]).inc();
    }

    pub fn set_records_in_use(&self, used: u32) {
        self.records_in_use.set(i64::from(used));
    }

    pub fn set_pools_in_use(&self, used: u16) {
        self.pools_in_use.set(i64::from(used));
    }
}
