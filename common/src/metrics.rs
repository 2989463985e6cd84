use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use metrics_util::{
    parse_quantiles,
    registry::{AtomicStorage, GenerationalAtomicStorage, GenerationalStorage, Recency, Registry},
    MetricKindMask, Quantile, Summary,
};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    fmt::Write,
    sync::{atomic::Ordering, Arc, Mutex},
    time::Duration,
};

type SharedRegistry = Arc<Registry<Key, GenerationalAtomicStorage>>;

/// Recorder that keeps everything in an in-process registry; values are only
/// ever surfaced through the log by a [`MetricsHandle`].
pub struct MetricsLogRecorder {
    registry: SharedRegistry,
}

impl Recorder for MetricsLogRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        self.registry
            .get_or_create_counter(key, |c| c.clone().into())
    }
    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        self.registry
            .get_or_create_gauge(key, |g| Gauge::from_arc(g.clone().into()))
    }
    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        self.registry
            .get_or_create_histogram(key, |h| Histogram::from_arc(h.clone().into()))
    }
}

struct MetricsReporter {
    registry: SharedRegistry,
    recency: Recency<Key>,
    quantiles: Vec<Quantile>,
    // last `window` drained summaries per histogram
    windows: HashMap<String, VecDeque<Summary>>,
    window: usize,
}

impl MetricsReporter {
    fn render(&mut self) -> String {
        // BTreeMap keeps the report stable between flushes.
        let mut gauges = BTreeMap::new();
        for (key, gauge) in self.registry.get_gauge_handles() {
            if self
                .recency
                .should_store_gauge(&key, gauge.get_generation(), &self.registry)
            {
                let value = f64::from_bits(gauge.get_inner().load(Ordering::Acquire));
                gauges.insert(key.to_string(), value);
            }
        }
        let mut counters = BTreeMap::new();
        for (key, counter) in self.registry.get_counter_handles() {
            if self
                .recency
                .should_store_counter(&key, counter.get_generation(), &self.registry)
            {
                counters.insert(key.to_string(), counter.get_inner().load(Ordering::Acquire));
            }
        }
        let mut histograms = BTreeMap::new();
        for (key, histogram) in self.registry.get_histogram_handles() {
            if !self
                .recency
                .should_store_histogram(&key, histogram.get_generation(), &self.registry)
            {
                continue;
            }
            let mut drained = Summary::with_defaults();
            histogram
                .get_inner()
                .clear_with(|values| values.iter().for_each(|v| drained.add(*v)));

            let window = self.windows.entry(key.to_string()).or_default();
            if window.len() >= self.window {
                window.pop_front();
            }
            window.push_back(drained);

            let mut merged = Summary::with_defaults();
            for summary in window.iter() {
                if let Err(e) = merged.merge(summary) {
                    tracing::warn!("skip histogram {} summary merge:{:?}", key, e);
                }
            }
            histograms.insert(key.to_string(), merged);
        }

        let mut out = String::from("\n=================Metrics=====================\n");
        out.push_str("Gauges:\n");
        for (key, value) in &gauges {
            let _ = writeln!(out, "{}:{}", key, value);
        }
        out.push_str("\nCounters:\n");
        for (key, value) in &counters {
            let _ = writeln!(out, "{}:{}", key, value);
        }
        out.push_str("\nHistograms:\n");
        for (key, summary) in &histograms {
            for quantile in &self.quantiles {
                if let Some(v) = summary.quantile(quantile.value()) {
                    let _ = writeln!(
                        out,
                        "{}_{}:{:?}",
                        key,
                        quantile.label(),
                        Duration::from_secs_f64(v.max(0.0))
                    );
                }
            }
        }
        out
    }
}

/// Cheap handle used to dump the current metrics into the log on demand.
#[derive(Clone)]
pub struct MetricsHandle {
    reporter: Arc<Mutex<MetricsReporter>>,
}

impl MetricsHandle {
    pub fn render(&self) -> String {
        match self.reporter.lock() {
            Ok(mut reporter) => reporter.render(),
            Err(poisoned) => poisoned.into_inner().render(),
        }
    }

    pub fn flush(&self) {
        tracing::info!("{}", self.render());
    }
}

pub struct MetricsBuilder {
    quantiles: Vec<Quantile>,
    idle_timeout: Duration,
    flush_period: Duration,
    histogram_summary_window: usize,
}

impl Default for MetricsBuilder {
    fn default() -> Self {
        MetricsBuilder::new()
    }
}

impl MetricsBuilder {
    pub fn new() -> Self {
        Self {
            quantiles: parse_quantiles(&[0.0, 0.5, 0.9, 0.99, 1.0]),
            idle_timeout: Duration::from_secs(300),
            flush_period: Duration::from_secs(60),
            histogram_summary_window: 5,
        }
    }
    pub fn with_flush_period(mut self, period: Duration) -> Self {
        self.flush_period = period;
        self
    }
    pub fn with_histogram_summary_window(mut self, window: usize) -> Self {
        self.histogram_summary_window = window.max(1);
        self
    }
    pub fn with_quantiles(mut self, quantiles: &[f64]) -> Self {
        if quantiles.is_empty() {
            return self;
        }
        self.quantiles = parse_quantiles(quantiles);
        self
    }

    /// Builds a recorder and its reporting handle without installing anything
    /// globally.
    pub fn build(self) -> (MetricsLogRecorder, MetricsHandle) {
        let registry = Arc::new(Registry::new(GenerationalStorage::new(AtomicStorage)));
        let reporter = MetricsReporter {
            registry: registry.clone(),
            recency: Recency::new(
                quanta::Clock::new(),
                MetricKindMask::ALL,
                Some(self.idle_timeout),
            ),
            quantiles: self.quantiles,
            windows: HashMap::new(),
            window: self.histogram_summary_window,
        };
        (
            MetricsLogRecorder { registry },
            MetricsHandle {
                reporter: Arc::new(Mutex::new(reporter)),
            },
        )
    }

    /// Installs the global recorder and a periodic flush task. Must be called
    /// from inside a tokio runtime.
    pub fn install(self) -> anyhow::Result<MetricsHandle> {
        let flush_period = self.flush_period;
        let (recorder, handle) = self.build();
        metrics::set_global_recorder(recorder).map_err(|e| anyhow::anyhow!("{}", e))?;

        let periodic = handle.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_period);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                periodic.flush();
            }
        });
        Ok(handle)
    }
}

#[test]
fn test_render_counters_and_gauges() {
    let (recorder, handle) = MetricsBuilder::new().build();
    metrics::with_local_recorder(&recorder, || {
        metrics::counter!("absum.examples").increment(3);
        metrics::counter!("absum.examples").increment(2);
        metrics::gauge!("absum.workers").set(4.0);
    });
    let report = handle.render();
    assert!(report.contains("absum.examples:5"), "{}", report);
    assert!(report.contains("absum.workers:4"), "{}", report);
}

#[test]
fn test_histogram_window_is_drained() {
    let (recorder, handle) = MetricsBuilder::new()
        .with_quantiles(&[1.0])
        .with_histogram_summary_window(1)
        .build();
    metrics::with_local_recorder(&recorder, || {
        metrics::histogram!("absum.batch_secs").record(2.0);
    });
    let first = handle.render();
    assert!(first.contains("absum.batch_secs_max:"), "{}", first);

    // nothing recorded since, and the single-slot window only holds the
    // empty drain
    let second = handle.render();
    assert!(!second.contains("absum.batch_secs_max:"), "{}", second);
}
