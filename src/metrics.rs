use once_cell::sync::Lazy;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::{counter::Counter, family::Family, gauge::Gauge};
use prometheus_client::registry::Registry;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue, EnumIter, Display)]
pub enum CoroutineEvent {
    Spawned,
    Finished,
    Cancelled,
    Failed,
    Leaked,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue, EnumIter, Display)]
pub enum StackEvent {
    Mapped,
    Reused,
    Recycled,
    Unmapped,
    Leaked,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CoroutineLabels {
    pub event: CoroutineEvent,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StackLabels {
    pub event: StackEvent,
}

pub struct Metrics {
    pub coroutines: Family<CoroutineLabels, Counter>,
    pub live_coroutines: Gauge,
    pub stacks: Family<StackLabels, Counter>,
}

impl Metrics {
    fn new() -> Self {
        let coroutines = Family::<CoroutineLabels, Counter>::default();
        for event in CoroutineEvent::iter() {
            coroutines.get_or_create(&CoroutineLabels { event });
        }
        let stacks = Family::<StackLabels, Counter>::default();
        for event in StackEvent::iter() {
            stacks.get_or_create(&StackLabels { event });
        }

        Metrics {
            coroutines,
            live_coroutines: Gauge::default(),
            stacks,
        }
    }

    pub(crate) fn coroutine(&self, event: CoroutineEvent) {
        self.coroutines.get_or_create(&CoroutineLabels { event }).inc();
        match event {
            CoroutineEvent::Spawned => {
                self.live_coroutines.inc();
            }
            CoroutineEvent::Finished | CoroutineEvent::Cancelled | CoroutineEvent::Leaked => {
                self.live_coroutines.dec();
            }
            // a failed coroutine also reports Finished
            CoroutineEvent::Failed => (),
        }
    }

    pub(crate) fn stack(&self, event: StackEvent) {
        self.stacks.get_or_create(&StackLabels { event }).inc();
    }

    pub fn coroutine_count(&self, event: CoroutineEvent) -> u64 {
        self.coroutines.get_or_create(&CoroutineLabels { event }).get()
    }

    pub fn stack_count(&self, event: StackEvent) -> u64 {
        self.stacks.get_or_create(&StackLabels { event }).get()
    }
}

static METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

/// Process-wide lifecycle counters.
pub fn metrics() -> &'static Metrics {
    &METRICS
}

pub fn register(registry: &mut Registry) {
    let metrics = metrics();
    registry.register(
        "stackgen_coroutines",
        "coroutine lifecycle events",
        metrics.coroutines.clone(),
    );
    registry.register(
        "stackgen_coroutines_live",
        "coroutines spawned and not yet finished",
        metrics.live_coroutines.clone(),
    );
    registry.register(
        "stackgen_stacks",
        "stack region lifecycle events",
        metrics.stacks.clone(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn register_test() {
        let mut registry = Registry::default();
        register(&mut registry);
        metrics().stack(StackEvent::Mapped);

        let mut text = String::new();
        encode(&mut text, &registry).unwrap();
        assert!(text.contains("stackgen_coroutines_total{event=\"Spawned\"}"));
        assert!(text.contains("stackgen_coroutines_live"));
        assert!(text.contains("stackgen_stacks_total{event=\"Mapped\"}"));
        assert!(metrics().stack_count(StackEvent::Mapped) >= 1);
    }
}
