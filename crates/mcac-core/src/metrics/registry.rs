use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use super::Metric;

/// Observer of a [`MetricRegistry`].
pub trait MetricListener: Send + Sync {
    fn on_metric_added(&self, name: &str, metric: &Metric);

    fn on_metric_removed(&self, name: &str);
}

/// Named metrics published by producers.
///
/// Registering a name that already exists replaces the previous metric; listeners see
/// the replacement as a new addition.
#[derive(Default)]
pub struct MetricRegistry {
    metrics: RwLock<BTreeMap<String, Metric>>,
    listeners: RwLock<Vec<Arc<dyn MetricListener>>>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, metric: Metric) {
        let name = name.into();
        {
            let mut metrics = self.metrics.write().unwrap_or_else(|err| err.into_inner());
            metrics.insert(name.clone(), metric.clone());
        }
        for listener in self.listeners() {
            listener.on_metric_added(&name, &metric);
        }
    }

    /// Returns true if a metric was removed.
    pub fn remove(&self, name: &str) -> bool {
        let removed = {
            let mut metrics = self.metrics.write().unwrap_or_else(|err| err.into_inner());
            metrics.remove(name).is_some()
        };
        if removed {
            for listener in self.listeners() {
                listener.on_metric_removed(name);
            }
        }
        removed
    }

    /// Attaches a listener and replays every metric already registered.
    pub fn add_listener(&self, listener: Arc<dyn MetricListener>) {
        let existing: Vec<(String, Metric)> = {
            let metrics = self.metrics.read().unwrap_or_else(|err| err.into_inner());
            metrics
                .iter()
                .map(|(name, metric)| (name.clone(), metric.clone()))
                .collect()
        };
        self.listeners
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .push(listener.clone());
        for (name, metric) in existing {
            listener.on_metric_added(&name, &metric);
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.metrics
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.metrics
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn listeners(&self) -> Vec<Arc<dyn MetricListener>> {
        self.listeners
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::metrics::AtomicCounter;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl MetricListener for Recorder {
        fn on_metric_added(&self, name: &str, metric: &Metric) {
            self.events
                .lock()
                .unwrap()
                .push(format!("+{name}:{}", metric.kind()));
        }

        fn on_metric_removed(&self, name: &str) {
            self.events.lock().unwrap().push(format!("-{name}"));
        }
    }

    #[test]
    fn listeners_see_existing_and_new_metrics() {
        let registry = MetricRegistry::new();
        registry.register("a", Metric::Counter(Arc::new(AtomicCounter::new())));

        let recorder = Arc::new(Recorder::default());
        registry.add_listener(recorder.clone());
        registry.register("b", Metric::Counter(Arc::new(AtomicCounter::new())));
        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));

        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec!["+a:counter", "+b:counter", "-a"]
        );
        assert_eq!(registry.names(), vec!["b".to_string()]);
    }
}
