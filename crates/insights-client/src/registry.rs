//! Routing tables of the metrics known to the client.
//!
//! Every metric lives in exactly one of three maps, keyed by its raw name. The sampler
//! reads the unrestricted and restricted maps; denied metrics are kept only so a rule
//! change can bring them back.

use std::sync::Mutex;

use dashmap::DashMap;
use mcac_core::filtering::{Channel, FilteringRule};

use crate::{
    encoder::Emitter,
    routing::route,
    wire::EmitKind,
};

/// An emitter together with the cleaned name it reports under.
#[derive(Clone)]
pub struct RegisteredMetric {
    pub name: String,
    pub emit: Emitter,
}

impl std::fmt::Debug for RegisteredMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredMetric")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A removed metric waiting for its final write.
pub struct Retired {
    pub metric: RegisteredMetric,
    pub kind: EmitKind,
}

#[derive(Default)]
pub struct ChannelRegistry {
    unrestricted: DashMap<String, RegisteredMetric>,
    restricted: DashMap<String, RegisteredMetric>,
    denied: DashMap<String, RegisteredMetric>,
    retired: Mutex<Vec<Retired>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, channel: Channel) -> &DashMap<String, RegisteredMetric> {
        match channel {
            Channel::Unrestricted => &self.unrestricted,
            Channel::Restricted => &self.restricted,
            Channel::Denied => &self.denied,
        }
    }

    /// Not atomic across the maps: a sampling cycle running concurrently may miss the
    /// metric once.
    fn place(&self, raw_name: &str, metric: RegisteredMetric, channel: Channel) {
        for other in [Channel::Unrestricted, Channel::Restricted, Channel::Denied] {
            if other != channel {
                self.map(other).remove(raw_name);
            }
        }
        self.map(channel).insert(raw_name.to_string(), metric);
    }

    /// Routes `raw_name` with `rules` and stores it, replacing any previous entry.
    pub fn register(&self, raw_name: &str, metric: RegisteredMetric, rules: &[FilteringRule]) -> Channel {
        let channel = route(raw_name, rules);
        self.place(raw_name, metric, channel);
        channel
    }

    /// Drops `raw_name` from routing. A metric that was reported gets one final write on
    /// the next sampling cycle. Removing an unknown name does nothing.
    pub fn remove(&self, raw_name: &str) {
        let retired = if let Some((_, metric)) = self.unrestricted.remove(raw_name) {
            Some(Retired {
                metric,
                kind: EmitKind::Final {
                    insight_filtered: false,
                },
            })
        } else if let Some((_, metric)) = self.restricted.remove(raw_name) {
            Some(Retired {
                metric,
                kind: EmitKind::Final {
                    insight_filtered: true,
                },
            })
        } else {
            self.denied.remove(raw_name);
            None
        };

        if let Some(retired) = retired {
            self.retired
                .lock()
                .unwrap_or_else(|err| err.into_inner())
                .push(retired);
        }
    }

    /// Re-routes every known metric with new rules.
    pub fn refresh(&self, rules: &[FilteringRule]) {
        for channel in [Channel::Unrestricted, Channel::Restricted, Channel::Denied] {
            // collect first: moving entries while iterating a DashMap deadlocks
            let names: Vec<String> = self.map(channel).iter().map(|entry| entry.key().clone()).collect();
            for name in names {
                let target = route(&name, rules);
                if target == channel {
                    continue;
                }
                if let Some((name, metric)) = self.map(channel).remove(&name) {
                    log::debug!("Moving {name} from {channel:?} to {target:?}");
                    self.map(target).insert(name, metric);
                }
            }
        }
    }

    pub fn take_retired(&self) -> Vec<Retired> {
        std::mem::take(&mut *self.retired.lock().unwrap_or_else(|err| err.into_inner()))
    }

    /// Snapshot of the metrics of one channel.
    pub fn metrics(&self, channel: Channel) -> Vec<RegisteredMetric> {
        self.map(channel)
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn channel_of(&self, raw_name: &str) -> Option<Channel> {
        [Channel::Unrestricted, Channel::Restricted, Channel::Denied]
            .into_iter()
            .find(|channel| self.map(*channel).contains_key(raw_name))
    }

    pub fn len(&self, channel: Channel) -> usize {
        self.map(channel).len()
    }

    pub fn is_empty(&self) -> bool {
        self.unrestricted.is_empty() && self.restricted.is_empty() && self.denied.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mcac_core::filtering::{Policy, Scope};

    use super::*;
    use crate::{encoder::EncoderContext, wire::CommandSink};

    fn metric(name: &str) -> RegisteredMetric {
        RegisteredMetric {
            name: name.to_string(),
            emit: Arc::new(|_: &mut dyn CommandSink, _: &EncoderContext, _: EmitKind| 1),
        }
    }

    fn rules() -> Vec<FilteringRule> {
        vec![
            FilteringRule::new(Policy::Deny, "Table", Scope::Global).unwrap(),
            FilteringRule::new(Policy::Allow, "Latency", Scope::Restricted).unwrap(),
            FilteringRule::new(Policy::Allow, "Compaction", Scope::Global).unwrap(),
        ]
    }

    #[test]
    fn each_metric_lives_in_one_map() {
        let registry = ChannelRegistry::new();
        let rules = rules();

        assert_eq!(registry.register("Table.Reads", metric("t"), &rules), Channel::Denied);
        assert_eq!(registry.register("Read.Latency", metric("l"), &rules), Channel::Restricted);
        assert_eq!(registry.register("Compaction.Pending", metric("c"), &rules), Channel::Unrestricted);

        assert_eq!(registry.register("Table.Reads", metric("t"), &[]), Channel::Unrestricted);
        assert_eq!(registry.len(Channel::Denied), 0);
        assert_eq!(registry.len(Channel::Unrestricted), 2);
        assert_eq!(registry.channel_of("Table.Reads"), Some(Channel::Unrestricted));
    }

    #[test]
    fn removal_schedules_final_write() {
        let registry = ChannelRegistry::new();
        let rules = rules();
        registry.register("Table.Reads", metric("t"), &rules);
        registry.register("Read.Latency", metric("l"), &rules);
        registry.register("Compaction.Pending", metric("c"), &rules);

        registry.remove("Table.Reads");
        registry.remove("Read.Latency");
        registry.remove("Compaction.Pending");
        registry.remove("Compaction.Pending");
        registry.remove("never.registered");

        let retired = registry.take_retired();
        let kinds: Vec<_> = retired.iter().map(|r| (r.metric.name.as_str(), r.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                ("l", EmitKind::Final { insight_filtered: true }),
                ("c", EmitKind::Final { insight_filtered: false }),
            ]
        );
        assert!(registry.is_empty());
        assert!(registry.take_retired().is_empty());
    }

    #[test]
    fn refresh_moves_between_maps() {
        let registry = ChannelRegistry::new();
        registry.register("Table.Reads", metric("t"), &[]);
        registry.register("Read.Latency", metric("l"), &[]);
        assert_eq!(registry.len(Channel::Unrestricted), 2);

        registry.refresh(&rules());
        assert_eq!(registry.channel_of("Table.Reads"), Some(Channel::Denied));
        assert_eq!(registry.channel_of("Read.Latency"), Some(Channel::Restricted));

        registry.refresh(&[]);
        assert_eq!(registry.len(Channel::Unrestricted), 2);
        assert_eq!(registry.metrics(Channel::Restricted).len(), 0);
    }
}
