//! Owns every publisher instance and routes records to them.

use tracing::{debug, info, warn};

use crate::config::PublisherEntry;
use crate::error::{StreamError, StreamResult};
use crate::publish::api::{PublisherConfig, PublisherRegistry, PUBLISHER_API_VERSION};
use crate::publish::instance::PublisherInstance;
use crate::record::CdcEvent;

#[derive(Default)]
pub struct PublisherManager {
    /// Registration order is delivery-routing order.
    instances: Vec<PublisherInstance>,
}

impl PublisherManager {
    pub fn new() -> PublisherManager {
        PublisherManager::default()
    }

    pub fn instances(&self) -> &[PublisherInstance] {
        &self.instances
    }

    /// Instantiate every active sink named in the config. Inactive sinks
    /// are skipped at load; a broken sink definition fails startup.
    pub fn load(
        &mut self,
        registry: &PublisherRegistry,
        entries: &[PublisherEntry],
    ) -> StreamResult<()> {
        for entry in entries {
            let plugin = &entry.plugin;
            if !plugin.active {
                info!("loading publisher {} skipped (inactive)", plugin.name);
                continue;
            }
            if let Some(path) = &plugin.library_path {
                debug!(
                    "publisher {}: library_path {} ignored, using the static registry",
                    plugin.name, path
                );
            }
            let publisher = registry.create(&plugin.name)?;
            if publisher.api_version() != PUBLISHER_API_VERSION {
                return Err(StreamError::Publisher(format!(
                    "sink {} API version mismatch: expected {}, got {}",
                    plugin.name,
                    PUBLISHER_API_VERSION,
                    publisher.api_version()
                )));
            }
            info!(
                "loaded sink {} v{} (api {})",
                publisher.name(),
                publisher.version(),
                publisher.api_version()
            );
            let config = PublisherConfig::from_plugin(plugin);
            let mut instance = PublisherInstance::new(publisher, config);
            instance.init()?;
            info!(
                "publisher {} loaded (queue depth {}, schema filter {:?})",
                instance.name,
                instance.queue_capacity(),
                instance.schema_filter()
            );
            self.instances.push(instance);
        }
        Ok(())
    }

    /// Start every instance before the decoder begins.
    pub fn start_all(&mut self) -> StreamResult<()> {
        for instance in &mut self.instances {
            instance.start()?;
            info!("publisher {} started", instance.name);
        }
        Ok(())
    }

    /// Route one record to every eligible sink, in registration order.
    pub fn publish_event(&self, event: &CdcEvent) {
        for instance in &self.instances {
            if !instance.active {
                continue;
            }
            let filter = instance.schema_filter();
            if !filter.is_empty() && !filter.iter().any(|s| s == &event.db) {
                continue;
            }
            instance.enqueue(event);
        }
    }

    /// Stop workers (draining queues) and run sink teardown, in
    /// registration order.
    pub fn shutdown(&mut self) {
        for instance in &mut self.instances {
            instance.stop();
            instance.cleanup();
        }
    }

    pub fn log_health(&self) {
        for instance in &self.instances {
            if !instance.health_check() {
                warn!("publisher {} reports unhealthy", instance.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::api::{Publisher, PublisherContext};
    use crate::publish::instance::test_support::event;
    use crate::record::CdcEvent;
    use std::sync::mpsc::{channel, Sender};
    use std::time::Duration;

    struct NamedProbe {
        name: String,
        sender: Sender<(String, u64)>,
    }

    impl Publisher for NamedProbe {
        fn name(&self) -> &str {
            &self.name
        }

        fn init(
            &mut self,
            _ctx: &PublisherContext,
            _config: &crate::publish::api::PublisherConfig,
        ) -> crate::error::StreamResult<()> {
            Ok(())
        }

        fn publish(&mut self, event: &CdcEvent) -> crate::error::StreamResult<()> {
            self.sender.send((self.name.clone(), event.position)).ok();
            Ok(())
        }
    }

    fn manager_with(entries_json: &str, sender: Sender<(String, u64)>) -> PublisherManager {
        let entries: Vec<PublisherEntry> = serde_json::from_str(entries_json).unwrap();
        let mut registry = PublisherRegistry::new();
        // factories capture nothing, so route through thread-locals
        thread_local! {
            static SENDER: std::cell::RefCell<Option<Sender<(String, u64)>>> =
                const { std::cell::RefCell::new(None) };
        }
        SENDER.with(|s| *s.borrow_mut() = Some(sender));
        fn make_a() -> Box<dyn Publisher> {
            make_named("a")
        }
        fn make_b() -> Box<dyn Publisher> {
            make_named("b")
        }
        fn make_named(name: &str) -> Box<dyn Publisher> {
            SENDER.with(|s| {
                Box::new(NamedProbe {
                    name: name.to_string(),
                    sender: s.borrow().clone().unwrap(),
                })
            })
        }
        registry.register("a", make_a);
        registry.register("b", make_b);
        let mut manager = PublisherManager::new();
        manager.load(&registry, &entries).unwrap();
        manager
    }

    #[test]
    fn test_schema_filter_routing() {
        let (tx, rx) = channel();
        let mut manager = manager_with(
            r#"[
                {"plugin": {"name": "a", "active": true, "publish_databases": ["shop"]}},
                {"plugin": {"name": "b", "active": true}}
            ]"#,
            tx,
        );
        manager.start_all().unwrap();
        manager.publish_event(&event("shop", 1));
        manager.publish_event(&event("crm", 2));
        let mut got = Vec::new();
        while let Ok(item) = rx.recv_timeout(Duration::from_millis(500)) {
            got.push(item);
        }
        got.sort();
        // sink a only sees shop; sink b sees everything
        assert_eq!(
            got,
            vec![
                ("a".to_string(), 1),
                ("b".to_string(), 1),
                ("b".to_string(), 2)
            ]
        );
        manager.shutdown();
    }

    #[test]
    fn test_inactive_sink_skipped_at_load() {
        let (tx, _rx) = channel();
        let manager = manager_with(
            r#"[{"plugin": {"name": "a", "active": false}}]"#,
            tx,
        );
        assert!(manager.instances().is_empty());
    }

    #[test]
    fn test_unknown_sink_fails_load() {
        let entries: Vec<PublisherEntry> =
            serde_json::from_str(r#"[{"plugin": {"name": "nope", "active": true}}]"#).unwrap();
        let registry = PublisherRegistry::new();
        let mut manager = PublisherManager::new();
        assert!(manager.load(&registry, &entries).is_err());
    }
}
