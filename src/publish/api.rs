//! The sink interface: capability trait, per-sink configuration, helper
//! context, and the factory registry that replaces shared-library
//! loading.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, error, info, trace, warn};

use crate::config::PluginConfig;
use crate::error::{StreamError, StreamResult};
use crate::record::CdcEvent;

/// Compile-time sink ABI version; a sink reporting anything else is
/// refused at load.
pub const PUBLISHER_API_VERSION: u32 = 1;

/// Deep copy of one sink's configuration.
#[derive(Debug, Clone, Default)]
pub struct PublisherConfig {
    pub name: String,
    pub active: bool,
    pub max_queue_depth: usize,
    /// Schemas this sink wants; empty means all.
    pub schema_filter: Vec<String>,
    pub options: BTreeMap<String, String>,
}

impl PublisherConfig {
    pub fn from_plugin(plugin: &PluginConfig) -> PublisherConfig {
        let mut schema_filter = plugin.publish_databases.clone();
        schema_filter.extend(plugin.publish_schemas.iter().cloned());
        let options = plugin
            .config
            .iter()
            .map(|(k, v)| {
                let text = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), text)
            })
            .collect();
        PublisherConfig {
            name: plugin.name.clone(),
            active: plugin.active,
            max_queue_depth: plugin.max_queue_depth,
            schema_filter,
            options,
        }
    }
}

/// Helper services handed to every sink at `init`.
#[derive(Debug, Clone, Default)]
pub struct PublisherContext {
    sink_name: String,
}

impl PublisherContext {
    pub fn for_sink(sink_name: &str) -> PublisherContext {
        PublisherContext {
            sink_name: sink_name.to_string(),
        }
    }

    pub fn log_trace(&self, message: &str) {
        trace!("[{}] {}", self.sink_name, message);
    }

    pub fn log_debug(&self, message: &str) {
        debug!("[{}] {}", self.sink_name, message);
    }

    pub fn log_info(&self, message: &str) {
        info!("[{}] {}", self.sink_name, message);
    }

    pub fn log_warn(&self, message: &str) {
        warn!("[{}] {}", self.sink_name, message);
    }

    pub fn log_error(&self, message: &str) {
        error!("[{}] {}", self.sink_name, message);
    }

    pub fn get<'a>(&self, config: &'a PublisherConfig, key: &str) -> Option<&'a str> {
        config.options.get(key).map(|s| s.as_str())
    }

    pub fn get_int(&self, config: &PublisherConfig, key: &str, default: i64) -> i64 {
        match self.get(config, key) {
            Some(value) => value.trim().parse().unwrap_or(default),
            None => default,
        }
    }

    /// Truthy: `1/true/yes/on`; falsy: `0/false/no/off`. Case-insensitive,
    /// whitespace-trimmed; anything else falls back to the default.
    pub fn get_bool(&self, config: &PublisherConfig, key: &str, default: bool) -> bool {
        let Some(value) = self.get(config, key) else {
            return default;
        };
        let value = value.trim();
        if value.is_empty() {
            return default;
        }
        if value == "1"
            || value.eq_ignore_ascii_case("true")
            || value.eq_ignore_ascii_case("yes")
            || value.eq_ignore_ascii_case("on")
        {
            return true;
        }
        if value == "0"
            || value.eq_ignore_ascii_case("false")
            || value.eq_ignore_ascii_case("no")
            || value.eq_ignore_ascii_case("off")
        {
            return false;
        }
        default
    }
}

/// Sink capability set. `publish` is the only mandatory data path;
/// batch, health and the lifecycle hooks have usable defaults.
pub trait Publisher: Send {
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "0.1.0"
    }

    fn api_version(&self) -> u32 {
        PUBLISHER_API_VERSION
    }

    fn init(&mut self, ctx: &PublisherContext, config: &PublisherConfig) -> StreamResult<()>;

    fn start(&mut self) -> StreamResult<()> {
        Ok(())
    }

    fn publish(&mut self, event: &CdcEvent) -> StreamResult<()>;

    fn publish_batch(&mut self, events: &[CdcEvent]) -> StreamResult<()> {
        for event in events {
            self.publish(event)?;
        }
        Ok(())
    }

    fn stop(&mut self) -> StreamResult<()> {
        Ok(())
    }

    fn cleanup(&mut self) {}

    fn health_check(&self) -> bool {
        true
    }
}

pub type PublisherFactory = fn() -> Box<dyn Publisher>;

/// Statically registered sink constructors, looked up by the config's
/// `plugin.name`.
#[derive(Default)]
pub struct PublisherRegistry {
    factories: HashMap<String, PublisherFactory>,
}

impl PublisherRegistry {
    pub fn new() -> PublisherRegistry {
        PublisherRegistry::default()
    }

    pub fn with_builtin_sinks() -> PublisherRegistry {
        let mut registry = PublisherRegistry::new();
        registry.register("file", || Box::new(crate::publish::file_sink::FilePublisher::new()));
        registry.register("stdout", || {
            Box::new(crate::publish::stdout_sink::StdoutPublisher::new())
        });
        registry
    }

    pub fn register(&mut self, name: &str, factory: PublisherFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn create(&self, name: &str) -> StreamResult<Box<dyn Publisher>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            StreamError::Publisher(format!("no registered sink named `{}`", name))
        })?;
        Ok(factory())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(key: &str, value: &str) -> PublisherConfig {
        let mut config = PublisherConfig::default();
        config.options.insert(key.to_string(), value.to_string());
        config
    }

    #[test]
    fn test_get_bool_truthy_falsy() {
        let ctx = PublisherContext::for_sink("t");
        for v in ["1", "true", "YES", " on ", "True"] {
            assert!(ctx.get_bool(&config_with("k", v), "k", false), "{}", v);
        }
        for v in ["0", "false", "No", " OFF "] {
            assert!(!ctx.get_bool(&config_with("k", v), "k", true), "{}", v);
        }
        // unknown and missing fall back
        assert!(ctx.get_bool(&config_with("k", "maybe"), "k", true));
        assert!(!ctx.get_bool(&config_with("k", "maybe"), "k", false));
        assert!(ctx.get_bool(&PublisherConfig::default(), "k", true));
    }

    #[test]
    fn test_get_int() {
        let ctx = PublisherContext::for_sink("t");
        assert_eq!(ctx.get_int(&config_with("n", "42"), "n", 7), 42);
        assert_eq!(ctx.get_int(&config_with("n", "junk"), "n", 7), 7);
        assert_eq!(ctx.get_int(&PublisherConfig::default(), "n", 7), 7);
    }

    #[test]
    fn test_config_from_plugin_stringifies_values() {
        let plugin: PluginConfig = serde_json::from_str(
            r#"{"name": "file", "active": true, "max_queue_depth": 8,
                "publish_databases": ["shop"],
                "config": {"path": "/tmp/x", "flush": true, "count": 3}}"#,
        )
        .unwrap();
        let config = PublisherConfig::from_plugin(&plugin);
        assert_eq!(config.schema_filter, vec!["shop"]);
        assert_eq!(config.options.get("path").unwrap(), "/tmp/x");
        assert_eq!(config.options.get("flush").unwrap(), "true");
        assert_eq!(config.options.get("count").unwrap(), "3");
    }

    #[test]
    fn test_registry_unknown_sink() {
        let registry = PublisherRegistry::with_builtin_sinks();
        assert!(registry.create("file").is_ok());
        assert!(registry.create("kafka").is_err());
    }
}
