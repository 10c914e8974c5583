//! Source connector registry for dispatching retrieval by method name.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};

use linkage_core::{Error, RawLinks, Result, SourceConnector};

/// Registry mapping connector method names to their implementations.
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn SourceConnector>>,
}

impl ConnectorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            connectors: HashMap::new(),
        }
    }

    /// Register a connector. Replaces any existing connector for the same method.
    pub fn register(&mut self, connector: Arc<dyn SourceConnector>) {
        self.connectors
            .insert(connector.method().to_string(), connector);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, connector: Arc<dyn SourceConnector>) -> Self {
        self.register(connector);
        self
    }

    /// Fetch links with the connector registered for `method`.
    ///
    /// An unknown method fails like a raising connector.
    pub async fn fetch(&self, method: &str, params: &Map<String, JsonValue>) -> Result<RawLinks> {
        let connector = self
            .connectors
            .get(method)
            .ok_or_else(|| Error::source(method, "no connector registered for this method"))?;
        connector.fetch(params).await
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.connectors.keys().cloned().collect();
        methods.sort();
        methods
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.connectors.contains_key(method)
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
