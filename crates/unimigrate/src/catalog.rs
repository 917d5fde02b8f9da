//! Adapter catalog for explicit dependency injection.
//!
//! The [`AdapterCatalog`] maps adapter keys to factories. Unlike global
//! singletons, it is explicitly constructed at worker startup and injected
//! into the pipeline engine, enabling mock catalogs in tests and
//! deterministic initialization.
//!
//! A factory produces a fresh adapter instance per migration; adapter
//! instances are never shared across concurrent operations.

use std::collections::HashMap;

use crate::core::traits::{DestinationAdapter, SourceAdapter};
use crate::destinations::{ClickhouseDestination, MysqlDestination, PostgresDestination};
use crate::error::{AdapterError, Result};
use crate::sources::{
    DevopsSource, MysqlSource, PostgresSource, SqlServerSource, ZohoSource,
};

type SourceFactory = Box<dyn Fn() -> Box<dyn SourceAdapter> + Send + Sync>;
type DestinationFactory = Box<dyn Fn() -> Box<dyn DestinationAdapter> + Send + Sync>;

/// Registry of source and destination adapter factories.
#[derive(Default)]
pub struct AdapterCatalog {
    sources: HashMap<String, SourceFactory>,
    destinations: HashMap<String, DestinationFactory>,
}

impl AdapterCatalog {
    /// Create a new empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a catalog with the standard built-in adapters registered.
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();

        catalog.register_source("postgresql", || Box::new(PostgresSource::new()));
        catalog.register_source("mysql", || Box::new(MysqlSource::new()));
        catalog.register_source("sqlserver", || Box::new(SqlServerSource::new()));
        catalog.register_source("zoho", || Box::new(ZohoSource::new()));
        catalog.register_source("devops", || Box::new(DevopsSource::new()));

        catalog.register_destination("clickhouse", || Box::new(ClickhouseDestination::new()));
        catalog.register_destination("postgresql", || Box::new(PostgresDestination::new()));
        catalog.register_destination("mysql", || Box::new(MysqlDestination::new()));

        catalog
    }

    /// Register a source adapter factory under a key.
    pub fn register_source<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn SourceAdapter> + Send + Sync + 'static,
    {
        let key = key.into();
        tracing::debug!("Registered source adapter: {}", key);
        self.sources.insert(key, Box::new(factory));
    }

    /// Register a destination adapter factory under a key.
    pub fn register_destination<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn DestinationAdapter> + Send + Sync + 'static,
    {
        let key = key.into();
        tracing::debug!("Registered destination adapter: {}", key);
        self.destinations.insert(key, Box::new(factory));
    }

    /// Instantiate a fresh source adapter for one migration.
    pub fn create_source(&self, key: &str) -> Result<Box<dyn SourceAdapter>> {
        self.sources.get(key).map(|f| f()).ok_or_else(|| {
            AdapterError::UnsupportedCombination(format!(
                "Unsupported source type: '{}'. Available: {}",
                key,
                self.source_keys().join(", ")
            ))
        })
    }

    /// Instantiate a fresh destination adapter for one migration.
    pub fn create_destination(&self, key: &str) -> Result<Box<dyn DestinationAdapter>> {
        self.destinations.get(key).map(|f| f()).ok_or_else(|| {
            AdapterError::UnsupportedCombination(format!(
                "Unsupported destination type: '{}'. Available: {}",
                key,
                self.destination_keys().join(", ")
            ))
        })
    }

    /// Registered source keys, sorted for stable output.
    pub fn source_keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.sources.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Registered destination keys, sorted for stable output.
    pub fn destination_keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.destinations.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let catalog = AdapterCatalog::with_builtins();
        assert_eq!(
            catalog.source_keys(),
            vec!["devops", "mysql", "postgresql", "sqlserver", "zoho"]
        );
        assert_eq!(
            catalog.destination_keys(),
            vec!["clickhouse", "mysql", "postgresql"]
        );
    }

    #[test]
    fn test_factories_produce_fresh_instances() {
        let catalog = AdapterCatalog::with_builtins();
        let a = catalog.create_source("postgresql").unwrap();
        let b = catalog.create_source("postgresql").unwrap();
        // Two boxed instances, not one shared adapter.
        assert_ne!(
            &*a as *const dyn SourceAdapter as *const (),
            &*b as *const dyn SourceAdapter as *const ()
        );
    }

    #[test]
    fn test_unknown_key_lists_available() {
        let catalog = AdapterCatalog::with_builtins();
        let err = catalog.create_source("mongodb").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("mongodb"));
        assert!(msg.contains("postgresql"));
    }
}
