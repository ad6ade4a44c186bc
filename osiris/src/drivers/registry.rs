use super::contract::Driver;
use super::csv::{CsvExtractor, CsvWriter};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriverRegistryError {
    #[error("no driver registered for component `{0}`")]
    Unknown(String),
}

type DriverFactory = Box<dyn Fn() -> Box<dyn Driver> + Send + Sync>;

/// Maps component names to driver constructors.
///
/// The registry hands out a fresh instance per lookup; instances are never
/// reused across steps.
#[derive(Default)]
pub struct DriverRegistry {
    factories: BTreeMap<String, DriverFactory>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, component: &str, factory: F)
    where
        F: Fn() -> Box<dyn Driver> + Send + Sync + 'static,
    {
        self.factories.insert(component.to_string(), Box::new(factory));
    }

    pub fn contains(&self, component: &str) -> bool {
        self.factories.contains_key(component)
    }

    /// Constructs a fresh driver for the component.
    pub fn create(&self, component: &str) -> Result<Box<dyn Driver>, DriverRegistryError> {
        self.factories
            .get(component)
            .map(|factory| factory())
            .ok_or_else(|| DriverRegistryError::Unknown(component.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

/// The reference drivers shipped with the engine. Connector-backed drivers
/// (e.g. `mysql.extractor`) are registered by the embedding application
/// with their client implementation.
pub fn default_driver_registry() -> DriverRegistry {
    let mut registry = DriverRegistry::new();
    registry.register("filesystem.csv_extractor", || Box::new(CsvExtractor));
    registry.register("filesystem.csv_writer", || Box::new(CsvWriter));
    registry
}
