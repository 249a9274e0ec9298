//! Explicit name → factory registries.
//!
//! Codecs and merge policies are looked up by name when a commit is loaded
//! or a configuration names them. Registries are populated at construction;
//! nothing is discovered implicitly.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Result, SluiceError};

type Factory<T> = Arc<dyn Fn() -> Arc<T> + Send + Sync>;

/// A map from names to factories producing shared `T` instances.
pub struct Registry<T: ?Sized> {
    kind: &'static str,
    factories: BTreeMap<String, Factory<T>>,
}

impl<T: ?Sized> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Registry {
            kind: self.kind,
            factories: self.factories.clone(),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &self.kind)
            .field("names", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<T: ?Sized> Registry<T> {
    /// Create an empty registry; `kind` is used in error messages.
    pub fn new(kind: &'static str) -> Self {
        Registry {
            kind,
            factories: BTreeMap::new(),
        }
    }

    /// Register a factory. Registering a name twice is an error.
    pub fn register<F>(&mut self, name: &str, factory: F) -> Result<()>
    where
        F: Fn() -> Arc<T> + Send + Sync + 'static,
    {
        if self.factories.contains_key(name) {
            return Err(SluiceError::invalid_argument(format!(
                "{} '{name}' is already registered",
                self.kind
            )));
        }
        self.factories.insert(name.to_string(), Arc::new(factory));
        Ok(())
    }

    /// Builder-style [`register`](Self::register) for static tables.
    pub fn with<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn() -> Arc<T> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
        self
    }

    /// Instantiate the entry registered under `name`.
    pub fn lookup(&self, name: &str) -> Result<Arc<T>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| {
                SluiceError::invalid_argument(format!(
                    "unknown {} '{name}' (known: {})",
                    self.kind,
                    self.names().join(", ")
                ))
            })
    }

    /// Check if a name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct Hello;

    impl Greeter for Hello {
        fn greet(&self) -> String {
            "hello".to_string()
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry: Registry<dyn Greeter> = Registry::new("greeter");
        registry.register("hello", || Arc::new(Hello)).unwrap();

        assert!(registry.contains("hello"));
        assert_eq!(registry.lookup("hello").unwrap().greet(), "hello");
        assert!(registry.register("hello", || Arc::new(Hello)).is_err());
    }

    #[test]
    fn test_unknown_name_lists_known_names() {
        let registry: Registry<dyn Greeter> =
            Registry::<dyn Greeter>::new("greeter").with("hello", || Arc::new(Hello));
        let err = registry.lookup("bonjour").err().unwrap();
        assert!(err.to_string().contains("unknown greeter 'bonjour'"));
        assert!(err.to_string().contains("hello"));
    }
}
