use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::models::Consumer;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("consumer '{0}' has an empty consumer key")]
    EmptyKey(String),

    #[error("consumer key '{0}' is configured more than once")]
    DuplicateKey(String),
}

/// Read-only set of configured LMS consumers, keyed by consumer key.
#[derive(Debug, Default)]
pub struct ConsumerRegistry {
    consumers: HashMap<String, Arc<Consumer>>,
}

impl ConsumerRegistry {
    pub fn from_consumers(
        consumers: impl IntoIterator<Item = Consumer>,
    ) -> Result<Self, RegistryError> {
        let mut map = HashMap::new();
        for consumer in consumers {
            if consumer.consumer_key.trim().is_empty() {
                return Err(RegistryError::EmptyKey(consumer.name));
            }
            let key = consumer.consumer_key.clone();
            if map.insert(key.clone(), Arc::new(consumer)).is_some() {
                return Err(RegistryError::DuplicateKey(key));
            }
        }
        Ok(Self { consumers: map })
    }

    /// None means "reject the launch", not a fault.
    pub fn find_by_consumer_key(&self, key: &str) -> Option<Arc<Consumer>> {
        self.consumers.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let registry = ConsumerRegistry::from_consumers(vec![
            Consumer::new("Moodle", "lms1", "s3cr3t"),
            Consumer::new("Canvas", "lms2", "other"),
        ])
        .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.find_by_consumer_key("lms2").unwrap().name,
            "Canvas"
        );
        assert!(registry.find_by_consumer_key("nope").is_none());
    }

    #[test]
    fn test_rejects_duplicate_and_empty_keys() {
        let err = ConsumerRegistry::from_consumers(vec![
            Consumer::new("A", "lms1", "x"),
            Consumer::new("B", "lms1", "y"),
        ])
        .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateKey("lms1".to_string()));

        let err = ConsumerRegistry::from_consumers(vec![Consumer::new("A", " ", "x")]).unwrap_err();
        assert_eq!(err, RegistryError::EmptyKey("A".to_string()));
    }
}
