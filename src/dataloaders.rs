//! DataLoader utilities for batch loading
///
/// Implements the DataLoader pattern for preventing N+1 query problems.
/// See: https://github.com/graphql/dataloader
///
/// `load` never fetches. It records the key and hands back a [`LazyValue`].
/// The first `get` for a key that is not cached fetches every pending key in
/// one call to the [`BatchLoader`].

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::hash::Hash;
use std::rc::Rc;

use indexmap::IndexSet;
use serde::Deserialize;

use crate::{GraphQLError, Result};

/// Batch loader trait for loading multiple items at once
///
/// Receives the pending keys de-duplicated in registration order and must
/// return one value per key, positionally. Keys without a match map to a
/// "missing" value chosen by the implementation (usually `Value::Null`).
pub trait BatchLoader<K, V> {
    fn load_batch(&self, keys: &[K]) -> Result<Vec<V>>;
}

impl<K, V, F> BatchLoader<K, V> for F
where
    F: Fn(&[K]) -> Result<Vec<V>>,
{
    fn load_batch(&self, keys: &[K]) -> Result<Vec<V>> {
        self(keys)
    }
}

/// When memoized values are dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Forget cached values after every drain round, so reads that follow a
    /// write in the same request see fresh data.
    #[default]
    PerRound,
    /// Keep cached values until the request ends.
    PerRequest,
}

struct LoaderState<K, V> {
    pending: IndexSet<K>,
    cache: HashMap<K, V>,
    failed: HashMap<K, GraphQLError>,
    dispatches: usize,
}

/// DataLoader with caching and batching
///
/// Cloning is cheap and clones share pending keys and cache. A loader is
/// request-scoped: create it per request (usually through
/// [`LoaderRegistry`]) and never keep it across requests.
pub struct DataLoader<K, V> {
    name: Rc<str>,
    loader: Rc<dyn BatchLoader<K, V>>,
    state: Rc<RefCell<LoaderState<K, V>>>,
    policy: CachePolicy,
}

impl<K, V> Clone for DataLoader<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            loader: self.loader.clone(),
            state: self.state.clone(),
            policy: self.policy,
        }
    }
}

impl<K, V> DataLoader<K, V>
where
    K: Eq + Hash + Clone + 'static,
    V: Clone + 'static,
{
    /// Create new DataLoader with a batch loader
    pub fn new(loader: impl BatchLoader<K, V> + 'static) -> Self {
        Self {
            name: Rc::from("anonymous"),
            loader: Rc::new(loader),
            state: Rc::new(RefCell::new(LoaderState {
                pending: IndexSet::new(),
                cache: HashMap::new(),
                failed: HashMap::new(),
                dispatches: 0,
            })),
            policy: CachePolicy::default(),
        }
    }

    /// Create a DataLoader from a batch function.
    pub fn from_fn<F>(batch_fn: F) -> Self
    where
        F: Fn(&[K]) -> Result<Vec<V>> + 'static,
    {
        Self::new(batch_fn)
    }

    /// Label used in log events.
    pub fn named(mut self, name: impl AsRef<str>) -> Self {
        self.name = Rc::from(name.as_ref());
        self
    }

    pub fn with_policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    /// Register `key` for the next batch and return a placeholder for it.
    pub fn load(&self, key: K) -> LazyValue<K, V> {
        {
            let mut state = self.state.borrow_mut();
            if !state.cache.contains_key(&key) && !state.failed.contains_key(&key) {
                state.pending.insert(key.clone());
            }
        }
        LazyValue {
            key,
            loader: self.clone(),
        }
    }

    /// Resolve `key`, fetching every pending key in one batch on a cache miss.
    pub fn get(&self, key: &K) -> Result<V> {
        {
            let mut state = self.state.borrow_mut();
            if let Some(value) = state.cache.get(key) {
                return Ok(value.clone());
            }
            if let Some(error) = state.failed.get(key) {
                return Err(error.clone());
            }
            if !state.pending.contains(key) {
                state.pending.insert(key.clone());
            }
        }

        self.dispatch()?;

        let value = self.state.borrow().cache.get(key).cloned();
        value.ok_or_else(|| {
            GraphQLError::BatchLoad(format!("loader `{}` produced no value for a key", self.name))
        })
    }

    /// Load multiple items by keys
    ///
    /// All keys go into the same batch.
    pub fn load_many(&self, keys: impl IntoIterator<Item = K>) -> Result<Vec<V>> {
        let lazies: Vec<_> = keys.into_iter().map(|key| self.load(key)).collect();
        lazies.iter().map(LazyValue::get).collect()
    }

    /// Fetch every pending key now. A no-op when nothing is pending.
    pub fn dispatch(&self) -> Result<()> {
        let keys: Vec<K> = {
            let mut state = self.state.borrow_mut();
            state.pending.drain(..).collect()
        };
        if keys.is_empty() {
            return Ok(());
        }

        tracing::debug!(loader = %self.name, keys = keys.len(), "dispatching batch load");
        // No borrow is held here: the batch function may use other loaders.
        let outcome = self.loader.load_batch(&keys).and_then(|values| {
            if values.len() == keys.len() {
                Ok(values)
            } else {
                Err(GraphQLError::BatchLoad(format!(
                    "loader `{}` returned {} values for {} keys",
                    self.name,
                    values.len(),
                    keys.len()
                )))
            }
        });

        let mut state = self.state.borrow_mut();
        state.dispatches += 1;
        match outcome {
            Ok(values) => {
                for (key, value) in keys.into_iter().zip(values) {
                    state.cache.insert(key, value);
                }
                Ok(())
            }
            Err(error) => {
                tracing::warn!(loader = %self.name, %error, "batch load failed");
                for key in keys {
                    state.failed.insert(key, error.clone());
                }
                Err(error)
            }
        }
    }

    /// Prime the cache with a value
    ///
    /// Useful for seeding the cache with data you already have.
    pub fn prime(&self, key: K, value: V) {
        let mut state = self.state.borrow_mut();
        state.pending.shift_remove(&key);
        state.failed.remove(&key);
        state.cache.insert(key, value);
    }

    /// Clear the cache
    pub fn clear(&self) {
        let mut state = self.state.borrow_mut();
        state.cache.clear();
        state.failed.clear();
    }

    /// Forget one key's value or failure; the next `load` registers it again.
    pub fn clear_key(&self, key: &K) {
        let mut state = self.state.borrow_mut();
        state.cache.remove(key);
        state.failed.remove(key);
    }

    /// Keys registered for the next batch.
    pub fn pending_len(&self) -> usize {
        self.state.borrow().pending.len()
    }

    /// How many times the batch function has been called.
    pub fn dispatch_count(&self) -> usize {
        self.state.borrow().dispatches
    }

    /// End of a drain round's fetches. Applies the cache policy.
    pub fn finish_round(&self) {
        if self.policy == CachePolicy::PerRound {
            self.clear();
        }
    }
}

/// Placeholder for a key requested from a [`DataLoader`].
pub struct LazyValue<K, V> {
    key: K,
    loader: DataLoader<K, V>,
}

impl<K, V> LazyValue<K, V>
where
    K: Eq + Hash + Clone + 'static,
    V: Clone + 'static,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Resolve the placeholder, dispatching the loader's batch if needed.
    pub fn get(&self) -> Result<V> {
        self.loader.get(&self.key)
    }
}

/// Identity of a loader inside a request: the entity kind, optionally
/// qualified by a path so the same kind fetched with different field subsets
/// gets separate loaders.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoaderKey {
    pub kind: String,
    pub path: Option<String>,
}

impl LoaderKey {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

impl std::fmt::Display for LoaderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{}@{}", self.kind, path),
            None => f.write_str(&self.kind),
        }
    }
}

trait RegisteredLoader {
    fn finish_round(&self);
    fn as_any(&self) -> &dyn Any;
}

impl<K, V> RegisteredLoader for DataLoader<K, V>
where
    K: Eq + Hash + Clone + 'static,
    V: Clone + 'static,
{
    fn finish_round(&self) {
        DataLoader::finish_round(self);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Per-request set of loaders.
pub struct LoaderRegistry {
    policy: CachePolicy,
    loaders: RefCell<HashMap<LoaderKey, Rc<dyn RegisteredLoader>>>,
}

impl LoaderRegistry {
    /// Loaders created through this registry follow `policy`.
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            policy,
            loaders: RefCell::new(HashMap::new()),
        }
    }

    /// Loader registered under `key`, created with `create` on first use.
    ///
    /// Fails when `key` already holds a loader of different key/value types.
    pub fn get_or_insert_with<K, V, F>(&self, key: LoaderKey, create: F) -> Result<DataLoader<K, V>>
    where
        K: Eq + Hash + Clone + 'static,
        V: Clone + 'static,
        F: FnOnce() -> DataLoader<K, V>,
    {
        let existing = self.loaders.borrow().get(&key).cloned();
        if let Some(existing) = existing {
            return existing
                .as_any()
                .downcast_ref::<DataLoader<K, V>>()
                .cloned()
                .ok_or_else(|| {
                    GraphQLError::Schema(format!("loader `{key}` is registered with other key/value types"))
                });
        }

        let loader = create().named(key.to_string()).with_policy(self.policy);
        self.loaders
            .borrow_mut()
            .insert(key, Rc::new(loader.clone()));
        Ok(loader)
    }

    pub fn len(&self) -> usize {
        self.loaders.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.borrow().is_empty()
    }

    /// Apply every loader's cache policy at the end of a drain round.
    pub fn finish_round(&self) {
        let loaders: Vec<_> = self.loaders.borrow().values().cloned().collect();
        for loader in loaders {
            loader.finish_round();
        }
    }
}

impl Default for LoaderRegistry {
    fn default() -> Self {
        Self::new(CachePolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn recording_loader(calls: Rc<RefCell<Vec<Vec<String>>>>) -> DataLoader<String, String> {
        DataLoader::from_fn(move |keys: &[String]| {
            calls.borrow_mut().push(keys.to_vec());
            Ok(keys.iter().map(|k| format!("value-{}", k)).collect())
        })
    }

    #[test]
    fn test_dataloader_batches_pending_keys() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let loader = recording_loader(calls.clone());

        let lazies: Vec<_> = (1..=3).map(|i| loader.load(format!("key{}", i))).collect();
        assert!(calls.borrow().is_empty());

        let values: Vec<_> = lazies.iter().map(|l| l.get().unwrap()).collect();
        assert_eq!(values, vec!["value-key1", "value-key2", "value-key3"]);
        assert_eq!(calls.borrow().len(), 1);
        assert_eq!(calls.borrow()[0], vec!["key1", "key2", "key3"]);
    }

    #[test]
    fn test_dataloader_deduplicates_keys() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let loader = recording_loader(calls.clone());

        let a = loader.load("x".to_string());
        let b = loader.load("x".to_string());
        assert_eq!(a.get().unwrap(), b.get().unwrap());
        assert_eq!(calls.borrow()[0], vec!["x"]);
    }

    #[test]
    fn test_dataloader_caching() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let loader = recording_loader(calls.clone());

        let first = loader.get(&"key1".to_string()).unwrap();
        let second = loader.get(&"key1".to_string()).unwrap();
        assert_eq!(first, second);
        assert_eq!(loader.dispatch_count(), 1);
    }

    #[test]
    fn test_dataloader_failure_reaches_every_key_in_batch() {
        let attempts = Rc::new(Cell::new(0));
        let counter = attempts.clone();
        let loader: DataLoader<u32, u32> = DataLoader::from_fn(move |_keys: &[u32]| {
            counter.set(counter.get() + 1);
            Err(GraphQLError::DataSource("connection reset".to_string()))
        });

        let a = loader.load(1);
        let b = loader.load(2);
        assert!(matches!(a.get(), Err(GraphQLError::DataSource(_))));
        assert!(matches!(b.get(), Err(GraphQLError::DataSource(_))));
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn test_dataloader_rejects_short_batches() {
        let loader: DataLoader<u32, u32> = DataLoader::from_fn(|_keys: &[u32]| Ok(vec![1]));
        let a = loader.load(1);
        let b = loader.load(2);
        assert!(matches!(a.get(), Err(GraphQLError::BatchLoad(_))));
        assert!(matches!(b.get(), Err(GraphQLError::BatchLoad(_))));
    }

    #[test]
    fn test_dataloader_prime() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let loader = recording_loader(calls.clone());

        loader.prime("key1".to_string(), "custom-value".to_string());
        let value = loader.load("key1".to_string()).get().unwrap();
        assert_eq!(value, "custom-value");
        assert!(calls.borrow().is_empty());
    }

    #[test]
    fn test_load_many_is_one_batch() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let loader = recording_loader(calls.clone());

        let values = loader
            .load_many(vec!["b".to_string(), "a".to_string(), "b".to_string()])
            .unwrap();
        assert_eq!(values, vec!["value-b", "value-a", "value-b"]);
        assert_eq!(*calls.borrow(), vec![vec!["b".to_string(), "a".to_string()]]);
    }

    #[test]
    fn test_pending_len_counts_distinct_unfetched_keys() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let loader = recording_loader(calls.clone());
        assert_eq!(loader.pending_len(), 0);

        let first = loader.load("a".to_string());
        loader.load("a".to_string());
        loader.load("b".to_string());
        assert_eq!(loader.pending_len(), 2);

        first.get().unwrap();
        assert_eq!(loader.pending_len(), 0);
        // Cached keys are not registered again.
        loader.load("a".to_string());
        assert_eq!(loader.pending_len(), 0);
    }

    #[test]
    fn test_clear_key_refetches_only_that_key() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let loader = recording_loader(calls.clone());

        loader.load_many(vec!["a".to_string(), "b".to_string()]).unwrap();
        loader.clear_key(&"a".to_string());

        let a = loader.load("a".to_string());
        let b = loader.load("b".to_string());
        assert_eq!(loader.pending_len(), 1);
        assert_eq!(a.get().unwrap(), "value-a");
        assert_eq!(b.get().unwrap(), "value-b");
        assert_eq!(
            *calls.borrow(),
            vec![vec!["a".to_string(), "b".to_string()], vec!["a".to_string()]]
        );
    }

    #[test]
    fn test_clear_key_forgets_a_failure() {
        let fail = Rc::new(Cell::new(true));
        let flag = fail.clone();
        let loader: DataLoader<u32, u32> = DataLoader::from_fn(move |keys: &[u32]| {
            if flag.get() {
                Err(GraphQLError::DataSource("timeout".to_string()))
            } else {
                Ok(keys.to_vec())
            }
        });

        assert!(loader.get(&7).is_err());
        fail.set(false);
        assert!(loader.get(&7).is_err());
        loader.clear_key(&7);
        assert_eq!(loader.get(&7).unwrap(), 7);
    }

    #[test]
    fn test_per_round_policy_refetches_after_round() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let loader = recording_loader(calls.clone());

        loader.load("key1".to_string()).get().unwrap();
        loader.finish_round();
        loader.load("key1".to_string()).get().unwrap();
        assert_eq!(calls.borrow().len(), 2);
    }

    #[test]
    fn test_per_request_policy_keeps_cache() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let loader = recording_loader(calls.clone()).with_policy(CachePolicy::PerRequest);

        loader.load("key1".to_string()).get().unwrap();
        loader.finish_round();
        loader.load("key1".to_string()).get().unwrap();
        assert_eq!(calls.borrow().len(), 1);
    }

    #[test]
    fn test_registry_returns_same_loader_per_key() {
        let registry = LoaderRegistry::default();
        let calls = Rc::new(RefCell::new(Vec::new()));

        let first = registry
            .get_or_insert_with(LoaderKey::new("User"), || recording_loader(calls.clone()))
            .unwrap();
        let second = registry
            .get_or_insert_with(LoaderKey::new("User"), || recording_loader(calls.clone()))
            .unwrap();
        first.load("a".to_string());
        second.load("b".to_string());
        first.dispatch().unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(calls.borrow()[0], vec!["a", "b"]);
        assert_eq!(first.name(), "User");
    }

    #[test]
    fn test_registry_separates_paths() {
        let registry = LoaderRegistry::default();
        let calls = Rc::new(RefCell::new(Vec::new()));

        registry
            .get_or_insert_with(LoaderKey::new("User"), || recording_loader(calls.clone()))
            .unwrap();
        registry
            .get_or_insert_with(LoaderKey::new("User").with_path("owner"), || {
                recording_loader(calls.clone())
            })
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_registry_type_mismatch_is_an_error() {
        let registry = LoaderRegistry::default();
        registry
            .get_or_insert_with(LoaderKey::new("User"), || {
                DataLoader::from_fn(|keys: &[u32]| Ok(keys.to_vec()))
            })
            .unwrap();
        let mismatched = registry.get_or_insert_with(LoaderKey::new("User"), || {
            DataLoader::from_fn(|keys: &[String]| Ok(keys.to_vec()))
        });
        assert!(matches!(mismatched, Err(GraphQLError::Schema(_))));
    }
}
