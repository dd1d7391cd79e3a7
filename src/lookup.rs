use crate::errors::StoreError;
use crate::pvcell::CellParams;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Significant figures of the (irradiance, temperature) part of a parameter key
pub const PARAMS_SIG_FIGS: usize = 3;
/// Significant figures of the (current, parameters) part of a voltage key
pub const VOLTAGE_SIG_FIGS: usize = 6;

const KEY_DELIMITER: char = '|';

/// Cache key built from a panel identifier and numeric fields rounded to fixed significant figures,
/// so that floating point jitter maps onto the same entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(panel_id: &str, fields: &[f64], sig_figs: usize) -> CacheKey {
        let mut key = String::from(panel_id);
        for x in fields {
            key.push(KEY_DELIMITER);
            key.push_str(&format_sig(*x, sig_figs));
        }
        CacheKey(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn format_sig(x: f64, sig_figs: usize) -> String {
    // collapse -0.0 onto 0.0
    let x = if x == 0.0 { 0.0 } else { x };
    format!("{:.*e}", sig_figs.max(1) - 1, x)
}

/// Outcome of a cache lookup
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(v) => Some(v),
            Lookup::NotFound => None,
        }
    }
}

/// Durable key/value store behind a [`MemoCache`]. Writes only ever add or update entries.
pub trait KeyedStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    fn put(&mut self, key: &str, value: Value) -> Result<(), StoreError>;
}

/// Store that lives only as long as the process
#[derive(Default)]
pub struct MemoryStore {
    entries: HashMap<String, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl KeyedStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &str, value: Value) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct StoreLine {
    key: String,
    value: Value,
}

/// Append-only JSON-lines file. Later lines for the same key override earlier ones on load.
pub struct JsonLinesStore {
    path: PathBuf,
    entries: HashMap<String, Value>,
    file: File,
}

impl JsonLinesStore {
    /// Opens (or creates) the store at `path` and loads every entry into memory
    ///
    /// # Arguments
    ///
    /// * 'path' - path to the JSON-lines file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<JsonLinesStore, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }

        let mut entries = HashMap::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (n, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<StoreLine>(&line) {
                    Ok(l) => { entries.insert(l.key, l.value); }
                    Err(e) => warn!("skipping corrupt line {} in {}: {}", n + 1, path.display(), e),
                }
            }
        }
        info!("opened store {} with {} entries", path.display(), entries.len());

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(JsonLinesStore { path, entries, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl KeyedStore for JsonLinesStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &str, value: Value) -> Result<(), StoreError> {
        let line = serde_json::to_string(&StoreLine { key: key.to_string(), value: value.clone() })?;
        writeln!(self.file, "{}", line)?;
        self.entries.insert(key.to_string(), value);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub store_hits: usize,
    pub misses: usize,
    pub computations: usize,
}

/// Memoizes expensive results by rounded key. Entries are never evicted within a run.
///
pub struct MemoCache<T> {
    name: &'static str,
    entries: HashMap<CacheKey, T>,
    store: Option<Box<dyn KeyedStore>>,
    stats: CacheStats,
}

impl<T: Clone + Serialize + DeserializeOwned> MemoCache<T> {
    pub fn new(name: &'static str) -> Self {
        MemoCache { name, entries: HashMap::new(), store: None, stats: CacheStats::default() }
    }

    /// builder: let c = MemoCache::new("params").with_store(Box::new(store));
    pub fn with_store(mut self, store: Box<dyn KeyedStore>) -> Self { self.store = Some(store); self }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Looks the key up in memory, then in the durable store. Store hits are promoted to memory.
    pub fn lookup(&mut self, key: &CacheKey) -> Result<Lookup<T>, StoreError> {
        if let Some(v) = self.entries.get(key) {
            self.stats.hits += 1;
            return Ok(Lookup::Found(v.clone()));
        }
        if let Some(store) = self.store.as_ref() {
            if let Some(raw) = store.get(key.as_str())? {
                match serde_json::from_value::<T>(raw) {
                    Ok(v) => {
                        self.stats.store_hits += 1;
                        self.entries.insert(key.clone(), v.clone());
                        return Ok(Lookup::Found(v));
                    }
                    Err(e) => warn!("{}: ignoring undecodable stored value for {}: {}", self.name, key, e),
                }
            }
        }
        self.stats.misses += 1;
        Ok(Lookup::NotFound)
    }

    /// Stores a value in memory and writes it through to the durable store
    pub fn insert(&mut self, key: CacheKey, value: T) -> Result<(), StoreError> {
        if let Some(store) = self.store.as_mut() {
            store.put(key.as_str(), serde_json::to_value(&value)?)?;
        }
        self.entries.insert(key, value);
        Ok(())
    }

    /// Returns the cached value or computes, stores and returns it. `compute` runs at most once per
    /// distinct key.
    pub fn get_or_try_insert_with<E, F>(&mut self, key: CacheKey, compute: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce() -> Result<T, E>,
    {
        if let Lookup::Found(v) = self.lookup(&key)? {
            return Ok(v);
        }
        debug!("{}: computing {}", self.name, key);
        let value = compute()?;
        self.stats.computations += 1;
        self.insert(key, value.clone())?;
        Ok(value)
    }
}

/// The two caches the circuit model consults: resolved cell parameters and per-cell voltages.
///
/// Owned by the caller; strings share entries only when handed the same instance.
pub struct CellCaches {
    pub params: MemoCache<CellParams>,
    pub voltages: MemoCache<f64>,
}

impl CellCaches {
    pub fn new() -> Self {
        CellCaches { params: MemoCache::new("params"), voltages: MemoCache::new("voltages") }
    }

    /// Caches persisted as JSON-lines files under `dir`
    pub fn persistent<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        let params = JsonLinesStore::open(dir.join("cell_params.jsonl"))?;
        let voltages = JsonLinesStore::open(dir.join("cell_voltages.jsonl"))?;
        Ok(CellCaches {
            params: MemoCache::new("params").with_store(Box::new(params)),
            voltages: MemoCache::new("voltages").with_store(Box::new(voltages)),
        })
    }

    pub fn params_key(panel_id: &str, irradiance: f64, temperature: f64) -> CacheKey {
        CacheKey::new(panel_id, &[irradiance, temperature], PARAMS_SIG_FIGS)
    }

    pub fn voltage_key(panel_id: &str, current: f64, p: &CellParams) -> CacheKey {
        CacheKey::new(panel_id, &[current, p.iph, p.i0, p.n_vth, p.rs, p.rp], VOLTAGE_SIG_FIGS)
    }
}

impl Default for CellCaches {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ModelError;

    #[derive(Debug)]
    enum TestError {
        Store(StoreError),
        Compute,
    }

    impl From<StoreError> for TestError {
        fn from(e: StoreError) -> Self { TestError::Store(e) }
    }

    #[test]
    fn keys_round_to_significant_figures() {
        let a = CellCaches::params_key("p", 1000.0, 25.0000001);
        let b = CellCaches::params_key("p", 1000.0, 25.0);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "p|1.00e3|2.50e1");

        let c = CellCaches::params_key("p", 1000.0, 25.4);
        assert_ne!(a, c);
        assert_eq!(CacheKey::new("p", &[-0.0], 3), CacheKey::new("p", &[0.0], 3));
    }

    #[test]
    fn computes_at_most_once_per_key() {
        let mut cache: MemoCache<f64> = MemoCache::new("test");
        let mut calls = 0;
        for t in [25.0, 25.0000001, 24.9999999] {
            let key = CellCaches::params_key("p", 1000.0, t);
            let v: Result<f64, TestError> = cache.get_or_try_insert_with(key, || { calls += 1; Ok(t) });
            assert_eq!(v.unwrap(), 25.0);
        }
        assert_eq!(calls, 1);
        assert_eq!(cache.stats().computations, 1);
        assert_eq!(cache.stats().hits, 2);

        let key = CellCaches::params_key("p", 1000.0, 30.0);
        let v: Result<f64, TestError> = cache.get_or_try_insert_with(key, || { calls += 1; Ok(30.0) });
        assert_eq!(v.unwrap(), 30.0);
        assert_eq!(calls, 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn failed_computation_is_not_cached() {
        let mut cache: MemoCache<f64> = MemoCache::new("test");
        let key = CacheKey::new("p", &[1.0], 3);
        let r: Result<f64, TestError> = cache.get_or_try_insert_with(key.clone(), || Err(TestError::Compute));
        assert!(matches!(r, Err(TestError::Compute)));
        assert_eq!(cache.lookup(&key).unwrap(), Lookup::NotFound);
    }

    #[test]
    fn lookup_reads_through_to_store() {
        let mut store = MemoryStore::new();
        let key = CacheKey::new("p", &[1.0, 2.0], 3);
        store.put(key.as_str(), serde_json::json!(4.5)).unwrap();

        let mut cache: MemoCache<f64> = MemoCache::new("test").with_store(Box::new(store));
        assert_eq!(cache.lookup(&key).unwrap(), Lookup::Found(4.5));
        assert_eq!(cache.stats().store_hits, 1);
        assert_eq!(cache.lookup(&key).unwrap().found(), Some(4.5));
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn json_lines_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let params = CellParams { iph: 10.4, i0: 1.4e-11, n_vth: 0.025, rs: 0.003, rp: 22000.0 };
        {
            let mut caches = CellCaches::persistent(dir.path()).unwrap();
            let key = CellCaches::params_key("p", 1000.0, 25.0);
            let r: Result<CellParams, ModelError> = caches.params.get_or_try_insert_with(key, || Ok(params));
            r.unwrap();
            caches.voltages.insert(CellCaches::voltage_key("p", 5.0, &params), 0.61).unwrap();
        }

        let mut caches = CellCaches::persistent(dir.path()).unwrap();
        let found = caches.params.lookup(&CellCaches::params_key("p", 1000.0, 25.0)).unwrap();
        assert_eq!(found, Lookup::Found(params));
        let v = caches.voltages.lookup(&CellCaches::voltage_key("p", 5.0, &params)).unwrap();
        assert_eq!(v, Lookup::Found(0.61));
    }

    #[test]
    fn later_lines_override_and_corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        fs::write(&path, "{\"key\":\"a\",\"value\":1.0}\nnot json\n{\"key\":\"a\",\"value\":2.0}\n").unwrap();
        let store = JsonLinesStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a").unwrap(), Some(serde_json::json!(2.0)));
    }
}
