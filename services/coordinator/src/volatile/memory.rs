//! In-process volatile store.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{
    Condition, Op, ScanCursor, ScanPage, StoreError, StoreResult, Subscription, Transaction,
    VolatileStore,
};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(BTreeMap<String, String>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Str,
    Hash,
    Set,
}

impl Value {
    fn kind(&self) -> Kind {
        match self {
            Value::Str(_) => Kind::Str,
            Value::Hash(_) => Kind::Hash,
            Value::Set(_) => Kind::Set,
        }
    }
}

#[derive(Default)]
struct Inner {
    data: HashMap<String, Value>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

impl Inner {
    fn check_kind(&self, key: &str, kind: Kind) -> StoreResult<()> {
        match self.data.get(key) {
            Some(value) if value.kind() != kind => Err(StoreError::WrongType(key.to_string())),
            _ => Ok(()),
        }
    }

    fn hash(&self, key: &str) -> StoreResult<Option<&BTreeMap<String, String>>> {
        match self.data.get(key) {
            None => Ok(None),
            Some(Value::Hash(map)) => Ok(Some(map)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn set(&self, key: &str) -> StoreResult<Option<&BTreeSet<String>>> {
        match self.data.get(key) {
            None => Ok(None),
            Some(Value::Set(set)) => Ok(Some(set)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn holds(&self, condition: &Condition) -> StoreResult<bool> {
        Ok(match condition {
            Condition::HashFieldEquals { key, field, value } => self
                .hash(key)?
                .and_then(|map| map.get(field))
                .is_some_and(|current| current == value),
            Condition::HashFieldExists { key, field } => {
                self.hash(key)?.is_some_and(|map| map.contains_key(field))
            }
            Condition::HashFieldNotExists { key, field } => {
                !self.hash(key)?.is_some_and(|map| map.contains_key(field))
            }
        })
    }

    /// Reject the transaction up front if any op would hit a mistyped key.
    fn type_check(&self, op: &Op) -> StoreResult<()> {
        match op {
            Op::Set { .. } | Op::Delete { .. } | Op::Publish { .. } => Ok(()),
            Op::HashSet { key, .. } | Op::HashDelete { key, .. } => self.check_kind(key, Kind::Hash),
            Op::SetAdd { key, .. } | Op::SetRemove { key, .. } => self.check_kind(key, Kind::Set),
            Op::Guarded { guard, op } => {
                self.holds(guard)?;
                self.type_check(op)
            }
        }
    }

    fn apply(&mut self, op: Op) -> StoreResult<()> {
        match op {
            Op::Set { key, value } => {
                self.data.insert(key, Value::Str(value));
            }
            Op::Delete { key } => {
                self.data.remove(&key);
            }
            Op::HashSet { key, field, value } => {
                let entry = self
                    .data
                    .entry(key.clone())
                    .or_insert_with(|| Value::Hash(BTreeMap::new()));
                match entry {
                    Value::Hash(map) => {
                        map.insert(field, value);
                    }
                    _ => return Err(StoreError::WrongType(key)),
                }
            }
            Op::HashDelete { key, field } => {
                if let Some(Value::Hash(map)) = self.data.get_mut(&key) {
                    map.remove(&field);
                    if map.is_empty() {
                        self.data.remove(&key);
                    }
                }
            }
            Op::SetAdd { key, member } => {
                let entry = self
                    .data
                    .entry(key.clone())
                    .or_insert_with(|| Value::Set(BTreeSet::new()));
                match entry {
                    Value::Set(set) => {
                        set.insert(member);
                    }
                    _ => return Err(StoreError::WrongType(key)),
                }
            }
            Op::SetRemove { key, member } => {
                if let Some(Value::Set(set)) = self.data.get_mut(&key) {
                    set.remove(&member);
                    if set.is_empty() {
                        self.data.remove(&key);
                    }
                }
            }
            Op::Publish { channel, message } => {
                if let Some(sender) = self.channels.get(&channel) {
                    // No receivers is not an error for pub/sub.
                    let _ = sender.send(message);
                }
            }
            Op::Guarded { guard, op } => {
                if self.holds(&guard)? {
                    self.apply(*op)?;
                }
            }
        }
        Ok(())
    }
}

/// Volatile store held in process memory.
///
/// Every transaction runs under a single lock, which gives the same
/// all-or-nothing behaviour a server-side scripted transaction would.
#[derive(Default)]
pub struct MemoryVolatileStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl MemoryVolatileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of keys currently stored.
    pub fn key_count(&self) -> usize {
        self.lock().data.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connect(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(self.lock())
    }
}

fn page<T: Clone>(
    items: impl Iterator<Item = (String, T)>,
    count: usize,
) -> (Vec<T>, Option<ScanCursor>) {
    let count = count.max(1);
    let mut out = Vec::with_capacity(count);
    let mut last = None;
    for (position, item) in items {
        if out.len() == count {
            return (out, last.map(ScanCursor::after));
        }
        out.push(item);
        last = Some(position);
    }
    (out, None)
}

fn after(cursor: &ScanCursor) -> (Bound<String>, Bound<String>) {
    match cursor.position() {
        Some(position) => (Bound::Excluded(position.to_string()), Bound::Unbounded),
        None => (Bound::Unbounded, Bound::Unbounded),
    }
}

#[async_trait]
impl VolatileStore for MemoryVolatileStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let inner = self.connect()?;
        match inner.data.get(key) {
            None => Ok(None),
            Some(Value::Str(value)) => Ok(Some(value.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let inner = self.connect()?;
        Ok(inner.hash(key)?.and_then(|map| map.get(field).cloned()))
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<BTreeMap<String, String>> {
        let inner = self.connect()?;
        Ok(inner.hash(key)?.cloned().unwrap_or_default())
    }

    async fn hash_scan(
        &self,
        key: &str,
        cursor: &ScanCursor,
        count: usize,
    ) -> StoreResult<ScanPage<(String, String)>> {
        let inner = self.connect()?;
        let Some(map) = inner.hash(key)? else {
            return Ok(ScanPage {
                items: Vec::new(),
                next: None,
            });
        };
        let (items, next) = page(
            map.range(after(cursor))
                .map(|(k, v)| (k.clone(), (k.clone(), v.clone()))),
            count,
        );
        Ok(ScanPage { items, next })
    }

    async fn set_members(&self, key: &str) -> StoreResult<BTreeSet<String>> {
        let inner = self.connect()?;
        Ok(inner.set(key)?.cloned().unwrap_or_default())
    }

    async fn set_len(&self, key: &str) -> StoreResult<usize> {
        let inner = self.connect()?;
        Ok(inner.set(key)?.map_or(0, BTreeSet::len))
    }

    async fn set_scan(
        &self,
        key: &str,
        cursor: &ScanCursor,
        count: usize,
    ) -> StoreResult<ScanPage<String>> {
        let inner = self.connect()?;
        let Some(set) = inner.set(key)? else {
            return Ok(ScanPage {
                items: Vec::new(),
                next: None,
            });
        };
        let (items, next) = page(
            set.range(after(cursor)).map(|m| (m.clone(), m.clone())),
            count,
        );
        Ok(ScanPage { items, next })
    }

    async fn execute(&self, tx: Transaction) -> StoreResult<bool> {
        let mut inner = self.connect()?;
        for condition in tx.conditions() {
            if !inner.holds(condition)? {
                return Ok(false);
            }
        }
        for op in tx.ops() {
            inner.type_check(op)?;
        }
        for op in tx.ops {
            inner.apply(op)?;
        }
        Ok(true)
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let mut inner = self.connect()?;
        let sender = inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        Ok(Subscription::new(sender.subscribe()))
    }
}
