//! Volatile session store.
//!
//! Live session, lease and filter state lives in a low-latency key-value store
//! offering strings, hashes, sets, guarded multi-op transactions and pub/sub.
//! Services only talk to it through [`VolatileStore`]; the in-process
//! [`MemoryVolatileStore`] backs tests and single-node deployments.
//!
//! # Transactions
//!
//! A [`Transaction`] carries a list of preconditions and a list of operations.
//! If any precondition fails nothing is written and `execute` returns
//! `Ok(false)`. Operations run in order; an [`Op::Guarded`] operation is
//! skipped (without failing the transaction) when its guard does not hold at
//! the point it runs.

pub mod keys;
mod memory;

pub use memory::MemoryVolatileStore;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

/// Volatile store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A key holds a different data type than the operation expects.
    #[error("wrong type for key {0}")]
    WrongType(String),

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Precondition evaluated against current store contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    HashFieldEquals {
        key: String,
        field: String,
        value: String,
    },
    HashFieldExists {
        key: String,
        field: String,
    },
    HashFieldNotExists {
        key: String,
        field: String,
    },
}

impl Condition {
    pub fn hash_field_equals(
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Condition::HashFieldEquals {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn hash_field_exists(key: impl Into<String>, field: impl Into<String>) -> Self {
        Condition::HashFieldExists {
            key: key.into(),
            field: field.into(),
        }
    }

    pub fn hash_field_not_exists(key: impl Into<String>, field: impl Into<String>) -> Self {
        Condition::HashFieldNotExists {
            key: key.into(),
            field: field.into(),
        }
    }
}

/// A single write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Set { key: String, value: String },
    Delete { key: String },
    HashSet { key: String, field: String, value: String },
    HashDelete { key: String, field: String },
    SetAdd { key: String, member: String },
    SetRemove { key: String, member: String },
    Publish { channel: String, message: String },
    /// Apply `op` only if `guard` holds when this operation is reached.
    Guarded { guard: Condition, op: Box<Op> },
}

/// An atomic batch of writes with preconditions.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    conditions: Vec<Condition>,
    ops: Vec<Op>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `condition` to hold for the whole transaction to apply.
    pub fn condition(&mut self, condition: Condition) -> &mut Self {
        self.conditions.push(condition);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.push(Op::Set {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(Op::Delete { key: key.into() })
    }

    pub fn hash_set(
        &mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.push(Op::HashSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        })
    }

    pub fn hash_delete(&mut self, key: impl Into<String>, field: impl Into<String>) -> &mut Self {
        self.push(Op::HashDelete {
            key: key.into(),
            field: field.into(),
        })
    }

    pub fn set_add(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.push(Op::SetAdd {
            key: key.into(),
            member: member.into(),
        })
    }

    pub fn set_remove(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.push(Op::SetRemove {
            key: key.into(),
            member: member.into(),
        })
    }

    pub fn publish(&mut self, channel: impl Into<String>, message: impl Into<String>) -> &mut Self {
        self.push(Op::Publish {
            channel: channel.into(),
            message: message.into(),
        })
    }

    /// Append `op`, to be skipped at apply time if `guard` fails.
    pub fn guarded(&mut self, guard: Condition, op: Op) -> &mut Self {
        self.push(Op::Guarded {
            guard,
            op: Box::new(op),
        })
    }

    pub fn push(&mut self, op: Op) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Position in a cursor scan. Scans resume strictly after the last item
/// returned, so a restarted scan never repeats what a previous page yielded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanCursor(Option<String>);

impl ScanCursor {
    /// Cursor at the beginning of the collection.
    pub fn start() -> Self {
        Self(None)
    }

    /// Cursor positioned after `item`.
    pub fn after(item: impl Into<String>) -> Self {
        Self(Some(item.into()))
    }

    pub fn position(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

/// One page of a cursor scan.
#[derive(Debug, Clone)]
pub struct ScanPage<T> {
    pub items: Vec<T>,
    /// Cursor for the next page, or `None` when the scan is complete.
    pub next: Option<ScanCursor>,
}

/// Event delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Message(String),
    /// The subscriber fell behind and dropped this many messages.
    Lagged(u64),
    Closed,
}

/// A live subscription to one channel.
pub struct Subscription {
    receiver: broadcast::Receiver<String>,
}

impl Subscription {
    pub fn new(receiver: broadcast::Receiver<String>) -> Self {
        Self { receiver }
    }

    /// Wait for the next event on the channel.
    pub async fn recv(&mut self) -> SubscriptionEvent {
        match self.receiver.recv().await {
            Ok(message) => SubscriptionEvent::Message(message),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(missed = n, "Subscription lagged");
                SubscriptionEvent::Lagged(n)
            }
            Err(broadcast::error::RecvError::Closed) => SubscriptionEvent::Closed,
        }
    }
}

/// Operations consumed from the volatile store.
#[async_trait]
pub trait VolatileStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    async fn hash_get_all(&self, key: &str) -> StoreResult<BTreeMap<String, String>>;

    /// Scan up to `count` field/value pairs of a hash.
    async fn hash_scan(
        &self,
        key: &str,
        cursor: &ScanCursor,
        count: usize,
    ) -> StoreResult<ScanPage<(String, String)>>;

    async fn set_members(&self, key: &str) -> StoreResult<BTreeSet<String>>;

    async fn set_len(&self, key: &str) -> StoreResult<usize>;

    /// Scan up to `count` members of a set.
    async fn set_scan(
        &self,
        key: &str,
        cursor: &ScanCursor,
        count: usize,
    ) -> StoreResult<ScanPage<String>>;

    /// Apply a transaction. Returns `Ok(false)` if a precondition failed.
    async fn execute(&self, tx: Transaction) -> StoreResult<bool>;

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription>;
}

/// Lazily stream every field/value pair of a hash, one page at a time.
pub fn scan_hash(
    store: Arc<dyn VolatileStore>,
    key: String,
    page_size: usize,
) -> BoxStream<'static, StoreResult<(String, String)>> {
    stream::unfold(Some(ScanCursor::start()), move |cursor| {
        let store = store.clone();
        let key = key.clone();
        async move {
            let cursor = cursor?;
            match store.hash_scan(&key, &cursor, page_size).await {
                Ok(page) => {
                    let items = stream::iter(page.items.into_iter().map(Ok::<_, StoreError>));
                    Some((Ok(items), page.next))
                }
                Err(e) => Some((Err(e), None)),
            }
        }
    })
    .try_flatten()
    .boxed()
}

/// Lazily stream every member of a set, one page at a time.
pub fn scan_set(
    store: Arc<dyn VolatileStore>,
    key: String,
    page_size: usize,
) -> BoxStream<'static, StoreResult<String>> {
    stream::unfold(Some(ScanCursor::start()), move |cursor| {
        let store = store.clone();
        let key = key.clone();
        async move {
            let cursor = cursor?;
            match store.set_scan(&key, &cursor, page_size).await {
                Ok(page) => {
                    let items = stream::iter(page.items.into_iter().map(Ok::<_, StoreError>));
                    Some((Ok(items), page.next))
                }
                Err(e) => Some((Err(e), None)),
            }
        }
    })
    .try_flatten()
    .boxed()
}
