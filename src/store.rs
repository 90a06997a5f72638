//! Observable local state for tasks and users.
//!
//! Each entity keeps the last authoritative value (`base`) and the ordered
//! list of optimistic changes still awaiting the server. What observers see
//! is the base with every pending change applied in submission order, so
//! dropping one change never disturbs the others. A pending delete hides
//! the entity without discarding the changes queued around it.
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::SyncError;
use crate::model::{EntityKey, EntityKind, MutationStatus};

/// Field-level change set.
pub type Patch = Map<String, Value>;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Changed { key: EntityKey },
    Removed { key: EntityKey },
    /// A mutation was rolled back; UI surfaces this as an error banner.
    MutationFailed {
        key: EntityKey,
        mutation: Uuid,
        error: SyncError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Patch(Patch),
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
    pub id: Uuid,
    pub key: EntityKey,
    pub change: Change,
    /// Observable value when the mutation was initiated.
    pub previous_snapshot: Option<Value>,
    pub status: MutationStatus,
}

#[derive(Debug, Default)]
struct Entry {
    base: Option<Value>,
    pending: Vec<PendingMutation>,
    /// Missing from the latest listing; dropped once nothing is pending.
    evicted: bool,
}

impl Entry {
    fn observable(&self) -> Option<Value> {
        let mut value = self.base.clone();
        let mut deleted = false;
        for mutation in &self.pending {
            match &mutation.change {
                Change::Delete => {
                    deleted = true;
                    value = None;
                }
                Change::Patch(patch) if !deleted => value = Some(apply_patch(value, patch)),
                Change::Patch(_) => {}
            }
        }
        value
    }

    fn take_pending(&mut self, id: Uuid) -> Option<PendingMutation> {
        let pos = self.pending.iter().position(|m| m.id == id)?;
        Some(self.pending.remove(pos))
    }

    /// Nothing left worth keeping once the last pending change settles.
    fn is_spent(&self) -> bool {
        self.pending.is_empty() && (self.base.is_none() || self.evicted)
    }
}

/// Overlay `patch` onto `base`. A missing or non-object base starts empty.
pub fn apply_patch(base: Option<Value>, patch: &Patch) -> Value {
    let mut fields = match base {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    for (field, value) in patch {
        fields.insert(field.clone(), value.clone());
    }
    Value::Object(fields)
}

struct StoreInner {
    entries: Mutex<HashMap<EntityKey, Entry>>,
    events: broadcast::Sender<StoreEvent>,
}

#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<StoreInner>,
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                entries: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    pub fn get(&self, key: EntityKey) -> Option<Value> {
        self.with_entries(|entries| entries.get(&key).and_then(Entry::observable))
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: EntityKey) -> Result<Option<T>, SyncError> {
        self.get(key)
            .map(serde_json::from_value)
            .transpose()
            .map_err(SyncError::from)
    }

    /// Observable values of one kind, ordered by id.
    pub fn list(&self, kind: EntityKind) -> Vec<(i64, Value)> {
        let mut items: Vec<(i64, Value)> = self.with_entries(|entries| {
            entries
                .iter()
                .filter(|(key, _)| key.kind == kind)
                .filter_map(|(key, entry)| entry.observable().map(|v| (key.id, v)))
                .collect()
        });
        items.sort_by_key(|(id, _)| *id);
        items
    }

    pub fn list_as<T: DeserializeOwned>(&self, kind: EntityKind) -> Result<Vec<T>, SyncError> {
        self.list(kind)
            .into_iter()
            .map(|(_, value)| serde_json::from_value(value).map_err(SyncError::from))
            .collect()
    }

    pub fn pending(&self, key: EntityKey) -> Vec<PendingMutation> {
        self.with_entries(|entries| {
            entries
                .get(&key)
                .map(|entry| entry.pending.clone())
                .unwrap_or_default()
        })
    }

    /// Record an authoritative value from the server. Pending changes stay
    /// layered on top.
    pub fn upsert(&self, key: EntityKey, value: Value) {
        self.with_entries(|entries| {
            let entry = entries.entry(key).or_default();
            entry.base = Some(value);
            entry.evicted = false;
        });
        self.emit(StoreEvent::Changed { key });
    }

    /// Replace every entity of `kind` with a fresh listing. Entities missing
    /// from the listing are dropped; one with changes in flight is only
    /// marked and goes once those settle.
    pub fn replace_all(&self, kind: EntityKind, items: Vec<(i64, Value)>) {
        let mut changed = Vec::with_capacity(items.len());
        let mut removed = Vec::new();
        self.with_entries(|entries| {
            let fresh: HashMap<i64, Value> = items.into_iter().collect();
            entries.retain(|key, entry| {
                if key.kind != kind || fresh.contains_key(&key.id) {
                    return true;
                }
                if entry.pending.is_empty() {
                    removed.push(*key);
                    return false;
                }
                entry.evicted = true;
                true
            });
            for (id, value) in fresh {
                let key = EntityKey { kind, id };
                let entry = entries.entry(key).or_default();
                entry.base = Some(value);
                entry.evicted = false;
                changed.push(key);
            }
        });
        for key in removed {
            self.emit(StoreEvent::Removed { key });
        }
        for key in changed {
            self.emit(StoreEvent::Changed { key });
        }
    }

    /// Layer `change` over the current observable state and return the
    /// pending record, whose snapshot is the state just before the change.
    pub(crate) fn begin(&self, key: EntityKey, change: Change) -> PendingMutation {
        let mutation = self.with_entries(|entries| {
            let entry = entries.entry(key).or_default();
            let mutation = PendingMutation {
                id: Uuid::new_v4(),
                key,
                change,
                previous_snapshot: entry.observable(),
                status: MutationStatus::Applied,
            };
            entry.pending.push(mutation.clone());
            mutation
        });
        self.emit(StoreEvent::Changed { key });
        mutation
    }

    /// Settle a mutation as accepted. For a patch, an authoritative object
    /// from the server becomes the new base; otherwise the patch itself is
    /// folded in. A confirmed delete drops the base.
    pub(crate) fn confirm(
        &self,
        key: EntityKey,
        id: Uuid,
        authoritative: Option<Value>,
    ) -> Option<PendingMutation> {
        self.settle(key, |entry| {
            let mut mutation = entry.take_pending(id)?;
            match (&mutation.change, authoritative) {
                (Change::Delete, _) => entry.base = None,
                (Change::Patch(_), Some(value @ Value::Object(_))) => {
                    entry.base = Some(value);
                    entry.evicted = false;
                }
                (Change::Patch(patch), _) => {
                    entry.base = Some(apply_patch(entry.base.take(), patch));
                }
            }
            mutation.status = MutationStatus::Confirmed;
            Some(mutation)
        })
    }

    /// Drop a mutation's change. When the server reported its own state
    /// (`server`), that becomes the base.
    pub(crate) fn rollback(
        &self,
        key: EntityKey,
        id: Uuid,
        server: Option<Value>,
    ) -> Option<PendingMutation> {
        self.settle(key, |entry| {
            let mut mutation = entry.take_pending(id)?;
            if let Some(value) = server {
                entry.base = Some(value);
                entry.evicted = false;
            }
            mutation.status = MutationStatus::RolledBack;
            Some(mutation)
        })
    }

    pub(crate) fn report_failure(&self, key: EntityKey, mutation: Uuid, error: SyncError) {
        self.emit(StoreEvent::MutationFailed {
            key,
            mutation,
            error,
        });
    }

    fn settle(
        &self,
        key: EntityKey,
        f: impl FnOnce(&mut Entry) -> Option<PendingMutation>,
    ) -> Option<PendingMutation> {
        let (settled, visible) = self.with_entries(|entries| {
            let entry = entries.get_mut(&key)?;
            let settled = f(entry);
            let visible = entry.observable().is_some();
            if entry.is_spent() {
                entries.remove(&key);
            }
            Some((settled, visible))
        })?;
        if visible {
            self.emit(StoreEvent::Changed { key });
        } else {
            self.emit(StoreEvent::Removed { key });
        }
        settled
    }

    fn emit(&self, event: StoreEvent) {
        // No subscribers is fine: nobody is looking.
        let _ = self.inner.events.send(event);
    }

    fn with_entries<R>(&self, f: impl FnOnce(&mut HashMap<EntityKey, Entry>) -> R) -> R {
        let mut guard = self
            .inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}
