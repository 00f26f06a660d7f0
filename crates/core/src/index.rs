//! Account-wide object index over the local store.
//!
//! Records hold the combined details and outgoing links of every loaded
//! or synced object, across all spaces. Key families:
//!
//! - `idx/<id>` the [ObjectRecord]
//! - `bl/<target>/<source>` reverse link edges
//! - `pld/<id>` pending local details of objects not in any cache

use heart_api::{kv::*, *};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};

#[cfg(test)]
mod test;

/// An indexed object.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRecord {
    /// Object id.
    pub id: ObjectId,
    /// Space of the object.
    pub space_id: SpaceId,
    /// Smartblock type.
    pub sb_type: SmartBlockType,
    /// Combined details.
    #[serde(default)]
    pub details: Details,
    /// Objects this one links to or mentions.
    #[serde(default)]
    pub links: Vec<ObjectId>,
    /// Heads at indexing time.
    #[serde(default)]
    pub heads: Vec<ChangeId>,
}

/// Receives details of subscribed objects.
pub trait DetailsListener: 'static + Send + Sync {
    /// Called synchronously from [ObjectIndex::update].
    fn on_details(&self, record: &ObjectRecord);
}

fn record_key(id: &ObjectId) -> Vec<u8> {
    format!("idx/{id}").into_bytes()
}

fn backlink_key(target: &ObjectId, source: &ObjectId) -> Vec<u8> {
    format!("bl/{target}/{source}").into_bytes()
}

fn pending_key(id: &ObjectId) -> Vec<u8> {
    format!("pld/{id}").into_bytes()
}

struct Sub {
    ids: BTreeSet<ObjectId>,
    listener: Arc<dyn DetailsListener>,
}

struct Inner {
    store: DynKvStore,
    subs: Mutex<HashMap<u64, Sub>>,
    next_sub: std::sync::atomic::AtomicU64,
    backlink_tx: Mutex<Option<tokio::sync::mpsc::UnboundedSender<ObjectId>>>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectIndex").finish()
    }
}

/// Handle of a details subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    inner: Weak<Inner>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Subscription {
    /// Replace the subscribed ids.
    pub fn set_ids(&self, ids: impl IntoIterator<Item = ObjectId>) {
        if let Some(inner) = self.inner.upgrade() {
            let mut lock = inner.subs.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(sub) = lock.get_mut(&self.id) {
                sub.ids = ids.into_iter().collect();
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner
                .subs
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&self.id);
        }
    }
}

/// The object index.
#[derive(Debug, Clone)]
pub struct ObjectIndex {
    inner: Arc<Inner>,
}

impl ObjectIndex {
    /// Construct over the local store.
    pub fn new(store: DynKvStore) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                subs: Mutex::new(HashMap::new()),
                next_sub: std::sync::atomic::AtomicU64::new(1),
                backlink_tx: Mutex::new(None),
            }),
        }
    }

    /// Receive the ids of objects whose backlinks changed.
    /// Replaces an earlier receiver.
    pub fn backlink_updates(
        &self,
    ) -> tokio::sync::mpsc::UnboundedReceiver<ObjectId> {
        let (s, r) = tokio::sync::mpsc::unbounded_channel();
        *self
            .inner
            .backlink_tx
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(s);
        r
    }

    fn announce_backlinks(&self, ids: impl IntoIterator<Item = ObjectId>) {
        let lock = self
            .inner
            .backlink_tx
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if let Some(tx) = lock.as_ref() {
            for id in ids {
                let _ = tx.send(id);
            }
        }
    }

    /// Read a record.
    pub fn get(&self, id: &ObjectId) -> HeartResult<Option<ObjectRecord>> {
        get_json(&*self.inner.store, &record_key(id))
    }

    /// The space an object lives in, if indexed.
    pub fn space_of(&self, id: &ObjectId) -> HeartResult<Option<SpaceId>> {
        Ok(self.get(id)?.map(|r| r.space_id))
    }

    /// Write a record, maintain reverse links and notify subscribers.
    pub fn update(&self, record: ObjectRecord) -> HeartResult<()> {
        let old = self.get(&record.id)?;
        if old.as_ref() == Some(&record) {
            return Ok(());
        }
        let old_links: BTreeSet<ObjectId> = old
            .as_ref()
            .map(|r| r.links.iter().cloned().collect())
            .unwrap_or_default();
        let new_links: BTreeSet<ObjectId> =
            record.links.iter().cloned().collect();

        let mut ops = vec![put_json_op(record_key(&record.id), &record)?];
        for gone in old_links.difference(&new_links) {
            ops.push(KvOp::Delete(backlink_key(gone, &record.id).into()));
        }
        for added in new_links.difference(&old_links) {
            ops.push(KvOp::Put(
                backlink_key(added, &record.id).into(),
                bytes::Bytes::new(),
            ));
        }
        self.inner.store.write_batch(ops)?;

        let changed: Vec<ObjectId> = old_links
            .symmetric_difference(&new_links)
            .cloned()
            .collect();
        self.announce_backlinks(changed);

        if old.map(|o| o.details) != Some(record.details.clone()) {
            self.notify(&record);
        }
        Ok(())
    }

    fn notify(&self, record: &ObjectRecord) {
        let listeners: Vec<Arc<dyn DetailsListener>> = self
            .inner
            .subs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|s| s.ids.contains(&record.id))
            .map(|s| s.listener.clone())
            .collect();
        for l in listeners {
            l.on_details(record);
        }
    }

    /// Drop a record and its outgoing links.
    pub fn remove(&self, id: &ObjectId) -> HeartResult<()> {
        let Some(old) = self.get(id)? else {
            return Ok(());
        };
        let mut ops = vec![KvOp::Delete(record_key(id).into())];
        for l in old.links.iter() {
            ops.push(KvOp::Delete(backlink_key(l, id).into()));
        }
        self.inner.store.write_batch(ops)?;
        self.announce_backlinks(old.links);
        Ok(())
    }

    /// Objects linking to `id`.
    pub fn backlinks(&self, id: &ObjectId) -> HeartResult<Vec<ObjectId>> {
        let prefix = format!("bl/{id}/");
        Ok(self
            .inner
            .store
            .iter_prefix(prefix.as_bytes())?
            .into_iter()
            .filter_map(|(k, _)| {
                std::str::from_utf8(&k[prefix.len()..])
                    .ok()
                    .map(ObjectId::from)
            })
            .collect())
    }

    /// Records matching `filter`, optionally limited to one space.
    pub fn query(
        &self,
        space: Option<&SpaceId>,
        filter: impl Fn(&ObjectRecord) -> bool,
    ) -> HeartResult<Vec<ObjectRecord>> {
        let mut out = Vec::new();
        for (k, v) in self.inner.store.iter_prefix(b"idx/")? {
            let r: ObjectRecord = serde_json::from_slice(&v).map_err(|e| {
                HeartError::kind_src(
                    ErrorKind::CorruptRecord,
                    format!("decode {}", String::from_utf8_lossy(&k)),
                    e,
                )
            })?;
            if space.is_some_and(|s| *s != r.space_id) {
                continue;
            }
            if filter(&r) {
                out.push(r);
            }
        }
        Ok(out)
    }

    /// Subscribe to details updates of `ids`.
    pub fn subscribe(
        &self,
        ids: impl IntoIterator<Item = ObjectId>,
        listener: Arc<dyn DetailsListener>,
    ) -> Subscription {
        let id = self
            .inner
            .next_sub
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.inner
            .subs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(
                id,
                Sub {
                    ids: ids.into_iter().collect(),
                    listener,
                },
            );
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Pending local details of an object not loaded anywhere.
    pub fn pending_details(&self, id: &ObjectId) -> HeartResult<Details> {
        Ok(get_json(&*self.inner.store, &pending_key(id))?.unwrap_or_default())
    }

    /// Update pending local details in place.
    pub fn update_pending_details(
        &self,
        id: &ObjectId,
        f: impl FnOnce(&mut Details),
    ) -> HeartResult<()> {
        let mut details = self.pending_details(id)?;
        f(&mut details);
        if details.is_empty() {
            self.inner.store.delete(&pending_key(id))
        } else {
            self.inner
                .store
                .write_batch(vec![put_json_op(pending_key(id), &details)?])
        }
    }

    /// Remove and return pending local details.
    pub fn take_pending_details(&self, id: &ObjectId) -> HeartResult<Details> {
        let details = self.pending_details(id)?;
        if !details.is_empty() {
            self.inner.store.delete(&pending_key(id))?;
        }
        Ok(details)
    }

    /// Set one detail directly on a record, used for derived values of
    /// objects that are not loaded.
    pub fn set_record_detail(
        &self,
        id: &ObjectId,
        key: &str,
        value: Value,
    ) -> HeartResult<()> {
        let Some(mut record) = self.get(id)? else {
            return Ok(());
        };
        record.details.set(key, value);
        self.update(record)
    }
}
