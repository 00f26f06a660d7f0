//! Object change-logs.
//!
//! Each object's log lives in the space store under three key families:
//!
//! - `c/<space>/<tree>/<change>` the signed [RawChange]
//! - `h/<space>/<tree>` the current heads
//! - `t/<space>/<tree>` the [TreeMeta] (type, creator, snapshot counter)
//!
//! [Source] is the per-object view handed to a SmartBlock. Objects of
//! virtual types get a [Source] that computes their document on demand
//! and refuses pushes.

use crate::state::State;
use ed25519_dalek::SigningKey;
use heart_api::{block::*, change::*, kv::*, *};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

mod virt;
pub use virt::{date_object_id, VirtualSource};

#[cfg(test)]
mod test;

/// Persisted per-tree metadata.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeMeta {
    /// Smartblock type from the root change.
    pub sb_type: SmartBlockType,
    /// Unique key of derived objects.
    #[serde(default)]
    pub unique_key: Option<UniqueKey>,
    /// Author of the root change.
    pub creator: AccountId,
    /// Unix seconds of the root change.
    pub created: i64,
    /// Changes pushed since the last embedded snapshot.
    #[serde(default)]
    pub since_snapshot: usize,
    /// Set once a tombstone was written.
    #[serde(default)]
    pub deleted: bool,
}

/// Author and time of an object's root change.
#[derive(Debug, Clone, PartialEq)]
pub struct CreationInfo {
    /// The creating account, none for virtual objects.
    pub creator: Option<AccountId>,
    /// Unix seconds.
    pub created: i64,
}

/// Input of [Source::push_change].
#[derive(Debug)]
pub struct PushChangeParams<'a> {
    /// The document after the change; embedded when a snapshot is due.
    pub state: &'a State,
    /// Operations of the change.
    pub changes: Vec<ChangeContent>,
    /// Unix seconds, now if unset.
    pub time: Option<i64>,
    /// Force a snapshot.
    pub do_snapshot: bool,
}

/// Announced for every change written to a log.
#[derive(Debug, Clone)]
pub struct ChangeNotice {
    /// The space.
    pub space_id: SpaceId,
    /// The object.
    pub tree_id: ObjectId,
    /// The change.
    pub change: RawChange,
    /// False for changes received from peers.
    pub local: bool,
}

/// Per-object adapter over a change-log.
pub trait Source: 'static + Send + Sync + std::fmt::Debug {
    /// Object id.
    fn id(&self) -> &ObjectId;

    /// Space id.
    fn space_id(&self) -> &SpaceId;

    /// Smartblock type.
    fn sb_type(&self) -> SmartBlockType;

    /// Unique key of derived objects.
    fn unique_key(&self) -> Option<&UniqueKey>;

    /// Virtual sources cannot be written.
    fn read_only(&self) -> bool;

    /// Materialize the document by replaying the log.
    fn read_doc(&self) -> HeartResult<State>;

    /// Sign and append a change.
    fn push_change(&self, params: PushChangeParams<'_>) -> HeartResult<ChangeId>;

    /// Append a change made only of store operations.
    fn push_store_change(
        &self,
        changes: Vec<ChangeContent>,
    ) -> HeartResult<ChangeId>;

    /// Author and time of the root change.
    fn creation_info(&self) -> HeartResult<CreationInfo>;

    /// Current heads.
    fn heads(&self) -> HeartResult<Vec<ChangeId>>;
}

/// Trait-object [Source].
pub type DynSource = Arc<dyn Source>;

fn change_key(space: &SpaceId, tree: &ObjectId, change: &ChangeId) -> Vec<u8> {
    format!("c/{space}/{tree}/{change}").into_bytes()
}

fn changes_prefix(space: &SpaceId, tree: &ObjectId) -> Vec<u8> {
    format!("c/{space}/{tree}/").into_bytes()
}

fn heads_key(space: &SpaceId, tree: &ObjectId) -> Vec<u8> {
    format!("h/{space}/{tree}").into_bytes()
}

fn meta_key(space: &SpaceId, tree: &ObjectId) -> Vec<u8> {
    format!("t/{space}/{tree}").into_bytes()
}

fn now_secs() -> i64 {
    Timestamp::now().as_unix_secs()
}

struct Inner {
    store: DynKvStore,
    key: SigningKey,
    account: AccountId,
    write_lock: Mutex<()>,
    notify: Mutex<Option<tokio::sync::mpsc::UnboundedSender<ChangeNotice>>>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceService")
            .field("account", &self.account)
            .finish()
    }
}

impl Inner {
    fn announce(&self, notice: ChangeNotice) {
        let lock = self.notify.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(s) = lock.as_ref() {
            let _ = s.send(notice);
        }
    }

    fn meta(&self, space: &SpaceId, tree: &ObjectId) -> HeartResult<Option<TreeMeta>> {
        get_json(&*self.store, &meta_key(space, tree))
    }

    fn heads(&self, space: &SpaceId, tree: &ObjectId) -> HeartResult<Vec<ChangeId>> {
        Ok(get_json(&*self.store, &heads_key(space, tree))?.unwrap_or_default())
    }

    fn load_changes(
        &self,
        space: &SpaceId,
        tree: &ObjectId,
    ) -> HeartResult<Vec<(RawChange, ChangePayload)>> {
        let mut out = Vec::new();
        for (k, v) in self.store.iter_prefix(&changes_prefix(space, tree))? {
            let raw: RawChange = serde_json::from_slice(&v).map_err(|e| {
                HeartError::kind_src(
                    ErrorKind::CorruptRecord,
                    format!("decode {}", String::from_utf8_lossy(&k)),
                    e,
                )
            })?;
            let payload = raw.verify()?;
            out.push((raw, payload));
        }
        Ok(out)
    }

    fn write_change(
        &self,
        space: &SpaceId,
        tree: &ObjectId,
        mut meta: TreeMeta,
        payload: &ChangePayload,
    ) -> HeartResult<RawChange> {
        let raw = RawChange::sign(payload, &self.key)?;
        if payload.snapshot.is_some() {
            meta.since_snapshot = 0;
        } else {
            meta.since_snapshot += 1;
        }
        if payload
            .contents
            .iter()
            .any(|c| matches!(c, ChangeContent::Tombstone))
        {
            meta.deleted = true;
        }
        self.store.write_batch(vec![
            put_json_op(change_key(space, tree, &raw.id), &raw)?,
            put_json_op(heads_key(space, tree), &vec![raw.id.clone()])?,
            put_json_op(meta_key(space, tree), &meta)?,
        ])?;
        self.announce(ChangeNotice {
            space_id: space.clone(),
            tree_id: tree.clone(),
            change: raw.clone(),
            local: true,
        });
        Ok(raw)
    }
}

/// Deterministic topological order: a change comes after all of its
/// prevs, ties are broken by change id.
fn topo_order(changes: &[(RawChange, ChangePayload)]) -> Vec<usize> {
    let by_id: HashMap<&ChangeId, usize> = changes
        .iter()
        .enumerate()
        .map(|(i, (r, _))| (&r.id, i))
        .collect();
    let mut indegree = vec![0usize; changes.len()];
    let mut next: Vec<Vec<usize>> = vec![Vec::new(); changes.len()];
    for (i, (_, p)) in changes.iter().enumerate() {
        for prev in p.prev.iter() {
            if let Some(&j) = by_id.get(prev) {
                indegree[i] += 1;
                next[j].push(i);
            }
        }
    }
    let mut ready: BTreeSet<(&ChangeId, usize)> = indegree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| (&changes[i].0.id, i))
        .collect();
    let mut out = Vec::with_capacity(changes.len());
    while let Some(first) = ready.iter().next().copied() {
        ready.remove(&first);
        let i = first.1;
        out.push(i);
        for &n in next[i].iter() {
            indegree[n] -= 1;
            if indegree[n] == 0 {
                ready.insert((&changes[n].0.id, n));
            }
        }
    }
    out
}

fn ancestors(
    changes: &[(RawChange, ChangePayload)],
    by_id: &HashMap<ChangeId, usize>,
    of: usize,
) -> BTreeSet<usize> {
    let mut out = BTreeSet::new();
    let mut stack = vec![of];
    while let Some(i) = stack.pop() {
        for prev in changes[i].1.prev.iter() {
            if let Some(&j) = by_id.get(prev) {
                if out.insert(j) {
                    stack.push(j);
                }
            }
        }
    }
    out
}

/// Replay a verified change set into a document.
fn replay(
    id: &ObjectId,
    space: &SpaceId,
    meta: &TreeMeta,
    changes: &[(RawChange, ChangePayload)],
) -> HeartResult<State> {
    let order = topo_order(changes);
    if order.is_empty() {
        return Err(HeartError::not_found(format!("object {id} has no changes")));
    }
    let by_id: HashMap<ChangeId, usize> = changes
        .iter()
        .enumerate()
        .map(|(i, (r, _))| (r.id.clone(), i))
        .collect();

    // the latest snapshot that every earlier change leads to
    let mut start = None;
    for (pos, &i) in order.iter().enumerate().rev() {
        if changes[i].1.snapshot.is_none() {
            continue;
        }
        let anc = ancestors(changes, &by_id, i);
        if order[..pos].iter().all(|j| anc.contains(j)) {
            start = Some(pos);
            break;
        }
    }
    let Some(start) = start else {
        return Err(HeartError::corrupt_record(format!(
            "object {id} has no usable snapshot"
        )));
    };

    let first = &changes[order[start]].1;
    let mut state = State::from_snapshot(
        id.clone(),
        space.clone(),
        meta.sb_type,
        first.snapshot.clone().unwrap_or_default(),
    );
    state.set_unique_key(meta.unique_key.clone());
    for &i in order[start + 1..].iter() {
        for c in changes[i].1.contents.iter() {
            state.apply_change(c);
        }
    }
    if let Some(&last) = order.last() {
        state.set_change_id(Some(changes[last].0.id.clone()));
    }
    if state.is_tombstone() {
        return Err(HeartError::not_found(format!("object {id} is deleted")));
    }
    Ok(state)
}

/// The creation and lookup service for change-log backed sources.
#[derive(Debug, Clone)]
pub struct SourceService {
    inner: Arc<Inner>,
}

impl SourceService {
    /// Construct over a space store, signing with the account key.
    pub fn new(store: DynKvStore, key: SigningKey) -> Self {
        let account = crate::wallet::account_id_of(&key);
        Self {
            inner: Arc::new(Inner {
                store,
                key,
                account,
                write_lock: Mutex::new(()),
                notify: Mutex::new(None),
            }),
        }
    }

    /// The signing account.
    pub fn account(&self) -> &AccountId {
        &self.inner.account
    }

    /// Receive a [ChangeNotice] for every change written from now on.
    /// Replaces an earlier receiver.
    pub fn subscribe_changes(
        &self,
    ) -> tokio::sync::mpsc::UnboundedReceiver<ChangeNotice> {
        let (s, r) = tokio::sync::mpsc::unbounded_channel();
        *self.inner.notify.lock().unwrap_or_else(|p| p.into_inner()) = Some(s);
        r
    }

    /// Id of a new object. Derived objects hash their unique key, others a
    /// random seed.
    pub fn new_object_id(
        space: &SpaceId,
        unique_key: Option<&UniqueKey>,
    ) -> (ObjectId, String) {
        match unique_key {
            Some(uk) if uk.sb_type.is_virtual() => {
                (ObjectId::from(uk.marshal()), String::new())
            }
            Some(uk) => (uk.derive_object_id(space), String::new()),
            None => {
                let seed = hex::encode(rand::random::<[u8; 16]>());
                let hash = hash_parts(&[
                    b"heart-object",
                    space.as_bytes(),
                    seed.as_bytes(),
                ]);
                (
                    ObjectId::from(format!("bafy{}", hex::encode(&hash[..24]))),
                    seed,
                )
            }
        }
    }

    /// Open the source of an existing object.
    pub fn new_source(
        &self,
        space: &SpaceId,
        id: &ObjectId,
    ) -> HeartResult<DynSource> {
        if let Some(v) = VirtualSource::for_id(space, id)? {
            return Ok(Arc::new(v));
        }
        let meta = self
            .inner
            .meta(space, id)?
            .ok_or_else(|| HeartError::not_found(format!("object {id}")))?;
        if meta.deleted {
            return Err(HeartError::not_found(format!("object {id} is deleted")));
        }
        Ok(Arc::new(TreeSource {
            inner: self.inner.clone(),
            id: id.clone(),
            space_id: space.clone(),
            meta,
        }))
    }

    /// Create a new object whose first change embeds `state`.
    ///
    /// `state` must carry the id from [SourceService::new_object_id] and
    /// the seed is stored in the root change.
    pub fn create_tree(
        &self,
        state: &State,
        seed: String,
    ) -> HeartResult<DynSource> {
        self.create_tree_at(state, seed, now_secs())
    }

    /// Create a derived object whose root change is the same on every
    /// device: no seed and a zero timestamp, so independently created
    /// copies share one change id.
    pub fn create_predefined_tree(&self, state: &State) -> HeartResult<DynSource> {
        if state.unique_key().is_none() {
            return Err(HeartError::bad_input(format!(
                "predefined object {} needs a unique key",
                state.id()
            )));
        }
        self.create_tree_at(state, String::new(), 0)
    }

    fn create_tree_at(
        &self,
        state: &State,
        seed: String,
        created: i64,
    ) -> HeartResult<DynSource> {
        let space = state.space_id();
        let id = state.id();
        if state.sb_type().is_virtual() {
            return Err(HeartError::kind(
                ErrorKind::Restricted,
                "virtual objects are not stored",
            ));
        }
        let _g = self
            .inner
            .write_lock
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if let Some(meta) = self.inner.meta(space, id)? {
            return Err(HeartError::kind(
                ErrorKind::AlreadyExists,
                format!(
                    "object {id} exists{}",
                    if meta.deleted { " (deleted)" } else { "" }
                ),
            ));
        }
        let meta = TreeMeta {
            sb_type: state.sb_type(),
            unique_key: state.unique_key().cloned(),
            creator: self.inner.account.clone(),
            created,
            since_snapshot: 0,
            deleted: false,
        };
        let payload = ChangePayload {
            tree_id: id.clone(),
            space_id: space.clone(),
            prev: Vec::new(),
            account: self.inner.account.clone(),
            timestamp: created,
            root: Some(RootInfo {
                sb_type: state.sb_type(),
                unique_key: state.unique_key().cloned(),
                seed,
            }),
            snapshot: Some(state.to_snapshot()),
            contents: Vec::new(),
        };
        self.inner.write_change(space, id, meta.clone(), &payload)?;
        tracing::debug!(%space, %id, sb_type = ?meta.sb_type, "tree created");
        Ok(Arc::new(TreeSource {
            inner: self.inner.clone(),
            id: id.clone(),
            space_id: space.clone(),
            meta,
        }))
    }

    /// Append a tombstone to an object's log.
    pub fn delete_tree(&self, space: &SpaceId, id: &ObjectId) -> HeartResult<()> {
        let _g = self
            .inner
            .write_lock
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let meta = self
            .inner
            .meta(space, id)?
            .ok_or_else(|| HeartError::not_found(format!("object {id}")))?;
        if meta.deleted {
            return Ok(());
        }
        let payload = ChangePayload {
            tree_id: id.clone(),
            space_id: space.clone(),
            prev: self.inner.heads(space, id)?,
            account: self.inner.account.clone(),
            timestamp: now_secs(),
            root: None,
            snapshot: None,
            contents: vec![ChangeContent::Tombstone],
        };
        self.inner.write_change(space, id, meta, &payload)?;
        tracing::info!(%space, %id, "tree deleted");
        Ok(())
    }

    /// Metadata of a stored object.
    pub fn tree_meta(
        &self,
        space: &SpaceId,
        id: &ObjectId,
    ) -> HeartResult<Option<TreeMeta>> {
        self.inner.meta(space, id)
    }

    /// All objects stored for a space, deleted ones included.
    pub fn tree_ids(&self, space: &SpaceId) -> HeartResult<Vec<ObjectId>> {
        let prefix = format!("t/{space}/");
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

    /// Heads of every object of a space.
    pub fn all_heads(
        &self,
        space: &SpaceId,
    ) -> HeartResult<BTreeMap<ObjectId, Vec<ChangeId>>> {
        let mut out = BTreeMap::new();
        for id in self.tree_ids(space)? {
            let heads = self.inner.heads(space, &id)?;
            out.insert(id, heads);
        }
        Ok(out)
    }

    /// Heads of one object.
    pub fn heads(
        &self,
        space: &SpaceId,
        id: &ObjectId,
    ) -> HeartResult<Vec<ChangeId>> {
        self.inner.heads(space, id)
    }

    /// Changes of an object not in `known`, in replay order.
    pub fn changes_after(
        &self,
        space: &SpaceId,
        id: &ObjectId,
        known: &[ChangeId],
    ) -> HeartResult<Vec<RawChange>> {
        let changes = self.inner.load_changes(space, id)?;
        let known: BTreeSet<&ChangeId> = known.iter().collect();
        Ok(topo_order(&changes)
            .into_iter()
            .map(|i| &changes[i].0)
            .filter(|r| !known.contains(&r.id))
            .cloned()
            .collect())
    }

    /// True if the change is stored.
    pub fn has_change(
        &self,
        space: &SpaceId,
        id: &ObjectId,
        change: &ChangeId,
    ) -> HeartResult<bool> {
        Ok(self.inner.store.get(&change_key(space, id, change))?.is_some())
    }

    /// Store a change received from a peer.
    ///
    /// Returns false when the change was already known. A change whose
    /// prevs are not all stored is refused with [ErrorKind::NotFound] so
    /// the caller fetches the missing part first.
    pub fn apply_remote_change(
        &self,
        space: &SpaceId,
        raw: &RawChange,
    ) -> HeartResult<bool> {
        let payload = raw.verify()?;
        if &payload.space_id != space {
            return Err(HeartError::bad_input(format!(
                "change {} belongs to space {}",
                raw.id, payload.space_id
            )));
        }
        let tree = payload.tree_id.clone();
        let _g = self
            .inner
            .write_lock
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if self.inner.store.get(&change_key(space, &tree, &raw.id))?.is_some() {
            return Ok(false);
        }

        let mut meta = match (self.inner.meta(space, &tree)?, &payload.root) {
            (None, Some(root)) => {
                if !payload.prev.is_empty() || payload.snapshot.is_none() {
                    return Err(HeartError::corrupt_record(format!(
                        "root change {} with prevs or without snapshot",
                        raw.id
                    )));
                }
                TreeMeta {
                    sb_type: root.sb_type,
                    unique_key: root.unique_key.clone(),
                    creator: payload.account.clone(),
                    created: payload.timestamp,
                    since_snapshot: 0,
                    deleted: false,
                }
            }
            (Some(_), Some(_)) => {
                return Err(HeartError::kind(
                    ErrorKind::AlreadyExists,
                    format!("second root change for {tree}"),
                ));
            }
            (None, None) => {
                return Err(HeartError::not_found(format!(
                    "root of {tree} not stored"
                )));
            }
            (Some(meta), None) => meta,
        };
        for prev in payload.prev.iter() {
            if self.inner.store.get(&change_key(space, &tree, prev))?.is_none() {
                return Err(HeartError::not_found(format!(
                    "prev {prev} of {} not stored",
                    raw.id
                )));
            }
        }

        let mut heads: Vec<ChangeId> = self
            .inner
            .heads(space, &tree)?
            .into_iter()
            .filter(|h| !payload.prev.contains(h))
            .collect();
        heads.push(raw.id.clone());
        heads.sort();
        if payload.snapshot.is_some() {
            meta.since_snapshot = 0;
        } else {
            meta.since_snapshot += 1;
        }
        if payload
            .contents
            .iter()
            .any(|c| matches!(c, ChangeContent::Tombstone))
        {
            meta.deleted = true;
        }
        self.inner.store.write_batch(vec![
            put_json_op(change_key(space, &tree, &raw.id), raw)?,
            put_json_op(heads_key(space, &tree), &heads)?,
            put_json_op(meta_key(space, &tree), &meta)?,
        ])?;
        self.inner.announce(ChangeNotice {
            space_id: space.clone(),
            tree_id: tree,
            change: raw.clone(),
            local: false,
        });
        Ok(true)
    }
}

#[derive(Debug)]
struct TreeSource {
    inner: Arc<Inner>,
    id: ObjectId,
    space_id: SpaceId,
    meta: TreeMeta,
}

impl TreeSource {
    fn push(
        &self,
        changes: Vec<ChangeContent>,
        state: Option<&State>,
        force_snapshot: bool,
        time: Option<i64>,
    ) -> HeartResult<ChangeId> {
        let _g = self
            .inner
            .write_lock
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let meta = self.inner.meta(&self.space_id, &self.id)?.ok_or_else(|| {
            HeartError::not_found(format!("object {}", self.id))
        })?;
        if meta.deleted {
            return Err(HeartError::not_found(format!(
                "object {} is deleted",
                self.id
            )));
        }
        let due = force_snapshot || meta.since_snapshot + 1 >= SNAPSHOT_EVERY;
        let payload = ChangePayload {
            tree_id: self.id.clone(),
            space_id: self.space_id.clone(),
            prev: self.inner.heads(&self.space_id, &self.id)?,
            account: self.inner.account.clone(),
            timestamp: time.unwrap_or_else(now_secs),
            root: None,
            snapshot: state.filter(|_| due).map(|s| s.to_snapshot()),
            contents: changes,
        };
        Ok(self
            .inner
            .write_change(&self.space_id, &self.id, meta, &payload)?
            .id)
    }
}

impl Source for TreeSource {
    fn id(&self) -> &ObjectId {
        &self.id
    }

    fn space_id(&self) -> &SpaceId {
        &self.space_id
    }

    fn sb_type(&self) -> SmartBlockType {
        self.meta.sb_type
    }

    fn unique_key(&self) -> Option<&UniqueKey> {
        self.meta.unique_key.as_ref()
    }

    fn read_only(&self) -> bool {
        false
    }

    fn read_doc(&self) -> HeartResult<State> {
        let changes = self.inner.load_changes(&self.space_id, &self.id)?;
        replay(&self.id, &self.space_id, &self.meta, &changes)
    }

    fn push_change(&self, params: PushChangeParams<'_>) -> HeartResult<ChangeId> {
        self.push(
            params.changes,
            Some(params.state),
            params.do_snapshot,
            params.time,
        )
    }

    fn push_store_change(
        &self,
        changes: Vec<ChangeContent>,
    ) -> HeartResult<ChangeId> {
        if !changes.iter().all(|c| {
            matches!(
                c,
                ChangeContent::StoreKeySet { .. }
                    | ChangeContent::StoreKeyUnset { .. }
            )
        }) {
            return Err(HeartError::bad_input(
                "store change with non-store operations",
            ));
        }
        self.push(changes, None, false, None)
    }

    fn creation_info(&self) -> HeartResult<CreationInfo> {
        Ok(CreationInfo {
            creator: Some(self.meta.creator.clone()),
            created: self.meta.created,
        })
    }

    fn heads(&self) -> HeartResult<Vec<ChangeId>> {
        self.inner.heads(&self.space_id, &self.id)
    }
}

/// A text block for titles of computed documents.
pub(crate) fn title_block(id: &str, text: &str) -> Block {
    let mut b = Block::text(id, text);
    if let Some(t) = b.as_text_mut() {
        t.style = TextStyle::Title;
    }
    b
}
