//! The working copy of an object.
//!
//! A [State] owns a block arena keyed by block id, the stored and local
//! detail maps, the object type keys, relation links and the store of
//! change-set-backed sub-documents. Editing happens on a child state
//! obtained with [State::new_state]; [State::apply_state] diffs the child
//! against its parent and yields the events for subscribers plus the
//! change contents to push into the change-log.

use heart_api::{block::*, change::*, event::EventMessage, *};
use std::collections::{BTreeMap, BTreeSet};

#[cfg(test)]
mod test;

/// A snippet is extended until it has at least this many chars.
pub const SNIPPET_MIN: usize = 100;

/// A snippet never has more than this many chars.
pub const SNIPPET_MAX: usize = 300;

/// Where [State::insert_to] places blocks relative to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// Before the target, same parent.
    Top,
    /// After the target, same parent.
    Bottom,
    /// Appended to the target's children.
    Inner,
    /// In place of the target, which is unlinked.
    Replace,
}

/// Cursor position recorded with undo frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caret {
    /// The focused block.
    pub block_id: String,
    /// Selection start and end in chars.
    pub range: (u32, u32),
}

/// Result of [State::apply_state].
#[derive(Debug)]
pub struct Applied {
    /// The new base state. Has no parent.
    pub state: State,
    /// Messages for subscribers.
    pub events: Vec<EventMessage>,
    /// Contents for the change-log.
    pub changes: Vec<ChangeContent>,
}

/// An object's document.
#[derive(Debug, Clone)]
pub struct State {
    id: ObjectId,
    space_id: SpaceId,
    sb_type: SmartBlockType,
    unique_key: Option<UniqueKey>,
    blocks: BTreeMap<String, Block>,
    details: Details,
    local_details: Details,
    object_type_keys: Vec<String>,
    relation_links: Vec<RelationLink>,
    store: BTreeMap<String, Value>,
    internal_flags: BTreeSet<String>,
    tombstone: bool,
    change_id: Option<ChangeId>,
    session: Option<SessionId>,
    caret: Option<Caret>,
    active: BTreeSet<String>,
    parent: Option<Box<State>>,
}

impl State {
    /// An empty document holding only the root block.
    pub fn new(id: ObjectId, space_id: SpaceId, sb_type: SmartBlockType) -> Self {
        let mut blocks = BTreeMap::new();
        blocks.insert(
            id.to_string(),
            Block::new(id.to_string(), BlockContent::Smartblock),
        );
        Self {
            id,
            space_id,
            sb_type,
            unique_key: None,
            blocks,
            details: Details::default(),
            local_details: Details::default(),
            object_type_keys: Vec::new(),
            relation_links: Vec::new(),
            store: BTreeMap::new(),
            internal_flags: BTreeSet::new(),
            tombstone: false,
            change_id: None,
            session: None,
            caret: None,
            active: BTreeSet::new(),
            parent: None,
        }
    }

    /// Rebuild a document from a persisted snapshot.
    pub fn from_snapshot(
        id: ObjectId,
        space_id: SpaceId,
        sb_type: SmartBlockType,
        snapshot: Snapshot,
    ) -> Self {
        let mut out = Self::new(id, space_id, sb_type);
        for b in snapshot.blocks {
            out.blocks.insert(b.id.clone(), b);
        }
        out.details = snapshot.details;
        out.object_type_keys = snapshot.object_types;
        out.relation_links = snapshot.relation_links;
        out.store = snapshot.store;
        out.migrate_object_type_ids_to_keys();
        out
    }

    /// The persisted form of this document.
    pub fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            blocks: self.blocks.values().cloned().collect(),
            details: self.details.clone(),
            object_types: self.object_type_keys.clone(),
            relation_links: self.relation_links.clone(),
            store: self.store.clone(),
        }
    }

    /// Older snapshots recorded type object ids (`_otpage`) or marshalled
    /// unique keys (`ot-page`) instead of bare type keys.
    fn migrate_object_type_ids_to_keys(&mut self) {
        let keys = std::mem::take(&mut self.object_type_keys);
        for k in keys {
            let k = if let Some(rest) = k.strip_prefix("_ot") {
                rest.to_string()
            } else if let Some(rest) = k.strip_prefix("ot-") {
                rest.to_string()
            } else {
                k
            };
            if !k.is_empty() && !self.object_type_keys.contains(&k) {
                self.object_type_keys.push(k);
            }
        }
    }

    /// Derive a child working state.
    pub fn new_state(&self) -> State {
        let mut child = self.clone();
        child.active.clear();
        child.parent = Some(Box::new(self.clone()));
        child
    }

    /// Same as [State::new_state], recording the session that edits.
    pub fn new_state_ctx(&self, session: Option<SessionId>) -> State {
        let mut child = self.new_state();
        child.session = session;
        child
    }

    /// A child of `self` whose content is replaced by `version`.
    ///
    /// Local details and the change id stay those of `self`.
    pub fn new_state_from(&self, version: &State) -> State {
        let mut child = version.clone();
        child.active.clear();
        child.local_details = self.local_details.clone();
        child.change_id = self.change_id.clone();
        child.parent = Some(Box::new(self.clone()));
        child
    }

    /// The parent this state was derived from.
    pub fn parent(&self) -> Option<&State> {
        self.parent.as_deref()
    }

    /// Object id. Also the root block id.
    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    /// Root block id.
    pub fn root_id(&self) -> &str {
        self.id.as_str()
    }

    /// The space of the object.
    pub fn space_id(&self) -> &SpaceId {
        &self.space_id
    }

    /// Smartblock type.
    pub fn sb_type(&self) -> SmartBlockType {
        self.sb_type
    }

    /// Unique key of derived objects.
    pub fn unique_key(&self) -> Option<&UniqueKey> {
        self.unique_key.as_ref()
    }

    /// Set the unique key.
    pub fn set_unique_key(&mut self, key: Option<UniqueKey>) {
        self.unique_key = key;
    }

    /// The session editing this state.
    pub fn session(&self) -> Option<&SessionId> {
        self.session.as_ref()
    }

    /// Last applied change.
    pub fn change_id(&self) -> Option<&ChangeId> {
        self.change_id.as_ref()
    }

    /// Record the last applied change.
    pub fn set_change_id(&mut self, id: Option<ChangeId>) {
        self.change_id = id;
    }

    /// The caret to remember with the next history frame.
    pub fn caret(&self) -> Option<&Caret> {
        self.caret.as_ref()
    }

    /// Set the caret.
    pub fn set_caret(&mut self, caret: Option<Caret>) {
        self.caret = caret;
    }

    /// True once a tombstone change was applied.
    pub fn is_tombstone(&self) -> bool {
        self.tombstone
    }

    /// Mark this state as deleted. The tombstone is pushed with the next
    /// apply.
    pub fn set_tombstone(&mut self) {
        self.tombstone = true;
    }

    // -- blocks

    /// Read a block without marking it.
    pub fn pick(&self, id: &str) -> Option<&Block> {
        self.blocks.get(id)
    }

    /// Get a block for editing. The block is marked active.
    pub fn get(&mut self, id: &str) -> Option<&mut Block> {
        let b = self.blocks.get_mut(id)?;
        self.active.insert(id.to_string());
        Some(b)
    }

    /// Blocks fetched with [State::get] since this state was derived.
    pub fn active_block_ids(&self) -> impl Iterator<Item = &str> {
        self.active.iter().map(|s| s.as_str())
    }

    /// True if the arena holds `id`.
    pub fn exists(&self, id: &str) -> bool {
        self.blocks.contains_key(id)
    }

    /// Put a new block into the arena. It is not linked anywhere until
    /// [State::insert_to]. Returns false if the id is taken.
    pub fn add(&mut self, block: Block) -> bool {
        if self.blocks.contains_key(&block.id) {
            return false;
        }
        self.blocks.insert(block.id.clone(), block);
        true
    }

    /// Overwrite a block, keeping its position in the tree.
    pub fn set(&mut self, block: Block) {
        self.active.insert(block.id.clone());
        self.blocks.insert(block.id.clone(), block);
    }

    /// The parent block of `id`.
    pub fn parent_of(&self, id: &str) -> Option<&Block> {
        self.blocks
            .values()
            .find(|b| b.children_ids.iter().any(|c| c == id))
    }

    /// Detach a block from its parent. The block stays in the arena and
    /// is dropped on apply if nothing relinks it.
    pub fn unlink(&mut self, id: &str) -> bool {
        let Some(parent) = self.parent_of(id).map(|b| b.id.clone()) else {
            return false;
        };
        if let Some(p) = self.blocks.get_mut(&parent) {
            p.children_ids.retain(|c| c != id);
        }
        true
    }

    /// Detach and delete a block with all its descendants.
    pub fn remove(&mut self, id: &str) -> bool {
        if id == self.root_id() || !self.blocks.contains_key(id) {
            return false;
        }
        self.unlink(id);
        let mut stack = vec![id.to_string()];
        while let Some(id) = stack.pop() {
            if let Some(b) = self.blocks.remove(&id) {
                stack.extend(b.children_ids);
            }
        }
        true
    }

    /// Link `ids` relative to `target`. An empty target means the root.
    /// Blocks already linked elsewhere are moved.
    pub fn insert_to(
        &mut self,
        target: &str,
        pos: Position,
        ids: &[String],
    ) -> HeartResult<()> {
        let target = if target.is_empty() {
            self.root_id().to_string()
        } else {
            target.to_string()
        };
        if !self.blocks.contains_key(&target) {
            return Err(HeartError::not_found(format!("block {target}")));
        }
        for id in ids {
            if !self.blocks.contains_key(id) {
                return Err(HeartError::not_found(format!("block {id}")));
            }
            if *id == target {
                return Err(HeartError::bad_input("block inserted at itself"));
            }
        }
        if pos != Position::Inner && self.parent_of(&target).is_none() {
            return Err(HeartError::bad_input(format!(
                "block {target} has no parent"
            )));
        }
        for id in ids {
            self.unlink(id);
        }

        if pos == Position::Inner {
            if let Some(t) = self.blocks.get_mut(&target) {
                t.children_ids.extend(ids.iter().cloned());
            }
            return Ok(());
        }

        let parent = self
            .parent_of(&target)
            .map(|b| b.id.clone())
            .ok_or_else(|| {
                HeartError::bad_input(format!("block {target} has no parent"))
            })?;
        let Some(p) = self.blocks.get_mut(&parent) else {
            return Err(HeartError::not_found(format!("block {parent}")));
        };
        let Some(at) = p.children_ids.iter().position(|c| *c == target) else {
            return Err(HeartError::not_found(format!("block {target}")));
        };
        let range = match pos {
            Position::Top => at..at,
            Position::Bottom => at + 1..at + 1,
            Position::Replace => at..at + 1,
            Position::Inner => return Ok(()),
        };
        p.children_ids.splice(range, ids.iter().cloned());
        Ok(())
    }

    /// Depth-first pre-order walk from the root. Stops when `f` returns
    /// false.
    pub fn iterate(&self, mut f: impl FnMut(&Block) -> bool) {
        let mut stack = vec![self.root_id()];
        while let Some(id) = stack.pop() {
            let Some(b) = self.blocks.get(id) else {
                continue;
            };
            if !f(b) {
                return;
            }
            stack.extend(b.children_ids.iter().rev().map(|s| s.as_str()));
        }
    }

    /// Number of blocks in the arena.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Drop blocks that are not reachable from the root and child ids
    /// that point nowhere.
    fn normalize(&mut self) {
        let mut reachable = BTreeSet::new();
        self.iterate(|b| {
            reachable.insert(b.id.clone());
            true
        });
        self.blocks.retain(|id, _| reachable.contains(id));
        let ids: BTreeSet<String> = self.blocks.keys().cloned().collect();
        for b in self.blocks.values_mut() {
            b.children_ids.retain(|c| ids.contains(c));
        }
    }

    // -- details

    /// Stored details.
    pub fn details(&self) -> &Details {
        &self.details
    }

    /// Local details.
    pub fn local_details(&self) -> &Details {
        &self.local_details
    }

    /// Stored and local details together.
    pub fn combined_details(&self) -> Details {
        self.details.merged(&self.local_details)
    }

    /// Read a detail from either map.
    pub fn get_detail(&self, key: &str) -> Option<&Value> {
        self.local_details.get(key).or_else(|| self.details.get(key))
    }

    /// Set a detail. Local keys are routed to the local map.
    pub fn set_detail(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        if bundle::is_local(&key) {
            self.local_details.set(key, value);
        } else {
            self.details.set(key, value);
        }
    }

    /// Set a local detail.
    pub fn set_local_detail(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) {
        self.local_details.set(key, value);
    }

    /// Set several details.
    pub fn set_details(&mut self, details: &Details) {
        for (k, v) in details.iter() {
            self.set_detail(k.clone(), v.clone());
        }
    }

    /// Remove a detail from both maps.
    pub fn remove_detail(&mut self, key: &str) {
        self.details.remove(key);
        self.local_details.remove(key);
    }

    /// Record the last modification.
    pub fn set_last_modified(&mut self, unix_secs: i64, by: &AccountId) {
        self.local_details
            .set(bundle::LAST_MODIFIED_DATE, unix_secs);
        self.local_details
            .set(bundle::LAST_MODIFIED_BY, by.to_string());
    }

    // -- schema

    /// The primary object type key.
    pub fn object_type_key(&self) -> Option<&str> {
        self.object_type_keys.first().map(|s| s.as_str())
    }

    /// All object type keys.
    pub fn object_type_keys(&self) -> &[String] {
        &self.object_type_keys
    }

    /// Replace the object type keys.
    pub fn set_object_type_keys(&mut self, keys: Vec<String>) {
        self.object_type_keys = keys;
    }

    /// Relation links.
    pub fn relation_links(&self) -> &[RelationLink] {
        &self.relation_links
    }

    /// True if a link with `key` exists.
    pub fn has_relation(&self, key: &str) -> bool {
        self.relation_links.iter().any(|l| l.key == key)
    }

    /// Add links whose keys are not yet present.
    pub fn add_relation_links(&mut self, links: &[RelationLink]) {
        for l in links {
            if !self.has_relation(&l.key) {
                self.relation_links.push(l.clone());
            }
        }
    }

    /// Remove links by key.
    pub fn remove_relation_keys(&mut self, keys: &[String]) {
        self.relation_links.retain(|l| !keys.contains(&l.key));
    }

    // -- store

    /// The store of sub-document values.
    pub fn store(&self) -> &BTreeMap<String, Value> {
        &self.store
    }

    /// Set a store value.
    pub fn set_in_store(&mut self, path: impl Into<String>, value: Value) {
        self.store.insert(path.into(), value);
    }

    /// Remove a store value.
    pub fn remove_from_store(&mut self, path: &str) -> Option<Value> {
        self.store.remove(path)
    }

    // -- internal flags

    /// Add a transient marker.
    pub fn add_internal_flag(&mut self, flag: impl Into<String>) {
        self.internal_flags.insert(flag.into());
    }

    /// True if the marker is present.
    pub fn has_internal_flag(&self, flag: &str) -> bool {
        self.internal_flags.contains(flag)
    }

    /// Remove every marker.
    pub fn clear_internal_flags(&mut self) {
        self.internal_flags.clear();
    }

    // -- text

    /// Leading text of the body, title and description excluded.
    pub fn snippet(&self) -> String {
        let mut out = String::new();
        self.iterate(|b| {
            if let Some(t) = b.as_text() {
                if matches!(t.style, TextStyle::Title | TextStyle::Description)
                {
                    return true;
                }
                let text = t.text.trim();
                if text.is_empty() {
                    return true;
                }
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
            out.chars().count() < SNIPPET_MIN
        });
        if out.chars().count() > SNIPPET_MAX {
            out = out.chars().take(SNIPPET_MAX).collect();
        }
        out
    }

    /// All text of the object, for full-text search.
    pub fn search_text(&self) -> String {
        let mut parts = Vec::new();
        self.iterate(|b| {
            if let Some(t) = b.as_text() {
                if !t.text.trim().is_empty() {
                    parts.push(t.text.trim().to_string());
                }
            }
            true
        });
        parts.join("\n")
    }

    /// Object ids linked from blocks, in tree order, without duplicates.
    pub fn link_ids(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.iterate(|b| {
            for t in b.link_targets() {
                if !out.contains(&t) {
                    out.push(t);
                }
            }
            true
        });
        out
    }

    /// Object ids mentioned in text, in tree order, without duplicates.
    pub fn mention_ids(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.iterate(|b| {
            for t in b.mention_targets() {
                if !out.contains(&t) {
                    out.push(t);
                }
            }
            true
        });
        out
    }

    // -- changes

    /// Apply one change content during replay.
    pub fn apply_change(&mut self, content: &ChangeContent) {
        match content {
            ChangeContent::BlockSet { block } => {
                self.blocks.insert(block.id.clone(), block.clone());
            }
            ChangeContent::BlockRemove { id } => {
                if id != self.root_id() {
                    self.blocks.remove(id);
                }
            }
            ChangeContent::DetailsSet { key, value } => {
                self.details.set(key.clone(), value.clone());
            }
            ChangeContent::DetailsUnset { key } => {
                self.details.remove(key);
            }
            ChangeContent::ObjectTypeAdd { key } => {
                if !self.object_type_keys.contains(key) {
                    self.object_type_keys.push(key.clone());
                }
            }
            ChangeContent::ObjectTypeRemove { key } => {
                self.object_type_keys.retain(|k| k != key);
            }
            ChangeContent::RelationAdd { links } => {
                self.add_relation_links(links);
            }
            ChangeContent::RelationRemove { keys } => {
                self.remove_relation_keys(keys);
            }
            ChangeContent::StoreKeySet { path, value } => {
                self.store.insert(path.clone(), value.clone());
            }
            ChangeContent::StoreKeyUnset { path } => {
                self.store.remove(path);
            }
            ChangeContent::Tombstone => self.tombstone = true,
        }
    }

    /// True when applying this state would change nothing.
    pub fn is_unchanged(&self) -> bool {
        match &self.parent {
            None => true,
            Some(p) => {
                let mut me = self.clone();
                me.parent = None;
                me.normalize();
                let (events, changes) = diff(p, &me);
                events.is_empty() && changes.is_empty()
            }
        }
    }

    /// Events and changes turning `self` into `other`.
    pub fn diff(&self, other: &State) -> (Vec<EventMessage>, Vec<ChangeContent>) {
        diff(self, other)
    }

    /// Fold this state into its parent.
    ///
    /// When the parent is a base state (it has no parent itself) the
    /// result is the new base plus the events and changes between the
    /// two. When the parent is itself derived, the edits are merged into
    /// it without producing events: the outer apply will report them.
    pub fn apply_state(mut self) -> HeartResult<Applied> {
        let Some(parent) = self.parent.take() else {
            return Err(HeartError::other("apply on a state without parent"));
        };
        self.normalize();

        if parent.parent.is_some() {
            let grand = parent.parent;
            self.parent = grand;
            self.session = parent.session.clone().or(self.session);
            return Ok(Applied {
                state: self,
                events: Vec::new(),
                changes: Vec::new(),
            });
        }

        let (events, changes) = diff(&parent, &self);
        if changes.iter().any(|c| matches!(c, ChangeContent::Tombstone)) {
            self.tombstone = true;
        }
        self.active.clear();
        self.session = None;
        Ok(Applied {
            state: self,
            events,
            changes,
        })
    }
}

fn diff(before: &State, after: &State) -> (Vec<EventMessage>, Vec<ChangeContent>) {
    let mut events = Vec::new();
    let mut changes = Vec::new();

    // blocks
    let mut added = Vec::new();
    let mut updates = Vec::new();
    for (id, b) in after.blocks.iter() {
        match before.blocks.get(id) {
            None => {
                added.push(b.clone());
                changes.push(ChangeContent::BlockSet { block: b.clone() });
            }
            Some(old) if old != b => {
                updates.extend(old.diff(b));
                changes.push(ChangeContent::BlockSet { block: b.clone() });
            }
            Some(_) => (),
        }
    }
    let removed: Vec<String> = before
        .blocks
        .keys()
        .filter(|id| !after.blocks.contains_key(*id))
        .cloned()
        .collect();
    if !added.is_empty() {
        events.push(EventMessage::BlockAdd { blocks: added });
    }
    events.extend(updates);
    if !removed.is_empty() {
        for id in removed.iter() {
            changes.push(ChangeContent::BlockRemove { id: id.clone() });
        }
        events.push(EventMessage::BlockDelete { block_ids: removed });
    }

    // details
    let stored = before.details.diff(&after.details);
    let local = before.local_details.diff(&after.local_details);
    for (key, value) in stored.set.iter() {
        changes.push(ChangeContent::DetailsSet {
            key: key.clone(),
            value: value.clone(),
        });
    }
    for key in stored.unset.iter() {
        changes.push(ChangeContent::DetailsUnset { key: key.clone() });
    }
    let mut amend = stored.set;
    amend.extend(local.set);
    let mut unset = stored.unset;
    unset.extend(local.unset);
    if !amend.is_empty() {
        events.push(EventMessage::ObjectDetailsAmend {
            id: after.id.clone(),
            details: amend,
        });
    }
    if !unset.is_empty() {
        events.push(EventMessage::ObjectDetailsUnset {
            id: after.id.clone(),
            keys: unset,
        });
    }

    // object types
    for k in after.object_type_keys.iter() {
        if !before.object_type_keys.contains(k) {
            changes.push(ChangeContent::ObjectTypeAdd { key: k.clone() });
        }
    }
    for k in before.object_type_keys.iter() {
        if !after.object_type_keys.contains(k) {
            changes.push(ChangeContent::ObjectTypeRemove { key: k.clone() });
        }
    }

    // relation links
    let new_links: Vec<RelationLink> = after
        .relation_links
        .iter()
        .filter(|l| !before.has_relation(&l.key))
        .cloned()
        .collect();
    let gone: Vec<String> = before
        .relation_links
        .iter()
        .filter(|l| !after.has_relation(&l.key))
        .map(|l| l.key.clone())
        .collect();
    if !new_links.is_empty() {
        events.push(EventMessage::ObjectRelationsAmend {
            id: after.id.clone(),
            relation_keys: new_links.iter().map(|l| l.key.clone()).collect(),
        });
        changes.push(ChangeContent::RelationAdd { links: new_links });
    }
    if !gone.is_empty() {
        events.push(EventMessage::ObjectRelationsRemove {
            id: after.id.clone(),
            keys: gone.clone(),
        });
        changes.push(ChangeContent::RelationRemove { keys: gone });
    }

    // store
    for (path, value) in after.store.iter() {
        if before.store.get(path) != Some(value) {
            changes.push(ChangeContent::StoreKeySet {
                path: path.clone(),
                value: value.clone(),
            });
        }
    }
    for path in before.store.keys() {
        if !after.store.contains_key(path) {
            changes.push(ChangeContent::StoreKeyUnset { path: path.clone() });
        }
    }

    if after.tombstone && !before.tombstone {
        changes.push(ChangeContent::Tombstone);
    }

    (events, changes)
}
