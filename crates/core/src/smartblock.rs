//! The per-object runtime.
//!
//! A [SmartBlock] owns one object's document and serializes every access
//! to it behind an async mutex. Locking yields the [Object], whose
//! [Object::apply] is the only way a document changes:
//!
//! 1. before-apply hooks may still edit the state or veto the apply
//! 2. restrictions are checked against the parent document
//! 3. derived local details are injected
//! 4. the state is diffed into events and changes
//! 5. changes are signed and pushed to the source
//! 6. history, events, after-apply hooks and the index follow
//!
//! A failing push leaves the document untouched.

use crate::events::SessionEvents;
use crate::index::{DetailsListener, ObjectIndex, ObjectRecord, Subscription};
use crate::source::{CreationInfo, DynSource, PushChangeParams};
use crate::state::{Caret, Position, State};
use heart_api::{block::*, change::*, event::*, *};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

mod history;
use history::*;
pub use history::HISTORY_LIMIT;

mod restrictions;
pub use restrictions::*;

#[cfg(test)]
mod test;

/// Options of [Object::apply].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyFlag {
    /// Send no events.
    NoEvent,
    /// Record no undo frame.
    NoHistory,
    /// Run no hooks.
    NoHooks,
    /// Skip the restriction check.
    NoRestrictions,
    /// Keep internal flags of the state.
    KeepInternalFlags,
    /// Do nothing at all when there are no changes.
    SkipIfNoChanges,
    /// Embed a snapshot into the pushed change.
    DoSnapshot,
    /// Update the document without writing a change.
    NotPushChanges,
}

/// When a hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// Before restrictions and diff. An error aborts the apply.
    BeforeApply,
    /// After the document was replaced. Edits to the state are ignored.
    AfterApply,
    /// When a new working state is derived.
    OnNewState,
    /// When the object closes.
    OnClose,
}

/// What a hook gets to see.
pub struct HookInfo<'a> {
    /// The working state, or a copy of the document after the fact.
    pub state: &'a mut State,
    /// Events of the apply. Empty before the diff.
    pub events: &'a [EventMessage],
    /// Changes of the apply. Empty before the diff.
    pub changes: &'a [ChangeContent],
}

/// A lifecycle callback.
pub type Hook = Arc<dyn Fn(HookInfo<'_>) -> HeartResult<()> + Send + Sync>;

struct HookEntry {
    kind: HookKind,
    id: Option<String>,
    hook: Hook,
}

/// Lifecycle of a [SmartBlock]. Init completes before a block is
/// handed out, so a block starts out open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Usable.
    Open,
    /// Closed for good.
    Closed,
}

/// Services an object runs against.
#[derive(Debug, Clone)]
pub struct ObjectEnv {
    /// The acting account.
    pub account: AccountId,
    /// Account-wide object index.
    pub index: ObjectIndex,
    /// Session routing.
    pub events: Arc<SessionEvents>,
}

/// A migration run once on init.
pub type Migration = Box<dyn FnOnce(&mut State) + Send>;

/// Input of [SmartBlock::init].
pub struct InitContext {
    /// The object's change-log.
    pub source: DynSource,
    /// Shared services.
    pub env: Arc<ObjectEnv>,
    /// The document of a freshly created object. Read from the source
    /// when unset.
    pub state: Option<State>,
    /// Migrations applied without history or events.
    pub migrations: Vec<Migration>,
}

/// What a client needs to render an object.
#[derive(Debug, Clone)]
pub struct ObjectView {
    /// The object id, also the root block id.
    pub root_id: ObjectId,
    /// All blocks, root first.
    pub blocks: Vec<Block>,
    /// ObjectDetailsSet of the object followed by its dependencies.
    pub details: Vec<EventMessage>,
    /// Object type keys.
    pub object_type_keys: Vec<String>,
    /// Relation links.
    pub relation_links: Vec<RelationLink>,
    /// Restrictions.
    pub restrictions: Restrictions,
}

struct DepWatcher {
    owner: ObjectId,
    events: Arc<SessionEvents>,
    details: Mutex<HashMap<ObjectId, Details>>,
}

impl DetailsListener for DepWatcher {
    fn on_details(&self, record: &ObjectRecord) {
        self.details
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(record.id.clone(), record.details.clone());
        self.events.broadcast(Event {
            context_id: self.owner.clone(),
            initiator: None,
            messages: vec![EventMessage::ObjectDetailsSet {
                id: record.id.clone(),
                space_id: record.space_id.clone(),
                details: record.details.clone(),
            }],
        });
    }
}

/// The locked part of a [SmartBlock].
pub struct Object {
    id: ObjectId,
    space_id: SpaceId,
    sb_type: SmartBlockType,
    doc: State,
    source: DynSource,
    env: Arc<ObjectEnv>,
    creation: CreationInfo,
    hooks: Vec<HookEntry>,
    history: HashMap<Option<SessionId>, History>,
    restrictions: Restrictions,
    deps: Arc<DepWatcher>,
    dep_ids: Vec<ObjectId>,
    dep_sub: Option<Subscription>,
    response: Vec<EventMessage>,
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("id", &self.id)
            .field("space_id", &self.space_id)
            .field("sb_type", &self.sb_type)
            .finish()
    }
}

fn collection_blocks(doc: &State) -> Vec<(String, ObjectId)> {
    let Some(root) = doc.pick(doc.root_id()) else {
        return Vec::new();
    };
    root.children_ids
        .iter()
        .filter_map(|c| match doc.pick(c).map(|b| &b.content) {
            Some(BlockContent::Link(l)) => {
                Some((c.clone(), ObjectId::from(l.target_block_id.as_str())))
            }
            _ => None,
        })
        .collect()
}

/// Collection items of a document: link targets of the root's children.
pub fn collection_of(doc: &State) -> Vec<ObjectId> {
    collection_blocks(doc)
        .into_iter()
        .map(|(_, target)| target)
        .collect()
}

fn now_secs() -> i64 {
    Timestamp::now().as_unix_secs()
}

impl Object {
    /// Object id.
    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    /// Space id.
    pub fn space_id(&self) -> &SpaceId {
        &self.space_id
    }

    /// Smartblock type.
    pub fn sb_type(&self) -> SmartBlockType {
        self.sb_type
    }

    /// The current document.
    pub fn doc(&self) -> &State {
        &self.doc
    }

    /// The change-log behind the document.
    pub fn source(&self) -> &DynSource {
        &self.source
    }

    /// Current restrictions.
    pub fn restrictions(&self) -> &Restrictions {
        &self.restrictions
    }

    /// Objects whose details are shipped along with this one.
    pub fn dependency_ids(&self) -> &[ObjectId] {
        &self.dep_ids
    }

    /// Combined details of the document.
    pub fn details(&self) -> Details {
        self.doc.combined_details()
    }

    /// Derive a working state.
    pub fn new_state(&mut self) -> State {
        self.new_state_ctx(None)
    }

    /// Derive a working state on behalf of a session.
    pub fn new_state_ctx(&mut self, session: Option<SessionId>) -> State {
        let mut state = self.doc.new_state_ctx(session);
        if let Err(err) = self.run_hooks(HookKind::OnNewState, &mut state, &[], &[]) {
            tracing::warn!(?err, id = %self.id, "on-new-state hook failed");
        }
        state
    }

    /// Events the last applies produced for their initiating session.
    pub fn take_response(&mut self) -> Vec<EventMessage> {
        std::mem::take(&mut self.response)
    }

    /// Register a hook.
    pub fn add_hook(&mut self, kind: HookKind, hook: Hook) {
        self.hooks.push(HookEntry {
            kind,
            id: None,
            hook,
        });
    }

    /// Register a hook unless one with `id` is already registered.
    pub fn add_hook_once(&mut self, id: &str, kind: HookKind, hook: Hook) {
        if self.hooks.iter().any(|h| h.id.as_deref() == Some(id)) {
            return;
        }
        self.hooks.push(HookEntry {
            kind,
            id: Some(id.to_string()),
            hook,
        });
    }

    fn run_hooks(
        &self,
        kind: HookKind,
        state: &mut State,
        events: &[EventMessage],
        changes: &[ChangeContent],
    ) -> HeartResult<()> {
        for h in self.hooks.iter().filter(|h| h.kind == kind) {
            (h.hook)(HookInfo {
                state: &mut *state,
                events,
                changes,
            })?;
        }
        Ok(())
    }

    /// Fold a working state into the document.
    pub fn apply(&mut self, mut state: State, flags: &[ApplyFlag]) -> HeartResult<()> {
        let has = |f: ApplyFlag| flags.contains(&f);
        if state.parent().is_none() {
            return Err(HeartError::bad_input("apply needs a derived state"));
        }
        let session = state.session().cloned();

        if !has(ApplyFlag::NoHooks) {
            self.run_hooks(HookKind::BeforeApply, &mut state, &[], &[])?;
        }
        if !has(ApplyFlag::KeepInternalFlags) {
            state.clear_internal_flags();
        }
        if !has(ApplyFlag::NoRestrictions) {
            self.restrictions.check(&state)?;
        }
        let restrictions =
            Restrictions::compute(self.sb_type, self.source.read_only(), &state);
        self.inject_derived(&mut state, &restrictions)?;

        let caret = state.caret().cloned();
        let mut applied = state.apply_state()?;
        if applied.changes.is_empty()
            && (has(ApplyFlag::SkipIfNoChanges) || applied.events.is_empty())
        {
            return Ok(());
        }

        let push = !applied.changes.is_empty() && !has(ApplyFlag::NotPushChanges);
        if push {
            let now = now_secs();
            let id = self.source.push_change(PushChangeParams {
                state: &applied.state,
                changes: applied.changes.clone(),
                time: Some(now),
                do_snapshot: has(ApplyFlag::DoSnapshot),
            })?;
            applied.state.set_change_id(Some(id));

            let before = applied.state.local_details().clone();
            applied.state.set_last_modified(now, &self.env.account);
            let amend = before.diff(applied.state.local_details());
            if !amend.set.is_empty() {
                applied.events.push(EventMessage::ObjectDetailsAmend {
                    id: self.id.clone(),
                    details: amend.set,
                });
            }
        }

        if !has(ApplyFlag::NoHistory) {
            let frame = Frame::from_changes(&self.doc, &applied.changes, caret);
            if !frame.is_empty() {
                self.history.entry(session.clone()).or_default().push(frame);
            }
        }

        if restrictions != self.restrictions {
            applied.events.push(EventMessage::ObjectRestrictionsSet {
                id: self.id.clone(),
                restrictions: restrictions.names(),
            });
            self.restrictions = restrictions;
        }
        self.doc = applied.state;

        if !has(ApplyFlag::NoEvent) && !applied.events.is_empty() {
            self.dispatch(session, applied.events.clone());
        }

        if !has(ApplyFlag::NoHooks) {
            let mut copy = self.doc.clone();
            if let Err(err) = self.run_hooks(
                HookKind::AfterApply,
                &mut copy,
                &applied.events,
                &applied.changes,
            ) {
                tracing::warn!(?err, id = %self.id, "after-apply hook failed");
            }
        }

        self.refresh_deps();
        self.reindex()
    }

    fn dispatch(&mut self, initiator: Option<SessionId>, messages: Vec<EventMessage>) {
        if initiator.is_some() {
            self.response.extend(messages.iter().cloned());
        }
        self.env.events.broadcast(Event {
            context_id: self.id.clone(),
            initiator,
            messages,
        });
    }

    fn type_id(&self, state: &State) -> Option<ObjectId> {
        state.object_type_key().map(|k| {
            UniqueKey::new(SmartBlockType::ObjectType, k)
                .derive_object_id(&self.space_id)
        })
    }

    fn recommended_layout(&self, type_id: &ObjectId) -> Option<i64> {
        let cached = self
            .deps
            .details
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(type_id)
            .and_then(|d| d.get_int(bundle::RECOMMENDED_LAYOUT));
        cached.or_else(|| {
            self.env
                .index
                .get(type_id)
                .ok()
                .flatten()
                .and_then(|r| r.details.get_int(bundle::RECOMMENDED_LAYOUT))
        })
    }

    fn inject_derived(
        &self,
        state: &mut State,
        restrictions: &Restrictions,
    ) -> HeartResult<()> {
        let own = self.id.to_string();
        state.set_local_detail(bundle::ID, own.clone());
        state.set_local_detail(bundle::SPACE_ID, self.space_id.to_string());
        if let Some(uk) = state.unique_key().map(|k| k.marshal()) {
            state.set_local_detail(bundle::UNIQUE_KEY, uk);
        }

        let type_id = self.type_id(state);
        if let Some(t) = type_id.as_ref() {
            state.set_local_detail(bundle::TYPE, t.to_string());
        }

        if let Some(creator) = self.creation.creator.as_ref() {
            state.set_local_detail(bundle::CREATOR, creator.to_string());
        }
        if self.creation.created > 0 {
            state.set_local_detail(bundle::CREATED_DATE, self.creation.created);
            if !state.local_details().has(bundle::ADDED_DATE) {
                state.set_local_detail(bundle::ADDED_DATE, self.creation.created);
            }
        }

        state.set_local_detail(bundle::SNIPPET, state.snippet());
        let mut links = state.link_ids();
        links.retain(|l| *l != own);
        state.set_local_detail(bundle::LINKS, links);
        let mut mentions = state.mention_ids();
        mentions.retain(|l| *l != own);
        state.set_local_detail(bundle::MENTIONS, mentions);
        let backlinks: Vec<String> = self
            .env
            .index
            .backlinks(&self.id)?
            .into_iter()
            .map(|b| b.to_string())
            .collect();
        state.set_local_detail(bundle::BACKLINKS, backlinks);

        let layout = state
            .details()
            .get_int(bundle::LAYOUT)
            .or_else(|| type_id.as_ref().and_then(|t| self.recommended_layout(t)))
            .unwrap_or(Layout::Basic as i64);
        state.set_local_detail(bundle::RESOLVED_LAYOUT, layout);

        if let Some(backup) = state.details().get_int(bundle::FILE_BACKUP_STATUS) {
            let sync = match backup {
                0 => 0,
                1 => 1,
                _ => 2,
            };
            state.set_local_detail(bundle::FILE_SYNC_STATUS, sync as i64);
        }

        if state.details().get_bool(bundle::HAS_CHAT) {
            let chat = UniqueKey::new(SmartBlockType::ChatDerivedObject, own.clone())
                .derive_object_id(&self.space_id);
            state.set_local_detail(bundle::CHAT_ID, chat.to_string());
        }

        if state.details().has(bundle::IS_UNINSTALLED) {
            let deleted = state.details().get_bool(bundle::IS_UNINSTALLED);
            state.set_local_detail(bundle::IS_DELETED, deleted);
        }

        state.set_local_detail(bundle::RESTRICTIONS, restrictions.names());
        Ok(())
    }

    fn compute_dep_ids(&self) -> Vec<ObjectId> {
        let mut out: Vec<ObjectId> = Vec::new();
        let mut push = |id: String| {
            if id.is_empty() || id == *self.id {
                return;
            }
            let id = ObjectId::from(id);
            if !out.contains(&id) {
                out.push(id);
            }
        };
        for l in self.doc.link_ids() {
            push(l);
        }
        for m in self.doc.mention_ids() {
            push(m);
        }
        let details = self.doc.combined_details();
        for key in bundle::OBJECT_KEYS {
            for v in details.get_list(key) {
                push(v);
            }
        }
        out
    }

    fn refresh_deps(&mut self) {
        let ids = self.compute_dep_ids();
        if ids == self.dep_ids && self.dep_sub.is_some() {
            return;
        }
        self.deps
            .details
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|k, _| ids.contains(k));
        match self.dep_sub.as_ref() {
            Some(sub) => sub.set_ids(ids.iter().cloned()),
            None => {
                let listener: Arc<dyn DetailsListener> = self.deps.clone();
                self.dep_sub =
                    Some(self.env.index.subscribe(ids.iter().cloned(), listener));
            }
        }
        self.dep_ids = ids;
    }

    fn record(&self) -> HeartResult<ObjectRecord> {
        let mut links: Vec<ObjectId> = Vec::new();
        for id in self.doc.link_ids().into_iter().chain(self.doc.mention_ids()) {
            let id = ObjectId::from(id);
            if id != self.id && !links.contains(&id) {
                links.push(id);
            }
        }
        Ok(ObjectRecord {
            id: self.id.clone(),
            space_id: self.space_id.clone(),
            sb_type: self.sb_type,
            details: self.doc.combined_details(),
            links,
            heads: self.source.heads()?,
        })
    }

    fn reindex(&self) -> HeartResult<()> {
        self.env.index.update(self.record()?)
    }

    /// Recompute backlinks after other objects changed their links.
    pub fn refresh_backlinks(&mut self) -> HeartResult<()> {
        let state = self.new_state();
        self.apply(
            state,
            &[
                ApplyFlag::NoHistory,
                ApplyFlag::NoRestrictions,
                ApplyFlag::NoHooks,
            ],
        )
    }

    /// The view of the object plus details of its dependencies.
    /// Subscribes `session` to the object's events.
    pub fn show(&mut self, session: Option<&SessionId>) -> HeartResult<ObjectView> {
        if let Some(s) = session {
            self.env.events.subscribe(s, &self.id);
        }
        self.fetch_meta()
    }

    /// Same as [Object::show] without subscribing.
    pub fn fetch_meta(&self) -> HeartResult<ObjectView> {
        let mut blocks = Vec::new();
        self.doc.iterate(|b| {
            blocks.push(b.clone());
            true
        });

        let mut details = vec![EventMessage::ObjectDetailsSet {
            id: self.id.clone(),
            space_id: self.space_id.clone(),
            details: self.doc.combined_details(),
        }];
        for dep in self.dep_ids.iter() {
            if let Some(r) = self.env.index.get(dep)? {
                details.push(EventMessage::ObjectDetailsSet {
                    id: r.id,
                    space_id: r.space_id,
                    details: r.details,
                });
            }
        }

        Ok(ObjectView {
            root_id: self.id.clone(),
            blocks,
            details,
            object_type_keys: self.doc.object_type_keys().to_vec(),
            relation_links: self.doc.relation_links().to_vec(),
            restrictions: self.restrictions.clone(),
        })
    }

    /// Set details, emitting events only if `show_event`.
    pub fn set_details(
        &mut self,
        session: Option<SessionId>,
        details: &Details,
        show_event: bool,
    ) -> HeartResult<()> {
        let mut state = self.new_state_ctx(session);
        state.set_details(details);
        let flags: &[ApplyFlag] = if show_event {
            &[]
        } else {
            &[ApplyFlag::NoEvent]
        };
        self.apply(state, flags)
    }

    /// Replace the content with an older version of the document.
    pub fn reset_to_version(&mut self, version: &State) -> HeartResult<()> {
        let state = self.doc.new_state_from(version);
        self.apply(state, &[ApplyFlag::NoHistory, ApplyFlag::DoSnapshot])
    }

    /// Re-read the document from the source after remote changes.
    pub fn reload_from_source(&mut self) -> HeartResult<()> {
        let fresh = self.source.read_doc()?;
        let mut state = self.doc.new_state_from(&fresh);
        state.set_change_id(fresh.change_id().cloned());
        self.apply(
            state,
            &[
                ApplyFlag::NotPushChanges,
                ApplyFlag::NoHistory,
                ApplyFlag::NoRestrictions,
            ],
        )
    }

    /// Undo the last frame of `session`. Returns the caret to restore.
    pub fn undo(&mut self, session: Option<SessionId>) -> HeartResult<Option<Caret>> {
        self.history_step(session, true)
    }

    /// Redo the last undone frame of `session`.
    pub fn redo(&mut self, session: Option<SessionId>) -> HeartResult<Option<Caret>> {
        self.history_step(session, false)
    }

    fn history_step(
        &mut self,
        session: Option<SessionId>,
        undo: bool,
    ) -> HeartResult<Option<Caret>> {
        let frame = {
            let h = self.history.entry(session.clone()).or_default();
            if undo {
                h.undo()
            } else {
                h.redo()
            }
        };
        let Some(frame) = frame else {
            return Err(HeartError::kind(
                ErrorKind::NotFound,
                if undo { "nothing to undo" } else { "nothing to redo" },
            ));
        };
        let mut state = self.new_state_ctx(session);
        frame.restore(&mut state, undo);
        self.apply(state, &[ApplyFlag::NoHistory])?;
        Ok(frame.caret)
    }

    /// Number of undo frames recorded for `session`.
    pub fn history_len(&self, session: Option<&SessionId>) -> usize {
        self.history
            .get(&session.cloned())
            .map(|h| h.len())
            .unwrap_or(0)
    }

    /// Items of the object's collection: link targets of the root's
    /// children, top first.
    pub fn collection(&self) -> Vec<ObjectId> {
        collection_of(&self.doc)
    }

    /// True if the collection holds `id`.
    pub fn collection_has(&self, id: &ObjectId) -> bool {
        self.collection().contains(id)
    }

    /// Add link blocks at the top of the collection, skipping present ids.
    pub fn collection_add(&mut self, ids: &[ObjectId]) -> HeartResult<()> {
        let current = self.collection();
        let mut added: Vec<&ObjectId> = Vec::new();
        for id in ids {
            if !current.contains(id) && !added.contains(&id) {
                added.push(id);
            }
        }
        if added.is_empty() {
            return Ok(());
        }
        let first = self
            .doc
            .pick(self.doc.root_id())
            .and_then(|r| r.children_ids.first().cloned());
        let mut state = self.new_state();
        let mut block_ids = Vec::with_capacity(added.len());
        for id in added {
            let block_id = format!("link-{id}");
            state.remove(&block_id);
            state.add(Block::link(block_id.clone(), id.to_string()));
            block_ids.push(block_id);
        }
        match first {
            Some(first) => state.insert_to(&first, Position::Top, &block_ids)?,
            None => state.insert_to("", Position::Inner, &block_ids)?,
        }
        self.apply(state, &[])
    }

    /// Unlink the blocks referencing `ids`.
    pub fn collection_remove(&mut self, ids: &[ObjectId]) -> HeartResult<()> {
        let doomed: Vec<String> = collection_blocks(&self.doc)
            .into_iter()
            .filter(|(_, target)| ids.contains(target))
            .map(|(block, _)| block)
            .collect();
        if doomed.is_empty() {
            return Ok(());
        }
        let mut state = self.new_state();
        for b in doomed {
            state.remove(&b);
        }
        self.apply(state, &[])
    }

    fn close_inner(&mut self) {
        let mut copy = self.doc.clone();
        if let Err(err) = self.run_hooks(HookKind::OnClose, &mut copy, &[], &[]) {
            tracing::warn!(?err, id = %self.id, "on-close hook failed");
        }
        self.dep_sub = None;
        self.env.events.forget_object(&self.id);
    }
}

/// One loaded object.
pub struct SmartBlock {
    id: ObjectId,
    space_id: SpaceId,
    sb_type: SmartBlockType,
    status: Mutex<Status>,
    last_usage: AtomicI64,
    object: tokio::sync::Mutex<Object>,
}

impl std::fmt::Debug for SmartBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartBlock")
            .field("id", &self.id)
            .field("sb_type", &self.sb_type)
            .field("status", &self.status())
            .finish()
    }
}

impl SmartBlock {
    /// Load the document, flush pending local details, inject derived
    /// details, run migrations and index the object.
    pub fn init(ctx: InitContext) -> HeartResult<Arc<Self>> {
        let InitContext {
            source,
            env,
            state,
            migrations,
        } = ctx;
        let id = source.id().clone();
        let space_id = source.space_id().clone();
        let sb_type = source.sb_type();

        let mut doc = match state {
            Some(s) => s,
            None => source.read_doc()?,
        };
        let creation = source.creation_info()?;
        let pending = env.index.pending_details(&id)?;
        for (k, v) in pending.iter() {
            doc.set_local_detail(k.clone(), v.clone());
        }

        let restrictions = Restrictions::compute(sb_type, source.read_only(), &doc);
        let deps = Arc::new(DepWatcher {
            owner: id.clone(),
            events: env.events.clone(),
            details: Mutex::new(HashMap::new()),
        });
        let mut object = Object {
            id: id.clone(),
            space_id: space_id.clone(),
            sb_type,
            doc: doc.clone(),
            source,
            env,
            creation,
            hooks: Vec::new(),
            history: HashMap::new(),
            restrictions,
            deps,
            dep_ids: Vec::new(),
            dep_sub: None,
            response: Vec::new(),
        };
        object.inject_derived(&mut doc, &object.restrictions)?;
        object.doc = doc;
        object.refresh_deps();

        for m in migrations {
            let mut state = object.new_state();
            m(&mut state);
            object.apply(
                state,
                &[
                    ApplyFlag::NoHistory,
                    ApplyFlag::NoEvent,
                    ApplyFlag::NoRestrictions,
                    ApplyFlag::SkipIfNoChanges,
                ],
            )?;
        }
        object.reindex()?;
        if !pending.is_empty() {
            object.env.index.take_pending_details(&object.id)?;
        }

        Ok(Arc::new(Self {
            id,
            space_id,
            sb_type,
            status: Mutex::new(Status::Open),
            last_usage: AtomicI64::new(Timestamp::now().as_micros()),
            object: tokio::sync::Mutex::new(object),
        }))
    }

    /// Object id.
    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    /// Space id.
    pub fn space_id(&self) -> &SpaceId {
        &self.space_id
    }

    /// Smartblock type.
    pub fn sb_type(&self) -> SmartBlockType {
        self.sb_type
    }

    /// Lifecycle status.
    pub fn status(&self) -> Status {
        *self.status.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Last time the object was locked.
    pub fn last_usage(&self) -> Timestamp {
        Timestamp::from_micros(self.last_usage.load(Ordering::Relaxed))
    }

    fn check_open(&self) -> HeartResult<()> {
        if self.status() == Status::Closed {
            return Err(HeartError::ClosedObject(self.id.to_string().into()));
        }
        Ok(())
    }

    /// Wait for exclusive access. Waiters are served in order.
    pub async fn lock(&self) -> HeartResult<tokio::sync::MutexGuard<'_, Object>> {
        self.check_open()?;
        let guard = self.object.lock().await;
        self.check_open()?;
        self.last_usage
            .store(Timestamp::now().as_micros(), Ordering::Relaxed);
        Ok(guard)
    }

    /// True while someone holds the lock.
    pub fn is_locked(&self) -> bool {
        self.object.try_lock().is_err()
    }

    /// Close if unlocked and idle for at least `ttl`.
    pub fn try_close(&self, ttl: std::time::Duration) -> bool {
        let Ok(mut guard) = self.object.try_lock() else {
            return false;
        };
        if self.status() == Status::Closed {
            return true;
        }
        let idle = Timestamp::now().as_micros()
            - self.last_usage.load(Ordering::Relaxed);
        if idle < ttl.as_micros() as i64 {
            return false;
        }
        guard.close_inner();
        *self.status.lock().unwrap_or_else(|p| p.into_inner()) = Status::Closed;
        true
    }

    /// Close, waiting for the current holder of the lock.
    pub async fn close(&self) {
        let mut guard = self.object.lock().await;
        let mut status = self.status.lock().unwrap_or_else(|p| p.into_inner());
        if *status == Status::Closed {
            return;
        }
        *status = Status::Closed;
        drop(status);
        guard.close_inner();
    }
}
