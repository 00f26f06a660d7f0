//! Spaces: groups of objects that replicate together.
//!
//! A [Space] owns the cache of its loaded objects and is the only way to
//! get at them. The [SpaceService] keeps every space of the account open,
//! routes changes between objects, the index and peers, and maintains the
//! account space with one space view per space.

use crate::events::SessionEvents;
use crate::index::ObjectIndex;
use crate::object_cache::*;
use crate::smartblock::*;
use crate::source::SourceService;
use crate::state::{Position, State};
use heart_api::{block::*, *};
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

mod migrate;
pub use migrate::legacy_object_id;

mod service;
pub use service::*;

mod sync;
pub use sync::SpaceNet;


/// Space configuration types.
pub mod config {
    /// Configuration parameters for the [SpaceService](super::SpaceService).
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct SpaceConfig {
        /// How often heads are compared with every peer.
        /// Default: 60 seconds.
        pub sync_interval_s: u32,

        /// Timeout of one rpc to a peer during sync.
        /// Default: 60 seconds.
        pub sync_timeout_s: u32,
    }

    impl Default for SpaceConfig {
        fn default() -> Self {
            Self {
                sync_interval_s: 60,
                sync_timeout_s: 60,
            }
        }
    }

    impl SpaceConfig {
        /// Sync interval as a duration.
        pub fn sync_interval(&self) -> std::time::Duration {
            std::time::Duration::from_secs(self.sync_interval_s as u64)
        }

        /// Sync rpc timeout as a duration.
        pub fn sync_timeout(&self) -> std::time::Duration {
            std::time::Duration::from_secs(self.sync_timeout_s as u64)
        }
    }

    /// Module-level configuration for spaces.
    #[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct SpaceModConfig {
        /// Space configuration.
        pub space: SpaceConfig,
    }
}

pub use config::*;

/// Input of [Space::create_tree_object].
#[derive(Debug, Clone)]
pub struct CreateObjectParams {
    /// Set for derived objects; the id is then derived from it.
    pub unique_key: Option<UniqueKey>,
    /// Smartblock type of objects without a unique key.
    pub sb_type: SmartBlockType,
    /// Object type key.
    pub type_key: Option<String>,
    /// Initial details.
    pub details: Details,
    /// Initial blocks. Blocks not listed as a child of another one are
    /// placed under the root in order.
    pub blocks: Vec<Block>,
}

impl Default for CreateObjectParams {
    fn default() -> Self {
        Self {
            unique_key: None,
            sb_type: SmartBlockType::Page,
            type_key: None,
            details: Details::default(),
            blocks: Vec::new(),
        }
    }
}

/// Ids of the objects every space has.
#[derive(Debug, Clone, PartialEq)]
pub struct PredefinedIds {
    /// The workspace object.
    pub workspace: ObjectId,
    /// The archive collection.
    pub archive: ObjectId,
    /// The widget dashboard.
    pub widget: ObjectId,
    /// The profile page.
    pub profile: ObjectId,
}

const PREDEFINED: &[(SmartBlockType, &str, Layout)] = &[
    (SmartBlockType::Workspace, type_key::SPACE, Layout::Basic),
    (SmartBlockType::Archive, type_key::COLLECTION, Layout::Collection),
    (SmartBlockType::Widget, type_key::DASHBOARD, Layout::Dashboard),
    (SmartBlockType::ProfilePage, type_key::PROFILE, Layout::Profile),
];

const ARCHIVE_HOOK: &str = "archive-sync";

struct SpaceInner {
    id: SpaceId,
    sources: SourceService,
    env: Arc<ObjectEnv>,
    cache: ObjectCache<SmartBlock>,
    archive_tx: tokio::sync::mpsc::UnboundedSender<Vec<ObjectId>>,
    archive_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Drop for SpaceInner {
    fn drop(&mut self) {
        if let Some(t) = self
            .archive_task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            t.abort();
        }
    }
}

/// One space and its loaded objects.
#[derive(Clone)]
pub struct Space {
    inner: Arc<SpaceInner>,
}

impl std::fmt::Debug for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Space")
            .field("id", &self.inner.id)
            .field("loaded", &self.inner.cache.len())
            .finish()
    }
}

impl Space {
    /// Construct a space over the account's sources.
    pub fn new(
        id: SpaceId,
        sources: SourceService,
        env: Arc<ObjectEnv>,
        cache_config: ObjectCacheConfig,
    ) -> Self {
        let (archive_tx, archive_rx) = tokio::sync::mpsc::unbounded_channel();
        let inner = Arc::new(SpaceInner {
            id,
            sources,
            env,
            cache: ObjectCache::new(cache_config),
            archive_tx,
            archive_task: std::sync::Mutex::new(None),
        });
        let task =
            tokio::task::spawn(archive_loop(Arc::downgrade(&inner), archive_rx));
        *inner.archive_task.lock().unwrap_or_else(|p| p.into_inner()) =
            Some(task);
        Self { inner }
    }

    /// The space id.
    pub fn id(&self) -> &SpaceId {
        &self.inner.id
    }

    /// The cache of loaded objects.
    pub fn cache(&self) -> &ObjectCache<SmartBlock> {
        &self.inner.cache
    }

    /// The account-wide object index.
    pub fn index(&self) -> &ObjectIndex {
        &self.inner.env.index
    }

    /// Session routing.
    pub fn events(&self) -> &Arc<SessionEvents> {
        &self.inner.env.events
    }

    pub(crate) fn sources(&self) -> &SourceService {
        &self.inner.sources
    }

    /// Id of the object with `unique_key` in this space.
    pub fn derive_object_id(&self, unique_key: &UniqueKey) -> ObjectId {
        SourceService::new_object_id(&self.inner.id, Some(unique_key)).0
    }

    /// Id of the object type with `key`.
    pub fn get_type_id_by_key(&self, key: &str) -> ObjectId {
        self.derive_object_id(&UniqueKey::new(SmartBlockType::ObjectType, key))
    }

    /// Id of the relation with `key`.
    pub fn get_relation_id_by_key(&self, key: &str) -> ObjectId {
        self.derive_object_id(&UniqueKey::new(SmartBlockType::Relation, key))
    }

    /// Ids of the predefined objects.
    pub fn predefined_ids(&self) -> PredefinedIds {
        let id = |t| self.derive_object_id(&UniqueKey::new(t, ""));
        PredefinedIds {
            workspace: id(SmartBlockType::Workspace),
            archive: id(SmartBlockType::Archive),
            widget: id(SmartBlockType::Widget),
            profile: id(SmartBlockType::ProfilePage),
        }
    }

    /// Get an object, loading it if needed.
    pub async fn get_object(
        &self,
        id: &ObjectId,
    ) -> HeartResult<CacheRef<SmartBlock>> {
        let derived = self
            .inner
            .sources
            .tree_meta(&self.inner.id, id)?
            .is_some_and(|m| m.unique_key.is_some());
        let weak = Arc::downgrade(&self.inner);
        let load_id = id.clone();
        self.inner
            .cache
            .get(id, derived, move || -> BoxFut<'static, HeartResult<Arc<SmartBlock>>> {
                Box::pin(async move {
                    let Some(inner) = weak.upgrade() else {
                        return Err(HeartError::canceled("space closed"));
                    };
                    Space { inner }.build(&load_id).await
                })
            })
            .await
    }

    async fn build(&self, id: &ObjectId) -> HeartResult<Arc<SmartBlock>> {
        let source = self.inner.sources.new_source(&self.inner.id, id)?;
        let sb = SmartBlock::init(InitContext {
            source,
            env: self.inner.env.clone(),
            state: None,
            migrations: Vec::new(),
        })?;
        self.install_hooks(&sb).await?;
        Ok(sb)
    }

    async fn install_hooks(&self, sb: &SmartBlock) -> HeartResult<()> {
        if sb.sb_type() != SmartBlockType::Archive {
            return Ok(());
        }
        let mut obj = sb.lock().await?;
        let tx = self.inner.archive_tx.clone();
        obj.add_hook_once(
            ARCHIVE_HOOK,
            HookKind::AfterApply,
            Arc::new(move |info: HookInfo<'_>| {
                let _ = tx.send(collection_of(info.state));
                Ok(())
            }),
        );
        let _ = self.inner.archive_tx.send(obj.collection());
        Ok(())
    }

    /// Run `f` on a locked object.
    pub async fn do_object<R>(
        &self,
        id: &ObjectId,
        f: impl FnOnce(&mut Object) -> HeartResult<R>,
    ) -> HeartResult<R> {
        let sb = self.get_object(id).await?;
        let mut obj = sb.lock().await?;
        f(&mut obj)
    }

    /// [Space::do_object], giving up when `cancel` fires before the
    /// object is locked.
    pub async fn do_with_cancel<R>(
        &self,
        cancel: &tokio_util::sync::CancellationToken,
        id: &ObjectId,
        f: impl FnOnce(&mut Object) -> HeartResult<R>,
    ) -> HeartResult<R> {
        let sb = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(HeartError::canceled(format!("loading {id}")));
            }
            r = self.get_object(id) => r?,
        };
        let mut obj = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(HeartError::canceled(format!("locking {id}")));
            }
            r = sb.lock() => r?,
        };
        f(&mut obj)
    }

    /// Run `f` while `id` is reserved and not loaded.
    pub async fn do_locked_if_not_exists<R>(
        &self,
        id: &ObjectId,
        f: impl FnOnce() -> HeartResult<R>,
    ) -> HeartResult<R> {
        self.inner
            .cache
            .do_locked_if_not_exists(id, async move { f() })
            .await
    }

    /// Create a new object and put it into the cache.
    pub async fn create_tree_object(
        &self,
        params: CreateObjectParams,
    ) -> HeartResult<CacheRef<SmartBlock>> {
        self.create(params, false).await
    }

    async fn create(
        &self,
        params: CreateObjectParams,
        predefined: bool,
    ) -> HeartResult<CacheRef<SmartBlock>> {
        let sb_type = params
            .unique_key
            .as_ref()
            .map(|k| k.sb_type)
            .unwrap_or(params.sb_type);
        let (id, seed) = SourceService::new_object_id(
            &self.inner.id,
            params.unique_key.as_ref(),
        );
        let mut state = State::new(id.clone(), self.inner.id.clone(), sb_type);
        state.set_unique_key(params.unique_key);
        if let Some(t) = params.type_key {
            state.set_object_type_keys(vec![t]);
        }
        state.set_details(&params.details);

        let children: BTreeSet<&String> = params
            .blocks
            .iter()
            .flat_map(|b| b.children_ids.iter())
            .collect();
        let top: Vec<String> = params
            .blocks
            .iter()
            .filter(|b| !children.contains(&b.id))
            .map(|b| b.id.clone())
            .collect();
        for b in params.blocks.iter() {
            state.add(b.clone());
        }
        if !top.is_empty() {
            state.insert_to("", Position::Inner, &top)?;
        }

        let source = if predefined {
            self.inner.sources.create_predefined_tree(&state)?
        } else {
            self.inner.sources.create_tree(&state, seed)?
        };
        let sb = SmartBlock::init(InitContext {
            source,
            env: self.inner.env.clone(),
            state: None,
            migrations: Vec::new(),
        })?;
        self.install_hooks(&sb).await?;
        tracing::debug!(space = %self.inner.id, %id, ?sb_type, "object created");

        match self.inner.cache.add(&id, sb.clone()) {
            Ok(r) => Ok(r),
            Err(HeartError::ExistsInCache(_)) => {
                sb.close().await;
                self.get_object(&id).await
            }
            Err(err) => Err(err),
        }
    }

    /// Tombstone an object, evict it and drop it from the index.
    pub async fn delete_tree(&self, id: &ObjectId) -> HeartResult<()> {
        {
            let sb = self.get_object(id).await?;
            let obj = sb.lock().await?;
            if obj.restrictions().has(ObjectRestriction::Delete) {
                return Err(HeartError::kind(
                    ErrorKind::Restricted,
                    format!("{id} cannot be deleted"),
                ));
            }
        }
        self.inner.sources.delete_tree(&self.inner.id, id)?;
        self.inner.cache.remove(id, true).await?;
        self.inner.env.index.remove(id)?;
        tracing::info!(space = %self.inner.id, %id, "object deleted");
        Ok(())
    }

    /// Create whichever predefined objects are missing. Predefined
    /// objects have the same root change on every device.
    pub async fn ensure_predefined(&self) -> HeartResult<PredefinedIds> {
        for (sb_type, type_key, layout) in PREDEFINED.iter().copied() {
            let unique_key = UniqueKey::new(sb_type, "");
            let id = self.derive_object_id(&unique_key);
            if self.inner.sources.tree_meta(&self.inner.id, &id)?.is_some() {
                continue;
            }
            let params = CreateObjectParams {
                unique_key: Some(unique_key),
                type_key: Some(type_key.to_string()),
                details: Details::from_pairs([(bundle::LAYOUT, layout as i64)]),
                ..Default::default()
            };
            match self.create(params, true).await {
                Ok(_) => (),
                Err(err) if err.is(ErrorKind::AlreadyExists) => (),
                Err(err) => return Err(err),
            }
        }
        Ok(self.predefined_ids())
    }

    /// Update local details of `id`. A loaded object applies the update;
    /// otherwise it lands in the pending side table, flushed on the next
    /// load.
    pub async fn update_pending_local_details(
        &self,
        id: &ObjectId,
        f: impl FnOnce(&mut Details) + Send,
    ) -> HeartResult<()> {
        let mut f = Some(f);
        if self.inner.cache.get_if_loaded(id).is_none() {
            let index = self.inner.env.index.clone();
            let res = self
                .inner
                .cache
                .do_locked_if_not_exists(id, async {
                    match f.take() {
                        Some(f) => index.update_pending_details(id, f),
                        None => Ok(()),
                    }
                })
                .await;
            match res {
                Err(HeartError::ExistsInCache(_)) => (),
                other => return other,
            }
        }
        let Some(f) = f.take() else {
            return Ok(());
        };
        let sb = self.get_object(id).await?;
        let mut obj = sb.lock().await?;
        let mut local = obj.doc().local_details().clone();
        let before = local.clone();
        f(&mut local);
        let diff = before.diff(&local);
        let mut state = obj.new_state();
        for (k, v) in diff.set {
            state.set_local_detail(k, v);
        }
        for k in diff.unset {
            state.set_local_detail(k, Value::Null);
        }
        obj.apply(state, &[ApplyFlag::NoHistory, ApplyFlag::NoRestrictions])
    }

    /// Close every loaded object.
    pub async fn close(&self) {
        self.inner.cache.close_all().await;
    }

    async fn sync_archived(&self, members: Vec<ObjectId>) -> HeartResult<()> {
        let members: BTreeSet<ObjectId> = members.into_iter().collect();
        let archived: BTreeSet<ObjectId> = self
            .inner
            .env
            .index
            .query(Some(&self.inner.id), |r| {
                r.details.get_bool(bundle::IS_ARCHIVED)
            })?
            .into_iter()
            .map(|r| r.id)
            .collect();

        let updates = members
            .difference(&archived)
            .map(|id| (id, true))
            .chain(archived.difference(&members).map(|id| (id, false)));
        for (id, flag) in updates {
            let res = self
                .do_object(id, |obj| {
                    let mut state = obj.new_state();
                    if flag {
                        state.set_detail(bundle::IS_ARCHIVED, true);
                    } else {
                        state.remove_detail(bundle::IS_ARCHIVED);
                    }
                    obj.apply(state, &[ApplyFlag::NoHistory])
                })
                .await;
            if let Err(err) = res {
                tracing::debug!(?err, %id, flag, "archive flag not synced");
            }
        }
        Ok(())
    }
}

async fn archive_loop(
    inner: Weak<SpaceInner>,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<Vec<ObjectId>>,
) {
    while let Some(mut members) = rx.recv().await {
        while let Ok(newer) = rx.try_recv() {
            members = newer;
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let space = Space { inner };
        if let Err(err) = space.sync_archived(members).await {
            tracing::warn!(?err, space = %space.id(), "archive sync failed");
        }
    }
}
