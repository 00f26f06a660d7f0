use super::*;
use crate::lexid;
use crate::source::ChangeNotice;
use heart_api::{kv::*, remote::*};
use std::collections::HashMap;
use std::sync::Mutex;

/// A space known to this device.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceInfo {
    /// The space.
    pub space_id: SpaceId,
    /// Unix seconds when this device learned about the space.
    pub created: i64,
    /// Coordinator receipt. Spaces without one do not sync.
    #[serde(default)]
    pub receipt: Option<SpaceReceipt>,
    /// Set for the account space.
    #[serde(default)]
    pub is_account_space: bool,
}

fn info_key(id: &SpaceId) -> Vec<u8> {
    format!("spc/{id}").into_bytes()
}

/// Id of the account space of `account`, the same on every device.
pub fn account_space_id(account: &AccountId) -> SpaceId {
    let hash = hash_parts(&[b"heart-account-space", account.to_string().as_bytes()]);
    SpaceId::from(format!("acc{}", hex::encode(&hash[..16])))
}

pub(super) struct SvcInner {
    pub(super) config: SpaceConfig,
    cache_config: ObjectCacheConfig,
    pub(super) sources: SourceService,
    pub(super) env: Arc<ObjectEnv>,
    local: DynKvStore,
    account_space_id: SpaceId,
    spaces: Mutex<HashMap<SpaceId, Space>>,
    pub(super) net: Mutex<Option<SpaceNet>>,
    pub(super) tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Drop for SvcInner {
    fn drop(&mut self) {
        for t in self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
        {
            t.abort();
        }
    }
}

/// All spaces of the account.
#[derive(Clone)]
pub struct SpaceService {
    pub(super) inner: Arc<SvcInner>,
}

impl std::fmt::Debug for SpaceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceService")
            .field("account_space_id", &self.inner.account_space_id)
            .finish()
    }
}

impl SpaceService {
    /// Open every space known to this device, creating the account space
    /// on first use.
    pub async fn open(
        config: SpaceConfig,
        cache_config: ObjectCacheConfig,
        sources: SourceService,
        env: Arc<ObjectEnv>,
        local: DynKvStore,
    ) -> HeartResult<Self> {
        let notices = sources.subscribe_changes();
        let backlinks = env.index.backlink_updates();
        let inner = Arc::new(SvcInner {
            config,
            cache_config,
            account_space_id: account_space_id(sources.account()),
            sources,
            env,
            local,
            spaces: Mutex::new(HashMap::new()),
            net: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });
        {
            let mut tasks = inner.tasks.lock().unwrap_or_else(|p| p.into_inner());
            tasks.push(tokio::task::spawn(notice_loop(
                Arc::downgrade(&inner),
                notices,
            )));
            tasks.push(tokio::task::spawn(backlink_loop(
                Arc::downgrade(&inner),
                backlinks,
            )));
        }
        let this = Self { inner };

        let account_space = this.inner.account_space_id.clone();
        if this.info(&account_space)?.is_none() {
            this.put_info(&SpaceInfo {
                space_id: account_space,
                created: Timestamp::now().as_unix_secs(),
                receipt: None,
                is_account_space: true,
            })?;
        }
        for info in this.space_infos()? {
            this.open_space(&info.space_id).await?;
        }
        Ok(this)
    }

    /// Id of the account space.
    pub fn account_space_id(&self) -> &SpaceId {
        &self.inner.account_space_id
    }

    /// The account space, holding the space views.
    pub fn account_space(&self) -> HeartResult<Space> {
        self.space(&self.inner.account_space_id)
    }

    /// An open space.
    pub fn space(&self, id: &SpaceId) -> HeartResult<Space> {
        self.inner
            .spaces
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| HeartError::not_found(format!("space {id}")))
    }

    /// Every space known to this device, the account space included.
    pub fn space_infos(&self) -> HeartResult<Vec<SpaceInfo>> {
        self.inner
            .local
            .iter_prefix(b"spc/")?
            .into_iter()
            .map(|(k, v)| {
                serde_json::from_slice(&v).map_err(|e| {
                    HeartError::kind_src(
                        ErrorKind::CorruptRecord,
                        format!("decode {}", String::from_utf8_lossy(&k)),
                        e,
                    )
                })
            })
            .collect()
    }

    /// Ids of the user's spaces, without the account space.
    pub fn space_ids(&self) -> HeartResult<Vec<SpaceId>> {
        Ok(self
            .space_infos()?
            .into_iter()
            .filter(|i| !i.is_account_space)
            .map(|i| i.space_id)
            .collect())
    }

    /// The stored record of a space.
    pub fn info(&self, id: &SpaceId) -> HeartResult<Option<SpaceInfo>> {
        get_json(&*self.inner.local, &info_key(id))
    }

    pub(super) fn put_info(&self, info: &SpaceInfo) -> HeartResult<()> {
        self.inner
            .local
            .write_batch(vec![put_json_op(info_key(&info.space_id), info)?])
    }

    async fn open_space(&self, id: &SpaceId) -> HeartResult<Space> {
        if let Ok(space) = self.space(id) {
            return Ok(space);
        }
        let space = Space::new(
            id.clone(),
            self.inner.sources.clone(),
            self.inner.env.clone(),
            self.inner.cache_config.clone(),
        );
        let space = self
            .inner
            .spaces
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(id.clone())
            .or_insert(space)
            .clone();
        space.ensure_predefined().await?;
        if let Err(err) = space.migrate_sub_objects().await {
            tracing::warn!(?err, space = %id, "sub-object migration failed");
        }
        tracing::debug!(space = %id, "space open");
        Ok(space)
    }

    /// Create a new space with its predefined objects and space view.
    pub async fn create_space(&self) -> HeartResult<Space> {
        let id = SpaceId::from(format!(
            "sp{}",
            hex::encode(rand::random::<[u8; 16]>())
        ));
        self.put_info(&SpaceInfo {
            space_id: id.clone(),
            created: Timestamp::now().as_unix_secs(),
            receipt: None,
            is_account_space: false,
        })?;
        let space = self.open_space(&id).await?;
        self.ensure_space_view(&id).await?;
        tracing::info!(space = %id, "space created");
        Ok(space)
    }

    /// Id of the space view of `space_id` in the account space.
    pub fn space_view_id(&self, space_id: &SpaceId) -> ObjectId {
        UniqueKey::new(SmartBlockType::SpaceView, space_id.to_string())
            .derive_object_id(&self.inner.account_space_id)
    }

    /// Create the space view of `space_id` unless it exists.
    pub async fn ensure_space_view(&self, space_id: &SpaceId) -> HeartResult<ObjectId> {
        let account = self.account_space()?;
        let id = self.space_view_id(space_id);
        if self
            .inner
            .sources
            .tree_meta(account.id(), &id)?
            .is_some()
        {
            return Ok(id);
        }
        let params = CreateObjectParams {
            unique_key: Some(UniqueKey::new(
                SmartBlockType::SpaceView,
                space_id.to_string(),
            )),
            type_key: Some(type_key::SPACE_VIEW.to_string()),
            details: Details::from_pairs([
                (bundle::TARGET_SPACE_ID, Value::from(space_id.to_string())),
                (bundle::LAYOUT, Value::Int(Layout::SpaceView as i64)),
            ]),
            ..Default::default()
        };
        match account.create_tree_object(params).await {
            Ok(_) => Ok(id),
            Err(err) if err.is(ErrorKind::AlreadyExists) => Ok(id),
            Err(err) => Err(err),
        }
    }

    /// Space views with their order keys: ordered views first by key,
    /// then views without a key by id.
    pub fn ordered_space_views(&self) -> HeartResult<Vec<(ObjectId, String)>> {
        let mut views: Vec<(ObjectId, String)> = self
            .inner
            .env
            .index
            .query(Some(&self.inner.account_space_id), |r| {
                r.sb_type == SmartBlockType::SpaceView
            })?
            .into_iter()
            .map(|r| {
                let order = r.details.get_string(bundle::SPACE_ORDER);
                (r.id, order)
            })
            .collect();
        views.sort_by(|a, b| {
            (a.1.is_empty(), &a.1, &a.0).cmp(&(b.1.is_empty(), &b.1, &b.0))
        });
        Ok(views)
    }

    /// Move `view_id` right after `after`, or to the front. Views that
    /// had no order key get one so the result is total. Returns the new
    /// key of `view_id`.
    pub async fn set_order(
        &self,
        view_id: &ObjectId,
        after: Option<&ObjectId>,
    ) -> HeartResult<String> {
        let mut views = self.ordered_space_views()?;
        if !views.iter().any(|(id, _)| id == view_id) {
            return Err(HeartError::not_found(format!("space view {view_id}")));
        }

        let mut assigned = Vec::new();
        let mut last: Option<String> = None;
        for (id, order) in views.iter_mut() {
            if order.is_empty() {
                *order = match last.as_deref() {
                    Some(l) => lexid::next(l)?,
                    None => lexid::middle(),
                };
                if id != view_id {
                    assigned.push((id.clone(), order.clone()));
                }
            }
            last = Some(order.clone());
        }
        views.retain(|(id, _)| id != view_id);

        let order = match after {
            None => match views.first() {
                Some((_, first)) => lexid::prev(first)?,
                None => lexid::middle(),
            },
            Some(after) => {
                let pos = views
                    .iter()
                    .position(|(id, _)| id == after)
                    .ok_or_else(|| {
                        HeartError::not_found(format!("space view {after}"))
                    })?;
                match views.get(pos + 1) {
                    Some((_, next)) => lexid::next_before(&views[pos].1, next)?,
                    None => lexid::next(&views[pos].1)?,
                }
            }
        };
        assigned.push((view_id.clone(), order.clone()));

        let account = self.account_space()?;
        for (id, key) in assigned {
            account
                .do_object(&id, |obj| {
                    let mut state = obj.new_state();
                    state.set_detail(bundle::SPACE_ORDER, key);
                    obj.apply(state, &[])
                })
                .await?;
        }
        Ok(order)
    }

    /// Update local details of any object of the account. See
    /// [Space::update_pending_local_details].
    pub async fn update_pending_local_details(
        &self,
        id: &ObjectId,
        f: impl FnOnce(&mut Details) + Send,
    ) -> HeartResult<()> {
        let space = self
            .inner
            .env
            .index
            .space_of(id)?
            .and_then(|s| self.space(&s).ok());
        match space {
            Some(space) => space.update_pending_local_details(id, f).await,
            None => self.inner.env.index.update_pending_details(id, f),
        }
    }

    /// Stop background work and close every loaded object.
    pub async fn close(&self) {
        for t in self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
        {
            t.abort();
        }
        *self.inner.net.lock().unwrap_or_else(|p| p.into_inner()) = None;
        let spaces: Vec<Space> = self
            .inner
            .spaces
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain()
            .map(|(_, s)| s)
            .collect();
        for s in spaces {
            s.close().await;
        }
    }

    async fn route_remote(&self, notice: ChangeNotice) -> HeartResult<()> {
        let Ok(space) = self.space(&notice.space_id) else {
            return Ok(());
        };
        let tree = &notice.tree_id;
        let meta = self.inner.sources.tree_meta(&notice.space_id, tree)?;
        if meta.as_ref().is_some_and(|m| m.deleted) {
            space.cache().remove(tree, true).await?;
            self.inner.env.index.remove(tree)?;
            return Ok(());
        }
        match space.cache().get_if_loaded(tree) {
            Some(sb) => {
                sb.lock().await?.reload_from_source()?;
            }
            None => {
                space.get_object(tree).await?;
            }
        }
        if notice.space_id == self.inner.account_space_id
            && meta.is_some_and(|m| m.sb_type == SmartBlockType::SpaceView)
        {
            self.adopt_from_view(&space, tree).await?;
        }
        Ok(())
    }

    /// A space view synced from another device makes its space known here.
    async fn adopt_from_view(&self, account: &Space, view: &ObjectId) -> HeartResult<()> {
        let target = account
            .do_object(view, |obj| {
                Ok(obj.details().get_string(bundle::TARGET_SPACE_ID))
            })
            .await?;
        if target.is_empty() {
            return Ok(());
        }
        let target = SpaceId::from(target);
        if self.info(&target)?.is_some() {
            return Ok(());
        }
        self.put_info(&SpaceInfo {
            space_id: target.clone(),
            created: Timestamp::now().as_unix_secs(),
            receipt: None,
            is_account_space: false,
        })?;
        self.open_space(&target).await?;
        tracing::info!(space = %target, "space adopted from another device");
        Ok(())
    }

    async fn refresh_backlinks(&self, id: &ObjectId) -> HeartResult<()> {
        let index = &self.inner.env.index;
        let Some(space_id) = index.space_of(id)? else {
            return Ok(());
        };
        if let Ok(space) = self.space(&space_id) {
            if let Some(sb) = space.cache().get_if_loaded(id) {
                sb.lock().await?.refresh_backlinks()?;
                return Ok(());
            }
        }
        let backlinks = index
            .backlinks(id)?
            .into_iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>();
        index.set_record_detail(id, bundle::BACKLINKS, Value::List(backlinks))
    }
}

async fn notice_loop(
    inner: Weak<SvcInner>,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<ChangeNotice>,
) {
    while let Some(notice) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let svc = SpaceService { inner };
        if notice.local {
            svc.broadcast_change(notice);
            continue;
        }
        let tree = notice.tree_id.clone();
        if let Err(err) = svc.route_remote(notice).await {
            tracing::debug!(?err, %tree, "remote change not routed");
        }
    }
}

async fn backlink_loop(
    inner: Weak<SvcInner>,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<ObjectId>,
) {
    while let Some(id) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if let Err(err) = (SpaceService { inner }).refresh_backlinks(&id).await {
            tracing::debug!(?err, %id, "backlinks not refreshed");
        }
    }
}
