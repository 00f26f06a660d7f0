use super::*;
use crate::factories::mem_kv_store::MemKvStore;
use crate::source::{date_object_id, SourceService};
use crate::state::Position;
use ed25519_dalek::SigningKey;
use std::time::Duration;

struct Fixture {
    svc: SourceService,
    env: Arc<ObjectEnv>,
    rx: tokio::sync::mpsc::UnboundedReceiver<(Option<SessionId>, Event)>,
}

fn space() -> SpaceId {
    SpaceId::from("space1")
}

fn fixture() -> Fixture {
    let (out, rx) = ChannelEventSender::create();
    let svc = SourceService::new(
        MemKvStore::create(),
        SigningKey::from_bytes(&[1; 32]),
    );
    let env = Arc::new(ObjectEnv {
        account: svc.account().clone(),
        index: ObjectIndex::new(MemKvStore::create()),
        events: SessionEvents::new(out),
    });
    Fixture { svc, env, rx }
}

impl Fixture {
    fn create(
        &self,
        sb_type: SmartBlockType,
        uk: Option<UniqueKey>,
        f: impl FnOnce(&mut State),
    ) -> Arc<SmartBlock> {
        let (id, seed) = SourceService::new_object_id(&space(), uk.as_ref());
        let mut state = State::new(id, space(), sb_type);
        state.set_unique_key(uk);
        f(&mut state);
        let source = self.svc.create_tree(&state, seed).unwrap();
        SmartBlock::init(InitContext {
            source,
            env: self.env.clone(),
            state: Some(state),
            migrations: Vec::new(),
        })
        .unwrap()
    }

    fn drain(&mut self) -> Vec<(Option<SessionId>, Event)> {
        let mut out = Vec::new();
        while let Ok(e) = self.rx.try_recv() {
            out.push(e);
        }
        out
    }
}

fn hook(
    f: impl Fn(HookInfo<'_>) -> HeartResult<()> + Send + Sync + 'static,
) -> Hook {
    Arc::new(f)
}

fn add_text(state: &mut State, id: &str, text: &str) {
    state.add(Block::text(id, text));
    state.insert_to("", Position::Inner, &[id.to_string()]).unwrap();
}

fn add_link(state: &mut State, id: &str, target: &ObjectId) {
    state.add(Block::link(id, target.to_string()));
    state.insert_to("", Position::Inner, &[id.to_string()]).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn apply_pushes_and_routes_events() {
    let mut fx = fixture();
    let sb = fx.create(SmartBlockType::Page, None, |s| {
        s.set_object_type_keys(vec![type_key::PAGE.into()]);
    });
    let s1 = SessionId::from("s1");
    let s2 = SessionId::from("s2");

    let mut obj = sb.lock().await.unwrap();
    obj.show(Some(&s1)).unwrap();
    obj.show(Some(&s2)).unwrap();
    let heads = obj.source().heads().unwrap();

    let mut state = obj.new_state_ctx(Some(s1.clone()));
    add_text(&mut state, "b1", "hello");
    obj.apply(state, &[]).unwrap();

    assert_ne!(heads, obj.source().heads().unwrap());
    assert!(obj
        .take_response()
        .iter()
        .any(|m| matches!(m, EventMessage::BlockAdd { .. })));
    assert!(obj.take_response().is_empty());

    let got = fx.drain();
    assert_eq!(1, got.len());
    assert_eq!(Some(s2), got[0].0);
    assert_eq!(Some(s1), got[0].1.initiator);

    assert_eq!("hello", obj.details().get_string(bundle::SNIPPET));
    assert!(obj.details().has(bundle::LAST_MODIFIED_DATE));
    assert!(obj.source().read_doc().unwrap().exists("b1"));
}

#[tokio::test(flavor = "multi_thread")]
async fn local_only_edits_are_not_pushed() {
    let fx = fixture();
    let sb = fx.create(SmartBlockType::Page, None, |_| ());
    let mut obj = sb.lock().await.unwrap();
    let heads = obj.source().heads().unwrap();

    let mut state = obj.new_state();
    state.set_detail(bundle::LAST_OPENED_DATE, 10i64);
    obj.apply(state, &[ApplyFlag::SkipIfNoChanges]).unwrap();
    assert!(!obj.details().has(bundle::LAST_OPENED_DATE));

    let mut state = obj.new_state();
    state.set_detail(bundle::LAST_OPENED_DATE, 10i64);
    obj.apply(state, &[]).unwrap();
    assert_eq!(Some(10), obj.details().get_int(bundle::LAST_OPENED_DATE));
    assert_eq!(heads, obj.source().heads().unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn derived_details_are_injected() {
    let fx = fixture();
    let type_id = UniqueKey::new(SmartBlockType::ObjectType, type_key::TASK)
        .derive_object_id(&space());
    fx.env
        .index
        .update(ObjectRecord {
            id: type_id.clone(),
            space_id: space(),
            sb_type: SmartBlockType::ObjectType,
            details: Details::from_pairs([(
                bundle::RECOMMENDED_LAYOUT,
                Layout::Todo as i64,
            )]),
            links: Vec::new(),
            heads: Vec::new(),
        })
        .unwrap();

    let sb = fx.create(SmartBlockType::Page, None, |s| {
        s.set_object_type_keys(vec![type_key::TASK.into()]);
        s.set_detail(bundle::FILE_BACKUP_STATUS, 3i64);
        s.set_detail(bundle::HAS_CHAT, true);
        s.set_detail(bundle::IS_UNINSTALLED, true);
        add_link(s, "l", &ObjectId::from("target"));
    });
    let mut obj = sb.lock().await.unwrap();
    let d = obj.details();
    assert_eq!(obj.id().as_str(), d.get_string(bundle::ID));
    assert_eq!("space1", d.get_string(bundle::SPACE_ID));
    assert_eq!(type_id.as_str(), d.get_string(bundle::TYPE));
    assert_eq!(Some(Layout::Todo as i64), d.get_int(bundle::RESOLVED_LAYOUT));
    assert_eq!(Some(2), d.get_int(bundle::FILE_SYNC_STATUS));
    let chat = UniqueKey::new(SmartBlockType::ChatDerivedObject, obj.id().as_str())
        .derive_object_id(&space());
    assert_eq!(chat.as_str(), d.get_string(bundle::CHAT_ID));
    assert!(d.get_bool(bundle::IS_DELETED));
    assert_eq!(vec!["target".to_string()], d.get_list(bundle::LINKS));
    assert_eq!(fx.env.account.to_string(), d.get_string(bundle::CREATOR));
    assert!(d.get_int(bundle::CREATED_DATE).unwrap() > 0);
    assert_eq!(d.get_int(bundle::CREATED_DATE), d.get_int(bundle::ADDED_DATE));

    // an explicit layout wins over the type's
    obj.set_details(
        None,
        &Details::from_pairs([(bundle::LAYOUT, Layout::Note as i64)]),
        true,
    )
    .unwrap();
    assert_eq!(
        Some(Layout::Note as i64),
        obj.details().get_int(bundle::RESOLVED_LAYOUT)
    );

    let own = obj.id().clone();
    let other = fx.create(SmartBlockType::Page, None, |s| add_link(s, "l", &own));
    obj.refresh_backlinks().unwrap();
    assert_eq!(
        vec![other.id().to_string()],
        obj.details().get_list(bundle::BACKLINKS)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn restrictions_guard_applies() {
    let fx = fixture();
    let ws = fx.create(
        SmartBlockType::Workspace,
        Some(UniqueKey::new(SmartBlockType::Workspace, "")),
        |s| s.set_detail(bundle::LAYOUT, Layout::Dashboard as i64),
    );
    let mut obj = ws.lock().await.unwrap();
    assert!(obj.restrictions().has(ObjectRestriction::Delete));
    assert!(obj
        .details()
        .get_list(bundle::RESTRICTIONS)
        .contains(&"delete".to_string()));

    let mut state = obj.new_state();
    state.set_detail(bundle::LAYOUT, Layout::Basic as i64);
    let err = obj.apply(state, &[]).unwrap_err();
    assert!(err.is(ErrorKind::Restricted));
    assert_eq!(
        Some(Layout::Dashboard as i64),
        obj.details().get_int(bundle::LAYOUT)
    );

    let mut state = obj.new_state();
    state.set_detail(bundle::LAYOUT, Layout::Basic as i64);
    obj.apply(state, &[ApplyFlag::NoRestrictions]).unwrap();
    assert_eq!(Some(0), obj.details().get_int(bundle::LAYOUT));
}

#[tokio::test(flavor = "multi_thread")]
async fn system_dataview_relations_are_fixed() {
    let fx = fixture();
    let sb = fx.create(SmartBlockType::Page, None, |s| {
        s.add(Block::new(
            "dv",
            BlockContent::Dataview(Dataview {
                source: vec!["a".into()],
                relation_links: vec![bundle::NAME.into()],
                is_system: true,
            }),
        ));
        s.insert_to("", Position::Inner, &["dv".into()]).unwrap();
    });
    let mut obj = sb.lock().await.unwrap();

    let mut state = obj.new_state();
    if let Some(BlockContent::Dataview(dv)) = state.get("dv").map(|b| &mut b.content) {
        dv.relation_links.push(bundle::TAG.into());
    }
    assert!(obj.apply(state, &[]).unwrap_err().is(ErrorKind::Restricted));

    let mut state = obj.new_state();
    if let Some(BlockContent::Dataview(dv)) = state.get("dv").map(|b| &mut b.content) {
        dv.source.push("b".into());
    }
    obj.apply(state, &[]).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn virtual_objects_are_read_only() {
    let fx = fixture();
    let id = date_object_id("2024-01-02").unwrap();
    let source = fx.svc.new_source(&space(), &id).unwrap();
    let sb = SmartBlock::init(InitContext {
        source,
        env: fx.env.clone(),
        state: None,
        migrations: Vec::new(),
    })
    .unwrap();
    let mut obj = sb.lock().await.unwrap();
    assert_eq!("02 Jan 2024", obj.details().get_string(bundle::NAME));

    let name = Details::from_pairs([(bundle::NAME, "x")]);
    let err = obj.set_details(None, &name, true).unwrap_err();
    assert!(err.is(ErrorKind::Restricted));

    // even without the check, the push fails and nothing changes
    let mut state = obj.new_state();
    state.set_detail(bundle::NAME, "x");
    let err = obj.apply(state, &[ApplyFlag::NoRestrictions]).unwrap_err();
    assert!(err.is(ErrorKind::Restricted));
    assert_eq!("02 Jan 2024", obj.details().get_string(bundle::NAME));
}

#[tokio::test(flavor = "multi_thread")]
async fn hooks_run_around_apply() {
    let fx = fixture();
    let sb = fx.create(SmartBlockType::Page, None, |_| ());
    let mut obj = sb.lock().await.unwrap();

    obj.add_hook(
        HookKind::BeforeApply,
        hook(|info| {
            if info.state.details().get_string(bundle::NAME) == "forbidden" {
                return Err(HeartError::bad_input("forbidden name"));
            }
            info.state.set_detail(bundle::DESCRIPTION, "touched");
            Ok(())
        }),
    );
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    obj.add_hook_once(
        "count",
        HookKind::AfterApply,
        hook(move |info| {
            seen2.lock().unwrap().push(info.changes.len());
            Ok(())
        }),
    );
    let seen3 = seen.clone();
    obj.add_hook_once(
        "count",
        HookKind::AfterApply,
        hook(move |_| {
            seen3.lock().unwrap().push(1000);
            Ok(())
        }),
    );

    let mut state = obj.new_state();
    state.set_detail(bundle::NAME, "forbidden");
    assert!(obj.apply(state, &[]).unwrap_err().is(ErrorKind::BadInput));
    assert!(!obj.details().has(bundle::NAME));

    let mut state = obj.new_state();
    state.set_detail(bundle::NAME, "fine");
    obj.apply(state, &[]).unwrap();
    assert_eq!("touched", obj.details().get_string(bundle::DESCRIPTION));
    assert_eq!(vec![2], *seen.lock().unwrap());

    let mut state = obj.new_state();
    state.set_detail(bundle::NAME, "quiet");
    obj.apply(state, &[ApplyFlag::NoHooks]).unwrap();
    assert_eq!(1, seen.lock().unwrap().len());
}

#[tokio::test(flavor = "multi_thread")]
async fn undo_and_redo_per_session() {
    let fx = fixture();
    let sb = fx.create(SmartBlockType::Page, None, |_| ());
    let s1 = SessionId::from("s1");
    let mut obj = sb.lock().await.unwrap();

    let mut state = obj.new_state_ctx(Some(s1.clone()));
    add_text(&mut state, "b1", "a");
    obj.apply(state, &[]).unwrap();

    let mut state = obj.new_state_ctx(Some(s1.clone()));
    state.get("b1").unwrap().as_text_mut().unwrap().text = "b".into();
    state.set_caret(Some(Caret {
        block_id: "b1".into(),
        range: (1, 1),
    }));
    obj.apply(state, &[]).unwrap();
    assert_eq!(2, obj.history_len(Some(&s1)));

    let text = |o: &Object| o.doc().pick("b1").and_then(|b| b.as_text()).map(|t| t.text.clone());

    let caret = obj.undo(Some(s1.clone())).unwrap();
    assert_eq!(Some("a".to_string()), text(&*obj));
    assert_eq!("b1", caret.unwrap().block_id);

    obj.redo(Some(s1.clone())).unwrap();
    assert_eq!(Some("b".to_string()), text(&*obj));

    obj.undo(Some(s1.clone())).unwrap();
    obj.undo(Some(s1.clone())).unwrap();
    assert!(!obj.doc().exists("b1"));
    assert!(obj.undo(Some(s1.clone())).unwrap_err().is(ErrorKind::NotFound));

    // other sessions have their own history
    assert!(obj
        .undo(Some(SessionId::from("s2")))
        .unwrap_err()
        .is(ErrorKind::NotFound));
}

#[tokio::test(flavor = "multi_thread")]
async fn history_is_bounded() {
    let fx = fixture();
    let sb = fx.create(SmartBlockType::Page, None, |_| ());
    let mut obj = sb.lock().await.unwrap();
    for i in 0..(HISTORY_LIMIT + 10) {
        let mut state = obj.new_state();
        state.set_detail(bundle::NAME, format!("n{i}"));
        obj.apply(state, &[]).unwrap();
    }
    assert_eq!(HISTORY_LIMIT, obj.history_len(None));
}

#[tokio::test(flavor = "multi_thread")]
async fn dependency_details_follow_the_index() {
    let mut fx = fixture();
    let target = fx.create(SmartBlockType::Page, None, |s| {
        s.set_detail(bundle::NAME, "target")
    });
    let target_id = target.id().clone();
    let page = fx.create(SmartBlockType::Page, None, |s| {
        add_link(s, "l", &target_id)
    });
    let s1 = SessionId::from("s1");

    {
        let mut obj = page.lock().await.unwrap();
        let view = obj.show(Some(&s1)).unwrap();
        assert_eq!(2, view.details.len());
        assert!(obj.dependency_ids().contains(&target_id));
        assert_eq!(page.id(), &view.root_id);
    }
    fx.drain();

    {
        let mut t = target.lock().await.unwrap();
        t.set_details(
            None,
            &Details::from_pairs([(bundle::NAME, "renamed")]),
            true,
        )
        .unwrap();
    }
    let got = fx.drain();
    assert!(got.iter().any(|(to, e)| {
        to.as_ref() == Some(&s1)
            && e.context_id == *page.id()
            && matches!(
                &e.messages[0],
                EventMessage::ObjectDetailsSet { id, details, .. }
                    if *id == target_id
                        && details.get_string(bundle::NAME) == "renamed"
            )
    }));
}

#[tokio::test(flavor = "multi_thread")]
async fn collections_add_at_top() {
    let fx = fixture();
    let sb = fx.create(
        SmartBlockType::Archive,
        Some(UniqueKey::new(SmartBlockType::Archive, "")),
        |_| (),
    );
    let mut obj = sb.lock().await.unwrap();
    let ids = |v: &[&str]| v.iter().map(|s| ObjectId::from(*s)).collect::<Vec<_>>();

    obj.collection_add(&ids(&["a", "b"])).unwrap();
    obj.collection_add(&ids(&["c", "a"])).unwrap();
    assert_eq!(ids(&["c", "a", "b"]), obj.collection());
    assert!(obj.collection_has(&"b".into()));

    obj.collection_remove(&ids(&["a"])).unwrap();
    assert_eq!(ids(&["c", "b"]), obj.collection());
    let read = obj.source().read_doc().unwrap();
    assert_eq!(vec!["c".to_string(), "b".to_string()], read.link_ids());
}

#[tokio::test(flavor = "multi_thread")]
async fn pending_local_details_flush_on_init() {
    let fx = fixture();
    let uk = UniqueKey::new(SmartBlockType::Page, "p");
    let id = uk.derive_object_id(&space());
    fx.env
        .index
        .update_pending_details(&id, |d| d.set(bundle::LAST_OPENED_DATE, 42i64))
        .unwrap();
    let sb = fx.create(SmartBlockType::Page, Some(uk), |_| ());
    let obj = sb.lock().await.unwrap();
    assert_eq!(Some(42), obj.details().get_int(bundle::LAST_OPENED_DATE));
    assert!(fx.env.index.pending_details(&id).unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn reload_picks_up_foreign_changes() {
    let fx = fixture();
    let sb = fx.create(SmartBlockType::Page, None, |_| ());
    let mut obj = sb.lock().await.unwrap();

    let mut state = obj.doc().new_state();
    state.set_detail(bundle::NAME, "remote");
    let applied = state.apply_state().unwrap();
    obj.source()
        .push_change(PushChangeParams {
            state: &applied.state,
            changes: applied.changes,
            time: None,
            do_snapshot: false,
        })
        .unwrap();
    assert!(!obj.details().has(bundle::NAME));

    obj.reload_from_source().unwrap();
    assert_eq!("remote", obj.details().get_string(bundle::NAME));
    assert_eq!(
        obj.source().heads().unwrap(),
        vec![obj.doc().change_id().unwrap().clone()]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn closing_respects_locks_and_idle_time() {
    let fx = fixture();
    let sb = fx.create(SmartBlockType::Page, None, |_| ());
    assert_eq!(Status::Open, sb.status());
    {
        let _guard = sb.lock().await.unwrap();
        assert!(sb.is_locked());
        assert!(!sb.try_close(Duration::ZERO));
    }
    assert!(!sb.try_close(Duration::from_secs(60)));
    assert!(sb.try_close(Duration::ZERO));
    assert_eq!(Status::Closed, sb.status());
    assert!(matches!(
        sb.lock().await.unwrap_err(),
        HeartError::ClosedObject(_)
    ));
    sb.close().await;
    assert_eq!(Status::Closed, sb.status());
}

#[tokio::test(flavor = "multi_thread")]
async fn init_runs_migrations_quietly() {
    let fx = fixture();
    let (id, seed) = SourceService::new_object_id(&space(), None);
    let state = State::new(id, space(), SmartBlockType::Page);
    let source = fx.svc.create_tree(&state, seed).unwrap();
    let sb = SmartBlock::init(InitContext {
        source,
        env: fx.env.clone(),
        state: None,
        migrations: vec![Box::new(|s: &mut State| {
            s.set_object_type_keys(vec![type_key::NOTE.into()])
        }) as Migration],
    })
    .unwrap();
    let obj = sb.lock().await.unwrap();
    assert_eq!(Some(type_key::NOTE), obj.doc().object_type_key());
    assert_eq!(0, obj.history_len(None));
    assert_eq!(
        Some(type_key::NOTE),
        obj.source().read_doc().unwrap().object_type_key()
    );
}
