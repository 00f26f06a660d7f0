use super::*;
use crate::factories::mem_kv_store::MemKvStore;
use crate::state::Position;

fn service(seed: u8) -> (SourceService, DynKvStore) {
    let store = MemKvStore::create();
    (
        SourceService::new(store.clone(), SigningKey::from_bytes(&[seed; 32])),
        store,
    )
}

fn space() -> SpaceId {
    SpaceId::from("space1")
}

fn new_page(svc: &SourceService, uk: Option<UniqueKey>) -> (DynSource, State) {
    let (id, seed) = SourceService::new_object_id(&space(), uk.as_ref());
    let mut state = State::new(id, space(), SmartBlockType::Page);
    state.set_unique_key(uk);
    state.add(Block::text("t", "hello"));
    state.insert_to("", Position::Inner, &["t".into()]).unwrap();
    let src = svc.create_tree(&state, seed).unwrap();
    (src, state)
}

fn edit(src: &DynSource, doc: &State, f: impl FnOnce(&mut State)) -> State {
    let mut s = doc.new_state();
    f(&mut s);
    let applied = s.apply_state().unwrap();
    src.push_change(PushChangeParams {
        state: &applied.state,
        changes: applied.changes,
        time: None,
        do_snapshot: false,
    })
    .unwrap();
    applied.state
}

#[test]
fn create_push_and_read_back() {
    let (svc, _) = service(1);
    let (src, doc) = new_page(&svc, None);
    assert_eq!(doc.to_snapshot(), src.read_doc().unwrap().to_snapshot());

    let doc = edit(&src, &doc, |s| s.set_detail(bundle::NAME, "n"));
    let doc = edit(&src, &doc, |s| {
        s.get("t").unwrap().as_text_mut().unwrap().text = "bye".into();
    });
    let read = src.read_doc().unwrap();
    assert_eq!(doc.to_snapshot(), read.to_snapshot());
    assert_eq!("bye", read.snippet());
    assert_eq!(src.heads().unwrap(), vec![read.change_id().unwrap().clone()]);

    let info = src.creation_info().unwrap();
    assert_eq!(Some(svc.account().clone()), info.creator);
    assert!(info.created > 0);

    // the change log survives reopening the source
    let again = svc.new_source(&space(), src.id()).unwrap();
    assert_eq!(doc.to_snapshot(), again.read_doc().unwrap().to_snapshot());
}

#[test]
fn derived_ids_are_unique_per_space() {
    let (svc, _) = service(1);
    let uk = UniqueKey::new(SmartBlockType::Page, "p1");
    let (src, _) = new_page(&svc, Some(uk.clone()));
    assert_eq!(&uk.derive_object_id(&space()), src.id());
    assert_eq!(Some(&uk), src.unique_key());

    let (id, seed) = SourceService::new_object_id(&space(), Some(&uk));
    let state = State::new(id, space(), SmartBlockType::Page);
    let err = svc.create_tree(&state, seed).unwrap_err();
    assert!(err.is(ErrorKind::AlreadyExists));
}

#[test]
fn snapshots_are_embedded_periodically() {
    let (svc, store) = service(1);
    let (src, mut doc) = new_page(&svc, None);
    for i in 0..(SNAPSHOT_EVERY + 5) {
        doc = edit(&src, &doc, |s| s.set_detail(bundle::NAME, format!("n{i}")));
    }
    let meta = svc.tree_meta(&space(), src.id()).unwrap().unwrap();
    assert_eq!(5, meta.since_snapshot);

    let with_snapshot = store
        .iter_prefix(&changes_prefix(&space(), src.id()))
        .unwrap()
        .into_iter()
        .filter(|(_, v)| {
            let raw: RawChange = serde_json::from_slice(v).unwrap();
            raw.verify().unwrap().snapshot.is_some()
        })
        .count();
    assert_eq!(2, with_snapshot);

    let read = src.read_doc().unwrap();
    assert_eq!(
        format!("n{}", SNAPSHOT_EVERY + 4),
        read.details().get_string(bundle::NAME)
    );
}

#[test]
fn tombstone_hides_the_object() {
    let (svc, _) = service(1);
    let (src, _) = new_page(&svc, None);
    svc.delete_tree(&space(), src.id()).unwrap();
    assert!(src.read_doc().unwrap_err().is(ErrorKind::NotFound));
    assert!(svc
        .new_source(&space(), src.id())
        .unwrap_err()
        .is(ErrorKind::NotFound));
    // deleting twice is fine
    svc.delete_tree(&space(), src.id()).unwrap();
}

#[test]
fn remote_changes_replicate_and_merge() {
    let (a, _) = service(1);
    let (b, _) = service(2);
    let (src_a, doc) = new_page(&a, None);
    let doc = edit(&src_a, &doc, |s| s.set_detail(bundle::NAME, "a"));

    for raw in a.changes_after(&space(), src_a.id(), &[]).unwrap() {
        assert!(b.apply_remote_change(&space(), &raw).unwrap());
        assert!(!b.apply_remote_change(&space(), &raw).unwrap());
    }
    let src_b = b.new_source(&space(), src_a.id()).unwrap();
    assert_eq!(doc.to_snapshot(), src_b.read_doc().unwrap().to_snapshot());

    // concurrent edits on both sides
    let doc_b = src_b.read_doc().unwrap();
    edit(&src_a, &doc, |s| s.set_detail(bundle::DESCRIPTION, "from a"));
    edit(&src_b, &doc_b, |s| s.set_detail(bundle::ICON_EMOJI, "b"));

    let known_b = b.heads(&space(), src_a.id()).unwrap();
    let known_a = a.heads(&space(), src_a.id()).unwrap();
    for raw in a.changes_after(&space(), src_a.id(), &[]).unwrap() {
        b.apply_remote_change(&space(), &raw).unwrap();
    }
    for raw in b.changes_after(&space(), src_a.id(), &[]).unwrap() {
        a.apply_remote_change(&space(), &raw).unwrap();
    }
    assert_ne!(known_a, known_b);
    assert_eq!(2, a.heads(&space(), src_a.id()).unwrap().len());

    let merged_a = src_a.read_doc().unwrap();
    let merged_b = src_b.read_doc().unwrap();
    assert_eq!(merged_a.to_snapshot(), merged_b.to_snapshot());
    assert_eq!("from a", merged_a.details().get_string(bundle::DESCRIPTION));
    assert_eq!("b", merged_a.details().get_string(bundle::ICON_EMOJI));
}

#[test]
fn remote_change_needs_its_prevs() {
    let (a, _) = service(1);
    let (b, _) = service(2);
    let (src, doc) = new_page(&a, None);
    edit(&src, &doc, |s| s.set_detail(bundle::NAME, "x"));
    let changes = a.changes_after(&space(), src.id(), &[]).unwrap();
    assert_eq!(2, changes.len());

    let err = b.apply_remote_change(&space(), &changes[1]).unwrap_err();
    assert!(err.is(ErrorKind::NotFound));

    let err = b.apply_remote_change(&"other".into(), &changes[0]).unwrap_err();
    assert!(err.is(ErrorKind::BadInput));

    let mut forged = changes[0].clone();
    forged.signature = bytes::Bytes::from_static(&[0; 64]);
    let err = b.apply_remote_change(&space(), &forged).unwrap_err();
    assert!(err.is(ErrorKind::CorruptRecord));
}

#[tokio::test(flavor = "multi_thread")]
async fn notices_are_announced() {
    let (svc, _) = service(1);
    let mut rx = svc.subscribe_changes();
    let (src, _) = new_page(&svc, None);
    let notice = rx.recv().await.unwrap();
    assert!(notice.local);
    assert_eq!(src.id(), &notice.tree_id);
    assert_eq!(src.heads().unwrap()[0], notice.change.id);
}

#[test]
fn store_change_accepts_only_store_ops() {
    let (svc, _) = service(1);
    let (src, _) = new_page(&svc, None);
    src.push_store_change(vec![ChangeContent::StoreKeySet {
        path: "a/b".into(),
        value: "v".into(),
    }])
    .unwrap();
    assert_eq!(
        Some(&Value::from("v")),
        src.read_doc().unwrap().store().get("a/b")
    );
    let err = src
        .push_store_change(vec![ChangeContent::Tombstone])
        .unwrap_err();
    assert!(err.is(ErrorKind::BadInput));
}

#[test]
fn virtual_sources() {
    let (svc, _) = service(1);
    let id = date_object_id("2024-01-02").unwrap();
    assert_eq!("_date-2024-01-02", id.as_str());
    let src = svc.new_source(&space(), &id).unwrap();
    assert!(src.read_only());
    assert_eq!(SmartBlockType::Date, src.sb_type());
    let doc = src.read_doc().unwrap();
    assert_eq!("02 Jan 2024", doc.details().get_string(bundle::NAME));
    assert_eq!(Some("date"), doc.object_type_key());
    let applied = doc.new_state().apply_state().unwrap();
    let err = src
        .push_change(PushChangeParams {
            state: &applied.state,
            changes: vec![],
            time: None,
            do_snapshot: false,
        })
        .unwrap_err();
    assert!(err.is(ErrorKind::Restricted));

    assert!(date_object_id("2024-13-01").unwrap_err().is(ErrorKind::BadInput));

    let profile = svc
        .new_source(&space(), &ObjectId::from("_anytype_profile"))
        .unwrap();
    assert_eq!(
        "Anytype",
        profile.read_doc().unwrap().details().get_string(bundle::NAME)
    );
    assert!(svc
        .new_source(&space(), &ObjectId::from("bafyunknown"))
        .unwrap_err()
        .is(ErrorKind::NotFound));
}
