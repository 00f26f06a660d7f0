use super::*;
use crate::factories::mem_kv_store::MemKvStore;

fn record(id: &str, space: &str, links: &[&str]) -> ObjectRecord {
    ObjectRecord {
        id: id.into(),
        space_id: space.into(),
        sb_type: SmartBlockType::Page,
        details: Details::from_pairs([(bundle::NAME, id)]),
        links: links.iter().map(|l| ObjectId::from(*l)).collect(),
        heads: Vec::new(),
    }
}

#[derive(Default)]
struct Collect(Mutex<Vec<ObjectRecord>>);

impl DetailsListener for Collect {
    fn on_details(&self, record: &ObjectRecord) {
        self.0.lock().unwrap().push(record.clone());
    }
}

#[test]
fn backlinks_follow_link_changes() {
    let index = ObjectIndex::new(MemKvStore::create());
    let mut rx = index.backlink_updates();

    index.update(record("a", "s1", &["b", "c"])).unwrap();
    index.update(record("d", "s1", &["b"])).unwrap();
    assert_eq!(
        vec![ObjectId::from("a"), ObjectId::from("d")],
        index.backlinks(&"b".into()).unwrap()
    );

    index.update(record("a", "s1", &["c"])).unwrap();
    assert_eq!(
        vec![ObjectId::from("d")],
        index.backlinks(&"b".into()).unwrap()
    );

    let mut announced = Vec::new();
    while let Ok(id) = rx.try_recv() {
        announced.push(id.to_string());
    }
    assert_eq!(vec!["b", "c", "b", "b"], announced);

    index.remove(&"d".into()).unwrap();
    assert!(index.backlinks(&"b".into()).unwrap().is_empty());
    assert!(index.get(&"d".into()).unwrap().is_none());
}

#[test]
fn subscribers_see_detail_changes_only() {
    let index = ObjectIndex::new(MemKvStore::create());
    let seen = Arc::new(Collect::default());
    let sub = index.subscribe([ObjectId::from("a")], seen.clone());

    index.update(record("a", "s1", &[])).unwrap();
    index.update(record("b", "s1", &[])).unwrap();
    // same details, other links: no notification
    index.update(record("a", "s1", &["b"])).unwrap();
    assert_eq!(1, seen.0.lock().unwrap().len());

    sub.set_ids([ObjectId::from("b")]);
    let mut b = record("b", "s1", &[]);
    b.details.set(bundle::NAME, "renamed");
    index.update(b).unwrap();
    assert_eq!(2, seen.0.lock().unwrap().len());

    drop(sub);
    index.set_record_detail(&"b".into(), bundle::NAME, "again".into()).unwrap();
    assert_eq!(2, seen.0.lock().unwrap().len());
    assert_eq!(
        "again",
        index.get(&"b".into()).unwrap().unwrap().details.get_string(bundle::NAME)
    );
}

#[test]
fn query_by_space() {
    let index = ObjectIndex::new(MemKvStore::create());
    index.update(record("a", "s1", &[])).unwrap();
    index.update(record("b", "s2", &[])).unwrap();
    index.update(record("c", "s2", &[])).unwrap();

    assert_eq!(3, index.query(None, |_| true).unwrap().len());
    let s2 = index.query(Some(&"s2".into()), |_| true).unwrap();
    assert_eq!(2, s2.len());
    let named_c = index
        .query(None, |r| r.details.get_string(bundle::NAME) == "c")
        .unwrap();
    assert_eq!(ObjectId::from("c"), named_c[0].id);
    assert_eq!(
        Some(SpaceId::from("s2")),
        index.space_of(&"b".into()).unwrap()
    );
}

#[test]
fn pending_details_side_table() {
    let index = ObjectIndex::new(MemKvStore::create());
    let id = ObjectId::from("x");
    index
        .update_pending_details(&id, |d| d.set(bundle::LAST_OPENED_DATE, 7i64))
        .unwrap();
    index
        .update_pending_details(&id, |d| d.set(bundle::SPACE_LOCAL_STATUS, 1i64))
        .unwrap();
    let taken = index.take_pending_details(&id).unwrap();
    assert_eq!(Some(7), taken.get_int(bundle::LAST_OPENED_DATE));
    assert_eq!(Some(1), taken.get_int(bundle::SPACE_LOCAL_STATUS));
    assert!(index.pending_details(&id).unwrap().is_empty());
}
