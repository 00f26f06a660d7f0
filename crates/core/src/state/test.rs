use super::*;

fn page() -> State {
    State::new("obj1".into(), "space1".into(), SmartBlockType::Page)
}

fn with_text(base: &State, id: &str, text: &str) -> State {
    let mut s = base.new_state();
    s.add(Block::text(id, text));
    s.insert_to("", Position::Inner, &[id.to_string()]).unwrap();
    s
}

#[test]
fn add_and_insert_emit_block_add_and_children() {
    let base = page();
    let applied = with_text(&base, "t1", "hello").apply_state().unwrap();

    assert!(matches!(
        &applied.events[0],
        EventMessage::BlockAdd { blocks } if blocks[0].id == "t1"
    ));
    assert!(applied.events.iter().any(|e| matches!(
        e,
        EventMessage::BlockSetChildrenIds { id, children_ids }
            if id == "obj1" && children_ids == &vec!["t1".to_string()]
    )));
    assert_eq!(2, applied.changes.len());
    assert!(applied.state.parent().is_none());
    assert_eq!("hello", applied.state.snippet());
}

#[test]
fn insert_positions() {
    let mut s = page().new_state();
    for id in ["a", "b", "c", "d", "e"] {
        s.add(Block::text(id, id));
    }
    s.insert_to("", Position::Inner, &["a".into()]).unwrap();
    s.insert_to("a", Position::Bottom, &["c".into()]).unwrap();
    s.insert_to("c", Position::Top, &["b".into()]).unwrap();
    s.insert_to("c", Position::Replace, &["d".into()]).unwrap();
    s.insert_to("a", Position::Inner, &["e".into()]).unwrap();
    assert_eq!(
        vec!["a", "b", "d"],
        s.pick("obj1").unwrap().children_ids
    );
    assert_eq!(vec!["e"], s.pick("a").unwrap().children_ids);

    // moving keeps a single parent
    s.insert_to("d", Position::Bottom, &["e".into()]).unwrap();
    assert!(s.pick("a").unwrap().children_ids.is_empty());
    assert_eq!("obj1", s.parent_of("e").unwrap().id);

    assert!(s
        .insert_to("nope", Position::Inner, &["a".into()])
        .unwrap_err()
        .is(ErrorKind::NotFound));
    assert!(s
        .insert_to("", Position::Top, &["a".into()])
        .unwrap_err()
        .is(ErrorKind::BadInput));

    let mut order = Vec::new();
    s.iterate(|b| {
        order.push(b.id.clone());
        true
    });
    assert_eq!(vec!["obj1", "a", "b", "d", "e"], order);
}

#[test]
fn unlinked_blocks_are_dropped_on_apply() {
    let base = with_text(&page(), "t1", "x").apply_state().unwrap().state;
    let mut s = base.new_state();
    assert!(s.unlink("t1"));
    assert!(s.exists("t1"));
    let applied = s.apply_state().unwrap();
    assert!(!applied.state.exists("t1"));
    assert!(applied
        .changes
        .contains(&ChangeContent::BlockRemove { id: "t1".into() }));
    assert!(applied.events.iter().any(|e| matches!(
        e,
        EventMessage::BlockDelete { block_ids } if block_ids == &vec!["t1".to_string()]
    )));
}

#[test]
fn remove_takes_descendants_but_never_root() {
    let mut s = page().new_state();
    s.add(Block::text("a", "a"));
    s.add(Block::text("b", "b"));
    s.insert_to("", Position::Inner, &["a".into()]).unwrap();
    s.insert_to("a", Position::Inner, &["b".into()]).unwrap();
    assert!(s.remove("a"));
    assert!(!s.exists("b"));
    assert!(!s.remove("obj1"));
    assert!(!s.remove("a"));
}

#[test]
fn text_edit_carries_only_changed_fields() {
    let base = with_text(&page(), "t1", "x").apply_state().unwrap().state;
    let mut s = base.new_state();
    s.get("t1").unwrap().as_text_mut().unwrap().text = "y".into();
    assert_eq!(vec!["t1"], s.active_block_ids().collect::<Vec<_>>());
    let applied = s.apply_state().unwrap();
    assert_eq!(
        vec![EventMessage::BlockSetText {
            id: "t1".into(),
            text: Some("y".into()),
            style: None,
            marks: None,
            checked: None,
        }],
        applied.events
    );
}

#[test]
fn set_detail_twice_emits_once() {
    let base = page();
    let mut s = base.new_state();
    s.set_detail(bundle::NAME, "n");
    let first = s.apply_state().unwrap();
    assert_eq!(1, first.events.len());
    assert_eq!(
        vec![ChangeContent::DetailsSet {
            key: bundle::NAME.into(),
            value: "n".into(),
        }],
        first.changes
    );

    let mut s = first.state.new_state();
    s.set_detail(bundle::NAME, "n");
    assert!(s.is_unchanged());
    let second = s.apply_state().unwrap();
    assert!(second.events.is_empty());
    assert!(second.changes.is_empty());
}

#[test]
fn local_details_emit_events_but_no_changes() {
    let mut s = page().new_state();
    s.set_detail(bundle::LAST_OPENED_DATE, 5i64);
    assert!(s.details().is_empty());
    assert_eq!(Some(5), s.local_details().get_int(bundle::LAST_OPENED_DATE));
    let applied = s.apply_state().unwrap();
    assert!(applied.changes.is_empty());
    assert_eq!(1, applied.events.len());
    assert!(applied.events[0].is_details());

    let combined = applied.state.combined_details();
    assert_eq!(Some(5), combined.get_int(bundle::LAST_OPENED_DATE));
}

#[test]
fn schema_and_store_changes() {
    let mut s = page().new_state();
    s.set_object_type_keys(vec![type_key::PAGE.into()]);
    s.add_relation_links(&[RelationLink {
        key: bundle::TAG.into(),
        format: "tag".into(),
    }]);
    s.set_in_store("rel/tag/name", "Tag".into());
    let applied = s.apply_state().unwrap();
    assert!(applied.changes.contains(&ChangeContent::ObjectTypeAdd {
        key: type_key::PAGE.into()
    }));
    assert!(applied.changes.iter().any(|c| matches!(
        c,
        ChangeContent::RelationAdd { links } if links[0].key == bundle::TAG
    )));
    assert!(applied.changes.contains(&ChangeContent::StoreKeySet {
        path: "rel/tag/name".into(),
        value: "Tag".into(),
    }));

    let mut s = applied.state.new_state();
    s.remove_relation_keys(&[bundle::TAG.into()]);
    s.remove_from_store("rel/tag/name");
    let applied = s.apply_state().unwrap();
    assert!(applied.events.iter().any(|e| matches!(
        e,
        EventMessage::ObjectRelationsRemove { keys, .. } if keys[0] == bundle::TAG
    )));
    assert!(applied.changes.contains(&ChangeContent::StoreKeyUnset {
        path: "rel/tag/name".into()
    }));
}

#[test]
fn replaying_changes_reproduces_the_state() {
    let base = page();
    let mut s = with_text(&base, "t1", "hello");
    s.set_detail(bundle::NAME, "title");
    s.set_object_type_keys(vec![type_key::NOTE.into()]);
    let applied = s.apply_state().unwrap();

    let mut replay = page();
    for c in applied.changes.iter() {
        replay.apply_change(c);
    }
    assert_eq!(applied.state.to_snapshot(), replay.to_snapshot());
}

#[test]
fn intermediate_apply_merges_into_parent() {
    let base = page();
    let mut outer = base.new_state();
    outer.set_detail(bundle::NAME, "a");

    let mut inner = outer.new_state();
    inner.set_detail(bundle::DESCRIPTION, "d");
    let merged = inner.apply_state().unwrap();
    assert!(merged.events.is_empty());
    assert!(merged.changes.is_empty());
    assert!(merged.state.parent().is_some());

    let applied = merged.state.apply_state().unwrap();
    assert_eq!(2, applied.changes.len());
    assert_eq!("d", applied.state.details().get_string(bundle::DESCRIPTION));
}

#[test]
fn snippet_skips_title_and_is_bounded() {
    let mut s = page().new_state();
    let mut title = Block::text("title", "The title");
    title.as_text_mut().unwrap().style = TextStyle::Title;
    s.add(title);
    s.add(Block::text("a", "  first  "));
    s.add(Block::text("b", "x".repeat(400)));
    s.add(Block::text("c", "never reached"));
    s.insert_to(
        "",
        Position::Inner,
        &["title".into(), "a".into(), "b".into(), "c".into()],
    )
    .unwrap();

    let snippet = s.snippet();
    assert!(snippet.starts_with("first\nxxx"));
    assert_eq!(SNIPPET_MAX, snippet.chars().count());
    assert!(s.search_text().starts_with("The title\nfirst"));
    assert!(s.search_text().ends_with("never reached"));
}

#[test]
fn links_and_mentions_follow_tree_order() {
    let mut s = page().new_state();
    s.add(Block::link("l1", "b"));
    s.add(Block::link("l2", "a"));
    s.add(Block::link("l3", "b"));
    s.insert_to("", Position::Inner, &["l1".into(), "l2".into(), "l3".into()])
        .unwrap();
    assert_eq!(vec!["b", "a"], s.link_ids());
    assert!(s.mention_ids().is_empty());
}

#[test]
fn snapshot_migrates_type_ids() {
    let snap = Snapshot {
        object_types: vec!["_otpage".into(), "ot-note".into(), "page".into()],
        ..Default::default()
    };
    let s = State::from_snapshot(
        "o".into(),
        "s".into(),
        SmartBlockType::Page,
        snap,
    );
    assert_eq!(&["page".to_string(), "note".to_string()], s.object_type_keys());
    assert!(s.exists("o"));
}

#[test]
fn internal_flags_and_tombstone() {
    let mut s = page().new_state();
    s.add_internal_flag("templateNotCommitted");
    assert!(s.has_internal_flag("templateNotCommitted"));
    s.clear_internal_flags();
    assert!(!s.has_internal_flag("templateNotCommitted"));

    s.set_tombstone();
    let applied = s.apply_state().unwrap();
    assert_eq!(vec![ChangeContent::Tombstone], applied.changes);
    assert!(applied.state.is_tombstone());
}

#[test]
fn apply_without_parent_fails() {
    assert!(page().apply_state().is_err());
}
