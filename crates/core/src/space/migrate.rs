//! One-shot migration of sub-objects embedded in the workspace.
//!
//! Old workspaces keep relations, types and options in their store under
//! `<prefix>/<key>` (prefix of the sub-object's smartblock type), each
//! value the json of the sub-object's details. Other objects reference
//! them by [legacy_object_id]. Migrating creates a derived object per
//! entry, points every reference at it and drops the store entry.

use super::*;
use std::collections::BTreeMap;

const LEGACY_TYPES: &[(SmartBlockType, &str)] = &[
    (SmartBlockType::Relation, type_key::RELATION),
    (SmartBlockType::ObjectType, type_key::OBJECT_TYPE),
    (SmartBlockType::RelationOption, type_key::RELATION_OPTION),
];

/// The id old data used to reference an embedded sub-object.
pub fn legacy_object_id(unique_key: &UniqueKey) -> ObjectId {
    ObjectId::from(format!("_{}", unique_key.marshal()))
}

struct Entry {
    path: String,
    unique_key: UniqueKey,
    type_key: &'static str,
    details: Option<Details>,
}

fn legacy_entries(doc: &State) -> Vec<Entry> {
    doc.store()
        .iter()
        .filter_map(|(path, value)| {
            let (prefix, key) = path.split_once('/')?;
            let (sb_type, type_key) = LEGACY_TYPES
                .iter()
                .find(|(t, _)| t.prefix() == prefix)
                .copied()?;
            let details = value
                .as_str()
                .and_then(|s| serde_json::from_str::<Details>(s).ok());
            Some(Entry {
                path: path.clone(),
                unique_key: UniqueKey::new(sb_type, key),
                type_key,
                details,
            })
        })
        .collect()
}

fn replace(v: &mut String, map: &BTreeMap<String, String>) -> bool {
    match map.get(v.as_str()) {
        Some(new) => {
            *v = new.clone();
            true
        }
        None => false,
    }
}

/// Point every reference in `state` found in `map` at its new id.
pub(crate) fn rewrite_references(
    state: &mut State,
    map: &BTreeMap<String, String>,
) {
    let mut ids = Vec::new();
    state.iterate(|b| {
        if b.link_targets()
            .iter()
            .chain(b.mention_targets().iter())
            .any(|t| map.contains_key(t))
        {
            ids.push(b.id.clone());
        }
        true
    });
    for id in ids {
        let Some(block) = state.get(&id) else {
            continue;
        };
        match &mut block.content {
            BlockContent::Link(l) => {
                replace(&mut l.target_block_id, map);
            }
            BlockContent::File(f) => {
                replace(&mut f.target_object_id, map);
            }
            BlockContent::Text(t) => {
                for m in t.marks.iter_mut() {
                    if matches!(m.kind, MarkKind::Object | MarkKind::Mention) {
                        replace(&mut m.param, map);
                    }
                }
            }
            BlockContent::Dataview(d) => {
                for s in d.source.iter_mut() {
                    replace(s, map);
                }
            }
            _ => (),
        }
    }

    for key in bundle::OBJECT_KEYS.iter().copied() {
        let new = match state.details().get(key) {
            Some(Value::String(s)) => match map.get(s) {
                Some(n) => Value::String(n.clone()),
                None => continue,
            },
            Some(Value::List(l)) if l.iter().any(|s| map.contains_key(s)) => {
                Value::List(
                    l.iter()
                        .map(|s| map.get(s).unwrap_or(s).clone())
                        .collect(),
                )
            }
            _ => continue,
        };
        state.set_detail(key, new);
    }
}

impl Space {
    /// Turn the workspace's embedded sub-objects into objects of their
    /// own. Returns how many entries were migrated; running it again
    /// once everything is migrated does nothing.
    pub async fn migrate_sub_objects(&self) -> HeartResult<usize> {
        let workspace = self.predefined_ids().workspace;
        let entries = self
            .do_object(&workspace, |obj| Ok(legacy_entries(obj.doc())))
            .await?;
        if entries.is_empty() {
            return Ok(0);
        }

        let mut map = BTreeMap::new();
        for e in entries.iter() {
            let new_id = self.derive_object_id(&e.unique_key);
            map.insert(
                legacy_object_id(&e.unique_key).to_string(),
                new_id.to_string(),
            );
            if self.sources().tree_meta(self.id(), &new_id)?.is_some() {
                continue;
            }
            let params = CreateObjectParams {
                unique_key: Some(e.unique_key.clone()),
                type_key: Some(e.type_key.to_string()),
                details: e.details.clone().unwrap_or_default(),
                ..Default::default()
            };
            match self.create_tree_object(params).await {
                Ok(_) => (),
                Err(err) if err.is(ErrorKind::AlreadyExists) => (),
                Err(err) => return Err(err),
            }
        }

        for id in self.sources().tree_ids(self.id())? {
            if self.index().get(&id)?.is_some() {
                continue;
            }
            if let Err(err) = self.get_object(&id).await {
                tracing::debug!(?err, %id, "not indexed for migration");
            }
        }

        let old_ids: Vec<&String> = map.keys().collect();
        let referencing = self.index().query(Some(self.id()), |r| {
            r.id != workspace
                && (r.links.iter().any(|l| old_ids.contains(&&l.to_string()))
                    || bundle::OBJECT_KEYS.iter().any(|k| {
                        r.details
                            .get_list(k)
                            .iter()
                            .any(|v| old_ids.contains(&v))
                    }))
        })?;
        for r in referencing {
            let res = self
                .do_object(&r.id, |obj| {
                    let mut state = obj.new_state();
                    rewrite_references(&mut state, &map);
                    obj.apply(
                        state,
                        &[
                            ApplyFlag::NoHistory,
                            ApplyFlag::NoRestrictions,
                            ApplyFlag::SkipIfNoChanges,
                        ],
                    )
                })
                .await;
            if let Err(err) = res {
                tracing::warn!(?err, id = %r.id, "reference rewrite failed");
            }
        }

        let count = entries.len();
        self.do_object(&workspace, |obj| {
            let mut state = obj.new_state();
            rewrite_references(&mut state, &map);
            for e in entries.iter() {
                state.remove_from_store(&e.path);
            }
            obj.apply(
                state,
                &[
                    ApplyFlag::NoHistory,
                    ApplyFlag::NoEvent,
                    ApplyFlag::NoRestrictions,
                ],
            )
        })
        .await?;
        tracing::info!(space = %self.id(), count, "sub-objects migrated");
        Ok(count)
    }
}
