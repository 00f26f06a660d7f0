use crate::state::State;
use heart_api::{block::*, *};
use std::collections::BTreeSet;

/// What may not be done to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectRestriction {
    /// The object cannot be deleted or archived.
    Delete,
    /// Relation links cannot change.
    Relations,
    /// Stored details cannot change.
    Details,
    /// Blocks cannot change.
    Blocks,
    /// The object type cannot change.
    TypeChange,
    /// The layout cannot change.
    LayoutChange,
    /// No template can be made from the object.
    Template,
    /// The object cannot be duplicated.
    Duplication,
}

impl ObjectRestriction {
    /// Name used in the `restrictions` detail.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delete => "delete",
            Self::Relations => "relations",
            Self::Details => "details",
            Self::Blocks => "blocks",
            Self::TypeChange => "typeChange",
            Self::LayoutChange => "layoutChange",
            Self::Template => "template",
            Self::Duplication => "duplicate",
        }
    }
}

/// What may not be done to one dataview block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataviewRestriction {
    /// The relation list is fixed.
    DvRelation,
    /// No objects can be created from the view.
    DvCreateObject,
}

/// Restrictions of an object and its dataview blocks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Restrictions {
    /// Object-level restrictions.
    pub object: BTreeSet<ObjectRestriction>,
    /// Per dataview block id.
    pub dataview: Vec<(String, BTreeSet<DataviewRestriction>)>,
}

impl Restrictions {
    /// Compute the restrictions of a document.
    pub fn compute(sb_type: SmartBlockType, read_only: bool, doc: &State) -> Self {
        use ObjectRestriction::*;
        let object: &[ObjectRestriction] = if read_only || sb_type.is_virtual() {
            &[
                Delete,
                Relations,
                Details,
                Blocks,
                TypeChange,
                LayoutChange,
                Template,
                Duplication,
            ]
        } else {
            match sb_type {
                SmartBlockType::Workspace
                | SmartBlockType::Widget
                | SmartBlockType::Archive
                | SmartBlockType::SpaceView => {
                    &[Delete, TypeChange, LayoutChange, Template, Duplication]
                }
                SmartBlockType::ProfilePage => {
                    &[Delete, TypeChange, LayoutChange, Template]
                }
                SmartBlockType::ObjectType
                | SmartBlockType::Relation
                | SmartBlockType::RelationOption => {
                    &[TypeChange, LayoutChange, Template, Duplication]
                }
                SmartBlockType::ChatDerivedObject => {
                    &[TypeChange, LayoutChange, Template, Duplication]
                }
                _ => &[],
            }
        };

        let mut dataview = Vec::new();
        doc.iterate(|b| {
            if let BlockContent::Dataview(dv) = &b.content {
                if dv.is_system {
                    dataview.push((
                        b.id.clone(),
                        [
                            DataviewRestriction::DvRelation,
                            DataviewRestriction::DvCreateObject,
                        ]
                        .into_iter()
                        .collect(),
                    ));
                }
            }
            true
        });

        Self {
            object: object.iter().copied().collect(),
            dataview,
        }
    }

    /// True if `r` is in place.
    pub fn has(&self, r: ObjectRestriction) -> bool {
        self.object.contains(&r)
    }

    /// Value of the `restrictions` detail.
    pub fn names(&self) -> Vec<String> {
        self.object.iter().map(|r| r.as_str().to_string()).collect()
    }

    /// Reject a derived state whose edits touch something restricted.
    pub fn check(&self, state: &State) -> HeartResult<()> {
        let Some(parent) = state.parent() else {
            return Ok(());
        };
        let deny = |what: &str| {
            Err(HeartError::kind(
                ErrorKind::Restricted,
                format!("{what} of {} are restricted", state.id()),
            ))
        };

        if self.has(ObjectRestriction::Blocks) && blocks_differ(parent, state) {
            return deny("blocks");
        }
        if self.has(ObjectRestriction::Details)
            && parent.details() != state.details()
        {
            return deny("details");
        }
        if self.has(ObjectRestriction::Relations)
            && parent.relation_links() != state.relation_links()
        {
            return deny("relations");
        }
        if self.has(ObjectRestriction::TypeChange)
            && !parent.object_type_keys().is_empty()
            && parent.object_type_keys() != state.object_type_keys()
        {
            return deny("type changes");
        }
        if self.has(ObjectRestriction::LayoutChange)
            && parent.details().get(bundle::LAYOUT)
                != state.details().get(bundle::LAYOUT)
        {
            return deny("layout changes");
        }
        for (id, rs) in self.dataview.iter() {
            if !rs.contains(&DataviewRestriction::DvRelation) {
                continue;
            }
            let links = |s: &State| match s.pick(id).map(|b| &b.content) {
                Some(BlockContent::Dataview(dv)) => Some(dv.relation_links.clone()),
                _ => None,
            };
            if links(parent) != links(state) {
                return deny("dataview relations");
            }
        }
        Ok(())
    }
}

fn blocks_differ(a: &State, b: &State) -> bool {
    let mut ids = BTreeSet::new();
    for s in [a, b] {
        s.iterate(|blk| {
            ids.insert(blk.id.clone());
            true
        });
    }
    ids.iter().any(|id| a.pick(id) != b.pick(id))
}
