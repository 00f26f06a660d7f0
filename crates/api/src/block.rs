//! Block tree primitives.
//!
//! Blocks form a tree rooted at the object id. Each block type knows how
//! to describe its own transition as a list of [EventMessage]s, so the
//! state layer can diff two trees structurally.

use crate::event::EventMessage;

/// Text block styles.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum TextStyle {
    /// Plain paragraph.
    #[default]
    Paragraph,
    /// The object title.
    Title,
    /// The object description.
    Description,
    /// Header.
    Header1,
    /// Checkbox.
    Checkbox,
    /// Code.
    Code,
    /// Quote.
    Quote,
}

/// The kind of a text mark.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum MarkKind {
    /// Bold.
    Bold,
    /// Italic.
    Italic,
    /// Web link, param is the url.
    Link,
    /// Inline object reference, param is the object id.
    Object,
    /// Mention, param is the object id.
    Mention,
}

/// A styled range within a text block.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Mark {
    /// Start offset in chars.
    pub from: u32,
    /// End offset in chars.
    pub to: u32,
    /// What kind of mark.
    pub kind: MarkKind,
    /// Mark parameter.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub param: String,
}

/// Content of a text block.
#[derive(
    Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize,
)]
#[serde(default)]
pub struct Text {
    /// The text.
    pub text: String,
    /// The style.
    pub style: TextStyle,
    /// Marks.
    pub marks: Vec<Mark>,
    /// Checkbox state.
    pub checked: bool,
}

/// Content of a link block.
#[derive(
    Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    /// The linked object id.
    pub target_block_id: String,
}

/// Content of a file block.
#[derive(
    Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct File {
    /// The file object id.
    pub target_object_id: String,
    /// Display name.
    pub name: String,
}

/// Content of a dataview block.
#[derive(
    Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize,
)]
#[serde(default, rename_all = "camelCase")]
pub struct Dataview {
    /// Query source (type or relation ids).
    pub source: Vec<String>,
    /// Relation keys shown as columns.
    pub relation_links: Vec<String>,
    /// System dataviews cannot have their relations edited.
    pub is_system: bool,
}

/// Typed block content.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BlockContent {
    /// The root of an object.
    Smartblock,
    /// Text.
    Text(Text),
    /// Link to another object.
    Link(Link),
    /// File.
    File(File),
    /// Dataview.
    Dataview(Dataview),
    /// Shows the value of one relation.
    Relation {
        /// The relation key.
        key: String,
    },
    /// Layout row, column or header container.
    Layout,
    /// Featured relations bar.
    FeaturedRelations,
    /// Divider.
    Div,
}

/// A single block.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Block id, local to the object.
    pub id: String,
    /// Ordered child ids.
    #[serde(default)]
    pub children_ids: Vec<String>,
    /// Content.
    pub content: BlockContent,
}

impl Block {
    /// Construct a new block without children.
    pub fn new(id: impl Into<String>, content: BlockContent) -> Self {
        Self {
            id: id.into(),
            children_ids: Vec::new(),
            content,
        }
    }

    /// Construct a text block.
    pub fn text(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(
            id,
            BlockContent::Text(Text {
                text: text.into(),
                ..Default::default()
            }),
        )
    }

    /// Construct a link block.
    pub fn link(id: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(
            id,
            BlockContent::Link(Link {
                target_block_id: target.into(),
            }),
        )
    }

    /// Text content, if this is a text block.
    pub fn as_text(&self) -> Option<&Text> {
        match &self.content {
            BlockContent::Text(t) => Some(t),
            _ => None,
        }
    }

    /// Mutable text content, if this is a text block.
    pub fn as_text_mut(&mut self) -> Option<&mut Text> {
        match &mut self.content {
            BlockContent::Text(t) => Some(t),
            _ => None,
        }
    }

    /// Object ids this block links to.
    pub fn link_targets(&self) -> Vec<String> {
        match &self.content {
            BlockContent::Link(l) if !l.target_block_id.is_empty() => {
                vec![l.target_block_id.clone()]
            }
            BlockContent::File(f) if !f.target_object_id.is_empty() => {
                vec![f.target_object_id.clone()]
            }
            BlockContent::Text(t) => t
                .marks
                .iter()
                .filter(|m| m.kind == MarkKind::Object && !m.param.is_empty())
                .map(|m| m.param.clone())
                .collect(),
            BlockContent::Dataview(d) => d.source.clone(),
            _ => Vec::new(),
        }
    }

    /// Object ids this block mentions.
    pub fn mention_targets(&self) -> Vec<String> {
        match &self.content {
            BlockContent::Text(t) => t
                .marks
                .iter()
                .filter(|m| m.kind == MarkKind::Mention && !m.param.is_empty())
                .map(|m| m.param.clone())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Describe the transition from `self` to `new` as events.
    ///
    /// Children changes are reported separately from content changes.
    /// A content type change is reported as a full block replacement.
    pub fn diff(&self, new: &Block) -> Vec<EventMessage> {
        let mut out = Vec::new();
        if self.children_ids != new.children_ids {
            out.push(EventMessage::BlockSetChildrenIds {
                id: new.id.clone(),
                children_ids: new.children_ids.clone(),
            });
        }
        if self.content == new.content {
            return out;
        }
        match (&self.content, &new.content) {
            (BlockContent::Text(a), BlockContent::Text(b)) => {
                out.push(EventMessage::BlockSetText {
                    id: new.id.clone(),
                    text: (a.text != b.text).then(|| b.text.clone()),
                    style: (a.style != b.style).then_some(b.style),
                    marks: (a.marks != b.marks).then(|| b.marks.clone()),
                    checked: (a.checked != b.checked).then_some(b.checked),
                });
            }
            (BlockContent::Link(_), BlockContent::Link(b)) => {
                out.push(EventMessage::BlockSetLink {
                    id: new.id.clone(),
                    target_block_id: b.target_block_id.clone(),
                });
            }
            (BlockContent::File(_), BlockContent::File(b)) => {
                out.push(EventMessage::BlockSetFile {
                    id: new.id.clone(),
                    file: b.clone(),
                });
            }
            (BlockContent::Dataview(_), BlockContent::Dataview(b)) => {
                out.push(EventMessage::BlockSetDataview {
                    id: new.id.clone(),
                    dataview: b.clone(),
                });
            }
            (
                BlockContent::Relation { .. },
                BlockContent::Relation { key },
            ) => {
                out.push(EventMessage::BlockSetRelation {
                    id: new.id.clone(),
                    key: key.clone(),
                });
            }
            _ => {
                out.push(EventMessage::BlockDelete {
                    block_ids: vec![self.id.clone()],
                });
                out.push(EventMessage::BlockAdd {
                    blocks: vec![new.clone()],
                });
            }
        }
        out
    }
}
