//! Object-level domain types: detail values, unique keys, layouts.

use crate::*;
use std::collections::BTreeMap;

/// A typed detail value.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Explicit null, equivalent to the key being absent.
    Null,

    /// A boolean.
    Bool(bool),

    /// An integer. Dates are unix seconds.
    Int(i64),

    /// A float.
    Float(f64),

    /// A string. Object references are object ids.
    String(String),

    /// A list of strings. Multi-object references are lists of ids.
    List(Vec<String>),
}

impl Value {
    /// Get a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get an integer value, truncating floats.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    /// Get a bool value.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get a list value. A single string is a one element list.
    pub fn as_list(&self) -> Vec<String> {
        match self {
            Value::List(l) => l.clone(),
            Value::String(s) if !s.is_empty() => vec![s.clone()],
            _ => Vec::new(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<String>> for Value {
    fn from(l: Vec<String>) -> Self {
        Value::List(l)
    }
}

/// A typed key/value map carried by every object.
#[derive(
    Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct Details(pub BTreeMap<String, Value>);

/// The result of [Details::diff].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DetailsDiff {
    /// Keys added or changed, with their new values.
    pub set: Vec<(String, Value)>,

    /// Keys removed.
    pub unset: Vec<String>,
}

impl DetailsDiff {
    /// True when nothing changed.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }
}

impl Details {
    /// Construct from key/value pairs.
    pub fn from_pairs<K: Into<String>, V: Into<Value>>(
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Get a value. Null values read as absent.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self.0.get(key) {
            Some(Value::Null) | None => None,
            Some(v) => Some(v),
        }
    }

    /// Get a string value, empty if absent.
    pub fn get_string(&self, key: &str) -> String {
        self.get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    }

    /// Get an integer value.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.as_int())
    }

    /// Get a bool value, false if absent.
    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    /// Get a list value, empty if absent.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key).map(|v| v.as_list()).unwrap_or_default()
    }

    /// True if the key holds a non-null value.
    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Set a value. Setting null removes the key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        match value.into() {
            Value::Null => {
                self.0.remove(&key);
            }
            value => {
                self.0.insert(key, value);
            }
        }
    }

    /// Remove a value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Iterate over the non-null entries.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter().filter(|(_, v)| !matches!(v, Value::Null))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// True if no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Union with `other`; keys present in both take the value from `other`.
    pub fn merged(&self, other: &Details) -> Details {
        let mut out = self.clone();
        for (k, v) in other.iter() {
            out.0.insert(k.clone(), v.clone());
        }
        out
    }

    /// Copy without the listed keys.
    pub fn without_keys(&self, keys: &[&str]) -> Details {
        Details(
            self.iter()
                .filter(|(k, _)| !keys.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Copy with only the listed keys.
    pub fn with_keys(&self, keys: &[&str]) -> Details {
        Details(
            self.iter()
                .filter(|(k, _)| keys.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Compute what changed going from `self` to `new`.
    pub fn diff(&self, new: &Details) -> DetailsDiff {
        let mut out = DetailsDiff::default();
        for (k, v) in new.iter() {
            if self.get(k) != Some(v) {
                out.set.push((k.clone(), v.clone()));
            }
        }
        for (k, _) in self.iter() {
            if !new.has(k) {
                out.unset.push(k.clone());
            }
        }
        out
    }
}

/// Well-known relation keys.
pub mod bundle {
    #![allow(missing_docs)]

    pub const ID: &str = "id";
    pub const SPACE_ID: &str = "spaceId";
    pub const UNIQUE_KEY: &str = "uniqueKey";
    pub const TYPE: &str = "type";
    pub const NAME: &str = "name";
    pub const ICON_EMOJI: &str = "iconEmoji";
    pub const ICON_OPTION: &str = "iconOption";
    pub const DESCRIPTION: &str = "description";
    pub const LAYOUT: &str = "layout";
    pub const RESOLVED_LAYOUT: &str = "resolvedLayout";
    pub const RECOMMENDED_LAYOUT: &str = "recommendedLayout";
    pub const CREATOR: &str = "creator";
    pub const CREATED_DATE: &str = "createdDate";
    pub const ADDED_DATE: &str = "addedDate";
    pub const LAST_MODIFIED_DATE: &str = "lastModifiedDate";
    pub const LAST_MODIFIED_BY: &str = "lastModifiedBy";
    pub const LAST_OPENED_DATE: &str = "lastOpenedDate";
    pub const SNIPPET: &str = "snippet";
    pub const LINKS: &str = "links";
    pub const MENTIONS: &str = "mentions";
    pub const BACKLINKS: &str = "backlinks";
    pub const FILE_SYNC_STATUS: &str = "fileSyncStatus";
    pub const FILE_BACKUP_STATUS: &str = "fileBackupStatus";
    pub const HAS_CHAT: &str = "hasChat";
    pub const CHAT_ID: &str = "chatId";
    pub const IS_DELETED: &str = "isDeleted";
    pub const IS_UNINSTALLED: &str = "isUninstalled";
    pub const IS_ARCHIVED: &str = "isArchived";
    pub const RESTRICTIONS: &str = "restrictions";
    pub const TAG: &str = "tag";
    pub const ASSIGNEE: &str = "assignee";
    pub const SET_OF: &str = "setOf";
    pub const TARGET_OBJECT_TYPE: &str = "targetObjectType";
    pub const SPACE_ORDER: &str = "spaceOrder";
    pub const TARGET_SPACE_ID: &str = "targetSpaceId";
    pub const SPACE_LOCAL_STATUS: &str = "spaceLocalStatus";
    pub const SPACE_SHAREABLE_STATUS: &str = "spaceShareableStatus";
    pub const SOURCE_OBJECT: &str = "sourceObject";
    pub const RELATION_KEY: &str = "relationKey";
    pub const RELATION_FORMAT: &str = "relationFormat";

    /// Keys never persisted in changes; recomputed on every apply.
    pub const DERIVED_KEYS: &[&str] = &[
        ID,
        SPACE_ID,
        UNIQUE_KEY,
        TYPE,
        SNIPPET,
        LINKS,
        MENTIONS,
        BACKLINKS,
        RESOLVED_LAYOUT,
        FILE_SYNC_STATUS,
        CHAT_ID,
        IS_DELETED,
        RESTRICTIONS,
    ];

    /// Keys stored only on this node.
    pub const LOCAL_KEYS: &[&str] = &[
        CREATOR,
        CREATED_DATE,
        ADDED_DATE,
        LAST_MODIFIED_DATE,
        LAST_MODIFIED_BY,
        LAST_OPENED_DATE,
        SPACE_LOCAL_STATUS,
    ];

    /// Keys whose values reference other objects.
    pub const OBJECT_KEYS: &[&str] = &[
        TYPE,
        CREATOR,
        LAST_MODIFIED_BY,
        TAG,
        ASSIGNEE,
        SET_OF,
        TARGET_OBJECT_TYPE,
        SOURCE_OBJECT,
    ];

    /// True if the key belongs in local details.
    pub fn is_local(key: &str) -> bool {
        DERIVED_KEYS.contains(&key) || LOCAL_KEYS.contains(&key)
    }
}

/// The kind of object behind an id.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum SmartBlockType {
    /// A regular user object.
    Page,
    /// An object type.
    ObjectType,
    /// A relation.
    Relation,
    /// An option of a select relation.
    RelationOption,
    /// The space workspace object.
    Workspace,
    /// The archive collection.
    Archive,
    /// The widgets object.
    Widget,
    /// The profile page of the account.
    ProfilePage,
    /// A per-device view of one space, living in the account space.
    SpaceView,
    /// A template.
    Template,
    /// A chat attached to another object.
    ChatDerivedObject,
    /// Virtual date object.
    Date,
    /// Virtual profile of the built-in anytype identity.
    AnytypeProfile,
    /// Virtual stand-in for an object that cannot be loaded.
    MissingObject,
}

impl SmartBlockType {
    /// The unique-key prefix of this type.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Page => "page",
            Self::ObjectType => "ot",
            Self::Relation => "rel",
            Self::RelationOption => "opt",
            Self::Workspace => "workspace",
            Self::Archive => "archive",
            Self::Widget => "widget",
            Self::ProfilePage => "profile",
            Self::SpaceView => "spaceview",
            Self::Template => "template",
            Self::ChatDerivedObject => "chatDerived",
            Self::Date => "_date",
            Self::AnytypeProfile => "_anytype_profile",
            Self::MissingObject => "_missing_object",
        }
    }

    /// Parse a unique-key prefix.
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        [
            Self::Page,
            Self::ObjectType,
            Self::Relation,
            Self::RelationOption,
            Self::Workspace,
            Self::Archive,
            Self::Widget,
            Self::ProfilePage,
            Self::SpaceView,
            Self::Template,
            Self::ChatDerivedObject,
            Self::Date,
            Self::AnytypeProfile,
            Self::MissingObject,
        ]
        .into_iter()
        .find(|t| t.prefix() == prefix)
    }

    /// Virtual objects compute their state on demand and reject pushes.
    pub fn is_virtual(&self) -> bool {
        matches!(self, Self::Date | Self::AnytypeProfile | Self::MissingObject)
    }
}

/// `(smartblock-type, internal-key)`, from which a space-scoped id is
/// deterministically derived.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(into = "String", try_from = "String")]
pub struct UniqueKey {
    /// The smartblock type.
    pub sb_type: SmartBlockType,

    /// The internal key, may be empty for singleton objects.
    pub key: String,
}

impl UniqueKey {
    /// Construct a new unique key.
    pub fn new(sb_type: SmartBlockType, key: impl Into<String>) -> Self {
        Self {
            sb_type,
            key: key.into(),
        }
    }

    /// Marshal as `<prefix>-<key>`, or just `<prefix>` for an empty key.
    pub fn marshal(&self) -> String {
        if self.key.is_empty() {
            self.sb_type.prefix().to_string()
        } else {
            format!("{}-{}", self.sb_type.prefix(), self.key)
        }
    }

    /// Parse the marshalled form.
    pub fn parse(s: &str) -> HeartResult<Self> {
        let (prefix, key) = match s.split_once('-') {
            Some((p, k)) => (p, k),
            None => (s, ""),
        };
        let sb_type = SmartBlockType::from_prefix(prefix).ok_or_else(|| {
            HeartError::bad_input(format!("unknown unique key prefix: {s}"))
        })?;
        Ok(Self::new(sb_type, key))
    }

    /// Derive the object id for this key within `space`.
    ///
    /// The same `(space, key)` always yields the same id, and distinct
    /// pairs never collide.
    pub fn derive_object_id(&self, space: &SpaceId) -> ObjectId {
        let marshalled = self.marshal();
        let hash = hash_parts(&[
            b"heart-derived-object",
            space.as_bytes(),
            marshalled.as_bytes(),
        ]);
        ObjectId::from(format!("bafy{}", hex::encode(&hash[..24])))
    }
}

impl std::fmt::Display for UniqueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.marshal())
    }
}

impl From<UniqueKey> for String {
    fn from(k: UniqueKey) -> Self {
        k.marshal()
    }
}

impl TryFrom<String> for UniqueKey {
    type Error = HeartError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        UniqueKey::parse(&s)
    }
}

/// Object layouts. Stored in details as integers.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(i64)]
pub enum Layout {
    /// Default layout.
    Basic = 0,
    /// Profile page.
    Profile = 1,
    /// Todo.
    Todo = 2,
    /// Set (query).
    Set = 3,
    /// Object type.
    ObjectType = 4,
    /// Relation.
    Relation = 5,
    /// File.
    File = 6,
    /// Dashboard.
    Dashboard = 7,
    /// Note (no title).
    Note = 9,
    /// Space view.
    SpaceView = 10,
    /// Collection.
    Collection = 14,
    /// Date.
    Date = 21,
}

impl Layout {
    /// Parse the integer form.
    pub fn from_int(i: i64) -> Option<Self> {
        Some(match i {
            0 => Self::Basic,
            1 => Self::Profile,
            2 => Self::Todo,
            3 => Self::Set,
            4 => Self::ObjectType,
            5 => Self::Relation,
            6 => Self::File,
            7 => Self::Dashboard,
            9 => Self::Note,
            10 => Self::SpaceView,
            14 => Self::Collection,
            21 => Self::Date,
            _ => return None,
        })
    }
}

/// Well-known object type keys.
pub mod type_key {
    #![allow(missing_docs)]

    pub const PAGE: &str = "page";
    pub const NOTE: &str = "note";
    pub const TASK: &str = "task";
    pub const SET: &str = "set";
    pub const COLLECTION: &str = "collection";
    pub const PROFILE: &str = "profile";
    pub const SPACE: &str = "space";
    pub const SPACE_VIEW: &str = "spaceView";
    pub const DASHBOARD: &str = "dashboard";
    pub const DATE: &str = "date";
    pub const TEMPLATE: &str = "template";
    pub const OBJECT_TYPE: &str = "objectType";
    pub const RELATION: &str = "relation";
    pub const RELATION_OPTION: &str = "relationOption";
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unique_key_marshal_parse() {
        let uk = UniqueKey::new(SmartBlockType::ObjectType, "page");
        assert_eq!("ot-page", uk.marshal());
        assert_eq!(uk, UniqueKey::parse("ot-page").unwrap());
        let ws = UniqueKey::new(SmartBlockType::Workspace, "");
        assert_eq!("workspace", ws.marshal());
        assert_eq!(ws, UniqueKey::parse("workspace").unwrap());
        assert!(UniqueKey::parse("nope-x").is_err());
    }

    #[test]
    fn derive_object_id_is_a_function_and_injective() {
        let s1 = SpaceId::from("space1");
        let s2 = SpaceId::from("space2");
        let a = UniqueKey::new(SmartBlockType::Page, "p1");
        let b = UniqueKey::new(SmartBlockType::Page, "p2");
        assert_eq!(a.derive_object_id(&s1), a.derive_object_id(&s1));
        assert_ne!(a.derive_object_id(&s1), b.derive_object_id(&s1));
        assert_ne!(a.derive_object_id(&s1), a.derive_object_id(&s2));
    }

    #[test]
    fn details_diff() {
        let a = Details::from_pairs([("name", "a"), ("x", "1")]);
        let mut b = a.clone();
        b.set("name", "b");
        b.remove("x");
        b.set("y", 2);
        let d = a.diff(&b);
        assert_eq!(
            vec![
                ("name".to_string(), Value::from("b")),
                ("y".to_string(), Value::Int(2))
            ],
            d.set
        );
        assert_eq!(vec!["x".to_string()], d.unset);
        assert!(a.diff(&a).is_empty());
    }

    #[test]
    fn null_reads_as_absent() {
        let mut d = Details::default();
        d.0.insert("k".into(), Value::Null);
        assert!(!d.has("k"));
        assert!(d.is_empty());
        assert!(Details::default().diff(&d).is_empty());
    }

    #[test]
    fn value_serde_untagged() {
        let d = Details::from_pairs([
            ("b", Value::Bool(true)),
            ("i", Value::Int(3)),
            ("s", Value::from("x")),
            ("l", Value::List(vec!["a".into()])),
        ]);
        let enc = serde_json::to_string(&d).unwrap();
        assert_eq!(r#"{"b":true,"i":3,"l":["a"],"s":"x"}"#, enc);
        let dec: Details = serde_json::from_str(&enc).unwrap();
        assert_eq!(d, dec);
    }
}
