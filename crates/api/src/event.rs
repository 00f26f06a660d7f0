//! Events emitted to subscribers after an object mutation.

use crate::block::*;
use crate::*;
use std::sync::Arc;

/// A single incremental change description.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventMessage {
    /// Blocks were added.
    #[serde(rename_all = "camelCase")]
    BlockAdd {
        /// The new blocks.
        blocks: Vec<Block>,
    },

    /// Blocks were removed.
    #[serde(rename_all = "camelCase")]
    BlockDelete {
        /// Removed block ids.
        block_ids: Vec<String>,
    },

    /// A block's children changed.
    #[serde(rename_all = "camelCase")]
    BlockSetChildrenIds {
        /// Block id.
        id: String,
        /// The full new child list.
        children_ids: Vec<String>,
    },

    /// Text block fields changed. Unchanged fields are `None`.
    BlockSetText {
        /// Block id.
        id: String,
        /// New text.
        text: Option<String>,
        /// New style.
        style: Option<TextStyle>,
        /// New marks.
        marks: Option<Vec<Mark>>,
        /// New checkbox state.
        checked: Option<bool>,
    },

    /// Link target changed.
    #[serde(rename_all = "camelCase")]
    BlockSetLink {
        /// Block id.
        id: String,
        /// New target.
        target_block_id: String,
    },

    /// File block changed.
    BlockSetFile {
        /// Block id.
        id: String,
        /// New content.
        file: File,
    },

    /// Dataview block changed.
    BlockSetDataview {
        /// Block id.
        id: String,
        /// New content.
        dataview: Dataview,
    },

    /// Relation block changed.
    BlockSetRelation {
        /// Block id.
        id: String,
        /// New relation key.
        key: String,
    },

    /// Full details of an object, sent on open and for dependencies.
    #[serde(rename_all = "camelCase")]
    ObjectDetailsSet {
        /// Object id.
        id: ObjectId,
        /// The space the object lives in.
        space_id: SpaceId,
        /// Combined details.
        details: Details,
    },

    /// Some details were added or changed.
    ObjectDetailsAmend {
        /// Object id.
        id: ObjectId,
        /// New key/value pairs.
        details: Vec<(String, Value)>,
    },

    /// Some details were removed.
    ObjectDetailsUnset {
        /// Object id.
        id: ObjectId,
        /// Removed keys.
        keys: Vec<String>,
    },

    /// Relation links were added.
    #[serde(rename_all = "camelCase")]
    ObjectRelationsAmend {
        /// Object id.
        id: ObjectId,
        /// Added relation keys.
        relation_keys: Vec<String>,
    },

    /// Relation links were removed.
    ObjectRelationsRemove {
        /// Object id.
        id: ObjectId,
        /// Removed relation keys.
        keys: Vec<String>,
    },

    /// Object restrictions changed.
    ObjectRestrictionsSet {
        /// Object id.
        id: ObjectId,
        /// The full new restriction list.
        restrictions: Vec<String>,
    },
}

impl EventMessage {
    /// True for messages describing details changes.
    pub fn is_details(&self) -> bool {
        matches!(
            self,
            Self::ObjectDetailsSet { .. }
                | Self::ObjectDetailsAmend { .. }
                | Self::ObjectDetailsUnset { .. }
        )
    }
}

/// A batch of messages produced by one apply on one object.
///
/// A batch is delivered to each subscriber as a unit.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// The object the messages are about.
    pub context_id: ObjectId,

    /// The session that caused the change, if any.
    pub initiator: Option<SessionId>,

    /// The messages.
    pub messages: Vec<EventMessage>,
}

/// Receives event batches on behalf of every connected session.
pub trait EventSender: 'static + Send + Sync + std::fmt::Debug {
    /// Deliver to every session subscribed to `event.context_id`
    /// except the initiator, which gets the batch in its response.
    fn broadcast(&self, event: Event);

    /// Deliver to one session only.
    fn send_to_session(&self, session: &SessionId, event: Event);
}

/// Trait-object [EventSender].
pub type DynEventSender = Arc<dyn EventSender>;

/// An [EventSender] that drops everything.
#[derive(Debug, Default)]
pub struct NoopEventSender;

impl EventSender for NoopEventSender {
    fn broadcast(&self, _event: Event) {}
    fn send_to_session(&self, _session: &SessionId, _event: Event) {}
}

/// An [EventSender] forwarding every batch into a tokio channel.
#[derive(Debug)]
pub struct ChannelEventSender(
    tokio::sync::mpsc::UnboundedSender<(Option<SessionId>, Event)>,
);

impl ChannelEventSender {
    /// Construct a sender and the matching receiver.
    pub fn create() -> (
        DynEventSender,
        tokio::sync::mpsc::UnboundedReceiver<(Option<SessionId>, Event)>,
    ) {
        let (s, r) = tokio::sync::mpsc::unbounded_channel();
        let out: DynEventSender = Arc::new(Self(s));
        (out, r)
    }
}

impl EventSender for ChannelEventSender {
    fn broadcast(&self, event: Event) {
        let _ = self.0.send((None, event));
    }

    fn send_to_session(&self, session: &SessionId, event: Event) {
        let _ = self.0.send((Some(session.clone()), event));
    }
}
