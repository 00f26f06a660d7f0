//! Session-aware event routing.

use heart_api::{event::*, *};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

/// Routes object events to the sessions that opened the object.
///
/// Wraps the outer [EventSender], which only knows how to reach a
/// session. [SessionEvents::broadcast] skips the initiator: objects hand
/// the initiator its batch through the call response instead.
#[derive(Debug)]
pub struct SessionEvents {
    out: DynEventSender,
    subs: Mutex<HashMap<ObjectId, BTreeSet<SessionId>>>,
}

impl SessionEvents {
    /// Construct over an outer sender.
    pub fn new(out: DynEventSender) -> Arc<Self> {
        Arc::new(Self {
            out,
            subs: Mutex::new(HashMap::new()),
        })
    }

    /// Route events of `object` to `session`.
    pub fn subscribe(&self, session: &SessionId, object: &ObjectId) {
        self.subs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(object.clone())
            .or_default()
            .insert(session.clone());
    }

    /// Stop routing events of `object` to `session`.
    pub fn unsubscribe(&self, session: &SessionId, object: &ObjectId) {
        let mut lock = self.subs.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(set) = lock.get_mut(object) {
            set.remove(session);
            if set.is_empty() {
                lock.remove(object);
            }
        }
    }

    /// Forget every subscription of a session.
    pub fn close_session(&self, session: &SessionId) {
        self.subs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|_, set| {
                set.remove(session);
                !set.is_empty()
            });
    }

    /// Forget every subscription to an object.
    pub fn forget_object(&self, object: &ObjectId) {
        self.subs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(object);
    }

    /// Sessions subscribed to an object.
    pub fn subscribers(&self, object: &ObjectId) -> Vec<SessionId> {
        self.subs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(object)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl EventSender for SessionEvents {
    fn broadcast(&self, event: Event) {
        for session in self.subscribers(&event.context_id) {
            if event.initiator.as_ref() == Some(&session) {
                continue;
            }
            self.out.send_to_session(&session, event.clone());
        }
    }

    fn send_to_session(&self, session: &SessionId, event: Event) {
        self.out.send_to_session(session, event);
    }
}
