//! A glossary of terms used in the heart project.
//!
//! ## Object / SmartBlock
//! A user-visible entity (page, set, template, relation, ...) with its own
//! change-log, state and lock. At most one live instance of an object
//! exists in memory at any time.
//!
//! ## Space
//! A group of objects sharing replication and an access-control list.
//! The technical "account space" holds one space view per space.
//!
//! ## Space view
//! Local, device-scoped status and ordering for one space. Views are
//! ordered by a lexicographic id so inserting between two views never
//! renumbers the others.
//!
//! ## Unique key
//! `(smartblock-type, internal-key)`. Deterministically derives an
//! object's id within a space, so every device agrees on the id of e.g.
//! the archive without talking to each other.
//!
//! ## Details
//! The typed key/value map carried by every object. "Stored" details are
//! part of the change-log, "local" details never leave the node.
//!
//! ## Derived detail
//! A local detail recomputed from state plus external inputs on every
//! apply: links, backlinks, snippet, resolved layout and friends.
//!
//! ## Resolved layout
//! The effective layout of an object: its own layout if set, else the
//! recommended layout of its type, else basic.
//!
//! ## Change
//! A signed, content-addressed mutation in an object's log. The change id
//! is the hash of the signed payload, so a change can not be altered
//! without changing its id.
//!
//! ## App-link
//! A named symmetric token granting a subset of the account's local-api
//! scopes, stored sealed to the account key.
//!
//! ## Sub-object
//! Legacy term for a relation, type or option stored inside the workspace
//! object instead of as a first-class object.
