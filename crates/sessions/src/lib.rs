//! `tess-sessions` — conversational session state for Tessera.
//!
//! Sessions are keyed by `(user_id, session_id)` and hold the ordered
//! conversation history, cumulative token/cost accounting, and the
//! workflow history of completed turns. The executor never mutates a
//! session map directly — every change goes through the store's atomic
//! update API.

pub mod store;
pub mod types;

pub use store::SessionStore;
pub use types::{SessionKey, SessionMessage, SessionRecord, TurnRecord, TurnStatus};
