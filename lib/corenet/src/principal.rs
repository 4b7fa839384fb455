//! The principal-type external collaborator (spec §6): whatever object represents an
//! authenticated user/entity only needs to expose one thing to the core — a slot it can
//! bind its `SessionId` into.
use crate::ids::SessionId;
use std::cell::Cell;
use std::rc::Rc;

/// Implemented by whatever application type represents an authenticated entity (a player,
/// an admin console, ...). The core never inspects anything else about it beyond this one
/// slot — an `Rc` so `Session::authorize` can hold onto it independently of the principal's
/// own lifetime (the entity may outlive the session, or vice versa).
pub trait Principal {
    fn session_slot(&self) -> Rc<Cell<Option<SessionId>>>;

    fn current_session(&self) -> Option<SessionId> {
        self.session_slot().get()
    }

    fn has_session(&self) -> bool {
        self.current_session().is_some()
    }
}
