//! The one token→Session index both transports' handshakes share (spec §4.3, §4.4), owned
//! by the server bootstrap per `corenet::SessionDirectory`'s doc comment.
use corenet::{Session, SessionDirectory};
use flux::SessionToken;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Default)]
pub struct TokenDirectory {
    sessions: RefCell<HashMap<SessionToken, Session>>,
}

impl TokenDirectory {
    pub fn new() -> Rc<TokenDirectory> {
        Rc::new(TokenDirectory::default())
    }

    /// Drops every closed session from the index (spec §4.5: `close()` "deregisters the
    /// session from the token index"). Registration has no matching single-session removal
    /// hook — `Session` doesn't hold a reference back to whatever directory it's registered
    /// with — so this is run periodically by the scheduler instead (see `bootstrap.rs`'s
    /// `DirectorySweepTask`).
    pub fn sweep(&self) {
        self.sessions.borrow_mut().retain(|_, session| !session.is_closed());
    }
}

impl SessionDirectory for TokenDirectory {
    fn resolve(&self, token: SessionToken) -> Option<Session> {
        let sessions = self.sessions.borrow();
        let session = sessions.get(&token)?;
        if session.is_closed() {
            None
        } else {
            Some(session.clone())
        }
    }

    fn register(&self, session: &Session) {
        self.sessions.borrow_mut().insert(session.token(), session.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corenet::{Clock, ProtocolLimits};
    use flux::logging::{LogConfig, LoggerFactory};

    fn logging() -> LoggerFactory {
        LoggerFactory::new(LogConfig::default())
    }

    #[test]
    fn registered_session_resolves_by_its_own_token() {
        let directory = TokenDirectory::new();
        let session = Session::create(Clock::new(), ProtocolLimits::default(), &logging());
        directory.register(&session);

        let resolved = directory.resolve(session.token()).expect("token should resolve");
        assert_eq!(resolved.id(), session.id());
    }

    #[test]
    fn closed_session_no_longer_resolves() {
        let directory = TokenDirectory::new();
        let session = Session::create(Clock::new(), ProtocolLimits::default(), &logging());
        directory.register(&session);
        session.close();

        assert!(directory.resolve(session.token()).is_none());
    }

    #[test]
    fn unknown_token_resolves_to_none() {
        let directory = TokenDirectory::new();
        assert!(directory.resolve(SessionToken::generate()).is_none());
    }

    #[test]
    fn sweep_removes_closed_sessions_from_the_index() {
        let directory = TokenDirectory::new();
        let session = Session::create(Clock::new(), ProtocolLimits::default(), &logging());
        let token = session.token();
        directory.register(&session);
        session.close();

        directory.sweep();

        assert_eq!(directory.sessions.borrow().len(), 0);
        assert!(directory.resolve(token).is_none());
    }
}
