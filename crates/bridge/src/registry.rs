//! Process-wide mapping from correlation token to active Bridge Session.

use std::sync::Arc;

use bridge_protocol::CorrelationToken;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::session::BridgeSession;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<CorrelationToken, Arc<BridgeSession>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Inserts `session` under `token` unless one is already present.
    /// Returns `false` without touching the map if the token is already in use.
    pub fn insert_if_absent(&self, token: CorrelationToken, session: Arc<BridgeSession>) -> bool {
        match self.sessions.entry(token) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(session);
                true
            }
        }
    }

    pub fn get(&self, token: &CorrelationToken) -> Option<Arc<BridgeSession>> {
        self.sessions.get(token).map(|s| Arc::clone(&s))
    }

    pub fn remove(&self, token: &CorrelationToken) -> Option<Arc<BridgeSession>> {
        self.sessions.remove(token).map(|(_, session)| session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn all_tokens(&self) -> Vec<CorrelationToken> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::dummy_session;

    #[test]
    fn insert_if_absent_rejects_duplicate_token() {
        let registry = SessionRegistry::new();
        let token = CorrelationToken::new("alice");
        assert!(registry.insert_if_absent(token.clone(), dummy_session()));
        assert!(!registry.insert_if_absent(token, dummy_session()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_then_insert_again_succeeds() {
        let registry = SessionRegistry::new();
        let token = CorrelationToken::new("alice");
        registry.insert_if_absent(token.clone(), dummy_session());
        assert!(registry.remove(&token).is_some());
        assert!(registry.is_empty());
        assert!(registry.insert_if_absent(token, dummy_session()));
    }

    #[test]
    fn remove_unknown_token_returns_none() {
        let registry = SessionRegistry::new();
        assert!(registry.remove(&CorrelationToken::new("bob")).is_none());
    }

    #[test]
    fn get_returns_clone_of_same_session() {
        let registry = SessionRegistry::new();
        let token = CorrelationToken::new("alice");
        let session = dummy_session();
        registry.insert_if_absent(token.clone(), Arc::clone(&session));
        let fetched = registry.get(&token).unwrap();
        assert!(Arc::ptr_eq(&session, &fetched));
    }
}
