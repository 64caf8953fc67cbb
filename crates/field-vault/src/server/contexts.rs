//! Named execution contexts kept alive across requests.
//!
//! A client that sends the context header gets the same [`SessionContext`]
//! on every request carrying that name, so its sessions (and rate budgets)
//! persist between calls. Requests on one named context are serialised by
//! its mutex. Removing a context from the table drops it once the last
//! in-flight request using it finishes, which expires its sessions.
//!
//! A context that no request is using and whose sessions have all ended or
//! outlived their lifetime is stale. Stale contexts are swept whenever a
//! context is opened and on a timer, which zeroizes the keys they held and
//! frees their slot in the table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::ServiceError;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::facade::EncryptionFacade;
use crate::session::SessionContext;

/// Longest accepted context name.
pub const MAX_CONTEXT_NAME_LEN: usize = 128;

/// Period of the background sweep of stale contexts.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A context shared between the requests that name it.
pub type SharedContext = Arc<Mutex<SessionContext>>;

/// Bounded table of named contexts.
#[derive(Clone)]
pub struct ContextTable {
    contexts: Arc<Mutex<HashMap<String, SharedContext>>>,
    max: usize,
}

impl ContextTable {
    /// Create an empty table holding at most `max` contexts.
    pub fn new(max: usize) -> Self {
        Self {
            contexts: Arc::new(Mutex::new(HashMap::new())),
            max,
        }
    }

    /// The context called `name`, opening it through `facade` on first use.
    ///
    /// # Errors
    ///
    /// [`ServiceError::BadRequest`] for an invalid name and
    /// [`ServiceError::Unavailable`] when the table is full.
    pub fn get_or_open(
        &self,
        name: &str,
        facade: &EncryptionFacade,
    ) -> Result<SharedContext, ServiceError> {
        validate_name(name)?;
        let now = facade.registry().clock().now();
        let mut contexts = self.contexts.lock();
        if let Some(ctx) = contexts.get(name) {
            return Ok(ctx.clone());
        }
        let stale = take_stale(&mut contexts, now);
        if contexts.len() >= self.max {
            return Err(ServiceError::Unavailable(format!(
                "context table full ({} contexts)",
                self.max
            )));
        }
        let ctx = Arc::new(Mutex::new(facade.open_context()));
        contexts.insert(name.to_owned(), ctx.clone());
        info!(context = name, open = contexts.len(), "named context opened");
        drop(contexts);
        drop(stale);
        Ok(ctx)
    }

    /// Drop every stale context. Returns how many were dropped.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let stale = take_stale(&mut self.contexts.lock(), now);
        stale.len()
    }

    /// The context called `name`, if it is held.
    pub fn get(&self, name: &str) -> Option<SharedContext> {
        self.contexts.lock().get(name).cloned()
    }

    /// Forget the context called `name`. Returns `true` if it was held.
    pub fn remove(&self, name: &str) -> bool {
        let removed = self.contexts.lock().remove(name);
        if removed.is_some() {
            info!(context = name, "named context released");
        }
        removed.is_some()
    }

    /// Number of contexts held.
    pub fn len(&self) -> usize {
        self.contexts.lock().len()
    }

    /// Returns `true` if no context is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Remove the stale entries from `contexts`. The caller drops them after
/// releasing the table lock.
fn take_stale(
    contexts: &mut HashMap<String, SharedContext>,
    now: DateTime<Utc>,
) -> Vec<SharedContext> {
    let names: Vec<String> = contexts
        .iter()
        .filter(|(_, ctx)| {
            Arc::strong_count(*ctx) == 1 && ctx.try_lock().is_some_and(|c| c.is_stale(now))
        })
        .map(|(name, _)| name.clone())
        .collect();
    names
        .into_iter()
        .filter_map(|name| {
            debug!(context = %name, "stale named context swept");
            contexts.remove(&name)
        })
        .collect()
}

fn validate_name(name: &str) -> Result<(), ServiceError> {
    if name.is_empty() || name.len() > MAX_CONTEXT_NAME_LEN {
        return Err(ServiceError::BadRequest(format!(
            "context id must be 1 to {MAX_CONTEXT_NAME_LEN} characters"
        )));
    }
    if !name.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(ServiceError::BadRequest(
            "context id must be printable ASCII without spaces".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::StaticSecretSource;
    use crate::server::state::AppState;
    use crate::server::test_support;
    use crate::session::{Clock, ManualClock};

    #[test]
    fn same_name_same_context() {
        let state = test_support::state(10);
        let a = state.contexts.get_or_open("job-1", &state.facade).unwrap();
        let b = state.contexts.get_or_open("job-1", &state.facade).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(state.contexts.len(), 1);
    }

    fn open_with_session(
        table: &ContextTable,
        name: &str,
        facade: &EncryptionFacade,
    ) -> SharedContext {
        let ctx = table.get_or_open(name, facade).unwrap();
        facade.encrypt_field(&mut ctx.lock(), "acme", "x").unwrap();
        ctx
    }

    fn manual_state() -> (AppState, ManualClock) {
        let clock = ManualClock::default();
        let state = test_support::state_at(
            Arc::new(StaticSecretSource::new(vec![0x24; 32])),
            Arc::new(clock.clone()),
            10,
        );
        (state, clock)
    }

    #[test]
    fn table_is_bounded() {
        let state = test_support::state(10);
        let table = ContextTable::new(2);
        open_with_session(&table, "a", &state.facade);
        open_with_session(&table, "b", &state.facade);
        assert!(matches!(
            table.get_or_open("c", &state.facade),
            Err(ServiceError::Unavailable(_))
        ));
        assert!(table.remove("a"));
        table.get_or_open("c", &state.facade).unwrap();
    }

    #[test]
    fn expired_contexts_free_their_slots() {
        let (state, clock) = manual_state();
        let registry = state.facade.registry().clone();
        let table = ContextTable::new(2);
        open_with_session(&table, "a", &state.facade);
        open_with_session(&table, "b", &state.facade);
        assert_eq!(registry.open_contexts(), 2);

        clock.advance(chrono::Duration::days(30));
        let c = table.get_or_open("c", &state.facade).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(registry.open_contexts(), 1);

        // an existing name is returned before any sweep
        let again = table.get_or_open("c", &state.facade).unwrap();
        assert!(Arc::ptr_eq(&c, &again));
    }

    #[test]
    fn sweep_keeps_live_and_borrowed_contexts() {
        let (state, clock) = manual_state();
        let registry = state.facade.registry().clone();
        let table = ContextTable::new(4);
        open_with_session(&table, "live", &state.facade);
        let held = open_with_session(&table, "held", &state.facade);
        assert_eq!(table.sweep(clock.now()), 0);

        clock.advance(chrono::Duration::hours(1));
        open_with_session(&table, "late", &state.facade);
        assert_eq!(table.len(), 2);
        assert!(!table.remove("live"));
        assert_eq!(table.sweep(clock.now()), 0);

        drop(held);
        assert_eq!(table.sweep(clock.now()), 1);
        assert_eq!(table.len(), 1);
        assert_eq!(registry.open_contexts(), 1);
    }

    #[test]
    fn ended_sessions_make_a_context_sweepable() {
        let (state, clock) = manual_state();
        let table = ContextTable::new(4);
        let ctx = open_with_session(&table, "job", &state.facade);
        state.facade.registry().release(&mut ctx.lock(), "acme");
        drop(ctx);
        assert_eq!(table.sweep(clock.now()), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn removal_closes_context() {
        let state = test_support::state(10);
        let registry = state.facade.registry().clone();
        state.contexts.get_or_open("job", &state.facade).unwrap();
        assert_eq!(registry.open_contexts(), 1);
        assert!(state.contexts.remove("job"));
        assert!(!state.contexts.remove("job"));
        assert_eq!(registry.open_contexts(), 0);
    }

    #[test]
    fn rejects_bad_names() {
        let state = test_support::state(10);
        let long = "x".repeat(MAX_CONTEXT_NAME_LEN + 1);
        for name in ["", "has space", long.as_str()] {
            assert!(matches!(
                state.contexts.get_or_open(name, &state.facade),
                Err(ServiceError::BadRequest(_))
            ));
        }
    }
}
