use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, oneshot};

use super::store::TokenStore;
use super::types::{
    token_prefix, AccessToken, InvalidationReason, PrincipalKind, SessionEvent, SessionStatus,
    TokenPair,
};
use crate::error::SessionError;

/// Capacity of the observer channel; lagging observers only lose old events
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Session state, owned by the session manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Anonymous,
    Authenticated(TokenPair, PrincipalKind),
    Refreshing(TokenPair, PrincipalKind),
}

/// Caller blocked on `current_token()` while a refresh is in flight
struct PendingRequest {
    id: u64,
    resolve: oneshot::Sender<Result<AccessToken, SessionError>>,
    enqueued_at: DateTime<Utc>,
}

struct Inner {
    state: SessionState,
    waiters: VecDeque<PendingRequest>,
    /// Bumped on every transition that invalidates outstanding refresh tickets
    generation: u64,
    next_waiter_id: u64,
}

struct Shared {
    inner: Mutex<Inner>,
    store: Arc<dyn TokenStore>,
    events: broadcast::Sender<SessionEvent>,
}

/// Result of asking for a refresh after an authentication failure
#[derive(Debug)]
pub enum RefreshStart {
    /// This caller owns the refresh and must resolve the ticket
    Started(RefreshTicket),

    /// The session already moved past the rejected token
    Superseded(AccessToken),
}

/// Session manager
/// Single authority over the session state, the waiter queue and the token store.
///
/// Every transition runs inside one synchronous critical section. The lock is
/// never held across an `.await`, so a second refresh can never start while one
/// is in flight and no caller observes a half-finished transition.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl SessionManager {
    /// Create an anonymous session manager
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self::with_state(store, SessionState::Anonymous)
    }

    /// Create a session manager seeded from the persisted session
    pub fn restore(store: Arc<dyn TokenStore>) -> Self {
        let state = match store.load() {
            Some((pair, kind)) => {
                tracing::info!(
                    principal = %kind,
                    issued_at = %pair.issued_at.to_rfc3339(),
                    "Restored persisted session"
                );
                SessionState::Authenticated(pair, kind)
            }
            None => {
                tracing::info!("No persisted session, starting anonymous");
                SessionState::Anonymous
            }
        };
        Self::with_state(store, state)
    }

    fn with_state(store: Arc<dyn TokenStore>, state: SessionState) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state,
                    waiters: VecDeque::new(),
                    generation: 0,
                    next_waiter_id: 0,
                }),
                store,
                events,
            }),
        }
    }

    /// Install a freshly issued token pair
    /// Any waiters queued behind an in-flight refresh receive the new token.
    pub fn establish(&self, pair: TokenPair, kind: PrincipalKind) {
        let mut guard = self.shared.lock();
        let inner = &mut *guard;

        inner.generation += 1;
        self.shared.persist(&pair, kind);

        let access = pair.access.clone();
        inner.state = SessionState::Authenticated(pair, kind);
        let resolved = resolve_waiters(&mut inner.waiters, Ok(access));

        tracing::info!(principal = %kind, resolved, "Session established");
    }

    /// Get the access token to attach to an outbound request
    ///
    /// Returns immediately when authenticated. While a refresh is in flight the
    /// caller is queued and suspended until the refresh resolves.
    pub async fn current_token(&self) -> Result<AccessToken, SessionError> {
        let rx = {
            let mut guard = self.shared.lock();
            let inner = &mut *guard;

            match &inner.state {
                SessionState::Authenticated(pair, _) => return Ok(pair.access.clone()),
                SessionState::Anonymous => return Err(SessionError::NoSession),
                SessionState::Refreshing(..) => {
                    let (tx, rx) = oneshot::channel();
                    inner.next_waiter_id += 1;
                    inner.waiters.push_back(PendingRequest {
                        id: inner.next_waiter_id,
                        resolve: tx,
                        enqueued_at: Utc::now(),
                    });
                    tracing::debug!(
                        waiters = inner.waiters.len(),
                        "Waiting for in-flight token refresh"
                    );
                    rx
                }
            }
        };

        // A dropped sender means the manager went away mid-refresh
        rx.await.unwrap_or(Err(SessionError::SessionExpired))
    }

    /// Move `Authenticated -> Refreshing`, capturing the current refresh token
    ///
    /// Only one ticket can be outstanding; a second caller gets
    /// `AlreadyRefreshing` and should wait on `current_token()` instead.
    pub fn begin_refresh(&self) -> Result<RefreshTicket, SessionError> {
        let mut guard = self.shared.lock();
        self.start_refresh(&mut guard)
    }

    /// Like `begin_refresh`, but only if `observed` is still the current access token
    ///
    /// A request rejected with a token that has since been replaced is simply
    /// retried with the replacement; no second refresh is started.
    pub fn begin_refresh_for(&self, observed: &str) -> Result<RefreshStart, SessionError> {
        let mut guard = self.shared.lock();

        if let SessionState::Authenticated(pair, _) = &guard.state {
            if pair.access != observed {
                tracing::debug!(
                    current = %token_prefix(&pair.access),
                    "Rejected token already replaced, skipping refresh"
                );
                return Ok(RefreshStart::Superseded(pair.access.clone()));
            }
        }

        self.start_refresh(&mut guard).map(RefreshStart::Started)
    }

    fn start_refresh(&self, inner: &mut Inner) -> Result<RefreshTicket, SessionError> {
        let (pair, kind) = match &inner.state {
            SessionState::Anonymous => return Err(SessionError::NoSession),
            SessionState::Refreshing(..) => return Err(SessionError::AlreadyRefreshing),
            SessionState::Authenticated(pair, kind) => (pair.clone(), *kind),
        };

        if pair.refresh.is_empty() {
            tracing::warn!("No refresh token held, refresh not attempted");
            inner.generation += 1;
            inner.state = SessionState::Anonymous;
            self.shared.invalidate(inner, InvalidationReason::NoRefreshToken);
            return Err(SessionError::NoRefreshToken);
        }

        inner.generation += 1;
        inner.state = SessionState::Refreshing(pair.clone(), kind);
        tracing::info!(principal = %kind, "Token refresh started");

        Ok(RefreshTicket {
            shared: Arc::clone(&self.shared),
            generation: inner.generation,
            previous: pair,
            resolved: false,
        })
    }

    /// Move `Refreshing -> Authenticated(new_pair)` and wake every waiter
    /// Returns `false` if the ticket was superseded (logout or a new login).
    pub fn complete_refresh(&self, ticket: RefreshTicket, new_pair: TokenPair) -> bool {
        ticket.complete(new_pair)
    }

    /// Move `Refreshing -> Anonymous`, fail every waiter and notify observers
    /// Returns `false` if the ticket was superseded.
    pub fn fail_refresh(&self, ticket: RefreshTicket, reason: InvalidationReason) -> bool {
        ticket.fail(reason)
    }

    /// Tear down the session locally from any state
    pub fn logout(&self) {
        let mut guard = self.shared.lock();
        let inner = &mut *guard;

        let was = status_of(&inner.state);
        inner.generation += 1;
        inner.state = SessionState::Anonymous;
        self.shared.invalidate(inner, InvalidationReason::Logout);

        tracing::info!(was = ?was, "Logged out");
    }

    /// Subscribe to session notifications
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Token-free view of the current state
    pub fn status(&self) -> SessionStatus {
        status_of(&self.shared.lock().state)
    }

    /// Whether requests can currently be authenticated
    pub fn is_authenticated(&self) -> bool {
        !matches!(self.status(), SessionStatus::Anonymous)
    }

    /// Full copy of the current state
    pub fn snapshot(&self) -> SessionState {
        self.shared.lock().state.clone()
    }

    /// Number of callers queued behind an in-flight refresh
    pub fn pending_waiters(&self) -> usize {
        self.shared.lock().waiters.len()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State transitions never panic mid-way, a poisoned lock still holds a valid state
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, pair: &TokenPair, kind: PrincipalKind) {
        if let Err(e) = self.store.save(pair, kind) {
            tracing::error!("Failed to persist session: {:#}", e);
        }
    }

    /// Clear the store, fail every waiter and emit the notification
    /// Caller has already moved the state to `Anonymous`.
    fn invalidate(&self, inner: &mut Inner, reason: InvalidationReason) {
        if let Err(e) = self.store.clear() {
            tracing::error!("Failed to clear persisted session: {:#}", e);
        }

        let failed = resolve_waiters(&mut inner.waiters, Err(SessionError::SessionExpired));
        if failed > 0 {
            tracing::warn!(failed, reason = %reason, "Failed queued requests");
        }

        // No receivers is fine
        let _ = self.events.send(SessionEvent::Invalidated(reason));
        tracing::warn!(reason = %reason, "Session invalidated");
    }

    fn complete_refresh(&self, generation: u64, new_pair: TokenPair) -> bool {
        let mut guard = self.lock();
        let inner = &mut *guard;

        let kind = match &inner.state {
            SessionState::Refreshing(_, kind) if inner.generation == generation => *kind,
            _ => {
                tracing::warn!("Discarding result of a superseded token refresh");
                return false;
            }
        };

        self.persist(&new_pair, kind);
        let access = new_pair.access.clone();
        inner.state = SessionState::Authenticated(new_pair, kind);
        let resolved = resolve_waiters(&mut inner.waiters, Ok(access));

        tracing::info!(principal = %kind, resolved, "Token refresh completed");
        true
    }

    fn fail_refresh(&self, generation: u64, reason: InvalidationReason) -> bool {
        let mut guard = self.lock();
        let inner = &mut *guard;

        if !matches!(inner.state, SessionState::Refreshing(..)) || inner.generation != generation {
            tracing::debug!(reason = %reason, "Ignoring failure of a superseded token refresh");
            return false;
        }

        inner.generation += 1;
        inner.state = SessionState::Anonymous;
        self.invalidate(inner, reason);
        true
    }

    /// A ticket dropped without an outcome (its task was torn down)
    ///
    /// Nothing is known about the refresh token, so the previous pair is
    /// reinstated without touching the store. Waiters fail rather than
    /// receive the token that was already rejected.
    fn abandon_refresh(&self, generation: u64, previous: TokenPair) {
        let mut guard = self.lock();
        let inner = &mut *guard;

        let kind = match &inner.state {
            SessionState::Refreshing(_, kind) if inner.generation == generation => *kind,
            _ => return,
        };

        inner.generation += 1;
        inner.state = SessionState::Authenticated(previous, kind);
        let failed = resolve_waiters(&mut inner.waiters, Err(SessionError::Timeout));
        tracing::warn!(failed, "Token refresh abandoned before it resolved");
    }
}

/// Resolve queued waiters in enqueue order, returns how many were resolved
fn resolve_waiters(
    waiters: &mut VecDeque<PendingRequest>,
    outcome: Result<AccessToken, SessionError>,
) -> usize {
    let mut count = 0;
    while let Some(waiter) = waiters.pop_front() {
        let waited = Utc::now() - waiter.enqueued_at;
        tracing::trace!(
            waiter = waiter.id,
            waited_ms = waited.num_milliseconds(),
            "Resolving queued request"
        );
        // Receiver gone means the caller was cancelled
        let _ = waiter.resolve.send(outcome.clone());
        count += 1;
    }
    count
}

fn status_of(state: &SessionState) -> SessionStatus {
    match state {
        SessionState::Anonymous => SessionStatus::Anonymous,
        SessionState::Authenticated(_, kind) => SessionStatus::Authenticated(*kind),
        SessionState::Refreshing(_, kind) => SessionStatus::Refreshing(*kind),
    }
}

/// Proof of ownership of the single in-flight refresh
///
/// Must be resolved with `complete` or `fail`. Dropping it unresolved
/// reinstates the previous pair and fails the queued callers.
pub struct RefreshTicket {
    shared: Arc<Shared>,
    generation: u64,
    previous: TokenPair,
    resolved: bool,
}

impl RefreshTicket {
    /// Refresh token to exchange
    pub fn refresh_token(&self) -> &str {
        &self.previous.refresh
    }

    /// Pair that was current when the refresh started
    pub fn previous(&self) -> &TokenPair {
        &self.previous
    }

    pub fn complete(mut self, new_pair: TokenPair) -> bool {
        self.resolved = true;
        self.shared.complete_refresh(self.generation, new_pair)
    }

    pub fn fail(mut self, reason: InvalidationReason) -> bool {
        self.resolved = true;
        self.shared.fail_refresh(self.generation, reason)
    }
}

impl std::fmt::Debug for RefreshTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshTicket")
            .field("generation", &self.generation)
            .field("previous", &self.previous)
            .finish()
    }
}

impl Drop for RefreshTicket {
    fn drop(&mut self) {
        if !self.resolved {
            self.shared
                .abandon_refresh(self.generation, self.previous.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::MemoryTokenStore;
    use futures::FutureExt;

    fn manager_with_session() -> (SessionManager, Arc<MemoryTokenStore>) {
        let store = Arc::new(MemoryTokenStore::new());
        let manager = SessionManager::new(store.clone());
        manager.establish(TokenPair::new("T1", "R1"), PrincipalKind::Client);
        (manager, store)
    }

    #[tokio::test]
    async fn test_anonymous_has_no_token() {
        let manager = SessionManager::new(Arc::new(MemoryTokenStore::new()));
        assert_eq!(manager.current_token().await, Err(SessionError::NoSession));
        assert_eq!(manager.status(), SessionStatus::Anonymous);
        assert!(matches!(
            manager.begin_refresh(),
            Err(SessionError::NoSession)
        ));
    }

    #[tokio::test]
    async fn test_establish_persists_and_serves_token() {
        let (manager, store) = manager_with_session();
        assert_eq!(manager.current_token().await.unwrap(), "T1");
        assert_eq!(
            manager.status(),
            SessionStatus::Authenticated(PrincipalKind::Client)
        );
        assert_eq!(store.get("session.access").as_deref(), Some("T1"));
        assert_eq!(store.get("session.principal").as_deref(), Some("client"));
    }

    #[test]
    fn test_second_begin_refresh_reports_already_refreshing() {
        let (manager, _store) = manager_with_session();
        let ticket = manager.begin_refresh().unwrap();
        assert_eq!(ticket.refresh_token(), "R1");
        assert!(matches!(
            manager.begin_refresh(),
            Err(SessionError::AlreadyRefreshing)
        ));
        assert!(matches!(
            manager.begin_refresh_for("T1"),
            Err(SessionError::AlreadyRefreshing)
        ));
        assert!(ticket.complete(TokenPair::new("T2", "R2")));
    }

    #[test]
    fn test_begin_refresh_for_replaced_token() {
        let (manager, _store) = manager_with_session();
        match manager.begin_refresh_for("T0").unwrap() {
            RefreshStart::Superseded(token) => assert_eq!(token, "T1"),
            RefreshStart::Started(_) => panic!("refresh should not start for a stale token"),
        }
        assert_eq!(
            manager.status(),
            SessionStatus::Authenticated(PrincipalKind::Client)
        );
    }

    #[tokio::test]
    async fn test_waiters_receive_refreshed_token() {
        let (manager, store) = manager_with_session();
        let ticket = manager.begin_refresh().unwrap();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let m = manager.clone();
            handles.push(tokio::spawn(async move { m.current_token().await }));
        }
        while manager.pending_waiters() < 5 {
            tokio::task::yield_now().await;
        }

        assert!(manager.complete_refresh(ticket, TokenPair::new("T2", "R2")));

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "T2");
        }
        assert_eq!(manager.pending_waiters(), 0);
        assert_eq!(store.get("session.access").as_deref(), Some("T2"));
        assert_eq!(store.get("session.refresh").as_deref(), Some("R2"));
    }

    #[test]
    fn test_waiters_resolved_in_enqueue_order() {
        let (manager, _store) = manager_with_session();
        let ticket = manager.begin_refresh().unwrap();

        // Poll each future once so it enqueues, in order
        let mut futures: Vec<_> = (0..3).map(|_| manager.current_token().boxed()).collect();
        for fut in futures.iter_mut() {
            assert!(fut.as_mut().now_or_never().is_none());
        }

        {
            let guard = manager.shared.lock();
            let ids: Vec<u64> = guard.waiters.iter().map(|w| w.id).collect();
            assert_eq!(ids, vec![1, 2, 3]);
        }

        assert!(ticket.complete(TokenPair::new("T2", "R2")));
        for fut in futures {
            assert_eq!(fut.now_or_never().unwrap().unwrap(), "T2");
        }
    }

    #[tokio::test]
    async fn test_fail_refresh_invalidates_session() {
        let (manager, store) = manager_with_session();
        let mut events = manager.subscribe();
        let ticket = manager.begin_refresh().unwrap();

        let m = manager.clone();
        let waiter = tokio::spawn(async move { m.current_token().await });
        while manager.pending_waiters() < 1 {
            tokio::task::yield_now().await;
        }

        assert!(manager.fail_refresh(ticket, InvalidationReason::ExpiredRefresh));

        assert_eq!(waiter.await.unwrap(), Err(SessionError::SessionExpired));
        assert_eq!(manager.status(), SessionStatus::Anonymous);
        assert!(store.is_empty());
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Invalidated(InvalidationReason::ExpiredRefresh)
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_logout_from_every_state() {
        // Anonymous
        let store = Arc::new(MemoryTokenStore::new());
        let manager = SessionManager::new(store.clone());
        let mut events = manager.subscribe();
        manager.logout();
        assert_eq!(manager.status(), SessionStatus::Anonymous);
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Invalidated(InvalidationReason::Logout)
        );

        // Authenticated
        let (manager, store) = manager_with_session();
        manager.logout();
        assert_eq!(manager.status(), SessionStatus::Anonymous);
        assert!(store.is_empty());

        // Refreshing, with a queued waiter
        let (manager, store) = manager_with_session();
        let ticket = manager.begin_refresh().unwrap();
        let m = manager.clone();
        let waiter = tokio::spawn(async move { m.current_token().await });
        while manager.pending_waiters() < 1 {
            tokio::task::yield_now().await;
        }
        manager.logout();
        assert_eq!(waiter.await.unwrap(), Err(SessionError::SessionExpired));
        assert_eq!(manager.pending_waiters(), 0);
        assert!(store.is_empty());

        // The refresh that was in flight no longer applies
        assert!(!ticket.complete(TokenPair::new("T2", "R2")));
        assert_eq!(manager.status(), SessionStatus::Anonymous);
        assert!(store.is_empty());
    }

    #[test]
    fn test_stale_ticket_ignored_after_new_login() {
        let (manager, _store) = manager_with_session();
        let ticket = manager.begin_refresh().unwrap();
        manager.logout();
        manager.establish(TokenPair::new("B1", "BR1"), PrincipalKind::BusinessAdmin);

        assert!(!ticket.fail(InvalidationReason::ExpiredRefresh));
        assert_eq!(
            manager.status(),
            SessionStatus::Authenticated(PrincipalKind::BusinessAdmin)
        );
    }

    #[tokio::test]
    async fn test_establish_during_refresh_wakes_waiters() {
        let (manager, _store) = manager_with_session();
        let ticket = manager.begin_refresh().unwrap();
        let m = manager.clone();
        let waiter = tokio::spawn(async move { m.current_token().await });
        while manager.pending_waiters() < 1 {
            tokio::task::yield_now().await;
        }

        manager.establish(TokenPair::new("L1", "LR1"), PrincipalKind::Client);
        assert_eq!(waiter.await.unwrap().unwrap(), "L1");
        assert!(!ticket.complete(TokenPair::new("T2", "R2")));
        assert_eq!(manager.current_token().await.unwrap(), "L1");
    }

    #[test]
    fn test_missing_refresh_token_fails_without_refreshing() {
        let store = Arc::new(MemoryTokenStore::new());
        let manager = SessionManager::new(store.clone());
        let mut events = manager.subscribe();
        manager.establish(TokenPair::new("T1", ""), PrincipalKind::Client);

        assert!(matches!(
            manager.begin_refresh_for("T1"),
            Err(SessionError::NoRefreshToken)
        ));
        assert_eq!(manager.status(), SessionStatus::Anonymous);
        assert!(store.is_empty());
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Invalidated(InvalidationReason::NoRefreshToken)
        );
    }

    #[tokio::test]
    async fn test_dropped_ticket_restores_previous_pair() {
        let (manager, store) = manager_with_session();
        let mut events = manager.subscribe();
        let ticket = manager.begin_refresh().unwrap();

        let m = manager.clone();
        let waiter = tokio::spawn(async move { m.current_token().await });
        while manager.pending_waiters() < 1 {
            tokio::task::yield_now().await;
        }

        drop(ticket);

        assert_eq!(waiter.await.unwrap(), Err(SessionError::Timeout));
        assert_eq!(
            manager.status(),
            SessionStatus::Authenticated(PrincipalKind::Client)
        );
        assert_eq!(store.get("session.access").as_deref(), Some("T1"));
        assert!(events.try_recv().is_err());

        // A later refresh can start again
        assert!(manager.begin_refresh().is_ok());
    }

    #[test]
    fn test_restore_from_store() {
        let store = Arc::new(MemoryTokenStore::new());
        let pair = TokenPair::new("T9", "R9");
        {
            let manager = SessionManager::new(store.clone());
            manager.establish(pair.clone(), PrincipalKind::BusinessAdmin);
        }

        let restored = SessionManager::restore(store);
        assert_eq!(
            restored.snapshot(),
            SessionState::Authenticated(pair, PrincipalKind::BusinessAdmin)
        );
    }
}
