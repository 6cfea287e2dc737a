//! Session lifecycle: acquisition, periodic refresh, expiry, dev-mode bypass.
//!
//! `SessionManager` owns the single authoritative `Session` of the process and
//! mirrors its token into the shared `CredentialStore`. Every state change is
//! published as a `SessionSnapshot` on a watch channel.
//!
//! Each session replacement bumps an epoch. Background refreshes remember the
//! epoch they started under and their result is dropped if the session was
//! replaced (logout, new login) while they were in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::credentials::{CredentialStore, Token};
use super::identity::{Identity, OrgId};
use super::provider::{IdentityProvider, InitSession, LoginRequest, ProviderError, Refresh, TokenGrant};

/// Refresh timer period.
/// Comfortably longer than a token round trip so ticks never pile up.
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 60;

/// Refresh when the token has this many seconds or fewer left
pub const DEFAULT_MIN_VALIDITY_SECS: u64 = 30;

const MIN_TIMER_PERIOD: Duration = Duration::from_millis(10);

/// Organization assigned to the dev-mode identity
pub const DEFAULT_FALLBACK_ORG_ID: &str = "00000000-0000-0000-0000-000000000001";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub refresh_interval: Duration,
    pub min_validity: Duration,
    /// Fall back to a dev-mode session when the provider is unreachable
    pub dev_fallback: bool,
    pub fallback_org_id: OrgId,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS),
            min_validity: Duration::from_secs(DEFAULT_MIN_VALIDITY_SECS),
            dev_fallback: true,
            fallback_org_id: OrgId(DEFAULT_FALLBACK_ORG_ID.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Loading,
    Authenticated,
    Unauthenticated,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub status: SessionStatus,
    pub token: Option<Token>,
    pub identity: Option<Identity>,
    pub expires_at: Option<DateTime<Utc>>,
    pub dev_mode: bool,
}

impl Session {
    fn loading() -> Self {
        Self {
            status: SessionStatus::Loading,
            token: None,
            identity: None,
            expires_at: None,
            dev_mode: false,
        }
    }

    fn unauthenticated() -> Self {
        Self {
            status: SessionStatus::Unauthenticated,
            ..Self::loading()
        }
    }

    fn from_grant(grant: &TokenGrant) -> Self {
        Self {
            status: SessionStatus::Authenticated,
            token: Some(grant.token.clone()),
            identity: Some(Identity::from_claims(&grant.claims)),
            expires_at: grant.token.expires_at(),
            dev_mode: false,
        }
    }

    fn dev_mode(org_id: OrgId) -> Self {
        Self {
            status: SessionStatus::Authenticated,
            token: None,
            identity: Some(Identity::dev_mode(org_id)),
            expires_at: None,
            dev_mode: true,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.status == SessionStatus::Authenticated
    }

    /// Provider-backed sessions are the only ones that refresh
    fn is_refreshable(&self) -> bool {
        self.is_authenticated() && !self.dev_mode
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            authenticated: self.is_authenticated(),
            loading: self.status == SessionStatus::Loading,
            dev_mode: self.dev_mode,
            identity: self.identity.clone(),
            expires_at: self.expires_at,
        }
    }
}

/// Read-only view of the session for the view layer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct SessionSnapshot {
    pub authenticated: bool,
    pub loading: bool,
    pub dev_mode: bool,
    pub identity: Option<Identity>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new token was installed
    Refreshed,
    /// The token had enough validity left
    StillValid,
    /// Another refresh was already in flight
    Skipped,
    /// No provider-backed session to refresh
    Inactive,
    /// The session changed while the refresh was in flight
    Discarded,
    /// The provider refused; the session is now unauthenticated
    Expired,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Login failed: {0}")]
    Login(#[source] ProviderError),
}

struct State {
    session: Session,
    epoch: u64,
}

struct RefreshTimer {
    epoch: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner<P> {
    provider: P,
    config: SessionConfig,
    credentials: CredentialStore,
    state: Mutex<State>,
    snapshots: watch::Sender<SessionSnapshot>,
    initialized: AtomicBool,
    refreshing: AtomicBool,
    refresh_timer: Mutex<Option<RefreshTimer>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the in-flight flag when a refresh finishes or is dropped mid-way
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<P: IdentityProvider> Inner<P> {
    /// Install a new session unconditionally, returning its epoch
    fn replace(&self, session: Session) -> u64 {
        let mut state = lock(&self.state);
        state.epoch += 1;
        self.install(&mut state, session);
        state.epoch
    }

    /// Install a new session only if `epoch` is still current
    fn replace_if(&self, epoch: u64, session: Session) -> Option<u64> {
        let mut state = lock(&self.state);
        if state.epoch != epoch {
            return None;
        }
        state.epoch += 1;
        self.install(&mut state, session);
        Some(state.epoch)
    }

    fn install(&self, state: &mut State, session: Session) {
        self.credentials.set(session.token.clone());
        state.session = session;
        self.snapshots.send_replace(state.session.snapshot());
    }

    fn cancel_refresh_timer(&self) {
        if let Some(timer) = lock(&self.refresh_timer).take() {
            debug!(epoch = timer.epoch, "Cancelling refresh timer");
            timer.cancel.cancel();
        }
    }

    /// Cancel the timer only if it still belongs to the session at `epoch`.
    /// A timer armed by a later login is left alone.
    fn cancel_refresh_timer_for(&self, epoch: u64) {
        let mut slot = lock(&self.refresh_timer);
        if slot.as_ref().is_some_and(|t| t.epoch == epoch) {
            if let Some(timer) = slot.take() {
                debug!(epoch, "Cancelling refresh timer");
                timer.cancel.cancel();
            }
        }
    }

    async fn refresh(&self, expected_epoch: Option<u64>) -> RefreshOutcome {
        let epoch = {
            let state = lock(&self.state);
            if !state.session.is_refreshable() {
                return RefreshOutcome::Inactive;
            }
            if expected_epoch.is_some_and(|e| e != state.epoch) {
                return RefreshOutcome::Inactive;
            }
            state.epoch
        };

        let Some(_in_flight) = InFlight::acquire(&self.refreshing) else {
            debug!("Refresh already in flight, skipping");
            return RefreshOutcome::Skipped;
        };

        match self.provider.refresh_token(self.config.min_validity).await {
            Ok(Refresh::StillValid) => RefreshOutcome::StillValid,
            Ok(Refresh::Refreshed(grant)) => {
                let mut state = lock(&self.state);
                if state.epoch != epoch || !state.session.is_refreshable() {
                    debug!("Session changed during refresh, discarding token");
                    return RefreshOutcome::Discarded;
                }
                // Same session, new credential: the epoch stays.
                let session = Session::from_grant(&grant);
                self.install(&mut state, session);
                debug!(expires_at = ?grant.token.expires_at(), "Token refreshed");
                RefreshOutcome::Refreshed
            }
            Err(e) => {
                if self.replace_if(epoch, Session::unauthenticated()).is_none() {
                    return RefreshOutcome::Discarded;
                }
                warn!(error = %e, "Token refresh failed, session ended");
                self.cancel_refresh_timer_for(epoch);
                RefreshOutcome::Expired
            }
        }
    }
}

impl<P> Drop for Inner<P> {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.refresh_timer).take() {
            timer.cancel.cancel();
        }
    }
}

/// Owns the process session. Clone is cheap and all clones share state.
pub struct SessionManager<P> {
    inner: Arc<Inner<P>>,
}

impl<P> Clone for SessionManager<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: IdentityProvider> SessionManager<P> {
    pub fn new(provider: P, config: SessionConfig) -> Self {
        let session = Session::loading();
        let (snapshots, _) = watch::channel(session.snapshot());

        Self {
            inner: Arc::new(Inner {
                provider,
                config,
                credentials: CredentialStore::new(),
                state: Mutex::new(State { session, epoch: 0 }),
                snapshots,
                initialized: AtomicBool::new(false),
                refreshing: AtomicBool::new(false),
                refresh_timer: Mutex::new(None),
            }),
        }
    }

    /// Credential store to hand to the API gateway
    pub fn credentials(&self) -> CredentialStore {
        self.inner.credentials.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        lock(&self.inner.state).session.snapshot()
    }

    /// Full session including the token
    pub fn session(&self) -> Session {
        lock(&self.inner.state).session.clone()
    }

    /// Stream of snapshots, starting with the current one
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshots.subscribe()
    }

    pub fn is_refresh_armed(&self) -> bool {
        lock(&self.inner.refresh_timer)
            .as_ref()
            .is_some_and(|t| !t.cancel.is_cancelled() && !t.handle.is_finished())
    }

    /// Establish the session with the identity provider.
    ///
    /// Runs once per process; later calls return the current snapshot.
    /// A reachable provider decides between authenticated and
    /// unauthenticated. An unreachable one yields the dev-mode session when
    /// `dev_fallback` is enabled.
    pub async fn initialize(&self) -> SessionSnapshot {
        if self.inner.initialized.swap(true, Ordering::AcqRel) {
            debug!("Session already initialized");
            return self.snapshot();
        }

        let epoch = lock(&self.inner.state).epoch;

        let session = match self.inner.provider.init_session().await {
            Ok(InitSession {
                authenticated: true,
                grant: Some(grant),
            }) => Session::from_grant(&grant),
            Ok(InitSession {
                authenticated: true,
                grant: None,
            }) => {
                warn!("Provider reported an authenticated session without a token");
                Session::unauthenticated()
            }
            Ok(_) => Session::unauthenticated(),
            Err(e) if e.is_unreachable() && self.inner.config.dev_fallback => {
                warn!(
                    error = %e,
                    org_id = %self.inner.config.fallback_org_id,
                    "Identity provider unreachable, using dev-mode session"
                );
                Session::dev_mode(self.inner.config.fallback_org_id.clone())
            }
            Err(e) => {
                warn!(error = %e, "Session initialization failed");
                Session::unauthenticated()
            }
        };

        let refreshable = session.is_refreshable();
        let dev_mode = session.dev_mode;
        match self.inner.replace_if(epoch, session) {
            Some(new_epoch) => {
                info!(authenticated = refreshable || dev_mode, dev_mode, "Session initialized");
                if refreshable {
                    self.arm_refresh(new_epoch);
                }
            }
            None => debug!("Session replaced during initialization, keeping it"),
        }

        self.snapshot()
    }

    /// Ask the provider to extend the token now.
    /// Skipped if another refresh is in flight.
    pub async fn refresh(&self) -> RefreshOutcome {
        self.inner.refresh(None).await
    }

    pub async fn login(&self, request: &LoginRequest) -> Result<SessionSnapshot, SessionError> {
        let grant = self.inner.provider.login(request).await.map_err(|e| {
            warn!(error = %e, username = %request.username, "Login failed");
            SessionError::Login(e)
        })?;

        // A login settles the session, a later initialize() is a no-op.
        self.inner.initialized.store(true, Ordering::Release);
        let epoch = self.inner.replace(Session::from_grant(&grant));
        self.arm_refresh(epoch);
        info!(username = %request.username, "Login successful");
        Ok(self.snapshot())
    }

    /// Cancel the refresh timer, drop the credential, and end the session.
    /// Provider-side failures are logged only.
    pub async fn logout(&self) -> SessionSnapshot {
        self.inner.cancel_refresh_timer();
        self.inner.replace(Session::unauthenticated());
        info!("Logged out");

        if let Err(e) = self.inner.provider.logout().await {
            warn!(error = %e, "Provider logout failed");
        }
        self.snapshot()
    }

    fn arm_refresh(&self, epoch: u64) {
        let mut slot = lock(&self.inner.refresh_timer);
        if let Some(existing) = slot.as_ref() {
            if existing.epoch == epoch && !existing.cancel.is_cancelled() {
                return;
            }
        }
        if let Some(old) = slot.take() {
            old.cancel.cancel();
        }

        // tokio intervals panic on a zero period
        let period = self.inner.config.refresh_interval.max(MIN_TIMER_PERIOD);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(refresh_loop(
            Arc::downgrade(&self.inner),
            epoch,
            period,
            cancel.clone(),
        ));
        debug!(epoch, period = ?period, "Refresh timer armed");
        *slot = Some(RefreshTimer {
            epoch,
            cancel,
            handle,
        });
    }
}

async fn refresh_loop<P: IdentityProvider>(
    inner: Weak<Inner<P>>,
    epoch: u64,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(inner) = inner.upgrade() else {
            break;
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            outcome = inner.refresh(Some(epoch)) => outcome,
        };

        match outcome {
            RefreshOutcome::Expired | RefreshOutcome::Inactive | RefreshOutcome::Discarded => break,
            RefreshOutcome::Refreshed | RefreshOutcome::StillValid | RefreshOutcome::Skipped => {}
        }
    }
    debug!(epoch, "Refresh loop stopped");
}
