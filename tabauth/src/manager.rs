use std::{error, fmt, sync::Arc, time::Duration};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tabauth_clock::{Clock, DurationSecs, System};
use tokio::{sync::watch, task::JoinHandle};
use tracing::Instrument;

use crate::{
    claims::{ClaimDecoder, ClaimSet, JwtDecoder},
    error::{Error, InvalidExpiryClaim, MalformedCredential},
    lock::{self, LockOutcome, StorageLock},
    refresh::Refresher,
    storage::Storage,
    AccessToken, AccessTokenRef, LockName, RefreshToken,
};

/// The storage key holding the access credential
pub const ACCESS_TOKEN_KEY: &str = "tabauth.access_token";

/// The storage key holding the renewal credential
pub const REFRESH_TOKEN_KEY: &str = "tabauth.refresh_token";

/// The name of the lock serializing renewals across contexts
pub const RENEWAL_LOCK_NAME: &str = "credential-renewal";

/// How long a renewal waits for another context's renewal to finish
pub const RENEWAL_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// The clock skew tolerated when checking expiry, unless configured
pub const DEFAULT_SKEW: DurationSecs = DurationSecs(15);

/// A callback invoked with the new claims whenever the credentials change
///
/// Receives `None` on logout.
pub type ChangeCallback = Arc<dyn Fn(Option<&ClaimSet>) + Send + Sync>;

type RenewalOutcome = Result<Option<Arc<ClaimSet>>, Error>;

/// Configuration for a [`CredentialManager`]
#[derive(Clone, Default)]
pub struct ManagerConfig {
    refresher: Option<Arc<dyn Refresher>>,
    on_change: Option<ChangeCallback>,
    skew: Option<DurationSecs>,
}

impl fmt::Debug for ManagerConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ManagerConfig")
            .field("has_refresher", &self.refresher.is_some())
            .field("has_on_change", &self.on_change.is_some())
            .field("skew", &self.skew)
            .finish()
    }
}

impl ManagerConfig {
    /// Constructs an empty configuration
    ///
    /// A refresher must be supplied before the configuration is accepted by
    /// [`CredentialManager::initialize()`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the function used to renew credentials
    pub fn with_refresher(mut self, refresher: impl Refresher + 'static) -> Self {
        self.refresher = Some(Arc::new(refresher));
        self
    }

    /// Sets a callback to be invoked whenever the credentials change
    pub fn with_on_change<F>(mut self, on_change: F) -> Self
    where
        F: Fn(Option<&ClaimSet>) + Send + Sync + 'static,
    {
        self.on_change = Some(Arc::new(on_change));
        self
    }

    /// Sets the clock skew tolerated when checking expiry
    ///
    /// Defaults to [`DEFAULT_SKEW`].
    pub fn with_skew(mut self, skew: DurationSecs) -> Self {
        self.skew = Some(skew);
        self
    }
}

struct Settings {
    refresher: Arc<dyn Refresher>,
    on_change: Option<ChangeCallback>,
    skew: DurationSecs,
}

#[derive(Debug)]
struct StoredCredentials {
    access_token: Option<AccessToken>,
    refresh_token: Option<RefreshToken>,
}

struct Decoded {
    raw: String,
    claims: Arc<ClaimSet>,
}

struct Inner {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock + Send + Sync>,
    decoder: Arc<dyn ClaimDecoder>,
    lock: StorageLock,
    settings: ArcSwapOption<Settings>,
    decoded: Mutex<Option<Decoded>>,
    in_flight: Mutex<Option<watch::Receiver<Option<RenewalOutcome>>>>,
    changes: watch::Sender<Option<Arc<ClaimSet>>>,
}

/// Builds a [`CredentialManager`] with a custom clock or decoder
#[must_use]
pub struct CredentialManagerBuilder {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock + Send + Sync>,
    decoder: Arc<dyn ClaimDecoder>,
}

impl fmt::Debug for CredentialManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CredentialManagerBuilder").finish_non_exhaustive()
    }
}

impl CredentialManagerBuilder {
    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock(mut self, clock: impl Clock + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Sets the decoder used to read claims out of access credentials
    pub fn with_decoder(mut self, decoder: impl ClaimDecoder + 'static) -> Self {
        self.decoder = Arc::new(decoder);
        self
    }

    /// Builds the manager
    ///
    /// Stale lock records abandoned by other contexts are swept from the
    /// store at this point, before any lock is requested.
    pub fn build(self) -> CredentialManager {
        lock::sweep_stale_locks(&*self.storage, &*self.clock);

        let lock = StorageLock::new(
            LockName::from_static(RENEWAL_LOCK_NAME),
            Arc::clone(&self.storage),
            Arc::clone(&self.clock),
        );

        let (changes, _) = watch::channel(None);

        CredentialManager {
            inner: Arc::new(Inner {
                storage: self.storage,
                clock: self.clock,
                decoder: self.decoder,
                lock,
                settings: ArcSwapOption::empty(),
                decoded: Mutex::new(None),
                in_flight: Mutex::new(None),
                changes,
            }),
        }
    }
}

/// Manages an access/renewal credential pair held in shared storage
///
/// Every execution context builds its own manager over its own handle onto
/// the shared store. Renewals are single-flight within a manager and are
/// serialized across contexts by a storage-backed lock.
///
/// Cloning the manager produces another handle onto the same state.
#[derive(Clone)]
#[must_use]
pub struct CredentialManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CredentialManager")
            .field("configured", &self.is_configured())
            .field("renewing", &self.inner.in_flight.lock().is_some())
            .field("lock", &self.inner.lock)
            .finish()
    }
}

impl CredentialManager {
    /// Constructs a manager over `storage` using the system clock and
    /// the JWT claim decoder
    pub fn new(storage: impl Storage + 'static) -> Self {
        Self::builder(storage).build()
    }

    /// Starts building a manager over `storage`
    pub fn builder(storage: impl Storage + 'static) -> CredentialManagerBuilder {
        CredentialManagerBuilder {
            storage: Arc::new(storage),
            clock: Arc::new(System),
            decoder: Arc::new(JwtDecoder),
        }
    }

    /// Configures the manager and loads the stored credentials
    ///
    /// If the stored access credential has already expired, a renewal is
    /// started in the background; callers of [`renew()`](Self::renew) or
    /// [`read()`](Self::read) will join it. Otherwise the stored pair is
    /// written back and subscribers are notified with its claims.
    ///
    /// Calling this again replaces the configuration.
    ///
    /// # Errors
    ///
    /// Fails if the configuration has no refresher, or if a renewal is needed
    /// and there is no tokio runtime to run it on.
    pub fn initialize(&self, config: ManagerConfig) -> Result<(), Error> {
        let refresher = config.refresher.ok_or(Error::MissingRefreshFunction)?;
        let settings = Arc::new(Settings {
            refresher,
            on_change: config.on_change,
            skew: config.skew.unwrap_or(DEFAULT_SKEW),
        });

        let stored = self.inner.load();
        let expired = match &stored.access_token {
            Some(access) => self
                .inner
                .needs_renewal(access, settings.skew)
                .unwrap_or_else(|error| {
                    tracing::warn!(
                        error = (&error as &dyn error::Error),
                        "stored access token has an unusable expiry, renewing"
                    );
                    true
                }),
            None => false,
        };

        if expired {
            current_runtime()?;
        }

        self.inner.settings.store(Some(Arc::clone(&settings)));
        tracing::debug!(skew = settings.skew.0, "credential manager configured");

        if expired {
            tracing::info!("stored access token has expired, renewing in the background");
            join_or_start_renewal(&self.inner)?;
        } else {
            self.inner
                .store_pair(Some(&*settings), stored.access_token, stored.refresh_token);
        }

        Ok(())
    }

    /// Whether [`initialize()`](Self::initialize) has succeeded
    pub fn is_configured(&self) -> bool {
        self.inner.settings.load().is_some()
    }

    /// Reads a valid access credential, renewing it first if it has expired
    ///
    /// Returns `None` when logged out. A malformed access credential is
    /// treated as expired.
    ///
    /// # Errors
    ///
    /// Fails if the manager is not configured, if the stored credential has
    /// an unusable expiry claim, or if a required renewal fails.
    pub async fn read(&self) -> Result<Option<AccessToken>, Error> {
        let settings = self.inner.settings()?;

        let access = match self.inner.load().access_token {
            Some(access) => access,
            None => return Ok(None),
        };

        if !self.inner.needs_renewal(&access, settings.skew)? {
            return Ok(Some(access));
        }

        tracing::debug!("access token expired, renewing before read");
        self.renew().await?;

        Ok(self.inner.load().access_token)
    }

    /// Renews the credentials
    ///
    /// If a renewal is already running in this context, its outcome is
    /// shared rather than starting another. Once started, a renewal runs to
    /// completion even if every caller stops waiting for it.
    ///
    /// Returns the claims of the new access credential, or `None` if the
    /// renewal ended in a logout.
    ///
    /// # Errors
    ///
    /// Fails if the manager is not configured, or with
    /// [`Error::RenewalFailed`] if the refresher rejected the renewal, in
    /// which case the stored credentials have been cleared.
    pub async fn renew(&self) -> Result<Option<Arc<ClaimSet>>, Error> {
        self.inner.settings()?;
        let flight = join_or_start_renewal(&self.inner)?;
        await_renewal(flight).await
    }

    /// Stores a new credential pair
    ///
    /// An empty or absent access credential logs out instead.
    ///
    /// # Errors
    ///
    /// Fails if the manager is not configured.
    pub fn write(
        &self,
        access_token: Option<&str>,
        refresh_token: Option<&str>,
    ) -> Result<(), Error> {
        let settings = self.inner.settings()?;
        self.inner.store_pair(
            Some(&*settings),
            access_token.map(AccessToken::from),
            refresh_token.map(RefreshToken::from),
        );
        Ok(())
    }

    /// Clears the stored credentials and notifies subscribers
    pub fn clear(&self) {
        let settings = self.inner.settings.load_full();
        self.inner.logout(settings.as_deref());
    }

    /// Whether a live access credential is stored
    ///
    /// Never fails; anything short of a decodable, unexpired credential
    /// reads as logged out.
    pub fn is_logged_in(&self) -> bool {
        let settings = match self.inner.settings.load_full() {
            Some(settings) => settings,
            None => return false,
        };

        let access = match self.inner.load().access_token {
            Some(access) => access,
            None => return false,
        };

        match self.inner.decode(&access) {
            Ok(claims) => matches!(
                claims.is_expired_at(settings.skew, self.inner.clock.now()),
                Ok(false)
            ),
            Err(_) => false,
        }
    }

    /// The decoded claims of the stored access credential, without any
    /// expiry check
    pub fn claims(&self) -> Option<Arc<ClaimSet>> {
        let access = self.inner.load().access_token?;
        self.inner.decode(&access).ok()
    }

    /// Subscribes to credential changes
    ///
    /// The receiver holds the claims most recently published by this
    /// manager, or `None` when logged out.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<ClaimSet>>> {
        self.inner.changes.subscribe()
    }

    /// Spawns a task republishing credential changes made by other contexts
    ///
    /// Without this, subscribers only hear about changes made through this
    /// manager. The task stops once the manager has been dropped and another
    /// change arrives, or when the store goes away.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn spawn_storage_sync(&self) -> JoinHandle<()> {
        let mut events = self.inner.storage.subscribe();
        let inner = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if !event.affects(ACCESS_TOKEN_KEY) {
                    continue;
                }

                let inner = match inner.upgrade() {
                    Some(inner) => inner,
                    None => break,
                };

                let claims = inner
                    .load()
                    .access_token
                    .and_then(|access| inner.decode(&access).ok());

                tracing::debug!(
                    logged_in = claims.is_some(),
                    "credentials changed in another context"
                );

                let settings = inner.settings.load_full();
                inner.notify(settings.as_deref(), claims);
            }

            tracing::debug!("storage sync stopped");
        })
    }
}

struct InFlight<'a>(&'a Inner);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.lock().take();
    }
}

/// Releases the renewal lock when dropped, including on unwind
struct HeldLock<'a>(&'a StorageLock);

impl Drop for HeldLock<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

fn join_or_start_renewal(
    inner: &Arc<Inner>,
) -> Result<watch::Receiver<Option<RenewalOutcome>>, Error> {
    let mut slot = inner.in_flight.lock();

    if let Some(flight) = &*slot {
        tracing::trace!("joining in-flight renewal");
        return Ok(flight.clone());
    }

    let runtime = current_runtime()?;

    let (tx, rx) = watch::channel(None);
    *slot = Some(rx.clone());
    drop(slot);

    let this = Arc::clone(inner);
    let renewal = async move {
        let outcome = {
            let _flight = InFlight(&this);
            this.renew_exclusive().await
        };

        tx.send_replace(Some(outcome));
    };
    runtime.spawn(renewal.in_current_span());

    Ok(rx)
}

fn current_runtime() -> Result<tokio::runtime::Handle, Error> {
    tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)
}

async fn await_renewal(mut flight: watch::Receiver<Option<RenewalOutcome>>) -> RenewalOutcome {
    match flight.wait_for(Option::is_some).await {
        Ok(outcome) => (*outcome).clone().unwrap_or(Err(Error::RenewalInterrupted)),
        Err(_) => Err(Error::RenewalInterrupted),
    }
}

impl Inner {
    fn settings(&self) -> Result<Arc<Settings>, Error> {
        self.settings.load_full().ok_or(Error::NotConfigured)
    }

    fn load(&self) -> StoredCredentials {
        StoredCredentials {
            access_token: self.read_key(ACCESS_TOKEN_KEY).map(AccessToken::from),
            refresh_token: self.read_key(REFRESH_TOKEN_KEY).map(RefreshToken::from),
        }
    }

    fn read_key(&self, key: &str) -> Option<String> {
        self.storage.get(key).filter(|value| !value.is_empty())
    }

    fn decode(&self, access: &AccessTokenRef) -> Result<Arc<ClaimSet>, MalformedCredential> {
        let raw = access.as_str();
        let mut decoded = self.decoded.lock();

        if let Some(cached) = decoded.as_ref().filter(|d| d.raw == raw) {
            tracing::trace!("reusing decoded claims");
            return Ok(Arc::clone(&cached.claims));
        }

        match self.decoder.decode(raw) {
            Ok(claims) => {
                let claims = Arc::new(claims);
                *decoded = Some(Decoded {
                    raw: raw.to_owned(),
                    claims: Arc::clone(&claims),
                });
                Ok(claims)
            }
            Err(error) => {
                *decoded = None;
                Err(error)
            }
        }
    }

    fn needs_renewal(
        &self,
        access: &AccessTokenRef,
        skew: DurationSecs,
    ) -> Result<bool, InvalidExpiryClaim> {
        match self.decode(access) {
            Ok(claims) => claims.is_expired_at(skew, self.clock.now()),
            Err(error) => {
                tracing::debug!(
                    error = (&error as &dyn error::Error),
                    "stored access token is malformed, treating as expired"
                );
                Ok(true)
            }
        }
    }

    async fn renew_exclusive(&self) -> RenewalOutcome {
        let settings = self.settings()?;
        let seen = self.load();

        if seen.refresh_token.is_none() {
            tracing::info!("no refresh token available, logging out");
            self.logout(Some(&*settings));
            return Ok(None);
        }

        let outcome = self.lock.acquire_or_wait(RENEWAL_LOCK_TIMEOUT).await;
        let _held = outcome.is_held().then(|| HeldLock(&self.lock));

        self.renew_with_outcome(&settings, &seen, outcome).await
    }

    async fn renew_with_outcome(
        &self,
        settings: &Settings,
        seen: &StoredCredentials,
        outcome: LockOutcome,
    ) -> RenewalOutcome {
        let current = self.load();

        if outcome == LockOutcome::AcquiredAfterWait && current.access_token != seen.access_token {
            if let Some(access) = &current.access_token {
                if let Ok(false) = self.needs_renewal(access, settings.skew) {
                    tracing::info!("credentials renewed by another context, adopting them");
                    let claims = self.decode(access).ok();
                    self.notify(Some(settings), claims.clone());
                    return Ok(claims);
                }
            }
        }

        let refresh_token = match current.refresh_token {
            Some(refresh_token) => refresh_token,
            None => {
                tracing::info!("refresh token removed while waiting for lock, logging out");
                self.logout(Some(settings));
                return Ok(None);
            }
        };

        tracing::debug!(lock = ?outcome, "requesting renewed credentials");

        match settings.refresher.refresh(&refresh_token).await {
            Ok(renewed) => {
                let refresh_token = renewed.refresh_token.or(Some(refresh_token));
                let claims = self.store_pair(Some(settings), renewed.access_token, refresh_token);
                tracing::info!(logged_in = claims.is_some(), "credential renewal completed");
                Ok(claims)
            }
            Err(error) => {
                tracing::warn!(
                    error = (&*error as &dyn error::Error),
                    "credential renewal failed, logging out"
                );
                self.logout(Some(settings));
                Err(Error::RenewalFailed(Arc::from(error)))
            }
        }
    }

    fn store_pair(
        &self,
        settings: Option<&Settings>,
        access_token: Option<AccessToken>,
        refresh_token: Option<RefreshToken>,
    ) -> Option<Arc<ClaimSet>> {
        let access_token = match access_token.filter(|a| !a.as_str().is_empty()) {
            Some(access_token) => access_token,
            None => {
                self.logout(settings);
                return None;
            }
        };

        self.storage.set(ACCESS_TOKEN_KEY, access_token.as_str());
        match refresh_token.filter(|r| !r.as_str().is_empty()) {
            Some(refresh_token) => self.storage.set(REFRESH_TOKEN_KEY, refresh_token.as_str()),
            None => self.storage.remove(REFRESH_TOKEN_KEY),
        }

        let claims = match self.decode(&access_token) {
            Ok(claims) => Some(claims),
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "stored access token could not be decoded"
                );
                None
            }
        };

        tracing::debug!("credentials stored");
        self.notify(settings, claims.clone());
        claims
    }

    fn logout(&self, settings: Option<&Settings>) {
        self.storage.remove(ACCESS_TOKEN_KEY);
        self.storage.remove(REFRESH_TOKEN_KEY);
        *self.decoded.lock() = None;

        tracing::info!("credentials cleared");
        self.notify(settings, None);
    }

    fn notify(&self, settings: Option<&Settings>, claims: Option<Arc<ClaimSet>>) {
        if let Some(on_change) = settings.and_then(|s| s.on_change.as_ref()) {
            on_change(claims.as_deref());
        }

        self.changes.send_replace(claims);
    }
}
