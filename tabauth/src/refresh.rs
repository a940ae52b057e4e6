//! Refresh functions
//!
//! The network call that exchanges a renewal credential for a new pair is
//! supplied by the application as a [`Refresher`]. Any error it returns is
//! passed back to the caller of the renewal unchanged.

use std::{fmt, future::Future};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{error::BoxError, AccessToken, RefreshToken, RefreshTokenRef};

#[cfg(feature = "oauth2")]
#[cfg_attr(docsrs, doc(cfg(feature = "oauth2")))]
pub mod oauth2;

/// The credentials returned by a successful refresh
///
/// A missing or empty access credential is treated as a logout. A missing
/// renewal credential keeps the one already stored.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RefreshedCredentials {
    /// The new access credential
    #[serde(default)]
    pub access_token: Option<AccessToken>,
    /// The new renewal credential, if it was rotated
    #[serde(default)]
    pub refresh_token: Option<RefreshToken>,
}

impl RefreshedCredentials {
    /// Constructs a new credential pair
    pub fn new(
        access_token: impl Into<AccessToken>,
        refresh_token: impl Into<RefreshToken>,
    ) -> Self {
        Self {
            access_token: Some(access_token.into()),
            refresh_token: Some(refresh_token.into()),
        }
    }
}

/// An asynchronous function that renews credentials
#[async_trait]
pub trait Refresher: Send + Sync {
    /// Exchanges `refresh_token` for a new credential pair
    async fn refresh(
        &self,
        refresh_token: &RefreshTokenRef,
    ) -> Result<RefreshedCredentials, BoxError>;
}

/// A refresher backed by a closure
///
/// Constructed with [`refresh_fn()`].
#[derive(Clone)]
pub struct RefreshFn<F> {
    f: F,
}

impl<F> fmt::Debug for RefreshFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RefreshFn").finish_non_exhaustive()
    }
}

/// Wraps a closure returning a future as a [`Refresher`]
///
/// ```
/// use tabauth::refresh::{refresh_fn, RefreshedCredentials};
///
/// let refresher = refresh_fn(|_refresh_token| async {
///     Ok(RefreshedCredentials::new("access", "renewal"))
/// });
/// # let _ = refresher;
/// ```
pub fn refresh_fn<F, Fut>(f: F) -> RefreshFn<F>
where
    F: Fn(RefreshToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<RefreshedCredentials, BoxError>> + Send,
{
    RefreshFn { f }
}

#[async_trait]
impl<F, Fut> Refresher for RefreshFn<F>
where
    F: Fn(RefreshToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<RefreshedCredentials, BoxError>> + Send,
{
    async fn refresh(
        &self,
        refresh_token: &RefreshTokenRef,
    ) -> Result<RefreshedCredentials, BoxError> {
        (self.f)(refresh_token.to_owned()).await
    }
}
