//! Credential lifecycle management for applications running in several
//! execution contexts at once
//!
//! An application open in more than one context (browser tabs, worker
//! processes, short-lived function instances) often shares a single
//! access/renewal credential pair through some common key/value store.
//! Each context has its own memory, so nothing stops them from all noticing
//! an expired access credential at the same moment and all spending the
//! same renewal credential. With rotating renewal credentials, every
//! renewal but the first fails and the user is logged out.
//!
//! This crate prevents that in two layers:
//!
//! * within a context, a [`CredentialManager`] runs at most one renewal at a
//!   time and hands its outcome to every caller that asked for it;
//! * across contexts, renewals are serialized by a [`StorageLock`][lock::StorageLock],
//!   a cooperative lock that lives entirely in the shared store and is
//!   driven by the store's change notifications.
//!
//! A context that waited on another context's renewal looks at the store
//! again before renewing. If a fresh credential is already there, it is
//! adopted instead of spending the renewal credential a second time.
//!
//! # General Flow
//!
//! Each context builds a manager over its own handle onto the shared store,
//! then initializes it with the function used to exchange a renewal
//! credential for a new pair. From then on, [`read()`][CredentialManager::read]
//! always produces a live access credential (renewing first if needed) or
//! `None` when logged out.
//!
//! ```
//! use tabauth::{
//!     refresh::{refresh_fn, RefreshedCredentials},
//!     storage::SharedStorage,
//!     CredentialManager, ManagerConfig,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), tabauth::Error> {
//! let shared = SharedStorage::new();
//! let manager = CredentialManager::new(shared.context());
//!
//! let refresher = refresh_fn(|refresh_token| async move {
//!     // Exchange `refresh_token` with the issuing authority here
//! #   let _ = refresh_token;
//!     Ok(RefreshedCredentials::new("access", "renewal"))
//! });
//!
//! manager.initialize(
//!     ManagerConfig::new()
//!         .with_refresher(refresher)
//!         .with_on_change(|claims| {
//!             tracing::info!(logged_in = claims.is_some(), "credentials changed");
//!         }),
//! )?;
//!
//! if let Some(access) = manager.read().await? {
//!     tracing::info!(token = format_args!("{:#?}", access), "current access token");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The crate includes an example with two contexts sharing one store in the
//! examples folder.
//!
//! # Features
//!
//! The following features are supported by this crate, all of which are enabled by default:
//!
//! * `oauth2`: Provides a [`Refresher`][refresh::Refresher] that performs the OAuth2
//!   _refresh token_ flow against a token endpoint.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
pub mod claims;
pub mod error;
pub mod lock;
mod manager;
pub mod refresh;
pub mod storage;

#[cfg(test)]
mod test_util;

pub use braids::*;
pub use claims::{ClaimDecoder, ClaimSet, JwtDecoder};
pub use error::Error;
pub use manager::{
    ChangeCallback, CredentialManager, CredentialManagerBuilder, ManagerConfig, ACCESS_TOKEN_KEY,
    DEFAULT_SKEW, REFRESH_TOKEN_KEY, RENEWAL_LOCK_NAME, RENEWAL_LOCK_TIMEOUT,
};
