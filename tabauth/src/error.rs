//! Common errors

use std::{error::Error as StdError, sync::Arc};

use thiserror::Error;

/// A boxed error, as returned by refresh collaborators
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// The credential could not be decoded into a claim set
#[derive(Clone, Debug, Error)]
#[error("malformed credential: {reason}")]
pub struct MalformedCredential {
    reason: &'static str,
    #[source]
    source: Option<Arc<dyn StdError + Send + Sync + 'static>>,
}

impl MalformedCredential {
    /// A short description of what was wrong with the credential
    pub fn reason(&self) -> &'static str {
        self.reason
    }
}

pub(crate) fn malformed_credential(reason: &'static str) -> MalformedCredential {
    MalformedCredential {
        reason,
        source: None,
    }
}

pub(crate) fn malformed_credential_with(
    reason: &'static str,
    source: impl StdError + Send + Sync + 'static,
) -> MalformedCredential {
    MalformedCredential {
        reason,
        source: Some(Arc::new(source)),
    }
}

/// The credential decoded, but its expiry claim is missing or non-positive
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("expiry claim is missing or not a positive timestamp")]
pub struct InvalidExpiryClaim {
    _p: (),
}

pub(crate) const fn invalid_expiry_claim() -> InvalidExpiryClaim {
    InvalidExpiryClaim { _p: () }
}

/// Errors surfaced by the credential manager
///
/// Cloneable so that a single renewal outcome can be handed to every
/// caller that joined it.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// An operation was invoked before the manager was initialized
    #[error("credential manager has not been initialized")]
    NotConfigured,
    /// The manager was initialized without a refresh function
    #[error("credential manager configuration requires a refresh function")]
    MissingRefreshFunction,
    /// The stored access credential carries an unusable expiry claim
    #[error("stored access credential is unusable")]
    InvalidExpiryClaim(#[from] InvalidExpiryClaim),
    /// The refresh function rejected the renewal; the session was cleared
    #[error("credential renewal failed")]
    RenewalFailed(#[source] Arc<dyn StdError + Send + Sync + 'static>),
    /// The renewal task ended without publishing an outcome
    #[error("credential renewal was interrupted before completing")]
    RenewalInterrupted,
    /// No tokio runtime was available to run the renewal on
    #[error("no async runtime available to run credential renewal")]
    NoRuntime,
}

impl Error {
    /// The error raised by the refresh function, if this is a renewal failure
    pub fn renewal_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            Self::RenewalFailed(source) => Some(&**source),
            _ => None,
        }
    }
}
