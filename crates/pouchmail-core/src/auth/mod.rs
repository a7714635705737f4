//! Credential broker
//!
//! Guarantees that at most one token refresh is in flight per process, no
//! matter how many callers ask concurrently. Overlapping callers all wait
//! on the same shared future and receive the same token or error; the
//! in-flight slot is always cleared on completion so a failed attempt never
//! wedges the next one.

mod google;
mod identity;

pub use google::{GoogleCredentials, GoogleIdentity};
pub use identity::IdentityProvider;

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::error::{Error, Result};

type SharedTokenFuture = Shared<BoxFuture<'static, std::result::Result<String, Arc<Error>>>>;

/// Single-flight access token broker
pub struct CredentialBroker {
    identity: Arc<dyn IdentityProvider>,
    inflight: Mutex<Option<SharedTokenFuture>>,
    configured: OnceCell<()>,
}

impl CredentialBroker {
    /// Create a broker over an identity provider
    pub fn new(identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            identity,
            inflight: Mutex::new(None),
            configured: OnceCell::new(),
        }
    }

    /// One-time provider initialization. Safe to call any number of times;
    /// only the first call configures the provider.
    pub async fn ensure_configured(&self) -> Result<()> {
        let identity = self.identity.clone();
        self.configured
            .get_or_try_init(|| async move { identity.configure().await })
            .await?;
        Ok(())
    }

    /// Get a bearer token, joining any retrieval already in flight.
    ///
    /// All overlapping callers observe the result of the single underlying
    /// retrieval. `SignInRequired` is surfaced as-is and never retried here.
    pub async fn get_access_token(&self) -> Result<String> {
        self.ensure_configured().await?;

        let fut = {
            let mut slot = self.inflight.lock();
            match slot.as_ref() {
                Some(existing) => {
                    debug!("Joining in-flight token retrieval");
                    existing.clone()
                }
                None => {
                    let identity = self.identity.clone();
                    let fut = async move { Self::retrieve(identity).await.map_err(Arc::new) }
                        .boxed()
                        .shared();
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };

        let result = fut.clone().await;

        // Whoever observes completion first clears the slot; ptr_eq keeps a
        // retrieval started in the meantime from being clobbered.
        {
            let mut slot = self.inflight.lock();
            if slot.as_ref().is_some_and(|current| current.ptr_eq(&fut)) {
                *slot = None;
            }
        }

        result.map_err(|e| unshare(&e))
    }

    /// Drop any cached token so the next call refreshes upstream.
    ///
    /// Callers use this after a request failed with an auth error.
    pub fn invalidate(&self) {
        self.identity.invalidate();
    }

    /// The single retrieval owned by one caller at a time: silent fetch
    /// first, then a silent re-auth and one more fetch.
    async fn retrieve(identity: Arc<dyn IdentityProvider>) -> Result<String> {
        match identity.get_tokens_silently().await {
            Ok(token) if !token.is_empty() => return Ok(token),
            Ok(_) => debug!("Silent token fetch returned empty token"),
            Err(e) => {
                if e.requires_sign_in() {
                    debug!("No cached token, attempting silent sign-in");
                } else {
                    warn!("Silent token fetch failed: {}", e);
                }
            }
        }

        identity.sign_in_silently().await?;

        let token = identity.get_tokens_silently().await?;
        if token.is_empty() {
            return Err(Error::SignInRequired);
        }
        Ok(token)
    }
}

/// Reconstruct an owned error from the shared slot's `Arc<Error>` so every
/// waiter receives an equivalent error value.
fn unshare(err: &Error) -> Error {
    match err {
        Error::AuthCancelled => Error::AuthCancelled,
        Error::AuthInProgress => Error::AuthInProgress,
        Error::AuthUnavailable(msg) => Error::AuthUnavailable(msg.clone()),
        Error::SignInRequired => Error::SignInRequired,
        Error::NativeFault(msg) => Error::NativeFault(msg.clone()),
        Error::NetworkTimeout(url) => Error::NetworkTimeout(url.clone()),
        Error::HttpStatus { status, body } => Error::HttpStatus {
            status: *status,
            body: body.clone(),
        },
        Error::MalformedBody(msg) => Error::MalformedBody(msg.clone()),
        other => Error::Other(other.to_string()),
    }
}
