//! Identity provider abstraction
//!
//! The broker depends only on the two silent calls the upstream identity
//! SDK exposes, plus the auth error taxonomy in [`crate::error::Error`].

use async_trait::async_trait;

use crate::error::Result;

/// Trait for the underlying identity SDK
///
/// Implementations must be thread-safe (`Send + Sync`); the broker shares
/// one instance across every concurrent caller.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// One-time provider setup. Must be idempotent; the broker guarantees
    /// it observes at most one effective invocation.
    async fn configure(&self) -> Result<()> {
        Ok(())
    }

    /// Fetch a cached/silent access token. May return an empty string when
    /// the SDK has nothing cached.
    async fn get_tokens_silently(&self) -> Result<String>;

    /// Interactive-free re-authentication.
    async fn sign_in_silently(&self) -> Result<()>;

    /// Drop any cached token so the next fetch goes upstream.
    fn invalidate(&self) {}
}
