//! Masking collaborator seam
//!
//! Privacy policy lives outside the capture core. The recorder only hands each
//! new request to a [`RequestMasker`] and adopts whatever comes back.

use async_trait::async_trait;

use crate::models::NetworkRequest;

#[async_trait]
pub trait RequestMasker: Send + Sync {
    /// Return the request with sensitive values masked. Must not fail: on an
    /// internal error, return the input unchanged.
    async fn mask(&self, request: NetworkRequest) -> NetworkRequest;
}

/// Leaves every request untouched
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughMasker;

#[async_trait]
impl RequestMasker for PassthroughMasker {
    async fn mask(&self, request: NetworkRequest) -> NetworkRequest {
        request
    }
}
