//! Dependent service capability
//!
//! How a service is reached (transport, framing, client pooling) is up to the
//! implementation. Callers only see success or failure.

use async_trait::async_trait;

use crate::backend::Document;
use crate::context::RequestContext;
use crate::error::BoxError;

#[async_trait]
pub trait DownstreamCaller: Send + Sync + 'static {
    /// Invoke `service` with `payload`, forwarding the request's trace carrier unchanged
    async fn invoke(
        &self,
        service: &str,
        payload: &Document,
        ctx: &RequestContext,
    ) -> Result<(), BoxError>;
}

/// A dependent service that must observe a write before it is reported successful
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub service: String,
    pub payload: Document,
}

impl Notification {
    pub fn new(service: impl Into<String>, payload: Document) -> Self {
        Self {
            service: service.into(),
            payload,
        }
    }
}
