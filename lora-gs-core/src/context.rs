//! Request-scoped context: a cancellation token plus immutable request values.

use lora_gs_models::Right;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Values attached to an incoming request by the transport or RPC layer.
#[derive(Debug, Clone, Default)]
pub struct RequestValues {
    /// Tenancy context, part of every gateway unique id.
    pub tenant_id: Option<String>,
    /// Gateway or user credentials presented by the caller.
    pub credentials: Option<String>,
    /// Set for RPCs coming from another cluster component.
    pub cluster_peer: bool,
    /// Rights already established by the frontend, e.g. for transports
    /// without gateway authentication.
    pub granted_rights: Vec<Right>,
    /// Frequency plan used for gateways missing from the entity registry.
    pub fallback_frequency_plan_id: Option<String>,
    pub correlation_ids: Vec<String>,
}

/// Cancellation and request values shared by all work of one request.
///
/// Clones share both; see [`RequestContext::child`] and
/// [`RequestContext::decouple`] for contexts with their own lifetime.
#[derive(Debug, Clone)]
pub struct RequestContext {
    token: CancellationToken,
    values: Arc<RequestValues>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::background()
    }
}

impl RequestContext {
    /// Root context carrying `values`.
    pub fn new(values: RequestValues) -> Self {
        Self {
            token: CancellationToken::new(),
            values: Arc::new(values),
        }
    }

    /// Context without values that is never cancelled by anyone else.
    pub fn background() -> Self {
        Self::new(RequestValues::default())
    }

    /// Values of `request`, lifetime of `parent`.
    ///
    /// Used for work started by a request that has to outlive it, such as a
    /// gateway connection or a stats write after the caller went away.
    pub fn decouple(parent: &RequestContext, request: &RequestContext) -> Self {
        Self {
            token: parent.token.clone(),
            values: Arc::clone(&request.values),
        }
    }

    /// Child context cancelled together with `self`, cancellable on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            values: Arc::clone(&self.values),
        }
    }

    /// Same lifetime as `self`, other values.
    pub fn with_values(&self, values: RequestValues) -> Self {
        Self {
            token: self.token.clone(),
            values: Arc::new(values),
        }
    }

    #[inline]
    pub fn values(&self) -> &RequestValues {
        &self.values
    }

    /// Tenant of the caller, `None` in single-tenant deployments.
    #[inline]
    pub fn tenant_id(&self) -> Option<&str> {
        self.values.tenant_id.as_deref()
    }

    /// Whether the caller presented credentials.
    #[inline]
    pub fn is_authenticated(&self) -> bool {
        self.values.credentials.is_some()
    }

    #[inline]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancels this context and every child.
    #[inline]
    pub fn cancel(&self) {
        self.token.cancel()
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the context is cancelled.
    pub async fn done(&self) {
        self.token.cancelled().await
    }
}
