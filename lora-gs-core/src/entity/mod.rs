//! Entity registry facade: cached gateway lookups, antenna and attribute
//! updates, rights assertion.

mod cache;

use crate::{clock::Clock, context::RequestContext};
use async_trait::async_trait;
use cache::TtlCache;
use lora_gs_error::{GSError, GSResult};
use lora_gs_models::{Eui64, Gateway, GatewayAntenna, GatewayIdentifiers, Right};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::debug;

/// Remote entity registry as seen by the gateway server.
#[async_trait]
pub trait EntityRegistryClient: Send + Sync + 'static {
    /// Gateway record with only the fields of `field_mask` set.
    async fn get_gateway(
        &self,
        ctx: &RequestContext,
        ids: &GatewayIdentifiers,
        field_mask: &[&str],
    ) -> GSResult<Gateway>;

    /// Identifiers of the gateway registered with `eui`; `NotFound` if none is.
    async fn get_identifiers_for_eui(
        &self,
        ctx: &RequestContext,
        eui: &Eui64,
    ) -> GSResult<GatewayIdentifiers>;

    /// Persists the fields of `gateway` named by `field_mask`.
    async fn update_gateway(
        &self,
        ctx: &RequestContext,
        gateway: &Gateway,
        field_mask: &[&str],
    ) -> GSResult<Gateway>;

    /// Rights the caller of `ctx` holds on the gateway.
    async fn list_rights(
        &self,
        ctx: &RequestContext,
        ids: &GatewayIdentifiers,
    ) -> GSResult<Vec<Right>>;

    /// Fails unless the caller holds `required` on every gateway.
    async fn assert_batch_rights(
        &self,
        ctx: &RequestContext,
        ids: &[GatewayIdentifiers],
        required: &[Right],
    ) -> GSResult<()>;
}

type GetKey = (&'static str, String, String);

/// Gateway lookups and updates against the entity registry.
///
/// Lookups are cached for a configurable TTL; updates made through the facade
/// evict every cached record of the gateway they touch.
pub struct EntityRegistry {
    client: Arc<dyn EntityRegistryClient>,
    gateways: TtlCache<GetKey, Gateway>,
    euis: TtlCache<Eui64, GatewayIdentifiers>,
}

fn holds_all(held: &[Right], required: &[Right]) -> bool {
    required
        .iter()
        .all(|r| held.iter().any(|h| h.implies(*r)))
}

impl EntityRegistry {
    /// Creates the facade.
    ///
    /// # Arguments
    /// * `client` - The remote registry
    /// * `clock` - Time source for cache expiry
    /// * `ttl` - Lifetime of cached lookups; zero disables caching
    pub fn new(
        client: Arc<dyn EntityRegistryClient>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self {
            client,
            gateways: TtlCache::new(Arc::clone(&clock), ttl),
            euis: TtlCache::new(clock, ttl),
        }
    }

    fn get_key(ctx: &RequestContext, ids: &GatewayIdentifiers, mask: &[&str]) -> GetKey {
        ("get", ids.unique_id(ctx.tenant_id()), mask.join(","))
    }

    fn sorted_mask<'a>(field_mask: &[&'a str]) -> Vec<&'a str> {
        let mut mask = field_mask.to_vec();
        mask.sort_unstable();
        mask.dedup();
        mask
    }

    /// Gateway record restricted to `field_mask`.
    ///
    /// Results are cached per identifier and exact field mask, so a request
    /// for a wider mask always reaches the registry.
    ///
    /// # Arguments
    /// * `ctx` - Caller context; its tenant scopes the cache key
    /// * `ids` - Gateway to look up
    /// * `field_mask` - Fields to return, in any order
    ///
    /// # Returns
    /// The masked record, or the registry error. Errors are never cached.
    pub async fn get(
        &self,
        ctx: &RequestContext,
        ids: &GatewayIdentifiers,
        field_mask: &[&str],
    ) -> GSResult<Gateway> {
        let mask = Self::sorted_mask(field_mask);
        let key = Self::get_key(ctx, ids, &mask);
        if let Some(gtw) = self.gateways.get(&key) {
            return Ok(gtw);
        }
        let gtw = self.client.get_gateway(ctx, ids, &mask).await?;
        self.gateways.insert(key, gtw.clone());
        Ok(gtw)
    }

    /// Like [`EntityRegistry::get`], but always asks the registry.
    ///
    /// A fetched record replaces the cached one for the same mask. A failed
    /// fetch evicts every cached record of the gateway, so a deleted gateway
    /// or revoked key is not served from the cache afterwards.
    pub async fn refresh(
        &self,
        ctx: &RequestContext,
        ids: &GatewayIdentifiers,
        field_mask: &[&str],
    ) -> GSResult<Gateway> {
        let mask = Self::sorted_mask(field_mask);
        match self.client.get_gateway(ctx, ids, &mask).await {
            Ok(gtw) => {
                self.gateways.insert(Self::get_key(ctx, ids, &mask), gtw.clone());
                Ok(gtw)
            }
            Err(e) => {
                self.invalidate(ctx, ids);
                Err(e)
            }
        }
    }

    /// Identifiers of the gateway registered with `eui`, cached like
    /// [`EntityRegistry::get`].
    pub async fn get_identifiers_for_eui(
        &self,
        ctx: &RequestContext,
        eui: &Eui64,
    ) -> GSResult<GatewayIdentifiers> {
        if let Some(ids) = self.euis.get(eui) {
            return Ok(ids);
        }
        let ids = self.client.get_identifiers_for_eui(ctx, eui).await?;
        self.euis.insert(*eui, ids.clone());
        Ok(ids)
    }

    /// Replaces the antennas of the gateway.
    pub async fn update_antennas(
        &self,
        ctx: &RequestContext,
        ids: &GatewayIdentifiers,
        antennas: Vec<GatewayAntenna>,
    ) -> GSResult<()> {
        let gtw = Gateway {
            ids: ids.clone(),
            antennas,
            ..Default::default()
        };
        self.client.update_gateway(ctx, &gtw, &["antennas"]).await?;
        self.invalidate(ctx, ids);
        Ok(())
    }

    /// Stores the union of `current` and `new`, values of `new` winning.
    pub async fn update_attributes(
        &self,
        ctx: &RequestContext,
        ids: &GatewayIdentifiers,
        current: &HashMap<String, String>,
        new: &HashMap<String, String>,
    ) -> GSResult<()> {
        let mut attributes = current.clone();
        attributes.extend(new.iter().map(|(k, v)| (k.clone(), v.clone())));
        let gtw = Gateway {
            ids: ids.clone(),
            attributes,
            ..Default::default()
        };
        self.client.update_gateway(ctx, &gtw, &["attributes"]).await?;
        self.invalidate(ctx, ids);
        Ok(())
    }

    /// Fails unless the caller holds every right in `required` on `ids`.
    ///
    /// Rights granted on the context by the transport are checked first and
    /// need no registry call.
    ///
    /// # Returns
    /// `Unauthenticated` for anonymous callers without grants,
    /// `PermissionDenied` when the registry lists fewer rights.
    pub async fn assert_gateway_rights(
        &self,
        ctx: &RequestContext,
        ids: &GatewayIdentifiers,
        required: &[Right],
    ) -> GSResult<()> {
        if holds_all(&ctx.values().granted_rights, required) {
            return Ok(());
        }
        if !ctx.is_authenticated() {
            return Err(GSError::Unauthenticated);
        }
        let held = self.client.list_rights(ctx, ids).await?;
        if holds_all(&held, required) {
            Ok(())
        } else {
            debug!(gateway_id = %ids.gateway_id, ?required, ?held, "Missing gateway rights");
            Err(GSError::PermissionDenied(format!(
                "missing rights on gateway `{}`",
                ids.gateway_id
            )))
        }
    }

    /// Batch form of [`EntityRegistry::assert_gateway_rights`].
    pub async fn assert_gateway_batch_rights(
        &self,
        ctx: &RequestContext,
        ids: &[GatewayIdentifiers],
        required: &[Right],
    ) -> GSResult<()> {
        if holds_all(&ctx.values().granted_rights, required) {
            return Ok(());
        }
        if !ctx.is_authenticated() {
            return Err(GSError::Unauthenticated);
        }
        self.client.assert_batch_rights(ctx, ids, required).await
    }

    fn invalidate(&self, ctx: &RequestContext, ids: &GatewayIdentifiers) {
        let uid = ids.unique_id(ctx.tenant_id());
        self.gateways.invalidate_where(|(_, k, _)| *k == uid);
    }
}
