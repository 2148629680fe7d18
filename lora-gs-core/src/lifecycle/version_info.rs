use crate::{connection::Connection, context::RequestContext, entity::EntityRegistry, random};
use lora_gs_error::GSResult;
use lora_gs_models::messages::{GatewayStatus, VERSION_FIRMWARE, VERSION_MODEL};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{debug, info};

pub const KICKSTARTER_MODEL: &str = "The Things Kickstarter Gateway v1";

const KICKSTARTER_PLATFORM_PREFIX: &str = "The Things Gateway v1 - BL ";
const VERSION_INFO_JITTER: f64 = 0.25;

fn kickstarter_firmware(platform: &str) -> Option<&str> {
    let rest = platform.strip_prefix(KICKSTARTER_PLATFORM_PREFIX)?;
    let (_, firmware) = rest.split_once(" - Firmware ")?;
    firmware.split_whitespace().next()
}

/// Model and firmware reported by a status message, if both are known.
pub fn version_info(status: &GatewayStatus) -> Option<(String, String)> {
    let model = status.versions.get(VERSION_MODEL).filter(|v| !v.is_empty());
    let firmware = status.versions.get(VERSION_FIRMWARE).filter(|v| !v.is_empty());
    if let (Some(model), Some(firmware)) = (model, firmware) {
        return Some((model.clone(), firmware.clone()));
    }
    kickstarter_firmware(&status.platform).map(|fw| (KICKSTARTER_MODEL.to_string(), fw.to_string()))
}

/// Stores the version info of the first status carrying one in the gateway
/// attributes, then returns.
pub(crate) async fn update_version_info(
    ctx: RequestContext,
    conn: Arc<Connection>,
    entity_registry: Arc<EntityRegistry>,
    delay: Duration,
) -> GSResult<()> {
    let (model, firmware) = loop {
        tokio::select! {
            _ = ctx.done() => return Ok(()),
            _ = conn.version_info_changed() => {}
        }
        if let Some(info) = conn.status_stats().and_then(|(status, _)| version_info(&status)) {
            break info;
        }
    };

    let current = &conn.gateway().attributes;
    if current.get(VERSION_MODEL) == Some(&model)
        && current.get(VERSION_FIRMWARE) == Some(&firmware)
    {
        debug!(gateway_uid = %conn.unique_id(), "Version info up to date");
        return Ok(());
    }

    tokio::select! {
        _ = ctx.done() => return Ok(()),
        _ = tokio::time::sleep(random::jitter(delay, VERSION_INFO_JITTER)) => {}
    }
    let new = HashMap::from([
        (VERSION_MODEL.to_string(), model.clone()),
        (VERSION_FIRMWARE.to_string(), firmware.clone()),
    ]);
    entity_registry
        .update_attributes(&ctx, &conn.gateway().ids, current, &new)
        .await?;
    info!(gateway_uid = %conn.unique_id(), %model, %firmware, "Gateway version info updated");
    Ok(())
}
