//! Device fingerprint: a stable pseudo-identity, generated once per persistent storage
//! scope. Stability comes from storage, not from the hash: every generation mixes in a
//! random nonce.

use crate::env::Environment;
use crate::ids::{base36, time_random_id, SERVER_SIDE_ID};
use crate::log_bridge::Logger;

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// Stored or generated fingerprints shorter than this are rejected.
pub const MIN_FINGERPRINT_LEN: usize = 8;

/// 32-bit FNV-1a over the UTF-8 bytes of `input`.
pub fn fnv1a_32(input: &str) -> u32 {
    input.bytes().fold(FNV_OFFSET_BASIS, |hash, b| {
        (hash ^ u32::from(b)).wrapping_mul(FNV_PRIME)
    })
}

/// Hash rendered the way the fingerprint is stored: absolute value of the signed
/// 32-bit hash, lowercase hex.
fn hash_hex(input: &str) -> String {
    let signed = fnv1a_32(input) as i32;
    format!("{:x}", signed.unsigned_abs())
}

/// Compute a new fingerprint. `None` when device attributes are unavailable.
pub fn generate_fingerprint(env: &dyn Environment) -> Option<String> {
    let device = env.device()?;
    let nonce = format!("{}{}", base36(env.random_u64()), base36(env.now_ms()));
    let components = [
        non_empty(&device.user_agent),
        format!("{}x{}", device.screen_width, device.screen_height),
        device.color_depth.to_string(),
        device.timezone_offset_minutes.to_string(),
        non_empty(&device.language),
        device.hardware_concurrency.to_string(),
        non_empty(&device.platform),
        if device.cookie_enabled { "1" } else { "0" }.to_string(),
        device.do_not_track.clone().unwrap_or_else(|| "unknown".to_string()),
        non_empty(&device.vendor),
        device.max_touch_points.to_string(),
        device
            .device_memory
            .map(|m| m.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        device.connection_type.clone().unwrap_or_else(|| "unknown".to_string()),
        nonce,
    ];
    let fingerprint = hash_hex(&components.join("|"));
    if fingerprint.len() >= MIN_FINGERPRINT_LEN {
        return Some(fingerprint);
    }

    // Short hash: one more attempt over a different input before giving up.
    let retry = [
        base36(env.now_ms()),
        base36(env.random_u64()),
        non_empty(&device.user_agent),
    ];
    Some(hash_hex(&retry.join("|")))
}

fn non_empty(s: &str) -> String {
    if s.is_empty() {
        "unknown".to_string()
    } else {
        s.to_string()
    }
}

/// Return the stored fingerprint, or generate, persist and return a new one.
///
/// Never fails: when generation does not produce a valid fingerprint a temporary
/// `timestamp36 + random36` id is returned and not persisted. A failed write is logged
/// and the fingerprint is still used for the lifetime of this page.
pub fn get_or_create_fingerprint(env: &dyn Environment, storage_key: &str, log: &Logger) -> String {
    if !env.is_browser() {
        return SERVER_SIDE_ID.to_string();
    }

    let storage = env.persistent_storage();
    match storage.get_item(storage_key) {
        Ok(Some(stored)) if stored.len() >= MIN_FINGERPRINT_LEN => return stored,
        Ok(_) => {}
        Err(e) => log.error(format_args!("[Fingerprint] reading stored fingerprint failed: {e}")),
    }

    let fingerprint = match generate_fingerprint(env) {
        Some(fp) if fp.len() >= MIN_FINGERPRINT_LEN => fp,
        Some(fp) => {
            log.error(format_args!("[Fingerprint] invalid fingerprint generated: {fp:?}"));
            return time_random_id(env);
        }
        None => {
            log.error(format_args!("[Fingerprint] device attributes unavailable"));
            return time_random_id(env);
        }
    };

    if let Err(e) = storage.set_item(storage_key, &fingerprint) {
        log.error(format_args!("[Fingerprint] failed to save fingerprint: {e}"));
    }
    fingerprint
}
