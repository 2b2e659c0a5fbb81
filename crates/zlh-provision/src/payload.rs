//! Hostnames and guest `/config` bodies.

use base64::Engine as _;
use rand::RngCore;
use serde_json::{Value, json};
use zlh_model::InstanceId;

use crate::error::{ProvisionError, Result};
use crate::orchestrator::ProvisionRequest;
use crate::workloads::WorkloadProfile;

const MINECRAFT: &str = "minecraft";
const DEFAULT_MC_VERSION: &str = "1.20.1";

fn slug(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.trim().to_ascii_lowercase().chars() {
        let c = if c.is_ascii_alphanumeric() { c } else { '-' };
        if !(c == '-' && out.ends_with('-')) {
            out.push(c);
        }
    }
    out.trim_matches('-').to_string()
}

/// `mc-paper-5001`, `valheim-5002`, `game-5003`.
pub fn game_hostname(profile: &WorkloadProfile, variant: Option<&str>, id: InstanceId) -> String {
    let prefix = slug(&profile.hostname_prefix);
    let variant = variant.map(|v| v.trim().to_ascii_lowercase());
    match variant {
        Some(v) if profile.hostname_variants.iter().any(|hv| *hv == v) => {
            format!("{prefix}-{v}-{id}")
        }
        _ => format!("{prefix}-{id}"),
    }
}

/// `dev-node-6001`, or `dev-6001` without a runtime.
pub fn dev_hostname(runtime: Option<&str>, id: InstanceId) -> String {
    match runtime.map(slug).filter(|r| !r.is_empty()) {
        Some(r) => format!("dev-{r}-{id}"),
        None => format!("dev-{id}"),
    }
}

pub fn fqdn(hostname: &str, zone: &str) -> String {
    let h = hostname.trim().trim_end_matches('.').to_ascii_lowercase();
    let zone = zone.trim_matches('.');
    if h.ends_with(&format!(".{zone}")) {
        h
    } else {
        format!("{h}.{zone}")
    }
}

/// Short label of a name that may already be fully qualified.
pub fn short_name<'a>(hostname: &'a str, zone: &str) -> &'a str {
    hostname
        .trim_end_matches('.')
        .strip_suffix(zone.trim_matches('.'))
        .and_then(|h| h.strip_suffix('.'))
        .unwrap_or(hostname)
}

fn parse_mc_version(ver: &str) -> (u32, u32, u32) {
    let mut parts = ver.split('.').map(|p| p.trim().parse::<u32>().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

/// 1.20.5 and later need Java 21.
pub fn java_major_for(version: &str) -> u32 {
    match parse_mc_version(version) {
        (major, _, _) if major > 1 => 21,
        (1, minor, _) if minor >= 21 => 21,
        (1, 20, patch) if patch >= 5 => 21,
        _ => 17,
    }
}

pub fn java_path(major: u32) -> String {
    format!("java/{major}/OpenJDK{major}.tar.gz")
}

pub fn minecraft_artifact(variant: &str, version: &str) -> Result<String> {
    match variant {
        "paper" | "vanilla" | "purpur" => Ok(format!("minecraft/{variant}/{version}/server.jar")),
        "forge" => Ok(format!("minecraft/forge/{version}/forge-installer.jar")),
        "fabric" => Ok(format!("minecraft/fabric/{version}/fabric-server.jar")),
        "neoforge" => Ok(format!("minecraft/neoforge/{version}/neoforge-installer.jar")),
        other => Err(ProvisionError::Validation(format!(
            "unsupported minecraft variant: {other}"
        ))),
    }
}

pub fn generate_admin_password() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Game-class `/config` body. `ports` is what the guest should listen on.
pub fn game_payload(
    id: InstanceId,
    req: &ProvisionRequest,
    profile: &WorkloadProfile,
    ports: &[i32],
) -> Result<Value> {
    let game = non_empty(&req.game)
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| profile.key.clone());
    let variant = non_empty(&req.variant)
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let is_minecraft = profile.key == MINECRAFT;

    if is_minecraft && variant.is_empty() {
        return Err(ProvisionError::Validation(
            "variant is required (paper, forge, fabric, vanilla, purpur, neoforge)".to_string(),
        ));
    }

    let version = non_empty(&req.version)
        .map(str::to_string)
        .or_else(|| is_minecraft.then(|| DEFAULT_MC_VERSION.to_string()));

    let artifact_path = match non_empty(&req.artifact_path) {
        Some(a) => Some(a.to_string()),
        None if is_minecraft => Some(minecraft_artifact(
            &variant,
            version.as_deref().unwrap_or(DEFAULT_MC_VERSION),
        )?),
        None => None,
    };
    let java_path = match non_empty(&req.java_path) {
        Some(j) => Some(j.to_string()),
        None if is_minecraft => Some(java_path(java_major_for(
            version.as_deref().unwrap_or(DEFAULT_MC_VERSION),
        ))),
        None => None,
    };

    let memory_mb = req
        .resources
        .memory_mib
        .filter(|m| *m > 0)
        .unwrap_or(if matches!(variant.as_str(), "forge" | "neoforge") {
            4096
        } else {
            2048
        });

    Ok(json!({
        "id": id,
        "game": game,
        "variant": variant,
        "version": version,
        "world": non_empty(&req.world).unwrap_or("world"),
        "ports": ports,
        "artifact_path": artifact_path,
        "java_path": java_path,
        "memory_mb": memory_mb,
        "steam_user": non_empty(&req.steam_user).unwrap_or("anonymous"),
        "steam_pass": non_empty(&req.steam_pass).unwrap_or_default(),
        "steam_auth": non_empty(&req.steam_auth).unwrap_or_default(),
        "admin_user": non_empty(&req.admin_user).unwrap_or("admin"),
        "admin_pass": non_empty(&req.admin_pass)
            .map(str::to_string)
            .unwrap_or_else(generate_admin_password),
    }))
}

pub fn dev_payload(id: InstanceId, req: &ProvisionRequest) -> Result<Value> {
    let runtime = non_empty(&req.runtime)
        .ok_or_else(|| ProvisionError::Validation("runtime is required for dev instances".to_string()))?;
    Ok(json!({
        "id": id,
        "ctype": "dev",
        "runtime": runtime.to_ascii_lowercase(),
        "version": non_empty(&req.version),
        "memory_mb": req.resources.memory_mib.filter(|m| *m > 0).unwrap_or(2048),
    }))
}
