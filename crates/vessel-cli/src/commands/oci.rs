use super::{json_pretty, EXIT_SUCCESS};
use std::path::Path;
use vessel_core::{LifecycleDriver, OciDriver};
use vessel_runtime::{HostIdentity, IdentitySource};
use vessel_schema::{BundleSpec, Settings};

fn driver(settings: &Settings) -> Result<OciDriver, String> {
    let uid = HostIdentity.uid();
    let xdg = std::env::var("XDG_RUNTIME_DIR").ok();
    OciDriver::from_settings(settings, uid, xdg.as_deref(), uid != 0).map_err(|e| e.to_string())
}

fn read_bundle_spec(bundle: &Path) -> Result<BundleSpec, String> {
    let path = bundle.join("config.json");
    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    serde_json::from_str(&content).map_err(|e| format!("invalid {}: {e}", path.display()))
}

pub fn create(settings: &Settings, id: &str, bundle: &Path) -> Result<u8, String> {
    let spec = read_bundle_spec(bundle)?;
    driver(settings)?
        .create(id, bundle, &spec)
        .map_err(|e| e.to_string())?;
    Ok(EXIT_SUCCESS)
}

pub fn start(settings: &Settings, id: &str) -> Result<u8, String> {
    driver(settings)?.start(id).map_err(|e| e.to_string())?;
    Ok(EXIT_SUCCESS)
}

pub fn kill(settings: &Settings, id: &str, signal: &str) -> Result<u8, String> {
    driver(settings)?
        .kill(id, signal)
        .map_err(|e| e.to_string())?;
    Ok(EXIT_SUCCESS)
}

pub fn state(settings: &Settings, id: &str) -> Result<u8, String> {
    let status = driver(settings)?.state(id).map_err(|e| e.to_string())?;
    println!("{}", json_pretty(&status)?);
    Ok(EXIT_SUCCESS)
}

pub fn delete(settings: &Settings, id: &str) -> Result<u8, String> {
    driver(settings)?.delete(id).map_err(|e| e.to_string())?;
    Ok(EXIT_SUCCESS)
}
