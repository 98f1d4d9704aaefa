//! Volume bind parsing and creation defaults.

use std::collections::HashMap;

use skiff_error::{EngineError, Result};
use skiff_portlayer::models::VolumeSpec;
use uuid::Uuid;

use crate::container::MountPoint;

/// Volume driver name presented for engine-created volumes.
pub const VOLUME_DRIVER: &str = "vsphere";
/// Datastore-backed volume store volumes land in by default.
pub const DEFAULT_VOLUME_STORE: &str = "default";
const DEFAULT_FLAGS: &str = "rw";

/// Parses one bind in the `-v` forms:
/// `/dst` (anonymous), `name:/dst`, `name:/dst:flags`.
pub fn parse_bind(raw: &str) -> Result<MountPoint> {
    let fields: Vec<&str> = raw.split(':').collect();
    let (name, destination, flags) = match fields.as_slice() {
        [dst] => (anonymous_id(), (*dst).to_string(), DEFAULT_FLAGS.to_string()),
        [name, dst] => ((*name).to_string(), (*dst).to_string(), DEFAULT_FLAGS.to_string()),
        [name, dst, flags] => ((*name).to_string(), (*dst).to_string(), (*flags).to_string()),
        _ => {
            return Err(EngineError::bad_request(format!(
                "volume bind has too many fields: {raw}"
            )));
        }
    };
    if !destination.starts_with('/') {
        return Err(EngineError::bad_request(format!(
            "volume destination must be absolute: {raw}"
        )));
    }
    if !matches!(flags.as_str(), "rw" | "ro") {
        return Err(EngineError::bad_request(format!(
            "invalid volume mode: {flags}"
        )));
    }
    Ok(MountPoint {
        name,
        destination,
        flags,
        from_bind: fields.len() > 1,
    })
}

/// Resolves the full mount set for a container: explicit binds plus
/// anonymous volumes for destinations nothing else covers.
pub fn resolve_mounts(
    binds: &[String],
    anonymous_destinations: impl IntoIterator<Item = String>,
) -> Result<Vec<MountPoint>> {
    let mut mounts = Vec::new();
    let mut covered: HashMap<String, ()> = HashMap::new();
    for bind in binds {
        let mount = parse_bind(bind)?;
        covered.insert(mount.destination.clone(), ());
        mounts.push(mount);
    }
    for dest in anonymous_destinations {
        if covered.contains_key(&dest) {
            continue;
        }
        mounts.push(MountPoint {
            name: anonymous_id(),
            destination: dest,
            flags: DEFAULT_FLAGS.to_string(),
            from_bind: false,
        });
    }
    Ok(mounts)
}

/// Creation spec for a mount's backing volume.
#[must_use]
pub fn volume_spec(mount: &MountPoint) -> VolumeSpec {
    let mut labels = HashMap::new();
    labels.insert("flags".to_string(), mount.flags.clone());
    VolumeSpec {
        name: mount.name.clone(),
        driver: VOLUME_DRIVER.to_string(),
        store: DEFAULT_VOLUME_STORE.to_string(),
        capacity_mb: -1,
        labels,
    }
}

fn anonymous_id() -> String {
    Uuid::new_v4().to_string()
}
