//! Creation-config normalization and validation.

use std::time::Duration;

use skiff_cache::ImageDefaults;
use skiff_error::{EngineError, Result};

use crate::container::{ContainerConfig, HostConfig};

/// Default CPU count when the request asks for zero.
pub const DEFAULT_CPUS: i64 = 2;
/// Default memory when the request asks for zero.
pub const DEFAULT_MEMORY_MB: i64 = 2048;
/// Smallest memory a container VM can boot with.
pub const MIN_MEMORY_MB: i64 = 512;
/// Memory grain; requests are aligned up to a multiple of this.
pub const MEMORY_ALIGN_MB: i64 = 128;
/// Grace period for stop when neither the caller nor the config says.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_ENV_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Normalizes the CPU request: zero means the default, negative means one.
#[must_use]
pub const fn normalize_cpus(requested: i64) -> i64 {
    if requested == 0 {
        DEFAULT_CPUS
    } else if requested < 1 {
        1
    } else {
        requested
    }
}

/// Normalizes the memory request: zero means the default, otherwise the
/// value is raised to the minimum and aligned up to the grain.
#[must_use]
pub const fn normalize_memory_mb(requested: i64) -> i64 {
    if requested == 0 {
        return DEFAULT_MEMORY_MB;
    }
    let floored = if requested < MIN_MEMORY_MB {
        MIN_MEMORY_MB
    } else {
        requested
    };
    let remainder = floored % MEMORY_ALIGN_MB;
    if remainder == 0 {
        floored
    } else {
        floored + (MEMORY_ALIGN_MB - remainder)
    }
}

/// Applies image-provided defaults and fills the environment.
///
/// Request values win over image values. `PATH` falls back request → image →
/// built-in default; `TERM=xterm` is added for tty sessions unless set.
pub fn apply_image_defaults(config: &mut ContainerConfig, image: &ImageDefaults) {
    if config.cmd.is_empty() {
        config.cmd = image.cmd.clone();
    }
    if config.entrypoint.is_empty() {
        config.entrypoint = image.entrypoint.clone();
    }
    if config.working_dir.is_none() {
        config.working_dir = image.working_dir.clone();
    }
    if config.user.is_none() {
        config.user = image.user.clone();
    }
    for dest in &image.volumes {
        config.volumes.insert(dest.clone());
    }

    let mut env = config.env.clone();
    for image_var in &image.env {
        let key = image_var.split('=').next().unwrap_or(image_var);
        if !env_has(&env, key) {
            env.push(image_var.clone());
        }
    }
    if !env_has(&env, "PATH") {
        env.push(format!("PATH={DEFAULT_ENV_PATH}"));
    }
    if config.tty && !env_has(&env, "TERM") {
        env.push("TERM=xterm".to_string());
    }
    config.env = env;
}

fn env_has(env: &[String], key: &str) -> bool {
    env.iter()
        .any(|var| var.split('=').next() == Some(key))
}

/// Validates a creation request and normalizes resource limits in place.
///
/// `public_ip` is the host interface address that may appear in port
/// bindings besides `0.0.0.0`.
pub fn validate_and_normalize(
    config: &ContainerConfig,
    host: &mut HostConfig,
    public_ip: Option<&str>,
) -> Result<()> {
    host.cpu_count = normalize_cpus(host.cpu_count);
    host.memory_mb = normalize_memory_mb(host.memory_mb);

    for (port, bindings) in &host.port_bindings {
        parse_port_proto(port)?;
        for binding in bindings {
            let ip_ok = binding.host_ip.is_empty()
                || binding.host_ip == "0.0.0.0"
                || Some(binding.host_ip.as_str()) == public_ip;
            if !ip_ok {
                return Err(EngineError::bad_request(format!(
                    "host IP {} is not supported; use 0.0.0.0 or the public interface address",
                    binding.host_ip
                )));
            }
            if binding.host_port.contains('-') {
                return Err(EngineError::bad_request(format!(
                    "host port ranges are not supported: {}",
                    binding.host_port
                )));
            }
            if !binding.host_port.is_empty() {
                binding
                    .host_port
                    .parse::<u16>()
                    .map_err(|_| {
                        EngineError::bad_request(format!(
                            "invalid host port: {}",
                            binding.host_port
                        ))
                    })?;
            }
        }
    }

    if config.entrypoint.is_empty() && config.cmd.is_empty() {
        return Err(EngineError::not_found("No command specified"));
    }
    Ok(())
}

/// Splits `"80/tcp"` into port and protocol; a bare port means tcp.
pub fn parse_port_proto(spec: &str) -> Result<(u16, &str)> {
    let (port, proto) = spec.split_once('/').unwrap_or((spec, "tcp"));
    let port = port
        .parse::<u16>()
        .map_err(|_| EngineError::bad_request(format!("invalid container port: {spec}")))?;
    if !matches!(proto, "tcp" | "udp") {
        return Err(EngineError::bad_request(format!(
            "invalid protocol in port specification: {spec}"
        )));
    }
    Ok((port, proto))
}
