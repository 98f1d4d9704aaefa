//! Request handlers for the Docker API endpoints.
//!
//! One async fn per route, grouped by resource. Handlers stay thin: decode
//! the wire shape, call the backend, encode the response. Anything the
//! personality cannot do answers 501 through [`not_implemented`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use skiff_portlayer::models::{ContainerState, ContainerStatus};

use crate::error::{DockerError, Result};

pub mod archive;
pub mod container;
pub mod events;
pub mod exec;
pub mod image;
pub mod network;
pub mod system;
pub mod volume;

/// Zero time Docker prints for never-started containers.
pub(crate) const ZERO_TIME: &str = "0001-01-01T00:00:00Z";

/// Builds a 501 responder for an operation the personality does not cover.
pub(crate) fn not_implemented(op: &'static str) -> DockerError {
    DockerError::NotImplemented(op)
}

/// Decodes Docker's query booleans, which arrive as `1`/`0` or `true`/`false`.
pub(crate) fn parse_bool(value: Option<&str>, default: bool) -> bool {
    match value {
        Some("1" | "true" | "True") => true,
        Some("0" | "false" | "False" | "") => false,
        Some(_) => default,
        None => default,
    }
}

/// Parses the `filters` query parameter.
///
/// Both historical encodings are accepted: `{"key":{"value":true}}` and
/// `{"key":["value"]}`.
pub(crate) fn parse_filters(raw: Option<&str>) -> Result<HashMap<String, Vec<String>>> {
    let raw = match raw {
        Some(raw) if !raw.trim().is_empty() => raw,
        _ => return Ok(HashMap::new()),
    };

    if let Ok(parsed) = serde_json::from_str::<HashMap<String, HashMap<String, bool>>>(raw) {
        return Ok(parsed
            .into_iter()
            .map(|(key, values)| (key, values.into_keys().collect()))
            .collect());
    }
    if let Ok(parsed) = serde_json::from_str::<HashMap<String, Vec<String>>>(raw) {
        return Ok(parsed);
    }
    Err(DockerError::bad_parameter("invalid filters parameter"))
}

/// Parses a detach-key specification: comma-separated `ctrl-<x>` chords or
/// single printable characters, e.g. `ctrl-p,ctrl-q`.
pub(crate) fn parse_detach_keys(spec: &str) -> Result<Vec<u8>> {
    let mut keys = Vec::new();
    for token in spec.split(',') {
        if let Some(rest) = token.strip_prefix("ctrl-") {
            let mut chars = rest.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii_lowercase() => {
                    keys.push(c as u8 - b'a' + 1);
                }
                _ => {
                    return Err(DockerError::bad_parameter(format!(
                        "Invalid detach keys ({spec})"
                    )));
                }
            }
        } else {
            let mut chars = token.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii() => keys.push(c as u8),
                _ => {
                    return Err(DockerError::bad_parameter(format!(
                        "Invalid detach keys ({spec})"
                    )));
                }
            }
        }
    }
    Ok(keys)
}

/// Docker state name for a port-layer status.
pub(crate) fn docker_state_name(status: ContainerStatus) -> &'static str {
    match status {
        ContainerStatus::Created => "created",
        ContainerStatus::Running => "running",
        ContainerStatus::Stopped | ContainerStatus::Exited => "exited",
        ContainerStatus::Error => "dead",
    }
}

/// Human status column for `docker ps`: `Up 5 seconds`, `Exited (0) 2
/// minutes ago`, or the bare state for containers that never ran.
pub(crate) fn format_container_status(state: &ContainerState) -> String {
    if state.running {
        match state.started_at {
            Some(started) => format!("Up {}", humanize(Utc::now() - started)),
            None => "Up".to_string(),
        }
    } else if let Some(finished) = state.finished_at {
        let code = state.exit_code.unwrap_or(0);
        format!("Exited ({code}) {} ago", humanize(Utc::now() - finished))
    } else {
        docker_state_name(state.status).to_string()
    }
}

fn humanize(elapsed: chrono::Duration) -> String {
    let secs = elapsed.num_seconds().max(0);
    if secs < 60 {
        format!("{secs} seconds")
    } else if secs < 3600 {
        format!("{} minutes", secs / 60)
    } else if secs < 86400 {
        format!("{} hours", secs / 3600)
    } else {
        format!("{} days", secs / 86400)
    }
}

/// RFC3339 render with the Docker zero-time fallback.
pub(crate) fn render_time(time: Option<DateTime<Utc>>) -> String {
    time.map_or_else(
        || ZERO_TIME.to_string(),
        |t| t.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_params_accept_docker_spellings() {
        assert!(parse_bool(Some("1"), false));
        assert!(parse_bool(Some("true"), false));
        assert!(!parse_bool(Some("0"), true));
        assert!(!parse_bool(Some("false"), true));
        assert!(parse_bool(None, true));
    }

    #[test]
    fn filters_accept_both_encodings() {
        let map = parse_filters(Some(r#"{"status":{"running":true}}"#)).unwrap();
        assert_eq!(map["status"], vec!["running"]);
        let map = parse_filters(Some(r#"{"status":["running"]}"#)).unwrap();
        assert_eq!(map["status"], vec!["running"]);
        assert!(parse_filters(Some("not json")).is_err());
        assert!(parse_filters(None).unwrap().is_empty());
    }

    #[test]
    fn detach_keys_parse_ctrl_chords() {
        assert_eq!(parse_detach_keys("ctrl-p,ctrl-q").unwrap(), vec![0x10, 0x11]);
        assert_eq!(parse_detach_keys("a").unwrap(), vec![b'a']);
        assert!(parse_detach_keys("ctrl-").is_err());
        assert!(parse_detach_keys("ctrl-pq").is_err());
    }

    #[test]
    fn status_column_shapes() {
        let state = ContainerState {
            status: ContainerStatus::Running,
            running: true,
            exit_code: None,
            started_at: Some(Utc::now() - chrono::Duration::seconds(5)),
            finished_at: None,
        };
        assert!(format_container_status(&state).starts_with("Up "));

        let state = ContainerState {
            status: ContainerStatus::Exited,
            running: false,
            exit_code: Some(137),
            started_at: None,
            finished_at: Some(Utc::now() - chrono::Duration::minutes(2)),
        };
        let status = format_container_status(&state);
        assert!(status.starts_with("Exited (137)"), "{status}");
        assert!(status.ends_with("ago"));

        let state = ContainerState {
            status: ContainerStatus::Created,
            running: false,
            exit_code: None,
            started_at: None,
            finished_at: None,
        };
        assert_eq!(format_container_status(&state), "created");
    }
}
