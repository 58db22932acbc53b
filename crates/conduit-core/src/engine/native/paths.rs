//! Path virtualization for native steps.
//!
//! Steps are written against container paths. Without a filesystem namespace
//! those paths are rewritten to host paths through the step's volume binds:
//! the bind whose container side is the longest prefix of a value wins, and its
//! host side replaces that prefix. Named volumes resolve to a directory under
//! the engine root. Values matching no bind pass through unchanged.

use crate::pipeline::{Bind, Step};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Filesystem-safe form of a volume name.
pub(crate) fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => format!("_{cleaned}"),
        _ => cleaned,
    }
}

/// Backing directory of a local-driver volume.
pub fn volume_dir(root: &Path, name: &str) -> PathBuf {
    root.join("volumes").join(sanitize(name))
}

fn host_path(root: &Path, bind: &Bind) -> PathBuf {
    if bind.source.starts_with('/') {
        PathBuf::from(&bind.source)
    } else {
        volume_dir(root, &bind.source)
    }
}

/// Remainder of `value` below container path `target`, without a leading slash.
fn below<'a>(value: &'a str, target: &str) -> Option<&'a str> {
    let target = target.trim_end_matches('/');
    if target.is_empty() {
        return value.strip_prefix('/');
    }
    let rest = value.strip_prefix(target)?;
    if rest.is_empty() {
        Some(rest)
    } else {
        rest.strip_prefix('/')
    }
}

/// Rewrite a container path to its host location.
pub fn rewrite(root: &Path, step: &Step, value: &str) -> String {
    let best = step
        .volumes
        .iter()
        .filter_map(|bind| below(value, &bind.target).map(|rest| (bind, rest)))
        .max_by_key(|(bind, _)| bind.target.trim_end_matches('/').len());

    match best {
        Some((bind, rest)) => {
            let host = host_path(root, bind);
            let full = if rest.is_empty() { host } else { host.join(rest) };
            full.to_string_lossy().into_owned()
        }
        None => value.to_string(),
    }
}

/// Rewrite every environment value of a step.
pub fn rewrite_env(root: &Path, step: &Step) -> BTreeMap<String, String> {
    step.environment
        .iter()
        .map(|(k, v)| (k.clone(), rewrite(root, step, v)))
        .collect()
}
