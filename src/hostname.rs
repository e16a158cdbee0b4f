// SPDX-License-Identifier: MIT
//! Host identity for the metric namespace.

use tracing::warn;

/// Best-effort name of the current host, used as the prefix of every
/// emitted metric. A fully-qualified name is taken as-is; an unqualified
/// one is used with a warning. The config `host` key overrides either.
pub fn discover() -> String {
    match hostname::get() {
        Ok(name) => {
            let name = name.to_string_lossy().into_owned();
            if !name.contains('.') {
                warn!(host = %name, "hostname is not fully qualified, using it unqualified");
            }
            name
        }
        Err(e) => {
            warn!("couldn't determine hostname: {e}");
            "unknown".to_string()
        }
    }
}
