//! Best-effort diagnostics
//!
//! Inspect output is a flat map from file-like names to text. Failures are
//! recorded as text next to the object they concern and never returned.

use std::collections::BTreeMap;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use lattice_common::Result;
use lattice_lxc::Client;

/// Diagnostic dump, keyed by entry name
pub type InspectReport = BTreeMap<String, String>;

/// Record `object` as `<name>.yaml`, or the failure as `<name>.err`
pub fn add_info_for<T: Serialize>(report: &mut InspectReport, name: &str, object: Result<T>) {
    let yaml = object
        .map_err(|e| format!("failed to get {}: {}", name, e))
        .and_then(|obj| {
            serde_yaml::to_string(&obj).map_err(|e| format!("failed to marshal yaml: {}", e))
        });
    match yaml {
        Ok(yaml) => report.insert(format!("{}.yaml", name), yaml),
        Err(err) => report.insert(format!("{}.err", name), err),
    };
}

/// Record the output of `command` run inside `instance` as `name`
///
/// A failing command additionally records `<name>.error`.
pub async fn add_command_output(
    report: &mut InspectReport,
    client: &Client,
    cancel: &CancellationToken,
    instance: &str,
    name: &str,
    command: &[&str],
) {
    match client.exec_command(cancel, instance, command).await {
        Ok(output) => {
            if output.exit_code != 0 {
                report.insert(
                    format!("{}.error", name),
                    format!("command {:?} exited with status {}", command, output.exit_code),
                );
            }
            report.insert(name.to_string(), format!("{}\n{}\n", output.stdout, output.stderr));
        }
        Err(e) => {
            report.insert(
                format!("{}.error", name),
                format!("failed to run {:?} on {}: {}", command, instance, e),
            );
        }
    }
}
