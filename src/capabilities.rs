//! The capability listing returned by `GetCapabilities`.

use crate::function::FunctionTable;
use crate::proto::sse as proto;

/// Describes the plugin: identity, version, whether scripts are accepted and every registered
/// function.
pub fn capabilities(
    functions: &FunctionTable,
    allow_script: bool,
    plugin_identifier: &str,
    plugin_version: &str,
) -> proto::Capabilities {
    proto::Capabilities {
        allow_script,
        functions: functions
            .definitions()
            .map(proto::FunctionDefinition::from)
            .collect(),
        plugin_identifier: plugin_identifier.to_string(),
        plugin_version: plugin_version.to_string(),
    }
}
