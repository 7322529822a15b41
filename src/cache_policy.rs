//! Response header deciding whether the engine may cache a result.

use tonic::metadata::{MetadataMap, MetadataValue};
use tracing::debug;

use crate::context::{CallContextStore, CallId};
use crate::descriptor::RequestDescriptor;
use crate::function::FunctionTable;

/// Response header read by the engine.
pub const CACHE_HEADER: &str = "qlik-cache";

/// Value of [`CACHE_HEADER`] disabling the engine's result cache.
pub const NO_STORE: &str = "no-store";

/// Whether the call described by `descriptor` must not be cached. Only functions registered as
/// no-cache qualify; script calls never do.
pub fn is_no_store(descriptor: &RequestDescriptor, functions: &FunctionTable) -> bool {
    if descriptor.is_script() {
        return false;
    }
    functions
        .get(descriptor.function_id)
        .is_some_and(|f| f.no_cache())
}

/// Sets or clears the cache header of call `call_id` on `metadata`.
///
/// Must run before the response is handed back to the transport, which sends the headers ahead
/// of the first streamed message.
pub fn apply(
    contexts: &CallContextStore,
    call_id: &CallId,
    functions: &FunctionTable,
    metadata: &mut MetadataMap,
) {
    let no_store = contexts
        .get(call_id)
        .is_some_and(|descriptor| is_no_store(&descriptor, functions));
    if no_store {
        debug!(call_id = %call_id, "Marking response as {NO_STORE}");
        metadata.insert(CACHE_HEADER, MetadataValue::from_static(NO_STORE));
    } else {
        metadata.remove(CACHE_HEADER);
    }
}
