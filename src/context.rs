//! Per-request context threaded through every operation

use std::collections::BTreeMap;

/// Request identity and opaque trace carrier.
///
/// The carrier is never interpreted here; it is handed unchanged to every
/// downstream call made on behalf of the request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub req_id: i64,
    pub carrier: BTreeMap<String, String>,
}

impl RequestContext {
    pub fn new(req_id: i64) -> Self {
        Self {
            req_id,
            carrier: BTreeMap::new(),
        }
    }

    /// Attach the trace carrier received with the request
    pub fn with_carrier(mut self, carrier: BTreeMap<String, String>) -> Self {
        self.carrier = carrier;
        self
    }
}
