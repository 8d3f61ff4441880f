pub(crate) const SERVER_SELECTION_TRACING_EVENT_TARGET: &str = "mongodb_sdam::server_selection";
pub(crate) const TOPOLOGY_TRACING_EVENT_TARGET: &str = "mongodb_sdam::topology";
pub(crate) const SRV_POLLING_TRACING_EVENT_TARGET: &str = "mongodb_sdam::srv_polling";
