//! Health and status.

use serde_json::json;

use crate::dispatch::Dispatcher;

pub(super) fn register(dispatcher: &mut Dispatcher) {
    dispatcher.register("health", |gateway, _ctx| async move {
        Ok(json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "uptimeSecs": gateway.metrics.uptime_secs(),
        }))
    });

    dispatcher.register("ping", |_gateway, _ctx| async move { Ok(json!({ "pong": true })) });

    // Not in the tenant allow-list: operator-facing gateway internals.
    dispatcher.register("status", |gateway, _ctx| async move {
        let tenants = gateway.registry.list().map_err(super::tenancy_err)?;
        Ok(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "uptimeSecs": gateway.metrics.uptime_secs(),
            "connections": gateway.connections.len(),
            "tenants": tenants.len(),
            "ptySessions": gateway.terminals.session_count(),
            "schedulersRunning": gateway.schedulers.running_count(),
            "requestsDispatched": gateway.metrics.requests_dispatched(),
            "eventsDropped": gateway.connections.dropped_events(),
        }))
    });
}
