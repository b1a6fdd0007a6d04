//! Prometheus metrics recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `/metrics`. Fails if another recorder
/// is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket disconnections total (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Connection lifetime seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Upgrades refused (counter, labels: reason).
pub const WS_REJECTED_TOTAL: &str = "ws_rejected_total";
/// Outbound frames dropped on a full or closed queue (counter).
pub const WS_SEND_DROPS_TOTAL: &str = "ws_send_drops_total";
/// Rooms with at least one local member (gauge).
pub const ROOMS_ACTIVE: &str = "rooms_active";
/// Inbound frames that failed to decode (counter).
pub const MESSAGES_MALFORMED_TOTAL: &str = "messages_malformed_total";
/// Inbound frames naming an unregistered action (counter).
pub const ACTIONS_UNKNOWN_TOTAL: &str = "actions_unknown_total";
/// Action invocations total (counter, labels: action).
pub const ACTION_REQUESTS_TOTAL: &str = "action_requests_total";
/// Action failures total (counter, labels: action, error_type).
pub const ACTION_ERRORS_TOTAL: &str = "action_errors_total";
/// Action handler duration seconds (histogram, labels: action).
pub const ACTION_DURATION_SECONDS: &str = "action_duration_seconds";
/// Broadcast frames published to the bus (counter).
pub const BROADCAST_PUBLISHED_TOTAL: &str = "broadcast_published_total";
/// Broadcasts delivered to the sender only after a publish failure (counter).
pub const BROADCAST_DEGRADED_TOTAL: &str = "broadcast_degraded_total";
/// Broadcast frames queued to local members (counter).
pub const BROADCAST_DELIVERED_TOTAL: &str = "broadcast_delivered_total";
/// Bus frames discarded as already delivered (counter).
pub const BROADCAST_DUPLICATES_TOTAL: &str = "broadcast_duplicates_total";
/// Room channels subscribed again after the bus dropped them (counter).
pub const BROADCAST_RESUBSCRIBES_TOTAL: &str = "broadcast_resubscribes_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('\n'));
    }

    #[test]
    fn recorded_metrics_render() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!(ACTION_REQUESTS_TOTAL, "action" => "say_hello").increment(2);
        });
        let output = render(&handle);
        assert!(output.contains(ACTION_REQUESTS_TOTAL));
        assert!(output.contains("say_hello"));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTION_DURATION_SECONDS,
            WS_REJECTED_TOTAL,
            WS_SEND_DROPS_TOTAL,
            ROOMS_ACTIVE,
            MESSAGES_MALFORMED_TOTAL,
            ACTIONS_UNKNOWN_TOTAL,
            ACTION_REQUESTS_TOTAL,
            ACTION_ERRORS_TOTAL,
            ACTION_DURATION_SECONDS,
            BROADCAST_PUBLISHED_TOTAL,
            BROADCAST_DEGRADED_TOTAL,
            BROADCAST_DELIVERED_TOTAL,
            BROADCAST_DUPLICATES_TOTAL,
            BROADCAST_RESUBSCRIBES_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "{name} is not snake_case"
            );
        }
    }
}
