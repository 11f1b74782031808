use axum::{
    routing::{get, post, put},
    Router,
};

use crate::proxy::admin;
use crate::proxy::state::AppState;

// Admin surface consumed by the UI bridge. Nested under /admin by the
// server; the forward catch-all handles everything else.
pub(crate) fn admin_router() -> Router<AppState> {
    Router::new()
        .route("/groups", get(admin::admin_get_groups))
        .route("/groups/:name/activate", post(admin::admin_activate_group))
        .route("/groups/:name/pause", post(admin::admin_pause_group))
        .route("/groups/:name/resume", post(admin::admin_resume_group))
        .route(
            "/endpoints",
            get(admin::admin_list_endpoints).post(admin::admin_add_endpoint),
        )
        .route(
            "/endpoints/:name",
            put(admin::admin_update_endpoint).delete(admin::admin_remove_endpoint),
        )
        .route(
            "/endpoints/:name/toggle",
            post(admin::admin_toggle_endpoint),
        )
        .route(
            "/endpoints/:name/switch-token",
            post(admin::admin_switch_endpoint_token),
        )
        .route(
            "/endpoints/:name/switch-api-key",
            post(admin::admin_switch_endpoint_api_key),
        )
        .route(
            "/endpoints/:name/keys",
            get(admin::admin_get_endpoint_keys),
        )
        .route(
            "/health-check/trigger",
            post(admin::admin_trigger_health_check),
        )
        .route("/logs", get(admin::admin_get_recent_logs))
        .route("/logs/stream/start", post(admin::admin_start_log_stream))
        .route("/logs/stream/stop", post(admin::admin_stop_log_stream))
        .route("/records", get(admin::admin_query_records))
        .route("/records/recent", get(admin::admin_recent_records))
        .route("/stats", get(admin::admin_get_stats))
        .route(
            "/config",
            get(admin::admin_get_config).post(admin::admin_save_config),
        )
}
