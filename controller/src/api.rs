use std::{path::PathBuf, sync::Arc};

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::services::ServeDir;
use tracing::warn;

use ventilation_common::{
    LoggingConfig, OverrideMode, RegulationConfig, RelayState, RuntimeConfig, SensorReading,
};

use crate::{
    service::{ControllerService, ControllerStatus, DashboardPoint},
    store::{AppStore, EventLog, LogQuery, LogRecord},
};

const DEFAULT_DASHBOARD_LIMIT: usize = 100;
const DEFAULT_LOG_LIMIT: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ControllerService>,
    pub store: AppStore,
    pub events: EventLog,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct ReadingView {
    temperature_c: Option<f64>,
    relative_humidity_pct: Option<f64>,
    absolute_humidity: Option<f64>,
    valid: bool,
    observed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct PendingView {
    target: RelayState,
    elapsed_s: u64,
    delay_s: u64,
}

#[derive(Debug, Serialize)]
struct StationView {
    id: String,
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatusView {
    relay: RelayState,
    relay_on_for_s: u64,
    mode: OverrideMode,
    regulation_state: &'static str,
    override_cut_off: bool,
    emergency_latched: bool,
    fault: bool,
    inside: ReadingView,
    outside: ReadingView,
    difference: Option<f64>,
    on_threshold: f64,
    off_threshold: f64,
    pending: Option<PendingView>,
    station: StationView,
}

#[derive(Debug, Serialize)]
struct RelayStateView {
    state: bool,
    mode: OverrideMode,
    emergency_latched: bool,
}

#[derive(Debug, Serialize)]
struct RelayView {
    relay_state: RelayStateView,
}

#[derive(Debug, Serialize)]
struct ForceOffView {
    message: &'static str,
    relay_state: RelayStateView,
}

/// Latest readings as held by the pollers; nothing is read from the hardware here.
#[derive(Debug, Serialize)]
struct SensorView {
    inside: ReadingView,
    outside: ReadingView,
    difference: Option<f64>,
    station: StationView,
}

#[derive(Debug, Deserialize)]
struct ModeUpdate {
    mode: String,
}

/// Omitted sections keep their current values.
#[derive(Debug, Deserialize)]
struct ConfigUpdate {
    regulation: Option<RegulationConfig>,
    api_station_id: Option<String>,
    logging: Option<LoggingConfig>,
}

#[derive(Debug, Serialize)]
struct ConfigUpdateResponse {
    message: &'static str,
    restart_required: bool,
    config: RuntimeConfig,
}

#[derive(Debug, Serialize)]
struct StationEntry {
    id: String,
    station_name: String,
}

#[derive(Debug, Serialize)]
struct StationList {
    stations: Vec<StationEntry>,
}

#[derive(Debug, Deserialize)]
struct DashboardParams {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct DashboardView {
    points: Vec<DashboardPoint>,
}

#[derive(Debug, Deserialize)]
struct LogParams {
    start: Option<String>,
    end: Option<String>,
    event: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct LogView {
    logs: Vec<LogRecord>,
}

pub fn router(state: AppState, web_root: PathBuf) -> Router {
    Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/dashboard", get(handle_get_dashboard))
        .route("/api/relay", get(handle_get_relay))
        .route("/api/relay/mode", post(handle_set_mode))
        .route(
            "/api/relay/force_off",
            post(handle_force_off).delete(handle_clear_force_off),
        )
        .route("/api/sensor", get(handle_get_sensor))
        .route("/api/config", get(handle_get_config).post(handle_set_config))
        .route("/api/stations", get(handle_get_stations))
        .route("/api/logs", get(handle_get_logs))
        .fallback_service(ServeDir::new(web_root))
        .with_state(state)
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.service.current_status();
    let regulation = state.service.config().regulation;
    Json(build_status_view(status, &regulation))
}

async fn handle_get_dashboard(
    State(state): State<AppState>,
    Query(params): Query<DashboardParams>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(DEFAULT_DASHBOARD_LIMIT);
    Json(DashboardView {
        points: state.service.history(limit),
    })
}

async fn handle_get_relay(State(state): State<AppState>) -> impl IntoResponse {
    Json(build_relay_view(&state.service))
}

async fn handle_set_mode(
    State(state): State<AppState>,
    payload: Result<Json<ModeUpdate>, JsonRejection>,
) -> impl IntoResponse {
    let raw = match payload {
        Ok(Json(update)) => update.mode,
        Err(rejection) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "InvalidModeError",
                &rejection.body_text(),
            )
        }
    };
    let mode = match raw.parse::<OverrideMode>() {
        Ok(mode) => mode,
        Err(err) => {
            return error_response(StatusCode::BAD_REQUEST, "InvalidModeError", &err.to_string())
        }
    };

    let previous = state.service.set_mode(mode);
    if previous != mode {
        if let Err(err) = state.store.save_runtime_config(&state.service.config()).await {
            warn!("failed to persist mode update: {err:#}");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "PersistError",
                "Failed to persist relay mode",
            );
        }
    }

    Json(build_relay_view(&state.service)).into_response()
}

async fn handle_force_off(State(state): State<AppState>) -> impl IntoResponse {
    let message = if state.service.force_off().await {
        "Relay forced off"
    } else {
        "Relay already forced off"
    };
    Json(ForceOffView {
        message,
        relay_state: build_relay_view(&state.service).relay_state,
    })
}

async fn handle_clear_force_off(State(state): State<AppState>) -> impl IntoResponse {
    let message = if state.service.clear_emergency() {
        "Emergency stop released"
    } else {
        "No emergency stop latched"
    };
    Json(ForceOffView {
        message,
        relay_state: build_relay_view(&state.service).relay_state,
    })
}

async fn handle_get_sensor(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.service.current_status();
    Json(SensorView {
        inside: reading_view(&status.snapshot.inside),
        outside: reading_view(&status.snapshot.outside),
        difference: status.regulation.difference.map(round2),
        station: StationView {
            id: status.station_id,
            name: status.station_name,
        },
    })
}

async fn handle_get_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service.config())
}

async fn handle_set_config(
    State(state): State<AppState>,
    payload: Result<Json<ConfigUpdate>, JsonRejection>,
) -> impl IntoResponse {
    let update = match payload {
        Ok(Json(update)) => update,
        Err(rejection) => {
            return error_response(StatusCode::BAD_REQUEST, "ConfigError", &rejection.body_text())
        }
    };

    let previous = state.service.config();
    let mut next = previous.clone();
    if let Some(regulation) = update.regulation {
        next.regulation = regulation;
    }
    if let Some(station_id) = update.api_station_id {
        next.api_station_id = station_id.trim().to_string();
    }
    if let Some(logging) = update.logging {
        next.logging = logging;
    }

    if let Err(err) = state.service.reload_config(next) {
        return error_response(StatusCode::BAD_REQUEST, "ConfigError", &err.to_string());
    }

    let current = state.service.config();
    if let Err(err) = state.store.save_runtime_config(&current).await {
        warn!("failed to persist config update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "PersistError",
            "Failed to persist runtime config",
        );
    }

    Json(ConfigUpdateResponse {
        message: "Configuration updated",
        restart_required: previous.logging.log_file != current.logging.log_file,
        config: current,
    })
    .into_response()
}

async fn handle_get_stations(State(state): State<AppState>) -> impl IntoResponse {
    let stations = state
        .service
        .stations()
        .into_iter()
        .map(|station| StationEntry {
            id: station.id,
            station_name: station.name,
        })
        .collect();
    Json(StationList { stations })
}

async fn handle_get_logs(
    State(state): State<AppState>,
    Query(params): Query<LogParams>,
) -> impl IntoResponse {
    let start = match parse_timestamp(params.start.as_deref()) {
        Ok(start) => start,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, "InvalidDate", &message),
    };
    let end = match parse_timestamp(params.end.as_deref()) {
        Ok(end) => end,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, "InvalidDate", &message),
    };

    let query = LogQuery {
        start,
        end,
        event: params.event.filter(|event| !event.is_empty()),
        limit: params.limit.unwrap_or(DEFAULT_LOG_LIMIT),
    };
    match state.events.query(&query).await {
        Ok(logs) => Json(LogView { logs }).into_response(),
        Err(err) => {
            warn!("failed to read event log: {err:#}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "LogReadError",
                "Failed to read event log",
            )
        }
    }
}

fn parse_timestamp(raw: Option<&str>) -> Result<Option<DateTime<Utc>>, String> {
    match raw {
        None | Some("") => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|parsed| Some(parsed.with_timezone(&Utc)))
            .map_err(|err| format!("invalid RFC 3339 timestamp '{raw}': {err}")),
    }
}

fn build_relay_view(service: &ControllerService) -> RelayView {
    let status = service.current_status();
    RelayView {
        relay_state: RelayStateView {
            state: status.regulation.relay.state.is_on(),
            mode: service.mode(),
            emergency_latched: service.emergency_latched(),
        },
    }
}

fn build_status_view(status: ControllerStatus, regulation: &RegulationConfig) -> StatusView {
    let pending = status.regulation.pending.map(|pending| PendingView {
        target: pending.target,
        elapsed_s: status.pending_elapsed_s.unwrap_or(0),
        delay_s: match pending.target {
            RelayState::On => regulation.on_delay_s,
            RelayState::Off => regulation.off_delay_s,
        },
    });

    StatusView {
        relay: status.regulation.relay.state,
        relay_on_for_s: status.relay_on_for_s,
        mode: status.mode,
        regulation_state: regulation_state(&status),
        override_cut_off: status.regulation.override_cut_off,
        emergency_latched: status.regulation.emergency_latched,
        fault: status.fault,
        inside: reading_view(&status.snapshot.inside),
        outside: reading_view(&status.snapshot.outside),
        difference: status.regulation.difference.map(round2),
        on_threshold: regulation.on_threshold,
        off_threshold: regulation.off_threshold,
        pending,
        station: StationView {
            id: status.station_id,
            name: status.station_name,
        },
    }
}

fn regulation_state(status: &ControllerStatus) -> &'static str {
    let relay_on = status.regulation.relay.state.is_on();
    if status.regulation.emergency_latched {
        return "emergency_stop";
    }
    if status.mode != OverrideMode::Auto {
        return if relay_on { "relay_on" } else { "relay_off" };
    }
    match status.regulation.pending.map(|pending| pending.target) {
        Some(RelayState::On) => "pending_on",
        Some(RelayState::Off) => "pending_off",
        None if relay_on => "relay_on",
        None => "idle",
    }
}

fn reading_view(reading: &SensorReading) -> ReadingView {
    if !reading.has_value() {
        return ReadingView {
            temperature_c: None,
            relative_humidity_pct: None,
            absolute_humidity: None,
            valid: false,
            observed_at: None,
        };
    }
    ReadingView {
        temperature_c: Some(round1(reading.temperature_c())),
        relative_humidity_pct: Some(round1(reading.relative_humidity_pct())),
        absolute_humidity: Some(round2(reading.absolute_humidity())),
        valid: reading.is_valid(),
        observed_at: reading.observed_at(),
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn error_response(status: StatusCode, kind: &'static str, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
            kind,
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;
    use tower::util::ServiceExt;

    use crate::drivers::Drivers;

    struct TestApp {
        app: Router,
        state: AppState,
        _dir: tempfile::TempDir,
    }

    fn test_app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let store = AppStore::at(dir.path());
        let (events, _writer) =
            EventLog::spawn(dir.path().join("log.json"), CancellationToken::new());
        let service = ControllerService::start(
            RuntimeConfig::default(),
            Drivers::simulated(),
            events.clone(),
        )
        .unwrap();
        let state = AppState {
            service: Arc::new(service),
            store,
            events,
        };
        TestApp {
            app: router(state.clone(), dir.path().join("web")),
            state,
            _dir: dir,
        }
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn post_json(uri: &str, payload: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn relay_view_reports_mode_and_state() {
        let test = test_app();

        let (status, body) = send(&test.app, get("/api/relay")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["relay_state"]["mode"], json!("Auto"));
        assert!(body["relay_state"]["state"].is_boolean());
    }

    #[tokio::test]
    async fn unknown_mode_is_rejected() {
        let test = test_app();

        let (status, body) =
            send(&test.app, post_json("/api/relay/mode", json!({ "mode": "Turbo" }))).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], json!("InvalidModeError"));
        assert_eq!(test.state.service.mode(), OverrideMode::Auto);
    }

    #[tokio::test]
    async fn accepted_mode_is_persisted() {
        let test = test_app();

        let (status, body) =
            send(&test.app, post_json("/api/relay/mode", json!({ "mode": "Aus" }))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["relay_state"]["mode"], json!("Aus"));
        let stored = test.state.store.load_runtime_config().await.unwrap();
        assert_eq!(stored.relay_mode, OverrideMode::Aus);
    }

    #[tokio::test]
    async fn inverted_thresholds_leave_config_unchanged() {
        let test = test_app();
        let before = test.state.service.config();

        let mut regulation = serde_json::to_value(&before.regulation).unwrap();
        regulation["on_threshold"] = json!(1.0);
        regulation["off_threshold"] = json!(1.5);
        let (status, body) = send(
            &test.app,
            post_json("/api/config", json!({ "regulation": regulation })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], json!("ConfigError"));
        assert_eq!(test.state.service.config(), before);
    }

    #[tokio::test]
    async fn partial_config_update_is_applied_and_persisted() {
        let test = test_app();

        let (status, body) = send(
            &test.app,
            post_json("/api/config", json!({ "api_station_id": "SMA" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["restart_required"], json!(false));
        assert_eq!(body["config"]["api_station_id"], json!("SMA"));
        assert_eq!(test.state.service.config().api_station_id, "SMA");
        let stored = test.state.store.load_runtime_config().await.unwrap();
        assert_eq!(stored.api_station_id, "SMA");
        assert_eq!(
            stored.regulation,
            RuntimeConfig::default().regulation
        );
    }

    #[tokio::test]
    async fn log_query_rejects_bad_dates() {
        let test = test_app();

        let (status, body) = send(&test.app, get("/api/logs?start=yesterday")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], json!("InvalidDate"));
    }

    #[tokio::test]
    async fn status_exposes_thresholds_and_station() {
        let test = test_app();

        let (status, body) = send(&test.app, get("/api/status")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["on_threshold"], json!(2.0));
        assert_eq!(body["off_threshold"], json!(1.7));
        assert_eq!(body["station"]["id"], json!("ARO"));
    }

    #[test]
    fn override_modes_report_plain_relay_state() {
        let mut status = ControllerStatus {
            snapshot: Default::default(),
            regulation: Default::default(),
            mode: OverrideMode::Aus,
            station_id: "ARO".to_string(),
            station_name: None,
            relay_on_for_s: 0,
            pending_elapsed_s: None,
            fault: false,
        };
        assert_eq!(regulation_state(&status), "relay_off");

        status.mode = OverrideMode::Auto;
        assert_eq!(regulation_state(&status), "idle");

        status.regulation.pending = Some(ventilation_common::PendingTransition::arm(
            RelayState::On,
            0,
        ));
        assert_eq!(regulation_state(&status), "pending_on");

        status.regulation.emergency_latched = true;
        assert_eq!(regulation_state(&status), "emergency_stop");
    }

    #[test]
    fn status_difference_follows_regulation_not_raw_readings() {
        let now = Utc::now();
        let snapshot = ventilation_common::EnvironmentSnapshot {
            inside: SensorReading::observe(22.0, 85.0, now).unwrap(),
            outside: SensorReading::observe(0.0, 60.0, now).unwrap().invalidated(),
        };
        let mut status = ControllerStatus {
            snapshot,
            regulation: Default::default(),
            mode: OverrideMode::Auto,
            station_id: "ARO".to_string(),
            station_name: None,
            relay_on_for_s: 0,
            pending_elapsed_s: None,
            fault: true,
        };

        let view = build_status_view(status.clone(), &RegulationConfig::default());
        assert_eq!(view.difference, None);
        assert!(view.outside.temperature_c.is_some());
        assert!(!view.outside.valid);
        assert!(view.fault);

        status.regulation.difference = Some(12.345);
        let view = build_status_view(status, &RegulationConfig::default());
        assert_eq!(view.difference, Some(12.35));
    }

    #[tokio::test]
    async fn escaping_log_file_is_rejected() {
        let test = test_app();
        let before = test.state.service.config();

        for log_file in ["", "../../../tmp/escaped.json", "/tmp/escaped.json"] {
            let (status, body) = send(
                &test.app,
                post_json("/api/config", json!({ "logging": { "log_file": log_file } })),
            )
            .await;

            assert_eq!(status, StatusCode::BAD_REQUEST, "log_file {log_file:?}");
            assert_eq!(body["kind"], json!("ConfigError"));
        }
        assert_eq!(test.state.service.config(), before);
    }

    #[tokio::test]
    async fn force_off_latches_until_released() {
        let test = test_app();

        let (status, body) = send(
            &test.app,
            Request::builder()
                .method("POST")
                .uri("/api/relay/force_off")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], json!("Relay forced off"));
        assert_eq!(body["relay_state"]["state"], json!(false));
        assert_eq!(body["relay_state"]["emergency_latched"], json!(true));

        send(&test.app, post_json("/api/relay/mode", json!({ "mode": "Hand" }))).await;
        let (_, body) = send(&test.app, get("/api/status")).await;
        assert_eq!(body["relay"], json!("OFF"));
        assert_eq!(body["regulation_state"], json!("emergency_stop"));

        let (status, body) = send(
            &test.app,
            Request::builder()
                .method("DELETE")
                .uri("/api/relay/force_off")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], json!("Emergency stop released"));
        assert_eq!(body["relay_state"]["emergency_latched"], json!(false));
        assert!(!test.state.service.emergency_latched());
    }

    #[tokio::test]
    async fn sensor_reports_latest_readings_and_station() {
        let test = test_app();

        let (status, body) = send(&test.app, get("/api/sensor")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["station"]["id"], json!("ARO"));
        assert!(body["inside"]["valid"].is_boolean());
        assert!(body["outside"]["valid"].is_boolean());
    }

    #[test]
    fn rfc3339_parsing_normalizes_to_utc() {
        let parsed = parse_timestamp(Some("2026-01-05T10:00:00+01:00")).unwrap();
        assert_eq!(
            parsed.map(|value| value.to_rfc3339()),
            Some("2026-01-05T09:00:00+00:00".to_string())
        );
        assert_eq!(parse_timestamp(None), Ok(None));
    }
}
