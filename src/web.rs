//! HTTP adapter. Thin axum handlers over [`Kernel`] — validation and state
//! live in the façade; this module only parses requests, calls through, and
//! shapes responses.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

use crate::error::KernelError;
use crate::kernel::Kernel;
use crate::store::{Program, ProgramStep, Recurrence};

struct ApiError(KernelError);

impl From<KernelError> for ApiError {
    fn from(e: KernelError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(serde_json::json!({ "success": false, "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn ok() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "success": true }))
}

pub fn router(kernel: Arc<Kernel>) -> Router {
    Router::new()
        .route("/data/user_settings.json", get(get_user_settings))
        .route("/data/program.json", get(get_programs))
        .route("/data/system_log.json", get(get_system_log))
        .route("/save_program", post(save_program))
        .route("/update_program", put(update_program))
        .route("/delete_program", post(delete_program))
        .route("/start_program", post(start_program))
        .route("/stop_program", post(stop_program))
        .route("/start_zone", post(start_zone))
        .route("/stop_zone", post(stop_zone))
        .route("/get_zones_status", get(get_zones_status))
        .route("/get_program_state", get(get_program_state))
        .route("/reset_settings", post(reset_settings))
        .route("/reset_factory_data", post(reset_factory_data))
        .route("/restart_system", post(restart_system))
        .route("/save_user_settings", post(save_user_settings))
        .route("/scan_wifi", get(scan_wifi))
        .route("/connect_wifi", post(connect_wifi))
        .route("/disconnect_wifi", post(disconnect_wifi))
        .route("/activate_ap", post(activate_ap))
        .route("/get_connection_status", get(get_connection_status))
        .with_state(kernel)
}

// -- raw document reads -------------------------------------------------

async fn get_user_settings(State(kernel): State<Arc<Kernel>>) -> impl IntoResponse {
    Json(kernel.get_settings().await)
}

async fn get_programs(State(kernel): State<Arc<Kernel>>) -> impl IntoResponse {
    Json(kernel.list_programs().await)
}

async fn get_system_log(State(kernel): State<Arc<Kernel>>) -> impl IntoResponse {
    Json(kernel.log_entries())
}

#[derive(Serialize)]
struct ProgramStateResponse {
    program_running: bool,
    current_program_id: Option<String>,
}

async fn get_program_state(State(kernel): State<Arc<Kernel>>) -> impl IntoResponse {
    let status = kernel.status().await;
    Json(ProgramStateResponse {
        program_running: status.program_running,
        current_program_id: status.current_program_id,
    })
}

async fn get_zones_status(State(kernel): State<Arc<Kernel>>) -> impl IntoResponse {
    Json(kernel.status().await)
}

async fn get_connection_status(State(kernel): State<Arc<Kernel>>) -> impl IntoResponse {
    Json(kernel.connectivity_status())
}

async fn scan_wifi(State(kernel): State<Arc<Kernel>>) -> impl IntoResponse {
    Json(kernel.scan_wifi().await)
}

// -- zone commands -------------------------------------------------------

#[derive(Deserialize)]
struct StartZoneRequest {
    zone_id: u32,
    duration_minutes: u32,
}

async fn start_zone(
    State(kernel): State<Arc<Kernel>>,
    Json(req): Json<StartZoneRequest>,
) -> ApiResult<serde_json::Value> {
    kernel.start_zone(req.zone_id, req.duration_minutes).await?;
    Ok(ok())
}

#[derive(Deserialize)]
struct ZoneIdRequest {
    zone_id: u32,
}

async fn stop_zone(State(kernel): State<Arc<Kernel>>, Json(req): Json<ZoneIdRequest>) -> impl IntoResponse {
    kernel.stop_zone(req.zone_id);
    ok()
}

async fn stop_program(State(kernel): State<Arc<Kernel>>) -> impl IntoResponse {
    kernel.stop_all().await;
    ok()
}

// -- program commands ------------------------------------------------------

#[derive(Deserialize)]
struct ProgramBody {
    name: String,
    months: BTreeSet<u8>,
    #[serde(flatten)]
    recurrence: Recurrence,
    activation_time: String,
    steps: Vec<ProgramStep>,
}

impl ProgramBody {
    fn into_program(self, id: String) -> Program {
        Program {
            id,
            name: self.name,
            months: self.months,
            recurrence: self.recurrence,
            activation_time: self.activation_time,
            steps: self.steps,
            last_run_date: None,
        }
    }
}

async fn save_program(
    State(kernel): State<Arc<Kernel>>,
    Json(body): Json<ProgramBody>,
) -> ApiResult<Program> {
    let program = kernel.create_program(body.into_program(String::new())).await?;
    Ok(Json(program))
}

#[derive(Deserialize)]
struct UpdateProgramBody {
    id: String,
    #[serde(flatten)]
    program: ProgramBody,
}

async fn update_program(
    State(kernel): State<Arc<Kernel>>,
    Json(body): Json<UpdateProgramBody>,
) -> ApiResult<Program> {
    let program = kernel
        .update_program(&body.id, body.program.into_program(body.id.clone()))
        .await?;
    Ok(Json(program))
}

#[derive(Deserialize)]
struct ProgramIdRequest {
    id: String,
}

async fn delete_program(
    State(kernel): State<Arc<Kernel>>,
    Json(req): Json<ProgramIdRequest>,
) -> ApiResult<serde_json::Value> {
    kernel.delete_program(&req.id).await?;
    Ok(ok())
}

async fn start_program(
    State(kernel): State<Arc<Kernel>>,
    Json(req): Json<ProgramIdRequest>,
) -> ApiResult<serde_json::Value> {
    kernel.run_program_now(&req.id).await?;
    Ok(ok())
}

// -- settings commands -----------------------------------------------------

async fn save_user_settings(
    State(kernel): State<Arc<Kernel>>,
    Json(settings): Json<crate::store::Settings>,
) -> ApiResult<crate::store::Settings> {
    let saved = kernel.update_settings(settings).await?;
    Ok(Json(saved))
}

async fn reset_settings(State(kernel): State<Arc<Kernel>>) -> ApiResult<crate::store::Settings> {
    let settings = kernel.reset_settings().await?;
    Ok(Json(settings))
}

async fn reset_factory_data(State(kernel): State<Arc<Kernel>>) -> ApiResult<serde_json::Value> {
    kernel.reset_factory_data().await?;
    Ok(ok())
}

async fn restart_system(State(kernel): State<Arc<Kernel>>) -> impl IntoResponse {
    kernel.request_restart();
    ok()
}

// -- connectivity commands -----------------------------------------------

#[derive(Deserialize)]
struct WifiConnectRequest {
    ssid: String,
    password: String,
}

async fn connect_wifi(
    State(kernel): State<Arc<Kernel>>,
    Json(req): Json<WifiConnectRequest>,
) -> ApiResult<crate::store::Settings> {
    let settings = kernel.connect_wifi(req.ssid, req.password).await?;
    Ok(Json(settings))
}

async fn disconnect_wifi(State(kernel): State<Arc<Kernel>>) -> ApiResult<crate::store::Settings> {
    let settings = kernel.disconnect_wifi().await?;
    Ok(Json(settings))
}

async fn activate_ap(State(kernel): State<Arc<Kernel>>) -> ApiResult<crate::store::Settings> {
    let settings = kernel.activate_ap().await?;
    Ok(Json(settings))
}

// -- server entry point ----------------------------------------------------

pub async fn serve(kernel: Arc<Kernel>, port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await.expect("failed to bind web port");
    info!(%addr, "web api listening");
    axum::serve(listener, router(kernel)).await.expect("web server error");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::gpio::MockGpio;
    use crate::logsink::LogSink;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn test_kernel() -> (Arc<Kernel>, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "irrigation_web_test_{}_{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let gpio = Arc::new(MockGpio::new());
        let clock = FakeClock::new(1_718_431_200);
        let log = LogSink::new(&dir, clock.clone());
        (Kernel::new(&dir, gpio, clock, log).await, dir)
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn get_user_settings_returns_factory_defaults() {
        let (kernel, dir) = test_kernel().await;
        let app = router(kernel);
        let req = Request::builder().uri("/data/user_settings.json").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["max_active_zones"], 3);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn start_zone_with_unknown_zone_returns_404() {
        let (kernel, dir) = test_kernel().await;
        let app = router(kernel);
        let body = serde_json::json!({ "zone_id": 99, "duration_minutes": 5 });
        let req = Request::builder()
            .method("POST")
            .uri("/start_zone")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let json = body_json(resp).await;
        assert_eq!(json["success"], false);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn start_zone_then_stop_zone_round_trips() {
        let (kernel, dir) = test_kernel().await;
        let app = router(kernel);

        let start_body = serde_json::json!({ "zone_id": 0, "duration_minutes": 5 });
        let start_req = Request::builder()
            .method("POST")
            .uri("/start_zone")
            .header("content-type", "application/json")
            .body(Body::from(start_body.to_string()))
            .unwrap();
        let resp = app.clone().oneshot(start_req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let stop_body = serde_json::json!({ "zone_id": 0 });
        let stop_req = Request::builder()
            .method("POST")
            .uri("/stop_zone")
            .header("content-type", "application/json")
            .body(Body::from(stop_body.to_string()))
            .unwrap();
        let resp = app.oneshot(stop_req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn save_program_then_list_returns_it() {
        let (kernel, dir) = test_kernel().await;
        let app = router(kernel);

        let body = serde_json::json!({
            "name": "Front lawn",
            "months": [6, 7, 8],
            "recurrence": "daily",
            "activation_time": "06:00",
            "steps": [{ "zone_id": 0, "duration_minutes": 10 }],
        });
        let req = Request::builder()
            .method("POST")
            .uri("/save_program")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let created = body_json(resp).await;
        assert_eq!(created["id"], "1");

        let list_req = Request::builder().uri("/data/program.json").body(Body::empty()).unwrap();
        let resp = app.oneshot(list_req).await.unwrap();
        let json = body_json(resp).await;
        assert!(json["1"].is_object());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn delete_program_not_found_returns_404() {
        let (kernel, dir) = test_kernel().await;
        let app = router(kernel);
        let body = serde_json::json!({ "id": "99" });
        let req = Request::builder()
            .method("POST")
            .uri("/delete_program")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let (kernel, dir) = test_kernel().await;
        let app = router(kernel);
        let req = Request::builder().uri("/nonexistent").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn get_connection_status_defaults_to_access_point() {
        let (kernel, dir) = test_kernel().await;
        let app = router(kernel);
        let req = Request::builder().uri("/get_connection_status").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["mode"], "access_point");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
