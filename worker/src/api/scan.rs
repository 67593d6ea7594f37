use actix_web::{web, HttpRequest, HttpResponse, Responder};
use vulnscan_core::{ModuleUrlPath, QueryParams, ScanRequest};

use crate::state::AppState;

pub fn configure_scan_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/scan/{target:.*}", web::post().to(run_scan))
        .route("/work-state/{target:.*}", web::get().to(get_work_state));
}

/// 扫描一个模块版本，并按需写入结果
pub async fn run_scan(state: web::Data<AppState>, path: web::Path<String>, req: HttpRequest) -> impl Responder {
    let params = match web::Query::<QueryParams>::from_query(req.query_string()) {
        Ok(params) => params.into_inner(),
        Err(e) => {
            return HttpResponse::BadRequest().json(serde_json::json!({
                "error": format!("Invalid query: {}", e)
            }));
        }
    };
    let request = match ScanRequest::parse(&path, params) {
        Ok(request) => request,
        Err(e) => {
            return HttpResponse::BadRequest().json(serde_json::json!({
                "error": e.to_string()
            }));
        }
    };

    let key = request.name();
    let Some(_guard) = state.claim(&key) else {
        tracing::info!(target_module = %key, "scan already in progress");
        return HttpResponse::Conflict().json(serde_json::json!({
            "error": format!("A scan of {} is already in progress", key)
        }));
    };

    tracing::info!(target_module = %key, params = %request.params(), "scan requested");
    match state.pipeline.scan(&request).await {
        Ok(outcome) => HttpResponse::Ok().json(outcome),
        Err(e) => {
            tracing::error!(target_module = %key, "failed to store scan result: {}", e);
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": format!("Failed to store scan result: {}", e)
            }))
        }
    }
}

/// 查询最新一次扫描的工作版本
pub async fn get_work_state(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let target = match ModuleUrlPath::parse(&path) {
        Ok(target) => target,
        Err(e) => {
            return HttpResponse::BadRequest().json(serde_json::json!({
                "error": e.to_string()
            }));
        }
    };

    match state.store.read_work_state(&target.module, &target.version).await {
        Ok(Some(work_state)) => HttpResponse::Ok().json(work_state),
        Ok(None) => HttpResponse::NotFound().json(serde_json::json!({
            "error": format!("No scan result for {}@{}", target.module, target.version)
        })),
        Err(e) => {
            tracing::error!("failed to read work state: {}", e);
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": format!("Failed to read work state: {}", e)
            }))
        }
    }
}
