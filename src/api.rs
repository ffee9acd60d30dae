use actix_web::{HttpResponse, Responder, web};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::health::{AgentStatus, FreshnessMonitor, SharedStatus};
use crate::metrics;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
    agent: AgentStatus,
    /// Seconds since each state file was last written.
    file_ages: BTreeMap<String, i64>,
}

/// Shared handles the ops endpoints read from.
#[derive(Clone)]
pub struct ApiState {
    pub status: SharedStatus,
    pub freshness: FreshnessMonitor,
}

pub async fn health_check(data: web::Data<ApiState>) -> impl Responder {
    let agent = data.status.read().clone();
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        agent,
        file_ages: data.freshness.ages(),
    })
}

pub async fn metrics_endpoint() -> impl Responder {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::render())
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(health_check)))
        .service(web::resource("/metrics").route(web::get().to(metrics_endpoint)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SimulatedTimeProvider;
    use actix_web::{App, test};
    use parking_lot::RwLock;
    use std::sync::Arc;

    #[actix_web::test]
    async fn test_health_reports_status_and_ages() {
        let clock = Arc::new(SimulatedTimeProvider::new(1_723_200_010_000));
        let freshness = FreshnessMonitor::new(clock.clone());
        freshness.update_at("account_info.json", 1_723_200_000);
        let status = Arc::new(RwLock::new(AgentStatus {
            ticks: 3,
            ..AgentStatus::default()
        }));

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(ApiState { status, freshness }))
                .configure(config),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["agent"]["ticks"], 3);
        assert_eq!(body["file_ages"]["account_info.json"], 10);

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
    }
}
