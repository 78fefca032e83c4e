use crate::destination::{Controller, ControllerState, DestinationIdentity};
use actix_web::{web, HttpResponse, Responder};
use serde::Serialize;
use std::sync::Arc;

/// Controllers running in this process, in configuration order
pub type Destinations = Vec<Arc<dyn Controller>>;

#[derive(Debug, Serialize)]
pub struct DestinationStatus {
    #[serde(flatten)]
    pub identity: DestinationIdentity,
    pub state: ControllerState,
    pub delivered: u64,
    pub failed: u64,
}

impl DestinationStatus {
    fn of(controller: &dyn Controller) -> Self {
        let handler = controller.handler();
        Self {
            identity: controller.identity().clone(),
            state: controller.state(),
            delivered: handler.success_count(),
            failed: handler.failure_count(),
        }
    }
}

/// GET /api/v1/health
pub async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /api/v1/destinations
pub async fn list_destinations(destinations: web::Data<Destinations>) -> impl Responder {
    let statuses: Vec<DestinationStatus> = destinations
        .iter()
        .map(|controller| DestinationStatus::of(controller.as_ref()))
        .collect();

    HttpResponse::Ok().json(statuses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::{
        ControllerSettings, DeliveryHandler, DestinationController, MockHandler,
    };
    use crate::forwarder::EventForwarder;
    use crate::handlers::configure_routes;
    use crate::log::{MemoryForwarder, MemoryLog};
    use actix_web::{test, App};
    use std::time::Duration;

    #[actix_web::test]
    async fn test_health_check() {
        let app = test::init_service(App::new().configure(configure_routes)).await;

        let req = test::TestRequest::get().uri("/api/v1/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "ok");
    }

    #[actix_web::test]
    async fn test_list_destinations() {
        let log = MemoryLog::new(2);
        let forwarder: Arc<dyn EventForwarder> =
            Arc::new(MemoryForwarder::new(log.clone(), "events"));
        let handler: Arc<dyn DeliveryHandler> =
            Arc::new(MockHandler::succeeding(Duration::ZERO));

        let running: Arc<dyn Controller> = Arc::new(DestinationController::new(
            DestinationIdentity::new("events", "destination1"),
            Arc::new(log.clone()),
            Arc::clone(&handler),
            ControllerSettings::default(),
        ));
        let idle: Arc<dyn Controller> = Arc::new(DestinationController::new(
            DestinationIdentity::new("events", "destination2"),
            Arc::new(log.clone()),
            handler,
            ControllerSettings::default(),
        ));
        running.start().await.unwrap();

        let destinations: Destinations = vec![Arc::clone(&running), idle];
        let app = test::init_service(
            App::new()
                .app_data(web::Data::from(forwarder))
                .app_data(web::Data::new(destinations))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/api/v1/destinations")
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        running.stop().await;

        assert_eq!(body[0]["group_id"], "destination1");
        assert_eq!(body[0]["topic"], "events");
        assert_eq!(body[0]["state"], "running");
        assert_eq!(body[1]["group_id"], "destination2");
        assert_eq!(body[1]["state"], "stopped");
        assert_eq!(body[1]["delivered"], 0);
    }
}
