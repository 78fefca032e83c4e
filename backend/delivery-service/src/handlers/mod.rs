/// HTTP handlers for the delivery service API
pub mod health;
pub mod ingest;

use actix_web::web;

pub use health::{health_check, list_destinations, Destinations};
pub use ingest::submit_event;

/// Register every route. Expects `web::Data<dyn EventForwarder>` and
/// `web::Data<Destinations>` as app data.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::post().to(submit_event)).service(
        web::scope("/api/v1")
            .route("/events", web::post().to(submit_event))
            .route("/health", web::get().to(health_check))
            .route("/destinations", web::get().to(list_destinations)),
    );
}
