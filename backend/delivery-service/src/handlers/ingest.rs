use crate::error::{AppError, Result};
use crate::forwarder::EventForwarder;
use actix_web::{web, HttpResponse};
use event_schema::Event;
use tracing::{debug, warn};

/// Decode one event and forward it into the log.
///
/// POST / and POST /api/v1/events
///
/// Responds only after the broker acknowledged the write; the body is the `Ack`.
pub async fn submit_event(
    body: web::Bytes,
    forwarder: web::Data<dyn EventForwarder>,
) -> Result<HttpResponse> {
    let event = Event::from_slice(&body).map_err(|e| {
        warn!(error = %e, "Rejected undecodable event");
        AppError::BadRequest(e.to_string())
    })?;

    let ack = forwarder.forward(&event).await?;
    debug!(
        key = %event.key,
        partition = ack.partition,
        offset = ack.offset,
        "Event accepted"
    );

    Ok(HttpResponse::Ok().json(ack))
}
