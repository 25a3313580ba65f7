use actix_web::HttpResponse;

/// `GET /health_check`
///
/// Touches neither the database nor the mail transport.
pub async fn health_check() -> HttpResponse { HttpResponse::Ok().finish() }
