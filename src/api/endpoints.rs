use actix_web::{
    HttpRequest, HttpResponse, get, patch, post,
    web::{self, Path},
};
use tracing::{Instrument, instrument};

use crate::{
    api::{
        rest::{ConfirmMeasureRequest, ConfirmMeasureResponse, ListMeasuresQuery, MeasureListResponse, UploadMeasureRequest, UploadMeasureResponse},
        state::AppState,
    },
    model::{
        apperror::ApplicationError,
        models::{ConfirmMeasureInputType, MeasureListInputType, UploadMeasureInputType},
    },
};

/**
 * Endpoint to upload a meter photograph and read its value.
 */
#[instrument(level = "info", skip(http_request, request_body, app_state), fields(service = "uploadMeasure", trace_id = get_trace_id(&http_request), result))]
#[post("/upload")]
pub async fn upload_measure(http_request: HttpRequest, request_body: web::Json<UploadMeasureRequest>, app_state: web::Data<AppState>) -> Result<HttpResponse, ApplicationError> {
    let span = tracing::Span::current();
    let upload_input = UploadMeasureInputType::validate(request_body.into_inner(), app_state.measure_service.utc_offset())?;
    let output = app_state.measure_service.upload(upload_input).instrument(span).await?;
    Ok(HttpResponse::Ok().json(UploadMeasureResponse::from(output)))
}

/**
 * Endpoint to confirm or correct the value of a reading.
 */
#[instrument(level = "info", skip(http_request, app_state), fields(service = "confirmMeasure", trace_id = get_trace_id(&http_request), result))]
#[patch("/confirm")]
pub async fn confirm_measure(http_request: HttpRequest, request_body: web::Json<ConfirmMeasureRequest>, app_state: web::Data<AppState>) -> Result<HttpResponse, ApplicationError> {
    let span = tracing::Span::current();
    let confirm_input = ConfirmMeasureInputType::validate(request_body.into_inner())?;
    app_state.measure_service.confirm(confirm_input).instrument(span).await?;
    Ok(HttpResponse::Ok().json(ConfirmMeasureResponse::success()))
}

/**
 * Endpoint to list the readings of a customer.
 */
#[instrument(level = "info", skip(http_request, app_state), fields(service = "listMeasures", trace_id = get_trace_id(&http_request), result))]
#[get("/{customer_code}/list")]
pub async fn list_measures(path: Path<String>, query: web::Query<ListMeasuresQuery>, http_request: HttpRequest, app_state: web::Data<AppState>) -> Result<HttpResponse, ApplicationError> {
    let span = tracing::Span::current();
    let list_input = MeasureListInputType::validate(path.into_inner(), query.into_inner())?;
    let output = app_state.measure_service.list(list_input).instrument(span).await?;
    Ok(HttpResponse::Ok().json(MeasureListResponse::from(output)))
}

/**
 * Retrieves the trace ID from the HTTP request headers.
 * If the trace ID is not present, a new UUID is generated.
 */
fn get_trace_id(http_request: &HttpRequest) -> String {
    http_request.headers().get("X-Trace-ID").and_then(|v| v.to_str().ok().map(std::string::ToString::to_string)).unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}
