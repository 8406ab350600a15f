use actix_web::{HttpResponse, ResponseError, http::StatusCode, web};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{
    apperror::{ApplicationError, ErrorType},
    models::{MeasureListElementType, MeasureListOutputType, UploadMeasureOutputType},
};

/***************** Upload models *********************/

/**
 * Request structure for uploading a meter reading.
 *
 * All fields are optional at this level so that missing fields are reported as `INVALID_DATA` by validation.
 */
#[derive(Debug, Deserialize)]
pub struct UploadMeasureRequest {
    /**
     * Base64 encoded image as data url, e.g. `data:image/png;base64,...`.
     */
    pub image: Option<String>,
    pub customer_code: Option<String>,
    /**
     * ISO-8601 datetime of the reading.
     */
    pub measure_datetime: Option<String>,
    /**
     * WATER or GAS.
     */
    pub measure_type: Option<String>,
}

/**
 * Response structure for an uploaded reading.
 */
#[derive(Debug, Serialize)]
pub struct UploadMeasureResponse {
    image_url: String,
    #[serde(with = "rust_decimal::serde::float")]
    measure_value: Decimal,
    measure_uuid: Uuid,
}

impl From<UploadMeasureOutputType> for UploadMeasureResponse {
    fn from(output: UploadMeasureOutputType) -> Self {
        UploadMeasureResponse { image_url: output.image_url, measure_value: output.measure_value, measure_uuid: output.measure_uuid }
    }
}

/***************** Confirm models *********************/

/**
 * Request structure for confirming a reading.
 */
#[derive(Debug, Deserialize)]
pub struct ConfirmMeasureRequest {
    pub measure_uuid: Option<String>,
    /**
     * Kept as a json value so a non integer number is reported by validation. Whole floats such as `130.0` are accepted.
     */
    pub confirmed_value: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct ConfirmMeasureResponse {
    success: bool,
}

impl ConfirmMeasureResponse {
    pub fn success() -> Self {
        ConfirmMeasureResponse { success: true }
    }
}

/***************** List models *********************/

/**
 * Query parameters for listing readings.
 */
#[derive(Debug, Deserialize)]
pub struct ListMeasuresQuery {
    /**
     * Optional type filter, case-insensitive.
     */
    pub measure_type: Option<String>,
}

/**
 * Response structure for listing readings.
 */
#[derive(Debug, Serialize)]
pub struct MeasureListResponse {
    customer_code: String,
    measures: Vec<MeasureListElement>,
}

impl From<MeasureListOutputType> for MeasureListResponse {
    fn from(output: MeasureListOutputType) -> Self {
        MeasureListResponse { customer_code: output.customer_code, measures: output.measures.into_iter().map(MeasureListElement::from).collect() }
    }
}

/**
 * A listed reading. The measured value is not part of the listing.
 */
#[derive(Debug, Serialize)]
pub struct MeasureListElement {
    measure_uuid: Uuid,
    measure_datetime: DateTime<Utc>,
    measure_type: String,
    has_confirmed: bool,
    image_url: String,
}

impl From<MeasureListElementType> for MeasureListElement {
    fn from(element: MeasureListElementType) -> Self {
        MeasureListElement {
            measure_uuid: element.measure_uuid,
            measure_datetime: element.measure_datetime,
            measure_type: element.measure_type.to_string(),
            has_confirmed: element.has_confirmed,
            image_url: element.image_url,
        }
    }
}

/***************** Error models *********************/

/**
 * Custom error response for the application.
 */
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /**
     * The error code associated with the error type.
     */
    pub error_code: &'static str,
    /**
     * A human-readable message describing the error.
     */
    pub error_description: String,
}

impl ResponseError for ApplicationError {
    fn status_code(&self) -> StatusCode {
        get_statuscode(&self.error_type)
    }

    /**
     * Generates an error response for the application error.
     */
    fn error_response(&self) -> HttpResponse {
        if self.status_code().is_server_error() {
            tracing::error!("Request failed: {}", self.message);
        }
        let error_response = ErrorResponse { error_code: get_error_code(&self.error_type), error_description: self.message.clone() };
        HttpResponse::build(self.status_code()).json(&error_response)
    }
}

/**
* Maps application errors to HTTP status codes.
*
* # Arguments
* `application_error`: The type of error that occurred.
*
* # Returns
* The corresponding HTTP status code.
*/
fn get_statuscode(application_error: &ErrorType) -> StatusCode {
    match application_error {
        ErrorType::InvalidData | ErrorType::InvalidImageType | ErrorType::InvalidType => StatusCode::BAD_REQUEST,
        ErrorType::MeasureNotFound | ErrorType::MeasuresNotFound => StatusCode::NOT_FOUND,
        ErrorType::DoubleReport | ErrorType::ConfirmationDuplicate => StatusCode::CONFLICT,
        ErrorType::ExtractionFailed | ErrorType::OracleError | ErrorType::DatabaseError | ErrorType::Initialization | ErrorType::Application => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/**
 * Maps application errors to error codes.
 *
 * # Arguments
 * `application_error`: The type of error that occurred.
 *
 * # Returns
 * The corresponding error code.
 */
fn get_error_code(application_error: &ErrorType) -> &'static str {
    match application_error {
        ErrorType::InvalidData | ErrorType::InvalidImageType => "INVALID_DATA",
        ErrorType::InvalidType => "INVALID_TYPE",
        ErrorType::MeasureNotFound => "MEASURE_NOT_FOUND",
        ErrorType::MeasuresNotFound => "MEASURES_NOT_FOUND",
        ErrorType::DoubleReport => "DOUBLE_REPORT",
        ErrorType::ConfirmationDuplicate => "CONFIRMATION_DUPLICATE",
        ErrorType::ExtractionFailed | ErrorType::OracleError | ErrorType::DatabaseError | ErrorType::Initialization | ErrorType::Application => "SERVER_ERROR",
    }
}

/***************** Extractor configuration *********************/

/**
 * Json extractor configuration reporting malformed bodies as `INVALID_DATA`.
 */
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().limit(20 * 1024 * 1024).error_handler(|err, _request| ApplicationError::new(ErrorType::InvalidData, format!("Invalid request body: {err}")).into())
}

/**
 * Query extractor configuration reporting malformed query strings as `INVALID_DATA`.
 */
pub fn query_config() -> web::QueryConfig {
    web::QueryConfig::default().error_handler(|err, _request| ApplicationError::new(ErrorType::InvalidData, format!("Invalid query: {err}")).into())
}
