use std::{fmt, str::FromStr};

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::{
    api::rest::{ConfirmMeasureRequest, ListMeasuresQuery, UploadMeasureRequest},
    model::apperror::{ApplicationError, ErrorType},
    utils::image::{DecodedImage, decode_image},
};

/**
 * Kind of utility meter a reading belongs to.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeasureType {
    Water,
    Gas,
}

impl MeasureType {
    /**
     * Stored and transferred representation.
     */
    pub fn as_str(&self) -> &'static str {
        match self {
            MeasureType::Water => "WATER",
            MeasureType::Gas => "GAS",
        }
    }

    /**
     * Parses a measure type ignoring case, as used by the list filter.
     *
     * # Returns
     * The measure type or an `InvalidType` error.
     */
    pub fn from_filter(value: &str) -> Result<Self, ApplicationError> {
        MeasureType::from_str(&value.to_uppercase()).map_err(|_| ApplicationError::new(ErrorType::InvalidType, format!("Measure type {value} is not allowed")))
    }
}

impl FromStr for MeasureType {
    type Err = ApplicationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "WATER" => Ok(MeasureType::Water),
            "GAS" => Ok(MeasureType::Gas),
            _ => Err(ApplicationError::new(ErrorType::InvalidData, "Measure type must be WATER or GAS".to_string())),
        }
    }
}

impl fmt::Display for MeasureType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/**
 * A persisted meter reading.
 */
#[derive(Debug, Clone, PartialEq)]
pub struct Measure {
    pub uuid: Uuid,
    pub customer_code: String,
    /**
     * Date and time of the physical reading, not the time of upload.
     */
    pub measure_datetime: DateTime<Utc>,
    pub measure_type: MeasureType,
    pub measure_value: Decimal,
    pub image_url: String,
    pub has_confirmed: bool,
}

impl Measure {
    /**
     * Creates a new unconfirmed measure with a fresh identity.
     */
    pub fn new(customer_code: String, measure_datetime: DateTime<Utc>, measure_type: MeasureType, measure_value: Decimal, image_url: String) -> Self {
        Measure { uuid: Uuid::new_v4(), customer_code, measure_datetime, measure_type, measure_value, image_url, has_confirmed: false }
    }
}

/**
 * Validated input for uploading a new reading.
 */
#[derive(Debug, Clone)]
pub struct UploadMeasureInputType {
    pub image: DecodedImage,
    pub customer_code: String,
    pub measure_datetime: DateTime<Utc>,
    pub measure_type: MeasureType,
}

impl UploadMeasureInputType {
    /**
     * Validates an upload request.
     *
     * # Arguments
     * `request`: The raw upload request.
     * `offset`: Offset of the service clock, used for datetimes without an offset.
     *
     * # Returns
     * The validated input, `InvalidData` when a field is missing or malformed and `InvalidImageType` when the image is not an image data url.
     */
    pub fn validate(request: UploadMeasureRequest, offset: FixedOffset) -> Result<Self, ApplicationError> {
        let image = required("image", request.image)?;
        let customer_code = required("customer_code", request.customer_code)?;
        let measure_datetime = required("measure_datetime", request.measure_datetime)?;
        let measure_type = required("measure_type", request.measure_type)?;

        let measure_type = MeasureType::from_str(&measure_type)?;
        let measure_datetime = parse_measure_datetime(&measure_datetime, offset)?;
        let image = decode_image(&image)?;
        Ok(UploadMeasureInputType { image, customer_code, measure_datetime, measure_type })
    }
}

/**
 * Output of a successful upload.
 */
#[derive(Debug, Clone, PartialEq)]
pub struct UploadMeasureOutputType {
    pub measure_uuid: Uuid,
    pub measure_value: Decimal,
    pub image_url: String,
}

impl From<Measure> for UploadMeasureOutputType {
    fn from(measure: Measure) -> Self {
        UploadMeasureOutputType { measure_uuid: measure.uuid, measure_value: measure.measure_value, image_url: measure.image_url }
    }
}

/**
 * Validated input for confirming a reading.
 */
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmMeasureInputType {
    pub measure_uuid: Uuid,
    pub confirmed_value: i64,
}

impl ConfirmMeasureInputType {
    /**
     * Validates a confirm request.
     *
     * # Returns
     * The validated input or `InvalidData`.
     */
    pub fn validate(request: ConfirmMeasureRequest) -> Result<Self, ApplicationError> {
        let measure_uuid = required("measure_uuid", request.measure_uuid)?;
        let measure_uuid = Uuid::parse_str(&measure_uuid).map_err(|err| ApplicationError::new(ErrorType::InvalidData, format!("Measure UUID must be a valid UUID: {err}")))?;
        let Some(confirmed_value) = request.confirmed_value else {
            return Err(ApplicationError::new(ErrorType::InvalidData, "Missing field confirmed_value".to_string()));
        };
        let Some(confirmed_value) = integer_value(&confirmed_value) else {
            return Err(ApplicationError::new(ErrorType::InvalidData, "Confirmed value must be an integer".to_string()));
        };
        Ok(ConfirmMeasureInputType { measure_uuid, confirmed_value })
    }
}

/**
 * Integer held by a json number. Floats without a fractional part, like `130.0`, count as integers.
 */
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn integer_value(value: &serde_json::Value) -> Option<i64> {
    let number = value.as_number()?;
    number.as_i64().or_else(|| number.as_f64().filter(|float| float.fract() == 0.0 && *float >= i64::MIN as f64 && *float < i64::MAX as f64).map(|float| float as i64))
}

/**
 * Input for listing the readings of a customer.
 */
#[derive(Debug, Clone, PartialEq)]
pub struct MeasureListInputType {
    pub customer_code: String,
    /**
     * Raw type filter, checked by the listing stage.
     */
    pub measure_type: Option<String>,
}

impl MeasureListInputType {
    pub fn validate(customer_code: String, query: ListMeasuresQuery) -> Result<Self, ApplicationError> {
        let customer_code = required("customer_code", Some(customer_code))?;
        let measure_type = query.measure_type.filter(|value| !value.is_empty());
        Ok(MeasureListInputType { customer_code, measure_type })
    }
}

/**
 * A listed reading. The value is not part of the listing.
 */
#[derive(Debug, Clone, PartialEq)]
pub struct MeasureListElementType {
    pub measure_uuid: Uuid,
    pub measure_datetime: DateTime<Utc>,
    pub measure_type: MeasureType,
    pub has_confirmed: bool,
    pub image_url: String,
}

impl From<Measure> for MeasureListElementType {
    fn from(measure: Measure) -> Self {
        MeasureListElementType {
            measure_uuid: measure.uuid,
            measure_datetime: measure.measure_datetime,
            measure_type: measure.measure_type,
            has_confirmed: measure.has_confirmed,
            image_url: measure.image_url,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeasureListOutputType {
    pub customer_code: String,
    pub measures: Vec<MeasureListElementType>,
}

impl MeasureListOutputType {
    pub fn new(customer_code: String, measures: Vec<MeasureListElementType>) -> Self {
        MeasureListOutputType { customer_code, measures }
    }
}

/**
 * Returns the trimmed value of a required field or an `InvalidData` error when it is missing or empty.
 */
fn required(field: &str, value: Option<String>) -> Result<String, ApplicationError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(ApplicationError::new(ErrorType::InvalidData, format!("Missing field {field}"))),
    }
}

/**
 * Parses an ISO-8601 datetime. Values without an offset are interpreted in the service offset.
 * Offsets may be written as `Z`, `+03:00`, `+0300` or `+03`, and seconds may be left out.
 *
 * # Arguments
 * `value`: Datetime as text, e.g. `2024-08-28T10:00:00Z`, `2024-08-28T10:00+0300`, `2024-08-28T10:00:00` or `2024-08-28`.
 * `offset`: Offset of the service clock.
 */
pub fn parse_measure_datetime(value: &str, offset: FixedOffset) -> Result<DateTime<Utc>, ApplicationError> {
    let with_offset = DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%#z"))
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M%#z"));
    if let Ok(datetime) = with_offset {
        return Ok(datetime.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M"))
        .or_else(|_| NaiveDate::parse_from_str(value, "%Y-%m-%d").map(|date| date.and_time(chrono::NaiveTime::MIN)))
        .map_err(|err| ApplicationError::new(ErrorType::InvalidData, format!("Measure datetime must be a valid datetime: {err}")))?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|datetime| datetime.with_timezone(&Utc))
        .ok_or_else(|| ApplicationError::new(ErrorType::InvalidData, "Measure datetime must be a valid datetime".to_string()))
}
