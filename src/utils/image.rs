use base64::{Engine, engine::general_purpose};
use chrono::NaiveDate;

use crate::model::apperror::{ApplicationError, ErrorType};

/**
 * Prefix every accepted image payload starts with.
 */
const IMAGE_DATA_URL_PREFIX: &str = "data:image/";

/**
 * Separator between the media type and the encoded image.
 */
const BASE64_MARKER: &str = ";base64,";

/**
 * Raw image bytes together with their media type.
 */
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage {
    /**
     * Media type, e.g. `image/png`.
     */
    pub media_type: String,
    pub bytes: Vec<u8>,
}

impl DecodedImage {
    /**
     * File extension derived from the media type subtype.
     */
    pub fn extension(&self) -> &str {
        self.media_type.split('/').nth(1).unwrap_or("png")
    }
}

/**
 * Decodes an image data url of the form `data:image/<subtype>;base64,<data>`.
 *
 * # Arguments
 * `payload`: The encoded image.
 *
 * # Returns
 * The decoded image, `InvalidImageType` when the payload is not an image data url and `InvalidData` when the data is not valid base64.
 */
pub fn decode_image(payload: &str) -> Result<DecodedImage, ApplicationError> {
    let Some(rest) = payload.strip_prefix(IMAGE_DATA_URL_PREFIX) else {
        return Err(ApplicationError::new(ErrorType::InvalidImageType, "Image must be a base64 encoded image data url".to_string()));
    };
    let Some((subtype, data)) = rest.split_once(BASE64_MARKER) else {
        return Err(ApplicationError::new(ErrorType::InvalidImageType, "Image must be a base64 encoded image data url".to_string()));
    };
    if subtype.is_empty() || !subtype.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '-')) {
        return Err(ApplicationError::new(ErrorType::InvalidImageType, format!("Unsupported image type image/{subtype}")));
    }
    let bytes = general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|err| ApplicationError::new(ErrorType::InvalidData, format!("Image must be a base64 string: {err}")))?;
    if bytes.is_empty() {
        return Err(ApplicationError::new(ErrorType::InvalidData, "Image is empty".to_string()));
    }
    Ok(DecodedImage { media_type: format!("image/{subtype}"), bytes })
}

/**
 * Encodes image bytes as standard base64 for transfer to the oracle.
 */
pub fn encode_image(image: &DecodedImage) -> String {
    general_purpose::STANDARD.encode(&image.bytes)
}

/**
 * Display name of an uploaded image: `<customer_code>-<YYYY-MM-DD>.<extension>`.
 */
pub fn image_file_name(customer_code: &str, image: &DecodedImage, date: NaiveDate) -> String {
    format!("{customer_code}-{}.{}", date.format("%Y-%m-%d"), image.extension())
}
