use std::{str::FromStr, sync::LazyLock};

use futures_util::{Stream, TryStreamExt};
use regex::Regex;
use rust_decimal::Decimal;
use tracing::debug;

use crate::model::apperror::{ApplicationError, ErrorType};

/**
 * One or more digits, optionally followed by a decimal point and more digits.
 */
static READING_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[0-9]+(\.[0-9]+)?").expect("reading pattern is a valid regex"));

/**
 * Parses the first number found in a text fragment.
 *
 * Readings are limited to what a `Decimal` holds (28 significant digits). When the first number of a
 * fragment has more integer digits than that, the fragment counts as holding no number, and an earlier
 * reading is kept.
 *
 * # Returns
 * The number, or `None` when the fragment holds no number that fits a `Decimal`.
 */
pub fn first_number(text: &str) -> Option<Decimal> {
    let found = READING_PATTERN.find(text)?;
    Decimal::from_str(found.as_str()).ok()
}

/**
 * Consumes a streamed oracle answer to completion and returns the reading.
 * The first number of each fragment is taken; the last fragment holding a number wins.
 *
 * # Arguments
 * `fragments`: The streamed text fragments.
 *
 * # Returns
 * The reading, `ExtractionFailed` when no fragment holds a number, or the error carried by the stream.
 */
pub async fn extract_measure_value<S>(fragments: S) -> Result<Decimal, ApplicationError>
where
    S: Stream<Item = Result<String, ApplicationError>>,
{
    let value = fragments
        .try_fold(None, |value, fragment| async move {
            let extracted = first_number(&fragment);
            debug!("Fragment {:?} gave {:?}", fragment, extracted);
            Ok(extracted.or(value))
        })
        .await?;
    value.ok_or_else(|| ApplicationError::new(ErrorType::ExtractionFailed, "Could not extract a measure value from the image".to_string()))
}
