pub mod gemini;
#[cfg(test)]
pub mod scripted;

use std::pin::Pin;

use futures_util::Stream;

use crate::{model::apperror::ApplicationError, utils::image::DecodedImage};

/**
 * Finite, non-restartable sequence of text fragments produced by a streamed oracle answer.
 */
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, ApplicationError>> + Send>>;

/**
 * Instruction sent together with the meter photograph.
 */
pub const READING_PROMPT: &str = "Analyze the provided image and identify the value shown on the meter. \
The meter can be a water meter or a gas meter. Please provide the numeric value visible on the meter. \
If the value is not visible, state that clearly.";

/**
 * External image understanding service converting a meter photograph into text.
 */
#[async_trait::async_trait]
pub trait RecognitionOracle: Send + Sync {
    /**
     * Stores the image in the oracle's file store.
     *
     * # Arguments
     * `image`: The decoded image.
     * `display_name`: Name the image is stored under.
     *
     * # Returns
     * The url of the stored image or an `OracleError`.
     */
    async fn upload_image(&self, image: &DecodedImage, display_name: &str) -> Result<String, ApplicationError>;

    /**
     * Submits the image with a prompt and returns the streamed textual answer.
     *
     * # Returns
     * The answer as a stream of text fragments or an `OracleError` when the call could not be started.
     */
    async fn stream_reading(&self, prompt: &str, image: &DecodedImage) -> Result<TextStream, ApplicationError>;
}
