use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::stream;

use crate::{
    model::apperror::{ApplicationError, ErrorType},
    oracle::{RecognitionOracle, TextStream},
    utils::image::DecodedImage,
};

/**
 * Oracle answering with a fixed list of text fragments.
 */
#[derive(Default)]
pub struct ScriptedOracle {
    fragments: Vec<String>,
    fail_upload: bool,
    fail_stream: bool,
    calls: AtomicUsize,
}

impl ScriptedOracle {
    pub fn answering(fragments: &[&str]) -> Self {
        ScriptedOracle { fragments: fragments.iter().map(|fragment| fragment.to_string()).collect(), ..Default::default() }
    }

    pub fn failing_upload() -> Self {
        ScriptedOracle { fail_upload: true, ..Default::default() }
    }

    pub fn failing_stream() -> Self {
        ScriptedOracle { fail_stream: true, ..Default::default() }
    }

    /**
     * Number of calls made against the oracle.
     */
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl RecognitionOracle for ScriptedOracle {
    async fn upload_image(&self, _image: &DecodedImage, display_name: &str) -> Result<String, ApplicationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_upload {
            return Err(ApplicationError::new(ErrorType::OracleError, "Failed to upload image: status 403".to_string()));
        }
        Ok(format!("https://files.example/{display_name}"))
    }

    async fn stream_reading(&self, _prompt: &str, _image: &DecodedImage) -> Result<TextStream, ApplicationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_stream {
            return Err(ApplicationError::new(ErrorType::OracleError, "Recognition api call failed: status 429".to_string()));
        }
        Ok(Box::pin(stream::iter(self.fragments.clone().into_iter().map(Ok))))
    }
}
