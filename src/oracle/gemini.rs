use std::{fmt, time::Duration};

use futures_util::{Stream, StreamExt, stream};
use serde::Deserialize;
use tracing::{Instrument, debug, instrument, warn};

use crate::{
    model::{
        apperror::{ApplicationError, ErrorType},
        config::OracleConfig,
    },
    oracle::{RecognitionOracle, TextStream},
    utils::image::{DecodedImage, encode_image},
};

/**
 * Environment variable holding the api key when it is not part of the configuration.
 */
const API_KEY_ENV: &str = "GEMINI_API_KEY";

/**
 * Header returned by the resumable upload start request.
 */
const UPLOAD_URL_HEADER: &str = "x-goog-upload-url";

/**
 * One chunk of a streamed generate content answer.
 */
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    file: UploadedFile,
}

#[derive(Debug, Deserialize)]
struct UploadedFile {
    uri: String,
}

/**
 * Recognition oracle backed by the Gemini generative language api.
 */
pub struct GeminiOracle {
    http_client: reqwest::Client,
    base_url: String,
    upload_url: String,
    model: String,
    api_key: String,
}

impl GeminiOracle {
    /**
     * Creates a new Gemini client.
     *
     * # Arguments
     * `config`: Oracle configuration. The api key falls back to the `GEMINI_API_KEY` environment variable.
     *
     * # Returns
     * The client or an `Initialization` error.
     */
    pub fn new(config: &OracleConfig) -> Result<Self, ApplicationError> {
        let Some(api_key) = config.api_key.clone().or_else(|| std::env::var(API_KEY_ENV).ok()) else {
            return Err(ApplicationError::new(ErrorType::Initialization, format!("No oracle api key configured and {API_KEY_ENV} is not set")));
        };
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| ApplicationError::new(ErrorType::Initialization, format!("Failed to create oracle http client: {err}")))?;
        Ok(GeminiOracle {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            upload_url: config.upload_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
        })
    }
}

#[async_trait::async_trait]
impl RecognitionOracle for GeminiOracle {
    #[instrument(skip(self, image), fields(media_type = %image.media_type, size = image.bytes.len()))]
    async fn upload_image(&self, image: &DecodedImage, display_name: &str) -> Result<String, ApplicationError> {
        let span = tracing::Span::current();
        let start_response = self
            .http_client
            .post(format!("{}/files", self.upload_url))
            .query(&[("key", self.api_key.as_str())])
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", image.bytes.len().to_string())
            .header("X-Goog-Upload-Header-Content-Type", image.media_type.as_str())
            .json(&serde_json::json!({ "file": { "display_name": display_name } }))
            .send()
            .instrument(span.clone())
            .await
            .map_err(|err| oracle_error("Failed to start image upload", err))?;
        let start_response = error_for_status(start_response, "Failed to start image upload").await?;
        let Some(session_url) = start_response.headers().get(UPLOAD_URL_HEADER).and_then(|value| value.to_str().ok()).map(str::to_string) else {
            return Err(ApplicationError::new(ErrorType::OracleError, "Image upload did not return an upload url".to_string()));
        };

        let upload_response = self
            .http_client
            .post(session_url)
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(image.bytes.clone())
            .send()
            .instrument(span.clone())
            .await
            .map_err(|err| oracle_error("Failed to upload image", err))?;
        let upload_response = error_for_status(upload_response, "Failed to upload image").await?;
        let uploaded: UploadResponse = upload_response.json().instrument(span).await.map_err(|err| oracle_error("Image upload returned no file url", err))?;
        debug!("Image {} stored as {}", display_name, uploaded.file.uri);
        Ok(uploaded.file.uri)
    }

    #[instrument(skip(self, prompt, image), fields(model = %self.model, media_type = %image.media_type))]
    async fn stream_reading(&self, prompt: &str, image: &DecodedImage) -> Result<TextStream, ApplicationError> {
        let span = tracing::Span::current();
        let request_body = serde_json::json!({
            "contents": [{
                "parts": [
                    { "text": prompt },
                    { "inline_data": { "mime_type": image.media_type, "data": encode_image(image) } }
                ]
            }]
        });
        let response = self
            .http_client
            .post(format!("{}/models/{}:streamGenerateContent", self.base_url, self.model))
            .query(&[("alt", "sse"), ("key", self.api_key.as_str())])
            .json(&request_body)
            .send()
            .instrument(span)
            .await
            .map_err(|err| oracle_error("Failed to call recognition api", err))?;
        let response = error_for_status(response, "Recognition api call failed").await?;
        Ok(sse_text_stream(response.bytes_stream()))
    }
}

/**
 * Maps a transport failure to an `OracleError`.
 */
fn oracle_error(context: &str, err: impl fmt::Display) -> ApplicationError {
    warn!("{context}: {err}");
    ApplicationError::new(ErrorType::OracleError, format!("{context}: {err}"))
}

/**
 * Returns the response when its status is a success, otherwise an `OracleError` containing the response body.
 */
async fn error_for_status(response: reqwest::Response, context: &str) -> Result<reqwest::Response, ApplicationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(oracle_error(context, format!("status {status}: {body}")))
}

/**
 * State of the server-sent event decoder.
 */
struct SseState<S> {
    bytes: std::pin::Pin<Box<S>>,
    buffer: Vec<u8>,
    finished: bool,
}

impl<S> SseState<S> {
    /**
     * Removes complete lines from the buffer until a data line is found.
     * When the byte stream is finished a trailing line without newline is taken as well.
     */
    fn next_data(&mut self) -> Option<String> {
        loop {
            let line = match self.buffer.iter().position(|byte| *byte == b'\n') {
                Some(position) => self.buffer.drain(..=position).collect::<Vec<u8>>(),
                None if self.finished && !self.buffer.is_empty() => std::mem::take(&mut self.buffer),
                None => return None,
            };
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() && data != "[DONE]" {
                    return Some(data.to_string());
                }
            }
        }
    }
}

/**
 * Turns a server-sent event byte stream into the stream of text fragments carried by its data lines.
 */
fn sse_text_stream<S, B, E>(bytes: S) -> TextStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let state = SseState { bytes: Box::pin(bytes), buffer: Vec::new(), finished: false };
    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(data) = state.next_data() {
                return Some((parse_chunk_text(&data), state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(err)) => {
                    state.finished = true;
                    state.buffer.clear();
                    return Some((Err(oracle_error("Recognition answer interrupted", err)), state));
                }
                None => state.finished = true,
            }
        }
    }))
}

/**
 * Extracts the text of one streamed chunk.
 */
fn parse_chunk_text(data: &str) -> Result<String, ApplicationError> {
    let chunk: StreamChunk = serde_json::from_str(data).map_err(|err| oracle_error("Malformed recognition answer", err))?;
    if let Some(error) = chunk.error {
        return Err(ApplicationError::new(ErrorType::OracleError, format!("Recognition api error: {}", error.message)));
    }
    let text: String = chunk
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .map(|content| content.parts.into_iter().filter_map(|part| part.text).collect())
        .unwrap_or_default();
    debug!("Recognition chunk: {}", text);
    Ok(text)
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use actix_web::{App, HttpRequest, HttpResponse, HttpServer, web};
    use rust_decimal::Decimal;

    use super::*;
    use crate::{oracle::READING_PROMPT, service::extraction::extract_measure_value};

    fn sse_event(text: &str) -> String {
        format!("data: {}\r\n\r\n", serde_json::json!({ "candidates": [{ "content": { "parts": [{ "text": text }] } }] }))
    }

    #[test]
    fn test_parse_chunk_text_joins_parts() {
        let data = r#"{"candidates":[{"content":{"parts":[{"text":"reading: "},{"text":"123"}]}}]}"#;
        assert_eq!(parse_chunk_text(data).unwrap(), "reading: 123");
    }

    #[test]
    fn test_parse_chunk_text_without_candidates() {
        assert_eq!(parse_chunk_text(r#"{"usageMetadata":{}}"#).unwrap(), "");
    }

    #[test]
    fn test_parse_chunk_text_errors() {
        let err = parse_chunk_text(r#"{"error":{"message":"quota exceeded"}}"#).unwrap_err();
        assert_eq!(err.error_type, ErrorType::OracleError);
        let err = parse_chunk_text("not json").unwrap_err();
        assert_eq!(err.error_type, ErrorType::OracleError);
    }

    #[actix_web::test]
    async fn test_sse_stream_split_over_chunks() {
        let body = format!("{}{}", sse_event("The meter shows"), sse_event(" 00123.4"));
        let (first, second) = body.as_bytes().split_at(17);
        let bytes = stream::iter(vec![Ok::<_, String>(first.to_vec()), Ok(second.to_vec())]);
        let texts: Vec<String> = sse_text_stream(bytes).map(|item| item.unwrap()).collect().await;
        assert_eq!(texts, vec!["The meter shows".to_string(), " 00123.4".to_string()]);
    }

    #[actix_web::test]
    async fn test_sse_stream_trailing_line_without_newline() {
        let body = sse_event("42");
        let body = body.trim_end().to_string();
        let bytes = stream::iter(vec![Ok::<_, String>(body.into_bytes())]);
        let texts: Vec<String> = sse_text_stream(bytes).map(|item| item.unwrap()).collect().await;
        assert_eq!(texts, vec!["42".to_string()]);
    }

    #[actix_web::test]
    async fn test_sse_stream_transport_error() {
        let bytes = stream::iter(vec![Ok(sse_event("12").into_bytes()), Err("connection reset".to_string())]);
        let items: Vec<Result<String, ApplicationError>> = sse_text_stream(bytes).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "12");
        assert_eq!(items[1].as_ref().unwrap_err().error_type, ErrorType::OracleError);
    }

    #[test]
    fn test_new_with_configured_api_key() {
        let oracle = GeminiOracle::new(&oracle_config("http://localhost/", Some("key"))).unwrap();
        assert_eq!(oracle.base_url, "http://localhost/v1beta");
        assert_eq!(oracle.upload_url, "http://localhost/upload");
        assert_eq!(oracle.api_key, "key");
    }

    #[test]
    fn test_new_without_api_key_fails() {
        // SAFETY: no other test reads or writes the variable
        unsafe { std::env::remove_var(API_KEY_ENV) };
        let err = GeminiOracle::new(&oracle_config("http://localhost", None)).err().unwrap();
        assert_eq!(err.error_type, ErrorType::Initialization);
    }

    #[actix_web::test]
    async fn test_upload_image_returns_file_uri() {
        let server_url = spawn_server(gemini_routes);
        let oracle = GeminiOracle::new(&oracle_config(&server_url, Some(API_KEY))).unwrap();
        let image_url = oracle.upload_image(&image(), "CUST-1-2024-08-28.png").await.unwrap();
        assert_eq!(image_url, "https://files.test/meter.png");
    }

    #[actix_web::test]
    async fn test_upload_image_without_session_url() {
        let server_url = spawn_server(no_session_routes);
        let oracle = GeminiOracle::new(&oracle_config(&server_url, Some(API_KEY))).unwrap();
        let err = oracle.upload_image(&image(), "CUST-1-2024-08-28.png").await.unwrap_err();
        assert_eq!(err.error_type, ErrorType::OracleError);
    }

    #[actix_web::test]
    async fn test_forbidden_responses_are_oracle_errors() {
        let server_url = spawn_server(forbidden_routes);
        let oracle = GeminiOracle::new(&oracle_config(&server_url, Some(API_KEY))).unwrap();
        let err = oracle.upload_image(&image(), "CUST-1-2024-08-28.png").await.unwrap_err();
        assert_eq!(err.error_type, ErrorType::OracleError);
        assert!(err.message.contains("403"));
        let err = oracle.stream_reading(READING_PROMPT, &image()).await.err().unwrap();
        assert_eq!(err.error_type, ErrorType::OracleError);
    }

    #[actix_web::test]
    async fn test_unreachable_oracle_is_oracle_error() {
        let oracle = GeminiOracle::new(&oracle_config("http://127.0.0.1:1", Some(API_KEY))).unwrap();
        let err = oracle.upload_image(&image(), "CUST-1-2024-08-28.png").await.unwrap_err();
        assert_eq!(err.error_type, ErrorType::OracleError);
    }

    #[actix_web::test]
    async fn test_stream_reading_feeds_extraction() {
        let server_url = spawn_server(gemini_routes);
        let oracle = GeminiOracle::new(&oracle_config(&server_url, Some(API_KEY))).unwrap();
        let fragments = oracle.stream_reading(READING_PROMPT, &image()).await.unwrap();
        let value = extract_measure_value(fragments).await.unwrap();
        assert_eq!(value, Decimal::new(4567, 1));
    }

    /***************** Local Gemini server *********************/

    const API_KEY: &str = "test-key";
    const IMAGE_BYTES: [u8; 4] = [137, 80, 78, 71];

    fn image() -> DecodedImage {
        DecodedImage { media_type: "image/png".to_string(), bytes: IMAGE_BYTES.to_vec() }
    }

    fn oracle_config(server_url: &str, api_key: Option<&str>) -> OracleConfig {
        let server_url = server_url.trim_end_matches('/');
        OracleConfig {
            base_url: format!("{server_url}/v1beta"),
            upload_url: format!("{server_url}/upload"),
            model: "gemini-1.5-flash".to_string(),
            api_key: api_key.map(str::to_string),
            timeout_secs: 5,
        }
    }

    fn spawn_server(routes: fn(&mut web::ServiceConfig)) -> String {
        let server = HttpServer::new(move || App::new().configure(routes)).workers(1).disable_signals().bind(("127.0.0.1", 0)).unwrap();
        let address = server.addrs()[0];
        actix_web::rt::spawn(server.run());
        format!("http://{address}")
    }

    fn header<'a>(http_request: &'a HttpRequest, name: &str) -> Option<&'a str> {
        http_request.headers().get(name).and_then(|value| value.to_str().ok())
    }

    async fn start_upload(http_request: HttpRequest, query: web::Query<HashMap<String, String>>, body: web::Json<serde_json::Value>) -> HttpResponse {
        if query.get("key").map(String::as_str) != Some(API_KEY)
            || header(&http_request, "X-Goog-Upload-Command") != Some("start")
            || header(&http_request, "X-Goog-Upload-Header-Content-Type") != Some("image/png")
            || body["file"]["display_name"] != "CUST-1-2024-08-28.png"
        {
            return HttpResponse::BadRequest().finish();
        }
        let session_url = format!("http://{}/upload/session", http_request.connection_info().host());
        HttpResponse::Ok().insert_header((UPLOAD_URL_HEADER, session_url)).finish()
    }

    async fn finalize_upload(http_request: HttpRequest, body: web::Bytes) -> HttpResponse {
        if header(&http_request, "X-Goog-Upload-Command") != Some("upload, finalize") || body[..] != IMAGE_BYTES {
            return HttpResponse::BadRequest().finish();
        }
        HttpResponse::Ok().json(serde_json::json!({ "file": { "name": "files/meter", "uri": "https://files.test/meter.png" } }))
    }

    async fn stream_answer(query: web::Query<HashMap<String, String>>, body: web::Json<serde_json::Value>) -> HttpResponse {
        let inline_data = &body["contents"][0]["parts"][1]["inline_data"];
        if query.get("alt").map(String::as_str) != Some("sse") || inline_data["mime_type"] != "image/png" || inline_data["data"] != encode_image(&image()) {
            return HttpResponse::BadRequest().finish();
        }
        HttpResponse::Ok().content_type("text/event-stream").body(format!("{}{}{}", sse_event("The meter shows"), sse_event(" 00456.7"), sse_event(" cubic meters.")))
    }

    async fn start_without_session() -> HttpResponse {
        HttpResponse::Ok().finish()
    }

    async fn forbidden() -> HttpResponse {
        HttpResponse::Forbidden().body("API key not valid")
    }

    fn gemini_routes(config: &mut web::ServiceConfig) {
        config
            .route("/upload/files", web::post().to(start_upload))
            .route("/upload/session", web::post().to(finalize_upload))
            .route("/v1beta/models/gemini-1.5-flash:streamGenerateContent", web::post().to(stream_answer));
    }

    fn no_session_routes(config: &mut web::ServiceConfig) {
        config.route("/upload/files", web::post().to(start_without_session));
    }

    fn forbidden_routes(config: &mut web::ServiceConfig) {
        config.route("/upload/files", web::post().to(forbidden)).route("/v1beta/models/gemini-1.5-flash:streamGenerateContent", web::post().to(forbidden));
    }
}
