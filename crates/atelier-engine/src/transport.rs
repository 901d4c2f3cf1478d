use std::io::BufReader;
use std::time::Duration;

use atelier_contracts::ServiceConfig;
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, COOKIE, ORIGIN, REFERER, USER_AGENT,
};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{truncate_text, EngineError, EngineResult};
use crate::request::CompletionRequest;
use crate::stream::{CompletionResult, StreamDecoder};

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// What the upload endpoint hands back for a stored file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UploadedImage {
    pub image_key: String,
    pub main_url: Option<String>,
    /// Present when the service also cut out the foreground.
    pub mask_url: Option<String>,
    pub mask: Option<String>,
    pub without_background: bool,
}

/// Remote side of every operation. Implementations never retry.
pub trait ServiceTransport: Send + Sync {
    fn name(&self) -> &str;

    fn complete(&self, request: &CompletionRequest) -> EngineResult<CompletionResult>;

    fn upload(&self, image: &[u8]) -> EngineResult<UploadedImage>;

    fn download(&self, url: &str) -> EngineResult<Vec<u8>>;
}

pub struct HttpTransport {
    http: HttpClient,
    config: ServiceConfig,
}

impl HttpTransport {
    pub fn new(config: &ServiceConfig) -> EngineResult<Self> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            http,
            config: config.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.api_base.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn headers(&self) -> HeaderMap {
        let base = self.config.api_base.trim_end_matches('/');
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        insert_header(&mut headers, ORIGIN, base);
        insert_header(&mut headers, REFERER, &format!("{base}/chat/"));
        if !self.config.auth.cookie.trim().is_empty() {
            insert_header(&mut headers, COOKIE, self.config.auth.cookie.trim());
        }
        if !self.config.auth.x_flow_trace.trim().is_empty() {
            insert_header(
                &mut headers,
                HeaderName::from_static("x-flow-trace"),
                self.config.auth.x_flow_trace.trim(),
            );
        }
        for (key, value) in &self.config.headers {
            match HeaderName::from_bytes(key.as_bytes()) {
                Ok(name) => insert_header(&mut headers, name, value),
                Err(_) => tracing::warn!(header = %key, "ignoring invalid header name"),
            }
        }
        headers
    }

    fn query(&self) -> Vec<(String, String)> {
        let mut query: Vec<(String, String)> = self
            .config
            .query
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let auth = &self.config.auth;
        if !auth.ms_token.trim().is_empty() {
            query.push(("msToken".to_string(), auth.ms_token.trim().to_string()));
        }
        if !auth.a_bogus.trim().is_empty() {
            query.push(("a_bogus".to_string(), auth.a_bogus.trim().to_string()));
        }
        query
    }
}

impl ServiceTransport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    fn complete(&self, request: &CompletionRequest) -> EngineResult<CompletionResult> {
        let endpoint = self.endpoint(&self.config.completion_path);
        tracing::debug!(
            transport = self.name(),
            %endpoint,
            conversation_id = %request.conversation_id,
            "sending completion"
        );
        let response = self
            .http
            .post(&endpoint)
            .headers(self.headers())
            .header(ACCEPT, "text/event-stream")
            .query(&self.query())
            .json(request)
            .send()?;
        let response = ensure_success("completion", response)?;
        StreamDecoder::decode(BufReader::new(response))
    }

    fn upload(&self, image: &[u8]) -> EngineResult<UploadedImage> {
        let endpoint = self.endpoint(&self.config.upload_path);
        let digest = hex::encode(Sha256::digest(image));
        let (mime, extension) = sniff_image(image);
        let part = MultipartPart::bytes(image.to_vec())
            .file_name(format!("{}.{extension}", &digest[..16]))
            .mime_str(mime)?;
        let form = MultipartForm::new()
            .text("sha256", digest.clone())
            .part("file", part);
        tracing::debug!(%endpoint, bytes = image.len(), sha256 = %digest, "uploading image");
        let response = self
            .http
            .post(&endpoint)
            .headers(self.headers())
            .query(&self.query())
            .multipart(form)
            .send()?;
        let payload = response_json_or_error("upload", response)?;
        parse_upload_response(&payload)
    }

    fn download(&self, url: &str) -> EngineResult<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .header(USER_AGENT, BROWSER_USER_AGENT)
            .send()?;
        let response = ensure_success("download", response)?;
        Ok(response.bytes()?.to_vec())
    }
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => tracing::warn!(header = %name, "ignoring header with invalid value"),
    }
}

fn sniff_image(bytes: &[u8]) -> (&'static str, &'static str) {
    match image::guess_format(bytes) {
        Ok(image::ImageFormat::Jpeg) => ("image/jpeg", "jpg"),
        Ok(image::ImageFormat::WebP) => ("image/webp", "webp"),
        Ok(image::ImageFormat::Gif) => ("image/gif", "gif"),
        _ => ("image/png", "png"),
    }
}

fn ensure_success(what: &str, response: HttpResponse) -> EngineResult<HttpResponse> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(EngineError::transport(format!(
        "{what} request failed ({}): {}",
        status.as_u16(),
        truncate_text(&body, 512)
    )))
}

fn response_json_or_error(what: &str, response: HttpResponse) -> EngineResult<Value> {
    let response = ensure_success(what, response)?;
    let body = response.text()?;
    serde_json::from_str(&body).map_err(|err| {
        EngineError::protocol(format!(
            "{what} response is not JSON ({err}): {}",
            truncate_text(&body, 256)
        ))
    })
}

/// Field names have drifted between service versions, so several spellings
/// are accepted.
pub fn parse_upload_response(payload: &Value) -> EngineResult<UploadedImage> {
    if let Some(code) = payload.get("code").and_then(Value::as_i64) {
        if code != 0 {
            let message = payload
                .get("msg")
                .or_else(|| payload.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("no message");
            return Err(EngineError::protocol(format!(
                "upload rejected with code {code}: {message}"
            )));
        }
    }
    let data = payload.get("data").unwrap_or(payload);
    let file_info = data.get("file_info");
    let field = |key: &str| -> Option<String> {
        file_info
            .and_then(|info| info.get(key))
            .or_else(|| data.get(key))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    let image_key = field("image_key")
        .or_else(|| field("key"))
        .or_else(|| field("uri"))
        .ok_or_else(|| EngineError::protocol("upload response carried no image key"))?;
    Ok(UploadedImage {
        image_key,
        main_url: field("main_url").or_else(|| field("url")),
        mask_url: field("mask_url"),
        mask: field("mask"),
        without_background: data
            .get("without_background")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{HashMap, VecDeque};
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default)]
    struct MockState {
        completions: VecDeque<EngineResult<String>>,
        requests: Vec<CompletionRequest>,
        uploads: VecDeque<EngineResult<UploadedImage>>,
        uploaded: Vec<Vec<u8>>,
        downloads: HashMap<String, Vec<u8>>,
    }

    /// Scripted transport. Completion bodies are raw event streams so every
    /// call also runs through the real decoder.
    #[derive(Clone, Default)]
    pub struct MockTransport {
        state: Arc<Mutex<MockState>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_stream(&self, body: String) {
            self.lock().completions.push_back(Ok(body));
        }

        pub fn push_completion_failure(&self, message: &str) {
            self.lock()
                .completions
                .push_back(Err(EngineError::transport(message)));
        }

        pub fn push_upload(&self, uploaded: UploadedImage) {
            self.lock().uploads.push_back(Ok(uploaded));
        }

        pub fn serve(&self, url: &str, bytes: Vec<u8>) {
            self.lock().downloads.insert(url.to_string(), bytes);
        }

        pub fn requests(&self) -> Vec<CompletionRequest> {
            self.lock().requests.clone()
        }

        pub fn upload_count(&self) -> usize {
            self.lock().uploaded.len()
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
            self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
        }
    }

    impl ServiceTransport for MockTransport {
        fn name(&self) -> &str {
            "mock"
        }

        fn complete(&self, request: &CompletionRequest) -> EngineResult<CompletionResult> {
            let next = {
                let mut state = self.lock();
                state.requests.push(request.clone());
                state.completions.pop_front()
            };
            match next {
                Some(Ok(body)) => StreamDecoder::decode(Cursor::new(body.into_bytes())),
                Some(Err(err)) => Err(err),
                None => Err(EngineError::transport("no scripted completion")),
            }
        }

        fn upload(&self, image: &[u8]) -> EngineResult<UploadedImage> {
            let mut state = self.lock();
            state.uploaded.push(image.to_vec());
            state
                .uploads
                .pop_front()
                .unwrap_or_else(|| Err(EngineError::transport("no scripted upload")))
        }

        fn download(&self, url: &str) -> EngineResult<Vec<u8>> {
            self.lock()
                .downloads
                .get(url)
                .cloned()
                .ok_or_else(|| EngineError::transport(format!("404 for {url}")))
        }
    }
}
