//! Incremental decoder for the completion endpoint's event stream.
//!
//! The body is newline-delimited. Lines starting with `data:` carry a JSON
//! envelope whose `event_data` field is itself a JSON document encoded as a
//! string. Everything else (keep-alives, `event:` lines, blank separators) is
//! ignored, and a frame that cannot be parsed is skipped without aborting the
//! stream.

use std::io::{BufRead, ErrorKind};

use atelier_contracts::records::OutputImage;
use serde_json::Value;

use crate::error::{EngineError, EngineResult};

/// `message.content_type` of frames that carry generated images.
pub const IMAGE_RESULT_CONTENT_TYPE: u64 = 2010;

const DATA_PREFIX: &str = "data:";

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GeneratedImage {
    pub url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub description: Option<String>,
}

impl GeneratedImage {
    pub fn to_output(&self) -> OutputImage {
        OutputImage {
            width: self.width,
            height: self.height,
            description: self.description.clone().unwrap_or_default(),
            ..OutputImage::from_url(&self.url)
        }
    }
}

/// Everything one completion call produced, in stream order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompletionResult {
    pub images: Vec<GeneratedImage>,
    pub conversation_id: Option<String>,
    pub section_id: Option<String>,
    pub reply_id: Option<String>,
}

impl CompletionResult {
    pub fn urls(&self) -> Vec<String> {
        self.images.iter().map(|image| image.url.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn first_output(&self) -> Option<OutputImage> {
        self.images.first().map(GeneratedImage::to_output)
    }
}

#[derive(Debug, Default)]
pub struct StreamDecoder {
    result: CompletionResult,
    frames: usize,
    skipped: usize,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `reader` to EOF. Only a read failure aborts; malformed frames are
    /// counted and dropped.
    pub fn decode<R: BufRead>(mut reader: R) -> EngineResult<CompletionResult> {
        let mut decoder = Self::new();
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => decoder.feed_line(&line),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    return Err(EngineError::transport(format!(
                        "completion stream interrupted after {} frames: {err}",
                        decoder.frames
                    )))
                }
            }
        }
        Ok(decoder.finish())
    }

    pub fn feed_line(&mut self, raw: &[u8]) {
        let Ok(text) = std::str::from_utf8(raw) else {
            self.skip("line is not valid utf-8");
            return;
        };
        let Some(payload) = text.trim().strip_prefix(DATA_PREFIX) else {
            return;
        };
        self.frames += 1;
        if let Err(reason) = self.apply_frame(payload.trim()) {
            self.skip(&reason);
        }
    }

    pub fn finish(self) -> CompletionResult {
        tracing::debug!(
            frames = self.frames,
            skipped = self.skipped,
            images = self.result.images.len(),
            "completion stream decoded"
        );
        self.result
    }

    fn skip(&mut self, reason: &str) {
        self.skipped += 1;
        tracing::debug!(reason, "skipping completion frame");
    }

    fn apply_frame(&mut self, payload: &str) -> Result<(), String> {
        let envelope: Value =
            serde_json::from_str(payload).map_err(|err| format!("bad envelope: {err}"))?;
        let event_data = match envelope.get("event_data") {
            None | Some(Value::Null) => return Ok(()),
            Some(Value::String(raw)) => raw,
            Some(_) => return Err("event_data is not a string".to_string()),
        };
        let event: Value =
            serde_json::from_str(event_data).map_err(|err| format!("bad event_data: {err}"))?;
        let Some(event) = event.as_object() else {
            return Err("event_data is not an object".to_string());
        };

        if let Some(conversation_id) = event.get("conversation_id").and_then(id_field) {
            self.result.conversation_id = Some(conversation_id);
            if let Some(section_id) = event.get("section_id").and_then(id_field) {
                self.result.section_id = Some(section_id);
            }
            if let Some(reply_id) = event.get("reply_id").and_then(id_field) {
                self.result.reply_id = Some(reply_id);
            }
        }

        let Some(message) = event.get("message").and_then(Value::as_object) else {
            return Ok(());
        };
        if message.get("content_type").and_then(content_type) != Some(IMAGE_RESULT_CONTENT_TYPE) {
            return Ok(());
        }
        let content = match message.get("content") {
            Some(Value::String(raw)) => {
                serde_json::from_str(raw).map_err(|err| format!("bad image content: {err}"))?
            }
            Some(value @ Value::Object(_)) => value.clone(),
            _ => return Err("image message without content".to_string()),
        };
        let Some(entries) = content.get("data").and_then(Value::as_array) else {
            return Err("image content without data".to_string());
        };

        for entry in entries {
            let raw = entry.get("image_raw");
            let Some(url) = raw
                .and_then(|raw| raw.get("url"))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|url| !url.is_empty())
            else {
                self.skipped += 1;
                continue;
            };
            self.result.images.push(GeneratedImage {
                url: url.to_string(),
                width: raw.and_then(|raw| dimension(raw.get("width"))),
                height: raw.and_then(|raw| dimension(raw.get("height"))),
                description: entry
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }
        Ok(())
    }
}

fn id_field(value: &Value) -> Option<String> {
    match value {
        Value::String(raw) if !raw.trim().is_empty() => Some(raw.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn content_type(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(raw) => raw.trim().parse().ok(),
        _ => None,
    }
}

fn dimension(value: Option<&Value>) -> Option<u32> {
    value
        .and_then(Value::as_u64)
        .and_then(|raw| u32::try_from(raw).ok())
        .filter(|raw| *raw > 0)
}


#[cfg(test)]
mod tests {
    use std::io::{BufReader, Cursor, Read};

    use serde_json::json;

    use super::testing::{frame, ids_frame, image_frame};
    use super::*;

    fn decode(body: &str) -> EngineResult<CompletionResult> {
        StreamDecoder::decode(Cursor::new(body.as_bytes().to_vec()))
    }

    #[test]
    fn collects_images_across_garbage() -> anyhow::Result<()> {
        let mut body = String::from("event: message\n: keep-alive\n");
        body.push_str(&ids_frame("conv-9", "sec-9", "reply-9"));
        body.push_str(&image_frame(&["https://cdn/a~x.png"]));
        body.push_str("data: {not json\n");
        body.push_str("data: {\"event_data\": 7}\n");
        body.push_str(&image_frame(&["https://cdn/b~x.png", "https://cdn/c~x.png"]));
        body.push_str("data: {\"event_data\": \"{broken\"}\n");
        body.push_str(&image_frame(&["https://cdn/d~x.png"]));

        let result = decode(&body)?;
        assert_eq!(
            result.urls(),
            vec![
                "https://cdn/a~x.png",
                "https://cdn/b~x.png",
                "https://cdn/c~x.png",
                "https://cdn/d~x.png"
            ]
        );
        assert_eq!(result.conversation_id.as_deref(), Some("conv-9"));
        assert_eq!(result.section_id.as_deref(), Some("sec-9"));
        assert_eq!(result.reply_id.as_deref(), Some("reply-9"));
        assert_eq!(result.images[0].width, Some(1024));
        assert_eq!(result.images[0].description.as_deref(), Some("generated"));
        Ok(())
    }

    #[test]
    fn later_ids_win_and_missing_siblings_keep_values() -> anyhow::Result<()> {
        let mut body = ids_frame("conv-1", "sec-1", "reply-1");
        body.push_str(&frame(json!({ "conversation_id": "conv-2", "reply_id": "reply-2" })));
        let result = decode(&body)?;
        assert_eq!(result.conversation_id.as_deref(), Some("conv-2"));
        assert_eq!(result.section_id.as_deref(), Some("sec-1"));
        assert_eq!(result.reply_id.as_deref(), Some("reply-2"));
        Ok(())
    }

    #[test]
    fn other_content_types_are_ignored() -> anyhow::Result<()> {
        let body = frame(json!({
            "message": {"content_type": "2001", "content": "{\"text\": \"thinking\"}"}
        })) + &frame(json!({
            "message": {
                "content_type": "2010",
                "content": "{\"data\": [{\"image_raw\": {\"url\": \"u1\"}}, {}]}"
            }
        }));
        let result = decode(&body)?;
        assert_eq!(result.urls(), vec!["u1"]);
        assert_eq!(result.images[0].width, None);
        Ok(())
    }

    #[test]
    fn empty_stream_is_an_empty_success() -> anyhow::Result<()> {
        let result = decode("")?;
        assert!(result.is_empty());
        assert_eq!(result.conversation_id, None);
        assert!(result.first_output().is_none());
        Ok(())
    }

    #[test]
    fn non_utf8_lines_are_skipped() -> anyhow::Result<()> {
        let mut bytes = vec![0xff, 0xfe, b'\n'];
        bytes.extend_from_slice(image_frame(&["u1"]).as_bytes());
        let result = StreamDecoder::decode(Cursor::new(bytes))?;
        assert_eq!(result.urls(), vec!["u1"]);
        Ok(())
    }

    struct FailingReader {
        served: Cursor<Vec<u8>>,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.served.read(buf)?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "peer went away",
                ));
            }
            Ok(n)
        }
    }

    #[test]
    fn read_failure_is_a_transport_error() {
        let reader = BufReader::new(FailingReader {
            served: Cursor::new(image_frame(&["u1"]).into_bytes()),
        });
        let err = StreamDecoder::decode(reader).expect_err("stream should fail");
        assert!(matches!(err, EngineError::Transport(_)));
        assert!(err.to_string().contains("peer went away"));
    }
}
