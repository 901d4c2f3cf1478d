//! Typed image lineage records.
//!
//! A record is one successful call against the service. Its `operation` is a
//! tagged union so every derivation branch is checked at compile time; the
//! on-disk shape stays the flat `{id, urls, type, operation_params, parent_id,
//! create_time}` row.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;
use crate::outpaint::{Padding, DEFAULT_DIMENSION};

pub mod store;

pub use store::{spawn_retention_sweeper, LineageStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Generate,
    Edit,
    Outpaint,
    Inpaint,
    BackgroundRemoval,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Edit => "edit",
            Self::Outpaint => "outpaint",
            Self::Inpaint => "inpaint",
            Self::BackgroundRemoval => "background_removal",
        }
    }
}

/// Identifiers that keep later calls attached to the same remote branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationInfo {
    pub conversation_id: String,
    pub section_id: String,
    #[serde(default)]
    pub reply_id: Option<String>,
}

impl ContinuationInfo {
    pub fn new(
        conversation_id: impl Into<String>,
        section_id: impl Into<String>,
        reply_id: Option<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            section_id: section_id.into(),
            reply_id,
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.conversation_id.trim().is_empty() && !self.section_id.trim().is_empty()
    }

    /// Folds the ids a call just returned over this state. Conversation and
    /// section only move when the service reported them; the reply id always
    /// takes the call's value, even when that value is absent.
    pub fn advance(
        &self,
        conversation_id: Option<&str>,
        section_id: Option<&str>,
        reply_id: Option<&str>,
    ) -> Self {
        Self {
            conversation_id: conversation_id
                .map(str::to_string)
                .unwrap_or_else(|| self.conversation_id.clone()),
            section_id: section_id
                .map(str::to_string)
                .unwrap_or_else(|| self.section_id.clone()),
            reply_id: reply_id.map(str::to_string),
        }
    }
}

/// The first image a call produced; derivations edit from this.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutputImage {
    pub image_url: String,
    pub image_token: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub description: String,
}

impl OutputImage {
    pub fn from_url(url: &str) -> Self {
        Self {
            image_url: url.to_string(),
            image_token: image_token_from_url(url),
            ..Self::default()
        }
    }

    pub fn dimensions_or_default(&self) -> (u32, u32) {
        (
            self.width.filter(|w| *w > 0).unwrap_or(DEFAULT_DIMENSION),
            self.height.filter(|h| *h > 0).unwrap_or(DEFAULT_DIMENSION),
        )
    }
}

/// The service addresses stored images by the last path segment up to `~`.
pub fn image_token_from_url(url: &str) -> String {
    let tail = url.rsplit('/').next().unwrap_or(url);
    tail.split('~').next().unwrap_or(tail).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InpaintMode {
    /// A loop drawn around the region; the interior is flood-filled.
    Circle,
    /// The region is painted over directly.
    Brush,
}

impl InpaintMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Circle => "circle",
            Self::Brush => "brush",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateParams {
    #[serde(flatten)]
    pub continuation: ContinuationInfo,
    #[serde(flatten)]
    pub output: OutputImage,
    pub prompt: String,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub ratio: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EditSource {
    /// One image of an earlier record, 1-based.
    Record { record_id: String, index: usize },
    /// An uploaded reference image.
    Reference { image_key: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditParams {
    #[serde(flatten)]
    pub continuation: ContinuationInfo,
    #[serde(flatten)]
    pub output: OutputImage,
    pub prompt: String,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub ratio: Option<String>,
    pub source: EditSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutpaintParams {
    #[serde(flatten)]
    pub continuation: ContinuationInfo,
    #[serde(flatten)]
    pub output: OutputImage,
    pub ratio: String,
    pub source_index: usize,
    pub padding: Padding,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InpaintParams {
    #[serde(flatten)]
    pub continuation: ContinuationInfo,
    #[serde(flatten)]
    pub output: OutputImage,
    pub prompt: String,
    pub mode: InpaintMode,
    pub invert: bool,
    pub mask: String,
    pub original_key: String,
    pub original_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundRemovalParams {
    #[serde(flatten)]
    pub continuation: ContinuationInfo,
    #[serde(flatten)]
    pub output: OutputImage,
    pub image_key: String,
    pub original_url: String,
    pub mask_url: String,
    #[serde(default)]
    pub mask: Option<String>,
    #[serde(default)]
    pub without_background: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperationParams {
    Generate(GenerateParams),
    Edit(EditParams),
    Outpaint(OutpaintParams),
    Inpaint(InpaintParams),
    BackgroundRemoval(BackgroundRemovalParams),
}

impl OperationParams {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Generate(_) => OperationKind::Generate,
            Self::Edit(_) => OperationKind::Edit,
            Self::Outpaint(_) => OperationKind::Outpaint,
            Self::Inpaint(_) => OperationKind::Inpaint,
            Self::BackgroundRemoval(_) => OperationKind::BackgroundRemoval,
        }
    }

    pub fn continuation(&self) -> &ContinuationInfo {
        match self {
            Self::Generate(p) => &p.continuation,
            Self::Edit(p) => &p.continuation,
            Self::Outpaint(p) => &p.continuation,
            Self::Inpaint(p) => &p.continuation,
            Self::BackgroundRemoval(p) => &p.continuation,
        }
    }

    pub fn output(&self) -> &OutputImage {
        match self {
            Self::Generate(p) => &p.output,
            Self::Edit(p) => &p.output,
            Self::Outpaint(p) => &p.output,
            Self::Inpaint(p) => &p.output,
            Self::BackgroundRemoval(p) => &p.output,
        }
    }

    pub fn prompt(&self) -> Option<&str> {
        match self {
            Self::Generate(p) => Some(p.prompt.as_str()),
            Self::Edit(p) => Some(p.prompt.as_str()),
            Self::Inpaint(p) => Some(p.prompt.as_str()),
            Self::Outpaint(_) | Self::BackgroundRemoval(_) => None,
        }
    }

    /// Same operation, re-pointed at a newer continuation and output image.
    pub fn rebased(&self, continuation: ContinuationInfo, output: OutputImage) -> Self {
        let mut next = self.clone();
        match &mut next {
            Self::Generate(p) => {
                p.continuation = continuation;
                p.output = output;
            }
            Self::Edit(p) => {
                p.continuation = continuation;
                p.output = output;
            }
            Self::Outpaint(p) => {
                p.continuation = continuation;
                p.output = output;
            }
            Self::Inpaint(p) => {
                p.continuation = continuation;
                p.output = output;
            }
            Self::BackgroundRemoval(p) => {
                p.continuation = continuation;
                p.output = output;
            }
        }
        next
    }

    fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Generate(p) => serde_json::to_value(p),
            Self::Edit(p) => serde_json::to_value(p),
            Self::Outpaint(p) => serde_json::to_value(p),
            Self::Inpaint(p) => serde_json::to_value(p),
            Self::BackgroundRemoval(p) => serde_json::to_value(p),
        }
    }

    fn from_value(kind: OperationKind, value: Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            OperationKind::Generate => Self::Generate(serde_json::from_value(value)?),
            OperationKind::Edit => Self::Edit(serde_json::from_value(value)?),
            OperationKind::Outpaint => Self::Outpaint(serde_json::from_value(value)?),
            OperationKind::Inpaint => Self::Inpaint(serde_json::from_value(value)?),
            OperationKind::BackgroundRemoval => {
                Self::BackgroundRemoval(serde_json::from_value(value)?)
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    pub id: String,
    pub urls: Vec<String>,
    pub operation: OperationParams,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Persisted row shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordRow {
    id: String,
    urls: Vec<String>,
    #[serde(rename = "type")]
    kind: OperationKind,
    operation_params: Value,
    #[serde(default)]
    parent_id: Option<String>,
    create_time: i64,
}

impl ImageRecord {
    pub fn kind(&self) -> OperationKind {
        self.operation.kind()
    }

    pub fn continuation(&self) -> &ContinuationInfo {
        self.operation.continuation()
    }

    /// 1-based pick, as users number the images they were shown.
    pub fn url(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|idx| self.urls.get(idx))
            .map(String::as_str)
    }

    pub(crate) fn check_storable(&self) -> Result<(), StoreError> {
        let reject = |reason: &str| StoreError::InvalidRecord {
            id: self.id.clone(),
            reason: reason.to_string(),
        };
        if self.id.trim().is_empty() {
            return Err(reject("empty id"));
        }
        if self.urls.is_empty() {
            return Err(reject("no image urls"));
        }
        if !self.continuation().is_complete() {
            return Err(reject("missing conversation or section id"));
        }
        Ok(())
    }

    pub fn to_row(&self) -> Result<Value, StoreError> {
        let row = RecordRow {
            id: self.id.clone(),
            urls: self.urls.clone(),
            kind: self.kind(),
            operation_params: self.operation.to_value()?,
            parent_id: self.parent_id.clone(),
            create_time: self.created_at.timestamp_millis(),
        };
        Ok(serde_json::to_value(row)?)
    }

    pub fn from_row(value: Value) -> Result<Self, StoreError> {
        let row: RecordRow = serde_json::from_value(value)?;
        let created_at = Utc
            .timestamp_millis_opt(row.create_time)
            .single()
            .ok_or_else(|| StoreError::InvalidRecord {
                id: row.id.clone(),
                reason: format!("bad create_time {}", row.create_time),
            })?;
        Ok(Self {
            operation: OperationParams::from_value(row.kind, row.operation_params)?,
            id: row.id,
            urls: row.urls,
            parent_id: row.parent_id,
            created_at,
        })
    }
}


#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::fixtures::generate_record;
    use super::*;

    #[test]
    fn token_is_last_segment_before_tilde() {
        assert_eq!(
            image_token_from_url("https://cdn.example/obj/rc/abc123~tplv-x.png?sig=1"),
            "abc123"
        );
        assert_eq!(image_token_from_url("plain"), "plain");
    }

    #[test]
    fn advance_moves_reply_id_even_when_absent() {
        let base = ContinuationInfo::new("conv-1", "sec-1", Some("reply-1".to_string()));
        let moved = base.advance(None, Some("sec-2"), Some("reply-2"));
        assert_eq!(moved, ContinuationInfo::new("conv-1", "sec-2", Some("reply-2".to_string())));

        let cleared = base.advance(None, None, None);
        assert_eq!(cleared.reply_id, None);
        assert_eq!(cleared.conversation_id, "conv-1");
    }

    #[test]
    fn row_keeps_flat_operation_params() -> anyhow::Result<()> {
        let record = generate_record(
            "1700000000",
            &["https://x/a~1.png", "https://x/b~2.png"],
            Utc::now(),
        );
        let row = record.to_row()?;
        assert_eq!(row["type"], json!("generate"));
        assert_eq!(row["operation_params"]["conversation_id"], json!("conv-1"));
        assert_eq!(row["operation_params"]["image_token"], json!("a"));
        assert_eq!(row["operation_params"]["prompt"], json!("a cat"));
        assert_eq!(row["parent_id"], Value::Null);

        let back = ImageRecord::from_row(row)?;
        assert_eq!(back.id, record.id);
        assert_eq!(back.operation, record.operation);
        assert_eq!(back.created_at.timestamp_millis(), record.created_at.timestamp_millis());
        Ok(())
    }

    #[test]
    fn edit_source_is_tagged() -> anyhow::Result<()> {
        let record = ImageRecord {
            id: "2".to_string(),
            urls: vec!["https://x/e~1.png".to_string()],
            operation: OperationParams::Edit(EditParams {
                continuation: ContinuationInfo::new("c", "s", None),
                output: OutputImage::from_url("https://x/e~1.png"),
                prompt: "add sunglasses".to_string(),
                style: None,
                ratio: None,
                source: EditSource::Record {
                    record_id: "1".to_string(),
                    index: 3,
                },
            }),
            parent_id: Some("1".to_string()),
            created_at: Utc::now(),
        };
        let row = record.to_row()?;
        assert_eq!(row["operation_params"]["source"]["kind"], json!("record"));
        assert_eq!(row["operation_params"]["source"]["index"], json!(3));
        assert_eq!(ImageRecord::from_row(row)?.kind(), OperationKind::Edit);
        Ok(())
    }

    #[test]
    fn url_pick_is_one_based() {
        let record = generate_record("1", &["u1", "u2"], Utc::now());
        assert_eq!(record.url(1), Some("u1"));
        assert_eq!(record.url(2), Some("u2"));
        assert_eq!(record.url(0), None);
        assert_eq!(record.url(3), None);
    }

    #[test]
    fn unstorable_records_are_rejected() {
        let mut record = generate_record("1", &["u1"], Utc::now());
        record.urls.clear();
        assert!(record.check_storable().is_err());

        let mut record = generate_record("1", &["u1"], Utc::now());
        record.operation = record
            .operation
            .rebased(ContinuationInfo::new("", "sec", None), OutputImage::from_url("u1"));
        assert!(record.check_storable().is_err());
    }
}
