//! Wire model for completion calls.

use atelier_contracts::outpaint::Padding;
use atelier_contracts::records::image_token_from_url;
use atelier_contracts::ContinuationInfo;
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

/// `content_type` of a user-authored message.
pub const USER_MESSAGE_CONTENT_TYPE: u32 = 2009;

/// Conversation id sent before the service has assigned one.
pub const NEW_CONVERSATION_ID: &str = "0";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub messages: Vec<RequestMessage>,
    pub completion_option: CompletionOption,
    pub conversation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,
    pub local_message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestMessage {
    /// `MessageContent` serialized to a JSON string.
    pub content: String,
    pub content_type: u32,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionOption {
    pub is_regen: bool,
    pub with_suggest: bool,
    pub need_create_conversation: bool,
    pub launch_stage: u32,
    pub is_replace: bool,
    pub is_delete: bool,
    pub message_from: u32,
    pub event_id: String,
}

impl Default for CompletionOption {
    fn default() -> Self {
        Self {
            is_regen: false,
            with_suggest: false,
            need_create_conversation: false,
            launch_stage: 1,
            is_replace: false,
            is_delete: false,
            message_from: 0,
            event_id: "0".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageContent {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edit_image: Option<EditImage>,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            edit_image: None,
        }
    }

    pub fn with_edit(text: impl Into<String>, edit_image: EditImage) -> Self {
        Self {
            text: text.into(),
            edit_image: Some(edit_image),
        }
    }
}

/// Points a completion at an existing image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EditImage {
    pub edit_image_url: String,
    pub edit_image_token: String,
    pub description: String,
    pub outline_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ability: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bottom: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub right: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_edit_local_image: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_edit_local_image_v2: Option<String>,
}

impl EditImage {
    pub fn edit(url: &str, description: &str) -> Self {
        Self {
            edit_image_url: url.to_string(),
            edit_image_token: image_token_from_url(url),
            description: description.to_string(),
            outline_id: None,
            ability: None,
            top: None,
            bottom: None,
            left: None,
            right: None,
            mask: None,
            is_edit_local_image: None,
            is_edit_local_image_v2: None,
        }
    }

    pub fn outpaint(url: &str, description: &str, padding: Padding) -> Self {
        Self {
            ability: Some("outpainting".to_string()),
            top: Some(padding.top),
            bottom: Some(padding.bottom),
            left: Some(padding.left),
            right: Some(padding.right),
            ..Self::edit(url, description).local_image(false)
        }
    }

    /// Inpainting addresses the uploaded original by key, not by url token.
    pub fn inpaint(image_key: &str, url: &str, mask_data_uri: &str) -> Self {
        Self {
            edit_image_token: image_key.to_string(),
            description: String::new(),
            ability: Some("inpainting".to_string()),
            mask: Some(mask_data_uri.to_string()),
            ..Self::edit(url, "").local_image(true)
        }
    }

    pub fn local_image(mut self, local: bool) -> Self {
        self.is_edit_local_image = Some(local);
        self.is_edit_local_image_v2 = Some(local.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub key: String,
    pub extra: AttachmentExtra,
    pub identifier: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttachmentExtra {
    pub refer_types: String,
}

impl Attachment {
    /// A whole-image reference to an uploaded file.
    pub fn reference(image_key: &str) -> Self {
        Self {
            kind: "image".to_string(),
            key: image_key.to_string(),
            extra: AttachmentExtra {
                refer_types: "overall".to_string(),
            },
            identifier: Uuid::new_v4().to_string(),
        }
    }
}

impl CompletionRequest {
    /// Single-message request continuing `continuation`, or opening a new
    /// conversation when there is none.
    pub fn new(
        content: &MessageContent,
        continuation: Option<&ContinuationInfo>,
    ) -> Result<Self, serde_json::Error> {
        let fresh = continuation.is_none();
        Ok(Self {
            messages: vec![RequestMessage {
                content: serde_json::to_string(content)?,
                content_type: USER_MESSAGE_CONTENT_TYPE,
                attachments: Vec::new(),
            }],
            completion_option: CompletionOption {
                need_create_conversation: fresh,
                ..CompletionOption::default()
            },
            conversation_id: continuation
                .map(|c| c.conversation_id.clone())
                .unwrap_or_else(|| NEW_CONVERSATION_ID.to_string()),
            section_id: continuation.map(|c| c.section_id.clone()),
            local_message_id: Uuid::new_v4().to_string(),
            local_conversation_id: fresh
                .then(|| format!("local_{}", Utc::now().timestamp_millis())),
            reply_id: None,
        })
    }

    pub fn with_reply_id(mut self, reply_id: Option<String>) -> Self {
        self.reply_id = reply_id;
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        if let Some(message) = self.messages.first_mut() {
            message.attachments.push(attachment);
        }
        self
    }

    /// Asks the service for a fresh take on the reply named by `reply_id`.
    pub fn regenerating(mut self) -> Self {
        self.completion_option.is_regen = true;
        self.completion_option.with_suggest = true;
        self
    }

    /// Parsed form of the first message's content.
    pub fn content_json(&self) -> Option<serde_json::Value> {
        self.messages
            .first()
            .and_then(|message| serde_json::from_str(&message.content).ok())
    }
}

#[cfg(test)]
mod tests {
    use atelier_contracts::outpaint::OutpaintRatio;
    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn fresh_generation_requests_a_new_conversation() -> anyhow::Result<()> {
        let request = CompletionRequest::new(&MessageContent::text("a cat"), None)?;
        let body = serde_json::to_value(&request)?;
        assert_eq!(body["conversation_id"], json!("0"));
        assert!(body.get("section_id").is_none());
        assert!(body.get("reply_id").is_none());
        assert_eq!(body["completion_option"]["need_create_conversation"], json!(true));
        assert_eq!(body["completion_option"]["launch_stage"], json!(1));
        assert_eq!(body["messages"][0]["content_type"], json!(2009));
        assert!(body["local_conversation_id"]
            .as_str()
            .is_some_and(|id| id.starts_with("local_")));
        assert_eq!(request.content_json(), Some(json!({"text": "a cat"})));
        Ok(())
    }

    #[test]
    fn continued_edit_carries_ids_and_token() -> anyhow::Result<()> {
        let continuation = ContinuationInfo::new("conv-1", "sec-1", Some("reply-1".to_string()));
        let content = MessageContent::with_edit(
            "add a hat",
            EditImage::edit("https://cdn/obj/tok123~tplv.png", "a cat"),
        );
        let request = CompletionRequest::new(&content, Some(&continuation))?
            .with_reply_id(continuation.reply_id.clone());
        let body = serde_json::to_value(&request)?;
        assert_eq!(body["conversation_id"], json!("conv-1"));
        assert_eq!(body["section_id"], json!("sec-1"));
        assert_eq!(body["reply_id"], json!("reply-1"));
        assert!(body.get("local_conversation_id").is_none());
        assert_eq!(body["completion_option"]["need_create_conversation"], json!(false));

        let content = request.content_json().unwrap_or(Value::Null);
        assert_eq!(content["edit_image"]["edit_image_token"], json!("tok123"));
        assert_eq!(content["edit_image"]["outline_id"], Value::Null);
        assert!(content["edit_image"].get("mask").is_none());
        Ok(())
    }

    #[test]
    fn outpaint_and_inpaint_flags() -> anyhow::Result<()> {
        let padding = OutpaintRatio::Landscape16x9.padding(1024, 1024);
        let outpaint = serde_json::to_value(EditImage::outpaint("https://cdn/t~x", "", padding))?;
        assert_eq!(outpaint["ability"], json!("outpainting"));
        assert_eq!(outpaint["is_edit_local_image"], json!(false));
        assert_eq!(outpaint["is_edit_local_image_v2"], json!("false"));
        assert_eq!(outpaint["top"], json!(0.0));
        assert!(outpaint["left"].as_f64().is_some_and(|left| left > 0.38 && left < 0.39));

        let inpaint = serde_json::to_value(EditImage::inpaint(
            "key-1",
            "https://cdn/main.png",
            "data:image/png;base64,AAAA",
        ))?;
        assert_eq!(inpaint["edit_image_token"], json!("key-1"));
        assert_eq!(inpaint["ability"], json!("inpainting"));
        assert_eq!(inpaint["is_edit_local_image_v2"], json!("true"));
        assert!(inpaint.get("top").is_none());
        Ok(())
    }

    #[test]
    fn regeneration_and_attachments() -> anyhow::Result<()> {
        let request = CompletionRequest::new(&MessageContent::text("again"), None)?
            .with_attachment(Attachment::reference("img-key"))
            .regenerating();
        let body = serde_json::to_value(&request)?;
        assert_eq!(body["completion_option"]["is_regen"], json!(true));
        assert_eq!(body["completion_option"]["with_suggest"], json!(true));
        let attachment = &body["messages"][0]["attachments"][0];
        assert_eq!(attachment["type"], json!("image"));
        assert_eq!(attachment["key"], json!("img-key"));
        assert_eq!(attachment["extra"]["refer_types"], json!("overall"));
        Ok(())
    }
}
