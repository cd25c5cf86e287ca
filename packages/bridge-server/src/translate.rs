//! Forward translation: an OpenAI chat body becomes the message-template
//! payload the browser agent replays into the upstream UI.

use lmarena_bridge_error::BridgeError;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::config::{BridgeConfig, ReasoningOutputMode, SessionMode};
use crate::filebed::FileBed;
use crate::models::{ModelKind, ResolvedSession};

#[derive(Debug, Clone, Serialize)]
pub struct TaskPayload {
    pub is_image_request: bool,
    pub message_templates: Vec<MessageTemplate>,
    pub target_model_id: Option<String>,
    pub session_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageTemplate {
    pub role: String,
    pub content: String,
    #[serde(rename = "participantPosition")]
    pub participant_position: String,
    pub attachments: Vec<Attachment>,
    #[serde(
        rename = "experimental_attachments",
        skip_serializing_if = "Option::is_none"
    )]
    pub experimental_attachments: Option<Vec<Attachment>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Attachment {
    pub name: String,
    #[serde(rename = "contentType")]
    pub content_type: String,
    pub url: String,
}

struct ProcessedMessage {
    role: String,
    content: String,
    attachments: Vec<Attachment>,
    experimental: Vec<Attachment>,
}

pub fn translate(
    body: &Value,
    config: &BridgeConfig,
    resolved: &ResolvedSession,
) -> Result<TaskPayload, BridgeError> {
    let messages = body
        .get("messages")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut processed: Vec<ProcessedMessage> = Vec::with_capacity(messages.len());
    for message in &messages {
        processed.push(process_message(message, config)?);
    }

    if config.tavern_mode_enabled {
        processed = merge_system_messages(processed);
    }

    let mut templates: Vec<MessageTemplate> = processed
        .into_iter()
        .map(|message| {
            let experimental = if message.role == "user" && !message.attachments.is_empty() {
                Some(message.attachments.clone())
            } else if message.role == "assistant" && !message.experimental.is_empty() {
                Some(message.experimental)
            } else {
                None
            };
            MessageTemplate {
                role: message.role,
                content: message.content,
                participant_position: String::new(),
                attachments: message.attachments,
                experimental_attachments: experimental,
            }
        })
        .collect();

    if config.image_attachment_bypass_enabled && resolved.kind == ModelKind::Image {
        apply_image_attachment_bypass(&mut templates);
    }

    if bypass_applies(config, resolved.kind) {
        let template = config.bypass_injection.active_template();
        tracing::debug!(kind = resolved.kind.as_str(), "appending bypass template");
        templates.push(MessageTemplate {
            role: template.role,
            content: template.content,
            participant_position: template.participant_position,
            attachments: Vec::new(),
            experimental_attachments: None,
        });
    }

    assign_participant_positions(&mut templates, resolved);

    Ok(TaskPayload {
        is_image_request: resolved.kind == ModelKind::Image,
        message_templates: templates,
        target_model_id: resolved.target_model_id.clone(),
        session_id: resolved.session_id.clone(),
        message_id: resolved.message_id.clone(),
    })
}

/// Replace inline base64 images with file-bed URLs, in place. Runs before
/// translation so the agent never ships multi-megabyte data URIs upstream.
pub async fn upload_inline_images(
    body: &mut Value,
    file_bed: &FileBed,
) -> Result<(), BridgeError> {
    let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) else {
        return Ok(());
    };
    for message in messages {
        let Some(parts) = message.get_mut("content").and_then(Value::as_array_mut) else {
            continue;
        };
        for part in parts {
            if part.get("type").and_then(Value::as_str) != Some("image_url") {
                continue;
            }
            let Some(image_url) = part.get_mut("image_url") else {
                continue;
            };
            let Some(url) = image_url.get("url").and_then(Value::as_str) else {
                continue;
            };
            if !url.starts_with("data:") {
                continue;
            }
            let content_type = data_uri_content_type(url);
            let name = image_url
                .get("detail")
                .and_then(Value::as_str)
                .map(|detail| detail.to_string())
                .unwrap_or_else(|| generated_file_name(&content_type));
            let uploaded = file_bed.upload(&name, url).await?;
            image_url["url"] = Value::String(uploaded);
        }
    }
    Ok(())
}

fn process_message(
    message: &Value,
    config: &BridgeConfig,
) -> Result<ProcessedMessage, BridgeError> {
    let role_raw = message
        .get("role")
        .and_then(Value::as_str)
        .ok_or_else(|| BridgeError::TranslatorFailed {
            message: "message without a role".to_string(),
        })?;
    // `developer` is an OpenAI alias the upstream UI does not know.
    let role = if role_raw == "developer" {
        "system"
    } else {
        role_raw
    }
    .to_string();

    let mut attachments = Vec::new();
    let mut experimental = Vec::new();
    let mut content = String::new();

    match message.get("content") {
        Some(Value::String(text)) if role == "assistant" => {
            let (remaining, images) = split_markdown_images(text);
            let mut text = remaining;
            if config.enable_reasoning
                && config.strip_reasoning_from_history
                && config.reasoning_output_mode == ReasoningOutputMode::ThinkTag
            {
                text = strip_think_spans(&text);
            }
            content = text;
            for url in images {
                experimental.push(attachment_for(&url, None));
            }
        }
        Some(Value::String(text)) => content = text.clone(),
        Some(Value::Array(parts)) => {
            let mut text_parts = Vec::new();
            for part in parts {
                match part.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = part.get("text").and_then(Value::as_str) {
                            text_parts.push(text.to_string());
                        }
                    }
                    Some("image_url") => {
                        let Some(url) = part
                            .get("image_url")
                            .and_then(|image| image.get("url"))
                            .and_then(Value::as_str)
                        else {
                            tracing::warn!("image_url part without a url, skipping");
                            continue;
                        };
                        let name = part
                            .get("image_url")
                            .and_then(|image| image.get("detail"))
                            .and_then(Value::as_str);
                        let attachment = attachment_for(url, name);
                        if role == "assistant" {
                            experimental.push(attachment);
                        } else {
                            attachments.push(attachment);
                        }
                    }
                    _ => {}
                }
            }
            content = text_parts.join("\n\n");
        }
        _ => {}
    }

    // The upstream rejects empty user turns.
    if role == "user" && content.trim().is_empty() {
        content = " ".to_string();
    }

    Ok(ProcessedMessage {
        role,
        content,
        attachments,
        experimental,
    })
}

fn merge_system_messages(processed: Vec<ProcessedMessage>) -> Vec<ProcessedMessage> {
    let mut system_parts = Vec::new();
    let mut rest = Vec::new();
    for message in processed {
        if message.role == "system" {
            system_parts.push(message.content);
        } else {
            rest.push(message);
        }
    }
    let merged = system_parts.join("\n\n");
    let mut out = Vec::with_capacity(rest.len() + 1);
    if !merged.is_empty() {
        out.push(ProcessedMessage {
            role: "system".to_string(),
            content: merged,
            attachments: Vec::new(),
            experimental: Vec::new(),
        });
    }
    out.extend(rest);
    out
}

/// With an image model, a text prompt riding on an image attachment trips the
/// upstream filter; split it so the attachment becomes history and the text
/// arrives as the live turn.
fn apply_image_attachment_bypass(templates: &mut Vec<MessageTemplate>) {
    let Some(index) = templates.iter().rposition(|t| t.role == "user") else {
        return;
    };
    let has_image = templates[index]
        .attachments
        .iter()
        .any(|attachment| attachment.content_type.starts_with("image/"));
    if !has_image || templates[index].content.trim().is_empty() {
        return;
    }

    let original = templates[index].clone();
    templates[index] = MessageTemplate {
        role: "user".to_string(),
        content: " ".to_string(),
        participant_position: String::new(),
        attachments: original.attachments.clone(),
        experimental_attachments: Some(original.attachments.clone()),
    };
    templates.insert(
        index + 1,
        MessageTemplate {
            role: "user".to_string(),
            content: original.content,
            participant_position: String::new(),
            attachments: Vec::new(),
            experimental_attachments: None,
        },
    );
    tracing::info!(
        attachments = original.attachments.len(),
        "split image attachment from its text prompt"
    );
}

/// The global toggle is authoritative; a per-class setting overrides only its
/// own class. Absent a per-class setting, image and search stay off.
pub fn bypass_applies(config: &BridgeConfig, kind: ModelKind) -> bool {
    if !config.bypass_enabled {
        return false;
    }
    match config.bypass_settings.get(kind.as_str()) {
        Some(enabled) => *enabled,
        None => !matches!(kind, ModelKind::Image | ModelKind::Search),
    }
}

fn assign_participant_positions(templates: &mut [MessageTemplate], resolved: &ResolvedSession) {
    let battle_side = resolved.battle_target.as_participant();
    for template in templates {
        template.participant_position = match (resolved.mode, template.role.as_str()) {
            (SessionMode::Battle, _) => battle_side.to_string(),
            (SessionMode::DirectChat, "system") => "b".to_string(),
            (SessionMode::DirectChat, _) => "a".to_string(),
        };
    }
}

fn attachment_for(url: &str, name: Option<&str>) -> Attachment {
    let content_type = if url.starts_with("data:") {
        data_uri_content_type(url)
    } else {
        mime_guess::from_path(url.split(['?', '#']).next().unwrap_or(url))
            .first_raw()
            .unwrap_or("application/octet-stream")
            .to_string()
    };
    let name = name
        .map(|name| name.to_string())
        .or_else(|| file_name_from_url(url))
        .unwrap_or_else(|| generated_file_name(&content_type));
    Attachment {
        name,
        content_type,
        url: url.to_string(),
    }
}

fn data_uri_content_type(url: &str) -> String {
    url.strip_prefix("data:")
        .and_then(|rest| rest.split(';').next())
        .filter(|mime| !mime.is_empty())
        .unwrap_or("image/png")
        .to_string()
}

fn file_name_from_url(url: &str) -> Option<String> {
    if url.starts_with("data:") {
        return None;
    }
    let path = url.split(['?', '#']).next()?;
    let name = path.rsplit('/').next()?;
    (!name.is_empty() && name.contains('.')).then(|| name.to_string())
}

fn generated_file_name(content_type: &str) -> String {
    let extension = content_type.rsplit('/').next().unwrap_or("png");
    format!("image_{}.{extension}", Uuid::new_v4())
}

fn split_markdown_images(text: &str) -> (String, Vec<String>) {
    let mut remaining = String::with_capacity(text.len());
    let mut images = Vec::new();
    let mut rest = text;
    loop {
        let Some(start) = rest.find("![") else {
            remaining.push_str(rest);
            break;
        };
        let after = &rest[start..];
        let Some(close) = after.find("](") else {
            remaining.push_str(rest);
            break;
        };
        let Some(end) = after[close + 2..].find(')') else {
            remaining.push_str(rest);
            break;
        };
        remaining.push_str(&rest[..start]);
        images.push(after[close + 2..close + 2 + end].to_string());
        rest = &rest[start + close + 2 + end + 1..];
    }
    (remaining.trim().to_string(), images)
}

pub fn strip_think_spans(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<think>") {
        out.push_str(&rest[..start]);
        match rest[start..].find("</think>") {
            Some(end) => rest = &rest[start + end + "</think>".len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BattleTarget, BridgeConfig};
    use serde_json::json;

    fn resolved(kind: ModelKind) -> ResolvedSession {
        ResolvedSession {
            session_id: "sess".into(),
            message_id: "msg".into(),
            mode: SessionMode::DirectChat,
            battle_target: BattleTarget::A,
            kind,
            target_model_id: Some("model-id".into()),
        }
    }

    #[test]
    fn global_bypass_off_disables_everything() {
        let mut config = BridgeConfig::default();
        config.bypass_enabled = false;
        config.bypass_settings.insert("text".into(), true);
        assert!(!bypass_applies(&config, ModelKind::Text));
        assert!(!bypass_applies(&config, ModelKind::Image));
        assert!(!bypass_applies(&config, ModelKind::Search));
    }

    #[test]
    fn per_class_settings_narrow_the_global_toggle() {
        let mut config = BridgeConfig::default();
        config.bypass_enabled = true;
        config.bypass_settings.insert("image".into(), false);
        // `text` is not listed, so it follows the default rule and stays on.
        assert!(bypass_applies(&config, ModelKind::Text));
        assert!(!bypass_applies(&config, ModelKind::Image));

        config.bypass_settings.insert("text".into(), true);
        assert!(bypass_applies(&config, ModelKind::Text));
        assert!(!bypass_applies(&config, ModelKind::Image));
    }

    #[test]
    fn without_settings_image_and_search_default_off() {
        let mut config = BridgeConfig::default();
        config.bypass_enabled = true;
        assert!(bypass_applies(&config, ModelKind::Text));
        assert!(!bypass_applies(&config, ModelKind::Image));
        assert!(!bypass_applies(&config, ModelKind::Search));
    }

    #[test]
    fn bypass_template_is_appended_for_text_models() {
        let mut config = BridgeConfig::default();
        config.bypass_enabled = true;
        let body = json!({"messages": [{"role": "user", "content": "hi"}]});
        let payload = translate(&body, &config, &resolved(ModelKind::Text)).unwrap();
        assert_eq!(payload.message_templates.len(), 2);
        assert_eq!(payload.message_templates[1].content, " ");

        let image_payload = translate(&body, &config, &resolved(ModelKind::Image)).unwrap();
        assert_eq!(image_payload.message_templates.len(), 1);
        assert!(image_payload.is_image_request);
    }

    #[test]
    fn direct_chat_positions_system_on_b() {
        let config = BridgeConfig::default();
        let body = json!({"messages": [
            {"role": "system", "content": "be brief"},
            {"role": "user", "content": "hi"}
        ]});
        let payload = translate(&body, &config, &resolved(ModelKind::Text)).unwrap();
        assert_eq!(payload.message_templates[0].participant_position, "b");
        assert_eq!(payload.message_templates[1].participant_position, "a");
    }

    #[test]
    fn battle_mode_positions_follow_the_target() {
        let config = BridgeConfig::default();
        let mut session = resolved(ModelKind::Text);
        session.mode = SessionMode::Battle;
        session.battle_target = BattleTarget::B;
        let body = json!({"messages": [
            {"role": "system", "content": "be brief"},
            {"role": "user", "content": "hi"}
        ]});
        let payload = translate(&body, &config, &session).unwrap();
        assert!(payload
            .message_templates
            .iter()
            .all(|t| t.participant_position == "b"));
    }

    #[test]
    fn developer_role_becomes_system() {
        let config = BridgeConfig::default();
        let body = json!({"messages": [{"role": "developer", "content": "rules"}]});
        let payload = translate(&body, &config, &resolved(ModelKind::Text)).unwrap();
        assert_eq!(payload.message_templates[0].role, "system");
    }

    #[test]
    fn empty_user_content_becomes_a_space() {
        let config = BridgeConfig::default();
        let body = json!({"messages": [{"role": "user", "content": ""}]});
        let payload = translate(&body, &config, &resolved(ModelKind::Text)).unwrap();
        assert_eq!(payload.message_templates[0].content, " ");
    }

    #[test]
    fn tavern_mode_merges_system_prompts() {
        let mut config = BridgeConfig::default();
        config.tavern_mode_enabled = true;
        let body = json!({"messages": [
            {"role": "system", "content": "one"},
            {"role": "user", "content": "hi"},
            {"role": "system", "content": "two"}
        ]});
        let payload = translate(&body, &config, &resolved(ModelKind::Text)).unwrap();
        assert_eq!(payload.message_templates.len(), 2);
        assert_eq!(payload.message_templates[0].role, "system");
        assert_eq!(payload.message_templates[0].content, "one\n\ntwo");
    }

    #[test]
    fn assistant_markdown_images_become_attachments() {
        let config = BridgeConfig::default();
        let body = json!({"messages": [
            {"role": "assistant", "content": "here ![Image](https://img/x.png) done"}
        ]});
        let payload = translate(&body, &config, &resolved(ModelKind::Text)).unwrap();
        let template = &payload.message_templates[0];
        assert_eq!(template.content, "here  done");
        let experimental = template.experimental_attachments.as_ref().unwrap();
        assert_eq!(experimental[0].url, "https://img/x.png");
        assert_eq!(experimental[0].content_type, "image/png");
    }

    #[test]
    fn multimodal_user_content_splits_text_and_attachments() {
        let config = BridgeConfig::default();
        let body = json!({"messages": [{"role": "user", "content": [
            {"type": "text", "text": "look"},
            {"type": "image_url", "image_url": {"url": "data:image/jpeg;base64,AA", "detail": "photo.jpg"}}
        ]}]});
        let payload = translate(&body, &config, &resolved(ModelKind::Text)).unwrap();
        let template = &payload.message_templates[0];
        assert_eq!(template.content, "look");
        assert_eq!(template.attachments[0].name, "photo.jpg");
        assert_eq!(template.attachments[0].content_type, "image/jpeg");
        assert_eq!(
            template.experimental_attachments.as_ref().unwrap().len(),
            1
        );
    }

    #[test]
    fn image_attachment_bypass_splits_the_last_user_turn() {
        let mut config = BridgeConfig::default();
        config.image_attachment_bypass_enabled = true;
        let body = json!({"messages": [{"role": "user", "content": [
            {"type": "text", "text": "make it sharper"},
            {"type": "image_url", "image_url": {"url": "data:image/png;base64,AA"}}
        ]}]});
        let payload = translate(&body, &config, &resolved(ModelKind::Image)).unwrap();
        assert_eq!(payload.message_templates.len(), 2);
        assert_eq!(payload.message_templates[0].content, " ");
        assert_eq!(payload.message_templates[0].attachments.len(), 1);
        assert_eq!(payload.message_templates[1].content, "make it sharper");
        assert!(payload.message_templates[1].attachments.is_empty());
    }

    #[test]
    fn think_spans_are_stripped_from_history() {
        assert_eq!(
            strip_think_spans("<think>internal</think>\nanswer"),
            "answer"
        );
        assert_eq!(strip_think_spans("plain"), "plain");
        assert_eq!(
            strip_think_spans("a<think>x</think>b<think>y</think>c"),
            "abc"
        );
    }
}
