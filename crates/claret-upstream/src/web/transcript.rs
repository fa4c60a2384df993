use base64::Engine;

use claret_common::{ProxyError, Settings};
use claret_protocol::messages::{
    ContentBlockParam, ImageSource, MessagesRequest, Role, ToolDefinition,
};

/// Fence opening the tool-call convention. The same marker is scanned for in
/// the response stream.
pub const TOOL_FENCE: &str = "```json";
pub const TOOL_FENCE_CLOSE: &str = "```";

const PAD_SENTENCE: &str =
    "The quick brown fox jumps over the lazy dog while the band plays on. ";

#[derive(Debug, Clone)]
pub struct TranscriptOptions {
    pub human_name: String,
    pub assistant_name: String,
    pub use_real_roles: bool,
    pub padtxt_length: usize,
    pub allow_external_images: bool,
}

impl TranscriptOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            human_name: settings.human_name.clone(),
            assistant_name: settings.assistant_name.clone(),
            use_real_roles: settings.use_real_roles,
            padtxt_length: settings.padtxt_length,
            allow_external_images: settings.allow_external_images,
        }
    }
}

/// An image to be uploaded out-of-band before dispatch.
#[derive(Debug, Clone)]
pub struct PendingImage {
    pub media_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct RenderedPrompt {
    pub prompt: String,
    pub images: Vec<PendingImage>,
}

/// Flatten a messages request into the single user turn the web interface
/// expects: system text, tool conventions, optional cache-stabilising
/// padding, then the labelled transcript ending with the assistant label.
pub fn render_request(
    request: &MessagesRequest,
    options: &TranscriptOptions,
) -> Result<RenderedPrompt, ProxyError> {
    let mut sections: Vec<String> = Vec::new();
    let mut images: Vec<PendingImage> = Vec::new();

    if let Some(system) = request.system_text()
        && !system.is_empty()
    {
        sections.push(system);
    }
    if let Some(tools) = request.tools.as_deref()
        && !tools.is_empty()
    {
        sections.push(tool_preamble(tools));
    }
    if options.padtxt_length > 0 {
        sections.push(padding(options.padtxt_length));
    }

    let mut turns: Vec<String> = Vec::new();
    for message in &request.messages {
        let label = match message.role {
            Role::User => options.human_name.as_str(),
            Role::Assistant => options.assistant_name.as_str(),
        };
        let body = render_blocks(&message.content.blocks(), options, &mut images)?;
        if body.is_empty() {
            continue;
        }
        if options.use_real_roles {
            turns.push(format!("{label}: {body}"));
        } else {
            turns.push(body);
        }
    }
    sections.push(turns.join("\n\n"));
    if options.use_real_roles {
        sections.push(format!("{}:", options.assistant_name));
    }

    Ok(RenderedPrompt {
        prompt: sections.join("\n\n"),
        images,
    })
}

/// Prompt for a tool_result continuation turn; the conversation upstream
/// already holds the context.
pub fn render_tool_results(results: &[(String, String)]) -> String {
    results
        .iter()
        .map(|(id, text)| format!("Tool result ({id}):\n{text}"))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_blocks(
    blocks: &[ContentBlockParam],
    options: &TranscriptOptions,
    images: &mut Vec<PendingImage>,
) -> Result<String, ProxyError> {
    let mut parts: Vec<String> = Vec::new();
    for block in blocks {
        match block {
            ContentBlockParam::Text { text } => parts.push(text.clone()),
            ContentBlockParam::Image { source } => match source {
                ImageSource::Base64 { media_type, data } => {
                    let decoded = base64::engine::general_purpose::STANDARD
                        .decode(data)
                        .map_err(|_| {
                            ProxyError::InvalidRequest("image data is not valid base64".into())
                        })?;
                    images.push(PendingImage {
                        media_type: media_type.clone(),
                        data: decoded,
                    });
                }
                ImageSource::Url { url } => {
                    if !options.allow_external_images {
                        return Err(ProxyError::InvalidRequest(
                            "external image URLs are not permitted".into(),
                        ));
                    }
                    parts.push(format!("(image: {url})"));
                }
            },
            ContentBlockParam::ToolUse { name, input, .. } => {
                let input = serde_json::to_string(input)
                    .map_err(|err| ProxyError::Internal(err.to_string()))?;
                parts.push(format!(
                    "{TOOL_FENCE}\n{{\"name\": {}, \"input\": {input}}}\n{TOOL_FENCE_CLOSE}",
                    serde_json::Value::String(name.clone())
                ));
            }
            ContentBlockParam::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                let text = content.as_ref().map(|c| c.to_text()).unwrap_or_default();
                parts.push(format!("Tool result ({tool_use_id}):\n{text}"));
            }
        }
    }
    Ok(parts.join("\n"))
}

fn tool_preamble(tools: &[ToolDefinition]) -> String {
    let mut out = String::from(
        "You can call the tools listed below. To call one, reply with exactly one fenced block:\n",
    );
    out.push_str(TOOL_FENCE);
    out.push_str("\n{\"name\": \"<tool name>\", \"input\": { ... }}\n");
    out.push_str(TOOL_FENCE_CLOSE);
    out.push_str(
        "\nStop after the block; the tool result arrives in the next message.\n\nTools:\n",
    );
    for tool in tools {
        let schema = serde_json::to_string(&tool.input_schema).unwrap_or_else(|_| "{}".into());
        let description = tool.description.as_deref().unwrap_or("");
        out.push_str(&format!("- {}: {description} (input schema: {schema})\n", tool.name));
    }
    out
}

fn padding(length: usize) -> String {
    let mut out = String::with_capacity(length);
    while out.len() < length {
        out.push_str(PAD_SENTENCE);
    }
    out.truncate(length);
    out
}
