use serde::de::IgnoredAny;
use serde::Deserialize;

use super::token_estimator::TokenCounter;

pub(crate) const DEFAULT_MODERATION_MODEL: &str = "text-moderation-stable";

// 中文注释：与常见计数口径一致，每条消息额外 3 个 token，回复前缀再加 3 个。
const TOKENS_PER_MESSAGE: usize = 3;
const TOKENS_REPLY_PRIMING: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelayMode {
    ChatCompletions,
    Completions,
    Embeddings,
    Moderations,
}

impl RelayMode {
    pub(crate) fn from_path(path: &str) -> Option<Self> {
        let path = path.split('?').next().unwrap_or(path).trim_end_matches('/');
        match path {
            "/v1/chat/completions" => Some(RelayMode::ChatCompletions),
            "/v1/completions" => Some(RelayMode::Completions),
            "/v1/embeddings" => Some(RelayMode::Embeddings),
            "/v1/moderations" => Some(RelayMode::Moderations),
            _ => None,
        }
    }

    pub(crate) fn path(self) -> &'static str {
        match self {
            RelayMode::ChatCompletions => "/v1/chat/completions",
            RelayMode::Completions => "/v1/completions",
            RelayMode::Embeddings => "/v1/embeddings",
            RelayMode::Moderations => "/v1/moderations",
        }
    }
}

/// Routing-relevant traits of one request. Computed once from the buffered
/// body and reused unchanged by every attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Fingerprint {
    pub(crate) model: String,
    pub(crate) group: String,
    pub(crate) needs_image: bool,
    pub(crate) needs_stream: bool,
    pub(crate) has_system_prompt: bool,
    pub(crate) needs_non_deterministic: bool,
    pub(crate) needs_function_call: bool,
    pub(crate) estimated_input_tokens: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CapabilityScan {
    Fingerprint(Fingerprint),
    /// The body carries no capability signal (multipart upload, unknown endpoint).
    NotApplicable,
}

/// A field that decodes when well-typed and is ignored otherwise, so one odd
/// field never fails the whole scan.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Lenient<T> {
    Valid(T),
    Invalid(IgnoredAny),
}

impl<T> Default for Lenient<T> {
    fn default() -> Self {
        Lenient::Invalid(IgnoredAny)
    }
}

impl<T> Lenient<T> {
    fn valid(&self) -> Option<&T> {
        match self {
            Lenient::Valid(value) => Some(value),
            Lenient::Invalid(_) => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SampleCount {
    Int(i64),
    Float(f64),
    Text(String),
    Other(IgnoredAny),
}

impl SampleCount {
    /// Anything that is not an integral number reads as 1.
    fn value(&self) -> i64 {
        match self {
            SampleCount::Int(n) => *n,
            SampleCount::Float(f) if f.is_finite() && f.fract() == 0.0 => *f as i64,
            SampleCount::Text(text) => text.trim().parse::<i64>().unwrap_or(1),
            _ => 1,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ContentProbe {
    Text(String),
    Parts(Vec<Lenient<PartProbe>>),
    Other(IgnoredAny),
}

#[derive(Debug, Default, Deserialize)]
struct PartProbe {
    #[serde(rename = "type", default)]
    part_type: Lenient<String>,
    #[serde(default)]
    text: Lenient<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ToolCallsProbe {
    List(Vec<IgnoredAny>),
    Object(serde_json::Map<String, serde_json::Value>),
    Text(String),
    Other(IgnoredAny),
}

impl ToolCallsProbe {
    fn is_non_empty(&self) -> bool {
        match self {
            ToolCallsProbe::List(items) => !items.is_empty(),
            ToolCallsProbe::Object(map) => !map.is_empty(),
            ToolCallsProbe::Text(text) => !text.is_empty(),
            ToolCallsProbe::Other(_) => true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct MessageProbe {
    #[serde(default)]
    role: Lenient<String>,
    #[serde(default)]
    content: Option<ContentProbe>,
    #[serde(default)]
    tool_calls: Option<ToolCallsProbe>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PromptProbe {
    Text(String),
    List(Vec<Lenient<String>>),
    Other(IgnoredAny),
}

impl PromptProbe {
    fn texts(&self) -> Vec<&str> {
        match self {
            PromptProbe::Text(text) => vec![text.as_str()],
            PromptProbe::List(items) => items
                .iter()
                .filter_map(|item| item.valid().map(String::as_str))
                .collect(),
            PromptProbe::Other(_) => Vec::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RequestProbe {
    #[serde(default)]
    model: Lenient<String>,
    #[serde(default)]
    stream: Lenient<bool>,
    #[serde(default)]
    logprobs: Lenient<bool>,
    #[serde(default)]
    n: Option<SampleCount>,
    #[serde(default)]
    messages: Lenient<Vec<Lenient<MessageProbe>>>,
    #[serde(default)]
    prompt: Option<PromptProbe>,
    #[serde(default)]
    input: Option<PromptProbe>,
}

/// Decodes the body once into a fingerprint. Malformed JSON yields the zero
/// fingerprint (only `group` set) instead of an error.
pub(crate) fn extract_capabilities(
    mode: Option<RelayMode>,
    is_multipart: bool,
    group: &str,
    body: &[u8],
    counter: &dyn TokenCounter,
) -> CapabilityScan {
    let Some(mode) = mode else {
        return CapabilityScan::NotApplicable;
    };
    if is_multipart {
        return CapabilityScan::NotApplicable;
    }
    let mut fingerprint = Fingerprint {
        group: group.to_string(),
        ..Fingerprint::default()
    };
    let probe = match serde_json::from_slice::<RequestProbe>(body) {
        Ok(probe) => probe,
        Err(err) => {
            log::debug!("event=capability_scan_skipped reason=invalid_json err={}", err);
            return CapabilityScan::Fingerprint(fingerprint);
        }
    };

    fingerprint.model = probe
        .model
        .valid()
        .map(|model| model.trim().to_string())
        .unwrap_or_default();
    if fingerprint.model.is_empty() && mode == RelayMode::Moderations {
        fingerprint.model = DEFAULT_MODERATION_MODEL.to_string();
    }
    fingerprint.needs_stream = probe.stream.valid().copied().unwrap_or(false);
    let wants_logprobs = probe.logprobs.valid().copied().unwrap_or(false);
    let sample_count = probe.n.as_ref().map(SampleCount::value).unwrap_or(1);
    fingerprint.needs_non_deterministic = wants_logprobs || sample_count != 1;

    let mut input_tokens = 0usize;
    let messages: Vec<&MessageProbe> = probe
        .messages
        .valid()
        .map(|items| items.iter().filter_map(Lenient::valid).collect())
        .unwrap_or_default();
    for message in &messages {
        if message.role.valid().is_some_and(|role| role == "system") {
            fingerprint.has_system_prompt = true;
        }
        if message
            .tool_calls
            .as_ref()
            .is_some_and(ToolCallsProbe::is_non_empty)
        {
            fingerprint.needs_function_call = true;
        }
        let mut text = String::new();
        match &message.content {
            Some(ContentProbe::Text(content)) => text.push_str(content),
            Some(ContentProbe::Parts(parts)) => {
                for part in parts.iter().filter_map(Lenient::valid) {
                    match part.part_type.valid().map(String::as_str) {
                        Some("image_url") => fingerprint.needs_image = true,
                        Some("text") => {
                            if let Some(part_text) = part.text.valid() {
                                text.push_str(part_text);
                            }
                        }
                        _ => {}
                    }
                }
            }
            Some(ContentProbe::Other(_)) | None => {}
        }
        input_tokens += TOKENS_PER_MESSAGE + counter.count_text(&text, &fingerprint.model);
    }
    if !messages.is_empty() {
        input_tokens += TOKENS_REPLY_PRIMING;
    }
    for prompt in [probe.prompt.as_ref(), probe.input.as_ref()].into_iter().flatten() {
        for text in prompt.texts() {
            input_tokens += counter.count_text(text, &fingerprint.model);
        }
    }
    fingerprint.estimated_input_tokens = input_tokens;
    CapabilityScan::Fingerprint(fingerprint)
}
