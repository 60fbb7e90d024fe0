//! Outbound request interception that asks the agent for an info board.
//!
//! Every request to the agent backend goes through one [`RequestSender`].
//! [`NetworkEntryPoint::install_injection`] swaps in an [`InjectingSender`]
//! that appends the standing instruction to generation payloads and then
//! delegates to the original sender. Inspection never blocks a request: on any
//! doubt the request goes out untouched.

use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::Request;
use serde_json::{json, Value};

use crate::events::BoardEvent;
use crate::prefs::{PreferenceStore, Preferences};

/// Sentinel that marks a payload as already carrying the instruction.
pub const INJECTION_MARKER: &str = "<!-- IBS_PROMPT -->";

pub const STANDING_INSTRUCTION: &str = "<!-- IBS_PROMPT -->
• At the beginning of your next reply, write an informational board inside of <info_board> following the format, filling placeholders based on the current setting, and logically progressing based off of what occurred in the last message. Ensure that contents are always inside codeblock:

<info_board>
```
Posture: [Sentence about the current appearance of agent, focusing on pose, action and clothing or nude state]
Clothes: [Sentence about the clothes the agent is wearing right now.]
Affinity: [# {{char}}’s aff value] (Word or phrase reflecting agent's feeling for {{USER}})
Mood: [Agent's mood]
Emoji: [Kaomoji that depict agent's current state]
Thought: [“Agent’s internal thought”]
Arousal: [% Agent’s arousal based on mood and stimulation agent receives] (Brief description of how turned on agent is)
Location: [Agent’s current location]
Timezone: [current time in 24-hour clock format] [current day in the simulation in Weekday Month Day, Year format] [the current season]
Objective: [briefly describe agent's current goal in a few words]
```
</info_board>";

pub const GENERATION_URL_KEYWORDS: [&str; 6] =
    ["generate", "chat", "completion", "openai", "textgen", "backends"];

pub fn should_intercept_url(url: &str) -> bool {
    url.contains("/api/") && GENERATION_URL_KEYWORDS.iter().any(|kw| url.contains(kw))
}

pub fn should_intercept(method: &str, url: &str) -> bool {
    method.eq_ignore_ascii_case("POST") && should_intercept_url(url)
}

/// Path and query of `url`. The keyword filter only ever looks at this, so
/// the upstream host name cannot make unrelated endpoints match.
pub fn request_target(url: &reqwest::Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    Messages,
    Prompt,
    SystemPrompt,
}

impl PayloadShape {
    pub fn as_str(self) -> &'static str {
        match self {
            PayloadShape::Messages => "messages",
            PayloadShape::Prompt => "prompt",
            PayloadShape::SystemPrompt => "system_prompt",
        }
    }
}

pub struct InjectionRule {
    pub shape: PayloadShape,
    applies: fn(&Value) -> bool,
    already_present: fn(&Value) -> bool,
    inject: fn(&mut Value, &Preferences),
}

/// Ordered; the first rule whose shape matches decides the outcome.
pub const INJECTION_RULES: [InjectionRule; 3] = [
    InjectionRule {
        shape: PayloadShape::Messages,
        applies: |payload| payload.get("messages").is_some_and(Value::is_array),
        already_present: messages_carry_marker,
        inject: push_instruction_message,
    },
    InjectionRule {
        shape: PayloadShape::Prompt,
        applies: |payload| payload.get("prompt").is_some_and(Value::is_string),
        already_present: |payload| string_carries_marker(payload, "prompt"),
        inject: |payload, _| append_instruction(payload, "prompt"),
    },
    InjectionRule {
        shape: PayloadShape::SystemPrompt,
        applies: |payload| payload.get("system_prompt").is_some_and(Value::is_string),
        already_present: |payload| string_carries_marker(payload, "system_prompt"),
        inject: |payload, _| append_instruction(payload, "system_prompt"),
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectOutcome {
    Injected(PayloadShape),
    AlreadyPresent(PayloadShape),
    Disabled,
    Unrecognized,
}

/// Apply the first matching rule to `payload`. Only ever adds content.
pub fn inject_into_payload(payload: &mut Value, prefs: &Preferences) -> InjectOutcome {
    if !prefs.auto_inject_prompt {
        return InjectOutcome::Disabled;
    }
    if !payload.is_object() {
        return InjectOutcome::Unrecognized;
    }

    let Some(rule) = INJECTION_RULES.iter().find(|rule| (rule.applies)(payload)) else {
        return InjectOutcome::Unrecognized;
    };
    if (rule.already_present)(payload) {
        return InjectOutcome::AlreadyPresent(rule.shape);
    }
    (rule.inject)(payload, prefs);
    InjectOutcome::Injected(rule.shape)
}

fn content_carries_marker(content: &Value) -> bool {
    match content {
        Value::String(text) => text.contains(INJECTION_MARKER),
        Value::Array(parts) => parts.iter().any(|part| match part {
            Value::String(text) => text.contains(INJECTION_MARKER),
            Value::Object(_) => part
                .get("text")
                .and_then(Value::as_str)
                .is_some_and(|text| text.contains(INJECTION_MARKER)),
            _ => false,
        }),
        _ => false,
    }
}

fn messages_carry_marker(payload: &Value) -> bool {
    payload
        .get("messages")
        .and_then(Value::as_array)
        .is_some_and(|messages| {
            messages
                .iter()
                .filter_map(|message| message.get("content"))
                .any(content_carries_marker)
        })
}

fn push_instruction_message(payload: &mut Value, prefs: &Preferences) {
    if let Some(messages) = payload.get_mut("messages").and_then(Value::as_array_mut) {
        messages.push(json!({
            "role": prefs.inject_mode.as_str(),
            "content": STANDING_INSTRUCTION,
        }));
    }
}

fn string_carries_marker(payload: &Value, field: &str) -> bool {
    payload
        .get(field)
        .and_then(Value::as_str)
        .is_some_and(|text| text.contains(INJECTION_MARKER))
}

fn append_instruction(payload: &mut Value, field: &str) {
    if let Some(Value::String(text)) = payload.get_mut(field) {
        text.push_str("\n\n");
        text.push_str(STANDING_INSTRUCTION);
    }
}

/// The single outbound send entry point.
#[async_trait]
pub trait RequestSender: Send + Sync {
    type Output: Send;

    async fn send(&self, request: Request) -> Self::Output;
}

#[async_trait]
impl RequestSender for reqwest::Client {
    type Output = reqwest::Result<reqwest::Response>;

    async fn send(&self, request: Request) -> Self::Output {
        self.execute(request).await
    }
}

pub struct InjectingSender<S> {
    inner: Arc<S>,
    prefs: Arc<PreferenceStore>,
    events: Option<flume::Sender<BoardEvent>>,
}

impl<S: RequestSender> InjectingSender<S> {
    pub fn new(
        inner: Arc<S>,
        prefs: Arc<PreferenceStore>,
        events: Option<flume::Sender<BoardEvent>>,
    ) -> Self {
        Self {
            inner,
            prefs,
            events,
        }
    }

    /// The augmented replacement for `request`, or `None` when it should go
    /// out as is.
    fn prepare(&self, request: &Request) -> Result<Option<(Request, PayloadShape)>> {
        if !should_intercept(request.method().as_str(), &request_target(request.url())) {
            return Ok(None);
        }
        let prefs = self.prefs.snapshot();
        if !prefs.auto_inject_prompt {
            return Ok(None);
        }

        if let Some(content_type) = request.headers().get(CONTENT_TYPE) {
            let is_json = content_type
                .to_str()
                .map(|ct| ct.to_ascii_lowercase().contains("application/json"))
                .unwrap_or(false);
            if !is_json {
                return Ok(None);
            }
        }

        // Streaming bodies have no bytes to look at.
        let Some(bytes) = request.body().and_then(|body| body.as_bytes()) else {
            return Ok(None);
        };
        let Ok(text) = std::str::from_utf8(bytes) else {
            return Ok(None);
        };
        let Ok(mut payload) = serde_json::from_str::<Value>(text) else {
            return Ok(None);
        };

        let shape = match inject_into_payload(&mut payload, &prefs) {
            InjectOutcome::Injected(shape) => shape,
            outcome => {
                tracing::trace!("No injection for {}: {:?}", request.url(), outcome);
                return Ok(None);
            }
        };

        let body = serde_json::to_vec(&payload).context("Failed to re-encode payload")?;
        let mut rebuilt = request
            .try_clone()
            .context("Request could not be cloned for injection")?;
        *rebuilt.body_mut() = Some(body.into());

        let headers = rebuilt.headers_mut();
        if !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        headers.remove(CONTENT_LENGTH);

        Ok(Some((rebuilt, shape)))
    }
}

#[async_trait]
impl<S: RequestSender> RequestSender for InjectingSender<S> {
    type Output = S::Output;

    async fn send(&self, request: Request) -> Self::Output {
        match self.prepare(&request) {
            Ok(Some((rebuilt, shape))) => {
                let url = rebuilt.url().to_string();
                tracing::info!("Injected info board prompt into request: {}", url);
                if let Some(events) = self.events.as_ref() {
                    let _ = events.send(BoardEvent::PromptInjected {
                        url,
                        shape: shape.as_str().to_string(),
                    });
                }
                self.inner.send(rebuilt).await
            }
            Ok(None) => self.inner.send(request).await,
            Err(e) => {
                tracing::warn!("Request inspection failed, sending unchanged: {:#}", e);
                self.inner.send(request).await
            }
        }
    }
}

/// Owner of the outbound sender. Before installation requests go straight to
/// the original; afterwards through the injecting wrapper.
pub struct NetworkEntryPoint<S> {
    original: Arc<S>,
    installed: OnceLock<Arc<InjectingSender<S>>>,
}

impl<S: RequestSender> NetworkEntryPoint<S> {
    pub fn new(original: S) -> Self {
        Self {
            original: Arc::new(original),
            installed: OnceLock::new(),
        }
    }

    /// Idempotent. Returns whether this call did the installation.
    pub fn install_injection(
        &self,
        prefs: Arc<PreferenceStore>,
        events: Option<flume::Sender<BoardEvent>>,
    ) -> bool {
        let wrapper = Arc::new(InjectingSender::new(self.original.clone(), prefs, events));
        let installed = self.installed.set(wrapper).is_ok();
        if installed {
            tracing::info!("Request injection installed");
        }
        installed
    }

    pub fn is_installed(&self) -> bool {
        self.installed.get().is_some()
    }

    pub fn original(&self) -> &S {
        &self.original
    }
}

#[async_trait]
impl<S: RequestSender> RequestSender for NetworkEntryPoint<S> {
    type Output = S::Output;

    async fn send(&self, request: Request) -> Self::Output {
        match self.installed.get() {
            Some(wrapper) => wrapper.send(request).await,
            None => self.original.send(request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefs::InjectRole;
    use crate::store::MemoryKvStore;
    use reqwest::{Body, Method, Url};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<Request>>,
    }

    impl RecordingSender {
        fn last_body(&self) -> Option<Value> {
            let sent = self.sent.lock().unwrap();
            let bytes = sent.last()?.body()?.as_bytes()?;
            serde_json::from_slice(bytes).ok()
        }
    }

    #[async_trait]
    impl RequestSender for RecordingSender {
        type Output = ();

        async fn send(&self, request: Request) -> Self::Output {
            self.sent.lock().unwrap().push(request);
        }
    }

    fn enabled(mode: InjectRole) -> Preferences {
        Preferences {
            auto_inject_prompt: true,
            inject_mode: mode,
            ..Preferences::default()
        }
    }

    fn prefs_store(prefs: Preferences) -> Arc<PreferenceStore> {
        let store = Arc::new(PreferenceStore::load(Arc::new(MemoryKvStore::new())));
        store.replace(prefs);
        store
    }

    fn post(url: &str, body: &str) -> Request {
        let mut request = Request::new(Method::POST, Url::parse(url).unwrap());
        *request.body_mut() = Some(Body::from(body.to_string()));
        request
    }

    #[test]
    fn url_filter_requires_api_and_keyword() {
        assert!(should_intercept_url("http://h/api/backends/chat-completions/generate"));
        assert!(should_intercept_url("http://h/api/openai/x"));
        assert!(!should_intercept_url("http://h/api/assets/list"));
        assert!(!should_intercept_url("http://h/generate"));
        assert!(should_intercept("post", "http://h/api/chat"));
        assert!(!should_intercept("GET", "http://h/api/chat"));
    }

    #[test]
    fn messages_payload_gets_one_instruction() {
        let prefs = enabled(InjectRole::User);
        let mut payload = json!({"messages": [{"role": "user", "content": "hi"}]});

        assert_eq!(
            inject_into_payload(&mut payload, &prefs),
            InjectOutcome::Injected(PayloadShape::Messages)
        );
        assert_eq!(
            inject_into_payload(&mut payload, &prefs),
            InjectOutcome::AlreadyPresent(PayloadShape::Messages)
        );

        let messages = payload["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["content"], "hi");
        assert_eq!(messages[1]["role"], "user");
        assert!(messages[1]["content"]
            .as_str()
            .unwrap()
            .starts_with(INJECTION_MARKER));
    }

    #[test]
    fn marker_inside_content_parts_counts() {
        let prefs = enabled(InjectRole::System);
        let mut payload = json!({"messages": [{"role": "system", "content": [
            {"type": "text", "text": format!("{} earlier", INJECTION_MARKER)}
        ]}]});
        assert_eq!(
            inject_into_payload(&mut payload, &prefs),
            InjectOutcome::AlreadyPresent(PayloadShape::Messages)
        );
    }

    #[test]
    fn prompt_shapes_dispatch_in_order() {
        let prefs = enabled(InjectRole::System);

        let mut prompt = json!({"prompt": "Once upon", "system_prompt": "sys"});
        assert_eq!(
            inject_into_payload(&mut prompt, &prefs),
            InjectOutcome::Injected(PayloadShape::Prompt)
        );
        assert!(prompt.get("messages").is_none());
        assert_eq!(
            prompt["prompt"],
            format!("Once upon\n\n{}", STANDING_INSTRUCTION)
        );
        assert_eq!(prompt["system_prompt"], "sys");

        let mut system = json!({"system_prompt": "sys", "max_tokens": 10});
        assert_eq!(
            inject_into_payload(&mut system, &prefs),
            InjectOutcome::Injected(PayloadShape::SystemPrompt)
        );
        assert_eq!(system["max_tokens"], 10);

        let mut messages = json!({"messages": [], "prompt": "p"});
        inject_into_payload(&mut messages, &prefs);
        assert_eq!(messages["prompt"], "p");
    }

    #[test]
    fn disabled_or_unknown_payloads_are_untouched() {
        let mut payload = json!({"prompt": "x"});
        assert_eq!(
            inject_into_payload(&mut payload, &Preferences::default()),
            InjectOutcome::Disabled
        );
        assert_eq!(payload, json!({"prompt": "x"}));

        let prefs = enabled(InjectRole::System);
        let mut other = json!({"input": "x"});
        assert_eq!(
            inject_into_payload(&mut other, &prefs),
            InjectOutcome::Unrecognized
        );
        let mut list = json!([1, 2]);
        assert_eq!(
            inject_into_payload(&mut list, &prefs),
            InjectOutcome::Unrecognized
        );
    }

    #[tokio::test]
    async fn wrapper_rewrites_generation_requests_only() {
        let recorder = RecordingSender::default();
        let entry = NetworkEntryPoint::new(recorder);
        let (tx, rx) = flume::unbounded();
        assert!(entry.install_injection(prefs_store(enabled(InjectRole::System)), Some(tx)));

        entry
            .send(post("http://h/api/assets/list", r#"{"prompt":"x"}"#))
            .await;
        assert_eq!(entry.original().last_body(), Some(json!({"prompt": "x"})));

        let mut request = post(
            "http://h/api/backends/text-completions/generate",
            r#"{"prompt":"x"}"#,
        );
        request
            .headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from_static("14"));
        entry.send(request).await;

        {
            let sent = entry.original().sent.lock().unwrap();
            let last = sent.last().unwrap();
            assert_eq!(last.headers()[CONTENT_TYPE], "application/json");
            assert!(last.headers().get(CONTENT_LENGTH).is_none());
        }
        let body = entry.original().last_body().unwrap();
        assert!(body["prompt"].as_str().unwrap().contains(INJECTION_MARKER));

        match rx.try_recv() {
            Ok(BoardEvent::PromptInjected { url, shape }) => {
                assert!(url.ends_with("/generate"));
                assert_eq!(shape, "prompt");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn non_json_and_streaming_bodies_pass_through() {
        let entry = NetworkEntryPoint::new(RecordingSender::default());
        entry.install_injection(prefs_store(enabled(InjectRole::System)), None);

        let mut text = post("http://h/api/chat", r#"{"prompt":"x"}"#);
        text.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        entry.send(text).await;
        assert_eq!(entry.original().last_body(), Some(json!({"prompt": "x"})));

        entry.send(post("http://h/api/chat", "not json")).await;
        assert_eq!(entry.original().sent.lock().unwrap().len(), 2);

        let mut streaming = Request::new(Method::POST, Url::parse("http://h/api/chat").unwrap());
        let chunks = futures_util::stream::iter(vec![Ok::<_, std::io::Error>(
            br#"{"prompt":"x"}"#.to_vec(),
        )]);
        *streaming.body_mut() = Some(Body::wrap_stream(chunks));
        entry.send(streaming).await;

        let sent = entry.original().sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        assert!(sent[2].body().unwrap().as_bytes().is_none());
    }

    #[tokio::test]
    async fn keyword_in_host_does_not_match() {
        let entry = NetworkEntryPoint::new(RecordingSender::default());
        entry.install_injection(prefs_store(enabled(InjectRole::System)), None);

        entry
            .send(post("http://chat.lan:8000/api/assets/list", r#"{"prompt":"x"}"#))
            .await;
        assert_eq!(entry.original().last_body(), Some(json!({"prompt": "x"})));

        entry
            .send(post("http://chat.lan:8000/api/chat?stream=1", r#"{"prompt":"x"}"#))
            .await;
        let body = entry.original().last_body().unwrap();
        assert!(body["prompt"].as_str().unwrap().contains(INJECTION_MARKER));

        let url = Url::parse("http://openai.example/api/files?q=generate").unwrap();
        assert_eq!(request_target(&url), "/api/files?q=generate");
    }

    #[tokio::test]
    async fn existing_content_type_is_kept() {
        let entry = NetworkEntryPoint::new(RecordingSender::default());
        entry.install_injection(prefs_store(enabled(InjectRole::System)), None);

        let mut request = post("http://h/api/chat", r#"{"prompt":"x"}"#);
        request.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        entry.send(request).await;

        let sent = entry.original().sent.lock().unwrap();
        let last = sent.last().unwrap();
        assert_eq!(
            last.headers()[CONTENT_TYPE],
            "application/json; charset=utf-8"
        );
        let body: Value = serde_json::from_slice(last.body().unwrap().as_bytes().unwrap()).unwrap();
        assert!(body["prompt"].as_str().unwrap().contains(INJECTION_MARKER));
    }

    #[test]
    fn rewritten_payload_keeps_field_order() {
        let prefs = enabled(InjectRole::System);
        let mut payload: Value =
            serde_json::from_str(r#"{"model":"m","prompt":"p","max_tokens":5}"#).unwrap();
        inject_into_payload(&mut payload, &prefs);
        let keys: Vec<&str> = payload
            .as_object()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(keys, ["model", "prompt", "max_tokens"]);
    }

    #[tokio::test]
    async fn installation_is_idempotent() {
        let entry = NetworkEntryPoint::new(RecordingSender::default());
        assert!(!entry.is_installed());

        let prefs = prefs_store(enabled(InjectRole::System));
        assert!(entry.install_injection(prefs.clone(), None));
        assert!(!entry.install_injection(prefs, None));
        assert!(entry.is_installed());

        entry
            .send(post("http://h/api/chat", r#"{"messages":[]}"#))
            .await;
        let body = entry.original().last_body().unwrap();
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn uninstalled_entry_point_delegates_unchanged() {
        let entry = NetworkEntryPoint::new(RecordingSender::default());
        entry
            .send(post("http://h/api/chat", r#"{"messages":[]}"#))
            .await;
        assert_eq!(entry.original().last_body(), Some(json!({"messages": []})));
    }
}
