//! Interpreters - the pluggable language runtimes a process hosts
//!
//! An interpreter takes a script plus an [`InterpreterContext`] and produces
//! an [`InterpreterResult`]. The runtime behind it is out of scope; this
//! crate only schedules, wires and observes it.

pub mod factory;
pub mod hooks;
pub mod managed;
pub mod output;
pub mod shell;

pub use factory::InterpreterFactory;
pub use hooks::{HookEvent, InterpreterHookRegistry};
pub use managed::ManagedInterpreter;
pub use output::{InterpreterOutput, OutputListener};
pub use shell::ShellInterpreter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::angular::AngularObjectRegistry;
use crate::resource::DistributedResourcePool;
use crate::rpc::event::EventRelay;
use crate::rpc::protocol::InterpreterEvent;
use crate::scheduler::SchedulingPolicy;

/// Local property that asks interpret to attach to an existing job
pub const RECOVER_PROPERTY: &str = "isRecover";
/// Local property naming the resource a result should be saved under
pub const SAVE_AS_PROPERTY: &str = "saveAs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultCode {
    Success,
    Incomplete,
    Error,
    /// No new result; the caller keeps whatever it showed before
    KeepPreviousResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Text,
    Html,
    Table,
    Img,
    Angular,
    Null,
}

impl MessageType {
    /// Type named by a leading `%html`, `%table`, ... display directive
    pub fn from_magic(word: &str) -> Option<Self> {
        match word {
            "%text" => Some(MessageType::Text),
            "%html" => Some(MessageType::Html),
            "%table" => Some(MessageType::Table),
            "%img" => Some(MessageType::Img),
            "%angular" => Some(MessageType::Angular),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub data: String,
}

impl ResultMessage {
    pub fn new(kind: MessageType, data: impl Into<String>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    pub fn text(data: impl Into<String>) -> Self {
        Self::new(MessageType::Text, data)
    }

    /// Split a leading display directive off `raw`; plain text otherwise.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim_start();
        let (word, rest) = match trimmed.find(char::is_whitespace) {
            Some(at) => (&trimmed[..at], &trimmed[at..]),
            None => (trimmed, ""),
        };
        match MessageType::from_magic(word) {
            Some(kind) => {
                let rest = rest.strip_prefix(['\n', ' ']).unwrap_or(rest);
                Self::new(kind, rest)
            }
            None => Self::text(raw),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.data.trim().is_empty()
    }
}

/// Outcome of one interpret call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpreterResult {
    pub code: ResultCode,
    pub messages: Vec<ResultMessage>,
}

impl InterpreterResult {
    pub fn new(code: ResultCode) -> Self {
        Self {
            code,
            messages: Vec::new(),
        }
    }

    pub fn with_message(code: ResultCode, message: ResultMessage) -> Self {
        Self {
            code,
            messages: vec![message],
        }
    }

    pub fn success(text: impl Into<String>) -> Self {
        Self::with_message(ResultCode::Success, ResultMessage::text(text))
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::with_message(ResultCode::Error, ResultMessage::text(text))
    }

    pub fn keep_previous() -> Self {
        Self::new(ResultCode::KeepPreviousResult)
    }

    /// Result whose single message honours a leading display directive.
    pub fn parsed(code: ResultCode, raw: &str) -> Self {
        Self::with_message(code, ResultMessage::parse(raw))
    }

    pub fn push(&mut self, message: ResultMessage) {
        self.messages.push(message);
    }

    /// All message payloads joined with newlines
    pub fn text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.data.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Which dynamic-form syntax an interpreter understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FormType {
    Native,
    Simple,
    None,
}

/// A completion suggestion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub meta: Option<String>,
}

impl Completion {
    pub fn new(name: impl Into<String>, value: impl Into<String>, meta: Option<&str>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            meta: meta.map(str::to_string),
        }
    }
}

/// Execution context as it travels over the wire
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteContext {
    pub note_id: String,
    pub note_name: String,
    pub paragraph_id: String,
    pub paragraph_title: String,
    pub paragraph_text: String,
    pub repl_name: String,
    pub user: String,
    pub local_properties: HashMap<String, String>,
    pub config: HashMap<String, Value>,
    pub gui: Value,
    pub note_gui: Value,
}

impl RemoteContext {
    pub fn new(note_id: impl Into<String>, paragraph_id: impl Into<String>) -> Self {
        Self {
            note_id: note_id.into(),
            paragraph_id: paragraph_id.into(),
            ..Default::default()
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.local_properties.insert(key.into(), value.into());
        self
    }
}

/// Manual progress overrides keyed by paragraph id
#[derive(Clone, Default)]
pub struct ProgressMap(Arc<Mutex<HashMap<String, u8>>>);

impl ProgressMap {
    pub fn set(&self, paragraph_id: &str, progress: u8) {
        if let Ok(mut map) = self.0.lock() {
            map.insert(paragraph_id.to_string(), progress.min(100));
        }
    }

    pub fn get(&self, paragraph_id: &str) -> Option<u8> {
        self.0.lock().ok().and_then(|map| map.get(paragraph_id).copied())
    }

    pub fn clear(&self, paragraph_id: &str) {
        if let Ok(mut map) = self.0.lock() {
            map.remove(paragraph_id);
        }
    }
}

/// Everything an interpreter sees while running one paragraph
#[derive(Clone)]
pub struct InterpreterContext {
    pub note_id: String,
    pub note_name: String,
    pub paragraph_id: String,
    pub paragraph_title: String,
    pub paragraph_text: String,
    pub repl_name: String,
    pub user: String,
    pub local_properties: HashMap<String, String>,
    pub config: HashMap<String, Value>,
    pub gui: Value,
    pub note_gui: Value,
    /// Incremental output; prepended to the returned result
    pub out: InterpreterOutput,
    pub resource_pool: Arc<DistributedResourcePool>,
    pub angular: Arc<AngularObjectRegistry>,
    progress: ProgressMap,
    events: Option<Arc<EventRelay>>,
    cancel: CancellationToken,
}

impl InterpreterContext {
    pub fn new(
        remote: RemoteContext,
        out: InterpreterOutput,
        resource_pool: Arc<DistributedResourcePool>,
        angular: Arc<AngularObjectRegistry>,
        progress: ProgressMap,
    ) -> Self {
        Self {
            note_id: remote.note_id,
            note_name: remote.note_name,
            paragraph_id: remote.paragraph_id,
            paragraph_title: remote.paragraph_title,
            paragraph_text: remote.paragraph_text,
            repl_name: remote.repl_name,
            user: remote.user,
            local_properties: remote.local_properties,
            config: remote.config,
            gui: remote.gui,
            note_gui: remote.note_gui,
            out,
            resource_pool,
            angular,
            progress,
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    /// A context with a private pool and registry and no event channel.
    pub fn standalone(remote: RemoteContext) -> Self {
        let relay = Arc::new(EventRelay::detached());
        Self::new(
            remote,
            InterpreterOutput::detached(),
            Arc::new(DistributedResourcePool::new("standalone", relay.clone())),
            Arc::new(AngularObjectRegistry::new("standalone", relay)),
            ProgressMap::default(),
        )
    }

    pub fn with_events(mut self, events: Arc<EventRelay>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn local_property(&self, key: &str) -> Option<&str> {
        self.local_properties.get(key).map(String::as_str)
    }

    pub fn is_recover(&self) -> bool {
        self.local_property(RECOVER_PROPERTY)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    pub fn save_as(&self) -> Option<&str> {
        self.local_property(SAVE_AS_PROPERTY)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Override the progress reported for this paragraph.
    pub fn set_progress(&self, progress: u8) {
        let progress = progress.min(100);
        self.progress.set(&self.paragraph_id, progress);
        if let Some(events) = &self.events {
            events.emit(InterpreterEvent::Progress {
                note_id: self.note_id.clone(),
                paragraph_id: self.paragraph_id.clone(),
                progress,
            });
        }
    }

    pub fn progress_override(&self) -> Option<u8> {
        self.progress.get(&self.paragraph_id)
    }
}

/// A language runtime hosted by an interpreter process
#[async_trait]
pub trait Interpreter: Send + Sync {
    /// Name the factory knows this interpreter by
    fn class_name(&self) -> &str;

    async fn open(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    async fn interpret(&self, script: &str, ctx: &InterpreterContext) -> Result<InterpreterResult>;

    /// Best-effort cancellation of whatever `ctx` is running
    async fn cancel(&self, ctx: &InterpreterContext) -> Result<()>;

    /// 0-100
    async fn progress(&self, _ctx: &InterpreterContext) -> Result<u8> {
        Ok(0)
    }

    async fn completion(
        &self,
        _buffer: &str,
        _cursor: usize,
        _ctx: &InterpreterContext,
    ) -> Result<Vec<Completion>> {
        Ok(Vec::new())
    }

    fn form_type(&self) -> FormType {
        FormType::Native
    }

    fn scheduling(&self) -> SchedulingPolicy {
        SchedulingPolicy::Fifo
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_directives_are_parsed() {
        let msg = ResultMessage::parse("%html <b>hi</b>");
        assert_eq!(msg.kind, MessageType::Html);
        assert_eq!(msg.data, "<b>hi</b>");

        let msg = ResultMessage::parse("%table\na\tb\n1\t2");
        assert_eq!(msg.kind, MessageType::Table);
        assert_eq!(msg.data, "a\tb\n1\t2");

        let msg = ResultMessage::parse("100% done");
        assert_eq!(msg.kind, MessageType::Text);
        assert_eq!(msg.data, "100% done");
    }

    #[test]
    fn result_wire_form() {
        let result = InterpreterResult::success("hello");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["code"], "SUCCESS");
        assert_eq!(json["messages"][0]["type"], "TEXT");
        assert_eq!(json["messages"][0]["data"], "hello");

        let keep = serde_json::to_value(InterpreterResult::keep_previous()).unwrap();
        assert_eq!(keep["code"], "KEEP_PREVIOUS_RESULT");
    }

    #[test]
    fn remote_context_tolerates_missing_fields() {
        let ctx: RemoteContext = serde_json::from_str(r#"{"note_id":"n1"}"#).unwrap();
        assert_eq!(ctx.note_id, "n1");
        assert!(ctx.local_properties.is_empty());
    }

    #[tokio::test]
    async fn context_flags_and_progress() {
        let remote = RemoteContext::new("n1", "p1")
            .with_property(RECOVER_PROPERTY, "TRUE")
            .with_property(SAVE_AS_PROPERTY, " result ");
        let ctx = InterpreterContext::standalone(remote);
        assert!(ctx.is_recover());
        assert_eq!(ctx.save_as(), Some("result"));

        assert_eq!(ctx.progress_override(), None);
        ctx.set_progress(140);
        assert_eq!(ctx.progress_override(), Some(100));
    }
}
