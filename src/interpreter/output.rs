//! Paragraph output buffer
//!
//! Interpreters write incremental output here while a job runs. Every write
//! is forwarded to an [`OutputListener`] (normally the controller's event
//! channel) and the accumulated messages are prepended to the final result.
//!
//! The buffer is capped: once `limit` bytes have been written, the rest is
//! dropped and a single truncation notice is appended instead.

use std::sync::{Arc, Mutex, MutexGuard};

use super::{MessageType, ResultMessage};
use crate::rpc::event::EventRelay;
use crate::rpc::protocol::InterpreterEvent;

/// Default cap when none is configured (100KiB)
pub const DEFAULT_OUTPUT_LIMIT: usize = 100 * 1024;

/// Receives output as it is produced
pub trait OutputListener: Send + Sync {
    fn on_append(&self, index: usize, data: &str);
    fn on_update(&self, index: usize, message: &ResultMessage);
    fn on_update_all(&self, _messages: &[ResultMessage]) {}
    fn on_clear(&self);
}

struct OutputState {
    messages: Vec<ResultMessage>,
    /// Bytes accepted so far, notice excluded
    total_written: usize,
    truncated: bool,
}

/// Shared handle to one paragraph's output
#[derive(Clone)]
pub struct InterpreterOutput {
    state: Arc<Mutex<OutputState>>,
    limit: usize,
    listener: Option<Arc<dyn OutputListener>>,
}

enum Emit {
    Append(usize, String),
    Update(usize, ResultMessage),
}

impl InterpreterOutput {
    pub fn new(limit: usize, listener: Option<Arc<dyn OutputListener>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(OutputState {
                messages: Vec::new(),
                total_written: 0,
                truncated: false,
            })),
            limit,
            listener,
        }
    }

    /// Buffer nobody listens to
    pub fn detached() -> Self {
        Self::new(DEFAULT_OUTPUT_LIMIT, None)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Append text to the current message, starting a TEXT message if
    /// there is none yet.
    pub fn write(&self, data: &str) {
        if data.is_empty() {
            return;
        }
        let mut emitted = Vec::new();
        {
            let mut state = self.lock();
            if state.truncated {
                return;
            }
            if state.messages.is_empty() {
                state.messages.push(ResultMessage::text(""));
                emitted.push(Emit::Update(0, ResultMessage::text("")));
            }
            let index = state.messages.len() - 1;

            let remaining = self.limit.saturating_sub(state.total_written);
            let accepted = if data.len() <= remaining {
                data
            } else {
                &data[..floor_char_boundary(data, remaining)]
            };
            if !accepted.is_empty() {
                state.messages[index].data.push_str(accepted);
                state.total_written += accepted.len();
                emitted.push(Emit::Append(index, accepted.to_string()));
            }

            if accepted.len() < data.len() {
                state.truncated = true;
                let notice = ResultMessage::text(format!(
                    "\nOutput exceeds {} bytes. Truncated.\n",
                    self.limit
                ));
                state.messages.push(notice.clone());
                emitted.push(Emit::Update(index + 1, notice));
                tracing::debug!("Output truncated at {} bytes", self.limit);
            }
        }
        self.dispatch(emitted);
    }

    pub fn writeln(&self, data: &str) {
        self.write(data);
        self.write("\n");
    }

    /// Start a new message of the given type; later writes go to it.
    pub fn new_message(&self, kind: MessageType) {
        let emitted = {
            let mut state = self.lock();
            if state.truncated {
                return;
            }
            let message = ResultMessage::new(kind, "");
            state.messages.push(message.clone());
            vec![Emit::Update(state.messages.len() - 1, message)]
        };
        self.dispatch(emitted);
    }

    /// Start a message of `kind` holding `data`.
    pub fn write_message(&self, kind: MessageType, data: &str) {
        self.new_message(kind);
        self.write(data);
    }

    pub fn clear(&self) {
        {
            let mut state = self.lock();
            state.messages.clear();
            state.total_written = 0;
            state.truncated = false;
        }
        if let Some(listener) = &self.listener {
            listener.on_clear();
        }
    }

    /// Send the whole buffer to the listener in one go.
    pub fn publish_all(&self) {
        let messages = self.messages();
        if let Some(listener) = &self.listener {
            listener.on_update_all(&messages);
        }
    }

    /// Messages written so far, blank ones included
    pub fn messages(&self) -> Vec<ResultMessage> {
        self.lock().messages.clone()
    }

    pub fn size(&self) -> usize {
        self.lock().total_written
    }

    pub fn is_truncated(&self) -> bool {
        self.lock().truncated
    }

    fn dispatch(&self, emitted: Vec<Emit>) {
        let Some(listener) = &self.listener else {
            return;
        };
        for emit in emitted {
            match emit {
                Emit::Append(index, data) => listener.on_append(index, &data),
                Emit::Update(index, message) => listener.on_update(index, &message),
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, OutputState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn floor_char_boundary(s: &str, mut at: usize) -> usize {
    while at > 0 && !s.is_char_boundary(at) {
        at -= 1;
    }
    at
}

/// Forwards one paragraph's output to the controller
pub struct EventOutputListener {
    note_id: String,
    paragraph_id: String,
    events: Arc<EventRelay>,
}

impl EventOutputListener {
    pub fn new(note_id: impl Into<String>, paragraph_id: impl Into<String>, events: Arc<EventRelay>) -> Self {
        Self {
            note_id: note_id.into(),
            paragraph_id: paragraph_id.into(),
            events,
        }
    }
}

impl OutputListener for EventOutputListener {
    fn on_append(&self, index: usize, data: &str) {
        self.events.emit(InterpreterEvent::OutputAppend {
            note_id: self.note_id.clone(),
            paragraph_id: self.paragraph_id.clone(),
            index,
            data: data.to_string(),
        });
    }

    fn on_update(&self, index: usize, message: &ResultMessage) {
        self.events.emit(InterpreterEvent::OutputUpdate {
            note_id: self.note_id.clone(),
            paragraph_id: self.paragraph_id.clone(),
            index,
            kind: message.kind,
            data: message.data.clone(),
        });
    }

    fn on_update_all(&self, messages: &[ResultMessage]) {
        self.events.emit(InterpreterEvent::OutputUpdateAll {
            note_id: self.note_id.clone(),
            paragraph_id: self.paragraph_id.clone(),
            messages: messages.to_vec(),
        });
    }

    fn on_clear(&self) {
        self.events.emit(InterpreterEvent::OutputClear {
            note_id: self.note_id.clone(),
            paragraph_id: self.paragraph_id.clone(),
        });
    }
}
