//! GRASP Wire Protocol
//!
//! Typed frames for the `/live` stream: one request per turn, a stream of
//! tagged events back, and a flow-control acknowledgement after every event.
//! Control frames (error/cancelled) carry no `type` tag.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tasks supported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    #[serde(rename = "sparql-qa")]
    SparqlQa,
    #[serde(rename = "general-qa")]
    GeneralQa,
    #[serde(rename = "cea")]
    Cea,
}

impl Default for Task {
    fn default() -> Self {
        Task::SparqlQa
    }
}

impl Task {
    pub fn all() -> [Task; 3] {
        [Task::SparqlQa, Task::GeneralQa, Task::Cea]
    }

    /// Wire identifier, as sent in request frames.
    pub fn id(&self) -> &'static str {
        match self {
            Task::SparqlQa => "sparql-qa",
            Task::GeneralQa => "general-qa",
            Task::Cea => "cea",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Task::SparqlQa => "SPARQL question answering",
            Task::GeneralQa => "General question answering",
            Task::Cea => "Table annotation (CEA)",
        }
    }

    pub fn parse(s: &str) -> Option<Task> {
        Task::all().into_iter().find(|t| t.id() == s)
    }

    /// Whether this task takes a table instead of a text question.
    pub fn takes_table(&self) -> bool {
        matches!(self, Task::Cea)
    }
}

/// Table input for the annotation task. `annotate_rows` omitted entirely
/// means "annotate all rows".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TablePayload {
    pub header: Vec<String>,
    pub data: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotate_rows: Option<Vec<usize>>,
}

/// Input of a request frame: a question or a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryInput {
    Text(String),
    Table(TablePayload),
}

/// Opaque continuation state returned by a completed turn and re-sent on the
/// next request so the backend can continue the exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Continuation {
    pub messages: Vec<Value>,
    pub known: Vec<Value>,
}

/// One request frame per submitted turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub task: Task,
    pub input: QueryInput,
    pub knowledge_graphs: Vec<String>,
    pub past: Option<Continuation>,
}

/// Flow-control acknowledgement, sent after every inbound event frame.
/// The backend withholds further events until it arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckFrame {
    pub received: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel: Option<bool>,
}

impl AckFrame {
    pub fn received() -> Self {
        AckFrame {
            received: true,
            cancel: None,
        }
    }

    pub fn cancelling() -> Self {
        AckFrame {
            received: true,
            cancel: Some(true),
        }
    }
}

/// Terminal event of a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputEvent {
    pub task: Task,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub elapsed: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default)]
    pub messages: Vec<Value>,
    #[serde(default)]
    pub known: Vec<Value>,
}

impl OutputEvent {
    /// Continuation state threaded into the next request.
    pub fn continuation(&self) -> Continuation {
        Continuation {
            messages: self.messages.clone(),
            known: self.known.clone(),
        }
    }

    /// The formal answer text, when the inner output payload carries one.
    pub fn primary_text(&self) -> Option<&str> {
        let inner = self.output.as_ref()?;
        inner
            .get("output")
            .or_else(|| inner.get("formatted"))
            .and_then(Value::as_str)
    }
}

/// One streamed event belonging to a turn. Unrecognized tags are preserved
/// verbatim instead of killing the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    Input {
        #[serde(default)]
        input: Value,
    },
    System {
        #[serde(default)]
        functions: Vec<Value>,
        #[serde(default)]
        system_message: String,
    },
    Model {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        reasoning: Option<String>,
    },
    Tool {
        name: String,
        #[serde(default)]
        args: Value,
        #[serde(default)]
        result: Value,
    },
    Feedback {
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        feedback: Option<String>,
    },
    Output(OutputEvent),
    #[serde(untagged)]
    Unknown(Value),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Input { .. } => "input",
            Event::System { .. } => "system",
            Event::Model { .. } => "model",
            Event::Tool { .. } => "tool",
            Event::Feedback { .. } => "feedback",
            Event::Output(_) => "output",
            Event::Unknown(_) => "unknown",
        }
    }

    pub fn is_output(&self) -> bool {
        matches!(self, Event::Output(_))
    }

    /// Text used for duplicate-reasoning comparison: the model message for
    /// reasoning events, the formal answer for output events.
    pub fn primary_text(&self) -> Option<&str> {
        match self {
            Event::Model { message, .. } => message.as_deref(),
            Event::Output(out) => out.primary_text(),
            _ => None,
        }
    }
}

/// Classification of one decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Tagged event belonging to the current turn.
    Event(Event),
    /// The backend aborted the turn.
    Error {
        message: String,
        status: Option<u16>,
    },
    /// Cancel acknowledgement; the in-progress turn is void.
    Cancelled,
    /// Anything else; logged and dropped by the caller.
    Ignored(Value),
}

/// Classify a decoded inbound frame. A `type` field makes it an event;
/// otherwise `error` and `cancelled` control frames are recognized.
pub fn classify(value: Value) -> InboundFrame {
    if value.get("type").is_some() {
        let event = serde_json::from_value::<Event>(value.clone())
            .unwrap_or(Event::Unknown(value));
        return InboundFrame::Event(event);
    }

    if let Some(error) = value.get("error") {
        let message = match error.as_str() {
            Some(s) => s.to_string(),
            None => error.to_string(),
        };
        let status = value
            .get("status")
            .and_then(Value::as_u64)
            .map(|s| s as u16);
        return InboundFrame::Error { message, status };
    }

    if value.get("cancelled").and_then(Value::as_bool) == Some(true) {
        return InboundFrame::Cancelled;
    }

    InboundFrame::Ignored(value)
}
