//! Session Controller
//!
//! The conversation state machine. Owns the selected task, the
//! knowledge-graph selection, the ordered turn history, the continuation
//! state threaded into the next request, and the idle/running/cancelling
//! lifecycle of the one in-flight turn. The controller is synchronous and
//! transport-agnostic: `submit` returns the request frame to send and
//! `handle_frame` returns the acknowledgement to send, so a single dispatch
//! loop wires it to the channel and nothing here can re-enter itself.

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::protocol::{
    classify, AckFrame, Continuation, Event, InboundFrame, QueryInput, RequestFrame, Task,
};
use crate::share::{OutputSnapshot, SessionSnapshot};
use crate::store::{SessionState, Store};
use crate::transport::ConnectionState;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("not connected to the backend")]
    NotConnected,
    #[error("a request is already running")]
    Busy,
    #[error("no request is running")]
    NotRunning,
    #[error("cancellation already requested")]
    AlreadyCancelling,
    #[error("no knowledge graph selected")]
    NoKnowledgeGraphSelected,
    #[error("input is empty")]
    EmptyInput,
    #[error("table has no rows")]
    EmptyTable,
    #[error("row selection is empty or out of range")]
    InvalidRowSelection,
    #[error("the {task} task expects {expected} input")]
    InputMismatch {
        task: &'static str,
        expected: &'static str,
    },
    #[error("shared conversations cannot be shared again")]
    AlreadyShared,
    #[error("nothing to share yet")]
    NothingToShare,
}

/// Lifecycle of the one in-flight turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Cancelling,
}

/// User-facing status line. Pinned statuses survive until explicitly
/// replaced; plain ones are cleared by the next submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub text: String,
    pub pinned: bool,
}

/// One entry of the knowledge-graph catalog, in backend order.
#[derive(Debug, Clone, PartialEq)]
pub struct KgChoice {
    pub id: String,
    pub selected: bool,
}

/// One user-initiated exchange: the events streamed for one input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Turn {
    pub events: Vec<Event>,
    /// Turns restored from a shared snapshot cannot be re-shared.
    pub shared: bool,
}

/// What the dispatch loop must do after one inbound frame: send the
/// acknowledgement, if any, and refresh the display when the turn ended.
#[derive(Debug, Default, PartialEq)]
pub struct FrameOutcome {
    pub ack: Option<AckFrame>,
    pub turn_ended: bool,
}

pub struct SessionController {
    task: Task,
    knowledge_graphs: Vec<KgChoice>,
    turns: Vec<Turn>,
    continuation: Option<Continuation>,
    run_state: RunState,
    connection_state: ConnectionState,
    /// The cancel flag rides on exactly one acknowledgement per request.
    cancel_sent: bool,
    status: Option<Status>,
    /// Selection from a shared snapshot, applied once the catalog arrives.
    pending_selection: Option<Vec<String>>,
    store: Store,
}

impl SessionController {
    pub fn new(store: Store) -> Self {
        Self {
            task: Task::default(),
            knowledge_graphs: Vec::new(),
            turns: Vec::new(),
            continuation: None,
            run_state: RunState::Idle,
            connection_state: ConnectionState::Initial,
            cancel_sent: false,
            status: None,
            pending_selection: None,
            store,
        }
    }

    // ---- startup seeding ----

    /// Restore task and history from local persistence.
    pub fn restore_from_store(&mut self) {
        let settings = self.store.settings();
        if let Some(task) = settings.task {
            self.task = task;
        }
        let state = self.store.session_state();
        if let Some(output) = state.last_output {
            self.continuation = output.continuation();
            self.turns = output
                .histories
                .into_iter()
                .map(|events| Turn {
                    events,
                    shared: false,
                })
                .collect();
            if !self.turns.is_empty() {
                info!(turns = self.turns.len(), "Restored session from local persistence");
            }
        }
    }

    /// Seed the session from a shared snapshot. The snapshot wins outright
    /// over local persistence and is written back to it so a reload keeps
    /// the shared state.
    pub fn seed_from_snapshot(&mut self, snapshot: SessionSnapshot) {
        self.task = snapshot.task;
        self.store.set_task(snapshot.task);
        self.store.set_selected_kgs(&snapshot.selected_kgs);
        self.pending_selection = Some(snapshot.selected_kgs.clone());

        let mut state = SessionState::default();
        if let Some(last_input) = snapshot.last_input {
            match serde_json::from_value(last_input) {
                Ok(map) => state.last_input = map,
                Err(e) => debug!(error = %e, "Ignoring unreadable lastInput in snapshot"),
            }
        }
        state.last_output = snapshot.last_output.clone();
        self.store.replace_session_state(&state);

        self.turns.clear();
        self.continuation = None;
        if let Some(output) = snapshot.last_output {
            self.continuation = output.continuation();
            self.turns = output
                .histories
                .into_iter()
                .map(|events| Turn {
                    events,
                    shared: true,
                })
                .collect();
        }
        info!(task = %self.task.id(), turns = self.turns.len(), "Seeded session from shared snapshot");
    }

    /// Seed the knowledge-graph selection from the backend catalog,
    /// re-applying any persisted selection. If nothing persisted survives,
    /// the first catalog entry is selected.
    pub fn apply_catalog(&mut self, catalog: Vec<String>) {
        let persisted = self
            .pending_selection
            .take()
            .or_else(|| self.store.settings().selected_kgs)
            .unwrap_or_default();
        self.knowledge_graphs = catalog
            .into_iter()
            .map(|id| {
                let selected = persisted.contains(&id);
                KgChoice { id, selected }
            })
            .collect();
        if !self.knowledge_graphs.is_empty() && self.selected_kg_ids().is_empty() {
            self.knowledge_graphs[0].selected = true;
        }
        self.store.set_selected_kgs(&self.selected_kg_ids());
    }

    // ---- user actions ----

    /// Start a turn. Returns the request frame the caller must send.
    pub fn submit(&mut self, input: QueryInput) -> Result<RequestFrame, SessionError> {
        if self.connection_state != ConnectionState::Connected {
            return Err(SessionError::NotConnected);
        }
        if self.run_state != RunState::Idle {
            return Err(SessionError::Busy);
        }
        let knowledge_graphs = self.selected_kg_ids();
        if knowledge_graphs.is_empty() {
            return Err(SessionError::NoKnowledgeGraphSelected);
        }

        match &input {
            QueryInput::Text(text) => {
                if self.task.takes_table() {
                    return Err(SessionError::InputMismatch {
                        task: self.task.id(),
                        expected: "table",
                    });
                }
                if text.trim().is_empty() {
                    return Err(SessionError::EmptyInput);
                }
                self.store.set_last_input(self.task, text);
            }
            QueryInput::Table(table) => {
                if !self.task.takes_table() {
                    return Err(SessionError::InputMismatch {
                        task: self.task.id(),
                        expected: "text",
                    });
                }
                if table.data.is_empty() {
                    return Err(SessionError::EmptyTable);
                }
                if let Some(rows) = &table.annotate_rows {
                    if rows.is_empty() || rows.iter().any(|r| *r >= table.data.len()) {
                        return Err(SessionError::InvalidRowSelection);
                    }
                }
            }
        }

        if !self.status.as_ref().map(|s| s.pinned).unwrap_or(false) {
            self.status = None;
        }
        self.turns.push(Turn::default());
        self.run_state = RunState::Running;
        self.cancel_sent = false;
        info!(task = %self.task.id(), kgs = ?knowledge_graphs, "Submitting turn");

        // the backend rejects an empty past.messages, send null instead
        let past = self.continuation.clone().filter(|c| !c.messages.is_empty());
        Ok(RequestFrame {
            task: self.task,
            input,
            knowledge_graphs,
            past,
        })
    }

    /// Request cancellation of the running turn. Cooperative: the flag rides
    /// on the next acknowledgement and the backend decides when to stop; no
    /// outcome is fabricated locally.
    pub fn request_cancel(&mut self) -> Result<(), SessionError> {
        match self.run_state {
            RunState::Idle => Err(SessionError::NotRunning),
            RunState::Cancelling => Err(SessionError::AlreadyCancelling),
            RunState::Running => {
                self.run_state = RunState::Cancelling;
                info!("Cancellation requested");
                Ok(())
            }
        }
    }

    /// Toggle one knowledge graph. Turning off the last selected graph is a
    /// silent no-op; at least one stays selected once the catalog is known.
    pub fn toggle_kg(&mut self, id: &str) {
        let selected_count = self.knowledge_graphs.iter().filter(|kg| kg.selected).count();
        let Some(kg) = self.knowledge_graphs.iter_mut().find(|kg| kg.id == id) else {
            warn!(kg = %id, "Unknown knowledge graph");
            return;
        };
        if kg.selected && selected_count <= 1 {
            debug!(kg = %id, "Keeping the last selected knowledge graph");
            return;
        }
        kg.selected = !kg.selected;
        self.store.set_selected_kgs(&self.selected_kg_ids());
    }

    pub fn set_task(&mut self, task: Task) -> Result<(), SessionError> {
        if self.run_state != RunState::Idle {
            return Err(SessionError::Busy);
        }
        self.task = task;
        self.store.set_task(task);
        Ok(())
    }

    /// Clear turns, continuation, and the persisted session tier. Task and
    /// knowledge-graph selection stay.
    pub fn reset(&mut self) -> Result<(), SessionError> {
        if self.run_state != RunState::Idle {
            return Err(SessionError::Busy);
        }
        self.turns.clear();
        self.continuation = None;
        self.cancel_sent = false;
        self.status = None;
        self.store.clear_session_state();
        info!("Session reset");
        Ok(())
    }

    // ---- inbound dispatch ----

    /// Apply one decoded inbound frame to the session.
    pub fn handle_frame(&mut self, value: Value) -> FrameOutcome {
        match classify(value) {
            InboundFrame::Event(event) => self.handle_event(event),
            InboundFrame::Error { message, status } => self.handle_error(message, status),
            InboundFrame::Cancelled => self.handle_cancelled(),
            InboundFrame::Ignored(value) => {
                debug!(frame = %value, "Ignoring inbound frame");
                FrameOutcome::default()
            }
        }
    }

    fn handle_event(&mut self, event: Event) -> FrameOutcome {
        if self.run_state == RunState::Idle {
            // late frame after completion or teardown, not ours to ack
            warn!(kind = %event.kind(), "Dropping event without an in-flight turn");
            return FrameOutcome::default();
        }
        let Some(turn) = self.turns.last_mut() else {
            warn!("No turn to append to, dropping event");
            self.run_state = RunState::Idle;
            return FrameOutcome::default();
        };

        if let Event::Output(out) = &event {
            // general-qa sometimes streams the final answer twice, once as a
            // reasoning step and once as the formal output; keep the output
            if out.task == Task::GeneralQa {
                let duplicate = match (turn.events.last(), out.primary_text()) {
                    (Some(prev @ Event::Model { .. }), Some(answer)) => prev
                        .primary_text()
                        .map(|text| text.trim() == answer.trim())
                        .unwrap_or(false),
                    _ => false,
                };
                if duplicate {
                    debug!("Pruning reasoning step duplicated by the output");
                    turn.events.pop();
                }
            }
            self.continuation = Some(out.continuation());
        }

        let is_output = event.is_output();
        turn.events.push(event);

        if is_output {
            self.run_state = RunState::Idle;
            self.cancel_sent = false;
            self.persist_history();
        }

        // exactly one acknowledgement per event frame, the cancel flag on
        // at most one of them
        let ack = if self.run_state == RunState::Cancelling && !self.cancel_sent {
            self.cancel_sent = true;
            AckFrame::cancelling()
        } else {
            AckFrame::received()
        };
        FrameOutcome {
            ack: Some(ack),
            turn_ended: is_output,
        }
    }

    fn handle_error(&mut self, message: String, status: Option<u16>) -> FrameOutcome {
        let text = match status {
            Some(s) if (400..500).contains(&s) => {
                format!("Request rejected ({s}): {message}. Check your input.")
            }
            Some(s) if s >= 500 => {
                format!("Backend error ({s}): {message}. Try again shortly.")
            }
            _ => message.clone(),
        };
        warn!(status = ?status, error = %message, "Turn aborted by backend");
        let turn_ended = self.run_state != RunState::Idle;
        // the turn keeps the events received so far
        self.run_state = RunState::Idle;
        self.cancel_sent = false;
        self.status = Some(Status {
            text,
            pinned: false,
        });
        FrameOutcome {
            ack: None,
            turn_ended,
        }
    }

    fn handle_cancelled(&mut self) -> FrameOutcome {
        if self.run_state == RunState::Idle {
            debug!("Cancel acknowledgement without an in-flight turn");
            return FrameOutcome::default();
        }
        self.turns.pop();
        self.run_state = RunState::Idle;
        self.cancel_sent = false;
        self.status = Some(Status {
            text: "Request cancelled.".to_string(),
            pinned: false,
        });
        info!("Turn cancelled");
        FrameOutcome {
            ack: None,
            turn_ended: true,
        }
    }

    /// The transport closed; any in-flight turn is over, its events are
    /// retained.
    pub fn connection_closed(&mut self, reason: &str) {
        if self.run_state != RunState::Idle {
            warn!(reason = %reason, "Connection dropped mid-turn");
        }
        self.run_state = RunState::Idle;
        self.cancel_sent = false;
        self.connection_state = ConnectionState::Disconnected;
        let text = if reason.is_empty() {
            "Connection lost. Restart the client to reconnect.".to_string()
        } else {
            format!("Connection lost ({reason}). Restart the client to reconnect.")
        };
        self.status = Some(Status {
            text,
            pinned: false,
        });
    }

    // ---- sharing ----

    /// Snapshot for the share endpoint. Refused when any turn came from a
    /// shared snapshot; chained share provenance is ambiguous.
    pub fn share_snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        if self.turns.is_empty() {
            return Err(SessionError::NothingToShare);
        }
        if self.turns.iter().any(|t| t.shared) {
            return Err(SessionError::AlreadyShared);
        }
        Ok(self.snapshot())
    }

    /// Record that the current turns were published. Subsequent share
    /// attempts on the same conversation are refused.
    pub fn mark_shared(&mut self) {
        for turn in &mut self.turns {
            turn.shared = true;
        }
    }

    /// The persistence/share projection of the current session.
    pub fn snapshot(&self) -> SessionSnapshot {
        let continuation = self.continuation.clone().unwrap_or_default();
        let last_input = self.store.session_state().last_input;
        SessionSnapshot {
            task: self.task,
            selected_kgs: self.selected_kg_ids(),
            last_input: if last_input.is_empty() {
                None
            } else {
                serde_json::to_value(last_input).ok()
            },
            last_output: Some(OutputSnapshot {
                past_messages: continuation.messages,
                past_known: continuation.known,
                histories: self.turns.iter().map(|t| t.events.clone()).collect(),
            }),
        }
    }

    fn persist_history(&self) {
        let continuation = self.continuation.clone().unwrap_or_default();
        self.store.set_last_output(&OutputSnapshot {
            past_messages: continuation.messages,
            past_known: continuation.known,
            histories: self.turns.iter().map(|t| t.events.clone()).collect(),
        });
    }

    // ---- accessors ----

    pub fn task(&self) -> Task {
        self.task
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn continuation(&self) -> Option<&Continuation> {
        self.continuation.as_ref()
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn set_connection_state(&mut self, state: ConnectionState) {
        self.connection_state = state;
    }

    pub fn knowledge_graphs(&self) -> &[KgChoice] {
        &self.knowledge_graphs
    }

    /// Selected graph identifiers, computed from the catalog on every read.
    pub fn selected_kg_ids(&self) -> Vec<String> {
        self.knowledge_graphs
            .iter()
            .filter(|kg| kg.selected)
            .map(|kg| kg.id.clone())
            .collect()
    }

    pub fn status(&self) -> Option<&Status> {
        self.status.as_ref()
    }

    pub fn set_status(&mut self, text: impl Into<String>, pinned: bool) {
        self.status = Some(Status {
            text: text.into(),
            pinned,
        });
    }

    pub fn last_input(&self, task: Task) -> Option<String> {
        self.store.last_input(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TablePayload;
    use serde_json::json;

    fn connected() -> SessionController {
        let mut controller = SessionController::new(Store::disabled());
        controller.apply_catalog(vec!["wikidata".into(), "dbpedia".into()]);
        controller.set_connection_state(ConnectionState::Connected);
        controller
    }

    fn model_frame(text: &str) -> Value {
        json!({"type": "model", "message": text, "reasoning": null})
    }

    fn output_frame(task: &str, answer: &str) -> Value {
        json!({
            "type": "output",
            "task": task,
            "output": {"type": "output", "output": answer, "formatted": answer},
            "elapsed": 1.2,
            "messages": [],
            "known": [],
        })
    }

    #[test]
    fn test_happy_path_turn() {
        let mut controller = connected();

        let frame = controller
            .submit(QueryInput::Text("Where was Angela Merkel born?".into()))
            .unwrap();
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({
                "task": "sparql-qa",
                "input": "Where was Angela Merkel born?",
                "knowledge_graphs": ["wikidata"],
                "past": null,
            })
        );
        assert_eq!(controller.run_state(), RunState::Running);
        // running implies a turn without a terminal output yet
        assert_eq!(controller.turns().len(), 1);
        assert!(!controller.turns()[0].events.iter().any(Event::is_output));

        let outcome = controller.handle_frame(model_frame("checking wikidata"));
        assert_eq!(outcome.ack, Some(AckFrame::received()));
        assert!(!outcome.turn_ended);

        let outcome = controller.handle_frame(json!({
            "type": "output",
            "task": "sparql-qa",
            "output": {"type": "answer", "answer": "Barmen"},
            "elapsed": 1.2,
            "messages": [],
            "known": [],
        }));
        assert_eq!(outcome.ack, Some(AckFrame::received()));
        assert!(outcome.turn_ended);
        assert_eq!(controller.run_state(), RunState::Idle);
        assert_eq!(controller.turns().len(), 1);
        assert_eq!(controller.continuation(), Some(&Continuation::default()));
    }

    #[test]
    fn test_cancel_flag_rides_one_ack() {
        let mut controller = connected();
        controller.submit(QueryInput::Text("question".into())).unwrap();
        controller.handle_frame(model_frame("step 1"));

        controller.request_cancel().unwrap();
        assert_eq!(controller.run_state(), RunState::Cancelling);
        assert!(matches!(
            controller.request_cancel(),
            Err(SessionError::AlreadyCancelling)
        ));

        let outcome = controller.handle_frame(model_frame("step 2"));
        assert_eq!(outcome.ack, Some(AckFrame::cancelling()));
        // only the first ack after the request carries the flag
        let outcome = controller.handle_frame(model_frame("step 3"));
        assert_eq!(outcome.ack, Some(AckFrame::received()));

        let outcome = controller.handle_frame(json!({"cancelled": true}));
        assert_eq!(outcome.ack, None);
        assert!(outcome.turn_ended);
        assert_eq!(controller.turns().len(), 0);
        assert_eq!(controller.run_state(), RunState::Idle);
    }

    #[test]
    fn test_last_graph_guard() {
        let mut controller = SessionController::new(Store::disabled());
        controller.apply_catalog(vec!["wikidata".into()]);
        assert_eq!(controller.selected_kg_ids(), vec!["wikidata".to_string()]);

        controller.toggle_kg("wikidata");
        assert_eq!(controller.selected_kg_ids(), vec!["wikidata".to_string()]);

        // with two selected, deselecting works down to one
        let mut controller = connected();
        controller.toggle_kg("dbpedia");
        assert_eq!(
            controller.selected_kg_ids(),
            vec!["wikidata".to_string(), "dbpedia".to_string()]
        );
        controller.toggle_kg("wikidata");
        assert_eq!(controller.selected_kg_ids(), vec!["dbpedia".to_string()]);
        controller.toggle_kg("dbpedia");
        assert_eq!(controller.selected_kg_ids(), vec!["dbpedia".to_string()]);
    }

    #[test]
    fn test_table_submit_row_selection() {
        let mut controller = connected();
        controller.set_task(Task::Cea).unwrap();

        let table = TablePayload {
            header: vec!["a".into()],
            data: vec![vec!["1".into()], vec!["2".into()]],
            annotate_rows: Some(vec![0]),
        };
        let frame = controller.submit(QueryInput::Table(table)).unwrap();
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["input"]["annotate_rows"], json!([0]));

        controller.handle_frame(output_frame("cea", "done"));

        // select-all omits the key entirely
        let table = TablePayload {
            header: vec!["a".into()],
            data: vec![vec!["1".into()], vec!["2".into()]],
            annotate_rows: None,
        };
        let frame = controller.submit(QueryInput::Table(table)).unwrap();
        let value = serde_json::to_value(&frame).unwrap();
        assert!(value["input"].get("annotate_rows").is_none());

        controller.handle_frame(output_frame("cea", "done"));

        let table = TablePayload {
            header: vec!["a".into()],
            data: vec![vec!["1".into()]],
            annotate_rows: Some(vec![3]),
        };
        assert!(matches!(
            controller.submit(QueryInput::Table(table)),
            Err(SessionError::InvalidRowSelection)
        ));
    }

    #[test]
    fn test_disconnect_mid_flight() {
        let mut controller = connected();
        controller.submit(QueryInput::Text("question".into())).unwrap();
        controller.handle_frame(model_frame("partial"));

        controller.connection_closed("going away");
        assert_eq!(controller.run_state(), RunState::Idle);
        assert_eq!(controller.connection_state(), ConnectionState::Disconnected);
        assert!(!controller.status().unwrap().text.is_empty());
        // the partial turn is retained
        assert_eq!(controller.turns().len(), 1);
        assert_eq!(controller.turns()[0].events.len(), 1);
    }

    #[test]
    fn test_duplicate_reasoning_pruned() {
        let mut controller = connected();
        controller.set_task(Task::GeneralQa).unwrap();
        controller.submit(QueryInput::Text("question".into())).unwrap();

        controller.handle_frame(model_frame("A"));
        controller.handle_frame(model_frame("A"));
        controller.handle_frame(output_frame("general-qa", "A"));

        // only the immediately preceding duplicate is pruned
        let events = &controller.turns()[0].events;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Event::Model { .. }));
        assert!(events[1].is_output());
    }

    #[test]
    fn test_no_pruning_when_text_differs_or_task_is_not_general_qa() {
        let mut controller = connected();
        controller.set_task(Task::GeneralQa).unwrap();
        controller.submit(QueryInput::Text("question".into())).unwrap();
        controller.handle_frame(model_frame("A"));
        controller.handle_frame(model_frame("B"));
        controller.handle_frame(output_frame("general-qa", "A"));
        assert_eq!(controller.turns()[0].events.len(), 3);

        let mut controller = connected();
        controller.submit(QueryInput::Text("question".into())).unwrap();
        controller.handle_frame(model_frame("A"));
        controller.handle_frame(output_frame("sparql-qa", "A"));
        assert_eq!(controller.turns()[0].events.len(), 2);
    }

    #[test]
    fn test_error_frame_retains_turn() {
        let mut controller = connected();
        controller.submit(QueryInput::Text("question".into())).unwrap();
        controller.handle_frame(model_frame("partial"));

        let outcome = controller.handle_frame(json!({"error": "bad payload", "status": 400}));
        assert_eq!(outcome.ack, None);
        assert!(outcome.turn_ended);
        assert_eq!(controller.run_state(), RunState::Idle);
        assert_eq!(controller.turns().len(), 1);
        assert_eq!(controller.turns()[0].events.len(), 1);
        let status = controller.status().unwrap();
        assert!(status.text.contains("Check your input"));

        controller.handle_frame(json!({"error": "overloaded", "status": 503}));
        assert!(controller.status().unwrap().text.contains("Try again shortly"));
    }

    #[test]
    fn test_submit_guards() {
        let mut controller = connected();
        assert!(matches!(
            controller.submit(QueryInput::Text("  ".into())),
            Err(SessionError::EmptyInput)
        ));

        controller.submit(QueryInput::Text("question".into())).unwrap();
        assert!(matches!(
            controller.submit(QueryInput::Text("another".into())),
            Err(SessionError::Busy)
        ));

        let mut controller = SessionController::new(Store::disabled());
        controller.apply_catalog(vec!["wikidata".into()]);
        assert!(matches!(
            controller.submit(QueryInput::Text("question".into())),
            Err(SessionError::NotConnected)
        ));
    }

    #[test]
    fn test_events_while_idle_are_dropped() {
        let mut controller = connected();
        let outcome = controller.handle_frame(model_frame("stray"));
        assert_eq!(outcome, FrameOutcome::default());
        assert!(controller.turns().is_empty());
    }

    #[test]
    fn test_reset_keeps_task_and_selection() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = SessionController::new(Store::at_root(dir.path().to_path_buf()));
        controller.apply_catalog(vec!["wikidata".into(), "dbpedia".into()]);
        controller.set_connection_state(ConnectionState::Connected);
        controller.set_task(Task::GeneralQa).unwrap();
        controller.toggle_kg("dbpedia");

        controller.submit(QueryInput::Text("question".into())).unwrap();
        controller.handle_frame(output_frame("general-qa", "answer"));
        assert_eq!(controller.turns().len(), 1);

        controller.reset().unwrap();
        assert!(controller.turns().is_empty());
        assert_eq!(controller.continuation(), None);
        assert_eq!(controller.task(), Task::GeneralQa);
        assert_eq!(
            controller.selected_kg_ids(),
            vec!["wikidata".to_string(), "dbpedia".to_string()]
        );
    }

    #[test]
    fn test_continuation_threaded_into_next_request() {
        let mut controller = connected();
        controller.submit(QueryInput::Text("first".into())).unwrap();
        controller.handle_frame(json!({
            "type": "output",
            "task": "sparql-qa",
            "output": {"type": "answer", "answer": "x"},
            "elapsed": 0.4,
            "messages": [{"role": "system", "content": "s"}],
            "known": ["wd:Q1"],
        }));

        let frame = controller.submit(QueryInput::Text("second".into())).unwrap();
        let past = frame.past.unwrap();
        assert_eq!(past.messages, vec![json!({"role": "system", "content": "s"})]);
        assert_eq!(past.known, vec![json!("wd:Q1")]);
    }

    #[test]
    fn test_empty_continuation_sends_null_past() {
        let mut controller = connected();
        controller.submit(QueryInput::Text("first".into())).unwrap();
        controller.handle_frame(output_frame("sparql-qa", "x"));
        assert!(controller.continuation().is_some());

        let frame = controller.submit(QueryInput::Text("second".into())).unwrap();
        assert_eq!(frame.past, None);
    }

    #[test]
    fn test_share_guard_and_round_trip() {
        let mut controller = connected();
        assert!(matches!(
            controller.share_snapshot(),
            Err(SessionError::NothingToShare)
        ));

        controller.submit(QueryInput::Text("question".into())).unwrap();
        controller.handle_frame(model_frame("step"));
        controller.handle_frame(output_frame("sparql-qa", "answer"));

        let snapshot = controller.share_snapshot().unwrap();
        assert_eq!(snapshot.task, Task::SparqlQa);

        // loading the snapshot elsewhere reproduces the session and marks
        // it non-reshareable
        let mut restored = SessionController::new(Store::disabled());
        restored.seed_from_snapshot(snapshot.clone());
        restored.apply_catalog(vec!["wikidata".into(), "dbpedia".into()]);
        assert_eq!(restored.task(), snapshot.task);
        assert_eq!(restored.selected_kg_ids(), snapshot.selected_kgs);
        assert_eq!(
            restored
                .turns()
                .iter()
                .map(|t| t.events.clone())
                .collect::<Vec<_>>(),
            controller
                .turns()
                .iter()
                .map(|t| t.events.clone())
                .collect::<Vec<_>>()
        );
        assert!(matches!(
            restored.share_snapshot(),
            Err(SessionError::AlreadyShared)
        ));
    }

    #[test]
    fn test_catalog_reapplies_persisted_selection() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::at_root(dir.path().join("a"));
        store.set_selected_kgs(&["dbpedia".to_string()]);
        let mut controller = SessionController::new(store);
        controller.apply_catalog(vec!["wikidata".into(), "dbpedia".into()]);
        assert_eq!(controller.selected_kg_ids(), vec!["dbpedia".to_string()]);

        // nothing persisted survives, fall back to the first entry
        let store = Store::at_root(dir.path().join("b"));
        store.set_selected_kgs(&["gone".to_string()]);
        let mut controller = SessionController::new(store);
        controller.apply_catalog(vec!["wikidata".into(), "dbpedia".into()]);
        assert_eq!(controller.selected_kg_ids(), vec!["wikidata".to_string()]);
    }

    #[test]
    fn test_pinned_status_survives_submit() {
        let mut controller = connected();
        controller.set_status("share link invalid", true);
        controller.submit(QueryInput::Text("question".into())).unwrap();
        assert_eq!(
            controller.status().map(|s| s.text.as_str()),
            Some("share link invalid")
        );

        controller.handle_frame(output_frame("sparql-qa", "x"));
        controller.set_status("transient", false);
        controller.submit(QueryInput::Text("again".into())).unwrap();
        assert_eq!(controller.status(), None);
    }
}
