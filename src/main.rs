//! GRASP Chat CLI
//!
//! Interactive terminal client for a GRASP question answering backend.
//! Reads questions from stdin, streams generation events from the live
//! channel, and renders them one line at a time.

use std::io::Write as _;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use grasp_client::bootstrap::{bootstrap, BootstrapOptions, Ready};
use grasp_client::endpoint::Endpoint;
use grasp_client::protocol::{Event, QueryInput, RequestFrame, TablePayload, Task};
use grasp_client::session::SessionController;
use grasp_client::store::Store;
use grasp_client::transport::{Transport, TransportEvent};

#[derive(Parser)]
#[command(name = "grasp", version)]
#[command(about = "Chat with a GRASP knowledge graph question answering backend")]
struct Cli {
    /// Backend address
    #[arg(long, default_value = "http://localhost:8000")]
    endpoint: String,

    /// Load a shared conversation by identifier
    #[arg(long)]
    share: Option<String>,

    /// Task to start with: sparql-qa, general-qa or cea
    #[arg(long)]
    task: Option<String>,

    /// Bearer token sent with share uploads, remembered across runs
    #[arg(long)]
    share_token: Option<String>,

    /// Log filter, e.g. "info" or "grasp_client=debug"
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let endpoint = Endpoint::parse(&cli.endpoint)?;
    let task = match cli.task.as_deref() {
        Some(s) => Some(Task::parse(s).with_context(|| format!("unknown task: {s}"))?),
        None => None,
    };

    let store = Store::open_default();
    if let Some(token) = &cli.share_token {
        store.set_share_token(Some(token.clone()));
    }
    let Ready {
        mut controller,
        transport,
        mut events,
        config,
        share,
    } = bootstrap(
        BootstrapOptions {
            endpoint: endpoint.clone(),
            share_id: cli.share,
            task,
        },
        store.clone(),
    )
    .await?;

    println!("Connected to {}", endpoint.base());
    if let Some(model) = config.get("model").and_then(Value::as_str) {
        println!("Backend model: {model}");
    }
    if !controller.turns().is_empty() {
        println!("Restored {} previous turn(s).", controller.turns().len());
    }
    if let Some(previous) = controller.last_input(controller.task()) {
        println!("Previous question: {previous}");
    }
    print_status(&controller);
    println!("Type a question, or /help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt(&controller);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(TransportEvent::Message(value)) => {
                    let outcome = controller.handle_frame(value);
                    if outcome.ack.is_some() {
                        if let Some(event) = controller
                            .turns()
                            .last()
                            .and_then(|t| t.events.last())
                        {
                            render_event(event);
                        }
                    }
                    if let Some(ack) = outcome.ack {
                        if let Err(e) = transport.send(&serde_json::to_value(&ack)?) {
                            tracing::warn!(error = %e, "Failed to acknowledge frame");
                        }
                    }
                    if outcome.turn_ended {
                        print_status(&controller);
                        prompt(&controller);
                    }
                }
                Some(TransportEvent::Closed(reason)) => {
                    controller.connection_closed(&reason);
                    print_status(&controller);
                    break;
                }
                None => break,
            },
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    prompt(&controller);
                    continue;
                }
                if let Some(rest) = trimmed.strip_prefix('/') {
                    match handle_command(rest, &mut controller, &transport, &share, &endpoint, &store).await? {
                        CommandOutcome::Quit => break,
                        CommandOutcome::Continue => prompt(&controller),
                        CommandOutcome::Submitted => {}
                    }
                } else if !submit(&mut controller, &transport, QueryInput::Text(trimmed.to_string()))? {
                    prompt(&controller);
                }
            }
        }
    }

    Ok(())
}

enum CommandOutcome {
    /// Back to the prompt.
    Continue,
    /// A request went out; the next prompt follows the turn's output.
    Submitted,
    Quit,
}

/// Runs one slash command.
async fn handle_command(
    input: &str,
    controller: &mut SessionController,
    transport: &Transport,
    share: &grasp_client::share::ShareClient,
    endpoint: &Endpoint,
    store: &Store,
) -> Result<CommandOutcome> {
    let mut parts = input.split_whitespace();
    match parts.next().unwrap_or("") {
        "quit" | "q" => {
            // a clean exit drops the restorable conversation
            transport.close();
            store.clear_session_state();
            return Ok(CommandOutcome::Quit);
        }
        "task" => match parts.next() {
            Some(id) => match Task::parse(id) {
                Some(task) => match controller.set_task(task) {
                    Ok(()) => println!("Task: {}", task.label()),
                    Err(e) => println!("Cannot switch task: {e}"),
                },
                None => println!("Unknown task: {id} (expected sparql-qa, general-qa or cea)"),
            },
            None => {
                for task in Task::all() {
                    let marker = if task == controller.task() { "*" } else { " " };
                    println!("{marker} {} ({})", task.id(), task.label());
                }
            }
        },
        "kg" => match parts.next() {
            Some(id) => {
                controller.toggle_kg(id);
                print_kgs(controller);
            }
            None => print_kgs(controller),
        },
        "kgs" => print_kgs(controller),
        "table" => match parts.next() {
            Some(path) => match load_table(path, parts.next()) {
                Ok(table) => {
                    if submit(controller, transport, QueryInput::Table(table))? {
                        return Ok(CommandOutcome::Submitted);
                    }
                }
                Err(e) => println!("Cannot load table: {e:#}"),
            },
            None => println!("Usage: /table <file.json> [rows], e.g. /table cities.json 0,2"),
        },
        "cancel" => match controller.request_cancel() {
            Ok(()) => println!("Cancelling..."),
            Err(e) => println!("{e}"),
        },
        "reset" => match controller.reset() {
            Ok(()) => println!("Conversation cleared."),
            Err(e) => println!("Cannot reset: {e}"),
        },
        "share" => match controller.share_snapshot() {
            Ok(snapshot) => match share.save(&snapshot).await {
                Ok(handle) => {
                    controller.mark_shared();
                    println!("Shared as {}: {}", handle.id, handle.link(endpoint));
                }
                Err(e) => println!("Share failed: {e}"),
            },
            Err(e) => println!("Cannot share: {e}"),
        },
        "status" => {
            println!(
                "Connection: {:?}, run state: {:?}, task: {}",
                controller.connection_state(),
                controller.run_state(),
                controller.task().label()
            );
            print_kgs(controller);
            print_status(controller);
        }
        "help" => help(),
        other => println!("Unknown command: /{other} (try /help)"),
    }
    Ok(CommandOutcome::Continue)
}

/// Submit input through the session. Returns whether a request went out;
/// on rejection the reason is printed and the caller re-prompts.
fn submit(
    controller: &mut SessionController,
    transport: &Transport,
    input: QueryInput,
) -> Result<bool> {
    match controller.submit(input) {
        Ok(frame) => {
            send_request(controller, transport, &frame)?;
            Ok(true)
        }
        Err(e) => {
            println!("{e}");
            Ok(false)
        }
    }
}

fn send_request(
    controller: &mut SessionController,
    transport: &Transport,
    frame: &RequestFrame,
) -> Result<()> {
    if let Err(e) = transport.send(&serde_json::to_value(frame)?) {
        // the socket died between the state check and the write
        controller.connection_closed(&e.to_string());
        print_status(controller);
    }
    Ok(())
}

fn load_table(path: &str, rows: Option<&str>) -> Result<TablePayload> {
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let mut table: TablePayload = serde_json::from_str(&content)
        .context("table file must be JSON with \"header\" and \"data\" arrays")?;
    if let Some(rows) = rows {
        let parsed = rows
            .split(',')
            .map(|r| r.trim().parse::<usize>())
            .collect::<Result<Vec<_>, _>>()
            .context("row selection must be comma-separated indices")?;
        table.annotate_rows = Some(parsed);
    }
    Ok(table)
}

fn render_event(event: &Event) {
    match event {
        Event::Input { input } => println!("[input] {}", compact(input)),
        Event::System {
            functions,
            system_message,
        } => println!(
            "[system] {} tool(s) available, {} instruction chars",
            functions.len(),
            system_message.len()
        ),
        Event::Model { message, reasoning } => {
            if let Some(reasoning) = reasoning {
                println!("[reasoning] {}", reasoning.trim());
            }
            if let Some(message) = message {
                println!("[model] {}", message.trim());
            }
        }
        Event::Tool { name, args, result } => {
            println!("[tool] {name}({}) -> {}", compact(args), compact(result))
        }
        Event::Feedback { status, feedback } => println!(
            "[feedback] {}: {}",
            status.as_deref().unwrap_or("unknown"),
            feedback.as_deref().unwrap_or("")
        ),
        Event::Output(output) => {
            if let Some(error) = &output.error {
                println!("[error] {error}");
            }
            match output.primary_text() {
                Some(text) => println!("[answer] {text}"),
                None => match &output.output {
                    Some(value) => println!("[answer] {}", compact(value)),
                    None => println!("[answer] (no output)"),
                },
            }
            println!("  finished in {:.1}s", output.elapsed);
        }
        Event::Unknown(value) => println!("[event] {}", compact(value)),
    }
}

fn compact(value: &Value) -> String {
    let text = value.to_string();
    if text.chars().count() > 200 {
        let mut short: String = text.chars().take(200).collect();
        short.push_str("...");
        short
    } else {
        text
    }
}

fn print_kgs(controller: &SessionController) {
    for kg in controller.knowledge_graphs() {
        let marker = if kg.selected { "[x]" } else { "[ ]" };
        println!("{marker} {}", kg.id);
    }
}

fn print_status(controller: &SessionController) {
    if let Some(status) = controller.status() {
        println!("! {}", status.text);
    }
}

fn prompt(controller: &SessionController) {
    print!("{}> ", controller.task().id());
    let _ = std::io::stdout().flush();
}

fn help() {
    println!("Commands:");
    println!("  /task [id]          show tasks or switch to one");
    println!("  /kg <id>            toggle a knowledge graph");
    println!("  /kgs                list knowledge graphs");
    println!("  /table <file> [rows] annotate a table (cea task)");
    println!("  /cancel             cancel the running generation");
    println!("  /reset              clear the conversation");
    println!("  /share              publish the conversation and print its link");
    println!("  /status             show connection and session state");
    println!("  /quit               exit and discard the restorable session");
}
