//! `TaskSync` client: a line-oriented shared task list.
//!
//! Connects to a relay, joins a room, and keeps the local task list in sync
//! with every other member. Direct links use plain TCP. Configuration via
//! CLI flags, environment variables, or config file
//! (`~/.config/tasksync/config.toml`).
//!
//! ```bash
//! cargo run --bin tasksync -- --relay-url ws://127.0.0.1:9000/ws --room groceries
//! ```
//!
//! Commands, one per line:
//!
//! ```text
//! add [low|medium|high] <title>   create a task
//! rename <n> <title>              change a task's title
//! toggle <n>                      flip completed
//! delete <n>                      remove a task
//! list [--json]                   show tasks, numbered
//! join <room> / leave             switch rooms
//! quit
//! ```
//!
//! `<n>` is a number from the last `list`, or a task id.

use std::ffi::OsStr;
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use tasksync::config::{CliArgs, ClientConfig};
use tasksync::net::{self, SyncCommand, SyncEvent, SyncHandle};
use tasksync::tasks::{InMemoryTaskStore, TaskPatch};
use tasksync::transport::tcp::TcpProvider;
use tasksync_proto::task::{Priority, Task, TaskId};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!(relay_url = %config.relay_url, "tasksync starting");

    let provider = TcpProvider::new(config.bind_host.clone(), config.rendezvous.clone());
    let mut handle =
        match net::spawn_sync(config.to_sync_config(), provider, InMemoryTaskStore::new()).await {
            Ok(h) => h,
            Err(e) => {
                eprintln!("Could not connect to relay at {}: {e}", config.relay_url);
                return ExitCode::FAILURE;
            }
        };
    println!("connected as {}", handle.local_id());

    if let Some(room) = config.room.clone()
        && handle.send(SyncCommand::JoinRoom(room)).await.is_err()
    {
        return ExitCode::FAILURE;
    }

    run_repl(&mut handle).await;
    handle.shutdown().await;
    tracing::info!("tasksync exiting");
    ExitCode::SUCCESS
}

/// Initialize logging to a file, or to stderr when no file is given.
///
/// A path without a file name (`/`, `..`) also logs to stderr, with a
/// warning. Returns a [`WorkerGuard`] for file logging that must be held
/// until shutdown so buffered entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let Some((log_dir, file_name)) = file_path.and_then(log_file_target) else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(env_filter)
            .init();
        if let Some(path) = file_path {
            tracing::warn!(path = %path.display(), "log file path has no file name, logging to stderr");
        }
        return None;
    };

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Splits a log file path into its directory and file name.
fn log_file_target(path: &Path) -> Option<(&Path, &OsStr)> {
    let file_name = path.file_name()?;
    let log_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    Some((log_dir, file_name))
}

/// One parsed input line.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Add { priority: Priority, title: String },
    Rename { target: String, title: String },
    Toggle(String),
    Delete(String),
    List { json: bool },
    Join(String),
    Leave,
    Quit,
    Help,
}

fn parse_line(line: &str) -> Result<Option<Input>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    let input = match command {
        "add" => {
            let (first, tail) = rest.split_once(' ').unwrap_or((rest, ""));
            match first.parse::<Priority>() {
                Ok(priority) if !tail.trim().is_empty() => Input::Add {
                    priority,
                    title: tail.trim().to_string(),
                },
                _ => Input::Add {
                    priority: Priority::default(),
                    title: rest.to_string(),
                },
            }
        }
        "rename" => {
            let (target, title) = rest
                .split_once(' ')
                .ok_or_else(|| "usage: rename <n> <title>".to_string())?;
            Input::Rename {
                target: target.to_string(),
                title: title.trim().to_string(),
            }
        }
        "toggle" | "delete" if rest.is_empty() => {
            return Err(format!("usage: {command} <n>"));
        }
        "toggle" => Input::Toggle(rest.to_string()),
        "delete" => Input::Delete(rest.to_string()),
        "list" => Input::List {
            json: rest == "--json",
        },
        "join" if rest.is_empty() => return Err("usage: join <room>".to_string()),
        "join" => Input::Join(rest.to_string()),
        "leave" => Input::Leave,
        "quit" | "exit" => Input::Quit,
        "help" => Input::Help,
        other => return Err(format!("unknown command `{other}`, try `help`")),
    };
    Ok(Some(input))
}

/// Resolves a list number (1-based) or a literal id.
fn resolve_target(target: &str, listed: &[Task]) -> TaskId {
    target
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| listed.get(i))
        .map_or_else(|| TaskId::from_string(target), |task| task.id.clone())
}

fn print_tasks(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("(no tasks)");
    }
    for (i, task) in tasks.iter().enumerate() {
        let mark = if task.completed { 'x' } else { ' ' };
        println!("{:>3}. [{mark}] {} ({})", i + 1, task.title, task.priority);
    }
}

async fn run_repl(handle: &mut SyncHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut listed: Vec<Task> = Vec::new();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        eprintln!("stdin error: {e}");
                        break;
                    }
                };
                match parse_line(&line) {
                    Ok(Some(Input::Quit)) => break,
                    Ok(Some(input)) => {
                        if !dispatch(handle, input, &mut listed).await {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(usage) => println!("{usage}"),
                }
            }
            event = handle.next_event() => match event {
                Some(event) => print_event(&event, &mut listed),
                None => break,
            },
        }
    }
}

/// Runs one command. Returns `false` once the sync loop is gone.
async fn dispatch(handle: &SyncHandle, input: Input, listed: &mut Vec<Task>) -> bool {
    let command = match input {
        Input::Add { priority, title } => SyncCommand::AddTask {
            title,
            description: None,
            priority,
        },
        Input::Rename { target, title } => SyncCommand::UpdateTask {
            id: resolve_target(&target, listed),
            patch: TaskPatch {
                title: Some(title),
                ..TaskPatch::default()
            },
        },
        Input::Toggle(target) => SyncCommand::ToggleTask(resolve_target(&target, listed)),
        Input::Delete(target) => SyncCommand::DeleteTask(resolve_target(&target, listed)),
        Input::List { json } => {
            let Ok(tasks) = handle.list_tasks().await else {
                return false;
            };
            if json {
                match serde_json::to_string_pretty(&tasks) {
                    Ok(out) => println!("{out}"),
                    Err(e) => eprintln!("failed to render tasks: {e}"),
                }
            } else {
                print_tasks(&tasks);
            }
            *listed = tasks;
            return true;
        }
        Input::Join(room) => SyncCommand::JoinRoom(room),
        Input::Leave => SyncCommand::LeaveRoom,
        Input::Help => {
            println!(
                "add [low|medium|high] <title> | rename <n> <title> | toggle <n> | delete <n> | list [--json] | join <room> | leave | quit"
            );
            return true;
        }
        Input::Quit => return false,
    };
    handle.send(command).await.is_ok()
}

fn print_event(event: &SyncEvent, listed: &mut Vec<Task>) {
    match event {
        SyncEvent::RoomJoined { room_id, peers } => {
            println!("joined {room_id} ({} other members)", peers.len());
        }
        SyncEvent::PeerJoined(peer) => println!("+ {peer} joined"),
        SyncEvent::PeerLeft(peer) => println!("- {peer} left"),
        SyncEvent::SessionConnected(peer) => println!("direct link to {peer} up"),
        SyncEvent::SessionClosed { peer, reason } => {
            println!("direct link to {peer} down ({reason}), using relay");
        }
        SyncEvent::TasksChanged { tasks } => {
            print_tasks(tasks);
            listed.clone_from(tasks);
        }
        SyncEvent::ConnectionStatus {
            connected,
            peers,
            direct,
        } => {
            tracing::debug!(connected, peers, direct, "connection status");
        }
        SyncEvent::Error(e) => println!("error: {e}"),
    }
}
