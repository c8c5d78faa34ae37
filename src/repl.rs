//! Line-oriented front end: stdin is the composer, stdout the transcript.

use crate::commands;
use crate::models::{Conversation, Role};
use crate::state::{AppEvent, AppState};
use anyhow::{Context, Result};
use std::future::Future;
use std::io::Write;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

const HELP: &str = "\
Commands:
  /new             start a new conversation
  /list            list conversations
  /switch <n>      switch to conversation number n from /list
  /rename <title>  rename the current conversation
  /delete          delete the current conversation
  /clear           delete every conversation
  /help            show this help
  /quit            exit
Anything else is sent as a message. Ctrl-C stops a reply in progress;
at the prompt, Ctrl-C or Ctrl-D exits.";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Input {
    Empty,
    Send(String),
    New,
    List,
    Switch(usize),
    Rename(String),
    Delete,
    Clear,
    Help,
    Quit,
    Invalid(String),
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Send(line.to_string());
    };

    let (name, arg) = match command.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (command, ""),
    };
    match name {
        "new" => Input::New,
        "list" | "ls" => Input::List,
        "switch" => match arg.parse::<usize>() {
            Ok(n) if n > 0 => Input::Switch(n),
            _ => Input::Invalid(format!("Usage: /switch <n>, got '{}'", arg)),
        },
        "rename" if !arg.is_empty() => Input::Rename(arg.to_string()),
        "rename" => Input::Invalid("Usage: /rename <title>".to_string()),
        "delete" => Input::Delete,
        "clear" => Input::Clear,
        "help" | "?" => Input::Help,
        "quit" | "exit" | "q" => Input::Quit,
        other => Input::Invalid(format!("Unknown command /{}. Try /help.", other)),
    }
}

/// Reads stdin until EOF, Ctrl-C at the prompt, or `/quit`.
pub async fn run(state: AppState) -> Result<()> {
    let mut current = ensure_conversation(&state).await;
    if let Some(convo) = commands::active_conversation(&state).await {
        print_transcript(&convo);
    }
    println!("Type /help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt()?;
        let interrupt = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        };
        let Some(line) = next_input(&mut lines, interrupt).await? else {
            println!();
            break;
        };

        match parse_input(&line) {
            Input::Empty => {}
            Input::Send(text) => send(&state, current, &text).await,
            Input::New => {
                current = commands::create_conversation(&state).await;
                println!("Started a new conversation.");
            }
            Input::List => print_list(&state, current).await,
            Input::Switch(n) => {
                let conversations = commands::list_conversations(&state).await;
                match conversations.get(n - 1) {
                    Some(convo) => {
                        commands::set_active_conversation(&state, convo.id).await?;
                        current = convo.id;
                        print_transcript(convo);
                    }
                    None => println!("No conversation number {}.", n),
                }
            }
            Input::Rename(title) => {
                if let Err(e) = commands::rename_conversation(&state, current, &title).await {
                    eprintln!("! {}", e);
                }
            }
            Input::Delete => {
                commands::delete_conversation(&state, current).await;
                current = ensure_conversation(&state).await;
                println!("Deleted.");
            }
            Input::Clear => {
                commands::clear_conversations(&state).await;
                current = ensure_conversation(&state).await;
                println!("Cleared all conversations.");
            }
            Input::Help => println!("{}", HELP),
            Input::Quit => break,
            Input::Invalid(message) => eprintln!("! {}", message),
        }
    }
    Ok(())
}

/// Next line of input, or `None` at end of input or once `interrupt` fires.
async fn next_input<R>(
    lines: &mut Lines<R>,
    interrupt: impl Future<Output = ()>,
) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    tokio::select! {
        biased;
        _ = interrupt => Ok(None),
        line = lines.next_line() => line.context("Failed to read stdin"),
    }
}

// There is always a conversation to type into
async fn ensure_conversation(state: &AppState) -> Uuid {
    match commands::active_conversation(state).await {
        Some(convo) => convo.id,
        None => commands::create_conversation(state).await,
    }
}

async fn send(state: &AppState, conversation_id: Uuid, text: &str) {
    // Subscribe before starting so no chunk is missed
    let mut events = state.subscribe_events();
    let generation = match commands::send_message(state, conversation_id, text).await {
        Ok(generation) => generation,
        Err(e) => {
            eprintln!("! {}", e);
            return;
        }
    };

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => match shown(&event, conversation_id) {
                    Some(Shown::Chunk(delta)) => {
                        print!("{}", delta);
                        let _ = std::io::stdout().flush();
                    }
                    Some(Shown::Notice(message)) => eprintln!("\n! {}", message),
                    Some(Shown::Finished) => break,
                    None => {}
                },
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Display fell behind by {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                commands::stop_generation(state, conversation_id);
            }
        }
    }
    println!();

    if let Err(e) = generation.task.await {
        log::error!("Generation task for {} panicked: {:?}", conversation_id, e);
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Shown<'a> {
    Chunk(&'a str),
    Notice(&'a str),
    Finished,
}

// Only events of the conversation being replied to reach the terminal
fn shown(event: &AppEvent, conversation_id: Uuid) -> Option<Shown<'_>> {
    match event {
        AppEvent::AssistantChunk { conversation_id: id, delta } if *id == conversation_id => {
            Some(Shown::Chunk(delta))
        }
        AppEvent::Notice { conversation_id: id, message } if *id == conversation_id => {
            Some(Shown::Notice(message))
        }
        AppEvent::StreamFinished { conversation_id: id } if *id == conversation_id => {
            Some(Shown::Finished)
        }
        _ => None,
    }
}

fn prompt() -> Result<()> {
    print!("> ");
    std::io::stdout().flush().context("Failed to flush stdout")
}

async fn print_list(state: &AppState, current: Uuid) {
    let conversations = commands::list_conversations(state).await;
    for (i, convo) in conversations.iter().enumerate() {
        let marker = if convo.id == current { '*' } else { ' ' };
        println!(
            "{} {:>2}. {} ({} messages, updated {})",
            marker,
            i + 1,
            convo.title,
            convo.messages.len(),
            convo.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
}

fn print_transcript(convo: &Conversation) {
    println!("== {} ==", convo.title);
    for msg in convo.messages.iter().filter(|m| m.role != Role::System) {
        println!("[{}] {}", msg.role, msg.content);
    }
}
