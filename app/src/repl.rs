use std::{fmt::Write as _, io::Write as _};

use anyhow::Context as _;
use chrono::Local;
use clap::{CommandFactory, Parser, Subcommand};
use stompmiru_broker::{LoopbackBroker, SessionEvent};
use stompmiru_core::profiles::FieldType;
use stompmiru_storage::KeyValueStore;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

use crate::{
    Result,
    activity::ActivityEntry,
    console::{Console, ConnectionStatus},
};

#[derive(Debug, Parser)]
#[command(
    name = "stompmiru",
    no_binary_name = true,
    disable_help_flag = true,
    disable_help_subcommand = true
)]
struct Line {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, PartialEq, Subcommand)]
enum Command {
    /// List profiles, most recently updated first
    Profiles,
    /// Create a profile and make it active
    New { name: Vec<String> },
    /// Copy the active profile and make the copy active
    Duplicate { name: Vec<String> },
    /// Delete the active profile
    Delete,
    /// Make another profile active (name or id prefix)
    Switch { profile: String },
    /// Rename the active profile
    Rename { name: Vec<String> },
    /// Show the profile being edited
    Show,
    /// Set the broker URL
    SetUrl { url: String },
    /// Set the subscription destination
    SetDestination { destination: String },
    /// Append an authentication header
    AddAuth {
        name: Option<String>,
        value: Option<String>,
    },
    /// Replace authentication header N
    SetAuth {
        #[arg(value_parser = clap::value_parser!(u16).range(1..))]
        index: u16,
        name: String,
        #[arg(default_value = "")]
        value: String,
    },
    /// Remove authentication header N
    RemoveAuth {
        #[arg(value_parser = clap::value_parser!(u16).range(1..))]
        index: u16,
    },
    /// Append a subscription field (string, number, boolean, json, array)
    AddField {
        name: Option<String>,
        field_type: Option<FieldType>,
        value: Option<String>,
    },
    /// Replace subscription field N
    SetField {
        #[arg(value_parser = clap::value_parser!(u16).range(1..))]
        index: u16,
        name: String,
        field_type: FieldType,
        #[arg(default_value = "")]
        value: String,
    },
    /// Remove subscription field N
    RemoveField {
        #[arg(value_parser = clap::value_parser!(u16).range(1..))]
        index: u16,
    },
    /// Open a session with the active profile
    Connect,
    /// Close the session
    Disconnect,
    /// Subscribe to the destination
    Subscribe,
    /// Cancel the subscription
    Unsubscribe,
    /// List received messages, newest first
    Messages,
    /// Empty the message list
    ClearMessages,
    /// Print the activity log
    Logs,
    /// Delete every stored profile
    ClearAll,
    /// Send a message through the loopback broker; quote JSON bodies with ''
    Publish {
        destination: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        body: Vec<String>,
    },
    /// Show connection and subscription state
    Status,
    /// List commands
    Help,
    /// Leave the console
    #[command(alias = "exit")]
    Quit,
}

enum Flow {
    Continue,
    Quit,
}

enum Input {
    Line(Option<String>),
    Event(Option<SessionEvent>),
}

type InputLines = Lines<BufReader<Stdin>>;

pub async fn run<S: KeyValueStore>(mut console: Console<S>, broker: LoopbackBroker) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let events = console.event_receiver();
    let mut seen = print_activity(&console, 0);
    println!("Type `help` for the list of commands.");
    prompt()?;

    loop {
        let input = tokio::select! {
            line = lines.next_line() => Input::Line(line.context("Failed to read input")?),
            event = events.recv() => Input::Event(event.ok()),
        };
        match input {
            Input::Line(None) => break,
            Input::Line(Some(line)) => {
                let flow = dispatch(&mut console, &broker, &mut lines, &line).await?;
                console.poll_events();
                seen = print_activity(&console, seen);
                if matches!(flow, Flow::Quit) {
                    break;
                }
                prompt()?;
            }
            Input::Event(Some(event)) => {
                console.handle_event(event);
                console.poll_events();
                let before = seen;
                seen = print_activity(&console, seen);
                if seen != before {
                    prompt()?;
                }
            }
            Input::Event(None) => break,
        }
    }

    console.disconnect();
    Ok(())
}

async fn dispatch<S: KeyValueStore>(
    console: &mut Console<S>,
    broker: &LoopbackBroker,
    lines: &mut InputLines,
    line: &str,
) -> Result<Flow> {
    let command = match parse(line) {
        Ok(Some(command)) => command,
        Ok(None) => return Ok(Flow::Continue),
        Err(message) => {
            println!("{}", message.trim_end());
            return Ok(Flow::Continue);
        }
    };

    // Errors from console operations are already in the activity log.
    match command {
        Command::Profiles => print!("{}", render_profiles(console)),
        Command::New { name } => {
            console.new_profile(&name.join(" "));
        }
        Command::Duplicate { name } => {
            let _ = console.duplicate_profile(&name.join(" "));
        }
        Command::Delete => {
            let question = format!("Delete profile \"{}\"?", console.active_profile().name);
            if confirm(lines, &question).await? {
                let _ = console.delete_profile();
            }
        }
        Command::Switch { profile } => match console.profiles().resolve(&profile) {
            Some(id) => {
                let _ = console.switch_profile(id);
            }
            None => println!("No profile matches `{profile}`."),
        },
        Command::Rename { name } => {
            let _ = console.rename_profile(&name.join(" "));
        }
        Command::Show => print!("{}", render_form(console)),
        Command::SetUrl { url } => console.set_server_url(&url),
        Command::SetDestination { destination } => console.set_destination(&destination),
        Command::AddAuth { name, value } => console.add_auth_field(
            name.as_deref().unwrap_or_default(),
            value.as_deref().unwrap_or_default(),
        ),
        Command::SetAuth { index, name, value } => {
            let _ = console.update_auth_field(slot(index), &name, &value);
        }
        Command::RemoveAuth { index } => {
            let _ = console.remove_auth_field(slot(index));
        }
        Command::AddField {
            name,
            field_type,
            value,
        } => console.add_field(
            name.as_deref().unwrap_or_default(),
            field_type.unwrap_or_default(),
            value.as_deref().unwrap_or_default(),
        ),
        Command::SetField {
            index,
            name,
            field_type,
            value,
        } => {
            let _ = console.update_field(slot(index), &name, field_type, &value);
        }
        Command::RemoveField { index } => {
            let _ = console.remove_field(slot(index));
        }
        Command::Connect => {
            let _ = console.connect();
        }
        Command::Disconnect => console.disconnect(),
        Command::Subscribe => {
            let _ = console.subscribe();
        }
        Command::Unsubscribe => {
            if !console.unsubscribe() {
                println!("No active subscription.");
            }
        }
        Command::Messages => print!("{}", render_messages(console)),
        Command::ClearMessages => console.clear_messages(),
        Command::Logs => print!("{}", render_logs(console)),
        Command::ClearAll => {
            if confirm(lines, "Delete ALL profiles and start over?").await? {
                console.clear_all_profiles();
            }
        }
        Command::Publish { destination, body } => {
            let delivered = broker.publish(&destination, &body.join(" "));
            println!("Delivered to {delivered} subscription(s).");
        }
        Command::Status => print!("{}", render_status(console)),
        Command::Help => print!("{}", Line::command().render_help()),
        Command::Quit => return Ok(Flow::Quit),
    }
    Ok(Flow::Continue)
}

/// Parses one input line. Blank lines yield `None`.
fn parse(line: &str) -> std::result::Result<Option<Command>, String> {
    let Some(words) = shlex::split(line) else {
        return Err("Unbalanced quotes.".into());
    };
    if words.is_empty() {
        return Ok(None);
    }
    Line::try_parse_from(words)
        .map(|line| Some(line.command))
        .map_err(|err| err.to_string())
}

fn slot(index: u16) -> usize {
    usize::from(index) - 1
}

async fn confirm(lines: &mut InputLines, question: &str) -> Result<bool> {
    print!("{question} [y/N] ");
    std::io::stdout().flush()?;
    let answer = lines.next_line().await?.unwrap_or_default();
    Ok(matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}

fn prompt() -> Result<()> {
    print!("> ");
    std::io::stdout().flush()?;
    Ok(())
}

fn print_activity<S: KeyValueStore>(console: &Console<S>, seen: u64) -> u64 {
    for entry in console.activity().since(seen) {
        println!("{}", format_entry(entry));
    }
    console.activity().last_seq()
}

fn format_entry(entry: &ActivityEntry) -> String {
    format!(
        "[{}] [{}] {}",
        entry.at.format("%H:%M:%S"),
        entry.level,
        entry.message
    )
}

fn render_profiles<S: KeyValueStore>(console: &Console<S>) -> String {
    let active = console.profiles().active_id();
    let mut out = String::new();
    for profile in console.profiles().sorted_by_recent() {
        let marker = if profile.id == active { '*' } else { ' ' };
        let id = profile.id.to_string();
        let host = profile.server_host().unwrap_or_else(|| "(no server)".into());
        let _ = writeln!(
            out,
            "{marker} {} {}  {}  {}",
            &id[..8],
            profile.name,
            host,
            profile.updated_at.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
        );
    }
    out
}

fn render_form<S: KeyValueStore>(console: &Console<S>) -> String {
    let profile = console.active_profile();
    let form = console.form();
    let mut out = String::new();
    let _ = writeln!(out, "Profile:     {} ({})", profile.name, profile.id);
    let _ = writeln!(out, "Server URL:  {}", form.server_url);
    let _ = writeln!(out, "Destination: {}", form.destination);
    let _ = writeln!(out, "Auth headers:");
    for (n, field) in form.auth_fields.iter().enumerate() {
        let value = if field.value.is_empty() { "" } else { "***" };
        let _ = writeln!(out, "  {}. {} = {}", n + 1, field.name, value);
    }
    let issues = form.field_issues();
    let _ = writeln!(out, "Subscription fields:");
    for (n, field) in form.fields.iter().enumerate() {
        let _ = writeln!(
            out,
            "  {}. {} ({}) = {}",
            n + 1,
            field.name,
            field.field_type,
            field.value
        );
        if let Some((_, issue)) = issues.iter().find(|(index, _)| *index == n) {
            let _ = writeln!(out, "     ! {issue}");
        }
    }
    out
}

fn render_status<S: KeyValueStore>(console: &Console<S>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Status:       {}", console.status().label());
    if let Some(error) = console.last_error()
        && !matches!(console.status(), ConnectionStatus::Connected(_))
    {
        let _ = writeln!(out, "Last error:   {error}");
    }
    match console.subscription() {
        Some(sub) => {
            let state = if sub.confirmed { "active" } else { "pending" };
            let _ = writeln!(
                out,
                "Subscription: {} (id {}, {state})",
                sub.destination, sub.id
            );
        }
        None => {
            let _ = writeln!(out, "Subscription: none");
        }
    }
    let _ = writeln!(out, "Messages:     {}", console.messages().received());
    if let Some(at) = console.messages().last_update() {
        let _ = writeln!(
            out,
            "Last update:  {}",
            at.with_timezone(&Local).format("%H:%M:%S")
        );
    }
    out
}

fn render_messages<S: KeyValueStore>(console: &Console<S>) -> String {
    let messages = console.messages();
    if messages.is_empty() {
        return "No messages received yet.\n".into();
    }
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Received {} message(s), showing {}:",
        messages.received(),
        messages.len()
    );
    for message in messages.entries() {
        let _ = writeln!(
            out,
            "#{} [{}] {}",
            message.sequence,
            message.received_at.with_timezone(&Local).format("%H:%M:%S"),
            message.destination.as_deref().unwrap_or("unknown"),
        );
        let _ = writeln!(out, "{}", message.body);
    }
    out
}

fn render_logs<S: KeyValueStore>(console: &Console<S>) -> String {
    let mut out = String::new();
    for entry in console.activity().since(0) {
        let _ = writeln!(out, "{}", format_entry(entry));
    }
    out
}
