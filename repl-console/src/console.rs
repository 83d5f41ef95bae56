// Interactive console
//
// Line loop over stdin: `:`-commands for session control, everything else
// accumulated until it forms a complete unit and evaluated. Remote output
// does not pass through here; the pump threads own stdout/stderr
// forwarding.

use std::io::Write;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::debug;

use crate::session::{Evaluation, Session, SessionError, SnippetExecutor};
use crate::wrap::{self, SnippetId};

/// Buffers lines until they form a lexically complete unit.
#[derive(Debug, Default)]
pub struct InputBuffer {
    pending: String,
}

impl InputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn prompt(&self) -> &'static str {
        if self.pending.is_empty() {
            "> "
        } else {
            "... "
        }
    }

    /// Add one line; returns the buffered input once it is complete.
    pub fn push_line(&mut self, line: &str) -> Option<String> {
        if !self.pending.is_empty() {
            self.pending.push('\n');
        }
        self.pending.push_str(line);
        if wrap::is_complete(&self.pending) {
            Some(std::mem::take(&mut self.pending))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Quit,
    Stop,
    Info,
    List,
    Drop(SnippetId),
    Classpath(String),
    Help,
}

/// Parse a `:`-command line. `Err` carries the usage complaint.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let mut parts = line.splitn(2, char::is_whitespace);
    let head = parts.next().unwrap_or("");
    let rest = parts.next().map(str::trim).unwrap_or("");

    match head {
        ":quit" | ":q" | ":exit" => Ok(Command::Quit),
        ":stop" => Ok(Command::Stop),
        ":info" => Ok(Command::Info),
        ":list" => Ok(Command::List),
        ":help" | ":?" => Ok(Command::Help),
        ":drop" => rest
            .parse::<SnippetId>()
            .map(Command::Drop)
            .map_err(|_| ":drop takes a snippet id".to_string()),
        ":cp" => {
            if rest.is_empty() {
                Err(":cp takes a path".to_string())
            } else {
                Ok(Command::Classpath(rest.to_string()))
            }
        }
        other => Err(format!("unknown command {other}; try :help")),
    }
}

const HELP: &str = "\
:help          show this help
:list          list snippets and their status
:drop <id>     retire a snippet (warns about dependents)
:cp <path>     add a classpath entry in the remote process
:info          show target VM and engine details
:stop          interrupt the running snippet
:quit          shut the session down and exit";

/// Drive the console until quit, stdin EOF, or engine termination.
pub async fn run<E: SnippetExecutor>(
    mut session: Session<E>,
    mut terminated: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut input = InputBuffer::new();

    loop {
        if *terminated.borrow_and_update() {
            eprintln!("remote engine terminated");
            break;
        }
        prompt(input.prompt())?;

        let line = tokio::select! {
            changed = terminated.changed() => {
                // Either the watch fired or its sender is gone; both mean
                // the engine is unusable.
                let _ = changed;
                eprintln!("remote engine terminated");
                break;
            }
            line = lines.next_line() => line?,
        };

        let Some(line) = line else {
            break; // stdin closed
        };

        if input.is_empty() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.starts_with(':') {
                match parse_command(trimmed) {
                    Ok(Command::Quit) => break,
                    Ok(command) => handle_command(&mut session, command).await,
                    Err(complaint) => eprintln!("{complaint}"),
                }
                continue;
            }
        }

        let Some(ready) = input.push_line(&line) else {
            continue;
        };

        match session.eval(&ready).await {
            Ok(outcome) => report(&session, outcome),
            Err(SessionError::NotOneUnit) => {
                eprintln!("input must form exactly one snippet");
            }
            Err(SessionError::Terminated) | Err(SessionError::Closed) => {
                eprintln!("remote engine terminated");
                break;
            }
            Err(SessionError::Exec(e)) => eprintln!("error: {e}"),
        }
    }

    if !session.is_closed() {
        session.shutdown().await;
    }
    Ok(())
}

async fn handle_command<E: SnippetExecutor>(session: &mut Session<E>, command: Command) {
    match command {
        Command::Quit => unreachable!("quit is handled by the loop"),
        Command::Help => println!("{HELP}"),
        Command::Stop => session.stop().await,
        Command::Info => {
            let details = serde_json::json!({
                "target": session.target_spec(),
                "engine": session.version_info().await,
            });
            match serde_json::to_string_pretty(&details) {
                Ok(rendered) => println!("{rendered}"),
                Err(e) => eprintln!("error: {e}"),
            }
        }
        Command::List => {
            for snippet in session.snippets() {
                let first_line = snippet.source.lines().next().unwrap_or("");
                println!(
                    "{:>4} {:<12} {:<12} {}",
                    snippet.id,
                    format!("{:?}", snippet.kind),
                    format!("{:?}", snippet.status),
                    first_line
                );
            }
        }
        Command::Drop(id) => match session.drop_snippet(id) {
            None => eprintln!("no snippet {id}"),
            Some(dependents) => {
                println!("dropped snippet {id}");
                warn_dependents(session, &dependents);
            }
        },
        Command::Classpath(path) => match session.add_classpath(&path).await {
            Ok(()) => println!("classpath entry added"),
            Err(e) => eprintln!("error: {e}"),
        },
    }
}

fn report<E: SnippetExecutor>(session: &Session<E>, outcome: Evaluation) {
    match outcome {
        Evaluation::Value {
            rendered,
            replaced,
            affected,
            ..
        } => {
            if !rendered.is_empty() {
                println!("=> {rendered}");
            }
            if !replaced.is_empty() {
                debug!(?replaced, "definitions replaced");
            }
            warn_dependents(session, &affected);
        }
        Evaluation::Exception { message, .. } => println!("exception: {message}"),
        Evaluation::Rejected { message, .. } => println!("rejected: {message}"),
    }
}

fn warn_dependents<E: SnippetExecutor>(session: &Session<E>, dependents: &[SnippetId]) {
    for &id in dependents {
        let name = session
            .snippets()
            .find(|s| s.id == id)
            .and_then(|s| s.declared_name.clone())
            .unwrap_or_else(|| format!("snippet {id}"));
        println!("note: {name} references a replaced definition");
    }
}

fn prompt(text: &str) -> std::io::Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(text.as_bytes())?;
    stdout.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_buffer_holds_open_braces() {
        let mut input = InputBuffer::new();
        assert_eq!(input.push_line("void f() {"), None);
        assert_eq!(input.prompt(), "... ");
        let ready = input.push_line("}").unwrap();
        assert_eq!(ready, "void f() {\n}");
        assert_eq!(input.prompt(), "> ");
    }

    #[test]
    fn single_line_input_is_immediately_complete() {
        let mut input = InputBuffer::new();
        assert_eq!(input.push_line("1 + 1").as_deref(), Some("1 + 1"));
    }

    #[test]
    fn commands_parse() {
        assert_eq!(parse_command(":quit"), Ok(Command::Quit));
        assert_eq!(parse_command(":q"), Ok(Command::Quit));
        assert_eq!(parse_command(":stop"), Ok(Command::Stop));
        assert_eq!(parse_command(":drop 3"), Ok(Command::Drop(3)));
        assert_eq!(
            parse_command(":cp /opt/lib.jar"),
            Ok(Command::Classpath("/opt/lib.jar".to_string()))
        );
        assert!(parse_command(":drop x").is_err());
        assert!(parse_command(":cp").is_err());
        assert!(parse_command(":frobnicate").is_err());
    }
}
