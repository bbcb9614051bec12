//! Notechat CLI
//!
//! Line-oriented chat panel: replies stream to stdout, logs go to stderr.

use clap::Parser;
use notechat::clipboard;
use notechat::commands::{help_text, parse_command, ChatCommand, ParsedCommand};
use notechat::config::{default_config_path, ChatConfig};
use notechat::endpoints::display_label;
use notechat::transcript;
use notechat::{
    ConversationSession, Direction, EndpointKind, NavigateOutcome, OpenAiCompatClient,
    PanelId, PanelRegistry, TurnOutcome,
};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Notechat - chat with an LLM, keeping transcripts as markdown
#[derive(Parser, Debug)]
#[command(name = "notechat")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for the live transcript and archives
    #[arg(long)]
    history_dir: Option<PathBuf>,

    /// Model to use for this run
    #[arg(short, long)]
    model: Option<String>,

    /// Fail on malformed transcripts and stream frames
    #[arg(long)]
    strict: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// First message to send
    #[arg(trailing_var_arg = true)]
    prompt: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = ChatConfig::load(&config_path)?;
    if let Some(dir) = cli.history_dir.clone() {
        config = config.with_history_dir(dir);
    }
    if let Some(model) = cli.model.as_deref() {
        config = config.with_model(model);
    }
    if cli.strict {
        config = config.with_strict(true);
    }

    info!("Config: {:?}", config_path);
    info!("History: {:?}", config.history_dir);

    let client = OpenAiCompatClient::new(config.timeout()).with_strict(config.strict_parsing);
    let session = Arc::new(
        ConversationSession::open(
            config.history_store(),
            Arc::new(client),
            config.endpoints.clone(),
            config.session_options(),
        )
        .await,
    );

    let registry = PanelRegistry::init();
    let panel = registry.open_panel(Arc::clone(&session));

    let mut repl = Repl {
        config,
        registry,
        panel,
        session,
        pending_images: Vec::new(),
    };
    let result = repl.run(cli.prompt.join(" ")).await;
    repl.registry.teardown();
    result
}

/// Spawn blocking task to read from stdin
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    eprintln!("Error reading stdin: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

struct Repl {
    config: ChatConfig,
    registry: PanelRegistry,
    panel: PanelId,
    session: Arc<ConversationSession>,
    pending_images: Vec<String>,
}

enum Flow {
    Continue,
    Quit,
}

impl Repl {
    async fn run(&mut self, initial_prompt: String) -> anyhow::Result<()> {
        let conversation = self.session.conversation();
        if !conversation.is_empty() {
            print!("{}", transcript::serialize(conversation.turns()));
        }
        println!("Type a message, or /help for commands.");

        if !initial_prompt.trim().is_empty() {
            self.send(&initial_prompt).await;
        }

        let mut input = spawn_stdin_reader();
        loop {
            prompt()?;
            let line = tokio::select! {
                line = input.recv() => line,
                _ = tokio::signal::ctrl_c() => None,
            };
            let Some(line) = line else {
                break;
            };
            if let Flow::Quit = self.handle_line(&line).await {
                break;
            }
        }
        Ok(())
    }

    async fn handle_line(&mut self, line: &str) -> Flow {
        match parse_command(line) {
            Some(ParsedCommand::Command(cmd, args)) => self.handle_command(cmd, &args).await,
            Some(ParsedCommand::Unknown(name)) => {
                let suggestions: Vec<String> = ChatCommand::matches(&name)
                    .iter()
                    .map(|c| c.to_string())
                    .collect();
                if suggestions.is_empty() {
                    notice(&format!("Unknown command /{name}. Try /help."));
                } else {
                    notice(&format!(
                        "Unknown command /{name}. Did you mean {}?",
                        suggestions.join(", ")
                    ));
                }
                Flow::Continue
            }
            Some(ParsedCommand::Literal(text)) => {
                self.send(&text).await;
                Flow::Continue
            }
            None => {
                self.send(line).await;
                Flow::Continue
            }
        }
    }

    async fn send(&mut self, text: &str) {
        let Some(cancel) = self.registry.begin_turn(self.panel) else {
            warn!("Panel {} is closed", self.panel);
            return;
        };
        let images = std::mem::take(&mut self.pending_images);

        // Ctrl-C cancels the reply instead of exiting
        let watcher = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            })
        };

        let mut printed = 0usize;
        let mut render = |text: &str| {
            let mut out = io::stdout().lock();
            let _ = if printed <= text.len() && text.is_char_boundary(printed) {
                write!(out, "{}", &text[printed..])
            } else {
                write!(out, "\n{}", text)
            };
            let _ = out.flush();
            printed = text.len();
        };

        let result = self
            .session
            .submit(text, images, &mut render, &cancel)
            .await;
        watcher.abort();

        match result {
            Ok(TurnOutcome::Ignored) => {}
            Ok(TurnOutcome::Replied(_)) => println!(),
            Ok(TurnOutcome::Failed(message)) => {
                println!();
                notice(&format!("Request failed: {message}"));
            }
            Ok(TurnOutcome::Cancelled) => {
                println!();
                notice("Reply cancelled.");
            }
            Err(e) => notice(&e.notice()),
        }
    }

    async fn handle_command(&mut self, cmd: ChatCommand, args: &str) -> Flow {
        debug!("Command {} {:?}", cmd, args);
        match cmd {
            ChatCommand::New => match self.session.new_conversation().await {
                Ok(Some(path)) => notice(&format!(
                    "Archived to {}. Started a new conversation.",
                    path.display()
                )),
                Ok(None) => notice("Started a new conversation."),
                Err(e) => notice(&e.notice()),
            },
            ChatCommand::Clear => match self.session.clear().await {
                Ok(true) => notice("Conversation cleared."),
                Ok(false) => notice("Nothing to clear."),
                Err(e) => notice(&e.notice()),
            },
            ChatCommand::Older => self.restore(Direction::Older).await,
            ChatCommand::Newer => self.restore(Direction::Newer).await,
            ChatCommand::Image => self.attach_file(args).await,
            ChatCommand::Paste => match clipboard::paste_image() {
                Ok(image) => {
                    self.pending_images.push(image.base64);
                    notice(&format!(
                        "Attached {}x{} clipboard image ({} pending).",
                        image.width,
                        image.height,
                        self.pending_images.len()
                    ));
                }
                Err(e) => notice(&e.notice()),
            },
            ChatCommand::Copy => match self.session.last_reply_text() {
                Some(text) => match clipboard::copy_text(&text) {
                    Ok(()) => notice("Copied the last reply."),
                    Err(e) => notice(&e.notice()),
                },
                None => notice("No reply to copy."),
            },
            ChatCommand::Key => self.endpoint_command(EndpointKind::ApiKey, args),
            ChatCommand::Url => self.endpoint_command(EndpointKind::BaseUrl, args),
            ChatCommand::Model => self.endpoint_command(EndpointKind::Model, args),
            ChatCommand::History => self.list_history().await,
            ChatCommand::Help => print!("{}", help_text()),
            ChatCommand::Quit => return Flow::Quit,
        }
        Flow::Continue
    }

    async fn restore(&mut self, direction: Direction) {
        match self.session.restore(direction).await {
            Ok(NavigateOutcome::Moved(file)) => {
                print!("{}", transcript::serialize(self.session.conversation().turns()));
                notice(&format!("Opened {}.", file.basename()));
            }
            Ok(NavigateOutcome::AtBoundary) => match direction {
                Direction::Older => notice("Already at the oldest conversation."),
                Direction::Newer => notice("Already at the newest conversation."),
            },
            Ok(NavigateOutcome::NoArchives) => notice("No archived conversations."),
            Err(e) => notice(&e.notice()),
        }
    }

    async fn attach_file(&mut self, args: &str) {
        if args.is_empty() {
            notice("Usage: /image <path>");
            return;
        }
        let path = PathBuf::from(args);
        match clipboard::encode_image_file(&path).await {
            Ok(payload) => {
                self.pending_images.push(payload);
                notice(&format!(
                    "Attached {} ({} pending).",
                    path.display(),
                    self.pending_images.len()
                ));
            }
            Err(e) => notice(&e.notice()),
        }
    }

    fn endpoint_command(&mut self, kind: EndpointKind, args: &str) {
        if args.is_empty() {
            let endpoints = self.session.endpoints();
            let current = endpoints.current_index(kind);
            let entries = endpoints.entries(kind);
            if entries.is_empty() {
                notice(&format!("No {} configured.", kind.name()));
                return;
            }
            for (i, entry) in entries.iter().enumerate() {
                let marker = if i == current { "*" } else { " " };
                println!("{marker} {}. {}", i + 1, entry_label(kind, entry));
            }
            return;
        }

        let index = match args.parse::<usize>() {
            Ok(n) if n >= 1 => n - 1,
            _ => {
                notice(&format!("Expected a number, got {args:?}"));
                return;
            }
        };
        let result = self
            .session
            .select_endpoint(kind, index)
            .and_then(|()| self.config.endpoints.select(kind, index))
            .and_then(|()| self.config.save_selection(kind));
        match result {
            Ok(()) => {
                let endpoints = self.session.endpoints();
                let label = endpoints
                    .current(kind)
                    .map(|e| entry_label(kind, e))
                    .unwrap_or_default();
                notice(&format!("Using {} {}: {}", kind.name(), index + 1, label));
            }
            Err(e) => notice(&e.notice()),
        }
    }

    async fn list_history(&self) {
        let files = match self.session.store().list_archived().await {
            Ok(files) => files,
            Err(e) => {
                notice(&e.notice());
                return;
            }
        };
        if files.is_empty() {
            notice("No archived conversations.");
            return;
        }
        let current = self.session.current_archive();
        for (i, file) in files.iter().enumerate() {
            let marker = if current.as_deref() == Some(file.path.as_path()) {
                "*"
            } else {
                " "
            };
            println!("{marker} {}. {}", i + 1, file.basename());
        }
    }
}

/// Label shown for an entry; bare API keys are masked.
fn entry_label(kind: EndpointKind, entry: &str) -> String {
    let label = display_label(kind, entry);
    if kind == EndpointKind::ApiKey && label == entry.trim() {
        mask_secret(&label)
    } else {
        label
    }
}

fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..5].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}

fn notice(message: &str) {
    println!("[notechat] {message}");
}

fn prompt() -> io::Result<()> {
    let mut out = io::stdout().lock();
    write!(out, "> ")?;
    out.flush()
}
