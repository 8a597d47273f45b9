use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing_subscriber::EnvFilter;

use chatflow_lib::config::{self, ClientConfig};
use chatflow_lib::events::{StatusLine, TurnUpdate};
use chatflow_lib::iteration_log::LogEntry;
use chatflow_lib::protocol::{MediaKind, MediaRef, ToolCallStatus};
use chatflow_lib::reasoning_parser::ClassifiedView;
use chatflow_lib::stream_client::StreamClient;
use chatflow_lib::tool_execution::{HttpToolExecutor, ToolExecutor, ToolRun};
use chatflow_lib::{ChatError, ChatManager, ToolMode, TurnOutcome};

const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Off,
    Client,
    Mcp,
}

impl From<ModeArg> for ToolMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Off => ToolMode::Off,
            ModeArg::Client => ToolMode::ClientParse,
            ModeArg::Mcp => ToolMode::ServerMcp,
        }
    }
}

#[derive(Parser)]
#[command(name = "chatflow", about = "Streaming chat client for tool-using models")]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Chat server base URL
    #[arg(long)]
    server: Option<String>,

    #[arg(long)]
    model: Option<String>,

    /// Enable a tool by id (repeatable)
    #[arg(long = "tool")]
    tools: Vec<String>,

    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    #[arg(long)]
    temperature: Option<f32>,

    #[arg(long)]
    max_tokens: Option<u32>,

    /// Write the merged settings back to the config file
    #[arg(long)]
    save: bool,
}

impl Cli {
    fn apply(&self, cfg: &mut ClientConfig) {
        if let Some(server) = &self.server {
            cfg.server_url = server.clone();
        }
        if let Some(model) = &self.model {
            cfg.model_id = Some(model.clone());
        }
        if !self.tools.is_empty() {
            cfg.enabled_tools = self.tools.clone();
        }
        if let Some(mode) = self.mode {
            cfg.tool_mode = mode.into();
        }
        if let Some(t) = self.temperature {
            cfg.params.temperature = t;
        }
        if let Some(n) = self.max_tokens {
            cfg.params.max_tokens = n;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), ChatError> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);
    let mut cfg = config::load_config(&config_path);
    cli.apply(&mut cfg);
    if cli.save {
        config::save_config(&config_path, &cfg)?;
        tracing::info!(path = %config_path.display(), "config saved");
    }

    let http = reqwest::Client::new();
    let transport = StreamClient::new(cfg.server_url.clone(), http.clone());
    let executor = HttpToolExecutor::new(cfg.server_url.clone(), http);
    let mut manager = ChatManager::new(cfg.turn_settings());

    println!(
        "chatflow: {} ({:?} tools). /image PATH, /video PATH, /clear, /quit",
        cfg.server_url, cfg.tool_mode
    );

    let mut pending_media = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();

        if let Some(path) = line.strip_prefix("/image ") {
            attach(&mut pending_media, MediaKind::Image, path.trim());
            continue;
        }
        if let Some(path) = line.strip_prefix("/video ") {
            attach(&mut pending_media, MediaKind::Video, path.trim());
            continue;
        }
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/clear" => {
                match manager.clear_conversation() {
                    Ok(()) => println!("(conversation cleared)"),
                    Err(e) => eprintln!("{}", e),
                }
                continue;
            }
            _ => {}
        }

        let turn = match manager.start_turn(line, std::mem::take(&mut pending_media)) {
            Ok(turn) => turn,
            Err(e) => {
                eprintln!("{}", e);
                continue;
            }
        };

        let tools: Option<&dyn ToolExecutor> = match manager.settings().mode {
            ToolMode::ClientParse => Some(&executor),
            _ => None,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let renderer = tokio::spawn(render(rx));

        let run = turn.run(&transport, tools, tx);
        tokio::pin!(run);
        let report = loop {
            tokio::select! {
                report = &mut run => break report,
                _ = tokio::signal::ctrl_c() => {
                    manager.cancel();
                }
            }
        };

        if let Err(e) = renderer.await {
            tracing::warn!("renderer task failed: {}", e);
        }
        manager.finish_turn(&report);
    }

    Ok(())
}

fn attach(pending: &mut Vec<MediaRef>, kind: MediaKind, path: &str) {
    match MediaRef::from_file(kind, Path::new(path)) {
        Ok(media) => {
            pending.push(media);
            println!("(attached {}, {} pending)", path, pending.len());
        }
        Err(e) => eprintln!("cannot attach {}: {}", path, e),
    }
}

/// How to move the terminal from the text already printed to the next one.
#[derive(Debug, PartialEq, Eq)]
enum Redraw<'a> {
    /// The new text extends what is shown; print only the tail.
    Append(&'a str),
    /// The classifier rewrote shown text; print the whole thing again.
    Replace(&'a str),
}

fn redraw<'a>(shown: &str, next: &'a str) -> Redraw<'a> {
    match next.strip_prefix(shown) {
        Some(tail) => Redraw::Append(tail),
        None => Redraw::Replace(next),
    }
}

/// What one turn has written so far. Reasoning is shown while it is open
/// and collapsed once its block closes.
#[derive(Debug, Default)]
struct Screen {
    reasoning: String,
    answer: String,
}

impl Screen {
    /// Text to print for a new view.
    fn apply(&mut self, view: &ClassifiedView) -> String {
        let mut out = String::new();

        if view.reasoning_open {
            match redraw(&self.reasoning, &view.reasoning) {
                Redraw::Append("") => {}
                Redraw::Append(tail) => out.push_str(&format!("{}{}{}", DIM, tail, RESET)),
                Redraw::Replace(text) => out.push_str(&format!("\n{}{}{}", DIM, text, RESET)),
            }
            self.reasoning = view.reasoning.clone();
        } else if view.reasoning_complete() && !self.reasoning.is_empty() {
            out.push_str(&format!("\n{}[reasoning collapsed]{}\n", DIM, RESET));
            self.reasoning.clear();
        }

        match redraw(&self.answer, &view.answer) {
            Redraw::Append(tail) => out.push_str(tail),
            Redraw::Replace(text) => {
                out.push_str("\n~ ");
                out.push_str(text);
            }
        }
        self.answer = view.answer.clone();

        out
    }
}

/// Prints turn updates as they arrive.
async fn render(mut rx: UnboundedReceiver<TurnUpdate>) {
    let mut screen = Screen::default();
    let mut out = std::io::stdout();

    while let Some(update) = rx.recv().await {
        match update {
            TurnUpdate::Status { status } => match status {
                StatusLine::Cleared => {}
                other => eprintln!("{}[{}]{}", DIM, other.label(), RESET),
            },
            TurnUpdate::View { view } => print!("{}", screen.apply(&view)),
            TurnUpdate::Error { error } => println!("\nerror: {}", error),
            TurnUpdate::LogAppended { entry, .. } => print_entry(&entry, "*"),
            TurnUpdate::LogUpdated { entry, .. } => print_entry(&entry, "^"),
            TurnUpdate::ToolRunStarted { run, .. } => print_run(&run),
            TurnUpdate::ToolRunFinished { run, .. } => print_run(&run),
            TurnUpdate::Finished { outcome } => match outcome {
                TurnOutcome::Cancelled => println!("\n(paused)"),
                _ => println!(),
            },
        }
        let _ = out.flush();
    }
}

fn print_entry(entry: &LogEntry, marker: &str) {
    let time = entry.time().map(|t| format!("{} ", t)).unwrap_or_default();
    println!("\n{} {}{}", marker, time, entry.title());
    if let Some(detail) = entry.detail() {
        for line in detail.lines() {
            println!("    {}", line);
        }
    }
}

fn print_run(run: &ToolRun) {
    let args = serde_json::to_string(&run.request.arguments).unwrap_or_default();
    match run.status {
        ToolCallStatus::Executing => println!("\n-> {}({})", run.request.name, args),
        ToolCallStatus::Success => {
            let result = run
                .result
                .as_ref()
                .map(|r| r.to_string())
                .unwrap_or_default();
            println!("<- {}: {}", run.request.name, result);
        }
        ToolCallStatus::Error => println!(
            "!! {}: {}",
            run.request.name,
            run.error.as_deref().unwrap_or("failed")
        ),
    }
}
