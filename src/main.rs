use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::io::{self, Write};
use std::process::ExitCode;
use tianji::config::Settings;
use tianji::session::SessionPhase;
use tianji::{AppContext, DivinationController, Fields, HistoryRecord, ViewState, summary};
use tracing_subscriber::EnvFilter;

type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser)]
#[command(name = "tianji", version, about = "Stream AI divination readings in the terminal")]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Request a reading and stream it to stdout
    Ask {
        /// Divination type, e.g. tarot, bazi, ziwei, daily
        kind: String,

        /// Request field as key=value; values are parsed as JSON when possible
        #[arg(short = 'f', long = "field", value_parser = parse_field)]
        fields: Vec<(String, Value)>,

        /// Request fields as a JSON object, merged before --field values
        #[arg(long)]
        json: Option<String>,
    },
    /// Inspect saved readings
    History {
        #[command(subcommand)]
        action: HistoryCommand,
    },
}

#[derive(Subcommand)]
enum HistoryCommand {
    /// List saved readings, newest first
    List {
        #[arg(long = "type")]
        kind: Option<String>,
    },
    /// Print one saved reading
    Show {
        id: String,
        #[arg(long = "type")]
        kind: String,
    },
    /// Delete one saved reading
    Delete {
        id: String,
        #[arg(long = "type")]
        kind: String,
    },
    /// Delete every saved reading
    Clear,
}

#[tokio::main]
async fn main() -> CliResult<ExitCode> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let context = cli.settings.build_context()?;

    match cli.command {
        Command::Ask { kind, fields, json } => {
            let fields = collect_fields(json.as_deref(), fields)?;
            ask(context, kind, fields).await
        }
        Command::History { action } => {
            history(&context, action);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn ask(context: AppContext, kind: String, fields: Fields) -> CliResult<ExitCode> {
    if !summary::is_known_kind(&kind) {
        eprintln!("note: '{kind}' is not a known divination type, sending as-is");
    }
    eprintln!("{}…", summary::title_for(&kind));

    let controller = DivinationController::new(kind, context);
    let mut updates = controller.subscribe();
    let mut handle = controller.submit(fields);
    let mut renderer = TerminalRenderer::default();

    let phase = loop {
        tokio::select! {
            phase = &mut handle => break phase?,
            changed = updates.changed() => {
                if changed.is_err() {
                    break handle.await?;
                }
                renderer.render(&updates.borrow_and_update())?;
            }
            _ = tokio::signal::ctrl_c() => controller.cancel(),
        }
    };
    renderer.render(&controller.view())?;
    renderer.finish()?;

    match phase {
        SessionPhase::Completed => Ok(ExitCode::SUCCESS),
        SessionPhase::Cancelled => {
            eprintln!("cancelled");
            Ok(ExitCode::from(130))
        }
        _ => Ok(ExitCode::FAILURE),
    }
}

fn history(context: &AppContext, action: HistoryCommand) {
    let store = &context.history;
    match action {
        HistoryCommand::List { kind } => {
            let records = match kind {
                Some(kind) => store.list_by_kind(&kind),
                None => store.list_all(),
            };
            if records.is_empty() {
                println!("no saved readings");
            }
            for record in &records {
                println!(
                    "{}  {:<8}  {}  {} | {}",
                    format_timestamp(record.timestamp),
                    record.kind,
                    record.id,
                    record.title,
                    record.prompt_summary
                );
            }
        }
        HistoryCommand::Show { id, kind } => match store.find(&id, &kind) {
            Some(record) => print_record(&record),
            None => eprintln!("no reading {id} of type {kind}"),
        },
        HistoryCommand::Delete { id, kind } => store.delete(&id, &kind),
        HistoryCommand::Clear => store.clear_all(),
    }
}

fn print_record(record: &HistoryRecord) {
    println!("{} ({})", record.title, format_timestamp(record.timestamp));
    println!("{}", record.prompt_summary);
    if !record.metadata.is_empty() {
        println!("{}", Value::Object(record.metadata.clone()));
    }
    println!();
    println!("{}", record.result_text);
}

fn format_timestamp(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis)
        .map(|at| at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| millis.to_string())
}

fn parse_field(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn collect_fields(json: Option<&str>, pairs: Vec<(String, Value)>) -> CliResult<Fields> {
    let mut fields = match json {
        Some(raw) => match serde_json::from_str::<Value>(raw)? {
            Value::Object(map) => map,
            _ => return Err("--json must be a JSON object".into()),
        },
        None => Fields::new(),
    };
    fields.extend(pairs);
    Ok(fields)
}

/// Writes streamed text incrementally, reprinting only when the text is
/// replaced rather than extended (e.g. by an error message).
#[derive(Default)]
struct TerminalRenderer {
    printed: String,
}

impl TerminalRenderer {
    fn render(&mut self, view: &ViewState) -> io::Result<()> {
        let text = &view.result_text;
        if *text == self.printed {
            return Ok(());
        }

        let mut stdout = io::stdout().lock();
        match text.strip_prefix(self.printed.as_str()) {
            Some(suffix) => write!(stdout, "{suffix}")?,
            None => write!(stdout, "\n{text}")?,
        }
        stdout.flush()?;
        self.printed.clone_from(text);
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        if !self.printed.is_empty() {
            writeln!(io::stdout())?;
        }
        Ok(())
    }
}
