mod commands;
mod console;
mod demo;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use penelope_backend::delivery::{DeliveryEvent, DeliveryShaper};
use penelope_backend::engine::{InferenceEngine, LlamaServerEngine, ScriptedEngine};
use penelope_backend::{PenelopeConfig, Supervisor};

use commands::Command;
use console::{Console, Output};

#[derive(Parser, Debug)]
#[command(name = "penelope", version, about = "Talk to a model that ponders before it speaks")]
struct Cli {
    /// Config file (default: next to the executable, then the user config dir)
    #[arg(long, env = "PENELOPE_CONFIG")]
    config: Option<PathBuf>,

    /// Print reflection tokens as they are generated
    #[arg(long)]
    show_thoughts: bool,

    /// Answer every message without pondering or reflection
    #[arg(long)]
    plain: bool,

    /// Use a canned in-process engine instead of a llama.cpp server
    #[arg(long)]
    scripted: bool,

    /// Simulated delivery time per character of output, in milliseconds
    #[arg(long, default_value_t = 0)]
    pace_ms: u64,

    /// Write the effective configuration to this file and exit
    #[arg(long, value_name = "PATH")]
    write_config: Option<PathBuf>,
}

struct Session {
    show_thoughts: bool,
    plain: bool,
    console: Console,
    shaper: DeliveryShaper,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,penelope=debug,penelope_backend=debug")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => PenelopeConfig::load_from(path)?,
        None => PenelopeConfig::load(),
    };
    if cli.show_thoughts {
        config.delivery.show_thoughts = true;
    }
    if let Some(path) = &cli.write_config {
        config.save_to(path)?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    let session = Session {
        show_thoughts: config.delivery.show_thoughts,
        plain: cli.plain,
        console: Console::spawn(Duration::from_millis(cli.pace_ms)),
        shaper: DeliveryShaper::new(config.delivery.clone()),
    };

    if cli.scripted {
        tracing::info!("Using the scripted demo engine");
        let supervisor = Supervisor::new(ScriptedEngine::new(), &config)
            .context("failed to start supervisor")?;
        repl(supervisor, session, demo::queue_turn)
    } else {
        tracing::info!("Engine: {}", config.engine.api_url);
        let engine =
            LlamaServerEngine::new(&config.engine).context("failed to create engine client")?;
        let supervisor =
            Supervisor::new(engine, &config).context("failed to start supervisor")?;
        repl(supervisor, session, |_: &mut LlamaServerEngine, _: &str, _: bool| {})
    }
}

fn repl<E, F>(mut supervisor: Supervisor<E>, mut session: Session, mut before_turn: F) -> Result<()>
where
    E: InferenceEngine,
    F: FnMut(&mut E, &str, bool),
{
    println!("Penelope is listening. Type /help for commands.");
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("failed to read stdin")?;
        match commands::parse(&line) {
            Command::Empty => continue,
            Command::Quit => break,
            Command::Help => println!("{}", commands::HELP),
            Command::Reset => match supervisor.reset_memory() {
                Ok(()) => println!("(memory reset)"),
                Err(e) => {
                    tracing::error!("Reset failed: {}", e);
                    eprintln!("(reset failed: {e})");
                }
            },
            Command::Transcript => println!("{}", supervisor.speaking_prompt()),
            Command::Report => match supervisor.last_report() {
                Some(report) => println!("{:#?}", report),
                None => println!("(no turns yet)"),
            },
            Command::Say(message) => {
                let plain = session.plain;
                turn(&mut supervisor, &mut session, &mut before_turn, &message, plain);
            }
            Command::Plain(message) => {
                turn(&mut supervisor, &mut session, &mut before_turn, &message, true);
            }
        }
    }
    tracing::info!("Goodbye");
    Ok(())
}

fn turn<E, F>(
    supervisor: &mut Supervisor<E>,
    session: &mut Session,
    before_turn: &mut F,
    message: &str,
    plain: bool,
) where
    E: InferenceEngine,
    F: FnMut(&mut E, &str, bool),
{
    supervisor.add_user_message(message);
    before_turn(supervisor.engine_mut(), message, plain);
    if let Err(e) = stream_turn(supervisor, session, plain) {
        session.shaper.finish();
        tracing::error!("Turn failed: {:#}", e);
        eprintln!("\n(turn failed: {e:#})");
    }
}

fn stream_turn<E: InferenceEngine>(
    supervisor: &mut Supervisor<E>,
    session: &mut Session,
    plain: bool,
) -> Result<()> {
    let stream = if plain {
        supervisor.generate_plain_response()
    } else {
        supervisor.generate_response()
    };

    let mut out = io::stdout().lock();
    let mut thinking = false;
    for item in stream {
        let token = item.context("generation failed")?;

        if session.show_thoughts && token.is_thought != thinking {
            let label = if token.is_thought {
                "\n  [thinking] "
            } else {
                " [/thinking]\n"
            };
            write!(out, "{label}")?;
        }
        thinking = token.is_thought;

        for event in session.shaper.feed(&token, &session.console) {
            match event {
                DeliveryEvent::Filler(filler) => write!(out, "{filler}")?,
                DeliveryEvent::Cue(cue) => session.console.send(Output::Cue(cue)),
                DeliveryEvent::Utterance(text) => session.console.send(Output::Utterance(text)),
            }
        }

        if !token.is_thought || session.show_thoughts {
            write!(out, "{}", token.token)?;
        }
        out.flush()?;
    }

    if let Some(DeliveryEvent::Utterance(text)) = session.shaper.finish() {
        session.console.send(Output::Utterance(text));
    }
    writeln!(out)?;
    out.flush()?;
    session.console.drain();
    Ok(())
}
