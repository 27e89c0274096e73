//! relay - chat with an OpenAI-compatible endpoint from the terminal

mod config;

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::anyhow;
use chat_relay::{
    Conversation, ConversationRelay, HttpTransport, Message, TurnEvent, TurnEventStream,
    TurnHandle,
};
use clap::Parser;
use futures::StreamExt;
use parking_lot::Mutex;

use crate::config::Config;

/// relay - streaming chat for OpenAI-compatible endpoints
#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Send a single prompt and exit
    prompt: Option<String>,

    /// Model identifier (default from config, else gpt-4o-mini)
    #[arg(short, long)]
    model: Option<String>,

    /// Base URL of the endpoint, e.g. http://localhost:11434/v1
    #[arg(short, long)]
    base_url: Option<String>,

    /// API key (overrides config and environment)
    #[arg(long)]
    api_key: Option<String>,

    /// System prompt
    #[arg(short, long)]
    system: Option<String>,

    /// Sampling temperature
    #[arg(short, long)]
    temperature: Option<f64>,

    /// Wait for the full reply instead of streaming it
    #[arg(long)]
    no_stream: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

impl Args {
    /// Command-line values take precedence over the config file
    fn apply_to(&self, cfg: &mut Config) {
        if let Some(ref model) = self.model {
            cfg.model_id = Some(model.clone());
        }
        if let Some(ref base_url) = self.base_url {
            cfg.base_url = Some(base_url.clone());
        }
        if let Some(ref api_key) = self.api_key {
            cfg.api_key = Some(api_key.clone());
        }
        if let Some(ref system) = self.system {
            cfg.system_prompt = Some(system.clone());
        }
        if let Some(temperature) = self.temperature {
            cfg.temperature = Some(temperature);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("chat_relay=debug,relay=debug")
            .with_writer(io::stderr)
            .init();
    }

    if args.init_config {
        let path = Config::config_path();
        Config::init_at(&path)?;
        println!("Config file at: {}", path.display());
        println!("\nExample config:\n{}", config::example_config());
        return Ok(());
    }

    let mut cfg = Config::load();
    args.apply_to(&mut cfg);

    let transport = Arc::new(HttpTransport::new()?);
    let relay = ConversationRelay::new(cfg.relay_config(), transport);

    let mut conversation = new_conversation(&cfg);
    let stream = !args.no_stream;
    let interrupts = Interrupts::default();
    interrupts.listen();

    if let Some(ref prompt) = args.prompt {
        return run_turn(&relay, &interrupts, &mut conversation, prompt, stream).await;
    }

    run_interactive(&relay, &interrupts, &cfg, &mut conversation, stream).await
}

/// Ctrl-C routing for the whole session. A press aborts the reply that is
/// streaming; a press with nothing to abort (idle, or a second press) exits.
#[derive(Clone, Default)]
struct Interrupts {
    active: Arc<Mutex<Option<TurnHandle>>>,
}

impl Interrupts {
    fn listen(&self) {
        let interrupts = self.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if !interrupts.interrupt() {
                    eprintln!();
                    std::process::exit(130);
                }
            }
        });
    }

    fn track(&self, handle: TurnHandle) {
        *self.active.lock() = Some(handle);
    }

    fn clear(&self) {
        self.active.lock().take();
    }

    /// Abort the tracked turn. Returns `false` if there was none to abort.
    fn interrupt(&self) -> bool {
        match self.active.lock().take() {
            Some(handle) => handle.abort(),
            None => false,
        }
    }
}

fn new_conversation(cfg: &Config) -> Conversation {
    let mut conversation = Conversation::new();
    if let Some(ref system) = cfg.system_prompt {
        conversation.push(Message::system(system.clone()));
    }
    conversation
}

/// Send one user message. History only grows when the reply succeeds.
async fn run_turn(
    relay: &ConversationRelay,
    interrupts: &Interrupts,
    conversation: &mut Conversation,
    input: &str,
    stream: bool,
) -> anyhow::Result<()> {
    let mut next = conversation.clone();
    next.push(Message::user(input));

    let reply = if stream {
        stream_reply(relay, interrupts, &next).await?
    } else {
        let reply = relay.send_once(next.history()).await?;
        println!("{}", reply);
        reply
    };

    next.push(Message::assistant(reply));
    *conversation = next;
    Ok(())
}

/// Print deltas as they arrive. Ctrl-C aborts the turn.
async fn stream_reply(
    relay: &ConversationRelay,
    interrupts: &Interrupts,
    conversation: &Conversation,
) -> anyhow::Result<String> {
    let (handle, events) = relay.send_stream_events(conversation);
    if let Some(handle) = handle {
        interrupts.track(handle);
    }
    let reply = print_events(events).await;
    interrupts.clear();
    reply
}

async fn print_events(mut events: TurnEventStream) -> anyhow::Result<String> {
    let mut reply = String::new();
    while let Some(event) = events.next().await {
        match event {
            TurnEvent::Delta { text } => {
                print!("{}", text);
                io::stdout().flush().ok();
                reply.push_str(&text);
            }
            TurnEvent::Completed => {
                println!();
                return Ok(reply);
            }
            TurnEvent::Failed { message } => {
                if !reply.is_empty() {
                    println!();
                }
                return Err(anyhow!(message));
            }
        }
    }
    Err(anyhow!("reply stream closed unexpectedly"))
}

async fn run_interactive(
    relay: &ConversationRelay,
    interrupts: &Interrupts,
    cfg: &Config,
    conversation: &mut Conversation,
    stream: bool,
) -> anyhow::Result<()> {
    if io::IsTerminal::is_terminal(&io::stderr()) {
        let config = relay.config();
        eprintln!("relay ({} @ {})", config.model_id, config.base_url);
        eprintln!("/clear starts over, /quit exits");
        eprintln!();
    }

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            // EOF
            break;
        }

        let input = input.trim();
        match input {
            "" => continue,
            "/quit" | "/exit" => break,
            "/clear" => {
                *conversation = new_conversation(cfg);
                println!("Conversation cleared.");
                continue;
            }
            _ => {}
        }

        if let Err(e) = run_turn(relay, interrupts, conversation, input, stream).await {
            eprintln!("Error: {}", e);
        }
        println!();
    }

    Ok(())
}
