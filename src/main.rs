use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use voice_duplex::audio::{self, AudioBackend, CpalBackend, MockAudioBackend};
use voice_duplex::session::{self, ProbeOutcome};
use voice_duplex::{ClientConfig, DuplexClient, Endpoint, SessionEvent, SessionState};

#[derive(Parser)]
#[command(name = "voice-duplex")]
#[command(about = "Full-duplex voice chat client for a real-time speech model")]
#[command(long_about = "
Streams microphone audio to a duplex speech service over WebSocket and plays
back the reply while printing its transcript.

EXAMPLES:
  # Chat with a persona
  voice-duplex chat --url wss://pod-8998.proxy.example/api/chat \\
      --text-prompt \"You are a patient tutor\" --voice-prompt voice_1.pt

  # Check whether the service is up yet
  voice-duplex probe --url wss://pod-8998.proxy.example/api/chat --insecure

  # List audio devices
  voice-duplex devices
")]
struct Cli {
    /// Read settings from this file instead of ./.env
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a voice session (Ctrl+C to stop)
    Chat {
        #[command(flatten)]
        connection: ConnectionArgs,

        #[arg(long)]
        text_prompt: Option<String>,

        /// Voice preset file name understood by the service
        #[arg(long)]
        voice_prompt: Option<String>,

        #[arg(long)]
        seed: Option<String>,

        /// Input device name (default device when omitted)
        #[arg(long)]
        input_device: Option<String>,

        #[arg(long)]
        output_device: Option<String>,

        /// Run without sound hardware; only the transcript is shown
        #[arg(long)]
        no_audio: bool,

        /// Give up after this many consecutive failed connection attempts
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Connect once and report whether the service sends its handshake
    Probe {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Seconds to wait for the first message
        #[arg(long, default_value = "10")]
        wait: u64,

        #[arg(long)]
        voice_prompt: Option<String>,
    },
    /// List available audio devices and exit
    Devices,
}

#[derive(Args)]
struct ConnectionArgs {
    /// Service endpoint (ws:// or wss://); falls back to DUPLEX_URL
    #[arg(long)]
    url: Option<String>,

    /// Accept invalid TLS certificates (self-signed proxies)
    #[arg(long)]
    insecure: bool,

    #[arg(long)]
    user_agent: Option<String>,

    #[arg(long)]
    origin: Option<String>,

    /// Send a handshake frame after connecting
    #[arg(long)]
    send_handshake: bool,
}

impl ConnectionArgs {
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(url) = &self.url {
            config.endpoint = Some(url.clone());
        }
        if self.insecure {
            config.accept_invalid_certs = true;
        }
        if let Some(user_agent) = &self.user_agent {
            config.user_agent = Some(user_agent.clone());
        }
        if let Some(origin) = &self.origin {
            config.origin = Some(origin.clone());
        }
        if self.send_handshake {
            config.send_handshake = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = match &cli.env_file {
        Some(path) => ClientConfig::from_env_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ClientConfig::from_env()?,
    };

    match cli.command {
        Command::Devices => list_devices(),
        Command::Probe {
            connection,
            wait,
            voice_prompt,
        } => {
            connection.apply(&mut config);
            if voice_prompt.is_some() {
                config.persona.voice_prompt = voice_prompt;
            }
            run_probe(config, Duration::from_secs(wait)).await
        }
        Command::Chat {
            connection,
            text_prompt,
            voice_prompt,
            seed,
            input_device,
            output_device,
            no_audio,
            max_retries,
        } => {
            connection.apply(&mut config);
            if text_prompt.is_some() {
                config.persona.text_prompt = text_prompt;
            }
            if voice_prompt.is_some() {
                config.persona.voice_prompt = voice_prompt;
            }
            if seed.is_some() {
                config.persona.seed = seed;
            }
            if input_device.is_some() {
                config.input_device = input_device;
            }
            if output_device.is_some() {
                config.output_device = output_device;
            }
            if max_retries.is_some() {
                config.retry.max_attempts = max_retries;
            }
            run_chat(config, no_audio).await
        }
    }
}

fn list_devices() -> anyhow::Result<()> {
    let (inputs, outputs) = audio::list_devices()?;
    println!("🎤 Input devices:");
    for device in inputs {
        let marker = if device.is_default { " (default)" } else { "" };
        println!("   {}{}", device.name, marker);
    }
    println!("🔊 Output devices:");
    for device in outputs {
        let marker = if device.is_default { " (default)" } else { "" };
        println!("   {}{}", device.name, marker);
    }
    Ok(())
}

async fn run_probe(config: ClientConfig, wait: Duration) -> anyhow::Result<()> {
    let endpoint = Endpoint::from_config(&config)?;
    log::info!("Probing {}", endpoint);

    match session::probe(&endpoint, &config, wait).await? {
        ProbeOutcome::Ready { status } => {
            println!("✅ Service ready (handshake status: {:?})", status);
            Ok(())
        }
        ProbeOutcome::Unexpected(detail) => bail!("service answered without a handshake: {}", detail),
        ProbeOutcome::Closed => bail!("service closed the connection before its handshake"),
        ProbeOutcome::TimedOut => bail!("no handshake within {}s", wait.as_secs()),
    }
}

async fn run_chat(config: ClientConfig, no_audio: bool) -> anyhow::Result<()> {
    let endpoint = Endpoint::from_config(&config)?;

    let backend: Arc<dyn AudioBackend> = if no_audio {
        log::info!("Running without audio devices");
        Arc::new(MockAudioBackend::new())
    } else {
        Arc::new(CpalBackend {
            input_device: config.input_device.clone(),
            output_device: config.output_device.clone(),
            playback_buffer_ms: config.playback_buffer_ms,
        })
    };

    let client = DuplexClient::new(config, backend);
    let (handle, mut events) = client.start(endpoint);

    println!("🎧 Connecting... press Ctrl+C to exit");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::Ready) => println!("\n✅ Connected. Start talking!"),
                Some(SessionEvent::Text(fragment)) => {
                    print!("{}", fragment);
                    let _ = std::io::stdout().flush();
                }
                Some(SessionEvent::StateChanged(SessionState::ClosedByPeer)) => {
                    println!("\n⚠️ Connection lost");
                }
                Some(SessionEvent::Reconnecting { attempt, delay }) => {
                    println!("⏳ Reconnecting in {}s (attempt {})", delay.as_secs(), attempt);
                }
                Some(SessionEvent::StateChanged(state)) => log::debug!("State: {}", state),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                handle.stop().await;
                println!("\n👋 Goodbye!");
                return Ok(());
            }
        }
    }

    match handle.wait().await {
        Some(Err(e)) => Err(e.into()),
        _ => Ok(()),
    }
}
