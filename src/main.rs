use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use parley::conversation::{Collaborators, ControllerSettings, ConversationController};
use parley::voice::{
    AudioCaptureStream, AudioOutput, CaptureEvent, ProcessAudioOutput, SpeechToText, Synthesizer,
    TextToSpeech, VadEvent, VoiceActivityDetector, rms_energy,
};
use parley::{
    Config, DisplaySink, LineTrigger, LogDisplay, OpenAiChat, SocketDisplay, StreamingRecognizer,
};

/// Parley - Spoken dialogue with voice activity detection and barge-in
#[derive(Parser)]
#[command(name = "parley", version, about)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, env = "PARLEY_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Disable voice activity detection (button only)
    #[arg(long)]
    no_vad: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the conversation loop (default)
    Run,
    /// Test microphone input and speech detection
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
    /// Print the resolved configuration
    Config,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info",
        1 => "info,parley=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if cli.no_vad {
        config.vad.enabled = false;
    }

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => converse(config).await,
        Command::TestMic { duration } => test_mic(&config, duration).await,
        Command::TestTts { text } => test_tts(&config, &text).await,
        Command::Config => {
            println!("{config:#?}");
            Ok(())
        }
    }
}

/// Wire the collaborators and run until Ctrl-C
async fn converse(config: Config) -> anyhow::Result<()> {
    let settings = ControllerSettings::from_config(&config);

    let transcriber = SpeechToText::new(
        &config.chat.base_url,
        config.api_keys.openai_key(),
        config.speech.stt_model.clone(),
    )?;
    let synthesizer = TextToSpeech::new(
        &config.chat.base_url,
        config.api_keys.openai_key(),
        &config.speech,
    )?;
    let chat = OpenAiChat::new(&config.chat, config.api_keys.openai_key())?;

    let display: Arc<dyn DisplaySink> = match &config.display.addr {
        Some(addr) => Arc::new(SocketDisplay::spawn(addr.clone())),
        None => Arc::new(LogDisplay),
    };

    let (capture, capture_rx) = AudioCaptureStream::new(config.capture.clone());
    let output = ProcessAudioOutput::new(config.playback.clone());
    let recognizer = StreamingRecognizer::new(
        config.recognizer,
        config.capture.sample_rate,
        config.capture.channels,
    );

    let controller = ConversationController::new(
        settings,
        Collaborators {
            recognizer: Arc::new(recognizer),
            transcriber: Arc::new(transcriber),
            synthesizer: Arc::new(synthesizer),
            chat: Arc::new(chat),
            output: Arc::new(output),
            display,
        },
        Box::new(capture),
        capture_rx,
    );

    tracing::info!(
        vad = config.vad.enabled,
        "parley ready - press Enter to talk, 'd' + Enter to dismiss a reply"
    );

    controller
        .run(LineTrigger::stdin(), async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await;

    Ok(())
}

/// Test microphone input
async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Recording through `{}` for {duration}s", config.capture.program);
    println!("Say a few words, then pause, to see where speech starts and ends\n");

    let (mut capture, mut events) = AudioCaptureStream::new(config.capture.clone());
    capture.start()?;
    let mut vad = VoiceActivityDetector::new(config.vad.clone());

    println!(
        "Sample rate: {} Hz, threshold: {}",
        config.capture.sample_rate, config.vad.energy_threshold
    );
    println!("---");

    let deadline = tokio::time::sleep(Duration::from_secs(duration));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = &mut deadline => break,
            event = events.recv() => match event {
                Some(CaptureEvent::Data(chunk)) => {
                    let energy = rms_energy(&chunk);
                    match vad.process(&chunk) {
                        Some(VadEvent::SpeechStart) => println!(">> speech start (RMS {energy:.0})"),
                        Some(VadEvent::SpeechEnd(segment)) => {
                            println!("<< speech end ({} bytes)", segment.len());
                        }
                        None => {
                            // Visual meter
                            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                            let meter_len = (energy / 200.0).min(50.0) as usize;
                            println!("RMS: {energy:7.0} | [{:<50}]", "#".repeat(meter_len));
                        }
                    }
                }
                Some(CaptureEvent::Error(e)) => anyhow::bail!("capture failed: {e}"),
                Some(CaptureEvent::Exited) | None => break,
            }
        }
    }

    capture.stop();

    println!("\n---");
    println!("No speech start while talking: lower [vad] energy_threshold.");
    println!("Speech start while silent: raise it above the quiet RMS shown.");
    println!("Meter flat at 0: check [capture] device (`arecord -l` lists inputs).");

    Ok(())
}

/// Test TTS output through the playback path
async fn test_tts(config: &Config, text: &str) -> anyhow::Result<()> {
    println!("Voice {:?}, model {:?}", config.speech.tts_voice, config.speech.tts_model);

    let tts = TextToSpeech::new(
        &config.chat.base_url,
        config.api_keys.openai_key(),
        &config.speech,
    )?;

    let audio = tts.synthesize(text).await?;
    println!("Synthesized {text:?} ({} ms)", audio.duration_ms);

    let output = ProcessAudioOutput::new(config.playback.clone());
    println!("Playing through `{}`", config.playback.program);
    output.play(&audio).await?;
    println!("Done. Silence here means the [playback] player or device is wrong.");

    Ok(())
}
