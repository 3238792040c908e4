//! Command-line tutoring session
//!
//! Type `m` + Enter to toggle mute, `q` + Enter (or EOF, or Ctrl+C) to end the
//! session and print the transcript.

use anyhow::Context;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tutorlive::audio::PulseBackend;
use tutorlive::{LiveConfig, SessionConfig, SessionController, SessionStatus};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Starting tutorlive");

    let live = LiveConfig::from_env().context("loading configuration")?;
    let session = SessionConfig::from_env();
    let backend = PulseBackend::new("tutorlive")
        .with_devices(live.input_device.clone(), live.output_device.clone());

    let mut controller = SessionController::new(Arc::new(backend), live);
    if let Err(e) = controller.start(session).await {
        eprintln!("{}", e.user_message());
        return Err(e).context("starting session");
    }

    let mut status = controller.status();
    let mut speaking = controller.speaking();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("Connected. Start talking. Commands: m = mute/unmute, q = end session");

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match line.trim() {
                    "m" => {
                        controller.toggle_mute();
                        println!("{}", if controller.is_muted() { "[muted]" } else { "[live]" });
                    }
                    "q" => break,
                    "" => {}
                    other => println!("Unknown command: {}", other),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    break;
                }
            },
            changed = speaking.changed() => {
                if changed.is_err() {
                    break;
                }
                let now = *speaking.borrow_and_update();
                println!("{}", if now { "[tutor speaking]" } else { "[tutor listening]" });
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                if let SessionStatus::Failed(message) = current {
                    eprintln!("{}", message);
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, ending session");
                break;
            }
        }
    }

    let transcript = controller.end().await;
    println!("\n--- Transcript ---");
    if transcript.is_empty() {
        println!("(nothing was said)");
    } else {
        println!("{}", transcript);
    }
    Ok(())
}
