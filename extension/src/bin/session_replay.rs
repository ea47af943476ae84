// Replays a recorded stream of background events against an in-memory host
//
// Input: one JSON SessionEvent per line, optionally with "at_ms" to move the clock.
// Output: every host call the session made, one JSON object per line.

#[cfg(not(target_arch = "wasm32"))]
mod replay {
    use std::io::{self, BufRead, BufReader, Write};
    use std::rc::Rc;

    use anyhow::{Context, Result};
    use serde::Deserialize;
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    use yakkl_extension::session::Flow;
    use yakkl_extension::{MemoryHost, Session, SessionConfig, SessionEvent};

    #[derive(Deserialize)]
    struct ReplayLine {
        #[serde(default)]
        at_ms: Option<u64>,
        #[serde(flatten)]
        event: SessionEvent,
    }

    #[tokio::main(flavor = "current_thread")]
    pub async fn main() -> Result<()> {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "yakkl_extension=info,session_replay=info".into()),
            )
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .init();

        let config_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "yakkl.toml".to_string());
        tracing::info!("Loading session configuration from: {}", config_path);
        let config = SessionConfig::load_or_default(&config_path)?;

        let input: Box<dyn BufRead> = match std::env::args().nth(1) {
            Some(path) if path != "-" => Box::new(BufReader::new(
                std::fs::File::open(&path).context(format!("Failed to open {}", path))?,
            )),
            _ => Box::new(BufReader::new(io::stdin())),
        };

        let host = Rc::new(MemoryHost::new());
        let mut session = Session::new(host.clone(), config);
        if let Err(e) = session.init().await {
            tracing::warn!("Session init incomplete: {}", e);
        }

        let stdout = io::stdout();
        let mut out = stdout.lock();
        for call in host.take_calls() {
            writeln!(out, "{}", serde_json::to_string(&call)?)?;
        }
        let mut replayed = 0usize;

        for (index, line) in input.lines().enumerate() {
            let line = line.context("Failed to read event stream")?;
            if line.trim().is_empty() {
                continue;
            }
            let ReplayLine { at_ms, event } = serde_json::from_str(&line)
                .context(format!("Line {}: not a session event", index + 1))?;
            if let Some(at_ms) = at_ms {
                host.set_now(at_ms);
            }

            let flow = match session.handle(event).await {
                Ok(flow) => flow,
                Err(e) => {
                    tracing::warn!("Line {}: {}", index + 1, e);
                    Flow::Continue
                }
            };
            replayed += 1;

            for call in host.take_calls() {
                writeln!(out, "{}", serde_json::to_string(&call)?)?;
            }
            if flow == Flow::Stop {
                break;
            }
        }

        tracing::info!("✅ Replayed {} event(s)", replayed);
        Ok(())
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn main() -> anyhow::Result<()> {
    replay::main()
}

// Dummy main for the wasm32 build of this target
#[cfg(target_arch = "wasm32")]
fn main() {}
