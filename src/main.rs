use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use fallwatch::dispatch::backends::{LogMailer, LogSoundPlayer, NoFrames};
use fallwatch::dispatch::{Backends, DirSnapshotStore};
use fallwatch::logging::{self, obj, v_bool, v_str, Domain};
use fallwatch::{Engine, EngineConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = EngineConfig::from_env();
    cfg.validate().context("invalid configuration")?;

    logging::info(
        Domain::System,
        "startup",
        obj(&[
            ("alert_timeout_secs", json!(cfg.alert_timeout.as_secs())),
            ("early_window_secs", json!(cfg.early_window.as_secs())),
            ("tick_ms", json!(cfg.tick.as_millis() as u64)),
            ("snapshot_dir", v_str(&cfg.snapshot_dir)),
            ("email_enabled", v_bool(cfg.email_recipient.is_some())),
        ]),
    );

    let backends = Backends {
        frames: Arc::new(NoFrames),
        snapshots: Arc::new(DirSnapshotStore::new(&cfg.snapshot_dir)),
        mailer: Arc::new(LogMailer),
        sound: Arc::new(LogSoundPlayer::default()),
    };
    let engine = Engine::new(cfg, backends)?;

    // observers: one JSON line per broadcast on stdout
    let mut rx = engine.subscribe();
    let printer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    let line = match serde_json::to_string(&msg) {
                        Ok(line) => line,
                        Err(err) => {
                            logging::warn(Domain::Broadcast, "encode_failed", obj(&[("error", v_str(&err.to_string()))]));
                            continue;
                        }
                    };
                    if stdout.write_all(format!("{}\n", line).as_bytes()).await.is_err() {
                        break;
                    }
                    let _ = stdout.flush().await;
                }
                Err(RecvError::Lagged(n)) => {
                    logging::warn(Domain::Broadcast, "observer_lagged", obj(&[("skipped", json!(n))]));
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // decode failures are already logged by the engine
        let _ = engine.ingest_envelope(line);
    }

    logging::info(Domain::System, "shutdown", obj(&[("msg", v_str("stdin closed"))]));
    // the channel closes once the timer and in-flight notifications release the engine
    engine.shutdown();
    drop(engine);
    if tokio::time::timeout(Duration::from_secs(5), printer).await.is_err() {
        logging::warn(Domain::Broadcast, "observer_flush_timeout", obj(&[]));
    }
    Ok(())
}
