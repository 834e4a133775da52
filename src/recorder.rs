// ===============================
// src/recorder.rs
// ===============================
//
// Lightweight JSONL event recorder:
// - Appends every Event to a .jsonl file.
// - BufWriter to keep syscalls down, periodic flush every 1s.
// - Creates the parent directory if missing; reopens the file on write
//   failure and carries on.
//
// Enabled by setting RECORD_FILE=/path/to/events.jsonl (see main.rs).

use std::path::Path;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info};

use crate::domain::Event;

async fn open_writer(path: &str) -> Option<BufWriter<tokio::fs::File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = fs::create_dir_all(parent).await {
                error!(?e, %path, "recorder: create_dir_all failed");
            }
        }
    }
    match OpenOptions::new().create(true).append(true).open(path).await {
        Ok(file) => Some(BufWriter::new(file)),
        Err(e) => {
            error!(?e, %path, "recorder: open failed");
            None
        }
    }
}

pub async fn run(mut rx: mpsc::Receiver<Event>, path: String) {
    info!(%path, "recorder: started");
    let Some(mut writer) = open_writer(&path).await else {
        return;
    };

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                match maybe_ev {
                    Some(ev) => {
                        let mut line = match serde_json::to_string(&ev) {
                            Ok(s) => s,
                            Err(e) => {
                                error!(?e, "recorder: serialize error, skip event");
                                continue;
                            }
                        };
                        line.push('\n');

                        if let Err(e) = writer.write_all(line.as_bytes()).await {
                            error!(?e, "recorder: write failed, attempting reopen");
                            match open_writer(&path).await {
                                Some(w) => {
                                    writer = w;
                                    if let Err(e2) = writer.write_all(line.as_bytes()).await {
                                        error!(?e2, "recorder: write failed again, drop event");
                                    }
                                }
                                None => continue,
                            }
                        }
                    }
                    None => {
                        // Channel closed: flush and exit.
                        let _ = writer.flush().await;
                        info!("recorder: channel closed, stopped");
                        break;
                    }
                }
            }

            _ = tick.tick() => {
                let _ = writer.flush().await;
            }
        }
    }
}
