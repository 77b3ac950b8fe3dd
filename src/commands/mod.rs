//! # Commands Module
//!
//! This module contains the three command handlers of the `ferry` binary:
//!
//! ## `send`
//! Offers files or folders to a receiver:
//! - Uses the given code phrase or generates one and copies it to the clipboard
//! - Looks for the receiver on the local network while waiting on the relay
//! - Streams encrypted chunks and shows progress until the receiver verified every file
//!
//! ## `receive`
//! Accepts files from a sender:
//! - Takes the code phrase from the command line or prompts for it
//! - Shows the offer and asks before writing anything (unless `--yes`)
//! - Resumes partial downloads left behind by an earlier attempt
//!
//! ## `relay`
//! Runs a relay server:
//! - Listens on every configured port
//! - Pairs a sender and a receiver presenting the same room fingerprint
//! - Pipes bytes between them without being able to read them

pub mod send;
pub mod receive;
pub mod relay;

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::progress::{Phase, ProgressState};

/// Render session progress on the terminal until the session ends.
pub(crate) fn track_progress(mut state: watch::Receiver<ProgressState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let bar = ProgressBar::new_spinner();
        bar.enable_steady_tick(Duration::from_millis(100));
        let mut sized = false;

        loop {
            let snapshot = state.borrow_and_update().clone();
            if snapshot.total_bytes > 0 && !sized {
                bar.set_style(
                    ProgressStyle::default_bar()
                        .template("[{elapsed_precise}] [{bar:40.black}] {pos}/{len} KB ({eta}) {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_bar()),
                );
                bar.set_length(snapshot.total_bytes / 1024);
                sized = true;
            }
            bar.set_position(snapshot.bytes_transferred / 1024);
            bar.set_message(match &snapshot.current_file {
                Some(file) if snapshot.phase == Phase::FileTransfer => file.clone(),
                _ => snapshot.phase.describe().to_string(),
            });

            match snapshot.phase {
                Phase::Done => {
                    bar.finish_with_message("Transfer complete!");
                    return;
                }
                Phase::Failed => {
                    bar.abandon_with_message(snapshot.failure.unwrap_or_else(|| "failed".into()));
                    return;
                }
                _ => {}
            }

            if state.changed().await.is_err() {
                // the session is gone; render whatever it last published
                let last = state.borrow().clone();
                if last.phase == Phase::Done {
                    bar.finish_with_message("Transfer complete!");
                } else {
                    bar.abandon();
                }
                return;
            }
        }
    })
}

pub(crate) fn copy_to_clipboard(text: &str) -> bool {
    // may fail in headless sessions
    match arboard::Clipboard::new() {
        Ok(mut clipboard) => clipboard.set_text(text.to_string()).is_ok(),
        Err(_) => false,
    }
}
