use std::error::Error;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info};

use crate::commands::track_progress;
use crate::config::Options;
use crate::session::{Consent, Session};
use crate::utils::FileDescriptor;

/// Asks on the terminal before accepting an offer.
struct StdinConsent;

impl Consent for StdinConsent {
    fn confirm(&self, files: &[FileDescriptor]) -> bool {
        let total: u64 = files.iter().map(|f| f.size).sum();
        println!("\nIncoming: {} file(s), {} KB", files.len(), total / 1024);
        for file in files {
            println!("  {} ({} bytes)", file.path, file.size);
        }
        print!("Accept? (y/N) ");
        if io::stdout().flush().is_err() {
            return false;
        }

        let mut answer = String::new();
        match io::stdin().lock().read_line(&mut answer) {
            Ok(_) => matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"),
            Err(_) => false,
        }
    }
}

fn prompt_phrase() -> io::Result<String> {
    print!("Enter the code phrase: ");
    io::stdout().flush()?;
    let mut phrase = String::new();
    io::stdin().lock().read_line(&mut phrase)?;
    Ok(phrase.trim().to_string())
}

pub async fn run(
    mut options: Options,
    phrase: Option<String>,
    out: PathBuf,
    yes: bool,
) -> Result<(), Box<dyn Error>> {
    debug!("Starting receive command");

    let phrase = match phrase {
        Some(phrase) => phrase,
        None => tokio::task::spawn_blocking(prompt_phrase).await??,
    };

    options.shared_secret = phrase;
    options.is_sender = false;
    options.no_prompt = yes;
    let session = Session::new(options)?.with_consent(Arc::new(StdinConsent));
    let progress = track_progress(session.subscribe());

    let result = session.receive(&out).await;
    let _ = progress.await;

    let summary = result?;
    for path in &summary.files {
        println!("Saved {}", path.display());
    }
    info!(
        "Received {} bytes ({} chunk(s) resumed from disk)",
        summary.bytes_transferred, summary.chunks_skipped
    );
    Ok(())
}
