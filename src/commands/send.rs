use std::error::Error;
use std::path::PathBuf;

use log::{debug, info};

use crate::code_phrase::generate_code_phrase;
use crate::commands::{copy_to_clipboard, track_progress};
use crate::config::{Options, TransferOptions};
use crate::session::Session;

/// Function handler to kick off the sender:
///     - Check the paths exist
///     - Use the given code phrase, or generate one and put it on the clipboard
///     - Run the session (discovery/relay, PAKE, offer, chunk stream)
///     - Render progress from the session's observer while it runs
pub async fn run(
    mut options: Options,
    paths: Vec<PathBuf>,
    code: Option<String>,
    keep_path: bool,
) -> Result<(), Box<dyn Error>> {
    for path in &paths {
        if !path.exists() {
            return Err(format!("Path does not exist: {}", path.display()).into());
        }
    }

    let phrase = code.unwrap_or_else(generate_code_phrase);
    let copied = copy_to_clipboard(&phrase);
    println!(
        "Code phrase{}: \x1b[4m\x1b[1m{}\x1b[0m",
        if copied { " (copied to clipboard)" } else { "" },
        phrase
    );
    println!("On the other computer run: ferry receive {}", phrase);

    options.shared_secret = phrase;
    options.is_sender = true;
    let session = Session::new(options)?;
    let progress = track_progress(session.subscribe());

    debug!("Sending {} path(s)", paths.len());
    let result = session.send(TransferOptions { paths, keep_path }).await;
    let _ = progress.await;

    let summary = result?;
    info!(
        "Sent {} file(s), {} chunk(s) on the wire, {} already at the receiver",
        summary.files.len(),
        summary.chunks_sent,
        summary.chunks_skipped
    );
    Ok(())
}
