//! Consent prompt
//!
//! The VPN client only starts a tunnel after the user approves it. The
//! request text comes from the client; we show it and read a yes/no.

use async_trait::async_trait;
use std::io::{self, BufRead, Write};
use tv_vpn::{ConsentOutcome, ConsentRequest};

/// Presents a consent request to the user
#[async_trait]
pub trait ConsentPrompt: Send + Sync {
    async fn ask(&self, request: &ConsentRequest) -> io::Result<ConsentOutcome>;
}

/// Asks on the controlling terminal
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

#[async_trait]
impl ConsentPrompt for TerminalPrompt {
    async fn ask(&self, request: &ConsentRequest) -> io::Result<ConsentOutcome> {
        let prompt = request.prompt.clone();
        tokio::task::spawn_blocking(move || {
            let stdin = io::stdin();
            let stderr = io::stderr();
            read_answer(&prompt, &mut stdin.lock(), &mut stderr.lock())
        })
        .await
        .map_err(io::Error::other)?
    }
}

/// Write `prompt` to `output` and read one answer line from `input`.
///
/// Only `y`/`yes` (any case) grants. End of input denies.
pub fn read_answer<R: BufRead, W: Write>(
    prompt: &str,
    input: &mut R,
    output: &mut W,
) -> io::Result<ConsentOutcome> {
    write!(output, "{}\nAllow? [y/N] ", prompt)?;
    output.flush()?;

    let mut line = String::new();
    input.read_line(&mut line)?;

    Ok(match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => ConsentOutcome::Granted,
        _ => ConsentOutcome::Denied,
    })
}
