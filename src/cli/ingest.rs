//! CLI `ingest` command: feed a payload through the recorder without a broker.

use anyhow::Result;
use std::path::Path;

use trackstore::config::RecorderConfig;
use trackstore::ingest::{InboundMessage, IngestOutcome, Recorder};

/// Ingest the payload in `file` (or stdin) as if it were published on
/// `topic`. With `lines`, every non-blank line is a separate message.
pub fn ingest(config: &RecorderConfig, topic: &str, file: Option<&Path>, lines: bool) -> Result<()> {
    let input = super::read_input(file)?;
    let recorder = Recorder::open(config)?;

    let payloads: Vec<&[u8]> = if lines {
        input
            .split(|b| *b == b'\n')
            .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
            .filter(|l| !l.iter().all(u8::is_ascii_whitespace))
            .collect()
    } else {
        vec![trim_trailing_newline(&input)]
    };

    let mut failed = 0;
    for payload in &payloads {
        let outcome = recorder.handle(&InboundMessage::new(topic, payload.to_vec()));
        if matches!(outcome, IngestOutcome::Failed(_)) {
            failed += 1;
        }
        println!("{outcome:?}");
    }

    anyhow::ensure!(failed == 0, "{failed} of {} messages failed", payloads.len());
    Ok(())
}

fn trim_trailing_newline(input: &[u8]) -> &[u8] {
    let input = input.strip_suffix(b"\n").unwrap_or(input);
    input.strip_suffix(b"\r").unwrap_or(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_newline_is_dropped() {
        assert_eq!(trim_trailing_newline(b"{}\r\n"), b"{}");
        assert_eq!(trim_trailing_newline(b"{}"), b"{}");
    }
}
