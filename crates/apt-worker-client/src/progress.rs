//! Progress stream reader.
//!
//! The worker writes newline-terminated text records to the status pipe:
//!
//! ```text
//! pmstatus:<token>:<percentage>[:<label>]
//! ```
//!
//! Records can arrive split across reads at any byte; the accumulator keeps
//! the unterminated tail until its newline shows up.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::host::ProgressSink;

pub const STATUS_PREFIX: &str = "pmstatus:";
pub const DEFAULT_LABEL: &str = "Working";

const READ_CHUNK: usize = 256;

/// One parsed progress record. `percent` is out of 100.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub percent: i32,
    pub label: String,
}

/// Parse one line (without its newline). Lines without the prefix or the
/// percentage field are not progress records.
pub fn parse_status_line(line: &str) -> Option<ProgressUpdate> {
    let rest = line.strip_prefix(STATUS_PREFIX)?;
    let mut fields = rest.splitn(3, ':');
    let _token = fields.next()?;
    let percentage = fields.next()?;
    let label = fields.next().unwrap_or(DEFAULT_LABEL);

    Some(ProgressUpdate {
        percent: leading_float(percentage) as i32,
        label: label.to_string(),
    })
}

/// Lenient float parse: longest numeric prefix (sign, digits, fraction,
/// exponent), `0.0` if there is none. The worker occasionally emits
/// trailing junk after the number.
fn leading_float(s: &str) -> f64 {
    let s = s.trim_start();
    let bytes = s.as_bytes();
    let digits_from = |start: usize| {
        bytes[start.min(bytes.len())..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count()
    };

    let mut end = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));
    let int_digits = digits_from(end);
    end += int_digits;
    let mut frac_digits = 0;
    if bytes.get(end) == Some(&b'.') {
        frac_digits = digits_from(end + 1);
        end += 1 + frac_digits;
    }
    if int_digits + frac_digits == 0 {
        return 0.0;
    }

    // An exponent only counts when at least one digit follows it.
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp = end + 1;
        if matches!(bytes.get(exp), Some(b'+' | b'-')) {
            exp += 1;
        }
        let exp_digits = digits_from(exp);
        if exp_digits > 0 {
            end = exp + exp_digits;
        }
    }
    s[..end].parse().unwrap_or(0.0)
}

/// Reassembles newline-delimited records from arbitrary chunks.
#[derive(Debug, Default)]
pub struct ProgressAccumulator {
    pending: BytesMut,
}

impl ProgressAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return the records it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ProgressUpdate> {
        self.pending.extend_from_slice(chunk);

        let mut updates = Vec::new();
        while let Some(newline) = self.pending.iter().position(|&b| b == b'\n') {
            let line = self.pending.split_to(newline);
            self.pending.advance(1);
            if let Some(update) = parse_status_line(&String::from_utf8_lossy(&line)) {
                updates.push(update);
            }
        }
        updates
    }

    /// Bytes of the unterminated tail.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

/// Forward progress records to `sink` until the status pipe closes.
///
/// End-of-stream or a read error stops the reader; neither is a worker
/// failure on its own (the data channel decides that).
pub async fn run_progress_reader<R>(mut status: R, sink: Arc<dyn ProgressSink>)
where
    R: AsyncRead + Unpin,
{
    let mut accumulator = ProgressAccumulator::new();
    let mut buf = [0u8; READ_CHUNK];

    loop {
        match status.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!(buffered = accumulator.buffered(), "Status pipe closed");
                break;
            }
            Ok(n) => {
                for update in accumulator.push(&buf[..n]) {
                    tracing::trace!(percent = update.percent, label = %update.label, "Worker progress");
                    sink.set_progress(&update);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Status pipe read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingProgress;
    use tokio::io::AsyncWriteExt;

    fn update(percent: i32, label: &str) -> ProgressUpdate {
        ProgressUpdate {
            percent,
            label: label.to_string(),
        }
    }

    #[test]
    fn parses_full_record() {
        assert_eq!(
            parse_status_line("pmstatus:libc6:42.7:Installing"),
            Some(update(42, "Installing"))
        );
    }

    #[test]
    fn missing_label_uses_default() {
        assert_eq!(
            parse_status_line("pmstatus:libc6:10"),
            Some(update(10, DEFAULT_LABEL))
        );
    }

    #[test]
    fn label_keeps_embedded_colons() {
        assert_eq!(
            parse_status_line("pmstatus:x:5:Unpacking foo:amd64"),
            Some(update(5, "Unpacking foo:amd64"))
        );
    }

    #[test]
    fn non_numeric_percentage_is_zero() {
        assert_eq!(parse_status_line("pmstatus:x:abc:L"), Some(update(0, "L")));
        assert_eq!(parse_status_line("pmstatus:x:99%:L"), Some(update(99, "L")));
    }

    #[test]
    fn percentage_accepts_an_exponent() {
        assert_eq!(parse_status_line("pmstatus:x:1e2:L"), Some(update(100, "L")));
        assert_eq!(parse_status_line("pmstatus:x:2.5E1%:L"), Some(update(25, "L")));
        assert_eq!(parse_status_line("pmstatus:x:3e:L"), Some(update(3, "L")));
        assert_eq!(parse_status_line("pmstatus:x:7e+:L"), Some(update(7, "L")));
        assert_eq!(parse_status_line("pmstatus:x:.5e2:L"), Some(update(50, "L")));
        assert_eq!(parse_status_line("pmstatus:x:-.e1:L"), Some(update(0, "L")));
    }

    #[test]
    fn other_lines_are_ignored() {
        assert_eq!(parse_status_line("pmerror:x:10:boom"), None);
        assert_eq!(parse_status_line("pmstatus:no-percentage"), None);
        assert_eq!(parse_status_line(""), None);
    }

    #[test]
    fn records_split_across_chunks_are_reassembled() {
        let mut acc = ProgressAccumulator::new();
        assert!(acc.push(b"pmstat").is_empty());
        assert!(acc.push(b"us:x:42:Inst").is_empty());
        assert_eq!(acc.push(b"alling\n"), vec![update(42, "Installing")]);
        assert_eq!(acc.buffered(), 0);
    }

    #[test]
    fn chunking_does_not_change_the_result() {
        let input = b"pmstatus:a:1:One\nnoise\npmstatus:b:50\npmstatus:c:100:Done\n";

        let mut whole = ProgressAccumulator::new();
        let expected = whole.push(input);
        assert_eq!(expected.len(), 3);

        for chunk_size in 1..input.len() {
            let mut acc = ProgressAccumulator::new();
            let got: Vec<_> = input
                .chunks(chunk_size)
                .flat_map(|chunk| acc.push(chunk))
                .collect();
            assert_eq!(got, expected, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn trailing_partial_line_stays_buffered() {
        let mut acc = ProgressAccumulator::new();
        assert_eq!(acc.push(b"pmstatus:a:1:One\npmsta"), vec![update(1, "One")]);
        assert_eq!(acc.buffered(), 5);
    }

    #[tokio::test]
    async fn reader_forwards_updates_until_close() {
        let (mut worker, client) = tokio::io::duplex(64);
        let sink = Arc::new(RecordingProgress::default());
        let reader = tokio::spawn(run_progress_reader(client, sink.clone()));

        worker.write_all(b"pmstatus:x:42:Inst").await.unwrap();
        worker.write_all(b"alling\npmstatus:x:7").await.unwrap();
        worker.write_all(b"0\n").await.unwrap();
        drop(worker);

        reader.await.unwrap();
        assert_eq!(
            sink.updates(),
            vec![update(42, "Installing"), update(70, DEFAULT_LABEL)]
        );
    }
}
