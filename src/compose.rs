/// Diagnostic message composition under a byte budget.
///
/// Pushover caps message bodies at 1024 characters, so the composer keeps the
/// failure description plus the most recent output of both streams, trimming
/// stdout and stderr from the front in turns until the message fits.
use crate::sink::{StreamKind, TailSource, TailWindow};

/// Default budget: strictly below this many UTF-8 bytes, leaving margin under 1024.
pub const DEFAULT_BUDGET_BYTES: usize = 1020;

/// Default number of trailing bytes read from each stream.
pub const DEFAULT_SUFFIX_BYTES: u64 = 1024;

/// Each trimming turn drops 1/50th of the stream's tail window.
const TRIM_DIVISOR: usize = 50;

/// Build the notification body from the failure description and both sinks.
///
/// Never fails: a sink that cannot be read degrades to the failure description
/// followed by the error.
pub fn compose(
    failure: Option<&str>,
    stdout: &mut dyn TailSource,
    stderr: &mut dyn TailSource,
    suffix_bytes: u64,
    budget_bytes: usize,
) -> String {
    match read_windows(stdout, stderr, suffix_bytes) {
        Ok((out, err)) => fit_to_budget(failure, &out, &err, budget_bytes),
        Err(e) => {
            tracing::warn!(error = %e, "failed to read captured output");
            formatting_failure(failure, &e)
        }
    }
}

fn formatting_failure(failure: Option<&str>, err: &std::io::Error) -> String {
    format!(
        "{}\n(failed formatting error: {})",
        failure.unwrap_or_default(),
        err
    )
}

fn read_windows(
    stdout: &mut dyn TailSource,
    stderr: &mut dyn TailSource,
    suffix_bytes: u64,
) -> std::io::Result<(TailWindow, TailWindow)> {
    Ok((
        stdout.tail_window(suffix_bytes)?,
        stderr.tail_window(suffix_bytes)?,
    ))
}

/// One stream's tail window and how many characters have been cut from its front.
struct Trimmed<'a> {
    kind: StreamKind,
    window: &'a TailWindow,
    char_len: usize,
    step: usize,
    dropped: usize,
}

impl<'a> Trimmed<'a> {
    fn new(kind: StreamKind, window: &'a TailWindow) -> Self {
        let char_len = window.text.chars().count();
        Self {
            kind,
            window,
            char_len,
            step: (char_len / TRIM_DIVISOR).max(1),
            dropped: 0,
        }
    }

    fn remaining(&self) -> &str {
        match self.window.text.char_indices().nth(self.dropped) {
            Some((idx, _)) => &self.window.text[idx..],
            None => "",
        }
    }

    fn exhausted(&self) -> bool {
        self.dropped >= self.char_len
    }

    fn trim(&mut self) {
        self.dropped = (self.dropped + self.step).min(self.char_len);
    }

    fn append_block(&self, message: &mut String) {
        // A stream that produced nothing gets no block at all
        if self.window.text.is_empty() {
            return;
        }
        message.push_str(&format!(
            "{} ({}b):\n{}\n",
            self.kind.label(),
            self.window.total_size,
            self.remaining()
        ));
    }
}

fn assemble(failure: Option<&str>, streams: &[Trimmed<'_>; 2]) -> String {
    let mut message = format!("{}\n", failure.unwrap_or_default());
    for stream in streams {
        stream.append_block(&mut message);
    }
    message.trim().to_string()
}

/// Trim both tail windows round-robin, stdout first, until the assembled
/// message is strictly shorter than `budget_bytes` UTF-8 bytes.
///
/// Once both windows are trimmed away and the message is still too long (a
/// huge failure description), the message is cut at a character boundary.
pub fn fit_to_budget(
    failure: Option<&str>,
    stdout: &TailWindow,
    stderr: &TailWindow,
    budget_bytes: usize,
) -> String {
    let mut streams = [
        Trimmed::new(StreamKind::Stdout, stdout),
        Trimmed::new(StreamKind::Stderr, stderr),
    ];

    let mut turn = 0usize;
    loop {
        let message = assemble(failure, &streams);
        if message.len() < budget_bytes {
            return message;
        }
        if streams.iter().all(Trimmed::exhausted) {
            tracing::debug!(
                bytes = message.len(),
                budget_bytes,
                "output exhausted, truncating message"
            );
            return truncate_below(message, budget_bytes);
        }
        streams[turn % 2].trim();
        turn += 1;
    }
}

/// Cut `message` to fewer than `budget_bytes` bytes without splitting a character.
fn truncate_below(mut message: String, budget_bytes: usize) -> String {
    if budget_bytes == 0 {
        return String::new();
    }
    let mut end = budget_bytes - 1;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message.truncate(end);
    message.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::StreamSink;
    use std::io::Write;

    /// A capture whose backing storage can no longer be read.
    struct Unreadable;

    impl TailSource for Unreadable {
        fn tail_window(&mut self, _suffix_size: u64) -> std::io::Result<TailWindow> {
            Err(std::io::Error::other("capture file vanished"))
        }
    }

    fn window(text: &str) -> TailWindow {
        TailWindow::new(text, text.len() as u64)
    }

    #[test]
    fn test_small_output_is_kept_whole() {
        let msg = fit_to_budget(
            Some("Exited with code 1"),
            &window("building...\n"),
            &window("error: boom\n"),
            DEFAULT_BUDGET_BYTES,
        );
        assert_eq!(
            msg,
            "Exited with code 1\nStdout (12b):\nbuilding...\n\nStderr (12b):\nerror: boom"
        );
    }

    #[test]
    fn test_empty_streams_are_omitted() {
        let msg = fit_to_budget(
            Some("Exited with code 0"),
            &TailWindow::default(),
            &TailWindow::default(),
            DEFAULT_BUDGET_BYTES,
        );
        assert_eq!(msg, "Exited with code 0");
        assert!(!msg.contains("Stdout"));
        assert!(!msg.contains("Stderr"));
    }

    #[test]
    fn test_only_stderr_block_when_stdout_empty() {
        let msg = fit_to_budget(
            Some("Exited with code 2"),
            &TailWindow::default(),
            &window("oops"),
            DEFAULT_BUDGET_BYTES,
        );
        assert_eq!(msg, "Exited with code 2\nStderr (4b):\noops");
    }

    #[test]
    fn test_missing_failure_description_leaves_no_leading_blank_line() {
        let msg = fit_to_budget(None, &window("hi"), &TailWindow::default(), 100);
        assert_eq!(msg, "Stdout (2b):\nhi");
    }

    #[test]
    fn test_oversized_stdout_keeps_true_size_and_tail() {
        let full = "x\n".repeat(10_000);
        let tail = &full[full.len() - DEFAULT_SUFFIX_BYTES as usize..];
        let stdout = TailWindow::new(tail, full.len() as u64);

        let msg = fit_to_budget(
            Some("Exited with code 1"),
            &stdout,
            &TailWindow::default(),
            DEFAULT_BUDGET_BYTES,
        );

        assert!(msg.len() < DEFAULT_BUDGET_BYTES);
        assert!(msg.starts_with("Exited with code 1\nStdout (20000b):\n"));
        assert!(!msg.contains("Stderr"));
        let body = msg.split_once("(20000b):\n").unwrap().1;
        assert!(body.len() < tail.len());
        assert!(tail.trim_end().ends_with(body));
    }

    #[test]
    fn test_trimming_alternates_between_streams() {
        let out = "q".repeat(1024);
        let err = "z".repeat(1024);
        let msg = fit_to_budget(
            Some("Exited with code 1"),
            &window(&out),
            &window(&err),
            DEFAULT_BUDGET_BYTES,
        );

        assert!(msg.len() < DEFAULT_BUDGET_BYTES);
        let kept_out = msg.matches('q').count();
        let kept_err = msg.matches('z').count();
        // 20 characters per turn, stdout trimmed first: 28 turns vs 27 turns
        assert_eq!(kept_out, 1024 - 28 * 20);
        assert_eq!(kept_err, 1024 - 27 * 20);
    }

    #[test]
    fn test_composition_is_deterministic() {
        let out = "line of stdout\n".repeat(100);
        let err = "line of stderr\n".repeat(100);
        let first = fit_to_budget(Some("x"), &window(&out), &window(&err), 500);
        let second = fit_to_budget(Some("x"), &window(&out), &window(&err), 500);
        assert_eq!(first, second);
    }

    #[test]
    fn test_budget_respected_with_multibyte_text() {
        let out = "日本語のログ\n".repeat(60);
        let err = "ошибка\n".repeat(80);
        let msg = fit_to_budget(
            Some("Exited with code 3"),
            &window(&out),
            &window(&err),
            300,
        );
        assert!(msg.len() < 300);
        assert!(msg.contains("Stdout ("));
        assert!(msg.contains("Stderr ("));
    }

    #[test]
    fn test_short_streams_still_shrink() {
        // Fewer than 50 characters would give a zero step without the floor of 1
        let out = "a".repeat(30);
        let err = "b".repeat(30);
        let msg = fit_to_budget(Some("head"), &window(&out), &window(&err), 60);
        assert!(msg.len() < 60);
        assert!(msg.starts_with("head\nStdout (30b):\n"));
    }

    #[test]
    fn test_overlong_failure_description_is_truncated() {
        let failure = "Caught exception ".to_string() + &"z".repeat(3000);
        let msg = fit_to_budget(
            Some(&failure),
            &TailWindow::default(),
            &TailWindow::default(),
            DEFAULT_BUDGET_BYTES,
        );
        assert_eq!(msg.len(), DEFAULT_BUDGET_BYTES - 1);
        assert!(failure.starts_with(&msg));
    }

    #[test]
    fn test_overlong_failure_with_output_still_terminates() {
        let failure = "é".repeat(2000);
        let msg = fit_to_budget(
            Some(&failure),
            &window(&"o".repeat(500)),
            &window(&"e".repeat(10)),
            DEFAULT_BUDGET_BYTES,
        );
        assert!(msg.len() < DEFAULT_BUDGET_BYTES);
        assert!(msg.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_zero_budget_yields_empty_message() {
        let msg = fit_to_budget(Some("anything"), &window("out"), &window("err"), 0);
        assert_eq!(msg, "");
    }

    #[test]
    fn test_truncate_below_respects_char_boundaries() {
        assert_eq!(truncate_below("aé".to_string(), 3), "a");
        assert_eq!(truncate_below("abc".to_string(), 3), "ab");
    }

    #[test]
    fn test_compose_reads_from_sinks() {
        let mut out = StreamSink::create(StreamKind::Stdout).unwrap();
        let mut err = StreamSink::create(StreamKind::Stderr).unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(out.path())
            .unwrap()
            .write_all(b"hello\n")
            .unwrap();

        let msg = compose(
            Some("Exited with code 1"),
            &mut out,
            &mut err,
            DEFAULT_SUFFIX_BYTES,
            DEFAULT_BUDGET_BYTES,
        );
        assert_eq!(msg, "Exited with code 1\nStdout (6b):\nhello");
    }

    #[test]
    fn test_unreadable_stdout_falls_back_to_error_message() {
        let mut err = StreamSink::create(StreamKind::Stderr).unwrap();
        let msg = compose(
            Some("Exited with code 1"),
            &mut Unreadable,
            &mut err,
            DEFAULT_SUFFIX_BYTES,
            DEFAULT_BUDGET_BYTES,
        );
        assert_eq!(
            msg,
            "Exited with code 1\n(failed formatting error: capture file vanished)"
        );
    }

    #[test]
    fn test_unreadable_stderr_falls_back_to_error_message() {
        let mut out = StreamSink::create(StreamKind::Stdout).unwrap();
        let msg = compose(
            Some("Reached timeout 5 and was killed"),
            &mut out,
            &mut Unreadable,
            DEFAULT_SUFFIX_BYTES,
            DEFAULT_BUDGET_BYTES,
        );
        assert_eq!(
            msg,
            "Reached timeout 5 and was killed\n(failed formatting error: capture file vanished)"
        );
    }

    #[test]
    fn test_formatting_failure_without_description() {
        let err = std::io::Error::other("bad read");
        assert_eq!(formatting_failure(None, &err), "\n(failed formatting error: bad read)");
    }
}
