/// Outcome Evaluator - maps raw run results onto submission verdicts
///
/// **Core Responsibility:**
/// Turn what the container runtime reported (exit code, captured streams, or
/// a forced timeout) into the terminal status persisted for the client.
///
/// **Critical Properties:**
/// - Knows nothing about Docker
/// - Knows nothing about the queue or persisted state
/// - Pure function: (run result) → verdict
///
/// **Classification Rules:**
/// - exit 0 → COMPLETED
/// - exit 126/127 → ERROR (run command unusable inside the image; not the user's fault)
/// - any other exit → FAILED, stderr always populated
/// - wall-clock expiry → TIMEOUT, whatever stdout was produced
use yantra_common::types::SubmissionStatus;

/// Raw result of a container that exited on its own
#[derive(Debug, Clone, PartialEq)]
pub struct RunExit {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// Output gathered from a container that had to be killed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Captured {
    pub stdout: String,
    pub stderr: String,
}

/// Byte buffer that stops growing at `limit` and remembers how much it dropped
#[derive(Debug, Clone)]
pub struct CappedBuffer {
    bytes: Vec<u8>,
    limit: usize,
    dropped: usize,
}

impl CappedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            dropped: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.bytes.len());
        let taken = room.min(chunk.len());
        self.bytes.extend_from_slice(&chunk[..taken]);
        self.dropped += chunk.len() - taken;
    }

    pub fn is_truncated(&self) -> bool {
        self.dropped > 0
    }

    pub fn to_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.dropped > 0 {
            text.push_str(&format!(
                "\n[output truncated: {} bytes omitted]",
                self.dropped
            ));
        }
        text
    }
}

/// Terminal status plus the output to persist with it
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub status: SubmissionStatus,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl Verdict {
    /// Infrastructure or precondition failure; user code never produced output
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: SubmissionStatus::Error,
            stdout: None,
            stderr: Some(message.into()),
        }
    }

    pub fn timed_out(captured: Captured, timeout_seconds: u64) -> Self {
        let mut stderr = captured.stderr;
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&format!(
            "Execution timed out after {} seconds.",
            timeout_seconds
        ));
        Self {
            status: SubmissionStatus::Timeout,
            stdout: non_empty(captured.stdout),
            stderr: Some(stderr),
        }
    }
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn with_note(mut stderr: String, note: &str) -> String {
    if !stderr.is_empty() && !stderr.ends_with('\n') {
        stderr.push('\n');
    }
    stderr.push_str(note);
    stderr
}

/// Classify a container that exited before its deadline
pub fn evaluate(exit: RunExit) -> Verdict {
    let RunExit {
        exit_code,
        stdout,
        stderr,
    } = exit;

    match exit_code {
        0 => Verdict {
            status: SubmissionStatus::Completed,
            stdout: non_empty(stdout),
            stderr: non_empty(stderr),
        },
        126 | 127 => Verdict {
            status: SubmissionStatus::Error,
            stdout: non_empty(stdout),
            stderr: Some(with_note(
                stderr,
                &format!(
                    "[Run command could not be executed inside the image (exit code {})]",
                    exit_code
                ),
            )),
        },
        137 => Verdict {
            status: SubmissionStatus::Failed,
            stdout: non_empty(stdout),
            stderr: Some(with_note(
                stderr,
                "[Container killed: likely OOM or exceeded memory limit]",
            )),
        },
        139 => Verdict {
            status: SubmissionStatus::Failed,
            stdout: non_empty(stdout),
            stderr: Some(with_note(stderr, "[Container killed: segmentation fault]")),
        },
        code => {
            let stderr = if stderr.is_empty() {
                format!("[Process exited with code {}]", code)
            } else {
                stderr
            };
            Verdict {
                status: SubmissionStatus::Failed,
                stdout: non_empty(stdout),
                stderr: Some(stderr),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exit(code: i64, stdout: &str, stderr: &str) -> RunExit {
        RunExit {
            exit_code: code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_clean_exit_completes_with_null_stderr() {
        let verdict = evaluate(exit(0, "hi\n", ""));
        assert_eq!(verdict.status, SubmissionStatus::Completed);
        assert_eq!(verdict.stdout.as_deref(), Some("hi\n"));
        assert_eq!(verdict.stderr, None);
    }

    #[test]
    fn test_user_failure_populates_stderr() {
        let verdict = evaluate(exit(1, "", "Traceback: ZeroDivisionError\n"));
        assert_eq!(verdict.status, SubmissionStatus::Failed);
        assert!(verdict.stderr.unwrap().contains("ZeroDivisionError"));

        let silent = evaluate(exit(3, "", ""));
        assert_eq!(silent.status, SubmissionStatus::Failed);
        assert_eq!(silent.stderr.as_deref(), Some("[Process exited with code 3]"));
    }

    #[test]
    fn test_memory_kill_is_user_failure() {
        let verdict = evaluate(exit(137, "partial", ""));
        assert_eq!(verdict.status, SubmissionStatus::Failed);
        assert!(verdict.stderr.unwrap().contains("OOM"));
    }

    #[test]
    fn test_missing_interpreter_is_infrastructure_error() {
        let verdict = evaluate(exit(127, "", "exec: \"python\": not found"));
        assert_eq!(verdict.status, SubmissionStatus::Error);
        assert!(verdict.stderr.unwrap().contains("exit code 127"));
    }

    #[test]
    fn test_timeout_keeps_partial_stdout() {
        let verdict = Verdict::timed_out(
            Captured {
                stdout: "tick\ntick\n".into(),
                stderr: String::new(),
            },
            10,
        );
        assert_eq!(verdict.status, SubmissionStatus::Timeout);
        assert_eq!(verdict.stdout.as_deref(), Some("tick\ntick\n"));
        assert_eq!(
            verdict.stderr.as_deref(),
            Some("Execution timed out after 10 seconds.")
        );
    }

    #[test]
    fn test_capped_buffer() {
        let mut buf = CappedBuffer::new(5);
        buf.push(b"abc");
        buf.push(b"defgh");
        assert!(buf.is_truncated());
        assert_eq!(buf.to_text(), "abcde\n[output truncated: 3 bytes omitted]");

        let mut small = CappedBuffer::new(16);
        small.push(b"ok");
        assert!(!small.is_truncated());
        assert_eq!(small.to_text(), "ok");
    }
}
