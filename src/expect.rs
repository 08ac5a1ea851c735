use std::path::PathBuf;
use thiserror::Error;

use crate::driver::{Invocation, RunResult};

/// Which rule a case broke.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureKind {
    #[error("out test failed")]
    Stdout,
    #[error("err test failed")]
    Stderr,
    #[error("got err test failed")]
    UnexpectedStderr,
    #[error("process returned non-zero exit code but no error was specified")]
    NonZeroExit,
    #[error("file content test failed for {}", .path.display())]
    FileContent { path: PathBuf },
    #[error("expected files under {}", .path.display())]
    EmptyTree { path: PathBuf },
    #[error("process timed out")]
    Timeout,
}

impl FailureKind {
    /// Short stable reason code, for scripts grepping the output.
    pub fn code(&self) -> &'static str {
        match self {
            FailureKind::Stdout => "out",
            FailureKind::Stderr => "err",
            FailureKind::UnexpectedStderr => "got_err",
            FailureKind::NonZeroExit => "exit",
            FailureKind::FileContent { .. } => "file",
            FailureKind::EmptyTree { .. } => "tree",
            FailureKind::Timeout => "timeout",
        }
    }
}

/// A failed case together with everything needed to reproduce it by hand.
#[derive(Debug, Clone, Error)]
#[error(
    "--- COMMAND --\n{command}\n--- INPUT --\n{input}\n--- STDOUT --\n{stdout}\n--- STDERR --\n{stderr}\n--- EXIT --\n{exit}\n[{code}] {kind}",
    code = .kind.code()
)]
pub struct CaseFailure {
    pub kind: FailureKind,
    pub command: String,
    pub input: String,
    pub stdout: String,
    pub stderr: String,
    pub exit: String,
}

impl CaseFailure {
    pub fn new(kind: FailureKind, invocation: &Invocation, script: &str, result: &RunResult) -> Self {
        Self {
            kind,
            command: invocation.to_string(),
            input: script.to_string(),
            stdout: result.stdout_trimmed().to_string(),
            stderr: result.stderr_trimmed().to_string(),
            exit: result.exit_description(),
        }
    }
}

/// Declarative pass/fail contract for one case.
///
/// Empty substrings are treated as unset, so `Expectation::stderr("")` expects
/// nothing from stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expectation {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub allow_nonempty_stderr: bool,
    pub require_zero_exit: bool,
}

impl Default for Expectation {
    fn default() -> Self {
        Self::new()
    }
}

impl Expectation {
    /// No content constraints: clean stderr and a zero exit code.
    pub fn new() -> Self {
        Self {
            stdout: None,
            stderr: None,
            allow_nonempty_stderr: false,
            require_zero_exit: true,
        }
    }

    pub fn stdout(needle: impl Into<String>) -> Self {
        Self::new().with_stdout(needle)
    }

    pub fn stderr(needle: impl Into<String>) -> Self {
        Self::new().with_stderr(needle)
    }

    pub fn with_stdout(mut self, needle: impl Into<String>) -> Self {
        self.stdout = non_empty(needle.into());
        self
    }

    /// Expecting a diagnostic also lifts the clean-stderr and zero-exit rules.
    pub fn with_stderr(mut self, needle: impl Into<String>) -> Self {
        self.stderr = non_empty(needle.into());
        if self.stderr.is_some() {
            return self.tolerate_stderr().tolerate_exit();
        }
        self
    }

    /// Lets diagnostics through without asserting on them. The exit code rule still applies.
    pub fn tolerate_stderr(mut self) -> Self {
        self.allow_nonempty_stderr = true;
        self
    }

    pub fn tolerate_exit(mut self) -> Self {
        self.require_zero_exit = false;
        self
    }

    /// Applies the rules in order and reports the first one that fails.
    pub fn check(&self, result: &RunResult) -> Result<(), FailureKind> {
        if result.timed_out {
            return Err(FailureKind::Timeout);
        }
        let stdout = result.stdout_trimmed();
        let stderr = result.stderr_trimmed();

        if let Some(needle) = &self.stdout {
            if !stdout.contains(needle.as_str()) {
                return Err(FailureKind::Stdout);
            }
        }
        if let Some(needle) = &self.stderr {
            if !stderr.contains(needle.as_str()) {
                return Err(FailureKind::Stderr);
            }
        }
        if self.stderr.is_none() && !self.allow_nonempty_stderr && !stderr.is_empty() {
            return Err(FailureKind::UnexpectedStderr);
        }
        if self.stderr.is_none() && self.require_zero_exit && result.exit_code != Some(0) {
            return Err(FailureKind::NonZeroExit);
        }
        Ok(())
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Checks `result` against `expect`, wrapping a failure in the full transcript.
pub fn verify(
    invocation: &Invocation,
    script: &str,
    result: &RunResult,
    expect: &Expectation,
) -> Result<(), CaseFailure> {
    expect
        .check(result)
        .map_err(|kind| CaseFailure::new(kind, invocation, script, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(stdout: &str, stderr: &str, exit_code: i32) -> RunResult {
        RunResult {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code: Some(exit_code),
            signal: None,
            timed_out: false,
        }
    }

    #[test]
    fn stdout_match_with_clean_exit_passes() {
        let exp = Expectation::stdout("asdf");
        assert_eq!(exp.check(&result("  a\nasdf\n", "", 0)), Ok(()));
    }

    #[test]
    fn missing_stdout_fails_first() {
        let exp = Expectation::stdout("asdf");
        assert_eq!(exp.check(&result("qwer", "boom", 1)), Err(FailureKind::Stdout));
    }

    #[test]
    fn stderr_expectation_ignores_exit_code() {
        let exp = Expectation::stderr("Could not convert");
        let res = result("", "Error: Could not convert string 'XXXX'\n", 1);
        assert_eq!(exp.check(&res), Ok(()));
        assert_eq!(
            exp.check(&result("", "something else", 1)),
            Err(FailureKind::Stderr)
        );
    }

    #[test]
    fn unexpected_stderr_fails_even_with_zero_exit() {
        let exp = Expectation::stdout("42");
        assert_eq!(
            exp.check(&result("42", "warning: x", 0)),
            Err(FailureKind::UnexpectedStderr)
        );
    }

    #[test]
    fn tolerated_stderr_still_requires_zero_exit() {
        let exp = Expectation::stdout("42").tolerate_stderr();
        assert_eq!(exp.check(&result("42", "warning: x", 0)), Ok(()));
        assert_eq!(
            exp.check(&result("42", "warning: x", 1)),
            Err(FailureKind::NonZeroExit)
        );
        assert_eq!(
            exp.check(&result("41", "warning: x", 0)),
            Err(FailureKind::Stdout)
        );
    }

    #[test]
    fn whitespace_only_stderr_counts_as_empty() {
        assert_eq!(Expectation::new().check(&result("", " \n\t", 0)), Ok(()));
    }

    #[test]
    fn nonzero_exit_without_expected_error_fails() {
        assert_eq!(
            Expectation::new().check(&result("", "", 2)),
            Err(FailureKind::NonZeroExit)
        );
    }

    #[test]
    fn signal_termination_counts_as_nonzero() {
        let mut res = result("", "", 0);
        res.exit_code = None;
        res.signal = Some(9);
        assert_eq!(Expectation::new().check(&res), Err(FailureKind::NonZeroExit));
    }

    #[test]
    fn empty_stderr_needle_means_unset() {
        let exp = Expectation::stdout("x").with_stderr("");
        assert_eq!(exp.stderr, None);
        assert!(exp.require_zero_exit);
        assert_eq!(
            exp.check(&result("x", "noise", 0)),
            Err(FailureKind::UnexpectedStderr)
        );
    }

    #[test]
    fn tolerated_exit_still_requires_clean_stderr() {
        let exp = Expectation::new().tolerate_exit();
        assert_eq!(exp.check(&result("", "", 1)), Ok(()));
        assert_eq!(
            exp.check(&result("", "oops", 1)),
            Err(FailureKind::UnexpectedStderr)
        );
    }

    #[test]
    fn embedded_newlines_must_match_exactly() {
        let exp = Expectation::stdout("hello\\nworld");
        assert_eq!(exp.check(&result("a\nhello\\nworld\n", "", 0)), Ok(()));
        assert_eq!(
            exp.check(&result("hello\nworld", "", 0)),
            Err(FailureKind::Stdout)
        );
    }

    #[test]
    fn timed_out_run_reports_timeout() {
        let mut res = result("42", "", 0);
        res.timed_out = true;
        let inv = Invocation::new("/bin/shell", ["--batch"]);
        let err = verify(&inv, "SELECT 42;", &res, &Expectation::stdout("42")).unwrap_err();
        assert_eq!(err.kind, FailureKind::Timeout);
        assert!(err.to_string().ends_with("[timeout] process timed out"));
    }

    #[test]
    fn failure_transcript_is_complete() {
        let inv = Invocation::new("/bin/shell", ["--batch", "-init", "/dev/null"]);
        let script = "CREATE TABLE a (i STRING);\nSELECT 1;\n";
        let res = result("1\n", "Error: nope\n", 1);
        let err = verify(&inv, script, &res, &Expectation::stdout("2")).unwrap_err();
        let text = err.to_string();
        assert_eq!(err.kind, FailureKind::Stdout);
        assert!(text.starts_with("--- COMMAND --\n/bin/shell --batch -init /dev/null\n"));
        assert!(text.contains("--- INPUT --\nCREATE TABLE a (i STRING);\nSELECT 1;\n\n"));
        assert!(text.contains("--- STDOUT --\n1\n"));
        assert!(text.contains("--- STDERR --\nError: nope\n"));
        assert!(text.contains("--- EXIT --\nexit code 1\n"));
        assert!(text.ends_with("[out] out test failed"));
    }
}
