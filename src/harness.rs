use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::driver::{self, Invocation, RunResult};
use crate::expect::{self, CaseFailure, Expectation, FailureKind};
use crate::fixtures::{self, Fixtures};

/// Everything a case needs: the shell under test, how to launch it, and a fixture root.
pub struct Harness {
    base: Invocation,
    timeout: Option<Duration>,
    pub fixtures: Fixtures,
}

impl Harness {
    pub fn new(shell: &Path, null_config: &Path, timeout: Option<Duration>) -> Result<Self> {
        let shell = which::which(shell)
            .with_context(|| format!("shell binary {} not found", shell.display()))?;
        let base = Invocation::new(
            shell,
            [OsStr::new("--batch"), OsStr::new("-init"), null_config.as_os_str()],
        );
        Ok(Self {
            base,
            timeout,
            fixtures: Fixtures::new()?,
        })
    }

    pub fn shell(&self) -> &Path {
        self.base.program()
    }

    pub fn test(&self, script: &str, expect: Expectation) -> Result<()> {
        self.test_run(script, &[] as &[&str], expect).map(drop)
    }

    pub fn test_with_args<S: AsRef<OsStr>>(
        &self,
        script: &str,
        extra: &[S],
        expect: Expectation,
    ) -> Result<()> {
        self.test_run(script, extra, expect).map(drop)
    }

    /// Runs one case and hands back the run so callers can inspect files it wrote.
    pub fn test_run<S: AsRef<OsStr>>(
        &self,
        script: &str,
        extra: &[S],
        expect: Expectation,
    ) -> Result<CaseRun> {
        let invocation = self.base.with_extra(extra);
        let result = driver::run(&invocation, script.as_bytes(), self.timeout)?;
        expect::verify(&invocation, script, &result, &expect)?;
        Ok(CaseRun {
            invocation,
            script: script.to_string(),
            result,
        })
    }
}

/// A passed invocation, kept around for checks on its side effects.
#[derive(Debug)]
pub struct CaseRun {
    invocation: Invocation,
    script: String,
    result: RunResult,
}

impl CaseRun {
    fn failure(&self, kind: FailureKind) -> CaseFailure {
        CaseFailure::new(kind, &self.invocation, &self.script, &self.result)
    }

    /// Fails unless the file at `path` exists and contains `needle`.
    pub fn expect_file_contains(&self, path: &Path, needle: &[u8]) -> Result<()> {
        let found = match fs::read(path) {
            Ok(bytes) => contains_bytes(&bytes, needle),
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        if !found {
            return Err(self
                .failure(FailureKind::FileContent {
                    path: path.to_path_buf(),
                })
                .into());
        }
        Ok(())
    }

    /// Fails unless the target left at least one regular file under `dir`.
    pub fn expect_tree_nonempty(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let files = fixtures::tree_files(dir)?;
        if files.is_empty() {
            return Err(self
                .failure(FailureKind::EmptyTree {
                    path: dir.to_path_buf(),
                })
                .into());
        }
        Ok(files)
    }
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}
