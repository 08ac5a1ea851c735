use anyhow::{Context, Result};
use rand::RngCore;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::TempDir;
use walkdir::WalkDir;

/// Per-run fixture root. Everything under it goes away when this is dropped.
pub struct Fixtures {
    dir: TempDir,
    next: AtomicU64,
}

impl Fixtures {
    pub fn new() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("shell-conformance-")
            .tempdir()
            .context("creating fixture root")?;
        Ok(Self {
            dir,
            next: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Fresh path under the root that nothing else in this run will get.
    /// Nothing is created on disk.
    pub fn new_path(&self, stem: &str) -> PathBuf {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let token = rand::thread_rng().next_u32();
        self.root().join(format!("{stem}-{n:04}-{token:08x}"))
    }

    /// Writes `contents` byte for byte to a fresh path.
    pub fn write(&self, stem: &str, contents: &[u8]) -> Result<PathBuf> {
        let path = self.new_path(stem);
        fs::write(&path, contents).with_context(|| format!("writing fixture {}", path.display()))?;
        Ok(path)
    }

    pub fn new_dir(&self, stem: &str) -> Result<PathBuf> {
        let path = self.new_path(stem);
        fs::create_dir_all(&path)
            .with_context(|| format!("creating fixture dir {}", path.display()))?;
        Ok(path)
    }

    /// Like [`Fixtures::write`], but the file is removed as soon as the guard drops.
    pub fn scratch(&self, stem: &str, contents: &[u8]) -> Result<ScratchFile> {
        Ok(ScratchFile {
            path: self.write(stem, contents)?,
        })
    }
}

/// File removed on drop, whether or not the case using it passed.
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Recursive removal; a missing target is fine.
pub fn remove_tree(path: &Path) -> Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Err(e) if e.kind() != ErrorKind::NotFound => {
            Err(e).with_context(|| format!("removing {}", path.display()))
        }
        _ => Ok(()),
    }
}

/// Regular files below `dir`, sorted. A missing `dir` yields an empty list.
pub fn tree_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking {}", dir.display()))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Path as it should appear inside a script.
pub fn script_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn new_path_is_unique_and_not_created() {
        let fx = Fixtures::new().unwrap();
        let mut seen = HashSet::new();
        for _ in 0..500 {
            let p = fx.new_path("tf");
            assert!(p.starts_with(fx.root()));
            assert!(!p.exists());
            assert!(seen.insert(p));
        }
    }

    #[test]
    fn new_path_is_unique_across_threads() {
        let fx = Arc::new(Fixtures::new().unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let fx = Arc::clone(&fx);
                std::thread::spawn(move || (0..200).map(|_| fx.new_path("tf")).collect::<Vec<_>>())
            })
            .collect();
        let mut seen = HashSet::new();
        for h in handles {
            for p in h.join().unwrap() {
                assert!(seen.insert(p));
            }
        }
        assert_eq!(seen.len(), 1600);
    }

    #[test]
    fn write_keeps_bytes_verbatim() {
        let fx = Fixtures::new().unwrap();
        let p = fx.write("data", b"42\n84\n").unwrap();
        assert_eq!(fs::read(&p).unwrap(), b"42\n84\n");
        let raw = fx.write("raw", b"\xFF\n").unwrap();
        assert_eq!(fs::read(&raw).unwrap(), b"\xFF\n");
    }

    #[test]
    fn scratch_file_removed_on_drop() {
        let fx = Fixtures::new().unwrap();
        let path = {
            let scratch = fx.scratch("nonsense", b"blablabla").unwrap();
            assert_eq!(fs::read(scratch.path()).unwrap(), b"blablabla");
            scratch.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn scratch_file_removed_on_early_return() {
        fn failing(fx: &Fixtures, seen: &mut Option<PathBuf>) -> Result<()> {
            let scratch = fx.scratch("nonsense", b"blablabla")?;
            *seen = Some(scratch.path().to_path_buf());
            anyhow::bail!("case failed");
        }
        let fx = Fixtures::new().unwrap();
        let mut seen = None;
        assert!(failing(&fx, &mut seen).is_err());
        assert!(!seen.unwrap().exists());
    }

    #[test]
    fn remove_tree_is_idempotent() {
        let fx = Fixtures::new().unwrap();
        let dir = fx.new_dir("export").unwrap();
        fs::create_dir_all(dir.join("nested/deeper")).unwrap();
        fs::write(dir.join("nested/deeper/load.sql"), b"x").unwrap();
        remove_tree(&dir).unwrap();
        assert!(!dir.exists());
        remove_tree(&dir).unwrap();
        remove_tree(&fx.new_path("never-existed")).unwrap();
    }

    #[test]
    fn tree_files_lists_nested_files_only() {
        let fx = Fixtures::new().unwrap();
        let dir = fx.new_dir("export").unwrap();
        fs::create_dir_all(dir.join("sub")).unwrap();
        fs::write(dir.join("schema.sql"), b"").unwrap();
        fs::write(dir.join("sub/integers.csv"), b"1\n").unwrap();
        let files = tree_files(&dir).unwrap();
        assert_eq!(files, vec![dir.join("schema.sql"), dir.join("sub/integers.csv")]);
        assert!(tree_files(&fx.new_path("missing")).unwrap().is_empty());
    }

    #[test]
    fn root_removed_with_fixtures() {
        let fx = Fixtures::new().unwrap();
        let root = fx.root().to_path_buf();
        fx.write("data", b"1").unwrap();
        drop(fx);
        assert!(!root.exists());
    }
}
