//! Sorted run storage.
//!
//! Runs are kept in an arena indexed by [`RunId`]. Ids are handed out in increasing order,
//! so a run with a lower id always holds records that arrived earlier. Retiring a run removes
//! it from the arena and deletes its file.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log;
use tempfile;

/// Run identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId(usize);

impl RunId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run#{}", self.0)
    }
}

/// Immutable sorted run stored in a temporary file.
#[derive(Debug)]
pub struct Run {
    id: RunId,
    len: u64,
    path: tempfile::TempPath,
}

impl Run {
    pub fn id(&self) -> RunId {
        self.id
    }

    /// Number of records in the run.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Moves the run file to `target`.
    /// Falls back to copying if the file can't be renamed (for example across file systems).
    pub fn persist(self, target: &Path) -> io::Result<()> {
        let err = match self.path.persist(target) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        log::debug!("run rename failed ({}), copying to {}", err.error, target.display());
        return replace_by_copy(&err.path, target);
    }
}

/// Copies `source` next to `target` and renames the copy over it.
/// `target` is either fully replaced or left as it was.
fn replace_by_copy(source: &Path, target: &Path) -> io::Result<()> {
    let dir = match target.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let mut staged = tempfile::Builder::new().prefix(".staged-").tempfile_in(dir)?;
    let mut source = fs::File::open(source)?;
    io::copy(&mut source, staged.as_file_mut())?;
    staged.as_file().sync_all()?;
    staged.persist(target).map_err(|err| err.error)?;

    return Ok(());
}

/// Run file allocated in the arena but not written yet.
#[derive(Debug)]
pub struct PendingRun {
    id: RunId,
    path: tempfile::TempPath,
}

impl PendingRun {
    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Arena of live runs.
#[derive(Debug)]
pub struct RunArena {
    dir: PathBuf,
    runs: BTreeMap<RunId, Run>,
    next_id: usize,
}

impl RunArena {
    /// Creates an empty arena storing run files in `dir`.
    pub fn new(dir: &Path) -> Self {
        RunArena {
            dir: dir.to_path_buf(),
            runs: BTreeMap::new(),
            next_id: 0,
        }
    }

    fn next_id(&mut self) -> RunId {
        let id = RunId(self.next_id);
        self.next_id += 1;
        return id;
    }

    /// Reserves the next run id together with an empty temporary file.
    pub fn allocate(&mut self) -> io::Result<PendingRun> {
        let id = self.next_id();
        let file = tempfile::Builder::new()
            .prefix(&format!("run-{:06}-", id.0))
            .suffix(".bin")
            .tempfile_in(&self.dir)?;

        return Ok(PendingRun {
            id,
            path: file.into_temp_path(),
        });
    }

    /// Registers a written run holding `len` records.
    pub fn register(&mut self, pending: PendingRun, len: u64) -> RunId {
        let id = pending.id;
        log::trace!("registering {} ({} records)", id, len);
        self.runs.insert(
            id,
            Run {
                id,
                len,
                path: pending.path,
            },
        );
        return id;
    }

    pub fn get(&self, id: RunId) -> Option<&Run> {
        self.runs.get(&id)
    }

    /// Moves a run under a fresh id without touching its file.
    /// Used to carry a run into the next merge pass while keeping ids in arrival order.
    pub fn relabel(&mut self, id: RunId) -> Option<RunId> {
        let mut run = self.runs.remove(&id)?;
        run.id = self.next_id();
        let new_id = run.id;
        self.runs.insert(new_id, run);
        return Some(new_id);
    }

    /// Removes a run from the arena and deletes its file.
    pub fn retire(&mut self, id: RunId) -> io::Result<()> {
        match self.runs.remove(&id) {
            Some(run) => run.path.close(),
            None => Ok(()),
        }
    }

    /// Takes a run out of the arena, e.g. to publish it.
    pub fn take(&mut self, id: RunId) -> Option<Run> {
        self.runs.remove(&id)
    }

    /// Number of live runs.
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use rstest::*;

    use super::{replace_by_copy, RunArena};

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir_in("./").unwrap()
    }

    #[rstest]
    fn test_run_lifecycle(tmp_dir: tempfile::TempDir) {
        let mut arena = RunArena::new(tmp_dir.path());

        let first = arena.allocate().unwrap();
        let second = arena.allocate().unwrap();
        assert!(first.id() < second.id());

        fs::write(first.path(), b"abc").unwrap();
        let first_path = first.path().to_path_buf();
        let first_id = arena.register(first, 3);
        let second_id = arena.register(second, 0);

        assert_eq!(arena.len(), 2);
        assert_eq!(arena.get(first_id).unwrap().len(), 3);
        assert!(arena.get(second_id).unwrap().is_empty());

        arena.retire(first_id).unwrap();
        assert!(!first_path.exists());
        assert!(arena.get(first_id).is_none());
        assert_eq!(arena.len(), 1);
    }

    #[rstest]
    fn test_relabel_keeps_file(tmp_dir: tempfile::TempDir) {
        let mut arena = RunArena::new(tmp_dir.path());

        let pending = arena.allocate().unwrap();
        fs::write(pending.path(), b"data").unwrap();
        let old_id = arena.register(pending, 1);
        let other = arena.allocate().unwrap();
        let other_id = arena.register(other, 0);

        let new_id = arena.relabel(old_id).unwrap();
        assert!(new_id > other_id);
        assert!(arena.get(old_id).is_none());

        let run = arena.get(new_id).unwrap();
        assert_eq!(run.id(), new_id);
        assert_eq!(fs::read(run.path()).unwrap(), b"data");
    }

    #[rstest]
    fn test_persist_run(tmp_dir: tempfile::TempDir) {
        let mut arena = RunArena::new(tmp_dir.path());

        let pending = arena.allocate().unwrap();
        fs::write(pending.path(), b"sorted").unwrap();
        let id = arena.register(pending, 1);

        let target = tmp_dir.path().join("output.bin");
        arena.take(id).unwrap().persist(&target).unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"sorted");
        assert!(arena.is_empty());
    }

    #[rstest]
    fn test_copy_fallback_replaces_target(tmp_dir: tempfile::TempDir) {
        let source = tmp_dir.path().join("run.bin");
        let target = tmp_dir.path().join("output.bin");
        fs::write(&source, b"sorted").unwrap();
        fs::write(&target, b"previous contents").unwrap();

        replace_by_copy(&source, &target).unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"sorted");
        assert_eq!(fs::read_dir(tmp_dir.path()).unwrap().count(), 2);
    }

    #[rstest]
    fn test_failed_copy_keeps_existing_target(tmp_dir: tempfile::TempDir) {
        let target = tmp_dir.path().join("output.bin");
        fs::write(&target, b"previous contents").unwrap();

        let result = replace_by_copy(&tmp_dir.path().join("missing.bin"), &target);

        assert!(result.is_err());
        assert_eq!(fs::read(&target).unwrap(), b"previous contents");
        assert_eq!(fs::read_dir(tmp_dir.path()).unwrap().count(), 1);
    }

    #[rstest]
    fn test_dropped_arena_removes_files(tmp_dir: tempfile::TempDir) {
        let path = {
            let mut arena = RunArena::new(tmp_dir.path());
            let pending = arena.allocate().unwrap();
            let path = pending.path().to_path_buf();
            arena.register(pending, 0);
            path
        };

        assert!(!path.exists());
    }
}
