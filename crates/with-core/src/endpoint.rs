//! Stream endpoints: caller-visible specs and their materialized files

use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::error::WithError;
use crate::fd::Fd;
use crate::Result;

/// Identity of a stream endpoint.
///
/// An empty filename means an anonymous pipe. Two procs naming the *same*
/// `Rc<FileSpec>` share one materialized [`File`]: identity, not filename
/// equality, is what wires a pipeline together.
#[derive(Debug)]
pub struct FileSpec {
    filename: PathBuf,
    append: bool,
}

impl FileSpec {
    /// An anonymous pipe endpoint
    #[must_use]
    pub fn pipe() -> Rc<Self> {
        Rc::new(Self {
            filename: PathBuf::new(),
            append: false,
        })
    }

    /// An on-disk file endpoint
    #[must_use]
    pub fn file(path: impl Into<PathBuf>, append: bool) -> Rc<Self> {
        Rc::new(Self {
            filename: path.into(),
            append,
        })
    }

    #[must_use]
    pub fn is_pipe(&self) -> bool {
        self.filename.as_os_str().is_empty()
    }

    #[must_use]
    pub fn filename(&self) -> &Path {
        &self.filename
    }

    #[must_use]
    pub const fn append(&self) -> bool {
        self.append
    }
}

/// A materialized endpoint: one per unique [`FileSpec`] per pipeline run.
///
/// Opened exactly once, after all read/write intent has been accumulated.
/// A disk file wanted for both directions aliases a single descriptor on
/// both sides.
#[derive(Debug)]
pub struct File {
    spec: Rc<FileSpec>,
    want_read: bool,
    want_write: bool,
    read_side: Option<Rc<Fd>>,
    write_side: Option<Rc<Fd>>,
}

impl File {
    fn new(spec: Rc<FileSpec>) -> Self {
        Self {
            spec,
            want_read: false,
            want_write: false,
            read_side: None,
            write_side: None,
        }
    }

    /// Open according to the accumulated intent. See the module policy:
    /// pipes get both ends, `/dev/std*` dup the caller's stream in its
    /// natural direction only, anything else opens the named path with
    /// mode 0666. Every descriptor is close-on-exec.
    pub fn open(&mut self) -> Result<()> {
        if self.spec.is_pipe() {
            let (rd, wr) = Fd::pipe(true)?;
            self.read_side = Some(Rc::new(rd));
            self.write_side = Some(Rc::new(wr));
            return Ok(());
        }

        let name = self.spec.filename();
        if name == Path::new("/dev/stdin") {
            if self.want_write {
                return Err(WithError::Setup(
                    "caller_stdin cannot be used for writing".into(),
                ));
            }
            self.read_side = Some(Rc::new(dup_cloexec(libc::STDIN_FILENO)?));
        } else if name == Path::new("/dev/stdout") {
            if self.want_read {
                return Err(WithError::Setup(
                    "caller_stdout cannot be used for reading".into(),
                ));
            }
            self.write_side = Some(Rc::new(dup_cloexec(libc::STDOUT_FILENO)?));
        } else if name == Path::new("/dev/stderr") {
            if self.want_read {
                return Err(WithError::Setup(
                    "caller_stderr cannot be used for reading".into(),
                ));
            }
            self.write_side = Some(Rc::new(dup_cloexec(libc::STDERR_FILENO)?));
        } else {
            let fd = Rc::new(self.open_path()?);
            if self.want_read {
                self.read_side = Some(Rc::clone(&fd));
            }
            if self.want_write {
                self.write_side = Some(Rc::clone(&fd));
            }
        }
        Ok(())
    }

    fn open_path(&self) -> Result<Fd> {
        let mut flags = libc::O_CLOEXEC;
        flags |= match (self.want_read, self.want_write) {
            (true, false) => libc::O_RDONLY,
            (false, true) => libc::O_CREAT | libc::O_WRONLY,
            (true, true) => libc::O_CREAT | libc::O_RDWR,
            (false, false) => {
                return Err(WithError::Setup(format!(
                    "file {} is attached to no stream",
                    self.spec.filename().display()
                )))
            }
        };
        if self.want_write && self.spec.append() {
            flags |= libc::O_APPEND;
        }

        let path = crate::argv::path_to_cstring(self.spec.filename())?;
        tracing::debug!(path = ?self.spec.filename(), flags, "opening endpoint");
        // SAFETY: path is a valid NUL-terminated string
        let raw = unsafe { libc::open(path.as_ptr(), flags, 0o666 as libc::c_uint) };
        if raw < 0 {
            return Err(WithError::sys(format!(
                "open {}",
                self.spec.filename().display()
            )));
        }
        Ok(Fd::from_raw(raw))
    }

    /// Raw descriptor of the read side (a child's stdin)
    pub fn read_raw(&self) -> Result<RawFd> {
        self.read_side
            .as_ref()
            .ok_or_else(|| WithError::Setup("endpoint has no read side".into()))?
            .raw()
    }

    /// Raw descriptor of the write side (a child's stdout/stderr)
    pub fn write_raw(&self) -> Result<RawFd> {
        self.write_side
            .as_ref()
            .ok_or_else(|| WithError::Setup("endpoint has no write side".into()))?
            .raw()
    }

    #[must_use]
    pub fn has_read_side(&self) -> bool {
        self.read_side.is_some()
    }

    /// Drop the parent's read side (closes the fd once no side aliases it)
    pub fn close_read(&mut self) {
        self.read_side = None;
    }

    /// Drop the parent's write side
    pub fn close_write(&mut self) {
        self.write_side = None;
    }

    /// Make the write side non-blocking
    pub fn set_write_nonblocking(&self) -> Result<()> {
        self.write_side
            .as_ref()
            .ok_or_else(|| WithError::Setup("endpoint has no write side".into()))?
            .set_nonblocking()
    }
}

fn dup_cloexec(src: RawFd) -> Result<Fd> {
    // SAFETY: duplicating one of the caller's standard streams
    let raw = unsafe { libc::dup(src) };
    if raw < 0 {
        return Err(WithError::sys(format!("dup({src})")));
    }
    let fd = Fd::from_raw(raw);
    fd.set_cloexec()?;
    Ok(fd)
}

/// Deduplicator from [`FileSpec`] identity to [`File`], insertion-ordered.
///
/// Procs hold indices into the map; the indices stay valid for the run.
/// Dropping the map closes every parent-side descriptor, which is what lets
/// pipe consumers see EOF before the harvest waits.
#[derive(Debug, Default)]
pub struct FileMap {
    files: Vec<File>,
}

impl FileMap {
    /// Find or create the [`File`] for `spec`, accumulating intent
    pub fn get(&mut self, spec: &Rc<FileSpec>, want_read: bool, want_write: bool) -> usize {
        let idx = self
            .files
            .iter()
            .position(|f| Rc::ptr_eq(&f.spec, spec))
            .unwrap_or_else(|| {
                self.files.push(File::new(Rc::clone(spec)));
                self.files.len() - 1
            });
        let file = &mut self.files[idx];
        file.want_read |= want_read;
        file.want_write |= want_write;
        idx
    }

    /// Open every file, in insertion order, exactly once
    pub fn open_all(&mut self) -> Result<()> {
        for file in &mut self.files {
            file.open()?;
        }
        Ok(())
    }

    #[must_use]
    pub fn file(&self, idx: usize) -> &File {
        &self.files[idx]
    }

    pub fn file_mut(&mut self, idx: usize) -> &mut File {
        &mut self.files[idx]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn map_dedups_by_identity_not_filename() {
        let mut map = FileMap::default();
        let a = FileSpec::file("/tmp/x", false);
        let b = FileSpec::file("/tmp/x", false);

        let ia = map.get(&a, true, false);
        let ib = map.get(&b, false, true);
        let ia2 = map.get(&a, false, true);

        assert_eq!(ia, ia2);
        assert_ne!(ia, ib);
        assert_eq!(map.len(), 2);
        assert!(map.file(ia).want_read && map.file(ia).want_write);
        assert!(!map.file(ib).want_read);
    }

    #[test]
    fn pipe_spec_opens_both_sides() {
        let mut map = FileMap::default();
        let p = FileSpec::pipe();
        let idx = map.get(&p, true, true);
        map.open_all().unwrap();

        let file = map.file(idx);
        assert!(file.read_raw().is_ok());
        assert!(file.write_raw().is_ok());
    }

    #[test]
    fn caller_stdout_rejects_reading() {
        let mut map = FileMap::default();
        let spec = FileSpec::file("/dev/stdout", false);
        map.get(&spec, true, false);
        let err = map.open_all().unwrap_err();
        assert!(err.to_string().contains("caller_stdout"));
    }

    #[test]
    fn caller_stdin_rejects_writing() {
        let mut map = FileMap::default();
        let spec = FileSpec::file("/dev/stdin", false);
        map.get(&spec, false, true);
        let err = map.open_all().unwrap_err();
        assert!(err.to_string().contains("caller_stdin"));
    }

    #[test]
    fn append_preserves_existing_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, "first\n").unwrap();

        let mut map = FileMap::default();
        let spec = FileSpec::file(&path, true);
        let idx = map.get(&spec, false, true);
        map.open_all().unwrap();
        crate::fd::write_all(map.file(idx).write_raw().unwrap(), b"second\n").unwrap();
        drop(map);

        let mut contents = String::new();
        std::fs::File::open(&path)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "first\nsecond\n");
    }

    #[test]
    fn missing_file_open_is_a_sys_error() {
        let mut map = FileMap::default();
        let spec = FileSpec::file("/nonexistent-dir/nope", false);
        map.get(&spec, true, false);
        assert!(map.open_all().is_err());
    }
}
