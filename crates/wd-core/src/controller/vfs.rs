//! Read-side view of the filesystem for a sandboxed script.
//!
//! Reads are answered from the real filesystem inside the declared roots,
//! from a synthetic `/proc/self`, and from an in-memory overlay of the
//! script's own captured writes. The real filesystem is never written.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use wd_protocol::{normalize_path, Errno, ProtocolError, Reply};

use super::procfs::ProcSelf;

pub struct Vfs {
    /// Lexically normalized roots.
    roots: Vec<PathBuf>,
    /// Canonical forms of the roots that exist.
    canonical_roots: Vec<PathBuf>,
    /// Base for relative paths.
    cwd: PathBuf,
    /// Keyed by real path.
    overlay: HashMap<PathBuf, Vec<u8>>,
    proc_self: ProcSelf,
}

impl Vfs {
    /// `script` is always readable; relative paths resolve against its
    /// directory. `interpreter` is what `/proc/self` describes.
    pub fn new(roots: &[PathBuf], script: &Path, interpreter: &[String]) -> Self {
        let root = Path::new("/");
        let script = normalize_path(&cwd_or_root(), script).unwrap_or_else(|| script.to_path_buf());
        let cwd = script.parent().unwrap_or(root).to_path_buf();

        let mut lexical: Vec<PathBuf> = roots
            .iter()
            .filter_map(|r| normalize_path(root, r))
            .collect();
        lexical.push(script.clone());
        let canonical_roots = lexical
            .iter()
            .filter_map(|r| fs::canonicalize(r).ok())
            .collect();

        let proc_self = ProcSelf::new(interpreter, &script);
        Self {
            roots: lexical,
            canonical_roots,
            cwd,
            overlay: HashMap::new(),
            proc_self,
        }
    }

    /// Resolve a wire path to an absolute, normalized path.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, ProtocolError> {
        if raw.is_empty() || raw.contains('\0') {
            return Err(ProtocolError::BadPath(raw.to_string()));
        }
        normalize_path(&self.cwd, Path::new(raw)).ok_or_else(|| ProtocolError::BadPath(raw.to_string()))
    }

    /// Whether `path` lies inside a root, both lexically and after
    /// resolving symlinks.
    pub fn is_readable(&self, path: &Path) -> bool {
        if !self
            .roots
            .iter()
            .chain(&self.canonical_roots)
            .any(|r| path.starts_with(r))
        {
            return false;
        }
        match fs::canonicalize(path) {
            Ok(real) => self.canonical_roots.iter().any(|r| real.starts_with(r)),
            // Missing paths fail later with NotFound.
            Err(_) => true,
        }
    }

    pub fn read(&self, path: &Path) -> Reply {
        if let Some(content) = self.overlaid(path) {
            return Reply::data(content);
        }
        if let Some(entry) = ProcSelf::strip(path) {
            return match self.proc_self.get(&entry) {
                Some(content) => Reply::data(content),
                None => proc_entry_missing(path),
            };
        }
        if !self.is_readable(path) {
            return outside_roots(path);
        }
        match fs::read(path) {
            Ok(content) => Reply::data(&content),
            Err(e) => io_reply(path, e),
        }
    }

    pub fn stat(&self, path: &Path) -> Reply {
        if let Some(content) = self.overlaid(path) {
            return Reply::Metadata {
                size: content.len() as u64,
                is_dir: false,
                readonly: false,
                modified: None,
            };
        }
        if let Some(entry) = ProcSelf::strip(path) {
            if entry.as_os_str().is_empty() {
                return Reply::Metadata {
                    size: 0,
                    is_dir: true,
                    readonly: true,
                    modified: None,
                };
            }
            return match self.proc_self.get(&entry) {
                Some(content) => Reply::Metadata {
                    size: content.len() as u64,
                    is_dir: false,
                    readonly: true,
                    modified: None,
                },
                None => proc_entry_missing(path),
            };
        }
        if !self.is_readable(path) {
            return outside_roots(path);
        }
        match fs::metadata(path) {
            Ok(meta) => Reply::Metadata {
                size: meta.len(),
                is_dir: meta.is_dir(),
                readonly: meta.permissions().readonly(),
                modified: meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs()),
            },
            Err(e) => io_reply(path, e),
        }
    }

    /// Directory listing, including files the script has written there.
    pub fn list_dir(&self, path: &Path) -> Reply {
        if let Some(entry) = ProcSelf::strip(path) {
            return if entry.as_os_str().is_empty() {
                Reply::Entries {
                    names: self.proc_self.names().map(String::from).collect(),
                }
            } else {
                proc_entry_missing(path)
            };
        }

        let real = real_path(path).unwrap_or_else(|_| path.to_path_buf());
        let mut names: BTreeSet<String> = self
            .overlay
            .keys()
            .filter(|p| p.parent() == Some(path) || p.parent() == Some(real.as_path()))
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();

        if !self.is_readable(path) {
            return if names.is_empty() {
                outside_roots(path)
            } else {
                Reply::Entries {
                    names: names.into_iter().collect(),
                }
            };
        }
        match fs::read_dir(path) {
            Ok(entries) => {
                names.extend(
                    entries
                        .filter_map(|e| e.ok())
                        .map(|e| e.file_name().to_string_lossy().into_owned()),
                );
            }
            Err(e) if !names.is_empty() && e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return io_reply(path, e),
        }
        Reply::Entries {
            names: names.into_iter().collect(),
        }
    }

    /// Overlay content for `path`, looked up under its real path too.
    fn overlaid(&self, path: &Path) -> Option<&Vec<u8>> {
        self.overlay.get(path).or_else(|| {
            real_path(path)
                .ok()
                .and_then(|real| self.overlay.get(&real))
        })
    }

    /// Record a captured write so later reads observe it. `path` must be a
    /// real path as returned by [`real_path`].
    pub fn overlay_write(&mut self, path: &Path, content: &[u8], append: bool) {
        if append {
            let base = match self.overlay.get(path) {
                Some(existing) => existing.clone(),
                None if self.is_readable(path) => fs::read(path).unwrap_or_default(),
                None => Vec::new(),
            };
            let mut merged = base;
            merged.extend_from_slice(content);
            self.overlay.insert(path.to_path_buf(), merged);
        } else {
            self.overlay.insert(path.to_path_buf(), content.to_vec());
        }
    }
}

/// `path` with the symlinks of its existing ancestors resolved. Trailing
/// components that do not exist yet are kept as given.
///
/// Write targets are recorded, classified and committed by this path, so a
/// symlinked directory cannot redirect an allowed write elsewhere.
pub fn real_path(path: &Path) -> io::Result<PathBuf> {
    let mut missing = Vec::new();
    let mut current = path;
    loop {
        match fs::canonicalize(current) {
            Ok(mut real) => {
                real.extend(missing.iter().rev());
                return Ok(real);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let (Some(parent), Some(name)) = (current.parent(), current.file_name()) else {
                    return Err(e);
                };
                missing.push(name);
                current = parent;
            }
            Err(e) => return Err(e),
        }
    }
}

fn cwd_or_root() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
}

fn outside_roots(path: &Path) -> Reply {
    Reply::error(
        Errno::PermissionDenied,
        format!("{}: outside readable roots", path.display()),
    )
}

fn proc_entry_missing(path: &Path) -> Reply {
    Reply::error(
        Errno::NotFound,
        format!("{}: not available in the sandbox", path.display()),
    )
}

fn io_reply(path: &Path, e: io::Error) -> Reply {
    let errno = match e.kind() {
        io::ErrorKind::NotFound => Errno::NotFound,
        io::ErrorKind::PermissionDenied => Errno::PermissionDenied,
        _ => Errno::Io,
    };
    Reply::error(errno, format!("{}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Vfs) {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("a.txt"), b"alpha").unwrap();
        fs::write(dir.path().join("secret"), b"nope").unwrap();
        let script = dir.path().join("script.py");
        fs::write(&script, b"print(1)").unwrap();
        let vfs = Vfs::new(&[root], &script, &["python3".to_string()]);
        (dir, vfs)
    }

    #[test]
    fn reads_inside_roots() {
        let (dir, vfs) = setup();
        let reply = vfs.read(&dir.path().join("root/a.txt"));
        assert_eq!(reply, Reply::data(b"alpha"));
    }

    #[test]
    fn script_is_always_readable() {
        let (dir, vfs) = setup();
        assert_eq!(vfs.read(&dir.path().join("script.py")), Reply::data(b"print(1)"));
    }

    #[test]
    fn reads_outside_roots_are_refused() {
        let (dir, vfs) = setup();
        assert!(matches!(
            vfs.read(&dir.path().join("secret")),
            Reply::Error {
                errno: Errno::PermissionDenied,
                ..
            }
        ));
        let escaped = vfs.resolve(&format!("{}/root/../secret", dir.path().display())).unwrap();
        assert!(!vfs.is_readable(&escaped));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_refused() {
        let (dir, vfs) = setup();
        let link = dir.path().join("root/link");
        std::os::unix::fs::symlink(dir.path().join("secret"), &link).unwrap();
        assert!(matches!(
            vfs.read(&link),
            Reply::Error {
                errno: Errno::PermissionDenied,
                ..
            }
        ));
    }

    #[test]
    fn missing_file_is_not_found() {
        let (dir, vfs) = setup();
        assert!(matches!(
            vfs.read(&dir.path().join("root/missing")),
            Reply::Error {
                errno: Errno::NotFound,
                ..
            }
        ));
    }

    #[test]
    fn relative_paths_resolve_against_script_dir() {
        let (dir, vfs) = setup();
        assert_eq!(vfs.resolve("root/a.txt").unwrap(), dir.path().join("root/a.txt"));
        assert!(vfs.resolve("bad\0path").is_err());
        assert!(vfs.resolve("").is_err());
    }

    #[test]
    fn overlay_makes_writes_visible() {
        let (dir, mut vfs) = setup();
        let out = dir.path().join("out.txt");
        vfs.overlay_write(&out, b"one", false);
        vfs.overlay_write(&out, b"two", true);
        assert_eq!(vfs.read(&out), Reply::data(b"onetwo"));
        assert!(matches!(vfs.stat(&out), Reply::Metadata { size: 6, .. }));
        assert!(!out.exists());
    }

    #[test]
    fn append_to_real_file_starts_from_its_content() {
        let (dir, mut vfs) = setup();
        let a = dir.path().join("root/a.txt");
        vfs.overlay_write(&a, b"+", true);
        assert_eq!(vfs.read(&a), Reply::data(b"alpha+"));
        assert_eq!(fs::read(&a).unwrap(), b"alpha");
    }

    #[test]
    fn list_dir_merges_overlay() {
        let (dir, mut vfs) = setup();
        let root = dir.path().join("root");
        vfs.overlay_write(&root.join("b.txt"), b"", false);
        assert_eq!(
            vfs.list_dir(&root),
            Reply::Entries {
                names: vec!["a.txt".into(), "b.txt".into()]
            }
        );
    }

    #[test]
    fn stat_reports_directories() {
        let (dir, vfs) = setup();
        assert!(matches!(
            vfs.stat(&dir.path().join("root")),
            Reply::Metadata { is_dir: true, .. }
        ));
    }

    #[test]
    fn proc_self_is_synthetic() {
        let (_dir, vfs) = setup();
        match vfs.read(Path::new("/proc/self/cmdline")) {
            Reply::Data { .. } => {}
            other => panic!("unexpected reply {other:?}"),
        }
        assert_eq!(
            vfs.read(Path::new("/proc/self/cmdline")),
            vfs.read(&PathBuf::from(format!("/proc/{}/cmdline", std::process::id())))
        );
        assert!(matches!(
            vfs.read(Path::new("/proc/self/maps")),
            Reply::Error {
                errno: Errno::NotFound,
                ..
            }
        ));
        assert!(matches!(
            vfs.stat(Path::new("/proc/self")),
            Reply::Metadata { is_dir: true, .. }
        ));
    }

    #[test]
    fn proc_self_environ_hides_controller_environment() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("script.py");
        fs::write(&script, b"").unwrap();
        // Even with /proc as a root, the controller's own entries stay hidden.
        let vfs = Vfs::new(&[PathBuf::from("/proc")], &script, &["python3".to_string()]);
        let Reply::Data { .. } = vfs.read(Path::new("/proc/self/environ")) else {
            panic!("environ should be served");
        };
        assert_eq!(
            vfs.read(Path::new("/proc/self/environ")),
            vfs.read(&PathBuf::from(format!("/proc/{}/environ", std::process::id())))
        );
        let Reply::Entries { names } = vfs.list_dir(Path::new("/proc/self")) else {
            panic!("listing should be served");
        };
        assert!(names.contains(&"environ".to_string()));
        assert!(!names.contains(&"fd".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn real_path_resolves_symlinked_ancestors() {
        let dir = tempdir().unwrap();
        let base = fs::canonicalize(dir.path()).unwrap();
        fs::create_dir(base.join("etc")).unwrap();
        fs::create_dir(base.join("scratch")).unwrap();
        std::os::unix::fs::symlink(base.join("etc"), base.join("scratch/link")).unwrap();

        assert_eq!(
            real_path(&base.join("scratch/link/evil")).unwrap(),
            base.join("etc/evil")
        );
        assert_eq!(
            real_path(&base.join("scratch/new/deeper.txt")).unwrap(),
            base.join("scratch/new/deeper.txt")
        );
    }

    #[cfg(unix)]
    #[test]
    fn overlay_is_visible_through_symlinked_dirs() {
        let (dir, mut vfs) = setup();
        let base = fs::canonicalize(dir.path()).unwrap();
        std::os::unix::fs::symlink(base.join("root"), base.join("root/alias")).unwrap();
        let real = real_path(&base.join("root/alias/new.txt")).unwrap();
        vfs.overlay_write(&real, b"x", false);
        assert_eq!(vfs.read(&base.join("root/alias/new.txt")), Reply::data(b"x"));
    }
}
