//! Target routing and read-only file mapping.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::ptr::NonNull;

use tracing::debug;

use crate::constants::{
    FANS_PAGE, LOGIN_PAGE, PICTURE_PAGE, REGISTER_PAGE, VIDEO_PAGE,
};

/// Permission bit that must be set for a file to be served.
const OTHERS_READ: u32 = libc::S_IROTH as u32;

/// What a parsed target resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Serve this page from the document root.
    File(String),
    /// Check the posted credentials against the user table.
    Login,
    /// Insert the posted credentials into the user table.
    Register,
}

/// Route on the character following the last `/` of the target.
pub fn route(target: &str, is_post: bool) -> Route {
    let tag = target
        .rfind('/')
        .and_then(|slash| target[slash + 1..].chars().next());
    match (tag, is_post) {
        (Some('2'), true) => Route::Login,
        (Some('3'), true) => Route::Register,
        (Some('0'), _) => Route::File(REGISTER_PAGE.to_owned()),
        (Some('1'), _) => Route::File(LOGIN_PAGE.to_owned()),
        (Some('5'), _) => Route::File(PICTURE_PAGE.to_owned()),
        (Some('6'), _) => Route::File(VIDEO_PAGE.to_owned()),
        (Some('7'), _) => Route::File(FANS_PAGE.to_owned()),
        _ => Route::File(target.to_owned()),
    }
}

#[derive(Debug)]
pub enum FileOutcome {
    Ready(MappedFile),
    NotFound,
    Forbidden,
    Directory,
    /// Not a regular file, or it could not be opened or mapped.
    Unavailable,
}

/// Resolve `page` under `root` and map it if it may be served.
pub fn open_resource(root: &Path, page: &str) -> FileOutcome {
    let Some(path) = resolve(root, page) else {
        return FileOutcome::Forbidden;
    };
    let Ok(meta) = std::fs::metadata(&path) else {
        return FileOutcome::NotFound;
    };
    if meta.permissions().mode() & OTHERS_READ == 0 {
        return FileOutcome::Forbidden;
    }
    if meta.is_dir() {
        return FileOutcome::Directory;
    }
    // Opening a FIFO would block the worker.
    if !meta.is_file() {
        return FileOutcome::Unavailable;
    }
    match MappedFile::open(&path) {
        Ok(file) => FileOutcome::Ready(file),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => FileOutcome::Forbidden,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "failed to map file");
            FileOutcome::Unavailable
        }
    }
}

/// Join a `/`-rooted target onto the document root. Targets that climb out
/// of the root with `..` are refused.
fn resolve(root: &Path, page: &str) -> Option<PathBuf> {
    let relative = Path::new(page.trim_start_matches('/'));
    let mut path = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(path)
}

/// A private read-only mapping of a whole file, unmapped on drop.
///
/// Empty files hold no mapping at all since `mmap` rejects zero lengths.
#[derive(Debug)]
pub struct MappedFile {
    ptr: Option<NonNull<u8>>,
    len: usize,
}

// SAFETY: the mapping is PROT_READ and never aliased mutably; the pointer is
// only dereferenced through `as_slice`, which hands out shared borrows.
unsafe impl Send for MappedFile {}
// SAFETY: see above; concurrent shared reads of read-only pages are sound.
unsafe impl Sync for MappedFile {}

impl MappedFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = usize::try_from(file.metadata()?.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "file too large to map"))?;
        if len == 0 {
            return Ok(Self { ptr: None, len: 0 });
        }

        // SAFETY: valid descriptor and nonzero length; the kernel picks the
        // address. The descriptor may be closed once the mapping exists.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            ptr: NonNull::new(addr.cast::<u8>()),
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match self.ptr {
            // SAFETY: ptr/len describe a live PROT_READ mapping owned by self.
            Some(ptr) => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.len) },
            None => &[],
        }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            // SAFETY: unmapping exactly the region returned by mmap, once.
            unsafe {
                libc::munmap(ptr.as_ptr().cast(), self.len);
            }
        }
    }
}
