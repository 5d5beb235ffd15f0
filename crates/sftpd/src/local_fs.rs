//! Local filesystem backend for SFTP sessions.
//!
//! Executes SFTP v3 operations against the real filesystem. Absolute paths
//! are used as given; relative paths are resolved against a base directory
//! (the server's working directory in production).
//!
//! One `LocalFs` serves one session. Open files and directory listings live
//! in a handle table that is dropped with the session.

use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::constants::{MAX_READ_LEN, READDIR_BATCH};

enum OpenHandle {
    File { file: fs::File, append: bool },
    /// Listing is taken at `opendir` and handed out by `readdir` in
    /// batches of at most `READDIR_BATCH` entries.
    Dir { entries: std::vec::IntoIter<File> },
}

/// Per-session SFTP handler backed by the local filesystem.
pub struct LocalFs {
    base_dir: PathBuf,
    handles: HashMap<String, OpenHandle>,
    next_handle: u64,
}

impl LocalFs {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            handles: HashMap::new(),
            next_handle: 0,
        }
    }

    /// Number of handles the client has not closed yet.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    fn insert(&mut self, handle: OpenHandle) -> String {
        self.next_handle += 1;
        let key = self.next_handle.to_string();
        self.handles.insert(key.clone(), handle);
        key
    }

    fn file_mut(&mut self, handle: &str) -> Result<(&mut fs::File, bool), StatusCode> {
        match self.handles.get_mut(handle) {
            Some(OpenHandle::File { file, append }) => Ok((file, *append)),
            Some(OpenHandle::Dir { .. }) => Err(StatusCode::Failure),
            None => {
                log::debug!("Unknown sftp handle {}", handle);
                Err(StatusCode::Failure)
            }
        }
    }
}

/// Map an I/O error onto the closest SFTP v3 status.
fn status_of(err: &io::Error) -> StatusCode {
    match err.kind() {
        io::ErrorKind::NotFound => StatusCode::NoSuchFile,
        io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
        io::ErrorKind::UnexpectedEof => StatusCode::Eof,
        _ => StatusCode::Failure,
    }
}

fn io_status(err: io::Error) -> StatusCode {
    log::debug!("sftp operation failed: {}", err);
    status_of(&err)
}

fn ok(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: "en-US".to_string(),
    }
}

fn attrs_of(meta: &std::fs::Metadata) -> FileAttributes {
    FileAttributes {
        size: Some(meta.len()),
        uid: Some(meta.uid()),
        gid: Some(meta.gid()),
        // Full st_mode: clients read the file type from the high bits.
        permissions: Some(meta.mode()),
        atime: Some(meta.atime().clamp(0, u32::MAX as i64) as u32),
        mtime: Some(meta.mtime().clamp(0, u32::MAX as i64) as u32),
        ..Default::default()
    }
}

fn epoch_secs(secs: u32) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(u64::from(secs))
}

fn file_times(attrs: &FileAttributes) -> Option<std::fs::FileTimes> {
    if attrs.atime.is_none() && attrs.mtime.is_none() {
        return None;
    }
    let mut times = std::fs::FileTimes::new();
    if let Some(atime) = attrs.atime {
        times = times.set_accessed(epoch_secs(atime));
    }
    if let Some(mtime) = attrs.mtime {
        times = times.set_modified(epoch_secs(mtime));
    }
    Some(times)
}

async fn set_times(file: std::fs::File, times: std::fs::FileTimes) -> io::Result<()> {
    tokio::task::spawn_blocking(move || file.set_times(times))
        .await
        .map_err(io::Error::other)?
}

/// Apply size, permissions and times from `attrs` to the file at `path`.
async fn apply_path_attrs(path: &Path, attrs: &FileAttributes) -> io::Result<()> {
    if let Some(size) = attrs.size {
        let file = fs::OpenOptions::new().write(true).open(path).await?;
        file.set_len(size).await?;
    }
    if let Some(mode) = attrs.permissions {
        fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777)).await?;
    }
    if let Some(times) = file_times(attrs) {
        let file = std::fs::File::open(path)?;
        set_times(file, times).await?;
    }
    Ok(())
}

/// Lexically normalize `path`: drop `.`, fold `..` into its parent.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

async fn list_dir(path: &Path) -> io::Result<Vec<File>> {
    let mut dir = fs::read_dir(path).await?;
    let mut files = Vec::new();
    while let Some(entry) = dir.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let attrs = match fs::symlink_metadata(entry.path()).await {
            Ok(meta) => attrs_of(&meta),
            // Raced with a delete; still list the name.
            Err(_) => FileAttributes::default(),
        };
        files.push(File::new(name, attrs));
    }
    files.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(files)
}

impl russh_sftp::server::Handler for LocalFs {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        log::debug!("sftp init: client version {}, extensions {:?}", version, extensions);
        Ok(Version::new())
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let path = self.resolve(&filename);
        let append = pflags.contains(OpenFlags::APPEND);
        let write = pflags.contains(OpenFlags::WRITE) || append;

        let mut options = fs::OpenOptions::new();
        options
            .read(pflags.contains(OpenFlags::READ) || !write)
            .write(write)
            .append(append);
        if pflags.contains(OpenFlags::CREATE) {
            if pflags.contains(OpenFlags::EXCLUDE) {
                options.create_new(true);
            } else {
                options.create(true);
            }
            options.mode(attrs.permissions.map_or(0o644, |p| p & 0o7777));
        }
        if pflags.contains(OpenFlags::TRUNCATE) {
            options.truncate(true);
        }

        let file = options.open(&path).await.map_err(io_status)?;
        let handle = self.insert(OpenHandle::File { file, append });
        log::debug!("sftp open {} -> handle {}", path.display(), handle);
        Ok(Handle { id, handle })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        match self.handles.remove(&handle) {
            Some(OpenHandle::File { mut file, .. }) => {
                file.flush().await.map_err(io_status)?;
                Ok(ok(id))
            }
            Some(OpenHandle::Dir { .. }) => Ok(ok(id)),
            None => Err(StatusCode::Failure),
        }
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let (file, _) = self.file_mut(&handle)?;
        file.seek(SeekFrom::Start(offset)).await.map_err(io_status)?;

        let len = len.min(MAX_READ_LEN);
        let mut data = Vec::with_capacity(len as usize);
        file.take(u64::from(len))
            .read_to_end(&mut data)
            .await
            .map_err(io_status)?;

        if data.is_empty() && len > 0 {
            return Err(StatusCode::Eof);
        }
        Ok(Data { id, data })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let (file, append) = self.file_mut(&handle)?;
        if !append {
            file.seek(SeekFrom::Start(offset)).await.map_err(io_status)?;
        }
        file.write_all(&data).await.map_err(io_status)?;
        file.flush().await.map_err(io_status)?;
        Ok(ok(id))
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let meta = fs::symlink_metadata(self.resolve(&path))
            .await
            .map_err(io_status)?;
        Ok(Attrs {
            id,
            attrs: attrs_of(&meta),
        })
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let (file, _) = self.file_mut(&handle)?;
        let meta = file.metadata().await.map_err(io_status)?;
        Ok(Attrs {
            id,
            attrs: attrs_of(&meta),
        })
    }

    async fn setstat(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        apply_path_attrs(&self.resolve(&path), &attrs)
            .await
            .map_err(io_status)?;
        Ok(ok(id))
    }

    async fn fsetstat(
        &mut self,
        id: u32,
        handle: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let (file, _) = self.file_mut(&handle)?;
        if let Some(size) = attrs.size {
            file.set_len(size).await.map_err(io_status)?;
        }
        if let Some(mode) = attrs.permissions {
            file.set_permissions(std::fs::Permissions::from_mode(mode & 0o7777))
                .await
                .map_err(io_status)?;
        }
        if let Some(times) = file_times(&attrs) {
            let std_file = file.try_clone().await.map_err(io_status)?.into_std().await;
            set_times(std_file, times).await.map_err(io_status)?;
        }
        Ok(ok(id))
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        let entries = list_dir(&self.resolve(&path)).await.map_err(io_status)?;
        let handle = self.insert(OpenHandle::Dir {
            entries: entries.into_iter(),
        });
        Ok(Handle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        match self.handles.get_mut(&handle) {
            Some(OpenHandle::Dir { entries }) => {
                let files: Vec<File> = entries.by_ref().take(READDIR_BATCH).collect();
                if files.is_empty() {
                    return Err(StatusCode::Eof);
                }
                Ok(Name { id, files })
            }
            _ => Err(StatusCode::Failure),
        }
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        fs::remove_file(self.resolve(&filename))
            .await
            .map_err(io_status)?;
        Ok(ok(id))
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let path = self.resolve(&path);
        fs::create_dir(&path).await.map_err(io_status)?;
        if let Some(mode) = attrs.permissions {
            fs::set_permissions(&path, std::fs::Permissions::from_mode(mode & 0o7777))
                .await
                .map_err(io_status)?;
        }
        Ok(ok(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        fs::remove_dir(self.resolve(&path)).await.map_err(io_status)?;
        Ok(ok(id))
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let resolved = normalize(&self.resolve(&path));
        Ok(Name {
            id,
            files: vec![File::new(
                resolved.to_string_lossy().into_owned(),
                FileAttributes::default(),
            )],
        })
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let meta = fs::metadata(self.resolve(&path)).await.map_err(io_status)?;
        Ok(Attrs {
            id,
            attrs: attrs_of(&meta),
        })
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        let from = self.resolve(&oldpath);
        let to = self.resolve(&newpath);
        // v3 rename never overwrites.
        if fs::symlink_metadata(&to).await.is_ok() {
            return Err(StatusCode::Failure);
        }
        fs::rename(&from, &to).await.map_err(io_status)?;
        Ok(ok(id))
    }

    async fn readlink(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let target = fs::read_link(self.resolve(&path))
            .await
            .map_err(io_status)?;
        Ok(Name {
            id,
            files: vec![File::new(
                target.to_string_lossy().into_owned(),
                FileAttributes::default(),
            )],
        })
    }

    async fn symlink(
        &mut self,
        id: u32,
        linkpath: String,
        targetpath: String,
    ) -> Result<Status, Self::Error> {
        // OpenSSH clients send the two paths in reverse draft order: the
        // first field is the link target, the second the link to create.
        let target = PathBuf::from(linkpath);
        let link = self.resolve(&targetpath);
        fs::symlink(&target, &link).await.map_err(io_status)?;
        Ok(ok(id))
    }
}
