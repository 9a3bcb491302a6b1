//! # File system runtime
//!
//! File I/O host functions for the engine module, rooted at a host directory.
//! The module names files by numeric id; the host keeps the open handles.
//! Paths are relative to the root and may not leave it.

use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::one::RefMut;
use tracing::warn;
use wasmtime::Val;
use wasmtime::ValType;

use crate::host::Error;
use crate::host::Result;
use crate::runtime::RuntimeFunctionTable;
use crate::runtime::param_f64;
use crate::runtime::param_i32;
use crate::runtime::read_guest;
use crate::runtime::write_guest;

/// Open flags understood by `duckdb_web_fs_file_open`.
pub mod flags {
    pub const READ: i32 = 1 << 0;
    pub const WRITE: i32 = 1 << 1;
    pub const CREATE: i32 = 1 << 2;
    pub const TRUNCATE: i32 = 1 << 3;
}

/// Host files served to the module.
#[derive(Clone, Debug)]
pub struct FileSystem {
    root: PathBuf,
    files: Arc<DashMap<u32, File>>,
}

impl FileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: Arc::new(DashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a module path onto the host, rejecting anything but plain
    /// relative components.
    ///
    /// Symlinks are followed before the check, so a link inside the root
    /// that points outside of it is rejected too. A path that does not exist
    /// yet is checked through its parent directory.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let plain = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if path.is_empty() || !plain {
            return Err(Error::Path(path.to_owned()));
        }

        let root = self.root.canonicalize()?;
        let joined = self.root.join(relative);
        let host_path = match joined.canonicalize() {
            Ok(host_path) => host_path,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // A dangling symlink would be followed by a create.
                if joined.symlink_metadata().is_ok() {
                    return Err(Error::Path(path.to_owned()));
                }
                match (joined.parent(), joined.file_name()) {
                    (Some(parent), Some(name)) => parent.canonicalize()?.join(name),
                    _ => return Err(Error::Path(path.to_owned())),
                }
            }
            Err(e) => return Err(e.into()),
        };
        if !host_path.starts_with(&root) {
            return Err(Error::Path(path.to_owned()));
        }
        Ok(host_path)
    }

    /// Opens `path` under `id` and returns its current size.
    pub fn open(&self, id: u32, path: &str, open_flags: i32) -> Result<u64> {
        let host_path = self.resolve(path)?;
        let file = OpenOptions::new()
            .read(open_flags & flags::READ != 0)
            .write(open_flags & (flags::WRITE | flags::TRUNCATE) != 0)
            .create(open_flags & flags::CREATE != 0)
            .truncate(open_flags & flags::TRUNCATE != 0)
            .open(&host_path)?;
        let size = file.metadata()?.len();
        self.files.insert(id, file);
        Ok(size)
    }

    fn file(&self, id: u32) -> Result<RefMut<'_, u32, File>> {
        self.files.get_mut(&id).ok_or(Error::UnknownFile(id))
    }

    /// Reads up to `buf.len()` bytes at `offset`. Short only at end of file.
    pub fn read_at(&self, id: u32, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut file = self.file(id)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            let n = file.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    /// Reads up to `len` bytes at `offset`. The buffer is sized by what the
    /// file holds past `offset`, not by `len`.
    pub fn read_chunk(&self, id: u32, len: usize, offset: u64) -> Result<Vec<u8>> {
        let available = self.size(id)?.saturating_sub(offset);
        let len = len.min(usize::try_from(available).unwrap_or(usize::MAX));
        let mut buf = vec![0u8; len];
        let n = self.read_at(id, &mut buf, offset)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn write_at(&self, id: u32, data: &[u8], offset: u64) -> Result<usize> {
        let mut file = self.file(id)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(data.len())
    }

    pub fn size(&self, id: u32) -> Result<u64> {
        Ok(self.file(id)?.metadata()?.len())
    }

    pub fn truncate(&self, id: u32, size: u64) -> Result<()> {
        self.file(id)?.set_len(size)?;
        Ok(())
    }

    pub fn sync(&self, id: u32) -> Result<()> {
        self.file(id)?.sync_all()?;
        Ok(())
    }

    pub fn close(&self, id: u32) -> Result<()> {
        self.files.remove(&id).ok_or(Error::UnknownFile(id))?;
        Ok(())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.is_file()).unwrap_or(false)
    }

    pub fn open_files(&self) -> usize {
        self.files.len()
    }

    /// Runtime functions exposing this file system to the module.
    ///
    /// Failures are reported to the module as `-1` and logged; they never trap.
    pub fn functions(&self) -> RuntimeFunctionTable {
        use ValType::F64;
        use ValType::I32;

        let mut table = RuntimeFunctionTable::new();

        let fs = self.clone();
        table.define(
            "duckdb_web_fs_file_open",
            [I32, I32, I32, I32],
            [F64],
            move |mut caller, params, results| {
                let id = param_i32(params, 0)? as u32;
                let path = read_guest(&mut caller, param_i32(params, 1)? as u32, param_i32(params, 2)? as u32)?;
                let path = String::from_utf8_lossy(&path);
                let size = fs
                    .open(id, &path, param_i32(params, 3)?)
                    .map(|size| size as f64)
                    .unwrap_or_else(|e| failed("open", id, e) as f64);
                results[0] = Val::F64(size.to_bits());
                Ok(())
            },
        );

        let fs = self.clone();
        table.define(
            "duckdb_web_fs_file_read",
            [I32, I32, I32, F64],
            [I32],
            move |mut caller, params, results| {
                let id = param_i32(params, 0)? as u32;
                let ptr = param_i32(params, 1)? as u32;
                let len = param_i32(params, 2)?.max(0) as usize;
                let offset = param_f64(params, 3)? as u64;
                let read = match fs.read_chunk(id, len, offset) {
                    Ok(chunk) => {
                        write_guest(&mut caller, ptr, &chunk)?;
                        chunk.len() as i32
                    }
                    Err(e) => failed("read", id, e),
                };
                results[0] = Val::I32(read);
                Ok(())
            },
        );

        let fs = self.clone();
        table.define(
            "duckdb_web_fs_file_write",
            [I32, I32, I32, F64],
            [I32],
            move |mut caller, params, results| {
                let id = param_i32(params, 0)? as u32;
                let data = read_guest(&mut caller, param_i32(params, 1)? as u32, param_i32(params, 2)? as u32)?;
                let offset = param_f64(params, 3)? as u64;
                let written = fs
                    .write_at(id, &data, offset)
                    .map(|n| n as i32)
                    .unwrap_or_else(|e| failed("write", id, e));
                results[0] = Val::I32(written);
                Ok(())
            },
        );

        let fs = self.clone();
        table.define("duckdb_web_fs_file_size", [I32], [F64], move |_, params, results| {
            let id = param_i32(params, 0)? as u32;
            let size = fs
                .size(id)
                .map(|size| size as f64)
                .unwrap_or_else(|e| failed("size", id, e) as f64);
            results[0] = Val::F64(size.to_bits());
            Ok(())
        });

        let fs = self.clone();
        table.define("duckdb_web_fs_file_truncate", [I32, F64], [I32], move |_, params, results| {
            let id = param_i32(params, 0)? as u32;
            let size = param_f64(params, 1)? as u64;
            results[0] = Val::I32(status(fs.truncate(id, size), "truncate", id));
            Ok(())
        });

        let fs = self.clone();
        table.define("duckdb_web_fs_file_sync", [I32], [I32], move |_, params, results| {
            let id = param_i32(params, 0)? as u32;
            results[0] = Val::I32(status(fs.sync(id), "sync", id));
            Ok(())
        });

        let fs = self.clone();
        table.define("duckdb_web_fs_file_close", [I32], [I32], move |_, params, results| {
            let id = param_i32(params, 0)? as u32;
            results[0] = Val::I32(status(fs.close(id), "close", id));
            Ok(())
        });

        let fs = self.clone();
        table.define(
            "duckdb_web_fs_file_exists",
            [I32, I32],
            [I32],
            move |mut caller, params, results| {
                let path = read_guest(&mut caller, param_i32(params, 0)? as u32, param_i32(params, 1)? as u32)?;
                let exists = fs.exists(&String::from_utf8_lossy(&path));
                results[0] = Val::I32(i32::from(exists));
                Ok(())
            },
        );

        table
    }
}

fn failed(op: &str, id: u32, e: Error) -> i32 {
    warn!(op, file = id, error = %e, "file operation failed");
    -1
}

fn status(result: Result<()>, op: &str, id: u32) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => failed(op, id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_root(name: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!("duckrun-fs-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn rejects_escaping_paths() {
        let root = scratch_root("escape");
        std::fs::create_dir_all(root.join("data")).unwrap();
        let fs = FileSystem::new(&root);
        assert!(matches!(fs.resolve("../etc/passwd"), Err(Error::Path(_))));
        assert!(matches!(fs.resolve("/etc/passwd"), Err(Error::Path(_))));
        assert!(matches!(fs.resolve(""), Err(Error::Path(_))));

        let resolved = fs.resolve("data/people.csv").unwrap();
        assert!(resolved.starts_with(root.canonicalize().unwrap()));
        assert!(resolved.ends_with("data/people.csv"));
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlinks_leaving_the_root() {
        use std::os::unix::fs::symlink;

        let root = scratch_root("symlink");
        let outside = scratch_root("symlink-outside");
        std::fs::write(outside.join("secret.txt"), "secret").unwrap();
        std::fs::write(root.join("inside.txt"), "inside").unwrap();
        for (link, target) in [
            ("out", outside.clone()),
            ("secret-link", outside.join("secret.txt")),
            ("dangling", outside.join("missing.txt")),
            ("inside-link", root.join("inside.txt")),
        ] {
            let _ = std::fs::remove_file(root.join(link));
            symlink(target, root.join(link)).unwrap();
        }
        let fs = FileSystem::new(&root);

        assert!(matches!(fs.resolve("out/secret.txt"), Err(Error::Path(_))));
        assert!(matches!(fs.resolve("out/new.txt"), Err(Error::Path(_))));
        assert!(matches!(fs.resolve("secret-link"), Err(Error::Path(_))));
        assert!(matches!(
            fs.open(1, "dangling", flags::WRITE | flags::CREATE),
            Err(Error::Path(_))
        ));
        assert!(!outside.join("missing.txt").exists());
        assert!(!fs.exists("out/secret.txt"));

        // Links that stay inside the root are fine.
        assert_eq!(fs.open(2, "inside-link", flags::READ).unwrap(), 6);
    }

    #[test]
    fn reads_are_bounded_by_file_size() {
        let fs = FileSystem::new(scratch_root("bounded"));
        fs.open(3, "small.bin", flags::READ | flags::WRITE | flags::CREATE | flags::TRUNCATE)
            .unwrap();
        fs.write_at(3, b"hello world", 0).unwrap();

        // A huge requested length does not size the buffer.
        assert_eq!(fs.read_chunk(3, i32::MAX as usize, 6).unwrap(), b"world".to_vec());
        assert!(fs.read_chunk(3, i32::MAX as usize, 64).unwrap().is_empty());
        assert_eq!(fs.read_chunk(3, 5, 0).unwrap(), b"hello".to_vec());
        assert!(matches!(fs.read_chunk(9, 16, 0), Err(Error::UnknownFile(9))));
    }

    #[test]
    fn positioned_io_round_trip() {
        let fs = FileSystem::new(scratch_root("io"));
        let size = fs
            .open(7, "table.bin", flags::READ | flags::WRITE | flags::CREATE | flags::TRUNCATE)
            .unwrap();
        assert_eq!(size, 0);

        assert_eq!(fs.write_at(7, b"hello world", 0).unwrap(), 11);
        assert_eq!(fs.write_at(7, b"W", 6).unwrap(), 1);
        assert_eq!(fs.size(7).unwrap(), 11);

        let mut buf = [0u8; 32];
        let n = fs.read_at(7, &mut buf, 6).unwrap();
        assert_eq!(&buf[..n], b"World");

        fs.truncate(7, 5).unwrap();
        assert_eq!(fs.size(7).unwrap(), 5);
        fs.sync(7).unwrap();

        assert!(fs.exists("table.bin"));
        fs.close(7).unwrap();
        assert_eq!(fs.open_files(), 0);
        assert!(matches!(fs.close(7), Err(Error::UnknownFile(7))));
    }

    #[test]
    fn function_table_covers_file_ops() {
        let table = FileSystem::new(scratch_root("table")).functions();
        for op in ["open", "read", "write", "size", "truncate", "sync", "close", "exists"] {
            let name = format!("duckdb_web_fs_file_{}", op);
            assert!(table.contains("env", &name), "missing {}", name);
        }
    }
}
