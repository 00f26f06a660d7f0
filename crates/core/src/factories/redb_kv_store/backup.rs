//! Backup file format.
//!
//! ```text
//! magic[8] kind[1] since[8 BE] max[8 BE]
//! ( op[1] klen[4 BE] key [vlen[4 BE] value] )*
//! ```
//!
//! Files are named by unix seconds and written as `<name>.tmp` first.

use heart_api::*;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 8] = b"HRTBKP01";
const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

/// Full or incremental.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum BackupKind {
    Full = 0,
    Incremental = 1,
}

/// Backup file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Header {
    pub kind: BackupKind,
    pub since: u64,
    pub max: u64,
}

/// One backed-up mutation.
#[derive(Debug, PartialEq)]
pub(super) enum Record {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

fn corrupt(path: &Path, what: &str) -> HeartError {
    HeartError::kind(
        ErrorKind::CorruptStore,
        format!("backup {}: {what}", path.display()),
    )
}

/// Existing backups, sorted by name. In-flight `.tmp` files are skipped.
pub(super) fn list(dir: &Path) -> HeartResult<Vec<(u64, PathBuf)>> {
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(out)
        }
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Ok(ts) = name.parse::<u64>() {
            out.push((ts, entry.path()));
        }
    }
    out.sort();
    Ok(out)
}

/// Remove leftovers of interrupted backups.
pub(super) fn remove_tmp(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "tmp") {
            if let Err(err) = std::fs::remove_file(&path) {
                tracing::warn!(?err, path = %path.display(), "remove tmp backup");
            }
        }
    }
}

/// Unix seconds name for the next backup, strictly after `last`.
pub(super) fn next_name(last: Option<u64>) -> u64 {
    let now = Timestamp::now().as_unix_secs().max(0) as u64;
    match last {
        Some(last) if last >= now => last + 1,
        _ => now,
    }
}

/// Streaming writer of one backup file.
pub(super) struct Writer {
    out: std::io::BufWriter<std::fs::File>,
    tmp: PathBuf,
    dst: PathBuf,
    count: usize,
}

impl Writer {
    pub fn create(dir: &Path, name: u64, header: Header) -> HeartResult<Self> {
        let dst = dir.join(name.to_string());
        let tmp = dir.join(format!("{name}.tmp"));
        let mut out = std::io::BufWriter::new(std::fs::File::create(&tmp)?);
        out.write_all(MAGIC)?;
        out.write_all(&[header.kind as u8])?;
        out.write_all(&header.since.to_be_bytes())?;
        out.write_all(&header.max.to_be_bytes())?;
        Ok(Self {
            out,
            tmp,
            dst,
            count: 0,
        })
    }

    fn write_bytes(&mut self, b: &[u8]) -> HeartResult<()> {
        let len = u32::try_from(b.len())
            .map_err(|_| HeartError::other("backup entry too large"))?;
        self.out.write_all(&len.to_be_bytes())?;
        self.out.write_all(b)?;
        Ok(())
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> HeartResult<()> {
        self.out.write_all(&[OP_PUT])?;
        self.write_bytes(key)?;
        self.write_bytes(value)?;
        self.count += 1;
        Ok(())
    }

    pub fn delete(&mut self, key: &[u8]) -> HeartResult<()> {
        self.out.write_all(&[OP_DELETE])?;
        self.write_bytes(key)?;
        self.count += 1;
        Ok(())
    }

    /// Fsync and move the file into place. Returns the final path and the
    /// number of records written.
    pub fn finish(self) -> HeartResult<(PathBuf, usize)> {
        let file = self
            .out
            .into_inner()
            .map_err(|e| HeartError::from(e.into_error()))?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&self.tmp, &self.dst)?;
        Ok((self.dst, self.count))
    }
}

fn read_exact_or(
    r: &mut impl Read,
    buf: &mut [u8],
    path: &Path,
    what: &str,
) -> HeartResult<()> {
    r.read_exact(buf).map_err(|_| corrupt(path, what))
}

fn read_bytes(r: &mut impl Read, path: &Path) -> HeartResult<Vec<u8>> {
    let mut len = [0; 4];
    read_exact_or(r, &mut len, path, "truncated length")?;
    let mut out = vec![0; u32::from_be_bytes(len) as usize];
    read_exact_or(r, &mut out, path, "truncated entry")?;
    Ok(out)
}

/// Feed every record of the file at `path` to `f`.
pub(super) fn replay(
    path: &Path,
    mut f: impl FnMut(&Header, Record) -> HeartResult<()>,
) -> HeartResult<Header> {
    let mut r = std::io::BufReader::new(std::fs::File::open(path)?);

    let mut magic = [0; 8];
    read_exact_or(&mut r, &mut magic, path, "truncated header")?;
    if &magic != MAGIC {
        return Err(corrupt(path, "bad magic"));
    }
    let mut head = [0; 17];
    read_exact_or(&mut r, &mut head, path, "truncated header")?;
    let kind = match head[0] {
        0 => BackupKind::Full,
        1 => BackupKind::Incremental,
        _ => return Err(corrupt(path, "bad kind")),
    };
    let mut since = [0; 8];
    since.copy_from_slice(&head[1..9]);
    let mut max = [0; 8];
    max.copy_from_slice(&head[9..17]);
    let header = Header {
        kind,
        since: u64::from_be_bytes(since),
        max: u64::from_be_bytes(max),
    };

    loop {
        let mut op = [0; 1];
        if r.read(&mut op)? == 0 {
            break;
        }
        match op[0] {
            OP_PUT => {
                let key = read_bytes(&mut r, path)?;
                let value = read_bytes(&mut r, path)?;
                f(&header, Record::Put(key, value))?;
            }
            OP_DELETE => {
                let key = read_bytes(&mut r, path)?;
                f(&header, Record::Delete(key))?;
            }
            _ => return Err(corrupt(path, "bad op")),
        }
    }

    Ok(header)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn write_and_replay() {
        let tmp = tempfile::tempdir().unwrap();
        let header = Header {
            kind: BackupKind::Incremental,
            since: 3,
            max: 9,
        };
        let mut w = Writer::create(tmp.path(), 100, header).unwrap();
        w.put(b"a", b"1").unwrap();
        w.delete(b"b").unwrap();
        let (path, count) = w.finish().unwrap();
        assert_eq!(2, count);
        assert_eq!(vec![(100, path.clone())], list(tmp.path()).unwrap());

        let mut got = Vec::new();
        let read = replay(&path, |h, r| {
            assert_eq!(9, h.max);
            got.push(r);
            Ok(())
        })
        .unwrap();
        assert_eq!(header, read);
        assert_eq!(
            vec![Record::Put(b"a".to_vec(), b"1".to_vec()), Record::Delete(b"b".to_vec())],
            got
        );
    }

    #[test]
    fn truncated_file_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("1");
        std::fs::write(&path, b"HRTBKP01\x01").unwrap();
        let err = replay(&path, |_, _| Ok(())).unwrap_err();
        assert!(err.is(ErrorKind::CorruptStore));
    }

    #[test]
    fn names_strictly_increase() {
        let now = next_name(None);
        assert_eq!(now + 1, next_name(Some(now)));
        assert_eq!(now + 6, next_name(Some(now + 5)));
    }
}
