//! Canonical directory-to-byte-stream codec and the wire primitives shared
//! with the export envelope.
//!
//! The serialisation is deterministic: directory entries are emitted in name
//! order, only the executable bit of the mode survives, and timestamps are
//! not represented at all. Content hashes of store paths are hashes of this
//! stream, so two trees that canonicalise identically always hash
//! identically.
//!
//! Wire framing: integers are 8-byte fields carrying a little-endian u32;
//! byte strings are length-prefixed and zero-padded to 8 bytes.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

use sha2::{Digest, Sha256};

use strata_error::{Result, StrataError};
use strata_types::Sha256Hash;

/// Leading magic string of every archive.
pub const ARCHIVE_MAGIC: &str = "strata-archive-1";

fn bad(detail: impl Into<String>) -> StrataError {
    StrataError::BadArchive {
        detail: detail.into(),
    }
}

// ---------------------------------------------------------------------------
// Wire primitives
// ---------------------------------------------------------------------------

/// Write a u32 as an 8-byte little-endian field.
pub fn write_u32<W: Write>(w: &mut W, n: u32) -> Result<()> {
    let mut buf = [0u8; 8];
    buf[..4].copy_from_slice(&n.to_le_bytes());
    w.write_all(&buf)?;
    Ok(())
}

/// Read a u32 from an 8-byte little-endian field.
pub fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf[..4].try_into().expect("4 bytes")))
}

fn padding(len: usize) -> usize {
    (8 - len % 8) % 8
}

/// Write a length-prefixed byte string, zero-padded to 8 bytes.
pub fn write_bytes<W: Write>(w: &mut W, bytes: &[u8]) -> Result<()> {
    let len = u32::try_from(bytes.len()).map_err(|_| bad("byte string exceeds 4 GiB"))?;
    write_u32(w, len)?;
    w.write_all(bytes)?;
    w.write_all(&[0u8; 8][..padding(bytes.len())])?;
    Ok(())
}

/// Read a length-prefixed byte string.
pub fn read_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let len = read_u32(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    let mut pad = [0u8; 8];
    r.read_exact(&mut pad[..padding(len)])?;
    Ok(buf)
}

pub fn write_string<W: Write>(w: &mut W, s: &str) -> Result<()> {
    write_bytes(w, s.as_bytes())
}

pub fn read_string<R: Read>(r: &mut R) -> Result<String> {
    String::from_utf8(read_bytes(r)?).map_err(|_| bad("non-UTF-8 string field"))
}

/// Write a counted sequence of strings.
pub fn write_string_set<W: Write, S: AsRef<str>>(w: &mut W, strings: &[S]) -> Result<()> {
    let len = u32::try_from(strings.len()).map_err(|_| bad("string set too large"))?;
    write_u32(w, len)?;
    for s in strings {
        write_string(w, s.as_ref())?;
    }
    Ok(())
}

pub fn read_string_set<R: Read>(r: &mut R) -> Result<Vec<String>> {
    let len = read_u32(r)? as usize;
    let mut out = Vec::with_capacity(len.min(1024));
    for _ in 0..len {
        out.push(read_string(r)?);
    }
    Ok(out)
}

fn expect<R: Read>(r: &mut R, token: &str) -> Result<()> {
    let got = read_string(r)?;
    if got == token {
        Ok(())
    } else {
        Err(bad(format!("expected `{token}`, got `{got}`")))
    }
}

// ---------------------------------------------------------------------------
// Hashing adapters
// ---------------------------------------------------------------------------

/// Writer that also feeds a SHA-256 hasher while `hashing` is on. The export
/// envelope disables hashing before appending the signature region.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    pub hashing: bool,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            hashing: true,
        }
    }

    /// Digest of everything written while hashing was on.
    pub fn current_hash(&self) -> Sha256Hash {
        Sha256Hash::from_bytes(self.hasher.clone().finalize().into())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        if self.hashing {
            self.hasher.update(&buf[..n]);
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reader that feeds a SHA-256 hasher while `hashing` is on.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    pub hashing: bool,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            hashing: true,
        }
    }

    /// Digest of everything read while hashing was on.
    pub fn current_hash(&self) -> Sha256Hash {
        Sha256Hash::from_bytes(self.hasher.clone().finalize().into())
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if self.hashing {
            self.hasher.update(&buf[..n]);
        }
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// Dump
// ---------------------------------------------------------------------------

/// Serialise the filesystem object at `path` into `w`.
pub fn dump_path<W: Write>(path: &Path, w: &mut W) -> Result<()> {
    write_string(w, ARCHIVE_MAGIC)?;
    dump_node(path, w)
}

fn dump_node<W: Write>(path: &Path, w: &mut W) -> Result<()> {
    let meta = fs::symlink_metadata(path).map_err(|e| StrataError::io_at(e, path))?;
    let ft = meta.file_type();
    write_string(w, "(")?;
    write_string(w, "type")?;

    if ft.is_file() {
        write_string(w, "regular")?;
        #[cfg(unix)]
        let executable = {
            use std::os::unix::fs::PermissionsExt;
            meta.permissions().mode() & 0o100 != 0
        };
        #[cfg(not(unix))]
        let executable = false;
        if executable {
            write_string(w, "executable")?;
            write_string(w, "")?;
        }
        write_string(w, "contents")?;
        let len = u32::try_from(meta.len()).map_err(|_| bad("file exceeds 4 GiB"))?;
        write_u32(w, len)?;
        let mut f = File::open(path).map_err(|e| StrataError::io_at(e, path))?;
        let copied = io::copy(&mut f, w)?;
        if copied != u64::from(len) {
            return Err(bad(format!(
                "file `{}` changed size while dumping",
                path.display()
            )));
        }
        w.write_all(&[0u8; 8][..padding(len as usize)])?;
    } else if ft.is_symlink() {
        write_string(w, "symlink")?;
        write_string(w, "target")?;
        let target = fs::read_link(path).map_err(|e| StrataError::io_at(e, path))?;
        write_string(w, &target.to_string_lossy())?;
    } else if ft.is_dir() {
        write_string(w, "directory")?;
        let mut names: Vec<String> = Vec::new();
        for entry in fs::read_dir(path).map_err(|e| StrataError::io_at(e, path))? {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        for name in names {
            write_string(w, "entry")?;
            write_string(w, "(")?;
            write_string(w, "name")?;
            write_string(w, &name)?;
            write_string(w, "node")?;
            dump_node(&path.join(&name), w)?;
            write_string(w, ")")?;
        }
    } else {
        return Err(bad(format!(
            "`{}` has an unsupported file type",
            path.display()
        )));
    }

    write_string(w, ")")
}

/// Serialise `path` into a byte buffer.
pub fn dump_to_vec(path: &Path) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    dump_path(path, &mut out)?;
    Ok(out)
}

/// Content hash of `path`: SHA-256 over its canonical serialisation.
pub fn hash_path(path: &Path) -> Result<Sha256Hash> {
    let mut sink = HashingWriter::new(io::sink());
    dump_path(path, &mut sink)?;
    Ok(sink.current_hash())
}

/// Flat SHA-256 of a single file's bytes (fixed-output, non-recursive).
pub fn hash_file(path: &Path) -> Result<Sha256Hash> {
    let mut f = File::open(path).map_err(|e| StrataError::io_at(e, path))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Sha256Hash::from_bytes(hasher.finalize().into()))
}

// ---------------------------------------------------------------------------
// Restore
// ---------------------------------------------------------------------------

/// Materialise the archive read from `r` at `dst`, which must not exist.
pub fn restore_path<R: Read>(dst: &Path, r: &mut R) -> Result<()> {
    let magic = read_string(r)?;
    if magic != ARCHIVE_MAGIC {
        return Err(bad(format!("unrecognised archive magic `{magic}`")));
    }
    restore_node(dst, r)
}

fn restore_node<R: Read>(path: &Path, r: &mut R) -> Result<()> {
    expect(r, "(")?;
    expect(r, "type")?;
    match read_string(r)?.as_str() {
        "regular" => {
            let mut token = read_string(r)?;
            let mut executable = false;
            if token == "executable" {
                expect(r, "")?;
                executable = true;
                token = read_string(r)?;
            }
            if token != "contents" {
                return Err(bad(format!("expected `contents`, got `{token}`")));
            }
            let len = read_u32(r)? as usize;
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .map_err(|e| StrataError::io_at(e, path))?;
            let copied = io::copy(&mut r.by_ref().take(len as u64), &mut file)?;
            if copied != len as u64 {
                return Err(bad("archive truncated inside file contents"));
            }
            let mut pad = [0u8; 8];
            r.read_exact(&mut pad[..padding(len)])?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mode = if executable { 0o755 } else { 0o644 };
                fs::set_permissions(path, fs::Permissions::from_mode(mode))
                    .map_err(|e| StrataError::io_at(e, path))?;
            }
            expect(r, ")")
        }
        "symlink" => {
            expect(r, "target")?;
            let target = read_string(r)?;
            #[cfg(not(unix))]
            {
                let _ = target;
                return Err(bad("symlinks are not supported on this platform"));
            }
            #[cfg(unix)]
            {
                std::os::unix::fs::symlink(&target, path)
                    .map_err(|e| StrataError::io_at(e, path))?;
                expect(r, ")")
            }
        }
        "directory" => {
            fs::create_dir(path).map_err(|e| StrataError::io_at(e, path))?;
            loop {
                match read_string(r)?.as_str() {
                    ")" => return Ok(()),
                    "entry" => {
                        expect(r, "(")?;
                        expect(r, "name")?;
                        let name = read_string(r)?;
                        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
                            return Err(bad(format!("invalid entry name `{name}`")));
                        }
                        expect(r, "node")?;
                        restore_node(&path.join(&name), r)?;
                        expect(r, ")")?;
                    }
                    other => return Err(bad(format!("expected `entry`, got `{other}`"))),
                }
            }
        }
        other => Err(bad(format!("unknown node type `{other}`"))),
    }
}

/// Copy a filesystem object by dumping and restoring it. Intended for the
/// small trees ingestion deals with; the whole serialisation is buffered.
pub fn copy_path(src: &Path, dst: &Path) -> Result<()> {
    let buf = dump_to_vec(src)?;
    restore_path(dst, &mut buf.as_slice())
}
