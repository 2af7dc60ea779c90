//! A followed log file: read position, identity signature and decoding.
//!
//! Only complete lines are handed out. A line still being written (no
//! newline yet) stays unread until its terminator arrives, so a multi-byte
//! character split at the end of the file never reaches the decoder.

use super::SeekPolicy;
use crate::datedetector::DateDetector;
use crate::error::SourceError;
use encoding_rs::{Encoding, UTF_16BE, UTF_16LE};
use sha2::{Digest, Sha256};
use std::fs::{self, File, Metadata};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Upper bound of bytes read per call; a longer line extends the read.
pub const READ_CHUNK: usize = 1 << 20;

/// Bytes inspected at the end of a file when seeking to its tail.
const TAIL_WINDOW: u64 = 64 * 1024;

/// Longest first line used for the rewrite digest.
const HEAD_LIMIT: u64 = 64 * 1024;

/// Identity and state of a file as seen by `stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Signature {
    dev: u64,
    ino: u64,
    size: u64,
    mtime: i64,
    mtime_nsec: i64,
}

impl Signature {
    fn of(meta: &Metadata) -> Self {
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
            size: meta.size(),
            mtime: meta.mtime(),
            mtime_nsec: meta.mtime_nsec(),
        }
    }

    fn same_file(&self, other: &Signature) -> bool {
        self.dev == other.dev && self.ino == other.ino
    }
}

#[derive(Debug)]
pub struct FileContainer {
    path: PathBuf,
    pos: u64,
    signature: Option<Signature>,
    /// SHA-256 of the first complete line.
    head: Option<[u8; 32]>,
    /// Encoding announced by a byte order mark.
    bom_encoding: Option<&'static Encoding>,
    more: bool,
}

impl FileContainer {
    /// Open `path` and place the read position according to `seek`.
    ///
    /// `SeekPolicy::Time` needs the filter's date detector to read the
    /// timestamps of the lines it samples.
    pub fn open(
        path: impl Into<PathBuf>,
        seek: SeekPolicy,
        encoding: &'static Encoding,
        detector: &mut DateDetector,
    ) -> Result<Self, SourceError> {
        let path = path.into();
        let mut file = File::open(&path).map_err(|source| SourceError::Unavailable {
            path: path.clone(),
            source,
        })?;
        let meta = file.metadata().map_err(|source| io_error(&path, source))?;
        let head = read_head(&mut file).map_err(|source| io_error(&path, source))?;

        let mut container = Self {
            path,
            pos: 0,
            signature: None,
            head,
            bom_encoding: None,
            more: false,
        };
        container.sniff_bom(&mut file)?;
        let encoding = container.bom_encoding.unwrap_or(encoding);

        container.pos = match seek {
            SeekPolicy::Head => container.pos,
            SeekPolicy::Tail => {
                tail_position(&mut file, meta.size(), encoding).map_err(|e| io_error(&container.path, e))?
            }
            SeekPolicy::Time(t) => container.time_position(t, encoding, detector)?,
        };
        // Skip the unchanged check on the first read; the file may already
        // hold lines past the seek position.
        container.more = true;
        debug!(path = %container.path.display(), pos = container.pos, "Opened log file");
        Ok(container)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset of the next unread line.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Whether the last read stopped before the end of the file.
    pub fn has_more(&self) -> bool {
        self.more
    }

    /// Read the complete lines appended since the last call.
    ///
    /// A file that shrank, was replaced, or was rewritten in place is read
    /// again from the start.
    pub fn read_lines(&mut self, encoding: &'static Encoding) -> Result<Vec<String>, SourceError> {
        let meta = fs::metadata(&self.path).map_err(|source| SourceError::Unavailable {
            path: self.path.clone(),
            source,
        })?;
        let sig = Signature::of(&meta);
        if !self.more && self.signature == Some(sig) {
            return Ok(Vec::new());
        }

        let mut file = File::open(&self.path).map_err(|source| SourceError::Unavailable {
            path: self.path.clone(),
            source,
        })?;
        let head = read_head(&mut file).map_err(|e| io_error(&self.path, e))?;

        let replaced = self.signature.is_some_and(|old| !old.same_file(&sig));
        let rewritten = matches!((self.head, head), (Some(old), Some(new)) if old != new);
        if replaced || rewritten || sig.size < self.pos {
            info!(path = %self.path.display(), "Log rotation detected");
            self.pos = 0;
            self.bom_encoding = None;
        }
        if self.head.is_none() || self.pos == 0 {
            self.head = head;
        }
        if self.pos == 0 {
            self.sniff_bom(&mut file)?;
        }
        let encoding = self.bom_encoding.unwrap_or(encoding);

        file.seek(SeekFrom::Start(self.pos)).map_err(|e| io_error(&self.path, e))?;
        let buf = read_chunk(&mut file, encoding).map_err(|e| io_error(&self.path, e))?;
        let lines = split_lines(&buf, encoding);
        let consumed: usize = lines.iter().map(|l| l.len()).sum();

        let decoded = lines
            .iter()
            .map(|raw| decode_line(raw, encoding, &self.path))
            .collect();
        self.pos += consumed as u64;
        self.more = buf.len() >= READ_CHUNK && consumed > 0;
        self.signature = Some(sig);
        Ok(decoded)
    }

    fn sniff_bom(&mut self, file: &mut File) -> Result<(), SourceError> {
        let mut bom = [0u8; 3];
        let n = read_up_to(file, &mut bom).map_err(|e| io_error(&self.path, e))?;
        if let Some((enc, len)) = Encoding::for_bom(&bom[..n]) {
            self.bom_encoding = Some(enc);
            if self.pos < len as u64 {
                self.pos = len as u64;
            }
        }
        Ok(())
    }

    /// Offset of the first line dated at or after `t`.
    ///
    /// Binary search over the line starts of the file. Lines without a
    /// timestamp take the time of the next dated line.
    fn time_position(
        &self,
        t: f64,
        encoding: &'static Encoding,
        detector: &mut DateDetector,
    ) -> Result<u64, SourceError> {
        let data = fs::read(&self.path).map_err(|e| io_error(&self.path, e))?;
        let skip = Encoding::for_bom(&data).map_or(0, |(_, len)| len);
        let lines = split_lines(&data[skip..], encoding);

        let mut starts = Vec::with_capacity(lines.len() + 1);
        let mut offset = skip;
        for line in &lines {
            starts.push(offset);
            offset += line.len();
        }
        starts.push(offset);

        let mut lo = 0;
        let mut hi = lines.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let dated = (mid..hi).find_map(|i| {
                let text = decode_line(lines[i], encoding, &self.path);
                detector.match_time(&text).map(|m| (i, m.time))
            });
            match dated {
                Some((i, time)) if time < t => lo = i + 1,
                _ => hi = mid,
            }
        }
        Ok(starts[lo] as u64)
    }
}

fn io_error(path: &Path, source: io::Error) -> SourceError {
    SourceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Newline code unit for encodings where `\n` is not a single byte.
fn newline_unit(encoding: &'static Encoding) -> Option<[u8; 2]> {
    if encoding == UTF_16LE {
        Some([0x0A, 0x00])
    } else if encoding == UTF_16BE {
        Some([0x00, 0x0A])
    } else {
        None
    }
}

/// Split `buf` into complete lines, each keeping its terminator.
/// Trailing bytes without a terminator are left out.
pub fn split_lines<'a>(buf: &'a [u8], encoding: &'static Encoding) -> Vec<&'a [u8]> {
    let mut lines = Vec::new();
    let mut start = 0;
    match newline_unit(encoding) {
        Some(unit) => {
            let mut i = 0;
            while i + 1 < buf.len() {
                if buf[i..i + 2] == unit {
                    lines.push(&buf[start..i + 2]);
                    start = i + 2;
                }
                i += 2;
            }
        }
        None => {
            for (i, b) in buf.iter().enumerate() {
                if *b == b'\n' {
                    lines.push(&buf[start..=i]);
                    start = i + 1;
                }
            }
        }
    }
    lines
}

fn read_chunk(file: &mut File, encoding: &'static Encoding) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    loop {
        let before = buf.len();
        let read = file.by_ref().take(READ_CHUNK as u64).read_to_end(&mut buf)?;
        if read < READ_CHUNK || !split_lines(&buf[..], encoding).is_empty() || buf.len() == before {
            return Ok(buf);
        }
    }
}

/// Digest of the first line, if it is complete.
fn read_head(file: &mut File) -> io::Result<Option<[u8; 32]>> {
    file.seek(SeekFrom::Start(0))?;
    let mut buf = Vec::new();
    file.by_ref().take(HEAD_LIMIT).read_to_end(&mut buf)?;
    file.seek(SeekFrom::Start(0))?;
    Ok(buf
        .iter()
        .position(|b| *b == b'\n')
        .map(|end| Sha256::digest(&buf[..=end]).into()))
}

/// Offset just past the last complete line.
fn tail_position(file: &mut File, size: u64, encoding: &'static Encoding) -> io::Result<u64> {
    let start = size.saturating_sub(TAIL_WINDOW);
    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::new();
    file.by_ref().take(TAIL_WINDOW).read_to_end(&mut buf)?;
    // Keep UTF-16 samples unit aligned.
    let skew = if newline_unit(encoding).is_some() { (start % 2) as usize } else { 0 };
    let sample = buf.get(skew..).unwrap_or_default();
    let complete: usize = split_lines(sample, encoding).iter().map(|l| l.len()).sum();
    if complete == 0 && start > 0 {
        return Ok(size);
    }
    Ok(start + (skew + complete) as u64)
}

/// Decode one raw line, dropping its terminator.
///
/// Invalid sequences are logged together with the offending excerpt and
/// replaced; the line is still returned.
pub fn decode_line(raw: &[u8], encoding: &'static Encoding, path: &Path) -> String {
    let text = match encoding.decode_without_bom_handling_and_without_replacement(raw) {
        Some(text) => text.into_owned(),
        None => {
            let (text, _) = encoding.decode_without_bom_handling(raw);
            let err = SourceError::Decode {
                path: path.to_path_buf(),
                encoding: encoding.name().to_string(),
            };
            warn!(error = %err, "Error decoding line");
            warn!(
                "Consider setting logencoding to appropriate encoding for this jail. \
                 Continuing to process line ignoring invalid characters: {:?}",
                text.trim_end_matches(['\r', '\n'])
            );
            text.into_owned()
        }
    };
    match text.strip_suffix('\n') {
        Some(stripped) => stripped.strip_suffix('\r').unwrap_or(stripped).to_string(),
        None => text,
    }
}
