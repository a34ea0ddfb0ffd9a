//! Streaming dump reader.
//!
//! Splits a (possibly compressed) newline-delimited JSON dump into raw
//! records, tagging each with its decompressed byte offset. Multi-member
//! gzip and multi-stream bzip2 files are decoded one member at a time; every
//! member start is a [`FrameMark`] where decompression can restart, so a
//! resume seeks to the nearest mark instead of re-reading from byte zero.

use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};

use bzip2::bufread::BzDecoder;
use camino::Utf8Path;
use flate2::bufread::GzDecoder;
use serde::{Deserialize, Serialize};

use crate::error::MirrorError;

pub const DEFAULT_MAX_RECORD_BYTES: usize = 64 * 1024 * 1024;
const READ_BUFFER_BYTES: usize = 256 * 1024;

/// Compression frame boundary: decompression can restart at
/// `compressed_offset` and yields data from `decompressed_offset` onward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameMark {
    pub compressed_offset: u64,
    pub decompressed_offset: u64,
}

/// Where to (re)start reading a dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResumePoint {
    pub byte_offset: u64,
    pub frame: FrameMark,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Gzip,
    Bzip2,
    Plain,
}

impl Compression {
    pub fn detect(magic: &[u8]) -> Self {
        if magic.starts_with(&[0x1f, 0x8b]) {
            Compression::Gzip
        } else if magic.starts_with(b"BZh") {
            Compression::Bzip2
        } else {
            Compression::Plain
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// Decompressed offset of the first byte of the line.
    pub offset: u64,
    /// Decompressed offset just past the line terminator.
    pub end_offset: u64,
    /// Latest frame boundary at or before `end_offset`.
    pub frame: FrameMark,
    /// Line content without surrounding whitespace.
    pub bytes: Vec<u8>,
}

impl RawRecord {
    /// Resume point for the record following this one.
    pub fn next_resume_point(&self) -> ResumePoint {
        ResumePoint {
            byte_offset: self.end_offset,
            frame: self.frame,
        }
    }
}

pub struct DumpReader {
    input: BufReader<FrameReader>,
    compression: Compression,
    offset: u64,
    max_record_bytes: usize,
    line: Vec<u8>,
    finished: bool,
}

impl fmt::Debug for DumpReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DumpReader")
            .field("compression", &self.compression)
            .field("offset", &self.offset)
            .field("max_record_bytes", &self.max_record_bytes)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl DumpReader {
    pub fn open(path: &Utf8Path, resume: ResumePoint) -> Result<Self, MirrorError> {
        let mut file = File::open(path.as_std_path())
            .map_err(|err| MirrorError::Filesystem(format!("open dump {path}: {err}")))?;
        let file_len = file
            .metadata()
            .map_err(|err| MirrorError::Filesystem(format!("stat dump {path}: {err}")))?
            .len();

        let mut magic = [0u8; 3];
        let magic_len = read_prefix(&mut file, &mut magic)
            .map_err(|err| MirrorError::Filesystem(format!("read dump {path}: {err}")))?;
        let compression = Compression::detect(&magic[..magic_len]);

        let frame = match compression {
            Compression::Plain => {
                if resume.byte_offset > file_len {
                    return Err(MirrorError::CorruptDump {
                        offset: resume.byte_offset,
                        message: format!("resume offset lies beyond the end of the dump ({file_len} bytes)"),
                    });
                }
                FrameMark {
                    compressed_offset: resume.byte_offset,
                    decompressed_offset: resume.byte_offset,
                }
            }
            _ if resume.frame.decompressed_offset <= resume.byte_offset
                && resume.frame.compressed_offset <= file_len =>
            {
                resume.frame
            }
            _ => FrameMark::default(),
        };

        file.seek(SeekFrom::Start(frame.compressed_offset))
            .map_err(|err| MirrorError::Filesystem(format!("seek dump {path}: {err}")))?;
        let source = BufReader::with_capacity(
            READ_BUFFER_BYTES,
            CountingReader {
                inner: file,
                count: frame.compressed_offset,
            },
        );
        let frames = FrameReader::new(compression, source, frame);
        let mut input = BufReader::with_capacity(READ_BUFFER_BYTES, frames);

        let to_skip = resume.byte_offset - frame.decompressed_offset;
        if to_skip > 0 {
            tracing::debug!(
                compressed_offset = frame.compressed_offset,
                skip = to_skip,
                "skipping to resume offset"
            );
            let skipped = io::copy(&mut (&mut input).take(to_skip), &mut io::sink())
                .map_err(|err| stream_error(err, frame.decompressed_offset))?;
            if skipped < to_skip {
                return Err(MirrorError::CorruptDump {
                    offset: resume.byte_offset,
                    message: format!(
                        "resume offset lies beyond the end of the dump ({} bytes decompressed)",
                        frame.decompressed_offset + skipped
                    ),
                });
            }
        }

        Ok(Self {
            input,
            compression,
            offset: resume.byte_offset,
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
            line: Vec::new(),
            finished: false,
        })
    }

    pub fn with_max_record_bytes(mut self, max_record_bytes: usize) -> Self {
        self.max_record_bytes = max_record_bytes;
        self
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Decompressed offset of the next unread byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Approximate position in the compressed file (includes read-ahead).
    pub fn compressed_position(&self) -> Option<u64> {
        self.input.get_ref().compressed_position()
    }

    fn next_record(&mut self) -> Result<Option<RawRecord>, MirrorError> {
        loop {
            let start = self.offset;
            self.line.clear();
            let terminated = self.read_line(start)?;
            if self.line.is_empty() {
                return Ok(None);
            }

            let content = self.line.trim_ascii();
            if matches!(content, b"" | b"[" | b"]") {
                if terminated {
                    continue;
                }
                return Ok(None);
            }
            if !terminated {
                return Err(MirrorError::Format {
                    offset: start,
                    message: "unterminated record at end of dump".to_string(),
                });
            }

            let bytes = content.to_vec();
            let end_offset = self.offset;
            let frame = self.input.get_mut().frame_for(end_offset);
            return Ok(Some(RawRecord {
                offset: start,
                end_offset,
                frame,
                bytes,
            }));
        }
    }

    /// Append one line (terminator included) to `self.line`.
    /// Returns whether a newline terminated it.
    fn read_line(&mut self, start: u64) -> Result<bool, MirrorError> {
        loop {
            let available = match self.input.fill_buf() {
                Ok(available) => available,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(stream_error(err, self.offset)),
            };
            if available.is_empty() {
                return Ok(false);
            }
            let (len, found) = match available.iter().position(|&byte| byte == b'\n') {
                Some(index) => (index + 1, true),
                None => (available.len(), false),
            };
            if self.line.len() + len > self.max_record_bytes {
                return Err(MirrorError::Format {
                    offset: start,
                    message: format!("record exceeds {} bytes", self.max_record_bytes),
                });
            }
            self.line.extend_from_slice(&available[..len]);
            self.input.consume(len);
            self.offset += len as u64;
            if found {
                return Ok(true);
            }
        }
    }
}

impl Iterator for DumpReader {
    type Item = Result<RawRecord, MirrorError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

/// Size of the compressed dump, used to tie a checkpoint to its file.
pub fn dump_len(path: &Utf8Path) -> Result<u64, MirrorError> {
    std::fs::metadata(path.as_std_path())
        .map(|meta| meta.len())
        .map_err(|err| MirrorError::Filesystem(format!("stat dump {path}: {err}")))
}

fn read_prefix(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

fn stream_error(err: io::Error, offset: u64) -> MirrorError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::InvalidData
        | io::ErrorKind::InvalidInput
        | io::ErrorKind::Other => MirrorError::CorruptDump {
            offset,
            message: err.to_string(),
        },
        _ => MirrorError::Filesystem(format!("read dump at offset {offset}: {err}")),
    }
}

struct CountingReader {
    inner: File,
    count: u64,
}

impl Read for CountingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

type Source = BufReader<CountingReader>;

fn source_position(source: &Source) -> u64 {
    source.get_ref().count - source.buffer().len() as u64
}

enum Frame {
    Gzip(GzDecoder<Source>),
    Bzip2(BzDecoder<Source>),
    Plain(Source),
}

impl Frame {
    fn open(compression: Compression, source: Source) -> Self {
        match compression {
            Compression::Gzip => Frame::Gzip(GzDecoder::new(source)),
            Compression::Bzip2 => Frame::Bzip2(BzDecoder::new(source)),
            Compression::Plain => Frame::Plain(source),
        }
    }

    fn source(&self) -> &Source {
        match self {
            Frame::Gzip(decoder) => decoder.get_ref(),
            Frame::Bzip2(decoder) => decoder.get_ref(),
            Frame::Plain(source) => source,
        }
    }

    fn into_source(self) -> Source {
        match self {
            Frame::Gzip(decoder) => decoder.into_inner(),
            Frame::Bzip2(decoder) => decoder.into_inner(),
            Frame::Plain(source) => source,
        }
    }
}

impl Read for Frame {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Frame::Gzip(decoder) => decoder.read(buf),
            Frame::Bzip2(decoder) => decoder.read(buf),
            Frame::Plain(source) => source.read(buf),
        }
    }
}

/// Decompresses member after member, recording where each one starts.
struct FrameReader {
    compression: Compression,
    frame: Option<Frame>,
    decompressed: u64,
    marks: VecDeque<FrameMark>,
}

impl FrameReader {
    fn new(compression: Compression, source: Source, start: FrameMark) -> Self {
        Self {
            compression,
            frame: Some(Frame::open(compression, source)),
            decompressed: start.decompressed_offset,
            marks: VecDeque::from([start]),
        }
    }

    fn compressed_position(&self) -> Option<u64> {
        self.frame.as_ref().map(|frame| source_position(frame.source()))
    }

    /// Latest known mark at or before `offset`; older marks are dropped.
    fn frame_for(&mut self, offset: u64) -> FrameMark {
        while self.marks.len() > 1 && self.marks[1].decompressed_offset <= offset {
            self.marks.pop_front();
        }
        self.marks.front().copied().unwrap_or_default()
    }
}

impl Read for FrameReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let Some(frame) = self.frame.as_mut() else {
                return Ok(0);
            };
            let n = frame.read(buf)?;
            if n > 0 {
                self.decompressed += n as u64;
                return Ok(n);
            }

            let Some(frame) = self.frame.take() else {
                return Ok(0);
            };
            if self.compression == Compression::Plain {
                return Ok(0);
            }
            let mut source = frame.into_source();
            if source.fill_buf()?.is_empty() {
                return Ok(0);
            }
            let mark = FrameMark {
                compressed_offset: source_position(&source),
                decompressed_offset: self.decompressed,
            };
            tracing::trace!(?mark, "compression frame boundary");
            self.marks.push_back(mark);
            self.frame = Some(Frame::open(self.compression, source));
        }
    }
}
