//! Per-file tailing state
//!
//! One [`TailedFile`] per file in the tailed set: an open handle, a byte
//! offset, the sniffed encoding, and the buffered partial line. Lines are
//! extracted in file order; the unterminated tail stays buffered until a
//! terminator arrives or the file is closed or rotated.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use logship_common::encoding::{LineDecoder, DETECTION_SAMPLE_LEN};
use logship_common::{MonitorResult, TextEncoding};

use crate::fswatch::file_id;

const READ_CHUNK: usize = 8 * 1024;

/// Where to start reading a newly opened file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Existing content is not replayed; used for files already present when
    /// the monitor starts.
    End,
    /// Used for files that appear while the monitor is running, and after a
    /// rotation.
    Beginning,
}

pub struct TailedFile {
    path: PathBuf,
    file: File,
    offset: u64,
    /// Sniffed lazily: a file opened while still empty keeps its encoding
    /// undecided until the first bytes arrive.
    decoder: Option<LineDecoder>,
    buffer: Vec<u8>,
    id: Option<(u64, u64)>,
}

impl TailedFile {
    pub fn open(path: &Path, position: StartPosition) -> MonitorResult<TailedFile> {
        let mut file = File::open(path)?;
        let metadata = file.metadata()?;

        let mut sample = Vec::with_capacity(DETECTION_SAMPLE_LEN.min(metadata.len() as usize));
        (&mut file)
            .take(DETECTION_SAMPLE_LEN as u64)
            .read_to_end(&mut sample)?;

        let decoder = if sample.is_empty() {
            None
        } else {
            Some(LineDecoder::new(TextEncoding::detect(&sample)))
        };

        let offset = match position {
            StartPosition::End => metadata.len(),
            StartPosition::Beginning => decoder
                .map(|d| d.encoding().bom_len(&sample) as u64)
                .unwrap_or(0),
        };
        file.seek(SeekFrom::Start(offset))?;

        Ok(TailedFile {
            path: path.to_path_buf(),
            file,
            offset,
            decoder,
            buffer: Vec::new(),
            id: file_id(&metadata),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn file_id(&self) -> Option<(u64, u64)> {
        self.id
    }

    pub fn encoding(&self) -> Option<TextEncoding> {
        self.decoder.map(|d| d.encoding())
    }

    /// Re-points this state at a new path after the file was renamed; the
    /// handle, offset, encoding, and partial buffer all carry over.
    pub fn renamed_to(&mut self, path: &Path) {
        self.path = path.to_path_buf();
    }

    /// True when the file under this path is no longer the one being tailed:
    /// its size dropped below the read offset, or the identity under the
    /// name changed.
    pub fn is_rotated(&self) -> bool {
        match std::fs::metadata(&self.path) {
            Ok(metadata) => {
                if metadata.len() < self.offset {
                    return true;
                }
                match (self.id, file_id(&metadata)) {
                    (Some(old), Some(new)) => old != new,
                    _ => false,
                }
            }
            // Deleted under the same name; the reconcile pass handles the
            // removal, not the rotation path.
            Err(_) => false,
        }
    }

    /// Reads newly appended bytes and returns every complete line.
    pub fn drain_lines(&mut self) -> MonitorResult<Vec<String>> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let read = self.file.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            self.buffer.extend_from_slice(&chunk[..read]);
            self.offset += read as u64;
        }

        if self.buffer.is_empty() {
            return Ok(Vec::new());
        }
        let decoder = self.decoder_for_buffer();
        Ok(decoder.drain_lines(&mut self.buffer))
    }

    /// Emits the residual partial line, if any; called when the file leaves
    /// the tailed set or rotates.
    pub fn flush_partial(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let decoder = self.decoder_for_buffer();
        decoder.flush(&mut self.buffer)
    }

    fn decoder_for_buffer(&mut self) -> LineDecoder {
        match self.decoder {
            Some(decoder) => decoder,
            None => {
                let encoding = TextEncoding::detect(&self.buffer);
                let bom = encoding.bom_len(&self.buffer);
                if bom > 0 {
                    self.buffer.drain(..bom);
                }
                let decoder = LineDecoder::new(encoding);
                self.decoder = Some(decoder);
                decoder
            }
        }
    }
}
