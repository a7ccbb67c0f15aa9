use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use tephra_error::{ErrorCodes, TephraError};
use tephra_types::PostingClusters;
use thiserror::Error;

use crate::format::{encode_clusters, write_header, SegmentFieldFiles};
use crate::varint::{write_vint, write_vlong};

#[derive(Debug, Error)]
pub enum CodecWriteError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TephraError for CodecWriteError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::Internal
    }
}

/// Write-side CRC accumulator: hashes and counts every byte on its way to the
/// underlying writer so trailers can record offset and checksum without a
/// second pass.
struct CountingCrcWriter<W: Write> {
    inner: W,
    hasher: crc32fast::Hasher,
    written: u64,
}

impl<W: Write> CountingCrcWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: crc32fast::Hasher::new(),
            written: 0,
        }
    }

    fn finalize(self) -> (W, u32, u64) {
        (self.inner, self.hasher.finalize(), self.written)
    }
}

impl<W: Write> Write for CountingCrcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

struct TermEntry {
    term: Box<[u8]>,
    offset: u64,
}

/// Two-phase writer for one (segment, field) pair: posting records stream to
/// the `.sp` blob as terms arrive, then `finish` emits the `.st` dictionary
/// with the recorded offsets. Dropping an unfinished writer removes both
/// files so a failed build never leaves partial segments behind.
pub struct SparsePostingsWriter {
    files: SegmentFieldFiles,
    postings: Option<CountingCrcWriter<BufWriter<File>>>,
    terms: Vec<TermEntry>,
    field_number: u32,
    finished: bool,
}

impl SparsePostingsWriter {
    pub fn create(
        directory: &Path,
        segment: &str,
        suffix: &str,
        field_number: u32,
    ) -> Result<Self, CodecWriteError> {
        let files = SegmentFieldFiles::resolve(directory, segment, suffix);
        let file = File::create(&files.postings)?;
        let mut postings = CountingCrcWriter::new(BufWriter::new(file));
        write_header(&mut postings)?;
        Ok(Self {
            files,
            postings: Some(postings),
            terms: Vec::new(),
            field_number,
            finished: false,
        })
    }

    /// Appends one term's clusters to the postings blob and records its
    /// offset for the dictionary. Terms must be distinct; order is preserved.
    pub fn write_term(
        &mut self,
        term: &[u8],
        clusters: &PostingClusters,
    ) -> Result<(), CodecWriteError> {
        let postings = self.postings.as_mut().expect("writer still open");
        let offset = postings.written;
        encode_clusters(postings, clusters)?;
        self.terms.push(TermEntry {
            term: term.into(),
            offset,
        });
        Ok(())
    }

    pub fn term_count(&self) -> usize {
        self.terms.len()
    }

    /// Seals both files: postings CRC footer first, then the terms dictionary
    /// with its directory offset and footer.
    pub fn finish(mut self) -> Result<SegmentFieldFiles, CodecWriteError> {
        match self.finish_inner() {
            Ok(()) => {
                self.finished = true;
                Ok(self.files.clone())
            }
            Err(error) => Err(error),
        }
    }

    fn finish_inner(&mut self) -> Result<(), CodecWriteError> {
        let postings = self.postings.take().expect("writer still open");
        let (mut file, checksum, written) = postings.finalize();
        file.write_all(&checksum.to_le_bytes())?;
        let file = file.into_inner().map_err(|error| error.into_error())?;
        file.sync_all()?;
        tracing::debug!(
            postings = %self.files.postings.display(),
            bytes = written,
            terms = self.terms.len(),
            "sealed postings blob"
        );

        // The dictionary is small; assemble it in memory and write once.
        let mut bytes = Vec::new();
        write_header(&mut bytes)?;
        let directory_offset = bytes.len() as u64;
        write_vint(&mut bytes, self.field_number)?;
        write_vlong(&mut bytes, self.terms.len() as u64)?;
        for entry in &self.terms {
            write_vint(&mut bytes, entry.term.len() as u32)?;
            bytes.extend_from_slice(&entry.term);
            write_vlong(&mut bytes, entry.offset)?;
        }
        bytes.extend_from_slice(&directory_offset.to_le_bytes());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes);
        bytes.extend_from_slice(&hasher.finalize().to_le_bytes());

        let mut terms_file = File::create(&self.files.terms)?;
        terms_file.write_all(&bytes)?;
        terms_file.sync_all()?;
        Ok(())
    }

    /// Removes any partially written files. Also runs implicitly on drop.
    pub fn abort(mut self) {
        self.cleanup();
        self.finished = true;
    }

    fn cleanup(&mut self) {
        self.postings = None;
        let _ = std::fs::remove_file(&self.files.postings);
        let _ = std::fs::remove_file(&self.files.terms);
    }
}

impl Drop for SparsePostingsWriter {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(
                terms = %self.files.terms.display(),
                "removing partial segment files on abort"
            );
            self.cleanup();
        }
    }
}
