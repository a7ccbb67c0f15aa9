use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tephra_error::{ErrorCodes, TephraError};
use tephra_types::PostingClusters;
use thiserror::Error;

use crate::format::{
    decode_clusters, read_header, HeaderCheck, SegmentFieldFiles, POSTINGS_TRAILER_LEN,
    TERMS_TRAILER_LEN,
};
use crate::varint::{read_vint, read_vlong};

#[derive(Debug, Error)]
pub enum CorruptIndexError {
    #[error("{file}: bad magic bytes")]
    BadMagic { file: PathBuf },
    #[error("{file}: codec name mismatch")]
    BadCodecName { file: PathBuf },
    #[error("{file}: checksum mismatch, footer {footer:#010x} computed {computed:#010x}")]
    ChecksumMismatch {
        file: PathBuf,
        footer: u32,
        computed: u32,
    },
    #[error("{file}: truncated or malformed")]
    Truncated { file: PathBuf },
}

#[derive(Debug, Error)]
pub enum CodecReadError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Corrupt(#[from] CorruptIndexError),
    #[error("{file}: unsupported format version {version}")]
    UnsupportedVersion { file: PathBuf, version: u32 },
}

impl TephraError for CodecReadError {
    fn code(&self) -> ErrorCodes {
        match self {
            CodecReadError::Io(_) => ErrorCodes::Internal,
            CodecReadError::Corrupt(_) => ErrorCodes::DataLoss,
            CodecReadError::UnsupportedVersion { .. } => ErrorCodes::VersionMismatch,
        }
    }
}

fn check_header(file: &Path, check: HeaderCheck) -> Result<(), CodecReadError> {
    match check {
        HeaderCheck::Ok => Ok(()),
        HeaderCheck::BadMagic => Err(CorruptIndexError::BadMagic {
            file: file.to_path_buf(),
        }
        .into()),
        HeaderCheck::BadCodecName => Err(CorruptIndexError::BadCodecName {
            file: file.to_path_buf(),
        }
        .into()),
        HeaderCheck::UnsupportedVersion(version) => Err(CodecReadError::UnsupportedVersion {
            file: file.to_path_buf(),
            version,
        }),
    }
}

/// Streams a whole file through CRC32, comparing against its 4-byte footer.
fn verify_footer(path: &Path) -> Result<(), CodecReadError> {
    let mut file = File::open(path)?;
    let length = file.metadata()?.len();
    if length < POSTINGS_TRAILER_LEN {
        return Err(CorruptIndexError::Truncated {
            file: path.to_path_buf(),
        }
        .into());
    }
    let mut hasher = crc32fast::Hasher::new();
    let mut remaining = length - POSTINGS_TRAILER_LEN;
    let mut buffer = [0u8; 64 << 10];
    while remaining > 0 {
        let chunk = remaining.min(buffer.len() as u64) as usize;
        file.read_exact(&mut buffer[..chunk])?;
        hasher.update(&buffer[..chunk]);
        remaining -= chunk as u64;
    }
    let mut footer = [0u8; 4];
    file.read_exact(&mut footer)?;
    let footer = u32::from_le_bytes(footer);
    let computed = hasher.finalize();
    if footer != computed {
        return Err(CorruptIndexError::ChecksumMismatch {
            file: path.to_path_buf(),
            footer,
            computed,
        }
        .into());
    }
    Ok(())
}

/// Read side of one (segment, field) pair. The term dictionary is decoded
/// eagerly on open (it is small); posting records are decoded lazily per
/// term so cluster materialization can stay behind the memory budget. Both
/// file footers are CRC-verified before any record is trusted.
#[derive(Debug)]
pub struct SparsePostingsReader {
    files: SegmentFieldFiles,
    field_number: u32,
    terms: HashMap<Box<[u8]>, u64>,
    postings: Mutex<File>,
}

impl SparsePostingsReader {
    pub fn open(directory: &Path, segment: &str, suffix: &str) -> Result<Self, CodecReadError> {
        let files = SegmentFieldFiles::resolve(directory, segment, suffix);

        verify_footer(&files.postings)?;
        let mut postings = File::open(&files.postings)?;
        let mut postings_header = BufReader::new(&mut postings);
        check_header(&files.postings, read_header(&mut postings_header)?)?;

        let bytes = std::fs::read(&files.terms)?;
        let parsed = Self::parse_terms(&files.terms, &bytes)?;

        tracing::debug!(
            terms = %files.terms.display(),
            term_count = parsed.1.len(),
            "opened sparse postings reader"
        );
        Ok(Self {
            files,
            field_number: parsed.0,
            terms: parsed.1,
            postings: Mutex::new(postings),
        })
    }

    fn parse_terms(
        path: &Path,
        bytes: &[u8],
    ) -> Result<(u32, HashMap<Box<[u8]>, u64>), CodecReadError> {
        let truncated = || CorruptIndexError::Truncated {
            file: path.to_path_buf(),
        };
        if (bytes.len() as u64) < TERMS_TRAILER_LEN {
            return Err(truncated().into());
        }
        let body_end = bytes.len() - TERMS_TRAILER_LEN as usize;
        let footer = u32::from_le_bytes(bytes[bytes.len() - 4..].try_into().expect("4 bytes"));
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes[..bytes.len() - 4]);
        let computed = hasher.finalize();
        if footer != computed {
            return Err(CorruptIndexError::ChecksumMismatch {
                file: path.to_path_buf(),
                footer,
                computed,
            }
            .into());
        }

        let mut cursor = &bytes[..body_end];
        check_header(path, read_header(&mut cursor)?)?;
        let directory_offset =
            u64::from_le_bytes(bytes[body_end..body_end + 8].try_into().expect("8 bytes"));
        if directory_offset > body_end as u64 {
            return Err(truncated().into());
        }
        let mut cursor = &bytes[directory_offset as usize..body_end];

        let field_number = read_vint(&mut cursor)?;
        let num_terms = read_vlong(&mut cursor)?;
        let mut terms = HashMap::with_capacity(num_terms.min(1 << 24) as usize);
        for _ in 0..num_terms {
            let term_len = read_vint(&mut cursor)? as usize;
            if cursor.len() < term_len {
                return Err(truncated().into());
            }
            let term: Box<[u8]> = cursor[..term_len].into();
            cursor = &cursor[term_len..];
            let offset = read_vlong(&mut cursor)?;
            terms.insert(term, offset);
        }
        if !cursor.is_empty() {
            return Err(truncated().into());
        }
        Ok((field_number, terms))
    }

    pub fn files(&self) -> &SegmentFieldFiles {
        &self.files
    }

    pub fn field_number(&self) -> u32 {
        self.field_number
    }

    pub fn term_count(&self) -> usize {
        self.terms.len()
    }

    pub fn has_term(&self, term: &[u8]) -> bool {
        self.terms.contains_key(term)
    }

    /// Terms present in the dictionary, in no particular order.
    pub fn terms(&self) -> impl Iterator<Item = &[u8]> {
        self.terms.keys().map(AsRef::as_ref)
    }

    /// Decodes the clusters for one term, or `None` when the term is absent
    /// from this segment.
    pub fn read_term(&self, term: &[u8]) -> Result<Option<PostingClusters>, CodecReadError> {
        let Some(&offset) = self.terms.get(term) else {
            return Ok(None);
        };
        let mut file = self.postings.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut reader = BufReader::new(&mut *file);
        let clusters = decode_clusters(&mut reader)?;
        Ok(Some(clusters))
    }

    /// Bulk decode in offset order, for warm loads. The callback sees each
    /// term exactly once.
    pub fn read_all_terms(
        &self,
        mut callback: impl FnMut(&[u8], PostingClusters),
    ) -> Result<(), CodecReadError> {
        let mut ordered: Vec<(&[u8], u64)> = self
            .terms
            .iter()
            .map(|(term, &offset)| (term.as_ref(), offset))
            .collect();
        ordered.sort_by_key(|entry| entry.1);
        for (term, offset) in ordered {
            let mut file = self.postings.lock();
            file.seek(SeekFrom::Start(offset))?;
            let mut reader = BufReader::new(&mut *file);
            let clusters = decode_clusters(&mut reader)?;
            drop(file);
            callback(term, clusters);
        }
        Ok(())
    }
}
