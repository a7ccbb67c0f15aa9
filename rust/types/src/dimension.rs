use tephra_error::{ErrorCodes, TephraError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DimensionDecodeError {
    #[error("term is not valid utf-8")]
    NotUtf8,
    #[error("term does not parse as a dimension id")]
    NotNumeric,
}

impl TephraError for DimensionDecodeError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::InvalidArgument
    }
}

/// Canonical term bytes for a sparse dimension id: the ASCII decimal form,
/// matching how the host's field mapper tokenizes sparse features.
pub fn encode_dimension(dimension_id: u32) -> Box<[u8]> {
    dimension_id.to_string().into_bytes().into_boxed_slice()
}

pub fn decode_dimension(term: &[u8]) -> Result<u32, DimensionDecodeError> {
    let text = std::str::from_utf8(term).map_err(|_| DimensionDecodeError::NotUtf8)?;
    text.parse().map_err(|_| DimensionDecodeError::NotNumeric)
}
