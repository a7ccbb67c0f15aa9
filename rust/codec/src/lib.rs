mod format;
mod reader;
mod varint;
mod writer;

pub use format::*;
pub use reader::*;
pub use varint::*;
pub use writer::*;
