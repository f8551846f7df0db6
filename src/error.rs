//! Error types and utilities.

use std::error::Error as StdError;
use std::fmt;

/// The result of a relocation operation.
pub type Result<T> = ::std::result::Result<T, Error>;

/// A representation of all possible errors.
#[derive(Debug)]
pub enum Error {
  /// The source does not contain valid machine code.
  InvalidCode,
  /// The source buffer ended in the middle of an instruction.
  TruncatedCode,
  /// The relocated code grew beyond what the translation map can index, or
  /// the destination buffer is exhausted.
  CapacityExceeded,
  /// A rewritten displacement does not fit within its field width.
  DisplacementOverflow,
  /// The translation map has no entry for an instruction offset.
  UnmappedInstruction,
  /// The code contains an instruction that cannot be relocated.
  UnsupportedInstruction,
}

impl StdError for Error {}

impl fmt::Display for Error {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Error::InvalidCode => write!(f, "Source contains invalid assembly"),
      Error::TruncatedCode => write!(f, "Source buffer ends mid-instruction"),
      Error::CapacityExceeded => write!(f, "Relocated code exceeds the translation capacity"),
      Error::DisplacementOverflow => write!(f, "Displacement does not fit its field width"),
      Error::UnmappedInstruction => write!(f, "Instruction offset is missing from the translation map"),
      Error::UnsupportedInstruction => write!(f, "Source contains an unsupported instruction"),
    }
  }
}
