//! The underlying decoder should be opaque to the outside.

use crate::error::{Error, Result};
use cfg_if::cfg_if;
use zydis::{InstructionAttributes, Mnemonic};

cfg_if! {
  if #[cfg(target_arch = "x86")] {
    fn decoder() -> zydis::Decoder {
      zydis::Decoder::new32()
    }
  } else {
    // The engine analyzes 64-bit code everywhere else; non-x86 hosts can
    // still run it against byte buffers.
    fn decoder() -> zydis::Decoder {
      zydis::Decoder::new64()
    }
  }
}

/// Returns true if relocation runs in 64-bit machine mode.
const fn is_long_mode() -> bool {
  !cfg!(target_arch = "x86")
}

/// A x86/x64 decoder fixed to the compiled-in machine mode.
pub(crate) struct Disassembler(zydis::Decoder);

impl Disassembler {
  /// Creates a decoder for the compiled-in machine mode.
  pub fn new() -> Disassembler {
    Disassembler(decoder())
  }

  /// Decodes the instruction at the start of `buffer`.
  pub fn decode(&self, buffer: &[u8]) -> Result<Instruction> {
    match self.0.decode_first::<zydis::VisibleOperands>(buffer) {
      Ok(Some(instruction)) => Ok(Instruction(instruction)),
      Ok(None) | Err(zydis::Status::NoMoreData) => Err(Error::TruncatedCode),
      Err(_) => Err(Error::InvalidCode),
    }
  }
}

/// The position of a relative field inside an instruction's encoding.
#[derive(Clone, Copy)]
pub struct RelativeField {
  /// Byte offset of the field, relative to the start of the instruction.
  pub offset: usize,
  /// Physical size of the field, in bits.
  pub size: u8,
}

/// The wide form of a branch that can be enlarged to a 32-bit displacement.
pub(crate) enum NearBranch {
  /// `E9 rel32`
  Jmp,
  /// `0F xx rel32`
  Jcc(u8),
}

/// Safe wrapper around a decoded instruction.
pub struct Instruction(zydis::Instruction<zydis::VisibleOperands>);

impl Instruction {
  /// Returns the size of the instruction in bytes.
  pub fn len(&self) -> usize {
    usize::from(self.0.length)
  }

  /// Returns true if the instruction refers to its target through an offset
  /// relative to the instruction pointer.
  pub fn is_relative(&self) -> bool {
    self.0.attributes.contains(InstructionAttributes::IS_RELATIVE)
  }

  /// Returns true if the instruction is a relative branch the relocator
  /// knows how to rewrite.
  ///
  /// `call rel32` is not part of this set: a relocated call would return
  /// into the chunk, which the relocator does not preserve.
  pub fn is_relative_branch(&self) -> bool {
    if !self.0.raw.imm[0].is_relative {
      return false;
    }

    match self.0.mnemonic {
      Mnemonic::JMP
      | Mnemonic::JO
      | Mnemonic::JNO
      | Mnemonic::JB
      | Mnemonic::JNB
      | Mnemonic::JZ
      | Mnemonic::JNZ
      | Mnemonic::JBE
      | Mnemonic::JNBE
      | Mnemonic::JS
      | Mnemonic::JNS
      | Mnemonic::JP
      | Mnemonic::JNP
      | Mnemonic::JL
      | Mnemonic::JNL
      | Mnemonic::JLE
      | Mnemonic::JNLE
      | Mnemonic::JCXZ
      | Mnemonic::JECXZ
      | Mnemonic::JRCXZ
      | Mnemonic::LOOP
      | Mnemonic::LOOPE
      | Mnemonic::LOOPNE => true,
      _ => false,
    }
  }

  /// Returns true if the instruction addresses memory relative to the
  /// instruction pointer.
  ///
  /// In 32-bit mode `mod == 0, rm == 5` selects an absolute 32-bit address
  /// instead, which survives a move unchanged and needs no rewriting.
  pub fn is_relative_memory(&self) -> bool {
    is_long_mode()
      && self.0.attributes.contains(InstructionAttributes::HAS_MODRM)
      && self.0.raw.modrm.mod_ == 0
      && self.0.raw.modrm.rm == 5
  }

  /// Returns true if the branch only exists with an 8-bit displacement.
  pub fn is_short_form_only(&self) -> bool {
    match self.0.mnemonic {
      Mnemonic::JCXZ
      | Mnemonic::JECXZ
      | Mnemonic::JRCXZ
      | Mnemonic::LOOP
      | Mnemonic::LOOPE
      | Mnemonic::LOOPNE => true,
      _ => false,
    }
  }

  /// Returns the wide-form opcode for an enlargeable branch.
  pub(crate) fn near_branch(&self) -> Option<NearBranch> {
    match self.0.mnemonic {
      Mnemonic::JMP => Some(NearBranch::Jmp),
      Mnemonic::JO => Some(NearBranch::Jcc(0x80)),
      Mnemonic::JNO => Some(NearBranch::Jcc(0x81)),
      Mnemonic::JB => Some(NearBranch::Jcc(0x82)),
      Mnemonic::JNB => Some(NearBranch::Jcc(0x83)),
      Mnemonic::JZ => Some(NearBranch::Jcc(0x84)),
      Mnemonic::JNZ => Some(NearBranch::Jcc(0x85)),
      Mnemonic::JBE => Some(NearBranch::Jcc(0x86)),
      Mnemonic::JNBE => Some(NearBranch::Jcc(0x87)),
      Mnemonic::JS => Some(NearBranch::Jcc(0x88)),
      Mnemonic::JNS => Some(NearBranch::Jcc(0x89)),
      Mnemonic::JP => Some(NearBranch::Jcc(0x8A)),
      Mnemonic::JNP => Some(NearBranch::Jcc(0x8B)),
      Mnemonic::JL => Some(NearBranch::Jcc(0x8C)),
      Mnemonic::JNL => Some(NearBranch::Jcc(0x8D)),
      Mnemonic::JLE => Some(NearBranch::Jcc(0x8E)),
      Mnemonic::JNLE => Some(NearBranch::Jcc(0x8F)),
      _ => None,
    }
  }

  /// Returns the position of the first immediate within the encoding.
  pub fn immediate(&self) -> RelativeField {
    RelativeField {
      offset: usize::from(self.0.raw.imm[0].offset),
      size: self.0.raw.imm[0].size,
    }
  }

  /// Returns the position of the displacement within the encoding.
  pub fn displacement(&self) -> RelativeField {
    RelativeField {
      offset: usize::from(self.0.raw.disp.offset),
      size: self.0.raw.disp.size,
    }
  }

  /// Returns the field the instruction's relative target is encoded in: the
  /// immediate for branches, the displacement for memory operands.
  pub fn relative_field(&self) -> Result<RelativeField> {
    if self.is_relative_branch() {
      Ok(self.immediate())
    } else if self.is_relative_memory() {
      Ok(self.displacement())
    } else {
      Err(Error::UnsupportedInstruction)
    }
  }

  /// Calculates the absolute target address of the relative operand for an
  /// instruction residing at `address`.
  pub fn absolute_target_address(&self, address: u64) -> u64 {
    let relative = if self.0.raw.imm[0].is_relative {
      self.0.raw.imm[0].value as i64
    } else {
      self.0.raw.disp.value
    };

    address
      .wrapping_add(self.len() as u64)
      .wrapping_add(relative as u64)
  }
}

#[cfg(test)]
#[cfg(target_arch = "x86_64")]
mod tests {
  use super::*;

  fn decode(bytes: &[u8]) -> Instruction {
    Disassembler::new().decode(bytes).unwrap()
  }

  #[test]
  fn classifies_branches() {
    assert!(decode(&[0xEB, 0x10]).is_relative_branch());
    assert!(decode(&[0x74, 0x02]).is_relative_branch());
    assert!(decode(&[0xE3, 0x20]).is_relative_branch());
    assert!(!decode(&[0x90]).is_relative_branch());
    // call rel32 is relative, but not a branch the relocator rewrites
    let call = decode(&[0xE8, 0x00, 0x00, 0x00, 0x00]);
    assert!(call.is_relative());
    assert!(!call.is_relative_branch());
    assert!(!call.is_relative_memory());
  }

  #[test]
  fn classifies_rip_relative_memory() {
    let load = decode(&[0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00]);
    assert!(load.is_relative());
    assert!(load.is_relative_memory());
    assert!(!load.is_relative_branch());

    let direct = decode(&[0x48, 0x89, 0xE5]);
    assert!(!direct.is_relative());
    assert!(!direct.is_relative_memory());
  }

  #[test]
  fn short_form_only_branches() {
    assert!(decode(&[0xE3, 0x20]).is_short_form_only());
    assert!(decode(&[0xE2, 0x10]).is_short_form_only());
    assert!(!decode(&[0xEB, 0x10]).is_short_form_only());
    assert!(!decode(&[0x74, 0x02]).is_short_form_only());
  }

  #[test]
  fn resolves_absolute_targets() {
    // jmp short +0x10 from 0x1000 lands at 0x1012
    assert_eq!(decode(&[0xEB, 0x10]).absolute_target_address(0x1000), 0x1012);
    // backwards: jmp short -2 (jmp $) from 0x1000
    assert_eq!(decode(&[0xEB, 0xFE]).absolute_target_address(0x1000), 0x1000);
    // mov rax, [rip + 0x10] from 0x1000 reads 0x1017
    let load = decode(&[0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00]);
    assert_eq!(load.absolute_target_address(0x1000), 0x1017);
  }

  #[test]
  fn relative_field_positions() {
    let jz = decode(&[0x74, 0x02]);
    let field = jz.relative_field().unwrap();
    assert_eq!((field.offset, field.size), (1, 8));

    let jz_near = decode(&[0x0F, 0x84, 0x10, 0x00, 0x00, 0x00]);
    let field = jz_near.relative_field().unwrap();
    assert_eq!((field.offset, field.size), (2, 32));

    let load = decode(&[0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00]);
    let field = load.relative_field().unwrap();
    assert_eq!((field.offset, field.size), (3, 32));
  }
}
