//! Static analysis of the source instruction stream.
//!
//! Analysis runs in two passes: a linear decode that resolves every relative
//! operand to an absolute target address, followed by a pass that connects
//! instructions targeting other instructions inside the analyzed chunk. The
//! resulting reference graph drives the relocator's decision whether an
//! offset must be rewritten immediately (external target) or compensated
//! after the fact (internal target).

use crate::disasm::{Disassembler, Instruction};
use crate::error::{Error, Result};
use log::debug;

/// One decoded source instruction, annotated with reference information.
pub struct AnalyzedInstruction {
  /// Byte offset of the instruction from the start of the source buffer.
  pub address_offset: usize,
  /// The absolute runtime address of the instruction.
  pub address: u64,
  /// The decoded instruction descriptor.
  pub instruction: Instruction,
  /// True if the instruction refers to a target through a relative offset.
  pub has_relative_target: bool,
  /// True if the target of the relative offset lies outside the chunk.
  pub has_external_target: bool,
  /// The absolute target address computed from the relative offset, or 0.
  pub absolute_target_address: u64,
  /// Indices of all instructions inside the chunk that target this one.
  pub incoming: Vec<u8>,
  /// Index of the instruction inside the chunk this one targets.
  pub outgoing: Option<u8>,
}

impl AnalyzedInstruction {
  /// Returns true if this instruction is targeted by at least one other
  /// instruction from inside the chunk.
  pub fn is_internal_target(&self) -> bool {
    !self.incoming.is_empty()
  }
}

/// The instructions covering an analyzed chunk of code.
pub struct AnalyzedCode {
  /// All analyzed instructions, in source order.
  pub instructions: Vec<AnalyzedInstruction>,
  /// The exact amount of bytes covered by the instructions.
  pub bytes_read: usize,
}

/// Analyzes at least `min_bytes` of the code in `buffer`, assumed to reside
/// at the runtime address `address`.
///
/// More bytes may be consumed on demand to keep the final instruction
/// intact. Fails with [`TruncatedCode`](Error::TruncatedCode) if the buffer
/// ends before `min_bytes` are covered, and with
/// [`CapacityExceeded`](Error::CapacityExceeded) if the chunk outgrows the
/// translation map's range.
pub fn analyze(buffer: &[u8], address: u64, min_bytes: usize) -> Result<AnalyzedCode> {
  let disassembler = Disassembler::new();
  let mut instructions = Vec::new();

  // First pass: decode the stream and resolve each relative operand to the
  // absolute address it refers to.
  let mut offset = 0;
  while offset < min_bytes {
    if offset > usize::from(u8::max_value()) {
      return Err(Error::CapacityExceeded);
    }

    let instruction = disassembler.decode(&buffer[offset..])?;
    let length = instruction.len();

    let has_relative_target = instruction.is_relative();
    let absolute_target_address = if has_relative_target {
      instruction.absolute_target_address(address.wrapping_add(offset as u64))
    } else {
      0
    };

    instructions.push(AnalyzedInstruction {
      address_offset: offset,
      address: address.wrapping_add(offset as u64),
      instruction,
      has_relative_target,
      // Cleared below if the target turns out to be inside the chunk.
      has_external_target: has_relative_target,
      absolute_target_address,
      incoming: Vec::new(),
      outgoing: None,
    });

    offset += length;
  }

  // Second pass: connect relative instructions to the instructions they
  // target inside the chunk. Addresses are unique, so at most one match
  // exists per instruction.
  let addresses: Vec<u64> = instructions.iter().map(|item| item.address).collect();
  for j in 0..instructions.len() {
    if !instructions[j].has_relative_target {
      continue;
    }

    let target = instructions[j].absolute_target_address;
    if let Some(i) = addresses.iter().position(|&candidate| candidate == target) {
      instructions[j].has_external_target = false;
      instructions[j].outgoing = Some(i as u8);
      instructions[i].incoming.push(j as u8);
    }
  }

  debug!(
    "analyzed {} instructions covering {} bytes at {:#x}",
    instructions.len(),
    offset,
    address
  );

  Ok(AnalyzedCode {
    instructions,
    bytes_read: offset,
  })
}

#[cfg(test)]
#[cfg(target_arch = "x86_64")]
mod tests {
  use super::*;
  use matches::assert_matches;

  #[test]
  fn covers_at_least_min_bytes() {
    // push rbp; mov rbp, rsp; sub rsp, 0x20
    let code = [0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x20];
    let analyzed = analyze(&code, 0x1000, 6).unwrap();

    assert_eq!(analyzed.bytes_read, 8);
    assert_eq!(analyzed.instructions.len(), 3);
    assert!(analyzed.instructions.iter().all(|item| !item.has_relative_target));
  }

  #[test]
  fn offsets_are_contiguous() {
    let code = [0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x20];
    let analyzed = analyze(&code, 0x1000, 8).unwrap();

    let mut expected = 0;
    for item in &analyzed.instructions {
      assert_eq!(item.address_offset, expected);
      assert_eq!(item.address, 0x1000 + expected as u64);
      expected += item.instruction.len();
    }
    assert_eq!(analyzed.bytes_read, expected);
  }

  #[test]
  fn resolves_internal_branches() {
    // jmp short over two nops to the ret
    let code = [0xEB, 0x02, 0x90, 0x90, 0xC3];
    let analyzed = analyze(&code, 0x1000, 5).unwrap();

    let jmp = &analyzed.instructions[0];
    assert!(jmp.has_relative_target);
    assert!(!jmp.has_external_target);
    assert_eq!(jmp.absolute_target_address, 0x1004);
    assert_eq!(jmp.outgoing, Some(3));

    let ret = &analyzed.instructions[3];
    assert!(ret.is_internal_target());
    assert_eq!(ret.incoming, vec![0]);
  }

  #[test]
  fn classifies_external_branches() {
    let code = [0xEB, 0x10, 0xC3];
    let analyzed = analyze(&code, 0x1000, 3).unwrap();

    let jmp = &analyzed.instructions[0];
    assert!(jmp.has_relative_target);
    assert!(jmp.has_external_target);
    assert_eq!(jmp.absolute_target_address, 0x1012);
    assert_eq!(jmp.outgoing, None);
    assert!(!analyzed.instructions[2].is_internal_target());
  }

  #[test]
  fn edges_are_dual() {
    // two conditional branches onto the same ret
    let code = [0x74, 0x04, 0x75, 0x02, 0x90, 0x90, 0xC3];
    let analyzed = analyze(&code, 0x1000, 7).unwrap();

    assert_eq!(analyzed.instructions[0].outgoing, Some(4));
    assert_eq!(analyzed.instructions[1].outgoing, Some(4));
    assert_eq!(analyzed.instructions[4].incoming, vec![0, 1]);

    for (j, item) in analyzed.instructions.iter().enumerate() {
      match item.outgoing {
        Some(i) => {
          assert!(!item.has_external_target);
          assert!(analyzed.instructions[usize::from(i)].incoming.contains(&(j as u8)));
        },
        None => assert_eq!(item.has_external_target, item.has_relative_target),
      }
    }
  }

  #[test]
  fn self_branch_forms_a_loop_edge() {
    // jmp $
    let code = [0xEB, 0xFE];
    let analyzed = analyze(&code, 0x1000, 2).unwrap();

    assert_eq!(analyzed.instructions[0].outgoing, Some(0));
    assert_eq!(analyzed.instructions[0].incoming, vec![0]);
    assert!(!analyzed.instructions[0].has_external_target);
  }

  #[test]
  fn fails_on_truncated_buffers() {
    let code = [0x48, 0x89];
    assert_matches!(analyze(&code, 0x1000, 3), Err(Error::TruncatedCode));
  }

  #[test]
  fn fails_on_invalid_code() {
    // push es is invalid in 64-bit mode
    let code = [0x06, 0x90];
    assert_matches!(analyze(&code, 0x1000, 1), Err(Error::InvalidCode));
  }

  #[test]
  fn fails_beyond_map_capacity() {
    let code = [0x90u8; 300];
    assert_matches!(analyze(&code, 0x1000, 300), Err(Error::CapacityExceeded));
  }
}
