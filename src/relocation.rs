//! Relocation of analyzed instructions into a destination buffer.
//!
//! Every instruction is copied, enlarged or expanded depending on whether
//! its encoding still reaches its target from the new position. Offsets of
//! instructions targeting other instructions inside the chunk are fixed up
//! in a final pass, once all position shifts are known.

use crate::analysis::{self, AnalyzedCode, AnalyzedInstruction};
use crate::disasm::NearBranch;
use crate::error::{Error, Result};
use crate::util;
use log::{debug, trace};

/// One translation-map entry: where a source instruction was placed in the
/// destination buffer.
///
/// An instruction rewritten into a block of multiple instructions maps to
/// the offset of the block's first instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TranslationEntry {
  /// Offset of the instruction in the source buffer.
  pub offset_source: u8,
  /// Offset of the relocated instruction in the destination buffer.
  pub offset_destination: u8,
}

/// Mutable state threaded through the relocation of one code chunk.
///
/// The context must not be reused across relocations: it is created right
/// before the first instruction is relocated and dropped once the offsets
/// have been fixed up.
pub struct TranslationContext<'a> {
  source: &'a [u8],
  destination: &'a mut [u8],
  destination_address: u64,
  bytes_read: usize,
  bytes_written: usize,
  instructions_read: usize,
  translation_map: Vec<TranslationEntry>,
  /// Tracks per source instruction whether relocation altered its bytes.
  rewritten: Vec<bool>,
}

impl<'a> TranslationContext<'a> {
  /// Creates a context relocating `source` into `destination`, which will
  /// be mapped at the runtime address `destination_address`.
  pub fn new(source: &'a [u8], destination: &'a mut [u8], destination_address: u64) -> Self {
    TranslationContext {
      source,
      destination,
      destination_address,
      bytes_read: 0,
      bytes_written: 0,
      instructions_read: 0,
      translation_map: Vec::new(),
      rewritten: Vec::new(),
    }
  }

  /// Returns the amount of source bytes consumed so far.
  pub fn bytes_read(&self) -> usize {
    self.bytes_read
  }

  /// Returns the amount of destination bytes emitted so far.
  pub fn bytes_written(&self) -> usize {
    self.bytes_written
  }

  /// Returns the number of source instructions relocated so far.
  pub fn instructions_read(&self) -> usize {
    self.instructions_read
  }

  /// Returns the source → destination offset map built so far.
  pub fn translation_map(&self) -> &[TranslationEntry] {
    &self.translation_map
  }

  /// Relocates a single instruction into the destination buffer.
  ///
  /// Instructions must be passed in source order, one call per analyzed
  /// instruction.
  pub fn relocate_instruction(&mut self, instruction: &AnalyzedInstruction) -> Result<()> {
    let rewritten = if instruction.has_relative_target {
      self.relocate_relative_instruction(instruction)?
    } else {
      self.relocate_common(instruction)?
    };

    self.rewritten.push(rewritten);
    self.bytes_read += instruction.instruction.len();
    self.instructions_read += 1;
    Ok(())
  }

  /// Rewrites the offsets of all relocated instructions whose targets lie
  /// inside the chunk, compensating for every instruction that moved.
  ///
  /// Instructions that were enlarged or expanded always carry external
  /// targets, so the field positions from the original encodings are still
  /// valid here.
  pub fn update_instruction_offsets(&mut self, code: &AnalyzedCode) -> Result<()> {
    for instruction in &code.instructions {
      if !instruction.has_relative_target || instruction.has_external_target {
        continue;
      }

      let field = instruction.instruction.relative_field()?;

      let outgoing = match instruction.outgoing {
        Some(index) => usize::from(index),
        None => return Err(Error::UnmappedInstruction),
      };
      let target = &code.instructions[outgoing];

      // A memory operand reading an instruction whose relocated image was
      // rewritten would observe modified code; refuse instead of emitting
      // a broken read.
      if instruction.instruction.is_relative_memory()
        && self.rewritten.get(outgoing) == Some(&true)
      {
        return Err(Error::UnsupportedInstruction);
      }

      let offset_instruction = self.relocated_offset(instruction.address_offset)?;
      let offset_target = self.relocated_offset(target.address_offset)?;

      let value = util::relative_offset(
        instruction.instruction.len(),
        u64::from(offset_instruction),
        u64::from(offset_target),
      );
      util::patch_displacement(
        self.destination,
        usize::from(offset_instruction) + field.offset,
        field.size,
        value,
      )?;
    }

    Ok(())
  }

  /// Relocates an instruction whose semantics depend on its position.
  fn relocate_relative_instruction(&mut self, instruction: &AnalyzedInstruction) -> Result<bool> {
    if instruction.instruction.is_relative_branch() {
      return self.relocate_relative_branch(instruction);
    }

    if instruction.instruction.is_relative_memory() {
      return self.relocate_relative_memory(instruction);
    }

    // Relative instructions outside the branch and memory classes (e.g.
    // `call rel32`) cannot be rewritten.
    Err(Error::UnsupportedInstruction)
  }

  /// Copies an instruction verbatim and records its translation.
  fn relocate_common(&mut self, instruction: &AnalyzedInstruction) -> Result<bool> {
    let length = instruction.instruction.len();
    self.copy_source_bytes(length)?;
    self.update_translation_context(length)?;
    Ok(false)
  }

  fn relocate_relative_branch(&mut self, instruction: &AnalyzedInstruction) -> Result<bool> {
    if !instruction.has_external_target {
      // Offsets of intra-chunk branches are fixed up later by
      // `update_instruction_offsets`.
      return self.relocate_common(instruction);
    }

    if self.should_rewrite_branch(instruction)? {
      if instruction.instruction.is_short_form_only() {
        return self.expand_branch(instruction);
      }
      return self.enlarge_branch(instruction);
    }

    // The target stays in reach of the original encoding: copy the
    // instruction, then recompute the offset at the new position.
    let length = instruction.instruction.len();
    let immediate = instruction.instruction.immediate();
    self.relocate_common(instruction)?;

    let value = util::relative_offset(
      0,
      self.destination_address.wrapping_add(self.bytes_written as u64),
      instruction.absolute_target_address,
    );
    util::patch_displacement(
      self.destination,
      self.bytes_written - length + immediate.offset,
      immediate.size,
      value,
    )?;
    Ok(false)
  }

  fn relocate_relative_memory(&mut self, instruction: &AnalyzedInstruction) -> Result<bool> {
    if !instruction.has_external_target {
      // The displacement is retargeted by `update_instruction_offsets`.
      return self.relocate_common(instruction);
    }

    let length = instruction.instruction.len();
    let displacement = instruction.instruction.displacement();
    self.relocate_common(instruction)?;

    let value = util::relative_offset(
      0,
      self.destination_address.wrapping_add(self.bytes_written as u64),
      instruction.absolute_target_address,
    );
    util::patch_displacement(
      self.destination,
      self.bytes_written - length + displacement.offset,
      displacement.size,
      value,
    )?;
    Ok(false)
  }

  /// Returns true if the branch no longer reaches its target from the
  /// destination with its original displacement width.
  fn should_rewrite_branch(&self, instruction: &AnalyzedInstruction) -> Result<bool> {
    let immediate = instruction.instruction.immediate();
    match immediate.size {
      8 | 16 | 32 => (),
      _ => return Err(Error::UnsupportedInstruction),
    }

    let source_address = self.destination_address.wrapping_add(self.bytes_written as u64);
    let distance = util::relative_offset(
      instruction.instruction.len(),
      source_address,
      instruction.absolute_target_address,
    );
    Ok(!util::fits_signed(distance, immediate.size))
  }

  /// Replaces a branch with its 32-bit-displacement form.
  fn enlarge_branch(&mut self, instruction: &AnalyzedInstruction) -> Result<bool> {
    let start = self.bytes_written;
    let length = match instruction.instruction.near_branch() {
      Some(NearBranch::Jmp) => {
        self.check_space(util::JMP_REL32_SIZE)?;
        self.destination[start] = 0xE9;
        util::JMP_REL32_SIZE
      },
      Some(NearBranch::Jcc(opcode)) => {
        self.check_space(util::JMP_REL32_SIZE + 1)?;
        self.destination[start] = 0x0F;
        self.destination[start + 1] = opcode;
        util::JMP_REL32_SIZE + 1
      },
      None => return Err(Error::UnsupportedInstruction),
    };

    let value = util::relative_offset(
      length,
      self.destination_address.wrapping_add(start as u64),
      instruction.absolute_target_address,
    );
    util::patch_displacement(self.destination, start + length - 4, 32, value)?;

    trace!(
      "enlarged branch at {:#x} to reach {:#x}",
      instruction.address,
      instruction.absolute_target_address
    );
    self.update_translation_context(length)?;
    Ok(true)
  }

  /// Expands a branch that only exists in short form into a block reaching
  /// an arbitrarily distant target:
  ///
  /// ```asm
  /// jecxz +0x02       ; taken: hop over the short jump
  /// jmp short +0x05   ; not taken: step over the near jump
  /// jmp <target>      ; taken: reach the real target
  /// ```
  fn expand_branch(&mut self, instruction: &AnalyzedInstruction) -> Result<bool> {
    let length = instruction.instruction.len();
    let immediate = instruction.instruction.immediate();
    let total = length + util::JMP_REL8_SIZE + util::JMP_REL32_SIZE;
    self.check_space(total)?;

    let start = self.bytes_written;

    // Copy the original branch and retarget it at the near jump below.
    self.copy_source_bytes(length)?;
    self.destination[start + immediate.offset] = 0x02;

    // Not-taken path: step over the near jump.
    self.destination[start + length] = 0xEB;
    self.destination[start + length + 1] = 0x05;

    // Taken path: a near jump to the real target.
    let jump_offset = start + length + util::JMP_REL8_SIZE;
    util::write_relative_jump(
      self.destination,
      jump_offset,
      self.destination_address.wrapping_add(jump_offset as u64),
      instruction.absolute_target_address,
    )?;

    trace!(
      "expanded short-form branch at {:#x} to reach {:#x}",
      instruction.address,
      instruction.absolute_target_address
    );
    self.update_translation_context(total)?;
    Ok(true)
  }

  /// Copies the bytes of the current source instruction verbatim.
  fn copy_source_bytes(&mut self, length: usize) -> Result<()> {
    self.check_space(length)?;
    let source = &self.source[self.bytes_read..self.bytes_read + length];
    self.destination[self.bytes_written..self.bytes_written + length].copy_from_slice(source);
    Ok(())
  }

  /// Ensures `length` more bytes fit the destination buffer.
  fn check_space(&self, length: usize) -> Result<()> {
    if self.bytes_written + length > self.destination.len() {
      return Err(Error::CapacityExceeded);
    }
    Ok(())
  }

  /// Appends the map entry for the current instruction and advances the
  /// destination cursor past its `emitted` bytes.
  fn update_translation_context(&mut self, emitted: usize) -> Result<()> {
    let entry = TranslationEntry {
      offset_source: offset_to_u8(self.bytes_read)?,
      offset_destination: offset_to_u8(self.bytes_written)?,
    };

    self.translation_map.push(entry);
    self.bytes_written += emitted;
    Ok(())
  }

  /// Returns the destination offset of the instruction that was located at
  /// `offset_source` in the source buffer.
  fn relocated_offset(&self, offset_source: usize) -> Result<u8> {
    let offset_source = offset_to_u8(offset_source)?;
    self
      .translation_map
      .iter()
      .find(|entry| entry.offset_source == offset_source)
      .map(|entry| entry.offset_destination)
      .ok_or(Error::UnmappedInstruction)
  }
}

fn offset_to_u8(offset: usize) -> Result<u8> {
  if offset > usize::from(u8::max_value()) {
    return Err(Error::CapacityExceeded);
  }
  Ok(offset as u8)
}

/// The result of a completed relocation.
pub struct Relocated {
  /// Source bytes covered (the prolog size a hook has to save).
  pub bytes_read: usize,
  /// Destination bytes emitted.
  pub bytes_written: usize,
}

/// Analyzes at least `min_bytes` of `source` and relocates the covered
/// instructions into `destination`.
///
/// On success the emitted chunk behaves at `destination_address` exactly as
/// the source chunk behaves at `source_address`. On error the destination
/// contents are unspecified and must be discarded.
pub fn relocate(
  source: &[u8],
  source_address: u64,
  min_bytes: usize,
  destination: &mut [u8],
  destination_address: u64,
) -> Result<Relocated> {
  let code = analysis::analyze(source, source_address, min_bytes)?;

  let mut context = TranslationContext::new(source, destination, destination_address);
  for instruction in &code.instructions {
    context.relocate_instruction(instruction)?;
  }
  context.update_instruction_offsets(&code)?;

  debug!(
    "relocated {} source bytes to {} bytes at {:#x}",
    context.bytes_read(),
    context.bytes_written(),
    destination_address
  );

  Ok(Relocated {
    bytes_read: context.bytes_read(),
    bytes_written: context.bytes_written(),
  })
}
