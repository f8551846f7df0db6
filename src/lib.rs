//! An x86/x64 machine-code relocation engine.
//!
//! ## Intro
//!
//! This library provides the core of an inline-hooking trampoline: it
//! analyzes the instructions at the start of a function and copies them to a
//! new address, rewriting every instruction whose semantics depend on its
//! original position so the copy behaves identically. With the prolog
//! preserved this way, the original function stays callable after its first
//! bytes have been replaced by a detour jump.
//!
//! Beyond plain copying the engine handles several different edge cases:
//!
//! - Relative branches whose short form no longer reaches its target are
//!   enlarged to their 32-bit form (`jmp`, all `jcc`).
//! - Branches that only exist in short form (`jecxz`, `loop`, ...) are
//!   expanded into an equivalent multi-instruction block.
//! - RIP-relative memory operands are re-pointed at their original target.
//! - Branches between the relocated instructions keep working even after
//!   rewrites shift their positions.
//!
//! The engine is buffer-based: callers hand in byte slices together with the
//! runtime addresses they are (or will be) mapped at, so code can be
//! analyzed and relocated without touching live memory. Patching prologs and
//! allocating executable memory for the trampoline are the responsibility of
//! the machinery around this crate.
//!
//! ## Procedure
//!
//! Relocating the two byte instruction `jecxz +0x20` from `0x1000` to a
//! distant address illustrates the full pipeline:
//!
//! ```c
//! 00001000 [e3 20]          jecxz 0x1022    ; +0x20 is out of reach from afar
//! ```
//!
//! The branch target keeps its meaning through an expanded block:
//!
//! ```c
//! 80000000 [e3 02]          jecxz 0x80000004 ; taken: hop to the near jump
//! 80000002 [eb 05]          jmp   0x80000009 ; not taken: step over it
//! 80000004 [e9 19 10 00 80] jmp   0x1022     ; reach the original target
//! ```
//!
//! A translation map records where each source instruction landed, and a
//! final fix-up pass rewrites the offsets of branches pointing inside the
//! relocated chunk.
//!
//! ## Platforms
//!
//! - Both `x86` & `x86-64` are supported; the machine mode follows the
//!   compilation target.

// Re-exports
pub use crate::analysis::{analyze, AnalyzedCode, AnalyzedInstruction};
pub use crate::disasm::{Instruction, RelativeField};
pub use crate::error::{Error, Result};
pub use crate::relocation::{relocate, Relocated, TranslationContext, TranslationEntry};

// Modules
mod analysis;
mod disasm;
mod error;
mod relocation;
mod util;
