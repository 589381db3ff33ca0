//! The host bridge: the only I/O surface of the guest.
//!
//! The guest asks its host for exactly three capabilities: fill a source
//! buffer, record the output journal, and terminate. Hashing of the
//! committed bytes is the host's business and stays behind the trait.
//!
//! The journal layout is fixed: an unconditional copy of the
//! (NUL-padded) input buffer, followed by the assembly text clamped to
//! the journal tail. The input-copy prefix lets the host diff the
//! source against what was emitted. An error aborts before anything is
//! committed.

use crate::{Arena, compile};

/// Size of the source input buffer.
pub const INPUT_CAP: usize = 256;
/// Size of the output journal buffer.
pub const JOURNAL_CAP: usize = 4096;
/// Bytes of the journal available for assembly text.
pub const ASM_CAP: usize = JOURNAL_CAP - INPUT_CAP;

/// What the guest needs from its host.
pub trait Host {
  /// Fill up to `buf.len()` bytes of source text; returns the number of
  /// bytes actually written.
  fn read(&mut self, buf: &mut [u8]) -> usize;
  /// Record the journal bytes.
  fn commit(&mut self, journal: &[u8]);
  /// Terminate with the given exit code.
  fn exit(&mut self, code: u32);
}

/// Guest entry point: read, compile, commit, exit.
pub fn run(host: &mut impl Host) {
  let mut input = [0u8; INPUT_CAP];
  let n = host.read(&mut input).min(INPUT_CAP - 1);
  // NUL-terminate and zero whatever the read left behind.
  input[n..].fill(0);

  let arena = Arena::new();
  match compile(&arena, &input) {
    Ok(asm) => {
      let mut journal = [0u8; JOURNAL_CAP];
      journal[..INPUT_CAP].copy_from_slice(&input);
      let text = asm.as_bytes();
      let len = text.len().min(ASM_CAP);
      journal[INPUT_CAP..INPUT_CAP + len].copy_from_slice(&text[..len]);
      host.commit(&journal[..INPUT_CAP + len]);
      host.exit(0);
    }
    Err(err) => {
      eprintln!("{}", err.report(&input));
      host.exit(1);
    }
  }
}
