//! The assembler.
//!
//! A stateful cursor over VM memory that packs opcodes into instruction
//! words. `pc` is the next byte address to emit; `ir_addr` is the word
//! currently being packed; `ir_shift` is the number of opcode bits
//! already placed there. The invariant `ir_shift == 0 <=> ir_addr == pc`
//! holds between calls.
//!
//! Whether one more opcode (and its in-word operand) fits is decided by
//! a single sign-extension check: OR the fields into the word, sign
//! extend, and confirm both read back unchanged. That one test covers
//! room in the word, the operand's signed range, and the sign filler
//! that makes the unused high bits of a word decode as `next` or
//! `nextff`.
//!
//! Misuse — an unaligned target, an operand on a non-terminal opcode, an
//! operand too wide for a fresh word — is a host programming error and
//! asserts; running out of memory to emit into propagates as an error.

use log::trace;

use crate::error::VmError;
use crate::inst::{
    is_terminal, opcode_pushi, opcode_pushreli, OP_CALL, OP_JUMP, OP_JUMPZ, OP_NEXT, OP_NEXTFF,
    OP_PUSH, OP_PUSHREL, PUSHI_MAX, PUSHI_MIN, PUSHRELI_MAX, PUSHRELI_MIN,
};
use crate::memory::{Memory, Wordsize};
use crate::word::{align_up, is_aligned, sign_extend, UWord, Word, WORD_BIT, WORD_BYTES};

/// Whether an operand survives sign extension as the in-word immediate
/// of a terminal opcode at the start of a fresh word.
fn fits_in_immediate(operand: Word) -> bool {
    sign_extend((operand as UWord) << 8) >> 8 == operand
}

pub struct Assembler<'a> {
    memory: &'a mut Memory,
    pc: UWord,
    ir_addr: UWord,
    ir_shift: u32,
}

impl<'a> Assembler<'a> {
    /// Start assembling at `pc`, which must be word-aligned.
    pub fn new(memory: &'a mut Memory, pc: UWord) -> Self {
        assert!(is_aligned(pc), "assembly address must be word-aligned");
        Self {
            memory,
            pc,
            ir_addr: pc,
            ir_shift: 0,
        }
    }

    /// The next byte address to emit at.
    pub fn pc(&self) -> UWord {
        self.pc
    }

    /// Address of the instruction word currently being packed.
    pub fn ir_addr(&self) -> UWord {
        self.ir_addr
    }

    /// Opcode bits already placed in the current instruction word.
    pub fn ir_shift(&self) -> u32 {
        self.ir_shift
    }

    /// Close the current instruction word (if any) and return the
    /// address of the next one.
    pub fn label(&mut self) -> UWord {
        self.ir_addr = self.pc;
        self.ir_shift = 0;
        self.pc
    }

    /// Move the assembly pointer to `pc`, which must be word-aligned.
    pub fn goto(&mut self, pc: UWord) {
        assert!(is_aligned(pc), "assembly address must be word-aligned");
        self.pc = pc;
        self.label();
    }

    /// Write a data word at `pc` and advance over it.
    pub fn word(&mut self, value: Word) -> Result<(), VmError> {
        self.memory.store(self.pc, value, Wordsize::Word)?;
        self.pc = self.pc.wrapping_add(WORD_BYTES as UWord);
        Ok(())
    }

    /// Write raw bytes at `pc` and round up to the next word boundary.
    pub fn bytes(&mut self, bytes: &[u8]) -> Result<(), VmError> {
        assert!(self.ir_shift == 0, "bytes must start at a word boundary");
        self.memory.write_bytes(self.pc, bytes)?;
        self.pc = align_up(self.pc.wrapping_add(bytes.len() as UWord));
        self.label();
        Ok(())
    }

    /// Emit a placeholder word if no instruction word is in progress.
    fn start_word(&mut self) -> Result<(), VmError> {
        if self.ir_addr == self.pc {
            debug_assert_eq!(self.ir_shift, 0);
            self.word(0)?;
        }
        Ok(())
    }

    /// Signed word-count offset from the current in-word base to `addr`.
    fn word_offset_to(&self, addr: UWord) -> Word {
        (addr.wrapping_sub(self.pc) as Word) / WORD_BYTES as Word
    }

    /// Try to place `opcode` (and, for a terminal opcode, its operand)
    /// in the current instruction word. Returns the updated word, or
    /// `None` if either field would not survive sign extension. A
    /// terminal opcode with no operand gets the filler that re-reads as
    /// itself: 0 when the high bit is clear, -1 when set.
    pub fn fit(&self, opcode: u8, operand: Option<Word>) -> Result<Option<Word>, VmError> {
        debug_assert_ne!(self.ir_addr, self.pc, "no instruction word in progress");
        let mut ir = self.memory.load(self.ir_addr, Wordsize::Word)? as UWord;
        ir |= (opcode as UWord) << self.ir_shift;
        let operand = if is_terminal(opcode) {
            Some(operand.unwrap_or(if opcode & 0x80 == 0 { 0 } else { -1 }))
        } else {
            None
        };
        let operand_shift = self.ir_shift + 8;
        if let Some(n) = operand {
            if (operand_shift as usize) < WORD_BIT {
                ir |= (n as UWord) << operand_shift;
            }
        }
        let ir = sign_extend(ir);
        if ((ir >> self.ir_shift) & 0xff) as u8 != opcode {
            return Ok(None);
        }
        if let Some(n) = operand {
            let readback = if (operand_shift as usize) < WORD_BIT {
                ir >> operand_shift
            } else if ir < 0 {
                -1
            } else {
                0
            };
            if readback != n {
                return Ok(None);
            }
        }
        Ok(Some(ir))
    }

    /// Append one instruction opcode, starting a new word if it does
    /// not fit in the current one. Only terminal opcodes take an
    /// operand.
    pub fn instruction(&mut self, opcode: u8, operand: Option<Word>) -> Result<(), VmError> {
        assert!(
            operand.is_none() || is_terminal(opcode),
            "only terminal opcodes take an in-word operand"
        );
        trace!("emit {opcode:#04x} operand {operand:?} at shift {}", self.ir_shift);
        self.start_word()?;
        let ir = match self.fit(opcode, operand)? {
            Some(ir) => ir,
            None => {
                self.label();
                self.start_word()?;
                self.fit(opcode, operand)?
                    .expect("a terminal opcode with an in-range operand fits in a fresh word")
            }
        };
        self.memory.store(self.ir_addr, ir, Wordsize::Word)?;
        self.ir_shift += 8;
        if is_terminal(opcode) || self.ir_shift as usize == WORD_BIT {
            self.label();
        }
        Ok(())
    }

    /// Assemble a relative `jump`, `jumpz` or `call` to `addr`, using
    /// the immediate form when its word-count offset fits. The offset is
    /// measured from the word after the instruction word, so starting a
    /// new word shifts it by one.
    pub fn jumprel(&mut self, addr: UWord, opcode: u8) -> Result<(), VmError> {
        assert!(
            matches!(opcode, OP_JUMP | OP_JUMPZ | OP_CALL),
            "jumprel takes a branch opcode"
        );
        assert!(is_aligned(addr), "branch target must be word-aligned");
        self.start_word()?;
        let word_offset = self.word_offset_to(addr);
        if word_offset != 0 && self.fit(opcode, Some(word_offset))?.is_some() {
            // Immediate form in the current word. Offset zero is
            // excluded: it would decode as the stack form.
            self.instruction(opcode, Some(word_offset))
        } else {
            let word_offset = word_offset.wrapping_sub(1);
            if fits_in_immediate(word_offset) {
                // Immediate form at the start of a new word.
                self.label();
                self.instruction(opcode, Some(word_offset))
            } else {
                // Push the target and use the stack form.
                self.pushrel(addr)?;
                self.instruction(opcode, None)
            }
        }
    }

    /// Assemble a `push` of `value`, using the one-byte `pushi` form
    /// when the value is in range.
    pub fn push(&mut self, value: Word) -> Result<(), VmError> {
        if (PUSHI_MIN..=PUSHI_MAX).contains(&value) {
            self.instruction(opcode_pushi(value), None)
        } else {
            self.push_long(value)
        }
    }

    /// Assemble a `push` with the value in a following data word.
    pub fn push_long(&mut self, value: Word) -> Result<(), VmError> {
        self.instruction(OP_PUSH, None)?;
        self.word(value)
    }

    /// Assemble a `pushrel` of the word-aligned address `addr`, using
    /// the one-byte `pushreli` form when its word offset is in range.
    pub fn pushrel(&mut self, addr: UWord) -> Result<(), VmError> {
        assert!(is_aligned(addr), "pushrel target must be word-aligned");
        self.start_word()?;
        // Move on if there is no room left for an opcode, or if the
        // offset is exactly 64, which is representable only from the
        // next word's base.
        if self.fit(opcode_pushreli(0), None)?.is_none() || self.word_offset_to(addr) == 64 {
            self.label();
            self.start_word()?;
        }
        let word_offset = self.word_offset_to(addr);
        if (PUSHRELI_MIN..=PUSHRELI_MAX).contains(&word_offset) && word_offset != -1 {
            self.instruction(opcode_pushreli(word_offset), None)
        } else {
            self.pushrel_long(addr)
        }
    }

    /// Assemble a `pushrel` with the byte offset in a following data
    /// word.
    pub fn pushrel_long(&mut self, addr: UWord) -> Result<(), VmError> {
        assert!(is_aligned(addr), "pushrel target must be word-aligned");
        self.instruction(OP_PUSHREL, None)?;
        let offset = addr.wrapping_sub(self.pc) as Word;
        self.word(offset)
    }

    /// Assemble the extra instruction selected by `extra_opcode`.
    pub fn extra(&mut self, extra_opcode: Word) -> Result<(), VmError> {
        self.instruction(OP_NEXT, Some(extra_opcode))
    }

    /// Assemble the trap selected by `trap_code`.
    pub fn trap(&mut self, trap_code: Word) -> Result<(), VmError> {
        self.instruction(OP_NEXTFF, Some(trap_code))
    }
}
