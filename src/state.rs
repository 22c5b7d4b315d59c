//! The VM state and interpreter.
//!
//! A `State` owns a program counter, an instruction register, a data
//! stack and a memory buffer. Opcodes are consumed from the low byte of
//! the instruction register, which is then shifted arithmetically right
//! by eight, so the unused high bits of an instruction word decode as
//! `next` (zero filler) or `nextff` (all-ones filler) and refetch.
//!
//! Raising an error leaves `pc`, `ir` and the stack exactly as they were
//! at the start of the step that raised: `single_step` snapshots the
//! registers and the stack depth, and instructions check all their
//! preconditions before making any write, so restoring the snapshot
//! restores the machine.

use std::fmt;

use log::{debug, trace};

use crate::assembler::Assembler;
use crate::error::VmError;
use crate::inst::{
    Inst, EXTRA_ARGC, EXTRA_ARGV, EXTRA_GET_IR, EXTRA_GET_PC, EXTRA_GET_STACK,
    EXTRA_GET_STACK_DEPTH, EXTRA_GET_STACK_WORDS, EXTRA_HALT, EXTRA_POP_STACK, EXTRA_PUSH_STACK,
    EXTRA_RUN, EXTRA_SET_IR, EXTRA_SET_PC, EXTRA_SET_STACK, EXTRA_SET_STACK_DEPTH,
    EXTRA_SET_STACK_WORDS, EXTRA_SINGLE_STEP, EXTRA_SIZEOF_STATE, EXTRA_STACK_POSITION,
    EXTRA_THIS_STATE,
};
use crate::memory::{Memory, Wordsize};
use crate::stack::Stack;
use crate::word::{align_up, UWord, Word, WORD_BIT, WORD_BYTES};

/// The handle `this_state` pushes, standing in for a pointer to the
/// state executing it.
pub const CURRENT_STATE: Word = 0;

/// The `trap` instruction's delegate. A nonzero returned code is raised
/// by the instruction; a handler that fails partway through its own
/// stack effect should return an error code without mutating the state.
pub trait TrapHandler {
    fn trap(&mut self, state: &mut State) -> Word;
}

/// Program arguments installed by the host, exposed through the
/// `argc`/`argv` extra instructions.
#[derive(Debug, Clone, Copy)]
struct ProgramArgs {
    count: Word,
    table: UWord,
}

pub struct State {
    pc: UWord,
    ir: Word,
    stack: Stack,
    memory: Memory,
    trap: Option<Box<dyn TrapHandler>>,
    children: Vec<State>,
    args: Option<ProgramArgs>,
}

impl State {
    /// Create a state with zeroed registers, a zero-filled memory of
    /// `memory_size` bytes (a whole number of words) and a stack of
    /// `stack_words` words.
    pub fn new(memory_size: usize, stack_words: usize) -> Self {
        debug!("new state: {memory_size} bytes of memory, {stack_words} stack words");
        Self {
            pc: 0,
            ir: 0,
            stack: Stack::new(stack_words),
            memory: Memory::new(memory_size),
            trap: None,
            children: Vec::new(),
            args: None,
        }
    }

    pub fn pc(&self) -> UWord {
        self.pc
    }

    pub fn set_pc(&mut self, pc: UWord) {
        self.pc = pc;
    }

    pub fn ir(&self) -> Word {
        self.ir
    }

    pub fn set_ir(&mut self, ir: Word) {
        self.ir = ir;
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut Stack {
        &mut self.stack
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    /// An assembler over this state's memory, positioned at `pc`.
    pub fn assembler(&mut self, pc: UWord) -> Assembler<'_> {
        Assembler::new(&mut self.memory, pc)
    }

    /// Install the `trap` instruction's delegate. Without one, `trap`
    /// raises `InvalidOpcode`.
    pub fn set_trap_handler(&mut self, handler: Box<dyn TrapHandler>) {
        self.trap = Some(handler);
    }

    /// Adopt a child state, returning the handle guest programs use to
    /// drive it through the extra instructions. Handles are never
    /// reused; the current state's own handle is `CURRENT_STATE`.
    pub fn adopt(&mut self, child: State) -> Word {
        self.children.push(child);
        self.children.len() as Word
    }

    /// Copy program arguments into memory at `addr`: each argument as a
    /// NUL-terminated string, then a word-aligned table of their
    /// addresses. Returns the table address, which `argv` pushes.
    pub fn load_args<S: AsRef<str>>(&mut self, addr: UWord, args: &[S]) -> Result<UWord, VmError> {
        let mut cursor = addr;
        let mut pointers = Vec::with_capacity(args.len());
        for arg in args {
            let bytes = arg.as_ref().as_bytes();
            pointers.push(cursor);
            self.memory.write_bytes(cursor, bytes)?;
            cursor = cursor.wrapping_add(bytes.len() as UWord);
            self.memory.store(cursor, 0, Wordsize::Byte)?;
            cursor = cursor.wrapping_add(1);
        }
        let table = align_up(cursor);
        for (i, pointer) in pointers.iter().enumerate() {
            let slot = table.wrapping_add((i * WORD_BYTES) as UWord);
            self.memory.store(slot, *pointer as Word, Wordsize::Word)?;
        }
        self.args = Some(ProgramArgs {
            count: args.len() as Word,
            table,
        });
        Ok(table)
    }

    /// Execute until an error code is raised.
    pub fn run(&mut self) -> VmError {
        loop {
            if let Err(error) = self.single_step() {
                debug!("stopped: {error} (code {})", error.code());
                return error;
            }
        }
    }

    /// Execute one decoded opcode. On an error the machine is left as it
    /// was when the step began, so execution can be resumed once the
    /// caller has corrected the condition.
    pub fn single_step(&mut self) -> Result<(), VmError> {
        let pc = self.pc;
        let ir = self.ir;
        let depth = self.stack.depth();
        match self.step() {
            Ok(()) => Ok(()),
            Err(error) => {
                self.pc = pc;
                self.ir = ir;
                self.stack.restore_depth(depth);
                Err(error)
            }
        }
    }

    fn step(&mut self) -> Result<(), VmError> {
        let opcode = (self.ir & 0xff) as u8;
        self.ir >>= 8;
        trace!("pc={:#x} opcode={:#04x}", self.pc, opcode);
        match Inst::decode(opcode)? {
            Inst::Next => {
                if self.ir != 0 {
                    let extra_opcode = self.ir as UWord;
                    self.ir = 0;
                    self.extra(extra_opcode)?;
                } else {
                    self.fetch()?;
                }
            }
            Inst::Nextff => {
                if self.ir != -1 {
                    return Err(VmError::InvalidOpcode);
                }
                self.fetch()?;
            }
            Inst::Jump => {
                if self.ir != 0 {
                    self.branch_relative();
                } else {
                    let addr = self.pop_addr()?;
                    Self::check_jump_target(addr)?;
                    self.pc = addr;
                }
            }
            Inst::Jumpz => {
                if self.ir != 0 {
                    let flag = self.stack.pop()?;
                    if flag == 0 {
                        self.branch_relative();
                    }
                } else {
                    let addr = self.pop_addr()?;
                    let flag = self.stack.pop()?;
                    if flag == 0 {
                        Self::check_jump_target(addr)?;
                        self.pc = addr;
                    }
                }
            }
            Inst::Call => {
                if self.ir != 0 {
                    let ret_addr = self.pc as Word;
                    self.branch_relative();
                    self.stack.push(ret_addr)?;
                } else {
                    let addr = self.pop_addr()?;
                    Self::check_jump_target(addr)?;
                    let ret_addr = self.pc as Word;
                    self.pc = addr;
                    self.stack.push(ret_addr)?;
                }
            }
            Inst::Pop => {
                let count = self.pop_count()?;
                let depth = self.stack.depth();
                if count > depth {
                    return Err(VmError::InvalidStackRead);
                }
                self.stack.set_depth(depth - count)?;
            }
            Inst::Dup => {
                let count = self.pop_count()?;
                let value = self.stack.peek(count)?;
                self.stack.push(value)?;
            }
            Inst::Swap => {
                let count = self.pop_count()?;
                let top = self.stack.peek(0)?;
                let deep = self.stack.peek(count)?;
                self.stack.poke(count, top)?;
                self.stack.poke(0, deep)?;
            }
            Inst::Trap => {
                let mut handler = self.trap.take().ok_or(VmError::InvalidOpcode)?;
                let code = handler.trap(self);
                // The handler may have installed a replacement for itself.
                if self.trap.is_none() {
                    self.trap = Some(handler);
                }
                if code != 0 {
                    return Err(VmError::from_code(code));
                }
            }
            Inst::Load => self.load(Wordsize::Word)?,
            Inst::Store => self.store(Wordsize::Word)?,
            Inst::Load1 => self.load(Wordsize::Byte)?,
            Inst::Store1 => self.store(Wordsize::Byte)?,
            Inst::Load2 => self.load(Wordsize::Half)?,
            Inst::Store2 => self.store(Wordsize::Half)?,
            Inst::Load4 => self.load(Wordsize::Four)?,
            Inst::Store4 => self.store(Wordsize::Four)?,
            Inst::Push => {
                let value = self.memory.load(self.pc, Wordsize::Word)?;
                self.pc = self.pc.wrapping_add(WORD_BYTES as UWord);
                self.stack.push(value)?;
            }
            Inst::Pushrel => {
                let offset = self.memory.load(self.pc, Wordsize::Word)?;
                let value = (self.pc as Word).wrapping_add(offset);
                self.pc = self.pc.wrapping_add(WORD_BYTES as UWord);
                self.stack.push(value)?;
            }
            Inst::Not => {
                let x = self.stack.pop()?;
                self.stack.push(!x)?;
            }
            Inst::And => self.binary(|x, y| x & y)?,
            Inst::Or => self.binary(|x, y| x | y)?,
            Inst::Xor => self.binary(|x, y| x ^ y)?,
            Inst::Lt => self.binary(|a, b| Word::from(a < b))?,
            Inst::Ult => self.binary(|a, b| Word::from((a as UWord) < (b as UWord)))?,
            Inst::Lshift => self.binary(|x, n| {
                if (n as UWord) < WORD_BIT as UWord {
                    ((x as UWord) << n) as Word
                } else {
                    0
                }
            })?,
            Inst::Rshift => self.binary(|x, n| {
                if (n as UWord) < WORD_BIT as UWord {
                    ((x as UWord) >> n) as Word
                } else {
                    0
                }
            })?,
            Inst::Arshift => self.binary(|x, n| {
                if (n as UWord) < WORD_BIT as UWord {
                    x >> n
                } else if x < 0 {
                    -1
                } else {
                    0
                }
            })?,
            Inst::Negate => {
                let a = self.stack.pop()?;
                self.stack.push(a.wrapping_neg())?;
            }
            Inst::Add => self.binary(Word::wrapping_add)?,
            Inst::Mul => self.binary(Word::wrapping_mul)?,
            Inst::Divmod => {
                let b = self.stack.pop()?;
                let a = self.stack.pop()?;
                if b == 0 {
                    return Err(VmError::DivisionByZero);
                }
                self.stack.push(a.wrapping_div(b))?;
                self.stack.push(a.wrapping_rem(b))?;
            }
            Inst::Udivmod => {
                let b = self.stack.pop()?;
                let a = self.stack.pop()?;
                if b == 0 {
                    return Err(VmError::DivisionByZero);
                }
                self.stack.push(((a as UWord) / (b as UWord)) as Word)?;
                self.stack.push(((a as UWord) % (b as UWord)) as Word)?;
            }
            Inst::Pushi(n) => self.stack.push(n)?,
            Inst::Pushreli(n) => {
                let addr = self
                    .pc
                    .wrapping_add((n as UWord).wrapping_mul(WORD_BYTES as UWord));
                self.stack.push(addr as Word)?;
            }
        }
        Ok(())
    }

    /// Load the next instruction word.
    fn fetch(&mut self) -> Result<(), VmError> {
        self.ir = self.memory.load(self.pc, Wordsize::Word)?;
        self.pc = self.pc.wrapping_add(WORD_BYTES as UWord);
        Ok(())
    }

    /// Take the rest of `ir` as a signed word-count offset from `pc`.
    fn branch_relative(&mut self) {
        self.pc = self
            .pc
            .wrapping_add((self.ir as UWord).wrapping_mul(WORD_BYTES as UWord));
        self.ir = 0;
    }

    fn check_jump_target(addr: UWord) -> Result<(), VmError> {
        if !crate::word::is_aligned(addr) {
            return Err(VmError::UnalignedAddress);
        }
        Ok(())
    }

    fn pop_addr(&mut self) -> Result<UWord, VmError> {
        Ok(self.stack.pop()? as UWord)
    }

    /// Pop a variadic item count. Negative counts are invalid reads.
    fn pop_count(&mut self) -> Result<usize, VmError> {
        let count = self.stack.pop()?;
        usize::try_from(count).map_err(|_| VmError::InvalidStackRead)
    }

    fn binary(&mut self, f: impl FnOnce(Word, Word) -> Word) -> Result<(), VmError> {
        let b = self.stack.pop()?;
        let a = self.stack.pop()?;
        self.stack.push(f(a, b))
    }

    fn load(&mut self, size: Wordsize) -> Result<(), VmError> {
        let addr = self.pop_addr()?;
        let value = self.memory.load(addr, size)?;
        self.stack.push(value)
    }

    fn store(&mut self, size: Wordsize) -> Result<(), VmError> {
        let addr = self.pop_addr()?;
        let value = self.stack.pop()?;
        self.memory.store(addr, value, size)
    }

    /// Run a closure against the state a handle refers to. Handle 0 is
    /// this state; positive handles name adopted children. Anything
    /// else is a wild pointer and raises `InvalidMemoryRead`.
    fn with_state<R>(
        &mut self,
        handle: Word,
        f: impl FnOnce(&mut State) -> R,
    ) -> Result<R, VmError> {
        if handle == CURRENT_STATE {
            return Ok(f(self));
        }
        let index = handle
            .checked_sub(1)
            .and_then(|i| usize::try_from(i).ok())
            .ok_or(VmError::InvalidMemoryRead)?;
        let child = self
            .children
            .get_mut(index)
            .ok_or(VmError::InvalidMemoryRead)?;
        Ok(f(child))
    }

    fn pop_handle(&mut self) -> Result<Word, VmError> {
        self.stack.pop()
    }

    /// Dispatch an extra instruction. These are reached through the
    /// `next` escape and use a full word for their opcode.
    fn extra(&mut self, extra_opcode: UWord) -> Result<(), VmError> {
        trace!("extra opcode {extra_opcode:#x}");
        match extra_opcode {
            EXTRA_HALT => {
                let code = self.stack.pop()?;
                Err(VmError::from_code(code))
            }
            EXTRA_SIZEOF_STATE => self.stack.push(std::mem::size_of::<State>() as Word),
            EXTRA_THIS_STATE => self.stack.push(CURRENT_STATE),
            EXTRA_GET_PC => {
                let handle = self.pop_handle()?;
                let pc = self.with_state(handle, |state| state.pc as Word)?;
                self.stack.push(pc)
            }
            EXTRA_SET_PC => {
                let handle = self.pop_handle()?;
                let value = self.stack.pop()?;
                // pc stays word-aligned between instructions.
                Self::check_jump_target(value as UWord)?;
                self.with_state(handle, |state| state.pc = value as UWord)
            }
            EXTRA_GET_IR => {
                let handle = self.pop_handle()?;
                let ir = self.with_state(handle, |state| state.ir)?;
                self.stack.push(ir)
            }
            EXTRA_SET_IR => {
                let handle = self.pop_handle()?;
                let value = self.stack.pop()?;
                self.with_state(handle, |state| state.ir = value)
            }
            EXTRA_GET_STACK_DEPTH => {
                let handle = self.pop_handle()?;
                let depth = self.with_state(handle, |state| state.stack.depth() as Word)?;
                self.stack.push(depth)
            }
            EXTRA_SET_STACK_DEPTH => {
                let handle = self.pop_handle()?;
                let value = self.stack.pop()?;
                let depth = usize::try_from(value).map_err(|_| VmError::InvalidStackWrite)?;
                self.with_state(handle, |state| state.stack.set_depth(depth))?
            }
            // The raw stack pointer has no safe rendering; its opcodes
            // are reserved.
            EXTRA_GET_STACK | EXTRA_SET_STACK => Err(VmError::InvalidOpcode),
            EXTRA_GET_STACK_WORDS => {
                let handle = self.pop_handle()?;
                let words = self.with_state(handle, |state| state.stack.words() as Word)?;
                self.stack.push(words)
            }
            EXTRA_SET_STACK_WORDS => {
                let handle = self.pop_handle()?;
                let value = self.stack.pop()?;
                let words = usize::try_from(value).map_err(|_| VmError::InvalidStackWrite)?;
                self.with_state(handle, |state| state.stack.set_words(words))?
            }
            EXTRA_STACK_POSITION => {
                let handle = self.pop_handle()?;
                let pos = self.stack.pop()?;
                let pos = usize::try_from(pos).map_err(|_| VmError::InvalidStackRead)?;
                let value = self.with_state(handle, |state| state.stack.peek(pos))??;
                self.stack.push(value)
            }
            EXTRA_POP_STACK => {
                let handle = self.pop_handle()?;
                let result = self.with_state(handle, |state| state.stack.pop())?;
                let (value, code) = match result {
                    Ok(value) => (value, 0),
                    Err(error) => (0, error.code()),
                };
                self.stack.push(value)?;
                self.stack.push(code)
            }
            EXTRA_PUSH_STACK => {
                let handle = self.pop_handle()?;
                let value = self.stack.pop()?;
                let result = self.with_state(handle, |state| state.stack.push(value))?;
                let code = match result {
                    Ok(()) => 0,
                    Err(error) => error.code(),
                };
                self.stack.push(code)
            }
            EXTRA_RUN => {
                let handle = self.pop_handle()?;
                let code = self.with_state(handle, |state| state.run())?.code();
                self.stack.push(code)
            }
            EXTRA_SINGLE_STEP => {
                let handle = self.pop_handle()?;
                let result = self.with_state(handle, |state| state.single_step())?;
                let code = match result {
                    Ok(()) => 0,
                    Err(error) => error.code(),
                };
                self.stack.push(code)
            }
            EXTRA_ARGC => {
                let count = self.args.map_or(0, |args| args.count);
                self.stack.push(count)
            }
            EXTRA_ARGV => {
                let table = self.args.map_or(0, |args| args.table as Word);
                self.stack.push(table)
            }
            _ => Err(VmError::InvalidOpcode),
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "pc={:#x} ir={:#x} stack({}/{})={}",
            self.pc,
            self.ir,
            self.stack.depth(),
            self.stack.words(),
            self.stack
        )
    }
}

#[cfg(test)]
mod tests {
    use quickcheck_macros::quickcheck;

    use super::*;
    use crate::inst::{
        opcode_pushi, OP_ADD, OP_ARSHIFT, OP_CALL, OP_DIVMOD, OP_DUP, OP_JUMP, OP_JUMPZ, OP_LOAD,
        OP_LSHIFT, OP_NEXT, OP_NEXTFF, OP_POP, OP_STORE2, OP_SWAP, OP_TRAP, OP_UDIVMOD,
    };

    fn test_state() -> State {
        State::new(256 * WORD_BYTES, 8)
    }

    /// Execute a single basic opcode with nothing else in the
    /// instruction word.
    fn exec(state: &mut State, opcode: u8) -> Result<(), VmError> {
        state.set_ir(opcode as Word);
        state.single_step()
    }

    /// Execute one extra instruction by building the escape word.
    fn exec_extra(state: &mut State, extra_opcode: UWord) -> Result<(), VmError> {
        state.set_ir(((extra_opcode as Word) << 8) | OP_NEXT as Word);
        state.single_step()
    }

    fn push_all(state: &mut State, values: &[Word]) {
        for value in values {
            state.stack_mut().push(*value).unwrap();
        }
    }

    #[test]
    fn check_stack_operator_sequence() {
        let mut state = State::new(1024 * WORD_BYTES, 16);
        push_all(&mut state, &[1, 2, 3]);
        {
            let mut asm = state.assembler(0);
            for (literal, opcode) in [
                (0, OP_DUP),
                (1, OP_POP),
                (1, OP_SWAP),
                (1, OP_DUP),
                (1, OP_SWAP),
                (1, OP_POP),
                (0, OP_DUP),
            ] {
                asm.push(literal).unwrap();
                asm.instruction(opcode, None).unwrap();
            }
        }
        let expected: Vec<Vec<Word>> = [
            vec![1, 2, 3, 0],
            vec![1, 2, 3, 3],
            vec![1, 2, 3, 3, 1],
            vec![1, 2, 3],
            vec![1, 2, 3, 1],
            vec![1, 3, 2],
            vec![1, 3, 2, 1],
            vec![1, 3, 2, 3],
            vec![1, 3, 2, 3, 1],
            vec![1, 3, 3, 2],
            vec![1, 3, 3, 2, 1],
            vec![1, 3, 3],
            vec![1, 3, 3, 0],
            vec![1, 3, 3, 3],
        ]
        .to_vec();

        // Fetch steps leave the stack alone; collect each change.
        let mut found = Vec::new();
        let mut last = state.stack().as_slice().to_vec();
        for _ in 0..200 {
            if found.len() == expected.len() {
                break;
            }
            state.single_step().unwrap();
            let now = state.stack().as_slice().to_vec();
            if now != last {
                found.push(now.clone());
                last = now;
            }
        }
        assert_eq!(found, expected);
    }

    #[test]
    fn check_unaligned_load_leaves_state_unchanged() {
        let mut state = test_state();
        push_all(&mut state, &[1]);
        assert_eq!(exec(&mut state, OP_LOAD), Err(VmError::UnalignedAddress));
        assert_eq!(state.pc(), 0);
        assert_eq!(state.ir(), OP_LOAD as Word);
        assert_eq!(state.stack().as_slice(), [1]);
    }

    #[test]
    fn check_division_by_zero_keeps_divisor() {
        let mut state = test_state();
        push_all(&mut state, &[7, 0]);
        assert_eq!(exec(&mut state, OP_DIVMOD), Err(VmError::DivisionByZero));
        assert_eq!(state.stack().as_slice(), [7, 0]);
    }

    #[test]
    fn check_divmod_truncates_toward_zero() {
        let mut state = test_state();
        push_all(&mut state, &[-7, 2]);
        exec(&mut state, OP_DIVMOD).unwrap();
        assert_eq!(state.stack().as_slice(), [-3, -1]);
    }

    #[test]
    fn check_udivmod_is_unsigned() {
        let mut state = test_state();
        push_all(&mut state, &[-1, 2]);
        exec(&mut state, OP_UDIVMOD).unwrap();
        assert_eq!(
            state.stack().as_slice(),
            [(UWord::MAX / 2) as Word, (UWord::MAX % 2) as Word]
        );
    }

    #[test]
    fn check_shift_saturation() {
        let mut state = test_state();
        push_all(&mut state, &[1, WORD_BIT as Word]);
        exec(&mut state, OP_LSHIFT).unwrap();
        assert_eq!(state.stack().as_slice(), [0]);

        state.stack_mut().set_depth(0).unwrap();
        push_all(&mut state, &[-1, WORD_BIT as Word]);
        exec(&mut state, OP_ARSHIFT).unwrap();
        assert_eq!(state.stack().as_slice(), [-1]);

        // A negative count saturates rather than reversing direction.
        state.stack_mut().set_depth(0).unwrap();
        push_all(&mut state, &[1, -1]);
        exec(&mut state, OP_LSHIFT).unwrap();
        assert_eq!(state.stack().as_slice(), [0]);
    }

    #[test]
    fn check_store2_alignment_and_value() {
        let mut state = test_state();
        push_all(&mut state, &[0x1234, 2]);
        exec(&mut state, OP_STORE2).unwrap();
        assert_eq!(state.memory().bytes()[2], 0x34);
        assert_eq!(state.memory().bytes()[3], 0x12);

        push_all(&mut state, &[0x1234, 3]);
        assert_eq!(exec(&mut state, OP_STORE2), Err(VmError::UnalignedAddress));
    }

    #[test]
    fn check_jump_pops_aligned_target() {
        let mut state = test_state();
        push_all(&mut state, &[4 * WORD_BYTES as Word]);
        exec(&mut state, OP_JUMP).unwrap();
        assert_eq!(state.pc(), 4 * WORD_BYTES as UWord);

        push_all(&mut state, &[1]);
        assert_eq!(exec(&mut state, OP_JUMP), Err(VmError::UnalignedAddress));
    }

    #[test]
    fn check_jumpz_falls_through_on_nonzero() {
        let mut state = test_state();
        // Taken: flag 0.
        push_all(&mut state, &[0, 2 * WORD_BYTES as Word]);
        exec(&mut state, OP_JUMPZ).unwrap();
        assert_eq!(state.pc(), 2 * WORD_BYTES as UWord);
        assert_eq!(state.stack().depth(), 0);

        // Not taken: flag 1; both operands still popped.
        push_all(&mut state, &[1, 8 * WORD_BYTES as Word]);
        exec(&mut state, OP_JUMPZ).unwrap();
        assert_eq!(state.pc(), 2 * WORD_BYTES as UWord);
        assert_eq!(state.stack().depth(), 0);
    }

    #[test]
    fn check_call_pushes_return_address() {
        let mut state = test_state();
        state.set_pc(3 * WORD_BYTES as UWord);
        push_all(&mut state, &[5 * WORD_BYTES as Word]);
        exec(&mut state, OP_CALL).unwrap();
        assert_eq!(state.pc(), 5 * WORD_BYTES as UWord);
        assert_eq!(state.stack().as_slice(), [3 * WORD_BYTES as Word]);
    }

    #[test]
    fn check_immediate_jump_applies_word_offset() {
        let mut state = test_state();
        state.set_pc(4 * WORD_BYTES as UWord);
        state.set_ir(((3 as Word) << 8) | OP_JUMP as Word);
        state.single_step().unwrap();
        assert_eq!(state.pc(), 7 * WORD_BYTES as UWord);
        assert_eq!(state.ir(), 0);
    }

    #[test]
    fn check_nextff_requires_all_ones() {
        let mut state = test_state();
        state
            .memory_mut()
            .store(0, 0x1234, Wordsize::Word)
            .unwrap();
        // All-ones filler refetches.
        state.set_ir(-1);
        state.single_step().unwrap();
        assert_eq!(state.ir(), 0x1234);
        assert_eq!(state.pc(), WORD_BYTES as UWord);

        // Anything else is an invalid opcode.
        state.set_ir(OP_NEXTFF as Word);
        assert_eq!(state.single_step(), Err(VmError::InvalidOpcode));
    }

    #[test]
    fn check_push_reads_following_word() {
        let mut state = test_state();
        {
            let mut asm = state.assembler(0);
            asm.push_long(123456).unwrap();
        }
        state.single_step().unwrap(); // fetch
        state.single_step().unwrap(); // push
        assert_eq!(state.stack().as_slice(), [123456]);
        assert_eq!(state.pc(), 2 * WORD_BYTES as UWord);
    }

    #[test]
    fn check_pushreli_is_relative_to_next_word() {
        let mut state = test_state();
        {
            let mut asm = state.assembler(0);
            asm.pushrel(3 * WORD_BYTES as UWord).unwrap();
        }
        state.single_step().unwrap(); // fetch; pc now one word in
        state.single_step().unwrap(); // pushreli 2
        assert_eq!(state.stack().as_slice(), [3 * WORD_BYTES as Word]);
    }

    #[test]
    fn check_halt_returns_user_code() {
        let mut state = test_state();
        {
            let mut asm = state.assembler(0);
            asm.push(42).unwrap();
            asm.extra(EXTRA_HALT as Word).unwrap();
        }
        assert_eq!(state.run(), VmError::Halt(42));
    }

    #[test]
    fn check_trap_delegates_to_handler() {
        struct AddTrap;
        impl TrapHandler for AddTrap {
            fn trap(&mut self, state: &mut State) -> Word {
                let b = match state.stack_mut().pop() {
                    Ok(value) => value,
                    Err(error) => return error.code(),
                };
                let a = match state.stack_mut().pop() {
                    Ok(value) => value,
                    Err(error) => return error.code(),
                };
                match state.stack_mut().push(a + b) {
                    Ok(()) => 0,
                    Err(error) => error.code(),
                }
            }
        }

        let mut state = test_state();
        state.set_trap_handler(Box::new(AddTrap));
        push_all(&mut state, &[2, 3]);
        exec(&mut state, OP_TRAP).unwrap();
        assert_eq!(state.stack().as_slice(), [5]);
    }

    #[test]
    fn check_trap_without_handler_is_invalid() {
        let mut state = test_state();
        assert_eq!(exec(&mut state, OP_TRAP), Err(VmError::InvalidOpcode));
    }

    #[test]
    fn check_this_state_and_register_extras() {
        let mut state = test_state();
        exec_extra(&mut state, EXTRA_THIS_STATE).unwrap();
        assert_eq!(state.stack().as_slice(), [CURRENT_STATE]);

        state.set_pc(6 * WORD_BYTES as UWord);
        exec_extra(&mut state, EXTRA_GET_PC).unwrap();
        assert_eq!(state.stack_mut().pop(), Ok(6 * WORD_BYTES as Word));

        // set_pc: value below the handle.
        push_all(&mut state, &[2 * WORD_BYTES as Word, CURRENT_STATE]);
        exec_extra(&mut state, EXTRA_SET_PC).unwrap();
        assert_eq!(state.pc(), 2 * WORD_BYTES as UWord);
    }

    #[test]
    fn check_stack_register_extras() {
        let mut state = test_state();
        push_all(&mut state, &[10, 20]);

        push_all(&mut state, &[CURRENT_STATE]);
        exec_extra(&mut state, EXTRA_GET_STACK_DEPTH).unwrap();
        assert_eq!(state.stack_mut().pop(), Ok(2));

        push_all(&mut state, &[32, CURRENT_STATE]);
        exec_extra(&mut state, EXTRA_SET_STACK_WORDS).unwrap();
        assert_eq!(state.stack().words(), 32);

        push_all(&mut state, &[0, CURRENT_STATE]);
        exec_extra(&mut state, EXTRA_SET_STACK_DEPTH).unwrap();
        assert_eq!(state.stack().depth(), 0);
    }

    #[test]
    fn check_raw_stack_extras_are_reserved() {
        let mut state = test_state();
        push_all(&mut state, &[CURRENT_STATE]);
        assert_eq!(
            exec_extra(&mut state, EXTRA_GET_STACK),
            Err(VmError::InvalidOpcode)
        );
        assert_eq!(
            exec_extra(&mut state, EXTRA_SET_STACK),
            Err(VmError::InvalidOpcode)
        );
    }

    #[test]
    fn check_sizeof_state_is_positive() {
        let mut state = test_state();
        exec_extra(&mut state, EXTRA_SIZEOF_STATE).unwrap();
        assert!(state.stack_mut().pop().unwrap() > 0);
    }

    #[test]
    fn check_driving_an_adopted_child() {
        let mut parent = test_state();
        let mut child = State::new(4 * WORD_BYTES, 4);
        child.stack_mut().push(99).unwrap();
        let handle = parent.adopt(child);
        assert_eq!(handle, 1);

        // pop_stack pushes the popped value, then the result code.
        push_all(&mut parent, &[handle]);
        exec_extra(&mut parent, EXTRA_POP_STACK).unwrap();
        assert_eq!(parent.stack().as_slice(), [99, 0]);

        // Popping again underflows; the code reports it without raising.
        parent.stack_mut().set_depth(0).unwrap();
        push_all(&mut parent, &[handle]);
        exec_extra(&mut parent, EXTRA_POP_STACK).unwrap();
        assert_eq!(
            parent.stack().as_slice(),
            [0, VmError::InvalidStackRead.code()]
        );

        // push_stack, then stack_position can read it back.
        parent.stack_mut().set_depth(0).unwrap();
        push_all(&mut parent, &[77, handle]);
        exec_extra(&mut parent, EXTRA_PUSH_STACK).unwrap();
        assert_eq!(parent.stack().as_slice(), [0]);
        parent.stack_mut().set_depth(0).unwrap();
        push_all(&mut parent, &[0, handle]);
        exec_extra(&mut parent, EXTRA_STACK_POSITION).unwrap();
        assert_eq!(parent.stack().as_slice(), [77]);
    }

    #[test]
    fn check_running_a_child_returns_its_code() {
        let mut parent = test_state();
        let mut child = State::new(64 * WORD_BYTES, 4);
        {
            let mut asm = child.assembler(0);
            asm.push(7).unwrap();
            asm.extra(EXTRA_HALT as Word).unwrap();
        }
        let handle = parent.adopt(child);
        push_all(&mut parent, &[handle]);
        exec_extra(&mut parent, EXTRA_RUN).unwrap();
        assert_eq!(parent.stack().as_slice(), [7]);
    }

    #[test]
    fn check_unknown_handle_is_a_wild_pointer() {
        let mut state = test_state();
        push_all(&mut state, &[5]);
        assert_eq!(
            exec_extra(&mut state, EXTRA_GET_PC),
            Err(VmError::InvalidMemoryRead)
        );
    }

    #[test]
    fn check_unknown_extra_opcode_is_invalid() {
        let mut state = test_state();
        assert_eq!(
            exec_extra(&mut state, 0x7777),
            Err(VmError::InvalidOpcode)
        );
        // A negative escape word is a huge unsigned extra opcode.
        state.set_ir((-2 as Word) << 8 | OP_NEXT as Word);
        assert_eq!(state.single_step(), Err(VmError::InvalidOpcode));
    }

    #[test]
    fn check_argc_argv() {
        let mut state = test_state();
        // Without arguments installed both extras push zero.
        exec_extra(&mut state, EXTRA_ARGC).unwrap();
        exec_extra(&mut state, EXTRA_ARGV).unwrap();
        assert_eq!(state.stack().as_slice(), [0, 0]);
        state.stack_mut().set_depth(0).unwrap();

        let table = state
            .load_args(16 * WORD_BYTES as UWord, &["vm", "image"])
            .unwrap();
        exec_extra(&mut state, EXTRA_ARGC).unwrap();
        exec_extra(&mut state, EXTRA_ARGV).unwrap();
        assert_eq!(state.stack().as_slice(), [2, table as Word]);

        // The first table entry points at the first NUL-terminated string.
        let arg0 = state.memory().load(table, Wordsize::Word).unwrap() as UWord;
        assert_eq!(state.memory().read_bytes(arg0, 3).unwrap(), b"vm\0");
    }

    #[test]
    fn check_packed_opcodes_execute_in_order() {
        let mut state = test_state();
        push_all(&mut state, &[2, 3]);
        // add, then pushi 0: one word, low byte first.
        state.set_ir((opcode_pushi(0) as Word) << 8 | OP_ADD as Word);
        state.single_step().unwrap();
        assert_eq!(state.stack().as_slice(), [5]);
        state.single_step().unwrap();
        assert_eq!(state.stack().as_slice(), [5, 0]);
        // The zero filler then refetches without touching the stack.
        state.single_step().unwrap();
        assert_eq!(state.stack().as_slice(), [5, 0]);
    }

    #[quickcheck]
    fn prop_invariants_hold_after_successful_steps(words: Vec<Word>) -> bool {
        let size = 64 * WORD_BYTES;
        let mut state = State::new(size, 8);
        for (i, word) in words.iter().take(32).enumerate() {
            state
                .memory_mut()
                .store((i * WORD_BYTES) as UWord, *word, Wordsize::Word)
                .unwrap();
        }
        for _ in 0..256 {
            match state.single_step() {
                Ok(()) => {
                    if !crate::word::is_aligned(state.pc())
                        || state.stack().depth() > state.stack().words()
                        || state.memory().size() != size
                    {
                        return false;
                    }
                }
                Err(_) => break,
            }
        }
        true
    }
}
