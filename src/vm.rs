use std::collections::VecDeque;
use std::io::{BufRead, Write};

use anyhow::{Context, Result, bail};
use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};

use crate::bytecode::{CompiledProgram, Instruction};

/// How a program run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    /// `main` returned this value.
    Returned(BigInt),
    /// `exit()` executed.
    Halted,
    /// The configured fuel budget ran out before the program ended.
    OutOfFuel,
}

/// Process exit code for a finished run: the low byte of `main`'s return
/// value, or 0 for an explicit `exit()`.
pub fn exit_code(status: &ExitStatus) -> i32 {
    match status {
        ExitStatus::Returned(value) => {
            let modulus = BigInt::from(256);
            let mut code = value % &modulus;
            if code.is_negative() {
                code += &modulus;
            }
            code.to_i32().unwrap_or(0)
        }
        ExitStatus::Halted => 0,
        ExitStatus::OutOfFuel => 1,
    }
}

/// One call activation: parameter and local slots in a single contiguous
/// vector, the caller's resume address, and the operand-stack depth at
/// entry (restored on return).
struct Frame {
    locals: Vec<BigInt>,
    return_addr: usize,
    stack_base: usize,
}

pub struct Vm<R, W> {
    input: R,
    output: W,
    pending_input: VecDeque<String>,
    globals: Vec<BigInt>,
    fuel: Option<u64>,
}

impl<R: BufRead, W: Write> Vm<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self {
            input,
            output,
            pending_input: VecDeque::new(),
            globals: Vec::new(),
            fuel: None,
        }
    }

    /// Bounds the run to at most `fuel` executed instructions; exceeding the
    /// budget ends the run with `ExitStatus::OutOfFuel` instead of an error.
    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.fuel = Some(fuel);
        self
    }

    /// Reads a global slot after a run, for harnesses inspecting state.
    pub fn global(&self, slot: usize) -> Option<&BigInt> {
        self.globals.get(slot)
    }

    pub fn run(&mut self, program: &CompiledProgram) -> Result<ExitStatus> {
        self.globals = vec![BigInt::zero(); program.globals_count];

        let main = program
            .functions
            .get(program.main)
            .with_context(|| format!("Unknown function index {}", program.main))?;
        let mut stack: Vec<BigInt> = Vec::new();
        let mut frames = vec![Frame {
            locals: vec![BigInt::zero(); main.frame_size],
            return_addr: 0,
            stack_base: 0,
        }];
        let mut pc = main.entry;
        let mut steps: u64 = 0;

        loop {
            if let Some(fuel) = self.fuel
                && steps >= fuel
            {
                return Ok(ExitStatus::OutOfFuel);
            }
            steps += 1;

            let instruction = program
                .instructions
                .get(pc)
                .with_context(|| format!("Program counter {pc} out of range"))?;
            pc += 1;

            match instruction {
                Instruction::PushImm(value) => stack.push(value.clone()),
                Instruction::LoadGlobal(slot) => {
                    let value = self
                        .globals
                        .get(*slot)
                        .with_context(|| format!("Invalid global slot {slot}"))?
                        .clone();
                    stack.push(value);
                }
                Instruction::StoreGlobal(slot) => {
                    let value = pop(&mut stack)?;
                    let cell = self
                        .globals
                        .get_mut(*slot)
                        .with_context(|| format!("Invalid global slot {slot}"))?;
                    *cell = value;
                }
                Instruction::LoadLocal(slot) => {
                    let frame = current_frame(&frames)?;
                    let value = frame
                        .locals
                        .get(*slot)
                        .with_context(|| format!("Invalid local slot {slot}"))?
                        .clone();
                    stack.push(value);
                }
                Instruction::StoreLocal(slot) => {
                    let value = pop(&mut stack)?;
                    let frame = current_frame_mut(&mut frames)?;
                    let cell = frame
                        .locals
                        .get_mut(*slot)
                        .with_context(|| format!("Invalid local slot {slot}"))?;
                    *cell = value;
                }
                Instruction::Dup => {
                    let top = stack.last().context("Stack underflow")?.clone();
                    stack.push(top);
                }
                Instruction::Pop => {
                    pop(&mut stack)?;
                }

                Instruction::Add => {
                    let (lhs, rhs) = pop_pair(&mut stack)?;
                    stack.push(lhs + rhs);
                }
                Instruction::Sub => {
                    let (lhs, rhs) = pop_pair(&mut stack)?;
                    stack.push(lhs - rhs);
                }
                Instruction::Mul => {
                    let (lhs, rhs) = pop_pair(&mut stack)?;
                    stack.push(lhs * rhs);
                }
                Instruction::Div => {
                    let (lhs, rhs) = pop_pair(&mut stack)?;
                    if rhs.is_zero() {
                        bail!("Division by zero");
                    }
                    // BigInt division truncates toward zero; the remainder
                    // sign follows the dividend.
                    stack.push(lhs / rhs);
                }
                Instruction::Mod => {
                    let (lhs, rhs) = pop_pair(&mut stack)?;
                    if rhs.is_zero() {
                        bail!("Modulo by zero");
                    }
                    stack.push(lhs % rhs);
                }

                Instruction::Shl => {
                    let (lhs, rhs) = pop_pair(&mut stack)?;
                    stack.push(lhs << shift_count(&rhs)?);
                }
                Instruction::Shr => {
                    let (lhs, rhs) = pop_pair(&mut stack)?;
                    stack.push(lhs >> shift_count(&rhs)?);
                }
                Instruction::And => {
                    let (lhs, rhs) = pop_pair(&mut stack)?;
                    stack.push(lhs & rhs);
                }
                Instruction::Or => {
                    let (lhs, rhs) = pop_pair(&mut stack)?;
                    stack.push(lhs | rhs);
                }
                Instruction::Xor => {
                    let (lhs, rhs) = pop_pair(&mut stack)?;
                    stack.push(lhs ^ rhs);
                }
                Instruction::Not => {
                    let value = pop(&mut stack)?;
                    stack.push(-value - 1);
                }

                Instruction::Lt => {
                    let (lhs, rhs) = pop_pair(&mut stack)?;
                    stack.push(bool_value(lhs < rhs));
                }
                Instruction::Le => {
                    let (lhs, rhs) = pop_pair(&mut stack)?;
                    stack.push(bool_value(lhs <= rhs));
                }
                Instruction::Gt => {
                    let (lhs, rhs) = pop_pair(&mut stack)?;
                    stack.push(bool_value(lhs > rhs));
                }
                Instruction::Ge => {
                    let (lhs, rhs) = pop_pair(&mut stack)?;
                    stack.push(bool_value(lhs >= rhs));
                }
                Instruction::Eq => {
                    let (lhs, rhs) = pop_pair(&mut stack)?;
                    stack.push(bool_value(lhs == rhs));
                }
                Instruction::Ne => {
                    let (lhs, rhs) = pop_pair(&mut stack)?;
                    stack.push(bool_value(lhs != rhs));
                }

                Instruction::LAnd => {
                    let (lhs, rhs) = pop_pair(&mut stack)?;
                    stack.push(bool_value(!lhs.is_zero() && !rhs.is_zero()));
                }
                Instruction::LOr => {
                    let (lhs, rhs) = pop_pair(&mut stack)?;
                    stack.push(bool_value(!lhs.is_zero() || !rhs.is_zero()));
                }
                Instruction::LNot => {
                    let value = pop(&mut stack)?;
                    stack.push(bool_value(value.is_zero()));
                }

                Instruction::Neg => {
                    let value = pop(&mut stack)?;
                    stack.push(-value);
                }
                Instruction::Pos => {}

                Instruction::Jmp(addr) => {
                    pc = jump_target(*addr, program)?;
                }
                Instruction::Jz(addr) => {
                    if pop(&mut stack)?.is_zero() {
                        pc = jump_target(*addr, program)?;
                    }
                }
                Instruction::Jnz(addr) => {
                    if !pop(&mut stack)?.is_zero() {
                        pc = jump_target(*addr, program)?;
                    }
                }

                Instruction::Call { func, argc } => {
                    let entry = program
                        .functions
                        .get(*func)
                        .with_context(|| format!("Unknown function index {func}"))?;
                    if *argc != entry.arity {
                        bail!(
                            "Function '{}' called with {argc} arguments, expects {}",
                            entry.name,
                            entry.arity
                        );
                    }
                    let mut locals = vec![BigInt::zero(); entry.frame_size];
                    // Arguments were pushed in declared parameter order.
                    for slot in (0..*argc).rev() {
                        locals[slot] = pop(&mut stack)?;
                    }
                    frames.push(Frame {
                        locals,
                        return_addr: pc,
                        stack_base: stack.len(),
                    });
                    pc = entry.entry;
                }
                Instruction::Ret => {
                    let value = pop(&mut stack)?;
                    let frame = frames.pop().context("Call stack underflow")?;
                    stack.truncate(frame.stack_base);
                    if frames.is_empty() {
                        return Ok(ExitStatus::Returned(value));
                    }
                    stack.push(value);
                    pc = frame.return_addr;
                }

                Instruction::ReadInt => {
                    let value = self.read_int()?;
                    stack.push(value);
                }
                Instruction::PrintInt => {
                    let value = pop(&mut stack)?;
                    writeln!(self.output, "{value}").context("Writing output")?;
                    stack.push(BigInt::zero());
                }
                Instruction::Halt => return Ok(ExitStatus::Halted),
            }
        }
    }

    /// Reads the next whitespace-delimited decimal integer.
    fn read_int(&mut self) -> Result<BigInt> {
        loop {
            if let Some(token) = self.pending_input.pop_front() {
                return token
                    .parse::<BigInt>()
                    .with_context(|| format!("Invalid integer input '{token}'"));
            }
            let mut line = String::new();
            let read = self.input.read_line(&mut line).context("Reading input")?;
            if read == 0 {
                bail!("Unexpected end of input");
            }
            self.pending_input
                .extend(line.split_whitespace().map(str::to_string));
        }
    }
}

fn pop(stack: &mut Vec<BigInt>) -> Result<BigInt> {
    stack.pop().context("Stack underflow")
}

fn pop_pair(stack: &mut Vec<BigInt>) -> Result<(BigInt, BigInt)> {
    let rhs = pop(stack)?;
    let lhs = pop(stack)?;
    Ok((lhs, rhs))
}

fn bool_value(condition: bool) -> BigInt {
    if condition {
        BigInt::from(1)
    } else {
        BigInt::zero()
    }
}

fn shift_count(count: &BigInt) -> Result<usize> {
    if count.is_negative() {
        bail!("Negative shift count");
    }
    count
        .to_usize()
        .with_context(|| format!("Shift count {count} too large"))
}

fn jump_target(addr: usize, program: &CompiledProgram) -> Result<usize> {
    if addr >= program.instructions.len() {
        bail!("Invalid jump target {addr}");
    }
    Ok(addr)
}

fn current_frame(frames: &[Frame]) -> Result<&Frame> {
    frames.last().context("Call stack underflow")
}

fn current_frame_mut(frames: &mut [Frame]) -> Result<&mut Frame> {
    frames.last_mut().context("Call stack underflow")
}
