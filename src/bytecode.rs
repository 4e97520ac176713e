use std::collections::HashMap;
use std::fmt;

use anyhow::{Result, bail};
use num_bigint::BigInt;
use num_traits::{One, Zero};

use crate::ast::{BinaryOp, Expr, Program, Stmt, UnaryOp};
use crate::binder::{Bindings, Builtin, Callee, FunctionInfo};

/// Stack-machine instruction set consumed by the VM.
///
/// Every expression leaves exactly one value on the operand stack; operators
/// and calls consume their operands from it. Jump and call operands hold
/// label indices during generation and absolute instruction addresses after
/// `compile` resolves them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    PushImm(BigInt),
    LoadGlobal(usize),
    StoreGlobal(usize),
    LoadLocal(usize),
    StoreLocal(usize),
    Dup,
    Pop,

    Add,
    Sub,
    Mul,
    Div,
    Mod,

    Shl,
    Shr,
    And,
    Or,
    Xor,
    Not,

    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,

    LAnd,
    LOr,
    LNot,

    Neg,
    Pos,

    Jmp(usize),
    Jz(usize),
    Jnz(usize),

    Call { func: usize, argc: usize },
    Ret,

    ReadInt,
    PrintInt,
    Halt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionEntry {
    pub name: String,
    pub entry: usize,
    pub arity: usize,
    pub frame_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledProgram {
    pub instructions: Vec<Instruction>,
    pub globals_count: usize,
    pub functions: Vec<FunctionEntry>,
    pub main: usize,
}

/// Compiles a bound program to bytecode. Functions are laid out in
/// declaration order; jump targets are emitted as labels and resolved to
/// absolute addresses in a final fixup pass.
pub fn compile(program: &Program, bindings: &Bindings) -> Result<CompiledProgram> {
    let mut generator = CodeGen {
        bindings,
        code: Vec::new(),
        labels: Vec::new(),
    };

    let mut functions = Vec::with_capacity(program.functions.len());
    for (index, func) in program.functions.iter().enumerate() {
        let info = &bindings.functions[index];
        functions.push(FunctionEntry {
            name: info.name.clone(),
            entry: generator.code.len(),
            arity: info.params.len(),
            frame_size: info.frame_size,
        });
        for statement in &func.body.statements {
            generator.compile_stmt(statement, info)?;
        }
        // Implicit epilogue for falling off the end without `return`.
        generator.emit(Instruction::PushImm(BigInt::zero()));
        generator.emit(Instruction::Ret);
    }

    generator.resolve_labels()?;
    Ok(CompiledProgram {
        instructions: generator.code,
        globals_count: bindings.globals_count,
        functions,
        main: bindings.main_index,
    })
}

struct CodeGen<'a> {
    bindings: &'a Bindings,
    code: Vec<Instruction>,
    labels: Vec<Option<usize>>,
}

impl<'a> CodeGen<'a> {
    fn emit(&mut self, instruction: Instruction) {
        self.code.push(instruction);
    }

    fn new_label(&mut self) -> usize {
        self.labels.push(None);
        self.labels.len() - 1
    }

    fn bind_label(&mut self, label: usize) {
        self.labels[label] = Some(self.code.len());
    }

    fn resolve_labels(&mut self) -> Result<()> {
        for instruction in &mut self.code {
            if let Instruction::Jmp(target) | Instruction::Jz(target) | Instruction::Jnz(target) =
                instruction
            {
                *target = match self.labels.get(*target).copied().flatten() {
                    Some(address) => address,
                    None => bail!("Unresolved label {target}"),
                };
            }
        }
        Ok(())
    }

    fn compile_stmt(&mut self, statement: &Stmt, info: &FunctionInfo) -> Result<()> {
        match statement {
            Stmt::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let else_label = self.new_label();
                let end_label = self.new_label();
                self.compile_expr(condition, info)?;
                self.emit(Instruction::Jz(else_label));
                self.compile_stmt(then_branch, info)?;
                self.emit(Instruction::Jmp(end_label));
                self.bind_label(else_label);
                if let Some(else_branch) = else_branch {
                    self.compile_stmt(else_branch, info)?;
                }
                self.bind_label(end_label);
            }
            Stmt::While { condition, body } => {
                let top_label = self.new_label();
                let end_label = self.new_label();
                self.bind_label(top_label);
                self.compile_expr(condition, info)?;
                self.emit(Instruction::Jz(end_label));
                self.compile_stmt(body, info)?;
                self.emit(Instruction::Jmp(top_label));
                self.bind_label(end_label);
            }
            Stmt::Block(statements) => {
                for statement in statements {
                    self.compile_stmt(statement, info)?;
                }
            }
            Stmt::Return(value) => {
                self.compile_expr(value, info)?;
                self.emit(Instruction::Ret);
            }
            Stmt::Expr(expr) => {
                self.compile_expr(expr, info)?;
                self.emit(Instruction::Pop);
            }
            Stmt::Pass => {}
        }
        Ok(())
    }

    fn compile_expr(&mut self, expr: &Expr, info: &FunctionInfo) -> Result<()> {
        match expr {
            Expr::Number(value) => self.emit(Instruction::PushImm(value.clone())),
            Expr::Var(name) => {
                self.emit(self.load_instruction(name, info)?);
            }
            Expr::Unary { op, operand } => {
                self.compile_expr(operand, info)?;
                self.emit(match op {
                    UnaryOp::Plus => Instruction::Pos,
                    UnaryOp::Neg => Instruction::Neg,
                    UnaryOp::Not => Instruction::LNot,
                    UnaryOp::BitNot => Instruction::Not,
                });
            }
            Expr::Binary { op, lhs, rhs } => self.compile_binary(*op, lhs, rhs, info)?,
            Expr::Call { callee, args } => self.compile_call(callee, args, info)?,
        }
        Ok(())
    }

    fn compile_binary(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        info: &FunctionInfo,
    ) -> Result<()> {
        match op {
            BinaryOp::Assign => {
                let Expr::Var(name) = lhs else {
                    bail!("Left operand of '=' is not a variable");
                };
                self.compile_expr(rhs, info)?;
                // The stored value stays on the stack as the expression value.
                self.emit(Instruction::Dup);
                self.emit(self.store_instruction(name, info)?);
            }
            BinaryOp::And => {
                let short_label = self.new_label();
                let end_label = self.new_label();
                self.compile_expr(lhs, info)?;
                self.emit(Instruction::Jz(short_label));
                self.compile_expr(rhs, info)?;
                self.emit(Instruction::LNot);
                self.emit(Instruction::LNot);
                self.emit(Instruction::Jmp(end_label));
                self.bind_label(short_label);
                self.emit(Instruction::PushImm(BigInt::zero()));
                self.bind_label(end_label);
            }
            BinaryOp::Or => {
                let short_label = self.new_label();
                let end_label = self.new_label();
                self.compile_expr(lhs, info)?;
                self.emit(Instruction::Jnz(short_label));
                self.compile_expr(rhs, info)?;
                self.emit(Instruction::LNot);
                self.emit(Instruction::LNot);
                self.emit(Instruction::Jmp(end_label));
                self.bind_label(short_label);
                self.emit(Instruction::PushImm(BigInt::one()));
                self.bind_label(end_label);
            }
            _ => {
                self.compile_expr(lhs, info)?;
                self.compile_expr(rhs, info)?;
                self.emit(match op {
                    BinaryOp::Mul => Instruction::Mul,
                    BinaryOp::Div => Instruction::Div,
                    BinaryOp::Mod => Instruction::Mod,
                    BinaryOp::Add => Instruction::Add,
                    BinaryOp::Sub => Instruction::Sub,
                    BinaryOp::Shl => Instruction::Shl,
                    BinaryOp::Shr => Instruction::Shr,
                    BinaryOp::Lt => Instruction::Lt,
                    BinaryOp::Le => Instruction::Le,
                    BinaryOp::Gt => Instruction::Gt,
                    BinaryOp::Ge => Instruction::Ge,
                    BinaryOp::Eq => Instruction::Eq,
                    BinaryOp::Ne => Instruction::Ne,
                    BinaryOp::BitAnd => Instruction::And,
                    BinaryOp::BitXor => Instruction::Xor,
                    BinaryOp::BitOr => Instruction::Or,
                    BinaryOp::Assign | BinaryOp::And | BinaryOp::Or => unreachable!(),
                });
            }
        }
        Ok(())
    }

    /// Arguments are evaluated in the callee's declared parameter order, not
    /// in call-site order.
    fn compile_call(
        &mut self,
        callee: &str,
        args: &[(String, Expr)],
        info: &FunctionInfo,
    ) -> Result<()> {
        match self.bindings.callee(callee) {
            Some(Callee::Builtin(builtin)) => {
                for &param in builtin.params() {
                    self.compile_argument(callee, args, param, info)?;
                }
                self.emit(match builtin {
                    Builtin::Input => Instruction::ReadInt,
                    Builtin::Print => Instruction::PrintInt,
                    Builtin::Exit => Instruction::Halt,
                });
            }
            Some(Callee::Function(index)) => {
                let bindings = self.bindings;
                let params = &bindings.functions[index].params;
                for param in params {
                    self.compile_argument(callee, args, param, info)?;
                }
                self.emit(Instruction::Call {
                    func: index,
                    argc: params.len(),
                });
            }
            None => bail!("Function '{callee}' is not defined"),
        }
        Ok(())
    }

    fn compile_argument(
        &mut self,
        callee: &str,
        args: &[(String, Expr)],
        param: &str,
        info: &FunctionInfo,
    ) -> Result<()> {
        let Some((_, value)) = args.iter().find(|(name, _)| name == param) else {
            bail!("Missing argument '{param}' in call to '{callee}'");
        };
        self.compile_expr(value, info)
    }

    fn load_instruction(&self, name: &str, info: &FunctionInfo) -> Result<Instruction> {
        if let Some(&slot) = info.slots.get(name) {
            Ok(Instruction::LoadLocal(slot))
        } else if let Some(&slot) = self.bindings.globals.get(name) {
            Ok(Instruction::LoadGlobal(slot))
        } else {
            bail!("Unresolved variable '{name}'")
        }
    }

    fn store_instruction(&self, name: &str, info: &FunctionInfo) -> Result<Instruction> {
        if let Some(&slot) = info.slots.get(name) {
            Ok(Instruction::StoreLocal(slot))
        } else if let Some(&slot) = self.bindings.globals.get(name) {
            Ok(Instruction::StoreGlobal(slot))
        } else {
            bail!("Unresolved variable '{name}'")
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PushImm(value) => write!(f, "push_imm {value}"),
            Self::LoadGlobal(slot) => write!(f, "load_global {slot}"),
            Self::StoreGlobal(slot) => write!(f, "store_global {slot}"),
            Self::LoadLocal(slot) => write!(f, "load_local {slot}"),
            Self::StoreLocal(slot) => write!(f, "store_local {slot}"),
            Self::Dup => write!(f, "dup"),
            Self::Pop => write!(f, "pop"),
            Self::Add => write!(f, "add"),
            Self::Sub => write!(f, "sub"),
            Self::Mul => write!(f, "mul"),
            Self::Div => write!(f, "div"),
            Self::Mod => write!(f, "mod"),
            Self::Shl => write!(f, "shl"),
            Self::Shr => write!(f, "shr"),
            Self::And => write!(f, "and"),
            Self::Or => write!(f, "or"),
            Self::Xor => write!(f, "xor"),
            Self::Not => write!(f, "not"),
            Self::Lt => write!(f, "lt"),
            Self::Le => write!(f, "le"),
            Self::Gt => write!(f, "gt"),
            Self::Ge => write!(f, "ge"),
            Self::Eq => write!(f, "eq"),
            Self::Ne => write!(f, "ne"),
            Self::LAnd => write!(f, "land"),
            Self::LOr => write!(f, "lor"),
            Self::LNot => write!(f, "lnot"),
            Self::Neg => write!(f, "neg"),
            Self::Pos => write!(f, "pos"),
            Self::Jmp(addr) => write!(f, "jmp {addr}"),
            Self::Jz(addr) => write!(f, "jz {addr}"),
            Self::Jnz(addr) => write!(f, "jnz {addr}"),
            Self::Call { func, argc } => write!(f, "call {func}, {argc}"),
            Self::Ret => write!(f, "ret"),
            Self::ReadInt => write!(f, "read_int"),
            Self::PrintInt => write!(f, "print_int"),
            Self::Halt => write!(f, "halt"),
        }
    }
}

/// Renders the bytecode with one instruction per line, labelling function
/// entry points by name.
pub fn disassemble(program: &CompiledProgram) -> String {
    let entry_names: HashMap<usize, &str> = program
        .functions
        .iter()
        .map(|entry| (entry.entry, entry.name.as_str()))
        .collect();

    let mut out = String::new();
    for (address, instruction) in program.instructions.iter().enumerate() {
        if let Some(name) = entry_names.get(&address) {
            out.push_str(name);
            out.push_str(":\n");
        }
        out.push_str(&format!("{address:>5}\t{instruction}\n"));
    }
    out
}
