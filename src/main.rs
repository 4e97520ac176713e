use std::fs;
use std::io;

use anyhow::{Context, Result, bail};
use funclang::{binder, bytecode, lexer, parser, vm};

const USAGE: &str = "\
Usage: funclang <file> [Option]
Option:
    --dump-ast       print a structural view of the AST and exit
    --dump-assembly  print the bytecode disassembly and exit
    -h, --help       print this help message and exit
";

fn main() -> Result<()> {
    let mut dump_ast = false;
    let mut dump_assembly = false;
    let mut input_path: Option<String> = None;

    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--dump-ast" => dump_ast = true,
            "--dump-assembly" => dump_assembly = true,
            "-h" | "--help" => {
                print!("{USAGE}");
                return Ok(());
            }
            _ => {
                if input_path.is_some() {
                    bail!("Only one input file is supported");
                }
                input_path = Some(arg);
            }
        }
    }

    let Some(path) = input_path else {
        bail!("Missing input file\n{USAGE}");
    };
    let source = fs::read_to_string(&path).with_context(|| format!("Reading {path}"))?;

    let tokens = lexer::tokenize(&source)?;
    let program = parser::parse_tokens(tokens)?;
    let bindings = binder::bind(&program)?;

    if dump_ast {
        print!("{program}");
        return Ok(());
    }

    let compiled = bytecode::compile(&program, &bindings)?;
    if dump_assembly {
        print!("{}", bytecode::disassemble(&compiled));
        return Ok(());
    }

    let stdin = io::stdin();
    let mut machine = vm::Vm::new(stdin.lock(), io::stdout());
    let status = machine.run(&compiled)?;
    std::process::exit(vm::exit_code(&status));
}
