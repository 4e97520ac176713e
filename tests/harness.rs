use std::fs;
use std::io::Cursor;
use std::path::Path;

use anyhow::{Context, Result, ensure};

use funclang::bytecode::CompiledProgram;
use funclang::{binder, bytecode, lexer, parser, vm};

mod common;
use common::{Case, CaseClass, load_cases, normalize_output};

fn compile_case(source: &str) -> Result<CompiledProgram> {
    let tokens = lexer::tokenize(source)?;
    let program = parser::parse_tokens(tokens)?;
    let bindings = binder::bind(&program)?;
    bytecode::compile(&program, &bindings)
}

fn expected_error(case: &Case) -> Result<&str> {
    case.spec
        .expected
        .stderr_contains
        .as_deref()
        .with_context(|| format!("Missing stderr_contains in {}", case.name))
}

fn run_case(case: &Case) -> Result<()> {
    let source = fs::read_to_string(&case.program_path)
        .with_context(|| format!("Reading {}", case.name))?;
    let compiled = compile_case(&source);

    match case.spec.class {
        CaseClass::FrontendError => {
            ensure!(
                case.spec.expected.exit_code == 1,
                "Case {} expected exit code must be 1 for frontend_error",
                case.name
            );
            let expected = expected_error(case)?;
            let error = match compiled {
                Err(error) => error.to_string(),
                Ok(_) => anyhow::bail!("Expected frontend error in {}, but compilation succeeded", case.name),
            };
            ensure!(
                error.contains(expected),
                "Expected frontend error containing '{expected}' in {}, got '{error}'",
                case.name
            );
        }
        CaseClass::RuntimeSuccess => {
            ensure!(
                case.spec.expected.exit_code >= 0,
                "Case {} expected exit code must be non-negative for runtime_success",
                case.name
            );
            let compiled =
                compiled.with_context(|| format!("Compiling {}", case.name))?;
            let stdin_data = match case.spec.stdin_file.as_deref() {
                Some(path) => case.read_text(path)?,
                None => String::new(),
            };
            let mut output = Vec::new();
            let mut machine = vm::Vm::new(Cursor::new(stdin_data), &mut output);
            let status = machine
                .run(&compiled)
                .with_context(|| format!("Running {}", case.name))?;
            assert_eq!(
                vm::exit_code(&status),
                case.spec.expected.exit_code,
                "Exit code mismatch for {}",
                case.name
            );
            let actual = normalize_output(&String::from_utf8(output)?);
            let expected = match case.spec.expected.stdout_file.as_deref() {
                Some(path) => normalize_output(&case.read_text(path)?),
                None => String::new(),
            };
            assert_eq!(actual, expected, "Stdout mismatch for {}", case.name);
        }
        CaseClass::RuntimeError => {
            ensure!(
                case.spec.expected.exit_code == 1,
                "Case {} expected exit code must be 1 for runtime_error",
                case.name
            );
            let expected = expected_error(case)?;
            let compiled =
                compiled.with_context(|| format!("Compiling {}", case.name))?;
            let stdin_data = match case.spec.stdin_file.as_deref() {
                Some(path) => case.read_text(path)?,
                None => String::new(),
            };
            let mut output = Vec::new();
            let mut machine = vm::Vm::new(Cursor::new(stdin_data), &mut output);
            let result = machine.run(&compiled);
            let error = match result {
                Err(error) => error.to_string(),
                Ok(status) => anyhow::bail!(
                    "Expected runtime error in {}, but run ended with {status:?}",
                    case.name
                ),
            };
            ensure!(
                error.contains(expected),
                "Expected runtime error containing '{expected}' in {}, got '{error}'",
                case.name
            );
        }
    }
    Ok(())
}

#[test]
fn runs_program_cases() -> Result<()> {
    for case in load_cases(Path::new("tests/programs"))? {
        run_case(&case)?;
    }
    Ok(())
}
