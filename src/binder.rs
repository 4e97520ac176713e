use std::collections::{HashMap, HashSet};

use anyhow::{Result, bail};

use crate::ast::{Body, Expr, FuncDecl, Program, Stmt, Type};

/// I/O and process-control primitives. They take part in call checking like
/// user functions but lower to dedicated opcodes instead of `Call`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Input,
    Print,
    Exit,
}

impl Builtin {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "input" => Some(Self::Input),
            "print" => Some(Self::Print),
            "exit" => Some(Self::Exit),
            _ => None,
        }
    }

    pub fn params(self) -> &'static [&'static str] {
        match self {
            Self::Input | Self::Exit => &[],
            Self::Print => &["val"],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callee {
    Builtin(Builtin),
    Function(usize),
}

/// Per-function name resolution. Frame slots cover parameters first, then
/// locals; a local may shadow a parameter, in which case the name resolves
/// to the local slot.
#[derive(Debug, Clone)]
pub struct FunctionInfo {
    pub name: String,
    pub params: Vec<String>,
    pub slots: HashMap<String, usize>,
    pub frame_size: usize,
}

#[derive(Debug, Clone)]
pub struct Bindings {
    pub globals: HashMap<String, usize>,
    pub globals_count: usize,
    pub functions: Vec<FunctionInfo>,
    function_indices: HashMap<String, usize>,
    pub main_index: usize,
}

impl Bindings {
    pub fn callee(&self, name: &str) -> Option<Callee> {
        if let Some(builtin) = Builtin::from_name(name) {
            return Some(Callee::Builtin(builtin));
        }
        self.function_indices
            .get(name)
            .map(|&index| Callee::Function(index))
    }
}

/// Resolves every name in the program and validates call sites. Functions
/// are pre-registered so calls may precede their callee's declaration.
pub fn bind(program: &Program) -> Result<Bindings> {
    let mut globals = HashMap::new();
    for (slot, decl) in program.globals.iter().enumerate() {
        if globals.insert(decl.name.clone(), slot).is_some() {
            bail!("Redefinition of global variable '{}'", decl.name);
        }
    }

    let mut function_indices = HashMap::new();
    for (index, func) in program.functions.iter().enumerate() {
        if Builtin::from_name(&func.name).is_some() {
            bail!("Redefinition of builtin function '{}'", func.name);
        }
        if function_indices.insert(func.name.clone(), index).is_some() {
            bail!("Redefinition of function '{}'", func.name);
        }
    }

    let mut functions = Vec::with_capacity(program.functions.len());
    for func in &program.functions {
        functions.push(resolve_function_slots(func)?);
    }

    let bindings = Bindings {
        globals,
        globals_count: program.globals.len(),
        functions,
        function_indices,
        main_index: 0,
    };

    for (index, func) in program.functions.iter().enumerate() {
        check_body(&func.body, &bindings.functions[index], &bindings)?;
    }

    let Some(&main_index) = bindings.function_indices.get("main") else {
        bail!("No 'main' function defined");
    };
    let main = &program.functions[main_index];
    if !main.params.is_empty() {
        bail!("'main' must take no parameters");
    }
    if main.return_type != Type::Int {
        bail!("'main' must return Int");
    }

    Ok(Bindings {
        main_index,
        ..bindings
    })
}

fn resolve_function_slots(func: &FuncDecl) -> Result<FunctionInfo> {
    let mut slots = HashMap::new();
    let mut params = Vec::with_capacity(func.params.len());
    for (slot, (name, _)) in func.params.iter().enumerate() {
        if slots.insert(name.clone(), slot).is_some() {
            bail!(
                "Duplicate parameter '{}' in function '{}'",
                name,
                func.name
            );
        }
        params.push(name.clone());
    }

    let mut seen_locals = HashSet::new();
    for (offset, decl) in func.body.locals.iter().enumerate() {
        if !seen_locals.insert(decl.name.as_str()) {
            bail!(
                "Duplicate local variable '{}' in function '{}'",
                decl.name,
                func.name
            );
        }
        // Overwrites a same-named parameter entry: locals win the lookup.
        slots.insert(decl.name.clone(), func.params.len() + offset);
    }

    Ok(FunctionInfo {
        name: func.name.clone(),
        params,
        slots,
        frame_size: func.params.len() + func.body.locals.len(),
    })
}

fn check_body(body: &Body, info: &FunctionInfo, bindings: &Bindings) -> Result<()> {
    for statement in &body.statements {
        check_stmt(statement, info, bindings)?;
    }
    Ok(())
}

fn check_stmt(statement: &Stmt, info: &FunctionInfo, bindings: &Bindings) -> Result<()> {
    match statement {
        Stmt::If {
            condition,
            then_branch,
            else_branch,
        } => {
            check_expr(condition, info, bindings)?;
            check_stmt(then_branch, info, bindings)?;
            if let Some(else_branch) = else_branch {
                check_stmt(else_branch, info, bindings)?;
            }
        }
        Stmt::While { condition, body } => {
            check_expr(condition, info, bindings)?;
            check_stmt(body, info, bindings)?;
        }
        Stmt::Block(statements) => {
            for statement in statements {
                check_stmt(statement, info, bindings)?;
            }
        }
        Stmt::Return(value) => check_expr(value, info, bindings)?,
        Stmt::Expr(expr) => check_expr(expr, info, bindings)?,
        Stmt::Pass => {}
    }
    Ok(())
}

fn check_expr(expr: &Expr, info: &FunctionInfo, bindings: &Bindings) -> Result<()> {
    match expr {
        Expr::Number(_) => {}
        Expr::Var(name) => {
            if !info.slots.contains_key(name) && !bindings.globals.contains_key(name) {
                bail!("Variable '{name}' is not defined");
            }
        }
        Expr::Unary { operand, .. } => check_expr(operand, info, bindings)?,
        Expr::Binary { lhs, rhs, .. } => {
            check_expr(lhs, info, bindings)?;
            check_expr(rhs, info, bindings)?;
        }
        Expr::Call { callee, args } => {
            let params: Vec<&str> = match bindings.callee(callee) {
                Some(Callee::Builtin(builtin)) => builtin.params().to_vec(),
                Some(Callee::Function(index)) => bindings.functions[index]
                    .params
                    .iter()
                    .map(String::as_str)
                    .collect(),
                None => bail!("Function '{callee}' is not defined"),
            };
            check_call_arguments(callee, args, &params)?;
            for (_, value) in args {
                check_expr(value, info, bindings)?;
            }
        }
    }
    Ok(())
}

/// The argument-name multiset must equal the parameter-name set; order at
/// the call site does not matter.
fn check_call_arguments(callee: &str, args: &[(String, Expr)], params: &[&str]) -> Result<()> {
    if args.len() != params.len() {
        bail!(
            "Function '{callee}' expects {} arguments, got {}",
            params.len(),
            args.len()
        );
    }
    let mut arg_names: Vec<&str> = args.iter().map(|(name, _)| name.as_str()).collect();
    arg_names.sort_unstable();
    let mut param_names: Vec<&str> = params.to_vec();
    param_names.sort_unstable();
    if arg_names != param_names {
        for name in &arg_names {
            if !param_names.contains(name) {
                bail!("Unknown argument '{name}' in call to '{callee}'");
            }
        }
        bail!("Duplicate argument name in call to '{callee}'");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::parse_tokens;
    use indoc::indoc;

    fn bind_source(source: &str) -> Result<Bindings> {
        bind(&parse_tokens(tokenize(source).expect("tokenize should succeed"))?)
    }

    #[test]
    fn assigns_stable_slots_for_params_and_locals() {
        let bindings = bind_source(indoc! {"
            var g: Int
            var h: Int
            func f(a: Int, b: Int): Int {
                var x: Int
                return a + b + x + g
            }
            func main(): Int {
                return f(a: 1, b: 2)
            }
        "})
        .expect("bind should succeed");

        assert_eq!(bindings.globals_count, 2);
        assert_eq!(bindings.globals["g"], 0);
        assert_eq!(bindings.globals["h"], 1);

        let f = &bindings.functions[0];
        assert_eq!(f.params, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(f.slots["a"], 0);
        assert_eq!(f.slots["b"], 1);
        assert_eq!(f.slots["x"], 2);
        assert_eq!(f.frame_size, 3);
        assert_eq!(bindings.main_index, 1);
    }

    #[test]
    fn local_shadows_parameter() {
        let bindings = bind_source(indoc! {"
            func f(a: Int): Int {
                var a: Int
                return a
            }
            func main(): Int {
                return f(a: 1)
            }
        "})
        .expect("bind should succeed");
        assert_eq!(bindings.functions[0].slots["a"], 1);
        assert_eq!(bindings.functions[0].frame_size, 2);
    }

    #[test]
    fn supports_call_before_definition() {
        bind_source(indoc! {"
            func main(): Int {
                return later()
            }
            func later(): Int {
                return 1
            }
        "})
        .expect("bind should succeed");
    }

    #[test]
    fn errors_on_duplicate_global() {
        let err = bind_source(indoc! {"
            var g: Int
            var g: Int
            func main(): Int { return 0 }
        "})
        .expect_err("expected bind failure");
        assert_eq!(err.to_string(), "Redefinition of global variable 'g'");
    }

    #[test]
    fn errors_on_duplicate_parameter() {
        let err = bind_source(indoc! {"
            func f(a: Int, a: Int): Int { return 0 }
            func main(): Int { return 0 }
        "})
        .expect_err("expected bind failure");
        assert_eq!(err.to_string(), "Duplicate parameter 'a' in function 'f'");
    }

    #[test]
    fn errors_on_duplicate_local() {
        let err = bind_source(indoc! {"
            func main(): Int {
                var x: Int
                var x: Int
                return 0
            }
        "})
        .expect_err("expected bind failure");
        assert_eq!(
            err.to_string(),
            "Duplicate local variable 'x' in function 'main'"
        );
    }

    #[test]
    fn errors_on_unknown_variable() {
        let err = bind_source("func main(): Int { return ghost }")
            .expect_err("expected bind failure");
        assert_eq!(err.to_string(), "Variable 'ghost' is not defined");
    }

    #[test]
    fn errors_on_unknown_function() {
        let err = bind_source("func main(): Int { return ghost() }")
            .expect_err("expected bind failure");
        assert_eq!(err.to_string(), "Function 'ghost' is not defined");
    }

    #[test]
    fn errors_on_argument_count_mismatch() {
        let err = bind_source(indoc! {"
            func f(a: Int): Int { return a }
            func main(): Int { return f() }
        "})
        .expect_err("expected bind failure");
        assert_eq!(err.to_string(), "Function 'f' expects 1 arguments, got 0");
    }

    #[test]
    fn errors_on_unknown_argument_name() {
        let err = bind_source(indoc! {"
            func f(a: Int): Int { return a }
            func main(): Int { return f(b: 1) }
        "})
        .expect_err("expected bind failure");
        assert_eq!(err.to_string(), "Unknown argument 'b' in call to 'f'");
    }

    #[test]
    fn errors_on_duplicate_argument_name() {
        let err = bind_source(indoc! {"
            func f(a: Int, b: Int): Int { return a }
            func main(): Int { return f(a: 1, a: 2) }
        "})
        .expect_err("expected bind failure");
        assert_eq!(err.to_string(), "Duplicate argument name in call to 'f'");
    }

    #[test]
    fn errors_on_missing_main() {
        let err = bind_source("func helper(): Int { return 0 }")
            .expect_err("expected bind failure");
        assert_eq!(err.to_string(), "No 'main' function defined");
    }

    #[test]
    fn errors_on_main_with_parameters() {
        let err = bind_source("func main(a: Int): Int { return a }")
            .expect_err("expected bind failure");
        assert_eq!(err.to_string(), "'main' must take no parameters");
    }

    #[test]
    fn errors_on_builtin_redefinition() {
        let err = bind_source(indoc! {"
            func print(val: Int): Int { return val }
            func main(): Int { return 0 }
        "})
        .expect_err("expected bind failure");
        assert_eq!(err.to_string(), "Redefinition of builtin function 'print'");
    }

    #[test]
    fn checks_builtin_signatures() {
        bind_source(indoc! {"
            func main(): Int {
                print(val: input())
                exit()
                return 0
            }
        "})
        .expect("bind should succeed");

        let err = bind_source("func main(): Int { print(value: 1) return 0 }")
            .expect_err("expected bind failure");
        assert_eq!(err.to_string(), "Unknown argument 'value' in call to 'print'");

        let err = bind_source("func main(): Int { return input(x: 1) }")
            .expect_err("expected bind failure");
        assert_eq!(err.to_string(), "Function 'input' expects 0 arguments, got 1");
    }
}
