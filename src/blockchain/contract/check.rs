//! Static rejection of constructs that could reach outside the sandbox.
//!
//! Runs over the whole syntax tree before anything executes.

use super::parser::{Expr, Program, Stmt, Target};
use super::SandboxError;

/// Builtins giving reflective or dynamic access to the host.
const FORBIDDEN_NAMES: &[&str] = &[
    "getattr",
    "setattr",
    "delattr",
    "hasattr",
    "type",
    "vars",
    "dir",
    "globals",
    "locals",
    "eval",
    "exec",
    "compile",
    "open",
    "isinstance",
    "issubclass",
    "super",
    "object",
    "id",
    "input",
    "breakpoint",
    "memoryview",
];

/// Rejects forbidden constructs anywhere in `program`.
pub fn check_program(program: &Program) -> Result<(), SandboxError> {
    check_block(&program.body)
}

fn forbidden(reason: impl Into<String>) -> SandboxError {
    SandboxError::Forbidden(reason.into())
}

fn check_block(statements: &[Stmt]) -> Result<(), SandboxError> {
    statements.iter().try_for_each(check_statement)
}

fn check_statement(statement: &Stmt) -> Result<(), SandboxError> {
    match statement {
        Stmt::Import(module) => Err(forbidden(format!("import of '{}'", module))),
        Stmt::Expr(expr) => check_expr(expr),
        Stmt::Assign { target, value } | Stmt::AugAssign { target, value, .. } => {
            check_target(target)?;
            check_expr(value)
        }
        Stmt::Del(target) => check_target(target),
        Stmt::If { branches, orelse } => {
            for (cond, body) in branches {
                check_expr(cond)?;
                check_block(body)?;
            }
            check_block(orelse)
        }
        Stmt::While { cond, body } => {
            check_expr(cond)?;
            check_block(body)
        }
        Stmt::For { var, iter, body } => {
            check_name(var)?;
            check_expr(iter)?;
            check_block(body)
        }
        Stmt::Assert { cond, message } => {
            check_expr(cond)?;
            message.as_ref().map_or(Ok(()), check_expr)
        }
        Stmt::Raise(value) => value.as_ref().map_or(Ok(()), check_expr),
        Stmt::Pass | Stmt::Break | Stmt::Continue => Ok(()),
    }
}

fn check_target(target: &Target) -> Result<(), SandboxError> {
    match target {
        Target::Name(name) => check_name(name),
        Target::Subscript { object, index } => {
            check_expr(object)?;
            check_expr(index)
        }
        Target::Attribute { name, .. } => {
            Err(forbidden(format!("attribute assignment or deletion of '{}'", name)))
        }
    }
}

fn check_name(name: &str) -> Result<(), SandboxError> {
    if name.contains("__") {
        return Err(forbidden(format!("internal name '{}'", name)));
    }
    if FORBIDDEN_NAMES.contains(&name) {
        return Err(forbidden(format!("reflective builtin '{}'", name)));
    }
    Ok(())
}

fn check_expr(expr: &Expr) -> Result<(), SandboxError> {
    match expr {
        Expr::None | Expr::Bool(_) | Expr::Int(_) => Ok(()),
        Expr::Str(text) => {
            if text.contains("__") {
                Err(forbidden("string literal containing '__'"))
            } else {
                Ok(())
            }
        }
        Expr::FString(_) => Err(forbidden("string interpolation")),
        Expr::Name(name) => check_name(name),
        Expr::List(items) => items.iter().try_for_each(check_expr),
        Expr::Dict(entries) => entries.iter().try_for_each(|(key, value)| {
            check_expr(key)?;
            check_expr(value)
        }),
        Expr::Subscript { object, index } => {
            check_expr(object)?;
            check_expr(index)
        }
        Expr::Attribute { object, name } => {
            if name.starts_with('_') {
                return Err(forbidden(format!("private attribute '{}'", name)));
            }
            check_expr(object)
        }
        Expr::Call { func, args } => {
            check_expr(func)?;
            args.iter().try_for_each(check_expr)
        }
        Expr::Neg(operand) | Expr::Not(operand) => check_expr(operand),
        Expr::Binary { left, right, .. } | Expr::And(left, right) | Expr::Or(left, right) => {
            check_expr(left)?;
            check_expr(right)
        }
        Expr::Compare { left, rest } => {
            check_expr(left)?;
            rest.iter().try_for_each(|(_, operand)| check_expr(operand))
        }
        Expr::IfElse { cond, then, orelse } => {
            check_expr(cond)?;
            check_expr(then)?;
            check_expr(orelse)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::contract::parser::parse;

    fn verdict(source: &str) -> Result<(), SandboxError> {
        check_program(&parse(source).unwrap())
    }

    #[test]
    fn test_accepts_plain_contract() {
        let source = "\
if msg['data'] == 'increment':
    storage['counter'] = storage.get('counter', 0) + 1
";
        assert!(verdict(source).is_ok());
    }

    #[test]
    fn test_rejects_escape_constructs() {
        let rejected = [
            "import os",
            "from os import path",
            "x = ().__class__",
            "x = storage.__class__",
            "x = '__import__'",
            "__builtins__['x'] = 1",
            "x = getattr(storage, 'get')",
            "setattr(storage, 'a', 1)",
            "x = type(storage)",
            "x = f'{storage}'",
            "storage.field = 1",
            "del storage.field",
            "x = storage._private",
            "eval('1')",
            "x = [vars()]",
            "if True:\n    for dir in range(2):\n        pass\n",
        ];

        for source in rejected {
            let result = parse(source).map(|program| check_program(&program));
            assert!(
                matches!(result, Ok(Err(SandboxError::Forbidden(_))) | Err(SandboxError::Syntax { .. })),
                "accepted: {}",
                source
            );
        }
    }

    #[test]
    fn test_import_reported_as_forbidden() {
        assert!(matches!(verdict("import os\n"), Err(SandboxError::Forbidden(_))));
        assert!(matches!(
            verdict("if True:\n    x = 1\nimport sys\n"),
            Err(SandboxError::Forbidden(_))
        ));
    }
}
