//! Syntax tree and recursive-descent parser for contract source.

use super::lexer::{tokenize, Spanned, Token};
use super::SandboxError;

/// Deepest nesting of blocks and expressions accepted by the parser.
const MAX_NESTING: usize = 64;

/// Words that cannot be used as identifiers.
const RESERVED: &[&str] = &[
    "and", "as", "assert", "async", "await", "break", "class", "continue", "def", "del", "elif",
    "else", "except", "finally", "for", "from", "global", "if", "import", "in", "is", "lambda",
    "nonlocal", "not", "or", "pass", "raise", "return", "try", "while", "with", "yield", "True",
    "False", "None",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    In,
    NotIn,
    Is,
    IsNot,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    None,
    Bool(bool),
    Int(i64),
    Str(String),
    FString(String),
    Name(String),
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Subscript {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    Attribute {
        object: Box<Expr>,
        name: String,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
    },
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Compare {
        left: Box<Expr>,
        rest: Vec<(CmpOp, Expr)>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    IfElse {
        cond: Box<Expr>,
        then: Box<Expr>,
        orelse: Box<Expr>,
    },
}

/// Assignment or deletion target.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Name(String),
    Subscript { object: Expr, index: Expr },
    Attribute { object: Expr, name: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Expr(Expr),
    Assign { target: Target, value: Expr },
    AugAssign { target: Target, op: BinOp, value: Expr },
    If { branches: Vec<(Expr, Vec<Stmt>)>, orelse: Vec<Stmt> },
    While { cond: Expr, body: Vec<Stmt> },
    For { var: String, iter: Expr, body: Vec<Stmt> },
    Del(Target),
    Assert { cond: Expr, message: Option<Expr> },
    Raise(Option<Expr>),
    Import(String),
    Pass,
    Break,
    Continue,
}

/// A parsed contract.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub body: Vec<Stmt>,
}

/// Parses contract source into a program.
pub fn parse(source: &str) -> Result<Program, SandboxError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        nesting: 0,
    };

    let mut body = Vec::new();
    while !parser.check(&Token::Eof) {
        body.extend(parser.statement()?);
    }
    Ok(Program { body })
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    nesting: usize,
}

impl Parser {
    fn current(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .map(|s| &s.token)
            .unwrap_or(&Token::Eof)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(0, |s| s.line)
    }

    fn error(&self, message: impl Into<String>) -> SandboxError {
        SandboxError::Syntax {
            line: self.line(),
            message: message.into(),
        }
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, token: &Token) -> bool {
        self.current() == token
    }

    fn check_op(&self, op: &str) -> bool {
        matches!(self.current(), Token::Op(o) if *o == op)
    }

    fn check_word(&self, word: &str) -> bool {
        matches!(self.current(), Token::Name(n) if n == word)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.check_op(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_word(&mut self, word: &str) -> bool {
        if self.check_word(word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<(), SandboxError> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}', found {:?}", op, self.current())))
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), SandboxError> {
        if self.check(&token) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected {:?}, found {:?}", token, self.current())))
        }
    }

    fn identifier(&mut self) -> Result<String, SandboxError> {
        match self.advance() {
            Token::Name(name) if !RESERVED.contains(&name.as_str()) => Ok(name),
            other => Err(self.error(format!("expected identifier, found {:?}", other))),
        }
    }

    fn enter(&mut self) -> Result<(), SandboxError> {
        self.nesting += 1;
        if self.nesting > MAX_NESTING {
            return Err(self.error("nesting too deep"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.leave_many(1);
    }

    /// Left-associative chains nest one level per operator.
    fn leave_many(&mut self, levels: usize) {
        self.nesting = self.nesting.saturating_sub(levels);
    }

    // ----- statements -----

    fn statement(&mut self) -> Result<Vec<Stmt>, SandboxError> {
        let keyword = match self.current() {
            Token::Name(name) => name.clone(),
            _ => String::new(),
        };

        match keyword.as_str() {
            "if" => Ok(vec![self.if_statement()?]),
            "while" => {
                self.pos += 1;
                let cond = self.expression()?;
                let body = self.block()?;
                Ok(vec![Stmt::While { cond, body }])
            }
            "for" => {
                self.pos += 1;
                let var = self.identifier()?;
                if !self.eat_word("in") {
                    return Err(self.error("expected 'in'"));
                }
                let iter = self.expression()?;
                let body = self.block()?;
                Ok(vec![Stmt::For { var, iter, body }])
            }
            "def" | "class" | "try" | "with" | "lambda" | "global" | "nonlocal" | "yield"
            | "return" | "async" | "await" | "except" | "finally" => {
                Err(self.error(format!("'{}' is not supported", keyword)))
            }
            _ => self.simple_line(),
        }
    }

    fn if_statement(&mut self) -> Result<Stmt, SandboxError> {
        self.pos += 1;
        let mut branches = Vec::new();
        let cond = self.expression()?;
        branches.push((cond, self.block()?));

        let mut orelse = Vec::new();
        loop {
            if self.eat_word("elif") {
                let cond = self.expression()?;
                branches.push((cond, self.block()?));
            } else if self.eat_word("else") {
                orelse = self.block()?;
                break;
            } else {
                break;
            }
        }

        Ok(Stmt::If { branches, orelse })
    }

    /// `':' NEWLINE INDENT stmt+ DEDENT` or `':' simple_stmts NEWLINE`
    fn block(&mut self) -> Result<Vec<Stmt>, SandboxError> {
        self.expect_op(":")?;
        self.enter()?;

        let body = if self.check(&Token::Newline) {
            self.pos += 1;
            self.expect(Token::Indent)?;
            let mut body = Vec::new();
            while !self.check(&Token::Dedent) && !self.check(&Token::Eof) {
                body.extend(self.statement()?);
            }
            self.expect(Token::Dedent)?;
            body
        } else {
            self.simple_line()?
        };

        self.leave();
        Ok(body)
    }

    fn simple_line(&mut self) -> Result<Vec<Stmt>, SandboxError> {
        let mut statements = vec![self.simple_statement()?];
        while self.eat_op(";") {
            if self.check(&Token::Newline) {
                break;
            }
            statements.push(self.simple_statement()?);
        }
        self.expect(Token::Newline)?;
        Ok(statements)
    }

    fn simple_statement(&mut self) -> Result<Stmt, SandboxError> {
        if self.eat_word("pass") {
            return Ok(Stmt::Pass);
        }
        if self.eat_word("break") {
            return Ok(Stmt::Break);
        }
        if self.eat_word("continue") {
            return Ok(Stmt::Continue);
        }
        if self.check_word("import") || self.check_word("from") {
            return Ok(self.import_statement());
        }
        if self.eat_word("del") {
            let target = self.expression()?;
            return Ok(Stmt::Del(self.to_target(target)?));
        }
        if self.eat_word("raise") {
            if self.check(&Token::Newline) || self.check_op(";") {
                return Ok(Stmt::Raise(None));
            }
            return Ok(Stmt::Raise(Some(self.expression()?)));
        }
        if self.eat_word("assert") {
            let cond = self.expression()?;
            let message = if self.eat_op(",") {
                Some(self.expression()?)
            } else {
                None
            };
            return Ok(Stmt::Assert { cond, message });
        }

        let expr = self.expression()?;

        if self.eat_op("=") {
            let target = self.to_target(expr)?;
            let value = self.expression()?;
            return Ok(Stmt::Assign { target, value });
        }

        let aug = [
            ("+=", BinOp::Add),
            ("-=", BinOp::Sub),
            ("*=", BinOp::Mul),
            ("//=", BinOp::FloorDiv),
            ("%=", BinOp::Mod),
        ];
        for (symbol, op) in aug {
            if self.eat_op(symbol) {
                let target = self.to_target(expr)?;
                let value = self.expression()?;
                return Ok(Stmt::AugAssign { target, op, value });
            }
        }

        Ok(Stmt::Expr(expr))
    }

    /// Consumes an import statement up to the end of the line, keeping the
    /// first module name for diagnostics.
    fn import_statement(&mut self) -> Stmt {
        self.pos += 1;
        let module = match self.current() {
            Token::Name(name) => name.clone(),
            other => format!("{:?}", other),
        };
        while !self.check(&Token::Newline) && !self.check(&Token::Eof) && !self.check_op(";") {
            self.pos += 1;
        }
        Stmt::Import(module)
    }

    fn to_target(&self, expr: Expr) -> Result<Target, SandboxError> {
        match expr {
            Expr::Name(name) => Ok(Target::Name(name)),
            Expr::Subscript { object, index } => Ok(Target::Subscript {
                object: *object,
                index: *index,
            }),
            Expr::Attribute { object, name } => Ok(Target::Attribute {
                object: *object,
                name,
            }),
            _ => Err(self.error("cannot assign to expression")),
        }
    }

    // ----- expressions -----

    fn expression(&mut self) -> Result<Expr, SandboxError> {
        self.enter()?;
        let then = self.or_expr()?;
        let result = if self.eat_word("if") {
            let cond = self.or_expr()?;
            if !self.eat_word("else") {
                return Err(self.error("expected 'else' in conditional expression"));
            }
            let orelse = self.expression()?;
            Expr::IfElse {
                cond: Box::new(cond),
                then: Box::new(then),
                orelse: Box::new(orelse),
            }
        } else {
            then
        };
        self.leave();
        Ok(result)
    }

    fn or_expr(&mut self) -> Result<Expr, SandboxError> {
        let mut left = self.and_expr()?;
        let mut levels = 0;
        while self.eat_word("or") {
            self.enter()?;
            levels += 1;
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        self.leave_many(levels);
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, SandboxError> {
        let mut left = self.not_expr()?;
        let mut levels = 0;
        while self.eat_word("and") {
            self.enter()?;
            levels += 1;
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        self.leave_many(levels);
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, SandboxError> {
        if self.eat_word("not") {
            self.enter()?;
            let operand = self.not_expr()?;
            self.leave();
            return Ok(Expr::Not(Box::new(operand)));
        }
        self.comparison()
    }

    fn comparison_op(&mut self) -> Option<CmpOp> {
        let simple = [
            ("==", CmpOp::Eq),
            ("!=", CmpOp::NotEq),
            ("<=", CmpOp::LtE),
            (">=", CmpOp::GtE),
            ("<", CmpOp::Lt),
            (">", CmpOp::Gt),
        ];
        for (symbol, op) in simple {
            if self.eat_op(symbol) {
                return Some(op);
            }
        }
        if self.eat_word("in") {
            return Some(CmpOp::In);
        }
        if self.check_word("not")
            && matches!(self.tokens.get(self.pos + 1).map(|s| &s.token), Some(Token::Name(n)) if n == "in")
        {
            self.pos += 2;
            return Some(CmpOp::NotIn);
        }
        if self.eat_word("is") {
            return Some(if self.eat_word("not") {
                CmpOp::IsNot
            } else {
                CmpOp::Is
            });
        }
        None
    }

    fn comparison(&mut self) -> Result<Expr, SandboxError> {
        let left = self.arith()?;
        let mut rest = Vec::new();
        while let Some(op) = self.comparison_op() {
            if rest.len() >= MAX_NESTING {
                return Err(self.error("comparison chain too long"));
            }
            rest.push((op, self.arith()?));
        }

        if rest.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare {
                left: Box::new(left),
                rest,
            })
        }
    }

    fn arith(&mut self) -> Result<Expr, SandboxError> {
        let mut left = self.term()?;
        let mut levels = 0;
        loop {
            let op = if self.eat_op("+") {
                BinOp::Add
            } else if self.eat_op("-") {
                BinOp::Sub
            } else {
                break;
            };
            self.enter()?;
            levels += 1;
            let right = self.term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.leave_many(levels);
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, SandboxError> {
        let mut left = self.factor()?;
        let mut levels = 0;
        loop {
            let op = if self.eat_op("*") {
                BinOp::Mul
            } else if self.eat_op("//") {
                BinOp::FloorDiv
            } else if self.eat_op("/") {
                BinOp::Div
            } else if self.eat_op("%") {
                BinOp::Mod
            } else {
                break;
            };
            self.enter()?;
            levels += 1;
            let right = self.factor()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.leave_many(levels);
        Ok(left)
    }

    fn factor(&mut self) -> Result<Expr, SandboxError> {
        if self.eat_op("-") {
            self.enter()?;
            let operand = self.factor()?;
            self.leave();
            return Ok(Expr::Neg(Box::new(operand)));
        }
        if self.eat_op("+") {
            self.enter()?;
            let operand = self.factor()?;
            self.leave();
            return Ok(operand);
        }
        self.power()
    }

    fn power(&mut self) -> Result<Expr, SandboxError> {
        let base = self.primary()?;
        if self.eat_op("**") {
            self.enter()?;
            let exponent = self.factor()?;
            self.leave();
            return Ok(Expr::Binary {
                op: BinOp::Pow,
                left: Box::new(base),
                right: Box::new(exponent),
            });
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Expr, SandboxError> {
        let mut expr = self.atom()?;
        let mut levels = 0;
        loop {
            if self.check_op("(") || self.check_op("[") || self.check_op(".") {
                self.enter()?;
                levels += 1;
            }
            if self.eat_op("(") {
                let args = self.sequence(")")?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                };
            } else if self.eat_op("[") {
                let index = self.expression()?;
                self.expect_op("]")?;
                expr = Expr::Subscript {
                    object: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.eat_op(".") {
                let name = self.identifier()?;
                expr = Expr::Attribute {
                    object: Box::new(expr),
                    name,
                };
            } else {
                self.leave_many(levels);
                return Ok(expr);
            }
        }
    }

    /// Comma separated expressions up to `close`, trailing comma allowed.
    fn sequence(&mut self, close: &str) -> Result<Vec<Expr>, SandboxError> {
        let mut items = Vec::new();
        while !self.eat_op(close) {
            items.push(self.expression()?);
            if !self.eat_op(",") {
                self.expect_op(close)?;
                break;
            }
        }
        Ok(items)
    }

    fn atom(&mut self) -> Result<Expr, SandboxError> {
        match self.advance() {
            Token::Int(value) => Ok(Expr::Int(value)),
            Token::Str(mut text) => {
                while let Token::Str(next) = self.current() {
                    text.push_str(next);
                    self.pos += 1;
                }
                Ok(Expr::Str(text))
            }
            Token::FString(text) => Ok(Expr::FString(text)),
            Token::Name(name) => match name.as_str() {
                "True" => Ok(Expr::Bool(true)),
                "False" => Ok(Expr::Bool(false)),
                "None" => Ok(Expr::None),
                _ if RESERVED.contains(&name.as_str()) => {
                    Err(self.error(format!("unexpected keyword '{}'", name)))
                }
                _ => Ok(Expr::Name(name)),
            },
            Token::Op("(") => {
                let inner = self.expression()?;
                self.expect_op(")")?;
                Ok(inner)
            }
            Token::Op("[") => {
                self.enter()?;
                let items = self.sequence("]")?;
                self.leave();
                Ok(Expr::List(items))
            }
            Token::Op("{") => {
                self.enter()?;
                let mut entries = Vec::new();
                while !self.eat_op("}") {
                    let key = self.expression()?;
                    self.expect_op(":")?;
                    let value = self.expression()?;
                    entries.push((key, value));
                    if !self.eat_op(",") {
                        self.expect_op("}")?;
                        break;
                    }
                }
                self.leave();
                Ok(Expr::Dict(entries))
            }
            other => Err(self.error(format!("unexpected token {:?}", other))),
        }
    }
}
