//! String-defined dynamics models compiled to a small stack VM.
//!
//! A [`ModelSpec`] names the state, control and parameter symbols, optionally
//! substitutes named constants, and concatenates one right-hand-side expression
//! per state. Compiling it yields an [`EquationModel`] that evaluates with any
//! [`Scalar`], so the same bytecode serves the numeric integrator (`f64`) and
//! the solver's Jacobians ([`crate::autodiff::Dual`]).

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::traits::{DynamicsModel, ModelDimensions, Scalar};

/// OpCodes for the Stack-based Virtual Machine.
/// The VM operates on a stack of `Scalar` values (f64 or Dual).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant `f64` value onto the stack.
    LoadConst(f64),
    /// Pushes the value of a state variable (by index) onto the stack.
    LoadState(usize),
    /// Pushes the value of a control input (by index) onto the stack.
    LoadControl(usize),
    /// Pushes the value of a parameter (by index) onto the stack.
    LoadParam(usize),
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a - b).
    Sub,
    /// Pops top two values (b, a), pushes (a * b).
    Mul,
    /// Pops top two values (b, a), pushes (a / b).
    Div,
    /// Pops top two values (b, a), pushes (a ^ b).
    Pow,
    /// Pops top value (a), pushes a raised to a literal integer exponent.
    PowI(i32),
    Sin,
    Cos,
    Tan,
    Exp,
    Ln,
    Sqrt,
    Tanh,
    Atan,
    Abs,
    /// Pops top value (a), pushes -a.
    Neg,
}

/// Represents a compiled sequence of operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

/// Stack-based Virtual Machine for evaluating equations.
///
/// The VM is stateless; `execute` takes all necessary context and returns
/// the value left on the stack. Bytecode produced by [`Compiler`] is always
/// balanced, so an empty pop can only come from hand-built bytecode; it
/// evaluates to NaN, which the callers' finiteness checks then surface.
pub struct VM;

impl VM {
    pub fn execute<T: Scalar>(
        bytecode: &Bytecode,
        state: &[T],
        control: &[T],
        params: &[T],
        stack: &mut Vec<T>,
    ) -> T {
        stack.clear();
        let nan = T::nan();

        for op in &bytecode.ops {
            match op {
                OpCode::LoadConst(val) => stack.push(T::constant(*val)),
                OpCode::LoadState(idx) => stack.push(state[*idx]),
                OpCode::LoadControl(idx) => stack.push(control[*idx]),
                OpCode::LoadParam(idx) => stack.push(params[*idx]),
                OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Pow => {
                    let b = stack.pop().unwrap_or(nan);
                    let a = stack.pop().unwrap_or(nan);
                    stack.push(match op {
                        OpCode::Add => a + b,
                        OpCode::Sub => a - b,
                        OpCode::Mul => a * b,
                        OpCode::Div => a / b,
                        _ => a.powf(b),
                    });
                }
                unary => {
                    let a = stack.pop().unwrap_or(nan);
                    stack.push(match unary {
                        OpCode::Sin => a.sin(),
                        OpCode::Cos => a.cos(),
                        OpCode::Tan => a.tan(),
                        OpCode::Exp => a.exp(),
                        OpCode::Ln => a.ln(),
                        OpCode::Sqrt => a.sqrt(),
                        OpCode::Tanh => a.tanh(),
                        OpCode::Atan => a.atan(),
                        OpCode::Abs => a.abs(),
                        OpCode::PowI(n) => a.powi(*n),
                        _ => -a,
                    });
                }
            }
        }

        stack.pop().unwrap_or(nan)
    }
}

// --- AST & Parser ---

/// Abstract Syntax Tree nodes for expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Binary(Box<Expr>, char, Box<Expr>), // char is operator +, -, *, /, ^
    Unary(char, Box<Expr>),
    Call(String, Box<Expr>), // functions like sin(x)
}

/// Compiles an AST (`Expr`) into `Bytecode`.
/// Resolves names to state, control or parameter slots, or to substituted constants.
pub struct Compiler {
    pub state_map: HashMap<String, usize>,
    pub control_map: HashMap<String, usize>,
    pub param_map: HashMap<String, usize>,
    pub constants: HashMap<String, f64>,
}

impl Compiler {
    pub fn new(
        state_names: &[String],
        control_names: &[String],
        param_names: &[String],
        constants: &BTreeMap<String, f64>,
    ) -> Self {
        let index = |names: &[String]| -> HashMap<String, usize> {
            names.iter().enumerate().map(|(i, n)| (n.clone(), i)).collect()
        };
        Self {
            state_map: index(state_names),
            control_map: index(control_names),
            param_map: index(param_names),
            constants: constants.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        }
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<()> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(name) => {
                let op = if let Some(&idx) = self.state_map.get(name) {
                    OpCode::LoadState(idx)
                } else if let Some(&idx) = self.control_map.get(name) {
                    OpCode::LoadControl(idx)
                } else if let Some(&idx) = self.param_map.get(name) {
                    OpCode::LoadParam(idx)
                } else if let Some(&value) = self.constants.get(name) {
                    OpCode::LoadConst(value)
                } else {
                    return Err(Error::configuration(format!("unknown symbol '{}'", name)));
                };
                ops.push(op);
            }
            Expr::Binary(left, '^', right) if literal_integer(right).is_some() => {
                // literal integer exponents go through powi so negative bases stay defined
                self.compile_recursive(left, ops)?;
                ops.push(OpCode::PowI(literal_integer(right).unwrap_or(1)));
            }
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                ops.push(match op {
                    '+' => OpCode::Add,
                    '-' => OpCode::Sub,
                    '*' => OpCode::Mul,
                    '/' => OpCode::Div,
                    '^' => OpCode::Pow,
                    _ => {
                        return Err(Error::configuration(format!(
                            "unknown binary operator '{}'",
                            op
                        )))
                    }
                });
            }
            Expr::Unary(op, operand) => {
                self.compile_recursive(operand, ops)?;
                match op {
                    '-' => ops.push(OpCode::Neg),
                    _ => {
                        return Err(Error::configuration(format!(
                            "unknown unary operator '{}'",
                            op
                        )))
                    }
                }
            }
            Expr::Call(func, arg) => {
                self.compile_recursive(arg, ops)?;
                ops.push(match func.as_str() {
                    "sin" => OpCode::Sin,
                    "cos" => OpCode::Cos,
                    "tan" => OpCode::Tan,
                    "exp" => OpCode::Exp,
                    "ln" | "log" => OpCode::Ln,
                    "sqrt" => OpCode::Sqrt,
                    "tanh" => OpCode::Tanh,
                    "atan" => OpCode::Atan,
                    "abs" => OpCode::Abs,
                    _ => {
                        return Err(Error::configuration(format!("unknown function '{}'", func)))
                    }
                });
            }
        }
        Ok(())
    }
}

fn literal_integer(expr: &Expr) -> Option<i32> {
    let value = match expr {
        Expr::Number(n) => *n,
        Expr::Unary('-', inner) => match inner.as_ref() {
            Expr::Number(n) => -*n,
            _ => return None,
        },
        _ => return None,
    };
    if value.fract() == 0.0 && value.abs() <= 64.0 {
        Some(value as i32)
    } else {
        None
    }
}

// --- Simple Parser ---

/// Parses a string expression into an AST.
pub fn parse(input: &str) -> Result<Expr> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression()?;
    if parser.pos != parser.tokens.len() {
        return Err(Error::configuration(format!(
            "unexpected trailing input in '{}'",
            input
        )));
    }
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    num_str.push(d);
                    chars.next();
                } else if (d == 'e' || d == 'E') && !num_str.contains(|ch| ch == 'e' || ch == 'E') {
                    // exponent, optionally signed
                    num_str.push(d);
                    chars.next();
                    if let Some(&s) = chars.peek() {
                        if s == '+' || s == '-' {
                            num_str.push(s);
                            chars.next();
                        }
                    }
                } else {
                    break;
                }
            }
            let value = num_str
                .parse()
                .map_err(|_| Error::configuration(format!("invalid number '{}'", num_str)))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            tokens.push(match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                _ => {
                    return Err(Error::configuration(format!(
                        "unexpected character '{}' in '{}'",
                        c, input
                    )))
                }
            });
            chars.next();
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn consume(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect_rparen(&mut self) -> Result<()> {
        match self.consume() {
            Some(Token::RParen) => Ok(()),
            _ => Err(Error::configuration("expected ')'")),
        }
    }

    fn parse_expression(&mut self) -> Result<Expr> {
        let mut left = self.parse_product()?;
        while let Some(op) = match self.peek() {
            Some(Token::Plus) => Some('+'),
            Some(Token::Minus) => Some('-'),
            _ => None,
        } {
            self.consume();
            let right = self.parse_product()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_product(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        while let Some(op) = match self.peek() {
            Some(Token::Star) => Some('*'),
            Some(Token::Slash) => Some('/'),
            _ => None,
        } {
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    // unary minus binds looser than '^': -x^2 == -(x^2)
    fn parse_unary(&mut self) -> Result<Expr> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary('-', Box::new(expr)));
        }
        self.parse_power()
    }

    // right associative: a^b^c == a^(b^c)
    fn parse_power(&mut self) -> Result<Expr> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(Box::new(base), '^', Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume();
                    let arg = self.parse_expression()?;
                    self.expect_rparen()?;
                    Ok(Expr::Call(name, Box::new(arg)))
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                self.expect_rparen()?;
                Ok(expr)
            }
            other => Err(Error::configuration(format!("unexpected token {:?}", other))),
        }
    }
}

// --- Model specification ---

/// Declarative description of a dynamics model: named symbols, substituted
/// constants and one right-hand side per state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelSpec {
    pub states: Vec<String>,
    #[serde(default)]
    pub controls: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default)]
    pub constants: BTreeMap<String, f64>,
    pub equations: Vec<String>,
}

impl ModelSpec {
    pub fn new(states: &[&str], equations: &[&str]) -> Self {
        Self {
            states: states.iter().map(|s| s.to_string()).collect(),
            equations: equations.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn with_controls(mut self, controls: &[&str]) -> Self {
        self.controls = controls.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_parameters(mut self, parameters: &[&str]) -> Self {
        self.parameters = parameters.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Substitutes a named constant; it is folded into the bytecode.
    pub fn with_constant(mut self, name: &str, value: f64) -> Self {
        self.constants.insert(name.to_string(), value);
        self
    }

    pub fn compile(&self) -> Result<EquationModel> {
        if self.states.is_empty() {
            return Err(Error::configuration("model must declare at least one state"));
        }
        if self.equations.len() != self.states.len() {
            return Err(Error::configuration(format!(
                "model declares {} states but {} equations",
                self.states.len(),
                self.equations.len()
            )));
        }
        let mut seen = HashMap::new();
        for name in self
            .states
            .iter()
            .chain(&self.controls)
            .chain(&self.parameters)
            .chain(self.constants.keys())
        {
            if seen.insert(name.as_str(), ()).is_some() {
                return Err(Error::configuration(format!("symbol '{}' declared twice", name)));
            }
        }

        let compiler = Compiler::new(&self.states, &self.controls, &self.parameters, &self.constants);
        let equations = self
            .equations
            .iter()
            .map(|src| compiler.compile(&parse(src)?))
            .collect::<Result<Vec<_>>>()?;

        Ok(EquationModel {
            equations,
            state_names: self.states.clone(),
            control_names: self.controls.clone(),
            parameter_names: self.parameters.clone(),
        })
    }
}

/// A compiled model implementing [`DynamicsModel`] for every scalar type.
#[derive(Debug, Clone)]
pub struct EquationModel {
    pub equations: Vec<Bytecode>,
    pub state_names: Vec<String>,
    pub control_names: Vec<String>,
    pub parameter_names: Vec<String>,
}

impl EquationModel {
    pub fn parameter_index(&self, name: &str) -> Option<usize> {
        self.parameter_names.iter().position(|n| n == name)
    }
}

impl ModelDimensions for EquationModel {
    fn state_dim(&self) -> usize {
        self.state_names.len()
    }

    fn control_dim(&self) -> usize {
        self.control_names.len()
    }

    fn parameter_dim(&self) -> usize {
        self.parameter_names.len()
    }
}

impl<T: Scalar> DynamicsModel<T> for EquationModel {
    fn apply(&self, x: &[T], u: &[T], p: &[T], out: &mut [T]) {
        let mut stack = Vec::with_capacity(16);
        for (i, eq) in self.equations.iter().enumerate() {
            out[i] = VM::execute(eq, x, u, p, &mut stack);
        }
    }
}
