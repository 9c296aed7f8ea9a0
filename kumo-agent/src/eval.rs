//! 式評価エンジン
//!
//! スコープで停止中に入力された式を、レジスタとメモリに対して評価します。
//! 整数演算（64ビット、ラップアラウンド）と、シンボル解決・メモリ読み取りの
//! 組み込み関数をサポートします。

use crate::backend::Backtracer;
use crate::context::CpuContext;
use crate::disasm;
use crate::syscall::Arch;
use kumo_dwarf::hexdump::hexdump;
use kumo_dwarf::{AddressNamer, SharedMemory, ValueDecoder, ValueDescriptor};
use kumo_target::{ThreadId, ThreadStat};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// 式の評価エラー
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExprError {
    #[error("SyntaxError: {0}")]
    Syntax(String),
    #[error("ReferenceError: {0} is not defined")]
    UnknownIdentifier(String),
    #[error("ReferenceError: {0}() is not defined")]
    UnknownFunction(String),
    #[error("TypeError: {name}() takes {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: &'static str,
        got: usize,
    },
    #[error("TypeError: {0}")]
    Type(String),
    #[error("Error: access violation accessing 0x{0:x}")]
    Memory(u64),
    #[error("RangeError: division by zero")]
    DivisionByZero,
    #[error("Error: {0}")]
    Other(String),
}

/// 二項演算子
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

/// 単項演算子
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    /// ポインタサイズの読み取り: `*x`
    Deref,
}

/// 式の抽象構文木
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    /// 数値: `42` `0x10`
    Number(u64),
    /// 文字列: `"libc.so"`
    Text(String),
    /// レジスタ名: `rax`
    Identifier(String),
    Unary {
        op: UnaryOp,
        operand: Box<Expression>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    /// 組み込み関数の呼び出し: `sym(pc)`
    Call { name: String, args: Vec<Expression> },
}

/// 評価結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(u64),
    Text(String),
}

impl Value {
    fn as_int(&self) -> Result<u64, ExprError> {
        match self {
            Value::Int(v) => Ok(*v),
            Value::Text(s) => Err(ExprError::Type(format!("'{}' is not a number", s))),
        }
    }

    fn as_text(&self) -> Result<&str, ExprError> {
        match self {
            Value::Text(s) => Ok(s),
            Value::Int(v) => Err(ExprError::Type(format!("0x{:x} is not a string", v))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", *v as i64),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Number(u64),
    Ident(String),
    Text(String),
    Op(&'static str),
}

const OPERATORS: &[&str] = &[
    "<<", ">>", "+", "-", "*", "/", "%", "&", "|", "^", "~", "(", ")", ",",
];

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let mut rest = input;

    while let Some(c) = rest.chars().next() {
        if c.is_whitespace() {
            rest = &rest[c.len_utf8()..];
            continue;
        }

        if c.is_ascii_digit() {
            let len = rest
                .find(|ch: char| !ch.is_ascii_alphanumeric())
                .unwrap_or(rest.len());
            let literal = &rest[..len];
            let value = if let Some(hex) = literal
                .strip_prefix("0x")
                .or_else(|| literal.strip_prefix("0X"))
            {
                u64::from_str_radix(hex, 16)
            } else {
                literal.parse::<u64>()
            }
            .map_err(|_| ExprError::Syntax(format!("invalid number '{}'", literal)))?;
            tokens.push(Token::Number(value));
            rest = &rest[len..];
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let len = rest
                .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
                .unwrap_or(rest.len());
            tokens.push(Token::Ident(rest[..len].to_string()));
            rest = &rest[len..];
            continue;
        }

        if c == '"' || c == '\'' {
            let (text, consumed) = scan_string(rest, c)?;
            tokens.push(Token::Text(text));
            rest = &rest[consumed..];
            continue;
        }

        let op = OPERATORS
            .iter()
            .find(|op| rest.starts_with(**op))
            .ok_or_else(|| ExprError::Syntax(format!("unexpected character '{}'", c)))?;
        tokens.push(Token::Op(op));
        rest = &rest[op.len()..];
    }

    Ok(tokens)
}

/// 引用符で囲まれた文字列を読む。`(内容, 消費したバイト数)`を返す
fn scan_string(input: &str, quote: char) -> Result<(String, usize), ExprError> {
    let mut text = String::new();
    let mut chars = input.char_indices().skip(1);

    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, 'n')) => text.push('\n'),
                Some((_, 't')) => text.push('\t'),
                Some((_, escaped)) => text.push(escaped),
                None => break,
            },
            c if c == quote => return Ok((text, i + c.len_utf8())),
            c => text.push(c),
        }
    }

    Err(ExprError::Syntax("unterminated string literal".to_string()))
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek_op(&self) -> Option<&'static str> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) => Some(op),
            _ => None,
        }
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.peek_op() == Some(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<(), ExprError> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(ExprError::Syntax(format!("expected '{}'", op)))
        }
    }

    /// 左結合の二項演算子の1段
    fn binary_level(
        &mut self,
        ops: &[(&str, BinaryOp)],
        next: fn(&mut Self) -> Result<Expression, ExprError>,
    ) -> Result<Expression, ExprError> {
        let mut lhs = next(self)?;
        'outer: loop {
            for (token, op) in ops {
                if self.eat_op(token) {
                    let rhs = next(self)?;
                    lhs = Expression::Binary {
                        op: *op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    };
                    continue 'outer;
                }
            }
            return Ok(lhs);
        }
    }

    fn parse_or(&mut self) -> Result<Expression, ExprError> {
        self.binary_level(&[("|", BinaryOp::Or)], Self::parse_xor)
    }

    fn parse_xor(&mut self) -> Result<Expression, ExprError> {
        self.binary_level(&[("^", BinaryOp::Xor)], Self::parse_and)
    }

    fn parse_and(&mut self) -> Result<Expression, ExprError> {
        self.binary_level(&[("&", BinaryOp::And)], Self::parse_shift)
    }

    fn parse_shift(&mut self) -> Result<Expression, ExprError> {
        self.binary_level(
            &[("<<", BinaryOp::Shl), (">>", BinaryOp::Shr)],
            Self::parse_add,
        )
    }

    fn parse_add(&mut self) -> Result<Expression, ExprError> {
        self.binary_level(
            &[("+", BinaryOp::Add), ("-", BinaryOp::Sub)],
            Self::parse_mul,
        )
    }

    fn parse_mul(&mut self) -> Result<Expression, ExprError> {
        self.binary_level(
            &[
                ("*", BinaryOp::Mul),
                ("/", BinaryOp::Div),
                ("%", BinaryOp::Rem),
            ],
            Self::parse_unary,
        )
    }

    fn parse_unary(&mut self) -> Result<Expression, ExprError> {
        let op = match self.peek_op() {
            Some("-") => UnaryOp::Neg,
            Some("~") => UnaryOp::Not,
            Some("*") => UnaryOp::Deref,
            _ => return self.parse_primary(),
        };
        self.pos += 1;
        Ok(Expression::Unary {
            op,
            operand: Box::new(self.parse_unary()?),
        })
    }

    fn parse_primary(&mut self) -> Result<Expression, ExprError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| ExprError::Syntax("unexpected end of input".to_string()))?;
        self.pos += 1;

        match token {
            Token::Number(value) => Ok(Expression::Number(value)),
            Token::Text(text) => Ok(Expression::Text(text)),
            Token::Ident(name) => {
                if !self.eat_op("(") {
                    return Ok(Expression::Identifier(name));
                }
                let mut args = Vec::new();
                if !self.eat_op(")") {
                    loop {
                        args.push(self.parse_or()?);
                        if self.eat_op(")") {
                            break;
                        }
                        self.expect_op(",")?;
                    }
                }
                Ok(Expression::Call { name, args })
            }
            Token::Op("(") => {
                let inner = self.parse_or()?;
                self.expect_op(")")?;
                Ok(inner)
            }
            Token::Op(op) => Err(ExprError::Syntax(format!("unexpected token '{}'", op))),
        }
    }
}

/// 式をパースする
pub fn parse_expression(input: &str) -> Result<Expression, ExprError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ExprError::Syntax("empty expression".to_string()));
    }

    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(ExprError::Syntax("unexpected trailing input".to_string()));
    }
    Ok(expr)
}

/// 評価エラーを固定形式のトレースにする
pub fn error_trace(error: &ExprError, code: &str) -> String {
    format!("{}\n    at <eval> ({})", error, code.trim())
}

/// 式評価器
///
/// CPUコンテキストなし（スコープ外）でも、レジスタを参照しない式は評価できます。
#[derive(Clone)]
pub struct ExpressionEvaluator {
    memory: SharedMemory,
    namer: Arc<AddressNamer>,
    decoder: ValueDecoder,
    backtracer: Option<Arc<dyn Backtracer>>,
    arch: Arch,
}

impl ExpressionEvaluator {
    pub fn new(memory: SharedMemory, namer: Arc<AddressNamer>, decoder: ValueDecoder) -> Self {
        Self {
            memory,
            namer,
            decoder,
            backtracer: None,
            arch: Arch::current(),
        }
    }

    pub fn with_backtracer(mut self, backtracer: Arc<dyn Backtracer>) -> Self {
        self.backtracer = Some(backtracer);
        self
    }

    pub fn namer(&self) -> &Arc<AddressNamer> {
        &self.namer
    }

    pub fn backtracer(&self) -> Option<&Arc<dyn Backtracer>> {
        self.backtracer.as_ref()
    }

    /// 式文字列を評価する
    pub fn evaluate(&self, code: &str, ctx: Option<&CpuContext>) -> Result<Value, ExprError> {
        let expr = parse_expression(code)?;
        self.eval(&expr, ctx)
    }

    /// 式文字列を評価し、エラーもトレース文字列として返す
    pub fn evaluate_to_string(&self, code: &str, ctx: Option<&CpuContext>) -> String {
        match self.evaluate(code, ctx) {
            Ok(value) => value.to_string(),
            Err(e) => error_trace(&e, code),
        }
    }

    /// 構文木を評価する
    pub fn eval(&self, expr: &Expression, ctx: Option<&CpuContext>) -> Result<Value, ExprError> {
        match expr {
            Expression::Number(v) => Ok(Value::Int(*v)),
            Expression::Text(s) => Ok(Value::Text(s.clone())),
            Expression::Identifier(name) => ctx
                .and_then(|ctx| ctx.get(name))
                .map(Value::Int)
                .ok_or_else(|| ExprError::UnknownIdentifier(name.clone())),
            Expression::Unary { op, operand } => {
                let value = self.eval(operand, ctx)?.as_int()?;
                match op {
                    UnaryOp::Neg => Ok(Value::Int(value.wrapping_neg())),
                    UnaryOp::Not => Ok(Value::Int(!value)),
                    UnaryOp::Deref => self.read_pointer(value).map(Value::Int),
                }
            }
            Expression::Binary { op, lhs, rhs } => {
                let lhs = self.eval(lhs, ctx)?;
                let rhs = self.eval(rhs, ctx)?;
                self.eval_binary(*op, lhs, rhs)
            }
            Expression::Call { name, args } => {
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg, ctx))
                    .collect::<Result<Vec<_>, _>>()?;
                self.call(name, &args, ctx)
            }
        }
    }

    fn eval_binary(&self, op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, ExprError> {
        // 文字列が混ざる加算は連結
        if op == BinaryOp::Add {
            if let (Value::Text(_), _) | (_, Value::Text(_)) = (&lhs, &rhs) {
                return Ok(Value::Text(format!("{}{}", lhs, rhs)));
            }
        }

        let a = lhs.as_int()?;
        let b = rhs.as_int()?;
        let value = match op {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
            BinaryOp::Div => a.checked_div(b).ok_or(ExprError::DivisionByZero)?,
            BinaryOp::Rem => a.checked_rem(b).ok_or(ExprError::DivisionByZero)?,
            BinaryOp::And => a & b,
            BinaryOp::Or => a | b,
            BinaryOp::Xor => a ^ b,
            BinaryOp::Shl => a.wrapping_shl(b as u32),
            BinaryOp::Shr => a.wrapping_shr(b as u32),
        };
        Ok(Value::Int(value))
    }

    fn read_pointer(&self, addr: u64) -> Result<u64, ExprError> {
        self.decoder.read_pointer(addr).ok_or(ExprError::Memory(addr))
    }

    fn require_context<'c>(&self, ctx: Option<&'c CpuContext>) -> Result<&'c CpuContext, ExprError> {
        ctx.ok_or_else(|| ExprError::Type("no CPU context outside a scope".to_string()))
    }

    fn call(&self, name: &str, args: &[Value], ctx: Option<&CpuContext>) -> Result<Value, ExprError> {
        let arity = |expected: &'static str, ok: bool| {
            if ok {
                Ok(())
            } else {
                Err(ExprError::Arity {
                    name: name.to_string(),
                    expected,
                    got: args.len(),
                })
            }
        };

        match name {
            "sym" => {
                arity("1", args.len() == 1)?;
                Ok(Value::Text(self.namer.resolve(args[0].as_int()?)))
            }
            "info" => {
                arity("1", args.len() == 1)?;
                Ok(Value::Text(self.namer.addr_info(args[0].as_int()?)))
            }
            "addr" => {
                arity("1 or 2", matches!(args.len(), 1 | 2))?;
                let (module, symbol) = match args {
                    [symbol] => (None, symbol.as_text()?),
                    [module, symbol, ..] => (Some(module.as_text()?), symbol.as_text()?),
                    [] => unreachable!(),
                };
                self.namer
                    .symbols()
                    .and_then(|s| s.find_export(module, symbol))
                    .map(Value::Int)
                    .ok_or_else(|| ExprError::Other(format!("symbol '{}' not found", symbol)))
            }
            "name" => {
                arity("3", args.len() == 3)?;
                let addr = args[0].as_int()?;
                self.namer
                    .add_override(addr, args[1].as_int()?, args[2].as_text()?);
                Ok(Value::Text(self.namer.resolve(addr)))
            }
            "hex" | "ptr" => {
                arity("1", args.len() == 1)?;
                Ok(Value::Text(format!("0x{:x}", args[0].as_int()?)))
            }
            "hexdump" | "d" => {
                arity("1 or 2", matches!(args.len(), 1 | 2))?;
                let addr = args[0].as_int()?;
                let config = self.decoder.config();
                let length = match args.get(1) {
                    Some(n) => n.as_int()? as usize,
                    None => config.default_dump_bytes,
                }
                .min(config.max_dump_bytes);
                let bytes = self
                    .memory
                    .read(addr as usize, length)
                    .map_err(|_| ExprError::Memory(addr))?;
                Ok(Value::Text(hexdump(addr, &bytes)))
            }
            "read8" | "read16" | "read32" | "read64" | "readptr" => {
                arity("1", args.len() == 1)?;
                let addr = args[0].as_int()?;
                let value = match name {
                    "read8" => self.memory.read_u8(addr as usize).map(u64::from),
                    "read16" => self.memory.read_u16(addr as usize).map(u64::from),
                    "read32" => self.memory.read_u32(addr as usize).map(u64::from),
                    "readptr" => return self.read_pointer(addr).map(Value::Int),
                    _ => self.memory.read_u64(addr as usize),
                };
                value.map(Value::Int).map_err(|_| ExprError::Memory(addr))
            }
            "str" | "wstr" | "stdstr" => {
                arity("1", args.len() == 1)?;
                let addr = args[0].as_int()?;
                let text = match name {
                    "str" => self.decoder.read_c_string(addr),
                    "wstr" => self.decoder.read_wide_string(addr),
                    _ => self.decoder.read_std_string(addr),
                };
                text.map(Value::Text).ok_or(ExprError::Memory(addr))
            }
            "decode" => {
                arity("2", args.len() == 2)?;
                let descriptor = ValueDescriptor::parse(args[1].as_text()?);
                Ok(Value::Text(self.decoder.decode(args[0].as_int()?, &descriptor)))
            }
            "insn" => {
                arity("1", args.len() == 1)?;
                let addr = args[0].as_int()?;
                let code = self
                    .memory
                    .read(addr as usize, 16)
                    .map_err(|_| ExprError::Memory(addr))?;
                disasm::disassemble_one(self.arch, &code, addr)
                    .map(|insn| Value::Text(insn.to_string()))
                    .ok_or_else(|| ExprError::Other(format!("cannot decode 0x{:x}", addr)))
            }
            "dump" => {
                arity("3", args.len() == 3)?;
                let path = args[2].as_text()?;
                kumo_target::dump_memory(args[0].as_int()? as usize, args[1].as_int()? as usize, path)
                    .map(|written| Value::Int(written as u64))
                    .map_err(|e| ExprError::Other(e.to_string()))
            }
            "threads" => {
                arity("0", args.is_empty())?;
                Ok(Value::Text(self.render_threads()))
            }
            "regs" => {
                arity("0", args.is_empty())?;
                let ctx = self.require_context(ctx)?;
                Ok(Value::Text(ctx.render_registers(self.arch.pointer_size())))
            }
            "bt" => {
                arity("0", args.is_empty())?;
                let ctx = self.require_context(ctx)?;
                Ok(Value::Text(self.render_backtrace(ctx)))
            }
            _ => Err(ExprError::UnknownFunction(name.to_string())),
        }
    }

    /// バックトレースを1フレーム1行で表示する
    pub fn render_backtrace(&self, ctx: &CpuContext) -> String {
        let frames = self
            .backtracer
            .as_ref()
            .map(|b| b.backtrace(ctx))
            .unwrap_or_default();
        let names: Vec<String> = frames.iter().map(|addr| self.namer.resolve(*addr)).collect();
        format!("\t{}", names.join("\n\t"))
    }

    /// 自プロセスのスレッド一覧（`[tid:state] name pc:<位置>`）
    pub fn render_threads(&self) -> String {
        let pid = std::process::id() as i32;
        match kumo_target::list_threads(pid) {
            Ok(tids) => tids
                .iter()
                .map(|tid| self.render_thread(pid, *tid))
                .collect::<Vec<_>>()
                .join("\n"),
            Err(e) => format!("(failed to list threads: {})", e),
        }
    }

    fn render_thread(&self, pid: i32, tid: ThreadId) -> String {
        let name = kumo_target::thread::thread_name(pid, tid).unwrap_or_default();
        let stat = ThreadStat::read(pid, tid);
        let state = stat.as_ref().map_or('?', |s| s.state);
        let mut line = format!("[{}:{}] {}", tid, state, name);
        if let Some(pc) = stat.and_then(|s| s.pc) {
            line.push_str(&format!(" pc:{}", self.namer.resolve(pc)));
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::FixedBacktracer;
    use kumo_dwarf::DecodeConfig;
    use kumo_target::Memory;

    fn evaluator() -> ExpressionEvaluator {
        let memory: SharedMemory = Arc::new(Memory::current());
        let namer = Arc::new(AddressNamer::new());
        let decoder = ValueDecoder::new(memory.clone(), DecodeConfig::default());
        ExpressionEvaluator::new(memory, namer, decoder)
    }

    fn context() -> CpuContext {
        CpuContext::new(0x401000, 0x7ffe0000, 0).with_register("rax", 5)
    }

    #[test]
    fn test_arithmetic() {
        let ev = evaluator();
        assert_eq!(ev.evaluate_to_string("1+1", None), "2");
        assert_eq!(ev.evaluate_to_string("2 + 3 * 4", None), "14");
        assert_eq!(ev.evaluate_to_string("(2 + 3) * 4", None), "20");
        assert_eq!(ev.evaluate_to_string("0x10 | 1 << 2", None), "20");
        assert_eq!(ev.evaluate_to_string("-1", None), "-1");
        assert_eq!(ev.evaluate_to_string("~0 & 0xff", None), "255");
        assert_eq!(ev.evaluate_to_string("hex(255)", None), "0xff");
    }

    #[test]
    fn test_registers_from_context() {
        let ev = evaluator();
        let ctx = context();
        assert_eq!(ev.evaluate("rax * 2", Some(&ctx)), Ok(Value::Int(10)));
        assert_eq!(ev.evaluate_to_string("hex(pc + 4)", Some(&ctx)), "0x401004");
        assert_eq!(
            ev.evaluate("rax", None),
            Err(ExprError::UnknownIdentifier("rax".to_string()))
        );
    }

    #[test]
    fn test_memory_builtins() {
        let ev = evaluator();
        let value: u64 = 0x1122_3344_5566_7788;
        let text = b"kumo\0";
        let value_addr = &value as *const u64 as u64;
        let text_addr = text.as_ptr() as u64;

        assert_eq!(
            ev.evaluate(&format!("*{}", value_addr), None),
            Ok(Value::Int(value))
        );
        assert_eq!(
            ev.evaluate(&format!("read8({})", value_addr), None),
            Ok(Value::Int(0x88))
        );
        assert_eq!(
            ev.evaluate_to_string(&format!("str({})", text_addr), None),
            "kumo"
        );
        assert_eq!(
            ev.evaluate_to_string(&format!("decode({}, \"s.name\")", text_addr), None),
            "kumo"
        );
        assert!(ev
            .evaluate_to_string(&format!("hexdump({}, 4)", text_addr), None)
            .contains("6b 75 6d 6f"));
    }

    #[test]
    fn test_name_override_builtin() {
        let ev = evaluator();
        assert_eq!(
            ev.evaluate_to_string("name(0x5000, 0x10, 'decrypt')", None),
            "decrypt"
        );
        assert_eq!(ev.evaluate_to_string("sym(0x5004)", None), "decrypt+0x4");
    }

    #[test]
    fn test_errors_render_fixed_trace() {
        let ev = evaluator();
        assert_eq!(
            ev.evaluate_to_string("foo + 1", None),
            "ReferenceError: foo is not defined\n    at <eval> (foo + 1)"
        );
        assert_eq!(
            ev.evaluate_to_string("1 / 0", None),
            "RangeError: division by zero\n    at <eval> (1 / 0)"
        );
        assert!(ev
            .evaluate_to_string("read64(0)", None)
            .starts_with("Error: access violation accessing 0x0"));
        assert!(ev
            .evaluate_to_string("(1 + ", None)
            .starts_with("SyntaxError:"));
        assert!(ev.evaluate_to_string("nope()", None).contains("nope() is not defined"));
        assert!(ev.evaluate_to_string("sym()", None).contains("takes 1 argument(s), got 0"));
    }

    #[test]
    fn test_backtrace_builtin() {
        let base = evaluator();
        base.namer().add_override(0x7000, 0x100, "main");
        let ev = base.with_backtracer(Arc::new(FixedBacktracer(vec![0x7010, 0x9000])));

        let ctx = context();
        assert_eq!(
            ev.evaluate_to_string("bt()", Some(&ctx)),
            "\tmain+0x10\n\t0x9000"
        );
        assert!(ev.evaluate("bt()", None).is_err());
    }

    #[test]
    fn test_threads_builtin_shows_state() {
        let ev = evaluator();
        let out = ev.evaluate_to_string("threads()", None);
        let me = kumo_target::current_thread_id();
        let line = out
            .lines()
            .find(|l| l.starts_with(&format!("[{}:", me)))
            .unwrap();
        // 一覧を読んでいるスレッド自身は実行中
        assert!(line.starts_with(&format!("[{}:R]", me)));
    }

    #[test]
    fn test_string_concat() {
        let ev = evaluator();
        assert_eq!(ev.evaluate_to_string("'rax=' + 5", None), "rax=5");
    }

    #[test]
    fn test_parse_tree() {
        assert_eq!(
            parse_expression("*(sp + 8)").unwrap(),
            Expression::Unary {
                op: UnaryOp::Deref,
                operand: Box::new(Expression::Binary {
                    op: BinaryOp::Add,
                    lhs: Box::new(Expression::Identifier("sp".to_string())),
                    rhs: Box::new(Expression::Number(8)),
                }),
            }
        );
        assert!(parse_expression("").is_err());
        assert!(parse_expression("1 2").is_err());
    }
}
