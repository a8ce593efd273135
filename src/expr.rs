//! Expression front end: `out = a * b + (c ^ 3)` style assignments compiled
//! into a [`Graph`].
//!
//! Variables are declared separately (`a:u8,b:i8`); operators follow C-like
//! precedence (`|` lowest, then `^`, `&`, shifts, `+ -`, `*`, unary `~`).
//! Shift amounts must be integer literals, the fabric shifts by rewiring.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::graph::{Graph, NodeId, Op};

/// Declared width and signedness of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarSpec {
    pub width: u16,
    pub signed: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExprError {
    #[error("unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),
    #[error("unexpected {0}")]
    Unexpected(String),
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),
    #[error("bad variable declaration '{0}'")]
    BadDecl(String),
    #[error("shift amount must be an integer literal")]
    ShiftAmount,
    #[error("expected '{0}'")]
    Expected(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Int(u64),
    Assign,
    Or,
    Xor,
    And,
    Not,
    Shl,
    Shr,
    Plus,
    Minus,
    Star,
    LParen,
    RParen,
    Eof,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(s) => format!("identifier '{s}'"),
            Token::Int(v) => format!("integer {v}"),
            Token::Eof => "end of input".to_string(),
            t => format!("{t:?}"),
        }
    }
}

fn lex(src: &str) -> Result<Vec<Token>, ExprError> {
    let bytes = src.as_bytes();
    let mut toks = Vec::new();
    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '=' => {
                toks.push(Token::Assign);
                i += 1;
            }
            '|' => {
                toks.push(Token::Or);
                i += 1;
            }
            '^' => {
                toks.push(Token::Xor);
                i += 1;
            }
            '&' => {
                toks.push(Token::And);
                i += 1;
            }
            '~' => {
                toks.push(Token::Not);
                i += 1;
            }
            '+' => {
                toks.push(Token::Plus);
                i += 1;
            }
            '-' => {
                toks.push(Token::Minus);
                i += 1;
            }
            '*' => {
                toks.push(Token::Star);
                i += 1;
            }
            '(' => {
                toks.push(Token::LParen);
                i += 1;
            }
            ')' => {
                toks.push(Token::RParen);
                i += 1;
            }
            '<' | '>' => {
                if i + 1 < bytes.len() && bytes[i + 1] as char == c {
                    toks.push(if c == '<' { Token::Shl } else { Token::Shr });
                    i += 2;
                } else {
                    return Err(ExprError::UnexpectedChar(c, i));
                }
            }
            '0'..='9' => {
                let start = i;
                let mut value: u64;
                if c == '0' && i + 1 < bytes.len() && (bytes[i + 1] | 0x20) == b'x' {
                    i += 2;
                    value = 0;
                    while i < bytes.len() && (bytes[i] as char).is_ascii_hexdigit() {
                        value = value << 4 | (bytes[i] as char).to_digit(16).unwrap_or(0) as u64;
                        i += 1;
                    }
                    if i == start + 2 {
                        return Err(ExprError::UnexpectedChar('x', start + 1));
                    }
                } else {
                    value = 0;
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        value = value * 10 + (bytes[i] - b'0') as u64;
                        i += 1;
                    }
                }
                toks.push(Token::Int(value));
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                toks.push(Token::Ident(src[start..i].to_string()));
            }
            _ => return Err(ExprError::UnexpectedChar(c, i)),
        }
    }
    toks.push(Token::Eof);
    Ok(toks)
}

/// Parse a comma-separated declaration list, e.g. `a:u8,b:i4,sel:u1`.
pub fn parse_var_decls(spec: &str) -> Result<BTreeMap<String, VarSpec>, ExprError> {
    let mut vars = BTreeMap::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (name, ty) = part
            .split_once(':')
            .ok_or_else(|| ExprError::BadDecl(part.to_string()))?;
        let ty = ty.trim();
        let signed = match ty.as_bytes().first() {
            Some(b'u') => false,
            Some(b'i') => true,
            _ => return Err(ExprError::BadDecl(part.to_string())),
        };
        let width: u16 = ty[1..]
            .parse()
            .map_err(|_| ExprError::BadDecl(part.to_string()))?;
        if width == 0 || width > 64 {
            return Err(ExprError::BadDecl(part.to_string()));
        }
        vars.insert(name.trim().to_string(), VarSpec { width, signed });
    }
    Ok(vars)
}

struct Parser {
    toks: Vec<Token>,
    pos: usize,
    graph: Graph,
    vars: BTreeMap<String, NodeId>,
}

/// Result width/signedness of a node, cached while parsing.
#[derive(Clone, Copy)]
struct Shape {
    width: u16,
    signed: bool,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.toks[self.pos]
    }

    fn bump(&mut self) -> Token {
        let t = self.toks[self.pos].clone();
        if self.pos + 1 < self.toks.len() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, tok: Token, what: &'static str) -> Result<(), ExprError> {
        if *self.peek() == tok {
            self.bump();
            Ok(())
        } else {
            Err(ExprError::Expected(what))
        }
    }

    fn shape(&self, id: NodeId) -> Shape {
        let n = self.graph.node(id);
        Shape {
            width: n.width,
            signed: n.signed,
        }
    }

    fn binary(&mut self, op: Op, lhs: NodeId, rhs: NodeId) -> NodeId {
        let l = self.shape(lhs);
        let r = self.shape(rhs);
        let signed = l.signed || r.signed;
        let width = match op {
            // Full product; anything narrower would truncate high bits.
            Op::Mul => l.width + r.width,
            // Wraparound arithmetic at the wider operand width.
            _ => l.width.max(r.width),
        };
        self.graph.add_op(op, [lhs, rhs], width, signed)
    }

    // expr := or
    fn expr(&mut self) -> Result<NodeId, ExprError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<NodeId, ExprError> {
        let mut lhs = self.xor_expr()?;
        while *self.peek() == Token::Or {
            self.bump();
            let rhs = self.xor_expr()?;
            lhs = self.binary(Op::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn xor_expr(&mut self) -> Result<NodeId, ExprError> {
        let mut lhs = self.and_expr()?;
        while *self.peek() == Token::Xor {
            self.bump();
            let rhs = self.and_expr()?;
            lhs = self.binary(Op::Xor, lhs, rhs);
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<NodeId, ExprError> {
        let mut lhs = self.shift_expr()?;
        while *self.peek() == Token::And {
            self.bump();
            let rhs = self.shift_expr()?;
            lhs = self.binary(Op::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn shift_expr(&mut self) -> Result<NodeId, ExprError> {
        let mut lhs = self.add_expr()?;
        loop {
            let left = match self.peek() {
                Token::Shl => true,
                Token::Shr => false,
                _ => break,
            };
            self.bump();
            let amount = match self.bump() {
                Token::Int(v) => v as u16,
                _ => return Err(ExprError::ShiftAmount),
            };
            let s = self.shape(lhs);
            let op = if left { Op::Shl(amount) } else { Op::Shr(amount) };
            lhs = self.graph.add_op(op, [lhs], s.width, s.signed);
        }
        Ok(lhs)
    }

    fn add_expr(&mut self) -> Result<NodeId, ExprError> {
        let mut lhs = self.mul_expr()?;
        loop {
            let op = match self.peek() {
                Token::Plus => Op::Add,
                Token::Minus => Op::Sub,
                _ => break,
            };
            self.bump();
            let rhs = self.mul_expr()?;
            lhs = self.binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn mul_expr(&mut self) -> Result<NodeId, ExprError> {
        let mut lhs = self.unary()?;
        while *self.peek() == Token::Star {
            self.bump();
            let rhs = self.unary()?;
            lhs = self.binary(Op::Mul, lhs, rhs);
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<NodeId, ExprError> {
        if *self.peek() == Token::Not {
            self.bump();
            let inner = self.unary()?;
            let s = self.shape(inner);
            return Ok(self.graph.add_op(Op::Not, [inner], s.width, s.signed));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<NodeId, ExprError> {
        match self.bump() {
            Token::Ident(name) => self
                .vars
                .get(&name)
                .copied()
                .ok_or(ExprError::UnknownVariable(name)),
            Token::Int(v) => {
                let width = (64 - v.leading_zeros()).max(1) as u16;
                Ok(self.graph.add_const(v, width))
            }
            Token::LParen => {
                let inner = self.expr()?;
                self.expect(Token::RParen, ")")?;
                Ok(inner)
            }
            t => Err(ExprError::Unexpected(t.describe())),
        }
    }
}

/// Compile an assignment `name = expr` over declared variables into a graph.
pub fn compile(src: &str, vars: &BTreeMap<String, VarSpec>) -> Result<Graph, ExprError> {
    let toks = lex(src)?;
    let mut graph = Graph::new();
    let mut ids = BTreeMap::new();
    for (name, spec) in vars {
        ids.insert(name.clone(), graph.add_input(name, spec.width, spec.signed));
    }
    let mut p = Parser {
        toks,
        pos: 0,
        graph,
        vars: ids,
    };
    let out_name = match p.bump() {
        Token::Ident(name) => name,
        t => return Err(ExprError::Unexpected(t.describe())),
    };
    p.expect(Token::Assign, "=")?;
    let root = p.expr()?;
    if *p.peek() != Token::Eof {
        return Err(ExprError::Unexpected(p.peek().describe()));
    }
    let width = p.shape(root).width;
    p.graph.add_output(&out_name, root, width);
    Ok(p.graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Op;

    fn vars(spec: &str) -> BTreeMap<String, VarSpec> {
        parse_var_decls(spec).unwrap()
    }

    #[test]
    fn test_decls() {
        let v = vars("a:u8, b:i4");
        assert_eq!(v["a"], VarSpec { width: 8, signed: false });
        assert_eq!(v["b"], VarSpec { width: 4, signed: true });
        assert!(parse_var_decls("a:f8").is_err());
        assert!(parse_var_decls("a:u0").is_err());
    }

    #[test]
    fn test_precedence() {
        // a | b & c parses as a | (b & c)
        let g = compile("o = a | b & c", &vars("a:u4,b:u4,c:u4")).unwrap();
        let out = g.node(g.outputs[0]);
        let root = g.node(out.operands[0]);
        assert_eq!(root.op, Op::Or);
        assert_eq!(g.node(root.operands[1]).op, Op::And);
    }

    #[test]
    fn test_add_width_wraps() {
        let g = compile("o = a + b", &vars("a:u8,b:u8")).unwrap();
        assert_eq!(g.node(g.outputs[0]).width, 8);
    }

    #[test]
    fn test_mul_width_is_sum() {
        let g = compile("o = a * b", &vars("a:u8,b:u8")).unwrap();
        assert_eq!(g.node(g.outputs[0]).width, 16);
    }

    #[test]
    fn test_signedness_propagates() {
        let g = compile("o = a + b", &vars("a:i8,b:u8")).unwrap();
        assert!(g.node(g.outputs[0]).signed);
    }

    #[test]
    fn test_shift_literal_only() {
        assert!(compile("o = a << 2", &vars("a:u8,b:u8")).is_ok());
        assert_eq!(
            compile("o = a << b", &vars("a:u8,b:u8")).unwrap_err(),
            ExprError::ShiftAmount
        );
    }

    #[test]
    fn test_unknown_variable() {
        assert_eq!(
            compile("o = a + q", &vars("a:u8")).unwrap_err(),
            ExprError::UnknownVariable("q".into())
        );
    }

    #[test]
    fn test_hex_literal() {
        let g = compile("o = a & 0xF0", &vars("a:u8")).unwrap();
        let found = g
            .nodes()
            .any(|(_, n)| matches!(n.op, Op::Const(0xF0)));
        assert!(found);
    }
}
