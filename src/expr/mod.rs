/// Shard and table split expressions
///
/// A split expression is a tiny integer language over one input, the
/// partition key, written as `$`. It supports decimal literals, parentheses
/// and the left-associative binary operators `* / % + - << >> & |`.
/// Expressions are tokenized once when the configuration is loaded and
/// evaluated on every routed request.
use fnv::FnvHashMap;
use std::fmt;

/// Binding strength of `(`, used only as a boundary marker on the stack
const LPAREN_PRECEDENCE: u16 = 256;

/// Binary operators of the split language
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Mul,
    Div,
    Mod,
    Add,
    Sub,
    Shl,
    Shr,
    And,
    Or,
}

impl BinOp {
    fn symbol(&self) -> &'static str {
        match self {
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::And => "&",
            BinOp::Or => "|",
        }
    }
}

/// A lexical token of a split expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Num(u32),
    /// The `$` placeholder, replaced by the partition key
    Arg,
    LParen,
    RParen,
    Op(BinOp),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Num(n) => write!(f, "{}", n),
            Token::Arg => write!(f, "$"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Op(op) => write!(f, "{}", op.symbol()),
        }
    }
}

/// Expression errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExprError {
    /// No expression configured; the table or service is not split
    #[error("empty split expression")]
    Empty,

    #[error("compute error: {0}")]
    Compute(String),
}

/// A tokenized split expression
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitExpr {
    source: String,
    tokens: Vec<Token>,
}

impl SplitExpr {
    /// The raw expression text
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// An empty expression means "not split"
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl fmt::Display for SplitExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

/// Operator-precedence evaluator for split expressions.
///
/// One evaluator is created by the manager and shared by every service,
/// logic database and connection it owns. Lower precedence values bind
/// tighter; an incoming operator reduces the stack while the operator on
/// top binds at least as tightly, which makes every operator
/// left-associative.
#[derive(Debug, Clone)]
pub struct ShardEvaluator {
    precedence: FnvHashMap<BinOp, u16>,
}

impl Default for ShardEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardEvaluator {
    pub fn new() -> Self {
        let mut precedence = FnvHashMap::default();
        precedence.insert(BinOp::Mul, 3);
        precedence.insert(BinOp::Div, 3);
        precedence.insert(BinOp::Mod, 3);
        precedence.insert(BinOp::Add, 4);
        precedence.insert(BinOp::Sub, 4);
        precedence.insert(BinOp::Shl, 5);
        precedence.insert(BinOp::Shr, 5);
        precedence.insert(BinOp::And, 8);
        precedence.insert(BinOp::Or, 10);
        Self { precedence }
    }

    fn precedence_of(&self, token: &Token) -> u16 {
        match token {
            Token::Op(op) => self.precedence.get(op).copied().unwrap_or(LPAREN_PRECEDENCE),
            _ => LPAREN_PRECEDENCE,
        }
    }

    /// Tokenize an expression, rejecting unsupported characters immediately
    pub fn split(&self, expr: &str) -> Result<Vec<Token>, ExprError> {
        let bytes = expr.as_bytes();
        let mut tokens = Vec::new();
        let mut pos = 0;

        while pos < bytes.len() {
            let c = bytes[pos];
            match c {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    pos += 1;
                }
                b'0'..=b'9' => {
                    let mut value: u32 = 0;
                    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                        value = value
                            .checked_mul(10)
                            .and_then(|v| v.checked_add((bytes[pos] - b'0') as u32))
                            .ok_or_else(|| {
                                ExprError::Compute(format!("literal out of range in '{}'", expr))
                            })?;
                        pos += 1;
                    }
                    tokens.push(Token::Num(value));
                }
                b'$' => {
                    tokens.push(Token::Arg);
                    pos += 1;
                }
                b'(' => {
                    tokens.push(Token::LParen);
                    pos += 1;
                }
                b')' => {
                    tokens.push(Token::RParen);
                    pos += 1;
                }
                b'+' | b'-' | b'*' | b'/' | b'%' | b'&' | b'|' => {
                    let op = match c {
                        b'+' => BinOp::Add,
                        b'-' => BinOp::Sub,
                        b'*' => BinOp::Mul,
                        b'/' => BinOp::Div,
                        b'%' => BinOp::Mod,
                        b'&' => BinOp::And,
                        _ => BinOp::Or,
                    };
                    tokens.push(Token::Op(op));
                    pos += 1;
                }
                b'<' | b'>' => {
                    if bytes.get(pos + 1) != Some(&c) {
                        return Err(ExprError::Compute(format!(
                            "unknown symbol '{}' at offset {} in '{}'",
                            c as char, pos, expr
                        )));
                    }
                    tokens.push(Token::Op(if c == b'<' { BinOp::Shl } else { BinOp::Shr }));
                    pos += 2;
                }
                _ => {
                    return Err(ExprError::Compute(format!(
                        "unknown symbol '{}' at offset {} in '{}'",
                        expr[pos..].chars().next().unwrap_or('?'),
                        pos,
                        expr
                    )));
                }
            }
        }

        Ok(tokens)
    }

    /// Tokenize an expression and validate it by evaluating it once
    pub fn parse(&self, expr: &str) -> Result<SplitExpr, ExprError> {
        let tokens = self.split(expr)?;
        if !tokens.is_empty() {
            // Structure only: a zero divisor depends on the key.
            self.run(&tokens, 0, false)?;
        }
        Ok(SplitExpr {
            source: expr.trim().to_string(),
            tokens,
        })
    }

    /// Evaluate a token list against `arg`.
    ///
    /// An empty list yields [`ExprError::Empty`]; any structural problem
    /// yields [`ExprError::Compute`].
    pub fn evaluate(&self, tokens: &[Token], arg: u32) -> Result<u32, ExprError> {
        self.run(tokens, arg, true)
    }

    fn run(&self, tokens: &[Token], arg: u32, strict: bool) -> Result<u32, ExprError> {
        if tokens.is_empty() {
            return Err(ExprError::Empty);
        }

        let mut operands: Vec<u32> = Vec::with_capacity(tokens.len());
        let mut operators: Vec<Token> = Vec::with_capacity(tokens.len());

        for token in tokens {
            match token {
                Token::Num(n) => operands.push(*n),
                Token::Arg => operands.push(arg),
                Token::LParen => operators.push(Token::LParen),
                Token::RParen => loop {
                    match operators.pop() {
                        Some(Token::LParen) => break,
                        Some(Token::Op(op)) => Self::reduce(&mut operands, op, strict)?,
                        _ => {
                            return Err(ExprError::Compute("unbalanced ')'".to_string()));
                        }
                    }
                },
                Token::Op(op) => {
                    let incoming = self.precedence_of(token);
                    while let Some(top @ Token::Op(top_op)) = operators.last().copied() {
                        if self.precedence_of(&top) > incoming {
                            break;
                        }
                        operators.pop();
                        Self::reduce(&mut operands, top_op, strict)?;
                    }
                    operators.push(Token::Op(*op));
                }
            }
        }

        while let Some(top) = operators.pop() {
            match top {
                Token::Op(op) => Self::reduce(&mut operands, op, strict)?,
                _ => return Err(ExprError::Compute("unbalanced '('".to_string())),
            }
        }

        match operands.as_slice() {
            [value] => Ok(*value),
            [] => Err(ExprError::Compute("no operand".to_string())),
            _ => Err(ExprError::Compute("missing operator".to_string())),
        }
    }

    /// Evaluate a pre-tokenized expression
    pub fn eval(&self, expr: &SplitExpr, arg: u32) -> Result<u32, ExprError> {
        self.evaluate(&expr.tokens, arg)
    }

    /// Tokenize and evaluate in one step
    pub fn compute(&self, expr: &str, arg: u32) -> Result<u32, ExprError> {
        let tokens = self.split(expr)?;
        self.evaluate(&tokens, arg)
    }

    fn reduce(operands: &mut Vec<u32>, op: BinOp, strict: bool) -> Result<(), ExprError> {
        let (rhs, lhs) = match (operands.pop(), operands.pop()) {
            (Some(rhs), Some(lhs)) => (rhs, lhs),
            _ => {
                return Err(ExprError::Compute(format!(
                    "insufficient operands for '{}'",
                    op.symbol()
                )))
            }
        };

        let value = match op {
            BinOp::Add => lhs.wrapping_add(rhs),
            BinOp::Sub => lhs.wrapping_sub(rhs),
            BinOp::Mul => lhs.wrapping_mul(rhs),
            BinOp::Div | BinOp::Mod => {
                let value = if op == BinOp::Div {
                    lhs.checked_div(rhs)
                } else {
                    lhs.checked_rem(rhs)
                };
                match value {
                    Some(value) => value,
                    None if !strict => 0,
                    None => {
                        return Err(ExprError::Compute(format!(
                            "division by zero in '{}'",
                            op.symbol()
                        )))
                    }
                }
            }
            BinOp::Shl => lhs.checked_shl(rhs).unwrap_or(0),
            BinOp::Shr => lhs.checked_shr(rhs).unwrap_or(0),
            BinOp::And => lhs & rhs,
            BinOp::Or => lhs | rhs,
        };
        operands.push(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_examples() {
        let evaluator = ShardEvaluator::new();
        assert_eq!(evaluator.compute("$ & 3", 7), Ok(3));
        assert_eq!(evaluator.compute("($ + 1) * 2", 5), Ok(12));
        assert!(matches!(evaluator.compute("$ +", 5), Err(ExprError::Compute(_))));
    }

    #[test]
    fn test_empty_is_distinct_from_malformed() {
        let evaluator = ShardEvaluator::new();
        assert_eq!(evaluator.evaluate(&[], 42), Err(ExprError::Empty));
        assert_eq!(evaluator.compute("   ", 42), Err(ExprError::Empty));
        assert!(matches!(evaluator.compute("()", 42), Err(ExprError::Compute(_))));
    }

    #[test]
    fn test_precedence() {
        let evaluator = ShardEvaluator::new();
        assert_eq!(evaluator.compute("1 + 2 * 3", 0), Ok(7));
        assert_eq!(evaluator.compute("$ / 10 % 4", 97), Ok(1));
        assert_eq!(evaluator.compute("1 << 2 + 1", 0), Ok(8));
        assert_eq!(evaluator.compute("6 & 3 | 8", 0), Ok(10));
        assert_eq!(evaluator.compute("$ >> 4 & 15", 0x1234), Ok(3));
        assert_eq!(evaluator.compute("10 - 3 - 2", 0), Ok(5));
        assert_eq!(evaluator.compute("64 / 4 / 2", 0), Ok(8));
    }

    #[test]
    fn test_wraparound() {
        let evaluator = ShardEvaluator::new();
        assert_eq!(evaluator.compute("$ - 1", 0), Ok(u32::MAX));
        assert_eq!(evaluator.compute("$ * 2", 0x8000_0001), Ok(2));
        assert_eq!(evaluator.compute("1 << 40", 0), Ok(0));
    }

    #[test]
    fn test_malformed_expressions() {
        let evaluator = ShardEvaluator::new();
        assert!(matches!(evaluator.compute("($ + 1", 1), Err(ExprError::Compute(_))));
        assert!(matches!(evaluator.compute("$ + 1)", 1), Err(ExprError::Compute(_))));
        assert!(matches!(evaluator.compute("$ 1", 1), Err(ExprError::Compute(_))));
        assert!(matches!(evaluator.compute("$ / 0", 1), Err(ExprError::Compute(_))));
        assert!(matches!(evaluator.split("$ ^ 2"), Err(ExprError::Compute(_))));
        assert!(matches!(evaluator.split("$ < 2"), Err(ExprError::Compute(_))));
        assert!(matches!(evaluator.split("99999999999"), Err(ExprError::Compute(_))));
    }

    #[test]
    fn test_split_tokens() {
        let evaluator = ShardEvaluator::new();
        let tokens = evaluator.split("($<<1)|0").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::LParen,
                Token::Arg,
                Token::Op(BinOp::Shl),
                Token::Num(1),
                Token::RParen,
                Token::Op(BinOp::Or),
                Token::Num(0),
            ]
        );
        let rendered: Vec<String> = tokens.iter().map(|t| t.to_string()).collect();
        assert_eq!(rendered.concat(), "($<<1)|0");
    }

    #[test]
    fn test_parse_validates_structure() {
        let evaluator = ShardEvaluator::new();
        let expr = evaluator.parse(" $ % 4 ").unwrap();
        assert_eq!(expr.source(), "$ % 4");
        assert_eq!(evaluator.eval(&expr, 10), Ok(2));

        assert!(evaluator.parse("").unwrap().is_empty());
        assert!(evaluator.parse("$ %").is_err());
        assert!(evaluator.parse("$ / 0").is_ok());
    }
}
