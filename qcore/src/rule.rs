//! Dependency-rule expressions (spec.md §3, §4.6, §6): strings like
//! `⟨a.b⟩ = ⟨c.d⟩ + 1.25e9` that derive one axis value from others.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum RuleError {
    Syntax(String),
    UnknownPath(String),
}

impl fmt::Display for RuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleError::Syntax(s) => write!(f, "rule syntax error: {s}"),
            RuleError::UnknownPath(p) => write!(f, "rule references unknown path `{p}`"),
        }
    }
}
impl std::error::Error for RuleError {}

/// A parsed `⟨path⟩ = expr` rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub target: String,
    tokens: Vec<Token>,
}

#[derive(Debug, Clone)]
enum Token {
    Num(f64),
    Path(String),
    Op(char),
    LParen,
    RParen,
}

fn tokenize(expr: &str) -> Result<Vec<Token>, RuleError> {
    let mut tokens = Vec::new();
    let mut chars = expr.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '⟨' => {
                chars.next();
                let mut path = String::new();
                for c in chars.by_ref() {
                    if c == '⟩' {
                        break;
                    }
                    path.push(c);
                }
                tokens.push(Token::Path(path));
            }
            '+' | '-' | '*' | '/' => {
                tokens.push(Token::Op(c));
                chars.next();
            }
            '(' => {
                tokens.push(Token::LParen);
                chars.next();
            }
            ')' => {
                tokens.push(Token::RParen);
                chars.next();
            }
            _ if c.is_ascii_digit() || c == '.' => {
                let mut num = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' || ((c == '+' || c == '-') && num.ends_with(['e', 'E'])) {
                        num.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let v: f64 = num.parse().map_err(|_| RuleError::Syntax(format!("bad number `{num}`")))?;
                tokens.push(Token::Num(v));
            }
            other => return Err(RuleError::Syntax(format!("unexpected character `{other}`"))),
        }
    }
    Ok(tokens)
}

impl Rule {
    pub fn parse(text: &str) -> Result<Rule, RuleError> {
        let (lhs, rhs) = text.split_once('=').ok_or_else(|| RuleError::Syntax("missing `=`".into()))?;
        let lhs_tokens = tokenize(lhs.trim())?;
        let target = match lhs_tokens.as_slice() {
            [Token::Path(p)] => p.clone(),
            _ => return Err(RuleError::Syntax("left-hand side must be a single ⟨path⟩".into())),
        };
        let tokens = tokenize(rhs.trim())?;
        Ok(Rule { target, tokens })
    }

    /// Evaluates the right-hand side, resolving `⟨path⟩` references via
    /// `resolve`, and returns the derived value for `self.target`.
    pub fn evaluate(&self, resolve: impl Fn(&str) -> Option<f64>) -> Result<f64, RuleError> {
        let values: Vec<Token> = self
            .tokens
            .iter()
            .map(|t| match t {
                Token::Path(p) => resolve(p).map(Token::Num).ok_or_else(|| RuleError::UnknownPath(p.clone())),
                other => Ok(other.clone()),
            })
            .collect::<Result<_, _>>()?;
        eval_expr(&values)
    }
}

/// Minimal shunting-yard evaluator for `+ - * /` with parens, no precedence
/// between unary and binary beyond standard `*` `/` over `+` `-`.
fn eval_expr(tokens: &[Token]) -> Result<f64, RuleError> {
    let mut output: Vec<f64> = Vec::new();
    let mut ops: Vec<char> = Vec::new();

    fn prec(op: char) -> u8 {
        match op {
            '+' | '-' => 1,
            '*' | '/' => 2,
            _ => 0,
        }
    }
    fn apply(output: &mut Vec<f64>, op: char) -> Result<(), RuleError> {
        let b = output.pop().ok_or_else(|| RuleError::Syntax("missing operand".into()))?;
        let a = output.pop().ok_or_else(|| RuleError::Syntax("missing operand".into()))?;
        output.push(match op {
            '+' => a + b,
            '-' => a - b,
            '*' => a * b,
            '/' => a / b,
            _ => return Err(RuleError::Syntax(format!("unknown operator `{op}`"))),
        });
        Ok(())
    }

    for tok in tokens {
        match tok {
            Token::Num(n) => output.push(*n),
            Token::Op(op) => {
                while let Some(&top) = ops.last() {
                    if top != '(' && prec(top) >= prec(*op) {
                        apply(&mut output, ops.pop().unwrap())?;
                    } else {
                        break;
                    }
                }
                ops.push(*op);
            }
            Token::LParen => ops.push('('),
            Token::RParen => {
                while let Some(top) = ops.pop() {
                    if top == '(' {
                        break;
                    }
                    apply(&mut output, top)?;
                }
            }
            Token::Path(_) => unreachable!("paths are resolved before evaluation"),
        }
    }
    while let Some(op) = ops.pop() {
        apply(&mut output, op)?;
    }
    output.pop().ok_or_else(|| RuleError::Syntax("empty expression".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_evaluates_a_linear_rule() {
        let rule = Rule::parse("⟨a.b⟩ = ⟨c.d⟩ + 1.25e9").unwrap();
        assert_eq!(rule.target, "a.b");
        let v = rule.evaluate(|p| if p == "c.d" { Some(4.0e9) } else { None }).unwrap();
        assert_eq!(v, 5.25e9);
    }

    #[test]
    fn operator_precedence_is_respected() {
        let rule = Rule::parse("⟨x⟩ = 1 + 2 * 3").unwrap();
        assert_eq!(rule.evaluate(|_| None).unwrap(), 7.0);
    }

    #[test]
    fn unknown_path_is_an_error() {
        let rule = Rule::parse("⟨x⟩ = ⟨missing⟩").unwrap();
        assert!(matches!(rule.evaluate(|_| None), Err(RuleError::UnknownPath(_))));
    }
}
