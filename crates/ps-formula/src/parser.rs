//! Tokenizer and recursive-descent parser for model formulas.
//!
//! Grammar (whitespace insignificant):
//!
//! ```text
//! formula  := [IDENT ('~' | '=')] sum
//! sum      := product ('+' product)*
//! product  := inter ('*' inter)*
//! inter    := atom (':' atom)*
//! atom     := IDENT | '(' sum ')' | '(' re_lhs '|' IDENT ['/' IDENT] ')'
//! re_lhs   := re_item ('+' re_item)*
//! re_item  := '0' | '1' | IDENT
//! ```

use ps_core::{Error, Result};

use crate::formula::{DEFAULT_OUTCOME, Formula, RandomEffect, Term};

// ── Tokenizer ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Num(String),
    Sep,
    Plus,
    Star,
    Colon,
    Pipe,
    Slash,
    LParen,
    RParen,
}

fn formula_err(msg: impl Into<String>) -> Error {
    Error::Formula(msg.into())
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let single = match c {
            '~' | '=' => Some(Token::Sep),
            '+' => Some(Token::Plus),
            '*' => Some(Token::Star),
            ':' => Some(Token::Colon),
            '|' => Some(Token::Pipe),
            '/' => Some(Token::Slash),
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            _ => None,
        };
        if let Some(t) = single {
            tokens.push(t);
            i += 1;
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            if word.chars().all(|ch| ch.is_ascii_digit()) {
                tokens.push(Token::Num(word));
            } else {
                return Err(formula_err(format!(
                    "malformed variable name '{}': names must start with a letter or underscore",
                    word
                )));
            }
        } else {
            return Err(formula_err(format!("unexpected character '{}'", c)));
        }
    }

    Ok(tokens)
}

fn check_balanced(tokens: &[Token]) -> Result<()> {
    let mut depth: i64 = 0;
    for t in tokens {
        match t {
            Token::LParen => depth += 1,
            Token::RParen => {
                depth -= 1;
                if depth < 0 {
                    return Err(formula_err("unbalanced parentheses: unexpected ')'"));
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(formula_err("unbalanced parentheses: missing ')'"));
    }
    Ok(())
}

// ── Parser (recursive descent) ─────────────────────────────────

/// Value of a parsed sub-expression.
#[derive(Debug, Default)]
struct Parsed {
    terms: Vec<Term>,
    random: Vec<RandomEffect>,
}

impl Parsed {
    fn fixed(terms: Vec<Term>) -> Self {
        Self { terms, random: Vec::new() }
    }

    fn require_fixed(self, op: &str) -> Result<Vec<Term>> {
        if !self.random.is_empty() {
            return Err(formula_err(format!("random effects cannot be combined with '{}'", op)));
        }
        Ok(self.terms)
    }
}

/// Append `t` unless an identical term is already present.
fn push_unique(out: &mut Vec<Term>, t: Term) {
    if !out.contains(&t) {
        out.push(t);
    }
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, expected: &Token) -> Result<()> {
        match self.advance() {
            Some(t) if t == expected => Ok(()),
            other => Err(formula_err(format!("expected {:?}, got {:?}", expected, other))),
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String> {
        match self.advance() {
            Some(Token::Ident(name)) => Ok(name.clone()),
            other => Err(formula_err(format!("expected {} name, got {:?}", what, other))),
        }
    }

    /// `true` if the parenthesized group starting at `self.pos` (an `LParen`)
    /// contains a top-level `|`.
    fn group_is_random(&self) -> bool {
        let mut depth = 0usize;
        for t in &self.tokens[self.pos..] {
            match t {
                Token::LParen => depth += 1,
                Token::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        return false;
                    }
                }
                Token::Pipe if depth == 1 => return true,
                _ => {}
            }
        }
        false
    }

    // ── Grammar rules ──────────────────────────────────────────

    fn parse_sum(&mut self) -> Result<Parsed> {
        let mut acc = self.parse_product()?;
        while matches!(self.peek(), Some(Token::Plus)) {
            self.advance();
            let rhs = self.parse_product()?;
            for t in rhs.terms {
                if acc.terms.contains(&t) {
                    return Err(formula_err(format!("duplicate term '{}'", t)));
                }
                acc.terms.push(t);
            }
            acc.random.extend(rhs.random);
        }
        Ok(acc)
    }

    fn parse_product(&mut self) -> Result<Parsed> {
        let first = self.parse_inter()?;
        if !matches!(self.peek(), Some(Token::Star)) {
            return Ok(first);
        }
        let mut acc = first.require_fixed("*")?;
        while matches!(self.peek(), Some(Token::Star)) {
            self.advance();
            let rhs = self.parse_inter()?.require_fixed("*")?;
            let mut next = acc.clone();
            for t in &rhs {
                push_unique(&mut next, t.clone());
            }
            for a in &acc {
                for b in &rhs {
                    push_unique(&mut next, a.cross(b));
                }
            }
            acc = next;
        }
        Ok(Parsed::fixed(acc))
    }

    fn parse_inter(&mut self) -> Result<Parsed> {
        let first = self.parse_atom()?;
        if !matches!(self.peek(), Some(Token::Colon)) {
            return Ok(first);
        }
        let mut acc = first.require_fixed(":")?;
        while matches!(self.peek(), Some(Token::Colon)) {
            self.advance();
            let rhs = self.parse_atom()?.require_fixed(":")?;
            let mut next = Vec::new();
            for a in &acc {
                for b in &rhs {
                    push_unique(&mut next, a.cross(b));
                }
            }
            acc = next;
        }
        Ok(Parsed::fixed(acc))
    }

    fn parse_atom(&mut self) -> Result<Parsed> {
        match self.peek() {
            Some(Token::Ident(name)) => {
                let t = Term::main(name.clone());
                self.advance();
                Ok(Parsed::fixed(vec![t]))
            }
            Some(Token::LParen) => {
                if self.group_is_random() {
                    return self.parse_random();
                }
                self.advance();
                let inner = self.parse_sum()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Num(n)) => Err(formula_err(format!(
                "unexpected number '{}' in fixed-effect part",
                n
            ))),
            other => Err(formula_err(format!("expected a term, got {:?}", other))),
        }
    }

    fn parse_random(&mut self) -> Result<Parsed> {
        self.expect(&Token::LParen)?;

        let mut no_intercept = false;
        let mut slopes: Vec<String> = Vec::new();
        loop {
            match self.advance() {
                Some(Token::Num(n)) if n == "1" => {}
                Some(Token::Num(n)) if n == "0" => no_intercept = true,
                Some(Token::Ident(name)) => {
                    if slopes.contains(name) {
                        return Err(formula_err(format!("duplicate random slope '{}'", name)));
                    }
                    slopes.push(name.clone());
                }
                other => {
                    return Err(formula_err(format!(
                        "invalid random-effect term {:?}",
                        other
                    )));
                }
            }
            match self.peek() {
                Some(Token::Plus) => {
                    self.advance();
                }
                Some(Token::Pipe) => {
                    self.advance();
                    break;
                }
                other => {
                    return Err(formula_err(format!(
                        "expected '+' or '|' in random effect, got {:?}",
                        other
                    )));
                }
            }
        }

        if no_intercept {
            return Err(formula_err(
                "random slopes without a random intercept, e.g. '(0 + x|g)', are not supported",
            ));
        }

        let grouping = self.expect_ident("grouping")?;
        let child = if matches!(self.peek(), Some(Token::Slash)) {
            self.advance();
            Some(self.expect_ident("nested grouping")?)
        } else {
            None
        };
        self.expect(&Token::RParen)?;

        let mut random = vec![RandomEffect { grouping: grouping.clone(), nested_in: None, slopes }];
        if let Some(child) = child {
            if !random[0].slopes.is_empty() {
                return Err(formula_err("random slopes are not supported with nested groupings"));
            }
            if child == grouping {
                return Err(formula_err(format!("grouping '{}' cannot be nested in itself", child)));
            }
            random.push(RandomEffect { grouping: child, nested_in: Some(grouping), slopes: Vec::new() });
        }
        Ok(Parsed { terms: Vec::new(), random })
    }
}

/// Parse a full formula string.
pub(crate) fn parse_formula(input: &str) -> Result<Formula> {
    let tokens = tokenize(input)?;
    check_balanced(&tokens)?;

    let n_sep = tokens.iter().filter(|t| **t == Token::Sep).count();
    let (outcome, rhs) = match n_sep {
        0 => (DEFAULT_OUTCOME.to_string(), &tokens[..]),
        1 => match (tokens.first(), tokens.get(1)) {
            (Some(Token::Ident(name)), Some(Token::Sep)) => (name.clone(), &tokens[2..]),
            _ => return Err(formula_err("left-hand side must be a single outcome name")),
        },
        _ => return Err(formula_err("formula contains more than one '~' or '='")),
    };
    if rhs.is_empty() {
        return Err(formula_err("formula has an empty right-hand side"));
    }

    let mut parser = Parser::new(rhs);
    let parsed = parser.parse_sum()?;
    if parser.pos < rhs.len() {
        return Err(formula_err(format!(
            "unexpected token after expression: {:?}",
            rhs[parser.pos]
        )));
    }

    let mut terms = parsed.terms;
    // Stable: main effects first, then two-way interactions, ...
    terms.sort_by_key(Term::order);
    if terms.iter().any(|t| t.components().contains(&outcome)) {
        return Err(formula_err(format!("outcome '{}' also appears as a predictor", outcome)));
    }
    Formula::new(outcome, terms, parsed.random)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(f: &Formula) -> Vec<String> {
        f.fixed_terms().iter().map(Term::name).collect()
    }

    #[test]
    fn test_separators_and_default_outcome() {
        let a = Formula::parse("y = x1 + x2").unwrap();
        let b = Formula::parse("y ~ x1 + x2").unwrap();
        let c = Formula::parse("x1 + x2").unwrap();
        assert_eq!(a, b);
        assert_eq!(c.outcome(), "y");
        assert_eq!(names(&c), vec!["x1", "x2"]);
    }

    #[test]
    fn test_star_expansion_three_way() {
        let f = Formula::parse("y ~ x1*x2*x3").unwrap();
        assert_eq!(
            names(&f),
            vec!["x1", "x2", "x3", "x1:x2", "x1:x3", "x2:x3", "x1:x2:x3"]
        );
    }

    #[test]
    fn test_colon_is_interaction_only() {
        let f = Formula::parse("y ~ a:b").unwrap();
        assert_eq!(names(&f), vec!["a:b"]);
    }

    #[test]
    fn test_parenthesized_product() {
        let f = Formula::parse("y ~ (a + b)*c").unwrap();
        assert_eq!(names(&f), vec!["a", "b", "c", "a:c", "b:c"]);
    }

    #[test]
    fn test_duplicate_terms_rejected() {
        assert!(matches!(Formula::parse("y ~ x1 + x1"), Err(Error::Formula(_))));
        assert!(matches!(Formula::parse("y ~ a*b + b:a"), Err(Error::Formula(_))));
    }

    #[test]
    fn test_random_intercept_and_slope() {
        let f = Formula::parse("y ~ x + (1 + x|school)").unwrap();
        assert!(f.is_mixed());
        assert_eq!(f.random_effects()[0].grouping, "school");
        assert_eq!(f.random_effects()[0].slopes, vec!["x".to_string()]);

        let implied = Formula::parse("y ~ x + (x|school)").unwrap();
        assert_eq!(implied.random_effects(), f.random_effects());
    }

    #[test]
    fn test_nested_grouping() {
        let f = Formula::parse("y ~ x + (1|school/class)").unwrap();
        let re = f.random_effects();
        assert_eq!(re.len(), 2);
        assert_eq!(re[0].grouping, "school");
        assert_eq!(re[1].grouping, "class");
        assert_eq!(re[1].nested_in.as_deref(), Some("school"));
    }

    #[test]
    fn test_slope_without_intercept_rejected() {
        let err = Formula::parse("y ~ x + (0 + x|g)").unwrap_err();
        assert!(err.to_string().contains("not supported"), "{err}");
    }

    #[test]
    fn test_unbalanced_parentheses() {
        assert!(matches!(Formula::parse("y ~ x + (1|g"), Err(Error::Formula(_))));
        assert!(matches!(Formula::parse("y ~ x + 1|g)"), Err(Error::Formula(_))));
    }

    #[test]
    fn test_malformed_names() {
        let err = Formula::parse("y ~ 2x + z").unwrap_err();
        assert!(err.to_string().contains("malformed variable name"), "{err}");
        assert!(Formula::parse("y ~ x$ + z").is_err());
        assert!(Formula::parse("y ~ _x + x.2").is_ok());
    }

    #[test]
    fn test_random_effects_not_crossed() {
        assert!(Formula::parse("y ~ x*(1|g)").is_err());
        assert!(Formula::parse("y ~ x + (1|g) + (1|g)").is_err());
    }

    #[test]
    fn test_bad_lhs() {
        assert!(Formula::parse("y + z ~ x").is_err());
        assert!(Formula::parse("y ~ x ~ z").is_err());
        assert!(Formula::parse("y ~ ").is_err());
        assert!(Formula::parse("y ~ y + x").is_err());
    }
}
