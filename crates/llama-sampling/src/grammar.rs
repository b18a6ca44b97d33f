//! GBNF grammars.
//!
//! [`Grammar::parse`] compiles a GBNF string into flat rules: every
//! alternative is a sequence of character-set matches and rule references.
//! Groups and repetition operators desugar into generated rules, so the
//! matcher only ever sees those two element kinds.
//!
//! [`GrammarMatcher`] tracks every way the text produced so far can continue
//! as a set of pushdown stacks. Advancing by a character keeps only the stacks
//! whose top element matches it; a stack that empties completely means the
//! text so far is a full sentence of the grammar.
//!
//! Supported syntax:
//!
//! ```text
//! root   ::= greeting ws name ("!" | ".")?
//! greeting ::= "hello" | "hi"      # comments run to end of line
//! name   ::= [A-Z] [a-z]{1,15}
//! ws     ::= [ \t\n]*
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use llama_engine::LlamaError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GrammarError {
    #[error("syntax error on line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("undefined rule '{0}'")]
    UndefinedRule(String),
    #[error("grammar has no 'root' rule")]
    MissingRoot,
    #[error("rule '{0}' is defined more than once")]
    DuplicateRule(String),
    #[error("rule '{0}' is left-recursive")]
    LeftRecursion(String),
}

impl From<GrammarError> for LlamaError {
    fn from(err: GrammarError) -> Self {
        LlamaError::Config(format!("grammar: {err}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Element {
    /// One character from inclusive ranges; `negated` inverts the set.
    Char {
        ranges: Vec<(char, char)>,
        negated: bool,
    },
    Rule(usize),
}

impl Element {
    fn literal(c: char) -> Self {
        Element::Char {
            ranges: vec![(c, c)],
            negated: false,
        }
    }

    fn matches(&self, c: char) -> bool {
        match self {
            Element::Char { ranges, negated } => {
                ranges.iter().any(|&(lo, hi)| lo <= c && c <= hi) != *negated
            }
            Element::Rule(_) => false,
        }
    }
}

type Alternative = Vec<Element>;

/// A compiled grammar.
#[derive(Debug)]
pub struct Grammar {
    names: Vec<String>,
    rules: Vec<Vec<Alternative>>,
    root: usize,
}

impl Grammar {
    pub fn parse(src: &str) -> Result<Self, GrammarError> {
        Parser::new(src).parse()
    }

    /// Number of rules, including generated ones.
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    fn initial_stacks(&self) -> Vec<Stack> {
        let mut out = Vec::new();
        for alt in 0..self.rules[self.root].len() {
            self.expand(
                vec![Pos {
                    rule: self.root,
                    alt,
                    idx: 0,
                }],
                &mut out,
            );
        }
        out.sort();
        out.dedup();
        out
    }

    /// Resolve leading rule references until every stack is topped by a
    /// character match or is empty.
    fn expand(&self, mut stack: Stack, out: &mut Vec<Stack>) {
        loop {
            let Some(&top) = stack.last() else {
                out.push(stack);
                return;
            };
            let alt = &self.rules[top.rule][top.alt];
            match alt.get(top.idx) {
                None => {
                    stack.pop();
                }
                Some(Element::Char { .. }) => {
                    out.push(stack);
                    return;
                }
                Some(Element::Rule(r)) => {
                    stack.pop();
                    if top.idx + 1 < alt.len() {
                        stack.push(Pos {
                            idx: top.idx + 1,
                            ..top
                        });
                    }
                    for a in 0..self.rules[*r].len() {
                        let mut next = stack.clone();
                        next.push(Pos {
                            rule: *r,
                            alt: a,
                            idx: 0,
                        });
                        self.expand(next, out);
                    }
                    return;
                }
            }
        }
    }

    fn advance(&self, stacks: &[Stack], c: char) -> Vec<Stack> {
        let mut out = Vec::new();
        for stack in stacks {
            let Some(&top) = stack.last() else {
                continue;
            };
            let alt = &self.rules[top.rule][top.alt];
            if !alt.get(top.idx).is_some_and(|e| e.matches(c)) {
                continue;
            }
            let mut next = stack.clone();
            next.pop();
            if top.idx + 1 < alt.len() {
                next.push(Pos {
                    idx: top.idx + 1,
                    ..top
                });
            }
            self.expand(next, &mut out);
        }
        out.sort();
        out.dedup();
        out
    }
}

/// Position of the next element to match inside one rule alternative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Pos {
    rule: usize,
    alt: usize,
    idx: usize,
}

type Stack = Vec<Pos>;

/// Incremental grammar state for one generation.
#[derive(Debug, Clone)]
pub struct GrammarMatcher {
    grammar: Arc<Grammar>,
    stacks: Vec<Stack>,
}

impl GrammarMatcher {
    pub fn new(grammar: Arc<Grammar>) -> Self {
        let stacks = grammar.initial_stacks();
        Self { grammar, stacks }
    }

    /// The text accepted so far is a complete sentence.
    pub fn is_complete(&self) -> bool {
        self.stacks.iter().any(Vec::is_empty)
    }

    /// Whether `text` can be appended without leaving the grammar.
    pub fn accepts(&self, text: &str) -> bool {
        let mut chars = text.chars();
        let Some(first) = chars.next() else {
            return true;
        };
        let mut stacks = self.grammar.advance(&self.stacks, first);
        for c in chars {
            if stacks.is_empty() {
                return false;
            }
            stacks = self.grammar.advance(&stacks, c);
        }
        !stacks.is_empty()
    }

    /// Append `text`. Returns false, leaving the state untouched, if the
    /// grammar cannot continue with it.
    pub fn accept(&mut self, text: &str) -> bool {
        let mut stacks = self.stacks.clone();
        for c in text.chars() {
            stacks = self.grammar.advance(&stacks, c);
            if stacks.is_empty() {
                return false;
            }
        }
        self.stacks = stacks;
        true
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
    symbols: HashMap<String, usize>,
    names: Vec<String>,
    rules: Vec<Option<Vec<Alternative>>>,
}

impl Parser {
    fn new(src: &str) -> Self {
        Self {
            chars: src.chars().collect(),
            pos: 0,
            symbols: HashMap::new(),
            names: Vec::new(),
            rules: Vec::new(),
        }
    }

    fn parse(mut self) -> Result<Grammar, GrammarError> {
        self.skip_ws();
        while self.peek().is_some() {
            self.parse_rule()?;
            self.skip_ws();
        }

        let root = match self.symbols.get("root") {
            Some(&id) if self.rules[id].is_some() => id,
            _ => return Err(GrammarError::MissingRoot),
        };

        let mut rules = Vec::with_capacity(self.rules.len());
        for (id, rule) in self.rules.into_iter().enumerate() {
            match rule {
                Some(alts) => rules.push(alts),
                None => return Err(GrammarError::UndefinedRule(self.names[id].clone())),
            }
        }

        let grammar = Grammar {
            names: self.names,
            rules,
            root,
        };
        check_left_recursion(&grammar)?;
        Ok(grammar)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn error(&self, message: impl Into<String>) -> GrammarError {
        let end = self.pos.min(self.chars.len());
        let line = self.chars[..end].iter().filter(|&&c| c == '\n').count() + 1;
        GrammarError::Syntax {
            line,
            message: message.into(),
        }
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.pos += 1;
            } else if c == '#' {
                while self.peek().is_some_and(|c| c != '\n') {
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
    }

    fn expect(&mut self, s: &str) -> Result<(), GrammarError> {
        for expected in s.chars() {
            if self.peek() != Some(expected) {
                return Err(self.error(format!("expected '{s}'")));
            }
            self.pos += 1;
        }
        Ok(())
    }

    fn symbol(&mut self, name: &str) -> usize {
        if let Some(&id) = self.symbols.get(name) {
            return id;
        }
        let id = self.names.len();
        self.symbols.insert(name.to_string(), id);
        self.names.push(name.to_string());
        self.rules.push(None);
        id
    }

    fn generated(&mut self, base: &str) -> usize {
        let name = format!("{base}_{}", self.names.len());
        self.symbol(&name)
    }

    fn parse_name(&mut self) -> Option<String> {
        let start = self.pos;
        while self.peek().is_some_and(is_word_char) {
            self.pos += 1;
        }
        (self.pos > start).then(|| self.chars[start..self.pos].iter().collect())
    }

    /// Lookahead for `name ::=`, which ends the current rule body.
    fn at_rule_start(&self) -> bool {
        let mut i = self.pos;
        while self.chars.get(i).copied().is_some_and(is_word_char) {
            i += 1;
        }
        if i == self.pos {
            return false;
        }
        while self.chars.get(i).is_some_and(|c| *c == ' ' || *c == '\t') {
            i += 1;
        }
        self.chars.get(i..i + 3) == Some(&[':', ':', '='][..])
    }

    fn parse_rule(&mut self) -> Result<(), GrammarError> {
        let name = self
            .parse_name()
            .ok_or_else(|| self.error("expected rule name"))?;
        self.skip_ws();
        self.expect("::=")?;
        self.skip_ws();

        let alts = self.parse_alternates(&name)?;
        let id = self.symbol(&name);
        if self.rules[id].is_some() {
            return Err(GrammarError::DuplicateRule(name));
        }
        self.rules[id] = Some(alts);
        Ok(())
    }

    fn parse_alternates(&mut self, rule: &str) -> Result<Vec<Alternative>, GrammarError> {
        let mut alts = vec![self.parse_sequence(rule)?];
        loop {
            self.skip_ws();
            if self.peek() != Some('|') {
                break;
            }
            self.pos += 1;
            alts.push(self.parse_sequence(rule)?);
        }
        Ok(alts)
    }

    fn parse_sequence(&mut self, rule: &str) -> Result<Alternative, GrammarError> {
        let mut seq = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                None | Some('|') | Some(')') => break,
                Some(c) if is_word_char(c) && self.at_rule_start() => break,
                _ => {}
            }

            let start = seq.len();
            self.parse_primary(rule, &mut seq)?;
            self.skip_ws();

            match self.peek() {
                Some('*') => {
                    self.pos += 1;
                    let item: Vec<Element> = seq.drain(start..).collect();
                    let star = self.star(rule, item);
                    seq.push(Element::Rule(star));
                }
                Some('+') => {
                    self.pos += 1;
                    let item: Vec<Element> = seq[start..].to_vec();
                    let star = self.star(rule, item);
                    seq.push(Element::Rule(star));
                }
                Some('?') => {
                    self.pos += 1;
                    let item: Vec<Element> = seq.drain(start..).collect();
                    let opt = self.generated(rule);
                    self.rules[opt] = Some(vec![item, Vec::new()]);
                    seq.push(Element::Rule(opt));
                }
                Some('{') => {
                    self.pos += 1;
                    let item: Vec<Element> = seq.drain(start..).collect();
                    self.parse_braces(rule, item, &mut seq)?;
                }
                _ => {}
            }
        }
        Ok(seq)
    }

    /// `item*` as `R ::= item R | ""`.
    fn star(&mut self, rule: &str, item: Vec<Element>) -> usize {
        let id = self.generated(rule);
        let mut repeat = item;
        repeat.push(Element::Rule(id));
        self.rules[id] = Some(vec![repeat, Vec::new()]);
        id
    }

    fn parse_braces(
        &mut self,
        rule: &str,
        item: Vec<Element>,
        seq: &mut Vec<Element>,
    ) -> Result<(), GrammarError> {
        self.skip_ws();
        let min = self.parse_int()?;
        self.skip_ws();
        let max = if self.peek() == Some(',') {
            self.pos += 1;
            self.skip_ws();
            if self.peek() == Some('}') {
                None
            } else {
                Some(self.parse_int()?)
            }
        } else {
            Some(min)
        };
        self.skip_ws();
        self.expect("}")?;

        for _ in 0..min {
            seq.extend(item.iter().cloned());
        }
        match max {
            None => {
                let star = self.star(rule, item);
                seq.push(Element::Rule(star));
            }
            Some(max) if max < min => {
                return Err(self.error(format!("repetition upper bound {max} below {min}")));
            }
            Some(max) => {
                // Nested optionals: R1 ::= item | "", Rk ::= item R(k-1) | "".
                let mut tail: Option<usize> = None;
                for _ in min..max {
                    let id = self.generated(rule);
                    let mut alt = item.clone();
                    if let Some(t) = tail {
                        alt.push(Element::Rule(t));
                    }
                    self.rules[id] = Some(vec![alt, Vec::new()]);
                    tail = Some(id);
                }
                if let Some(t) = tail {
                    seq.push(Element::Rule(t));
                }
            }
        }
        Ok(())
    }

    fn parse_int(&mut self) -> Result<usize, GrammarError> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        let digits: String = self.chars[start..self.pos].iter().collect();
        digits
            .parse()
            .map_err(|_| self.error("expected a repetition count"))
    }

    fn parse_primary(&mut self, rule: &str, seq: &mut Vec<Element>) -> Result<(), GrammarError> {
        match self.peek() {
            Some('"') => {
                self.pos += 1;
                loop {
                    match self.peek() {
                        None => return Err(self.error("unterminated string literal")),
                        Some('"') => {
                            self.pos += 1;
                            break;
                        }
                        Some(_) => {
                            let c = self.parse_char()?;
                            seq.push(Element::literal(c));
                        }
                    }
                }
            }
            Some('[') => {
                self.pos += 1;
                let negated = self.peek() == Some('^');
                if negated {
                    self.pos += 1;
                }
                let mut ranges = Vec::new();
                loop {
                    match self.peek() {
                        None => return Err(self.error("unterminated character class")),
                        Some(']') => {
                            self.pos += 1;
                            break;
                        }
                        Some(_) => {
                            let lo = self.parse_char()?;
                            let hi = if self.peek() == Some('-') && self.peek_at(1) != Some(']') {
                                self.pos += 1;
                                self.parse_char()?
                            } else {
                                lo
                            };
                            ranges.push((lo, hi));
                        }
                    }
                }
                seq.push(Element::Char { ranges, negated });
            }
            Some('.') => {
                self.pos += 1;
                seq.push(Element::Char {
                    ranges: Vec::new(),
                    negated: true,
                });
            }
            Some('(') => {
                self.pos += 1;
                let group = self.generated(rule);
                let alts = self.parse_alternates(rule)?;
                self.skip_ws();
                self.expect(")")?;
                self.rules[group] = Some(alts);
                seq.push(Element::Rule(group));
            }
            Some(c) if is_word_char(c) => {
                let name = self
                    .parse_name()
                    .ok_or_else(|| self.error("expected rule name"))?;
                let id = self.symbol(&name);
                seq.push(Element::Rule(id));
            }
            Some(c) => return Err(self.error(format!("unexpected character '{c}'"))),
            None => return Err(self.error("unexpected end of grammar")),
        }
        Ok(())
    }

    fn parse_char(&mut self) -> Result<char, GrammarError> {
        let c = self
            .peek()
            .ok_or_else(|| self.error("unexpected end of grammar"))?;
        self.pos += 1;
        if c != '\\' {
            return Ok(c);
        }

        let esc = self
            .peek()
            .ok_or_else(|| self.error("unterminated escape"))?;
        self.pos += 1;
        match esc {
            'n' => Ok('\n'),
            'r' => Ok('\r'),
            't' => Ok('\t'),
            '\\' | '"' | '[' | ']' | '-' | '/' => Ok(esc),
            'x' => self.parse_hex(2),
            'u' => self.parse_hex(4),
            'U' => self.parse_hex(8),
            other => Err(self.error(format!("unknown escape '\\{other}'"))),
        }
    }

    fn parse_hex(&mut self, digits: usize) -> Result<char, GrammarError> {
        let end = self.pos + digits;
        if end > self.chars.len() {
            return Err(self.error("truncated hex escape"));
        }
        let hex: String = self.chars[self.pos..end].iter().collect();
        self.pos = end;
        u32::from_str_radix(&hex, 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| self.error(format!("invalid hex escape '{hex}'")))
    }
}

/// Reject rules that can reach themselves without consuming a character.
fn check_left_recursion(grammar: &Grammar) -> Result<(), GrammarError> {
    let n = grammar.rules.len();

    let mut nullable = vec![false; n];
    loop {
        let mut changed = false;
        for r in 0..n {
            if nullable[r] {
                continue;
            }
            let is_nullable = grammar.rules[r].iter().any(|alt| {
                alt.iter().all(|e| match e {
                    Element::Rule(x) => nullable[*x],
                    Element::Char { .. } => false,
                })
            });
            if is_nullable {
                nullable[r] = true;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    // Edges to every rule reachable at the start of an alternative.
    let mut leading: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (r, alts) in grammar.rules.iter().enumerate() {
        for alt in alts {
            for e in alt {
                match e {
                    Element::Rule(x) => {
                        leading[r].push(*x);
                        if !nullable[*x] {
                            break;
                        }
                    }
                    Element::Char { .. } => break,
                }
            }
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Active,
        Done,
    }

    fn visit(r: usize, leading: &[Vec<usize>], marks: &mut [Mark]) -> Option<usize> {
        marks[r] = Mark::Active;
        for &next in &leading[r] {
            match marks[next] {
                Mark::Active => return Some(next),
                Mark::New => {
                    if let Some(cycle) = visit(next, leading, marks) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        marks[r] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::New; n];
    for r in 0..n {
        if marks[r] == Mark::New {
            if let Some(cycle) = visit(r, &leading, &mut marks) {
                return Err(GrammarError::LeftRecursion(grammar.names[cycle].clone()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(src: &str) -> GrammarMatcher {
        GrammarMatcher::new(Arc::new(Grammar::parse(src).unwrap()))
    }

    fn full_match(src: &str, text: &str) -> bool {
        let mut m = matcher(src);
        m.accept(text) && m.is_complete()
    }

    #[test]
    fn literal_alternatives() {
        let g = r#"root ::= "yes" | "no""#;
        assert!(full_match(g, "yes"));
        assert!(full_match(g, "no"));
        assert!(!full_match(g, "maybe"));
        assert!(!full_match(g, "ye"));
    }

    #[test]
    fn prefix_is_accepted_but_incomplete() {
        let mut m = matcher(r#"root ::= "abc""#);
        assert!(m.accepts("ab"));
        assert!(m.accept("ab"));
        assert!(!m.is_complete());
        assert!(!m.accepts("x"));
        assert!(m.accept("c"));
        assert!(m.is_complete());
    }

    #[test]
    fn rejected_text_leaves_state_untouched() {
        let mut m = matcher(r#"root ::= "ab""#);
        assert!(!m.accept("ax"));
        assert!(m.accept("ab"));
    }

    #[test]
    fn char_classes_and_ranges() {
        let g = "root ::= [a-c] [^0-9] .";
        assert!(full_match(g, "bx!"));
        assert!(!full_match(g, "dx!"));
        assert!(!full_match(g, "b5!"));
    }

    #[test]
    fn repetition_operators() {
        assert!(full_match(r#"root ::= "a"*"#, ""));
        assert!(full_match(r#"root ::= "a"*"#, "aaaa"));
        assert!(!full_match(r#"root ::= "a"+"#, ""));
        assert!(full_match(r#"root ::= "a"+"#, "aaa"));
        assert!(full_match(r#"root ::= "a" "b"?"#, "a"));
        assert!(full_match(r#"root ::= "a" "b"?"#, "ab"));
        assert!(!full_match(r#"root ::= "a" "b"?"#, "abb"));
    }

    #[test]
    fn bounded_repetition() {
        let g = "root ::= [0-9]{2,4}";
        assert!(!full_match(g, "1"));
        assert!(full_match(g, "12"));
        assert!(full_match(g, "1234"));
        assert!(!full_match(g, "12345"));

        assert!(full_match("root ::= \"x\"{3}", "xxx"));
        assert!(!full_match("root ::= \"x\"{3}", "xx"));
        assert!(full_match("root ::= \"x\"{1,}", "xxxxx"));
    }

    #[test]
    fn groups_and_multiline_rules() {
        let g = r#"
            # a tiny list grammar
            root ::= item ("," ws item)*
            item ::= [a-z]+
            ws   ::= " "?
        "#;
        assert!(full_match(g, "a, bc,d"));
        assert!(!full_match(g, "a,,b"));
    }

    #[test]
    fn escapes() {
        let g = r#"root ::= "\"" [\n\t] "\x41" "é""#;
        assert!(full_match(g, "\"\nAé"));
    }

    #[test]
    fn nested_recursion() {
        let g = r#"root ::= "(" root ")" | "x""#;
        assert!(full_match(g, "((x))"));
        assert!(!full_match(g, "((x)"));
    }

    #[test]
    fn missing_root() {
        assert_eq!(
            Grammar::parse(r#"start ::= "a""#).unwrap_err(),
            GrammarError::MissingRoot
        );
    }

    #[test]
    fn undefined_rule() {
        assert_eq!(
            Grammar::parse("root ::= value").unwrap_err(),
            GrammarError::UndefinedRule("value".into())
        );
    }

    #[test]
    fn duplicate_rule() {
        let err = Grammar::parse("root ::= \"a\"\nroot ::= \"b\"").unwrap_err();
        assert_eq!(err, GrammarError::DuplicateRule("root".into()));
    }

    #[test]
    fn left_recursion_rejected() {
        assert!(matches!(
            Grammar::parse(r#"root ::= root "a" | "b""#),
            Err(GrammarError::LeftRecursion(_))
        ));
        // through a nullable prefix
        assert!(matches!(
            Grammar::parse("root ::= opt root \"a\" | \"b\"\nopt ::= \"x\"?"),
            Err(GrammarError::LeftRecursion(_))
        ));
    }

    #[test]
    fn syntax_errors_report_line() {
        match Grammar::parse("root ::= \"a\"\nitem ::= \"unterminated").unwrap_err() {
            GrammarError::Syntax { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(matches!(
            Grammar::parse("root ::= [a-"),
            Err(GrammarError::Syntax { .. })
        ));
        assert!(matches!(
            Grammar::parse("root = \"a\""),
            Err(GrammarError::Syntax { .. })
        ));
    }

    #[test]
    fn grammar_errors_are_config_errors() {
        let err: LlamaError = GrammarError::MissingRoot.into();
        assert!(matches!(err, LlamaError::Config(_)));
    }

    #[test]
    fn rule_count_includes_generated_rules() {
        let grammar = Grammar::parse(r#"root ::= ("a" | "b")+"#).unwrap();
        assert!(grammar.rule_count() > 1);
    }
}
