//! Rule-file parsing
//!
//! The grammar is small and line-friendly, so the parser is a hand-rolled
//! lexer plus recursive descent over three statement forms:
//!
//! ```text
//! let sample = "/data/sample"
//!
//! add-if-missing {'type': 'genome', 'build': 'hg38'}
//!
//! rule align:
//!     inputs: src = {'type': 'genome'}, reads = all {'type': 'fastq'},
//!             ref = filename("/data/ref.fa")
//!     outputs: {'type': 'bam', 'sample': '{{ inputs.src.build }}'}
//!     run "bash" "align.sh"
//! ```
//!
//! Strings accept single or double quotes plus triple-quoted long form for
//! script bodies; `#` starts a comment. A `filename("path")` input expands
//! into a synthetic file-reference artifact and a query binding matching
//! it, so file contents participate in invalidation like any other
//! artifact property.

use crate::model::{Config, Rule, RuleOutput, RunStatement, DEFAULT_EXECUTOR};
use crate::query::{Query, QueryBinding};
use std::collections::BTreeMap;
use thiserror::Error;

/// The synthetic `type` property value given to `filename()` artifacts.
pub const FILENAME_REF_TYPE: &str = "$filename_ref";

/// Parse failure with its source line.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

type ParseResult<T> = Result<T, ParseError>;

// ---- statements ----------------------------------------------------------

/// One property of an object literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectProperty {
    pub name: String,
    pub value: String,
    pub is_filename: bool,
}

/// One input binding of a rule statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    /// `var = {template}` — one application per matching artifact.
    Each(Vec<ObjectProperty>),
    /// `var = all {template}` — the entire matching set as one input.
    All(Vec<ObjectProperty>),
    /// `var = filename("path")` — a reference to a file outside the store.
    Filename(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleStatement {
    pub name: String,
    pub inputs: Vec<(String, InputSource)>,
    pub outputs: Vec<Vec<ObjectProperty>>,
    pub run_statements: Vec<RunStatement>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Let { name: String, value: String },
    AddIfMissing { properties: Vec<ObjectProperty> },
    Rule(RuleStatement),
}

/// Parse a rule file into statements.
pub fn parse_str(input: &str) -> ParseResult<Vec<Statement>> {
    Parser::new(input)?.parse_statements()
}

/// Parse a rule file from disk.
pub fn parse_file(path: &std::path::Path) -> ParseResult<Vec<Statement>> {
    let text = std::fs::read_to_string(path).map_err(|err| ParseError {
        line: 0,
        message: format!("cannot read {}: {err}", path.display()),
    })?;
    parse_str(&text)
}

/// Evaluate parsed statements into a config.
pub fn eval(statements: &[Statement], config: &mut Config) -> ParseResult<()> {
    for statement in statements {
        match statement {
            Statement::Let { name, value } => {
                if let Some(existing) = config.vars.get(name) {
                    return Err(ParseError {
                        line: 0,
                        message: format!(
                            "cannot define {name} as {value:?}: already defined as {existing:?}"
                        ),
                    });
                }
                config.vars.insert(name.clone(), value.clone());
            }
            Statement::AddIfMissing { properties } => {
                config.artifacts.push(object_to_output(properties));
            }
            Statement::Rule(rule) => {
                let evaluated = eval_rule(rule, config);
                config.add_rule(evaluated);
            }
        }
    }
    Ok(())
}

fn object_to_output(properties: &[ObjectProperty]) -> RuleOutput {
    let mut output = RuleOutput::default();
    for prop in properties {
        if prop.is_filename {
            output.add_filename(prop.name.clone(), prop.value.clone());
        } else {
            output.add_string(prop.name.clone(), prop.value.clone());
        }
    }
    output
}

fn eval_rule(statement: &RuleStatement, config: &mut Config) -> Rule {
    let mut query = Query::default();
    for (variable, source) in &statement.inputs {
        match source {
            InputSource::Each(properties) => {
                query.for_each.push(template_binding(variable, properties));
            }
            InputSource::All(properties) => {
                query.for_all.push(template_binding(variable, properties));
            }
            InputSource::Filename(path) => {
                // surface the file as an artifact of the synthetic root
                // rule, keyed by path, carrying the file reference itself
                let mut artifact = RuleOutput::default();
                artifact.add_string("type", FILENAME_REF_TYPE);
                artifact.add_string("name", path.clone());
                artifact.add_filename("filename", path.clone());
                config.artifacts.push(artifact);

                query.for_each.push(
                    QueryBinding::new(variable.clone())
                        .constant("type", FILENAME_REF_TYPE)
                        .constant("name", path.clone()),
                );
            }
        }
    }

    Rule {
        name: statement.name.clone(),
        query,
        outputs: statement.outputs.iter().map(|o| object_to_output(o)).collect(),
        expected_outputs: Vec::new(),
        run_statements: statement.run_statements.clone(),
        executor_name: DEFAULT_EXECUTOR.to_string(),
        required_resources: BTreeMap::new(),
    }
}

fn template_binding(variable: &str, properties: &[ObjectProperty]) -> QueryBinding {
    let mut binding = QueryBinding::new(variable);
    for prop in properties {
        binding = binding.constant(prop.name.clone(), prop.value.clone());
    }
    binding
}

// ---- lexer ---------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    LBrace,
    RBrace,
    LParen,
    RParen,
    Colon,
    Comma,
    Equals,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(name) => format!("identifier {name:?}"),
            Token::Str(_) => "string".to_string(),
            Token::LBrace => "'{'".to_string(),
            Token::RBrace => "'}'".to_string(),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::Colon => "':'".to_string(),
            Token::Comma => "','".to_string(),
            Token::Equals => "'='".to_string(),
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '-'
}

fn lex(input: &str) -> ParseResult<Vec<(usize, Token)>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    let mut line = 1;

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '#' => {
                while chars.next_if(|&c| c != '\n').is_some() {}
            }
            '{' => {
                chars.next();
                tokens.push((line, Token::LBrace));
            }
            '}' => {
                chars.next();
                tokens.push((line, Token::RBrace));
            }
            '(' => {
                chars.next();
                tokens.push((line, Token::LParen));
            }
            ')' => {
                chars.next();
                tokens.push((line, Token::RParen));
            }
            ':' => {
                chars.next();
                tokens.push((line, Token::Colon));
            }
            ',' => {
                chars.next();
                tokens.push((line, Token::Comma));
            }
            '=' => {
                chars.next();
                tokens.push((line, Token::Equals));
            }
            '\'' | '"' => {
                let start_line = line;
                let value = lex_string(&mut chars, &mut line)?;
                tokens.push((start_line, value));
            }
            c if is_ident_start(c) => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if is_ident_continue(c) {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((line, Token::Ident(name)));
            }
            other => {
                return Err(ParseError {
                    line,
                    message: format!("unexpected character {other:?}"),
                });
            }
        }
    }
    Ok(tokens)
}

fn lex_string(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    line: &mut usize,
) -> ParseResult<Token> {
    let quote = chars.next().expect("caller saw a quote");
    let start_line = *line;

    // detect the triple-quoted long form
    let mut lookahead = chars.clone();
    if lookahead.next() == Some(quote) && lookahead.next() == Some(quote) {
        chars.next();
        chars.next();
        let mut value = String::new();
        let mut run = 0;
        for c in chars.by_ref() {
            if c == '\n' {
                *line += 1;
            }
            if c == quote {
                run += 1;
                if run == 3 {
                    value.truncate(value.len().saturating_sub(2));
                    return Ok(Token::Str(value));
                }
            } else {
                run = 0;
            }
            value.push(c);
        }
        return Err(ParseError {
            line: start_line,
            message: "unterminated long string".to_string(),
        });
    }

    let mut value = String::new();
    loop {
        match chars.next() {
            Some(c) if c == quote => return Ok(Token::Str(value)),
            Some('\\') => match chars.next() {
                Some('n') => value.push('\n'),
                Some('t') => value.push('\t'),
                Some(c @ ('\\' | '\'' | '"')) => value.push(c),
                Some(other) => {
                    return Err(ParseError {
                        line: *line,
                        message: format!("unknown escape \\{other}"),
                    })
                }
                None => {
                    return Err(ParseError {
                        line: start_line,
                        message: "unterminated string".to_string(),
                    })
                }
            },
            Some('\n') | None => {
                return Err(ParseError {
                    line: start_line,
                    message: "unterminated string".to_string(),
                })
            }
            Some(c) => value.push(c),
        }
    }
}

// ---- recursive descent ---------------------------------------------------

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn new(input: &str) -> ParseResult<Self> {
        Ok(Parser {
            tokens: lex(input)?,
            pos: 0,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos.min(self.tokens.len().saturating_sub(1)))
            .map_or(0, |(line, _)| *line)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn error<T>(&self, message: impl Into<String>) -> ParseResult<T> {
        Err(ParseError {
            line: self.line(),
            message: message.into(),
        })
    }

    fn expect(&mut self, expected: &Token) -> ParseResult<()> {
        match self.next() {
            Some(token) if token == *expected => Ok(()),
            Some(token) => {
                self.pos -= 1;
                self.error(format!(
                    "expected {}, found {}",
                    expected.describe(),
                    token.describe()
                ))
            }
            None => self.error(format!("expected {}, found end of file", expected.describe())),
        }
    }

    fn expect_ident(&mut self) -> ParseResult<String> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            Some(token) => {
                self.pos -= 1;
                self.error(format!("expected identifier, found {}", token.describe()))
            }
            None => self.error("expected identifier, found end of file"),
        }
    }

    fn expect_str(&mut self) -> ParseResult<String> {
        match self.next() {
            Some(Token::Str(value)) => Ok(value),
            Some(token) => {
                self.pos -= 1;
                self.error(format!("expected string, found {}", token.describe()))
            }
            None => self.error("expected string, found end of file"),
        }
    }

    fn parse_statements(&mut self) -> ParseResult<Vec<Statement>> {
        let mut statements = Vec::new();
        while let Some(token) = self.peek() {
            match token {
                Token::Ident(name) if name == "let" => statements.push(self.parse_let()?),
                Token::Ident(name) if name == "add-if-missing" => {
                    statements.push(self.parse_add_if_missing()?);
                }
                Token::Ident(name) if name == "rule" => statements.push(self.parse_rule()?),
                other => {
                    let found = other.describe();
                    return self.error(format!(
                        "expected 'let', 'add-if-missing' or 'rule', found {found}"
                    ));
                }
            }
        }
        Ok(statements)
    }

    fn parse_let(&mut self) -> ParseResult<Statement> {
        self.next();
        let name = self.expect_ident()?;
        self.expect(&Token::Equals)?;
        let value = self.expect_str()?;
        Ok(Statement::Let { name, value })
    }

    fn parse_add_if_missing(&mut self) -> ParseResult<Statement> {
        self.next();
        let properties = self.parse_object()?;
        Ok(Statement::AddIfMissing { properties })
    }

    fn parse_rule(&mut self) -> ParseResult<Statement> {
        self.next();
        let name = self.expect_ident()?;
        self.expect(&Token::Colon)?;

        let mut rule = RuleStatement {
            name,
            inputs: Vec::new(),
            outputs: Vec::new(),
            run_statements: Vec::new(),
        };

        loop {
            match self.peek() {
                Some(Token::Ident(clause)) if clause == "inputs" => {
                    self.next();
                    self.expect(&Token::Colon)?;
                    rule.inputs = self.parse_bindings()?;
                }
                Some(Token::Ident(clause)) if clause == "outputs" => {
                    self.next();
                    self.expect(&Token::Colon)?;
                    rule.outputs.push(self.parse_object()?);
                    while self.peek() == Some(&Token::Comma) {
                        self.next();
                        rule.outputs.push(self.parse_object()?);
                    }
                }
                Some(Token::Ident(clause)) if clause == "run" => {
                    self.next();
                    let executable = self.expect_str()?;
                    let statement = match self.peek() {
                        Some(Token::Str(_)) => {
                            let script = self.expect_str()?;
                            RunStatement::with_script(executable, script)
                        }
                        _ => RunStatement::new(executable),
                    };
                    rule.run_statements.push(statement);
                }
                _ => break,
            }
        }
        Ok(Statement::Rule(rule))
    }

    fn parse_bindings(&mut self) -> ParseResult<Vec<(String, InputSource)>> {
        let mut bindings = vec![self.parse_binding()?];
        while self.peek() == Some(&Token::Comma) {
            self.next();
            bindings.push(self.parse_binding()?);
        }
        Ok(bindings)
    }

    fn parse_binding(&mut self) -> ParseResult<(String, InputSource)> {
        let variable = self.expect_ident()?;
        self.expect(&Token::Equals)?;
        let source = match self.peek() {
            Some(Token::Ident(name)) if name == "all" => {
                self.next();
                InputSource::All(self.parse_object()?)
            }
            Some(Token::Ident(name)) if name == "filename" => {
                self.next();
                self.expect(&Token::LParen)?;
                let path = self.expect_str()?;
                self.expect(&Token::RParen)?;
                InputSource::Filename(path)
            }
            Some(Token::LBrace) => InputSource::Each(self.parse_object()?),
            _ => return self.error("expected a template, 'all', or 'filename'"),
        };
        Ok((variable, source))
    }

    /// `{ key: value, ... }` where value is a string or `{'$filename': path}`.
    fn parse_object(&mut self) -> ParseResult<Vec<ObjectProperty>> {
        self.expect(&Token::LBrace)?;
        let mut properties = Vec::new();
        if self.peek() == Some(&Token::RBrace) {
            self.next();
            return Ok(properties);
        }
        loop {
            let name = match self.next() {
                Some(Token::Str(name)) => name,
                Some(Token::Ident(name)) => name,
                _ => {
                    self.pos -= 1;
                    return self.error("expected property name");
                }
            };
            self.expect(&Token::Colon)?;
            match self.peek() {
                Some(Token::LBrace) => {
                    // {'$filename': 'path'} — a file-valued property
                    self.next();
                    let key = self.expect_str()?;
                    if key != "$filename" {
                        return self.error(format!(
                            "expected \"$filename\" in nested value, found {key:?}"
                        ));
                    }
                    self.expect(&Token::Colon)?;
                    let path = self.expect_str()?;
                    self.expect(&Token::RBrace)?;
                    properties.push(ObjectProperty {
                        name,
                        value: path,
                        is_filename: true,
                    });
                }
                _ => {
                    let value = self.expect_str()?;
                    properties.push(ObjectProperty {
                        name,
                        value,
                        is_filename: false,
                    });
                }
            }
            match self.next() {
                Some(Token::Comma) => {}
                Some(Token::RBrace) => return Ok(properties),
                _ => {
                    self.pos -= 1;
                    return self.error("expected ',' or '}' in object");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_let() {
        let statements = parse_str("let x = 'a'").expect("parse");
        assert_eq!(statements.len(), 1);
        let mut config = Config::new();
        eval(&statements, &mut config).expect("eval");
        assert_eq!(config.vars.get("x").map(String::as_str), Some("a"));
    }

    #[test]
    fn test_duplicate_let_is_an_error() {
        let statements = parse_str("let x = 'a'\nlet x = 'b'").expect("parse");
        let mut config = Config::new();
        assert!(eval(&statements, &mut config).is_err());
    }

    #[test]
    fn test_parse_rule_chain() {
        let statements = parse_str(
            "
            rule a:
                outputs: {'type': 'a-out'}
                run 'date'

            rule x:
                inputs: a={'type': 'a-out'}
                outputs: {'type': 'x-out', 'value': '1'}, {'type': 'x-out', 'value': '2'}
                run 'date'
            ",
        )
        .expect("parse");
        assert_eq!(statements.len(), 2);

        let mut config = Config::new();
        eval(&statements, &mut config).expect("eval");
        assert_eq!(config.rules.len(), 2);

        let a = &config.rules["a"];
        assert!(a.query.is_empty());
        assert_eq!(a.outputs.len(), 1);
        assert_eq!(a.run_statements, vec![RunStatement::new("date")]);

        let x = &config.rules["x"];
        assert_eq!(x.query.for_each.len(), 1);
        assert_eq!(x.query.for_each[0].variable, "a");
        assert_eq!(
            x.query.for_each[0].constants.get("type").map(String::as_str),
            Some("a-out")
        );
        assert_eq!(x.outputs.len(), 2);
    }

    #[test]
    fn test_parse_all_binding() {
        let statements = parse_str(
            "
            rule b:
                inputs: a = all {'type': 'a-out'}
                outputs: {'type': 'b-out'}
            ",
        )
        .expect("parse");
        let mut config = Config::new();
        eval(&statements, &mut config).expect("eval");
        let b = &config.rules["b"];
        assert!(b.query.for_each.is_empty());
        assert_eq!(b.query.for_all.len(), 1);
        assert_eq!(b.query.for_all[0].variable, "a");
    }

    #[test]
    fn test_parse_filename_input() {
        let statements = parse_str(
            "
            rule f:
                inputs: src=filename(\"/data/sample\")
                run 'cp {{inputs.src.filename}} results.json'
            ",
        )
        .expect("parse");
        let mut config = Config::new();
        eval(&statements, &mut config).expect("eval");

        // synthetic artifact carrying the file reference
        assert_eq!(config.artifacts.len(), 1);
        let artifact = &config.artifacts[0];
        assert!(artifact
            .properties
            .iter()
            .any(|p| p.name == "type" && p.value == FILENAME_REF_TYPE));
        assert!(artifact
            .properties
            .iter()
            .any(|p| p.name == "filename" && p.is_filename));

        // and a binding matching it
        let f = &config.rules["f"];
        assert_eq!(f.query.for_each.len(), 1);
        assert_eq!(
            f.query.for_each[0].constants.get("type").map(String::as_str),
            Some(FILENAME_REF_TYPE)
        );
        assert_eq!(
            f.query.for_each[0].constants.get("name").map(String::as_str),
            Some("/data/sample")
        );
    }

    #[test]
    fn test_parse_add_if_missing() {
        let statements =
            parse_str("add-if-missing {'type': 'a-out', 'value': '1'}").expect("parse");
        let mut config = Config::new();
        eval(&statements, &mut config).expect("eval");
        assert_eq!(config.artifacts.len(), 1);
        assert_eq!(config.artifacts[0].properties.len(), 2);
    }

    #[test]
    fn test_parse_filename_output_value() {
        let statements = parse_str(
            "
            rule x:
                outputs: {'type': 'file', 'filename': {'$filename': 'out'}}
                run 'touch out'
            ",
        )
        .expect("parse");
        let mut config = Config::new();
        eval(&statements, &mut config).expect("eval");
        let output = &config.rules["x"].outputs[0];
        let filename = output
            .properties
            .iter()
            .find(|p| p.name == "filename")
            .expect("filename property");
        assert!(filename.is_filename);
        assert_eq!(filename.value, "out");
    }

    #[test]
    fn test_parse_run_with_script_body() {
        let statements = parse_str(
            "rule s:\n    run 'python' '''\nprint('hello')\n'''",
        )
        .expect("parse");
        let Statement::Rule(rule) = &statements[0] else {
            panic!("expected rule");
        };
        assert_eq!(rule.run_statements.len(), 1);
        assert_eq!(rule.run_statements[0].executable, "python");
        assert_eq!(
            rule.run_statements[0].script.as_deref(),
            Some("\nprint('hello')\n")
        );
    }

    #[test]
    fn test_parse_error_carries_line() {
        let err = parse_str("rule a:\n    outputs: {'type' 'a'}").expect_err("must fail");
        assert_eq!(err.line, 2);
    }

    #[test]
    fn test_comments_are_skipped() {
        let statements = parse_str("# heading\nlet x = 'a' # trailing\n").expect("parse");
        assert_eq!(statements.len(), 1);
    }

    #[test]
    fn test_unknown_statement_is_an_error() {
        assert!(parse_str("frobnicate 'x'").is_err());
    }
}
