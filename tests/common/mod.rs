#![allow(dead_code)]

use std::sync::Arc;

use scmc::{
    compiler::sexpr::{cons, intern, Sexpr, SourceMap, SourceSpan},
    CompileError, CompileOptions, Compiler, Machine, RuntimeError, Value,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Minimal reader for test programs. Records the position of every list.
pub struct Reader<'a> {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
    file: Arc<str>,
    source: &'a mut SourceMap,
}

impl<'a> Reader<'a> {
    pub fn new(text: &str, source: &'a mut SourceMap) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            file: Arc::from("test.scm"),
            source,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn skip_blank(&mut self) {
        while let Some(c) = self.peek() {
            if c == ';' {
                while !matches!(self.peek(), None | Some('\n')) {
                    self.bump();
                }
            } else if c.is_whitespace() {
                self.bump();
            } else {
                break;
            }
        }
    }

    pub fn read_all(&mut self) -> Vec<Sexpr> {
        let mut forms = vec![];
        loop {
            self.skip_blank();
            if self.peek().is_none() {
                return forms;
            }
            forms.push(self.read());
        }
    }

    fn read(&mut self) -> Sexpr {
        self.skip_blank();
        let span = SourceSpan {
            file: self.file.clone(),
            line: self.line,
            column: self.column,
        };
        match self.peek().expect("unexpected end of input") {
            '(' => {
                self.bump();
                let list = self.read_list(')');
                self.source.mark(&list, span);
                list
            }
            '\'' => {
                self.bump();
                let quoted = self.read();
                Sexpr::list(vec![Sexpr::Symbol(intern("quote")), quoted])
            }
            '"' => {
                self.bump();
                let mut s = String::new();
                while let Some(c) = self.bump() {
                    match c {
                        '"' => break,
                        '\\' => s.push(self.bump().expect("unterminated string")),
                        c => s.push(c),
                    }
                }
                Sexpr::string(&s)
            }
            '#' => {
                self.bump();
                match self.bump() {
                    Some('t') => Sexpr::Boolean(true),
                    Some('f') => Sexpr::Boolean(false),
                    Some('(') => {
                        let items = self
                            .read_list(')')
                            .proper_list()
                            .expect("dotted vector literal");
                        Sexpr::Vector(items.into())
                    }
                    other => panic!("unknown # syntax: {:?}", other),
                }
            }
            _ => self.read_atom(),
        }
    }

    fn read_list(&mut self, close: char) -> Sexpr {
        let mut items = vec![];
        let mut tail = Sexpr::Null;
        loop {
            self.skip_blank();
            match self.peek() {
                Some(c) if c == close => {
                    self.bump();
                    break;
                }
                Some('.') if self.is_delimiter(self.pos + 1) => {
                    self.bump();
                    tail = self.read();
                    self.skip_blank();
                    assert_eq!(self.bump(), Some(close), "malformed dotted list");
                    break;
                }
                Some(_) => items.push(self.read()),
                None => panic!("unterminated list"),
            }
        }
        items.into_iter().rev().fold(tail, |tail, head| cons(head, tail))
    }

    fn is_delimiter(&self, at: usize) -> bool {
        match self.chars.get(at) {
            None => true,
            Some(c) => c.is_whitespace() || *c == '(' || *c == ')',
        }
    }

    fn read_atom(&mut self) -> Sexpr {
        let mut text = String::new();
        while !self.is_delimiter(self.pos) {
            text.push(self.bump().expect("atom"));
        }
        match text.parse::<i64>() {
            Ok(x) => Sexpr::Fixnum(x),
            Err(_) => Sexpr::Symbol(intern(&text)),
        }
    }
}

pub fn read(text: &str) -> (Vec<Sexpr>, SourceMap) {
    let mut source = SourceMap::new();
    let forms = Reader::new(text, &mut source).read_all();
    (forms, source)
}

#[derive(Debug)]
pub enum Outcome {
    Compile(CompileError),
    Runtime(RuntimeError),
}

/// Compiles every unit in turn with `compiler` and runs it, returning the
/// value of the last one.
pub fn run_with(compiler: &Compiler, units: &[&str]) -> Result<Value, Outcome> {
    let mut result = Value::Unspecified;
    for text in units {
        let (forms, source) = read(text);
        let unit = compiler
            .compile_unit(&forms, &source)
            .map_err(Outcome::Compile)?;
        result = Machine::new(compiler.env().clone())
            .run_unit(&unit)
            .map_err(Outcome::Runtime)?;
    }
    Ok(result)
}

pub fn run(options: CompileOptions, text: &str) -> Result<Value, Outcome> {
    init_logging();
    run_with(&Compiler::new(options), &[text])
}

/// Printed result under the default options and under fully generic calls.
pub fn both_ways(text: &str) -> (String, String) {
    let show = |r: Result<Value, Outcome>| match r {
        Ok(v) => v.to_string(),
        Err(Outcome::Runtime(e)) => format!("runtime error: {}", e),
        Err(Outcome::Compile(e)) => format!("compile error: {}", e),
    };
    (
        show(run(CompileOptions::default(), text)),
        show(run(CompileOptions::generic(), text)),
    )
}
