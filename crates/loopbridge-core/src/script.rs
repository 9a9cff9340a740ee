//! A small re-entrant command-language interpreter.
//!
//! [`ScriptInterp`] implements [`Interpreter`] for a Tcl-like language:
//! words separated by blanks, commands separated by newlines or `;`,
//! `{braces}` for literal text, `"quotes"` and bare words for substituted
//! text, `$var` / `$arr(idx)` / `${name}` variable references and `[cmd]`
//! command substitution. All variables are global.
//!
//! State is only locked for the duration of a single variable or table
//! access, never across a command call, so native commands may evaluate
//! scripts on the same interpreter while they run.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::interp::{EmbeddedError, Interpreter, NativeCommand, ReturnCode, VarFlags};

type Flow = Result<String, EmbeddedError>;

const MAX_NESTING: usize = 1000;

const BUILTINS: &[&str] = &[
    "append", "break", "catch", "concat", "continue", "error", "eval", "expr", "for", "foreach",
    "global", "if", "incr", "info", "join", "lappend", "lindex", "list", "llength", "puts",
    "return", "set", "unset", "while",
];

fn err(message: impl Into<String>) -> EmbeddedError {
    EmbeddedError::error(message)
}

fn wrong_args(usage: &str) -> EmbeddedError {
    err(format!("wrong # args: should be \"{usage}\""))
}

#[derive(Debug, Clone)]
enum Var {
    Scalar(String),
    Array(BTreeMap<String, String>),
}

#[derive(Default)]
struct State {
    vars: HashMap<String, Var>,
    generations: HashMap<String, u64>,
    commands: HashMap<String, NativeCommand>,
    error_info: String,
}

impl State {
    fn bump(&mut self, name: &str) {
        *self.generations.entry(name.to_string()).or_insert(0) += 1;
    }
}

/// Split `arr(idx)` into its parts.
fn split_name<'a>(name: &'a str, index: Option<&'a str>) -> (&'a str, Option<&'a str>) {
    if index.is_some() {
        return (name, index);
    }
    match (name.find('('), name.ends_with(')')) {
        (Some(open), true) if open > 0 => (&name[..open], Some(&name[open + 1..name.len() - 1])),
        _ => (name, None),
    }
}

fn display_name(name: &str, index: Option<&str>) -> String {
    match index {
        Some(idx) => format!("{name}({idx})"),
        None => name.to_string(),
    }
}

/// Re-entrant reference interpreter.
#[derive(Default)]
pub struct ScriptInterp {
    state: Mutex<State>,
    deleted: AtomicBool,
    nesting: AtomicUsize,
}

struct NestingGuard<'a>(&'a AtomicUsize);

impl Drop for NestingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptInterp {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_var(&self, name: &str, index: Option<&str>) -> Flow {
        let state = self.state.lock();
        let shown = display_name(name, index);
        match (state.vars.get(name), index) {
            (None, _) => Err(err(format!("can't read \"{shown}\": no such variable"))),
            (Some(Var::Scalar(v)), None) => Ok(v.clone()),
            (Some(Var::Scalar(_)), Some(_)) => {
                Err(err(format!("can't read \"{shown}\": variable isn't array")))
            }
            (Some(Var::Array(_)), None) => {
                Err(err(format!("can't read \"{shown}\": variable is array")))
            }
            (Some(Var::Array(elems)), Some(idx)) => elems
                .get(idx)
                .cloned()
                .ok_or_else(|| err(format!("can't read \"{shown}\": no such element in array"))),
        }
    }

    fn write_var(&self, name: &str, index: Option<&str>, value: &str, append: bool) -> Flow {
        let mut state = self.state.lock();
        let shown = display_name(name, index);
        let result = match index {
            None => match state.vars.entry(name.to_string()).or_insert_with(|| Var::Scalar(String::new())) {
                Var::Scalar(current) => {
                    if append {
                        current.push_str(value);
                    } else {
                        *current = value.to_string();
                    }
                    current.clone()
                }
                Var::Array(_) => return Err(err(format!("can't set \"{shown}\": variable is array"))),
            },
            Some(idx) => match state
                .vars
                .entry(name.to_string())
                .or_insert_with(|| Var::Array(BTreeMap::new()))
            {
                Var::Array(elems) => {
                    let slot = elems.entry(idx.to_string()).or_default();
                    if append {
                        slot.push_str(value);
                    } else {
                        *slot = value.to_string();
                    }
                    slot.clone()
                }
                Var::Scalar(_) => {
                    return Err(err(format!("can't set \"{shown}\": variable isn't array")))
                }
            },
        };
        state.bump(name);
        Ok(result)
    }

    fn remove_var(&self, name: &str, index: Option<&str>) -> bool {
        let mut state = self.state.lock();
        let removed = match index {
            None => state.vars.remove(name).is_some(),
            Some(idx) => match state.vars.get_mut(name) {
                Some(Var::Array(elems)) => elems.remove(idx).is_some(),
                _ => false,
            },
        };
        if removed {
            state.bump(name);
        }
        removed
    }

    fn var_exists(&self, name: &str) -> bool {
        let (base, index) = split_name(name, None);
        let state = self.state.lock();
        match (state.vars.get(base), index) {
            (Some(Var::Scalar(_)), None) | (Some(Var::Array(_)), None) => true,
            (Some(Var::Array(elems)), Some(idx)) => elems.contains_key(idx),
            _ => false,
        }
    }

    fn eval_script(&self, script: &str) -> Flow {
        let depth = self.nesting.fetch_add(1, Ordering::SeqCst);
        let _guard = NestingGuard(&self.nesting);
        if depth >= MAX_NESTING {
            return Err(err("too many nested evaluations (infinite loop?)"));
        }

        let chars: Vec<char> = script.chars().collect();
        let mut parser = Parser::new(&chars);
        let mut result = String::new();
        while let Some(words) = self.next_command(&mut parser)? {
            if words.is_empty() {
                continue;
            }
            result = match self.call(&words) {
                Ok(value) => value,
                Err(mut e) => {
                    if e.code == ReturnCode::Error {
                        self.trace(&mut e, &words);
                    }
                    return Err(e);
                }
            };
        }
        Ok(result)
    }

    fn trace(&self, e: &mut EmbeddedError, words: &[String]) {
        let extra = std::mem::take(&mut self.state.lock().error_info);
        let (mut info, phrase) = match e.error_info.take() {
            Some(info) => (info, "invoked from within"),
            None => (e.message.clone(), "while executing"),
        };
        if !extra.is_empty() {
            info.push('\n');
            info.push_str(&extra);
        }
        let mut command = format_list(words);
        if command.len() > 150 {
            let cut = (0..=150).rev().find(|i| command.is_char_boundary(*i)).unwrap_or(0);
            command.truncate(cut);
            command.push_str("...");
        }
        info.push_str(&format!("\n    {phrase}\n\"{command}\""));
        e.error_info = Some(info);
    }

    fn next_command(&self, p: &mut Parser) -> Result<Option<Vec<String>>, EmbeddedError> {
        while let Some(c) = p.peek() {
            if c.is_whitespace() || c == ';' {
                p.pos += 1;
            } else if c == '#' {
                while let Some(c) = p.peek() {
                    p.pos += 1;
                    if c == '\n' {
                        break;
                    }
                }
            } else {
                break;
            }
        }
        if p.at_end() {
            return Ok(None);
        }

        let mut words = Vec::new();
        loop {
            while let Some(c) = p.peek() {
                if c == ' ' || c == '\t' || c == '\r' {
                    p.pos += 1;
                } else if c == '\\' && p.peek_at(1) == Some('\n') {
                    p.pos += 2;
                } else {
                    break;
                }
            }
            match p.peek() {
                None => break,
                Some('\n') | Some(';') => {
                    p.pos += 1;
                    break;
                }
                _ => words.push(self.parse_word(p)?),
            }
        }
        Ok(Some(words))
    }

    fn parse_word(&self, p: &mut Parser) -> Flow {
        match p.peek() {
            Some('{') => {
                let word = p.braced()?;
                match p.peek() {
                    None => Ok(word),
                    Some(c) if c.is_whitespace() || c == ';' => Ok(word),
                    Some(_) => Err(err("extra characters after close-brace")),
                }
            }
            Some('"') => {
                p.pos += 1;
                let mut out = String::new();
                loop {
                    match p.peek() {
                        None => return Err(err("missing \"")),
                        Some('"') => {
                            p.pos += 1;
                            break;
                        }
                        Some(_) => self.subst_one(p, &mut out)?,
                    }
                }
                Ok(out)
            }
            _ => {
                let mut out = String::new();
                while let Some(c) = p.peek() {
                    if c.is_whitespace() || c == ';' {
                        break;
                    }
                    self.subst_one(p, &mut out)?;
                }
                Ok(out)
            }
        }
    }

    fn subst_one(&self, p: &mut Parser, out: &mut String) -> Result<(), EmbeddedError> {
        match p.peek() {
            Some('$') => self.subst_var(p, out),
            Some('[') => {
                let inner = p.bracketed()?;
                out.push_str(&self.eval_script(&inner)?);
                Ok(())
            }
            Some('\\') => {
                p.pos += 1;
                out.push(p.escape());
                Ok(())
            }
            Some(c) => {
                out.push(c);
                p.pos += 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn subst_var(&self, p: &mut Parser, out: &mut String) -> Result<(), EmbeddedError> {
        p.pos += 1;
        if p.peek() == Some('{') {
            let name = p.braced()?;
            out.push_str(&self.read_var(&name, None)?);
            return Ok(());
        }
        let name = p.name();
        if name.is_empty() {
            out.push('$');
            return Ok(());
        }
        let index = if p.peek() == Some('(') {
            p.pos += 1;
            let mut idx = String::new();
            loop {
                match p.peek() {
                    None => return Err(err("missing )")),
                    Some(')') => {
                        p.pos += 1;
                        break;
                    }
                    Some(_) => self.subst_one(p, &mut idx)?,
                }
            }
            Some(idx)
        } else {
            None
        };
        out.push_str(&self.read_var(&name, index.as_deref())?);
        Ok(())
    }

    fn call(&self, argv: &[String]) -> Flow {
        if self.is_deleted() {
            return Err(err("attempt to call eval in deleted interpreter"));
        }
        let name = argv[0].as_str();
        let native = self.state.lock().commands.get(name).cloned();
        if let Some(command) = native {
            return command(argv);
        }
        if let Some(result) = self.builtin(argv) {
            return result;
        }
        let unknown = self.state.lock().commands.get("unknown").cloned();
        if let Some(command) = unknown {
            let mut forwarded = Vec::with_capacity(argv.len() + 1);
            forwarded.push("unknown".to_string());
            forwarded.extend(argv.iter().cloned());
            return command(&forwarded);
        }
        Err(err(format!("invalid command name \"{name}\"")))
    }

    fn builtin(&self, argv: &[String]) -> Option<Flow> {
        let result = match argv[0].as_str() {
            "set" => self.cmd_set(argv),
            "unset" => self.cmd_unset(argv),
            "incr" => self.cmd_incr(argv),
            "append" => self.cmd_append(argv),
            "lappend" => self.cmd_lappend(argv),
            "list" => Ok(format_list(&argv[1..])),
            "llength" => match argv {
                [_, list] => parse_list(list).map(|items| items.len().to_string()),
                _ => Err(wrong_args("llength list")),
            },
            "lindex" => cmd_lindex(argv),
            "join" => cmd_join(argv),
            "concat" => Ok(concat(&argv[1..])),
            "eval" => match argv.len() {
                1 => Err(wrong_args("eval arg ?arg ...?")),
                _ => self.eval_script(&concat(&argv[1..])),
            },
            "expr" => match argv.len() {
                1 => Err(wrong_args("expr arg ?arg ...?")),
                _ => self.expr(&concat(&argv[1..])).map(|v| v.to_string()),
            },
            "if" => self.cmd_if(argv),
            "while" => self.cmd_while(argv),
            "for" => self.cmd_for(argv),
            "foreach" => self.cmd_foreach(argv),
            "break" => Err(EmbeddedError::with_code(ReturnCode::Break, "")),
            "continue" => Err(EmbeddedError::with_code(ReturnCode::Continue, "")),
            "return" => match argv {
                [_] => Err(EmbeddedError::with_code(ReturnCode::Return, "")),
                [_, value] => Err(EmbeddedError::with_code(ReturnCode::Return, value.clone())),
                _ => Err(wrong_args("return ?value?")),
            },
            "error" => match argv {
                [_, message] => Err(err(message.clone())),
                [_, message, info, ..] if argv.len() <= 4 => Err(EmbeddedError {
                    code: ReturnCode::Error,
                    message: message.clone(),
                    error_info: (!info.is_empty()).then(|| info.clone()),
                }),
                _ => Err(wrong_args("error message ?errorInfo? ?errorCode?")),
            },
            "catch" => self.cmd_catch(argv),
            "puts" => cmd_puts(argv),
            "info" => match argv {
                [_, sub, name] if sub == "exists" => {
                    Ok(if self.var_exists(name) { "1" } else { "0" }.to_string())
                }
                [_, sub] if sub == "commands" => {
                    let mut names: Vec<String> =
                        self.state.lock().commands.keys().cloned().collect();
                    names.extend(BUILTINS.iter().map(|s| s.to_string()));
                    names.sort();
                    names.dedup();
                    Ok(format_list(&names))
                }
                _ => Err(err("unknown or unsupported info subcommand")),
            },
            "global" => Ok(String::new()),
            _ => return None,
        };
        Some(result)
    }

    fn cmd_set(&self, argv: &[String]) -> Flow {
        match argv {
            [_, name] => {
                let (base, index) = split_name(name, None);
                self.read_var(base, index)
            }
            [_, name, value] => {
                let (base, index) = split_name(name, None);
                self.write_var(base, index, value, false)
            }
            _ => Err(wrong_args("set varName ?newValue?")),
        }
    }

    fn cmd_unset(&self, argv: &[String]) -> Flow {
        let mut names = &argv[1..];
        let mut complain = true;
        if names.first().map(String::as_str) == Some("-nocomplain") {
            complain = false;
            names = &names[1..];
        }
        for name in names {
            let (base, index) = split_name(name, None);
            if !self.remove_var(base, index) && complain {
                return Err(err(format!(
                    "can't unset \"{name}\": no such variable"
                )));
            }
        }
        Ok(String::new())
    }

    fn cmd_incr(&self, argv: &[String]) -> Flow {
        let (name, amount) = match argv {
            [_, name] => (name, 1),
            [_, name, amount] => (name, parse_int(amount)?),
            _ => return Err(wrong_args("incr varName ?increment?")),
        };
        let (base, index) = split_name(name, None);
        let current = match self.read_var(base, index) {
            Ok(value) => parse_int(&value)?,
            Err(_) if !self.var_exists(name) => 0,
            Err(e) => return Err(e),
        };
        let next = current
            .checked_add(amount)
            .ok_or_else(|| err("integer overflow"))?;
        self.write_var(base, index, &next.to_string(), false)
    }

    fn cmd_append(&self, argv: &[String]) -> Flow {
        let Some(name) = argv.get(1) else {
            return Err(wrong_args("append varName ?value value ...?"));
        };
        let (base, index) = split_name(name, None);
        let mut result = self.write_var(base, index, "", true)?;
        for value in &argv[2..] {
            result = self.write_var(base, index, value, true)?;
        }
        Ok(result)
    }

    fn cmd_lappend(&self, argv: &[String]) -> Flow {
        let Some(name) = argv.get(1) else {
            return Err(wrong_args("lappend varName ?value value ...?"));
        };
        let (base, index) = split_name(name, None);
        let mut current = if self.var_exists(name) {
            self.read_var(base, index)?
        } else {
            String::new()
        };
        for value in &argv[2..] {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(&quote_element(value));
        }
        self.write_var(base, index, &current, false)
    }

    fn cmd_if(&self, argv: &[String]) -> Flow {
        let mut i = 1;
        loop {
            let Some(test) = argv.get(i) else {
                return Err(wrong_args("if expr1 ?then? body1 elseif expr2 ?then? body2 ... ?else? ?bodyN?"));
            };
            i += 1;
            if argv.get(i).map(String::as_str) == Some("then") {
                i += 1;
            }
            let Some(body) = argv.get(i) else {
                return Err(err(format!("wrong # args: no script following \"{test}\" argument")));
            };
            i += 1;
            if self.expr(test)?.truthy()? {
                return self.eval_script(body);
            }
            match argv.get(i).map(String::as_str) {
                None => return Ok(String::new()),
                Some("elseif") => i += 1,
                Some("else") => {
                    return match argv.get(i + 1) {
                        Some(body) => self.eval_script(body),
                        None => Err(err("wrong # args: no script following \"else\" argument")),
                    }
                }
                Some(body) if i + 1 == argv.len() => return self.eval_script(body),
                Some(_) => return Err(wrong_args("if expr1 ?then? body1 elseif expr2 ?then? body2 ... ?else? ?bodyN?")),
            }
        }
    }

    /// Run a loop body, mapping break/continue. `Ok(false)` means stop looping.
    fn loop_body(&self, body: &str) -> Result<bool, EmbeddedError> {
        match self.eval_script(body) {
            Ok(_) => Ok(true),
            Err(e) if e.code == ReturnCode::Break => Ok(false),
            Err(e) if e.code == ReturnCode::Continue => Ok(true),
            Err(e) => Err(e),
        }
    }

    fn cmd_while(&self, argv: &[String]) -> Flow {
        let [_, test, body] = argv else {
            return Err(wrong_args("while test command"));
        };
        while self.expr(test)?.truthy()? {
            if !self.loop_body(body)? {
                break;
            }
        }
        Ok(String::new())
    }

    fn cmd_for(&self, argv: &[String]) -> Flow {
        let [_, start, test, next, body] = argv else {
            return Err(wrong_args("for start test next command"));
        };
        self.eval_script(start)?;
        while self.expr(test)?.truthy()? {
            if !self.loop_body(body)? {
                break;
            }
            self.eval_script(next)?;
        }
        Ok(String::new())
    }

    fn cmd_foreach(&self, argv: &[String]) -> Flow {
        let [_, names, list, body] = argv else {
            return Err(wrong_args("foreach varList list command"));
        };
        let names = parse_list(names)?;
        if names.is_empty() {
            return Err(err("foreach varlist is empty"));
        }
        let items = parse_list(list)?;
        for chunk in items.chunks(names.len()) {
            for (i, name) in names.iter().enumerate() {
                let value = chunk.get(i).map(String::as_str).unwrap_or("");
                let (base, index) = split_name(name, None);
                self.write_var(base, index, value, false)?;
            }
            if !self.loop_body(body)? {
                break;
            }
        }
        Ok(String::new())
    }

    fn cmd_catch(&self, argv: &[String]) -> Flow {
        let (script, var) = match argv {
            [_, script] => (script, None),
            [_, script, var] => (script, Some(var)),
            _ => return Err(wrong_args("catch script ?resultVarName?")),
        };
        let (code, value) = match self.eval_script(script) {
            Ok(value) => (ReturnCode::Ok, value),
            Err(e) => {
                if e.code == ReturnCode::Error {
                    let info = e.error_info.clone().unwrap_or_else(|| e.message.clone());
                    self.write_var("errorInfo", None, &info, false)?;
                }
                (e.code, e.message)
            }
        };
        if let Some(var) = var {
            let (base, index) = split_name(var, None);
            self.write_var(base, index, &value, false)?;
        }
        Ok(code.as_i32().to_string())
    }

    fn expr(&self, text: &str) -> Result<Value, EmbeddedError> {
        let chars: Vec<char> = text.chars().collect();
        let mut parser = ExprParser {
            interp: self,
            p: Parser::new(&chars),
            skip: 0,
        };
        let value = parser.parse_or()?;
        parser.p.skip_blanks();
        if !parser.p.at_end() {
            return Err(err(format!("syntax error in expression \"{text}\"")));
        }
        Ok(value)
    }
}

impl Interpreter for ScriptInterp {
    fn evaluate(&self, script: &str) -> Flow {
        if self.is_deleted() {
            return Err(err("attempt to call eval in deleted interpreter"));
        }
        let result = self.eval_script(script);
        if let Err(e) = &result {
            if e.code == ReturnCode::Error {
                let info = e.error_info.clone().unwrap_or_else(|| e.message.clone());
                let _ = self.write_var("errorInfo", None, &info, false);
            }
        }
        result
    }

    fn invoke_command(&self, name: &str, args: &[String]) -> Flow {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(name.to_string());
        argv.extend(args.iter().cloned());
        self.call(&argv)
    }

    fn has_command(&self, name: &str) -> bool {
        BUILTINS.contains(&name) || self.state.lock().commands.contains_key(name)
    }

    fn get_variable(&self, name: &str, index: Option<&str>, _flags: VarFlags) -> Flow {
        let (base, index) = split_name(name, index);
        self.read_var(base, index)
    }

    fn set_variable(&self, name: &str, index: Option<&str>, value: &str, flags: VarFlags) -> Flow {
        let (base, index) = split_name(name, index);
        if flags.contains(VarFlags::LIST_ELEMENT) {
            let mut element = quote_element(value);
            if flags.contains(VarFlags::APPEND_VALUE) && self.var_exists(&display_name(base, index)) {
                element.insert(0, ' ');
            }
            return self.write_var(base, index, &element, flags.contains(VarFlags::APPEND_VALUE));
        }
        self.write_var(base, index, value, flags.contains(VarFlags::APPEND_VALUE))
    }

    fn unset_variable(&self, name: &str, index: Option<&str>, _flags: VarFlags) -> bool {
        let (base, index) = split_name(name, index);
        self.remove_var(base, index)
    }

    fn variable_generation(&self, name: &str) -> u64 {
        let (base, _) = split_name(name, None);
        self.state.lock().generations.get(base).copied().unwrap_or(0)
    }

    fn register_native_command(&self, name: &str, command: NativeCommand) {
        self.state.lock().commands.insert(name.to_string(), command);
    }

    fn add_error_info(&self, info: &str) {
        let mut state = self.state.lock();
        if !state.error_info.is_empty() {
            state.error_info.push('\n');
        }
        state.error_info.push_str(info);
    }

    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        let names: Vec<String> = state.vars.drain().map(|(name, _)| name).collect();
        for name in names {
            state.bump(&name);
        }
        state.error_info.clear();
    }

    fn delete(&self) {
        if self.deleted.swap(true, Ordering::SeqCst) {
            return;
        }
        // Native commands may hold handles back into the host; drop them here.
        let commands = std::mem::take(&mut self.state.lock().commands);
        drop(commands);
    }
}

/// Character cursor shared by the script and expression parsers.
struct Parser<'a> {
    chars: &'a [char],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(chars: &'a [char]) -> Self {
        Self { chars, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn skip_blanks(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn name(&mut self) -> String {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == ':')
        {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    /// Content of a `{...}` group, cursor on the opening brace.
    fn braced(&mut self) -> Result<String, EmbeddedError> {
        self.pos += 1;
        let start = self.pos;
        let mut depth = 1;
        while let Some(c) = self.peek() {
            match c {
                '\\' => self.pos += 1,
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        let content = self.chars[start..self.pos].iter().collect();
                        self.pos += 1;
                        return Ok(content);
                    }
                }
                _ => {}
            }
            self.pos += 1;
        }
        Err(err("missing close-brace"))
    }

    /// Content of a `[...]` group, cursor on the opening bracket.
    fn bracketed(&mut self) -> Result<String, EmbeddedError> {
        self.pos += 1;
        let start = self.pos;
        let mut depth = 1;
        while let Some(c) = self.peek() {
            match c {
                '\\' => self.pos += 1,
                '{' => {
                    self.braced()?;
                    continue;
                }
                '[' => depth += 1,
                ']' => {
                    depth -= 1;
                    if depth == 0 {
                        let content = self.chars[start..self.pos].iter().collect();
                        self.pos += 1;
                        return Ok(content);
                    }
                }
                _ => {}
            }
            self.pos += 1;
        }
        Err(err("missing close-bracket"))
    }

    /// Character following a backslash, cursor just past the backslash.
    fn escape(&mut self) -> char {
        let Some(c) = self.peek() else {
            return '\\';
        };
        self.pos += 1;
        match c {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            '\n' => ' ',
            other => other,
        }
    }

    /// Step over a `$name`, `$name(...)` or `${...}` reference without reading it.
    fn skip_var_ref(&mut self) -> Result<(), EmbeddedError> {
        self.pos += 1;
        if self.peek() == Some('{') {
            self.braced()?;
            return Ok(());
        }
        self.name();
        if self.peek() == Some('(') {
            let mut depth = 0;
            while let Some(c) = self.peek() {
                self.pos += 1;
                match c {
                    '(' => depth += 1,
                    ')' => {
                        depth -= 1;
                        if depth == 0 {
                            return Ok(());
                        }
                    }
                    _ => {}
                }
            }
            return Err(err("missing )"));
        }
        Ok(())
    }
}

/// Split a list into its elements.
pub fn parse_list(list: &str) -> Result<Vec<String>, EmbeddedError> {
    let chars: Vec<char> = list.chars().collect();
    let mut p = Parser::new(&chars);
    let mut items = Vec::new();
    loop {
        p.skip_blanks();
        match p.peek() {
            None => break,
            Some('{') => {
                items.push(p.braced()?);
                if p.peek().is_some_and(|c| !c.is_whitespace()) {
                    return Err(err("list element in braces followed by extra characters"));
                }
            }
            Some('"') => {
                p.pos += 1;
                let mut item = String::new();
                loop {
                    match p.peek() {
                        None => return Err(err("unmatched open quote in list")),
                        Some('"') => {
                            p.pos += 1;
                            break;
                        }
                        Some('\\') => {
                            p.pos += 1;
                            item.push(p.escape());
                        }
                        Some(c) => {
                            item.push(c);
                            p.pos += 1;
                        }
                    }
                }
                items.push(item);
            }
            Some(_) => {
                let mut item = String::new();
                while let Some(c) = p.peek() {
                    if c.is_whitespace() {
                        break;
                    }
                    p.pos += 1;
                    if c == '\\' {
                        item.push(p.escape());
                    } else {
                        item.push(c);
                    }
                }
                items.push(item);
            }
        }
    }
    Ok(items)
}

fn braces_balanced(s: &str) -> bool {
    let mut depth = 0i32;
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0 && !escaped
}

/// Quote one element so that [`parse_list`] gives it back unchanged.
pub fn quote_element(item: &str) -> String {
    if item.is_empty() {
        return "{}".to_string();
    }
    let special = item.starts_with('#')
        || item
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '{' | '}' | '[' | ']' | '$' | ';' | '"' | '\\'));
    if !special {
        return item.to_string();
    }
    if braces_balanced(item) && !item.contains('\\') {
        return format!("{{{item}}}");
    }
    let mut out = String::with_capacity(item.len() * 2);
    for c in item.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c if c.is_whitespace() || matches!(c, '{' | '}' | '[' | ']' | '$' | ';' | '"' | '\\') => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}

/// Build a well-formed list from `items`.
pub fn format_list<S: AsRef<str>>(items: &[S]) -> String {
    items
        .iter()
        .map(|item| quote_element(item.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn concat(args: &[String]) -> String {
    args.iter()
        .map(|a| a.trim())
        .filter(|a| !a.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_int(s: &str) -> Result<i64, EmbeddedError> {
    let t = s.trim();
    let parsed = if let Some(hex) = t.strip_prefix("0x") {
        i64::from_str_radix(hex, 16).ok()
    } else {
        t.parse().ok()
    };
    parsed.ok_or_else(|| err(format!("expected integer but got \"{s}\"")))
}

fn cmd_lindex(argv: &[String]) -> Flow {
    let [_, list, index] = argv else {
        return Err(wrong_args("lindex list index"));
    };
    let items = parse_list(list)?;
    let position = if index == "end" {
        items.len().checked_sub(1)
    } else if let Some(back) = index.strip_prefix("end-") {
        items.len().checked_sub(1 + parse_int(back)?.max(0) as usize)
    } else {
        usize::try_from(parse_int(index)?).ok()
    };
    Ok(position
        .and_then(|i| items.get(i).cloned())
        .unwrap_or_default())
}

fn cmd_join(argv: &[String]) -> Flow {
    let (list, sep) = match argv {
        [_, list] => (list, " "),
        [_, list, sep] => (list, sep.as_str()),
        _ => return Err(wrong_args("join list ?joinString?")),
    };
    Ok(parse_list(list)?.join(sep))
}

fn cmd_puts(argv: &[String]) -> Flow {
    let mut args = &argv[1..];
    let mut newline = true;
    if args.first().map(String::as_str) == Some("-nonewline") {
        newline = false;
        args = &args[1..];
    }
    let (channel, text) = match args {
        [text] => ("stdout", text),
        [channel, text] => (channel.as_str(), text),
        _ => return Err(wrong_args("puts ?-nonewline? ?channelId? string")),
    };
    let end = if newline { "\n" } else { "" };
    match channel {
        "stdout" => print!("{text}{end}"),
        "stderr" => eprint!("{text}{end}"),
        other => return Err(err(format!("can not find channel named \"{other}\""))),
    }
    Ok(String::new())
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    fn parse(s: &str) -> Value {
        let t = s.trim();
        if let Ok(i) = parse_int(t) {
            return Value::Int(i);
        }
        if t.starts_with(|c: char| c.is_ascii_digit() || c == '.' || c == '-' || c == '+') {
            if let Ok(f) = t.parse::<f64>() {
                return Value::Float(f);
            }
        }
        Value::Str(s.to_string())
    }

    fn number(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Str(_) => None,
        }
    }

    fn truthy(&self) -> Result<bool, EmbeddedError> {
        match self {
            Value::Int(i) => Ok(*i != 0),
            Value::Float(f) => Ok(*f != 0.0),
            Value::Str(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" => Ok(true),
                "false" | "no" | "off" => Ok(false),
                _ => Err(err(format!("expected boolean value but got \"{s}\""))),
            },
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e15 => {
                write!(f, "{x:.1}")
            }
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => f.write_str(s),
        }
    }
}

/// Precedence-climbing evaluator for `expr`, `if`, `while` and `for`.
struct ExprParser<'i, 'c> {
    interp: &'i ScriptInterp,
    p: Parser<'c>,
    /// Non-zero while parsing a short-circuited operand: no substitutions run.
    skip: usize,
}

impl ExprParser<'_, '_> {
    fn eat(&mut self, op: &str) -> bool {
        self.p.skip_blanks();
        let len = op.chars().count();
        let matches = op
            .chars()
            .enumerate()
            .all(|(i, c)| self.p.peek_at(i) == Some(c));
        if !matches {
            return false;
        }
        // Keep `<` from eating the start of `<=` and words from eating prefixes.
        let next = self.p.peek_at(len);
        if op.chars().all(char::is_alphabetic) && next.is_some_and(char::is_alphanumeric) {
            return false;
        }
        if matches!(op, "<" | ">" | "!") && next == Some('=') {
            return false;
        }
        self.p.pos += len;
        true
    }

    fn parse_or(&mut self) -> Result<Value, EmbeddedError> {
        let mut left = self.parse_and()?;
        while self.eat("||") {
            let done = self.skip > 0 || left.truthy()?;
            if done {
                self.skip += 1;
            }
            let right = self.parse_and();
            if done {
                self.skip -= 1;
            }
            let right = right?;
            left = Value::Int(i64::from(done || right.truthy()?));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Value, EmbeddedError> {
        let mut left = self.parse_eq()?;
        while self.eat("&&") {
            let short = self.skip > 0 || !left.truthy()?;
            if short {
                self.skip += 1;
            }
            let right = self.parse_eq();
            if short {
                self.skip -= 1;
            }
            let right = right?;
            left = Value::Int(i64::from(!short && right.truthy()?));
        }
        Ok(left)
    }

    fn parse_eq(&mut self) -> Result<Value, EmbeddedError> {
        let mut left = self.parse_cmp()?;
        loop {
            let (string_only, negate) = if self.eat("==") {
                (false, false)
            } else if self.eat("!=") {
                (false, true)
            } else if self.eat("eq") {
                (true, false)
            } else if self.eat("ne") {
                (true, true)
            } else {
                return Ok(left);
            };
            let right = self.parse_cmp()?;
            let equal = match (string_only, left.number(), right.number()) {
                (false, Some(a), Some(b)) => a == b,
                _ => left.to_string() == right.to_string(),
            };
            left = Value::Int(i64::from(equal != negate));
        }
    }

    fn parse_cmp(&mut self) -> Result<Value, EmbeddedError> {
        let mut left = self.parse_add()?;
        loop {
            let op = if self.eat("<=") {
                "<="
            } else if self.eat(">=") {
                ">="
            } else if self.eat("<") {
                "<"
            } else if self.eat(">") {
                ">"
            } else {
                return Ok(left);
            };
            let right = self.parse_add()?;
            let ordering = match (left.number(), right.number()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => Some(left.to_string().cmp(&right.to_string())),
            };
            let holds = ordering.is_some_and(|o| match op {
                "<=" => o.is_le(),
                ">=" => o.is_ge(),
                "<" => o.is_lt(),
                _ => o.is_gt(),
            });
            left = Value::Int(i64::from(holds));
        }
    }

    fn arith(&self, op: char, left: &Value, right: &Value) -> Result<Value, EmbeddedError> {
        if self.skip > 0 {
            return Ok(Value::Int(0));
        }
        let operand_error = |v: &Value| {
            err(format!(
                "can't use non-numeric string \"{v}\" as operand of \"{op}\""
            ))
        };
        if let (Value::Int(a), Value::Int(b)) = (left, right) {
            let (a, b) = (*a, *b);
            let result = match op {
                '+' => a.checked_add(b),
                '-' => a.checked_sub(b),
                '*' => a.checked_mul(b),
                '/' | '%' if b == 0 => return Err(err("divide by zero")),
                '/' => a.checked_div_euclid(b),
                _ if b == -1 => Some(0),
                _ => a.checked_rem_euclid(b),
            };
            return result
                .map(Value::Int)
                .ok_or_else(|| err("integer value too large to represent"));
        }
        let a = left.number().ok_or_else(|| operand_error(left))?;
        let b = right.number().ok_or_else(|| operand_error(right))?;
        match op {
            '+' => Ok(Value::Float(a + b)),
            '-' => Ok(Value::Float(a - b)),
            '*' => Ok(Value::Float(a * b)),
            '/' if b == 0.0 => Err(err("divide by zero")),
            '/' => Ok(Value::Float(a / b)),
            _ => Err(err("can't use floating-point value as operand of \"%\"")),
        }
    }

    fn parse_add(&mut self) -> Result<Value, EmbeddedError> {
        let mut left = self.parse_mul()?;
        loop {
            let op = if self.eat("+") {
                '+'
            } else if self.eat("-") {
                '-'
            } else {
                return Ok(left);
            };
            let right = self.parse_mul()?;
            left = self.arith(op, &left, &right)?;
        }
    }

    fn parse_mul(&mut self) -> Result<Value, EmbeddedError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = if self.eat("*") {
                '*'
            } else if self.eat("/") {
                '/'
            } else if self.eat("%") {
                '%'
            } else {
                return Ok(left);
            };
            let right = self.parse_unary()?;
            left = self.arith(op, &left, &right)?;
        }
    }

    fn parse_unary(&mut self) -> Result<Value, EmbeddedError> {
        if self.eat("!") {
            let value = self.parse_unary()?;
            if self.skip > 0 {
                return Ok(Value::Int(0));
            }
            return Ok(Value::Int(i64::from(!value.truthy()?)));
        }
        if self.eat("-") {
            let value = self.parse_unary()?;
            return self.arith('-', &Value::Int(0), &value);
        }
        if self.eat("+") {
            return self.parse_unary();
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Value, EmbeddedError> {
        self.p.skip_blanks();
        let Some(c) = self.p.peek() else {
            return Err(err("missing operand"));
        };
        match c {
            '(' => {
                self.p.pos += 1;
                let value = self.parse_or()?;
                if !self.eat(")") {
                    return Err(err("unbalanced parentheses in expression"));
                }
                Ok(value)
            }
            '$' => {
                if self.skip > 0 {
                    self.p.skip_var_ref()?;
                    return Ok(Value::Int(0));
                }
                let mut out = String::new();
                self.interp.subst_var(&mut self.p, &mut out)?;
                Ok(Value::parse(&out))
            }
            '[' => {
                let script = self.p.bracketed()?;
                if self.skip > 0 {
                    return Ok(Value::Int(0));
                }
                Ok(Value::parse(&self.interp.eval_script(&script)?))
            }
            '{' => Ok(Value::Str(self.p.braced()?)),
            '"' => {
                self.p.pos += 1;
                let mut out = String::new();
                loop {
                    match self.p.peek() {
                        None => return Err(err("missing \"")),
                        Some('"') => {
                            self.p.pos += 1;
                            break;
                        }
                        Some('\\') if self.skip > 0 => self.p.pos += 2,
                        Some(c) if self.skip > 0 => {
                            if c == '[' {
                                self.p.bracketed()?;
                            } else {
                                self.p.pos += 1;
                            }
                        }
                        Some(_) => self.interp.subst_one(&mut self.p, &mut out)?,
                    }
                }
                Ok(Value::Str(out))
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = self.p.pos;
                while let Some(c) = self.p.peek() {
                    let exponent_sign = (c == '-' || c == '+')
                        && matches!(self.p.chars.get(self.p.pos.wrapping_sub(1)), Some('e' | 'E'))
                        && !self.p.chars[start..self.p.pos].starts_with(&['0', 'x']);
                    if c.is_ascii_alphanumeric() || c == '.' || exponent_sign {
                        self.p.pos += 1;
                    } else {
                        break;
                    }
                }
                let literal: String = self.p.chars[start..self.p.pos].iter().collect();
                match Value::parse(&literal) {
                    Value::Str(_) => Err(err(format!("invalid number \"{literal}\""))),
                    number => Ok(number),
                }
            }
            c if c.is_alphabetic() => {
                let word = self.p.name();
                match word.to_ascii_lowercase().as_str() {
                    "true" | "false" | "yes" | "no" | "on" | "off" => Ok(Value::Str(word)),
                    _ => Err(err(format!("invalid bareword \"{word}\""))),
                }
            }
            other => Err(err(format!("syntax error in expression near \"{other}\""))),
        }
    }
}
