//! Plugin source normalization.
//!
//! Plugins are written in a typed, module-flavoured surface over Rhai. This
//! module strips what Rhai cannot run (type annotations, interfaces,
//! `import`/`export`), rewrites the handful of constructs that have a direct
//! Rhai spelling, and collects the `globalThis.<entry> = <fn>;` bindings that
//! tell the worker which functions to call.
//!
//! Newlines are preserved through every rewrite, so line numbers reported by
//! the Rhai parser match the author's source.

use std::collections::{BTreeMap, HashSet};

use rhai::Engine;
use scan_plugin::EntryKind;

use crate::error::ValidationError;

/// Specifier prefix of the host's own module; importing it is a no-op.
pub const BUILTIN_MODULE: &str = "scanhost";

/// Bridge namespaces and their members; `console.log` becomes `console::log`.
const NAMESPACES: [(&str, &[&str]); 4] = [
    ("console", &["log", "info", "warn", "error", "debug"]),
    ("Host", &["emitFinding", "log"]),
    ("text", &["encode", "decode", "hex", "truncate"]),
    ("JSON", &["stringify", "parse"]),
];

/// Method names with a different Rhai spelling.
const METHOD_RENAMES: [(&str, &str); 6] = [
    ("includes", "contains"),
    ("toLowerCase", "to_lower"),
    ("toUpperCase", "to_upper"),
    ("startsWith", "starts_with"),
    ("endsWith", "ends_with"),
    ("indexOf", "index_of"),
];

/// Global names accepted as aliases of `analyze` when `analyze` itself is not bound.
const ANALYZE_ALIASES: [&str; 2] = ["run", "execute"];

const MULTI_PUNCT: [&str; 12] = ["===", "!==", "...", "==", "!=", "=>", "->", "::", "?.", "??", "&&", "||"];

/// Normalized plugin: a Rhai script body plus its entry-point table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledScript {
    pub body: String,
    pub bindings: BTreeMap<EntryKind, String>,
    pub warnings: Vec<String>,
}

impl CompiledScript {
    pub fn entry_points(&self) -> Vec<EntryKind> {
        self.bindings.keys().copied().collect()
    }

    pub fn function_for(&self, kind: EntryKind) -> Option<&str> {
        self.bindings.get(&kind).map(String::as_str)
    }
}

/// Normalize `source` and check it parses and binds at least one entry point.
pub fn normalize(source: &str) -> Result<CompiledScript, ValidationError> {
    let tokens = lex(source)?;
    let script = Rewriter::new(&tokens).run()?;
    if script.bindings.is_empty() {
        return Err(ValidationError::MissingEntryPoint);
    }
    check_script(&script)?;
    Ok(script)
}

/// Parse the body with a bare engine and check each binding names a function
/// taking at most one argument.
fn check_script(script: &CompiledScript) -> Result<(), ValidationError> {
    let mut engine = Engine::new_raw();
    engine.disable_symbol("eval");
    let ast = engine
        .compile(&script.body)
        .map_err(|err| ValidationError::Syntax(err.to_string()))?;

    for (entry, function) in &script.bindings {
        let defined = ast
            .iter_functions()
            .any(|f| f.name == function.as_str() && f.params.len() <= 1);
        if !defined {
            return Err(ValidationError::UndefinedEntryPoint { entry: *entry, function: function.clone() });
        }
    }
    Ok(())
}

/// Outcome of the static security scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SecurityReport {
    /// Blocking issues.
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl SecurityReport {
    pub fn passed(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Superficial scan for constructs that have no business in a plugin.
///
/// Only code is inspected; the same words inside strings or comments are fine.
/// Source that does not even lex yields an empty report; [`normalize`] reports that.
pub fn security_scan(source: &str) -> SecurityReport {
    let mut report = SecurityReport::default();
    let Ok(tokens) = lex(source) else {
        return report;
    };
    let code: Vec<&Token> = tokens.iter().filter(|t| !t.is_trivia()).collect();

    for (idx, tok) in code.iter().enumerate() {
        let next = code.get(idx + 1).map(|t| t.text.as_str());
        let blocked = match (tok.kind, tok.text.as_str(), next) {
            (Kind::Ident, "eval", Some("(")) => Some("use of eval() is forbidden"),
            (Kind::Ident, "Function", Some("(")) => Some("use of the Function constructor is forbidden"),
            (Kind::Ident, "require", Some("(")) => Some("require() is not available to plugins"),
            (Kind::Ident, "Deno", Some(".")) => Some("the Deno namespace is not available to plugins"),
            (Kind::Ident, "process", Some(".")) => Some("the process object is not available to plugins"),
            (Kind::Ident, "execSync", _) => Some("use of execSync is forbidden"),
            (Kind::Str, s, _) if s.contains("child_process") => Some("use of child_process is forbidden"),
            _ => None,
        };
        if let Some(message) = blocked {
            push_unique(&mut report.errors, message);
        }

        let risky = match tok.text.as_str() {
            "innerHTML" => Some("potentially unsafe: innerHTML usage"),
            "dangerouslySetInnerHTML" => Some("potentially unsafe: dangerouslySetInnerHTML"),
            "__proto__" => Some("prototype pollution risk: __proto__"),
            _ => None,
        };
        if let Some(message) = risky.filter(|_| tok.kind == Kind::Ident) {
            push_unique(&mut report.warnings, message);
        }
    }
    report
}

fn push_unique(list: &mut Vec<String>, message: &str) {
    if !list.iter().any(|m| m == message) {
        list.push(message.to_string());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Ident,
    Number,
    Str,
    Comment,
    Space,
    Punct,
}

#[derive(Debug, Clone)]
struct Token {
    kind: Kind,
    text: String,
    line: usize,
}

impl Token {
    fn is(&self, s: &str) -> bool {
        matches!(self.kind, Kind::Ident | Kind::Punct) && self.text == s
    }

    fn is_trivia(&self) -> bool {
        matches!(self.kind, Kind::Space | Kind::Comment)
    }
}

fn lex(src: &str) -> Result<Vec<Token>, ValidationError> {
    let chars: Vec<char> = src.chars().collect();
    let len = chars.len();
    let mut tokens = Vec::new();
    let mut i = 0;
    let mut line = 1;

    while i < len {
        let c = chars[i];
        let start = i;
        let start_line = line;

        let kind = if c.is_whitespace() {
            while i < len && chars[i].is_whitespace() {
                if chars[i] == '\n' {
                    line += 1;
                }
                i += 1;
            }
            Kind::Space
        } else if c == '/' && chars.get(i + 1) == Some(&'/') {
            while i < len && chars[i] != '\n' {
                i += 1;
            }
            Kind::Comment
        } else if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            loop {
                if i >= len {
                    return Err(ValidationError::Unterminated { what: "block comment", line: start_line });
                }
                if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
                    i += 2;
                    break;
                }
                if chars[i] == '\n' {
                    line += 1;
                }
                i += 1;
            }
            Kind::Comment
        } else if c == '"' || c == '\'' || c == '`' {
            i += 1;
            loop {
                match chars.get(i) {
                    None => {
                        return Err(ValidationError::Unterminated { what: "string literal", line: start_line });
                    }
                    Some('\\') => {
                        if chars.get(i + 1) == Some(&'\n') {
                            line += 1;
                        }
                        i += 2;
                    }
                    Some(&ch) if ch == c => {
                        i += 1;
                        break;
                    }
                    Some('\n') if c != '`' => {
                        return Err(ValidationError::Unterminated { what: "string literal", line: start_line });
                    }
                    Some(ch) => {
                        if *ch == '\n' {
                            line += 1;
                        }
                        i += 1;
                    }
                }
            }
            Kind::Str
        } else if c.is_ascii_digit() {
            while i < len && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                i += 1;
            }
            Kind::Number
        } else if c.is_alphabetic() || c == '_' || c == '$' {
            while i < len && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                i += 1;
            }
            Kind::Ident
        } else {
            let rest: String = chars[i..(i + 3).min(len)].iter().collect();
            let width = MULTI_PUNCT
                .iter()
                .find(|p| rest.starts_with(*p))
                .map(|p| p.len())
                .unwrap_or(1);
            i += width;
            Kind::Punct
        };

        tokens.push(Token { kind, text: chars[start..i.min(len)].iter().collect(), line: start_line });
    }
    Ok(tokens)
}

/// `'it\'s "x"'` -> `"it's \"x\""`
fn requote(literal: &str) -> String {
    let inner = &literal[1..literal.len() - 1];
    let mut out = String::with_capacity(literal.len() + 2);
    out.push('"');
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => match chars.next() {
                Some('\'') => out.push('\''),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            },
            '"' => out.push_str("\\\""),
            _ => out.push(ch),
        }
    }
    out.push('"');
    out
}

fn entry_for(name: &str) -> Option<EntryKind> {
    match name {
        "scan_request" => Some(EntryKind::ScanRequest),
        "scan_response" => Some(EntryKind::ScanResponse),
        "analyze" => Some(EntryKind::Analyze),
        _ => None,
    }
}

struct Rewriter<'a> {
    toks: &'a [Token],
    out: String,
    last_sig: Option<&'a str>,
    bindings: BTreeMap<EntryKind, String>,
    aliases: Vec<(String, String)>,
    warnings: Vec<String>,
    skip_close: HashSet<usize>,
}

impl<'a> Rewriter<'a> {
    fn new(toks: &'a [Token]) -> Self {
        Self {
            toks,
            out: String::new(),
            last_sig: None,
            bindings: BTreeMap::new(),
            aliases: Vec::new(),
            warnings: Vec::new(),
            skip_close: HashSet::new(),
        }
    }

    fn run(mut self) -> Result<CompiledScript, ValidationError> {
        let mut i = 0;
        while i < self.toks.len() {
            if self.skip_close.remove(&i) {
                i += 1;
                continue;
            }
            let toks = self.toks;
            let tok = &toks[i];
            i = match tok.kind {
                Kind::Space | Kind::Comment | Kind::Number => {
                    self.emit_tok(i);
                    i + 1
                }
                Kind::Str => {
                    if tok.text.starts_with('\'') {
                        self.emit(&requote(&tok.text));
                        self.last_sig = Some("\"\"");
                    } else {
                        self.emit_tok(i);
                    }
                    i + 1
                }
                Kind::Punct => self.punct(i)?,
                Kind::Ident => self.ident(i)?,
            };
        }

        if !self.bindings.contains_key(&EntryKind::Analyze) {
            let alias = ANALYZE_ALIASES
                .iter()
                .find_map(|name| self.aliases.iter().find(|(n, _)| n == name));
            if let Some((_, function)) = alias {
                self.bindings.insert(EntryKind::Analyze, function.clone());
            }
        }

        Ok(CompiledScript { body: self.out, bindings: self.bindings, warnings: self.warnings })
    }

    fn emit(&mut self, text: &str) {
        self.out.push_str(text);
    }

    fn emit_tok(&mut self, i: usize) {
        let toks = self.toks;
        let tok = &toks[i];
        self.out.push_str(&tok.text);
        if !tok.is_trivia() {
            self.last_sig = Some(tok.text.as_str());
        }
    }

    /// Emit `emit` in place of a token, recording it as the last significant text.
    fn replace(&mut self, emit: &'static str) {
        self.out.push_str(emit);
        self.last_sig = Some(emit);
    }

    /// Drop `from..to`, keeping only its newlines.
    fn drop_range(&mut self, from: usize, to: usize) {
        let end = to.min(self.toks.len());
        for tok in &self.toks[from.min(end)..end] {
            for _ in tok.text.matches('\n') {
                self.out.push('\n');
            }
        }
    }

    fn emit_range(&mut self, from: usize, to: usize) {
        for i in from..to.min(self.toks.len()) {
            self.emit_tok(i);
        }
    }

    fn next_sig(&self, from: usize) -> Option<usize> {
        (from..self.toks.len()).find(|&i| !self.toks[i].is_trivia())
    }

    fn sig_is(&self, from: usize, text: &str) -> Option<usize> {
        self.next_sig(from).filter(|&k| self.toks[k].is(text))
    }

    fn sig_ident(&self, from: usize) -> Option<usize> {
        self.next_sig(from).filter(|&k| self.toks[k].kind == Kind::Ident)
    }

    fn at_statement_start(&self) -> bool {
        matches!(self.last_sig, None | Some(";") | Some("{") | Some("}"))
    }

    /// Index just past the token closing the group opened at `open_idx`.
    fn skip_balanced(&self, open_idx: usize, open: &str, close: &str) -> usize {
        let mut depth = 0usize;
        for i in open_idx..self.toks.len() {
            let tok = &self.toks[i];
            if tok.is(open) {
                depth += 1;
            } else if tok.is(close) {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return i + 1;
                }
            }
        }
        self.toks.len()
    }

    /// Index just past a type expression starting at or after `i`.
    fn skip_type(&self, mut i: usize) -> usize {
        loop {
            let Some(k) = self.next_sig(i) else {
                return self.toks.len();
            };
            let tok = &self.toks[k];
            if ["typeof", "keyof", "readonly", "unique"].iter().any(|p| tok.is(p)) {
                i = k + 1;
                continue;
            }

            let mut j = if tok.is("{") {
                self.skip_balanced(k, "{", "}")
            } else if tok.is("[") {
                self.skip_balanced(k, "[", "]")
            } else if tok.is("(") {
                let after = self.skip_balanced(k, "(", ")");
                match self.sig_is(after, "=>") {
                    Some(arrow) => self.skip_type(arrow + 1),
                    None => after,
                }
            } else if tok.kind == Kind::Ident {
                let mut j = k + 1;
                while let Some(dot) = self.sig_is(j, ".") {
                    match self.sig_ident(dot + 1) {
                        Some(part) => j = part + 1,
                        None => break,
                    }
                }
                if let Some(lt) = self.sig_is(j, "<") {
                    j = self.skip_balanced(lt, "<", ">");
                }
                j
            } else if matches!(tok.kind, Kind::Str | Kind::Number) {
                k + 1
            } else {
                return i;
            };

            // array suffixes
            while let Some(open) = self.sig_is(j, "[") {
                match self.sig_is(open + 1, "]") {
                    Some(close) => j = close + 1,
                    None => break,
                }
            }

            match self.next_sig(j) {
                Some(op) if self.toks[op].is("|") || self.toks[op].is("&") => i = op + 1,
                _ => return j,
            }
        }
    }

    fn punct(&mut self, i: usize) -> Result<usize, ValidationError> {
        let toks = self.toks;
        let text = toks[i].text.as_str();
        match text {
            "===" => self.replace("=="),
            "!==" => self.replace("!="),
            "{" if self.object_literal_position() => self.replace("#{"),
            "(" => {
                // `(globalThis as any).entry = fn;`
                if let Some(g) = self.sig_is(i + 1, "globalThis") {
                    if let Some(cast) = self.sig_is(g + 1, "as") {
                        let after_type = self.skip_type(cast + 1);
                        if let Some(close) = self.sig_is(after_type, ")") {
                            return self.binding(i, close + 1);
                        }
                    }
                }
                self.emit_tok(i);
            }
            _ => self.emit_tok(i),
        }
        Ok(i + 1)
    }

    /// A `{` that opens a JS object literal rather than a block.
    fn object_literal_position(&self) -> bool {
        matches!(
            self.last_sig,
            Some("(" | "," | "=" | ":" | "[" | "return" | "??" | "||" | "&&" | "?" | "throw")
        )
    }

    fn ident(&mut self, i: usize) -> Result<usize, ValidationError> {
        let toks = self.toks;
        let text = toks[i].text.as_str();
        let after_dot = self.last_sig == Some(".");

        if after_dot {
            if text == "length" && self.sig_is(i + 1, "(").is_none() {
                self.replace("len()");
                return Ok(i + 1);
            }
            if let Some((_, renamed)) = METHOD_RENAMES.iter().find(|(from, _)| *from == text) {
                self.replace(*renamed);
                return Ok(i + 1);
            }
            self.emit_tok(i);
            return Ok(i + 1);
        }

        match text {
            "import" if self.at_statement_start() => self.import(i),
            "export" => Ok(self.export(i)),
            "interface" if self.at_statement_start() && self.sig_ident(i + 1).is_some() => {
                let end = match self.sig_is(i + 1, "{").or_else(|| self.find_from(i, "{")) {
                    Some(open) => self.skip_balanced(open, "{", "}"),
                    None => toks.len(),
                };
                self.drop_range(i, end);
                Ok(end)
            }
            "type" if self.at_statement_start() && self.is_type_alias(i) => {
                let end = self.type_alias_end(i);
                self.drop_range(i, end);
                Ok(end)
            }
            "declare" if self.at_statement_start() => {
                let end = self.statement_end(i);
                self.drop_range(i, end);
                Ok(end)
            }
            "function" | "fn" => {
                self.replace("fn");
                Ok(self.fn_signature(i + 1))
            }
            "async" if self.sig_is(i + 1, "function").is_some() => {
                let next = self.next_sig(i + 1).unwrap_or(toks.len());
                self.drop_range(i, next);
                Ok(next)
            }
            "await" | "new" => {
                let next = self.next_sig(i + 1).unwrap_or(toks.len());
                self.drop_range(i, next);
                Ok(next)
            }
            "null" | "undefined" => {
                self.replace("()");
                Ok(i + 1)
            }
            "var" => {
                self.replace("let");
                Ok(self.declaration(i + 1))
            }
            "let" | "const" => {
                self.emit_tok(i);
                Ok(self.declaration(i + 1))
            }
            "as" => {
                let end = self.skip_type(i + 1);
                self.drop_range(i, end);
                Ok(end)
            }
            "catch" => {
                self.emit_tok(i);
                match self.sig_is(i + 1, "(") {
                    Some(open) => {
                        self.emit_range(i + 1, open + 1);
                        Ok(self.params(open + 1))
                    }
                    None => Ok(i + 1),
                }
            }
            "for" => Ok(self.for_of(i)),
            "globalThis" => self.binding(i, i + 1),
            ns if self.is_namespace_call(ns, i) => {
                self.emit_tok(i);
                self.replace("::");
                Ok(i + 2)
            }
            _ => {
                self.emit_tok(i);
                Ok(i + 1)
            }
        }
    }

    /// `ns` directly followed by `.` and one of its members.
    fn is_namespace_call(&self, ns: &str, i: usize) -> bool {
        let Some((_, members)) = NAMESPACES.iter().find(|(name, _)| *name == ns) else {
            return false;
        };
        let dot = self.toks.get(i + 1).is_some_and(|t| t.is("."));
        let member = self.toks.get(i + 2).is_some_and(|t| members.contains(&t.text.as_str()));
        dot && member
    }

    fn find_from(&self, from: usize, text: &str) -> Option<usize> {
        (from..self.toks.len()).find(|&k| self.toks[k].is(text))
    }

    /// Index past the `;` ending the statement at `from`, ignoring nested groups.
    fn statement_end(&self, from: usize) -> usize {
        let mut depth = 0i32;
        for k in from..self.toks.len() {
            let tok = &self.toks[k];
            match tok.text.as_str() {
                "{" | "(" | "[" if tok.kind == Kind::Punct => depth += 1,
                "}" | ")" | "]" if tok.kind == Kind::Punct => depth -= 1,
                ";" if depth <= 0 => return k + 1,
                _ => {}
            }
        }
        self.toks.len()
    }

    fn is_type_alias(&self, i: usize) -> bool {
        self.sig_ident(i + 1)
            .and_then(|name| self.next_sig(name + 1))
            .is_some_and(|k| self.toks[k].is("=") || self.toks[k].is("<"))
    }

    /// `type X = ...;` ends at a top-level `;`, or at a top-level newline when the
    /// alias is not obviously continued on the next line.
    fn type_alias_end(&self, from: usize) -> usize {
        let mut depth = 0i32;
        let mut last: Option<&str> = None;
        for k in from..self.toks.len() {
            let tok = &self.toks[k];
            if tok.kind == Kind::Space && tok.text.contains('\n') && depth <= 0 {
                if !matches!(last, Some("=" | "|" | "&" | "," | "<" | "=>")) {
                    return k;
                }
                continue;
            }
            if tok.is_trivia() {
                continue;
            }
            match tok.text.as_str() {
                "{" | "(" | "[" | "<" if tok.kind == Kind::Punct => depth += 1,
                "}" | ")" | "]" | ">" if tok.kind == Kind::Punct => depth -= 1,
                ";" if depth <= 0 => return k + 1,
                _ => {}
            }
            last = Some(tok.text.as_str());
        }
        self.toks.len()
    }

    fn import(&mut self, i: usize) -> Result<usize, ValidationError> {
        let toks = self.toks;
        let line = toks[i].line;
        let Some(path_idx) = (i + 1..toks.len()).find(|&k| toks[k].kind == Kind::Str) else {
            return Err(ValidationError::Syntax(format!("import on line {line} has no module specifier")));
        };
        let raw = &toks[path_idx].text;
        let specifier = raw[1..raw.len() - 1].to_string();

        if specifier.starts_with("./") || specifier.starts_with("../") {
            self.warnings.push(format!(
                "import of `{specifier}` on line {line} was removed; plugins are loaded as a single file"
            ));
        } else if specifier != BUILTIN_MODULE && !specifier.starts_with("scanhost:") {
            return Err(ValidationError::UnsupportedImport { specifier, line });
        }

        let end = match self.sig_is(path_idx + 1, ";") {
            Some(semi) => semi + 1,
            None => path_idx + 1,
        };
        self.drop_range(i, end);
        Ok(end)
    }

    fn export(&mut self, i: usize) -> usize {
        let toks = self.toks;
        let Some(next) = self.next_sig(i + 1) else {
            self.drop_range(i, toks.len());
            return toks.len();
        };
        let tok = &toks[next];
        if tok.is("default") {
            let after = self.next_sig(next + 1).unwrap_or(toks.len());
            self.drop_range(i, after);
            after
        } else if tok.is("{") || tok.is("*") {
            let end = self.statement_end(next);
            self.drop_range(i, end);
            end
        } else {
            self.drop_range(i, next);
            next
        }
    }

    /// After `let`/`const`: name, then an optional `?: Type` that gets dropped.
    fn declaration(&mut self, from: usize) -> usize {
        let Some(name) = self.sig_ident(from) else {
            return from;
        };
        self.emit_range(from, name + 1);
        let mut j = name + 1;
        if let Some(q) = self.sig_is(j, "?") {
            self.drop_range(j, q + 1);
            j = q + 1;
        }
        if let Some(colon) = self.sig_is(j, ":") {
            let end = self.skip_type(colon + 1);
            self.drop_range(j, end);
            j = end;
        }
        j
    }

    /// After `fn`: name, optional generics, typed parameter list, optional return type.
    fn fn_signature(&mut self, from: usize) -> usize {
        let mut j = from;
        if let Some(name) = self.sig_ident(j) {
            self.emit_range(j, name + 1);
            j = name + 1;
        }
        if let Some(lt) = self.sig_is(j, "<") {
            let end = self.skip_balanced(lt, "<", ">");
            self.drop_range(j, end);
            j = end;
        }
        let Some(open) = self.sig_is(j, "(") else {
            return j;
        };
        self.emit_range(j, open + 1);
        j = self.params(open + 1);

        let ret = self.sig_is(j, ":").or_else(|| self.sig_is(j, "->"));
        if let Some(colon) = ret {
            let end = self.skip_type(colon + 1);
            self.drop_range(j, end);
            j = end;
        }
        j
    }

    /// Parameter list up to and including the closing `)`, with annotations removed.
    fn params(&mut self, from: usize) -> usize {
        let toks = self.toks;
        let mut j = from;
        let mut depth = 0usize;
        while let Some(k) = self.next_sig(j) {
            self.emit_range(j, k);
            let tok = &toks[k];
            if tok.is(")") && depth == 0 {
                self.emit_tok(k);
                return k + 1;
            }
            if tok.is("(") || tok.is("[") || tok.is("{") {
                depth += 1;
            } else if tok.is(")") || tok.is("]") || tok.is("}") {
                depth = depth.saturating_sub(1);
            }
            self.emit_tok(k);
            j = k + 1;

            if tok.kind == Kind::Ident && depth == 0 {
                if let Some(q) = self.sig_is(j, "?") {
                    self.drop_range(j, q + 1);
                    j = q + 1;
                }
                if let Some(colon) = self.sig_is(j, ":") {
                    let end = self.skip_type(colon + 1);
                    self.drop_range(j, end);
                    j = end;
                }
            }
        }
        toks.len()
    }

    /// `for (const x of xs)` -> `for x in xs`
    fn for_of(&mut self, i: usize) -> usize {
        let shape = self.sig_is(i + 1, "(").and_then(|open| {
            let decl = self.next_sig(open + 1)?;
            if !["const", "let", "var"].iter().any(|d| self.toks[decl].is(d)) {
                return None;
            }
            let name = self.sig_ident(decl + 1)?;
            let of = self.sig_is(name + 1, "of")?;
            Some((open, name, of))
        });

        let Some((open, name, of)) = shape else {
            self.emit_tok(i);
            return i + 1;
        };
        let close = self.skip_balanced(open, "(", ")");
        if close > 0 && close <= self.toks.len() {
            self.skip_close.insert(close - 1);
        }
        self.emit_tok(i);
        self.emit(" ");
        self.drop_range(i + 1, name);
        self.emit_tok(name);
        self.replace(" in");
        self.drop_range(name + 1, of + 1);
        of + 1
    }

    /// `globalThis.<entry> = <function>;` starting at `start`; `after_target` is
    /// the index just past `globalThis` (or past `(globalThis as T)`).
    fn binding(&mut self, start: usize, after_target: usize) -> Result<usize, ValidationError> {
        let line = self.toks[start].line;
        let target = self
            .sig_is(after_target, ".")
            .and_then(|dot| self.sig_ident(dot + 1))
            .and_then(|name| self.sig_is(name + 1, "=").map(|eq| (name, eq)));

        let Some((name_idx, eq)) = target else {
            // plain read of the global object, left for the runtime to reject
            self.emit_range(start, after_target);
            return Ok(after_target);
        };

        let function = self.sig_ident(eq + 1).filter(|&f| {
            match self.next_sig(f + 1) {
                None => true,
                Some(k) => {
                    let t = &self.toks[k];
                    t.is(";") || t.is("}") || t.line > self.toks[f].line
                }
            }
        });
        let Some(fn_idx) = function else {
            return Err(ValidationError::InvalidGlobalBinding { line });
        };

        let entry_name = self.toks[name_idx].text.clone();
        let function = self.toks[fn_idx].text.clone();
        if let Some(kind) = entry_for(&entry_name) {
            self.bindings.insert(kind, function);
        } else if ANALYZE_ALIASES.contains(&entry_name.as_str()) {
            self.aliases.push((entry_name, function));
        } else {
            self.warnings.push(format!("global binding `{entry_name}` on line {line} is not an entry point and was ignored"));
        }

        let end = match self.sig_is(fn_idx + 1, ";") {
            Some(semi) => semi + 1,
            None => fn_idx + 1,
        };
        self.drop_range(start, end);
        Ok(end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P1: &str = r#"
import { Finding } from "scanhost";

interface Ctx {
    url: string;
    method?: string;
}

export function scan_request(ctx: Ctx): void {
    emitFinding({
        title: "t",
        description: 'd',
        severity: "high",
        vuln_type: "xss",
        confidence: "medium",
    });
}

globalThis.scan_request = scan_request;
"#;

    #[test]
    fn typed_plugin_normalizes_to_rhai() {
        let script = normalize(P1).unwrap();
        assert_eq!(script.entry_points(), vec![EntryKind::ScanRequest]);
        assert_eq!(script.function_for(EntryKind::ScanRequest), Some("scan_request"));
        assert!(script.body.contains("fn scan_request(ctx)"));
        assert!(script.body.contains("emitFinding(#{"));
        assert!(script.body.contains("description: \"d\""));
        assert!(!script.body.contains("interface"));
        assert!(!script.body.contains("globalThis"));
        assert!(script.warnings.is_empty());
        // line structure is preserved
        assert_eq!(script.body.lines().count(), P1.lines().count());
    }

    #[test]
    fn missing_binding_is_rejected() {
        let src = "function scan_request(ctx) { }";
        assert_eq!(normalize(src).unwrap_err(), ValidationError::MissingEntryPoint);
    }

    #[test]
    fn binding_to_undefined_function_is_rejected() {
        let src = "function helper(a, b) { a + b }\nglobalThis.analyze = helper;\n";
        assert_eq!(
            normalize(src).unwrap_err(),
            ValidationError::UndefinedEntryPoint { entry: EntryKind::Analyze, function: "helper".into() }
        );

        let src = "globalThis.analyze = nothing_here;";
        assert!(matches!(normalize(src).unwrap_err(), ValidationError::UndefinedEntryPoint { .. }));
    }

    #[test]
    fn external_imports_are_unsupported() {
        let src = "import axios from 'axios';\nfunction analyze(x) { x }\nglobalThis.analyze = analyze;";
        assert_eq!(
            normalize(src).unwrap_err(),
            ValidationError::UnsupportedImport { specifier: "axios".into(), line: 1 }
        );
    }

    #[test]
    fn relative_imports_are_dropped_with_a_warning() {
        let src = "import { helper } from \"./util.ts\";\nfunction analyze(x) { x }\nglobalThis.analyze = analyze;";
        let script = normalize(src).unwrap();
        assert_eq!(script.warnings.len(), 1);
        assert!(script.warnings[0].contains("./util.ts"));
    }

    #[test]
    fn syntax_errors_are_reported() {
        let src = "function scan_request(ctx) { let x = ; }\nglobalThis.scan_request = scan_request;";
        assert!(matches!(normalize(src).unwrap_err(), ValidationError::Syntax(_)));
    }

    #[test]
    fn unterminated_string_is_reported_with_line() {
        let src = "\nlet s = \"open;\nglobalThis.analyze = analyze;";
        assert_eq!(
            normalize(src).unwrap_err(),
            ValidationError::Unterminated { what: "string literal", line: 2 }
        );
    }

    #[test]
    fn binding_must_name_a_function() {
        let src = "globalThis.scan_request = function (ctx) { };";
        assert_eq!(normalize(src).unwrap_err(), ValidationError::InvalidGlobalBinding { line: 1 });
    }

    #[test]
    fn cast_binding_and_run_alias() {
        let src = r#"
async function run(input: any): Promise<string> {
    const name: string = input.name as string;
    return `hello ${name}`;
}
(globalThis as any).run = run;
"#;
        let script = normalize(src).unwrap();
        assert_eq!(script.function_for(EntryKind::Analyze), Some("run"));
        assert!(script.body.contains("fn run(input)"));
        assert!(script.body.contains("const name = input.name"));
    }

    #[test]
    fn explicit_analyze_wins_over_alias() {
        let src = "fn a(x) { 1 }\nfn b(x) { 2 }\nglobalThis.execute = a;\nglobalThis.analyze = b;";
        let script = normalize(src).unwrap();
        assert_eq!(script.function_for(EntryKind::Analyze), Some("b"));
    }

    #[test]
    fn js_surface_is_rewritten() {
        let src = r#"
type Headers = { [k: string]: string };
function scan_response(ctx) {
    var hits = [];
    for (const h of ctx.headers) {
        if (h.toLowerCase().includes("x-powered-by") && ctx.body !== null) {
            hits.push(h);
        }
    }
    console.log("hits", hits.length);
    if (hits.length === 0) { throw new Error("none"); }
}
export { scan_response };
globalThis.scan_response = scan_response;
"#;
        let script = normalize(src).unwrap();
        let body = &script.body;
        assert!(body.contains("let hits = [];"));
        assert!(body.contains("for h in ctx.headers {"));
        assert!(body.contains("h.to_lower().contains(\"x-powered-by\")"));
        assert!(body.contains("ctx.body != ()"));
        assert!(body.contains("console::log(\"hits\", hits.len())"));
        assert!(body.contains("throw Error(\"none\")"));
        assert!(!body.contains("type Headers"));
        assert!(!body.contains("export"));
    }

    #[test]
    fn security_scan_ignores_strings_and_comments() {
        let report = security_scan("// eval(x) is bad\nlet s = \"process.env\";\nfn analyze(x) { x }");
        assert!(report.passed());

        let report = security_scan("fn analyze(x) { eval(\"1\"); Deno.readFile(\"/etc/passwd\") }");
        assert!(!report.passed());
        assert_eq!(report.errors.len(), 2);

        let report = security_scan("fn analyze(x) { x.__proto__ }");
        assert!(report.passed());
        assert_eq!(report.warnings.len(), 1);
    }
}
