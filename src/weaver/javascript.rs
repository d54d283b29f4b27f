//! JavaScript weaving
//!
//! Call hooks (`__grader.enter`/`leave`/`construct`) and loop probes are
//! inserted at token positions; the hooked program then travels, together
//! with the untouched text, inside a Node prelude that provides `__grader`,
//! compiles the hooked text (falling back to the original when it does not
//! parse) and writes the trace on exit. Web submissions additionally get a
//! recording DOM seeded with the elements of their markup.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use super::scan::{self, Edit, ScanError, Syntax, Token, TokenKind};
use super::{quoted, render, sentinel_values, InstrumentationConfig, SourceUnit, Weaver, WovenUnit};

const PRELUDE: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/files/instrument/js_prelude.js"
));

/// Words that look like a call head but never name a function
const NOT_FUNCTION_NAMES: &[&str] = &[
    "if", "for", "while", "switch", "catch", "with", "return", "typeof", "function", "do", "else",
    "new", "delete", "void", "await", "yield", "in", "of", "instanceof", "throw", "case", "super",
];

/// Words that continue an expression onto the next line
const INFIX_WORDS: &[&str] = &["in", "of", "instanceof"];

/// Tags that never appear in the recording DOM
const SKIPPED_TAGS: &[&str] = &[
    "html", "head", "body", "meta", "link", "title", "script", "style", "base", "noscript",
];

/// Tags without a closing counterpart
const VOID_TAGS: &[&str] = &[
    "area", "br", "col", "embed", "hr", "img", "input", "source", "track", "wbr",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct JavaScriptWeaver {
    /// Run against a recording DOM built from the submission's markup
    pub web: bool,
}

/// Element of the submission's markup, as seeded into the recording DOM
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeedElement {
    pub tag: String,
    pub id: String,
    pub classes: Vec<String>,
    pub text: String,
    /// Index of the enclosing seeded element
    pub parent: Option<usize>,
}

#[derive(Serialize)]
struct Payload<'a> {
    instrumented: &'a str,
    original: &'a str,
    config: &'a InstrumentationConfig,
    web: bool,
    elements: &'a [SeedElement],
}

impl Weaver for JavaScriptWeaver {
    fn weave(&self, unit: &SourceUnit, config: &InstrumentationConfig) -> WovenUnit {
        let (program, elements) = match unit {
            SourceUnit::Web {
                html, javascript, ..
            } if self.web => {
                let markup = parse_markup(html);
                let mut program = markup.scripts.join("\n");
                if !program.is_empty() && !javascript.is_empty() {
                    program.push('\n');
                }
                program.push_str(javascript);
                (program, markup.elements)
            }
            other => (other.program().to_string(), Vec::new()),
        };

        let mut warnings = Vec::new();
        let instrumented = match instrument(&program, config) {
            Ok(text) => text,
            Err(e) => {
                warnings.push(format!("instrumentation skipped, could not scan source: {}", e));
                program.clone()
            }
        };

        let payload = Payload {
            instrumented: &instrumented,
            original: &program,
            config,
            web: self.web,
            elements: &elements,
        };
        let literal = serde_json::to_string(&payload)
            .and_then(|json| serde_json::to_string(&json));
        let literal = match literal {
            Ok(literal) => literal,
            Err(e) => {
                let mut woven = WovenUnit::new(program);
                woven
                    .warnings
                    .push(format!("instrumentation skipped, payload encoding failed: {}", e));
                return woven;
            }
        };

        let [begin, end] = sentinel_values();
        let mut woven = WovenUnit::new(render(PRELUDE, &[("PAYLOAD", literal.as_str()), begin, end]));
        woven.warnings = warnings;
        woven
    }
}

/// Inline scripts and element skeleton of an HTML document
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Markup {
    pub scripts: Vec<String>,
    pub elements: Vec<SeedElement>,
}

fn pattern(cell: &'static OnceLock<Regex>, source: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(source).expect("static pattern compiles"))
}

fn attribute(attrs: &str, name: &str) -> Option<String> {
    static ID: OnceLock<Regex> = OnceLock::new();
    static CLASS: OnceLock<Regex> = OnceLock::new();
    let re = match name {
        "id" => pattern(&ID, r#"(?i)(?:^|\s)id\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#),
        _ => pattern(&CLASS, r#"(?i)(?:^|\s)class\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#),
    };
    let caps = re.captures(attrs)?;
    (1..=3)
        .find_map(|group| caps.get(group))
        .map(|m| m.as_str().to_string())
}

/// Pull inline scripts and the element tree out of `html`
pub fn parse_markup(html: &str) -> Markup {
    static SCRIPT: OnceLock<Regex> = OnceLock::new();
    static SRC: OnceLock<Regex> = OnceLock::new();
    static STRIP: OnceLock<Regex> = OnceLock::new();
    static TAG: OnceLock<Regex> = OnceLock::new();

    let script = pattern(&SCRIPT, r"(?is)<script\b([^>]*)>(.*?)</script\s*>");
    let src = pattern(&SRC, r"(?i)(?:^|\s)src\s*=");
    let mut markup = Markup::default();

    for caps in script.captures_iter(html) {
        let attrs = caps.get(1).map_or("", |m| m.as_str());
        let body = caps.get(2).map_or("", |m| m.as_str());
        if !src.is_match(attrs) && !body.trim().is_empty() {
            markup.scripts.push(body.to_string());
        }
    }

    let stripped = pattern(&STRIP, r"(?is)<!--.*?-->|<script\b.*?</script\s*>|<style\b.*?</style\s*>")
        .replace_all(html, "");
    let tag = pattern(&TAG, r"<(/?)([a-zA-Z][a-zA-Z0-9-]*)([^>]*)>");

    let mut open: Vec<(String, usize)> = Vec::new();
    for caps in tag.captures_iter(&stripped) {
        let closing = caps.get(1).is_some_and(|m| !m.as_str().is_empty());
        let name = caps[2].to_ascii_lowercase();
        if SKIPPED_TAGS.contains(&name.as_str()) {
            continue;
        }
        if closing {
            if let Some(pos) = open.iter().rposition(|(tag, _)| *tag == name) {
                open.truncate(pos);
            }
            continue;
        }

        let attrs = caps.get(3).map_or("", |m| m.as_str());
        let after = caps.get(0).map_or(stripped.len(), |m| m.end());
        let text = stripped[after..]
            .split('<')
            .next()
            .unwrap_or("")
            .trim()
            .to_string();

        let index = markup.elements.len();
        markup.elements.push(SeedElement {
            tag: name.clone(),
            id: attribute(attrs, "id").unwrap_or_default(),
            classes: attribute(attrs, "class")
                .map(|value| value.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            text,
            parent: open.last().map(|(_, idx)| *idx),
        });

        let self_closing = attrs.trim_end().ends_with('/');
        if !self_closing && !VOID_TAGS.contains(&name.as_str()) {
            open.push((name, index));
        }
    }

    markup
}

/// Hook edits, ordered so that at one offset openings come before closings
/// and inner closings before outer ones
#[derive(Default)]
struct Hooks {
    items: Vec<(Edit, u8, Reverse<usize>)>,
}

impl Hooks {
    fn open(&mut self, at: usize, text: String) {
        self.items.push((Edit::insert(at, text), 0, Reverse(0)));
    }

    fn close(&mut self, at: usize, depth: usize, text: String) {
        self.items.push((Edit::insert(at, text), 1, Reverse(depth)));
    }

    fn into_edits(mut self) -> Vec<Edit> {
        self.items
            .sort_by_key(|(edit, phase, depth)| (edit.at, *phase, *depth));
        self.items.into_iter().map(|(edit, _, _)| edit).collect()
    }
}

struct ClassInfo {
    name: String,
    derived: bool,
    has_constructor: bool,
}

struct Context<'s, 't> {
    source: &'s str,
    tokens: &'t [Token<'s>],
    partners: Vec<Option<usize>>,
    enclosing: Vec<Option<usize>>,
    depth: Vec<usize>,
    classes: HashMap<usize, ClassInfo>,
    do_tails: HashSet<usize>,
    hooks: Hooks,
}

/// Insert call hooks and loop probes into a JavaScript program
pub fn instrument(source: &str, config: &InstrumentationConfig) -> Result<String, ScanError> {
    let call_hooks = config.needs_call_hooks();
    if !call_hooks && !config.monitor_loops {
        return Ok(source.to_string());
    }

    let tokens = scan::tokenize(source, Syntax::JavaScript)?;
    let partners = scan::pair_delimiters(&tokens)?;
    let enclosing = scan::enclosing_braces(&tokens);

    let mut depth = Vec::with_capacity(tokens.len());
    let mut level = 0usize;
    for token in &tokens {
        if token.is_punct("}") {
            level = level.saturating_sub(1);
        }
        depth.push(level);
        if token.is_punct("{") {
            level += 1;
        }
    }

    let mut cx = Context {
        source,
        tokens: &tokens,
        partners,
        enclosing,
        depth,
        classes: HashMap::new(),
        do_tails: HashSet::new(),
        hooks: Hooks::default(),
    };
    cx.find_classes();
    cx.find_do_tails();

    if config.monitor_class_instantiations {
        cx.synthesize_constructors();
    }
    for idx in 0..tokens.len() {
        let token = &tokens[idx];
        match token.kind {
            TokenKind::Ident => match token.text {
                "function" if call_hooks => cx.function_keyword(idx),
                "for" | "while" | "do" if config.monitor_loops => cx.loop_probe(idx),
                _ if call_hooks => cx.method(idx, config.monitor_class_instantiations),
                _ => {}
            },
            TokenKind::Punct if token.text == "=>" && call_hooks => cx.arrow(idx),
            _ => {}
        }
    }

    Ok(scan::apply_edits(source, cx.hooks.into_edits()))
}

impl<'s> Context<'s, '_> {
    fn punct(&self, idx: usize, text: &str) -> bool {
        self.tokens.get(idx).is_some_and(|t| t.is_punct(text))
    }

    fn ident_at(&self, idx: usize) -> Option<&'s str> {
        self.tokens
            .get(idx)
            .filter(|t| t.kind == TokenKind::Ident)
            .map(|t| t.text)
    }

    /// Name a function expression gets from `name = ...` or `name: ...`
    fn context_name(&self, idx: usize) -> Option<&'s str> {
        let mut k = idx.checked_sub(1)?;
        if self.tokens[k].is_ident("async") {
            k = k.checked_sub(1)?;
        }
        if !(self.tokens[k].is_punct("=") || self.tokens[k].is_punct(":")) {
            return None;
        }
        self.ident_at(k.checked_sub(1)?)
    }

    fn is_object_literal(&self, brace: usize) -> bool {
        let Some(prev) = brace.checked_sub(1).map(|p| &self.tokens[p]) else {
            return false;
        };
        match prev.kind {
            TokenKind::Punct => matches!(prev.text, "=" | "(" | "," | ":" | "[" | "?" | "|" | "&"),
            TokenKind::Ident => prev.text == "return",
            _ => false,
        }
    }

    fn find_classes(&mut self) {
        for idx in 0..self.tokens.len() {
            if !self.tokens[idx].is_ident("class") || (idx > 0 && self.punct(idx - 1, ".")) {
                continue;
            }
            let mut j = idx + 1;
            let declared = self.ident_at(j).filter(|name| *name != "extends");
            if declared.is_some() {
                j += 1;
            }
            let derived = self.tokens.get(j).is_some_and(|t| t.is_ident("extends"));

            let mut body = None;
            while j < self.tokens.len() {
                let token = &self.tokens[j];
                if token.is_punct("{") {
                    body = Some(j);
                    break;
                }
                if token.is_punct(";") {
                    break;
                }
                j = match (token.is_punct("(") || token.is_punct("["), self.partners[j]) {
                    (true, Some(close)) => close + 1,
                    _ => j + 1,
                };
            }
            let Some(body) = body else { continue };

            let name = declared
                .or_else(|| self.context_name(idx))
                .unwrap_or("anonymous")
                .to_string();
            let has_constructor = (body + 1..self.partners[body].unwrap_or(body))
                .any(|k| {
                    self.enclosing[k] == Some(body)
                        && self.tokens[k].is_ident("constructor")
                        && self.punct(k + 1, "(")
                });
            self.classes.insert(
                body,
                ClassInfo {
                    name,
                    derived,
                    has_constructor,
                },
            );
        }
    }

    /// `while` tokens that end a do-while rather than start a loop
    fn find_do_tails(&mut self) {
        for idx in 0..self.tokens.len() {
            if !self.tokens[idx].is_ident("do") {
                continue;
            }
            let tail = if self.punct(idx + 1, "{") {
                self.partners[idx + 1].map(|close| close + 1)
            } else {
                let mut j = idx + 1;
                let mut found = None;
                while j < self.tokens.len() {
                    if self.tokens[j].is_punct(";") {
                        found = Some(j + 1);
                        break;
                    }
                    let opens = matches!(self.tokens[j].text, "(" | "[" | "{")
                        && self.tokens[j].kind == TokenKind::Punct;
                    j = match (opens, self.partners[j]) {
                        (true, Some(close)) => close + 1,
                        _ => j + 1,
                    };
                }
                found
            };
            if let Some(tail) = tail.filter(|&t| self.tokens.get(t).is_some_and(|t| t.is_ident("while"))) {
                self.do_tails.insert(tail);
            }
        }
    }

    fn synthesize_constructors(&mut self) {
        let mut added = Vec::new();
        for (&body, class) in &self.classes {
            if class.has_constructor {
                continue;
            }
            let name = quoted(&class.name);
            let text = if class.derived {
                format!("constructor(...args){{super(...args);__grader.construct({});}}", name)
            } else {
                format!("constructor(){{__grader.construct({});}}", name)
            };
            added.push((self.tokens[body].end, text));
        }
        for (at, text) in added {
            self.hooks.open(at, text);
        }
    }

    fn hook_block(&mut self, name: &str, body: usize) {
        let Some(close) = self.partners[body] else {
            return;
        };
        let name = quoted(name);
        self.hooks.open(
            self.tokens[body].end,
            format!("__grader.enter({});try{{", name),
        );
        self.hooks.close(
            self.tokens[close].start,
            self.depth[body] + 1,
            format!("}}finally{{__grader.leave({});}}", name),
        );
    }

    fn function_keyword(&mut self, idx: usize) {
        let mut j = idx + 1;
        if self.punct(j, "*") {
            j += 1;
        }
        let declared = self.ident_at(j);
        if declared.is_some() {
            j += 1;
        }
        if !self.punct(j, "(") {
            return;
        }
        let Some(close) = self.partners[j] else {
            return;
        };
        if !self.punct(close + 1, "{") {
            return;
        }
        if let Some(name) = declared.or_else(|| self.context_name(idx)) {
            self.hook_block(name, close + 1);
        }
    }

    /// Method shorthand in a class body or object literal
    fn method(&mut self, idx: usize, count_constructors: bool) {
        let name = self.tokens[idx].text;
        if NOT_FUNCTION_NAMES.contains(&name) || !self.punct(idx + 1, "(") {
            return;
        }
        let Some(close) = self.partners[idx + 1] else {
            return;
        };
        let body = close + 1;
        if !self.punct(body, "{") {
            return;
        }
        let Some(owner) = self.enclosing[idx] else {
            return;
        };
        let in_class = self.classes.contains_key(&owner);
        if !in_class && !self.is_object_literal(owner) {
            return;
        }

        let mut k = idx;
        while let Some(prev) = k.checked_sub(1) {
            let token = &self.tokens[prev];
            let modifier = matches!(token.text, "async" | "get" | "set" | "static")
                && token.kind == TokenKind::Ident
                || token.is_punct("*");
            if !modifier {
                break;
            }
            k = prev;
        }
        let Some(prev) = k.checked_sub(1).map(|p| &self.tokens[p]) else {
            return;
        };
        if !(prev.kind == TokenKind::Punct && matches!(prev.text, "{" | "}" | ";" | ",")) {
            return;
        }

        if name == "constructor" && in_class {
            if count_constructors {
                if let Some(class) = self.classes.get(&owner) {
                    let text = format!("__grader.construct({});", quoted(&class.name));
                    self.hooks.open(self.tokens[body].end, text);
                }
            }
            return;
        }
        self.hook_block(name, body);
    }

    fn arrow(&mut self, idx: usize) {
        let Some(mut k) = idx.checked_sub(1) else {
            return;
        };
        if self.tokens[k].is_punct(")") {
            match self.partners[k] {
                Some(open) => k = open,
                None => return,
            }
        } else if self.tokens[k].kind != TokenKind::Ident {
            return;
        }
        let Some(name) = self.context_name(k) else {
            return;
        };

        if self.punct(idx + 1, "{") {
            self.hook_block(name, idx + 1);
        } else if let Some(last) = self.expression_end(idx + 1) {
            let name = quoted(name);
            self.hooks.open(
                self.tokens[idx].end,
                format!("{{__grader.enter({});try{{return (", name),
            );
            self.hooks.close(
                self.tokens[last].end,
                self.depth[idx] + 1,
                format!(");}}finally{{__grader.leave({});}}}}", name),
            );
        }
    }

    /// Index of the last token of the expression starting at `start`
    fn expression_end(&self, start: usize) -> Option<usize> {
        let mut last: Option<usize> = None;
        let mut j = start;
        while j < self.tokens.len() {
            let token = &self.tokens[j];
            if token.kind == TokenKind::Punct && matches!(token.text, "," | ";" | ")" | "]" | "}") {
                break;
            }
            if let Some(prev) = last {
                if self.source[self.tokens[prev].end..token.start].contains('\n')
                    && ends_expression(&self.tokens[prev])
                    && begins_statement(token)
                {
                    break;
                }
            }
            if token.kind == TokenKind::Punct && matches!(token.text, "(" | "[" | "{") {
                let close = self.partners[j]?;
                last = Some(close);
                j = close + 1;
            } else {
                last = Some(j);
                j += 1;
            }
        }
        last
    }

    fn loop_probe(&mut self, idx: usize) {
        let keyword = self.tokens[idx].text;
        let Some(next) = self.tokens.get(idx + 1) else {
            return;
        };
        let starts_loop = match keyword {
            "do" => !(next.kind == TokenKind::Punct
                && matches!(next.text, ":" | "," | "(" | ")" | "}" | "=" | ".")),
            "for" => next.is_punct("(") || next.is_ident("await"),
            _ => next.is_punct("("),
        };
        if !starts_loop || self.do_tails.contains(&idx) {
            return;
        }
        if let Some(owner) = self.enclosing[idx] {
            if self.classes.contains_key(&owner) || self.is_object_literal(owner) {
                return;
            }
        }

        let at = if scan::at_statement_start(self.tokens, idx) {
            self.tokens[idx].start
        } else if idx >= 1 && self.punct(idx - 1, ":") {
            let label = idx
                .checked_sub(2)
                .filter(|&l| {
                    self.tokens[l].kind == TokenKind::Ident
                        && !self.tokens[l].is_ident("default")
                        && scan::at_statement_start(self.tokens, l)
                });
            match label {
                Some(l) => self.tokens[l].start,
                None => self.tokens[idx].start,
            }
        } else {
            return;
        };

        let kind = match keyword {
            "do" => "do_while",
            other => other,
        };
        self.hooks.open(at, format!("__grader.loop({});", quoted(kind)));
    }
}

fn ends_expression(token: &Token<'_>) -> bool {
    match token.kind {
        TokenKind::Literal => true,
        TokenKind::Ident => !INFIX_WORDS.contains(&token.text) && !NOT_FUNCTION_NAMES.contains(&token.text),
        TokenKind::Punct => matches!(token.text, ")" | "]" | "}"),
        TokenKind::Lifetime => false,
    }
}

fn begins_statement(token: &Token<'_>) -> bool {
    match token.kind {
        TokenKind::Ident => !INFIX_WORDS.contains(&token.text),
        // a template literal after a newline is still a tagged call
        TokenKind::Literal => !token.text.starts_with('`'),
        _ => false,
    }
}
