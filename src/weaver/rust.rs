//! Rust weaving
//!
//! Functions open with a frame guard, `new` in an `impl` block counts an
//! instantiation of the implementing type and loop statements get a probe.
//! The learner's `main` is renamed and called from a wrapper that installs
//! the panic hook and `atexit` emitter, then reports the trace.

use std::collections::HashSet;

use super::scan::{self, Edit, Syntax, Token, TokenKind};
use super::{quoted, render, sentinel_values, InstrumentationConfig, SourceUnit, Weaver, WovenUnit};

const RUNTIME: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/files/instrument/rust_runtime.rs"
));

const USER_MAIN: &str = "grader_rt_user_main";

const MAIN_WRAPPER: &str = "
fn main() -> std::process::ExitCode {
    grader_rt::install();
    let outcome = std::panic::catch_unwind(|| {
        std::process::Termination::report(grader_rt_user_main())
    });
    grader_rt::emit();
    outcome.unwrap_or(std::process::ExitCode::from(101))
}
";

/// Words allowed between the start of an item and its `fn`
const FN_QUALIFIERS: &[&str] = &["pub", "crate", "async", "unsafe", "extern", "default", "const"];

#[derive(Debug, Clone, Copy, Default)]
pub struct RustWeaver;

impl Weaver for RustWeaver {
    fn weave(&self, unit: &SourceUnit, config: &InstrumentationConfig) -> WovenUnit {
        let source = unit.program();
        let flag = |on: bool| if on { "true" } else { "false" };
        let [begin, end] = sentinel_values();
        let runtime = render(
            RUNTIME,
            &[
                ("COUNT_CALLS", flag(config.monitor_function_calls)),
                ("COUNT_DEPTH", flag(config.monitor_recursion)),
                ("COUNT_LOOPS", flag(config.monitor_loops)),
                ("COUNT_CLASSES", flag(config.monitor_class_instantiations)),
                begin,
                end,
            ],
        );

        let woven = scan::tokenize(source, Syntax::Rust).and_then(|tokens| {
            let partners = scan::pair_delimiters(&tokens)?;
            let cx = Context {
                enclosing: scan::enclosing_braces(&tokens),
                partners,
                tokens: &tokens,
            };
            let main = cx.main_name();
            let assemble = |edits: Vec<Edit>| {
                let mut edits = edits;
                if let Some(main) = main {
                    edits.push(Edit::replace(tokens[main].start, tokens[main].text.len(), USER_MAIN));
                }
                let mut text = scan::apply_edits(source, edits);
                text.push('\n');
                text.push_str(&runtime);
                if main.is_some() {
                    text.push_str(MAIN_WRAPPER);
                }
                text
            };
            let hooked = assemble(cx.hooks(config));
            let plain = assemble(Vec::new());
            Ok((hooked, plain, main.is_some()))
        });

        match woven {
            Ok((hooked, plain, has_main)) => {
                let mut woven = if hooked != plain {
                    WovenUnit {
                        source: hooked,
                        fallback: Some(plain),
                        warnings: Vec::new(),
                    }
                } else {
                    WovenUnit::new(plain)
                };
                if !has_main {
                    woven
                        .warnings
                        .push("no top-level `fn main` found, trace is emitted only on process::exit".to_string());
                }
                woven
            }
            Err(e) => {
                let mut woven = WovenUnit::new(source.to_string());
                woven
                    .warnings
                    .push(format!("instrumentation skipped, could not scan source: {}", e));
                woven
            }
        }
    }
}

struct Context<'s, 't> {
    tokens: &'t [Token<'s>],
    partners: Vec<Option<usize>>,
    enclosing: Vec<Option<usize>>,
}

struct FnItem<'s> {
    name: usize,
    body: usize,
    is_const: bool,
    owner: Option<&'s str>,
}

impl<'s> Context<'s, '_> {
    /// Index of the name token of the crate-level `fn main`
    fn main_name(&self) -> Option<usize> {
        self.functions()
            .into_iter()
            .find(|item| self.tokens[item.name].text == "main" && self.enclosing[item.name].is_none())
            .map(|item| item.name)
    }

    fn is_const_fn(&self, fn_idx: usize) -> bool {
        let mut k = fn_idx;
        while let Some(prev) = k.checked_sub(1) {
            let token = &self.tokens[prev];
            match token.kind {
                TokenKind::Ident if FN_QUALIFIERS.contains(&token.text) => {
                    if token.text == "const" {
                        return true;
                    }
                    k = prev;
                }
                // extern "C"
                TokenKind::Literal => k = prev,
                // pub(crate)
                TokenKind::Punct if token.text == ")" => match self.partners[prev] {
                    Some(open) => k = open,
                    None => break,
                },
                _ => break,
            }
        }
        false
    }

    /// Implementing type of the `impl` block whose body is `brace`
    fn impl_type(&self, brace: usize) -> Option<&'s str> {
        let mut start = None;
        let mut q = brace.checked_sub(1)?;
        loop {
            let token = &self.tokens[q];
            if token.kind == TokenKind::Punct && matches!(token.text, ";" | "{" | "}") {
                break;
            }
            if token.is_ident("impl") {
                start = Some(q);
                break;
            }
            q = q.checked_sub(1)?;
        }
        let mut idx = start? + 1;

        // generics of the impl itself
        if self.tokens.get(idx).is_some_and(|t| t.is_punct("<")) {
            let mut depth = 0i32;
            while idx < brace {
                let token = &self.tokens[idx];
                if token.is_punct("<") {
                    depth += 1;
                } else if token.is_punct(">") {
                    depth -= 1;
                }
                idx += 1;
                if depth == 0 {
                    break;
                }
            }
        }

        let mut depth = 0i32;
        let mut found = None;
        while idx < brace {
            let token = &self.tokens[idx];
            match token.kind {
                TokenKind::Punct if token.text == "<" => depth += 1,
                TokenKind::Punct if token.text == ">" => depth -= 1,
                TokenKind::Ident if depth == 0 => match token.text {
                    "where" => break,
                    "for" => found = None,
                    "dyn" | "mut" | "const" | "unsafe" => {}
                    name => found = Some(name),
                },
                _ => {}
            }
            idx += 1;
        }
        found
    }

    fn functions(&self) -> Vec<FnItem<'s>> {
        let mut items = Vec::new();
        for (idx, token) in self.tokens.iter().enumerate() {
            if !token.is_ident("fn") {
                continue;
            }
            let name = idx + 1;
            if self.tokens.get(name).map(|t| t.kind) != Some(TokenKind::Ident) {
                continue;
            }

            let mut j = name + 1;
            let mut body = None;
            while j < self.tokens.len() {
                let t = &self.tokens[j];
                if t.is_punct("{") {
                    body = Some(j);
                    break;
                }
                if t.is_punct(";") {
                    break;
                }
                j = match (t.is_punct("(") || t.is_punct("["), self.partners[j]) {
                    (true, Some(close)) => close + 1,
                    _ => j + 1,
                };
            }
            let Some(body) = body else { continue };

            items.push(FnItem {
                name,
                body,
                is_const: self.is_const_fn(idx),
                owner: self.enclosing[idx].and_then(|brace| self.impl_type(brace)),
            });
        }
        items
    }

    fn hooks(&self, config: &InstrumentationConfig) -> Vec<Edit> {
        let mut edits = Vec::new();
        let functions = self.functions();
        let const_bodies: HashSet<usize> = functions
            .iter()
            .filter(|item| item.is_const)
            .map(|item| item.body)
            .collect();

        if config.needs_call_hooks() {
            for item in functions.iter().filter(|item| !item.is_const) {
                let name = self.tokens[item.name].text;
                if name == "main" && self.enclosing[item.name].is_none() {
                    continue;
                }
                let mut text = format!(
                    "let _grader_rt_frame = crate::grader_rt::enter({});",
                    quoted(name)
                );
                if let (Some(owner), "new") = (item.owner, name) {
                    text.push_str(&format!("crate::grader_rt::construct({});", quoted(owner)));
                }
                edits.push(Edit::insert(self.tokens[item.body].end, text));
            }
        }

        if config.monitor_loops {
            for (idx, token) in self.tokens.iter().enumerate() {
                if token.kind != TokenKind::Ident || !matches!(token.text, "for" | "while" | "loop") {
                    continue;
                }
                if self.inside(idx, &const_bodies) {
                    continue;
                }
                let at = if scan::at_statement_start(self.tokens, idx) {
                    token.start
                } else if idx >= 2
                    && self.tokens[idx - 1].is_punct(":")
                    && self.tokens[idx - 2].kind == TokenKind::Lifetime
                    && scan::at_statement_start(self.tokens, idx - 2)
                {
                    self.tokens[idx - 2].start
                } else {
                    continue;
                };
                edits.push(Edit::insert(
                    at,
                    format!("crate::grader_rt::loop_hit({});", quoted(token.text)),
                ));
            }
        }
        edits
    }

    fn inside(&self, idx: usize, bodies: &HashSet<usize>) -> bool {
        let mut outer = self.enclosing[idx];
        while let Some(brace) = outer {
            if bodies.contains(&brace) {
                return true;
            }
            outer = self.enclosing[brace];
        }
        false
    }
}
