//! C and C++ weaving
//!
//! Every function body gets a frame object declared as its first statement
//! (RAII in C++, a `cleanup` attribute in C), constructors count an
//! instantiation and loop statements get a probe in front of them. The
//! runtime header goes on top, followed by `#line 1` so diagnostics still
//! point at the learner's lines, and registers the trace emitter with
//! `atexit` before `main` runs.

use std::collections::HashSet;

use super::scan::{self, Edit, ScanError, Syntax, Token, TokenKind};
use super::{quoted, render, sentinel_values, InstrumentationConfig, SourceUnit, Weaver, WovenUnit};

const C_RUNTIME: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/files/instrument/c_runtime.h"
));
const CPP_RUNTIME: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/files/instrument/cpp_runtime.hpp"
));

/// Words that precede a parenthesis without naming a function
const NOT_FUNCTION_NAMES: &[&str] = &[
    "if", "for", "while", "switch", "catch", "return", "sizeof", "alignof", "alignas", "decltype",
    "noexcept", "throw", "static_assert", "new", "delete", "typeid", "defined", "__attribute__",
    "__declspec", "requires",
];

/// Specifiers allowed between a parameter list and the body
const TRAILING_QUALIFIERS: &[&str] = &["const", "volatile", "override", "final", "noexcept", "mutable"];

/// Specifiers that take a parenthesized argument after the parameter list
const TRAILING_CALLS: &[&str] = &["noexcept", "throw", "__attribute__", "requires"];

#[derive(Debug, Clone, Copy, Default)]
pub struct NativeWeaver {
    pub cpp: bool,
}

impl NativeWeaver {
    fn runtime(&self, config: &InstrumentationConfig) -> String {
        let flag = |on: bool| if on { "1" } else { "0" };
        let [begin, end] = sentinel_values();
        render(
            if self.cpp { CPP_RUNTIME } else { C_RUNTIME },
            &[
                ("COUNT_CALLS", flag(config.monitor_function_calls)),
                ("COUNT_DEPTH", flag(config.monitor_recursion)),
                ("COUNT_LOOPS", flag(config.monitor_loops)),
                ("COUNT_CLASSES", flag(config.monitor_class_instantiations)),
                begin,
                end,
            ],
        )
    }

    fn frame(&self, name: &str) -> String {
        if self.cpp {
            format!("::grader_rt::Frame grader_rt_frame_({});", quoted(name))
        } else {
            format!(
                "grader_rt_frame_t grader_rt_frame __attribute__((cleanup(grader_rt_leave))) = grader_rt_enter({});",
                quoted(name)
            )
        }
    }

    fn probe(&self, kind: &str) -> String {
        if self.cpp {
            format!("::grader_rt::loop({});", quoted(kind))
        } else {
            format!("grader_rt_loop({});", quoted(kind))
        }
    }
}

impl Weaver for NativeWeaver {
    fn weave(&self, unit: &SourceUnit, config: &InstrumentationConfig) -> WovenUnit {
        let source = unit.program();
        let runtime = self.runtime(config);
        let assemble = |body: &str| format!("{}\n#line 1\n{}", runtime, body);

        match self.instrument(source, config) {
            Ok(hooked) if hooked != source => WovenUnit {
                source: assemble(&hooked),
                fallback: Some(assemble(source)),
                warnings: Vec::new(),
            },
            Ok(_) => WovenUnit::new(assemble(source)),
            Err(e) => {
                let mut woven = WovenUnit::new(assemble(source));
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

/// A function definition found in the token stream
struct Definition<'s> {
    name: &'s str,
    body: usize,
    constructor: bool,
}

impl NativeWeaver {
    /// Insert frames, constructor counters and loop probes
    pub fn instrument(&self, source: &str, config: &InstrumentationConfig) -> Result<String, ScanError> {
        let call_hooks = config.needs_call_hooks();
        if !call_hooks && !config.monitor_loops {
            return Ok(source.to_string());
        }

        let tokens = scan::tokenize(source, Syntax::CFamily)?;
        let cx = Context {
            partners: scan::pair_delimiters(&tokens)?,
            enclosing: scan::enclosing_braces(&tokens),
            tokens: &tokens,
        };

        let mut edits = Vec::new();
        if call_hooks {
            for def in cx.definitions() {
                let at = tokens[def.body].end;
                if def.constructor {
                    if self.cpp && config.monitor_class_instantiations {
                        edits.push(Edit::insert(
                            at,
                            format!("::grader_rt::construct({});", quoted(def.name)),
                        ));
                    }
                } else if config.monitor_function_calls || config.monitor_recursion {
                    edits.push(Edit::insert(at, self.frame(def.name)));
                }
            }
        }
        if config.monitor_loops {
            for (at, kind) in cx.loop_sites() {
                edits.push(Edit::insert(at, self.probe(kind)));
            }
        }

        Ok(scan::apply_edits(source, edits))
    }
}

impl<'s> Context<'s, '_> {
    fn punct(&self, idx: usize, text: &str) -> bool {
        self.tokens.get(idx).is_some_and(|t| t.is_punct(text))
    }

    fn is_ident(&self, idx: usize) -> bool {
        self.tokens.get(idx).is_some_and(|t| t.kind == TokenKind::Ident)
    }

    /// Step back over `const`, `noexcept(...)`, `&` and friends
    fn skip_qualifiers(&self, mut p: usize) -> Option<usize> {
        loop {
            let token = &self.tokens[p];
            if token.kind == TokenKind::Ident && TRAILING_QUALIFIERS.contains(&token.text)
                || token.is_punct("&")
            {
                p = p.checked_sub(1)?;
                continue;
            }
            if token.is_punct(")") {
                let open = self.partners[p]?;
                let before = open.checked_sub(1)?;
                if TRAILING_CALLS.contains(&self.tokens[before].text) {
                    p = before.checked_sub(1)?;
                    continue;
                }
            }
            return Some(p);
        }
    }

    /// `) -> T {`: index of the `)` before the arrow
    fn before_trailing_return(&self, p: usize) -> Option<usize> {
        let mut q = p;
        for _ in 0..64 {
            let token = &self.tokens[q];
            if token.kind == TokenKind::Punct && matches!(token.text, ";" | "{" | "}") {
                return None;
            }
            if token.is_punct("->") {
                return q.checked_sub(1);
            }
            if token.is_punct(")") {
                q = self.partners[q]?;
            }
            q = q.checked_sub(1)?;
        }
        None
    }

    /// `) : a(1), b{2} {`: index of the parameter list's `)`
    fn before_init_list(&self, p: usize) -> Option<usize> {
        let mut p = p;
        loop {
            if !(self.punct(p, ")") || self.punct(p, "}")) {
                return None;
            }
            let open = self.partners[p]?;
            let member = open.checked_sub(1)?;
            if !self.is_ident(member) {
                return None;
            }
            let sep = member.checked_sub(1)?;
            if self.punct(sep, ",") {
                p = sep.checked_sub(1)?;
            } else if self.punct(sep, ":") {
                let params = self.skip_qualifiers(sep.checked_sub(1)?)?;
                return self.punct(params, ")").then_some(params);
            } else {
                return None;
            }
        }
    }

    /// Name of the class or struct whose body is `brace`
    fn class_name(&self, brace: usize) -> Option<&'s str> {
        let mut q = brace.checked_sub(1)?;
        loop {
            let token = &self.tokens[q];
            if token.kind == TokenKind::Punct && matches!(token.text, ";" | "{" | "}" | ")") {
                return None;
            }
            if matches!(token.text, "class" | "struct" | "union") && token.kind == TokenKind::Ident {
                return self
                    .tokens
                    .get(q + 1)
                    .filter(|t| t.kind == TokenKind::Ident)
                    .map(|t| t.text);
            }
            q = q.checked_sub(1)?;
        }
    }

    fn declared_constexpr(&self, name: usize) -> bool {
        let mut q = name;
        while let Some(prev) = q.checked_sub(1) {
            let token = &self.tokens[prev];
            if token.kind == TokenKind::Punct && matches!(token.text, ";" | "{" | "}") {
                break;
            }
            if token.is_ident("constexpr") || token.is_ident("consteval") {
                return true;
            }
            q = prev;
        }
        false
    }

    fn definition_at(&self, brace: usize) -> Option<Definition<'s>> {
        let last = self.skip_qualifiers(brace.checked_sub(1)?)?;
        let close = if self.punct(last, ")") {
            self.before_init_list(last).unwrap_or(last)
        } else if self.punct(last, "}") {
            self.before_init_list(last)?
        } else {
            let arrow = self.before_trailing_return(last)?;
            self.skip_qualifiers(arrow)?
        };
        if !self.punct(close, ")") {
            return None;
        }

        let open = self.partners[close]?;
        let name_idx = open.checked_sub(1)?;
        let name_token = self.tokens[name_idx];
        if name_token.kind != TokenKind::Ident || NOT_FUNCTION_NAMES.contains(&name_token.text) {
            return None;
        }
        let before = name_idx.checked_sub(1).map(|b| &self.tokens[b]);
        if before.is_some_and(|b| b.is_punct("~") || b.is_ident("operator")) {
            return None;
        }
        if self.declared_constexpr(name_idx) {
            return None;
        }

        let name = name_token.text;
        let qualified_ctor = before.is_some_and(|b| b.is_punct("::"))
            && name_idx
                .checked_sub(2)
                .is_some_and(|owner| self.tokens[owner].is_ident(name));
        let in_class_ctor = self.enclosing[name_idx]
            .and_then(|owner| self.class_name(owner))
            .is_some_and(|class| class == name);

        Some(Definition {
            name,
            body: brace,
            constructor: qualified_ctor || in_class_ctor,
        })
    }

    /// Function definitions, outermost only (lambdas and local classes are left alone)
    fn definitions(&self) -> Vec<Definition<'s>> {
        let mut bodies: HashSet<usize> = HashSet::new();
        let mut found = Vec::new();
        for brace in 0..self.tokens.len() {
            if !self.tokens[brace].is_punct("{") {
                continue;
            }
            let mut outer = self.enclosing[brace];
            let mut nested = false;
            while let Some(o) = outer {
                if bodies.contains(&o) {
                    nested = true;
                    break;
                }
                outer = self.enclosing[o];
            }
            if nested {
                continue;
            }
            let Some(def) = self.definition_at(brace) else {
                continue;
            };
            bodies.insert(brace);
            if def.name == "main" && self.enclosing[brace].is_none() {
                continue;
            }
            found.push(def);
        }
        found
    }

    /// `while` tokens that close a do-while
    fn do_tails(&self) -> HashSet<usize> {
        let mut tails = HashSet::new();
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
                    let token = &self.tokens[j];
                    if token.is_punct(";") {
                        found = Some(j + 1);
                        break;
                    }
                    let opens = token.kind == TokenKind::Punct && matches!(token.text, "(" | "[" | "{");
                    j = match (opens, self.partners[j]) {
                        (true, Some(close)) => close + 1,
                        _ => j + 1,
                    };
                }
                found
            };
            if let Some(tail) = tail {
                if self.tokens.get(tail).is_some_and(|t| t.is_ident("while")) {
                    tails.insert(tail);
                }
            }
        }
        tails
    }

    /// Insertion offsets for loop probes, with the loop kind
    fn loop_sites(&self) -> Vec<(usize, &'static str)> {
        let tails = self.do_tails();
        let mut sites = Vec::new();
        for (idx, token) in self.tokens.iter().enumerate() {
            let kind = match token.text {
                "for" => "for",
                "while" => "while",
                "do" => "do_while",
                _ => continue,
            };
            if token.kind != TokenKind::Ident || tails.contains(&idx) {
                continue;
            }
            // a label, case or access specifier ends with the colon
            let placeable = scan::at_statement_start(self.tokens, idx)
                || idx.checked_sub(1).is_some_and(|prev| self.punct(prev, ":"));
            if placeable {
                sites.push((token.start, kind));
            }
        }
        sites
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const C: NativeWeaver = NativeWeaver { cpp: false };
    const CPP: NativeWeaver = NativeWeaver { cpp: true };

    fn hooked(weaver: NativeWeaver, source: &str) -> String {
        weaver.instrument(source, &InstrumentationConfig::all()).unwrap()
    }

    #[test]
    fn test_c_function_gets_cleanup_frame() {
        let out = hooked(C, "int fact(int n) { return n; }\nint main(void) { return fact(3); }");
        assert!(out.starts_with(
            "int fact(int n) {grader_rt_frame_t grader_rt_frame __attribute__((cleanup(grader_rt_leave))) = grader_rt_enter(\"fact\"); return n; }"
        ));
        assert!(out.ends_with("int main(void) { return fact(3); }"));
    }

    #[test]
    fn test_cpp_methods_and_constructors() {
        let src = "class Point {\npublic:\n    Point(int x) : x_(x), y_{0} { }\n    int get() const { return x_; }\nprivate:\n    int x_, y_;\n};\nint Shape::area() const noexcept { return 1; }\nShape::Shape() { }\n";
        let out = hooked(CPP, src);
        assert!(out.contains("y_{0} {::grader_rt::construct(\"Point\"); }"));
        assert!(out.contains("int get() const {::grader_rt::Frame grader_rt_frame_(\"get\"); return x_; }"));
        assert!(out.contains("noexcept {::grader_rt::Frame grader_rt_frame_(\"area\");"));
        assert!(out.contains("Shape::Shape() {::grader_rt::construct(\"Shape\"); }"));
        assert!(!out.contains("Frame grader_rt_frame_(\"Point\")"));
    }

    #[test]
    fn test_trailing_return_type() {
        let out = hooked(CPP, "auto twice(int x) -> int { return 2 * x; }");
        assert!(out.contains("-> int {::grader_rt::Frame grader_rt_frame_(\"twice\");"));
    }

    #[test]
    fn test_lambdas_control_flow_and_constexpr_are_skipped() {
        let src = "constexpr int sq(int x) { return x * x; }\nvoid f() { auto g = [](int a) { return a; }; if (1) { } switch (2) { } }\nstruct S s = (struct S){ 1 };";
        let out = hooked(CPP, src);
        assert_eq!(out.matches("grader_rt_frame_(").count(), 1);
        assert!(out.contains("grader_rt_frame_(\"f\")"));
    }

    #[test]
    fn test_loop_probes() {
        let src = "int main(void) { for (int i = 0; i < 3; i++) { } while (0) { } do { } while (0); again: for (;;) break; return 0; }";
        let out = hooked(C, src);
        assert!(out.contains("grader_rt_loop(\"for\");for (int i"));
        assert!(out.contains("grader_rt_loop(\"while\");while (0) {"));
        assert!(out.contains("grader_rt_loop(\"do_while\");do"));
        assert!(out.contains("again: grader_rt_loop(\"for\");for (;;)"));
        assert_eq!(out.matches("grader_rt_loop(\"while\")").count(), 1);
    }

    #[test]
    fn test_weave_layout_and_fallback() {
        let unit = SourceUnit::Code("#include <stdio.h>\nint sq(int x) { return x * x; }\nint main(void) { printf(\"%d\\n\", sq(2)); return 0; }\n".into());
        let woven = C.weave(&unit, &InstrumentationConfig::all());
        assert!(woven.warnings.is_empty());
        assert!(woven.source.contains("\n#line 1\n#include <stdio.h>"));
        assert!(woven.source.contains("grader_rt_enter(\"sq\")"));
        assert!(!woven.source.contains("@@"));

        let fallback = woven.fallback.unwrap();
        assert!(fallback.contains("atexit(grader_rt_emit)"));
        assert!(!fallback.contains("grader_rt_enter(\"sq\")"));
    }

    #[test]
    fn test_unscannable_source_gets_emitter_only() {
        let unit = SourceUnit::Code("int main() { const char *s = \"oops; }".into());
        let woven = CPP.weave(&unit, &InstrumentationConfig::all());
        assert_eq!(woven.warnings.len(), 1);
        assert!(woven.fallback.is_none());
        assert!(woven.source.contains("static Installer installer;"));
        assert!(woven.source.ends_with("int main() { const char *s = \"oops; }"));
    }
}
