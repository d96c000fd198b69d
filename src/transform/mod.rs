//! Source-to-source instrumentation of untrusted plugin scripts.
//!
//! [`CodeTransformer`] rewrites a plugin so that it cooperatively aborts once
//! its time budget is spent: every loop iteration, every function entry and
//! every `await` consults the elapsed time and throws
//! `ExecutionTimeoutError` past the deadline. Once thrown, every later check
//! throws too, so a plugin that catches the error cannot keep running.
//!
//! The cooperative checks are the first line of defence; the worker pool's
//! hard deadline on the execution unit is the second.

pub mod cache;
pub mod instrument;
pub mod lexer;

use std::time::Duration;

use crate::error::TransformError;

pub use cache::{CacheStats, ContentHash, TransformCache};
pub use instrument::{CHECK_FN, GUARD_FN, RESERVED_PREFIX};

/// Name of the error class thrown once the budget is exhausted.
pub const TIMEOUT_ERROR_CLASS: &str = "ExecutionTimeoutError";

/// Settings for a [`CodeTransformer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformConfig {
    /// Wall-clock budget embedded into the instrumented script.
    pub budget: Duration,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            budget: Duration::from_secs(5),
        }
    }
}

/// An instrumented script, ready to hand to an execution unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledScript {
    /// Instrumented plugin with the prelude after its directives.
    pub source: String,
    /// Hash of the original (uninstrumented) source and budget.
    pub source_hash: ContentHash,
    pub budget: Duration,
}

/// Deterministic, insertion-only instrumenter for plugin source.
#[derive(Debug, Clone, Copy)]
pub struct CodeTransformer {
    budget: Duration,
}

impl CodeTransformer {
    pub fn new(budget: Duration) -> Self {
        Self { budget }
    }

    pub fn from_config(config: &TransformConfig) -> Self {
        Self::new(config.budget)
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Instruments `source` without the runtime prelude.
    pub fn instrument(&self, source: &str) -> Result<String, TransformError> {
        let tokens = lexer::tokenize(source)?;
        instrument::Instrumenter::new(source, &tokens)?.run()
    }

    /// Returns the instrumented `source` with the prelude injected after its
    /// directive prologue.
    pub fn transform(&self, source: &str) -> Result<String, TransformError> {
        let tokens = lexer::tokenize(source)?;
        instrument::Instrumenter::new(source, &tokens)?
            .with_prelude(prelude(self.budget))
            .run()
    }

    pub fn compile(&self, source: &str) -> Result<CompiledScript, TransformError> {
        Ok(CompiledScript {
            source: self.transform(source)?,
            source_hash: ContentHash::for_script(source, self.budget),
            budget: self.budget,
        })
    }
}

impl Default for CodeTransformer {
    fn default() -> Self {
        Self::from_config(&TransformConfig::default())
    }
}

/// Runtime support injected ahead of every instrumented plugin.
///
/// Globals the guards rely on are captured before plugin code runs, so a
/// plugin that reassigns `Date.now`, `setTimeout` or `Promise` cannot
/// blind them.
pub fn prelude(budget: Duration) -> String {
    let budget_ms = budget.as_millis();
    format!(
        r#"const __sbx_now = Date.now;
const __sbx_setTimeout = setTimeout;
const __sbx_clearTimeout = clearTimeout;
const __sbx_Promise = Promise;
const __sbx_budget_ms = {budget_ms};
const __sbx_started = __sbx_now();
let __sbx_expired = false;
class {TIMEOUT_ERROR_CLASS} extends Error {{
  constructor(site) {{
    super("execution budget of " + __sbx_budget_ms + "ms exceeded at " + site);
    this.name = "{TIMEOUT_ERROR_CLASS}";
    this.site = site;
  }}
}}
function {CHECK_FN}(site) {{
  if (__sbx_expired || __sbx_now() - __sbx_started > __sbx_budget_ms) {{
    __sbx_expired = true;
    throw new {TIMEOUT_ERROR_CLASS}(site);
  }}
}}
function {GUARD_FN}(value, site) {{
  {CHECK_FN}(site);
  const remaining = Math.max(0, __sbx_budget_ms - (__sbx_now() - __sbx_started));
  let timer;
  const deadline = new __sbx_Promise((_, reject) => {{
    timer = __sbx_setTimeout(() => {{
      __sbx_expired = true;
      reject(new {TIMEOUT_ERROR_CLASS}(site));
    }}, remaining);
  }});
  return __sbx_Promise.race([__sbx_Promise.resolve(value), deadline]).then(
    (v) => {{ __sbx_clearTimeout(timer); {CHECK_FN}(site); return v; }},
    (e) => {{ __sbx_clearTimeout(timer); throw e; }},
  );
}}
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instrument(src: &str) -> String {
        CodeTransformer::new(Duration::from_millis(100))
            .instrument(src)
            .expect("instrument")
    }

    fn body(src: &str) -> String {
        instrument(src)
            .strip_prefix("__sbx_check(\"program@1:1\");\n")
            .map(str::to_string)
            .unwrap_or_else(|| panic!("missing program check"))
    }

    #[test]
    fn test_program_check_at_start() {
        assert_eq!(instrument("let x = 1;"), "__sbx_check(\"program@1:1\");\nlet x = 1;");
        assert_eq!(instrument(""), "__sbx_check(\"program@1:1\");\n");
    }

    #[test]
    fn test_program_check_after_directive() {
        assert_eq!(
            instrument("\"use strict\";\nlet x = 1;"),
            "\"use strict\"; __sbx_check(\"program@1:1\");\nlet x = 1;"
        );
    }

    #[test]
    fn test_braced_loop() {
        assert_eq!(
            body("while (x) { y(); }"),
            "while (x) { __sbx_check(\"loop@1:1\"); y(); }"
        );
    }

    #[test]
    fn test_unbraced_loop_body_is_wrapped() {
        assert_eq!(
            body("for (let i = 0; i < 3; i++) total += i;"),
            "for (let i = 0; i < 3; i++) { __sbx_check(\"loop@1:1\"); total += i; }"
        );
    }

    #[test]
    fn test_nested_unbraced_loops() {
        assert_eq!(
            body("while (a) while (b) c();"),
            "while (a) { __sbx_check(\"loop@1:1\"); while (b) { __sbx_check(\"loop@1:11\"); c(); } }"
        );
    }

    #[test]
    fn test_do_while() {
        assert_eq!(
            body("do x++; while (x < 5);"),
            "do { __sbx_check(\"loop@1:1\"); x++; } while (x < 5);"
        );
        assert_eq!(
            body("do { x++ } while (x < 5)"),
            "do { __sbx_check(\"loop@1:1\"); x++ } while (x < 5)"
        );
    }

    #[test]
    fn test_unbraced_body_ends_at_line_break() {
        assert_eq!(
            body("while (busy) spin()\ndone()"),
            "while (busy) { __sbx_check(\"loop@1:1\"); spin() }\ndone()"
        );
    }

    #[test]
    fn test_unbraced_if_else_body() {
        assert_eq!(
            body("for (;;) if (a) b(); else c();"),
            "for (;;) { __sbx_check(\"loop@1:1\"); if (a) b(); else c(); }"
        );
    }

    #[test]
    fn test_function_body() {
        assert_eq!(
            body("function add(a, b) {\n  return a + b;\n}"),
            "function add(a, b) { __sbx_check(\"function@1:1\");\n  return a + b;\n}"
        );
    }

    #[test]
    fn test_function_directive_preserved() {
        assert_eq!(
            body("function f() { \"use strict\"; return 1; }"),
            "function f() { \"use strict\"; __sbx_check(\"function@1:1\"); return 1; }"
        );
    }

    #[test]
    fn test_methods() {
        let out = body("class A { run(x) { return x; } }");
        assert_eq!(out, "class A { run(x) { __sbx_check(\"method@1:11\"); return x; } }");

        let out = body("const o = { go() { while (true) {} } };");
        assert!(out.contains("go() { __sbx_check(\"method@1:13\");"), "{out}");
        assert!(out.contains("while (true) { __sbx_check(\"loop@1:20\");}"), "{out}");
    }

    #[test]
    fn test_function_expression_in_object_checked_once() {
        let out = body("const o = { a: function named() { return 1; } };");
        assert_eq!(out.matches("__sbx_check(").count(), 1, "{out}");
        assert!(out.contains("function@1:16"));
    }

    #[test]
    fn test_concise_arrow() {
        assert_eq!(
            body("const double = (x) => x * 2;"),
            "const double = (x) => (__sbx_check(\"arrow@1:20\"), x * 2);"
        );
        assert_eq!(
            body("[1,2].map(x => x + 1)"),
            "[1,2].map(x => (__sbx_check(\"arrow@1:13\"), x + 1))"
        );
    }

    #[test]
    fn test_concise_arrow_stops_at_comma_and_line_break() {
        assert_eq!(
            body("f(x => x, y)"),
            "f(x => (__sbx_check(\"arrow@1:5\"), x), y)"
        );
        assert_eq!(
            body("const f = x => x\nf(1)"),
            "const f = x => (__sbx_check(\"arrow@1:13\"), x)\nf(1)"
        );
    }

    #[test]
    fn test_arrow_block_body() {
        assert_eq!(
            body("const f = () => { spin(); };"),
            "const f = () => { __sbx_check(\"arrow@1:14\"); spin(); };"
        );
    }

    #[test]
    fn test_await_is_guarded() {
        let out = body("async function f() { const r = await fetch(url).then(g); return r; }");
        assert!(
            out.contains("await __sbx_guard(fetch(url).then(g), \"await@1:32\");"),
            "{out}"
        );
    }

    #[test]
    fn test_await_in_concise_arrow() {
        let out = body("const f = async () => await load()");
        assert_eq!(
            out,
            "const f = async () => (__sbx_check(\"arrow@1:20\"), await __sbx_guard(load(), \"await@1:23\"))"
        );
    }

    #[test]
    fn test_for_await_is_a_loop_not_an_await() {
        let out = body("async function f(s) { for await (const x of s) use(x); }");
        assert!(!out.contains("__sbx_guard"), "{out}");
        assert!(out.contains("{ __sbx_check(\"loop@1:23\"); use(x); }"), "{out}");
    }

    #[test]
    fn test_keywords_as_property_names_are_ignored() {
        assert_eq!(body("obj.for = 1; const o = { while: 2 };"), "obj.for = 1; const o = { while: 2 };");
    }

    #[test]
    fn test_strings_comments_and_regex_untouched() {
        let src = "const s = \"while (x) {}\"; // for (;;) {}\nconst r = /for(;;)/;";
        assert_eq!(body(src), src);
    }

    #[test]
    fn test_template_substitution_with_arrow() {
        let out = body("const s = `a${ (() => { return 1; })() }b`;");
        assert!(out.contains("=> { __sbx_check(\"arrow@1:20\"); return 1; }"), "{out}");
    }

    #[test]
    fn test_hashbang_becomes_comment() {
        let out = instrument("#!/usr/bin/env node\nrun();");
        assert!(out.starts_with("//#!/usr/bin/env node\n__sbx_check(\"program@1:1\");\nrun();"), "{out}");
    }

    #[test]
    fn test_deterministic() {
        let src = "async function run(p) {\n  for (const x of p.items) await step(x);\n  return p.items.map(i => i * 2);\n}\n";
        let transformer = CodeTransformer::new(Duration::from_millis(250));
        let a = transformer.transform(src).expect("transform");
        let b = transformer.transform(src).expect("transform");
        assert_eq!(a, b);
    }

    #[test]
    fn test_prelude_embeds_budget() {
        let out = CodeTransformer::new(Duration::from_millis(1234))
            .transform("run();")
            .expect("transform");
        assert!(out.starts_with("const __sbx_now = Date.now;"));
        assert!(out.contains("const __sbx_budget_ms = 1234;"));
        assert!(out.contains("class ExecutionTimeoutError extends Error"));
    }

    #[test]
    fn test_prelude_follows_directive_prologue() {
        let out = CodeTransformer::new(Duration::from_millis(100))
            .transform("\"use strict\";\nfunction run() { return 1; }")
            .expect("transform");
        assert!(out.starts_with("\"use strict\";\nconst __sbx_now = Date.now;"), "{out}");
        let check = out.find("__sbx_check(\"program@1:1\")").expect("program check");
        assert!(check > out.find("function __sbx_check(").expect("check definition"));

        let out = CodeTransformer::new(Duration::from_millis(100))
            .transform("'use strict'\nrun()")
            .expect("transform");
        assert!(out.starts_with("'use strict';\nconst __sbx_now"), "{out}");
    }

    #[test]
    fn test_reserved_identifier_rejected() {
        let err = CodeTransformer::default()
            .instrument("let __sbx_expired = false;")
            .unwrap_err();
        assert_eq!(
            err,
            TransformError::ReservedIdentifier {
                name: "__sbx_expired".to_string(),
                line: 1,
                col: 5
            }
        );
    }

    #[test]
    fn test_unbalanced_delimiters() {
        let err = CodeTransformer::default().instrument("foo(]").unwrap_err();
        assert_eq!(
            err,
            TransformError::UnbalancedDelimiter {
                expected: ')',
                found: ']',
                line: 1,
                col: 5
            }
        );

        let err = CodeTransformer::default().instrument("while (x { }").unwrap_err();
        assert_eq!(
            err,
            TransformError::UnclosedDelimiter {
                delimiter: '(',
                line: 1,
                col: 7
            }
        );
    }

    #[test]
    fn test_malformed_loop_header() {
        let err = CodeTransformer::default().instrument("for x").unwrap_err();
        assert!(matches!(
            err,
            TransformError::MalformedConstruct { construct: "for loop", line: 1, col: 1, .. }
        ));
    }

    #[test]
    fn test_lexer_error_surfaces() {
        let err = CodeTransformer::default().instrument("let s = 'open").unwrap_err();
        assert_eq!(err, TransformError::UnterminatedString { line: 1, col: 9 });
    }

    #[test]
    fn test_compile_records_hash_and_budget() {
        let transformer = CodeTransformer::new(Duration::from_millis(75));
        let script = transformer.compile("run();").expect("compile");
        assert_eq!(script.budget, Duration::from_millis(75));
        assert_eq!(
            script.source_hash,
            ContentHash::for_script("run();", Duration::from_millis(75))
        );
    }
}
