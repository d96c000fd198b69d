//! Insertion-only rewriting of plugin source.
//!
//! The instrumenter walks the token stream once, decides where budget checks
//! go, and splices them into the original text. Nothing is removed or
//! reformatted, so line numbers in stack traces stay close to the author's
//! source and identical input always yields identical output.
//!
//! Injection points:
//! - program start (after a directive prologue), together with the runtime
//!   prelude when one is supplied, so `"use strict"` stays a directive;
//! - the first statement of every loop body, wrapping unbraced bodies;
//! - the first statement of every function, method and arrow block body;
//! - concise arrow bodies: `x => e` becomes `x => (__sbx_check(..), e)`;
//! - `await e` becomes `await __sbx_guard(e, ..)`.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};

use crate::error::TransformError;

use super::lexer::{Token, TokenKind};

/// Name of the synchronous budget check injected into loops and bodies.
pub const CHECK_FN: &str = "__sbx_check";
/// Name of the async guard wrapped around awaited values.
pub const GUARD_FN: &str = "__sbx_guard";
/// Prefix plugins may not use, so they cannot shadow or reassign the guards.
pub const RESERVED_PREFIX: &str = "__sbx";

/// Keywords that can never be the operand of `await`, used to tell
/// `await` the operator from `await` the identifier.
const NON_OPERAND_PUNCT: &[&str] = &[
    ")", "]", "}", ";", ",", ":", "=", ".", "?.", "=>", "?", "==", "===", "!=", "!==", "&&",
    "||", "??", "*", "/", "%", "**", "<", ">", "<=", ">=", "|", "&", "^", "<<", ">>", ">>>",
    "+=", "-=", "*=", "/=", "%=",
];

/// Punctuators that continue an expression onto the next line (no ASI).
const CONTINUATION_PUNCT: &[&str] = &[
    ".", "?.", "(", "[", ",", "?", ":", "=", "=>", "+", "-", "*", "/", "%", "**", "&&", "||",
    "??", "<", ">", "<=", ">=", "==", "===", "!=", "!==", "&", "|", "^", "<<", ">>", ">>>",
    "+=", "-=", "*=", "/=", "%=", "**=", "<<=", ">>=", ">>>=", "&=", "|=", "^=", "&&=", "||=",
    "??=",
];

/// Identifiers that are operators and therefore cannot end a statement.
const OPERATOR_KEYWORDS: &[&str] = &[
    "typeof", "instanceof", "in", "of", "new", "delete", "void", "await", "else", "case", "extends",
];

/// Keywords after which a newline always terminates the statement.
const RESTRICTED_KEYWORDS: &[&str] = &["return", "break", "continue", "throw", "yield"];

/// Keywords that start a `{` in statement position.
const BLOCK_KEYWORDS: &[&str] = &["else", "do", "try", "finally", "static"];

/// Keywords that put a following `{` in expression position.
const EXPRESSION_KEYWORDS: &[&str] = &[
    "return", "typeof", "yield", "await", "case", "in", "of", "new", "void", "delete", "throw",
    "instanceof",
];

/// Keywords that are followed by a parenthesized header, never a call.
const HEADER_KEYWORDS: &[&str] = &["if", "for", "while", "switch", "catch", "with"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BraceKind {
    Block,
    ObjectLiteral,
    ClassBody,
    FunctionBody,
}

/// One pending splice. Closers at an offset go before openers at the same
/// offset; inner constructs close before outer ones and open after them.
#[derive(Debug)]
struct Insertion {
    offset: usize,
    opener: bool,
    /// Closers: where the construct begins. Openers: where it ends.
    extent: usize,
    text: String,
}

pub(crate) struct Instrumenter<'a> {
    src: &'a str,
    toks: &'a [Token],
    matching: HashMap<usize, usize>,
    insertions: Vec<Insertion>,
    do_while_tails: HashSet<usize>,
    function_braces: HashSet<usize>,
    class_braces: HashSet<usize>,
    prelude: String,
}

impl<'a> Instrumenter<'a> {
    pub(crate) fn new(src: &'a str, toks: &'a [Token]) -> Result<Self, TransformError> {
        let matching = match_delimiters(src, toks)?;
        Ok(Self {
            src,
            toks,
            matching,
            insertions: Vec::new(),
            do_while_tails: HashSet::new(),
            function_braces: HashSet::new(),
            class_braces: HashSet::new(),
            prelude: String::new(),
        })
    }

    /// Emits `prelude` after the program's directive prologue.
    pub(crate) fn with_prelude(mut self, prelude: String) -> Self {
        self.prelude = prelude;
        self
    }

    /// Computes all insertions and returns the instrumented source.
    pub(crate) fn run(mut self) -> Result<String, TransformError> {
        self.reject_reserved_identifiers()?;
        self.instrument_program_start();

        // Stack of open brackets: (token index, brace kind if `{`).
        let mut stack: Vec<(usize, Option<BraceKind>)> = Vec::new();

        for i in 0..self.toks.len() {
            let tok = self.toks[i];
            let text = tok.text(self.src);

            match tok.kind {
                TokenKind::Punct => match text {
                    "{" => {
                        let kind = self.classify_brace(i, &stack);
                        stack.push((i, Some(kind)));
                    }
                    "(" => {
                        if self.in_member_context(&stack) {
                            self.try_instrument_method(i)?;
                        }
                        stack.push((i, None));
                    }
                    "[" => stack.push((i, None)),
                    ")" | "]" | "}" => {
                        stack.pop();
                    }
                    "=>" => self.instrument_arrow(i)?,
                    _ => {}
                },
                TokenKind::TemplateHead => stack.push((i, None)),
                TokenKind::TemplateMiddle => {
                    stack.pop();
                    stack.push((i, None));
                }
                TokenKind::TemplateTail => {
                    stack.pop();
                }
                TokenKind::Ident if !self.is_property_name(i) => match text {
                    "for" | "while" | "do" => self.instrument_loop(i)?,
                    "function" => self.instrument_function(i)?,
                    "class" => self.register_class(i)?,
                    "await" => self.instrument_await(i)?,
                    _ => {}
                },
                _ => {}
            }
        }

        Ok(self.splice())
    }

    fn splice(mut self) -> String {
        // Closers record where their construct starts and openers where it
        // ends, so a descending extent puts inner closers and outer openers first.
        self.insertions
            .sort_by_key(|ins| (ins.offset, ins.opener, Reverse(ins.extent)));

        let extra: usize = self.insertions.iter().map(|ins| ins.text.len()).sum();
        let mut out = String::with_capacity(self.src.len() + extra);
        let mut cursor = 0;
        for ins in &self.insertions {
            out.push_str(&self.src[cursor..ins.offset]);
            out.push_str(&ins.text);
            cursor = ins.offset;
        }
        out.push_str(&self.src[cursor..]);
        out
    }

    // ------------------------------------------------------------------
    // Injection points
    // ------------------------------------------------------------------

    fn instrument_program_start(&mut self) {
        // A hashbang is only legal at offset 0, which the prelude will occupy.
        if self.src.starts_with("#!") {
            self.open_at(0, self.src.len(), "//".to_string());
        }
        let call = format!("{CHECK_FN}(\"program@1:1\");");
        let prelude = std::mem::take(&mut self.prelude);
        match self.directive_end(0) {
            Some((offset, has_semicolon)) => {
                let terminator = if has_semicolon { "" } else { ";" };
                let text = if prelude.is_empty() {
                    format!("{terminator} {call}")
                } else {
                    format!("{terminator}\n{prelude}{call}")
                };
                self.open_at(offset, self.src.len(), text);
            }
            None => {
                let offset = self.toks.first().map_or(0, |t| t.start);
                self.open_at(offset, self.src.len(), format!("{prelude}{call}\n"));
            }
        }
    }

    fn instrument_loop(&mut self, i: usize) -> Result<(), TransformError> {
        let tok = self.toks[i];
        let keyword = tok.text(self.src);
        if keyword == "while" && self.do_while_tails.contains(&i) {
            return Ok(());
        }

        let body = match keyword {
            "for" => {
                let mut j = i + 1;
                if self.ident_at(j, "await") {
                    j += 1;
                }
                let close = self.expect_parens(j, "for loop", tok)?;
                close + 1
            }
            "while" => self.expect_parens(i + 1, "while loop", tok)? + 1,
            _ => i + 1,
        };

        if body >= self.toks.len() {
            return Err(malformed("loop", "missing loop body", tok));
        }

        let site = site("loop", tok);
        let end = self.instrument_body(body, &site)?;

        if keyword == "do" {
            if !self.ident_at(end + 1, "while") {
                return Err(malformed("do-while loop", "expected 'while' after loop body", tok));
            }
            self.do_while_tails.insert(end + 1);
        }
        Ok(())
    }

    /// Instruments a loop body starting at token `body`; returns the index of
    /// the body's last token.
    fn instrument_body(&mut self, body: usize, site: &str) -> Result<usize, TransformError> {
        let call = format!("{CHECK_FN}(\"{site}\");");
        let first = self.toks[body];
        if first.is_punct(self.src, "{") {
            let close = self.close_of(body)?;
            self.open_at(first.end, self.toks[close].start, format!(" {call}"));
            return Ok(close);
        }

        let end = self.statement_end(body)?;
        let last = self.toks[end];
        self.open_at(first.start, last.end, format!("{{ {call} "));
        self.close_at(last.end, first.start, " }".to_string());
        Ok(end)
    }

    fn instrument_function(&mut self, i: usize) -> Result<(), TransformError> {
        let tok = self.toks[i];
        let mut j = i + 1;
        if self.punct_at(j, "*") {
            j += 1;
        }
        if self.toks.get(j).is_some_and(|t| t.kind == TokenKind::Ident) {
            j += 1;
        }
        let close = self.expect_parens(j, "function", tok)?;
        if !self.punct_at(close + 1, "{") {
            return Err(malformed("function", "expected '{' after parameter list", tok));
        }
        self.instrument_block_body(close + 1, &site("function", tok))
    }

    /// `name(...) {` directly inside a class body or object literal.
    fn try_instrument_method(&mut self, open: usize) -> Result<(), TransformError> {
        let Some(prev) = open.checked_sub(1).map(|p| self.toks[p]) else {
            return Ok(());
        };
        let name_like = match prev.kind {
            TokenKind::Ident => !HEADER_KEYWORDS.contains(&prev.text(self.src)) && prev.text(self.src) != "function",
            TokenKind::String | TokenKind::Number => true,
            TokenKind::Punct => prev.text(self.src) == "]",
            _ => false,
        };
        if !name_like {
            return Ok(());
        }
        let close = self.close_of(open)?;
        // `function name() {}` was already handled at the `function` keyword.
        if self.punct_at(close + 1, "{") && !self.function_braces.contains(&(close + 1)) {
            let site_tok = if prev.text(self.src) == "]" {
                self.toks[self.open_of(open - 1).unwrap_or(open - 1)]
            } else {
                prev
            };
            self.instrument_block_body(close + 1, &site("method", site_tok))?;
        }
        Ok(())
    }

    fn instrument_arrow(&mut self, i: usize) -> Result<(), TransformError> {
        let tok = self.toks[i];
        let body = i + 1;
        if body >= self.toks.len() {
            return Err(malformed("arrow function", "missing body", tok));
        }
        let site = site("arrow", tok);
        if self.punct_at(body, "{") {
            return self.instrument_block_body(body, &site);
        }

        let end = self.concise_body_end(body)?;
        self.open_at(
            tok.end,
            self.toks[end].end,
            format!(" ({CHECK_FN}(\"{site}\"),"),
        );
        self.close_at(self.toks[end].end, tok.end, ")".to_string());
        Ok(())
    }

    fn instrument_await(&mut self, i: usize) -> Result<(), TransformError> {
        let tok = self.toks[i];
        // `for await (...)` is loop syntax, not an awaited expression.
        if i > 0 && self.toks[i - 1].is_ident(self.src, "for") {
            return Ok(());
        }
        let operand = i + 1;
        let Some(next) = self.toks.get(operand) else {
            return Ok(());
        };
        let used_as_identifier = match next.kind {
            TokenKind::Punct => NON_OPERAND_PUNCT.contains(&next.text(self.src)),
            TokenKind::Ident => OPERATOR_KEYWORDS
                .iter()
                .filter(|k| !matches!(**k, "typeof" | "new" | "delete" | "void" | "await"))
                .any(|k| *k == next.text(self.src)),
            _ => false,
        };
        if used_as_identifier {
            return Ok(());
        }

        let end = self.unary_end(operand)?;
        let site = site("await", tok);
        self.open_at(next.start, self.toks[end].end, format!("{GUARD_FN}("));
        self.close_at(self.toks[end].end, next.start, format!(", \"{site}\")"));
        Ok(())
    }

    fn instrument_block_body(&mut self, open: usize, site: &str) -> Result<(), TransformError> {
        self.function_braces.insert(open);
        let close = self.close_of(open)?;
        let call = format!("{CHECK_FN}(\"{site}\");");
        match self.directive_end(open + 1) {
            Some((offset, true)) => self.open_at(offset, self.toks[close].start, format!(" {call}")),
            Some((offset, false)) => {
                self.open_at(offset, self.toks[close].start, format!("; {call}"))
            }
            None => self.open_at(self.toks[open].end, self.toks[close].start, format!(" {call}")),
        }
        Ok(())
    }

    fn register_class(&mut self, i: usize) -> Result<(), TransformError> {
        let tok = self.toks[i];
        let mut j = i + 1;
        while j < self.toks.len() {
            let t = self.toks[j];
            if t.is_punct(self.src, "{") {
                self.class_braces.insert(j);
                return Ok(());
            }
            if t.is_punct(self.src, "(") || t.is_punct(self.src, "[") {
                j = self.close_of(j)?;
            }
            j += 1;
        }
        Err(malformed("class", "missing class body", tok))
    }

    // ------------------------------------------------------------------
    // Structure
    // ------------------------------------------------------------------

    fn classify_brace(&self, i: usize, stack: &[(usize, Option<BraceKind>)]) -> BraceKind {
        if self.function_braces.contains(&i) {
            return BraceKind::FunctionBody;
        }
        if self.class_braces.contains(&i) {
            return BraceKind::ClassBody;
        }
        let Some(prev) = i.checked_sub(1).map(|p| self.toks[p]) else {
            return BraceKind::Block;
        };
        let text = prev.text(self.src);
        match prev.kind {
            TokenKind::TemplateHead | TokenKind::TemplateMiddle => BraceKind::ObjectLiteral,
            TokenKind::Ident if BLOCK_KEYWORDS.contains(&text) => BraceKind::Block,
            TokenKind::Ident if EXPRESSION_KEYWORDS.contains(&text) => BraceKind::ObjectLiteral,
            TokenKind::Punct => match text {
                ";" | "}" | "{" | ")" => BraceKind::Block,
                ":" => {
                    let enclosing = stack.last().map(|(_, kind)| *kind);
                    match enclosing {
                        Some(Some(BraceKind::ObjectLiteral)) | Some(None) => BraceKind::ObjectLiteral,
                        _ if self.is_ternary_colon(i - 1) => BraceKind::ObjectLiteral,
                        _ => BraceKind::Block,
                    }
                }
                _ => BraceKind::ObjectLiteral,
            },
            _ => BraceKind::Block,
        }
    }

    fn in_member_context(&self, stack: &[(usize, Option<BraceKind>)]) -> bool {
        matches!(
            stack.last(),
            Some((_, Some(BraceKind::ClassBody | BraceKind::ObjectLiteral)))
        )
    }

    /// Whether a `:` closes a `?` of a conditional expression in the same
    /// statement rather than ending a label or `case`.
    fn is_ternary_colon(&self, colon: usize) -> bool {
        let mut pending = 0i32;
        let mut j = colon;
        while j > 0 {
            j -= 1;
            let t = self.toks[j];
            let text = t.text(self.src);
            if t.kind == TokenKind::Punct {
                match text {
                    ";" | "{" | "}" => break,
                    ")" | "]" => {
                        if let Some(open) = self.open_of(j) {
                            j = open;
                        }
                    }
                    "?" => pending += 1,
                    ":" => pending -= 1,
                    _ => {}
                }
            } else if t.kind == TokenKind::Ident && matches!(text, "case" | "default") {
                return false;
            }
        }
        pending > 0
    }

    /// Identifiers used as property names (`a.for`, `{ while: 1 }`) are not keywords.
    fn is_property_name(&self, i: usize) -> bool {
        if i > 0 {
            let prev = self.toks[i - 1];
            if prev.is_punct(self.src, ".") || prev.is_punct(self.src, "?.") {
                return true;
            }
        }
        self.toks
            .get(i + 1)
            .is_some_and(|next| next.is_punct(self.src, ":") && !self.ident_at(i, "default"))
    }

    /// Returns the index of the last token of the statement starting at `i`.
    fn statement_end(&self, i: usize) -> Result<usize, TransformError> {
        let tok = self.toks[i];
        let text = tok.text(self.src);

        if tok.kind == TokenKind::Punct {
            return match text {
                "{" => self.close_of(i),
                ";" => Ok(i),
                _ => self.expression_end(i, false),
            };
        }
        if tok.kind != TokenKind::Ident {
            return self.expression_end(i, false);
        }

        match text {
            "if" => {
                let close = self.expect_parens(i + 1, "if statement", tok)?;
                let then_end = self.statement_end_after(close, "if statement", tok)?;
                if self.ident_at(then_end + 1, "else") {
                    self.statement_end_after(then_end + 1, "else clause", tok)
                } else {
                    Ok(then_end)
                }
            }
            "for" => {
                let mut j = i + 1;
                if self.ident_at(j, "await") {
                    j += 1;
                }
                let close = self.expect_parens(j, "for loop", tok)?;
                self.statement_end_after(close, "for loop", tok)
            }
            "while" | "with" => {
                let close = self.expect_parens(i + 1, "while loop", tok)?;
                self.statement_end_after(close, "while loop", tok)
            }
            "do" => {
                let body_end = self.statement_end_after(i, "do-while loop", tok)?;
                if !self.ident_at(body_end + 1, "while") {
                    return Err(malformed("do-while loop", "expected 'while' after loop body", tok));
                }
                let close = self.expect_parens(body_end + 2, "do-while loop", tok)?;
                Ok(if self.punct_at(close + 1, ";") { close + 1 } else { close })
            }
            "try" => {
                let mut end = self.expect_block(i + 1, "try statement", tok)?;
                if self.ident_at(end + 1, "catch") {
                    let mut j = end + 2;
                    if self.punct_at(j, "(") {
                        j = self.close_of(j)? + 1;
                    }
                    end = self.expect_block(j, "catch clause", tok)?;
                }
                if self.ident_at(end + 1, "finally") {
                    end = self.expect_block(end + 2, "finally clause", tok)?;
                }
                Ok(end)
            }
            "switch" => {
                let close = self.expect_parens(i + 1, "switch statement", tok)?;
                self.expect_block(close + 1, "switch statement", tok)
            }
            "function" => self.function_end(i),
            "async" if self.ident_at(i + 1, "function") && !self.toks[i + 1].newline_before => {
                self.function_end(i + 1)
            }
            "class" => {
                let mut j = i + 1;
                while j < self.toks.len() && !self.punct_at(j, "{") {
                    if self.punct_at(j, "(") || self.punct_at(j, "[") {
                        j = self.close_of(j)?;
                    }
                    j += 1;
                }
                self.expect_block(j, "class", tok)
            }
            _ if self.punct_at(i + 1, ":") && !self.ident_at(i, "default") => {
                // Labelled statement.
                self.statement_end_after(i + 1, "labelled statement", tok)
            }
            _ => self.expression_end(i, false),
        }
    }

    fn statement_end_after(
        &self,
        prev: usize,
        construct: &'static str,
        tok: Token,
    ) -> Result<usize, TransformError> {
        if prev + 1 >= self.toks.len() {
            return Err(malformed(construct, "missing statement body", tok));
        }
        self.statement_end(prev + 1)
    }

    fn function_end(&self, i: usize) -> Result<usize, TransformError> {
        let tok = self.toks[i];
        let mut j = i + 1;
        if self.punct_at(j, "*") {
            j += 1;
        }
        if self.toks.get(j).is_some_and(|t| t.kind == TokenKind::Ident) {
            j += 1;
        }
        let close = self.expect_parens(j, "function", tok)?;
        self.expect_block(close + 1, "function", tok)
    }

    /// End of an expression (or expression-like statement) starting at `i`.
    ///
    /// With `stop_at_comma`, a top-level `,` or an unmatched `:` also ends it,
    /// which is what a concise arrow body needs.
    fn expression_end(&self, i: usize, stop_at_comma: bool) -> Result<usize, TransformError> {
        let mut j = i;
        let mut last = i;
        let mut pending_conditionals = 0usize;
        while j < self.toks.len() {
            let t = self.toks[j];
            let text = t.text(self.src);
            if j > i && t.newline_before && self.asi_applies(last, j) {
                return Ok(last);
            }
            match t.kind {
                TokenKind::Punct => match text {
                    ";" => return Ok(if stop_at_comma { last } else { j }),
                    ")" | "]" | "}" => return Ok(last),
                    "(" | "[" | "{" => {
                        j = self.close_of(j)?;
                        last = j;
                        j += 1;
                        continue;
                    }
                    "," if stop_at_comma => return Ok(last),
                    "?" => pending_conditionals += 1,
                    ":" if stop_at_comma => {
                        if pending_conditionals == 0 {
                            return Ok(last);
                        }
                        pending_conditionals -= 1;
                    }
                    _ => {}
                },
                TokenKind::TemplateHead => {
                    j = self.close_of(j)?;
                    last = j;
                    j += 1;
                    continue;
                }
                TokenKind::TemplateMiddle | TokenKind::TemplateTail => return Ok(last),
                TokenKind::Ident if j > i && matches!(text, "else" | "catch" | "finally") => {
                    return Ok(last);
                }
                _ => {}
            }
            last = j;
            j += 1;
        }
        Ok(last)
    }

    fn concise_body_end(&self, i: usize) -> Result<usize, TransformError> {
        self.expression_end(i, true)
    }

    /// Whether a line break between `prev` and `next` terminates the statement.
    fn asi_applies(&self, prev: usize, next: usize) -> bool {
        let p = self.toks[prev];
        let n = self.toks[next];
        let p_text = p.text(self.src);
        let n_text = n.text(self.src);

        let can_end = match p.kind {
            TokenKind::Ident => {
                if RESTRICTED_KEYWORDS.contains(&p_text) {
                    return true;
                }
                !OPERATOR_KEYWORDS.contains(&p_text)
            }
            TokenKind::Number
            | TokenKind::String
            | TokenKind::Template
            | TokenKind::TemplateTail
            | TokenKind::Regex => true,
            TokenKind::Punct => matches!(p_text, ")" | "]" | "}" | "++" | "--"),
            TokenKind::TemplateHead | TokenKind::TemplateMiddle => false,
        };
        if !can_end {
            return false;
        }

        match n.kind {
            TokenKind::Punct => !CONTINUATION_PUNCT.contains(&n_text),
            TokenKind::Template | TokenKind::TemplateHead => false,
            TokenKind::Ident => !matches!(n_text, "in" | "instanceof" | "of"),
            _ => true,
        }
    }

    /// End of a unary expression (the operand of `await`).
    fn unary_end(&self, j: usize) -> Result<usize, TransformError> {
        let Some(tok) = self.toks.get(j).copied() else {
            return Err(TransformError::MalformedConstruct {
                construct: "await expression",
                reason: "missing operand".to_string(),
                line: self.toks.last().map_or(1, |t| t.line),
                col: self.toks.last().map_or(1, |t| t.col),
            });
        };
        let text = tok.text(self.src);
        let prefix = match tok.kind {
            TokenKind::Punct => matches!(text, "!" | "~" | "+" | "-" | "++" | "--"),
            TokenKind::Ident => matches!(text, "typeof" | "void" | "delete" | "await"),
            _ => false,
        };
        if prefix {
            return self.unary_end(j + 1);
        }
        let primary = self.primary_end(j)?;
        Ok(self.postfix_end(primary, true))
    }

    fn primary_end(&self, j: usize) -> Result<usize, TransformError> {
        let tok = self.toks[j];
        let text = tok.text(self.src);
        match tok.kind {
            TokenKind::Punct if matches!(text, "(" | "[" | "{") => self.close_of(j),
            TokenKind::TemplateHead => self.close_of(j),
            TokenKind::Ident => match text {
                "function" => self.function_end(j),
                "async" if self.ident_at(j + 1, "function") => self.function_end(j + 1),
                "class" => self.statement_end(j),
                "new" => {
                    if self.punct_at(j + 1, ".") {
                        // new.target
                        return Ok((j + 2).min(self.toks.len() - 1));
                    }
                    let callee = self.primary_end(j + 1)?;
                    let member = self.postfix_end(callee, false);
                    if self.punct_at(member + 1, "(") {
                        self.close_of(member + 1)
                    } else {
                        Ok(member)
                    }
                }
                _ => Ok(j),
            },
            _ => Ok(j),
        }
    }

    /// Extends `e` over member accesses and, if `calls`, call arguments.
    fn postfix_end(&self, mut e: usize, calls: bool) -> usize {
        loop {
            let n = e + 1;
            let Some(tok) = self.toks.get(n) else {
                return e;
            };
            let text = tok.text(self.src);
            e = match tok.kind {
                TokenKind::Punct => match text {
                    "." if n + 1 < self.toks.len() => n + 1,
                    "?." if calls => {
                        if self.punct_at(n + 1, "(") || self.punct_at(n + 1, "[") {
                            self.matching.get(&(n + 1)).copied().unwrap_or(n + 1)
                        } else {
                            (n + 1).min(self.toks.len() - 1)
                        }
                    }
                    "[" => self.matching.get(&n).copied().unwrap_or(n),
                    "(" if calls => self.matching.get(&n).copied().unwrap_or(n),
                    "++" | "--" if calls && !tok.newline_before => return n,
                    _ => return e,
                },
                TokenKind::Template => n,
                TokenKind::TemplateHead => self.matching.get(&n).copied().unwrap_or(n),
                _ => return e,
            };
        }
    }

    /// Finds the end of a directive prologue (`"use strict";`) starting at `i`.
    /// Returns the byte offset after it and whether it ended with `;`.
    fn directive_end(&self, i: usize) -> Option<(usize, bool)> {
        let mut j = i;
        let mut end = None;
        while let Some(t) = self.toks.get(j) {
            if t.kind != TokenKind::String {
                break;
            }
            let next = self.toks.get(j + 1);
            match next {
                Some(n) if n.is_punct(self.src, ";") => {
                    end = Some((n.end, true));
                    j += 2;
                }
                Some(n) if n.newline_before || n.is_punct(self.src, "}") => {
                    end = Some((t.end, false));
                    j += 1;
                }
                None => {
                    end = Some((t.end, false));
                    j += 1;
                }
                _ => break,
            }
        }
        end
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn reject_reserved_identifiers(&self) -> Result<(), TransformError> {
        for t in self.toks {
            if t.kind == TokenKind::Ident && t.text(self.src).starts_with(RESERVED_PREFIX) {
                return Err(TransformError::ReservedIdentifier {
                    name: t.text(self.src).to_string(),
                    line: t.line,
                    col: t.col,
                });
            }
        }
        Ok(())
    }

    fn open_at(&mut self, offset: usize, extent: usize, text: String) {
        self.insertions.push(Insertion {
            offset,
            opener: true,
            extent,
            text,
        });
    }

    fn close_at(&mut self, offset: usize, extent: usize, text: String) {
        self.insertions.push(Insertion {
            offset,
            opener: false,
            extent,
            text,
        });
    }

    fn ident_at(&self, i: usize, word: &str) -> bool {
        self.toks.get(i).is_some_and(|t| t.is_ident(self.src, word))
    }

    fn punct_at(&self, i: usize, punct: &str) -> bool {
        self.toks.get(i).is_some_and(|t| t.is_punct(self.src, punct))
    }

    fn close_of(&self, open: usize) -> Result<usize, TransformError> {
        self.matching.get(&open).copied().ok_or_else(|| {
            let t = self.toks[open];
            TransformError::UnclosedDelimiter {
                delimiter: t.text(self.src).chars().next().unwrap_or('?'),
                line: t.line,
                col: t.col,
            }
        })
    }

    fn open_of(&self, close: usize) -> Option<usize> {
        self.matching
            .iter()
            .find(|(open, c)| **c == close && **open < close)
            .map(|(open, _)| *open)
    }

    fn expect_parens(
        &self,
        i: usize,
        construct: &'static str,
        tok: Token,
    ) -> Result<usize, TransformError> {
        if !self.punct_at(i, "(") {
            return Err(malformed(construct, "expected '(' to open the header", tok));
        }
        self.close_of(i)
    }

    fn expect_block(
        &self,
        i: usize,
        construct: &'static str,
        tok: Token,
    ) -> Result<usize, TransformError> {
        if !self.punct_at(i, "{") {
            return Err(malformed(construct, "expected '{' to open a block", tok));
        }
        self.close_of(i)
    }
}

fn site(kind: &str, tok: Token) -> String {
    format!("{kind}@{}:{}", tok.line, tok.col)
}

fn malformed(construct: &'static str, reason: &str, tok: Token) -> TransformError {
    TransformError::MalformedConstruct {
        construct,
        reason: reason.to_string(),
        line: tok.line,
        col: tok.col,
    }
}

/// Pairs every opening bracket (and template head/middle) with its closer.
fn match_delimiters(src: &str, toks: &[Token]) -> Result<HashMap<usize, usize>, TransformError> {
    let mut matching = HashMap::new();
    let mut stack: Vec<(usize, char)> = Vec::new();

    let mut close = |stack: &mut Vec<(usize, char)>, i: usize, found: char| {
        let t = toks[i];
        match stack.pop() {
            Some((open, expected)) if expected == found => {
                matching.insert(open, i);
                Ok(())
            }
            Some((_, expected)) => Err(TransformError::UnbalancedDelimiter {
                expected,
                found,
                line: t.line,
                col: t.col,
            }),
            None => Err(TransformError::MalformedConstruct {
                construct: "delimiter",
                reason: format!("'{found}' has no matching opener"),
                line: t.line,
                col: t.col,
            }),
        }
    };

    for (i, t) in toks.iter().enumerate() {
        match t.kind {
            TokenKind::Punct => match t.text(src) {
                "(" => stack.push((i, ')')),
                "[" => stack.push((i, ']')),
                "{" => stack.push((i, '}')),
                ")" => close(&mut stack, i, ')')?,
                "]" => close(&mut stack, i, ']')?,
                "}" => close(&mut stack, i, '}')?,
                _ => {}
            },
            TokenKind::TemplateHead => stack.push((i, '`')),
            TokenKind::TemplateMiddle => {
                close(&mut stack, i, '`')?;
                stack.push((i, '`'));
            }
            TokenKind::TemplateTail => close(&mut stack, i, '`')?,
            _ => {}
        }
    }

    if let Some((open, _)) = stack.pop() {
        let t = toks[open];
        return Err(TransformError::UnclosedDelimiter {
            delimiter: t.text(src).chars().next().unwrap_or('?'),
            line: t.line,
            col: t.col,
        });
    }
    Ok(matching)
}
