//! Tokenizer for the plugin scripting dialect (JavaScript).
//!
//! The instrumenter only needs enough structure to find loops, function
//! bodies and `await` operands, so tokens carry byte spans into the original
//! source instead of owned text. Comments and whitespace are dropped; the
//! `newline_before` flag keeps what automatic semicolon insertion needs.

use crate::error::TransformError;

/// Category of a lexed token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Identifier or keyword (including `#private` names).
    Ident,
    Number,
    String,
    /// A template literal without substitutions: `` `abc` ``.
    Template,
    /// Template text up to the first `${`.
    TemplateHead,
    /// Template text between `}` and the next `${`.
    TemplateMiddle,
    /// Template text from `}` to the closing backtick.
    TemplateTail,
    Regex,
    Punct,
}

/// A token with its byte span and 1-based position in the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub start: usize,
    pub end: usize,
    pub line: u32,
    pub col: u32,
    /// A line terminator (or a comment containing one) precedes this token.
    pub newline_before: bool,
}

impl Token {
    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        &source[self.start..self.end]
    }

    pub fn is_punct(&self, source: &str, punct: &str) -> bool {
        self.kind == TokenKind::Punct && self.text(source) == punct
    }

    pub fn is_ident(&self, source: &str, word: &str) -> bool {
        self.kind == TokenKind::Ident && self.text(source) == word
    }
}

/// Punctuators, longest first so the scanner can take the first prefix match.
const PUNCTUATORS: &[&str] = &[
    ">>>=", "...", "===", "!==", "**=", "<<=", ">>=", ">>>", "&&=", "||=", "??=", "=>", "==",
    "!=", "<=", ">=", "&&", "||", "??", "?.", "++", "--", "+=", "-=", "*=", "/=", "%=", "&=",
    "|=", "^=", "**", "<<", ">>", "{", "}", "(", ")", "[", "]", ";", ",", "<", ">", "+", "-",
    "*", "/", "%", "&", "|", "^", "!", "~", "?", ":", "=", ".", "@",
];

/// Keywords after which a `/` starts a regular expression rather than a division.
const REGEX_PRECEDING_KEYWORDS: &[&str] = &[
    "return", "typeof", "instanceof", "in", "of", "new", "delete", "void", "throw", "case", "do",
    "else", "yield", "await",
];

/// Splits `source` into tokens.
pub fn tokenize(source: &str) -> Result<Vec<Token>, TransformError> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    line: u32,
    col: u32,
    tokens: Vec<Token>,
    newline_pending: bool,
    /// Open `{` count, so a `}` can be matched against template substitutions.
    brace_depth: usize,
    /// Brace depth at which each open `${` substitution started.
    template_stack: Vec<usize>,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            line: 1,
            col: 1,
            tokens: Vec::new(),
            newline_pending: false,
            brace_depth: 0,
            template_stack: Vec::new(),
        }
    }

    fn run(mut self) -> Result<Vec<Token>, TransformError> {
        // Hashbang lines are only legal at offset zero.
        if self.src.starts_with("#!") {
            while let Some(c) = self.peek() {
                if c == '\n' {
                    break;
                }
                self.bump();
            }
        }

        while let Some(c) = self.peek() {
            let (line, col, start) = (self.line, self.col, self.pos);
            match c {
                '\n' | '\r' | '\u{2028}' | '\u{2029}' => {
                    self.bump();
                    self.newline_pending = true;
                }
                c if c.is_whitespace() || c == '\u{feff}' => {
                    self.bump();
                }
                '/' if self.peek_at(1) == Some('/') => self.skip_line_comment(),
                '/' if self.peek_at(1) == Some('*') => self.skip_block_comment(line, col)?,
                '"' | '\'' => {
                    self.scan_string(c, line, col)?;
                    self.push(TokenKind::String, start, line, col);
                }
                '`' => {
                    self.bump();
                    let kind = self.scan_template_chars(line, col, true)?;
                    self.push(kind, start, line, col);
                }
                '}' if self.template_stack.last() == Some(&self.brace_depth) => {
                    self.template_stack.pop();
                    self.bump();
                    let kind = self.scan_template_chars(line, col, false)?;
                    self.push(kind, start, line, col);
                }
                '/' if self.regex_allowed() => {
                    self.scan_regex(line, col)?;
                    self.push(TokenKind::Regex, start, line, col);
                }
                c if c.is_ascii_digit()
                    || (c == '.' && self.peek_at(1).is_some_and(|n| n.is_ascii_digit())) =>
                {
                    self.scan_number();
                    self.push(TokenKind::Number, start, line, col);
                }
                c if is_ident_start(c) || (c == '#' && self.peek_at(1).is_some_and(is_ident_start)) => {
                    self.bump();
                    while self.peek().is_some_and(is_ident_part) {
                        self.bump();
                    }
                    self.push(TokenKind::Ident, start, line, col);
                }
                '\\' if self.peek_at(1) == Some('u') => {
                    // Identifier spelled with a unicode escape, e.g. `\u0061bc`.
                    let mut in_braces = false;
                    while let Some(n) = self.peek() {
                        match n {
                            '{' if self.src[..self.pos].ends_with("\\u") => in_braces = true,
                            '}' if in_braces => in_braces = false,
                            n if is_ident_part(n) || n == '\\' => {}
                            _ => break,
                        }
                        self.bump();
                    }
                    self.push(TokenKind::Ident, start, line, col);
                }
                _ => {
                    let rest = &self.src[self.pos..];
                    let Some(&punct) = PUNCTUATORS.iter().find(|p| rest.starts_with(**p)) else {
                        return Err(TransformError::UnexpectedCharacter { ch: c, line, col });
                    };
                    // `?.5` is a conditional followed by a number, not optional chaining.
                    let punct: &str = if punct == "?." && self.peek_at(2).is_some_and(|n| n.is_ascii_digit()) {
                        "?"
                    } else {
                        punct
                    };
                    for _ in 0..punct.len() {
                        self.bump();
                    }
                    match punct {
                        "{" => self.brace_depth += 1,
                        "}" => self.brace_depth = self.brace_depth.saturating_sub(1),
                        _ => {}
                    }
                    self.push(TokenKind::Punct, start, line, col);
                }
            }
        }

        if let Some(tok) = self.last_template_start() {
            return Err(TransformError::UnterminatedTemplate {
                line: tok.0,
                col: tok.1,
            });
        }

        Ok(self.tokens)
    }

    fn push(&mut self, kind: TokenKind, start: usize, line: u32, col: u32) {
        self.tokens.push(Token {
            kind,
            start,
            end: self.pos,
            line,
            col,
            newline_before: self.newline_pending,
        });
        self.newline_pending = false;
        if kind == TokenKind::TemplateHead || kind == TokenKind::TemplateMiddle {
            self.template_stack.push(self.brace_depth);
        }
    }

    fn last_template_start(&self) -> Option<(u32, u32)> {
        if self.template_stack.is_empty() {
            return None;
        }
        self.tokens
            .iter()
            .rev()
            .find(|t| matches!(t.kind, TokenKind::TemplateHead | TokenKind::TemplateMiddle))
            .map(|t| (t.line, t.col))
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.src[self.pos..].chars().nth(n)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        if c == '\n' || c == '\u{2028}' || c == '\u{2029}' || (c == '\r' && self.peek() != Some('\n')) {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn skip_line_comment(&mut self) {
        while let Some(c) = self.peek() {
            if matches!(c, '\n' | '\r' | '\u{2028}' | '\u{2029}') {
                break;
            }
            self.bump();
        }
    }

    fn skip_block_comment(&mut self, line: u32, col: u32) -> Result<(), TransformError> {
        self.bump();
        self.bump();
        loop {
            match self.bump() {
                Some('*') if self.peek() == Some('/') => {
                    self.bump();
                    return Ok(());
                }
                Some('\n' | '\r' | '\u{2028}' | '\u{2029}') => self.newline_pending = true,
                Some(_) => {}
                None => return Err(TransformError::UnterminatedComment { line, col }),
            }
        }
    }

    fn scan_string(&mut self, quote: char, line: u32, col: u32) -> Result<(), TransformError> {
        self.bump();
        loop {
            match self.bump() {
                Some(c) if c == quote => return Ok(()),
                Some('\\') => {
                    // Escapes may continue the string across a line break.
                    if self.bump().is_none() {
                        return Err(TransformError::UnterminatedString { line, col });
                    }
                }
                Some('\n' | '\r') | None => {
                    return Err(TransformError::UnterminatedString { line, col })
                }
                Some(_) => {}
            }
        }
    }

    /// Scans template characters after an opening backtick or a closing `}`.
    fn scan_template_chars(
        &mut self,
        line: u32,
        col: u32,
        opened_here: bool,
    ) -> Result<TokenKind, TransformError> {
        loop {
            match self.bump() {
                Some('`') => {
                    return Ok(if opened_here {
                        TokenKind::Template
                    } else {
                        TokenKind::TemplateTail
                    })
                }
                Some('\\') => {
                    if self.bump().is_none() {
                        return Err(TransformError::UnterminatedTemplate { line, col });
                    }
                }
                Some('$') if self.peek() == Some('{') => {
                    self.bump();
                    return Ok(if opened_here {
                        TokenKind::TemplateHead
                    } else {
                        TokenKind::TemplateMiddle
                    });
                }
                Some(_) => {}
                None => return Err(TransformError::UnterminatedTemplate { line, col }),
            }
        }
    }

    fn regex_allowed(&self) -> bool {
        let Some(prev) = self.tokens.last() else {
            return true;
        };
        let text = prev.text(self.src);
        match prev.kind {
            TokenKind::Number
            | TokenKind::String
            | TokenKind::Template
            | TokenKind::TemplateTail
            | TokenKind::Regex => false,
            TokenKind::TemplateHead | TokenKind::TemplateMiddle => true,
            TokenKind::Ident => REGEX_PRECEDING_KEYWORDS.contains(&text),
            TokenKind::Punct => !matches!(text, ")" | "]" | "}" | "++" | "--"),
        }
    }

    fn scan_regex(&mut self, line: u32, col: u32) -> Result<(), TransformError> {
        self.bump();
        let mut in_class = false;
        loop {
            match self.bump() {
                Some('\\') => {
                    if matches!(self.bump(), None | Some('\n' | '\r')) {
                        return Err(TransformError::UnterminatedRegex { line, col });
                    }
                }
                Some('[') => in_class = true,
                Some(']') => in_class = false,
                Some('/') if !in_class => break,
                Some('\n' | '\r') | None => {
                    return Err(TransformError::UnterminatedRegex { line, col })
                }
                Some(_) => {}
            }
        }
        while self.peek().is_some_and(is_ident_part) {
            self.bump();
        }
        Ok(())
    }

    fn scan_number(&mut self) {
        let hex = self.peek() == Some('0') && matches!(self.peek_at(1), Some('x' | 'X'));
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                let exponent = !hex && matches!(c, 'e' | 'E');
                self.bump();
                if exponent && matches!(self.peek(), Some('+' | '-')) {
                    self.bump();
                }
            } else {
                break;
            }
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c == '_' || c == '$' || c.is_alphabetic()
}

fn is_ident_part(c: char) -> bool {
    c == '_' || c == '$' || c.is_alphanumeric() || c == '\u{200c}' || c == '\u{200d}'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds_and_texts(src: &str) -> Vec<(TokenKind, String)> {
        tokenize(src)
            .expect("should tokenize")
            .iter()
            .map(|t| (t.kind, t.text(src).to_string()))
            .collect()
    }

    #[test]
    fn test_basic_tokens() {
        let toks = kinds_and_texts("let x = a >>>= 3; // trailing\nfoo?.bar");
        let texts: Vec<&str> = toks.iter().map(|(_, t)| t.as_str()).collect();
        assert_eq!(
            texts,
            vec!["let", "x", "=", "a", ">>>=", "3", ";", "foo", "?.", "bar"]
        );
    }

    #[test]
    fn test_newline_before_flag() {
        let src = "a\n/* multi\nline */ b c";
        let toks = tokenize(src).unwrap();
        assert!(!toks[0].newline_before);
        assert!(toks[1].newline_before);
        assert!(!toks[2].newline_before);
    }

    #[test]
    fn test_regex_vs_division() {
        let toks = kinds_and_texts("x = a / b; y = /ab+c/gi.test(s); return /[/]/");
        assert!(toks.contains(&(TokenKind::Punct, "/".to_string())));
        assert!(toks.contains(&(TokenKind::Regex, "/ab+c/gi".to_string())));
        assert!(toks.contains(&(TokenKind::Regex, "/[/]/".to_string())));
    }

    #[test]
    fn test_template_with_substitutions() {
        let src = "`a ${ {b: 1}.b } c ${d} e`";
        let toks = kinds_and_texts(src);
        assert_eq!(toks[0], (TokenKind::TemplateHead, "`a ${".to_string()));
        assert_eq!(toks.last().unwrap(), &(TokenKind::TemplateTail, "} e`".to_string()));
        assert!(toks.contains(&(TokenKind::TemplateMiddle, "} c ${".to_string())));
    }

    #[test]
    fn test_optional_chain_vs_conditional_number() {
        let toks = kinds_and_texts("a?.5:1");
        assert_eq!(toks[1], (TokenKind::Punct, "?".to_string()));
        assert_eq!(toks[2], (TokenKind::Number, ".5".to_string()));
    }

    #[test]
    fn test_numbers() {
        let toks = kinds_and_texts("1e-3 0xFF 1_000n .5");
        assert!(toks.iter().all(|(k, _)| *k == TokenKind::Number));
        assert_eq!(toks.len(), 4);
    }

    #[test]
    fn test_positions_are_one_based() {
        let toks = tokenize("a\n  b").unwrap();
        assert_eq!((toks[0].line, toks[0].col), (1, 1));
        assert_eq!((toks[1].line, toks[1].col), (2, 3));
    }

    #[test]
    fn test_unterminated_literals() {
        assert_eq!(
            tokenize("x = 'abc").unwrap_err(),
            TransformError::UnterminatedString { line: 1, col: 5 }
        );
        assert!(matches!(
            tokenize("/* never closed").unwrap_err(),
            TransformError::UnterminatedComment { .. }
        ));
        assert!(matches!(
            tokenize("`open ${x").unwrap_err(),
            TransformError::UnterminatedTemplate { .. }
        ));
        assert!(matches!(
            tokenize("x = /abc").unwrap_err(),
            TransformError::UnterminatedRegex { .. }
        ));
    }

    #[test]
    fn test_unexpected_character() {
        assert_eq!(
            tokenize("a ¤ b").unwrap_err(),
            TransformError::UnexpectedCharacter {
                ch: '¤',
                line: 1,
                col: 3
            }
        );
    }

    #[test]
    fn test_hashbang_and_private_names() {
        let toks = kinds_and_texts("#!/usr/bin/env node\nclass A { #x = 1 }");
        assert_eq!(toks[0].1, "class");
        assert!(toks.contains(&(TokenKind::Ident, "#x".to_string())));
    }
}
