use crate::{compile_error, Error};
use logos::{FilterResult, Lexer, Logos};
use std::ops::Range;

#[derive(Logos, Clone, PartialEq, Debug)]
#[logos(skip r"[ \t\r\n\f]+|//[^\n]*|#[^\n]*")]
pub(super) enum Token {
    /// 块注释，总是被跳过。
    #[token("/*", block_comment)]
    Comment,

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[regex(r"[0-9]+", decimal)]
    #[regex(r"0[xX][0-9a-fA-F]+", hexadecimal)]
    Int(u64),

    /// 带 `u` 后缀的整数字面量。
    #[regex(r"[0-9]+[uU]", decimal)]
    #[regex(r"0[xX][0-9a-fA-F]+[uU]", hexadecimal)]
    UInt(u64),

    #[regex(r"[0-9]+\.[0-9]*([eE][+-]?[0-9]+)?[fFhH]?", float)]
    #[regex(r"\.[0-9]+([eE][+-]?[0-9]+)?[fFhH]?", float)]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+[fFhH]?", float)]
    Float(f64),

    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(";")]
    Semi,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,
    #[token("?")]
    Question,
    #[token(":")]
    Colon,
    #[token("::")]
    ColonColon,

    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    #[token("^")]
    Caret,
    #[token("~")]
    Tilde,
    #[token("!")]
    Bang,
    #[token("<<")]
    Shl,
    #[token(">>")]
    Shr,

    #[token("<")]
    Lt,
    #[token("<=")]
    Le,
    #[token(">")]
    Gt,
    #[token(">=")]
    Ge,
    #[token("==")]
    EqEq,
    #[token("!=")]
    Ne,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,

    #[token("=")]
    Assign,
    #[token("+=")]
    PlusAssign,
    #[token("-=")]
    MinusAssign,
    #[token("*=")]
    StarAssign,
    #[token("/=")]
    SlashAssign,
    #[token("++")]
    PlusPlus,
    #[token("--")]
    MinusMinus,
}

fn block_comment(lex: &mut Lexer<Token>) -> FilterResult<(), ()> {
    match lex.remainder().find("*/") {
        Some(end) => {
            lex.bump(end + 2);
            FilterResult::Skip
        }
        None => {
            lex.bump(lex.remainder().len());
            FilterResult::Error(())
        }
    }
}

fn decimal(lex: &mut Lexer<Token>) -> Option<u64> {
    lex.slice().trim_end_matches(['u', 'U']).parse().ok()
}

fn hexadecimal(lex: &mut Lexer<Token>) -> Option<u64> {
    let digits = lex.slice()[2..].trim_end_matches(['u', 'U']);
    u64::from_str_radix(digits, 16).ok()
}

fn float(lex: &mut Lexer<Token>) -> Option<f64> {
    lex.slice()
        .trim_end_matches(['f', 'F', 'h', 'H'])
        .parse()
        .ok()
}

/// 源码中偏移所在的行号，从 1 开始。
pub(super) fn line_of(src: &str, offset: usize) -> usize {
    src[..offset.min(src.len())].bytes().filter(|&b| b == b'\n').count() + 1
}

pub(super) fn tokenize(src: &str) -> Result<Vec<(Token, Range<usize>)>, Error> {
    Token::lexer(src)
        .spanned()
        .map(|(token, span)| match token {
            Ok(token) => Ok((token, span)),
            Err(()) => Err(compile_error(format!(
                "line {}: unexpected `{}`",
                line_of(src, span.start),
                &src[span],
            ))),
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::{tokenize, Token::*};

    #[test]
    fn test_tokens() {
        let src = r#"
#include <metal_stdlib>
// comment
kernel void f(device float *a [[buffer(0)]]) { /* block
comment */ a[0x10u] += 1.5f * .5 - 2u; }
"#;
        let tokens = tokenize(src)
            .unwrap()
            .into_iter()
            .map(|(t, _)| t)
            .collect::<Vec<_>>();
        assert_eq!(
            tokens,
            [
                Ident("kernel".into()),
                Ident("void".into()),
                Ident("f".into()),
                LParen,
                Ident("device".into()),
                Ident("float".into()),
                Star,
                Ident("a".into()),
                LBracket,
                LBracket,
                Ident("buffer".into()),
                LParen,
                Int(0),
                RParen,
                RBracket,
                RBracket,
                RParen,
                LBrace,
                Ident("a".into()),
                LBracket,
                UInt(16),
                RBracket,
                PlusAssign,
                Float(1.5),
                Star,
                Float(0.5),
                Minus,
                UInt(2),
                Semi,
                RBrace,
            ]
        );
    }

    #[test]
    fn test_operators() {
        let tokens = tokenize("a<=b<<c&&d||!e::f")
            .unwrap()
            .into_iter()
            .map(|(t, _)| t)
            .collect::<Vec<_>>();
        assert_eq!(
            tokens,
            [
                Ident("a".into()),
                Le,
                Ident("b".into()),
                Shl,
                Ident("c".into()),
                AndAnd,
                Ident("d".into()),
                OrOr,
                Bang,
                Ident("e".into()),
                ColonColon,
                Ident("f".into()),
            ]
        );
    }

    #[test]
    fn test_block_comments() {
        let tokens = tokenize("/* doc */a/**/b/* x * y ** / */ /***/c")
            .unwrap()
            .into_iter()
            .map(|(t, _)| t)
            .collect::<Vec<_>>();
        assert_eq!(tokens, [Ident("a".into()), Ident("b".into()), Ident("c".into())]);

        let e = tokenize("a\n/* never closed").unwrap_err();
        assert!(e.info.starts_with("line 2"), "{}", e.info);
    }

    #[test]
    fn test_bad_character() {
        let e = tokenize("kernel void f() {\n  @\n}").unwrap_err();
        assert!(e.info.starts_with("line 2"));
    }
}
