// Parser for schedule directive scripts.
//
// Parses a token stream (from the lexer) into a `Script` AST. Grammar:
//
//   script     := NL* (statement (NL+ statement)*)? NL*
//   statement  := stage_decl | chain
//   stage_decl := 'stage' IDENT '(' (IDENT (',' IDENT)*)? ')'
//   chain      := IDENT ('.' IDENT '(' (arg (',' arg)*)? ')')+
//   arg        := STRING | expr
//   expr       := or-level expression with C-like precedence;
//                 `min(a, b)` / `max(a, b)` are calls
//
// Preconditions: input is a valid token stream from `lexer::lex()`.
// Postconditions: returns an AST plus any parse errors (non-fatal).
// Failure modes: syntax errors produce `Rich` diagnostics; parsing continues.
// Side effects: none.

use chumsky::input::{Stream, ValueInput};
use chumsky::prelude::*;
use chumsky::span::SimpleSpan;

use crate::ast::*;
use crate::expr::{BinOp, Expr};
use crate::lexer::Token;

/// Result of parsing: AST plus any errors.
#[derive(Debug)]
pub struct ParseResult {
    pub script: Option<Script>,
    pub errors: Vec<Rich<'static, Token, SimpleSpan>>,
}

/// Parse a directive script. Lexes then parses.
pub fn parse(source: &str) -> ParseResult {
    let lex_result = crate::lexer::lex(source);
    let len = source.len();

    let token_iter = lex_result.tokens.into_iter().map(|(tok, span)| {
        let cspan: SimpleSpan = (span.start..span.end).into();
        (tok, cspan)
    });
    let eoi: SimpleSpan = (len..len).into();
    let stream = Stream::from_iter(token_iter).map(eoi, |(t, s): (_, _)| (t, s));

    let parser = script_parser(source);
    let (script, parse_errors) = parser.parse(stream).into_output_errors();

    let mut all_errors: Vec<Rich<'static, Token, SimpleSpan>> = lex_result
        .errors
        .into_iter()
        .map(|e| {
            let span: SimpleSpan = (e.span.start..e.span.end).into();
            Rich::custom(span, e.message)
        })
        .collect();
    all_errors.extend(parse_errors.into_iter().map(|e| e.into_owned()));

    ParseResult {
        script,
        errors: all_errors,
    }
}

#[derive(Debug, Clone, Copy)]
enum Unary {
    Neg,
    Not,
}

fn apply_unary(operand: Expr, op: Unary) -> Expr {
    match (op, operand) {
        (Unary::Neg, Expr::Int(n)) => match n.checked_neg() {
            Some(neg) => Expr::Int(neg),
            None => Expr::binary(BinOp::Sub, Expr::Int(0), Expr::Int(n)),
        },
        (Unary::Neg, e) => Expr::binary(BinOp::Sub, Expr::Int(0), e),
        (Unary::Not, e) => Expr::not(e),
    }
}

/// Left-associative fold of `first (op rhs)*`.
fn fold_chain((first, rest): (Expr, Vec<(BinOp, Expr)>)) -> Expr {
    rest.into_iter()
        .fold(first, |acc, (op, rhs)| Expr::binary(op, acc, rhs))
}

// ── Main parser builder ──

fn script_parser<'tokens, 'src: 'tokens, I>(
    source: &'src str,
) -> impl Parser<'tokens, I, Script, extra::Err<Rich<'tokens, Token, SimpleSpan>>> + 'src
where
    'tokens: 'src,
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    let nl = just(Token::Newline).repeated().ignored();

    let ident = just(Token::Ident).map_with(move |_, e| {
        let span: SimpleSpan = e.span();
        Ident {
            name: source[span.start()..span.end()].to_string(),
            span,
        }
    });

    // ── Expressions ──

    let expr = recursive(|expr| {
        let literal = select! {
            Token::Int(n) => Expr::Int(n),
            Token::True => Expr::Bool(true),
            Token::False => Expr::Bool(false),
        };

        let min_max = select! {
            Token::Min => BinOp::Min,
            Token::Max => BinOp::Max,
        }
        .then(
            expr.clone()
                .then_ignore(just(Token::Comma))
                .then(expr.clone())
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        )
        .map(|(op, (a, b))| Expr::binary(op, a, b));

        let var = ident.clone().map(|id: Ident| Expr::Var(id.name));

        let atom = literal
            .or(min_max)
            .or(var)
            .or(expr
                .clone()
                .delimited_by(just(Token::LParen), just(Token::RParen)));

        let unary = just(Token::Minus)
            .to(Unary::Neg)
            .or(just(Token::Bang).to(Unary::Not))
            .repeated()
            .collect::<Vec<_>>()
            .then(atom)
            .map(|(ops, operand)| ops.into_iter().rev().fold(operand, apply_unary));

        let product = unary
            .clone()
            .then(
                select! {
                    Token::Star => BinOp::Mul,
                    Token::Slash => BinOp::Div,
                    Token::Percent => BinOp::Mod,
                }
                .then(unary)
                .repeated()
                .collect::<Vec<_>>(),
            )
            .map(fold_chain);

        let sum = product
            .clone()
            .then(
                select! {
                    Token::Plus => BinOp::Add,
                    Token::Minus => BinOp::Sub,
                }
                .then(product)
                .repeated()
                .collect::<Vec<_>>(),
            )
            .map(fold_chain);

        // Comparisons do not chain.
        let comparison = sum
            .clone()
            .then(
                select! {
                    Token::EqEq => BinOp::Eq,
                    Token::NotEq => BinOp::Ne,
                    Token::Lt => BinOp::Lt,
                    Token::Le => BinOp::Le,
                    Token::Gt => BinOp::Gt,
                    Token::Ge => BinOp::Ge,
                }
                .then(sum)
                .or_not(),
            )
            .map(|(lhs, rest)| match rest {
                Some((op, rhs)) => Expr::binary(op, lhs, rhs),
                None => lhs,
            });

        let conjunction = comparison
            .clone()
            .then(
                just(Token::AndAnd)
                    .to(BinOp::And)
                    .then(comparison)
                    .repeated()
                    .collect::<Vec<_>>(),
            )
            .map(fold_chain);

        conjunction
            .clone()
            .then(
                just(Token::OrOr)
                    .to(BinOp::Or)
                    .then(conjunction)
                    .repeated()
                    .collect::<Vec<_>>(),
            )
            .map(fold_chain)
    });

    // ── Directive call: IDENT '(' args? ')' ──

    let arg = select! {
        Token::StringLit(s) = e => Arg::Str(s, e.span()),
    }
    .or(expr.map_with(|ex, e| Arg::Expr(ex, e.span())));

    let call = ident
        .clone()
        .then(
            arg.separated_by(just(Token::Comma))
                .collect::<Vec<_>>()
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        )
        .map_with(|(name, args), e| Call {
            name,
            args,
            span: e.span(),
        });

    // ── Statements ──

    let stage_decl = just(Token::Stage)
        .ignore_then(ident.clone())
        .then(
            ident
                .clone()
                .separated_by(just(Token::Comma))
                .collect::<Vec<_>>()
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        )
        .map(|(name, args)| StatementKind::Stage(StageDecl { name, args }));

    let chain = ident
        .then(
            just(Token::Dot)
                .ignore_then(call)
                .repeated()
                .at_least(1)
                .collect::<Vec<_>>(),
        )
        .map(|(target, calls)| StatementKind::Directives(DirectiveChain { target, calls }));

    let statement = choice((stage_decl, chain)).map_with(|kind, e| Statement {
        kind,
        span: e.span(),
    });

    // ── Script ──

    nl.clone()
        .ignore_then(
            statement
                .separated_by(just(Token::Newline).repeated().at_least(1))
                .allow_trailing()
                .collect::<Vec<_>>(),
        )
        .then_ignore(nl)
        .map_with(move |statements, e| Script {
            statements,
            span: e.span(),
        })
}

// ── Tests ──
