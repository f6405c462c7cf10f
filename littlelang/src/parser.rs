//! littlelang Parser
//!
//! Parses source text into a [`TranslationUnit`] using a pest PEG parser.
//! A source file without `fn` definitions is a single function named
//! [`IMPLICIT_ENTRY`].

use pest::iterators::Pair;
use pest::{Parser, Span};
use pest_derive::Parser;

use crate::ast::*;
use crate::{Error, Result};

#[derive(Parser)]
#[grammar = "../grammar/littlelang.pest"]
struct LittleParser;

/// Name of the function a bare block compiles to
pub const IMPLICIT_ENTRY: &str = "main";

/// Parse littlelang source code into a translation unit
pub fn parse(source: &str) -> Result<TranslationUnit> {
    let mut pairs = LittleParser::parse(Rule::program, source).map_err(|e| {
        let (line, column) = match e.line_col {
            pest::error::LineColLocation::Pos((l, c)) => (l, c),
            pest::error::LineColLocation::Span((l, c), _) => (l, c),
        };
        Error::Parse {
            line,
            column,
            message: e.variant.message().to_string(),
        }
    })?;

    let mut unit = TranslationUnit::default();
    if let Some(program) = pairs.next() {
        for pair in program.into_inner() {
            match pair.as_rule() {
                Rule::unit => {
                    for function in pair.into_inner() {
                        unit.functions.push(parse_function(function)?);
                    }
                }
                Rule::block_body => {
                    unit.functions.push(FunctionDefinition {
                        name: IMPLICIT_ENTRY.to_string(),
                        block: parse_block(pair)?,
                    });
                }
                _ => {}
            }
        }
    }
    Ok(unit)
}

fn error_at(span: Span<'_>, message: impl Into<String>) -> Error {
    let (line, column) = span.start_pos().line_col();
    Error::Parse {
        line,
        column,
        message: message.into(),
    }
}

fn next_inner<'i>(
    inner: &mut impl Iterator<Item = Pair<'i, Rule>>,
    span: Span<'i>,
    what: &str,
) -> Result<Pair<'i, Rule>> {
    inner
        .next()
        .ok_or_else(|| error_at(span, format!("expected {}", what)))
}

/// fn name() { ... }
fn parse_function(pair: Pair<Rule>) -> Result<FunctionDefinition> {
    let span = pair.as_span();
    let mut inner = pair
        .into_inner()
        .filter(|p| p.as_rule() != Rule::fn_keyword);
    let name = next_inner(&mut inner, span, "function name")?.as_str().to_string();
    let block = parse_block(next_inner(&mut inner, span, "function body")?)?;
    Ok(FunctionDefinition { name, block })
}

/// Both `block` and `block_body` hold block items directly
fn parse_block(pair: Pair<Rule>) -> Result<Block> {
    let mut block = Block::new();
    for item in pair.into_inner() {
        match item.as_rule() {
            Rule::declaration => block.vars.push(parse_declaration(item)?),
            Rule::assignment => block.statements.push(parse_assignment(item)?),
            Rule::call_stmt => {
                let span = item.as_span();
                let call = next_inner(&mut item.into_inner(), span, "call")?;
                block.statements.push(Statement::Call(parse_call(call)?));
            }
            Rule::if_chain => block.statements.push(parse_if_chain(item)?),
            Rule::while_loop => block.statements.push(parse_loop(item)?),
            other => {
                return Err(error_at(
                    item.as_span(),
                    format!("unexpected {:?} in block", other),
                ))
            }
        }
    }
    Ok(block)
}

/// int64 name;
fn parse_declaration(pair: Pair<Rule>) -> Result<VariableDefinition> {
    let span = pair.as_span();
    let mut inner = pair.into_inner();
    let ty = match next_inner(&mut inner, span, "type")?.as_str() {
        "int64" => VarType::Int64,
        other => return Err(error_at(span, format!("unknown type {}", other))),
    };
    let name = next_inner(&mut inner, span, "variable name")?.as_str().to_string();
    Ok(VariableDefinition { name, ty })
}

/// name = expr;
fn parse_assignment(pair: Pair<Rule>) -> Result<Statement> {
    let span = pair.as_span();
    let mut inner = pair.into_inner();
    let target = next_inner(&mut inner, span, "assignment target")?.as_str().to_string();
    let value = parse_expr(next_inner(&mut inner, span, "expression")?)?;
    Ok(Statement::Assign(Assignment { target, value }))
}

/// name(expr, ...)
fn parse_call(pair: Pair<Rule>) -> Result<FunctionCall> {
    let span = pair.as_span();
    let mut inner = pair.into_inner();
    let name = next_inner(&mut inner, span, "function name")?.as_str().to_string();
    let params = inner.map(parse_expr).collect::<Result<Vec<_>>>()?;
    Ok(FunctionCall { name, params })
}

fn parse_if_chain(pair: Pair<Rule>) -> Result<Statement> {
    let mut arms = Vec::new();
    for arm in pair.into_inner() {
        let span = arm.as_span();
        let rule = arm.as_rule();
        let mut inner = arm.into_inner();
        let condition = match rule {
            Rule::if_arm | Rule::else_if_arm => {
                Some(parse_condition(next_inner(&mut inner, span, "condition")?)?)
            }
            _ => None,
        };
        let block = parse_block(next_inner(&mut inner, span, "block")?)?;
        arms.push(ConditionalBlock { condition, block });
    }
    Ok(Statement::IfChain(IfChain { arms }))
}

fn parse_loop(pair: Pair<Rule>) -> Result<Statement> {
    let span = pair.as_span();
    let mut inner = pair.into_inner();
    let condition = parse_condition(next_inner(&mut inner, span, "condition")?)?;
    let body = parse_block(next_inner(&mut inner, span, "loop body")?)?;
    Ok(Statement::Loop(Loop { condition, body }))
}

/// ( expr CMP expr )
fn parse_condition(pair: Pair<Rule>) -> Result<Condition> {
    let span = pair.as_span();
    let mut inner = pair.into_inner();
    let lhs = parse_expr(next_inner(&mut inner, span, "expression")?)?;
    let comparator = next_inner(&mut inner, span, "comparator")?;
    let comparator = match comparator.as_str() {
        "==" => Comparator::Equal,
        "!=" => Comparator::NotEqual,
        "<" => Comparator::LessThan,
        "<=" => Comparator::LessThanOrEqual,
        ">" => Comparator::GreaterThan,
        ">=" => Comparator::GreaterThanOrEqual,
        other => {
            return Err(error_at(
                comparator.as_span(),
                format!("unknown comparator {}", other),
            ))
        }
    };
    let rhs = parse_expr(next_inner(&mut inner, span, "expression")?)?;
    Ok(Condition {
        comparator,
        lhs,
        rhs,
    })
}

/// term (+ term)*
fn parse_expr(pair: Pair<Rule>) -> Result<Param> {
    parse_left_assoc(pair, Operation::Add, parse_term)
}

/// atom (% atom)*
fn parse_term(pair: Pair<Rule>) -> Result<Param> {
    parse_left_assoc(pair, Operation::Mod, parse_operand)
}

fn parse_left_assoc(
    pair: Pair<Rule>,
    op: Operation,
    operand: fn(Pair<Rule>) -> Result<Param>,
) -> Result<Param> {
    let span = pair.as_span();
    // Operator tokens sit between the operands
    let mut operands = pair
        .into_inner()
        .filter(|p| !matches!(p.as_rule(), Rule::add_op | Rule::mod_op));
    let mut value = operand(next_inner(&mut operands, span, "operand")?)?;
    for next in operands {
        value = Param::calc(op, value, operand(next)?);
    }
    Ok(value)
}

fn parse_operand(pair: Pair<Rule>) -> Result<Param> {
    match pair.as_rule() {
        Rule::integer => {
            let value = pair
                .as_str()
                .parse::<i64>()
                .map_err(|_| error_at(pair.as_span(), "integer literal out of range"))?;
            Ok(Param::Int64(value))
        }
        Rule::string => {
            let span = pair.as_span();
            let inner = next_inner(&mut pair.into_inner(), span, "string contents")?;
            Ok(Param::Str(unescape(inner.as_str())))
        }
        Rule::ident => Ok(Param::Variable(pair.as_str().to_string())),
        Rule::expr => parse_expr(pair),
        Rule::term => parse_term(pair),
        other => Err(error_at(
            pair.as_span(),
            format!("unexpected {:?} in expression", other),
        )),
    }
}

/// The grammar only admits `\n \t \\ \"`
fn unescape(raw: &str) -> String {
    let mut text = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            text.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => text.push('\n'),
            Some('t') => text.push('\t'),
            Some(other) => text.push(other),
            None => text.push('\\'),
        }
    }
    text
}
