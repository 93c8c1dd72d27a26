//! Surface parser: pest pairs to the untyped AST.
//!
//! One translation function per grammar production, with the expression
//! levels mirroring the precedence ladder in `grammar.pest`. The parser does
//! no semantic validation; a `main` with a bad signature parses fine and is
//! rejected by the checker.

use pest::iterators::{Pair, Pairs};
use pest::Parser;
use pest_derive::Parser;

use crate::script::ast::{
    AttrSpec, AttributedFunction, BinaryOp, Block, ConfigDecl, ConfigField, Declaration, EnumDecl,
    EnumVariant, Expr, ExprKind, ForRange, Function, GlobalVarDecl, Include, IntValue, MapConfig,
    MapKind, Param, Position, Program, Statement, StructDecl, StructField, Type, TypeAlias,
    UnaryOp,
};
use tracing::debug;

#[derive(Parser)]
#[grammar = "script/grammar.pest"]
pub struct KernelScriptParser;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ParseError {
    #[error("{position}: ParseError: {message}")]
    Syntax { position: Position, message: String },
}

impl ParseError {
    fn at(position: Position, message: impl Into<String>) -> Self {
        ParseError::Syntax {
            position,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ParseError>;

fn pos_of(pair: &Pair<Rule>, file: &str) -> Position {
    let (line, column) = pair.as_span().start_pos().line_col();
    Position::new(line, column, file)
}

fn from_pest(err: pest::error::Error<Rule>, file: &str) -> ParseError {
    let (line, column) = match err.line_col {
        pest::error::LineColLocation::Pos((l, c)) => (l, c),
        pest::error::LineColLocation::Span((l, c), _) => (l, c),
    };
    ParseError::at(
        Position::new(line, column, file),
        err.variant.message().to_string(),
    )
}

// Keyword tokens carry a word-boundary guard in the grammar and therefore
// surface as pairs; translation skips them.
fn is_keyword(rule: Rule) -> bool {
    matches!(
        rule,
        Rule::kw_include
            | Rule::kw_struct
            | Rule::kw_type
            | Rule::kw_enum
            | Rule::kw_config
            | Rule::kw_var
            | Rule::kw_fn
            | Rule::kw_if
            | Rule::kw_else
            | Rule::kw_for
            | Rule::kw_in
            | Rule::kw_return
            | Rule::kw_delete
    )
}

fn inner_of<'i>(pair: Pair<'i, Rule>) -> impl Iterator<Item = Pair<'i, Rule>> {
    pair.into_inner().filter(|p| !is_keyword(p.as_rule()))
}

// Fold a `first (op rhs)*` pair stream into (op, rhs) chunks. A trailing
// leftover would mean the grammar emitted an operator without an operand;
// it is dropped rather than panicked on.
fn chunks_of_two<'a>(pairs: Pairs<'a, Rule>) -> Vec<(Pair<'a, Rule>, Pair<'a, Rule>)> {
    let pairs_vec: Vec<_> = pairs.collect();
    let mut result = Vec::new();
    let mut i = 0;
    while i + 1 < pairs_vec.len() {
        result.push((pairs_vec[i].clone(), pairs_vec[i + 1].clone()));
        i += 2;
    }
    result
}

/// Parse one source unit into its AST plus the include directives.
pub fn parse(source: &str, file: &str) -> Result<Program> {
    debug!("parsing {} ({} bytes)", file, source.len());

    let mut pairs =
        KernelScriptParser::parse(Rule::program, source).map_err(|e| from_pest(e, file))?;
    let program_pair = pairs.next().expect("grammar yields one program node");

    let mut declarations = Vec::new();
    let mut includes = Vec::new();

    for pair in program_pair.into_inner() {
        match pair.as_rule() {
            Rule::declaration => {
                let inner = pair.into_inner().next().expect("declaration is non-empty");
                match inner.as_rule() {
                    Rule::include_decl => includes.push(parse_include(inner, file)?),
                    _ => declarations.push(parse_declaration(inner, file)?),
                }
            }
            Rule::EOI => {}
            other => {
                return Err(ParseError::at(
                    pos_of(&pair, file),
                    format!("unexpected top-level rule {other:?}"),
                ))
            }
        }
    }

    debug!(
        "parsed {} declarations, {} includes",
        declarations.len(),
        includes.len()
    );
    Ok(Program {
        declarations,
        includes,
    })
}

fn parse_include(pair: Pair<Rule>, file: &str) -> Result<Include> {
    let position = pos_of(&pair, file);
    let string = inner_of(pair).next().expect("include has a header name");
    Ok(Include {
        header: unquote(string.as_str()),
        position,
    })
}

fn parse_declaration(pair: Pair<Rule>, file: &str) -> Result<Declaration> {
    match pair.as_rule() {
        Rule::struct_decl => parse_struct_decl(pair, file).map(Declaration::Struct),
        Rule::type_alias_decl => parse_type_alias(pair, file).map(Declaration::TypeAlias),
        Rule::enum_decl => parse_enum_decl(pair, file).map(Declaration::Enum),
        Rule::config_decl => parse_config_decl(pair, file).map(Declaration::Config),
        Rule::global_var_decl => parse_global_var(pair, file).map(Declaration::GlobalVar),
        Rule::attributed_fn => parse_attributed_fn(pair, file).map(Declaration::Attributed),
        Rule::fn_decl => parse_fn_decl(pair, file).map(Declaration::Function),
        other => Err(ParseError::at(
            pos_of(&pair, file),
            format!("unexpected declaration rule {other:?}"),
        )),
    }
}

fn parse_struct_decl(pair: Pair<Rule>, file: &str) -> Result<StructDecl> {
    let position = pos_of(&pair, file);
    let mut inner = inner_of(pair);
    let name = inner.next().expect("struct has a name").as_str().to_string();
    let mut fields = Vec::new();
    for field_pair in inner {
        let mut parts = field_pair.into_inner();
        let field_name = parts.next().expect("field name").as_str().to_string();
        let ty = parse_type_expr(parts.next().expect("field type"), file)?;
        fields.push(StructField {
            name: field_name,
            ty,
        });
    }
    Ok(StructDecl {
        name,
        fields,
        position,
    })
}

fn parse_type_alias(pair: Pair<Rule>, file: &str) -> Result<TypeAlias> {
    let position = pos_of(&pair, file);
    let mut inner = inner_of(pair);
    let name = inner.next().expect("alias name").as_str().to_string();
    let ty = parse_type_expr(inner.next().expect("aliased type"), file)?;
    Ok(TypeAlias { name, ty, position })
}

fn parse_enum_decl(pair: Pair<Rule>, file: &str) -> Result<EnumDecl> {
    let position = pos_of(&pair, file);
    let mut inner = inner_of(pair);
    let name = inner.next().expect("enum name").as_str().to_string();
    let mut variants = Vec::new();
    for variant_pair in inner {
        let variant_pos = pos_of(&variant_pair, file);
        let mut parts = variant_pair.into_inner();
        let vname = parts.next().expect("variant name").as_str().to_string();
        let value = match parts.next() {
            Some(v) => Some(parse_int_text(v.as_str(), &variant_pos)?.widen()),
            None => None,
        };
        variants.push(EnumVariant { name: vname, value });
    }
    Ok(EnumDecl {
        name,
        variants,
        position,
    })
}

fn parse_config_decl(pair: Pair<Rule>, file: &str) -> Result<ConfigDecl> {
    let position = pos_of(&pair, file);
    let mut inner = inner_of(pair);
    let name = inner.next().expect("config name").as_str().to_string();
    let mut fields = Vec::new();
    for field_pair in inner {
        let field_pos = pos_of(&field_pair, file);
        let mut parts = field_pair.into_inner();
        let fname = parts.next().expect("config field name").as_str().to_string();
        let ty = parse_type_expr(parts.next().expect("config field type"), file)?;
        let default = match parts.next() {
            Some(expr_pair) => Some(parse_expr(expr_pair, file)?),
            None => None,
        };
        fields.push(ConfigField {
            name: fname,
            ty,
            default,
            position: field_pos,
        });
    }
    Ok(ConfigDecl {
        name,
        fields,
        position,
    })
}

fn parse_global_var(pair: Pair<Rule>, file: &str) -> Result<GlobalVarDecl> {
    let position = pos_of(&pair, file);
    let mut pinned = false;
    let mut name = None;
    let mut ty = None;
    let mut init = None;
    for part in inner_of(pair) {
        match part.as_rule() {
            Rule::pin_kw => pinned = true,
            Rule::ident => name = Some(part.as_str().to_string()),
            Rule::type_expr => ty = Some(parse_type_expr(part, file)?),
            Rule::expr => init = Some(parse_expr(part, file)?),
            other => {
                return Err(ParseError::at(
                    pos_of(&part, file),
                    format!("unexpected rule {other:?} in variable declaration"),
                ))
            }
        }
    }
    let name = name.expect("variable has a name");
    if ty.is_none() && init.is_none() {
        return Err(ParseError::at(
            position,
            format!("variable `{name}` needs a type annotation or an initializer"),
        ));
    }
    Ok(GlobalVarDecl {
        name,
        ty,
        init,
        pinned,
        position,
    })
}

fn parse_attributed_fn(pair: Pair<Rule>, file: &str) -> Result<AttributedFunction> {
    let position = pos_of(&pair, file);
    let mut inner = pair.into_inner();
    let attr_pair = inner.next().expect("attribute");
    let attr_pos = pos_of(&attr_pair, file);
    let mut attr_inner = attr_pair.into_inner();
    let attr_name = attr_inner.next().expect("attribute name").as_str().to_string();
    let attr_arg = attr_inner.next().map(|s| unquote(s.as_str()));
    let function = parse_fn_decl(inner.next().expect("attributed function body"), file)?;
    Ok(AttributedFunction {
        attr: AttrSpec {
            name: attr_name,
            arg: attr_arg,
            position: attr_pos,
        },
        function,
        position,
        resolved: None,
    })
}

fn parse_fn_decl(pair: Pair<Rule>, file: &str) -> Result<Function> {
    let position = pos_of(&pair, file);
    let mut name = None;
    let mut params = Vec::new();
    let mut return_type = None;
    let mut body = Block::default();
    for part in inner_of(pair) {
        match part.as_rule() {
            Rule::ident => name = Some(part.as_str().to_string()),
            Rule::param_list => {
                for param_pair in part.into_inner() {
                    let param_pos = pos_of(&param_pair, file);
                    let mut parts = param_pair.into_inner();
                    let pname = parts.next().expect("parameter name").as_str().to_string();
                    let ty = parse_type_expr(parts.next().expect("parameter type"), file)?;
                    params.push(Param {
                        name: pname,
                        ty,
                        position: param_pos,
                    });
                }
            }
            Rule::type_expr => return_type = Some(parse_type_expr(part, file)?),
            Rule::block => body = parse_block(part, file)?,
            other => {
                return Err(ParseError::at(
                    pos_of(&part, file),
                    format!("unexpected rule {other:?} in function declaration"),
                ))
            }
        }
    }
    Ok(Function {
        name: name.expect("function has a name"),
        params,
        return_type,
        body,
        position,
    })
}

// Types

fn parse_type_expr(pair: Pair<Rule>, file: &str) -> Result<Type> {
    let mut inner = pair.into_inner();
    let atom = inner.next().expect("type atom");
    let mut ty = parse_type_atom(atom, file)?;
    for suffix in inner {
        let suffix_pos = pos_of(&suffix, file);
        let len_pair = suffix.into_inner().next().expect("array length");
        let len = parse_int_text(len_pair.as_str(), &suffix_pos)?.widen();
        ty = Type::Array(Box::new(ty), len as usize);
    }
    Ok(ty)
}

fn parse_type_atom(pair: Pair<Rule>, file: &str) -> Result<Type> {
    let inner = pair.into_inner().next().expect("type atom is non-empty");
    let pos = pos_of(&inner, file);
    match inner.as_rule() {
        Rule::pointer_type => {
            let target = inner.into_inner().next().expect("pointee type");
            Ok(Type::Pointer(Box::new(parse_type_expr(target, file)?)))
        }
        Rule::map_type => parse_map_type(inner, file),
        Rule::str_type => {
            let mut parts = inner.into_inner();
            let _kw = parts.next();
            let len_pair = parts.next().expect("string capacity");
            let len = parse_int_text(len_pair.as_str(), &pos)?.widen();
            Ok(Type::Str(len as usize))
        }
        Rule::primitive_type => Ok(match inner.as_str() {
            "u8" => Type::U8,
            "u16" => Type::U16,
            "u32" => Type::U32,
            "u64" => Type::U64,
            "i8" => Type::I8,
            "i16" => Type::I16,
            "i32" => Type::I32,
            "i64" => Type::I64,
            "bool" => Type::Bool,
            other => {
                return Err(ParseError::at(pos, format!("unknown primitive type `{other}`")))
            }
        }),
        Rule::named_type => Ok(Type::Named(
            inner.into_inner().next().expect("type name").as_str().to_string(),
        )),
        other => Err(ParseError::at(pos, format!("unexpected type rule {other:?}"))),
    }
}

fn parse_map_type(pair: Pair<Rule>, file: &str) -> Result<Type> {
    let pos = pos_of(&pair, file);
    let mut inner = pair.into_inner();
    let kind_pair = inner.next().expect("map kind");
    let kind = MapKind::from_keyword(kind_pair.as_str()).ok_or_else(|| {
        ParseError::at(pos.clone(), format!("unknown map kind `{}`", kind_pair.as_str()))
    })?;
    let key = parse_type_expr(inner.next().expect("map key type"), file)?;
    let value = parse_type_expr(inner.next().expect("map value type"), file)?;
    let entries_pair = inner.next().expect("map max_entries");
    let max_entries = parse_int_text(entries_pair.as_str(), &pos)?.widen() as u64;

    let mut config = MapConfig {
        max_entries,
        ..Default::default()
    };
    for opt in inner {
        let opt_pos = pos_of(&opt, file);
        let mut parts = opt.into_inner();
        let opt_name = parts.next().expect("map option name").as_str().to_string();
        let opt_value =
            parse_int_text(parts.next().expect("map option value").as_str(), &opt_pos)?.widen()
                as u64;
        match opt_name.as_str() {
            "key_size" => config.key_size = Some(opt_value),
            "value_size" => config.value_size = Some(opt_value),
            "flags" => config.flags = Some(opt_value),
            other => {
                return Err(ParseError::at(
                    opt_pos,
                    format!("unknown map option `{other}`"),
                ))
            }
        }
    }
    Ok(Type::Map {
        key: Box::new(key),
        value: Box::new(value),
        kind,
        config,
    })
}

// Statements

fn parse_block(pair: Pair<Rule>, file: &str) -> Result<Block> {
    let mut statements = Vec::new();
    for stmt_pair in pair.into_inner() {
        statements.push(parse_statement(stmt_pair, file)?);
    }
    Ok(Block { statements })
}

fn parse_statement(pair: Pair<Rule>, file: &str) -> Result<Statement> {
    let inner = pair.into_inner().next().expect("statement is non-empty");
    let position = pos_of(&inner, file);
    match inner.as_rule() {
        Rule::var_stmt => {
            let mut name = None;
            let mut ty = None;
            let mut init = None;
            for part in inner_of(inner) {
                match part.as_rule() {
                    Rule::ident => name = Some(part.as_str().to_string()),
                    Rule::type_expr => ty = Some(parse_type_expr(part, file)?),
                    Rule::expr => init = Some(parse_expr(part, file)?),
                    other => {
                        return Err(ParseError::at(
                            pos_of(&part, file),
                            format!("unexpected rule {other:?} in variable statement"),
                        ))
                    }
                }
            }
            Ok(Statement::VarDecl {
                name: name.expect("variable has a name"),
                ty,
                init: init.expect("grammar requires an initializer"),
                position,
            })
        }
        Rule::delete_stmt => {
            let target = parse_expr(inner_of(inner).next().expect("delete target"), file)?;
            Ok(Statement::Delete { target, position })
        }
        Rule::if_stmt => parse_if_stmt(inner, file),
        Rule::for_stmt => parse_for_stmt(inner, file),
        Rule::return_stmt => {
            let value = match inner_of(inner).next() {
                Some(expr_pair) => Some(parse_expr(expr_pair, file)?),
                None => None,
            };
            Ok(Statement::Return { value, position })
        }
        Rule::assign_or_expr_stmt => {
            let mut parts = inner.into_inner();
            let first = parse_expr(parts.next().expect("expression"), file)?;
            match parts.next() {
                // An assign_op pair separates target from value.
                Some(_op) => {
                    let value = parse_expr(parts.next().expect("assigned value"), file)?;
                    Ok(Statement::Assign {
                        target: first,
                        value,
                        position,
                    })
                }
                None => Ok(Statement::Expr(first)),
            }
        }
        other => Err(ParseError::at(
            position,
            format!("unexpected statement rule {other:?}"),
        )),
    }
}

fn parse_if_stmt(pair: Pair<Rule>, file: &str) -> Result<Statement> {
    let position = pos_of(&pair, file);
    let mut inner = inner_of(pair);
    let cond = parse_expr(inner.next().expect("if condition"), file)?;
    let then_block = parse_block(inner.next().expect("if body"), file)?;
    let else_block = match inner.next() {
        Some(else_pair) => {
            let else_inner = inner_of(else_pair).next().expect("else body");
            match else_inner.as_rule() {
                // `else if` re-enters as a one-statement block.
                Rule::if_stmt => Some(Block {
                    statements: vec![parse_if_stmt(else_inner, file)?],
                }),
                Rule::block => Some(parse_block(else_inner, file)?),
                other => {
                    return Err(ParseError::at(
                        position,
                        format!("unexpected else rule {other:?}"),
                    ))
                }
            }
        }
        None => None,
    };
    Ok(Statement::If {
        cond,
        then_block,
        else_block,
        position,
    })
}

fn parse_for_stmt(pair: Pair<Rule>, file: &str) -> Result<Statement> {
    let position = pos_of(&pair, file);
    let mut inner = inner_of(pair);
    let var = inner.next().expect("loop variable").as_str().to_string();
    let first = parse_expr(inner.next().expect("loop source"), file)?;
    let mut range = ForRange::Iter(first);
    let mut body = Block::default();
    for part in inner {
        match part.as_rule() {
            Rule::range_op => {}
            Rule::expr => {
                let end = parse_expr(part, file)?;
                range = match range {
                    ForRange::Iter(start) => ForRange::Range { start, end },
                    bounded => bounded,
                };
            }
            Rule::block => body = parse_block(part, file)?,
            other => {
                return Err(ParseError::at(
                    pos_of(&part, file),
                    format!("unexpected rule {other:?} in for statement"),
                ))
            }
        }
    }
    Ok(Statement::For {
        var,
        range,
        body,
        position,
    })
}

// Expressions, one function per precedence level.

fn parse_expr(pair: Pair<Rule>, file: &str) -> Result<Expr> {
    let inner = pair.into_inner().next().expect("expression is non-empty");
    parse_logical_or(inner, file)
}

fn binary_chain(
    pair: Pair<Rule>,
    file: &str,
    next: fn(Pair<Rule>, &str) -> Result<Expr>,
    op_of: fn(&str) -> Option<BinaryOp>,
) -> Result<Expr> {
    let position = pos_of(&pair, file);
    let mut pairs = pair.into_inner();
    let first = pairs.next().expect("left operand");
    let mut left = next(first, file)?;
    for (op_pair, rhs_pair) in chunks_of_two(pairs) {
        let op = op_of(op_pair.as_str()).ok_or_else(|| {
            ParseError::at(
                pos_of(&op_pair, file),
                format!("unexpected operator `{}`", op_pair.as_str()),
            )
        })?;
        let right = next(rhs_pair, file)?;
        left = Expr::new(
            ExprKind::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            },
            position.clone(),
        );
    }
    Ok(left)
}

fn parse_logical_or(pair: Pair<Rule>, file: &str) -> Result<Expr> {
    binary_chain(pair, file, parse_logical_and, |s| match s {
        "||" => Some(BinaryOp::Or),
        _ => None,
    })
}

fn parse_logical_and(pair: Pair<Rule>, file: &str) -> Result<Expr> {
    binary_chain(pair, file, parse_equality, |s| match s {
        "&&" => Some(BinaryOp::And),
        _ => None,
    })
}

fn parse_equality(pair: Pair<Rule>, file: &str) -> Result<Expr> {
    binary_chain(pair, file, parse_relational, |s| match s {
        "==" => Some(BinaryOp::Eq),
        "!=" => Some(BinaryOp::Ne),
        _ => None,
    })
}

fn parse_relational(pair: Pair<Rule>, file: &str) -> Result<Expr> {
    binary_chain(pair, file, parse_additive, |s| match s {
        "<" => Some(BinaryOp::Lt),
        "<=" => Some(BinaryOp::Le),
        ">" => Some(BinaryOp::Gt),
        ">=" => Some(BinaryOp::Ge),
        _ => None,
    })
}

fn parse_additive(pair: Pair<Rule>, file: &str) -> Result<Expr> {
    binary_chain(pair, file, parse_term, |s| match s {
        "+" => Some(BinaryOp::Add),
        "-" => Some(BinaryOp::Sub),
        _ => None,
    })
}

fn parse_term(pair: Pair<Rule>, file: &str) -> Result<Expr> {
    binary_chain(pair, file, parse_unary, |s| match s {
        "*" => Some(BinaryOp::Mul),
        "/" => Some(BinaryOp::Div),
        "%" => Some(BinaryOp::Mod),
        _ => None,
    })
}

fn parse_unary(pair: Pair<Rule>, file: &str) -> Result<Expr> {
    let position = pos_of(&pair, file);
    let mut inner = pair.into_inner();
    let first = inner.next().expect("unary operand");
    match first.as_rule() {
        Rule::neg_op => {
            let operand = parse_unary(inner.next().expect("negated operand"), file)?;
            Ok(Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                },
                position,
            ))
        }
        Rule::not_op => {
            let operand = parse_unary(inner.next().expect("negated operand"), file)?;
            Ok(Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                position,
            ))
        }
        Rule::postfix => parse_postfix(first, file),
        other => Err(ParseError::at(
            position,
            format!("unexpected unary rule {other:?}"),
        )),
    }
}

fn parse_postfix(pair: Pair<Rule>, file: &str) -> Result<Expr> {
    let mut inner = pair.into_inner();
    let factor = inner.next().expect("postfix base");
    let mut expr = parse_factor(factor, file)?;
    for op_pair in inner {
        let position = pos_of(&op_pair, file);
        let op = op_pair.into_inner().next().expect("postfix op is non-empty");
        match op.as_rule() {
            Rule::call_args => {
                let mut args = Vec::new();
                for arg_pair in op.into_inner() {
                    args.push(parse_expr(arg_pair, file)?);
                }
                expr = Expr::new(
                    ExprKind::Call {
                        callee: Box::new(expr),
                        args,
                    },
                    position,
                );
            }
            Rule::index_op => {
                let index = parse_expr(op.into_inner().next().expect("index"), file)?;
                expr = Expr::new(
                    ExprKind::Index(Box::new(expr), Box::new(index)),
                    position,
                );
            }
            Rule::field_op => {
                let field = op.into_inner().next().expect("field name").as_str().to_string();
                expr = Expr::new(ExprKind::Field(Box::new(expr), field), position);
            }
            Rule::arrow_op => {
                let field = op.into_inner().next().expect("field name").as_str().to_string();
                expr = Expr::new(ExprKind::Arrow(Box::new(expr), field), position);
            }
            other => {
                return Err(ParseError::at(
                    position,
                    format!("unexpected postfix rule {other:?}"),
                ))
            }
        }
    }
    Ok(expr)
}

fn parse_factor(pair: Pair<Rule>, file: &str) -> Result<Expr> {
    let position = pos_of(&pair, file);
    let inner = pair.into_inner().next().expect("factor is non-empty");
    match inner.as_rule() {
        Rule::expr => parse_expr(inner, file),
        Rule::int => {
            let value = parse_int_text(inner.as_str(), &position)?;
            Ok(Expr::new(ExprKind::Int(value), position))
        }
        Rule::bool_lit => Ok(Expr::new(ExprKind::Bool(inner.as_str() == "true"), position)),
        Rule::none_lit => Ok(Expr::new(ExprKind::None, position)),
        Rule::string => Ok(Expr::new(ExprKind::Str(unquote(inner.as_str())), position)),
        Rule::ident => Ok(Expr::new(
            ExprKind::Ident(inner.as_str().to_string()),
            position,
        )),
        other => Err(ParseError::at(
            position,
            format!("unexpected factor rule {other:?}"),
        )),
    }
}

/// Integer literals default to the narrowest of u32/u64 that holds the
/// value; the checker retags them when context supplies a width.
fn parse_int_text(text: &str, position: &Position) -> Result<IntValue> {
    let parsed = if let Some(hex) = text.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        text.parse::<u64>()
    };
    let value = parsed.map_err(|_| {
        ParseError::at(position.clone(), format!("integer literal `{text}` out of range"))
    })?;
    if value <= u32::MAX as u64 {
        Ok(IntValue::U32(value as u32))
    } else {
        Ok(IntValue::U64(value))
    }
}

fn unquote(raw: &str) -> String {
    raw[1..raw.len() - 1].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::ast::{Declaration, ExprKind, ForRange, Statement, Type};

    fn parse_ok(src: &str) -> Program {
        parse(src, "test.ks").expect("source should parse")
    }

    #[test]
    fn test_parse_includes_and_maps() {
        let program = parse_ok(
            r#"
            include "xdp.kh"

            pin var counters : hash<u32, u64>(1024)

            fn main() -> i32 {
                return 0
            }
            "#,
        );
        assert_eq!(program.includes.len(), 1);
        assert_eq!(program.includes[0].header, "xdp.kh");
        match &program.declarations[0] {
            Declaration::GlobalVar(gv) => {
                assert!(gv.pinned);
                assert!(matches!(gv.ty, Some(Type::Map { .. })));
            }
            other => panic!("expected global var, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_attributed_function() {
        let program = parse_ok(
            r#"
            @xdp fn drop_all(ctx: *xdp_md) -> xdp_action {
                return XDP_DROP
            }

            @tc("ingress") fn count(ctx: *__sk_buff) -> i32 {
                return TC_ACT_OK
            }
            "#,
        );
        match &program.declarations[0] {
            Declaration::Attributed(af) => {
                assert_eq!(af.attr.name, "xdp");
                assert!(af.attr.arg.is_none());
                assert_eq!(af.function.params.len(), 1);
                assert!(matches!(af.function.params[0].ty, Type::Pointer(_)));
            }
            other => panic!("expected attributed fn, got {other:?}"),
        }
        match &program.declarations[1] {
            Declaration::Attributed(af) => {
                assert_eq!(af.attr.name, "tc");
                assert_eq!(af.attr.arg.as_deref(), Some("ingress"));
            }
            other => panic!("expected attributed fn, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_for_range_and_iter() {
        let program = parse_ok(
            r#"
            fn main() -> i32 {
                for i in 0..10 {
                    print("{}", i)
                }
                for x in packets {
                    print("{}", x)
                }
                return 0
            }
            "#,
        );
        let main = match &program.declarations[0] {
            Declaration::Function(f) => f,
            other => panic!("expected function, got {other:?}"),
        };
        match &main.body.statements[0] {
            Statement::For { range: ForRange::Range { .. }, .. } => {}
            other => panic!("expected range for, got {other:?}"),
        }
        match &main.body.statements[1] {
            Statement::For { range: ForRange::Iter(_), .. } => {}
            other => panic!("expected iterator for, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_map_ops() {
        let program = parse_ok(
            r#"
            fn main() -> i32 {
                counters[5] = 0
                var hit = counters[5]
                delete counters[5]
                return 0
            }
            "#,
        );
        let main = match &program.declarations[0] {
            Declaration::Function(f) => f,
            other => panic!("expected function, got {other:?}"),
        };
        assert!(matches!(
            &main.body.statements[0],
            Statement::Assign { target, .. } if matches!(target.kind, ExprKind::Index(..))
        ));
        assert!(matches!(&main.body.statements[2], Statement::Delete { .. }));
    }

    #[test]
    fn test_parse_precedence() {
        let program = parse_ok(
            r#"
            fn main() -> i32 {
                var x = 1 + 2 * 3
                return 0
            }
            "#,
        );
        let main = match &program.declarations[0] {
            Declaration::Function(f) => f,
            other => panic!("expected function, got {other:?}"),
        };
        let init = match &main.body.statements[0] {
            Statement::VarDecl { init, .. } => init,
            other => panic!("expected var decl, got {other:?}"),
        };
        match &init.kind {
            ExprKind::Binary { op: BinaryOp::Add, right, .. } => {
                assert!(matches!(
                    right.kind,
                    ExprKind::Binary { op: BinaryOp::Mul, .. }
                ));
            }
            other => panic!("expected addition at the top, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_error_carries_position() {
        let err = parse("fn main( -> i32 {}", "broken.ks").unwrap_err();
        let ParseError::Syntax { position, .. } = err;
        assert_eq!(position.file, "broken.ks");
        assert_eq!(position.line, 1);
    }

    #[test]
    fn test_parse_config_and_struct() {
        let program = parse_ok(
            r#"
            struct Args {
                interface: str(20),
                limit: u32,
            }

            config rate_cfg {
                limit: u32 = 100,
                enabled: bool,
            }
            "#,
        );
        assert!(matches!(&program.declarations[0], Declaration::Struct(s) if s.fields.len() == 2));
        match &program.declarations[1] {
            Declaration::Config(c) => {
                assert_eq!(c.fields.len(), 2);
                assert!(c.fields[0].default.is_some());
                assert!(c.fields[1].default.is_none());
            }
            other => panic!("expected config, got {other:?}"),
        }
    }
}
