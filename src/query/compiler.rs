//! Query Compiler
//!
//! The [`QueryCompiler`] port turns query text into SQL statements. The
//! bundled [`JpqlCompiler`] understands a small JPQL subset:
//!
//! ```text
//! SELECT a FROM Entity a [WHERE cond {AND cond}] [ORDER BY a.field [ASC|DESC] {, ...}]
//! cond    := a.field = operand | a.field IN :p | a.field IN ?n | a.field IN (operand {, operand})
//! operand := :name | ?n | 'text' | integer | TRUE | FALSE
//! ```
//!
//! Composite fields expand to one column per component. Collection
//! parameters of `IN` expand to one placeholder group per element, so the
//! arguments seen at compile time fix the plan's group count.

use std::sync::Arc;

use super::binder::{Args, ParameterBinder};
use super::plan::{
    Filter, FilterOp, Operand, ParamKey, ParamShape, ParamSpec, ParamStyle, PreparedPlan, Slot,
    SqlStatement, StatementRole,
};
use super::value::Value;
use crate::error::{Error, Result};
use crate::meta::{EntityMeta, FieldMeta, MetadataRepository};

/// How arguments reach the generated SQL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindMode {
    /// `?` placeholders, bound later
    #[default]
    Parameters,
    /// Arguments embedded as SQL literals
    Literals,
}

/// Translates query text into a plan
pub trait QueryCompiler: Send + Sync {
    /// Compile `text`; `args` supply collection sizes (and values in `Literals` mode).
    fn compile(&self, text: &str, args: &Args, mode: BindMode) -> Result<PreparedPlan>;
}

// =============================================================================
// Lexer
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Named(String),
    Positional(u32),
    Str(String),
    Int(i64),
    Dot,
    Comma,
    LParen,
    RParen,
    Eq,
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let take_while = |start: usize, pred: &dyn Fn(char) -> bool| -> usize {
        let mut end = start;
        while end < chars.len() && pred(chars[end]) {
            end += 1;
        }
        end
    };

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Eq);
                i += 1;
            }
            ':' => {
                let end = take_while(i + 1, &|c| c.is_alphanumeric() || c == '_');
                if end == i + 1 {
                    return Err(Error::compile(text, "empty parameter name after ':'"));
                }
                tokens.push(Token::Named(chars[i + 1..end].iter().collect()));
                i = end;
            }
            '?' => {
                let end = take_while(i + 1, &|c| c.is_ascii_digit());
                let digits: String = chars[i + 1..end].iter().collect();
                let position = digits
                    .parse::<u32>()
                    .ok()
                    .filter(|p| *p > 0)
                    .ok_or_else(|| Error::compile(text, "positional parameters must be ?1, ?2, ..."))?;
                tokens.push(Token::Positional(position));
                i = end;
            }
            '\'' => {
                let mut literal = String::new();
                let mut j = i + 1;
                loop {
                    match chars.get(j) {
                        None => return Err(Error::compile(text, "unterminated string literal")),
                        Some('\'') if chars.get(j + 1) == Some(&'\'') => {
                            literal.push('\'');
                            j += 2;
                        }
                        Some('\'') => break,
                        Some(ch) => {
                            literal.push(*ch);
                            j += 1;
                        }
                    }
                }
                tokens.push(Token::Str(literal));
                i = j + 1;
            }
            c if c.is_ascii_digit() || c == '-' => {
                let end = take_while(i + 1, &|c| c.is_ascii_digit());
                let digits: String = chars[i..end].iter().collect();
                let n = digits
                    .parse::<i64>()
                    .map_err(|_| Error::compile(text, format!("bad integer literal {}", digits)))?;
                tokens.push(Token::Int(n));
                i = end;
            }
            c if c.is_alphabetic() || c == '_' => {
                let end = take_while(i, &|c| c.is_alphanumeric() || c == '_');
                tokens.push(Token::Ident(chars[i..end].iter().collect()));
                i = end;
            }
            other => {
                return Err(Error::compile(text, format!("unexpected character '{}'", other)));
            }
        }
    }
    Ok(tokens)
}

// =============================================================================
// Parser
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum AstOperand {
    Param(ParamKey),
    Lit(Value),
}

#[derive(Debug, Clone, PartialEq)]
enum Condition {
    Eq { field: String, operand: AstOperand },
    InParam { field: String, param: ParamKey },
    InList { field: String, operands: Vec<AstOperand> },
}

#[derive(Debug, Clone, PartialEq)]
struct SelectQuery {
    entity: String,
    conditions: Vec<Condition>,
    order_by: Vec<(String, bool)>,
}

struct Parser<'a> {
    text: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    alias: String,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Result<Self> {
        Ok(Self {
            text,
            tokens: tokenize(text)?,
            pos: 0,
            alias: String::new(),
        })
    }

    fn error(&self, reason: impl Into<String>) -> Error {
        Error::compile(self.text, reason)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn peek_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s.eq_ignore_ascii_case(kw))
    }

    fn keyword(&mut self, kw: &str) -> Result<()> {
        if self.peek_keyword(kw) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected {} near token {}", kw, self.pos)))
        }
    }

    fn ident(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Ident(s)) => Ok(s),
            other => Err(self.error(format!("expected identifier, found {:?}", other))),
        }
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        match self.next() {
            Some(t) if t == token => Ok(()),
            other => Err(self.error(format!("expected {:?}, found {:?}", token, other))),
        }
    }

    /// `alias.field`
    fn path(&mut self) -> Result<String> {
        let alias = self.ident()?;
        if alias != self.alias {
            return Err(self.error(format!("unknown identification variable {}", alias)));
        }
        self.expect(Token::Dot)?;
        self.ident()
    }

    fn operand(&mut self) -> Result<AstOperand> {
        match self.next() {
            Some(Token::Named(n)) => Ok(AstOperand::Param(ParamKey::Named(n))),
            Some(Token::Positional(p)) => Ok(AstOperand::Param(ParamKey::Positional(p))),
            Some(Token::Str(s)) => Ok(AstOperand::Lit(Value::Text(s))),
            Some(Token::Int(i)) => Ok(AstOperand::Lit(Value::Int(i))),
            Some(Token::Ident(s)) if s.eq_ignore_ascii_case("true") => {
                Ok(AstOperand::Lit(Value::Bool(true)))
            }
            Some(Token::Ident(s)) if s.eq_ignore_ascii_case("false") => {
                Ok(AstOperand::Lit(Value::Bool(false)))
            }
            other => Err(self.error(format!("expected parameter or literal, found {:?}", other))),
        }
    }

    fn condition(&mut self) -> Result<Condition> {
        let field = self.path()?;
        if self.peek_keyword("IN") {
            self.pos += 1;
            return match self.next() {
                Some(Token::Named(n)) => Ok(Condition::InParam {
                    field,
                    param: ParamKey::Named(n),
                }),
                Some(Token::Positional(p)) => Ok(Condition::InParam {
                    field,
                    param: ParamKey::Positional(p),
                }),
                Some(Token::LParen) => {
                    let mut operands = vec![self.operand()?];
                    while self.peek() == Some(&Token::Comma) {
                        self.pos += 1;
                        operands.push(self.operand()?);
                    }
                    self.expect(Token::RParen)?;
                    Ok(Condition::InList { field, operands })
                }
                other => Err(self.error(format!("expected IN operand, found {:?}", other))),
            };
        }
        self.expect(Token::Eq)?;
        let operand = self.operand()?;
        Ok(Condition::Eq { field, operand })
    }

    fn parse(mut self) -> Result<SelectQuery> {
        self.keyword("SELECT")?;
        let projected = self.ident()?;
        self.keyword("FROM")?;
        let entity = self.ident()?;
        if self.peek_keyword("AS") {
            self.pos += 1;
        }
        self.alias = self.ident()?;
        if projected != self.alias {
            return Err(self.error(format!(
                "only the candidate alias {} can be selected",
                self.alias
            )));
        }

        let mut conditions = Vec::new();
        if self.peek_keyword("WHERE") {
            self.pos += 1;
            conditions.push(self.condition()?);
            while self.peek_keyword("AND") {
                self.pos += 1;
                conditions.push(self.condition()?);
            }
        }

        let mut order_by = Vec::new();
        if self.peek_keyword("ORDER") {
            self.pos += 1;
            self.keyword("BY")?;
            loop {
                let field = self.path()?;
                let ascending = if self.peek_keyword("DESC") {
                    self.pos += 1;
                    false
                } else {
                    if self.peek_keyword("ASC") {
                        self.pos += 1;
                    }
                    true
                };
                order_by.push((field, ascending));
                if self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }

        if let Some(t) = self.peek() {
            return Err(self.error(format!("unexpected trailing token {:?}", t)));
        }

        Ok(SelectQuery {
            entity,
            conditions,
            order_by,
        })
    }
}

// =============================================================================
// SQL generation
// =============================================================================

/// Accumulates parameters and placeholder slots while SQL is emitted.
struct Emitter<'a> {
    text: &'a str,
    args: &'a Args,
    mode: BindMode,
    params: Vec<ParamSpec>,
    slots: Vec<Slot>,
}

impl<'a> Emitter<'a> {
    fn param_index(&mut self, key: &ParamKey, shape: ParamShape) -> Result<usize> {
        if let Some(i) = self.params.iter().position(|p| &p.key == key) {
            if self.params[i].shape != shape {
                return Err(Error::compile(
                    self.text,
                    format!("parameter {} is used with conflicting shapes", key),
                ));
            }
            return Ok(i);
        }
        self.params.push(ParamSpec {
            key: key.clone(),
            shape,
        });
        Ok(self.params.len() - 1)
    }

    /// Operands for one value of `field`, either fresh slots or embedded literals.
    fn param_group(
        &mut self,
        field: &FieldMeta,
        param: usize,
        element: Option<usize>,
    ) -> Result<Vec<Operand>> {
        match self.mode {
            BindMode::Parameters => Ok((0..field.columns.len())
                .map(|c| {
                    self.slots.push(Slot {
                        param,
                        element,
                        component: field.is_composite().then_some(c),
                    });
                    Operand::Slot(self.slots.len() - 1)
                })
                .collect()),
            BindMode::Literals => {
                // Same decomposition as runtime binding
                let resolved = ParameterBinder::resolve(&self.params[param], self.args)?;
                let values = resolved
                    .into_iter()
                    .nth(element.unwrap_or(0))
                    .ok_or_else(|| Error::Internal("collection element out of range".to_string()))?;
                Ok(values.into_iter().map(Operand::Literal).collect())
            }
        }
    }

    fn operand_group(&mut self, field: &FieldMeta, operand: &AstOperand) -> Result<Vec<Operand>> {
        match operand {
            AstOperand::Lit(value) => {
                if field.is_composite() {
                    return Err(Error::compile(
                        self.text,
                        format!("composite field {} cannot be compared to a literal", field.name),
                    ));
                }
                Ok(vec![Operand::Literal(value.clone())])
            }
            AstOperand::Param(key) => {
                let shape = if field.is_composite() {
                    ParamShape::Composite {
                        components: field.components.clone(),
                    }
                } else {
                    ParamShape::Scalar
                };
                let index = self.param_index(key, shape)?;
                self.param_group(field, index, None)
            }
        }
    }

    fn filter(&mut self, meta: &EntityMeta, condition: &Condition) -> Result<Filter> {
        match condition {
            Condition::Eq { field, operand } => {
                let field = meta.field(field)?;
                let group = self.operand_group(field, operand)?;
                Ok(Filter {
                    columns: field.columns.clone(),
                    op: FilterOp::Eq,
                    groups: vec![group],
                })
            }
            Condition::InList { field, operands } => {
                let field = meta.field(field)?;
                let groups = operands
                    .iter()
                    .map(|op| self.operand_group(field, op))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Filter {
                    columns: field.columns.clone(),
                    op: FilterOp::In,
                    groups,
                })
            }
            Condition::InParam { field, param } => {
                let field = meta.field(field)?;
                let len = match self.args.get(param) {
                    Some(Value::List(items)) if !items.is_empty() => items.len(),
                    Some(Value::List(_)) => {
                        return Err(Error::compile(
                            self.text,
                            format!("collection parameter {} is empty", param),
                        ))
                    }
                    Some(other) => {
                        return Err(Error::compile(
                            self.text,
                            format!("parameter {} must be a collection, got {}", param, other.kind()),
                        ))
                    }
                    None => {
                        return Err(Error::compile(
                            self.text,
                            format!("collection parameter {} needs a value to size the IN list", param),
                        ))
                    }
                };
                let index = self.param_index(
                    param,
                    ParamShape::Collection {
                        len,
                        components: field.components.clone(),
                    },
                )?;
                let groups = (0..len)
                    .map(|e| self.param_group(field, index, Some(e)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Filter {
                    columns: field.columns.clone(),
                    op: FilterOp::In,
                    groups,
                })
            }
        }
    }
}

fn render_operand(operand: &Operand) -> Result<String> {
    match operand {
        Operand::Slot(_) => Ok("?".to_string()),
        Operand::Literal(v) => v.to_sql_literal(),
    }
}

fn render_filter(filter: &Filter) -> Result<String> {
    let qualified: Vec<String> = filter.columns.iter().map(|c| format!("t0.{}", c)).collect();
    match filter.op {
        FilterOp::Eq => {
            let group = &filter.groups[0];
            let parts = qualified
                .iter()
                .zip(group)
                .map(|(col, op)| Ok(format!("{} = {}", col, render_operand(op)?)))
                .collect::<Result<Vec<_>>>()?;
            if parts.len() == 1 {
                Ok(parts.into_iter().next().unwrap_or_default())
            } else {
                Ok(format!("({})", parts.join(" AND ")))
            }
        }
        FilterOp::In => {
            let groups = filter
                .groups
                .iter()
                .map(|g| {
                    let items = g.iter().map(render_operand).collect::<Result<Vec<_>>>()?;
                    Ok(if items.len() == 1 {
                        items.into_iter().next().unwrap_or_default()
                    } else {
                        format!("({})", items.join(", "))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let lhs = if qualified.len() == 1 {
                qualified[0].clone()
            } else {
                format!("({})", qualified.join(", "))
            };
            Ok(format!("{} IN ({})", lhs, groups.join(", ")))
        }
    }
}

fn select_list(columns: &[String], table: &str) -> String {
    let list = columns
        .iter()
        .map(|c| format!("t0.{}", c))
        .collect::<Vec<_>>()
        .join(", ");
    format!("SELECT {} FROM {} t0", list, table)
}

/// Compiler for the JPQL subset described in the module docs
#[derive(Debug, Clone)]
pub struct JpqlCompiler {
    metadata: Arc<MetadataRepository>,
}

impl JpqlCompiler {
    /// Create a compiler over the given mappings
    pub fn new(metadata: Arc<MetadataRepository>) -> Self {
        Self { metadata }
    }
}

impl QueryCompiler for JpqlCompiler {
    fn compile(&self, text: &str, args: &Args, mode: BindMode) -> Result<PreparedPlan> {
        let query = Parser::new(text)?.parse()?;
        let meta = self.metadata.entity(&query.entity)?;

        let mut emitter = Emitter {
            text,
            args,
            mode,
            params: Vec::new(),
            slots: Vec::new(),
        };

        let filters = query
            .conditions
            .iter()
            .map(|c| emitter.filter(meta, c))
            .collect::<Result<Vec<_>>>()?;

        let mut order_by = Vec::new();
        for (field, ascending) in &query.order_by {
            for column in &meta.field(field)?.columns {
                order_by.push((column.clone(), *ascending));
            }
        }

        // Eager relations need their foreign keys in the primary projection
        let mut joins = Vec::new();
        for relation in meta.eager_relations() {
            joins.push((relation, self.metadata.join_columns(meta, relation)?));
        }
        let mut columns: Vec<String> = meta.columns().map(str::to_string).collect();
        for (_, join) in &joins {
            for column in &join.owner {
                if !columns.contains(column) {
                    columns.push(column.clone());
                }
            }
        }
        let mut sql = select_list(&columns, &meta.table);
        if !filters.is_empty() {
            let rendered = filters
                .iter()
                .map(render_filter)
                .collect::<Result<Vec<_>>>()?;
            sql.push_str(" WHERE ");
            sql.push_str(&rendered.join(" AND "));
        }
        if !order_by.is_empty() {
            let rendered: Vec<String> = order_by
                .iter()
                .map(|(c, asc)| format!("t0.{} {}", c, if *asc { "ASC" } else { "DESC" }))
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&rendered.join(", "));
        }

        let style = {
            let positional = emitter
                .params
                .iter()
                .any(|p| matches!(p.key, ParamKey::Positional(_)));
            let named = emitter
                .params
                .iter()
                .any(|p| matches!(p.key, ParamKey::Named(_)));
            match (positional, named) {
                (true, true) => {
                    return Err(Error::compile(
                        text,
                        "positional and named parameters cannot be mixed",
                    ))
                }
                (true, false) => ParamStyle::Positional,
                (false, true) => ParamStyle::Named,
                (false, false) => ParamStyle::None,
            }
        };

        let mut statements = vec![SqlStatement {
            sql,
            table: meta.table.clone(),
            columns,
            filters,
            order_by,
            slots: emitter.slots,
            role: StatementRole::Primary,
        }];

        for (relation, join) in joins {
            let target = self.metadata.entity(&relation.target)?;
            let columns: Vec<String> = target.columns().map(str::to_string).collect();
            let sql = select_list(&columns, &target.table);
            statements.push(SqlStatement {
                sql,
                table: target.table.clone(),
                columns,
                filters: Vec::new(),
                order_by: Vec::new(),
                slots: Vec::new(),
                role: StatementRole::EagerFetch {
                    relation: relation.name.clone(),
                    owner_columns: join.owner,
                    target_columns: join.target,
                },
            });
        }

        Ok(PreparedPlan::new(
            text,
            meta.name.clone(),
            statements,
            emitter.params,
            style,
            mode == BindMode::Literals,
        ))
    }
}
