//! SQL statement parsing.
//!
//! A hand-written lexer and recursive-descent parser covering exactly the
//! statement shapes the router executes: CREATE TABLE (plain, PARTITION BY
//! LIST, and PARTITION OF ... FOR VALUES IN), ALTER TABLE ... ADD CONSTRAINT,
//! DROP TABLE, single-table SELECT, multi-row INSERT ... VALUES, and UPDATE
//! with an equality WHERE clause. UPDATE statements also serialize, because
//! they travel to peers as part of dispatched writes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::datum::Datum;
use crate::status;

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Number(String),
    Str(String),
    LParen,
    RParen,
    Comma,
    Dot,
    Star,
    Eq,
    Plus,
    Minus,
    Slash,
    Semi,
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "{name}"),
            Token::Number(raw) => write!(f, "{raw}"),
            Token::Str(raw) => write!(f, "'{raw}'"),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::Comma => f.write_str(","),
            Token::Dot => f.write_str("."),
            Token::Star => f.write_str("*"),
            Token::Eq => f.write_str("="),
            Token::Plus => f.write_str("+"),
            Token::Minus => f.write_str("-"),
            Token::Slash => f.write_str("/"),
            Token::Semi => f.write_str(";"),
            Token::Eof => f.write_str("end of input"),
        }
    }
}

fn tokenize(source: &str) -> anyhow::Result<Vec<Token>> {
    let src = source.as_bytes();
    let mut pos = 0;
    let mut tokens = Vec::new();
    while pos < src.len() {
        let ch = src[pos];
        match ch {
            b' ' | b'\t' | b'\r' | b'\n' => pos += 1,
            // line comment
            b'-' if src.get(pos + 1) == Some(&b'-') => {
                while pos < src.len() && src[pos] != b'\n' {
                    pos += 1;
                }
            }
            b'\'' => {
                pos += 1;
                let mut value: Vec<u8> = Vec::new();
                loop {
                    match src.get(pos) {
                        // doubled quote is an escaped quote
                        Some(b'\'') if src.get(pos + 1) == Some(&b'\'') => {
                            value.push(b'\'');
                            pos += 2;
                        }
                        Some(b'\'') => {
                            pos += 1;
                            break;
                        }
                        Some(&byte) => {
                            value.push(byte);
                            pos += 1;
                        }
                        None => {
                            return Err(status::invalid_argument(
                                "unterminated string literal",
                            ));
                        }
                    }
                }
                let value = String::from_utf8(value).map_err(|_| {
                    status::invalid_argument("string literal is not valid UTF-8")
                })?;
                tokens.push(Token::Str(value));
            }
            b'0'..=b'9' => {
                let start = pos;
                while pos < src.len() && src[pos].is_ascii_digit() {
                    pos += 1;
                }
                tokens.push(Token::Number(source[start..pos].to_string()));
            }
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                let start = pos;
                while pos < src.len()
                    && (src[pos].is_ascii_alphanumeric() || src[pos] == b'_')
                {
                    pos += 1;
                }
                tokens.push(Token::Ident(source[start..pos].to_string()));
            }
            b'(' => {
                tokens.push(Token::LParen);
                pos += 1;
            }
            b')' => {
                tokens.push(Token::RParen);
                pos += 1;
            }
            b',' => {
                tokens.push(Token::Comma);
                pos += 1;
            }
            b'.' => {
                tokens.push(Token::Dot);
                pos += 1;
            }
            b'*' => {
                tokens.push(Token::Star);
                pos += 1;
            }
            b'=' => {
                tokens.push(Token::Eq);
                pos += 1;
            }
            b'+' => {
                tokens.push(Token::Plus);
                pos += 1;
            }
            b'-' => {
                tokens.push(Token::Minus);
                pos += 1;
            }
            b'/' => {
                tokens.push(Token::Slash);
                pos += 1;
            }
            b';' => {
                tokens.push(Token::Semi);
                pos += 1;
            }
            other => {
                return Err(status::invalid_argument(format!(
                    "unexpected character in statement: {:?}",
                    other as char
                )));
            }
        }
    }
    tokens.push(Token::Eof);
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parse tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableName {
    pub schema: Option<String>,
    pub name: String,
}

impl TableName {
    /// The catalog key: `schema.name` when a schema is present.
    pub fn qualified(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{schema}.{}", self.name),
            None => self.name.clone(),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStrategy {
    List,
    Range,
    Hash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub type_name: String,
    pub primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionBy {
    pub strategy: PartitionStrategy,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTableStmt {
    pub name: TableName,
    pub columns: Vec<ColumnDef>,
    pub partition_by: Option<PartitionBy>,
    /// Present for `CREATE TABLE ... PARTITION OF <parent>`.
    pub parent: Option<TableName>,
    /// The `FOR VALUES IN (...)` bound list of a partition.
    pub bound_values: Vec<Datum>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropTableStmt {
    pub name: TableName,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlterTableStmt {
    pub table: TableName,
    pub constraint_column: String,
    pub constraint_value: Datum,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectTarget {
    Star,
    Column(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectStmt {
    pub table: TableName,
    pub targets: Vec<SelectTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertStmt {
    pub table: TableName,
    /// Target column list; empty when the statement omits it.
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Datum>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ArithOp {
    pub fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetExpr {
    Literal(Datum),
    Binary {
        column: String,
        op: ArithOp,
        operand: Datum,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetTarget {
    pub column: String,
    pub value: SetExpr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhereEq {
    pub column: String,
    pub value: Datum,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStmt {
    pub table: TableName,
    pub targets: Vec<SetTarget>,
    pub filter: WhereEq,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    CreateTable(CreateTableStmt),
    DropTable(DropTableStmt),
    AlterTable(AlterTableStmt),
    Select(SelectStmt),
    Insert(InsertStmt),
    Update(UpdateStmt),
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

pub fn parse_statements(source: &str) -> anyhow::Result<Vec<Statement>> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let mut statements = Vec::new();
    loop {
        while parser.eat(&Token::Semi) {}
        if parser.check(&Token::Eof) {
            break;
        }
        statements.push(parser.parse_statement()?);
        if !parser.check(&Token::Eof) && !parser.check(&Token::Semi) {
            return Err(parser.unexpected("end of statement"));
        }
    }
    Ok(statements)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn next(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, token: &Token) -> bool {
        self.peek() == token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> anyhow::Result<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.unexpected(&token.to_string()))
        }
    }

    fn check_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Token::Ident(word) if word.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.check_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> anyhow::Result<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.unexpected(keyword))
        }
    }

    fn parse_ident(&mut self) -> anyhow::Result<String> {
        match self.next() {
            Token::Ident(name) => Ok(name),
            other => Err(status::invalid_argument(format!(
                "syntax error: expected identifier, found {other}"
            ))),
        }
    }

    fn unexpected(&self, what: &str) -> anyhow::Error {
        status::invalid_argument(format!(
            "syntax error: expected {what}, found {}",
            self.peek()
        ))
    }

    fn parse_statement(&mut self) -> anyhow::Result<Statement> {
        if self.check_keyword("create") {
            self.parse_create()
        } else if self.check_keyword("drop") {
            self.parse_drop()
        } else if self.check_keyword("alter") {
            self.parse_alter()
        } else if self.check_keyword("select") {
            self.parse_select()
        } else if self.check_keyword("insert") {
            self.parse_insert()
        } else if self.check_keyword("update") {
            self.parse_update()
        } else {
            Err(self.unexpected("statement"))
        }
    }

    fn parse_table_name(&mut self) -> anyhow::Result<TableName> {
        let first = self.parse_ident()?;
        if self.eat(&Token::Dot) {
            let name = self.parse_ident()?;
            Ok(TableName {
                schema: Some(first),
                name,
            })
        } else {
            Ok(TableName {
                schema: None,
                name: first,
            })
        }
    }

    fn parse_literal(&mut self) -> anyhow::Result<Datum> {
        match self.next() {
            Token::Number(raw) => raw
                .parse::<i64>()
                .map(Datum::Int64)
                .map_err(|_| {
                    status::invalid_argument(format!("integer literal out of range: {raw}"))
                }),
            Token::Str(value) => Ok(Datum::String(value)),
            Token::Minus => match self.next() {
                Token::Number(raw) => format!("-{raw}")
                    .parse::<i64>()
                    .map(Datum::Int64)
                    .map_err(|_| {
                        status::invalid_argument(format!(
                            "integer literal out of range: -{raw}"
                        ))
                    }),
                other => Err(status::invalid_argument(format!(
                    "syntax error: expected number after '-', found {other}"
                ))),
            },
            other => Err(status::invalid_argument(format!(
                "syntax error: expected literal, found {other}"
            ))),
        }
    }

    fn parse_create(&mut self) -> anyhow::Result<Statement> {
        self.expect_keyword("create")?;
        self.expect_keyword("table")?;
        let name = self.parse_table_name()?;

        if self.eat_keyword("partition") {
            self.expect_keyword("of")?;
            let parent = self.parse_table_name()?;
            self.expect_keyword("for")?;
            self.expect_keyword("values")?;
            self.expect_keyword("in")?;
            self.expect(&Token::LParen)?;
            let mut bound_values = vec![self.parse_literal()?];
            while self.eat(&Token::Comma) {
                bound_values.push(self.parse_literal()?);
            }
            self.expect(&Token::RParen)?;
            return Ok(Statement::CreateTable(CreateTableStmt {
                name,
                columns: Vec::new(),
                partition_by: None,
                parent: Some(parent),
                bound_values,
            }));
        }

        self.expect(&Token::LParen)?;
        let mut columns = vec![self.parse_column_def()?];
        while self.eat(&Token::Comma) {
            columns.push(self.parse_column_def()?);
        }
        self.expect(&Token::RParen)?;

        let partition_by = if self.eat_keyword("partition") {
            self.expect_keyword("by")?;
            let strategy_name = self.parse_ident()?;
            let strategy = match strategy_name.to_ascii_lowercase().as_str() {
                "list" => PartitionStrategy::List,
                "range" => PartitionStrategy::Range,
                "hash" => PartitionStrategy::Hash,
                other => {
                    return Err(status::invalid_argument(format!(
                        "unknown partition strategy: {other}"
                    )));
                }
            };
            self.expect(&Token::LParen)?;
            let column = self.parse_ident()?;
            self.expect(&Token::RParen)?;
            Some(PartitionBy { strategy, column })
        } else {
            None
        };

        Ok(Statement::CreateTable(CreateTableStmt {
            name,
            columns,
            partition_by,
            parent: None,
            bound_values: Vec::new(),
        }))
    }

    fn parse_column_def(&mut self) -> anyhow::Result<ColumnDef> {
        let name = self.parse_ident()?;
        let type_name = self.parse_ident()?;
        // swallow a parenthesized type modifier, e.g. VARCHAR(32)
        if self.eat(&Token::LParen) {
            while !self.eat(&Token::RParen) {
                if self.check(&Token::Eof) {
                    return Err(self.unexpected(")"));
                }
                self.next();
            }
        }
        let mut primary_key = false;
        loop {
            if self.eat_keyword("primary") {
                self.expect_keyword("key")?;
                primary_key = true;
            } else if self.eat_keyword("not") {
                self.expect_keyword("null")?;
            } else {
                break;
            }
        }
        Ok(ColumnDef {
            name,
            type_name,
            primary_key,
        })
    }

    fn parse_drop(&mut self) -> anyhow::Result<Statement> {
        self.expect_keyword("drop")?;
        self.expect_keyword("table")?;
        let name = self.parse_table_name()?;
        Ok(Statement::DropTable(DropTableStmt { name }))
    }

    fn parse_alter(&mut self) -> anyhow::Result<Statement> {
        self.expect_keyword("alter")?;
        self.expect_keyword("table")?;
        let table = self.parse_table_name()?;
        self.expect_keyword("add")?;
        self.expect_keyword("constraint")?;

        let first = self.parse_ident()?;
        let (constraint_column, constraint_value) = if self.eat(&Token::Eq) {
            // bare form: ADD CONSTRAINT <column> = <literal>
            (first, self.parse_literal()?)
        } else {
            // named form: ADD CONSTRAINT <name> CHECK (<column> = <literal>)
            if !first.eq_ignore_ascii_case("check") {
                self.expect_keyword("check")?;
            }
            self.expect(&Token::LParen)?;
            let column = self.parse_ident()?;
            self.expect(&Token::Eq)?;
            let value = self.parse_literal()?;
            self.expect(&Token::RParen)?;
            (column, value)
        };
        Ok(Statement::AlterTable(AlterTableStmt {
            table,
            constraint_column,
            constraint_value,
        }))
    }

    fn parse_select(&mut self) -> anyhow::Result<Statement> {
        self.expect_keyword("select")?;
        let mut targets = Vec::new();
        loop {
            if self.eat(&Token::Star) {
                targets.push(SelectTarget::Star);
            } else {
                targets.push(SelectTarget::Column(self.parse_ident()?));
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect_keyword("from")?;
        let table = self.parse_table_name()?;
        Ok(Statement::Select(SelectStmt { table, targets }))
    }

    fn parse_insert(&mut self) -> anyhow::Result<Statement> {
        self.expect_keyword("insert")?;
        self.expect_keyword("into")?;
        let table = self.parse_table_name()?;

        let mut columns = Vec::new();
        if self.eat(&Token::LParen) {
            columns.push(self.parse_ident()?);
            while self.eat(&Token::Comma) {
                columns.push(self.parse_ident()?);
            }
            self.expect(&Token::RParen)?;
        }

        self.expect_keyword("values")?;
        let mut rows = Vec::new();
        loop {
            self.expect(&Token::LParen)?;
            let mut row = vec![self.parse_literal()?];
            while self.eat(&Token::Comma) {
                row.push(self.parse_literal()?);
            }
            self.expect(&Token::RParen)?;
            rows.push(row);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(Statement::Insert(InsertStmt {
            table,
            columns,
            rows,
        }))
    }

    fn parse_update(&mut self) -> anyhow::Result<Statement> {
        self.expect_keyword("update")?;
        let table = self.parse_table_name()?;
        self.expect_keyword("set")?;

        let mut targets = Vec::new();
        loop {
            let column = self.parse_ident()?;
            self.expect(&Token::Eq)?;
            let value = if matches!(self.peek(), Token::Ident(_)) {
                let ref_column = self.parse_ident()?;
                let op = self.parse_arith_op()?;
                let operand = self.parse_literal()?;
                SetExpr::Binary {
                    column: ref_column,
                    op,
                    operand,
                }
            } else {
                SetExpr::Literal(self.parse_literal()?)
            };
            targets.push(SetTarget { column, value });
            if !self.eat(&Token::Comma) {
                break;
            }
        }

        self.expect_keyword("where")?;
        let column = self.parse_ident()?;
        self.expect(&Token::Eq)?;
        let value = self.parse_literal()?;

        Ok(Statement::Update(UpdateStmt {
            table,
            targets,
            filter: WhereEq { column, value },
        }))
    }

    fn parse_arith_op(&mut self) -> anyhow::Result<ArithOp> {
        match self.next() {
            Token::Plus => Ok(ArithOp::Add),
            Token::Minus => Ok(ArithOp::Sub),
            Token::Star => Ok(ArithOp::Mul),
            Token::Slash => Ok(ArithOp::Div),
            other => Err(status::invalid_argument(format!(
                "syntax error: expected arithmetic operator, found {other}"
            ))),
        }
    }
}
