//! The small SQL dialect understood by the mock server.
//!
//! Keywords are case-insensitive and a trailing `;` is optional. Supported forms:
//!
//! ```text
//! CREATE DATABASE name
//! USE name
//! CREATE TABLE name (column TYPE [modifiers...], ...)
//! DROP TABLE name
//! INSERT INTO name [(column, ...)] VALUES (literal, ...) [, (literal, ...)]
//! SELECT * | column, ... FROM name [WHERE column = literal]
//! ```
use thiserror::Error;

use crate::protocol::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    CreateDatabase {
        name: String,
    },
    Use {
        name: String,
    },
    CreateTable {
        name: String,
        columns: Vec<ColumnDef>,
    },
    DropTable {
        name: String,
    },
    Insert {
        table: String,
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    Select {
        table: String,
        projection: Projection,
        filter: Option<Filter>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub type_name: String,
    /// Filled from a per-table counter when an insert leaves it out.
    pub serial: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    All,
    Columns(Vec<String>),
}

/// Equality filter of a `WHERE column = literal` clause.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub value: Value,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatementError {
    #[error("empty statement")]
    EmptyStatement,

    #[error("statement not supported: {0}")]
    Unsupported(String),

    #[error("expected {expected}, found '{found}'")]
    UnexpectedToken { expected: String, found: String },

    #[error("expected {0}, found end of statement")]
    UnexpectedEnd(String),

    #[error("unterminated string literal")]
    UnterminatedString,

    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    #[error("unexpected character '{0}'")]
    InvalidCharacter(char),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Text(String),
    Integer(i64),
    Float(f64),
    Symbol(char),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Word(w) => w.clone(),
            Token::Text(t) => format!("'{t}'"),
            Token::Integer(i) => i.to_string(),
            Token::Float(f) => f.to_string(),
            Token::Symbol(c) => c.to_string(),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, StatementError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' | ')' | ',' | ';' | '=' | '*' => {
                tokens.push(Token::Symbol(c));
                chars.next();
            }
            '\'' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('\'') if chars.peek() == Some(&'\'') => {
                            chars.next();
                            text.push('\'');
                        }
                        Some('\'') => break,
                        Some(c) => text.push(c),
                        None => return Err(StatementError::UnterminatedString),
                    }
                }
                tokens.push(Token::Text(text));
            }
            '"' => {
                chars.next();
                let mut ident = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(c) => ident.push(c),
                        None => return Err(StatementError::UnterminatedString),
                    }
                }
                tokens.push(Token::Word(ident));
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                let mut number = String::new();
                number.push(c);
                chars.next();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        number.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(parse_number(&number)?);
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Word(word));
            }
            c => return Err(StatementError::InvalidCharacter(c)),
        }
    }

    Ok(tokens)
}

fn parse_number(number: &str) -> Result<Token, StatementError> {
    let invalid = || StatementError::InvalidNumber(number.to_string());
    if number.contains('.') {
        number.parse().map(Token::Float).map_err(|_| invalid())
    } else {
        number.parse().map(Token::Integer).map_err(|_| invalid())
    }
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self, expected: &str) -> Result<Token, StatementError> {
        let token = self
            .tokens
            .get(self.position)
            .cloned()
            .ok_or_else(|| StatementError::UnexpectedEnd(expected.to_string()))?;
        self.position += 1;
        Ok(token)
    }

    fn unexpected(expected: &str, found: &Token) -> StatementError {
        StatementError::UnexpectedToken {
            expected: expected.to_string(),
            found: found.describe(),
        }
    }

    /// Consumes `keyword` if it is next.
    fn eat_keyword(&mut self, keyword: &str) -> bool {
        match self.peek() {
            Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword) => {
                self.position += 1;
                true
            }
            _ => false,
        }
    }

    fn eat_symbol(&mut self, symbol: char) -> bool {
        if self.peek() == Some(&Token::Symbol(symbol)) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn keyword(&mut self, keyword: &str) -> Result<(), StatementError> {
        match self.next(keyword)? {
            Token::Word(w) if w.eq_ignore_ascii_case(keyword) => Ok(()),
            other => Err(Self::unexpected(keyword, &other)),
        }
    }

    fn symbol(&mut self, symbol: char) -> Result<(), StatementError> {
        let expected = format!("'{symbol}'");
        match self.next(&expected)? {
            Token::Symbol(c) if c == symbol => Ok(()),
            other => Err(Self::unexpected(&expected, &other)),
        }
    }

    fn identifier(&mut self, what: &str) -> Result<String, StatementError> {
        match self.next(what)? {
            Token::Word(w) => Ok(w),
            other => Err(Self::unexpected(what, &other)),
        }
    }

    fn literal(&mut self) -> Result<Value, StatementError> {
        match self.next("a literal")? {
            Token::Text(t) => Ok(Value::Text(t)),
            Token::Integer(i) => Ok(Value::Integer(i)),
            Token::Float(f) => Ok(Value::Float(f)),
            Token::Word(w) if w.eq_ignore_ascii_case("null") => Ok(Value::Null),
            Token::Word(w) if w.eq_ignore_ascii_case("true") => Ok(Value::Boolean(true)),
            Token::Word(w) if w.eq_ignore_ascii_case("false") => Ok(Value::Boolean(false)),
            other => Err(Self::unexpected("a literal", &other)),
        }
    }

    /// Parses `item (, item)*` up to and including the closing parenthesis.
    fn list<T>(
        &mut self,
        mut item: impl FnMut(&mut Self) -> Result<T, StatementError>,
    ) -> Result<Vec<T>, StatementError> {
        self.symbol('(')?;
        let mut items = vec![item(self)?];
        while self.eat_symbol(',') {
            items.push(item(self)?);
        }
        self.symbol(')')?;
        Ok(items)
    }

    fn column_def(&mut self) -> Result<ColumnDef, StatementError> {
        let name = self.identifier("a column name")?;
        let type_name = self.identifier("a column type")?.to_uppercase();
        let mut serial = type_name == "SERIAL";

        // Modifiers such as PRIMARY KEY, NOT NULL or a VARCHAR(255) length.
        let mut depth = 0_usize;
        while let Some(token) = self.peek() {
            match token {
                Token::Symbol(',') | Token::Symbol(')') if depth == 0 => break,
                Token::Symbol('(') => depth += 1,
                Token::Symbol(')') => depth -= 1,
                Token::Word(w) if w.eq_ignore_ascii_case("serial") => serial = true,
                _ => {}
            }
            self.position += 1;
        }

        Ok(ColumnDef {
            name,
            type_name,
            serial,
        })
    }

    fn statement(&mut self) -> Result<Statement, StatementError> {
        let verb = match self.peek() {
            None => return Err(StatementError::EmptyStatement),
            Some(Token::Word(w)) => w.to_uppercase(),
            Some(other) => return Err(Self::unexpected("a statement", other)),
        };
        self.position += 1;

        match verb.as_str() {
            "CREATE" if self.eat_keyword("database") => Ok(Statement::CreateDatabase {
                name: self.identifier("a database name")?,
            }),
            "CREATE" => {
                self.keyword("table")?;
                let name = self.identifier("a table name")?;
                let columns = self.list(Self::column_def)?;
                Ok(Statement::CreateTable { name, columns })
            }
            "USE" => Ok(Statement::Use {
                name: self.identifier("a database name")?,
            }),
            "DROP" => {
                self.keyword("table")?;
                Ok(Statement::DropTable {
                    name: self.identifier("a table name")?,
                })
            }
            "INSERT" => {
                self.keyword("into")?;
                let table = self.identifier("a table name")?;
                let columns = if self.peek() == Some(&Token::Symbol('(')) {
                    self.list(|p| p.identifier("a column name"))?
                } else {
                    Vec::new()
                };
                self.keyword("values")?;
                let mut rows = vec![self.list(Self::literal)?];
                while self.eat_symbol(',') {
                    rows.push(self.list(Self::literal)?);
                }
                Ok(Statement::Insert {
                    table,
                    columns,
                    rows,
                })
            }
            "SELECT" => {
                let projection = if self.eat_symbol('*') {
                    Projection::All
                } else {
                    let mut columns = vec![self.identifier("a column name")?];
                    while self.eat_symbol(',') {
                        columns.push(self.identifier("a column name")?);
                    }
                    Projection::Columns(columns)
                };
                self.keyword("from")?;
                let table = self.identifier("a table name")?;
                let filter = if self.eat_keyword("where") {
                    let column = self.identifier("a column name")?;
                    self.symbol('=')?;
                    Some(Filter {
                        column,
                        value: self.literal()?,
                    })
                } else {
                    None
                };
                Ok(Statement::Select {
                    table,
                    projection,
                    filter,
                })
            }
            _ => Err(StatementError::Unsupported(verb)),
        }
    }
}

impl TryFrom<&str> for Statement {
    type Error = StatementError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let mut parser = Parser {
            tokens: tokenize(value)?,
            position: 0,
        };

        let statement = parser.statement()?;
        parser.eat_symbol(';');
        match parser.peek() {
            None => Ok(statement),
            Some(token) => Err(Parser::unexpected("end of statement", token)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Statement {
        Statement::try_from(s).unwrap()
    }

    #[test]
    #[should_panic(expected = "Unsupported")]
    fn unsupported_statement() {
        parse("GRANT ALL ON t TO admin;");
    }

    #[test]
    #[should_panic(expected = "EmptyStatement")]
    fn empty_statement() {
        parse("  ");
    }

    #[test]
    fn keywords_are_case_insensitive() {
        assert_eq!(
            parse("use STORE_PROD"),
            Statement::Use {
                name: "STORE_PROD".into()
            }
        );
        assert_eq!(
            parse("Create Database store_prod;"),
            Statement::CreateDatabase {
                name: "store_prod".into()
            }
        );
    }

    #[test]
    fn create_table_with_modifiers() {
        let statement =
            parse("CREATE TABLE users (id SERIAL PRIMARY KEY, name VARCHAR(64) NOT NULL);");

        assert_eq!(
            statement,
            Statement::CreateTable {
                name: "users".into(),
                columns: vec![
                    ColumnDef {
                        name: "id".into(),
                        type_name: "SERIAL".into(),
                        serial: true,
                    },
                    ColumnDef {
                        name: "name".into(),
                        type_name: "VARCHAR".into(),
                        serial: false,
                    },
                ],
            }
        );
    }

    #[test]
    fn insert_with_columns_and_escapes() {
        let statement = parse("INSERT INTO users (name, age) VALUES ('O''Brien', 42), (NULL, -1.5);");

        assert_eq!(
            statement,
            Statement::Insert {
                table: "users".into(),
                columns: vec!["name".into(), "age".into()],
                rows: vec![
                    vec![Value::Text("O'Brien".into()), Value::Integer(42)],
                    vec![Value::Null, Value::Float(-1.5)],
                ],
            }
        );
    }

    #[test]
    fn select_with_filter() {
        assert_eq!(
            parse("SELECT * FROM users_bench WHERE username = 'user_7';"),
            Statement::Select {
                table: "users_bench".into(),
                projection: Projection::All,
                filter: Some(Filter {
                    column: "username".into(),
                    value: Value::Text("user_7".into()),
                }),
            }
        );
    }

    #[test]
    fn select_projection() {
        assert_eq!(
            parse("select id, name from users"),
            Statement::Select {
                table: "users".into(),
                projection: Projection::Columns(vec!["id".into(), "name".into()]),
                filter: None,
            }
        );
    }

    #[test]
    fn trailing_input_is_rejected() {
        let err = Statement::try_from("DROP TABLE t; DROP TABLE u;").unwrap_err();

        assert_eq!(
            err,
            StatementError::UnexpectedToken {
                expected: "end of statement".into(),
                found: "DROP".into(),
            }
        );
    }

    #[test]
    fn lexical_errors() {
        assert_eq!(
            Statement::try_from("SELECT * FROM t WHERE a = 'open"),
            Err(StatementError::UnterminatedString)
        );
        assert_eq!(
            Statement::try_from("SELECT * FROM t WHERE a = 1.2.3"),
            Err(StatementError::InvalidNumber("1.2.3".into()))
        );
        assert_eq!(
            Statement::try_from("SELECT * FROM t WHERE a > 1"),
            Err(StatementError::InvalidCharacter('>'))
        );
    }

    #[test]
    fn truncated_statement() {
        assert_eq!(
            Statement::try_from("INSERT INTO users VALUES ("),
            Err(StatementError::UnexpectedEnd("a literal".into()))
        );
    }
}
