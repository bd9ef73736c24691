use std::fmt;

use bincode::{Decode, Encode};

use super::CorrelationId;

/// Server to client message body.
#[derive(Debug, Clone, Encode, Decode, PartialEq)]
pub enum Response {
    HandshakeAccepted,
    RowSet(RowSet),
    Acknowledgement { affected: u64 },
    Error { code: ErrorCode, message: String },
}

#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum ErrorCode {
    Authentication,
    Syntax,
    Execution,
    Protocol,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Authentication => "authentication",
            ErrorCode::Syntax => "syntax",
            ErrorCode::Execution => "execution",
            ErrorCode::Protocol => "protocol",
        };
        f.write_str(name)
    }
}

/// A [`Response`] tagged with the id of the command it answers.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub id: CorrelationId,
    pub response: Response,
}

impl Reply {
    pub fn new(id: CorrelationId, response: Response) -> Self {
        Self { id, response }
    }
}

/// Explicitly tagged column value. The codec never coerces between variants.
#[derive(Debug, Clone, Encode, Decode, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Boolean(bool),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(s) => f.write_str(s),
            Value::Boolean(b) => write!(f, "{b}"),
        }
    }
}

/// Ordered rows sharing one ordered list of column names.
#[derive(Debug, Clone, Default, Encode, Decode, PartialEq)]
pub struct RowSet {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl RowSet {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Appends a row. Rows shorter than the column list are padded with
    /// `Null`, longer ones are truncated.
    pub fn push(&mut self, mut values: Vec<Value>) {
        values.resize(self.columns.len(), Value::Null);
        self.rows.push(values);
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, index: usize) -> Option<Row<'_>> {
        self.rows.get(index).map(|values| Row {
            columns: &self.columns,
            values,
        })
    }

    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> {
        self.rows.iter().map(|values| Row {
            columns: &self.columns,
            values,
        })
    }
}

impl fmt::Display for RowSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut widths: Vec<usize> = self.columns.iter().map(|c| c.len()).collect();
        let cells: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|row| row.iter().map(Value::to_string).collect())
            .collect();
        for row in &cells {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.len());
            }
        }

        write_line(f, &self.columns, &widths)?;
        let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
        writeln!(f, "{}", rule.join("-+-"))?;
        for row in &cells {
            write_line(f, row, &widths)?;
        }

        match self.rows.len() {
            1 => write!(f, "(1 row)"),
            n => write!(f, "({n} rows)"),
        }
    }
}

fn write_line(f: &mut fmt::Formatter<'_>, items: &[String], widths: &[usize]) -> fmt::Result {
    let padded: Vec<String> = items
        .iter()
        .zip(widths)
        .map(|(item, &width)| format!("{item:<width$}"))
        .collect();
    writeln!(f, "{}", padded.join(" | ").trim_end())
}

/// Borrowed view of one row as an ordered column name to value mapping.
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    columns: &'a [String],
    values: &'a [Value],
}

impl<'a> Row<'a> {
    /// Looks a value up by column name, ASCII case-insensitively.
    pub fn get(&self, column: &str) -> Option<&'a Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .and_then(|i| self.values.get(i))
    }

    pub fn values(&self) -> &'a [Value] {
        self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'a str, &'a Value)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> RowSet {
        let mut set = RowSet::new(vec!["id".into(), "name".into()]);
        set.push(vec![Value::Integer(1), Value::Text("Maaz".into())]);
        set.push(vec![Value::Integer(2)]);
        set
    }

    #[test]
    fn row_lookup_by_column() {
        let set = users();
        let row = set.row(0).unwrap();

        assert_eq!(row.get("name"), Some(&Value::Text("Maaz".into())));
        assert_eq!(row.get("NAME"), Some(&Value::Text("Maaz".into())));
        assert_eq!(row.get("email"), None);
    }

    #[test]
    fn short_rows_are_padded_with_null() {
        let set = users();
        let row = set.row(1).unwrap();

        assert_eq!(row.get("name"), Some(&Value::Null));
        assert_eq!(row.values().len(), 2);
    }

    #[test]
    fn rows_keep_column_order() {
        let set = users();
        let columns: Vec<&str> = set.row(0).unwrap().iter().map(|(c, _)| c).collect();

        assert_eq!(columns, vec!["id", "name"]);
        assert_eq!(set.rows().count(), 2);
    }

    #[test]
    fn display_renders_table() {
        let rendered = users().to_string();

        assert!(rendered.starts_with("id | name\n"));
        assert!(rendered.contains("1  | Maaz"));
        assert!(rendered.ends_with("(2 rows)"));
    }

    #[test]
    fn display_empty_set() {
        let set = RowSet::new(vec!["id".into()]);

        assert_eq!(set.to_string(), "id\n--\n(0 rows)");
    }
}
