//! Relevance predicates.
//!
//! A table view is scoped by a [`ConditionSet`]: an ordered conjunction of
//! column comparisons. The same set scopes the bulk fetch on the remote side
//! and is re-evaluated in-process for every push event, because the remote
//! channel filter can only express a single equality and cannot notice a
//! row drifting out of scope.

use crate::error::{ProtocolError, ProtocolResult};
use crate::row::TableRow;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Comparison operator of a [`Condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    /// Column equals value.
    Eq,
    /// Column does not equal value.
    Neq,
    /// Column is greater than value.
    Gt,
    /// Column is less than value.
    Lt,
    /// Column is greater than or equal to value.
    Gte,
    /// Column is less than or equal to value.
    Lte,
    /// Any operator name this version does not know. Never matches.
    #[serde(other)]
    Unsupported,
}

impl Operator {
    /// Returns the wire name of the operator.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Neq => "neq",
            Operator::Gt => "gt",
            Operator::Lt => "lt",
            Operator::Gte => "gte",
            Operator::Lte => "lte",
            Operator::Unsupported => "unsupported",
        }
    }

    /// Applies the operator to a column value and a literal.
    pub fn apply(&self, actual: &Value, expected: &Value) -> bool {
        match self {
            Operator::Eq => actual.loosely_equals(expected),
            Operator::Neq => !actual.loosely_equals(expected),
            Operator::Gt => actual.compare(expected) == Some(Ordering::Greater),
            Operator::Lt => actual.compare(expected) == Some(Ordering::Less),
            Operator::Gte => matches!(
                actual.compare(expected),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::Lte => matches!(
                actual.compare(expected),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::Unsupported => false,
        }
    }
}

impl FromStr for Operator {
    type Err = std::convert::Infallible;

    /// Unknown names map to [`Operator::Unsupported`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "eq" => Operator::Eq,
            "neq" => Operator::Neq,
            "gt" => Operator::Gt,
            "lt" => Operator::Lt,
            "gte" => Operator::Gte,
            "lte" => Operator::Lte,
            _ => Operator::Unsupported,
        })
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single column comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Column to read from the row.
    pub column: String,
    /// Comparison operator.
    #[serde(rename = "op")]
    pub operator: Operator,
    /// Literal to compare against.
    pub value: Value,
}

impl Condition {
    /// Creates a condition.
    pub fn new(column: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            operator,
            value: value.into(),
        }
    }

    /// Shorthand for an `eq` condition.
    pub fn equals(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, Operator::Eq, value)
    }

    /// Parses the compact form `column:op:value`.
    ///
    /// The value is read as a JSON scalar when it parses as one (`42`,
    /// `true`, `null`, `"quoted"`), and as raw text otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if a part is missing or the column is empty.
    pub fn parse(input: &str) -> ProtocolResult<Self> {
        let mut parts = input.splitn(3, ':');
        let (Some(column), Some(op), Some(raw)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ProtocolError::invalid_condition(
                input,
                "expected column:op:value",
            ));
        };
        if column.is_empty() {
            return Err(ProtocolError::invalid_condition(input, "empty column name"));
        }
        let operator = op.parse().unwrap_or(Operator::Unsupported);
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::Text(raw.to_string()));
        Ok(Self::new(column, operator, value))
    }

    /// Returns true if `row` satisfies this condition.
    ///
    /// A missing column reads as `Null`.
    pub fn matches<R: TableRow>(&self, row: &R) -> bool {
        let actual = row.column(&self.column).unwrap_or(Value::Null);
        self.operator.apply(&actual, &self.value)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.column, self.operator, self.value)
    }
}

/// Ordered conjunction of conditions. Empty sets match every row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConditionSet {
    conditions: Vec<Condition>,
}

impl ConditionSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a condition and returns the set.
    pub fn with(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Appends a condition.
    pub fn push(&mut self, condition: Condition) {
        self.conditions.push(condition);
    }

    /// Returns true if every condition holds, stopping at the first failure.
    pub fn matches<R: TableRow>(&self, row: &R) -> bool {
        self.conditions.iter().all(|c| c.matches(row))
    }

    /// Iterates over the conditions in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Condition> {
        self.conditions.iter()
    }

    /// Returns the number of conditions.
    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    /// Returns true if the set has no conditions.
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

impl FromIterator<Condition> for ConditionSet {
    fn from_iter<I: IntoIterator<Item = Condition>>(iter: I) -> Self {
        Self {
            conditions: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a ConditionSet {
    type Item = &'a Condition;
    type IntoIter = std::slice::Iter<'a, Condition>;

    fn into_iter(self) -> Self::IntoIter {
        self.conditions.iter()
    }
}

/// Evaluates `row` against `conditions`.
pub fn evaluate<R: TableRow>(row: &R, conditions: &ConditionSet) -> bool {
    conditions.matches(row)
}

/// Single-column equality the remote side enforces on fetches and on the
/// push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prefilter {
    /// Column to match.
    pub column: String,
    /// Required value.
    pub value: Value,
}

impl Prefilter {
    /// Creates a prefilter.
    pub fn new(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Parses `column=value`, reading the value like [`Condition::parse`].
    ///
    /// # Errors
    ///
    /// Returns an error if there is no `=` or the column is empty.
    pub fn parse(input: &str) -> ProtocolResult<Self> {
        match input.split_once('=') {
            Some((column, raw)) if !column.is_empty() => Ok(Self::new(
                column,
                serde_json::from_str(raw).unwrap_or_else(|_| Value::Text(raw.to_string())),
            )),
            _ => Err(ProtocolError::invalid_condition(input, "expected column=value")),
        }
    }

    /// Returns true if `row` passes the prefilter.
    pub fn matches<R: TableRow>(&self, row: &R) -> bool {
        row.column(&self.column)
            .unwrap_or(Value::Null)
            .loosely_equals(&self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Row;

    fn task(status: &str, priority: i64) -> Row {
        Row::new()
            .with("id", 1)
            .with("status", status)
            .with("priority", priority)
    }

    #[test]
    fn empty_set_matches_everything() {
        let set = ConditionSet::new();
        assert!(set.matches(&task("open", 1)));
        assert!(set.matches(&Row::new()));
        assert!(evaluate(&Row::new(), &set));
    }

    #[test]
    fn every_operator() {
        let row = task("open", 5);
        assert!(Condition::new("priority", Operator::Eq, 5).matches(&row));
        assert!(Condition::new("priority", Operator::Neq, 4).matches(&row));
        assert!(Condition::new("priority", Operator::Gt, 4).matches(&row));
        assert!(!Condition::new("priority", Operator::Gt, 5).matches(&row));
        assert!(Condition::new("priority", Operator::Gte, 5).matches(&row));
        assert!(Condition::new("priority", Operator::Lt, 6).matches(&row));
        assert!(!Condition::new("priority", Operator::Lt, 5).matches(&row));
        assert!(Condition::new("priority", Operator::Lte, 5).matches(&row));
    }

    #[test]
    fn conjunction_requires_all() {
        let set = ConditionSet::new()
            .with(Condition::equals("status", "open"))
            .with(Condition::new("priority", Operator::Gte, 3));

        assert!(set.matches(&task("open", 3)));
        assert!(!set.matches(&task("open", 2)));
        assert!(!set.matches(&task("closed", 9)));
    }

    #[test]
    fn unsupported_operator_fails_closed() {
        let cond = Condition::new("status", Operator::Unsupported, "open");
        assert!(!cond.matches(&task("open", 1)));
        assert_eq!("like".parse::<Operator>().unwrap(), Operator::Unsupported);

        let decoded: Condition =
            serde_json::from_str(r#"{"column": "status", "op": "ilike", "value": "o%"}"#).unwrap();
        assert_eq!(decoded.operator, Operator::Unsupported);
        assert!(!decoded.matches(&task("open", 1)));
    }

    #[test]
    fn missing_column_is_null() {
        let row = Row::new().with("id", 1);
        assert!(Condition::equals("archived_at", Value::Null).matches(&row));
        assert!(!Condition::new("priority", Operator::Lt, 10).matches(&row));
        assert!(Condition::new("priority", Operator::Neq, 10).matches(&row));
    }

    #[test]
    fn parse_compact_form() {
        let cond = Condition::parse("priority:gte:3").unwrap();
        assert_eq!(cond, Condition::new("priority", Operator::Gte, 3));

        let cond = Condition::parse("status:eq:open").unwrap();
        assert_eq!(cond.value, Value::Text("open".into()));

        let cond = Condition::parse("note:eq:a:b").unwrap();
        assert_eq!(cond.value, Value::Text("a:b".into()));

        let cond = Condition::parse("done:EQ:false").unwrap();
        assert_eq!(cond, Condition::equals("done", false));

        assert!(Condition::parse("status").is_err());
        assert!(Condition::parse(":eq:1").is_err());
    }

    #[test]
    fn prefilter_parse_and_match() {
        let pre = Prefilter::parse("list_id=7").unwrap();
        assert_eq!(pre, Prefilter::new("list_id", 7));
        assert!(pre.matches(&Row::new().with("list_id", 7)));
        assert!(!pre.matches(&Row::new().with("list_id", 8)));
        assert!(Prefilter::parse("list_id").is_err());
    }
}
