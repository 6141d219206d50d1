//! Entity payload values and data-tree scalars.
//!
//! An entity value is an ordered list of items, written as comma separated
//! text: numbers (`5`), atoms (`north`), tuples (`{1,0}`) and intervals with
//! open or closed ends (`(0,1]`). Law nodes use the same representation as
//! a constraint: an entity satisfies the constraint when the constraint
//! [`Value::includes`] the entity's value.
//!
//! [`Datum`] is the scalar stored at a data-tree key once commands run.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One item of a [`Value`].
#[derive(Debug, Clone, PartialEq)]
pub enum ValueItem {
    /// A plain number.
    Number(f64),
    /// An atom that does not parse as anything else.
    Text(String),
    /// `{a,b,...}`
    Tuple(Vec<ValueItem>),
    /// `(a,b)`, `[a,b]`, `(a,b]` or `[a,b)`.
    Interval {
        start: f64,
        end: f64,
        include_start: bool,
        include_end: bool,
    },
}

impl ValueItem {
    fn parse(src: &str) -> Option<Self> {
        let src = src.trim();
        if src.is_empty() {
            return None;
        }
        if let Ok(n) = src.parse::<f64>() {
            return Some(ValueItem::Number(n));
        }
        let first = src.chars().next()?;
        let last = src.chars().last()?;
        if first == '{' && last == '}' && src.len() >= 2 {
            let inner = &src[1..src.len() - 1];
            let items = split_top_level(inner)
                .into_iter()
                .filter_map(ValueItem::parse)
                .collect();
            return Some(ValueItem::Tuple(items));
        }
        if (first == '(' || first == '[') && (last == ')' || last == ']') && src.len() >= 2 {
            let inner = &src[1..src.len() - 1];
            let bounds = split_top_level(inner);
            if let [start, end] = bounds.as_slice() {
                if let (Ok(start), Ok(end)) = (start.trim().parse(), end.trim().parse()) {
                    return Some(ValueItem::Interval {
                        start,
                        end,
                        include_start: first == '[',
                        include_end: last == ']',
                    });
                }
            }
        }
        Some(ValueItem::Text(src.to_string()))
    }

    /// Containment used for law constraints.
    pub fn includes(&self, other: &ValueItem) -> bool {
        match (self, other) {
            (ValueItem::Number(a), ValueItem::Number(b)) => a == b,
            (ValueItem::Text(a), ValueItem::Text(b)) => a == b,
            (ValueItem::Tuple(a), ValueItem::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.includes(y))
            }
            (
                ValueItem::Interval {
                    start,
                    end,
                    include_start,
                    include_end,
                },
                ValueItem::Interval {
                    start: other_start,
                    end: other_end,
                    include_start: other_include_start,
                    include_end: other_include_end,
                },
            ) => {
                let start_ok = start < other_start
                    || (start == other_start && (*include_start || !*other_include_start));
                let end_ok =
                    end > other_end || (end == other_end && (*include_end || !*other_include_end));
                start_ok && end_ok
            }
            (
                ValueItem::Interval {
                    start,
                    end,
                    include_start,
                    include_end,
                },
                ValueItem::Number(n),
            ) => {
                let start_ok = if *include_start { start <= n } else { start < n };
                let end_ok = if *include_end { n <= end } else { n < end };
                start_ok && end_ok
            }
            _ => false,
        }
    }
}

impl fmt::Display for ValueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueItem::Number(n) => write!(f, "{}", Datum::Number(*n)),
            ValueItem::Text(t) => f.write_str(t),
            ValueItem::Tuple(items) => {
                f.write_str("{")?;
                write_joined(f, items)?;
                f.write_str("}")
            }
            ValueItem::Interval {
                start,
                end,
                include_start,
                include_end,
            } => write!(
                f,
                "{}{},{}{}",
                if *include_start { '[' } else { '(' },
                Datum::Number(*start),
                Datum::Number(*end),
                if *include_end { ']' } else { ')' },
            ),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, items: &[ValueItem]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

/// Splits on commas that are not nested inside brackets.
fn split_top_level(src: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in src.char_indices() {
        match c {
            '{' | '(' | '[' => depth += 1,
            '}' | ')' | ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&src[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&src[start..]);
    parts
}

/// Payload of an entity or a law node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Value {
    items: Vec<ValueItem>,
}

impl Value {
    /// The empty value.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parses the comma separated textual form. Never fails: anything that
    /// is not a number, tuple or interval is kept as an atom.
    pub fn parse(src: &str) -> Self {
        let items = split_top_level(src)
            .into_iter()
            .filter_map(ValueItem::parse)
            .collect();
        Self { items }
    }

    /// A single-number value.
    pub fn number(n: f64) -> Self {
        Self {
            items: vec![ValueItem::Number(n)],
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    pub fn items(&self) -> &[ValueItem] {
        &self.items
    }

    /// Returns the number when the value is exactly one number.
    pub fn as_number(&self) -> Option<f64> {
        match self.items.as_slice() {
            [ValueItem::Number(n)] => Some(*n),
            _ => None,
        }
    }

    /// Returns `true` if `other` satisfies this value read as a constraint.
    ///
    /// An empty constraint accepts everything; otherwise both values must
    /// have the same number of items and each item must include its peer.
    pub fn includes(&self, other: &Value) -> bool {
        if self.is_empty() {
            return true;
        }
        self.items.len() == other.items.len()
            && self.items.iter().zip(&other.items).all(|(a, b)| a.includes(b))
    }

    /// The data-tree scalar seeded for this value.
    pub fn to_datum(&self) -> Option<Datum> {
        match self.items.as_slice() {
            [] => None,
            [ValueItem::Number(n)] => Some(Datum::Number(*n)),
            [ValueItem::Text(t)] => Some(Datum::Text(t.clone())),
            _ => Some(Datum::Text(self.to_string())),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_joined(f, &self.items)
    }
}

impl From<String> for Value {
    fn from(src: String) -> Self {
        Value::parse(&src)
    }
}

impl From<Value> for String {
    fn from(value: Value) -> Self {
        value.to_string()
    }
}

/// A scalar held by a data-tree key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Datum {
    Number(f64),
    Text(String),
    List(Vec<Datum>),
}

impl Datum {
    /// Numeric view; text that parses as a number counts.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Datum::Number(n) => Some(*n),
            Datum::Text(t) => t.trim().parse().ok(),
            Datum::List(items) => match items.as_slice() {
                [single] => single.as_number(),
                _ => None,
            },
        }
    }

    /// Appends `item`, turning a scalar into a two-element list.
    pub fn push(self, item: Datum) -> Datum {
        match self {
            Datum::List(mut items) => {
                items.push(item);
                Datum::List(items)
            }
            scalar => Datum::List(vec![scalar, item]),
        }
    }

    /// Flattened items in order; a scalar yields itself.
    pub fn blocks(&self) -> Vec<String> {
        match self {
            Datum::List(items) => items.iter().flat_map(Datum::blocks).collect(),
            scalar => vec![scalar.to_string()],
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Normalise negative zero so `0 * -1` renders as `0`.
            Datum::Number(n) if *n == 0.0 => f.write_str("0"),
            Datum::Number(n) => write!(f, "{n}"),
            Datum::Text(t) => f.write_str(t),
            Datum::List(items) => {
                let joined: Vec<String> = items.iter().map(ToString::to_string).collect();
                f.write_str(&joined.join(","))
            }
        }
    }
}

impl From<f64> for Datum {
    fn from(n: f64) -> Self {
        Datum::Number(n)
    }
}

impl From<&str> for Datum {
    fn from(t: &str) -> Self {
        Datum::Text(t.to_string())
    }
}

impl From<String> for Datum {
    fn from(t: String) -> Self {
        Datum::Text(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_items() {
        let v = Value::parse("5,north,{1,0},[0,2)");
        assert_eq!(v.items().len(), 4);
        assert_eq!(v.items()[0], ValueItem::Number(5.0));
        assert_eq!(v.items()[1], ValueItem::Text("north".into()));
        assert_eq!(
            v.items()[2],
            ValueItem::Tuple(vec![ValueItem::Number(1.0), ValueItem::Number(0.0)])
        );
        assert_eq!(
            v.items()[3],
            ValueItem::Interval {
                start: 0.0,
                end: 2.0,
                include_start: true,
                include_end: false
            }
        );
        assert_eq!(v.to_string(), "5,north,{1,0},[0,2)");
    }

    #[test]
    fn interval_inclusion_respects_open_ends() {
        let closed = Value::parse("[0,1]");
        let open = Value::parse("(0,1)");
        assert!(closed.includes(&open));
        assert!(!open.includes(&closed));
        assert!(closed.includes(&Value::number(1.0)));
        assert!(!open.includes(&Value::number(1.0)));
        assert!(open.includes(&Value::number(0.5)));
    }

    #[test]
    fn tuple_inclusion_is_equality() {
        assert!(Value::parse("{1,0}").includes(&Value::parse("{1,0}")));
        assert!(!Value::parse("{1,0}").includes(&Value::parse("{0,1}")));
    }

    #[test]
    fn empty_constraint_accepts_anything() {
        assert!(Value::empty().includes(&Value::parse("7")));
    }

    #[test]
    fn datum_rendering() {
        assert_eq!(Datum::Number(5.0).to_string(), "5");
        assert_eq!(Datum::Number(-0.0).to_string(), "0");
        assert_eq!(Datum::Number(2.5).to_string(), "2.5");
        let list = Datum::from("a").push(Datum::from("b"));
        assert_eq!(list.to_string(), "a,b");
        assert_eq!(list.blocks(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn value_serde_uses_text_form() {
        let v = Value::parse("(1,2]");
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "\"(1,2]\"");
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
