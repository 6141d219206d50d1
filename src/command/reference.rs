//! Reference parser.
//!
//! ```text
//! reference := "$" ident ("." key)* flags
//!            | [selector ("." selector)* "."] key ("." key)* flags
//!            | selector ("." selector)* flags
//! selector  := ("S" | "A" | "B" | "C") ["[" ["!"] concept "]"]
//! flags     := [":R"] [">" ident]
//! ```
//!
//! A single upper-case `S`, `A`, `B` or `C` segment is a selector; anything
//! else is a key. Selectors may only precede keys.

use crate::catalog::Catalog;
use crate::core::{EntityId, Relation, Side};
use crate::dependency::KeyPath;
use std::fmt;
use thiserror::Error;

/// One hop from the current entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Selector {
    /// `S`: the entity itself.
    Current,
    /// `A`: the head parent.
    Head,
    /// `B`: the reference parent.
    Reference,
    /// `C`: entities whose head is the current entity.
    Children,
}

impl Selector {
    fn from_char(c: char) -> Option<Self> {
        match c {
            'S' => Some(Selector::Current),
            'A' => Some(Selector::Head),
            'B' => Some(Selector::Reference),
            'C' => Some(Selector::Children),
            _ => None,
        }
    }

    pub fn letter(self) -> char {
        match self {
            Selector::Current => 'S',
            Selector::Head => 'A',
            Selector::Reference => 'B',
            Selector::Children => 'C',
        }
    }

    /// Head and reference exchanged, as used for symmetric concepts.
    pub fn swapped(self) -> Self {
        match self {
            Selector::Head => Selector::Reference,
            Selector::Reference => Selector::Head,
            other => other,
        }
    }
}

/// `[concept]` or `[!concept]` after a selector.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConceptFilter {
    pub concept: String,
    pub negated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Step {
    pub selector: Selector,
    pub filter: Option<ConceptFilter>,
}

/// What a reference starts from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Base {
    /// `$name`: a `(dependency, key)` bound by another command.
    Variable(String),
    /// A selector chain; empty means the owning entity.
    Nodes(Vec<Step>),
}

/// Parsed reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    pub base: Base,
    pub key: KeyPath,
    /// `:R`: evaluate once per sub-key.
    pub recursive: bool,
    /// `>name`: bind the resolved target to a variable.
    pub bind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    #[error("empty reference")]
    Empty,
    #[error("expected a name at offset {position}")]
    ExpectedName { position: usize },
    #[error("unexpected `{found}` at offset {position}")]
    Unexpected { position: usize, found: char },
    #[error("unterminated concept filter at offset {position}")]
    UnterminatedFilter { position: usize },
    #[error("selector after key segment at offset {position}")]
    SelectorAfterKey { position: usize },
}

struct Cursor {
    chars: Vec<char>,
    pos: usize,
}

impl Cursor {
    fn new(src: &str) -> Self {
        Self {
            chars: src.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn name(&mut self) -> Result<String, ReferenceError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(ReferenceError::ExpectedName { position: start });
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    /// A selector letter followed by a segment boundary.
    fn at_selector(&self) -> bool {
        self.peek().and_then(Selector::from_char).is_some()
            && matches!(self.peek_at(1), None | Some('.' | '[' | ':' | '>'))
    }

    fn step(&mut self) -> Result<Step, ReferenceError> {
        let position = self.pos;
        let selector = self
            .peek()
            .and_then(Selector::from_char)
            .ok_or(ReferenceError::ExpectedName { position })?;
        self.pos += 1;
        let filter = if self.eat('[') {
            let negated = self.eat('!');
            let start = self.pos;
            while matches!(self.peek(), Some(c) if c != ']') {
                self.pos += 1;
            }
            if !self.eat(']') {
                return Err(ReferenceError::UnterminatedFilter { position });
            }
            let concept: String = self.chars[start..self.pos - 1].iter().collect();
            let concept = concept.trim().to_string();
            if concept.is_empty() {
                return Err(ReferenceError::ExpectedName { position: start });
            }
            Some(ConceptFilter { concept, negated })
        } else {
            None
        };
        Ok(Step { selector, filter })
    }
}

impl Reference {
    /// Parses a complete reference; leftover characters are an error.
    pub fn parse(src: &str) -> Result<Self, ReferenceError> {
        let src = src.trim();
        if src.is_empty() {
            return Err(ReferenceError::Empty);
        }
        let mut cur = Cursor::new(src);
        let mut segments = Vec::new();
        let base = if cur.eat('$') {
            let name = cur.name()?;
            while cur.eat('.') {
                segments.push(cur.name()?);
            }
            Base::Variable(name)
        } else {
            let mut steps = Vec::new();
            loop {
                if cur.at_selector() {
                    if !segments.is_empty() {
                        return Err(ReferenceError::SelectorAfterKey { position: cur.pos });
                    }
                    steps.push(cur.step()?);
                } else {
                    segments.push(cur.name()?);
                }
                if !cur.eat('.') {
                    break;
                }
            }
            Base::Nodes(steps)
        };
        let recursive = if cur.eat(':') {
            if !cur.eat('R') {
                return Err(unexpected(&cur));
            }
            true
        } else {
            false
        };
        let bind = if cur.eat('>') { Some(cur.name()?) } else { None };
        if !cur.at_end() {
            return Err(unexpected(&cur));
        }
        Ok(Reference {
            base,
            key: KeyPath::from_segments(segments),
            recursive,
            bind,
        })
    }

    /// Entities reached by the selector chain from `owner`, in order and
    /// without duplicates. Variables reach no entity.
    pub fn resolve_nodes(
        &self,
        relation: &Relation,
        catalog: &Catalog,
        owner: EntityId,
        swapped: bool,
    ) -> Vec<EntityId> {
        let Base::Nodes(steps) = &self.base else {
            return Vec::new();
        };
        let mut current = vec![owner];
        for step in steps {
            let selector = if swapped {
                step.selector.swapped()
            } else {
                step.selector
            };
            let mut next: Vec<EntityId> = Vec::new();
            for id in &current {
                let reached = match selector {
                    Selector::Current => vec![*id],
                    Selector::Head => relation.get(*id).and_then(|e| e.head).into_iter().collect(),
                    Selector::Reference => relation
                        .get(*id)
                        .and_then(|e| e.reference)
                        .into_iter()
                        .collect(),
                    Selector::Children => relation.children(*id, Side::Head),
                };
                for r in reached {
                    let keep = match &step.filter {
                        None => true,
                        Some(f) => relation.get(r).map_or(false, |e| {
                            catalog.instance_of_name(e.concept, &f.concept) != f.negated
                        }),
                    };
                    if keep && !next.contains(&r) {
                        next.push(r);
                    }
                }
            }
            current = next;
        }
        current
    }
}

fn unexpected(cur: &Cursor) -> ReferenceError {
    match cur.peek() {
        Some(found) => ReferenceError::Unexpected {
            position: cur.pos,
            found,
        },
        None => ReferenceError::ExpectedName { position: cur.pos },
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        match &self.base {
            Base::Variable(name) => parts.push(format!("${name}")),
            Base::Nodes(steps) => {
                for step in steps {
                    let mut s = step.selector.letter().to_string();
                    if let Some(filter) = &step.filter {
                        s.push('[');
                        if filter.negated {
                            s.push('!');
                        }
                        s.push_str(&filter.concept);
                        s.push(']');
                    }
                    parts.push(s);
                }
            }
        }
        parts.extend(self.key.segments().iter().cloned());
        f.write_str(&parts.join("."))?;
        if self.recursive {
            f.write_str(":R")?;
        }
        if let Some(bind) = &self.bind {
            write!(f, ">{bind}")?;
        }
        Ok(())
    }
}
