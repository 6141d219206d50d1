//! Expression templates: source text with embedded `{{reference}}` blocks.

use super::reference::{Reference, ReferenceError};
use crate::dependency::{KeyPath, KeyRef};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Text(String),
    Ref(Reference),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    #[error("unterminated reference block at offset {0}")]
    Unterminated(usize),
    #[error("reference block at offset {offset}: {source}")]
    Reference {
        offset: usize,
        #[source]
        source: ReferenceError,
    },
}

/// A parsed expression, shared by every command compiled from a template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpressionTemplate {
    blocks: Vec<Block>,
}

impl ExpressionTemplate {
    pub fn parse(src: &str) -> Result<Self, ExpressionError> {
        let mut blocks = Vec::new();
        let mut rest = src;
        let mut offset = 0;
        while let Some(open) = rest.find("{{") {
            if open > 0 {
                blocks.push(Block::Text(rest[..open].to_string()));
            }
            let inner = &rest[open + 2..];
            let close = inner
                .find("}}")
                .ok_or(ExpressionError::Unterminated(offset + open))?;
            let reference = Reference::parse(&inner[..close]).map_err(|source| {
                ExpressionError::Reference {
                    offset: offset + open,
                    source,
                }
            })?;
            blocks.push(Block::Ref(reference));
            let consumed = open + 2 + close + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.trim().is_empty() {
            blocks.push(Block::Text(rest.to_string()));
        }
        Ok(Self { blocks })
    }

    #[inline]
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// `true` when no block reads another key.
    pub fn is_constant(&self) -> bool {
        self.blocks.iter().all(|b| matches!(b, Block::Text(_)))
    }
}

/// A block bound to concrete sources by compilation.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundBlock {
    Text(String),
    Ref {
        /// One per reached entity; several yield a list operand.
        sources: Vec<KeyRef>,
        recursive: bool,
        /// Key appended to a `$variable` binding once it is known.
        suffix: KeyPath,
    },
}

impl BoundBlock {
    #[inline]
    pub fn is_recursive(&self) -> bool {
        matches!(self, BoundBlock::Ref { recursive: true, .. })
    }
}
