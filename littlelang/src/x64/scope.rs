//! Lexical scopes and stack slot assignment
//!
//! Each block reserves `align16(8 * vars)` bytes below the frame of its
//! enclosing block. A variable therefore lives at
//!
//! ```text
//! rbp - 8 * (index + 1) - sum(frame sizes of the defining block's ancestors)
//! ```

use crate::ast::Block;
use crate::{Error, Result};

/// Size of one stack slot
pub const SLOT_SIZE: i32 = 8;

/// Stack bytes reserved by a block, kept 16-byte aligned
pub fn frame_size(block: &Block) -> i32 {
    align16(SLOT_SIZE * block.vars.len() as i32)
}

fn align16(value: i32) -> i32 {
    (value + 15) & !15
}

/// A block together with the chain of blocks enclosing it
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    block: &'a Block,
    parent: Option<&'a Scope<'a>>,
}

impl<'a> Scope<'a> {
    /// The outermost block of a function
    pub fn root(block: &'a Block) -> Self {
        Self {
            block,
            parent: None,
        }
    }

    /// A block nested directly inside `parent`
    pub fn nested(block: &'a Block, parent: &'a Scope<'a>) -> Self {
        Self {
            block,
            parent: Some(parent),
        }
    }

    pub fn block(&self) -> &'a Block {
        self.block
    }

    /// Offset from RBP of the slot holding `name`.
    ///
    /// The innermost declaration wins.
    pub fn stack_offset(&self, name: &str) -> Result<i32> {
        let mut scope = Some(self);
        while let Some(current) = scope {
            if let Some(index) = current.block.vars.iter().position(|var| var.name == name) {
                let enclosing: i32 = current.ancestors().map(|s| frame_size(s.block)).sum();
                return Ok(-SLOT_SIZE * (index as i32 + 1) - enclosing);
            }
            scope = current.parent;
        }

        Err(Error::UnknownVariable {
            name: name.to_string(),
        })
    }

    fn ancestors(&self) -> impl Iterator<Item = &Scope<'a>> {
        std::iter::successors(self.parent, |scope| scope.parent)
    }
}
