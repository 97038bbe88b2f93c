// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flattened configuration-tree blobs and the resumable cursor used to walk
//! them one token at a time.
//!
//! A blob is a sequence of 4-byte-aligned big-endian tokens: a begin-node
//! token carries an inline NUL-terminated node name, a property token carries
//! a payload length, an inline NUL-terminated property name, and the payload
//! bytes.  Property names live inline rather than in a separate strings
//! table, so any blob is self-describing and a snapshot of it can be walked
//! independently of the cursor that produced it.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

const TOK_BEGIN_NODE: u32 = 0x1;
const TOK_END_NODE: u32 = 0x2;
const TOK_PROP: u32 = 0x3;
const TOK_NOP: u32 = 0x4;
const TOK_END: u32 = 0x9;

const fn align4(off: usize) -> usize {
    (off + 3) & !3
}

#[derive(Debug, Error)]
pub enum FdtError {
    #[error("stream truncated at offset {0:#x}")]
    Truncated(usize),

    #[error("unrecognized token {1:#x} at offset {0:#x}")]
    BadToken(usize, u32),

    #[error("unterminated or non-utf8 string at offset {0:#x}")]
    BadString(usize),

    #[error("stream terminator inside an open node at offset {0:#x}")]
    UnexpectedEnd(usize),

    #[error("node close with no open node at offset {0:#x}")]
    UnbalancedClose(usize),

    #[error("property outside of any node at offset {0:#x}")]
    StrayProperty(usize),
}

/// One decoded token and the offset just past it.
enum Token {
    BeginNode(String),
    EndNode,
    Prop { name: String, data: Vec<u8> },
    Nop,
    End,
}

/// An immutable configuration-tree blob.
///
/// Cheap to clone: the underlying bytes are shared, so a diagnostic walk can
/// snapshot the blob without copying it out from under the guest-facing
/// cursor.
#[derive(Clone)]
pub struct Fdt {
    buf: Arc<[u8]>,
}

impl Fdt {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { buf: bytes.into() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    fn read_u32(&self, off: usize) -> Result<u32, FdtError> {
        let bytes = self
            .buf
            .get(off..off + 4)
            .ok_or(FdtError::Truncated(off))?;
        Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn read_cstr(&self, off: usize) -> Result<(String, usize), FdtError> {
        let rest = self.buf.get(off..).ok_or(FdtError::Truncated(off))?;
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(FdtError::BadString(off))?;
        let name = std::str::from_utf8(&rest[..nul])
            .map_err(|_| FdtError::BadString(off))?
            .to_string();
        Ok((name, align4(off + nul + 1)))
    }

    fn token_at(&self, off: usize) -> Result<(Token, usize), FdtError> {
        let tok = self.read_u32(off)?;
        let body = off + 4;
        match tok {
            TOK_BEGIN_NODE => {
                let (name, next) = self.read_cstr(body)?;
                Ok((Token::BeginNode(name), next))
            }
            TOK_END_NODE => Ok((Token::EndNode, body)),
            TOK_PROP => {
                let len = self.read_u32(body)? as usize;
                let (name, data_off) = self.read_cstr(body + 4)?;
                let data = self
                    .buf
                    .get(data_off..data_off + len)
                    .ok_or(FdtError::Truncated(data_off))?
                    .to_vec();
                Ok((Token::Prop { name, data }, align4(data_off + len)))
            }
            TOK_NOP => Ok((Token::Nop, body)),
            TOK_END => Ok((Token::End, body)),
            other => Err(FdtError::BadToken(off, other)),
        }
    }
}

/// Append-only writer producing an [`Fdt`] blob.
pub struct FdtBuilder {
    buf: Vec<u8>,
    depth: usize,
}

impl FdtBuilder {
    pub fn new() -> Self {
        Self { buf: Vec::new(), depth: 0 }
    }

    fn push_token(&mut self, tok: u32) {
        self.buf.extend_from_slice(&tok.to_be_bytes());
    }

    fn push_cstr(&mut self, s: &str) {
        assert!(!s.as_bytes().contains(&0), "embedded NUL in name");
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
    }

    pub fn begin_node(&mut self, name: &str) -> &mut Self {
        self.push_token(TOK_BEGIN_NODE);
        self.push_cstr(name);
        self.depth += 1;
        self
    }

    pub fn end_node(&mut self) -> &mut Self {
        assert!(self.depth > 0, "no open node");
        self.push_token(TOK_END_NODE);
        self.depth -= 1;
        self
    }

    pub fn prop(&mut self, name: &str, data: &[u8]) -> &mut Self {
        assert!(self.depth > 0, "property outside of a node");
        self.push_token(TOK_PROP);
        self.buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
        self.push_cstr(name);
        self.buf.extend_from_slice(data);
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
        self
    }

    pub fn prop_u32(&mut self, name: &str, value: u32) -> &mut Self {
        self.prop(name, &value.to_be_bytes())
    }

    pub fn nop(&mut self) -> &mut Self {
        self.push_token(TOK_NOP);
        self
    }

    pub fn finish(mut self) -> Fdt {
        assert_eq!(self.depth, 0, "unclosed node");
        self.push_token(TOK_END);
        Fdt { buf: self.buf.into() }
    }
}

impl Default for FdtBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Response from one cursor step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Entered a child node.
    NextChild { name: String },
    /// Closed a node whose parent is not the root.
    PrevParent,
    /// Yielded one property of the current node.
    NextProperty { name: String, data: Vec<u8> },
    /// Closed the root node; the walk is complete.
    Success,
}

/// A resumable, depth-tracked cursor over an [`Fdt`] blob.
///
/// Each [`step`](Self::step) call consumes exactly one meaningful token and
/// returns the corresponding [`Step`].  Stepping again after `Success` or an
/// error is a caller bug; the cursor makes no attempt to produce anything
/// sensible past either.
#[derive(Copy, Clone, Debug)]
pub struct FdtCursor {
    start_offset: usize,
    offset: usize,
    depth: u32,
}

impl FdtCursor {
    pub fn new(start_offset: usize) -> Self {
        Self { start_offset, offset: start_offset, depth: 0 }
    }

    /// Rebuild a cursor from raw state captured by [`Self::offset`] and
    /// friends, e.g. when restoring a mid-walk snapshot.
    pub fn restore(start_offset: usize, offset: usize, depth: u32) -> Self {
        Self { start_offset, offset, depth }
    }

    pub fn start_offset(&self) -> usize {
        self.start_offset
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn step(&mut self, fdt: &Fdt) -> Result<Step, FdtError> {
        loop {
            let at = self.offset;
            let (token, next) = fdt.token_at(at)?;
            self.offset = next;
            match token {
                Token::BeginNode(name) => {
                    self.depth += 1;
                    return Ok(Step::NextChild { name });
                }
                Token::EndNode => {
                    if self.depth == 0 {
                        return Err(FdtError::UnbalancedClose(at));
                    }
                    self.depth -= 1;
                    return Ok(if self.depth == 0 {
                        Step::Success
                    } else {
                        Step::PrevParent
                    });
                }
                Token::Prop { name, data } => {
                    return Ok(Step::NextProperty { name, data });
                }
                Token::End => {
                    return Err(FdtError::UnexpectedEnd(at));
                }
                Token::Nop => continue,
            }
        }
    }
}

/// Structured view of one subtree, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FdtNode {
    pub name: String,
    pub props: Vec<FdtProp>,
    pub children: Vec<FdtNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FdtProp {
    pub name: String,
    pub data: Vec<u8>,
}

/// Drive a fresh cursor from `start_offset` to completion, collecting the
/// nested node/property structure of the subtree.
pub fn read_tree(fdt: &Fdt, start_offset: usize) -> Result<FdtNode, FdtError> {
    let mut cursor = FdtCursor::new(start_offset);
    let mut stack: Vec<FdtNode> = Vec::new();
    loop {
        let at = cursor.offset();
        match cursor.step(fdt)? {
            Step::NextChild { name } => {
                stack.push(FdtNode {
                    name,
                    props: Vec::new(),
                    children: Vec::new(),
                });
            }
            Step::NextProperty { name, data } => {
                let node =
                    stack.last_mut().ok_or(FdtError::StrayProperty(at))?;
                node.props.push(FdtProp { name, data });
            }
            Step::PrevParent => {
                // Cursor depth tracking guarantees a parent is open here
                let child = stack.pop().unwrap();
                stack.last_mut().unwrap().children.push(child);
            }
            Step::Success => {
                return Ok(stack.pop().unwrap());
            }
        }
    }
}
