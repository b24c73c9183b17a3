//! Operational transform over plain-text operations.
//!
//! Pure functions only: no I/O and no state. Positions and lengths count
//! `char`s, so multi-byte text never splits a code point.
//!
//! The convergence property every transform satisfies:
//!
//! ```text
//! let (a2, b2) = transform(&a, &b, priority);
//! apply(&apply(doc, &a)?, &b2)? == apply(&apply(doc, &b)?, &a2)?
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{CollabError, Result};

/// One atomic document mutation.
///
/// Wire form: `{"insert":{"position":3,"text":"ab"}}`,
/// `{"delete":{"position":0,"length":5}}` or `"noop"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert { position: usize, text: String },
    Delete { position: usize, length: usize },
    Noop,
}

impl Operation {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        Self::Insert {
            position,
            text: text.into(),
        }
    }

    pub fn delete(position: usize, length: usize) -> Self {
        Self::Delete { position, length }
    }

    /// True for `Noop` and for operations that change nothing.
    pub fn is_noop(&self) -> bool {
        match self {
            Self::Insert { text, .. } => text.is_empty(),
            Self::Delete { length, .. } => *length == 0,
            Self::Noop => true,
        }
    }
}

/// Which side wins when two inserts land on the same position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// `op_a` is treated as the earlier position.
    #[default]
    Left,
    /// `op_b` is treated as the earlier position.
    Right,
}

/// Transform two concurrent operations against each other.
///
/// Returns `(a', b')` where `a'` is `op_a` rebased onto a document that
/// already has `op_b` applied, and vice versa.
///
/// Positions come off the wire unchecked, so shifts saturate instead of
/// overflowing; an op pushed past `usize::MAX` fails later in [`apply`].
pub fn transform(op_a: &Operation, op_b: &Operation, priority: Priority) -> (Operation, Operation) {
    use Operation::*;

    match (op_a, op_b) {
        (Insert { position: pa, text: ta }, Insert { position: pb, text: tb }) => {
            let a_first = pa < pb || (pa == pb && priority == Priority::Left);
            if a_first {
                (op_a.clone(), Operation::insert(pb.saturating_add(char_len(ta)), tb.clone()))
            } else {
                (Operation::insert(pa.saturating_add(char_len(tb)), ta.clone()), op_b.clone())
            }
        }

        (Delete { position: pa, length: la }, Delete { position: pb, length: lb }) => {
            transform_deletes((*pa, *la), (*pb, *lb), op_a, op_b)
        }

        (Insert { position, text }, Delete { position: dp, length: dl }) => {
            transform_insert_delete((*position, text), (*dp, *dl), op_a, op_b)
        }

        (Delete { position: dp, length: dl }, Insert { position, text }) => {
            let (insert, delete) = transform_insert_delete((*position, text), (*dp, *dl), op_b, op_a);
            (delete, insert)
        }

        // Anything paired with a noop commutes as-is.
        _ => (op_a.clone(), op_b.clone()),
    }
}

fn transform_deletes(
    (a_pos, a_len): (usize, usize),
    (b_pos, b_len): (usize, usize),
    op_a: &Operation,
    op_b: &Operation,
) -> (Operation, Operation) {
    let a_end = a_pos.saturating_add(a_len);
    let b_end = b_pos.saturating_add(b_len);

    if a_end <= b_pos {
        return (op_a.clone(), Operation::delete(b_pos - a_len, b_len));
    }
    if b_end <= a_pos {
        return (Operation::delete(a_pos - b_len, a_len), op_b.clone());
    }

    // Overlap: each side only removes what the other left behind, so the
    // combined effect is one delete over the union of both ranges.
    let overlap = a_end.min(b_end) - a_pos.max(b_pos);
    let start = a_pos.min(b_pos);
    (
        delete_or_noop(start, a_len - overlap),
        delete_or_noop(start, b_len - overlap),
    )
}

/// Returns `(insert', delete')`.
fn transform_insert_delete(
    (ins_pos, text): (usize, &String),
    (del_pos, del_len): (usize, usize),
    insert: &Operation,
    delete: &Operation,
) -> (Operation, Operation) {
    let text_len = char_len(text);

    if ins_pos <= del_pos {
        (insert.clone(), Operation::delete(del_pos.saturating_add(text_len), del_len))
    } else if ins_pos >= del_pos.saturating_add(del_len) {
        (Operation::insert(ins_pos - del_len, text.clone()), delete.clone())
    } else {
        // Insert landed inside the deleted range: the delete absorbs it.
        (Operation::Noop, Operation::delete(del_pos, del_len.saturating_add(text_len)))
    }
}

fn delete_or_noop(position: usize, length: usize) -> Operation {
    if length == 0 {
        Operation::Noop
    } else {
        Operation::delete(position, length)
    }
}

/// Collapse two overlapping (or touching) deletes on the same base
/// document into one delete over the union of their ranges.
///
/// Returns `None` when the ranges are disjoint or either side is not a
/// delete.
pub fn merge_deletes(op_a: &Operation, op_b: &Operation) -> Option<Operation> {
    match (op_a, op_b) {
        (
            Operation::Delete { position: a_pos, length: a_len },
            Operation::Delete { position: b_pos, length: b_len },
        ) => {
            let a_end = a_pos.saturating_add(*a_len);
            let b_end = b_pos.saturating_add(*b_len);
            if *a_pos <= b_end && *b_pos <= a_end {
                let start = *a_pos.min(b_pos);
                Some(Operation::delete(start, a_end.max(b_end) - start))
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Rebase `op` over a sequence of operations that were applied after the
/// state `op` was written against.
pub fn transform_against<'a, I>(op: &Operation, applied: I, priority: Priority) -> Operation
where
    I: IntoIterator<Item = &'a Operation>,
{
    applied
        .into_iter()
        .fold(op.clone(), |current, other| transform(&current, other, priority).0)
}

/// Apply an operation to a document, returning the new document.
pub fn apply(doc: &str, op: &Operation) -> Result<String> {
    match op {
        Operation::Insert { position, text } => {
            let len = char_len(doc);
            if *position > len {
                return Err(CollabError::OutOfBounds { position: *position, len });
            }
            let at = byte_offset(doc, *position);
            let mut out = String::with_capacity(doc.len() + text.len());
            out.push_str(&doc[..at]);
            out.push_str(text);
            out.push_str(&doc[at..]);
            Ok(out)
        }

        Operation::Delete { position, length } => {
            let len = char_len(doc);
            let end = position.saturating_add(*length);
            if end > len {
                return Err(CollabError::OutOfBounds { position: end, len });
            }
            let start = byte_offset(doc, *position);
            let stop = byte_offset(doc, end);
            let mut out = String::with_capacity(doc.len() - (stop - start));
            out.push_str(&doc[..start]);
            out.push_str(&doc[stop..]);
            Ok(out)
        }

        Operation::Noop => Ok(doc.to_string()),
    }
}

#[inline]
fn char_len(s: &str) -> usize {
    s.chars().count()
}

#[inline]
fn byte_offset(s: &str, char_index: usize) -> usize {
    s.char_indices()
        .nth(char_index)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}
