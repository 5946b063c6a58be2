//! Operational transform
//!
//! `transform(a, b)` rewrites two changes made against the same base so that
//! applying `a` then `b'` yields the same document as applying `b` then `a'`.
//! The first argument is treated as if it happened first: when two inserts
//! land on the same offset, `a`'s text ends up in front.
//!
//! Selections in `before`/`after` are moved along with the content they point
//! into, using the same offset rules as string operations.

use std::cmp::{max, min};

use crate::error::{CollabError, CollabResult};
use crate::model::document::char_len;
use crate::model::{Change, Diff, Operation, Selection};

/// Transform two concurrent changes in place
///
/// On error neither change is modified.
pub fn transform(a: &mut Change, b: &mut Change) -> CollabResult<()> {
    let mut a_ops = a.ops.clone();
    let mut b_ops = b.ops.clone();
    transform_ops(&mut a_ops, &mut b_ops)?;

    for sel in [&mut a.before.selection, &mut a.after.selection] {
        transform_selection(sel, &b.ops);
    }
    for sel in [&mut b.before.selection, &mut b.after.selection] {
        transform_selection(sel, &a.ops);
    }
    a.ops = a_ops;
    b.ops = b_ops;
    Ok(())
}

/// Copying variant of [`transform`]
pub fn transformed(a: &Change, b: &Change) -> CollabResult<(Change, Change)> {
    let mut a = a.clone();
    let mut b = b.clone();
    transform(&mut a, &mut b)?;
    Ok((a, b))
}

/// Transform two concurrent operation sequences in place
pub fn transform_ops(a: &mut Vec<Operation>, b: &mut Vec<Operation>) -> CollabResult<()> {
    let mut left: Vec<Option<Operation>> = a.drain(..).map(Some).collect();
    let mut right: Vec<Option<Operation>> = b.drain(..).map(Some).collect();

    for l in left.iter_mut() {
        for r in right.iter_mut() {
            let (keep_l, keep_r) = match (l.as_mut(), r.as_mut()) {
                (Some(x), Some(y)) => transform_op(x, y)?,
                _ => continue,
            };
            if !keep_r {
                *r = None;
            }
            if !keep_l {
                *l = None;
                break;
            }
        }
    }

    a.extend(left.into_iter().flatten());
    b.extend(right.into_iter().flatten());
    Ok(())
}

enum Relation {
    Independent,
    Diffs,
    SetSet,
    DeleteDelete,
    Conflict(&'static str),
}

fn relation(a: &Operation, b: &Operation) -> Relation {
    let overlap = a.path().iter().zip(b.path()).all(|(x, y)| x == y);
    if !overlap {
        return Relation::Independent;
    }
    let same_path = a.path() == b.path();
    match (a, b) {
        (Operation::Update { diff: da, .. }, Operation::Update { diff: db, .. }) if same_path => {
            if da.is_text() == db.is_text() {
                Relation::Diffs
            } else {
                Relation::Conflict("string and array edits on the same property")
            }
        }
        (Operation::Set { .. }, Operation::Set { .. }) if same_path => Relation::SetSet,
        (Operation::Delete { .. }, Operation::Delete { .. }) if same_path => Relation::DeleteDelete,
        (Operation::Create { .. }, Operation::Create { .. }) => {
            Relation::Conflict("node created twice")
        }
        _ if a.is_node_level() || b.is_node_level() => {
            Relation::Conflict("node was created or deleted concurrently with an edit inside it")
        }
        _ => Relation::Conflict("overlapping property edits"),
    }
}

/// Transform one pair of operations; returns which of the two survive
fn transform_op(a: &mut Operation, b: &mut Operation) -> CollabResult<(bool, bool)> {
    match relation(a, b) {
        Relation::Independent => Ok((true, true)),
        Relation::Diffs => match (a, b) {
            (Operation::Update { diff: da, .. }, Operation::Update { diff: db, .. }) => {
                Ok(transform_diffs(da, db))
            }
            _ => unreachable!("relation() only reports diffs for update pairs"),
        },
        Relation::SetSet => {
            // The later set wins; the first one is overwritten
            if let (Operation::Set { value, .. }, Operation::Set { original, .. }) = (&*a, &mut *b)
            {
                *original = value.clone();
            }
            Ok((false, true))
        }
        Relation::DeleteDelete => Ok((false, false)),
        Relation::Conflict(reason) => Err(CollabError::TransformFailure {
            left: a.describe(),
            right: b.describe(),
            reason: reason.to_string(),
        }),
    }
}

fn transform_diffs(a: &mut Diff, b: &mut Diff) -> (bool, bool) {
    match (a, b) {
        (Diff::Insert { pos: pa, text: ta }, Diff::Insert { pos: pb, text: tb }) => {
            shift_inserts(pa, char_len(ta), pb, char_len(tb));
            (true, true)
        }
        (Diff::Insert { pos: pi, text: ti }, Diff::Delete { pos: pd, text: td }) => {
            insert_vs_delete(pi, ti, pd, td)
        }
        (Diff::Delete { pos: pd, text: td }, Diff::Insert { pos: pi, text: ti }) => {
            let (keep_ins, keep_del) = insert_vs_delete(pi, ti, pd, td);
            (keep_del, keep_ins)
        }
        (Diff::Delete { pos: pa, text: ta }, Diff::Delete { pos: pb, text: tb }) => {
            delete_vs_delete(pa, ta, pb, tb)
        }
        (Diff::ArrayInsert { pos: pa, .. }, Diff::ArrayInsert { pos: pb, .. }) => {
            shift_inserts(pa, 1, pb, 1);
            (true, true)
        }
        (Diff::ArrayInsert { pos: pi, .. }, Diff::ArrayDelete { pos: pd, .. })
        | (Diff::ArrayDelete { pos: pd, .. }, Diff::ArrayInsert { pos: pi, .. }) => {
            if *pi <= *pd {
                *pd += 1;
            } else {
                *pi -= 1;
            }
            (true, true)
        }
        (Diff::ArrayDelete { pos: pa, .. }, Diff::ArrayDelete { pos: pb, .. }) => {
            if pa == pb {
                return (false, false);
            }
            if *pa < *pb {
                *pb -= 1;
            } else {
                *pa -= 1;
            }
            (true, true)
        }
        // Mixed string/array pairs are rejected by relation()
        _ => (true, true),
    }
}

/// Ties keep the first insert in front
fn shift_inserts(pa: &mut usize, len_a: usize, pb: &mut usize, len_b: usize) {
    if *pa <= *pb {
        *pb += len_a;
    } else {
        *pa += len_b;
    }
}

/// An insert strictly inside a deleted range is swallowed by the delete
fn insert_vs_delete(
    ins_pos: &mut usize,
    ins_text: &str,
    del_pos: &mut usize,
    del_text: &mut String,
) -> (bool, bool) {
    let del_len = char_len(del_text);
    if *ins_pos <= *del_pos {
        *del_pos += char_len(ins_text);
        (true, true)
    } else if *ins_pos >= *del_pos + del_len {
        *ins_pos -= del_len;
        (true, true)
    } else {
        let offset = *ins_pos - *del_pos;
        let mut grown: String = del_text.chars().take(offset).collect();
        grown.push_str(ins_text);
        grown.extend(del_text.chars().skip(offset));
        *del_text = grown;
        (false, true)
    }
}

fn delete_vs_delete(
    pa: &mut usize,
    ta: &mut String,
    pb: &mut usize,
    tb: &mut String,
) -> (bool, bool) {
    let (a_start, a_end) = (*pa, *pa + char_len(ta));
    let (b_start, b_end) = (*pb, *pb + char_len(tb));
    let overlap = (max(a_start, b_start), min(a_end, b_end));

    let new_a = without_range(ta, a_start, overlap);
    let new_b = without_range(tb, b_start, overlap);
    *pa = a_start - removed_before(a_start, b_start, b_end);
    *pb = b_start - removed_before(b_start, a_start, a_end);
    *ta = new_a;
    *tb = new_b;
    (!ta.is_empty(), !tb.is_empty())
}

/// Drop the chars of `text` (starting at `start`) that fall in `range`
fn without_range(text: &str, start: usize, range: (usize, usize)) -> String {
    text.chars()
        .enumerate()
        .filter(|(idx, _)| {
            let at = start + idx;
            !(range.0 <= at && at < range.1)
        })
        .map(|(_, c)| c)
        .collect()
}

/// Number of chars of `[other_start, other_end)` lying before `pos`
fn removed_before(pos: usize, other_start: usize, other_end: usize) -> usize {
    if other_start < pos {
        min(other_end, pos) - other_start
    } else {
        0
    }
}

/// Move a string offset across a diff on the same property
pub fn transform_coordinate(offset: usize, diff: &Diff) -> usize {
    match diff {
        Diff::Insert { pos, text } if *pos <= offset => offset + char_len(text),
        Diff::Delete { pos, text } => {
            let len = char_len(text);
            if offset >= pos + len {
                offset - len
            } else if offset > *pos {
                *pos
            } else {
                offset
            }
        }
        _ => offset,
    }
}

/// Move a selection across a sequence of operations
pub fn transform_selection(selection: &mut Selection, ops: &[Operation]) {
    for op in ops {
        let Selection::Property {
            path,
            start_offset,
            end_offset,
            ..
        } = selection
        else {
            return;
        };
        match op {
            Operation::Delete { path: node, .. } if path.first() == node.first() => {
                *selection = Selection::Null;
                return;
            }
            Operation::Update { path: target, diff } if target == path && diff.is_text() => {
                *start_offset = transform_coordinate(*start_offset, diff);
                *end_offset = transform_coordinate(*end_offset, diff);
            }
            Operation::Set {
                path: target,
                value,
                ..
            } if target == path => {
                let len = value.as_str().map(char_len).unwrap_or(0);
                *start_offset = min(*start_offset, len);
                *end_offset = min(*end_offset, len);
            }
            _ => {}
        }
    }
}
