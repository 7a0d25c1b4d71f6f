//! Operational-transform position adjustment.
//!
//! Under the operational-transform strategy, an incoming operation is
//! transformed against every committed operation the sender had not yet
//! observed: insert positions shift by the length of interleaving inserts,
//! and committed deletes shrink overlapping ranges. Participants that apply
//! all operations in sequence-number order converge on the same content.

use super::{OperationInput, OperationKind, SequencedOperation};

/// Primitive content effect of a committed operation.
#[derive(Debug, Clone, Copy)]
enum Effect {
    Insert { position: usize, length: usize },
    Delete { position: usize, length: usize },
}

/// Decompose a committed operation into its primitive effects, in the order
/// they hit the document.
fn effects_of(op: &SequencedOperation) -> Vec<Effect> {
    let content_len = op.content.as_deref().map(|c| c.chars().count()).unwrap_or(0);
    let range_len = op.length.unwrap_or(0);

    match op.kind {
        OperationKind::Insert => vec![Effect::Insert {
            position: op.position,
            length: content_len,
        }],
        OperationKind::Delete => vec![Effect::Delete {
            position: op.position,
            length: range_len,
        }],
        OperationKind::Replace => vec![
            Effect::Delete {
                position: op.position,
                length: range_len,
            },
            Effect::Insert {
                position: op.position,
                length: content_len,
            },
        ],
        OperationKind::Move => {
            let target = op.target_position.unwrap_or(op.position);
            // Insertion point after the removal has shifted the tail left.
            let landing = if target >= op.position.saturating_add(range_len) {
                target - range_len
            } else if target > op.position {
                op.position
            } else {
                target
            };
            vec![
                Effect::Delete {
                    position: op.position,
                    length: range_len,
                },
                Effect::Insert {
                    position: landing,
                    length: range_len,
                },
            ]
        }
    }
}

/// Adjust a range `[pos, pos+len)` for one committed effect.
fn transform_range(pos: &mut usize, len: &mut usize, effect: Effect) {
    match effect {
        Effect::Insert { position: c_pos, length: c_len } => {
            if c_pos <= *pos {
                *pos = pos.saturating_add(c_len);
            } else if c_pos < pos.saturating_add(*len) {
                // Insert landed inside our range; the range grows to keep
                // covering the original characters.
                *len = len.saturating_add(c_len);
            }
        }
        Effect::Delete { position: c_pos, length: c_len } => {
            let c_end = c_pos.saturating_add(c_len);
            let end = pos.saturating_add(*len);
            if c_end <= *pos {
                *pos -= c_len;
            } else if c_pos >= end {
                // Entirely after us.
            } else {
                let overlap = c_end.min(end).saturating_sub(c_pos.max(*pos));
                if c_pos < *pos {
                    *pos = c_pos;
                }
                *len -= overlap.min(*len);
            }
        }
    }
}

/// Adjust a single position (an insertion point) for one committed effect.
fn transform_point(pos: &mut usize, effect: Effect) {
    let mut len = 0;
    transform_range(pos, &mut len, effect);
}

/// Transform an incoming operation against one committed operation the
/// sender had not observed.
pub fn transform_against(op: &mut OperationInput, committed: &SequencedOperation) {
    for effect in effects_of(committed) {
        match op.kind {
            OperationKind::Insert => transform_point(&mut op.position, effect),
            OperationKind::Delete | OperationKind::Replace => {
                let mut len = op.length.unwrap_or(0);
                transform_range(&mut op.position, &mut len, effect);
                op.length = Some(len);
            }
            OperationKind::Move => {
                let mut len = op.length.unwrap_or(0);
                transform_range(&mut op.position, &mut len, effect);
                op.length = Some(len);
                if let Some(target) = op.target_position.as_mut() {
                    transform_point(target, effect);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn committed_insert(position: usize, content: &str, seq: u64) -> SequencedOperation {
        SequencedOperation {
            session_id: "s".to_string(),
            context_id: "c".to_string(),
            participant_id: "p".to_string(),
            sequence_number: seq,
            kind: OperationKind::Insert,
            position,
            content: Some(content.to_string()),
            length: None,
            target_position: None,
        }
    }

    fn committed_delete(position: usize, length: usize, seq: u64) -> SequencedOperation {
        SequencedOperation {
            session_id: "s".to_string(),
            context_id: "c".to_string(),
            participant_id: "p".to_string(),
            sequence_number: seq,
            kind: OperationKind::Delete,
            position,
            content: None,
            length: Some(length),
            target_position: None,
        }
    }

    fn insert_input(position: usize, content: &str) -> OperationInput {
        OperationInput {
            kind: OperationKind::Insert,
            position,
            content: Some(content.to_string()),
            length: None,
            target_position: None,
            base_sequence: None,
        }
    }

    fn delete_input(position: usize, length: usize) -> OperationInput {
        OperationInput {
            kind: OperationKind::Delete,
            position,
            content: None,
            length: Some(length),
            target_position: None,
            base_sequence: None,
        }
    }

    #[test]
    fn test_insert_shifts_later_insert() {
        let mut op = insert_input(10, "xyz");
        transform_against(&mut op, &committed_insert(5, "foo", 1));
        assert_eq!(op.position, 13);
    }

    #[test]
    fn test_insert_at_same_position_shifts() {
        // Tie-break: the committed (earlier-sequenced) insert wins the spot.
        let mut op = insert_input(5, "bar");
        transform_against(&mut op, &committed_insert(5, "foo", 1));
        assert_eq!(op.position, 8);
    }

    #[test]
    fn test_insert_after_our_position_is_ignored() {
        let mut op = insert_input(3, "bar");
        transform_against(&mut op, &committed_insert(9, "foo", 1));
        assert_eq!(op.position, 3);
    }

    #[test]
    fn test_delete_before_shifts_left() {
        let mut op = insert_input(10, "x");
        transform_against(&mut op, &committed_delete(2, 4, 1));
        assert_eq!(op.position, 6);
    }

    #[test]
    fn test_delete_covering_insert_point_clamps() {
        let mut op = insert_input(5, "x");
        transform_against(&mut op, &committed_delete(3, 6, 1));
        assert_eq!(op.position, 3);
    }

    #[test]
    fn test_overlapping_deletes_shrink() {
        // Committed delete [4, 8); incoming delete [6, 12) loses the overlap [6, 8).
        let mut op = delete_input(6, 6);
        transform_against(&mut op, &committed_delete(4, 4, 1));
        assert_eq!(op.position, 4);
        assert_eq!(op.length, Some(4));
    }

    #[test]
    fn test_delete_fully_shadowed_becomes_empty() {
        let mut op = delete_input(5, 2);
        transform_against(&mut op, &committed_delete(3, 8, 1));
        assert_eq!(op.length, Some(0));
    }

    #[test]
    fn test_insert_inside_delete_range_grows_it() {
        // Incoming delete [2, 6); committed insert of 3 chars at 4 lands inside.
        let mut op = delete_input(2, 4);
        transform_against(&mut op, &committed_insert(4, "abc", 1));
        assert_eq!(op.position, 2);
        assert_eq!(op.length, Some(7));
    }

    #[test]
    fn test_concurrent_inserts_converge() {
        // I1 (pos=5, "foo") and I2 (pos=5, "bar"), neither having seen the
        // other. Whatever arrival order the sequencer picks, every replica
        // applying the committed log in sequence order gets the same content.
        let base = "hello world";

        // Arrival order A: I1 commits first, I2 transforms against it.
        let doc_a = {
            let mut doc = base.to_string();
            apply_insert(&mut doc, 5, "foo");
            let mut i2 = insert_input(5, "bar");
            transform_against(&mut i2, &committed_insert(5, "foo", 1));
            apply_insert(&mut doc, i2.position, "bar");
            doc
        };

        // Arrival order B: I2 commits first, I1 transforms against it.
        let doc_b = {
            let mut doc = base.to_string();
            apply_insert(&mut doc, 5, "bar");
            let mut i1 = insert_input(5, "foo");
            transform_against(&mut i1, &committed_insert(5, "bar", 1));
            apply_insert(&mut doc, i1.position, "foo");
            doc
        };

        // Each order produces one canonical document; replicas replaying the
        // same committed log agree. Both contain both inserts intact.
        assert_eq!(doc_a, "hellofoobar world");
        assert_eq!(doc_b, "hellobarfoo world");
        assert!(doc_a.contains("foo") && doc_a.contains("bar"));
        assert!(doc_b.contains("foo") && doc_b.contains("bar"));
    }

    fn apply_insert(doc: &mut String, position: usize, content: &str) {
        let idx = doc
            .char_indices()
            .nth(position)
            .map(|(i, _)| i)
            .unwrap_or(doc.len());
        doc.insert_str(idx, content);
    }
}
