// Operational transform engine.
//
// Two operations issued against the same base revision are rebased onto
// each other so that both application orders converge:
//
//   apply(apply(s, a), b') == apply(apply(s, b), a')
//
// Internally every edit is expanded into a run-length component list
// (retain / insert / delete) spanning the document, with an implicit
// trailing retain. Transforming component lists is a single merge pass and
// stays correct in the one case a single span cannot express: a delete
// rebased over an insert that landed strictly inside its range must split
// around the surviving insertion. Rebased edits therefore come back as a
// composed operation sequence, usually a singleton.
//
// Tie-break: when both sides insert at the same position, the operation
// with the lexicographically smaller author id keeps the earlier slot.
// Total and deterministic, so independent replicas order identically.

use std::collections::VecDeque;

use crate::error::SyncError;
use crate::op::{OpKind, Operation};

/// One run in an expanded operation: skip, add, or remove characters.
/// Lengths count chars, matching [`Operation`] offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Component {
    Retain(usize),
    Insert(String),
    Delete(usize),
}

/// A component list with an implicit retain-to-end.
pub type Components = Vec<Component>;

/// Expand a single wire operation into its component list.
pub fn components_of(op: &Operation) -> Components {
    let mut components = Vec::with_capacity(2);
    if op.position > 0 {
        components.push(Component::Retain(op.position));
    }
    match op.kind {
        OpKind::Insert => {
            components.push(Component::Insert(op.payload.clone().unwrap_or_default()));
        }
        OpKind::Delete => components.push(Component::Delete(op.length)),
        OpKind::Retain => components.push(Component::Retain(op.length)),
    }
    normalize(&mut components);
    components
}

/// Collapse a component list back into a sequential span list for the wire.
///
/// Spans apply left to right, each against the content produced by the
/// previous one. Metadata (author, base revision, timestamp) is copied from
/// `template`, the operation the components were derived from.
pub fn spans_of(components: &[Component], template: &Operation) -> Vec<Operation> {
    let mut spans = Vec::new();
    let mut position = 0usize;
    for component in components {
        match component {
            Component::Retain(n) => position += n,
            Component::Insert(payload) => {
                let mut op = template.clone();
                op.kind = OpKind::Insert;
                op.position = position;
                op.length = payload.chars().count();
                op.payload = Some(payload.clone());
                position += op.length;
                spans.push(op);
            }
            Component::Delete(n) => {
                let mut op = template.clone();
                op.kind = OpKind::Delete;
                op.position = position;
                op.length = *n;
                op.payload = None;
                spans.push(op);
            }
        }
    }
    spans
}

/// Apply a component list to content in one pass.
pub fn apply_components(content: &str, components: &[Component]) -> Result<String, SyncError> {
    let content_len = content.chars().count();
    let mut chars = content.chars();
    let mut output = String::with_capacity(content.len());
    let mut consumed = 0usize;

    for component in components {
        match component {
            Component::Retain(n) => {
                let end = match consumed.checked_add(*n) {
                    Some(end) if end <= content_len => end,
                    _ => {
                        return Err(SyncError::OutOfBounds {
                            position: consumed,
                            length: *n,
                            content_len,
                        });
                    }
                };
                output.extend(chars.by_ref().take(*n));
                consumed = end;
            }
            Component::Insert(payload) => output.push_str(payload),
            Component::Delete(n) => {
                let end = match consumed.checked_add(*n) {
                    Some(end) if end <= content_len => end,
                    _ => {
                        return Err(SyncError::OutOfBounds {
                            position: consumed,
                            length: *n,
                            content_len,
                        });
                    }
                };
                for _ in 0..*n {
                    chars.next();
                }
                consumed = end;
            }
        }
    }

    // Implicit trailing retain.
    output.extend(chars);
    Ok(output)
}

/// Transform two concurrent operations issued against the same base.
///
/// Returns `(a', b')` as composed span sequences: `a'` applies after `b`,
/// `b'` applies after `a`. The author-id tie-break is resolved here.
pub fn transform(a: &Operation, b: &Operation) -> (Vec<Operation>, Vec<Operation>) {
    let components_a = components_of(a);
    let components_b = components_of(b);

    let (prime_a, prime_b) = if a.author_id <= b.author_id {
        transform_components(&components_a, &components_b)
    } else {
        let (prime_b, prime_a) = transform_components(&components_b, &components_a);
        (prime_a, prime_b)
    };

    (spans_of(&prime_a, a), spans_of(&prime_b, b))
}

/// Rebase `op`'s components over an already-applied edit.
///
/// `op_author` / `over_author` feed the same-position insert tie-break:
/// the smaller author id is treated as the earlier insert.
pub fn rebase_components(
    op: &[Component],
    op_author: &str,
    over: &[Component],
    over_author: &str,
) -> Components {
    if over_author <= op_author {
        let (_, rebased) = transform_components(over, op);
        rebased
    } else {
        let (rebased, _) = transform_components(op, over);
        rebased
    }
}

/// Core component-list transform. `a`'s inserts win position ties.
pub fn transform_components(a: &[Component], b: &[Component]) -> (Components, Components) {
    let mut queue_a: VecDeque<Component> = a.to_vec().into();
    let mut queue_b: VecDeque<Component> = b.to_vec().into();
    let mut prime_a = Vec::new();
    let mut prime_b = Vec::new();

    loop {
        match (queue_a.front().cloned(), queue_b.front().cloned()) {
            (None, None) => break,

            // Inserts pass through their own prime and force a retain on
            // the other side; a's insert takes the earlier slot on a tie.
            (Some(Component::Insert(payload)), _) => {
                queue_a.pop_front();
                push(&mut prime_b, Component::Retain(payload.chars().count()));
                push(&mut prime_a, Component::Insert(payload));
            }
            (_, Some(Component::Insert(payload))) => {
                queue_b.pop_front();
                push(&mut prime_a, Component::Retain(payload.chars().count()));
                push(&mut prime_b, Component::Insert(payload));
            }

            // One side exhausted: the rest rides on the implicit tail.
            (Some(component), None) => {
                queue_a.pop_front();
                push(&mut prime_a, component);
            }
            (None, Some(component)) => {
                queue_b.pop_front();
                push(&mut prime_b, component);
            }

            // Both retain/delete: consume the shorter run from each.
            (Some(component_a), Some(component_b)) => {
                let len_a = run_len(&component_a);
                let len_b = run_len(&component_b);
                let step = len_a.min(len_b);

                match (&component_a, &component_b) {
                    (Component::Retain(_), Component::Retain(_)) => {
                        push(&mut prime_a, Component::Retain(step));
                        push(&mut prime_b, Component::Retain(step));
                    }
                    // Both deleted the same chars: they contribute zero
                    // length to either prime, never negative.
                    (Component::Delete(_), Component::Delete(_)) => {}
                    (Component::Delete(_), Component::Retain(_)) => {
                        push(&mut prime_a, Component::Delete(step));
                    }
                    (Component::Retain(_), Component::Delete(_)) => {
                        push(&mut prime_b, Component::Delete(step));
                    }
                    _ => unreachable!("inserts are consumed above"),
                }

                shrink_front(&mut queue_a, step);
                shrink_front(&mut queue_b, step);
            }
        }
    }

    normalize(&mut prime_a);
    normalize(&mut prime_b);
    (prime_a, prime_b)
}

fn run_len(component: &Component) -> usize {
    match component {
        Component::Retain(n) | Component::Delete(n) => *n,
        Component::Insert(payload) => payload.chars().count(),
    }
}

/// Push a component, merging it into an adjacent run of the same kind.
fn push(components: &mut Components, component: Component) {
    if run_len(&component) == 0 {
        return;
    }
    match (components.last_mut(), &component) {
        (Some(Component::Retain(n)), Component::Retain(m)) => *n += m,
        (Some(Component::Delete(n)), Component::Delete(m)) => *n += m,
        (Some(Component::Insert(s)), Component::Insert(t)) => s.push_str(t),
        _ => components.push(component),
    }
}

/// Drop a trailing retain (covered by the implicit tail).
fn normalize(components: &mut Components) {
    if let Some(Component::Retain(_)) = components.last() {
        components.pop();
    }
}

fn shrink_front(queue: &mut VecDeque<Component>, step: usize) {
    let Some(front) = queue.front_mut() else { return };
    match front {
        Component::Retain(n) | Component::Delete(n) => {
            if *n <= step {
                queue.pop_front();
            } else {
                *n -= step;
            }
        }
        Component::Insert(_) => {}
    }
}
