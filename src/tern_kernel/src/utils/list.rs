//! Intrusive singly-linked lists.
//!
//! The links live inside the payload (a control block or a stack-resident
//! wait object), and a list holds typed references to payloads. All list
//! state is stored in [`CpuLockCell`]s, so every operation demands the CPU
//! Lock token: an item can never be observed half-linked from outside the
//! master critical section.
//!
//! [`insert_ordered`] implements the ordered-insert transaction shared by the
//! priority-ordered wait queues and the timeout delta list. The predicate is
//! allowed to mutate the candidate's payload while the walk is in progress;
//! the delta list uses this to fold its delta arithmetic into the insertion
//! walk.
use crate::klock::{CpuLockCell, CpuLockTokenRefMut};

use super::Init;

/// A link embedded in a list element.
pub(crate) struct Link<R> {
    pub(crate) next: Option<R>,
}

impl<R> Init for Link<R> {
    const INIT: Self = Self { next: None };
}

/// The head of a list: the first and last elements, if any.
pub(crate) struct ListHead<R> {
    first: Option<R>,
    last: Option<R>,
}

impl<R> Init for ListHead<R> {
    const INIT: Self = Self {
        first: None,
        last: None,
    };
}

impl<R: Copy> ListHead<R> {
    #[inline]
    pub(crate) fn first(&self) -> Option<R> {
        self.first
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

/// A typed reference to a list element exposing the element's embedded link.
pub(crate) trait ListItem<Traits>: Copy + PartialEq {
    /// Get the element's link cell.
    ///
    /// # Safety
    ///
    /// `self` must refer to a live element. The returned reference is
    /// lifetime-unbound; the caller must not use it past the element's
    /// lifetime. List elements are guaranteed to be live while linked (an
    /// element is unlinked before its storage is reclaimed), so accesses
    /// made during a list operation are sound.
    unsafe fn link<'a>(self) -> &'a CpuLockCell<Traits, Link<Self>>;
}

/// Get the element after `item`.
#[inline]
pub(crate) fn next<Traits, R: ListItem<Traits>>(
    item: R,
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> Option<R> {
    // Safety: The caller obtained `item` from a list, so it's live
    unsafe { R::link(item) }.read(&*lock).next
}

/// Append `item` to the back of the list.
pub(crate) fn push_back<Traits, R: ListItem<Traits>>(
    head: &CpuLockCell<Traits, ListHead<R>>,
    item: R,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    // Safety: `item` is live; it's being linked right now
    unsafe { R::link(item) }.replace(&mut *lock, Link { next: None });

    let old_last = head.read(&*lock).last;
    match old_last {
        Some(last) => {
            // Safety: `last` is linked, hence live
            unsafe { R::link(last) }.replace(&mut *lock, Link { next: Some(item) });
            head.write(&mut *lock).last = Some(item);
        }
        None => {
            head.replace(
                &mut *lock,
                ListHead {
                    first: Some(item),
                    last: Some(item),
                },
            );
        }
    }
}

/// Prepend `item` to the front of the list.
pub(crate) fn push_front<Traits, R: ListItem<Traits>>(
    head: &CpuLockCell<Traits, ListHead<R>>,
    item: R,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    let old_first = head.read(&*lock).first;
    // Safety: `item` is live; it's being linked right now
    unsafe { R::link(item) }.replace(&mut *lock, Link { next: old_first });
    let h = head.write(&mut *lock);
    h.first = Some(item);
    if old_first.is_none() {
        h.last = Some(item);
    }
}

/// Remove and return the first element.
pub(crate) fn pop_front<Traits, R: ListItem<Traits>>(
    head: &CpuLockCell<Traits, ListHead<R>>,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) -> Option<R> {
    let first = head.read(&*lock).first?;
    // Safety: `first` is linked, hence live
    let next = unsafe { R::link(first) }
        .replace(&mut *lock, Link { next: None })
        .next;
    let h = head.write(&mut *lock);
    h.first = next;
    if next.is_none() {
        h.last = None;
    }
    Some(first)
}

/// Unlink `item` from the list. Returns `false` if `item` was not found.
pub(crate) fn remove<Traits, R: ListItem<Traits>>(
    head: &CpuLockCell<Traits, ListHead<R>>,
    item: R,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) -> bool {
    let mut prev: Option<R> = None;
    let mut cur = head.read(&*lock).first;

    while let Some(c) = cur {
        // Safety: `c` is linked, hence live
        let c_next = unsafe { R::link(c) }.read(&*lock).next;
        if c == item {
            match prev {
                Some(p) => {
                    // Safety: `p` is linked, hence live
                    unsafe { R::link(p) }.write(&mut *lock).next = c_next;
                }
                None => head.write(&mut *lock).first = c_next,
            }
            if c_next.is_none() {
                head.write(&mut *lock).last = prev;
            }
            // Safety: `c` is live; it was linked until just now
            unsafe { R::link(c) }.replace(&mut *lock, Link { next: None });
            return true;
        }
        prev = cur;
        cur = c_next;
    }

    false
}

/// The ordered-insert transaction.
///
/// Walks the list from the front, calling `cond(current, candidate, ...)` for
/// each element. `cond` returning `true` means "keep walking"; `false` means
/// the candidate belongs immediately before `current`, terminating the walk.
/// If the walk exhausts the list, the candidate is appended at the back.
///
/// `cond` receives the CPU Lock token and may mutate the candidate's payload.
/// The timeout delta list relies on this: its predicate subtracts each
/// traversed element's delta from the candidate, so by the time the insertion
/// position is found the candidate's delta is already relative to its new
/// predecessor.
pub(crate) fn insert_ordered<Traits, R: ListItem<Traits>>(
    head: &CpuLockCell<Traits, ListHead<R>>,
    item: R,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mut cond: impl FnMut(R, R, CpuLockTokenRefMut<'_, Traits>) -> bool,
) {
    let mut prev: Option<R> = None;
    let mut cur = head.read(&*lock).first;

    while let Some(c) = cur {
        if !cond(c, item, lock.borrow_mut()) {
            // `item` belongs immediately before `c`
            // Safety: `item` is live; it's being linked right now
            unsafe { R::link(item) }.replace(&mut *lock, Link { next: Some(c) });
            match prev {
                Some(p) => {
                    // Safety: `p` is linked, hence live
                    unsafe { R::link(p) }.write(&mut *lock).next = Some(item);
                }
                None => head.write(&mut *lock).first = Some(item),
            }
            return;
        }
        prev = cur;
        // Safety: `c` is linked, hence live
        cur = unsafe { R::link(c) }.read(&*lock).next;
    }

    push_back(head, item, lock);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klock::CpuLockToken;
    use core::ptr::NonNull;

    enum TestTraits {}

    struct Node {
        link: CpuLockCell<TestTraits, Link<NodeRef>>,
        value: CpuLockCell<TestTraits, u64>,
    }

    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    struct NodeRef(NonNull<Node>);

    impl ListItem<TestTraits> for NodeRef {
        unsafe fn link<'a>(self) -> &'a CpuLockCell<TestTraits, Link<Self>> {
            unsafe { &(*self.0.as_ptr()).link }
        }
    }

    fn make_arena(values: &[u64]) -> Vec<Box<Node>> {
        values
            .iter()
            .map(|&value| {
                Box::new(Node {
                    link: CpuLockCell::new(Link::INIT),
                    value: CpuLockCell::new(value),
                })
            })
            .collect()
    }

    fn node_ref(node: &Node) -> NodeRef {
        NodeRef(NonNull::from(node))
    }

    fn collect(
        head: &CpuLockCell<TestTraits, ListHead<NodeRef>>,
        lock: &mut CpuLockToken<TestTraits>,
    ) -> Vec<u64> {
        let mut out = Vec::new();
        let mut cur = head.read(&*lock).first();
        while let Some(c) = cur {
            out.push(unsafe { &*c.0.as_ptr() }.value.get(&*lock));
            cur = next(c, lock.borrow_mut());
        }
        out
    }

    #[test]
    fn push_pop_remove() {
        // Safety: This test is the only owner of a `TestTraits` token
        let mut token = unsafe { CpuLockToken::<TestTraits>::new_unchecked() };
        let arena = make_arena(&[1, 2, 3, 4]);
        let head = CpuLockCell::<TestTraits, _>::new(ListHead::INIT);

        for node in &arena {
            push_back(&head, node_ref(node), token.borrow_mut());
        }
        assert_eq!(collect(&head, &mut token), [1, 2, 3, 4]);

        // Remove the head and push it back to the front
        assert!(remove(&head, node_ref(&arena[0]), token.borrow_mut()));
        push_front(&head, node_ref(&arena[0]), token.borrow_mut());
        assert_eq!(collect(&head, &mut token), [1, 2, 3, 4]);

        assert!(remove(&head, node_ref(&arena[2]), token.borrow_mut()));
        assert_eq!(collect(&head, &mut token), [1, 2, 4]);
        assert!(!remove(&head, node_ref(&arena[2]), token.borrow_mut()));

        assert_eq!(
            pop_front(&head, token.borrow_mut()).map(|r| r.0.as_ptr() as *const Node),
            Some(&*arena[0] as *const Node)
        );
        assert_eq!(collect(&head, &mut token), [2, 4]);

        assert!(pop_front(&head, token.borrow_mut()).is_some());
        assert!(pop_front(&head, token.borrow_mut()).is_some());
        assert!(pop_front(&head, token.borrow_mut()).is_none());
        assert!(head.read(&token).is_empty());
    }

    #[test]
    fn ordered_insert_is_stable() {
        let mut token = unsafe { CpuLockToken::<TestTraits>::new_unchecked() };
        let arena = make_arena(&[3, 1, 2, 2, 0]);
        let head = CpuLockCell::<TestTraits, _>::new(ListHead::INIT);

        for node in &arena {
            insert_ordered(&head, node_ref(node), token.borrow_mut(), |cur, cand, l| {
                let cur_v = unsafe { &*cur.0.as_ptr() }.value.get(&*l);
                let cand_v = unsafe { &*cand.0.as_ptr() }.value.get(&*l);
                // Continue while the current element sorts before or equal;
                // equal elements keep arrival order
                cur_v <= cand_v
            });
        }

        assert_eq!(collect(&head, &mut token), [0, 1, 2, 2, 3]);
    }

    #[test]
    fn ordered_insert_folds_delta_arithmetic() {
        let mut token = unsafe { CpuLockToken::<TestTraits>::new_unchecked() };
        // Absolute expirations 10, 25, 40 represented as deltas 10, 15, 15
        let arena = make_arena(&[10, 15, 15]);
        let head = CpuLockCell::<TestTraits, _>::new(ListHead::INIT);
        for node in &arena {
            push_back(&head, node_ref(node), token.borrow_mut());
        }

        // Insert an absolute expiration of 30: the candidate enters with the
        // full duration and sheds each traversed delta
        let cand_node = make_arena(&[30]);
        insert_ordered(
            &head,
            node_ref(&cand_node[0]),
            token.borrow_mut(),
            |cur, cand, mut l| {
                let cur_v = unsafe { &*cur.0.as_ptr() }.value.get(&*l);
                let cand_cell = &unsafe { &*cand.0.as_ptr() }.value;
                let cand_v = cand_cell.get(&*l);
                if cand_v >= cur_v {
                    cand_cell.replace(&mut *l, cand_v - cur_v);
                    true
                } else {
                    // The successor's delta becomes relative to the candidate
                    unsafe { &*cur.0.as_ptr() }
                        .value
                        .replace(&mut *l, cur_v - cand_v);
                    false
                }
            },
        );

        // 10, 15, [5], 10: cumulative sums 10, 25, 30, 40
        assert_eq!(collect(&head, &mut token), [10, 15, 5, 10]);
    }
}
