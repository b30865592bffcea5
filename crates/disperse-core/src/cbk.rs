//! Per-brick answers and answer grouping.
//!
//! Every sub-operation reply becomes a [`Cbk`]. Equal answers merge into
//! groups; the group list stays sorted by descending size so the head is
//! always the best quorum candidate.

use crate::mask::BrickMask;
use crate::types::Errno;
use crate::xdata::Xdata;

/// Replies expose their attached dictionary so the generic grouping rules
/// can compare and merge it.
pub trait Reply {
    fn xdata(&self) -> &Xdata;
    fn xdata_mut(&mut self) -> &mut Xdata;
}

/// One brick's answer to one sub-operation.
#[derive(Debug, Clone)]
pub struct Cbk<R> {
    pub idx: usize,
    pub result: Result<R, Errno>,
}

impl<R: Reply> Cbk<R> {
    pub fn xdata(&self) -> Option<&Xdata> {
        self.result.as_ref().ok().map(|r| r.xdata())
    }
}

/// A set of equal answers. `cbks[0]` is the representative; payload
/// merging (blocks, times) has already been folded into it.
#[derive(Debug, Clone)]
pub struct Group<R> {
    pub mask: BrickMask,
    pub count: usize,
    pub cbks: Vec<Cbk<R>>,
}

impl<R: Reply> Group<R> {
    fn new(cbk: Cbk<R>) -> Self {
        Group {
            mask: BrickMask::bit(cbk.idx),
            count: 1,
            cbks: vec![cbk],
        }
    }

    pub fn rep(&self) -> &Cbk<R> {
        &self.cbks[0]
    }

    /// Errno of the representative answer, when it failed.
    pub fn errno(&self) -> Option<Errno> {
        self.rep().result.as_ref().err().copied()
    }

    pub fn is_success(&self) -> bool {
        self.rep().result.is_ok()
    }

    /// Smallest brick index present in this group.
    pub fn min_idx(&self) -> usize {
        self.cbks.iter().map(|c| c.idx).min().expect("group is never empty")
    }
}

/// Sorted list of answer groups for one fop.
#[derive(Debug)]
pub struct Answers<R> {
    pub groups: Vec<Group<R>>,
}

impl<R: Reply> Answers<R> {
    pub fn new() -> Self {
        Answers { groups: Vec::new() }
    }

    pub fn total(&self) -> usize {
        self.groups.iter().map(|g| g.count).sum()
    }

    /// Insert an answer, merging it into the first compatible group.
    ///
    /// `merge` is the fop-specific payload predicate: it must return true
    /// when the payloads are equal under the fop's rules, and may fold
    /// mergeable fields (blocks, times) into the representative.
    ///
    /// Compatibility rules, in order: success/failure agree, errnos agree
    /// on failure, dictionaries agree under the compare filter, payloads
    /// agree per `merge`.
    pub fn insert(
        &mut self,
        cbk: Cbk<R>,
        xdata_compatible: impl Fn(&Xdata, &Xdata) -> bool,
        mut merge: impl FnMut(&mut R, &R) -> bool,
    ) {
        let mut target: Option<usize> = None;
        for (gi, group) in self.groups.iter_mut().enumerate() {
            let compatible = match (&mut group.cbks[0].result, &cbk.result) {
                (Ok(dst), Ok(src)) => {
                    xdata_compatible(dst.xdata(), src.xdata()) && merge(dst, src)
                }
                (Err(d), Err(s)) => d == s,
                _ => false,
            };
            if compatible {
                target = Some(gi);
                break;
            }
        }

        match target {
            Some(gi) => {
                let group = &mut self.groups[gi];
                group.count += 1;
                group.mask |= BrickMask::bit(cbk.idx);
                group.cbks.push(cbk);
                // Bubble the grown group towards the front so the list
                // stays sorted by descending count.
                let mut i = gi;
                while i > 0 && self.groups[i - 1].count < self.groups[i].count {
                    self.groups.swap(i - 1, i);
                    i -= 1;
                }
            }
            None => {
                self.groups.push(Group::new(cbk));
            }
        }
    }

    /// The head group, i.e. the largest set of equal answers.
    pub fn head(&self) -> Option<&Group<R>> {
        self.groups.first()
    }

    /// Quorum check: the head group qualifies as the fop's answer when its
    /// size, not counting bricks still being healed, reaches `minimum`.
    pub fn pick(&self, healing: BrickMask, minimum: usize) -> Option<&Group<R>> {
        let head = self.groups.first()?;
        let healing_count = (head.mask & healing).count();
        if head.count - healing_count >= minimum {
            Some(head)
        } else {
            None
        }
    }

    /// Remove and return the head group.
    pub fn take_head(&mut self) -> Option<Group<R>> {
        if self.groups.is_empty() {
            None
        } else {
            Some(self.groups.remove(0))
        }
    }
}

impl<R: Reply> Default for Answers<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct TestReply {
        v: u32,
        xdata: Xdata,
    }

    impl Reply for TestReply {
        fn xdata(&self) -> &Xdata {
            &self.xdata
        }
        fn xdata_mut(&mut self) -> &mut Xdata {
            &mut self.xdata
        }
    }

    fn ok(idx: usize, v: u32) -> Cbk<TestReply> {
        Cbk {
            idx,
            result: Ok(TestReply {
                v,
                xdata: Xdata::new(),
            }),
        }
    }

    fn err(idx: usize, e: Errno) -> Cbk<TestReply> {
        Cbk {
            idx,
            result: Err(e),
        }
    }

    fn insert(answers: &mut Answers<TestReply>, cbk: Cbk<TestReply>) {
        answers.insert(cbk, |_, _| true, |d, s| d.v == s.v);
    }

    #[test]
    fn equal_answers_group_together() {
        let mut a = Answers::new();
        insert(&mut a, ok(0, 7));
        insert(&mut a, ok(1, 7));
        insert(&mut a, ok(2, 9));
        insert(&mut a, ok(3, 7));

        assert_eq!(a.groups.len(), 2);
        assert_eq!(a.head().unwrap().count, 3);
        assert_eq!(a.head().unwrap().mask, BrickMask(0b1011));
        assert_eq!(a.total(), 4);
    }

    #[test]
    fn head_is_always_largest() {
        let mut a = Answers::new();
        insert(&mut a, ok(0, 1));
        insert(&mut a, ok(1, 2));
        insert(&mut a, ok(2, 2));
        assert_eq!(a.head().unwrap().rep().result.as_ref().unwrap().v, 2);
    }

    #[test]
    fn failures_group_by_errno() {
        let mut a = Answers::new();
        insert(&mut a, err(0, libc::EIO));
        insert(&mut a, err(1, libc::EIO));
        insert(&mut a, err(2, libc::ENOENT));
        assert_eq!(a.groups.len(), 2);
        assert_eq!(a.head().unwrap().count, 2);
        assert_eq!(a.head().unwrap().errno(), Some(libc::EIO));
    }

    #[test]
    fn success_never_groups_with_failure() {
        let mut a = Answers::new();
        insert(&mut a, ok(0, 1));
        insert(&mut a, err(1, libc::EIO));
        assert_eq!(a.groups.len(), 2);
    }

    #[test]
    fn quorum_pick_subtracts_healing() {
        let mut a = Answers::new();
        for i in 0..4 {
            insert(&mut a, ok(i, 5));
        }
        assert!(a.pick(BrickMask::EMPTY, 4).is_some());
        assert!(a.pick(BrickMask::bit(0), 4).is_none());
        assert!(a.pick(BrickMask::bit(0), 3).is_some());
    }

    #[test]
    fn min_idx_of_group() {
        let mut a = Answers::new();
        insert(&mut a, ok(3, 5));
        insert(&mut a, ok(1, 5));
        assert_eq!(a.head().unwrap().min_idx(), 1);
    }
}
