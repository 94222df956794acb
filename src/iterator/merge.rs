//! N-way merge over child iterators.
//!
//! Children yield entries in the shared comparator's order; the merge
//! yields their union, still ordered. Ties go to the child with the
//! lowest index, so callers list newer sources first. The merge is
//! bidirectional: switching direction realigns every child around the
//! current key before stepping.

use std::cmp::Ordering;
use std::sync::Arc;

use super::StorageIterator;
use crate::comparator::Comparator;
use crate::error::Result;

enum Direction {
    Forward,
    Reverse,
}

pub struct MergingIterator {
    cmp: Arc<dyn Comparator>,
    children: Vec<Box<dyn StorageIterator>>,
    current: Option<usize>,
    direction: Direction,
}

impl MergingIterator {
    pub fn new(cmp: Arc<dyn Comparator>, children: Vec<Box<dyn StorageIterator>>) -> Self {
        Self {
            cmp,
            children,
            current: None,
            direction: Direction::Forward,
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for index in 0..self.children.len() {
            if !self.children[index].valid() {
                continue;
            }
            smallest = match smallest {
                Some(best)
                    if self
                        .cmp
                        .compare(self.children[index].key(), self.children[best].key())
                        != Ordering::Less =>
                {
                    Some(best)
                }
                _ => Some(index),
            };
        }
        self.current = smallest;
    }

    fn find_largest(&mut self) {
        let mut largest: Option<usize> = None;
        for index in (0..self.children.len()).rev() {
            if !self.children[index].valid() {
                continue;
            }
            largest = match largest {
                Some(best)
                    if self
                        .cmp
                        .compare(self.children[index].key(), self.children[best].key())
                        != Ordering::Greater =>
                {
                    Some(best)
                }
                _ => Some(index),
            };
        }
        self.current = largest;
    }
}

impl StorageIterator for MergingIterator {
    fn valid(&self) -> bool {
        self.current
            .is_some_and(|index| self.children[index].valid())
    }

    fn seek_to_first(&mut self) {
        for child in &mut self.children {
            child.seek_to_first();
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn seek_to_last(&mut self) {
        for child in &mut self.children {
            child.seek_to_last();
        }
        self.direction = Direction::Reverse;
        self.find_largest();
    }

    fn seek(&mut self, target: &[u8]) {
        for child in &mut self.children {
            child.seek(target);
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        let current = self.current.expect("valid iterator");

        if matches!(self.direction, Direction::Reverse) {
            // Every other child sits before the current key; put each at
            // its first entry past it.
            let key = self.children[current].key().to_vec();
            for index in 0..self.children.len() {
                if index == current {
                    continue;
                }
                let child = &mut self.children[index];
                child.seek(&key);
                if child.valid() && self.cmp.compare(&key, child.key()) == Ordering::Equal {
                    child.next();
                }
            }
            self.direction = Direction::Forward;
        }

        self.children[current].next();
        self.find_smallest();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        let current = self.current.expect("valid iterator");

        if matches!(self.direction, Direction::Forward) {
            // Put every other child at its last entry before the current
            // key.
            let key = self.children[current].key().to_vec();
            for index in 0..self.children.len() {
                if index == current {
                    continue;
                }
                let child = &mut self.children[index];
                child.seek(&key);
                if child.valid() {
                    // Child is at the first entry >= key; step back.
                    child.prev();
                } else {
                    // Every entry in this child is < key.
                    child.seek_to_last();
                }
            }
            self.direction = Direction::Reverse;
        }

        self.children[current].prev();
        self.find_largest();
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        self.children[self.current.expect("valid iterator")].key()
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        self.children[self.current.expect("valid iterator")].value()
    }

    fn status(&self) -> Result<()> {
        for child in &self.children {
            child.status()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;

    /// In-memory sorted child for exercising the merge.
    struct VecIter {
        data: Vec<(Vec<u8>, Vec<u8>)>,
        pos: Option<usize>,
    }

    impl VecIter {
        fn new(entries: &[(&[u8], &[u8])]) -> Box<dyn StorageIterator> {
            let data: Vec<(Vec<u8>, Vec<u8>)> = entries
                .iter()
                .map(|(k, v)| (k.to_vec(), v.to_vec()))
                .collect();
            debug_assert!(data.windows(2).all(|w| w[0].0 < w[1].0));
            Box::new(Self { data, pos: None })
        }
    }

    impl StorageIterator for VecIter {
        fn valid(&self) -> bool {
            self.pos.is_some()
        }

        fn seek_to_first(&mut self) {
            self.pos = if self.data.is_empty() { None } else { Some(0) };
        }

        fn seek_to_last(&mut self) {
            self.pos = self.data.len().checked_sub(1);
        }

        fn seek(&mut self, target: &[u8]) {
            let index = self.data.partition_point(|(k, _)| k.as_slice() < target);
            self.pos = (index < self.data.len()).then_some(index);
        }

        fn next(&mut self) {
            self.pos = match self.pos {
                Some(i) if i + 1 < self.data.len() => Some(i + 1),
                _ => None,
            };
        }

        fn prev(&mut self) {
            self.pos = self.pos.and_then(|i| i.checked_sub(1));
        }

        fn key(&self) -> &[u8] {
            &self.data[self.pos.expect("valid iterator")].0
        }

        fn value(&self) -> &[u8] {
            &self.data[self.pos.expect("valid iterator")].1
        }

        fn status(&self) -> Result<()> {
            Ok(())
        }
    }

    fn merged(children: Vec<Box<dyn StorageIterator>>) -> MergingIterator {
        MergingIterator::new(Arc::new(BytewiseComparator), children)
    }

    fn collect_forward(iter: &mut MergingIterator) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        iter.seek_to_first();
        while iter.valid() {
            out.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.next();
        }
        out
    }

    #[test]
    fn test_empty_merge() {
        let mut iter = merged(vec![]);
        iter.seek_to_first();
        assert!(!iter.valid());
        iter.seek_to_last();
        assert!(!iter.valid());

        let mut iter = merged(vec![VecIter::new(&[]), VecIter::new(&[])]);
        iter.seek_to_first();
        assert!(!iter.valid());
    }

    #[test]
    fn test_interleaved_children() {
        let mut iter = merged(vec![
            VecIter::new(&[(b"a", b"1"), (b"d", b"4"), (b"f", b"6")]),
            VecIter::new(&[(b"b", b"2"), (b"e", b"5")]),
            VecIter::new(&[(b"c", b"3"), (b"g", b"7")]),
        ]);

        let all = collect_forward(&mut iter);
        let keys: Vec<&[u8]> = all.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"a", b"b", b"c", b"d", b"e", b"f", b"g"]);

        // Reverse traversal gives the mirror image.
        let mut reversed = Vec::new();
        iter.seek_to_last();
        while iter.valid() {
            reversed.push(iter.key().to_vec());
            iter.prev();
        }
        let forward_keys: Vec<Vec<u8>> = all.iter().map(|(k, _)| k.clone()).collect();
        reversed.reverse();
        assert_eq!(reversed, forward_keys);
    }

    #[test]
    fn test_seek_lands_on_successor() {
        let mut iter = merged(vec![
            VecIter::new(&[(b"a", b"1"), (b"e", b"5")]),
            VecIter::new(&[(b"c", b"3")]),
        ]);

        iter.seek(b"b");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"c");
        iter.seek(b"c");
        assert_eq!(iter.key(), b"c");
        iter.seek(b"f");
        assert!(!iter.valid());
    }

    #[test]
    fn test_direction_switches() {
        let mut iter = merged(vec![
            VecIter::new(&[(b"a", b"1"), (b"d", b"4")]),
            VecIter::new(&[(b"b", b"2"), (b"c", b"3")]),
        ]);

        iter.seek(b"c");
        assert_eq!(iter.key(), b"c");
        iter.prev();
        assert_eq!(iter.key(), b"b");
        iter.prev();
        assert_eq!(iter.key(), b"a");
        iter.next();
        assert_eq!(iter.key(), b"b");
        iter.next();
        assert_eq!(iter.key(), b"c");
        iter.next();
        assert_eq!(iter.key(), b"d");
        iter.next();
        assert!(!iter.valid());

        iter.seek_to_last();
        assert_eq!(iter.key(), b"d");
        iter.prev();
        assert_eq!(iter.key(), b"c");
    }

    #[test]
    fn test_ties_prefer_earlier_children() {
        // The same key in two children: the earlier (newer) child's value
        // comes out first.
        let mut iter = merged(vec![
            VecIter::new(&[(b"k", b"new")]),
            VecIter::new(&[(b"k", b"old")]),
        ]);
        iter.seek_to_first();
        assert_eq!(iter.value(), b"new");
        iter.next();
        assert!(iter.valid());
        assert_eq!(iter.value(), b"old");
        iter.next();
        assert!(!iter.valid());
    }
}
