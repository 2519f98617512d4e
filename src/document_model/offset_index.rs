use std::ops::{Add, AddAssign, Sub, SubAssign};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const MAX_HEIGHT: usize = 8;
const PROBABILITY: f64 = 0.25;
const HEAD: usize = 0;

/// The size of one line (or a run of lines) in both dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub rows: usize,
    pub characters: usize,
}

impl Span {
    pub const ZERO: Span = Span {
        rows: 0,
        characters: 0,
    };

    pub fn new(rows: usize, characters: usize) -> Self {
        Self { rows, characters }
    }

    /// A single line holding `characters` characters including its terminator.
    pub fn line(characters: usize) -> Self {
        Self::new(1, characters)
    }

    pub fn get(&self, dimension: Dimension) -> usize {
        match dimension {
            Dimension::Rows => self.rows,
            Dimension::Characters => self.characters,
        }
    }
}

impl Add for Span {
    type Output = Span;

    fn add(self, other: Span) -> Span {
        Span::new(self.rows + other.rows, self.characters + other.characters)
    }
}

impl Sub for Span {
    type Output = Span;

    fn sub(self, other: Span) -> Span {
        Span::new(self.rows - other.rows, self.characters - other.characters)
    }
}

impl AddAssign for Span {
    fn add_assign(&mut self, other: Span) {
        *self = *self + other;
    }
}

impl SubAssign for Span {
    fn sub_assign(&mut self, other: Span) {
        *self = *self - other;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Rows,
    Characters,
}

#[derive(Debug, Clone)]
struct SkipNode {
    span: Span,
    next: Vec<Option<usize>>,
    /// Distance covered by each forward pointer, counting the span of the
    /// node it lands on. A missing pointer measures the distance to the end.
    distance: Vec<Span>,
}

/// Cumulative (rows, characters) index over the lines of a document.
///
/// A skip list whose forward pointers carry the distance they skip, so prefix
/// sums in either dimension are found by a single descent.
#[derive(Debug, Clone)]
pub struct OffsetIndex {
    nodes: Vec<SkipNode>,
    free: Vec<usize>,
    len: usize,
    rng: StdRng,
}

impl Default for OffsetIndex {
    fn default() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }
}

impl OffsetIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        let head = SkipNode {
            span: Span::ZERO,
            next: vec![None; MAX_HEIGHT],
            distance: vec![Span::ZERO; MAX_HEIGHT],
        };
        Self {
            nodes: vec![head],
            free: Vec::new(),
            len: 0,
            rng,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sum of every element.
    pub fn total(&self) -> Span {
        let mut node = HEAD;
        let mut total = Span::ZERO;
        let top = MAX_HEIGHT - 1;
        loop {
            total += self.nodes[node].distance[top];
            match self.nodes[node].next[top] {
                Some(next) => node = next,
                None => return total,
            }
        }
    }

    /// Accumulated span of the longest prefix whose total in `dimension`
    /// does not exceed `target`.
    pub fn total_to(&self, target: usize, dimension: Dimension) -> Span {
        let (_, positions) = self.seek(target, dimension);
        positions[0]
    }

    /// Removes `count` elements after the prefix totalling `index` in
    /// `dimension` and inserts `elements` in their place. Returns the removed spans.
    pub fn splice_array(
        &mut self,
        dimension: Dimension,
        index: usize,
        count: usize,
        elements: &[Span],
    ) -> Vec<Span> {
        let (mut preds, mut positions) = self.seek(index, dimension);
        let removed = self.remove_after(&preds, count);
        for &span in elements {
            self.insert_after(&mut preds, &mut positions, span);
        }
        removed
    }

    pub fn elements(&self) -> Vec<Span> {
        let mut elements = Vec::with_capacity(self.len);
        let mut cursor = self.nodes[HEAD].next[0];
        while let Some(node) = cursor {
            elements.push(self.nodes[node].span);
            cursor = self.nodes[node].next[0];
        }
        elements
    }

    /// Finds, per level, the last node reached without passing `target`,
    /// together with the accumulated span at that node.
    fn seek(&self, target: usize, dimension: Dimension) -> (Vec<usize>, Vec<Span>) {
        let mut preds = vec![HEAD; MAX_HEIGHT];
        let mut positions = vec![Span::ZERO; MAX_HEIGHT];
        let mut node = HEAD;
        let mut position = Span::ZERO;

        for level in (0..MAX_HEIGHT).rev() {
            while let Some(next) = self.nodes[node].next[level] {
                let reached = position + self.nodes[node].distance[level];
                if reached.get(dimension) > target {
                    break;
                }
                node = next;
                position = reached;
            }
            preds[level] = node;
            positions[level] = position;
        }
        (preds, positions)
    }

    fn remove_after(&mut self, preds: &[usize], count: usize) -> Vec<Span> {
        let mut removed = Vec::with_capacity(count);
        for _ in 0..count {
            let Some(victim) = self.nodes[preds[0]].next[0] else {
                break;
            };
            let victim_node = self.nodes[victim].clone();

            for (level, &pred) in preds.iter().enumerate() {
                if level < victim_node.next.len() && self.nodes[pred].next[level] == Some(victim) {
                    let pred_node = &mut self.nodes[pred];
                    pred_node.next[level] = victim_node.next[level];
                    pred_node.distance[level] =
                        pred_node.distance[level] + victim_node.distance[level] - victim_node.span;
                } else {
                    self.nodes[pred].distance[level] -= victim_node.span;
                }
            }

            self.free.push(victim);
            self.len -= 1;
            removed.push(victim_node.span);
        }
        removed
    }

    fn insert_after(&mut self, preds: &mut [usize], positions: &mut [Span], span: Span) {
        let height = self.random_height();
        let new_position = positions[0] + span;
        let node = self.allocate(SkipNode {
            span,
            next: vec![None; height],
            distance: vec![Span::ZERO; height],
        });

        for level in 0..MAX_HEIGHT {
            let pred = preds[level];
            if level < height {
                let old_next = self.nodes[pred].next[level];
                let old_target = positions[level] + self.nodes[pred].distance[level];
                self.nodes[node].next[level] = old_next;
                self.nodes[node].distance[level] = old_target + span - new_position;
                self.nodes[pred].next[level] = Some(node);
                self.nodes[pred].distance[level] = new_position - positions[level];
                preds[level] = node;
                positions[level] = new_position;
            } else {
                self.nodes[pred].distance[level] += span;
            }
        }
        self.len += 1;
    }

    fn allocate(&mut self, node: SkipNode) -> usize {
        match self.free.pop() {
            Some(index) => {
                self.nodes[index] = node;
                index
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn random_height(&mut self) -> usize {
        let mut height = 1;
        while height < MAX_HEIGHT && self.rng.gen_bool(PROBABILITY) {
            height += 1;
        }
        height
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn lines(lengths: &[usize]) -> Vec<Span> {
        lengths.iter().map(|&len| Span::line(len)).collect()
    }

    fn naive_total_to(elements: &[Span], target: usize, dimension: Dimension) -> Span {
        let mut total = Span::ZERO;
        for element in elements {
            let next = total + *element;
            if next.get(dimension) > target {
                break;
            }
            total = next;
        }
        total
    }

    #[test]
    fn test_total_to_rows() {
        let mut index = OffsetIndex::with_seed(7);
        index.splice_array(Dimension::Rows, 0, 0, &lines(&[3, 4, 1, 6]));

        assert_eq!(index.total_to(0, Dimension::Rows), Span::new(0, 0));
        assert_eq!(index.total_to(2, Dimension::Rows), Span::new(2, 7));
        assert_eq!(index.total_to(4, Dimension::Rows), Span::new(4, 14));
        assert_eq!(index.total(), Span::new(4, 14));
    }

    #[test]
    fn test_total_to_characters() {
        let mut index = OffsetIndex::with_seed(3);
        index.splice_array(Dimension::Rows, 0, 0, &lines(&[3, 4, 1, 6]));

        assert_eq!(index.total_to(2, Dimension::Characters), Span::new(0, 0));
        assert_eq!(index.total_to(3, Dimension::Characters), Span::new(1, 3));
        assert_eq!(index.total_to(7, Dimension::Characters), Span::new(2, 7));
        assert_eq!(index.total_to(100, Dimension::Characters), Span::new(4, 14));
    }

    #[test]
    fn test_ties_advance_past_empty_elements() {
        let mut index = OffsetIndex::with_seed(11);
        index.splice_array(Dimension::Rows, 0, 0, &lines(&[3, 0]));
        assert_eq!(index.total_to(3, Dimension::Characters), Span::new(2, 3));
    }

    #[test]
    fn test_splice_replaces_middle_rows() {
        let mut index = OffsetIndex::with_seed(1);
        index.splice_array(Dimension::Rows, 0, 0, &lines(&[1, 2, 3, 4, 5]));
        let removed = index.splice_array(Dimension::Rows, 1, 3, &lines(&[10, 20]));

        assert_eq!(removed, lines(&[2, 3, 4]));
        assert_eq!(index.elements(), lines(&[1, 10, 20, 5]));
        assert_eq!(index.len(), 4);
        assert_eq!(index.total_to(3, Dimension::Rows), Span::new(3, 31));
    }

    #[test]
    fn test_splice_removing_everything() {
        let mut index = OffsetIndex::with_seed(5);
        index.splice_array(Dimension::Rows, 0, 0, &lines(&[2, 2]));
        index.splice_array(Dimension::Rows, 0, 2, &[]);
        assert!(index.is_empty());
        assert_eq!(index.total(), Span::ZERO);
    }

    proptest! {
        #[test]
        fn prop_matches_naive_prefix_sums(
            initial in prop::collection::vec(0..20usize, 1..40),
            splices in prop::collection::vec((0..50usize, 0..5usize, prop::collection::vec(0..20usize, 0..6)), 1..20),
            queries in prop::collection::vec(0..400usize, 1..10),
        ) {
            let mut index = OffsetIndex::new();
            let mut naive = lines(&initial);
            index.splice_array(Dimension::Rows, 0, 0, &naive);

            for (at, count, inserted) in splices {
                let at = at.min(naive.len());
                let count = count.min(naive.len() - at);
                let inserted = lines(&inserted);
                let expected: Vec<Span> = naive.splice(at..at + count, inserted.iter().copied()).collect();
                let removed = index.splice_array(Dimension::Rows, at, count, &inserted);
                prop_assert_eq!(removed, expected);
            }

            prop_assert_eq!(index.elements(), naive.clone());
            for target in queries {
                prop_assert_eq!(
                    index.total_to(target, Dimension::Characters),
                    naive_total_to(&naive, target, Dimension::Characters)
                );
                prop_assert_eq!(
                    index.total_to(target, Dimension::Rows),
                    naive_total_to(&naive, target, Dimension::Rows)
                );
            }
        }
    }
}
