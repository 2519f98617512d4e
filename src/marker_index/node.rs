use std::collections::{BTreeMap, BTreeSet};

use super::MarkerId;
use crate::document_model::{Position, Range};

pub(crate) const MAX_CHILDREN: usize = 3;

/// A node of the marker tree. Every node records the markers whose range
/// covers its whole span; branches also remember which markers are stored
/// somewhere beneath them so lookups by id can descend directly.
#[derive(Debug, Clone)]
pub(crate) enum Node {
    Branch(Branch),
    Leaf(Leaf),
}

#[derive(Debug, Clone)]
pub(crate) struct Branch {
    pub children: Vec<Node>,
    pub extent: Position,
    pub ids: BTreeSet<MarkerId>,
    pub below: BTreeSet<MarkerId>,
}

#[derive(Debug, Clone)]
pub(crate) struct Leaf {
    pub extent: Position,
    pub ids: BTreeSet<MarkerId>,
}

impl Leaf {
    pub fn new(extent: Position, ids: BTreeSet<MarkerId>) -> Self {
        Self { extent, ids }
    }
}

impl Branch {
    pub fn from_children(children: Vec<Node>) -> Self {
        let mut branch = Branch {
            children,
            extent: Position::ZERO,
            ids: BTreeSet::new(),
            below: BTreeSet::new(),
        };
        branch.refresh_extent();
        for child in &branch.children {
            branch.below.extend(child.ids().iter().copied());
            if let Node::Branch(inner) = child {
                branch.below.extend(inner.below.iter().copied());
            }
        }
        branch
    }

    pub fn refresh_extent(&mut self) {
        self.extent = self
            .children
            .iter()
            .fold(Position::ZERO, |extent, child| extent.traverse(child.extent()));
    }

    /// Divides an overfull branch in two. Both halves keep this branch's ids
    /// since each still lies inside the same marker ranges.
    fn split(mut self) -> Vec<Node> {
        let right_children = self.children.split_off(self.children.len() / 2);
        let mut left = Branch::from_children(self.children);
        let mut right = Branch::from_children(right_children);
        left.ids = self.ids.clone();
        right.ids = self.ids;
        vec![Node::Branch(left), Node::Branch(right)]
    }

    /// Moves this branch's ids onto each child.
    fn push_ids_down(&mut self) {
        if self.ids.is_empty() {
            return;
        }
        let ids = std::mem::take(&mut self.ids);
        for child in &mut self.children {
            child.ids_mut().extend(ids.iter().copied());
        }
        self.below.extend(ids);
    }

    /// Collapses single-child branches and merges neighbouring branches that
    /// fit together under the branching limit.
    fn rebalance(&mut self) {
        for child in &mut self.children {
            while let Node::Branch(inner) = child {
                if inner.children.len() != 1 {
                    break;
                }
                inner.push_ids_down();
                let only = inner.children.remove(0);
                *child = only;
            }
        }

        let mut index = 0;
        while index + 1 < self.children.len() {
            let fits = match (&self.children[index], &self.children[index + 1]) {
                (Node::Branch(left), Node::Branch(right)) => {
                    left.children.len() + right.children.len() <= MAX_CHILDREN
                }
                _ => false,
            };
            if !fits {
                index += 1;
                continue;
            }
            let right = self.children.remove(index + 1);
            if let (Node::Branch(left), Node::Branch(mut right)) =
                (&mut self.children[index], right)
            {
                left.push_ids_down();
                right.push_ids_down();
                let mut children = std::mem::take(&mut left.children);
                children.extend(right.children);
                *left = Branch::from_children(children);
            }
        }
    }
}

impl Node {
    pub fn extent(&self) -> Position {
        match self {
            Node::Branch(branch) => branch.extent,
            Node::Leaf(leaf) => leaf.extent,
        }
    }

    pub fn ids(&self) -> &BTreeSet<MarkerId> {
        match self {
            Node::Branch(branch) => &branch.ids,
            Node::Leaf(leaf) => &leaf.ids,
        }
    }

    pub fn ids_mut(&mut self) -> &mut BTreeSet<MarkerId> {
        match self {
            Node::Branch(branch) => &mut branch.ids,
            Node::Leaf(leaf) => &mut leaf.ids,
        }
    }

    fn holds(&self, id: MarkerId) -> bool {
        match self {
            Node::Branch(branch) => branch.ids.contains(&id) || branch.below.contains(&id),
            Node::Leaf(leaf) => leaf.ids.contains(&id),
        }
    }

    /// Makes `point` a leaf boundary. Returns replacement nodes when this
    /// node had to be divided.
    pub fn split_at(&mut self, start: Position, point: Position) -> Option<Vec<Node>> {
        match self {
            Node::Leaf(leaf) => {
                let end = start.traverse(leaf.extent);
                if start < point && point < end {
                    let left = Leaf::new(point.traversal_from(start), leaf.ids.clone());
                    let right = Leaf::new(end.traversal_from(point), leaf.ids.clone());
                    Some(vec![Node::Leaf(left), Node::Leaf(right)])
                } else {
                    None
                }
            }
            Node::Branch(branch) => {
                let mut child_start = start;
                let mut target = None;
                for (index, child) in branch.children.iter().enumerate() {
                    let child_end = child_start.traverse(child.extent());
                    if child_start < point && point < child_end {
                        target = Some((index, child_start));
                        break;
                    }
                    child_start = child_end;
                }
                let (index, child_start) = target?;
                let replacement = branch.children[index].split_at(child_start, point)?;
                branch.children.splice(index..=index, replacement);
                take_if_overfull(branch)
            }
        }
    }

    /// Records an empty marker at `point`, creating a zero-width leaf there
    /// if none exists yet.
    pub fn insert_empty(
        &mut self,
        start: Position,
        point: Position,
        id: MarkerId,
    ) -> Option<Vec<Node>> {
        match self {
            Node::Leaf(leaf) => {
                let end = start.traverse(leaf.extent);
                if leaf.extent.is_zero() {
                    leaf.ids.insert(id);
                    return None;
                }
                let marker = Leaf::new(Position::ZERO, BTreeSet::from([id]));
                if start < point && point < end {
                    let mut covering = leaf.ids.clone();
                    covering.insert(id);
                    Some(vec![
                        Node::Leaf(Leaf::new(point.traversal_from(start), leaf.ids.clone())),
                        Node::Leaf(Leaf::new(Position::ZERO, covering)),
                        Node::Leaf(Leaf::new(end.traversal_from(point), leaf.ids.clone())),
                    ])
                } else if point == end {
                    Some(vec![Node::Leaf(leaf.clone()), Node::Leaf(marker)])
                } else {
                    Some(vec![Node::Leaf(marker), Node::Leaf(leaf.clone())])
                }
            }
            Node::Branch(branch) => {
                let spans = child_spans(start, &branch.children);
                let target = spans
                    .iter()
                    .position(|span| span.is_empty() && span.start == point)
                    .or_else(|| {
                        spans
                            .iter()
                            .position(|span| span.start < point && point < span.end)
                    })
                    .or_else(|| spans.iter().position(|span| span.end == point))
                    .or_else(|| spans.iter().position(|span| span.start == point))?;

                branch.below.insert(id);
                let replacement =
                    branch.children[target].insert_empty(spans[target].start, point, id)?;
                branch.children.splice(target..=target, replacement);
                branch.refresh_extent();
                take_if_overfull(branch)
            }
        }
    }

    /// Adds `id` to the highest nodes lying entirely inside `[from, to]`.
    /// Leaf boundaries must already exist at both endpoints.
    pub fn cover(&mut self, start: Position, from: Position, to: Position, id: MarkerId) -> bool {
        let end = start.traverse(self.extent());
        if end < from || start > to {
            return false;
        }
        if start >= from && end <= to {
            self.ids_mut().insert(id);
            return true;
        }
        match self {
            Node::Leaf(_) => false,
            Node::Branch(branch) => {
                let mut covered = false;
                let mut child_start = start;
                for child in &mut branch.children {
                    let extent = child.extent();
                    covered |= child.cover(child_start, from, to, id);
                    child_start = child_start.traverse(extent);
                }
                if covered {
                    branch.below.insert(id);
                }
                covered
            }
        }
    }

    /// Removes `id` from every node intersecting `[from, to]`.
    pub fn remove(&mut self, start: Position, from: Position, to: Position, id: MarkerId) {
        let end = start.traverse(self.extent());
        if end < from || start > to {
            return;
        }
        match self {
            Node::Leaf(leaf) => {
                leaf.ids.remove(&id);
            }
            Node::Branch(branch) => {
                branch.ids.remove(&id);
                if branch.below.remove(&id) {
                    let mut child_start = start;
                    for child in &mut branch.children {
                        let extent = child.extent();
                        child.remove(child_start, from, to, id);
                        child_start = child_start.traverse(extent);
                    }
                }
            }
        }
    }

    /// Drops zero-width leaves at `point` that no marker uses any more.
    /// Returns false when this node itself should be dropped.
    pub fn prune_at(&mut self, start: Position, point: Position) -> bool {
        let end = start.traverse(self.extent());
        if point < start || point > end {
            return true;
        }
        match self {
            Node::Leaf(leaf) => !(leaf.extent.is_zero() && leaf.ids.is_empty()),
            Node::Branch(branch) => {
                let mut child_start = start;
                let mut kept = Vec::with_capacity(branch.children.len());
                let mut dropped_ids = false;
                for mut child in branch.children.drain(..) {
                    let extent = child.extent();
                    if child.prune_at(child_start, point) {
                        kept.push(child);
                    } else {
                        dropped_ids |= !child.ids().is_empty();
                    }
                    child_start = child_start.traverse(extent);
                }
                if kept.is_empty() {
                    return false;
                }
                if dropped_ids {
                    let ids = std::mem::take(&mut branch.ids);
                    *branch = Branch::from_children(kept);
                    branch.ids = ids;
                } else {
                    branch.children = kept;
                }
                branch.rebalance();
                branch.refresh_extent();
                true
            }
        }
    }

    /// Start of the first leaf reaching `point`.
    pub fn run_start(&self, start: Position, point: Position) -> Position {
        match self {
            Node::Leaf(_) => start,
            Node::Branch(branch) => {
                let mut child_start = start;
                for child in &branch.children {
                    let child_end = child_start.traverse(child.extent());
                    if child_end >= point {
                        return child.run_start(child_start, point);
                    }
                    child_start = child_end;
                }
                child_start
            }
        }
    }

    /// End of the last leaf starting at or before `point`.
    pub fn run_end(&self, start: Position, point: Position) -> Position {
        match self {
            Node::Leaf(leaf) => start.traverse(leaf.extent),
            Node::Branch(branch) => {
                let spans = child_spans(start, &branch.children);
                for (child, span) in branch.children.iter().zip(&spans).rev() {
                    if span.start <= point {
                        return child.run_end(span.start, point);
                    }
                }
                start
            }
        }
    }

    /// Collapses every leaf touching `[from, to]` into the first of them,
    /// which takes `merged` as its extent. Nodes in that run must hold no ids.
    /// Returns false when this node should be dropped.
    pub fn replace_run(
        &mut self,
        start: Position,
        from: Position,
        to: Position,
        merged: Position,
        kept: &mut bool,
    ) -> bool {
        let end = start.traverse(self.extent());
        if end < from || start > to {
            return true;
        }
        match self {
            Node::Leaf(leaf) => {
                if *kept {
                    false
                } else {
                    leaf.extent = merged;
                    *kept = true;
                    true
                }
            }
            Node::Branch(branch) => {
                let mut child_start = start;
                let mut retained = Vec::with_capacity(branch.children.len());
                for mut child in branch.children.drain(..) {
                    let extent = child.extent();
                    if child.replace_run(child_start, from, to, merged, kept) {
                        retained.push(child);
                    }
                    child_start = child_start.traverse(extent);
                }
                branch.children = retained;
                if branch.children.is_empty() {
                    return false;
                }
                branch.rebalance();
                branch.refresh_extent();
                true
            }
        }
    }

    pub fn collect_intersecting(
        &self,
        start: Position,
        from: Position,
        to: Position,
        out: &mut BTreeSet<MarkerId>,
    ) {
        let end = start.traverse(self.extent());
        if end < from || start > to {
            return;
        }
        out.extend(self.ids().iter().copied());
        if let Node::Branch(branch) = self {
            if start >= from && end <= to {
                out.extend(branch.below.iter().copied());
                return;
            }
            let mut child_start = start;
            for child in &branch.children {
                child.collect_intersecting(child_start, from, to, out);
                child_start = child_start.traverse(child.extent());
            }
        }
    }

    pub fn collect_containing(&self, start: Position, point: Position, out: &mut BTreeSet<MarkerId>) {
        let end = start.traverse(self.extent());
        if point < start || point > end {
            return;
        }
        out.extend(self.ids().iter().copied());
        if let Node::Branch(branch) = self {
            let mut child_start = start;
            for child in &branch.children {
                child.collect_containing(child_start, point, out);
                child_start = child_start.traverse(child.extent());
            }
        }
    }

    pub fn start_of(&self, start: Position, id: MarkerId) -> Option<Position> {
        if self.ids().contains(&id) {
            return Some(start);
        }
        let Node::Branch(branch) = self else {
            return None;
        };
        if !branch.below.contains(&id) {
            return None;
        }
        let mut child_start = start;
        for child in &branch.children {
            if child.holds(id) {
                return child.start_of(child_start, id);
            }
            child_start = child_start.traverse(child.extent());
        }
        None
    }

    pub fn end_of(&self, start: Position, id: MarkerId) -> Option<Position> {
        if self.ids().contains(&id) {
            return Some(start.traverse(self.extent()));
        }
        let Node::Branch(branch) = self else {
            return None;
        };
        if !branch.below.contains(&id) {
            return None;
        }
        let spans = child_spans(start, &branch.children);
        for (child, span) in branch.children.iter().zip(&spans).rev() {
            if child.holds(id) {
                return child.end_of(span.start, id);
            }
        }
        None
    }

    /// Every span each id is stored on, for dumps and self-checks.
    pub fn collect_spans(&self, start: Position, out: &mut BTreeMap<MarkerId, Vec<Range>>) {
        let span = Range::from_point_with_delta(start, self.extent());
        for id in self.ids() {
            out.entry(*id).or_default().push(span);
        }
        if let Node::Branch(branch) = self {
            let mut child_start = start;
            for child in &branch.children {
                child.collect_spans(child_start, out);
                child_start = child_start.traverse(child.extent());
            }
        }
    }

    /// Checks extents, child counts and the `below` summaries.
    pub fn is_well_formed(&self) -> bool {
        let Node::Branch(branch) = self else {
            return true;
        };
        if branch.children.is_empty() || branch.children.len() > MAX_CHILDREN {
            return false;
        }
        let extent = branch
            .children
            .iter()
            .fold(Position::ZERO, |extent, child| extent.traverse(child.extent()));
        let mut below = BTreeSet::new();
        for child in &branch.children {
            below.extend(child.ids().iter().copied());
            if let Node::Branch(inner) = child {
                below.extend(inner.below.iter().copied());
            }
        }
        extent == branch.extent
            && below == branch.below
            && branch.children.iter().all(Node::is_well_formed)
    }
}

fn child_spans(start: Position, children: &[Node]) -> Vec<Range> {
    let mut spans = Vec::with_capacity(children.len());
    let mut child_start = start;
    for child in children {
        let span = Range::from_point_with_delta(child_start, child.extent());
        child_start = span.end;
        spans.push(span);
    }
    spans
}

fn take_if_overfull(branch: &mut Branch) -> Option<Vec<Node>> {
    if branch.children.len() <= MAX_CHILDREN {
        return None;
    }
    let owned = std::mem::replace(branch, Branch::from_children(Vec::new()));
    Some(owned.split())
}
