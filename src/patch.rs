use crate::document_model::Position;
use crate::document_model::line_ending::{byte_index, split_lines};

const MAX_CHILDREN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Space {
    Input,
    Output,
}

/// One stretch of the mapping. Unchanged leaves pass input straight
/// through; changed leaves replace their input with `content`.
#[derive(Debug, Clone, PartialEq)]
struct Leaf {
    input_extent: Position,
    output_extent: Position,
    changed: bool,
    content: Option<String>,
}

impl Leaf {
    fn unchanged(extent: Position) -> Self {
        Self {
            input_extent: extent,
            output_extent: extent,
            changed: false,
            content: None,
        }
    }

    fn extent(&self, space: Space) -> Position {
        match space {
            Space::Input => self.input_extent,
            Space::Output => self.output_extent,
        }
    }

    fn is_void(&self) -> bool {
        self.input_extent.is_zero()
            && self.output_extent.is_zero()
            && self.content.as_deref().is_none_or(str::is_empty)
    }
}

#[derive(Debug, Clone)]
struct Branch {
    children: Vec<Node>,
    input_extent: Position,
    output_extent: Position,
}

impl Branch {
    fn new(children: Vec<Node>) -> Self {
        let (input_extent, output_extent) = children.iter().fold(
            (Position::ZERO, Position::ZERO),
            |(input, output), child| {
                (
                    input.traverse(child.extent(Space::Input)),
                    output.traverse(child.extent(Space::Output)),
                )
            },
        );
        Self {
            children,
            input_extent,
            output_extent,
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Branch(Branch),
    Leaf(Leaf),
}

/// A leaf located in both coordinate spaces.
#[derive(Debug, Clone)]
struct Located {
    input_start: Position,
    output_start: Position,
    leaf: Leaf,
}

impl Located {
    fn start(&self, space: Space) -> Position {
        match space {
            Space::Input => self.input_start,
            Space::Output => self.output_start,
        }
    }

    fn end(&self, space: Space) -> Position {
        self.start(space).traverse(self.leaf.extent(space))
    }
}

impl Node {
    fn extent(&self, space: Space) -> Position {
        match self {
            Node::Branch(branch) => match space {
                Space::Input => branch.input_extent,
                Space::Output => branch.output_extent,
            },
            Node::Leaf(leaf) => leaf.extent(space),
        }
    }

    fn collect_leaves(&self, input_start: Position, output_start: Position, out: &mut Vec<Located>) {
        match self {
            Node::Leaf(leaf) => out.push(Located {
                input_start,
                output_start,
                leaf: leaf.clone(),
            }),
            Node::Branch(branch) => {
                let (mut input, mut output) = (input_start, output_start);
                for child in &branch.children {
                    child.collect_leaves(input, output, out);
                    input = input.traverse(child.extent(Space::Input));
                    output = output.traverse(child.extent(Space::Output));
                }
            }
        }
    }

    /// Leaves whose span in `space` touches `[from, to]`.
    fn collect_run(
        &self,
        input_start: Position,
        output_start: Position,
        space: Space,
        from: Position,
        to: Position,
        run: &mut Vec<Located>,
    ) {
        let start = match space {
            Space::Input => input_start,
            Space::Output => output_start,
        };
        let end = start.traverse(self.extent(space));
        if end < from || start > to {
            return;
        }
        match self {
            Node::Leaf(leaf) => run.push(Located {
                input_start,
                output_start,
                leaf: leaf.clone(),
            }),
            Node::Branch(branch) => {
                let (mut input, mut output) = (input_start, output_start);
                for child in &branch.children {
                    child.collect_run(input, output, space, from, to, run);
                    input = input.traverse(child.extent(Space::Input));
                    output = output.traverse(child.extent(Space::Output));
                }
            }
        }
    }

    /// Rebuilds this subtree with the run touching `[from, to]` swapped for
    /// `replacement`. May hand back several nodes, or none.
    fn replace_run(
        self,
        start: Position,
        space: Space,
        from: Position,
        to: Position,
        replacement: &mut Option<Vec<Leaf>>,
    ) -> Vec<Node> {
        let end = start.traverse(self.extent(space));
        if end < from || start > to {
            return vec![self];
        }
        match self {
            Node::Leaf(_) => replacement
                .take()
                .unwrap_or_default()
                .into_iter()
                .map(Node::Leaf)
                .collect(),
            Node::Branch(branch) => {
                let mut children = Vec::with_capacity(branch.children.len());
                let mut offset = start;
                for child in branch.children {
                    let next = offset.traverse(child.extent(space));
                    children.extend(child.replace_run(offset, space, from, to, replacement));
                    offset = next;
                }
                regroup(children)
            }
        }
    }

    fn locate(
        &self,
        space: Space,
        position: Position,
        mut input_start: Position,
        mut output_start: Position,
    ) -> Option<(Position, Position, &Leaf)> {
        match self {
            Node::Leaf(leaf) => Some((input_start, output_start, leaf)),
            Node::Branch(branch) => {
                let (last, rest) = branch.children.split_last()?;
                for child in rest {
                    let start = match space {
                        Space::Input => input_start,
                        Space::Output => output_start,
                    };
                    if start.traverse(child.extent(space)) > position {
                        return child.locate(space, position, input_start, output_start);
                    }
                    input_start = input_start.traverse(child.extent(Space::Input));
                    output_start = output_start.traverse(child.extent(Space::Output));
                }
                last.locate(space, position, input_start, output_start)
            }
        }
    }
}

/// Collapses single-child branches, merges neighbours that fit together
/// and splits overfull lists into several branches.
fn regroup(children: Vec<Node>) -> Vec<Node> {
    let mut merged: Vec<Node> = Vec::with_capacity(children.len());
    for child in children {
        let child = match child {
            Node::Branch(mut branch) if branch.children.len() == 1 => branch.children.remove(0),
            other => other,
        };
        let fits = matches!(
            (merged.last(), &child),
            (Some(Node::Branch(previous)), Node::Branch(current))
                if previous.children.len() + current.children.len() <= MAX_CHILDREN
        );
        if !fits {
            merged.push(child);
            continue;
        }
        if let (Some(Node::Branch(previous)), Node::Branch(current)) = (merged.last_mut(), child) {
            let mut children = std::mem::take(&mut previous.children);
            children.extend(current.children);
            *previous = Branch::new(children);
        }
    }
    if merged.is_empty() {
        return merged;
    }
    group(merged)
}

/// Packs nodes into branches of at most `MAX_CHILDREN`, sized evenly.
fn group(nodes: Vec<Node>) -> Vec<Node> {
    let count = nodes.len().div_ceil(MAX_CHILDREN);
    let base = nodes.len() / count;
    let extra = nodes.len() % count;
    let mut nodes = nodes.into_iter();
    (0..count)
        .map(|index| {
            let size = base + usize::from(index < extra);
            Node::Branch(Branch::new(nodes.by_ref().take(size).collect()))
        })
        .collect()
}

/// Drops empty leaves and fuses adjacent unchanged ones.
fn normalize(leaves: Vec<Leaf>) -> Vec<Leaf> {
    let mut normalized: Vec<Leaf> = Vec::with_capacity(leaves.len());
    for leaf in leaves {
        if leaf.is_void() {
            continue;
        }
        if let Some(previous) = normalized.last_mut() {
            if !previous.changed && !leaf.changed {
                let extent = previous.input_extent.traverse(leaf.input_extent);
                *previous = Leaf::unchanged(extent);
                continue;
            }
        }
        normalized.push(leaf);
    }
    normalized
}

/// Splits `text` at the point `extent` reaches from its start.
fn split_text(text: &str, extent: Position) -> (&str, &str) {
    let mut offset = 0;
    for (row, (line, ending)) in split_lines(text).into_iter().enumerate() {
        if row == extent.row {
            return text.split_at(offset + byte_index(line, extent.column));
        }
        offset += line.len() + ending.len();
    }
    (text, "")
}

fn join(pieces: [Option<&str>; 3]) -> Option<String> {
    pieces
        .into_iter()
        .try_fold(String::new(), |mut joined, piece| {
            joined.push_str(piece?);
            Some(joined)
        })
}

/// A contiguous stretch of the mapping, placed in both spaces.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub input_start: Position,
    pub output_start: Position,
    pub input_extent: Position,
    pub output_extent: Position,
    pub changed: bool,
    pub content: Option<String>,
}

impl Region {
    pub fn input_end(&self) -> Position {
        self.input_start.traverse(self.input_extent)
    }

    pub fn output_end(&self) -> Position {
        self.output_start.traverse(self.output_extent)
    }
}

/// Maps an input coordinate space onto an output space derived from it by
/// a series of replacements. Both sides stay splice-updatable, so a derived
/// view can follow upstream edits without being rebuilt.
#[derive(Debug, Clone)]
pub struct Patch {
    root: Node,
}

impl Default for Patch {
    fn default() -> Self {
        Self {
            root: Node::Leaf(Leaf::unchanged(Position::INFINITY)),
        }
    }
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Replaces `old_output_extent` of output at `output_start` with
    /// `new_output_extent` of new output, described by `content` when known.
    /// Changes that touch or overlap existing ones are folded into them.
    pub fn splice(
        &mut self,
        output_start: Position,
        old_output_extent: Position,
        new_output_extent: Position,
        content: Option<&str>,
    ) {
        if old_output_extent.is_zero() && new_output_extent.is_zero() {
            return;
        }
        let start = output_start;
        let old_end = start.traverse(old_output_extent);
        let run = self.collect_run(Space::Output, start, old_end);

        let mut left = Vec::new();
        let mut right = Vec::new();
        let mut input_extent = Position::ZERO;
        let mut prefix = Some(String::new());
        let mut prefix_extent = Position::ZERO;
        let mut suffix = Some(String::new());
        let mut suffix_extent = Position::ZERO;

        for located in &run {
            let a = located.start(Space::Output);
            let b = located.end(Space::Output);
            if !located.leaf.changed {
                if a < start {
                    left.push(Leaf::unchanged(start.min(b).traversal_from(a)));
                }
                let (middle_start, middle_end) = (a.max(start), b.min(old_end));
                if middle_end > middle_start {
                    input_extent = input_extent.traverse(middle_end.traversal_from(middle_start));
                }
                if b > old_end {
                    right.push(Leaf::unchanged(b.traversal_from(a.max(old_end))));
                }
                continue;
            }

            input_extent = input_extent.traverse(located.leaf.input_extent);
            let text = located.leaf.content.as_deref();
            if a < start {
                let extent = start.traversal_from(a);
                prefix_extent = prefix_extent.traverse(extent);
                prefix = prefix
                    .zip(text)
                    .map(|(joined, text)| joined + split_text(text, extent).0);
            }
            if b > old_end {
                let kept_from = a.max(old_end);
                suffix_extent = suffix_extent.traverse(b.traversal_from(kept_from));
                suffix = suffix
                    .zip(text)
                    .map(|(joined, text)| joined + split_text(text, kept_from.traversal_from(a)).1);
            }
        }

        let change = Leaf {
            input_extent,
            output_extent: prefix_extent.traverse(new_output_extent).traverse(suffix_extent),
            changed: true,
            content: join([prefix.as_deref(), content, suffix.as_deref()]),
        };
        let mut replacement = left;
        replacement.push(change);
        replacement.extend(right);
        self.replace(Space::Output, start, old_end, normalize(replacement));
    }

    /// Applies an upstream edit to the input space. Unchanged text follows
    /// the edit into the output; text edited inside a changed region stays
    /// hidden behind that region's content.
    pub fn splice_input(
        &mut self,
        input_start: Position,
        old_input_extent: Position,
        new_input_extent: Position,
    ) {
        if old_input_extent.is_zero() && new_input_extent.is_zero() {
            return;
        }
        let start = input_start;
        let old_end = start.traverse(old_input_extent);
        let run = self.collect_run(Space::Input, start, old_end);

        let mut left = Vec::new();
        let mut right = Vec::new();
        let mut absorbed = false;

        for located in run {
            let a = located.start(Space::Input);
            let b = located.end(Space::Input);
            let mut leaf = located.leaf;
            if !leaf.changed {
                if a < start {
                    left.push(Leaf::unchanged(start.min(b).traversal_from(a)));
                }
                if b > old_end {
                    right.push(Leaf::unchanged(b.traversal_from(a.max(old_end))));
                }
            } else if b <= start {
                left.push(leaf);
            } else if a >= old_end {
                right.push(leaf);
            } else if a < start {
                let after = if b > old_end { b.traversal_from(old_end) } else { Position::ZERO };
                leaf.input_extent = start
                    .traversal_from(a)
                    .traverse(new_input_extent)
                    .traverse(after);
                absorbed = true;
                left.push(leaf);
            } else {
                leaf.input_extent = if b > old_end { b.traversal_from(old_end) } else { Position::ZERO };
                right.push(leaf);
            }
        }

        let mut replacement = left;
        if !absorbed {
            replacement.push(Leaf::unchanged(new_input_extent));
        }
        replacement.extend(right);
        self.replace(Space::Input, start, old_end, normalize(replacement));
    }

    /// Where an output position came from. Positions inside a changed
    /// region clip to its input end.
    pub fn translate_output_position(&self, position: Position) -> Position {
        self.translate(Space::Output, position)
    }

    /// Where an input position lands in the output. Positions inside a
    /// changed region clip to its output end.
    pub fn translate_input_position(&self, position: Position) -> Position {
        self.translate(Space::Input, position)
    }

    /// Every region in order, unchanged stretches included.
    pub fn regions(&self) -> Vec<Region> {
        let mut leaves = Vec::new();
        self.root
            .collect_leaves(Position::ZERO, Position::ZERO, &mut leaves);
        leaves
            .into_iter()
            .map(|located| Region {
                input_start: located.input_start,
                output_start: located.output_start,
                input_extent: located.leaf.input_extent,
                output_extent: located.leaf.output_extent,
                changed: located.leaf.changed,
                content: located.leaf.content,
            })
            .collect()
    }

    pub fn changes(&self) -> Vec<Region> {
        self.regions()
            .into_iter()
            .filter(|region| region.changed)
            .collect()
    }

    pub fn has_changes(&self) -> bool {
        self.regions().iter().any(|region| region.changed)
    }

    fn translate(&self, space: Space, position: Position) -> Position {
        let Some((input_start, output_start, leaf)) =
            self.root
                .locate(space, position, Position::ZERO, Position::ZERO)
        else {
            return position;
        };
        let (from_start, to_start, to_extent) = match space {
            Space::Input => (input_start, output_start, leaf.output_extent),
            Space::Output => (output_start, input_start, leaf.input_extent),
        };
        let overshoot = position.traversal_from(from_start);
        to_start.traverse(overshoot).min(to_start.traverse(to_extent))
    }

    fn collect_run(&self, space: Space, from: Position, to: Position) -> Vec<Located> {
        let mut run = Vec::new();
        self.root
            .collect_run(Position::ZERO, Position::ZERO, space, from, to, &mut run);
        run
    }

    fn replace(&mut self, space: Space, from: Position, to: Position, leaves: Vec<Leaf>) {
        let root = std::mem::replace(&mut self.root, Node::Leaf(Leaf::unchanged(Position::ZERO)));
        let mut replacement = Some(leaves);
        let mut nodes = root.replace_run(Position::ZERO, space, from, to, &mut replacement);
        while nodes.len() > 1 {
            nodes = group(nodes);
        }
        self.root = match nodes.pop() {
            Some(Node::Branch(mut branch)) if branch.children.len() == 1 => branch.children.remove(0),
            Some(node) => node,
            None => Node::Leaf(Leaf::unchanged(Position::INFINITY)),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn p(row: usize, column: usize) -> Position {
        Position::new(row, column)
    }

    fn col(column: usize) -> Position {
        p(0, column)
    }

    /// Rebuilds single-line output text from the input and the patch.
    fn render(patch: &Patch, input: &str) -> String {
        let chars: Vec<char> = input.chars().collect();
        let mut output = String::new();
        for region in patch.regions() {
            if region.changed {
                output.push_str(region.content.as_deref().unwrap_or("?"));
            } else {
                let from = region.input_start.column.min(chars.len());
                let to = region.input_end().column.min(chars.len());
                output.extend(&chars[from..to]);
            }
        }
        output
    }

    #[test]
    fn test_fresh_patch_is_identity() {
        let patch = Patch::new();
        assert_eq!(patch.translate_output_position(p(3, 4)), p(3, 4));
        assert_eq!(patch.translate_input_position(p(3, 4)), p(3, 4));
        assert!(!patch.has_changes());
    }

    #[test]
    fn test_insertion_maps_both_ways() {
        let mut patch = Patch::new();
        patch.splice(col(5), col(0), col(3), Some("abc"));

        let changes = patch.changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].input_start, col(5));
        assert_eq!(changes[0].output_start, col(5));
        assert_eq!(changes[0].output_extent, col(3));
        assert_eq!(changes[0].content.as_deref(), Some("abc"));

        assert_eq!(patch.translate_output_position(col(2)), col(2));
        assert_eq!(patch.translate_output_position(col(6)), col(5));
        assert_eq!(patch.translate_output_position(col(9)), col(6));
        assert_eq!(patch.translate_input_position(col(6)), col(9));
        assert_eq!(patch.translate_input_position(col(5)), col(8));
    }

    #[test]
    fn test_adjacent_splices_coalesce() {
        let mut patch = Patch::new();
        patch.splice(col(5), col(0), col(3), Some("abc"));
        patch.splice(col(8), col(0), col(2), Some("de"));

        let changes = patch.changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].content.as_deref(), Some("abcde"));
        assert_eq!(changes[0].input_extent, col(0));
    }

    #[test]
    fn test_splice_inside_change_edits_its_content() {
        let mut patch = Patch::new();
        patch.splice(col(5), col(0), col(3), Some("abc"));
        patch.splice(col(6), col(1), col(0), Some(""));

        let changes = patch.changes();
        assert_eq!(changes[0].content.as_deref(), Some("ac"));
        assert_eq!(changes[0].output_extent, col(2));
    }

    #[test]
    fn test_deletion_of_unchanged_text() {
        let mut patch = Patch::new();
        patch.splice(col(2), col(3), col(0), Some(""));

        let changes = patch.changes();
        assert_eq!(changes[0].input_extent, col(3));
        assert_eq!(changes[0].output_extent, col(0));
        assert_eq!(patch.translate_output_position(col(2)), col(5));
        assert_eq!(patch.translate_input_position(col(3)), col(2));
        assert_eq!(render(&patch, "0123456789"), "0156789");
    }

    #[test]
    fn test_undoing_an_insertion_leaves_no_change() {
        let mut patch = Patch::new();
        patch.splice(col(4), col(0), col(2), Some("xy"));
        patch.splice(col(4), col(2), col(0), Some(""));
        assert!(!patch.has_changes());
        assert_eq!(patch.regions().len(), 1);
    }

    #[test]
    fn test_multi_line_content_splits_by_position() {
        let mut patch = Patch::new();
        patch.splice(p(1, 2), p(0, 0), p(2, 1), Some("ab\ncd\ne"));
        patch.splice(p(2, 1), p(1, 0), p(0, 0), Some(""));

        let changes = patch.changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].content.as_deref(), Some("ab\nce"));
        assert_eq!(changes[0].output_extent, p(1, 2));
    }

    #[test]
    fn test_unknown_content_poisons_merged_content() {
        let mut patch = Patch::new();
        patch.splice(col(1), col(0), col(2), None);
        patch.splice(col(3), col(0), col(1), Some("z"));
        assert_eq!(patch.changes()[0].content, None);
        assert_eq!(patch.changes()[0].output_extent, col(3));
    }

    #[test]
    fn test_splice_input_before_change_shifts_it() {
        let mut patch = Patch::new();
        patch.splice(col(5), col(0), col(3), Some("abc"));
        patch.splice_input(col(0), col(0), col(2));

        let changes = patch.changes();
        assert_eq!(changes[0].input_start, col(7));
        assert_eq!(changes[0].output_start, col(7));
        assert_eq!(patch.translate_output_position(col(2)), col(2));
    }

    #[test]
    fn test_splice_input_inside_change_is_hidden() {
        let mut patch = Patch::new();
        patch.splice(col(5), col(3), col(2), Some("xy"));
        patch.splice_input(col(6), col(1), col(0));

        let changes = patch.changes();
        assert_eq!(changes[0].input_extent, col(2));
        assert_eq!(changes[0].output_extent, col(2));
        assert_eq!(patch.translate_input_position(col(20)), col(20));
    }

    #[test]
    fn test_splice_input_over_unchanged_text() {
        let mut patch = Patch::new();
        patch.splice(col(8), col(0), col(1), Some("!"));
        patch.splice_input(col(2), col(3), col(1));

        assert_eq!(render(&patch, "01X56789"), "01X567!89");
        let changes = patch.changes();
        assert_eq!(changes[0].input_start, col(6));
        assert_eq!(changes[0].output_start, col(6));
    }

    #[test]
    fn test_many_splices_keep_tree_shallow_and_ordered() {
        let mut patch = Patch::new();
        for n in 0..40 {
            patch.splice(col(n * 3), col(0), col(1), Some("+"));
        }
        let regions = patch.regions();
        assert_eq!(patch.changes().len(), 40);
        for pair in regions.windows(2) {
            assert_eq!(pair[0].input_end(), pair[1].input_start);
            assert_eq!(pair[0].output_end(), pair[1].output_start);
        }
    }

    proptest! {
        #[test]
        fn prop_output_matches_sequential_edits(
            input in "[a-z]{0,30}",
            splices in prop::collection::vec((0..40usize, 0..6usize, "[A-Z]{0,4}"), 1..15),
        ) {
            let mut patch = Patch::new();
            let mut expected: Vec<char> = input.chars().collect();

            for (at, old_len, text) in splices {
                let at = at.min(expected.len());
                let old_len = old_len.min(expected.len() - at);
                let new_len = text.chars().count();
                expected.splice(at..at + old_len, text.chars());
                patch.splice(col(at), col(old_len), col(new_len), Some(&text));
            }

            prop_assert_eq!(render(&patch, &input), expected.into_iter().collect::<String>());
        }
    }
}
