use crate::{
    atom::Atom,
    error::{EmptySequenceSnafu, InvalidPositionSnafu, Result},
    id::Id,
    range::Point,
    sequence::Sequence,
};
use snafu::ensure;
use tracing::warn;

/// The replicated document: an array of lines, each an array of atoms kept
/// strictly ordered by identifier sequence. A newline atom terminates its
/// line, so every line except possibly the last ends with one.
///
/// Local edits mint fresh identifier sequences between their neighbours and
/// return the atoms for the wire; remote atoms are placed by binary search
/// on their sequence, which makes application commutative and idempotent.
#[derive(Debug, Clone)]
pub struct Document {
    site: u32,
    lines: Vec<Vec<Atom>>,
}

impl Document {
    pub fn new(site: u32) -> Self {
        Self {
            site,
            lines: vec![Vec::new()],
        }
    }

    /// Populates a fresh document from existing buffer contents, minting
    /// sequences left to right.
    pub fn from_text(site: u32, text: &str) -> Self {
        let mut doc = Self::new(site);
        let mut prev: Vec<Id> = Vec::new();
        for c in text.chars() {
            let atom = Atom::create(c, site, &prev, &[]);
            prev = atom.ids.0.clone();
            doc.push_atom(atom);
        }
        doc
    }

    pub fn site(&self) -> u32 {
        self.site
    }

    pub fn set_site(&mut self, site: u32) {
        self.site = site;
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn atom_count(&self) -> usize {
        self.lines.iter().map(|line| line.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.atom_count() == 0
    }

    /// All atoms in document order.
    pub fn atoms(&self) -> impl Iterator<Item = &Atom> {
        self.lines.iter().flatten()
    }

    /// Reconstructs the text by aggregating every atom's value.
    pub fn content(&self) -> String {
        self.atoms().map(|a| a.value).collect()
    }

    /// On a local insertion at `pos`, mint an atom strictly between the
    /// neighbours on either side, splice it into the line array (splitting
    /// the line when it is a newline), and hand it back for propagation.
    pub fn local_insert(&mut self, c: char, pos: Point) -> Result<Atom> {
        ensure!(self.position_valid(pos), InvalidPositionSnafu { point: pos });
        let pos = self.normalize(pos);

        let before = self.ids_before(pos);
        let after = self.ids_at(pos);
        let atom = Atom::create(c, self.site, &before, &after);

        self.splice(pos, atom.clone());
        Ok(atom)
    }

    /// Inserts a run of text at `pos`, one atom per character, and returns
    /// the atoms in document order.
    pub fn local_insert_text(&mut self, text: &str, pos: Point) -> Result<Vec<Atom>> {
        let mut at = pos;
        let mut atoms = Vec::with_capacity(text.len());
        for c in text.chars() {
            let atom = self.local_insert(c, at)?;
            at = if c == '\n' {
                Point::new(at.row + 1, 0)
            } else {
                Point::new(at.row, at.column + 1)
            };
            atoms.push(atom);
        }
        Ok(atoms)
    }

    /// Removes the half-open interval `[start, end)` and returns the removed
    /// atoms in document order. Deleting a newline merges the two lines it
    /// used to separate.
    pub fn local_delete(&mut self, start: Point, end: Point) -> Result<Vec<Atom>> {
        ensure!(start <= end, InvalidPositionSnafu { point: end });
        ensure!(
            self.position_valid(start),
            InvalidPositionSnafu { point: start }
        );
        ensure!(self.position_valid(end), InvalidPositionSnafu { point: end });
        let (start, end) = (self.normalize(start), self.normalize(end));

        if start == end {
            return Ok(Vec::new());
        }

        let mut removed: Vec<Atom>;
        if start.row == end.row {
            removed = self.lines[start.row]
                .drain(start.column..end.column)
                .collect();
        } else {
            removed = self.lines[start.row].split_off(start.column);
            for line in self.lines.drain(start.row + 1..end.row) {
                removed.extend(line);
            }
            // After the drain the old end row sits right below start.row.
            let mut tail_line = self.lines.remove(start.row + 1);
            let tail = tail_line.split_off(end.column);
            removed.extend(tail_line);
            self.lines[start.row].extend(tail);
        }

        self.mend();
        Ok(removed)
    }

    /// Places a remote atom at the unique position consistent with its
    /// sequence. Returns `None` when an identical sequence is already
    /// present, making duplicate delivery a no-op.
    pub fn remote_insert(&mut self, atom: Atom) -> Result<Option<Point>> {
        ensure!(!atom.ids.0.is_empty(), EmptySequenceSnafu);
        if !atom.site_consistent() {
            warn!(site = ?atom.site(), "atom identifier sites are inconsistent");
        }

        let (row, column) = match self.locate(&atom.ids) {
            (_, Ok(_)) => return Ok(None),
            (row, Err(column)) => (row, column),
        };

        let pos = Point::new(row, column);
        self.splice(pos, atom);
        Ok(Some(pos))
    }

    /// Removes the atom carrying this sequence, merging lines when it was a
    /// newline. A sequence that is not present is dropped: without version
    /// vectors a delete that outruns its insert cannot be honoured.
    pub fn remote_delete(&mut self, atom: &Atom) -> Result<Option<Point>> {
        ensure!(!atom.ids.0.is_empty(), EmptySequenceSnafu);

        let (row, column) = match self.locate(&atom.ids) {
            (row, Ok(column)) => (row, column),
            (_, Err(_)) => {
                warn!("dropping delete for an atom that was never inserted");
                return Ok(None);
            }
        };

        let was_newline = self.lines[row][column].is_newline();
        self.lines[row].remove(column);
        if was_newline && row + 1 < self.lines.len() {
            let next = self.lines.remove(row + 1);
            self.lines[row].extend(next);
        }
        self.mend();
        Ok(Some(Point::new(row, column)))
    }

    /// True when flattening the lines yields strictly increasing sequences
    /// and every non-terminal line ends with a newline.
    pub fn is_ordered(&self) -> bool {
        let atoms: Vec<&Atom> = self.atoms().collect();
        let sorted = atoms.windows(2).all(|w| w[0].ids < w[1].ids);
        let terminated = self
            .lines
            .iter()
            .take(self.lines.len().saturating_sub(1))
            .all(|line| line.last().is_some_and(|a| a.is_newline()));
        sorted && terminated
    }

    fn position_valid(&self, pos: Point) -> bool {
        match self.lines.get(pos.row) {
            Some(line) => pos.column <= line.len(),
            None => false,
        }
    }

    /// A column just past a terminating newline names the same place as the
    /// start of the next line; fold it onto that representation.
    fn normalize(&self, pos: Point) -> Point {
        let line = &self.lines[pos.row];
        if pos.column >= line.len()
            && line.last().is_some_and(|a| a.is_newline())
            && pos.row + 1 < self.lines.len()
        {
            Point::new(pos.row + 1, 0)
        } else {
            pos
        }
    }

    /// Identifier sequence of the atom immediately before `pos`, or empty at
    /// the document start.
    fn ids_before(&self, pos: Point) -> Vec<Id> {
        if pos.column > 0 {
            self.lines[pos.row][pos.column - 1].ids.0.clone()
        } else if pos.row > 0 {
            self.lines[pos.row - 1]
                .last()
                .map(|a| a.ids.0.clone())
                .unwrap_or_default()
        } else {
            Vec::new()
        }
    }

    /// Identifier sequence of the atom at `pos`, or empty at the document
    /// end.
    fn ids_at(&self, pos: Point) -> Vec<Id> {
        self.lines[pos.row]
            .get(pos.column)
            .or_else(|| self.lines.get(pos.row + 1).and_then(|line| line.first()))
            .map(|a| a.ids.0.clone())
            .unwrap_or_default()
    }

    /// Binary search for a sequence: the owning row, plus `Ok(column)` when
    /// present or `Err(column)` for its insertion slot.
    fn locate(&self, ids: &Sequence) -> (usize, std::result::Result<usize, usize>) {
        let mut row = self
            .lines
            .partition_point(|line| line.last().is_some_and(|last| last.ids < *ids));
        if row == self.lines.len() {
            row = self.lines.len() - 1;
            return (row, Err(self.lines[row].len()));
        }
        (row, self.lines[row].binary_search_by(|a| a.ids.cmp(ids)))
    }

    /// Splices an atom in at `pos`, splitting the line when the atom is a
    /// newline.
    fn splice(&mut self, pos: Point, atom: Atom) {
        let split = atom.is_newline();
        self.lines[pos.row].insert(pos.column, atom);
        if split {
            let rest = self.lines[pos.row].split_off(pos.column + 1);
            self.lines.insert(pos.row + 1, rest);
        }
    }

    /// Appends an atom at the end of the document; used when populating from
    /// text, where sequences are already known to be increasing.
    fn push_atom(&mut self, atom: Atom) {
        let newline = atom.is_newline();
        self.lines
            .last_mut()
            .expect("document always has a line")
            .push(atom);
        if newline {
            self.lines.push(Vec::new());
        }
    }

    /// Restores the one-empty-line representation after deletions that drain
    /// the document.
    fn mend(&mut self) {
        if self.lines.is_empty() {
            self.lines.push(Vec::new());
        }
    }
}
