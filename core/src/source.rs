//! Source positions and the file set.
//!
//! Every AST node and every emitted instruction carries a [`Pos`]: a byte
//! offset into a virtual address space shared by all files of one
//! compilation. A [`FileSet`] assigns each file a base offset in that space
//! and can resolve any `Pos` back to a `{file, line, column}` triple for
//! diagnostics.

use core::fmt;

use ecow::EcoString;

/// A compact source position: a byte offset into the file set's address
/// space. `NO_POS` (zero) means "no position recorded".
pub type Pos = u32;

/// The zero position. File bases start at 1, so no real position is 0.
pub const NO_POS: Pos = 0;

/// A resolved position, ready for display in diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    /// Name of the file, as registered with the file set.
    pub filename: EcoString,
    /// Byte offset within the file.
    pub offset: u32,
    /// 1-based line number.
    pub line: u32,
    /// 1-based column number (byte-oriented).
    pub column: u32,
}

impl Position {
    /// A position is valid when its line is set.
    pub fn is_valid(&self) -> bool {
        self.line > 0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.filename.is_empty() {
            if self.is_valid() {
                write!(f, "{}:{}", self.line, self.column)
            } else {
                write!(f, "-")
            }
        } else if self.is_valid() {
            write!(f, "{}:{}:{}", self.filename, self.line, self.column)
        } else {
            write!(f, "{}", self.filename)
        }
    }
}

/// A single source file registered in a [`FileSet`].
///
/// The line table is computed eagerly at registration; resolution is a
/// binary search over line start offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// File name used in diagnostics.
    pub name: EcoString,
    /// Base offset of this file in the file set's address space.
    pub base: Pos,
    /// Size of the file in bytes.
    pub size: u32,
    /// Byte offsets (file-relative) of each line start. Always starts
    /// with 0 for line 1.
    lines: Vec<u32>,
}

impl SourceFile {
    fn new(name: EcoString, base: Pos, src: &str) -> Self {
        let mut lines = vec![0u32];
        for (i, b) in src.bytes().enumerate() {
            if b == b'\n' {
                lines.push(i as u32 + 1);
            }
        }
        SourceFile {
            name,
            base,
            size: src.len() as u32,
            lines,
        }
    }

    /// Reassemble a file from codec data. `lines` must be sorted and start
    /// at 0; [`FileSet::position`] relies on both.
    pub(crate) fn from_parts(name: EcoString, base: Pos, size: u32, lines: Vec<u32>) -> Self {
        SourceFile {
            name,
            base,
            size,
            lines,
        }
    }

    /// Whether `pos` falls inside this file's address range.
    pub fn contains(&self, pos: Pos) -> bool {
        pos >= self.base && pos <= self.base + self.size
    }

    /// The position one past the last byte of this file.
    pub fn end(&self) -> Pos {
        self.base + self.size
    }

    /// Line start offsets, file-relative.
    pub fn line_offsets(&self) -> &[u32] {
        &self.lines
    }

    /// Resolve a set-wide `pos` to a `Position` within this file.
    pub fn position(&self, pos: Pos) -> Position {
        debug_assert!(self.contains(pos), "position outside file");
        let offset = pos - self.base;
        let line_idx = match self.lines.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        Position {
            filename: self.name.clone(),
            offset,
            line: line_idx as u32 + 1,
            column: offset - self.lines[line_idx] + 1,
        }
    }
}

/// The set of files belonging to one compilation.
///
/// Files occupy disjoint, contiguous ranges of the position space; a file
/// registered after another starts one past the previous file's end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSet {
    files: Vec<SourceFile>,
}

impl FileSet {
    pub fn new() -> Self {
        FileSet::default()
    }

    /// Register a file and return a reference to it. The returned file's
    /// `base` is what the lexer adds to byte offsets to form positions.
    pub fn add_file(&mut self, name: impl Into<EcoString>, src: &str) -> &SourceFile {
        let base = self
            .files
            .last()
            .map(|f| f.end() + 1)
            .unwrap_or(1);
        self.files.push(SourceFile::new(name.into(), base, src));
        self.files.last().unwrap()
    }

    pub(crate) fn push_file(&mut self, file: SourceFile) {
        self.files.push(file);
    }

    pub fn files(&self) -> &[SourceFile] {
        &self.files
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// The file containing `pos`, if any.
    pub fn file_for(&self, pos: Pos) -> Option<&SourceFile> {
        if pos == NO_POS {
            return None;
        }
        self.files.iter().find(|f| f.contains(pos))
    }

    /// Resolve `pos` to a displayable position.
    pub fn position(&self, pos: Pos) -> Option<Position> {
        self.file_for(pos).map(|f| f.position(pos))
    }
}
