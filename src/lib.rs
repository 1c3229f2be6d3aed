//! A forgiving engine for locating and applying SEARCH/REPLACE edit blocks.
//!
//! `srpatch` applies the lenient SEARCH/REPLACE diff dialect that language
//! models emit when asked to edit a file:
//!
//! ```text
//! <<<<<<< SEARCH
//! count = 0
//! =======
//! counter = 0
//! >>>>>>> REPLACE
//! ```
//!
//! Models produce this dialect with wildly inconsistent formatting: missing
//! markers, markdown fences around the block, content glued onto the marker
//! line, lowercase keywords, irregular spacing. `srpatch` coerces all of that
//! into valid blocks (recording what it had to fix), then locates each block's
//! SEARCH content inside the target file with an exact-then-degrading fuzzy
//! strategy, and finally splices the replacements in. If any block cannot
//! be located at acceptable confidence, nothing is applied and the outcome
//! carries feedback precise enough for the model to retry.
//!
//! ## Getting Started
//!
//! The common path is a single call through [`EditSession`]:
//!
//! ```rust
//! use srpatch::{EditSession, SearchOptions};
//!
//! let original = "a\ncount = 0\nb";
//! let diff = "<<<<<<< SEARCH\ncount = 0\n=======\ncounter = 0\n>>>>>>> REPLACE";
//!
//! let session = EditSession::new(SearchOptions::default());
//! let outcome = session.apply_diff(diff, original);
//!
//! assert!(outcome.applied);
//! assert_eq!(outcome.new_content, "a\ncounter = 0\nb");
//! assert!(outcome.diff.is_some());
//! ```
//!
//! ## Key Concepts
//!
//! ### The Editing Workflow
//!
//! Using the library typically involves three steps, each usable on its own:
//!
//! 1. **Parsing:** [`DiffParser::parse`] turns the raw diff text into a
//!    `Vec<ParsedBlock>`, auto-repairing common malformations and collecting
//!    a [`ParsingIssue`] for every repair it made.
//! 2. **Locating:** [`BlockLocator::locate_all`] runs a shared
//!    [`SearchEngine`] over all blocks, producing one [`LocatedBlock`] per
//!    input block with a confidence-scored [`BlockLocationResult`].
//! 3. **Applying:** [`EditSession::apply_diff`] sequences the two steps and,
//!    with an all-or-nothing policy, splices every replacement into the file.
//!
//! ### Layered Matching
//!
//! A SEARCH block rarely matches the file byte-for-byte. Each search line is
//! compared to its candidate file line through a ladder of levels: raw
//! equality, whitespace-insensitive, normalized (smart quotes, typographic
//! characters, HTML entities), punctuation-insensitive, case-insensitive, and
//! finally Levenshtein similarity. Every window of the file gets an
//! averaged score and an overall [`BlockMatchKind`]. Exact matches
//! short-circuit the scan top to bottom, so the *first* exact occurrence
//! always wins; fuzzy candidates compete across the whole file.
//!
//! ### Duplicate Occurrences
//!
//! The engine owns a list of [`UsedRange`]s. Once a block claims a span of
//! the file, no later block in the same pass may overlap it, so a diff that
//! repeats the same SEARCH text twice maps its blocks to successive distinct
//! occurrences, in file order.
//!
//! ## Handling Failure
//!
//! When a block cannot be located, nothing is applied and the outcome carries
//! feedback with a best-guess excerpt the caller can round-trip to the model:
//!
//! ```rust
//! use srpatch::{EditSession, SearchOptions};
//!
//! let original = "alpha\nbeta";
//! let diff = "<<<<<<< SEARCH\nno such line anywhere\n=======\nreplacement\n>>>>>>> REPLACE";
//!
//! let session = EditSession::new(SearchOptions::default());
//! let outcome = session.apply_diff(diff, original);
//!
//! assert!(!outcome.applied);
//! assert_eq!(outcome.new_content, original);
//! assert!(outcome.feedback.unwrap().contains("<BESTMATCH>"));
//! ```
use log::{debug, info, trace, warn};
use similar::udiff::unified_diff;
use similar::Algorithm;
use std::fmt;
use std::time::SystemTime;
use thiserror::Error;

// --- Error Types ---

/// Structural errors encountered while parsing SEARCH/REPLACE diff text.
///
/// These are always fatal to the parse call: no partial block list is
/// returned and the caller must not attempt to apply anything. Recoverable
/// formatting problems are *not* errors; they are auto-corrected and recorded
/// as [`ParsingIssue`]s instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A new SEARCH marker appeared while the previous block was still open.
    #[error("Unexpected SEARCH marker on line {line}: the previous block is still open. Close it with `=======` and `>>>>>>> REPLACE` before starting a new block. If this line is literal file content, escape it as `\\<<<<<<< SEARCH`.")]
    UnexpectedSearchMarker { line: usize },
    /// A `=======` separator appeared outside of a search section.
    #[error("Unexpected `=======` separator on line {line}: no SEARCH section is open. Start a block with `<<<<<<< SEARCH` first. If this line is literal file content, escape it as `\\=======`.")]
    UnexpectedSeparator { line: usize },
    /// A REPLACE marker appeared before the block's `=======` separator.
    #[error("Unexpected REPLACE marker on line {line}: no `=======` separator was seen for the current block. If this line is literal file content, escape it as `\\>>>>>>> REPLACE`.")]
    UnexpectedReplaceMarker { line: usize },
    /// The diff text ended while a search section was still being collected.
    #[error("Incomplete SEARCH block: the diff ended before a `=======` separator was found.")]
    IncompleteSearchBlock,
    /// The diff text ended while a replace section was still being collected.
    #[error("Incomplete REPLACE block: the diff ended before a `>>>>>>> REPLACE` marker was found.")]
    IncompleteReplaceBlock,
    /// The diff text contained no usable blocks at all.
    #[error("No valid SEARCH/REPLACE blocks found in the diff text.")]
    NoBlocksFound,
}

// --- Data Structures ---

/// A category of difference detected between a search line and a file line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifferenceKind {
    /// The lines differ only in whitespace (leading, trailing, or internal).
    Whitespace,
    /// The lines differ only in letter case.
    Case,
    /// The lines differ in trailing or spacing-adjacent punctuation.
    Punctuation,
    /// The lines differ only in quote style (typographic vs ASCII quotes).
    QuoteStyle,
    /// The lines differ only in HTML entity escaping (`&amp;` vs `&`).
    HtmlEntities,
}

impl fmt::Display for DifferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DifferenceKind::Whitespace => "whitespace",
            DifferenceKind::Case => "case",
            DifferenceKind::Punctuation => "punctuation",
            DifferenceKind::QuoteStyle => "quote_style",
            DifferenceKind::HtmlEntities => "html_entities",
        };
        f.write_str(name)
    }
}

/// The level at which one search line matched one file line.
///
/// Levels are tested in declaration order by [`compare_lines`]; the first
/// level that succeeds wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineMatchKind {
    /// Byte-for-byte equality.
    Exact,
    /// Equal after trimming and collapsing runs of whitespace.
    ExactWhitespace,
    /// Equal after code-preserving normalization (quotes, typographic
    /// characters, HTML entities, whitespace).
    Normalized,
    /// Equal after additionally stripping trailing/spacing-adjacent
    /// punctuation.
    Punctuation,
    /// Equal after aggressive normalization including case folding.
    CaseInsensitive,
    /// Levenshtein similarity of the aggressively-normalized lines >= 0.85.
    FuzzyHigh,
    /// Levenshtein similarity >= 0.70.
    FuzzyMedium,
    /// Levenshtein similarity >= 0.50.
    FuzzyLow,
    /// Levenshtein similarity below 0.50.
    NoMatch,
}

impl fmt::Display for LineMatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LineMatchKind::Exact => "exact",
            LineMatchKind::ExactWhitespace => "exact_whitespace",
            LineMatchKind::Normalized => "normalized",
            LineMatchKind::Punctuation => "punctuation",
            LineMatchKind::CaseInsensitive => "case_insensitive",
            LineMatchKind::FuzzyHigh => "fuzzy_high",
            LineMatchKind::FuzzyMedium => "fuzzy_medium",
            LineMatchKind::FuzzyLow => "fuzzy_low",
            LineMatchKind::NoMatch => "no_match",
        };
        f.write_str(name)
    }
}

/// The overall quality classification of a matched window of file lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMatchKind {
    /// Every line in the window matched exactly.
    Exact,
    /// Every line matched exactly or up to whitespace.
    ExactWhitespace,
    /// Average per-line score >= 0.85.
    FuzzyHigh,
    /// Average per-line score >= 0.70.
    FuzzyMedium,
    /// Anything below that.
    FuzzyLow,
}

impl BlockMatchKind {
    /// Strict priority used when comparing candidate windows: a higher rank
    /// always beats a lower one regardless of raw score.
    pub fn rank(self) -> u8 {
        match self {
            BlockMatchKind::Exact => 4,
            BlockMatchKind::ExactWhitespace => 3,
            BlockMatchKind::FuzzyHigh => 2,
            BlockMatchKind::FuzzyMedium => 1,
            BlockMatchKind::FuzzyLow => 0,
        }
    }
}

impl fmt::Display for BlockMatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlockMatchKind::Exact => "exact",
            BlockMatchKind::ExactWhitespace => "exact_whitespace",
            BlockMatchKind::FuzzyHigh => "fuzzy_high",
            BlockMatchKind::FuzzyMedium => "fuzzy_medium",
            BlockMatchKind::FuzzyLow => "fuzzy_low",
        };
        f.write_str(name)
    }
}

/// The outcome of comparing a single search line against a single file line.
///
/// Returned by [`compare_lines`].
#[derive(Debug, Clone, PartialEq)]
pub struct LineComparison {
    /// The level at which the lines matched (or failed to).
    pub kind: LineMatchKind,
    /// Similarity score in `[0, 1]`. Fixed per level for the non-fuzzy
    /// levels; the raw Levenshtein similarity for the fuzzy ones.
    pub score: f64,
    /// The categories of difference detected between the two lines.
    pub differences: Vec<DifferenceKind>,
}

/// One SEARCH/REPLACE pair extracted from raw diff text.
///
/// Created by [`DiffParser::parse`]; immutable thereafter. An empty
/// `search_content` means "replace the whole file".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedBlock {
    /// The search section joined with `\n`. May be empty.
    pub search_content: String,
    /// The replace section joined with `\n`. May be empty (deletion).
    pub replace_content: String,
    /// The search section as ordered lines, exactly as written (no trimming).
    pub search_lines: Vec<String>,
    /// The replace section as ordered lines.
    pub replace_lines: Vec<String>,
    /// Stable per-parse identifier ("Block 1", "Block 2", ...), used to
    /// correlate feedback with the block that produced it.
    pub block_id: String,
}

/// The outcome of comparing one search line against one candidate file line,
/// with its absolute position in the file.
#[derive(Debug, Clone, PartialEq)]
pub struct LineMatchDetail {
    /// 1-based absolute line number in the file.
    pub line_number: usize,
    /// The search line as written in the block.
    pub search_line: String,
    /// The file line it was compared against.
    pub file_line: String,
    /// Similarity score in `[0, 1]`.
    pub score: f64,
    /// The match level reached.
    pub kind: LineMatchKind,
    /// Categories of difference between the two lines.
    pub differences: Vec<DifferenceKind>,
}

/// A span of file lines, 1-based and inclusive on both ends.
///
/// The [`SearchEngine`] records one of these for every range a block has
/// claimed, so that no two blocks of the same pass can overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsedRange {
    /// First line of the span (1-based).
    pub start_line: usize,
    /// Last line of the span (1-based, inclusive).
    pub end_line: usize,
}

impl UsedRange {
    /// Interval-overlap test on 1-based inclusive ranges.
    ///
    /// ```
    /// # use srpatch::UsedRange;
    /// let a = UsedRange { start_line: 3, end_line: 5 };
    /// let b = UsedRange { start_line: 5, end_line: 9 };
    /// let c = UsedRange { start_line: 6, end_line: 9 };
    /// assert!(a.overlaps(&b));
    /// assert!(!a.overlaps(&c));
    /// ```
    pub fn overlaps(&self, other: &UsedRange) -> bool {
        !(self.end_line < other.start_line || self.start_line > other.end_line)
    }
}

impl fmt::Display for UsedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lines {}-{}", self.start_line, self.end_line)
    }
}

/// The outcome of locating one [`ParsedBlock`]'s search lines in the file.
///
/// When `found` is `false`, `location` (if present) points at the best-guess
/// window the engine saw, so callers can show the model what *almost*
/// matched.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockLocationResult {
    /// Whether the block was located at acceptable confidence.
    pub found: bool,
    /// The matched range when found, or the best-guess range when not.
    pub location: Option<UsedRange>,
    /// Average per-line similarity score of the (best) window.
    pub score: f64,
    /// Overall classification of the (best) window.
    pub match_kind: BlockMatchKind,
    /// `floor(score * 100)`.
    pub confidence: u32,
    /// The actual file content at the matched or best-guess location.
    pub found_content: String,
    /// Same content, as lines.
    pub found_lines: Vec<String>,
    /// One entry per search line, in order.
    pub line_details: Vec<LineMatchDetail>,
    /// Present when the block was not found.
    pub error: Option<String>,
}

/// A [`ParsedBlock`] joined with its [`BlockLocationResult`].
///
/// After a successful [`EditSession::apply_diff`], `applied_start_line` /
/// `applied_end_line` mark where the replacement text lives in the new
/// content, after all prior blocks' line-count deltas have shifted it. They
/// remain `None` for pure deletions and for blocks that were never applied.
#[derive(Debug, Clone, PartialEq)]
pub struct LocatedBlock {
    /// The parsed block.
    pub block: ParsedBlock,
    /// Where (and how well) its search lines matched the file.
    pub result: BlockLocationResult,
    /// 1-based first line of the replacement in the new content.
    pub applied_start_line: Option<usize>,
    /// 1-based last line of the replacement in the new content.
    pub applied_end_line: Option<usize>,
}

// --- String Similarity ---

/// Toggles for the individual steps of [`normalize`].
///
/// The default corresponds to [`normalize_for_code`]: everything on except
/// case folding.
#[derive(Debug, Clone, Copy)]
pub struct NormalizeOptions {
    /// Fold typographic quotes to ASCII (`“` -> `"`, `’` -> `'`).
    pub smart_quotes: bool,
    /// Fold other typographic characters (ellipsis, en/em dash,
    /// non-breaking space).
    pub typographic: bool,
    /// Unescape common HTML entities (`&amp;`, `&lt;`, ...).
    pub html_entities: bool,
    /// Collapse every run of whitespace to a single space.
    pub collapse_whitespace: bool,
    /// Lowercase the result.
    pub lowercase: bool,
    /// Trim leading and trailing whitespace.
    pub trim: bool,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            smart_quotes: true,
            typographic: true,
            html_entities: true,
            collapse_whitespace: true,
            lowercase: false,
            trim: true,
        }
    }
}

/// Folds typographic quote characters to their ASCII equivalents.
fn fold_smart_quotes(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{2032}' => '\'',
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{2033}' => '"',
            other => other,
        })
        .collect()
}

/// Folds other typographic characters: ellipsis, en/em dash, non-breaking
/// space.
fn fold_typographic(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\u{2026}' => out.push_str("..."),
            '\u{2013}' | '\u{2014}' => out.push('-'),
            '\u{00A0}' => out.push(' '),
            other => out.push(other),
        }
    }
    out
}

/// Unescapes the HTML entities models commonly leak into code.
///
/// `&amp;` must be handled last so that `&amp;lt;` decodes to `&lt;` and not
/// to `<`.
fn unescape_html_entities(input: &str) -> String {
    input
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// Collapses every run of whitespace to a single ASCII space. Does not trim.
fn collapse_whitespace(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_run = false;
    for c in input.chars() {
        if c.is_whitespace() {
            if !in_run {
                out.push(' ');
                in_run = true;
            }
        } else {
            out.push(c);
            in_run = false;
        }
    }
    out
}

/// Applies the enabled normalization steps, in a fixed order: smart quotes,
/// typographic characters, HTML entities, whitespace collapsing, lowercasing,
/// trimming.
///
/// Total function; never fails.
///
/// ```
/// # use srpatch::{normalize, NormalizeOptions};
/// let options = NormalizeOptions::default();
/// assert_eq!(normalize("don\u{2019}t  stop", &options), "don't stop");
/// assert_eq!(normalize("a &amp;&amp; b", &options), "a && b");
/// ```
pub fn normalize(input: &str, options: &NormalizeOptions) -> String {
    let mut s = input.to_string();
    if options.smart_quotes {
        s = fold_smart_quotes(&s);
    }
    if options.typographic {
        s = fold_typographic(&s);
    }
    if options.html_entities {
        s = unescape_html_entities(&s);
    }
    if options.collapse_whitespace {
        s = collapse_whitespace(&s);
    }
    if options.lowercase {
        s = s.to_lowercase();
    }
    if options.trim {
        s = s.trim().to_string();
    }
    s
}

/// Normalization with case preserved, the baseline for "is this really the
/// same code" checks.
pub fn normalize_for_code(input: &str) -> String {
    normalize(input, &NormalizeOptions::default())
}

/// Normalization with case folded, the last-resort fuzzy comparison base.
pub fn normalize_aggressive(input: &str) -> String {
    normalize(
        input,
        &NormalizeOptions {
            lowercase: true,
            ..NormalizeOptions::default()
        },
    )
}

/// Trims trailing commas and semicolons and collapses whitespace immediately
/// around `, ; ( ) [ ] { }`.
///
/// ```
/// # use srpatch::normalize_punctuation;
/// assert_eq!(normalize_punctuation("foo( a , b );"), "foo(a,b)");
/// ```
pub fn normalize_punctuation(line: &str) -> String {
    const PUNCT: &[char] = &[',', ';', '(', ')', '[', ']', '{', '}'];

    let trimmed = line.trim_end().trim_end_matches([',', ';']).trim_end();
    let mut out = String::with_capacity(trimmed.len());
    let mut chars = trimmed.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_whitespace() {
            // Swallow the rest of the run, then decide whether a single
            // space survives: not next to one of the punctuation chars, and
            // not at the end of the line.
            while chars.peek().is_some_and(|n| n.is_whitespace()) {
                chars.next();
            }
            let prev_is_punct = out.chars().last().is_some_and(|p| PUNCT.contains(&p));
            let next_is_punct = chars.peek().is_some_and(|n| PUNCT.contains(n));
            if !prev_is_punct && !next_is_punct && chars.peek().is_some() {
                out.push(' ');
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Classic dynamic-programming edit distance over characters (not graphemes).
///
/// ```
/// # use srpatch::levenshtein_distance;
/// assert_eq!(levenshtein_distance("kitten", "sitting"), 3);
/// assert_eq!(levenshtein_distance("same", "same"), 0);
/// assert_eq!(levenshtein_distance("", "abc"), 3);
/// ```
pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    if a == b {
        return 0;
    }
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    if a_chars.is_empty() {
        return b_chars.len();
    }
    if b_chars.is_empty() {
        return a_chars.len();
    }

    // Two-row formulation; prev holds row i, curr is being filled for i+1.
    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr: Vec<usize> = vec![0; b_chars.len() + 1];
    for (i, &ca) in a_chars.iter().enumerate() {
        curr[0] = i + 1;
        for (j, &cb) in b_chars.iter().enumerate() {
            let substitution_cost = if ca == cb { 0 } else { 1 };
            curr[j + 1] = (prev[j + 1] + 1)
                .min(curr[j] + 1)
                .min(prev[j] + substitution_cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_chars.len()]
}

/// Normalized similarity: `1 - distance / max(len(a), len(b))`.
///
/// Identical strings (including two empty strings) short-circuit to `1.0`
/// before any distance is computed; one empty string against a nonempty one
/// scores `0.0`.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let max_len = a.chars().count().max(b.chars().count());
    let distance = levenshtein_distance(a, b);
    1.0 - distance as f64 / max_len as f64
}

/// Detects which categories of difference separate two unequal lines.
///
/// Each check is independent: the lines are re-compared under a single
/// transformation, and if that alone makes them equal, the category is
/// recorded. Several categories can co-occur.
fn detect_differences(line1: &str, line2: &str) -> Vec<DifferenceKind> {
    let mut differences = Vec::new();
    if line1 == line2 {
        return differences;
    }
    if fold_smart_quotes(line1) == fold_smart_quotes(line2) {
        differences.push(DifferenceKind::QuoteStyle);
    }
    if collapse_whitespace(line1.trim()) == collapse_whitespace(line2.trim()) {
        differences.push(DifferenceKind::Whitespace);
    }
    if line1.to_lowercase() == line2.to_lowercase() {
        differences.push(DifferenceKind::Case);
    }
    if unescape_html_entities(line1) == unescape_html_entities(line2) {
        differences.push(DifferenceKind::HtmlEntities);
    }
    differences
}

/// Compares two lines through the full level ladder, stopping at the first
/// level that succeeds.
///
/// ```
/// # use srpatch::{compare_lines, LineMatchKind};
/// assert_eq!(compare_lines("foo", "foo").kind, LineMatchKind::Exact);
///
/// let cmp = compare_lines("  count =  0 ", "count = 0");
/// assert_eq!(cmp.kind, LineMatchKind::ExactWhitespace);
/// assert_eq!(cmp.score, 0.99);
/// ```
pub fn compare_lines(line1: &str, line2: &str) -> LineComparison {
    // Level 1: raw equality.
    if line1 == line2 {
        return LineComparison {
            kind: LineMatchKind::Exact,
            score: 1.0,
            differences: Vec::new(),
        };
    }

    // Level 2: trim + collapse whitespace.
    if collapse_whitespace(line1.trim()) == collapse_whitespace(line2.trim()) {
        return LineComparison {
            kind: LineMatchKind::ExactWhitespace,
            score: 0.99,
            differences: vec![DifferenceKind::Whitespace],
        };
    }

    let mut differences = detect_differences(line1, line2);

    // Level 3: code-preserving normalization.
    let code1 = normalize_for_code(line1);
    let code2 = normalize_for_code(line2);
    if code1 == code2 {
        return LineComparison {
            kind: LineMatchKind::Normalized,
            score: 0.98,
            differences,
        };
    }

    // Level 4: additionally punctuation-insensitive.
    if normalize_punctuation(&code1) == normalize_punctuation(&code2) {
        differences.push(DifferenceKind::Punctuation);
        return LineComparison {
            kind: LineMatchKind::Punctuation,
            score: 0.95,
            differences,
        };
    }

    // Level 5: aggressive normalization with case folding.
    let aggressive1 = normalize_aggressive(line1);
    let aggressive2 = normalize_aggressive(line2);
    if aggressive1 == aggressive2 {
        if !differences.contains(&DifferenceKind::Case) {
            differences.push(DifferenceKind::Case);
        }
        return LineComparison {
            kind: LineMatchKind::CaseInsensitive,
            score: 0.90,
            differences,
        };
    }

    // Level 6: Levenshtein similarity on the aggressively-normalized lines.
    let score = similarity(&aggressive1, &aggressive2);
    let kind = if score >= 0.85 {
        LineMatchKind::FuzzyHigh
    } else if score >= 0.70 {
        LineMatchKind::FuzzyMedium
    } else if score >= 0.50 {
        LineMatchKind::FuzzyLow
    } else {
        LineMatchKind::NoMatch
    };
    LineComparison {
        kind,
        score,
        differences,
    }
}

// --- Issue Tracking ---

/// How serious a recorded formatting issue is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        f.write_str(name)
    }
}

/// The kinds of malformation the parser knows how to repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueKind {
    /// No recognizable `<<<<<<< SEARCH` marker anywhere in the diff.
    MalformedSearchMarker,
    /// A markdown code fence wrapped the diff text.
    MarkdownNoise,
    /// A marker line with no space before its keyword (`<<<<<<<SEARCH`).
    MissingSpacesInMarkers,
    /// A marker line with two or more spaces before its keyword.
    ExtraSpacesInMarkers,
    /// A marker keyword written in the wrong case (`<<<<<<< search`).
    CaseMismatchMarkers,
    /// Block content glued onto a marker line.
    ContentOnMarkerLine,
    /// A stray `>` after the SEARCH keyword, an artifact some models emit.
    ClaudeMarkerIssue,
}

impl IssueKind {
    /// The stable machine-readable code for this issue kind.
    pub fn code(self) -> &'static str {
        match self {
            IssueKind::MalformedSearchMarker => "MALFORMED_SEARCH_MARKER",
            IssueKind::MarkdownNoise => "MARKDOWN_NOISE",
            IssueKind::MissingSpacesInMarkers => "MISSING_SPACES_IN_MARKERS",
            IssueKind::ExtraSpacesInMarkers => "EXTRA_SPACES_IN_MARKERS",
            IssueKind::CaseMismatchMarkers => "CASE_MISMATCH_MARKERS",
            IssueKind::ContentOnMarkerLine => "CONTENT_ON_MARKER_LINE",
            IssueKind::ClaudeMarkerIssue => "CLAUDE_MARKER_ISSUE",
        }
    }

    /// Resolves the kind into its reporting fields. Some arms are static
    /// records, others compute their description from the recorded details.
    fn meta(self, details: &str) -> (Severity, String, String, String) {
        match self {
            IssueKind::MalformedSearchMarker => (
                Severity::Error,
                "The diff contained no recognizable `<<<<<<< SEARCH` marker.".to_string(),
                "Synthesized an opening SEARCH marker at the top of the diff.".to_string(),
                "Always start each block with `<<<<<<< SEARCH` on its own line.".to_string(),
            ),
            IssueKind::MarkdownNoise => (
                Severity::Info,
                format!("A markdown code fence surrounded the diff: `{}`.", details),
                "Kept the fence out of the block body.".to_string(),
                "Emit raw SEARCH/REPLACE blocks without surrounding markdown fences.".to_string(),
            ),
            IssueKind::MissingSpacesInMarkers => (
                Severity::Warning,
                format!("Marker line has no space before its keyword: `{}`.", details),
                "Accepted the marker anyway.".to_string(),
                "Write markers with a single space before the keyword, e.g. `<<<<<<< SEARCH`."
                    .to_string(),
            ),
            IssueKind::ExtraSpacesInMarkers => (
                Severity::Info,
                format!("Marker line has extra spaces before its keyword: `{}`.", details),
                "Accepted the marker anyway.".to_string(),
                "Write markers with a single space before the keyword, e.g. `<<<<<<< SEARCH`."
                    .to_string(),
            ),
            IssueKind::CaseMismatchMarkers => (
                Severity::Warning,
                format!("Marker keyword is not uppercase: `{}`.", details),
                "Matched the keyword case-insensitively.".to_string(),
                "Write the SEARCH and REPLACE keywords in uppercase.".to_string(),
            ),
            IssueKind::ContentOnMarkerLine => (
                Severity::Warning,
                format!("Content found on a marker line: `{}`.", details),
                "Moved the trailing content into the block body.".to_string(),
                "Put block content on its own lines, never on the marker line.".to_string(),
            ),
            IssueKind::ClaudeMarkerIssue => (
                Severity::Warning,
                format!("Marker line carries a stray `>` artifact: `{}`.", details),
                "Stripped the leading `>` and kept the remainder as content.".to_string(),
                "Do not append `>` sequences after the SEARCH keyword.".to_string(),
            ),
        }
    }
}

/// One recorded parsing/formatting issue, fully resolved for reporting.
#[derive(Debug, Clone)]
pub struct ParsingIssue {
    /// What went wrong.
    pub kind: IssueKind,
    /// The offending line (or other context) as seen in the input.
    pub details: String,
    /// When the issue was recorded.
    pub timestamp: SystemTime,
    /// How serious it is.
    pub severity: Severity,
    /// Human-readable description.
    pub description: String,
    /// The auto-correction that was applied.
    pub fix: String,
    /// Forward-looking guidance for the block author (usually an LLM).
    pub llm_guidance: String,
}

/// Accumulates the issues encountered while coercing malformed diff text
/// into valid syntax.
///
/// Instance-scoped: each [`DiffParser`] owns one, cleared at the start of
/// every parse call. Never a process-wide singleton.
#[derive(Debug, Default)]
pub struct IssueTracker {
    issues: Vec<ParsingIssue>,
}

impl IssueTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one issue, resolving its reporting fields from the kind.
    pub fn record(&mut self, kind: IssueKind, details: impl Into<String>) {
        let details = details.into();
        let (severity, description, fix, llm_guidance) = kind.meta(&details);
        debug!("diff format issue {}: {}", kind.code(), description);
        self.issues.push(ParsingIssue {
            kind,
            details,
            timestamp: SystemTime::now(),
            severity,
            description,
            fix,
            llm_guidance,
        });
    }

    pub fn has_issues(&self) -> bool {
        !self.issues.is_empty()
    }

    pub fn clear(&mut self) {
        self.issues.clear();
    }

    /// The recorded issues, in recording order.
    pub fn issues(&self) -> &[ParsingIssue] {
        &self.issues
    }

    /// Renders a multi-paragraph report of every recorded issue, or `None`
    /// when the parse was clean.
    pub fn feedback(&self) -> Option<String> {
        if self.issues.is_empty() {
            return None;
        }
        let mut out =
            String::from("### Diff Format Issues\n\nThe diff was auto-corrected before parsing:\n");
        for issue in &self.issues {
            out.push_str(&format!(
                "\n- **{}** `{}`: {}\n  - Fix applied: {}\n  - Guidance: {}\n",
                issue.severity,
                issue.kind.code(),
                issue.description,
                issue.fix,
                issue.llm_guidance,
            ));
        }
        Some(out)
    }
}

// --- Diff Parser ---

/// Parser state while walking the diff text line by line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    Waiting,
    Searching,
    Replacing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkerKind {
    Search,
    Separator,
    Replace,
}

#[derive(Debug)]
struct RecognizedMarker {
    kind: MarkerKind,
    /// Content trailing the keyword on the marker line, if any.
    inline: Option<String>,
    /// Formatting irregularities to report for this marker line.
    irregularities: Vec<IssueKind>,
}

/// Classifies a line as a marker, tolerantly.
///
/// SEARCH is `<{5,}`, REPLACE is `>{5,}`, each followed by optional spaces,
/// the case-insensitive keyword, and optional trailing content. The
/// separator is exactly `=======` plus optional trailing whitespace.
fn recognize_marker(line: &str) -> Option<RecognizedMarker> {
    if line.trim_end() == "=======" {
        return Some(RecognizedMarker {
            kind: MarkerKind::Separator,
            inline: None,
            irregularities: Vec::new(),
        });
    }
    if let Some((inline, irregularities)) = recognize_keyword_marker(line, '<', "SEARCH") {
        return Some(RecognizedMarker {
            kind: MarkerKind::Search,
            inline,
            irregularities,
        });
    }
    if let Some((inline, irregularities)) = recognize_keyword_marker(line, '>', "REPLACE") {
        return Some(RecognizedMarker {
            kind: MarkerKind::Replace,
            inline,
            irregularities,
        });
    }
    None
}

fn recognize_keyword_marker(
    line: &str,
    delimiter: char,
    keyword: &str,
) -> Option<(Option<String>, Vec<IssueKind>)> {
    let delimiter_count = line.chars().take_while(|&c| c == delimiter).count();
    if delimiter_count < 5 {
        return None;
    }
    // The delimiter and keyword are ASCII, so byte indexing is safe here.
    let rest = &line[delimiter_count..];
    let space_count = rest.chars().take_while(|&c| c == ' ').count();
    let after = &rest[space_count..];
    let written = after.get(..keyword.len())?;
    if !written.eq_ignore_ascii_case(keyword) {
        return None;
    }

    let mut irregularities = Vec::new();
    if space_count == 0 {
        irregularities.push(IssueKind::MissingSpacesInMarkers);
    } else if space_count >= 2 {
        irregularities.push(IssueKind::ExtraSpacesInMarkers);
    }
    if written != keyword {
        irregularities.push(IssueKind::CaseMismatchMarkers);
    }

    let trailing = after[keyword.len()..].trim_start();
    let inline = if trailing.is_empty() {
        None
    } else {
        Some(trailing.to_string())
    };
    Some((inline, irregularities))
}

/// Strips the escaping backslash from body lines that carry literal marker
/// syntax (`\<<<<<`, `\=====`, `\>>>>>`).
fn unescape_body_line(line: &str) -> String {
    if let Some(rest) = line.strip_prefix('\\') {
        if rest.starts_with("<<<<<") || rest.starts_with("=====") || rest.starts_with(">>>>>") {
            return rest.to_string();
        }
    }
    line.to_string()
}

/// Tokenizes raw diff text into an ordered sequence of SEARCH/REPLACE block
/// pairs, auto-repairing common malformations.
///
/// The parser owns an [`IssueTracker`] that is cleared at the start of every
/// [`parse`](Self::parse) call; inspect it through
/// [`has_issues`](Self::has_issues) and [`feedback`](Self::feedback) after
/// parsing.
///
/// ```
/// # use srpatch::DiffParser;
/// let mut parser = DiffParser::new();
/// let blocks = parser
///     .parse("<<<<<<< SEARCH\ncount = 0\n=======\ncounter = 0\n>>>>>>> REPLACE")
///     .unwrap();
/// assert_eq!(blocks.len(), 1);
/// assert_eq!(blocks[0].search_content, "count = 0");
/// assert_eq!(blocks[0].replace_content, "counter = 0");
/// assert!(!parser.has_issues());
/// ```
#[derive(Debug, Default)]
pub struct DiffParser {
    issues: IssueTracker,
}

impl DiffParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `diff_text` into blocks.
    ///
    /// Recoverable malformations (spacing/case variants, markdown fences,
    /// inline marker content, a missing opening marker) are repaired in
    /// place and recorded; structural violations abort with a [`ParseError`]
    /// and no block list.
    pub fn parse(&mut self, diff_text: &str) -> Result<Vec<ParsedBlock>, ParseError> {
        self.issues.clear();

        let text = diff_text.replace("\r\n", "\n").replace('\r', "\n");
        let mut lines: Vec<String> = text.split('\n').map(String::from).collect();

        // Repair pass: if the model forgot the opening marker entirely,
        // synthesize one (after a leading markdown fence if present).
        let has_search_marker = lines
            .iter()
            .any(|l| matches!(recognize_marker(l), Some(m) if m.kind == MarkerKind::Search));
        if !has_search_marker {
            self.issues.record(
                IssueKind::MalformedSearchMarker,
                lines.first().cloned().unwrap_or_default(),
            );
            let insert_at = if lines.first().is_some_and(|l| l.starts_with("```")) {
                self.issues.record(IssueKind::MarkdownNoise, lines[0].clone());
                1
            } else {
                0
            };
            lines.insert(insert_at, "<<<<<<< SEARCH".to_string());
        }

        let mut state = ParserState::Waiting;
        let mut search_acc: Vec<String> = Vec::new();
        let mut replace_acc: Vec<String> = Vec::new();
        let mut blocks: Vec<ParsedBlock> = Vec::new();

        for (index, line) in lines.iter().enumerate() {
            let line_number = index + 1;
            let Some(marker) = recognize_marker(line) else {
                match state {
                    // Prose between blocks is ignored.
                    ParserState::Waiting => {}
                    ParserState::Searching => search_acc.push(unescape_body_line(line)),
                    ParserState::Replacing => replace_acc.push(unescape_body_line(line)),
                }
                continue;
            };

            match marker.kind {
                MarkerKind::Search => {
                    if state != ParserState::Waiting {
                        return Err(ParseError::UnexpectedSearchMarker { line: line_number });
                    }
                    for kind in &marker.irregularities {
                        self.issues.record(*kind, line.clone());
                    }
                    if let Some(inline) = marker.inline {
                        if let Some(stripped) = inline.strip_prefix('>') {
                            // Known artifact: some models emit `<<<<<<< SEARCH >file`.
                            self.issues.record(IssueKind::ClaudeMarkerIssue, line.clone());
                            let remainder = stripped.trim_start();
                            if !remainder.is_empty() {
                                search_acc.push(remainder.to_string());
                            }
                        } else {
                            self.issues.record(IssueKind::ContentOnMarkerLine, line.clone());
                            search_acc.push(inline);
                        }
                    }
                    state = ParserState::Searching;
                }
                MarkerKind::Separator => {
                    if state != ParserState::Searching {
                        return Err(ParseError::UnexpectedSeparator { line: line_number });
                    }
                    state = ParserState::Replacing;
                }
                MarkerKind::Replace => {
                    if state != ParserState::Replacing {
                        return Err(ParseError::UnexpectedReplaceMarker { line: line_number });
                    }
                    for kind in &marker.irregularities {
                        self.issues.record(*kind, line.clone());
                    }
                    if let Some(inline) = marker.inline {
                        self.issues.record(IssueKind::ContentOnMarkerLine, line.clone());
                        // Inline content leads the replace body, it does not
                        // trail it.
                        replace_acc.insert(0, inline);
                    }

                    let search_content = search_acc.join("\n");
                    let replace_content = replace_acc.join("\n");
                    if search_content.is_empty() && replace_content.is_empty() {
                        trace!("skipping empty block ending on line {}", line_number);
                        search_acc.clear();
                        replace_acc.clear();
                    } else {
                        let block_id = format!("Block {}", blocks.len() + 1);
                        debug!(
                            "parsed {}: {} search line(s), {} replace line(s)",
                            block_id,
                            search_acc.len(),
                            replace_acc.len()
                        );
                        blocks.push(ParsedBlock {
                            search_content,
                            replace_content,
                            search_lines: std::mem::take(&mut search_acc),
                            replace_lines: std::mem::take(&mut replace_acc),
                            block_id,
                        });
                    }
                    state = ParserState::Waiting;
                }
            }
        }

        match state {
            ParserState::Searching if !search_acc.join("\n").is_empty() => {
                return Err(ParseError::IncompleteSearchBlock);
            }
            ParserState::Replacing => return Err(ParseError::IncompleteReplaceBlock),
            _ => {}
        }
        if blocks.is_empty() {
            return Err(ParseError::NoBlocksFound);
        }
        Ok(blocks)
    }

    /// Whether the last parse recorded any formatting issues.
    pub fn has_issues(&self) -> bool {
        self.issues.has_issues()
    }

    /// Clears the recorded issues.
    pub fn clear_issues(&mut self) {
        self.issues.clear();
    }

    /// The issues recorded by the last parse.
    pub fn issues(&self) -> &[ParsingIssue] {
        self.issues.issues()
    }

    /// A rendered report of the last parse's issues, or `None` if clean.
    pub fn feedback(&self) -> Option<String> {
        self.issues.feedback()
    }
}

// --- Search Engine ---

/// Configuration for the block-location search.
#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    /// Minimum average window score for a fuzzy match to be accepted
    /// (exact and whitespace-exact matches ignore this).
    pub fuzzy_threshold: f64,
    /// Disable to accept only exact and whitespace-exact matches.
    pub enable_fuzzy_matching: bool,
    /// Hard cap on the number of candidate windows evaluated per block.
    pub max_search_iterations: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.8,
            enable_fuzzy_matching: true,
            max_search_iterations: 10_000,
        }
    }
}

impl SearchOptions {
    /// Creates a new builder for `SearchOptions`.
    ///
    /// # Example
    ///
    /// ```
    /// # use srpatch::SearchOptions;
    /// let options = SearchOptions::builder()
    ///     .fuzzy_threshold(0.9)
    ///     .enable_fuzzy_matching(false)
    ///     .build();
    ///
    /// assert_eq!(options.fuzzy_threshold, 0.9);
    /// assert!(!options.enable_fuzzy_matching);
    /// ```
    pub fn builder() -> SearchOptionsBuilder {
        SearchOptionsBuilder::default()
    }
}

/// A builder for creating `SearchOptions`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchOptionsBuilder {
    fuzzy_threshold: Option<f64>,
    enable_fuzzy_matching: Option<bool>,
    max_search_iterations: Option<usize>,
}

impl SearchOptionsBuilder {
    /// Sets the minimum average score for a fuzzy match to be accepted.
    pub fn fuzzy_threshold(mut self, fuzzy_threshold: f64) -> Self {
        self.fuzzy_threshold = Some(fuzzy_threshold);
        self
    }

    /// Enables or disables fuzzy matching entirely.
    pub fn enable_fuzzy_matching(mut self, enable: bool) -> Self {
        self.enable_fuzzy_matching = Some(enable);
        self
    }

    /// Caps the number of candidate windows evaluated per block.
    pub fn max_search_iterations(mut self, max: usize) -> Self {
        self.max_search_iterations = Some(max);
        self
    }

    /// Builds the `SearchOptions`.
    pub fn build(self) -> SearchOptions {
        let default = SearchOptions::default();
        SearchOptions {
            fuzzy_threshold: self.fuzzy_threshold.unwrap_or(default.fuzzy_threshold),
            enable_fuzzy_matching: self
                .enable_fuzzy_matching
                .unwrap_or(default.enable_fuzzy_matching),
            max_search_iterations: self
                .max_search_iterations
                .unwrap_or(default.max_search_iterations),
        }
    }
}

/// A scored candidate window produced during the scan.
struct WindowCandidate {
    start_index: usize,
    kind: BlockMatchKind,
    score: f64,
    details: Vec<LineMatchDetail>,
}

/// Locates SEARCH blocks inside a file's lines.
///
/// One engine instance serves all blocks of one file pass: the engine
/// remembers every range it has handed out in `used_ranges`, so a diff that
/// repeats the same SEARCH text maps its blocks to successive distinct
/// occurrences. Call [`reset`](Self::reset) (or build a fresh engine) before
/// reusing it for another file; instances must not be shared across
/// concurrently running sessions.
///
/// ```
/// # use srpatch::{SearchEngine, SearchOptions};
/// let mut engine = SearchEngine::new(SearchOptions::default());
/// let file = ["a", "count = 0", "b"];
///
/// let result = engine.locate(&["count = 0"], &file);
/// assert!(result.found);
/// assert_eq!(result.location.unwrap().start_line, 2);
/// assert_eq!(result.confidence, 100);
/// ```
#[derive(Debug)]
pub struct SearchEngine {
    used_ranges: Vec<UsedRange>,
    options: SearchOptions,
}

impl SearchEngine {
    pub fn new(options: SearchOptions) -> Self {
        Self {
            used_ranges: Vec::new(),
            options,
        }
    }

    /// Forgets all claimed ranges, readying the engine for a new file.
    pub fn reset(&mut self) {
        self.used_ranges.clear();
    }

    /// The ranges claimed so far, in acceptance order.
    pub fn used_ranges(&self) -> &[UsedRange] {
        &self.used_ranges
    }

    /// Finds the best location of `search_lines` within `file_lines`.
    ///
    /// A single top-to-bottom scan over every start offset, skipping offsets
    /// that overlap an already-claimed range. The first exact window wins
    /// outright; non-exact candidates compete across the whole file by match
    /// kind first and score second. An accepted match claims its range.
    pub fn locate<S, T>(&mut self, search_lines: &[S], file_lines: &[T]) -> BlockLocationResult
    where
        S: AsRef<str>,
        T: AsRef<str>,
    {
        let search_len = search_lines.len();
        let total = file_lines.len();

        if search_len == 0 {
            // Empty search means "replace the entire file". The whole-file
            // range is claimed like any other accepted match, so nothing
            // else can land inside it.
            trace!("empty search block, claiming the whole file ({} lines)", total);
            let range = UsedRange {
                start_line: 1,
                end_line: total.max(1),
            };
            self.used_ranges.push(range);
            let found_lines: Vec<String> =
                file_lines.iter().map(|l| l.as_ref().to_string()).collect();
            return BlockLocationResult {
                found: true,
                location: Some(range),
                score: 1.0,
                match_kind: BlockMatchKind::Exact,
                confidence: 100,
                found_content: found_lines.join("\n"),
                found_lines,
                line_details: Vec::new(),
                error: None,
            };
        }

        if total < search_len {
            return BlockLocationResult {
                found: false,
                location: None,
                score: 0.0,
                match_kind: BlockMatchKind::FuzzyLow,
                confidence: 0,
                found_content: String::new(),
                found_lines: Vec::new(),
                line_details: Vec::new(),
                error: Some(format!(
                    "search block is longer than the file ({} search lines vs {} file lines)",
                    search_len, total
                )),
            };
        }

        let mut best: Option<WindowCandidate> = None;
        let mut evaluated = 0usize;

        for start_index in 0..=(total - search_len) {
            let range = UsedRange {
                start_line: start_index + 1,
                end_line: start_index + search_len,
            };
            if self.used_ranges.iter().any(|used| used.overlaps(&range)) {
                continue;
            }
            if evaluated >= self.options.max_search_iterations {
                debug!(
                    "search stopped after {} candidate windows (iteration cap)",
                    evaluated
                );
                break;
            }
            evaluated += 1;

            let candidate = Self::evaluate_window(search_lines, file_lines, start_index);
            if candidate.kind == BlockMatchKind::Exact {
                // First exact occurrence wins outright; it is never
                // out-competed by a later exact or fuzzy window.
                trace!("exact match at {}", range);
                best = Some(candidate);
                break;
            }
            let replaces = match &best {
                None => true,
                Some(current) => {
                    candidate.kind.rank() > current.kind.rank()
                        || (candidate.kind.rank() == current.kind.rank()
                            && candidate.score >= current.score)
                }
            };
            if replaces {
                trace!(
                    "new best candidate at {} ({}, score {:.3})",
                    range,
                    candidate.kind,
                    candidate.score
                );
                best = Some(candidate);
            }
        }

        let Some(candidate) = best else {
            return BlockLocationResult {
                found: false,
                location: None,
                score: 0.0,
                match_kind: BlockMatchKind::FuzzyLow,
                confidence: 0,
                found_content: String::new(),
                found_lines: Vec::new(),
                line_details: Vec::new(),
                error: Some(
                    "no candidate window was available (every eligible range is already claimed by an earlier block)"
                        .to_string(),
                ),
            };
        };

        let range = UsedRange {
            start_line: candidate.start_index + 1,
            end_line: candidate.start_index + search_len,
        };
        let found_lines: Vec<String> = file_lines
            [candidate.start_index..candidate.start_index + search_len]
            .iter()
            .map(|l| l.as_ref().to_string())
            .collect();
        let found_content = found_lines.join("\n");
        let confidence = (candidate.score * 100.0).floor() as u32;

        let accepted = matches!(
            candidate.kind,
            BlockMatchKind::Exact | BlockMatchKind::ExactWhitespace
        ) || (self.options.enable_fuzzy_matching
            && candidate.score >= self.options.fuzzy_threshold);

        if accepted {
            debug!(
                "accepted {} match at {} (confidence {}%)",
                candidate.kind, range, confidence
            );
            self.used_ranges.push(range);
            BlockLocationResult {
                found: true,
                location: Some(range),
                score: candidate.score,
                match_kind: candidate.kind,
                confidence,
                found_content,
                found_lines,
                line_details: candidate.details,
                error: None,
            }
        } else {
            debug!(
                "rejected best candidate at {} ({}, score {:.3}, threshold {:.2})",
                range, candidate.kind, candidate.score, self.options.fuzzy_threshold
            );
            BlockLocationResult {
                found: false,
                location: Some(range),
                score: candidate.score,
                match_kind: candidate.kind,
                confidence,
                found_content,
                found_lines,
                line_details: candidate.details,
                error: Some(format!(
                    "no acceptable match: best candidate at {} scored {:.2} ({}), below the fuzzy threshold {:.2}",
                    range, candidate.score, candidate.kind, self.options.fuzzy_threshold
                )),
            }
        }
    }

    /// Scores one window: per-line comparisons, averaged, plus the overall
    /// kind classification.
    fn evaluate_window<S, T>(
        search_lines: &[S],
        file_lines: &[T],
        start_index: usize,
    ) -> WindowCandidate
    where
        S: AsRef<str>,
        T: AsRef<str>,
    {
        let mut details = Vec::with_capacity(search_lines.len());
        let mut score_sum = 0.0;
        let mut all_exact = true;
        let mut all_whitespace_exact = true;

        for (offset, search_line) in search_lines.iter().enumerate() {
            let file_line = file_lines[start_index + offset].as_ref();
            let comparison = compare_lines(search_line.as_ref(), file_line);
            score_sum += comparison.score;
            if comparison.kind != LineMatchKind::Exact {
                all_exact = false;
            }
            if !matches!(
                comparison.kind,
                LineMatchKind::Exact | LineMatchKind::ExactWhitespace
            ) {
                all_whitespace_exact = false;
            }
            details.push(LineMatchDetail {
                line_number: start_index + offset + 1,
                search_line: search_line.as_ref().to_string(),
                file_line: file_line.to_string(),
                score: comparison.score,
                kind: comparison.kind,
                differences: comparison.differences,
            });
        }

        let score = score_sum / search_lines.len() as f64;
        let kind = if all_exact {
            BlockMatchKind::Exact
        } else if all_whitespace_exact {
            BlockMatchKind::ExactWhitespace
        } else if score >= 0.85 {
            BlockMatchKind::FuzzyHigh
        } else if score >= 0.70 {
            BlockMatchKind::FuzzyMedium
        } else {
            BlockMatchKind::FuzzyLow
        };
        WindowCandidate {
            start_index,
            kind,
            score,
            details,
        }
    }
}

// --- Block Locator ---

/// Orchestrates the [`SearchEngine`] over all parsed blocks of one file and
/// renders consolidated feedback for the ones that failed or degraded.
#[derive(Debug)]
pub struct BlockLocator {
    options: SearchOptions,
}

impl BlockLocator {
    pub fn new(options: SearchOptions) -> Self {
        Self { options }
    }

    /// Locates every block within `file_content`, in input order.
    ///
    /// The file is split into lines once and a single engine instance is
    /// shared across all blocks, so earlier blocks' claimed ranges constrain
    /// later ones. A block whose search content is blank is treated as a
    /// whole-file replacement: the entire file is substituted as its search
    /// block.
    pub fn locate_all(&self, blocks: &[ParsedBlock], file_content: &str) -> Vec<LocatedBlock> {
        let file_lines: Vec<String> = file_content.split('\n').map(String::from).collect();
        let mut engine = SearchEngine::new(self.options);

        blocks
            .iter()
            .map(|block| {
                let result = if block.search_content.trim().is_empty() {
                    debug!(
                        "{} has a blank search section, matching the entire file",
                        block.block_id
                    );
                    engine.locate(&file_lines, &file_lines)
                } else {
                    engine.locate(&block.search_lines, &file_lines)
                };
                if !result.found {
                    warn!(
                        "{} could not be located: {}",
                        block.block_id,
                        result.error.as_deref().unwrap_or("unknown")
                    );
                }
                LocatedBlock {
                    block: block.clone(),
                    result,
                    applied_start_line: None,
                    applied_end_line: None,
                }
            })
            .collect()
    }

    /// Renders feedback for blocks that failed to locate or located
    /// degraded, or `None` when every block matched exactly.
    ///
    /// Failed blocks get an error section with a `<BESTMATCH>` excerpt when
    /// the engine captured a best guess; degraded blocks get a warning
    /// section with a unified diff between the matched file excerpt and the
    /// intended SEARCH content, so the caller can show the model exactly how
    /// its assumption differed from reality.
    pub fn feedback(&self, located: &[LocatedBlock]) -> Option<String> {
        let mut sections: Vec<String> = Vec::new();
        for located_block in located {
            let result = &located_block.result;
            if !result.found {
                let mut section = format!(
                    "### {}: no acceptable match\n\n{}\n",
                    located_block.block.block_id,
                    result
                        .error
                        .as_deref()
                        .unwrap_or("the search content was not found in the file"),
                );
                if let Some(range) = result.location {
                    section.push_str(&format!(
                        "\n<BESTMATCH> {} (confidence {}%):\n```\n{}\n```\n",
                        range, result.confidence, result.found_content
                    ));
                }
                sections.push(section);
            } else if result.match_kind != BlockMatchKind::Exact {
                let Some(range) = result.location else {
                    continue;
                };
                let diff = unified_diff(
                    Algorithm::default(),
                    &result.found_content,
                    &located_block.block.search_content,
                    3,
                    Some(("file", "search")),
                );
                sections.push(format!(
                    "### {}: located with a {} match at {} (confidence {}%)\n\nThe file content differs from the SEARCH block:\n\n```diff\n{}```\n",
                    located_block.block.block_id, result.match_kind, range, result.confidence, diff
                ));
            }
        }
        if sections.is_empty() {
            None
        } else {
            Some(sections.join("\n"))
        }
    }
}

// --- Edit Session ---

/// The result of one apply call.
#[derive(Debug, Clone, PartialEq)]
pub struct EditOutcome {
    /// Whether any edits were applied. All-or-nothing: one unlocatable
    /// block means `false` and an untouched file.
    pub applied: bool,
    /// The new file content when applied; the unchanged original otherwise.
    pub new_content: String,
    /// One entry per parsed block, in input order.
    pub blocks: Vec<LocatedBlock>,
    /// Combined parser and locator feedback (errors, best-guess previews,
    /// degraded-match diffs), or `None` when there is nothing to report.
    pub feedback: Option<String>,
    /// A before/after unified diff of the applied changes.
    pub diff: Option<String>,
}

/// Sequences parse, locate, and apply for one file edit.
///
/// Sessions for different files are independent and may run in parallel;
/// the blocks of one diff are always located sequentially against one engine
/// because later blocks depend on earlier blocks' claimed ranges.
#[derive(Debug)]
pub struct EditSession {
    options: SearchOptions,
}

impl EditSession {
    pub fn new(options: SearchOptions) -> Self {
        Self { options }
    }

    /// Parses `diff_text`, locates every block in `original_content`, and,
    /// only if every block was found, splices the replacements in.
    pub fn apply_diff(&self, diff_text: &str, original_content: &str) -> EditOutcome {
        let mut parser = DiffParser::new();
        let blocks = match parser.parse(diff_text) {
            Ok(blocks) => blocks,
            Err(error) => {
                warn!("diff parse failed: {}", error);
                return EditOutcome {
                    applied: false,
                    new_content: original_content.to_string(),
                    blocks: Vec::new(),
                    feedback: combine_feedback([
                        parser.feedback(),
                        Some(format!("### Parse error\n\n{}", error)),
                    ]),
                    diff: None,
                };
            }
        };
        info!("parsed {} block(s) from the diff", blocks.len());

        let locator = BlockLocator::new(self.options);
        let mut located = locator.locate_all(&blocks, original_content);

        // All-or-nothing: a single unlocated block means no edits at all,
        // and full feedback so the model can retry with corrected blocks.
        if located.iter().any(|lb| !lb.result.found) {
            return EditOutcome {
                applied: false,
                new_content: original_content.to_string(),
                feedback: combine_feedback([parser.feedback(), locator.feedback(&located)]),
                blocks: located,
                diff: None,
            };
        }

        let new_content = Self::splice_blocks(&mut located, original_content);
        let diff = unified_diff(
            Algorithm::default(),
            original_content,
            &new_content,
            3,
            Some(("before", "after")),
        )
        .to_string();
        info!("applied {} block(s)", located.len());

        EditOutcome {
            applied: true,
            new_content,
            feedback: combine_feedback([parser.feedback(), locator.feedback(&located)]),
            blocks: located,
            diff: Some(diff),
        }
    }

    /// The "replace entire file" path: no diff syntax involved, the literal
    /// `replacement` becomes the new content.
    pub fn apply_replacement(&self, replacement: &str, original_content: &str) -> EditOutcome {
        info!(
            "replacing the entire file content ({} -> {} bytes)",
            original_content.len(),
            replacement.len()
        );
        let diff = unified_diff(
            Algorithm::default(),
            original_content,
            replacement,
            3,
            Some(("before", "after")),
        )
        .to_string();
        EditOutcome {
            applied: true,
            new_content: replacement.to_string(),
            blocks: Vec::new(),
            feedback: None,
            diff: Some(diff),
        }
    }

    /// Splices every located block's replacement lines into the file,
    /// recording where each replacement landed.
    fn splice_blocks(located: &mut [LocatedBlock], original_content: &str) -> String {
        let mut lines: Vec<String> = original_content.split('\n').map(String::from).collect();

        // Ranges are pairwise disjoint, so applying in file order with a
        // running line-count delta keeps every later start index valid.
        let mut order: Vec<usize> = (0..located.len()).collect();
        order.sort_by_key(|&i| located[i].result.location.map_or(0, |r| r.start_line));

        let mut delta: i64 = 0;
        for &i in &order {
            let Some(range) = located[i].result.location else {
                continue;
            };
            let search_len = range.end_line - range.start_line + 1;
            let replace_lines = located[i].block.replace_lines.clone();
            let replace_len = replace_lines.len();
            let start = (range.start_line as i64 - 1 + delta) as usize;
            lines.splice(start..start + search_len, replace_lines);
            if replace_len > 0 {
                located[i].applied_start_line = Some(start + 1);
                located[i].applied_end_line = Some(start + replace_len);
            }
            trace!(
                "{}: replaced {} line(s) at {} with {} line(s)",
                located[i].block.block_id,
                search_len,
                range,
                replace_len
            );
            delta += replace_len as i64 - search_len as i64;
        }
        lines.join("\n")
    }
}

/// Joins the non-empty feedback parts with a blank line.
fn combine_feedback(parts: [Option<String>; 2]) -> Option<String> {
    let parts: Vec<String> = parts.into_iter().flatten().collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}
