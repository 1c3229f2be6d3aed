use indoc::indoc;
use srpatch::{
    compare_lines, levenshtein_distance, normalize_punctuation, similarity, BlockLocator,
    BlockMatchKind, DiffParser, DifferenceKind, EditSession, IssueKind, LineMatchKind, ParseError,
    SearchEngine, SearchOptions,
};

// --- Parsing ---

#[test]
fn test_parse_simple_block() {
    let diff = indoc! {"
        <<<<<<< SEARCH
        count = 0
        =======
        counter = 0
        >>>>>>> REPLACE
    "};
    let mut parser = DiffParser::new();
    let blocks = parser.parse(diff).unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].block_id, "Block 1");
    assert_eq!(blocks[0].search_content, "count = 0");
    assert_eq!(blocks[0].replace_content, "counter = 0");
    assert_eq!(blocks[0].search_lines, vec!["count = 0"]);
    assert_eq!(blocks[0].replace_lines, vec!["counter = 0"]);
    assert!(!parser.has_issues());
}

#[test]
fn test_parse_multiple_blocks_with_prose_between() {
    let diff = indoc! {"
        First I'll rename the variable:
        <<<<<<< SEARCH
        count = 0
        =======
        counter = 0
        >>>>>>> REPLACE
        Then update the loop:
        <<<<<<< SEARCH
        for i in range
        =======
        for counter in range
        >>>>>>> REPLACE
    "};
    let mut parser = DiffParser::new();
    let blocks = parser.parse(diff).unwrap();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].block_id, "Block 1");
    assert_eq!(blocks[1].block_id, "Block 2");
    assert_eq!(blocks[1].search_content, "for i in range");
    assert!(!parser.has_issues());
}

#[test]
fn test_parse_skips_block_with_no_content_at_all() {
    let diff = indoc! {"
        <<<<<<< SEARCH
        =======
        >>>>>>> REPLACE
        <<<<<<< SEARCH
        a
        =======
        b
        >>>>>>> REPLACE
    "};
    let mut parser = DiffParser::new();
    let blocks = parser.parse(diff).unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].block_id, "Block 1");
    assert_eq!(blocks[0].search_content, "a");
}

#[test]
fn test_parse_crlf_input() {
    let diff = "<<<<<<< SEARCH\r\ncount = 0\r\n=======\r\ncounter = 0\r\n>>>>>>> REPLACE";
    let mut parser = DiffParser::new();
    let blocks = parser.parse(diff).unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].search_content, "count = 0");
    assert_eq!(blocks[0].replace_content, "counter = 0");
}

#[test]
fn test_parse_tolerates_marker_variants() {
    // Extra delimiters, lowercase keyword, missing space before REPLACE.
    let diff = "<<<<<<<<<< search\nfoo\n=======\nbar\n>>>>>>>REPLACE";
    let mut parser = DiffParser::new();
    let blocks = parser.parse(diff).unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].search_content, "foo");
    assert_eq!(blocks[0].replace_content, "bar");

    let kinds: Vec<IssueKind> = parser.issues().iter().map(|i| i.kind).collect();
    assert!(kinds.contains(&IssueKind::CaseMismatchMarkers));
    assert!(kinds.contains(&IssueKind::MissingSpacesInMarkers));
}

#[test]
fn test_parse_extra_spaces_before_keyword() {
    let diff = "<<<<<<<   SEARCH\nfoo\n=======\nbar\n>>>>>>> REPLACE";
    let mut parser = DiffParser::new();
    let blocks = parser.parse(diff).unwrap();
    assert_eq!(blocks.len(), 1);
    let kinds: Vec<IssueKind> = parser.issues().iter().map(|i| i.kind).collect();
    assert_eq!(kinds, vec![IssueKind::ExtraSpacesInMarkers]);
}

#[test]
fn test_parse_content_on_marker_lines() {
    let diff = "<<<<<<< SEARCH foo\n=======\n>>>>>>> REPLACE bar";
    let mut parser = DiffParser::new();
    let blocks = parser.parse(diff).unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].search_content, "foo");
    assert_eq!(blocks[0].replace_content, "bar");

    let kinds: Vec<IssueKind> = parser.issues().iter().map(|i| i.kind).collect();
    assert_eq!(
        kinds,
        vec![IssueKind::ContentOnMarkerLine, IssueKind::ContentOnMarkerLine]
    );
}

#[test]
fn test_parse_replace_marker_content_leads_the_body() {
    let diff = "<<<<<<< SEARCH\nold\n=======\nbody\n>>>>>>> REPLACE extra";
    let mut parser = DiffParser::new();
    let blocks = parser.parse(diff).unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].replace_lines, vec!["extra", "body"]);
    assert_eq!(blocks[0].replace_content, "extra\nbody");

    let kinds: Vec<IssueKind> = parser.issues().iter().map(|i| i.kind).collect();
    assert_eq!(kinds, vec![IssueKind::ContentOnMarkerLine]);
}

#[test]
fn test_parse_stray_angle_artifact_after_search_keyword() {
    let diff = "<<<<<<< SEARCH >\nfoo\n=======\nbar\n>>>>>>> REPLACE";
    let mut parser = DiffParser::new();
    let blocks = parser.parse(diff).unwrap();
    assert_eq!(blocks.len(), 1);
    // The artifact itself carries no content.
    assert_eq!(blocks[0].search_content, "foo");

    let kinds: Vec<IssueKind> = parser.issues().iter().map(|i| i.kind).collect();
    assert_eq!(kinds, vec![IssueKind::ClaudeMarkerIssue]);
}

#[test]
fn test_parse_synthesizes_missing_search_marker() {
    let diff = "count = 0\n=======\ncounter = 0\n>>>>>>> REPLACE";
    let mut parser = DiffParser::new();
    let blocks = parser.parse(diff).unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].search_content, "count = 0");
    assert_eq!(blocks[0].replace_content, "counter = 0");

    let kinds: Vec<IssueKind> = parser.issues().iter().map(|i| i.kind).collect();
    assert_eq!(kinds, vec![IssueKind::MalformedSearchMarker]);
}

#[test]
fn test_parse_synthesizes_marker_after_markdown_fence() {
    let diff = "```\ncount = 0\n=======\ncounter = 0\n>>>>>>> REPLACE\n```";
    let mut parser = DiffParser::new();
    let blocks = parser.parse(diff).unwrap();
    assert_eq!(blocks.len(), 1);
    // The fence lines must not leak into the block body.
    assert_eq!(blocks[0].search_content, "count = 0");
    assert_eq!(blocks[0].replace_content, "counter = 0");

    let kinds: Vec<IssueKind> = parser.issues().iter().map(|i| i.kind).collect();
    assert!(kinds.contains(&IssueKind::MalformedSearchMarker));
    assert!(kinds.contains(&IssueKind::MarkdownNoise));
}

#[test]
fn test_parse_escaped_marker_lines_become_content() {
    let diff = indoc! {r"
        <<<<<<< SEARCH
        \<<<<<<< SEARCH
        \=======
        =======
        \>>>>>>> REPLACE
        >>>>>>> REPLACE
    "};
    let mut parser = DiffParser::new();
    let blocks = parser.parse(diff).unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].search_lines, vec!["<<<<<<< SEARCH", "======="]);
    assert_eq!(blocks[0].replace_lines, vec![">>>>>>> REPLACE"]);
}

#[test]
fn test_parse_issue_feedback_rendering() {
    let diff = "count = 0\n=======\ncounter = 0\n>>>>>>> REPLACE";
    let mut parser = DiffParser::new();
    parser.parse(diff).unwrap();
    let feedback = parser.feedback().unwrap();
    assert!(feedback.contains("### Diff Format Issues"));
    assert!(feedback.contains("MALFORMED_SEARCH_MARKER"));
    assert!(feedback.contains("Guidance:"));
}

#[test]
fn test_parse_error_nested_search_marker() {
    let diff = "<<<<<<< SEARCH\na\n<<<<<<< SEARCH\nb\n=======\nc\n>>>>>>> REPLACE";
    let mut parser = DiffParser::new();
    assert_eq!(
        parser.parse(diff),
        Err(ParseError::UnexpectedSearchMarker { line: 3 })
    );
}

#[test]
fn test_parse_error_double_separator() {
    let diff = "<<<<<<< SEARCH\na\n=======\nb\n=======\nc\n>>>>>>> REPLACE";
    let mut parser = DiffParser::new();
    assert_eq!(
        parser.parse(diff),
        Err(ParseError::UnexpectedSeparator { line: 5 })
    );
}

#[test]
fn test_parse_error_replace_marker_without_block() {
    let diff = "<<<<<<< SEARCH\na\n=======\nb\n>>>>>>> REPLACE\n>>>>>>> REPLACE";
    let mut parser = DiffParser::new();
    assert_eq!(
        parser.parse(diff),
        Err(ParseError::UnexpectedReplaceMarker { line: 6 })
    );
}

#[test]
fn test_parse_error_incomplete_search_block() {
    let diff = "<<<<<<< SEARCH\ncount = 0";
    let mut parser = DiffParser::new();
    assert_eq!(parser.parse(diff), Err(ParseError::IncompleteSearchBlock));
}

#[test]
fn test_parse_error_incomplete_replace_block() {
    let diff = "<<<<<<< SEARCH\ncount = 0\n=======\ncounter = 0";
    let mut parser = DiffParser::new();
    assert_eq!(parser.parse(diff), Err(ParseError::IncompleteReplaceBlock));
}

#[test]
fn test_parse_error_no_blocks() {
    let diff = "<<<<<<< SEARCH\n=======\n>>>>>>> REPLACE";
    let mut parser = DiffParser::new();
    assert_eq!(parser.parse(diff), Err(ParseError::NoBlocksFound));
}

// --- Line Comparison ---

#[test]
fn test_compare_lines_exact() {
    let cmp = compare_lines("let x = 1;", "let x = 1;");
    assert_eq!(cmp.kind, LineMatchKind::Exact);
    assert_eq!(cmp.score, 1.0);
    assert!(cmp.differences.is_empty());
}

#[test]
fn test_compare_lines_whitespace() {
    let cmp = compare_lines("  let x  = 1; ", "let x = 1;");
    assert_eq!(cmp.kind, LineMatchKind::ExactWhitespace);
    assert_eq!(cmp.score, 0.99);
    assert_eq!(cmp.differences, vec![DifferenceKind::Whitespace]);
}

#[test]
fn test_compare_lines_smart_quotes_normalize() {
    let cmp = compare_lines("say \u{201C}hi\u{201D}", "say \"hi\"");
    assert_eq!(cmp.kind, LineMatchKind::Normalized);
    assert_eq!(cmp.score, 0.98);
    assert!(cmp.differences.contains(&DifferenceKind::QuoteStyle));
}

#[test]
fn test_compare_lines_html_entities_normalize() {
    let cmp = compare_lines("if a &amp;&amp; b", "if a && b");
    assert_eq!(cmp.kind, LineMatchKind::Normalized);
    assert!(cmp.differences.contains(&DifferenceKind::HtmlEntities));
}

#[test]
fn test_compare_lines_punctuation() {
    let cmp = compare_lines("foo(a, b);", "foo( a , b )");
    assert_eq!(cmp.kind, LineMatchKind::Punctuation);
    assert_eq!(cmp.score, 0.95);
    assert!(cmp.differences.contains(&DifferenceKind::Punctuation));
}

#[test]
fn test_compare_lines_case_insensitive() {
    let cmp = compare_lines("SELECT NAME FROM USERS", "select name from users");
    assert_eq!(cmp.kind, LineMatchKind::CaseInsensitive);
    assert_eq!(cmp.score, 0.90);
    assert!(cmp.differences.contains(&DifferenceKind::Case));
}

#[test]
fn test_compare_lines_fuzzy_bands() {
    // One typo in a 21-char line lands well above the high band.
    let cmp = compare_lines("let concurency = 4;", "let concurrency = 4;");
    assert_eq!(cmp.kind, LineMatchKind::FuzzyHigh);
    assert!(cmp.score >= 0.85);

    // Unrelated lines fall through to no match.
    let cmp = compare_lines("fn main() {", "import numpy as np");
    assert_eq!(cmp.kind, LineMatchKind::NoMatch);
    assert!(cmp.score < 0.50);
}

#[test]
fn test_levenshtein_distance_basics() {
    assert_eq!(levenshtein_distance("kitten", "sitting"), 3);
    assert_eq!(levenshtein_distance("abc", "abc"), 0);
    assert_eq!(levenshtein_distance("", ""), 0);
    assert_eq!(levenshtein_distance("", "abc"), 3);
    assert_eq!(levenshtein_distance("abc", ""), 3);
}

#[test]
fn test_similarity_edge_cases() {
    assert_eq!(similarity("", ""), 1.0);
    assert_eq!(similarity("same", "same"), 1.0);
    assert_eq!(similarity("", "abc"), 0.0);
    assert!((similarity("abc", "abd") - 2.0 / 3.0).abs() < 1e-9);
}

#[test]
fn test_normalize_punctuation_rules() {
    assert_eq!(normalize_punctuation("foo( a , b );"), "foo(a,b)");
    assert_eq!(normalize_punctuation("let x = 1,"), "let x = 1");
    assert_eq!(normalize_punctuation("items[ 0 ]"), "items[0]");
    assert_eq!(normalize_punctuation("plain words stay"), "plain words stay");
}

// --- Search Engine ---

#[test]
fn test_locate_exact_match() {
    let mut engine = SearchEngine::new(SearchOptions::default());
    let file = ["a", "count = 0", "b"];
    let result = engine.locate(&["count = 0"], &file);
    assert!(result.found);
    assert_eq!(result.match_kind, BlockMatchKind::Exact);
    assert_eq!(result.score, 1.0);
    assert_eq!(result.confidence, 100);
    let range = result.location.unwrap();
    assert_eq!((range.start_line, range.end_line), (2, 2));
}

#[test]
fn test_locate_duplicate_occurrences_claim_successive_ranges() {
    let mut engine = SearchEngine::new(SearchOptions::default());
    let file = [
        "l1", "l2", "target", "l4", "l5", "l6", "l7", "l8", "l9", "target", "l11", "l12",
    ];

    let first = engine.locate(&["target"], &file);
    assert!(first.found);
    assert_eq!(first.location.unwrap().start_line, 3);

    let second = engine.locate(&["target"], &file);
    assert!(second.found);
    assert_eq!(second.location.unwrap().start_line, 10);

    // Both occurrences are claimed; a third identical block cannot land.
    let third = engine.locate(&["target"], &file);
    assert!(!third.found);

    assert_eq!(engine.used_ranges().len(), 2);
}

#[test]
fn test_locate_reset_restores_determinism() {
    let mut engine = SearchEngine::new(SearchOptions::default());
    let file = ["a", "target", "b", "target"];

    let first = engine.locate(&["target"], &file);
    assert_eq!(first.location.unwrap().start_line, 2);

    // After a reset the engine forgets its claims and repeats itself.
    engine.reset();
    assert!(engine.used_ranges().is_empty());
    let again = engine.locate(&["target"], &file);
    assert_eq!(again, first);
}

#[test]
fn test_locate_first_exact_occurrence_wins_over_later_ones() {
    let mut engine = SearchEngine::new(SearchOptions::default());
    let file = ["x", "dup", "y", "dup", "z"];
    let result = engine.locate(&["dup"], &file);
    assert_eq!(result.location.unwrap().start_line, 2);
}

#[test]
fn test_locate_whitespace_tolerant() {
    let mut engine = SearchEngine::new(SearchOptions::default());
    let file = ["fn main() {", "\tcount = 0;  ", "}"];
    let result = engine.locate(&["count = 0;"], &file);
    assert!(result.found);
    assert_eq!(result.match_kind, BlockMatchKind::ExactWhitespace);
    assert_eq!(result.confidence, 99);
    assert_eq!(result.found_content, "\tcount = 0;  ");
}

#[test]
fn test_locate_fuzzy_threshold_boundary() {
    // 16-char lines differing in 3 chars score 13/16 = 0.8125, just above
    // the default 0.8 threshold; 4 differing chars score 12/16 = 0.75 and
    // get rejected.
    let file = ["aaaaaaaaaaaaaaaa", "zzzz"];

    let mut engine = SearchEngine::new(SearchOptions::default());
    let accepted = engine.locate(&["aaaaaaaaaaaaabbb"], &file);
    assert!(accepted.found);
    assert_eq!(accepted.match_kind, BlockMatchKind::FuzzyMedium);
    assert_eq!(accepted.confidence, 81);
    assert!((accepted.score - 0.8125).abs() < 1e-9);

    let mut engine = SearchEngine::new(SearchOptions::default());
    let rejected = engine.locate(&["aaaaaaaaaaaabbbb"], &file);
    assert!(!rejected.found);
    assert_eq!(rejected.confidence, 75);
    // The best-guess window is still reported for feedback.
    assert_eq!(rejected.location.unwrap().start_line, 1);
    assert!(rejected.error.unwrap().contains("below the fuzzy threshold"));
}

#[test]
fn test_locate_fuzzy_disabled_rejects_near_match() {
    let options = SearchOptions::builder().enable_fuzzy_matching(false).build();
    let mut engine = SearchEngine::new(options);
    let file = ["let concurrency = 4;"];
    let result = engine.locate(&["let concurency = 4;"], &file);
    assert!(!result.found);

    // Whitespace-exact still applies without fuzzy matching.
    let mut engine = SearchEngine::new(options);
    let file = ["  let concurrency = 4;"];
    let result = engine.locate(&["let concurrency = 4;"], &file);
    assert!(result.found);
    assert_eq!(result.match_kind, BlockMatchKind::ExactWhitespace);
}

#[test]
fn test_locate_search_longer_than_file() {
    let mut engine = SearchEngine::new(SearchOptions::default());
    let result = engine.locate(&["a", "b", "c"], &["a"]);
    assert!(!result.found);
    assert!(result.location.is_none());
    assert!(result.error.unwrap().contains("longer than the file"));
}

#[test]
fn test_locate_empty_search_claims_whole_file() {
    let mut engine = SearchEngine::new(SearchOptions::default());
    let search: [&str; 0] = [];
    let result = engine.locate(&search, &["a", "b", "c"]);
    assert!(result.found);
    assert_eq!(result.match_kind, BlockMatchKind::Exact);
    let range = result.location.unwrap();
    assert_eq!((range.start_line, range.end_line), (1, 3));
    assert_eq!(result.found_content, "a\nb\nc");

    // The whole file is claimed; no later block can land inside it.
    assert_eq!(engine.used_ranges().len(), 1);
    assert_eq!(engine.used_ranges()[0], range);
    let follow_up = engine.locate(&["b"], &["a", "b", "c"]);
    assert!(!follow_up.found);
}

#[test]
fn test_locate_iteration_cap_stops_scan() {
    let options = SearchOptions::builder().max_search_iterations(2).build();
    let mut engine = SearchEngine::new(options);
    let file = ["zzz1", "zzz2", "needle"];
    let result = engine.locate(&["needle"], &file);
    // The cap stops the scan before the exact window is reached.
    assert!(!result.found);

    let mut engine = SearchEngine::new(SearchOptions::default());
    let result = engine.locate(&["needle"], &file);
    assert!(result.found);
    assert_eq!(result.location.unwrap().start_line, 3);
}

#[test]
fn test_locate_line_details_report_positions_and_kinds() {
    let mut engine = SearchEngine::new(SearchOptions::default());
    let file = ["a", "  count = 0", "done", "b"];
    let result = engine.locate(&["count = 0", "done"], &file);
    assert!(result.found);
    assert_eq!(result.line_details.len(), 2);
    assert_eq!(result.line_details[0].line_number, 2);
    assert_eq!(result.line_details[0].kind, LineMatchKind::ExactWhitespace);
    assert_eq!(result.line_details[1].line_number, 3);
    assert_eq!(result.line_details[1].kind, LineMatchKind::Exact);
}

// --- Block Locator ---

#[test]
fn test_locate_all_preserves_block_order() {
    let diff = indoc! {"
        <<<<<<< SEARCH
        gamma
        =======
        GAMMA
        >>>>>>> REPLACE
        <<<<<<< SEARCH
        alpha
        =======
        ALPHA
        >>>>>>> REPLACE
    "};
    let mut parser = DiffParser::new();
    let blocks = parser.parse(diff).unwrap();
    let locator = BlockLocator::new(SearchOptions::default());
    let located = locator.locate_all(&blocks, "alpha\nbeta\ngamma");

    assert_eq!(located.len(), 2);
    assert_eq!(located[0].block.block_id, "Block 1");
    assert_eq!(located[0].result.location.unwrap().start_line, 3);
    assert_eq!(located[1].block.block_id, "Block 2");
    assert_eq!(located[1].result.location.unwrap().start_line, 1);
}

#[test]
fn test_locator_feedback_contains_best_match_excerpt() {
    let diff = indoc! {"
        <<<<<<< SEARCH
        completely different text here
        =======
        replacement
        >>>>>>> REPLACE
    "};
    let mut parser = DiffParser::new();
    let blocks = parser.parse(diff).unwrap();
    let locator = BlockLocator::new(SearchOptions::default());
    let located = locator.locate_all(&blocks, "alpha\nbeta");

    assert!(!located[0].result.found);
    let feedback = locator.feedback(&located).unwrap();
    assert!(feedback.contains("Block 1"));
    assert!(feedback.contains("no acceptable match"));
    assert!(feedback.contains("<BESTMATCH>"));
}

#[test]
fn test_locator_feedback_shows_diff_for_degraded_match() {
    let diff = indoc! {"
        <<<<<<< SEARCH
        count = 0
        =======
        counter = 0
        >>>>>>> REPLACE
    "};
    let mut parser = DiffParser::new();
    let blocks = parser.parse(diff).unwrap();
    let locator = BlockLocator::new(SearchOptions::default());
    let located = locator.locate_all(&blocks, "a\n\tcount = 0\nb");

    assert!(located[0].result.found);
    assert_eq!(located[0].result.match_kind, BlockMatchKind::ExactWhitespace);
    let feedback = locator.feedback(&located).unwrap();
    assert!(feedback.contains("exact_whitespace"));
    assert!(feedback.contains("```diff"));
}

#[test]
fn test_locator_feedback_silent_when_all_exact() {
    let diff = "<<<<<<< SEARCH\nbeta\n=======\nBETA\n>>>>>>> REPLACE";
    let mut parser = DiffParser::new();
    let blocks = parser.parse(diff).unwrap();
    let locator = BlockLocator::new(SearchOptions::default());
    let located = locator.locate_all(&blocks, "alpha\nbeta");
    assert!(locator.feedback(&located).is_none());
}

// --- Edit Session ---

#[test]
fn test_apply_diff_simple() {
    let session = EditSession::new(SearchOptions::default());
    let diff = "<<<<<<< SEARCH\ncount = 0\n=======\ncounter = 0\n>>>>>>> REPLACE";
    let outcome = session.apply_diff(diff, "a\ncount = 0\nb");
    assert!(outcome.applied);
    assert_eq!(outcome.new_content, "a\ncounter = 0\nb");
    assert!(outcome.diff.unwrap().contains("-count = 0"));
    assert!(outcome.feedback.is_none());
}

#[test]
fn test_apply_diff_identical_replace_is_identity() {
    let session = EditSession::new(SearchOptions::default());
    // SEARCH and REPLACE are the same contiguous file lines.
    let diff = indoc! {"
        <<<<<<< SEARCH
        fn b() {}
        fn c() {}
        =======
        fn b() {}
        fn c() {}
        >>>>>>> REPLACE
    "};
    let original = "fn a() {}\nfn b() {}\nfn c() {}\nfn d() {}";
    let outcome = session.apply_diff(diff, original);
    assert!(outcome.applied);
    assert_eq!(outcome.new_content, original);
    assert_eq!(outcome.blocks[0].result.match_kind, BlockMatchKind::Exact);
    assert_eq!(outcome.blocks[0].result.confidence, 100);
    let range = outcome.blocks[0].result.location.unwrap();
    assert_eq!((range.start_line, range.end_line), (2, 3));
}

#[test]
fn test_apply_diff_preserves_trailing_newline() {
    let session = EditSession::new(SearchOptions::default());
    let diff = "<<<<<<< SEARCH\ncount = 0\n=======\ncounter = 0\n>>>>>>> REPLACE";
    let outcome = session.apply_diff(diff, "a\ncount = 0\nb\n");
    assert!(outcome.applied);
    assert_eq!(outcome.new_content, "a\ncounter = 0\nb\n");
}

#[test]
fn test_apply_diff_is_all_or_nothing() {
    let session = EditSession::new(SearchOptions::default());
    let diff = indoc! {"
        <<<<<<< SEARCH
        alpha
        =======
        ALPHA
        >>>>>>> REPLACE
        <<<<<<< SEARCH
        this text is nowhere in the file
        =======
        whatever
        >>>>>>> REPLACE
    "};
    let original = "alpha\nbeta";
    let outcome = session.apply_diff(diff, original);
    assert!(!outcome.applied);
    assert_eq!(outcome.new_content, original);
    assert!(outcome.diff.is_none());
    let feedback = outcome.feedback.unwrap();
    assert!(feedback.contains("Block 2"));
    assert!(feedback.contains("no acceptable match"));
}

#[test]
fn test_apply_diff_tracks_applied_line_ranges() {
    let session = EditSession::new(SearchOptions::default());
    let diff = indoc! {"
        <<<<<<< SEARCH
        fn a() {}
        =======
        fn a() {
        }
        >>>>>>> REPLACE
        <<<<<<< SEARCH
        fn c() {}
        =======
        fn c() { run() }
        >>>>>>> REPLACE
    "};
    let original = "fn a() {}\nfn b() {}\nfn c() {}";
    let outcome = session.apply_diff(diff, original);
    assert!(outcome.applied);
    assert_eq!(
        outcome.new_content,
        "fn a() {\n}\nfn b() {}\nfn c() { run() }"
    );
    // First block grew by one line, shifting the second block's landing spot.
    assert_eq!(outcome.blocks[0].applied_start_line, Some(1));
    assert_eq!(outcome.blocks[0].applied_end_line, Some(2));
    assert_eq!(outcome.blocks[1].applied_start_line, Some(4));
    assert_eq!(outcome.blocks[1].applied_end_line, Some(4));
}

#[test]
fn test_apply_diff_deletion_block() {
    let session = EditSession::new(SearchOptions::default());
    let diff = "<<<<<<< SEARCH\nobsolete line\n=======\n>>>>>>> REPLACE";
    let outcome = session.apply_diff(diff, "keep\nobsolete line\nalso keep");
    assert!(outcome.applied);
    assert_eq!(outcome.new_content, "keep\nalso keep");
    assert_eq!(outcome.blocks[0].applied_start_line, None);
    assert_eq!(outcome.blocks[0].applied_end_line, None);
}

#[test]
fn test_apply_diff_duplicate_blocks_edit_successive_occurrences() {
    let session = EditSession::new(SearchOptions::default());
    let diff = indoc! {"
        <<<<<<< SEARCH
        x = 1
        =======
        x = 2
        >>>>>>> REPLACE
        <<<<<<< SEARCH
        x = 1
        =======
        x = 3
        >>>>>>> REPLACE
    "};
    let outcome = session.apply_diff(diff, "x = 1\ny\nx = 1");
    assert!(outcome.applied);
    assert_eq!(outcome.new_content, "x = 2\ny\nx = 3");
}

#[test]
fn test_apply_diff_blank_search_replaces_whole_file() {
    let session = EditSession::new(SearchOptions::default());
    let diff = "<<<<<<< SEARCH\n=======\nbrand new content\n>>>>>>> REPLACE";
    let outcome = session.apply_diff(diff, "old line 1\nold line 2");
    assert!(outcome.applied);
    assert_eq!(outcome.new_content, "brand new content");
}

#[test]
fn test_apply_diff_fuzzy_match_applies_with_feedback() {
    let session = EditSession::new(SearchOptions::default());
    // The search line has a typo; the file's line is replaced anyway.
    let diff = "<<<<<<< SEARCH\nlet concurency = 4;\n=======\nlet concurrency = 8;\n>>>>>>> REPLACE";
    let outcome = session.apply_diff(diff, "start\nlet concurrency = 4;\nend");
    assert!(outcome.applied);
    assert_eq!(outcome.new_content, "start\nlet concurrency = 8;\nend");
    // Degraded matches still surface feedback so the caller can see the drift.
    assert!(outcome.feedback.unwrap().contains("fuzzy_high"));
}

#[test]
fn test_apply_diff_reports_parse_errors() {
    let session = EditSession::new(SearchOptions::default());
    let diff = "<<<<<<< SEARCH\nfoo\n=======\nbar";
    let original = "foo";
    let outcome = session.apply_diff(diff, original);
    assert!(!outcome.applied);
    assert_eq!(outcome.new_content, original);
    assert!(outcome.blocks.is_empty());
    assert!(outcome.feedback.unwrap().contains("Parse error"));
}

#[test]
fn test_apply_diff_combines_parser_and_locator_feedback() {
    let session = EditSession::new(SearchOptions::default());
    // Missing opening marker AND an unlocatable search block.
    let diff = "no such line anywhere at all\n=======\nreplacement\n>>>>>>> REPLACE";
    let outcome = session.apply_diff(diff, "alpha\nbeta");
    assert!(!outcome.applied);
    let feedback = outcome.feedback.unwrap();
    assert!(feedback.contains("### Diff Format Issues"));
    assert!(feedback.contains("<BESTMATCH>"));
}

#[test]
fn test_apply_diff_is_deterministic() {
    let session = EditSession::new(SearchOptions::default());
    let diff = indoc! {"
        <<<<<<< SEARCH
        dup
        =======
        first
        >>>>>>> REPLACE
        <<<<<<< SEARCH
        dup
        =======
        second
        >>>>>>> REPLACE
    "};
    let original = "dup\nmid\ndup";
    let first = session.apply_diff(diff, original);
    let second = session.apply_diff(diff, original);
    assert_eq!(first, second);
    assert_eq!(first.new_content, "first\nmid\nsecond");
}

#[test]
fn test_apply_replacement_swaps_entire_content() {
    let session = EditSession::new(SearchOptions::default());
    let outcome = session.apply_replacement("new\ncontent", "old\ncontent\nhere");
    assert!(outcome.applied);
    assert_eq!(outcome.new_content, "new\ncontent");
    assert!(outcome.blocks.is_empty());
    assert!(outcome.diff.unwrap().contains("+new"));
}
