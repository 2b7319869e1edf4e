//! Line-based unified diffs with 3 lines of context.

use std::time::Duration;

use similar::{Algorithm, ChangeTag, DiffOp, DiffTag, TextDiff};

use factory_types::{DiffHunk, FileDiff};

pub const CONTEXT_LINES: usize = 3;
const NO_NEWLINE: &str = "\\ No newline at end of file";
/// Past this the edit search settles for a coarser (still valid) script.
const DIFF_DEADLINE: Duration = Duration::from_secs(2);

fn push_line(out: &mut Vec<String>, prefix: char, line: &str) {
    match line.strip_suffix('\n') {
        Some(body) => out.push(format!("{prefix}{body}")),
        None => {
            out.push(format!("{prefix}{line}"));
            out.push(NO_NEWLINE.to_string());
        }
    }
}

fn hunk_start(before: usize, len: usize) -> usize {
    if len == 0 {
        before
    } else {
        before + 1
    }
}

/// Whole-file hunk for added or removed content; no edit search needed.
fn single_sided_hunk(text: &str, prefix: char) -> DiffHunk {
    let mut lines = Vec::new();
    let mut count = 0;
    for line in text.split_inclusive('\n') {
        push_line(&mut lines, prefix, line);
        count += 1;
    }
    let (old_lines, new_lines) = if prefix == '+' { (0, count) } else { (count, 0) };
    DiffHunk {
        old_start: hunk_start(0, old_lines),
        old_lines,
        new_start: hunk_start(0, new_lines),
        new_lines,
        lines,
    }
}

fn op_is_change(op: &DiffOp) -> bool {
    op.tag() != DiffTag::Equal
}

fn build_hunks(old: &str, new: &str) -> Vec<DiffHunk> {
    let diff = TextDiff::configure()
        .algorithm(Algorithm::Myers)
        .timeout(DIFF_DEADLINE)
        .diff_lines(old, new);

    let mut hunks = Vec::new();
    for group in diff.grouped_ops(CONTEXT_LINES) {
        if !group.iter().any(op_is_change) {
            continue;
        }
        let (Some(first), Some(last)) = (group.first(), group.last()) else {
            continue;
        };
        let old_range = first.old_range().start..last.old_range().end;
        let new_range = first.new_range().start..last.new_range().end;

        let mut lines = Vec::new();
        for op in &group {
            for change in diff.iter_changes(op) {
                let prefix = match change.tag() {
                    ChangeTag::Equal => ' ',
                    ChangeTag::Delete => '-',
                    ChangeTag::Insert => '+',
                };
                push_line(&mut lines, prefix, change.value());
            }
        }
        hunks.push(DiffHunk {
            old_start: hunk_start(old_range.start, old_range.len()),
            old_lines: old_range.len(),
            new_start: hunk_start(new_range.start, new_range.len()),
            new_lines: new_range.len(),
            lines,
        });
    }
    hunks
}

/// Diff `old` (absent for new files) against `new` for a project-relative path.
pub fn unified_diff(path: &str, old: Option<&str>, new: &str) -> FileDiff {
    let old_text = old.unwrap_or("");
    let hunks = if old_text == new {
        Vec::new()
    } else if old_text.is_empty() {
        vec![single_sided_hunk(new, '+')]
    } else if new.is_empty() {
        vec![single_sided_hunk(old_text, '-')]
    } else {
        build_hunks(old_text, new)
    };
    if hunks.is_empty() {
        return FileDiff::default();
    }

    let mut unified = String::new();
    match old {
        Some(_) => unified.push_str(&format!("--- a/{path}\n")),
        None => unified.push_str("--- /dev/null\n"),
    }
    unified.push_str(&format!("+++ b/{path}\n"));
    for hunk in &hunks {
        unified.push_str(&format!(
            "@@ -{},{} +{},{} @@\n",
            hunk.old_start, hunk.old_lines, hunk.new_start, hunk.new_lines
        ));
        for line in &hunk.lines {
            unified.push_str(line);
            unified.push('\n');
        }
    }
    FileDiff { unified, hunks }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_file_is_all_additions() {
        let diff = unified_diff("a.txt", None, "one\ntwo\n");
        assert_eq!(diff.hunks.len(), 1);
        let hunk = &diff.hunks[0];
        assert_eq!((hunk.old_start, hunk.old_lines), (0, 0));
        assert_eq!((hunk.new_start, hunk.new_lines), (1, 2));
        assert_eq!(hunk.lines, vec!["+one", "+two"]);
        assert!(diff.unified.starts_with("--- /dev/null\n+++ b/a.txt\n@@ -0,0 +1,2 @@\n"));
    }

    #[test]
    fn single_line_change_keeps_context() {
        let old = "1\n2\n3\n4\n5\n6\n7\n8\n9\n";
        let new = "1\n2\n3\n4\nfive\n6\n7\n8\n9\n";
        let diff = unified_diff("n.txt", Some(old), new);
        assert_eq!(diff.hunks.len(), 1);
        let hunk = &diff.hunks[0];
        assert_eq!((hunk.old_start, hunk.old_lines), (2, 7));
        assert_eq!((hunk.new_start, hunk.new_lines), (2, 7));
        assert_eq!(
            hunk.lines,
            vec![" 2", " 3", " 4", "-5", "+five", " 6", " 7", " 8"]
        );
        assert!(diff.unified.contains("@@ -2,7 +2,7 @@\n"));
    }

    #[test]
    fn distant_changes_split_into_hunks() {
        let old: String = (1..=20).map(|n| format!("{n}\n")).collect();
        let new: String = (1..=20)
            .map(|n| match n {
                2 => "two\n".to_string(),
                19 => "nineteen\n".to_string(),
                _ => format!("{n}\n"),
            })
            .collect();
        let diff = unified_diff("n.txt", Some(&old), &new);
        assert_eq!(diff.hunks.len(), 2);
        assert_eq!((diff.hunks[0].old_start, diff.hunks[0].old_lines), (1, 5));
        assert_eq!((diff.hunks[1].old_start, diff.hunks[1].old_lines), (16, 5));
    }

    #[test]
    fn identical_content_has_no_hunks() {
        let diff = unified_diff("same.txt", Some("x\n"), "x\n");
        assert!(diff.hunks.is_empty());
        assert!(diff.unified.is_empty());
    }

    #[test]
    fn missing_trailing_newline_is_marked() {
        let diff = unified_diff("a.txt", Some("a\n"), "a");
        let lines = &diff.hunks[0].lines;
        assert_eq!(lines, &vec!["-a".to_string(), "+a".to_string(), NO_NEWLINE.to_string()]);
    }

    #[test]
    fn hunk_counts_match_line_prefixes() {
        let old = "a\nb\nc\nd\n";
        let new = "a\nc\nd\ne\nf\n";
        let diff = unified_diff("x", Some(old), new);
        for hunk in &diff.hunks {
            let old_count = hunk.lines.iter().filter(|l| l.starts_with(' ') || l.starts_with('-')).count();
            let new_count = hunk.lines.iter().filter(|l| l.starts_with(' ') || l.starts_with('+')).count();
            assert_eq!(old_count, hunk.old_lines);
            assert_eq!(new_count, hunk.new_lines);
        }
    }

    #[test]
    fn large_added_file_is_one_hunk() {
        let content: String = (0..20_000).map(|n| format!("line {n}\n")).collect();
        let diff = unified_diff("big.txt", None, &content);
        assert_eq!(diff.hunks.len(), 1);
        assert_eq!((diff.hunks[0].old_start, diff.hunks[0].old_lines), (0, 0));
        assert_eq!((diff.hunks[0].new_start, diff.hunks[0].new_lines), (1, 20_000));
    }

    #[test]
    fn emptied_file_is_all_removals() {
        let diff = unified_diff("gone.txt", Some("a\nb\n"), "");
        assert_eq!(diff.hunks.len(), 1);
        assert_eq!((diff.hunks[0].old_start, diff.hunks[0].old_lines), (1, 2));
        assert_eq!((diff.hunks[0].new_start, diff.hunks[0].new_lines), (0, 0));
        assert_eq!(diff.hunks[0].lines, vec!["-a", "-b"]);
    }

    #[test]
    fn large_modified_file_with_scattered_edits() {
        let old: String = (0..12_000).map(|n| format!("line {n}\n")).collect();
        let new: String = (0..12_000)
            .map(|n| {
                if n % 1_000 == 500 {
                    format!("changed {n}\n")
                } else {
                    format!("line {n}\n")
                }
            })
            .collect();
        let diff = unified_diff("big.txt", Some(&old), &new);
        assert_eq!(diff.hunks.len(), 12);
        for hunk in &diff.hunks {
            assert_eq!((hunk.old_lines, hunk.new_lines), (7, 7));
            assert_eq!(hunk.lines.iter().filter(|l| l.starts_with('-')).count(), 1);
        }
        assert_eq!(diff.hunks[0].old_start, 498);
    }
}
