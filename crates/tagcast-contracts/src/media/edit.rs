use similar::TextDiff;

/// Unified line diff between an old and a new prompt or voice text, for the
/// edit event payload.
pub fn edit_diff(before: &str, after: &str) -> Vec<String> {
    TextDiff::from_lines(before, after)
        .unified_diff()
        .header("before", "after")
        .to_string()
        .lines()
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::edit_diff;

    #[test]
    fn diff_names_both_sides() {
        let lines = edit_diff("a red bicycle\n", "a blue bicycle\n");
        assert!(lines.iter().any(|line| line == "--- before"));
        assert!(lines.iter().any(|line| line == "-a red bicycle"));
        assert!(lines.iter().any(|line| line == "+a blue bicycle"));
    }

    #[test]
    fn identical_text_has_no_hunks() {
        assert!(edit_diff("same\n", "same\n").is_empty());
    }
}
