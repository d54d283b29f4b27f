/// Truncate text to at most `max_chars` characters, marking the cut
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Last non-empty line of a block of text (typically the exception line of a traceback)
pub fn last_line(text: &str) -> Option<&str> {
    text.lines().rev().map(str::trim).find(|line| !line.is_empty())
}

/// First `count` non-empty lines joined back together
pub fn head_lines(text: &str, count: usize) -> String {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .take(count)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello world", 5), "hello...");
        assert_eq!(truncate_chars("héllo", 2), "hé...");
    }

    #[test]
    fn test_last_line_skips_blank() {
        assert_eq!(last_line("Traceback\n  x\nValueError: bad\n\n"), Some("ValueError: bad"));
        assert_eq!(last_line("  \n"), None);
    }

    #[test]
    fn test_head_lines() {
        assert_eq!(head_lines("a\n\nb\nc\n", 2), "a\nb");
    }
}
