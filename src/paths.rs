//! Path sanitizing for query references and archive locations

/// Strip traversal segments and characters that are invalid in blob or file
/// paths. Leading slashes are removed so the result is always relative.
pub fn clean_path(path: &str) -> String {
    let without_traversal = path.replace("..", "");
    let filtered: String = without_traversal
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, '<' | '>' | ':' | '"' | '|' | '?' | '*' | '\\'))
        .collect();
    filtered
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}
