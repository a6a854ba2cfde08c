/// Converts a shell-style wildcard pattern to an anchored regex.
/// `*` matches zero or more arbitrary characters; every other character is
/// taken literally.
pub fn wildcard_to_regex(pattern: &str) -> String {
    let cards: Vec<&str> = pattern.split('*').collect();
    if cards.len() == 1 {
        return format!("^{}$", pattern);
    }
    let mut result = String::from("^");
    for (i, literal) in cards.iter().enumerate() {
        if i > 0 {
            result.push_str(".*");
        }
        result.push_str(&regex::escape(literal));
    }
    result.push('$');
    result
}
