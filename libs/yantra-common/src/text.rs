// Byte-bounded text helpers shared by build logs, build errors and captured output

/// Keep at most `limit` bytes from the end of `text`, cut on a char boundary
pub fn tail(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Keep at most `limit` bytes from the start of `text`, cut on a char boundary
pub fn head(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Append `chunk` to `buffer`, then drop the oldest bytes beyond `limit`
pub fn append_bounded(buffer: &mut String, chunk: &str, limit: usize) {
    buffer.push_str(chunk);
    if buffer.len() > limit {
        let kept = tail(buffer, limit).to_string();
        *buffer = kept;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_keeps_end() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("abc", 10), "abc");
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        // 'é' is two bytes; cutting inside it must move forward
        let s = "aé";
        assert_eq!(tail(s, 1), "");
        assert_eq!(tail(s, 2), "é");
    }

    #[test]
    fn test_head_respects_char_boundaries() {
        assert_eq!(head("éa", 1), "");
        assert_eq!(head("abcdef", 2), "ab");
    }

    #[test]
    fn test_append_bounded() {
        let mut buf = String::from("1234");
        append_bounded(&mut buf, "5678", 6);
        assert_eq!(buf, "345678");
    }
}
