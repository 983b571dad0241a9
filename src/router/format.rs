//! 回复文本处理：Markdown 粗体转聊天粗体、超长分段

/// `**bold**` -> `*bold*`
pub fn format_reply(text: &str) -> String {
    text.replace("**", "*")
}

/// 按字符数分段；优先在窗口后半段的最后一个换行处断开
pub fn chunk_reply(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let mut end = (start + max_chars).min(chars.len());
        if end < chars.len() {
            if let Some(nl) = chars[start..end].iter().rposition(|c| *c == '\n') {
                if nl >= max_chars / 2 {
                    end = start + nl + 1;
                }
            }
        }
        let chunk: String = chars[start..end].iter().collect();
        let trimmed = chunk.trim_end_matches('\n');
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }
        start = end;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bold_collapsed() {
        assert_eq!(format_reply("**Hi** there, **you**"), "*Hi* there, *you*");
        assert_eq!(format_reply("plain"), "plain");
    }

    #[test]
    fn test_short_text_single_chunk() {
        assert_eq!(chunk_reply("hello", 10), vec!["hello".to_string()]);
    }

    #[test]
    fn test_chunks_respect_limit_and_newlines() {
        let text = format!("{}\n{}", "a".repeat(8), "b".repeat(8));
        let chunks = chunk_reply(&text, 10);
        assert_eq!(chunks, vec!["a".repeat(8), "b".repeat(8)]);

        let long = "x".repeat(25);
        let chunks = chunk_reply(&long, 10);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
        assert_eq!(chunks.concat(), long);
    }

    #[test]
    fn test_multibyte_counts_chars() {
        let text = "é".repeat(12);
        let chunks = chunk_reply(&text, 5);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chars().count(), 5);
    }
}
