use super::DocumentChunk;

/// Split `text` into overlapping character windows.
///
/// Windows are `chunk_size` characters long and start `chunk_size - overlap`
/// characters apart; the window that reaches the end of the text is the last
/// one. Windows that are empty after trimming are skipped and do not consume
/// a chunk index.
pub fn split_into_chunks(
    text: &str,
    source_file: &str,
    chunk_size: usize,
    overlap: usize,
) -> Vec<DocumentChunk> {
    let chars: Vec<char> = text.chars().collect();
    let size = chunk_size.max(1);
    let step = size.saturating_sub(overlap).max(1);

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + size).min(chars.len());
        let window: String = chars[start..end].iter().collect();
        let content = window.trim();
        if !content.is_empty() {
            let index = chunks.len();
            chunks.push(DocumentChunk {
                chunk_id: format!("{source_file}_{index}"),
                content: content.to_string(),
                source_file: source_file.to_string(),
                chunk_index: index,
                start_pos: start,
                end_pos: end,
            });
        }
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}
