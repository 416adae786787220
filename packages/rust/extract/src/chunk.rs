//! Sentence-packing text chunker.
//!
//! Sentences are packed into chunks of at most `max_chars`, with the last
//! `overlap` characters of each chunk carried into the next so retrieval
//! does not lose context at chunk boundaries. Words are never split; a
//! sentence longer than `max_chars` is broken at word boundaries instead.

/// Split `text` into retrieval-sized chunks.
///
/// Empty or whitespace-only input yields no chunks. Text that fits in one
/// chunk is returned as-is.
pub fn chunk_text(text: &str, max_chars: usize, overlap: usize) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() || max_chars == 0 {
        return Vec::new();
    }
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    // True while `current` holds only overlap carried from the previous chunk.
    let mut carried_only = false;

    for sentence in split_sentences(text) {
        for piece in split_to_fit(sentence, max_chars) {
            if !fits(&current, &piece, max_chars) {
                if carried_only {
                    // Never emit a chunk made purely of carried overlap.
                    current.clear();
                } else {
                    let tail = overlap_tail(&current, overlap);
                    chunks.push(std::mem::take(&mut current));
                    current = tail;
                    carried_only = !current.is_empty();
                    if !fits(&current, &piece, max_chars) {
                        current.clear();
                        carried_only = false;
                    }
                }
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(&piece);
            carried_only = false;
        }
    }

    if !current.is_empty() && !carried_only {
        chunks.push(current);
    }

    chunks
}

fn fits(current: &str, piece: &str, max_chars: usize) -> bool {
    let sep = usize::from(!current.is_empty());
    current.chars().count() + sep + piece.chars().count() <= max_chars
}

/// Split text at sentence boundaries: `.` `!` `?` followed by whitespace,
/// or a newline. Keeps the terminator with its sentence.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut after_terminator = false;

    for (i, ch) in text.char_indices() {
        if after_terminator && ch.is_whitespace() || ch == '\n' {
            let sentence = text[start..i].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = i;
            after_terminator = false;
            continue;
        }
        after_terminator = matches!(ch, '.' | '!' | '?');
    }

    let last = text[start..].trim();
    if !last.is_empty() {
        sentences.push(last);
    }

    sentences
}

/// Break an oversized sentence into word-boundary pieces of at most
/// `max_chars`. A single word longer than `max_chars` is split hard at a
/// character boundary.
fn split_to_fit(sentence: &str, max_chars: usize) -> Vec<String> {
    if sentence.chars().count() <= max_chars {
        return vec![sentence.to_string()];
    }

    let mut pieces = Vec::new();
    let mut piece = String::new();
    let mut piece_chars = 0usize;

    for word in sentence.split_whitespace() {
        let word_chars = word.chars().count();

        if word_chars > max_chars {
            if !piece.is_empty() {
                pieces.push(std::mem::take(&mut piece));
                piece_chars = 0;
            }
            let mut buf = String::new();
            for c in word.chars() {
                buf.push(c);
                if buf.chars().count() == max_chars {
                    pieces.push(std::mem::take(&mut buf));
                }
            }
            if !buf.is_empty() {
                piece = buf;
                piece_chars = piece.chars().count();
            }
            continue;
        }

        let sep = usize::from(!piece.is_empty());
        if piece_chars + sep + word_chars > max_chars {
            pieces.push(std::mem::take(&mut piece));
            piece_chars = 0;
        }
        if !piece.is_empty() {
            piece.push(' ');
            piece_chars += 1;
        }
        piece.push_str(word);
        piece_chars += word_chars;
    }

    if !piece.is_empty() {
        pieces.push(piece);
    }

    pieces
}

/// Last `overlap` characters of `chunk`, extended forward to the next word
/// boundary so the carried text starts on a whole word.
fn overlap_tail(chunk: &str, overlap: usize) -> String {
    if overlap == 0 {
        return String::new();
    }

    let chars: Vec<char> = chunk.chars().collect();
    if chars.len() <= overlap {
        return chunk.to_string();
    }

    let mut start = chars.len() - overlap;
    while start < chars.len() && !chars[start - 1].is_whitespace() {
        start += 1;
    }

    chars[start..].iter().collect::<String>().trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(chunk_text("", 1000, 120).is_empty());
        assert!(chunk_text("   \n  ", 1000, 120).is_empty());
    }

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = chunk_text("A single short sentence.", 1000, 120);
        assert_eq!(chunks, vec!["A single short sentence."]);
    }

    #[test]
    fn chunks_respect_max_chars() {
        let sentence = "The quick brown fox jumps over the lazy dog. ";
        let text = sentence.repeat(50);
        let chunks = chunk_text(&text, 200, 40);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 200, "chunk too long: {chunk}");
        }
    }

    #[test]
    fn consecutive_chunks_share_overlap() {
        let sentence = "Green chile stew simmers for hours on the stove. ";
        let text = sentence.repeat(30);
        let chunks = chunk_text(&text, 150, 40);

        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            let tail: String = pair[0]
                .chars()
                .rev()
                .take(40)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            // The start of the next chunk repeats words from the previous tail.
            let first_word = pair[1].split_whitespace().next().unwrap();
            assert!(
                tail.contains(first_word),
                "no overlap between '{}' and '{}'",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn words_are_never_split() {
        let text = "supercalifragilistic expialidocious ".repeat(40);
        let chunks = chunk_text(&text, 100, 20);

        for chunk in &chunks {
            for word in chunk.split_whitespace() {
                assert!(
                    word == "supercalifragilistic" || word == "expialidocious",
                    "split word: {word}"
                );
            }
        }
    }

    #[test]
    fn giant_single_word_is_hard_split() {
        let text = "x".repeat(350);
        let chunks = chunk_text(&text, 100, 10);
        assert!(chunks.len() >= 3);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 100);
        }
    }

    #[test]
    fn newline_is_a_sentence_boundary() {
        let sentences = split_sentences("First line\nSecond line. Third sentence");
        assert_eq!(sentences, vec!["First line", "Second line.", "Third sentence"]);
    }
}
