/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Overlap-aware transcript merging.
//!
//! Adjacent chunks cut at a hard boundary share a 1.5 s overlap, so the tail
//! words of one transcript can repeat at the head of the next. The merge
//! drops the longest repeated word run (up to 10 words); silence-cut
//! boundaries have no repetition and concatenate unchanged.

/// Maximum overlap window in words; generous for a 1.5 s overlap.
const MAX_OVERLAP_WORDS: usize = 10;

/// Merges two adjacent transcripts, de-duplicating the overlap region.
pub fn merge_transcripts(t1: &str, t2: &str) -> String {
    let t1 = t1.trim();
    let t2 = t2.trim();
    if t1.is_empty() {
        return t2.to_string();
    }
    if t2.is_empty() {
        return t1.to_string();
    }

    let w1: Vec<&str> = t1.split_whitespace().collect();
    let w2: Vec<&str> = t2.split_whitespace().collect();
    let max_match = MAX_OVERLAP_WORDS.min(w1.len()).min(w2.len());

    let mut best = 0;
    for k in 1..=max_match {
        if w1[w1.len() - k..] == w2[..k] {
            best = k;
        }
    }

    let remaining = &w2[best..];
    if remaining.is_empty() {
        return t1.to_string();
    }
    format!("{} {}", t1, remaining.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_inputs_pass_through() {
        assert_eq!(merge_transcripts("hello", ""), "hello");
        assert_eq!(merge_transcripts("", "world"), "world");
        assert_eq!(merge_transcripts("", ""), "");
    }

    #[test]
    fn overlap_is_dropped_exactly_once() {
        assert_eq!(
            merge_transcripts(
                "the quick brown fox jumps over",
                "jumps over the lazy dog"
            ),
            "the quick brown fox jumps over the lazy dog"
        );
    }

    #[test]
    fn no_overlap_concatenates() {
        assert_eq!(merge_transcripts("first part.", "second part."), "first part. second part.");
    }

    #[test]
    fn picks_the_largest_matching_run() {
        // "b a b" suffix matches a 1-word and a 3-word run; the larger wins.
        assert_eq!(merge_transcripts("x b a b", "b a b y"), "x b a b y");
    }

    #[test]
    fn full_containment_returns_prefix() {
        assert_eq!(merge_transcripts("one two three", "two three"), "one two three");
    }

    #[test]
    fn overlap_window_is_capped_at_ten_words() {
        let words: Vec<String> = (0..12).map(|i| format!("w{}", i)).collect();
        let t = words.join(" ");
        // A full 12-word repetition exceeds the 10-word window, so no overlap
        // is detected and the texts concatenate unchanged.
        let merged = merge_transcripts(&t, &t);
        assert_eq!(merged, format!("{} {}", t, t));

        // At exactly ten words the repetition still collapses.
        let ten = words[..10].join(" ");
        assert_eq!(merge_transcripts(&ten, &ten), ten);
    }

    #[test]
    fn whitespace_is_normalized_at_the_seam() {
        assert_eq!(merge_transcripts("  hello world ", " world again "), "hello world again");
    }
}
