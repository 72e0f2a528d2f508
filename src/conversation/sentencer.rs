//! Sentence segmentation of a streamed reply
//!
//! Fragments from the language model are accumulated and cut at sentence
//! terminators. Short sentences are batched so synthesis runs on reasonably
//! sized chunks, and every batch is dispatched for synthesis as soon as it is
//! complete.

use std::sync::{Arc, LazyLock};

use regex::Regex;

use super::sequencer::{PlaybackQueue, SynthesisJob};
use crate::config::SentencerConfig;
use crate::voice::Synthesizer;

const LATIN_TERMINATORS: &[char] = &['.', '!', '?', '…'];
const CJK_TERMINATORS: &[char] = &['。', '！', '？'];
const CLOSERS: &[char] = &['"', '\'', '”', '’', ')', ']', '」', '』'];

static EMPHASIS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)\*+|~~|`+|__+|^\s*#+\s*|^\s*[-*]\s+").expect("valid regex")
});

static EMOJI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\p{Extended_Pictographic}\u{FE0F}\u{200D}\u{20E3}]").expect("valid regex")
});

static SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s{2,}").expect("valid regex"));

/// A sentence (or batch of short sentences) dispatched for synthesis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    pub index: usize,
    pub text: String,
}

/// Splits streamed reply text into sentences and dispatches synthesis
pub struct ResponseSentencer {
    accumulated: String,
    batch: String,
    merge_chars: usize,
    index: usize,
    synthesizer: Arc<dyn Synthesizer>,
    queue: PlaybackQueue,
}

impl std::fmt::Debug for ResponseSentencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseSentencer")
            .field("accumulated", &self.accumulated)
            .field("batch", &self.batch)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl ResponseSentencer {
    #[must_use]
    pub fn new(
        config: &SentencerConfig,
        synthesizer: Arc<dyn Synthesizer>,
        queue: PlaybackQueue,
    ) -> Self {
        Self {
            accumulated: String::new(),
            batch: String::new(),
            merge_chars: config.merge_chars,
            index: 0,
            synthesizer,
            queue,
        }
    }

    /// Feed a reply fragment; returns sentences dispatched as a result
    pub fn push(&mut self, fragment: &str) -> Vec<Sentence> {
        self.accumulated.push_str(&fragment.replace(['\r', '\n'], " "));

        let (sentences, rest) = split_sentences(&self.accumulated, false);
        self.accumulated = rest;

        let mut dispatched = Vec::new();
        for sentence in sentences {
            self.merge(&sentence, &mut dispatched);
        }
        dispatched
    }

    /// Flush everything left, including text without terminal punctuation,
    /// and mark the playback queue as ended
    pub fn finish(&mut self) -> Vec<Sentence> {
        let (sentences, rest) = split_sentences(&std::mem::take(&mut self.accumulated), true);

        let mut dispatched = Vec::new();
        for sentence in sentences {
            self.merge(&sentence, &mut dispatched);
        }
        if !rest.trim().is_empty() {
            self.merge(rest.trim(), &mut dispatched);
        }
        if let Some(sentence) = self.flush() {
            dispatched.push(sentence);
        }

        self.queue.end();
        tracing::debug!(sentences = self.index, "reply segmented");
        dispatched
    }

    /// Sentences dispatched so far
    #[must_use]
    pub const fn dispatched(&self) -> usize {
        self.index
    }

    fn merge(&mut self, sentence: &str, dispatched: &mut Vec<Sentence>) {
        let incoming = sentence.chars().count();
        let buffered = self.batch.chars().count();

        if buffered > 0 && buffered + 1 + incoming > self.merge_chars {
            dispatched.extend(self.flush());
        }

        if !self.batch.is_empty() {
            self.batch.push(' ');
        }
        self.batch.push_str(sentence);

        if self.batch.chars().count() >= self.merge_chars {
            dispatched.extend(self.flush());
        }
    }

    fn flush(&mut self) -> Option<Sentence> {
        let text = clean_for_speech(&std::mem::take(&mut self.batch));
        // Nothing to say once emoji are gone
        if !text.chars().any(char::is_alphanumeric) {
            return None;
        }

        let index = self.index;
        self.index += 1;
        tracing::debug!(index, text = %text, "dispatching synthesis");
        self.queue.push(SynthesisJob::spawn(
            index,
            text.clone(),
            Arc::clone(&self.synthesizer),
        ));

        Some(Sentence { index, text })
    }
}

/// Split `text` into complete sentences and the unterminated remainder
///
/// A Latin terminator (`. ! ? …`) ends a sentence only when followed by
/// whitespace or the end of the text; CJK terminators end one unconditionally.
/// A candidate made only of digits and punctuation (a list number, the integer
/// part of a decimal) is extended to the next terminator. While streaming
/// (`is_final == false`), a trailing `.` right after a digit is held back since
/// it may be a decimal point.
#[must_use]
pub fn split_sentences(text: &str, is_final: bool) -> (Vec<String>, String) {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i].1;
        let cjk = CJK_TERMINATORS.contains(&c);
        if !cjk && !LATIN_TERMINATORS.contains(&c) {
            i += 1;
            continue;
        }

        // Absorb runs like "?!" or "..." and closing quotes
        let mut j = i + 1;
        while j < chars.len() && is_trailing(chars[j].1) {
            j += 1;
        }
        let at_end = j == chars.len();
        let end = chars.get(j).map_or(text.len(), |&(b, _)| b);

        if !cjk {
            if !at_end && !chars[j].1.is_whitespace() {
                i = j;
                continue;
            }
            let after_digit = i > 0 && chars[i - 1].1.is_ascii_digit();
            if at_end && !is_final && c == '.' && after_digit {
                break;
            }
        }

        let candidate = text[start..end].trim();
        if candidate.is_empty() {
            start = end;
        } else if !is_trivial(candidate) {
            sentences.push(candidate.to_string());
            start = end;
        }
        i = j;
    }

    (sentences, text[start..].trim_start().to_string())
}

fn is_trailing(c: char) -> bool {
    LATIN_TERMINATORS.contains(&c) || CJK_TERMINATORS.contains(&c) || CLOSERS.contains(&c)
}

fn is_trivial(candidate: &str) -> bool {
    candidate
        .chars()
        .all(|c| c.is_numeric() || c.is_whitespace() || c.is_ascii_punctuation() || is_trailing(c))
}

/// Strip markdown emphasis and emoji that should not be read aloud
#[must_use]
pub fn clean_for_speech(text: &str) -> String {
    let text = EMPHASIS.replace_all(text, "");
    let text = EMOJI.replace_all(&text, "");
    SPACES.replace_all(text.trim(), " ").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Result;
    use crate::voice::{AudioSource, SynthesizedAudio};
    use async_trait::async_trait;

    struct NullSynth;

    #[async_trait]
    impl Synthesizer for NullSynth {
        async fn synthesize(&self, _text: &str) -> Result<SynthesizedAudio> {
            Ok(SynthesizedAudio {
                source: AudioSource::Data(Vec::new()),
                duration_ms: 0,
            })
        }
    }

    fn sentencer(merge_chars: usize) -> (ResponseSentencer, PlaybackQueue) {
        let queue = PlaybackQueue::new();
        (
            ResponseSentencer::new(
                &SentencerConfig { merge_chars },
                Arc::new(NullSynth),
                queue.clone(),
            ),
            queue,
        )
    }

    #[test]
    fn test_decimal_not_split() {
        let (sentences, rest) = split_sentences("Hello world. This is 3.14 and more text.", true);
        assert_eq!(sentences, vec!["Hello world.", "This is 3.14 and more text."]);
        assert_eq!(rest, "");
    }

    #[test]
    fn test_trailing_digit_dot_held_while_streaming() {
        let (sentences, rest) = split_sentences("Hi there. The value is 3.", false);
        assert_eq!(sentences, vec!["Hi there."]);
        assert_eq!(rest, "The value is 3.");
    }

    #[test]
    fn test_unterminated_remainder_kept() {
        let (sentences, rest) = split_sentences("Done! And then", false);
        assert_eq!(sentences, vec!["Done!"]);
        assert_eq!(rest, "And then");
    }

    #[test]
    fn test_list_number_extends_to_next_terminator() {
        let (sentences, rest) = split_sentences("1. Buy milk. 2. ", false);
        assert_eq!(sentences, vec!["1. Buy milk."]);
        assert_eq!(rest, "2. ");
    }

    #[test]
    fn test_cjk_terminators() {
        let (sentences, rest) = split_sentences("你好。今天天气很好！明天", false);
        assert_eq!(sentences, vec!["你好。", "今天天气很好！"]);
        assert_eq!(rest, "明天");
    }

    #[test]
    fn test_punctuation_runs_and_quotes() {
        let (sentences, _) = split_sentences("Really?! She said \"no.\" Fine", false);
        assert_eq!(sentences, vec!["Really?!", "She said \"no.\""]);
    }

    #[test]
    fn test_clean_for_speech() {
        assert_eq!(clean_for_speech("**Great** news 🎉!"), "Great news !");
        assert_eq!(clean_for_speech("## Title"), "Title");
        assert_eq!(clean_for_speech("use `cargo` now"), "use cargo now");
        assert_eq!(clean_for_speech("snake_case stays"), "snake_case stays");
    }

    #[tokio::test]
    async fn test_short_sentences_merged() {
        let (mut sentencer, queue) = sentencer(60);

        let first = sentencer.push("Sure. I can help. ");
        assert!(first.is_empty());

        let second = sentencer.push(
            "Here is a much longer sentence that goes well past the merge limit. ",
        );
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].text, "Sure. I can help.");
        assert_eq!(second[0].index, 0);
        assert_eq!(second[1].index, 1);

        let rest = sentencer.finish();
        assert!(rest.is_empty());
        assert_eq!(queue.pending(), 2);
        assert!(queue.is_ended());
    }

    #[tokio::test]
    async fn test_finish_flushes_unterminated_text() {
        let (mut sentencer, queue) = sentencer(60);

        assert!(sentencer.push("The answer is").is_empty());
        assert!(sentencer.push(" 42").is_empty());

        let flushed = sentencer.finish();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].text, "The answer is 42");
        assert_eq!(queue.pending(), 1);
    }

    #[tokio::test]
    async fn test_emoji_only_sentence_dropped() {
        let (mut sentencer, queue) = sentencer(1);

        let dispatched = sentencer.push("🎉🎉! Okay. ");
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].text, "Okay.");
        assert_eq!(dispatched[0].index, 0);
        sentencer.finish();
        assert_eq!(queue.pending(), 1);
    }

    #[tokio::test]
    async fn test_line_breaks_normalized() {
        let (mut sentencer, _queue) = sentencer(1);
        let dispatched = sentencer.push("First line.\nSecond line.\n");
        assert_eq!(
            dispatched.iter().map(|s| s.text.as_str()).collect::<Vec<_>>(),
            vec!["First line.", "Second line."]
        );
    }
}
