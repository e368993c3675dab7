//! Transcript cleaning pipeline
//!
//! A pure, staged transformation over the raw transcript. Stage order
//! matters: word replacements run before filler removal so replacements
//! containing filler words survive; self-correction runs after command
//! processing because inserted punctuation reveals the sentence boundaries it
//! keys on; sentence cleanup always runs last. The full pipeline converges:
//! cleaning an already-clean string is a no-op.

pub mod enhance;

use crate::config::CleanerConfig;
use regex::Regex;
use std::collections::HashMap;

/// Conversational tokens removed when `remove_fillers` is on. Multi-word
/// phrases come first so they win over their parts.
const FILLERS: &[&str] = &[
    "you know",
    "sort of",
    "kind of",
    "um",
    "uh",
    "ah",
    "er",
    "like",
    "basically",
    "actually",
    "literally",
    "so",
    "well",
    "right",
    "okay",
    "alright",
    "hmm",
    "yeah",
    "yes",
    "yep",
    "mhm",
];

/// Spoken line-break commands, longest phrases first
const LINE_BREAKS: &[(&str, &str)] = &[
    ("new paragraph", "\n\n"),
    ("paragraph", "\n\n"),
    ("new line", "\n"),
    ("newline", "\n"),
    ("bullet point", "\n\u{2022} "),
    ("bullet", "\n\u{2022} "),
    ("dash", "\n\u{2022} "),
    ("tab", "\t"),
];

/// Spoken punctuation commands, longest phrases first
const PUNCTUATION: &[(&str, &str)] = &[
    ("question mark", "?"),
    ("exclamation point", "!"),
    ("semicolon", ";"),
    ("period", "."),
    ("comma", ","),
    ("colon", ":"),
];

/// Applies the deterministic cleaning stages to a transcript.
///
/// Holds an immutable option snapshot and the replacement dictionary for the
/// duration of one session; construct a fresh one per operation.
pub struct TranscriptCleaner {
    options: CleanerConfig,
    replacements: HashMap<String, String>,
}

impl TranscriptCleaner {
    pub fn new(options: CleanerConfig, replacements: HashMap<String, String>) -> Self {
        let replacements = replacements
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        Self {
            options,
            replacements,
        }
    }

    pub fn options(&self) -> &CleanerConfig {
        &self.options
    }

    /// Run every enabled stage.
    pub fn clean(&self, text: &str) -> String {
        let replaced = if self.options.word_replacements && !self.replacements.is_empty() {
            apply_word_replacements(text, &self.replacements)
        } else {
            text.to_string()
        };
        self.clean_replaced(&replaced)
    }

    /// Run the stages after word replacement. Used directly when the
    /// dictionary was already applied through the intelligent (LLM) path.
    pub fn clean_replaced(&self, text: &str) -> String {
        let mut result = text.to_string();

        if self.options.remove_fillers {
            result = remove_fillers(&result);
        }
        if self.options.line_break_commands {
            result = apply_line_break_commands(&result);
        }
        if self.options.punctuation_commands {
            result = apply_punctuation_commands(&result);
        }
        if self.options.formatting_commands {
            result = apply_formatting_commands(&result);
        }
        if self.options.self_correction {
            result = apply_self_correction(&result);
        }
        result = sentence_cleanup(&result, self.options.auto_capitalize);
        dequote_outer(&result)
    }
}

/// Word-boundary, case-insensitive phrase replacement. Keys are applied
/// longest first so multi-word phrases beat their substrings; text outside a
/// key's word boundaries is never touched.
pub fn apply_word_replacements(text: &str, replacements: &HashMap<String, String>) -> String {
    let mut keys: Vec<&String> = replacements.keys().collect();
    keys.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));

    let mut result = text.to_string();
    for key in keys {
        result = replace_phrase_case_insensitive(&result, key, &replacements[key]);
    }
    result
}

/// Replace a word/phrase case-insensitively with proper word boundaries
fn replace_phrase_case_insensitive(text: &str, from: &str, to: &str) -> String {
    let pattern = format!(r"(?i)\b{}\b", regex::escape(from));
    match Regex::new(&pattern) {
        Ok(re) => re.replace_all(text, to).into_owned(),
        Err(_) => text.to_string(),
    }
}

/// Delete filler words plus any punctuation glued to them. "actually"
/// followed by a comma is exempt: that form is the self-correction marker
/// consumed by a later stage.
pub fn remove_fillers(text: &str) -> String {
    let mut result = text.to_string();
    for filler in FILLERS {
        let pattern = if *filler == "actually" {
            // Only bare "actually"; "actually," survives for self-correction.
            r"(?i)\bactually\b(\s+|$)".to_string()
        } else {
            format!(r"(?i)\b{}\b[.,!?;]?", regex::escape(filler))
        };
        let re = Regex::new(&pattern)
            .expect("BUG: filler patterns are compile-time constants and must be valid");
        result = re.replace_all(&result, "").into_owned();
    }
    result
}

/// Spoken line-break commands: new line, bullet point, new paragraph, tab
pub fn apply_line_break_commands(text: &str) -> String {
    let mut result = text.to_string();
    for (phrase, symbol) in LINE_BREAKS {
        result = replace_phrase_case_insensitive(&result, phrase, symbol);
    }
    result
}

/// Spoken punctuation commands: period, comma, question mark, ...
pub fn apply_punctuation_commands(text: &str) -> String {
    let mut result = text.to_string();
    for (phrase, symbol) in PUNCTUATION {
        result = replace_phrase_case_insensitive(&result, phrase, symbol);
    }
    result
}

/// Quote blocks and capitalization commands:
/// `quote <text> end quote`, `all caps <text> end caps`, `cap <word>`
pub fn apply_formatting_commands(text: &str) -> String {
    let quote_re = Regex::new(r"(?i)\bquote\b\s*(.*?)\s*\bend quote\b")
        .expect("BUG: quote pattern is a compile-time constant and must be valid");
    let all_caps_re = Regex::new(r"(?i)\ball caps\b\s*(.*?)\s*\bend caps\b")
        .expect("BUG: all-caps pattern is a compile-time constant and must be valid");
    let cap_re = Regex::new(r"(?i)\bcap\b\s+(\p{Alphabetic}[\w'-]*)")
        .expect("BUG: cap pattern is a compile-time constant and must be valid");

    let result = quote_re.replace_all(text, "\"$1\"").into_owned();
    let result = all_caps_re
        .replace_all(&result, |caps: &regex::Captures| caps[1].to_uppercase())
        .into_owned();
    cap_re
        .replace_all(&result, |caps: &regex::Captures| capitalize_word(&caps[1]))
        .into_owned()
}

fn capitalize_word(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// "<A>. Actually, <B>" reduces to "<B>", repeated left-to-right until no
/// match remains.
pub fn apply_self_correction(text: &str) -> String {
    let re = Regex::new(r"(?i)[^.!?]*[.!?]\s*\bactually\b,?\s*")
        .expect("BUG: self-correction pattern is a compile-time constant and must be valid");

    let mut result = text.to_string();
    // Bounded: each application removes at least one sentence terminator.
    for _ in 0..64 {
        let next = re.replace(&result, "").into_owned();
        if next == result {
            break;
        }
        result = next;
    }
    result
}

/// Final whitespace and punctuation normalization. Runs of spaces collapse
/// to one (newlines and tabs from formatting commands are kept, with spaces
/// around newlines trimmed), punctuation is reattached to the preceding word
/// and followed by a single space, a trailing comma is dropped, and sentence
/// starts are capitalized when requested.
pub fn sentence_cleanup(text: &str, auto_capitalize: bool) -> String {
    let spaces_re = Regex::new(r" {2,}")
        .expect("BUG: cleanup patterns are compile-time constants and must be valid");
    let before_punct_re = Regex::new(r"[ \t]+([,.!?;:])").expect("BUG: constant pattern");
    let after_punct_re = Regex::new(r"([,.!?;:])(\p{Alphabetic})").expect("BUG: constant pattern");

    let mut result = spaces_re.replace_all(text, " ").into_owned();
    result = result.replace(" \n", "\n").replace("\n ", "\n");
    result = before_punct_re.replace_all(&result, "$1").into_owned();
    result = after_punct_re.replace_all(&result, "$1 $2").into_owned();

    let mut result = result.trim().to_string();
    if let Some(stripped) = result.strip_suffix(',') {
        result = stripped.trim_end().to_string();
    }

    if auto_capitalize {
        result = capitalize_sentences(&result);
    }
    result
}

/// Uppercase the first letter of the string and of every sentence, where a
/// sentence starts after one of `.!?` followed by whitespace.
fn capitalize_sentences(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut capitalize_next = true;
    let mut after_terminator = false;

    for c in text.chars() {
        if after_terminator && c.is_whitespace() {
            capitalize_next = true;
            after_terminator = false;
        } else if after_terminator {
            after_terminator = false;
        }

        if matches!(c, '.' | '!' | '?') {
            after_terminator = true;
        }

        if capitalize_next && c.is_alphabetic() {
            out.extend(c.to_uppercase());
            capitalize_next = false;
        } else {
            if !c.is_whitespace() && !matches!(c, '"' | '\'' | '\u{2022}') {
                capitalize_next = false;
            }
            out.push(c);
        }
    }
    out
}

/// Strip exactly one pair of matching outer quotes, if present.
pub fn dequote_outer(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() >= 2 {
        let first = trimmed.chars().next();
        let last = trimmed.chars().last();
        if first == last && matches!(first, Some('"') | Some('\'')) {
            let mut chars = trimmed.chars();
            chars.next();
            chars.next_back();
            return chars.as_str().to_string();
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_on() -> CleanerConfig {
        CleanerConfig::default()
    }

    fn cleaner(options: CleanerConfig) -> TranscriptCleaner {
        TranscriptCleaner::new(options, HashMap::new())
    }

    fn cleaner_with(replacements: &[(&str, &str)]) -> TranscriptCleaner {
        TranscriptCleaner::new(
            all_on(),
            replacements
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    // --- stage tests ---

    #[test]
    fn test_remove_fillers_basic() {
        assert_eq!(remove_fillers("um hello uh world").trim(), "hello  world".trim());
        let out = sentence_cleanup(&remove_fillers("um hello uh world"), false);
        assert_eq!(out, "hello world");
    }

    #[test]
    fn test_remove_fillers_with_glued_comma() {
        let out = sentence_cleanup(&remove_fillers("Um, hello there"), false);
        assert_eq!(out, "hello there");
    }

    #[test]
    fn test_remove_fillers_multiword() {
        let out = sentence_cleanup(&remove_fillers("it was you know sort of fine"), false);
        assert_eq!(out, "it was fine");
    }

    #[test]
    fn test_remove_fillers_keeps_correction_marker() {
        // "actually," is the self-correction marker and must survive.
        let out = remove_fillers("go left. Actually, go right");
        assert!(out.contains("Actually,"));
        // Bare "actually" is still a filler.
        let out = remove_fillers("it was actually fine");
        assert!(!out.to_lowercase().contains("actually"));
    }

    #[test]
    fn test_fillers_do_not_eat_substrings() {
        let out = remove_fillers("the summer solstice");
        assert_eq!(out, "the summer solstice");
        let out = remove_fillers("also a solution");
        assert_eq!(out, "also a solution");
    }

    #[test]
    fn test_punctuation_commands() {
        let out = sentence_cleanup(&apply_punctuation_commands("hello period how are you question mark"), false);
        assert_eq!(out, "hello. how are you?");
    }

    #[test]
    fn test_line_break_commands() {
        assert_eq!(
            apply_line_break_commands("one new line two"),
            "one \n two"
        );
        assert_eq!(
            apply_line_break_commands("one new paragraph two"),
            "one \n\n two"
        );
        assert_eq!(apply_line_break_commands("a tab b"), "a \t b");
        assert!(apply_line_break_commands("item bullet point milk").contains("\n\u{2022} "));
    }

    #[test]
    fn test_quote_block() {
        let out = apply_formatting_commands("she said quote hello there end quote loudly");
        assert_eq!(out, "she said \"hello there\" loudly");
    }

    #[test]
    fn test_all_caps_block() {
        let out = apply_formatting_commands("this is all caps very important end caps okay");
        assert_eq!(out, "this is VERY IMPORTANT okay");
    }

    #[test]
    fn test_cap_command() {
        let out = apply_formatting_commands("say cap hello to everyone");
        assert_eq!(out, "say Hello to everyone");
    }

    #[test]
    fn test_self_correction_single() {
        let out = apply_self_correction("go to the left. Actually, go to the right.");
        assert_eq!(out, "go to the right.");
    }

    #[test]
    fn test_self_correction_multiple_left_to_right() {
        let out = apply_self_correction("A. Actually, B. Actually, C.");
        assert_eq!(out, "C.");
    }

    #[test]
    fn test_self_correction_without_leading_sentence() {
        // No preceding terminator: nothing to correct.
        let out = apply_self_correction("Actually, this stays");
        assert_eq!(out, "Actually, this stays");
    }

    #[test]
    fn test_sentence_cleanup_spacing() {
        assert_eq!(
            sentence_cleanup("hello   world ,  again .next", false),
            "hello world, again. next"
        );
    }

    #[test]
    fn test_sentence_cleanup_preserves_newlines() {
        assert_eq!(sentence_cleanup("one \n two", false), "one\ntwo");
    }

    #[test]
    fn test_sentence_cleanup_trailing_comma() {
        assert_eq!(sentence_cleanup("see you soon,", false), "see you soon");
    }

    #[test]
    fn test_sentence_cleanup_capitalization() {
        assert_eq!(
            sentence_cleanup("first one. second one! third one? fourth", true),
            "First one. Second one! Third one? Fourth"
        );
    }

    #[test]
    fn test_capitalization_skips_decimals() {
        // The period in "3.5" is not followed by whitespace, so it is not a
        // sentence boundary and no space is inserted after it.
        assert_eq!(sentence_cleanup("version 3.5 shipped", true), "Version 3.5 shipped");
    }

    #[test]
    fn test_dequote_outer() {
        assert_eq!(dequote_outer("\"hello\""), "hello");
        assert_eq!(dequote_outer("'hello'"), "hello");
        assert_eq!(dequote_outer("\"hello'"), "\"hello'");
        assert_eq!(dequote_outer("plain"), "plain");
        assert_eq!(dequote_outer("\"\""), "");
    }

    // --- word replacement laws ---

    #[test]
    fn test_replacement_case_insensitive_word_boundary() {
        let c = cleaner_with(&[("near chat", "Ner chat")]);
        let out = c.clean("I joined Near Chat today");
        assert!(out.contains("Ner chat"), "{out}");
        assert!(out.starts_with("I joined"));
        assert!(out.ends_with("today"));
    }

    #[test]
    fn test_replacement_preserves_text_outside_boundaries() {
        let mut map = HashMap::new();
        map.insert("cat".to_string(), "dog".to_string());
        // "cat" inside "catalog" has no word boundary and must survive.
        assert_eq!(
            apply_word_replacements("the catalog has a cat", &map),
            "the catalog has a dog"
        );
    }

    #[test]
    fn test_replacement_longest_key_wins() {
        let mut map = HashMap::new();
        map.insert("new york".to_string(), "New York".to_string());
        map.insert("york".to_string(), "York".to_string());
        assert_eq!(
            apply_word_replacements("visiting new york", &map),
            "visiting New York"
        );
    }

    #[test]
    fn test_replacements_run_before_filler_removal() {
        // The replacement key contains a filler phrase. It can only match
        // because replacements run before the filler stage deletes "you know".
        let c = cleaner_with(&[("you know who", "Voldemort")]);
        let out = c.clean("it was you know who period");
        assert_eq!(out, "It was Voldemort.");
    }

    // --- full pipeline ---

    #[test]
    fn test_filler_command_self_correction_pipeline() {
        let c = cleaner(all_on());
        let out = c.clean(
            "Um, hello there period Actually, uh, good morning period How are you doing question mark",
        );
        assert_eq!(out, "Good morning. How are you doing?");
    }

    #[test]
    fn test_disabled_stages_pass_through() {
        let options = CleanerConfig {
            remove_fillers: false,
            line_break_commands: false,
            punctuation_commands: false,
            formatting_commands: false,
            self_correction: false,
            auto_capitalize: false,
            word_replacements: false,
            intelligent_replacements: false,
        };
        let c = cleaner(options);
        assert_eq!(c.clean("um hello period"), "um hello period");
    }

    #[test]
    fn test_clean_is_stable() {
        let c = cleaner(all_on());
        let inputs = [
            "Um, hello there period Actually, uh, good morning period How are you doing question mark",
            "this is all caps very important end caps comma okay question mark",
            "first line new line second line period",
            "she said quote don't panic end quote period",
            "plain text with nothing to do",
            "trailing comma,",
        ];
        for input in inputs {
            let once = c.clean(input);
            let twice = c.clean(&once);
            assert_eq!(once, twice, "pipeline not stable for {input:?}");
        }
    }

    #[test]
    fn test_quote_command_then_outer_dequote() {
        // A transcript that is nothing but a quote block loses the wrapping
        // pair again in the final stage.
        let c = cleaner(all_on());
        assert_eq!(c.clean("quote hello world end quote"), "Hello world");
    }

    #[test]
    fn test_empty_input() {
        let c = cleaner(all_on());
        assert_eq!(c.clean(""), "");
        assert_eq!(c.clean("   "), "");
    }

    #[test]
    fn test_whitespace_only_after_filler_removal() {
        let c = cleaner(all_on());
        assert_eq!(c.clean("um uh hmm"), "");
    }
}
