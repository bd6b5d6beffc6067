use std::ops::Range;

use regex::{Regex, RegexBuilder};

/// Output of a rewrite pass: the new text plus every byte range in it that a
/// rewrite produced (including ranges carried over from the protected input).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    pub text: String,
    pub produced: Vec<Range<usize>>,
}

#[derive(Debug, Clone)]
struct WordRule {
    pattern: Regex,
    replacement: String,
    qualifiers: Vec<String>,
}

/// Ordered whole-word substitutions.
///
/// A match only counts when the characters on either side of it are not
/// alphanumeric, so `bra` never fires inside `celebration`. Matching is
/// case-insensitive and a capitalized match yields a capitalized replacement.
/// Rules run in declaration order, each once, left to right and without
/// overlap; nothing a rule produced (or a caller marked protected) is touched
/// by a later rule.
#[derive(Debug, Clone, Default)]
pub struct WordRewriter {
    rules: Vec<WordRule>,
}

impl WordRewriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rule. `qualifiers` are words that, directly in front of a
    /// match, make it ineligible. Patterns that cannot be compiled are
    /// dropped with a warning rather than poisoning the whole table.
    pub fn push(&mut self, pattern: &str, replacement: &str, qualifiers: &[String]) {
        let Some(compiled) = compile_pattern(pattern) else {
            log::warn!("skipping unusable rewrite pattern {pattern:?}");
            return;
        };
        self.rules.push(WordRule {
            pattern: compiled,
            replacement: replacement.trim().to_string(),
            qualifiers: qualifiers
                .iter()
                .map(|word| word.trim().to_lowercase())
                .filter(|word| !word.is_empty())
                .collect(),
        });
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rewrite(&self, text: &str, protected: &[Range<usize>]) -> Rewrite {
        let mut current = Rewrite {
            text: text.to_string(),
            produced: protected.to_vec(),
        };
        for rule in &self.rules {
            current = apply_rule(rule, &current);
        }
        current.produced.sort_by_key(|range| range.start);
        current
    }
}

fn compile_pattern(pattern: &str) -> Option<Regex> {
    let words: Vec<String> = pattern.split_whitespace().map(regex::escape).collect();
    if words.is_empty() {
        return None;
    }
    RegexBuilder::new(&words.join(r"\s+"))
        .case_insensitive(true)
        .build()
        .ok()
}

fn apply_rule(rule: &WordRule, input: &Rewrite) -> Rewrite {
    let text = input.text.as_str();
    let mut accepted: Vec<(Range<usize>, String)> = Vec::new();
    let mut at = 0;
    while at <= text.len() {
        let Some(found) = rule.pattern.find_at(text, at) else {
            break;
        };
        let range = found.range();
        if range.is_empty() {
            break;
        }
        let eligible = is_whole_word(text, &range)
            && !overlaps_any(&range, &input.produced)
            && !is_qualified(text, range.start, &rule.qualifiers);
        if eligible {
            accepted.push((range.clone(), match_case(found.as_str(), &rule.replacement)));
            at = range.end;
        } else {
            at = next_char_boundary(text, range.start);
        }
    }
    if accepted.is_empty() {
        return input.clone();
    }

    let mut out = String::with_capacity(text.len());
    let mut produced = Vec::with_capacity(input.produced.len() + accepted.len());
    let mut cursor = 0;
    for (range, replacement) in &accepted {
        out.push_str(&text[cursor..range.start]);
        let start = out.len();
        out.push_str(replacement);
        produced.push(start..out.len());
        cursor = range.end;
    }
    out.push_str(&text[cursor..]);

    let shift = |pos: usize| -> usize {
        let mut shifted = pos as isize;
        for (range, replacement) in &accepted {
            if range.end <= pos {
                shifted += replacement.len() as isize - range.len() as isize;
            }
        }
        shifted.max(0) as usize
    };
    for range in &input.produced {
        produced.push(shift(range.start)..shift(range.end));
    }
    Rewrite {
        text: out,
        produced,
    }
}

fn is_whole_word(text: &str, range: &Range<usize>) -> bool {
    let before = text[..range.start].chars().next_back();
    let after = text[range.end..].chars().next();
    !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
}

fn overlaps_any(range: &Range<usize>, protected: &[Range<usize>]) -> bool {
    protected
        .iter()
        .any(|guard| range.start < guard.end && guard.start < range.end)
}

fn is_qualified(text: &str, start: usize, qualifiers: &[String]) -> bool {
    if qualifiers.is_empty() {
        return false;
    }
    let head = text[..start].trim_end();
    let word: String = head
        .chars()
        .rev()
        .take_while(|ch| ch.is_alphanumeric() || *ch == '-')
        .collect::<Vec<char>>()
        .into_iter()
        .rev()
        .collect();
    !word.is_empty() && qualifiers.contains(&word.to_lowercase())
}

fn match_case(matched: &str, replacement: &str) -> String {
    let leading_upper = matched.chars().next().is_some_and(char::is_uppercase);
    if !leading_upper {
        return replacement.to_string();
    }
    let mut chars = replacement.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn next_char_boundary(text: &str, from: usize) -> usize {
    text[from..]
        .chars()
        .next()
        .map(|ch| from + ch.len_utf8())
        .unwrap_or(text.len() + 1)
}
