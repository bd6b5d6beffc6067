use atelier_contracts::vocabulary::{SubstitutionRule, VocabularyTables, VocabularyTier};

use crate::rewrite::{Rewrite, WordRewriter};

/// Rewrites flagged vocabulary into policy-safe equivalents. The fallback
/// tier is a stronger table reserved for resubmission after the provider
/// rejected a prompt on policy grounds.
#[derive(Debug, Clone)]
pub struct VocabularyTransformer {
    default: WordRewriter,
    fallback: WordRewriter,
}

impl VocabularyTransformer {
    pub fn new(tables: &VocabularyTables) -> Self {
        Self {
            default: build(tables.rules(VocabularyTier::Default)),
            fallback: build(tables.rules(VocabularyTier::Fallback)),
        }
    }

    pub fn builtin() -> Self {
        Self::new(&VocabularyTables::builtin())
    }

    pub fn transform(&self, text: &str, tier: VocabularyTier) -> String {
        self.transform_marked(text, tier).text
    }

    pub fn transform_marked(&self, text: &str, tier: VocabularyTier) -> Rewrite {
        let rewriter = match tier {
            VocabularyTier::Default => &self.default,
            VocabularyTier::Fallback => &self.fallback,
        };
        rewriter.rewrite(text, &[])
    }
}

impl Default for VocabularyTransformer {
    fn default() -> Self {
        Self::builtin()
    }
}

fn build(rules: &[SubstitutionRule]) -> WordRewriter {
    let mut rewriter = WordRewriter::new();
    for rule in rules {
        rewriter.push(&rule.pattern, &rule.replacement, &[]);
    }
    rewriter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn celebration_survives_and_transform_is_idempotent() {
        let transformer = VocabularyTransformer::builtin();
        let once = transformer.transform("celebration of lingerie", VocabularyTier::Default);
        assert_eq!(once, "celebration of loungewear set");
        let twice = transformer.transform(&once, VocabularyTier::Default);
        assert_eq!(twice, once);
    }

    #[test]
    fn fallback_tier_is_stronger_and_idempotent() {
        let transformer = VocabularyTransformer::builtin();
        let original = "Lingerie shoot in the bedroom";
        let fallback = transformer.transform(original, VocabularyTier::Fallback);
        assert_eq!(fallback, "Matching lounge outfit shoot in the sunlit living room");
        assert_ne!(
            fallback,
            transformer.transform(original, VocabularyTier::Default)
        );
        assert_eq!(
            transformer.transform(&fallback, VocabularyTier::Fallback),
            fallback
        );
    }

    #[test]
    fn default_output_is_stable_under_every_builtin_replacement() {
        let tables = VocabularyTables::builtin();
        let transformer = VocabularyTransformer::new(&tables);
        for tier in [VocabularyTier::Default, VocabularyTier::Fallback] {
            for rule in tables.rules(tier) {
                let once = transformer.transform(&rule.pattern, tier);
                assert_eq!(transformer.transform(&once, tier), once, "{}", rule.pattern);
            }
        }
    }

    #[test]
    fn empty_and_unflagged_text_pass_through() {
        let transformer = VocabularyTransformer::builtin();
        assert_eq!(transformer.transform("", VocabularyTier::Default), "");
        assert_eq!(
            transformer.transform("a walk in the park", VocabularyTier::Fallback),
            "a walk in the park"
        );
    }

    #[test]
    fn marked_output_reports_replaced_ranges() {
        let transformer = VocabularyTransformer::builtin();
        let marked = transformer.transform_marked("a bra and a bikini", VocabularyTier::Default);
        let replaced: Vec<&str> = marked
            .produced
            .iter()
            .map(|range| &marked.text[range.clone()])
            .collect();
        assert_eq!(replaced, vec!["bralette", "two-piece swimsuit"]);
    }
}
