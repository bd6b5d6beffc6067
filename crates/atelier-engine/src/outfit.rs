use std::ops::Range;

use atelier_contracts::vocabulary::{OutfitRule, VocabularyTables};

use crate::rewrite::{Rewrite, WordRewriter};

/// Intensifies bare garment nouns ("skirt" -> "short mini skirt"). Only the
/// noun is rewritten, so surrounding color and material words stay put.
#[derive(Debug, Clone)]
pub struct OutfitEnhancer {
    rewriter: WordRewriter,
}

impl OutfitEnhancer {
    pub fn new(rules: &[OutfitRule]) -> Self {
        let mut rewriter = WordRewriter::new();
        for rule in rules {
            rewriter.push(&rule.noun, &rule.replacement, &rule.qualifiers);
        }
        Self { rewriter }
    }

    pub fn builtin() -> Self {
        Self::new(&VocabularyTables::builtin().outfit)
    }

    pub fn enhance(&self, text: &str) -> String {
        self.rewriter.rewrite(text, &[]).text
    }

    /// Like [`OutfitEnhancer::enhance`], leaving `protected` ranges (output of
    /// the safety pass) untouched.
    pub fn enhance_marked(&self, text: &str, protected: &[Range<usize>]) -> Rewrite {
        self.rewriter.rewrite(text, protected)
    }
}

impl Default for OutfitEnhancer {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use atelier_contracts::vocabulary::VocabularyTier;

    use crate::vocabulary::VocabularyTransformer;

    use super::*;

    #[test]
    fn bare_garments_are_intensified_keeping_color_and_material() {
        let enhancer = OutfitEnhancer::builtin();
        assert_eq!(
            enhancer.enhance("a red satin skirt and a white top"),
            "a red satin short mini skirt and a white cropped fitted top"
        );
    }

    #[test]
    fn enhancement_is_idempotent() {
        let enhancer = OutfitEnhancer::builtin();
        let once = enhancer.enhance("black dress, denim shorts, Skirt");
        assert_eq!(once, "black fitted mini dress, denim shorts, Short mini skirt");
        assert_eq!(enhancer.enhance(&once), once);
    }

    #[test]
    fn safety_output_is_never_reintensified() {
        let mut tables = VocabularyTables::builtin();
        tables.default.push(atelier_contracts::vocabulary::SubstitutionRule {
            pattern: "slip".to_string(),
            replacement: "satin dress".to_string(),
        });
        let transformer = VocabularyTransformer::new(&tables);
        let enhancer = OutfitEnhancer::new(&tables.outfit);

        let safe = transformer.transform_marked("a slip and a dress", VocabularyTier::Default);
        let done = enhancer.enhance_marked(&safe.text, &safe.produced);
        assert_eq!(done.text, "a satin dress and a fitted mini dress");
    }

    #[test]
    fn words_containing_garments_are_left_alone() {
        let enhancer = OutfitEnhancer::builtin();
        assert_eq!(
            enhancer.enhance("laptop on the desktop, redressed"),
            "laptop on the desktop, redressed"
        );
    }
}
