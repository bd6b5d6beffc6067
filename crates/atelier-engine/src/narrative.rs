use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};

const POSSESSIVE: &str = r"(?:(?:her|his|their|the)\s+)?";

/// (canonical phrase, patterns) in priority order.
const POSE_PHRASES: &[(&str, &[&str])] = &[
    (
        "lying on stomach",
        &[r"\b(?:lying|laying)\s+on\s+{P}(?:stomach|belly|front)\b", r"\blying\s+face\s+down\b"],
    ),
    (
        "lying on back",
        &[r"\b(?:lying|laying)\s+on\s+{P}back\b", r"\blying\s+face\s+up\b"],
    ),
    ("lying on side", &[r"\b(?:lying|laying)\s+on\s+{P}side\b"]),
    ("kneeling", &[r"\bkneeling\b", r"\bon\s+{P}knees\b"]),
    ("squatting", &[r"\bsquatting\b", r"\bcrouching\b"]),
    ("sitting", &[r"\bsitting\b", r"\bseated\b"]),
    ("bending forward", &[r"\bbending\s+forward\b", r"\bleaning\s+forward\b"]),
    ("standing on tiptoes", &[r"\b(?:standing\s+)?on\s+{P}tiptoes?\b"]),
];

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NarrativePoseOverride {
    pub matched: bool,
    pub canonical_phrase: String,
}

impl NarrativePoseOverride {
    /// Full-body framing instruction wrapping the detected pose.
    pub fn framing(&self) -> Option<String> {
        self.matched.then(|| {
            format!(
                "full body shot, entire figure visible from head to toe, {}",
                self.canonical_phrase
            )
        })
    }
}

/// Scans caller text for phrases that already pin down a pose.
pub fn detect_narrative_pose(text: &str) -> NarrativePoseOverride {
    for (canonical, patterns) in compiled() {
        if patterns.iter().any(|pattern| pattern.is_match(text)) {
            return NarrativePoseOverride {
                matched: true,
                canonical_phrase: (*canonical).to_string(),
            };
        }
    }
    NarrativePoseOverride::default()
}

fn compiled() -> &'static [(&'static str, Vec<Regex>)] {
    static TABLE: OnceLock<Vec<(&'static str, Vec<Regex>)>> = OnceLock::new();
    TABLE.get_or_init(|| {
        POSE_PHRASES
            .iter()
            .map(|(canonical, patterns)| {
                let compiled = patterns
                    .iter()
                    .filter_map(|pattern| {
                        RegexBuilder::new(&pattern.replace("{P}", POSSESSIVE))
                            .case_insensitive(true)
                            .build()
                            .ok()
                    })
                    .collect();
                (*canonical, compiled)
            })
            .collect()
    })
}
