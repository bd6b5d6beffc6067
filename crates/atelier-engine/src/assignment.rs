use std::sync::OnceLock;

use atelier_contracts::config::ReferenceConfig;
use atelier_contracts::error::ReferenceSetError;
use atelier_contracts::references::{BodyAnchor, ImageHandle, Orientation, ReferenceSet, SlotRole};
use regex::{Regex, RegexBuilder};

const REAR_ANGLE_PATTERNS: &[&str] = &[
    r"\bback\s+to\s+(?:the\s+)?camera\b",
    r"\brear\s+(?:angle|view|shot)\b",
    r"\bfrom\s+behind\b",
    r"\bover\s+(?:the\s+|her\s+|his\s+|their\s+)?shoulder\b",
    r"\b(?:lying|laying)\s+on\s+(?:her\s+|his\s+|their\s+)?stomach\b",
    r"\bfacing\s+away\b",
    r"\bback\s+view\b",
    r"\bseen\s+from\s+the\s+back\b",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignedImage {
    /// 1-based position in the provider's image list.
    pub slot: usize,
    pub role: SlotRole,
    pub image: ImageHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceAssignment {
    pub images: Vec<AssignedImage>,
    pub requested_orientation: Orientation,
    pub body_orientation: Orientation,
    /// Set when no body anchor of the requested orientation existed.
    pub degraded: bool,
}

impl ReferenceAssignment {
    pub fn labels(&self, role: SlotRole) -> Vec<&str> {
        self.images
            .iter()
            .filter(|assigned| assigned.role == role)
            .map(|assigned| assigned.image.label.as_str())
            .collect()
    }
}

/// Camera orientation implied by the caller's text.
pub fn detect_orientation(text: &str) -> Orientation {
    if rear_patterns().iter().any(|pattern| pattern.is_match(text)) {
        Orientation::Back
    } else {
        Orientation::Front
    }
}

fn rear_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        REAR_ANGLE_PATTERNS
            .iter()
            .filter_map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .ok()
            })
            .collect()
    })
}

/// Maps a reference set onto the provider's positional slots.
#[derive(Debug, Clone)]
pub struct ReferenceAssigner {
    slot_order: Vec<SlotRole>,
    multi_anchor: bool,
}

impl ReferenceAssigner {
    /// The pose source is always slot 1 regardless of where (or whether)
    /// the configured order lists it.
    pub fn new(config: &ReferenceConfig) -> Self {
        let mut slot_order = vec![SlotRole::PoseSource];
        for role in &config.slot_order {
            if !slot_order.contains(role) {
                slot_order.push(*role);
            }
        }
        Self {
            slot_order,
            multi_anchor: config.multi_anchor,
        }
    }

    pub fn slot_order(&self) -> &[SlotRole] {
        &self.slot_order
    }

    pub fn assign(
        &self,
        references: &ReferenceSet,
        caller_text: &str,
    ) -> Result<ReferenceAssignment, ReferenceSetError> {
        references.validate()?;

        let requested = detect_orientation(caller_text);
        let (body_orientation, mut bodies) = match references.body_anchors_facing(requested) {
            anchors if !anchors.is_empty() => (requested, anchors),
            _ => {
                let fallback = if requested == Orientation::Front {
                    Orientation::Back
                } else {
                    Orientation::Front
                };
                log::warn!(
                    "degraded reference match: no {} body anchor configured, using {} anchors",
                    requested.as_str(),
                    fallback.as_str()
                );
                (fallback, references.body_anchors_facing(fallback))
            }
        };
        if !self.multi_anchor {
            bodies = primary_or_first(bodies);
        }
        let faces: Vec<&ImageHandle> = if self.multi_anchor {
            references.face_anchors.iter().collect()
        } else {
            references.face_anchors.iter().take(1).collect()
        };

        let mut images = Vec::new();
        for role in &self.slot_order {
            let chosen: Vec<&ImageHandle> = match role {
                SlotRole::PoseSource => vec![&references.pose_source],
                SlotRole::FaceAnchors => faces.clone(),
                SlotRole::BodyAnchors => bodies.iter().map(|anchor| &anchor.image).collect(),
                SlotRole::Background => references.background.iter().collect(),
            };
            for image in chosen {
                images.push(AssignedImage {
                    slot: images.len() + 1,
                    role: *role,
                    image: image.clone(),
                });
            }
        }

        Ok(ReferenceAssignment {
            images,
            requested_orientation: requested,
            body_orientation,
            degraded: body_orientation != requested,
        })
    }
}

impl Default for ReferenceAssigner {
    fn default() -> Self {
        Self::new(&ReferenceConfig::default())
    }
}

fn primary_or_first(anchors: Vec<&BodyAnchor>) -> Vec<&BodyAnchor> {
    let chosen = anchors
        .iter()
        .find(|anchor| anchor.primary)
        .or_else(|| anchors.first())
        .copied();
    chosen.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn img(label: &str) -> ImageHandle {
        ImageHandle::new(label, "image/png", vec![0xAB])
    }

    fn body(label: &str, orientation: Orientation, primary: bool) -> BodyAnchor {
        BodyAnchor {
            image: img(label),
            orientation,
            primary,
        }
    }

    fn reference_set() -> ReferenceSet {
        ReferenceSet {
            pose_source: img("pose"),
            face_anchors: vec![img("face-1"), img("face-2")],
            body_anchors: vec![
                body("front-1", Orientation::Front, true),
                body("back-1", Orientation::Back, false),
                body("front-2", Orientation::Front, false),
                body("back-2", Orientation::Back, true),
            ],
            background: Some(img("beach")),
        }
    }

    #[test]
    fn rear_keywords_select_every_back_anchor_in_order() -> anyhow::Result<()> {
        let assignment = ReferenceAssigner::default()
            .assign(&reference_set(), "walking away, shot from behind")?;
        assert_eq!(assignment.body_orientation, Orientation::Back);
        assert!(!assignment.degraded);
        assert_eq!(assignment.labels(SlotRole::BodyAnchors), vec!["back-1", "back-2"]);

        let slots: Vec<(usize, &str)> = assignment
            .images
            .iter()
            .map(|row| (row.slot, row.image.label.as_str()))
            .collect();
        assert_eq!(
            slots,
            vec![
                (1, "pose"),
                (2, "face-1"),
                (3, "face-2"),
                (4, "back-1"),
                (5, "back-2"),
                (6, "beach"),
            ]
        );
        Ok(())
    }

    #[test]
    fn front_is_the_default_orientation() -> anyhow::Result<()> {
        let assignment = ReferenceAssigner::default().assign(&reference_set(), "smiling at camera")?;
        assert_eq!(assignment.labels(SlotRole::BodyAnchors), vec!["front-1", "front-2"]);
        Ok(())
    }

    #[test]
    fn detects_rear_angle_phrases() {
        for text in [
            "Back to the camera",
            "rear angle on the pier",
            "glancing over her shoulder",
            "over shoulder look",
            "lying on her stomach",
        ] {
            assert_eq!(detect_orientation(text), Orientation::Back, "{text}");
        }
        assert_eq!(detect_orientation("backyard party"), Orientation::Front);
    }

    #[test]
    fn missing_back_anchor_degrades_to_front() -> anyhow::Result<()> {
        let mut set = reference_set();
        set.body_anchors.retain(|anchor| anchor.orientation == Orientation::Front);
        let assignment = ReferenceAssigner::default().assign(&set, "rear view")?;
        assert!(assignment.degraded);
        assert_eq!(assignment.requested_orientation, Orientation::Back);
        assert_eq!(assignment.labels(SlotRole::BodyAnchors), vec!["front-1", "front-2"]);
        Ok(())
    }

    #[test]
    fn single_anchor_mode_uses_primary() -> anyhow::Result<()> {
        let assigner = ReferenceAssigner::new(&ReferenceConfig {
            multi_anchor: false,
            ..ReferenceConfig::default()
        });
        let assignment = assigner.assign(&reference_set(), "from behind")?;
        assert_eq!(assignment.labels(SlotRole::BodyAnchors), vec!["back-2"]);
        assert_eq!(assignment.labels(SlotRole::FaceAnchors), vec!["face-1"]);
        Ok(())
    }

    #[test]
    fn configured_order_is_respected_after_pose_source() -> anyhow::Result<()> {
        let assigner = ReferenceAssigner::new(&ReferenceConfig {
            slot_order: vec![SlotRole::Background, SlotRole::BodyAnchors, SlotRole::FaceAnchors],
            multi_anchor: true,
        });
        assert_eq!(assigner.slot_order()[0], SlotRole::PoseSource);
        let mut set = reference_set();
        set.background = None;
        let assignment = assigner.assign(&set, "studio")?;
        let roles: Vec<SlotRole> = assignment.images.iter().map(|row| row.role).collect();
        assert_eq!(
            roles,
            vec![
                SlotRole::PoseSource,
                SlotRole::BodyAnchors,
                SlotRole::BodyAnchors,
                SlotRole::FaceAnchors,
                SlotRole::FaceAnchors,
            ]
        );
        Ok(())
    }

    #[test]
    fn malformed_set_is_rejected_before_assignment() {
        let mut set = reference_set();
        set.face_anchors.clear();
        assert_eq!(
            ReferenceAssigner::default().assign(&set, "studio"),
            Err(ReferenceSetError::MissingFaceAnchor)
        );
    }
}
