use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ReferenceSetError;

/// An already-loaded reference image. Bytes are shared so a reference set can
/// be cloned into every composed request without copying pixel data.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageHandle {
    pub label: String,
    pub mime_type: String,
    bytes: Arc<[u8]>,
}

impl ImageHandle {
    pub fn new(label: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            label: label.into(),
            mime_type: mime_type.into(),
            bytes: Arc::from(bytes),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for ImageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageHandle")
            .field("label", &self.label)
            .field("mime_type", &self.mime_type)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    #[default]
    Front,
    Back,
}

impl Orientation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Front => "front",
            Self::Back => "back",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyAnchor {
    pub image: ImageHandle,
    pub orientation: Orientation,
    pub primary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSet {
    pub pose_source: ImageHandle,
    pub face_anchors: Vec<ImageHandle>,
    pub body_anchors: Vec<BodyAnchor>,
    pub background: Option<ImageHandle>,
}

impl ReferenceSet {
    pub fn validate(&self) -> Result<(), ReferenceSetError> {
        if self.pose_source.is_empty() {
            return Err(ReferenceSetError::EmptyPoseSource(
                self.pose_source.label.clone(),
            ));
        }
        if self.face_anchors.is_empty() {
            return Err(ReferenceSetError::MissingFaceAnchor);
        }
        if self.body_anchors.is_empty() {
            return Err(ReferenceSetError::MissingBodyAnchor);
        }
        for orientation in [Orientation::Front, Orientation::Back] {
            let primaries = self
                .body_anchors
                .iter()
                .filter(|anchor| anchor.orientation == orientation && anchor.primary)
                .count();
            if primaries > 1 {
                return Err(ReferenceSetError::DuplicatePrimary(orientation.as_str()));
            }
        }
        Ok(())
    }

    pub fn body_anchors_facing(&self, orientation: Orientation) -> Vec<&BodyAnchor> {
        self.body_anchors
            .iter()
            .filter(|anchor| anchor.orientation == orientation)
            .collect()
    }
}

/// Positional roles the provider expects, in the order they are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotRole {
    PoseSource,
    FaceAnchors,
    BodyAnchors,
    Background,
}

impl SlotRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PoseSource => "pose_source",
            Self::FaceAnchors => "face_anchor",
            Self::BodyAnchors => "body_anchor",
            Self::Background => "background",
        }
    }
}

pub fn default_slot_order() -> Vec<SlotRole> {
    vec![
        SlotRole::PoseSource,
        SlotRole::FaceAnchors,
        SlotRole::BodyAnchors,
        SlotRole::Background,
    ]
}
