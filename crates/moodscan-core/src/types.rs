use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Facial expression class, in classifier output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Angry,
    Disgust,
    Fear,
    Happy,
    Sad,
    Surprise,
    Neutral,
}

impl Emotion {
    /// All emotions, indexed the way the expression model emits them.
    pub const ALL: [Emotion; 7] = [
        Emotion::Angry,
        Emotion::Disgust,
        Emotion::Fear,
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Surprise,
        Emotion::Neutral,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Emotion::Angry => "angry",
            Emotion::Disgust => "disgust",
            Emotion::Fear => "fear",
            Emotion::Happy => "happy",
            Emotion::Sad => "sad",
            Emotion::Surprise => "surprise",
            Emotion::Neutral => "neutral",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown emotion label: {0}")]
pub struct UnknownEmotion(pub String);

impl FromStr for Emotion {
    type Err = UnknownEmotion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Emotion::ALL
            .into_iter()
            .find(|e| e.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownEmotion(s.to_string()))
    }
}

/// Per-emotion confidence, as percentages summing to 100.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmotionScores {
    values: [f32; 7],
}

impl EmotionScores {
    /// Build scores from a probability distribution in model order.
    pub fn from_probabilities(probs: [f32; 7]) -> Self {
        Self {
            values: probs.map(|p| p * 100.0),
        }
    }

    pub fn get(&self, emotion: Emotion) -> f32 {
        self.values[emotion.index()]
    }

    /// Highest-scoring emotion. Ties go to the earlier emotion in model order.
    pub fn dominant(&self) -> Emotion {
        let mut best = 0;
        for i in 1..self.values.len() {
            if self.values[i] > self.values[best] {
                best = i;
            }
        }
        Emotion::ALL[best]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Emotion, f32)> + '_ {
        Emotion::ALL.into_iter().zip(self.values.iter().copied())
    }
}

impl Serialize for EmotionScores {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (emotion, score) in self.iter() {
            map.serialize_entry(emotion.as_str(), &score)?;
        }
        map.end()
    }
}

/// Raw detector output in original image coordinates.
#[derive(Debug, Clone)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Integer pixel rectangle inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl FaceRegion {
    /// Region covering the whole image.
    pub fn full(width: u32, height: u32) -> Self {
        Self { x: 0, y: 0, w: width, h: height }
    }

    /// Clamp a floating-point box to the image. Returns `None` when nothing is left.
    pub fn clamped(bbox: &BoundingBox, width: u32, height: u32) -> Option<Self> {
        let x0 = bbox.x.max(0.0).floor() as u32;
        let y0 = bbox.y.max(0.0).floor() as u32;
        let x1 = ((bbox.x + bbox.width).ceil().max(0.0) as u32).min(width);
        let y1 = ((bbox.y + bbox.height).ceil().max(0.0) as u32).min(height);

        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Self { x: x0, y: y0, w: x1 - x0, h: y1 - y0 })
    }
}

/// Analysis record for one face.
#[derive(Debug, Clone, Serialize)]
pub struct FaceAnalysis {
    pub region: FaceRegion,
    /// Detector score; 0.0 when the whole image stood in for a face.
    pub face_confidence: f32,
    pub emotion: EmotionScores,
    pub dominant_emotion: Emotion,
}

impl FaceAnalysis {
    pub fn new(region: FaceRegion, face_confidence: f32, emotion: EmotionScores) -> Self {
        Self {
            region,
            face_confidence,
            dominant_emotion: emotion.dominant(),
            emotion,
        }
    }
}
