use serde::{Deserialize, Serialize};
use std::fmt;

/// A validated plate identifier. Only `normalize::PlateNormalizer` builds these.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CanonicalPlate(String);

impl CanonicalPlate {
    pub(crate) fn new_unchecked(plate: String) -> Self {
        CanonicalPlate(plate)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalPlate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rectangular candidate region reported by the vision extractor, in frame pixels.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub score: f32,
}

/// One (text, confidence) reading produced by the text recognizer.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Hypothesis {
    pub text: String,
    pub confidence: f32,
}

/// Best plate reading for a single frame.
#[derive(Clone, Debug, PartialEq)]
pub struct PlateCandidate {
    pub region: Region,
    pub raw_text: String,
    pub plate: CanonicalPlate,
    pub confidence: f32,
    pub exact: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GateReason {
    Whitelisted,
    PaymentVerified,
    PaymentSuccessful,
}

impl GateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateReason::Whitelisted => "whitelisted",
            GateReason::PaymentVerified => "payment-verified",
            GateReason::PaymentSuccessful => "payment-successful",
        }
    }
}

impl fmt::Display for GateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
