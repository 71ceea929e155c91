use crate::normalize::PlateNormalizer;
use crate::preprocess::{crop_region, VARIANTS};
use crate::types::{Hypothesis, PlateCandidate, Region};
use image::GrayImage;
use log::{debug, trace};
use std::cmp::Ordering;

const MAX_REGIONS: usize = 5;

/// Produces candidate plate regions for a frame, best first.
pub trait VisionExtractor {
    fn extract(&self, frame: &GrayImage) -> Vec<Region>;
}

/// Reads text from a preprocessed crop.
pub trait TextRecognizer: Send + Sync {
    fn recognize(&self, crop: &GrayImage) -> Vec<Hypothesis>;
}

/// Regions supplied alongside a frame by an upstream detector.
pub struct RankedRegions {
    regions: Vec<Region>,
}

impl RankedRegions {
    pub fn new(regions: Vec<Region>) -> Self {
        RankedRegions { regions }
    }
}

impl VisionExtractor for RankedRegions {
    fn extract(&self, frame: &GrayImage) -> Vec<Region> {
        let mut regions: Vec<Region> = self
            .regions
            .iter()
            .filter(|r| r.x < frame.width() && r.y < frame.height())
            .map(|r| Region {
                width: r.width.min(frame.width() - r.x),
                height: r.height.min(frame.height() - r.y),
                ..*r
            })
            .filter(|r| r.width > 0 && r.height > 0)
            .collect();
        regions.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        regions.truncate(MAX_REGIONS);
        regions
    }
}

pub struct Frame {
    pub image: GrayImage,
    pub regions: Vec<Region>,
}

impl Frame {
    pub fn extract(image: GrayImage, extractor: &dyn VisionExtractor) -> Self {
        let regions = extractor.extract(&image);
        Frame { image, regions }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SelectorSettings {
    pub min_confidence: f32,
    /// An exact grammar match at or above this stops recognition for the frame.
    pub high_confidence: f32,
}

pub struct CandidateSelector<R> {
    normalizer: PlateNormalizer,
    recognizer: R,
    settings: SelectorSettings,
}

impl<R: TextRecognizer> CandidateSelector<R> {
    pub fn new(normalizer: PlateNormalizer, recognizer: R, settings: SelectorSettings) -> Self {
        CandidateSelector {
            normalizer,
            recognizer,
            settings,
        }
    }

    pub fn select(&self, frame: &Frame) -> Option<PlateCandidate> {
        let mut best: Option<PlateCandidate> = None;
        for region in &frame.regions {
            let crop = match crop_region(&frame.image, region) {
                Some(crop) => crop,
                None => continue,
            };
            for variant in VARIANTS {
                for hypothesis in self.recognizer.recognize(&variant.apply(&crop)) {
                    let normalized = match self.normalizer.normalize(&hypothesis.text) {
                        Some(n) => n,
                        None => {
                            trace!("Discarding {:?} from {:?}", hypothesis.text, variant);
                            continue;
                        }
                    };
                    let candidate = PlateCandidate {
                        region: *region,
                        raw_text: hypothesis.text,
                        plate: normalized.plate,
                        confidence: hypothesis.confidence,
                        exact: normalized.exact,
                    };
                    if candidate.exact && candidate.confidence >= self.settings.high_confidence {
                        debug!(
                            "Short-circuit on {} ({:.3}) via {:?}",
                            candidate.plate, candidate.confidence, variant
                        );
                        return Some(candidate);
                    }
                    if best.as_ref().map_or(true, |b| outranks(&candidate, b)) {
                        best = Some(candidate);
                    }
                }
            }
        }
        best.filter(|c| c.confidence >= self.settings.min_confidence)
    }
}

fn outranks(a: &PlateCandidate, b: &PlateCandidate) -> bool {
    a.confidence > b.confidence || (a.confidence == b.confidence && a.exact && !b.exact)
}
