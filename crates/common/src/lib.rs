/// Common types and utilities for drill loop analysis
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Analysis and rendering errors
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Video source unreadable: {0}")]
    SourceUnreadable(String),

    #[error("Seek to {time:.3}s did not complete within {deadline_ms}ms")]
    SeekTimeout { time: f64, deadline_ms: u64 },

    #[error("Analysis timed out after {0}s")]
    AnalysisTimeout(u64),

    #[error("Render timed out after {0}s")]
    RenderTimeout(u64),

    #[error("Encoder rejected input: {0}")]
    EncodingFailure(String),

    #[error("Invalid loop segment: {0}")]
    InvalidLoopSpec(String),

    #[error("FFmpeg error: {0}")]
    FFmpegError(String),

    #[error("Image processing error: {0}")]
    ImageError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<image::ImageError> for AnalysisError {
    fn from(err: image::ImageError) -> Self {
        AnalysisError::ImageError(err.to_string())
    }
}

/// Result type for analysis operations
pub type Result<T> = std::result::Result<T, AnalysisError>;

/// Fixed-length perceptual fingerprint of a single frame.
///
/// Bits are packed row-major, one bit per fingerprint cell. Compared via
/// normalized Hamming similarity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Packed bits (base64-encoded for JSON serialization)
    #[serde(with = "base64_serde")]
    bytes: Vec<u8>,
    /// Number of meaningful bits
    len_bits: usize,
}

impl Fingerprint {
    /// Pack a bit sequence into a fingerprint
    #[must_use]
    pub fn from_bits(bits: &[bool]) -> Self {
        let mut bytes = vec![0u8; bits.len().div_ceil(8)];
        for (i, &bit) in bits.iter().enumerate() {
            if bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }
        Self {
            bytes,
            len_bits: bits.len(),
        }
    }

    /// Number of bits in the fingerprint
    #[must_use]
    pub fn len_bits(&self) -> usize {
        self.len_bits
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len_bits == 0
    }

    /// Packed byte representation
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of differing bits between two fingerprints of equal length
    fn hamming_distance(&self, other: &Fingerprint) -> u32 {
        self.bytes
            .iter()
            .zip(other.bytes.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }

    /// Normalized Hamming similarity in `[0, 1]`.
    ///
    /// Fingerprints of differing length compare as fully dissimilar; within
    /// one analysis all fingerprints share a length.
    #[must_use]
    pub fn similarity(&self, other: &Fingerprint) -> f64 {
        if self.len_bits != other.len_bits || self.len_bits == 0 {
            return 0.0;
        }
        let distance = self.hamming_distance(other);
        1.0 - f64::from(distance) / self.len_bits as f64
    }
}

/// A sampled frame reduced to its durable per-frame values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Presentation time in seconds
    pub time: f64,
    /// Perceptual fingerprint of the downscaled raster
    pub fingerprint: Fingerprint,
    /// Motion relative to the previous frame in `[0, 1]`; 0 for the first frame
    pub motion: f64,
}

/// Two window starts believed to contain the same movement cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepetitionCandidate {
    /// Frame index where the first occurrence starts
    pub start_index: usize,
    /// Frame index where the later occurrence starts (`> start_index + window`)
    pub other_start_index: usize,
    /// Compared window length in frames
    pub window: usize,
    /// Matched-frame fraction in `[0, 1]`
    pub similarity: f64,
}

impl RepetitionCandidate {
    /// Implied cycle duration in frames
    #[must_use]
    pub fn cycle_len(&self) -> usize {
        self.other_start_index - self.start_index
    }
}

/// The chosen loop segment in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoopSpec {
    pub start_secs: f64,
    pub end_secs: f64,
}

impl LoopSpec {
    /// Create a validated loop segment
    pub fn new(start_secs: f64, end_secs: f64) -> Result<Self> {
        if !(start_secs >= 0.0 && start_secs < end_secs) {
            return Err(AnalysisError::InvalidLoopSpec(format!(
                "start {start_secs:.3}s must lie before end {end_secs:.3}s"
            )));
        }
        Ok(Self {
            start_secs,
            end_secs,
        })
    }

    /// Degenerate zero segment for empty inputs
    #[must_use]
    pub fn zero() -> Self {
        Self {
            start_secs: 0.0,
            end_secs: 0.0,
        }
    }

    /// Loop length in seconds
    #[must_use]
    pub fn duration(&self) -> f64 {
        self.end_secs - self.start_secs
    }

    /// Temporal midpoint of the segment
    #[must_use]
    pub fn midpoint(&self) -> f64 {
        (self.start_secs + self.end_secs) / 2.0
    }
}

/// Final analysis output, immutable once built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Total video duration in seconds
    pub duration_secs: f64,
    /// Number of detected repetition candidates
    pub repetitions: usize,
    /// Frame indices of local motion peaks
    pub key_frames: Vec<usize>,
    /// Selected loop start in seconds
    pub loop_start_secs: f64,
    /// Selected loop end in seconds
    pub loop_end_secs: f64,
    /// Reliability tier in `[0, 1]`
    pub confidence: f64,
}

impl AnalysisResult {
    /// The degraded all-zeros result for unreadable or empty sources
    #[must_use]
    pub fn zero() -> Self {
        Self {
            duration_secs: 0.0,
            repetitions: 0,
            key_frames: Vec::new(),
            loop_start_secs: 0.0,
            loop_end_secs: 0.0,
            confidence: 0.0,
        }
    }

    /// The selected loop segment
    #[must_use]
    pub fn loop_spec(&self) -> LoopSpec {
        LoopSpec {
            start_secs: self.loop_start_secs,
            end_secs: self.loop_end_secs,
        }
    }
}

/// Helper module for base64 serialization of packed fingerprint bytes
mod base64_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use base64::{engine::general_purpose, Engine};
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        use base64::{engine::general_purpose, Engine};
        let s = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(&s)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_packing() {
        let bits = vec![true, false, true, false, true, false, true, false];
        let fp = Fingerprint::from_bits(&bits);
        assert_eq!(fp.as_bytes(), &[0b0101_0101]);
        assert_eq!(fp.len_bits(), 8);

        let bits = vec![false; 16];
        let fp = Fingerprint::from_bits(&bits);
        assert_eq!(fp.as_bytes(), &[0, 0]);
    }

    #[test]
    fn test_fingerprint_self_similarity_is_one() {
        let fp = Fingerprint::from_bits(&[true, true, false, true, false, false, true, false]);
        assert_eq!(fp.similarity(&fp), 1.0);
    }

    #[test]
    fn test_fingerprint_similarity_bounds() {
        let a = Fingerprint::from_bits(&[true; 8]);
        let b = Fingerprint::from_bits(&[false; 8]);
        assert_eq!(a.similarity(&b), 0.0);

        let c = Fingerprint::from_bits(&[true, true, true, true, false, false, false, false]);
        let sim = a.similarity(&c);
        assert!(sim > 0.0 && sim < 1.0);
        assert!((sim - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_fingerprint_length_mismatch() {
        let a = Fingerprint::from_bits(&[true; 8]);
        let b = Fingerprint::from_bits(&[true; 16]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_fingerprint_serde_roundtrip() {
        let fp = Fingerprint::from_bits(&[true, false, false, true, true, true, false, true, true]);
        let json = serde_json::to_string(&fp).unwrap();
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(fp, back);
    }

    #[test]
    fn test_loop_spec_validation() {
        let spec = LoopSpec::new(1.0, 3.5).unwrap();
        assert!((spec.duration() - 2.5).abs() < 1e-9);
        assert!((spec.midpoint() - 2.25).abs() < 1e-9);

        assert!(LoopSpec::new(3.0, 3.0).is_err());
        assert!(LoopSpec::new(-0.5, 3.0).is_err());
    }

    #[test]
    fn test_zero_result() {
        let result = AnalysisResult::zero();
        assert_eq!(result.duration_secs, 0.0);
        assert_eq!(result.repetitions, 0);
        assert!(result.key_frames.is_empty());
        assert_eq!(result.loop_start_secs, 0.0);
        assert_eq!(result.loop_end_secs, 0.0);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_cycle_len() {
        let candidate = RepetitionCandidate {
            start_index: 4,
            other_start_index: 14,
            window: 5,
            similarity: 0.9,
        };
        assert_eq!(candidate.cycle_len(), 10);
    }
}
