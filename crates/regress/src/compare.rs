//! Artifact comparison against golden reference files

use std::fmt;
use std::path::{Path, PathBuf};
use image::{DynamicImage, GenericImageView, Pixel, RgbaImage};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{RegressError, RegressResult};

/// Placeholder that replaces a run-unique id
pub const RUN_ID_PLACEHOLDER: &str = "dummy-id";

/// How a produced artifact is checked against its reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareMode {
    /// Files must be byte-identical
    ExactBytes,

    /// Run-unique ids are replaced in both files before an exact comparison
    NormalizedBytes,

    /// Mean channel intensity of the produced image must lie within
    /// `tolerance` of a recorded `baseline`
    PixelMean { baseline: f64, tolerance: f64 },
}

/// Outcome of one comparison
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonResult {
    /// What was compared (`stdout` or the output file name)
    pub label: String,
    pub passed: bool,
    pub mismatch: Option<Mismatch>,
}

/// Enough detail to localize a failed comparison
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mismatch {
    Bytes {
        first_difference: usize,
        actual_len: usize,
        expected_len: usize,
        actual_sha256: String,
        expected_sha256: String,
        pixels: Option<PixelDiff>,
    },
    PixelMean {
        actual: f64,
        baseline: f64,
        tolerance: f64,
    },
    Text {
        line: usize,
        actual: String,
        expected: String,
    },
    Http {
        status: u16,
        expected_status: u16,
        detail: Option<String>,
    },
}

/// Pixel-level view of two images that differ byte-wise
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PixelDiff {
    pub diff_pixels: u64,
    pub total_pixels: u64,
    pub diff_percent: f64,
    pub dimensions_match: bool,
    pub diff_image_path: Option<PathBuf>,
}

impl ComparisonResult {
    pub fn pass(label: &str) -> Self {
        Self {
            label: label.to_string(),
            passed: true,
            mismatch: None,
        }
    }

    pub fn fail(label: &str, mismatch: Mismatch) -> Self {
        Self {
            label: label.to_string(),
            passed: false,
            mismatch: Some(mismatch),
        }
    }

    /// Turn a failed comparison into an error
    pub fn into_result(self) -> RegressResult<()> {
        if self.passed {
            Ok(())
        } else {
            Err(RegressError::ComparisonMismatch(self.to_string()))
        }
    }
}

impl fmt::Display for ComparisonResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.mismatch {
            None => write!(f, "{}: ok", self.label),
            Some(Mismatch::Bytes {
                first_difference,
                actual_len,
                expected_len,
                actual_sha256,
                expected_sha256,
                pixels,
            }) => {
                write!(
                    f,
                    "{}: bytes differ at offset {} (actual {} bytes, sha256 {}; expected {} bytes, sha256 {})",
                    self.label, first_difference, actual_len, actual_sha256, expected_len, expected_sha256
                )?;
                if let Some(p) = pixels {
                    write!(
                        f,
                        "; {} of {} pixels differ ({:.2}%)",
                        p.diff_pixels, p.total_pixels, p.diff_percent
                    )?;
                    if let Some(path) = &p.diff_image_path {
                        write!(f, ", diff image: {}", path.display())?;
                    }
                }
                Ok(())
            }
            Some(Mismatch::PixelMean {
                actual,
                baseline,
                tolerance,
            }) => write!(
                f,
                "{}: mean intensity {:.3} is outside {:.3} +/- {:.3}",
                self.label, actual, baseline, tolerance
            ),
            Some(Mismatch::Text {
                line,
                actual,
                expected,
            }) => write!(
                f,
                "{}: line {} differs\n  actual:   {:?}\n  expected: {:?}",
                self.label, line, actual, expected
            ),
            Some(Mismatch::Http {
                status,
                expected_status,
                detail,
            }) => {
                write!(f, "{}: status {} (expected {})", self.label, status, expected_status)?;
                if let Some(detail) = detail {
                    write!(f, ", {}", detail)?;
                }
                Ok(())
            }
        }
    }
}

/// A normalization stage applied before an exact comparison
pub trait Normalizer {
    fn normalize(&self, bytes: &[u8]) -> RegressResult<Vec<u8>>;
}

/// Replaces the run-unique element id of generated plot markup.
///
/// Exactly one distinct id must be present. Input that already carries the
/// placeholder instead passes through unchanged, so normalizing twice is
/// the same as normalizing once.
pub struct RunIdNormalizer {
    pattern: Regex,
    placeholder: String,
}

impl RunIdNormalizer {
    pub fn new() -> Self {
        Self {
            pattern: Regex::new(r#"div id="([a-f0-9\-]{36})""#).expect("valid run id pattern"),
            placeholder: RUN_ID_PLACEHOLDER.to_string(),
        }
    }
}

impl Default for RunIdNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Normalizer for RunIdNormalizer {
    fn normalize(&self, bytes: &[u8]) -> RegressResult<Vec<u8>> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| RegressError::Normalization(format!("document is not UTF-8: {}", e)))?;

        let mut ids: Vec<&str> = self
            .pattern
            .captures_iter(text)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect();
        ids.sort_unstable();
        ids.dedup();

        match ids.as_slice() {
            [id] => Ok(text.replace(*id, &self.placeholder).into_bytes()),
            [] if text.contains(&format!("div id=\"{}\"", self.placeholder)) => Ok(bytes.to_vec()),
            [] => Err(RegressError::Normalization(
                "no run id found; the generator's output format changed".to_string(),
            )),
            many => Err(RegressError::Normalization(format!(
                "expected one run id, found {}",
                many.len()
            ))),
        }
    }
}

/// Compares produced artifacts and captured text against references
pub struct ArtifactComparator {
    /// Where pixel diff images are written (none if unset)
    diff_dir: Option<PathBuf>,
}

impl ArtifactComparator {
    pub fn new(diff_dir: Option<PathBuf>) -> Self {
        Self { diff_dir }
    }

    /// Compare a produced file against a reference using `mode`
    pub fn compare_file(
        &self,
        actual: &Path,
        reference: &Path,
        mode: &CompareMode,
    ) -> RegressResult<ComparisonResult> {
        if !actual.exists() {
            return Err(RegressError::ArtifactMissing(actual.to_path_buf()));
        }

        match mode {
            CompareMode::ExactBytes => self.compare_bytes(actual, reference),
            CompareMode::NormalizedBytes => {
                self.compare_normalized(actual, reference, &RunIdNormalizer::new())
            }
            CompareMode::PixelMean {
                baseline,
                tolerance,
            } => compare_pixel_mean(actual, *baseline, *tolerance),
        }
    }

    pub fn compare_bytes(&self, actual: &Path, reference: &Path) -> RegressResult<ComparisonResult> {
        let expected = read_reference(reference)?;
        let produced = std::fs::read(actual)?;
        let label = label_for(actual);

        match byte_mismatch(&produced, &expected) {
            None => {
                debug!("{} matches {} exactly", label, reference.display());
                Ok(ComparisonResult::pass(&label))
            }
            Some(mut mismatch) => {
                if let Mismatch::Bytes { pixels, .. } = &mut mismatch {
                    *pixels = self.pixel_diff(actual, reference);
                }
                let result = ComparisonResult::fail(&label, mismatch);
                warn!("{}", result);
                Ok(result)
            }
        }
    }

    pub fn compare_normalized(
        &self,
        actual: &Path,
        reference: &Path,
        normalizer: &dyn Normalizer,
    ) -> RegressResult<ComparisonResult> {
        let expected = normalizer.normalize(&read_reference(reference)?)?;
        let produced = normalizer.normalize(&std::fs::read(actual)?)?;
        let label = label_for(actual);

        Ok(match byte_mismatch(&produced, &expected) {
            None => ComparisonResult::pass(&label),
            Some(mismatch) => {
                let result = ComparisonResult::fail(&label, mismatch);
                warn!("{}", result);
                result
            }
        })
    }

    /// Pixel-by-pixel view of two images, used only to explain a byte mismatch
    fn pixel_diff(&self, actual: &Path, reference: &Path) -> Option<PixelDiff> {
        let actual_img = image::open(actual).ok()?;
        let reference_img = image::open(reference).ok()?;

        let (width, height) = actual_img.dimensions();
        let dimensions_match = actual_img.dimensions() == reference_img.dimensions();
        if !dimensions_match {
            warn!(
                "Image dimensions differ: actual {:?} vs reference {:?}",
                actual_img.dimensions(),
                reference_img.dimensions()
            );
        }

        let actual_rgba = actual_img.to_rgba8();
        let reference_rgba = reference_img.to_rgba8();

        let mut diff_img = RgbaImage::new(width, height);
        let mut diff_pixels = 0u64;
        let total_pixels = (width as u64) * (height as u64);

        for y in 0..height.min(reference_img.height()) {
            for x in 0..width.min(reference_img.width()) {
                let a = actual_rgba.get_pixel(x, y);
                let b = reference_rgba.get_pixel(x, y);

                if pixels_differ(a, b) {
                    diff_pixels += 1;
                    diff_img.put_pixel(x, y, image::Rgba([255, 0, 0, 255]));
                } else {
                    let c = a.channels();
                    diff_img.put_pixel(x, y, image::Rgba([c[0] / 2, c[1] / 2, c[2] / 2, 128]));
                }
            }
        }

        let diff_image_path = match &self.diff_dir {
            Some(dir) if diff_pixels > 0 => {
                let stem = actual.file_stem().unwrap_or_default().to_string_lossy();
                let path = dir.join(format!("{}-diff.png", stem));
                match std::fs::create_dir_all(dir).map_err(RegressError::from).and_then(|_| {
                    diff_img.save(&path).map_err(RegressError::from)
                }) {
                    Ok(()) => Some(path),
                    Err(e) => {
                        warn!("Could not write diff image {}: {}", path.display(), e);
                        None
                    }
                }
            }
            _ => None,
        };

        Some(PixelDiff {
            diff_pixels,
            total_pixels,
            diff_percent: if total_pixels == 0 {
                0.0
            } else {
                diff_pixels as f64 / total_pixels as f64 * 100.0
            },
            dimensions_match,
            diff_image_path,
        })
    }
}

/// Check the produced image's mean intensity against a recorded baseline
pub fn compare_pixel_mean(actual: &Path, baseline: f64, tolerance: f64) -> RegressResult<ComparisonResult> {
    let img = image::open(actual)?;
    let mean = mean_intensity(&img);
    let label = label_for(actual);
    info!("{} mean intensity: {:.3} (baseline {:.3})", label, mean, baseline);

    Ok(if within_tolerance(mean, baseline, tolerance) {
        ComparisonResult::pass(&label)
    } else {
        ComparisonResult::fail(
            &label,
            Mismatch::PixelMean {
                actual: mean,
                baseline,
                tolerance,
            },
        )
    })
}

/// Mean of all RGB channel values of an image
pub fn mean_intensity(img: &DynamicImage) -> f64 {
    mean_of(img.to_rgb8().as_raw())
}

/// Mean of raw channel values; zero for an empty array
pub fn mean_of(channels: &[u8]) -> f64 {
    if channels.is_empty() {
        return 0.0;
    }
    let sum: u64 = channels.iter().map(|&c| c as u64).sum();
    sum as f64 / channels.len() as f64
}

pub fn within_tolerance(actual: f64, baseline: f64, tolerance: f64) -> bool {
    (actual - baseline).abs() <= tolerance
}

/// Compare captured stdout with the documented output. Leading and
/// trailing whitespace is ignored; everything inside is significant.
pub fn compare_stdout(actual: &str, expected: &str) -> ComparisonResult {
    let actual = actual.trim();
    let expected = expected.trim();
    if actual == expected {
        return ComparisonResult::pass("stdout");
    }

    let mut actual_lines = actual.lines();
    let mut expected_lines = expected.lines();
    let mut line = 1;
    loop {
        match (actual_lines.next(), expected_lines.next()) {
            (Some(a), Some(e)) if a == e => line += 1,
            (a, e) => {
                return ComparisonResult::fail(
                    "stdout",
                    Mismatch::Text {
                        line,
                        actual: a.unwrap_or("<end of output>").to_string(),
                        expected: e.unwrap_or("<end of output>").to_string(),
                    },
                );
            }
        }
    }
}

fn byte_mismatch(actual: &[u8], expected: &[u8]) -> Option<Mismatch> {
    if actual == expected {
        return None;
    }
    let first_difference = actual
        .iter()
        .zip(expected)
        .position(|(a, b)| a != b)
        .unwrap_or_else(|| actual.len().min(expected.len()));

    Some(Mismatch::Bytes {
        first_difference,
        actual_len: actual.len(),
        expected_len: expected.len(),
        actual_sha256: sha256_hex(actual),
        expected_sha256: sha256_hex(expected),
        pixels: None,
    })
}

fn read_reference(path: &Path) -> RegressResult<Vec<u8>> {
    if !path.exists() {
        return Err(RegressError::ReferenceNotFound(path.to_path_buf()));
    }
    Ok(std::fs::read(path)?)
}

fn label_for(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Allow small channel differences (anti-aliasing, compression)
fn pixels_differ(a: &image::Rgba<u8>, b: &image::Rgba<u8>) -> bool {
    const TOLERANCE: i32 = 5;

    a.channels()
        .iter()
        .zip(b.channels())
        .any(|(&x, &y)| (x as i32 - y as i32).abs() > TOLERANCE)
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUN_ID: &str = "0f8b5a1e-3c2d-4e6f-9a7b-1c2d3e4f5a6b";

    fn plot_html(id: &str) -> String {
        format!(
            "<html><body><div id=\"{id}\" class=\"plotly-graph-div\"></div><script>Plotly.newPlot(\"{id}\", []);</script></body></html>",
            id = id
        )
    }

    #[test]
    fn test_normalize_replaces_every_occurrence() {
        let out = RunIdNormalizer::new().normalize(plot_html(RUN_ID).as_bytes()).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(!out.contains(RUN_ID));
        assert_eq!(out.matches(RUN_ID_PLACEHOLDER).count(), 2);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let normalizer = RunIdNormalizer::new();
        let once = normalizer.normalize(plot_html(RUN_ID).as_bytes()).unwrap();
        let twice = normalizer.normalize(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_normalize_requires_an_id() {
        let err = RunIdNormalizer::new().normalize(b"<html></html>").unwrap_err();
        assert!(matches!(err, RegressError::Normalization(_)));
    }

    #[test]
    fn test_normalize_rejects_two_ids() {
        let html = format!("{}{}", plot_html(RUN_ID), plot_html("11111111-2222-3333-4444-555555555555"));
        assert!(RunIdNormalizer::new().normalize(html.as_bytes()).is_err());
    }

    #[test]
    fn test_byte_mismatch_offset() {
        match byte_mismatch(b"abcdef", b"abcxef") {
            Some(Mismatch::Bytes { first_difference, .. }) => assert_eq!(first_difference, 3),
            other => panic!("unexpected {:?}", other),
        }
        match byte_mismatch(b"abc", b"abcd") {
            Some(Mismatch::Bytes { first_difference, .. }) => assert_eq!(first_difference, 3),
            other => panic!("unexpected {:?}", other),
        }
        assert!(byte_mismatch(b"same", b"same").is_none());
    }

    #[test]
    fn test_equal_means_pass_for_any_nonzero_tolerance() {
        let a = [10u8, 20, 30, 40];
        let b = [25u8, 25, 25, 25];
        assert_eq!(mean_of(&a), mean_of(&b));
        for tolerance in [1e-9, 0.5, 10.0] {
            assert!(within_tolerance(mean_of(&a), mean_of(&b), tolerance));
        }
    }

    #[test]
    fn test_mean_difference_beyond_tolerance_fails() {
        let a = [10u8, 10, 10];
        let b = [14u8, 14, 14];
        assert!(!within_tolerance(mean_of(&a), mean_of(&b), 3.9));
        assert!(within_tolerance(mean_of(&a), mean_of(&b), 4.0));
    }

    #[test]
    fn test_stdout_trims_outer_whitespace_only() {
        assert!(compare_stdout("\nHello Python world!\n", "Hello Python world!").passed);
        assert!(!compare_stdout("Hello  Python world!", "Hello Python world!").passed);
    }

    #[test]
    fn test_stdout_reports_first_differing_line() {
        let result = compare_stdout("a\nb\nc", "a\nb\nd");
        match result.mismatch {
            Some(Mismatch::Text { line, actual, expected }) => {
                assert_eq!(line, 3);
                assert_eq!(actual, "c");
                assert_eq!(expected, "d");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_stdout_missing_line() {
        let result = compare_stdout("a", "a\nb");
        match result.mismatch {
            Some(Mismatch::Text { line, actual, .. }) => {
                assert_eq!(line, 2);
                assert_eq!(actual, "<end of output>");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_compare_mode_from_yaml() {
        let exact: CompareMode = serde_yaml::from_str("exact_bytes").unwrap();
        assert_eq!(exact, CompareMode::ExactBytes);
        let mean: CompareMode =
            serde_yaml::from_str("pixel_mean:\n  baseline: 118.5\n  tolerance: 2.0\n").unwrap();
        assert_eq!(
            mean,
            CompareMode::PixelMean {
                baseline: 118.5,
                tolerance: 2.0
            }
        );
    }
}
