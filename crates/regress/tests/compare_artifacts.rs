//! Artifact comparison against on-disk references

use image::{Rgb, RgbImage};
use std::path::Path;
use tempfile::TempDir;

use tutorial_regress::compare::{ArtifactComparator, CompareMode, Mismatch, RUN_ID_PLACEHOLDER};
use tutorial_regress::RegressError;

fn write_png(path: &Path, width: u32, height: u32, f: impl Fn(u32, u32) -> [u8; 3]) {
    let img = RgbImage::from_fn(width, height, |x, y| Rgb(f(x, y)));
    img.save(path).expect("write png");
}

fn plot_html(id: &str, data: &str) -> String {
    format!(
        "<html><body><div id=\"{id}\" class=\"plotly-graph-div\"></div>\
         <script>Plotly.newPlot(\"{id}\", {data});</script></body></html>",
        id = id,
        data = data
    )
}

#[test]
fn identical_images_pass_exact_comparison() {
    let dir = TempDir::new().unwrap();
    let actual = dir.path().join("output_file.png");
    let reference = dir.path().join("mpl_squares.png");
    write_png(&actual, 16, 16, |x, _| [x as u8 * 10, 0, 0]);
    std::fs::copy(&actual, &reference).unwrap();

    let result = ArtifactComparator::new(None)
        .compare_file(&actual, &reference, &CompareMode::ExactBytes)
        .unwrap();
    assert!(result.passed, "{}", result);
}

#[test]
fn differing_images_report_pixels_and_write_diff() {
    let dir = TempDir::new().unwrap();
    let diff_dir = dir.path().join("artifacts");
    let actual = dir.path().join("output_file.png");
    let reference = dir.path().join("rw_visual.png");
    write_png(&actual, 10, 10, |_, _| [255, 255, 255]);
    write_png(&reference, 10, 10, |x, _| if x < 5 { [255, 255, 255] } else { [0, 0, 0] });

    let result = ArtifactComparator::new(Some(diff_dir.clone()))
        .compare_file(&actual, &reference, &CompareMode::ExactBytes)
        .unwrap();
    assert!(!result.passed);

    match result.mismatch {
        Some(Mismatch::Bytes { pixels: Some(pixels), actual_sha256, expected_sha256, .. }) => {
            assert_ne!(actual_sha256, expected_sha256);
            assert_eq!(pixels.diff_pixels, 50);
            assert_eq!(pixels.total_pixels, 100);
            assert!(pixels.dimensions_match);
            let diff = pixels.diff_image_path.expect("diff image written");
            assert_eq!(diff, diff_dir.join("output_file-diff.png"));
            assert!(diff.exists());
        }
        other => panic!("unexpected mismatch {:?}", other),
    }
}

#[test]
fn missing_output_is_distinct_from_mismatch() {
    let dir = TempDir::new().unwrap();
    let reference = dir.path().join("mpl_squares.png");
    write_png(&reference, 2, 2, |_, _| [0, 0, 0]);

    let err = ArtifactComparator::new(None)
        .compare_file(&dir.path().join("output_file.png"), &reference, &CompareMode::ExactBytes)
        .unwrap_err();
    assert!(matches!(err, RegressError::ArtifactMissing(_)));
}

#[test]
fn missing_reference_is_reported() {
    let dir = TempDir::new().unwrap();
    let actual = dir.path().join("output_file.png");
    write_png(&actual, 2, 2, |_, _| [0, 0, 0]);

    let err = ArtifactComparator::new(None)
        .compare_file(&actual, &dir.path().join("nope.png"), &CompareMode::ExactBytes)
        .unwrap_err();
    assert!(matches!(err, RegressError::ReferenceNotFound(_)));
}

#[test]
fn run_ids_are_normalized_on_both_sides() {
    let dir = TempDir::new().unwrap();
    let actual = dir.path().join("die_visual.html");
    let reference = dir.path().join("reference.html");
    std::fs::write(&actual, plot_html("0f8b5a1e-3c2d-4e6f-9a7b-1c2d3e4f5a6b", "[1,2,3]")).unwrap();
    std::fs::write(&reference, plot_html(RUN_ID_PLACEHOLDER, "[1,2,3]")).unwrap();

    let comparator = ArtifactComparator::new(None);
    let result = comparator
        .compare_file(&actual, &reference, &CompareMode::NormalizedBytes)
        .unwrap();
    assert!(result.passed, "{}", result);

    std::fs::write(&actual, plot_html("aaaaaaaa-3c2d-4e6f-9a7b-1c2d3e4f5a6b", "[1,2,4]")).unwrap();
    let result = comparator
        .compare_file(&actual, &reference, &CompareMode::NormalizedBytes)
        .unwrap();
    assert!(!result.passed);
}

#[test]
fn output_without_run_id_fails_normalization() {
    let dir = TempDir::new().unwrap();
    let actual = dir.path().join("die_visual.html");
    let reference = dir.path().join("reference.html");
    std::fs::write(&actual, "<html><body>no plot</body></html>").unwrap();
    std::fs::write(&reference, plot_html(RUN_ID_PLACEHOLDER, "[]")).unwrap();

    let err = ArtifactComparator::new(None)
        .compare_file(&actual, &reference, &CompareMode::NormalizedBytes)
        .unwrap_err();
    assert!(matches!(err, RegressError::Normalization(_)));
}

#[test]
fn pixel_mean_within_tolerance() {
    let dir = TempDir::new().unwrap();
    let actual = dir.path().join("screenshot.png");
    // Half black, half white: mean intensity 127.5
    write_png(&actual, 4, 4, |x, _| if x < 2 { [0, 0, 0] } else { [255, 255, 255] });

    let comparator = ArtifactComparator::new(None);
    let pass = comparator
        .compare_file(&actual, Path::new("unused"), &CompareMode::PixelMean { baseline: 128.0, tolerance: 1.0 })
        .unwrap();
    assert!(pass.passed);

    let fail = comparator
        .compare_file(&actual, Path::new("unused"), &CompareMode::PixelMean { baseline: 120.0, tolerance: 1.0 })
        .unwrap();
    match fail.mismatch {
        Some(Mismatch::PixelMean { actual, baseline, .. }) => {
            assert!((actual - 127.5).abs() < 1e-9);
            assert_eq!(baseline, 120.0);
        }
        other => panic!("unexpected mismatch {:?}", other),
    }
}
