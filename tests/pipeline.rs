use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};
use tempfile::tempdir;

use streamsafe::config::{DetectorSettings, SourceSettings};
use streamsafe::sink::FrameSink;
use streamsafe::{
    open_source, DetectionKind, DetectionSettings, Frame, ImageSequenceSink, Quality,
    StreamSafeProcessor,
};

fn settings(width: u32, height: u32) -> SourceSettings {
    SourceSettings {
        uri: "stub://pipeline".to_string(),
        target_fps: 30,
        width,
        height,
    }
}

fn synthetic_frames(count: u64) -> Result<Vec<Frame>> {
    let uri = format!("stub://pipeline?frames={}", count);
    let mut source = open_source(&uri, &settings(320, 240))?;
    source.connect()?;
    let mut frames = Vec::new();
    while let Some(frame) = source.next_frame()? {
        frames.push(frame);
    }
    Ok(frames)
}

fn only(kind: DetectionKind) -> DetectionSettings {
    let mut settings = DetectionSettings::default();
    settings.set(kind, true);
    settings
}

fn luma(frame: &Frame, x: u32, y: u32) -> i32 {
    let p = frame.image().get_pixel(x, y).0;
    (p[0] as i32 + p[1] as i32 + p[2] as i32) / 3
}

#[test]
fn still_image_redacts_signs_and_plates() -> Result<()> {
    let mut frame = synthetic_frames(1)?
        .pop()
        .ok_or_else(|| anyhow!("no frame"))?;
    let mut processor = StreamSafeProcessor::from_config(&DetectorSettings::default())?;

    let report = processor.process_still(&mut frame, &DetectionSettings::all());
    let kinds: Vec<DetectionKind> = report.detections.iter().map(|d| d.kind).collect();
    assert!(kinds.contains(&DetectionKind::StreetSigns));
    assert!(kinds.contains(&DetectionKind::LicensePlates));
    assert_eq!(report.redacted_regions, report.detections.len());
    Ok(())
}

#[test]
fn plate_edge_is_smoothed() -> Result<()> {
    let mut frame = synthetic_frames(1)?
        .pop()
        .ok_or_else(|| anyhow!("no frame"))?;
    // Left edge of the synthetic plate, inside the fallback plate region.
    let before = (luma(&frame, 36, 205) - luma(&frame, 35, 205)).abs();
    assert!(before > 100);

    let mut processor = StreamSafeProcessor::from_config(&DetectorSettings::default())?;
    let report = processor.process_frame(&mut frame, &only(DetectionKind::LicensePlates));
    assert_eq!(report.detections.len(), 1);
    assert!(report.detections[0].fixed);
    assert_eq!(report.redacted_regions, 1);
    // Without a plate model the fixed regions are blurred but not counted.
    assert_eq!(report.detection_count(), 0);
    let after = (luma(&frame, 36, 205) - luma(&frame, 35, 205)).abs();
    assert!(after < 40, "edge contrast {} after blur", after);
    Ok(())
}

#[test]
fn sign_detector_runs_on_cadence_and_cached_regions_persist() -> Result<()> {
    let mut processor = StreamSafeProcessor::from_config(&DetectorSettings::default())?;
    let settings = only(DetectionKind::StreetSigns);

    let mut fresh = Vec::new();
    let mut redacted = Vec::new();
    for (index, mut frame) in synthetic_frames(30)?.into_iter().enumerate() {
        let report = processor.process_frame(&mut frame, &settings);
        if report.detection_count() > 0 {
            fresh.push(index + 1);
        }
        redacted.push(report.redacted_regions);
    }

    assert_eq!(fresh, vec![15, 30]);
    assert!(redacted[..14].iter().all(|n| *n == 0));
    assert!(redacted[14..].iter().all(|n| *n >= 1));
    Ok(())
}

#[test]
fn disabled_kinds_leave_frames_untouched() -> Result<()> {
    let mut frame = synthetic_frames(1)?
        .pop()
        .ok_or_else(|| anyhow!("no frame"))?;
    let before = frame.pixels().to_vec();
    let mut processor = StreamSafeProcessor::from_config(&DetectorSettings::default())?;
    let report = processor.process_frame(&mut frame, &DetectionSettings::default());
    assert_eq!(report.redacted_regions, 0);
    assert_eq!(frame.pixels(), &before[..]);
    Ok(())
}

#[test]
fn redacted_sequence_lands_in_sink_with_manifest() -> Result<()> {
    let dir = tempdir()?;
    let mut sink = ImageSequenceSink::create(dir.path(), Quality::Low)?;
    let mut processor = StreamSafeProcessor::from_config(&DetectorSettings::default())?;
    for mut frame in synthetic_frames(4)? {
        processor.process_frame(&mut frame, &DetectionSettings::all());
        sink.write(&frame)?;
    }
    let summary = sink.finish()?;
    assert_eq!(summary.frames_written, 4);
    assert_eq!(summary.output.as_deref(), Some(dir.path()));

    let manifest: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.path().join("manifest.json"))?)?;
    let frames = manifest["frames"]
        .as_array()
        .ok_or_else(|| anyhow!("manifest has no frames"))?;
    assert_eq!(frames.len(), 4);
    for entry in frames {
        let file = entry["file"].as_str().ok_or_else(|| anyhow!("no file"))?;
        let bytes = std::fs::read(dir.path().join(file))?;
        assert_eq!(entry["sha256"], hex::encode(Sha256::digest(&bytes)));
    }
    Ok(())
}
