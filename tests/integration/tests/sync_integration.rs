//! Integration tests for avsync
//!
//! These tests run real decode workers against a simulated clock and verify:
//! - Two-stream playback presents every frame in order without drops
//! - Seeking starts a new epoch and never presents stale frames
//! - Pause freezes the master clock

use anyhow::{Context, Result};
use avsync_integration_tests::{Clip, Harness};
use avsync::decoder::StreamKind;
use avsync::PlaybackState;

const MAX_TICKS: usize = 400;

fn run_to_end(harness: &mut Harness, mut on_tick: impl FnMut(usize, &Harness)) -> Result<()> {
    for tick in 0..MAX_TICKS {
        harness.tick()?;
        on_tick(tick, harness);
        if harness.player.state() == PlaybackState::Ended {
            return Ok(());
        }
    }
    anyhow::bail!("playback did not end within {} ticks", MAX_TICKS)
}

#[test]
fn test_two_stream_playback_in_sync() -> Result<()> {
    let mut harness = Harness::new(Clip::default())?;
    harness.feed_from(0.0)?;

    let mut timers = Vec::new();
    let mut max_av_diff = 0.0f64;
    run_to_end(&mut harness, |tick, h| {
        timers.push(h.player.coordinator().frame_timer());
        if (10..60).contains(&tick) {
            if let Some(diff) = h.player.stats().av_diff {
                max_av_diff = max_av_diff.max(diff.abs());
            }
        }
    })?;

    let stats = harness.player.stats();
    assert_eq!(stats.late_drops, 0);
    assert_eq!(stats.early_drops, 0);

    let shown = harness.shown.lock();
    assert_eq!(shown.len(), 50);
    for (index, frame) in shown.iter().enumerate() {
        let pts = frame.pts.context("frame without pts")?;
        assert!((pts - index as f64 * 0.04).abs() < 1e-9, "frame {} has pts {}", index, pts);
        assert_eq!(frame.serial, 1);
    }

    assert!(timers.windows(2).all(|pair| pair[1] >= pair[0]));
    assert!(max_av_diff < 0.04, "A-V drift {}", max_av_diff);
    Ok(())
}

#[test]
fn test_seek_starts_new_epoch() -> Result<()> {
    let mut harness = Harness::new(Clip::default())?;
    harness.feed_from(0.0)?;
    for _ in 0..20 {
        harness.tick()?;
    }

    let video = harness.stream(StreamKind::Video)?;
    let audio = harness.stream(StreamKind::Audio)?;
    let old_serial = video.packets.serial();
    assert_eq!(audio.packets.serial(), old_serial);

    // Control surface records the seek, the reader performs it
    assert!(harness.player.seek(1.0)?);
    let request = harness.player.take_seek_request().context("seek not pending")?;
    assert_eq!(request.target, 1.0);
    assert!(!request.byte_mode);

    let shown_before = harness.shown.lock().len();
    harness.player.discard_and_flush(Some(request.target), false);

    assert_eq!(video.packets.serial(), old_serial + 1);
    assert_eq!(audio.packets.serial(), old_serial + 1);
    let external = harness
        .player
        .coordinator()
        .external_clock()
        .now()
        .context("external clock invalid after seek")?;
    assert!((external - 1.0).abs() < 1e-9);

    harness.feed_from(1.0)?;
    let mut timers = Vec::new();
    run_to_end(&mut harness, |_, h| timers.push(h.player.coordinator().frame_timer()))?;

    let shown = harness.shown.lock();
    let after: Vec<_> = shown[shown_before..].to_vec();
    assert!(!after.is_empty());
    assert!(after.iter().all(|frame| frame.serial == old_serial + 1));

    let pts: Vec<f64> = after.iter().filter_map(|frame| frame.pts).collect();
    assert!((pts[0] - 1.0).abs() < 1e-9);
    assert!(pts.windows(2).all(|pair| pair[1] > pair[0]));
    assert!((pts[pts.len() - 1] - 1.96).abs() < 1e-9);
    assert!(timers.windows(2).all(|pair| pair[1] >= pair[0]));
    Ok(())
}

#[test]
fn test_pause_freezes_master_clock() -> Result<()> {
    let mut harness = Harness::new(Clip::default())?;
    harness.feed_from(0.0)?;
    for _ in 0..10 {
        harness.tick()?;
    }

    harness.player.pause();
    assert_eq!(harness.player.state(), PlaybackState::Paused);
    let frozen = harness.player.query_master_clock_time().context("master clock unset")?;
    let shown = harness.shown.lock().len();

    for _ in 0..10 {
        harness.tick()?;
    }
    let now = harness.player.query_master_clock_time().context("master clock unset")?;
    assert!((now - frozen).abs() < 1e-9);
    assert_eq!(harness.shown.lock().len(), shown);

    harness.player.play();
    run_to_end(&mut harness, |_, _| {})?;
    assert_eq!(harness.player.stats().late_drops, 0);
    assert_eq!(harness.shown.lock().len(), 50);
    Ok(())
}
