//! Video pacing
//!
//! The pacing tick decides whether the frame at the head of the video ring
//! is due, drops frames that are already too late and hands the chosen one
//! to the renderer. It never sleeps: the caller re-invokes it no later than
//! the returned interval.

use super::coordinator::SyncCoordinator;
use super::SyncMode;
use crate::decoder::{FrameInfo, StreamKind};
use crate::renderer::VideoRenderer;
use log::{trace, warn};
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Display duration between two consecutive units
///
/// Same-serial neighbours use their pts difference when it is positive and
/// plausible, otherwise the `fallback` estimate. Units from different
/// epochs get zero so the new epoch is shown immediately.
fn frame_duration(earlier: &FrameInfo, later: &FrameInfo, fallback: f64, max_frame_duration: f64) -> f64 {
    if earlier.serial != later.serial {
        return 0.0;
    }
    match (earlier.pts, later.pts) {
        (Some(a), Some(b)) if b - a > 0.0 && b - a <= max_frame_duration => b - a,
        _ => fallback,
    }
}

impl SyncCoordinator {
    /// Run one pacing tick and present at most one frame
    ///
    /// Returns the longest the caller may wait before the next tick.
    pub fn video_refresh(&self, renderer: &mut dyn VideoRenderer) -> Duration {
        let sync = &self.config.sync;
        let mut remaining = sync.refresh_rate;

        if !self.is_paused() && self.get_master_sync_type() == SyncMode::ExternalMaster && self.is_realtime() {
            self.check_external_clock_speed();
        }

        let Some(video) = self.stream(StreamKind::Video) else {
            return Duration::from_secs_f64(remaining);
        };
        let frames = &video.frames;
        let max_frame_duration = video.params.max_frame_duration();
        let mut pacing = self.pacing.lock();

        loop {
            if frames.remaining() == 0 {
                break;
            }
            let (Some(last), Some(head)) = (frames.peek_last(), frames.peek()) else {
                break;
            };

            if head.serial != video.packets.serial() {
                trace!("skipping stale frame from epoch {}", head.serial);
                frames.next();
                continue;
            }

            let now = self.time.now();
            if last.serial != head.serial {
                pacing.frame_timer = now;
            }
            if self.is_paused() {
                break;
            }

            let nominal = if last.slot == head.slot {
                sync.first_frame_duration
            } else {
                frame_duration(&last, &head, head.duration, max_frame_duration)
            };
            let delay = self.compute_target_delay(nominal);

            if now < pacing.frame_timer + delay {
                remaining = remaining.min(pacing.frame_timer + delay - now);
                break;
            }

            pacing.frame_timer += delay;
            if delay > 0.0 && now - pacing.frame_timer > sync.threshold_max {
                pacing.frame_timer = now;
            }

            if let Some(pts) = head.pts {
                frames.with_lock(|| video.clock.set(Some(pts), head.serial));
                self.external.sync_to(&video.clock, sync.nosync_threshold);
            }

            if frames.remaining() > 1 {
                if let Some(next) = frames.peek_next() {
                    let duration = frame_duration(&head, &next, head.duration, max_frame_duration)
                        / self.playback_speed();
                    if !pacing.step && self.frame_drop_enabled() && now > pacing.frame_timer + duration {
                        self.counters.late_drops.fetch_add(1, Ordering::Relaxed);
                        trace!("late drop of frame {:?}", head.pts);
                        frames.next();
                        continue;
                    }
                }
            }

            self.expire_subtitles(video.clock.anchor_pts(), renderer);

            frames.next();
            pacing.force_refresh = true;
            if pacing.step && !self.is_paused() {
                self.toggle_pause_locked(&mut pacing);
            }
            break;
        }

        if pacing.force_refresh && frames.has_shown() {
            self.display(renderer);
        }
        pacing.force_refresh = false;

        Duration::from_secs_f64(remaining.max(0.0))
    }

    /// Ask the next tick to redraw the last shown frame
    pub fn request_redraw(&self) {
        self.pacing.lock().force_refresh = true;
    }

    fn display(&self, renderer: &mut dyn VideoRenderer) {
        let Some(video) = self.stream(StreamKind::Video) else {
            return;
        };

        let serial = video.packets.serial();
        let shown = video.frames.with_last(|unit| {
            if unit.serial != serial {
                return None;
            }
            let result = renderer.upload_and_display(unit);
            unit.uploaded = true;
            Some(result.map(|()| unit.pts))
        });

        match shown.flatten() {
            Some(Ok(pts)) => {
                self.counters.displayed.fetch_add(1, Ordering::Relaxed);
                if let Some(pts) = pts {
                    self.show_subtitle(pts, renderer);
                }
            }
            Some(Err(e)) => warn!("Failed to display frame: {}", e),
            None => {}
        }
    }

    /// Hand the current subtitle to the renderer once it has started
    fn show_subtitle(&self, video_pts: f64, renderer: &mut dyn VideoRenderer) {
        let Some(subtitles) = self.stream(StreamKind::Subtitle) else {
            return;
        };
        let Some(head) = subtitles.frames.peek() else {
            return;
        };
        let start = head.window.map_or(0.0, |(start, _)| start);
        if head.pts.map_or(false, |pts| video_pts >= pts + start) {
            subtitles.frames.with_head(|unit| {
                if !unit.uploaded {
                    renderer.show_subtitle(unit);
                    unit.uploaded = true;
                }
            });
        }
    }

    /// Drop subtitles that are stale, ended, or superseded by the next one
    fn expire_subtitles(&self, video_pts: Option<f64>, renderer: &mut dyn VideoRenderer) {
        let Some(subtitles) = self.stream(StreamKind::Subtitle) else {
            return;
        };
        let frames = &subtitles.frames;

        while let Some(current) = frames.peek() {
            let past = |info: &FrameInfo, use_end: bool| -> bool {
                let (Some(video), Some(pts)) = (video_pts, info.pts) else {
                    return false;
                };
                let (start, end) = info.window.unwrap_or((0.0, f64::INFINITY));
                video > pts + if use_end { end } else { start }
            };

            let stale = current.serial != subtitles.packets.serial();
            let ended = past(&current, true);
            let superseded = frames.peek_next().map_or(false, |next| past(&next, false));
            if !(stale || ended || superseded) {
                break;
            }

            if frames.with_head(|unit| unit.uploaded).unwrap_or(false) {
                renderer.clear_subtitle();
            }
            frames.next();
        }
    }
}
