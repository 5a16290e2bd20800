//! Tick gating and the playback state machine.
//!
//! ```text
//! Uninitialized -> AwaitingSource -> Ready -> Playing -> EndOfStream -> Playing (loop)
//!                                                                    -> Stopped
//! any setup failure -> Failed
//! ```
//!
//! Time is host milliseconds as a wrapping `u32`.

use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    Uninitialized,
    /// Stream source not connected yet; retried on a backoff.
    AwaitingSource,
    Ready,
    Playing,
    EndOfStream,
    Stopped,
    Failed,
}

/// Snapshot of playback progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackState {
    pub current_frame_index: u32,
    pub last_tick_ms: u32,
    pub target_interval_ms: u32,
    pub looping: bool,
    pub initialized: bool,
}

#[derive(Debug, Clone)]
pub struct PlaybackClock {
    state: ClockState,
    playback: PlaybackState,
    retry_interval_ms: u32,
    last_attempt_ms: Option<u32>,
    loops: u32,
}

impl PlaybackClock {
    pub fn new(target_interval_ms: u32, looping: bool, retry_interval_ms: u32) -> Self {
        Self {
            state: ClockState::Uninitialized,
            playback: PlaybackState {
                current_frame_index: 0,
                last_tick_ms: 0,
                target_interval_ms,
                looping,
                initialized: false,
            },
            retry_interval_ms,
            last_attempt_ms: None,
            loops: 0,
        }
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    pub fn playback(&self) -> &PlaybackState {
        &self.playback
    }

    /// Completed passes through the source.
    pub fn loops(&self) -> u32 {
        self.loops
    }

    pub fn set_interval(&mut self, interval_ms: u32) {
        self.playback.target_interval_ms = interval_ms;
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.playback.looping = looping;
    }

    /// Enter `AwaitingSource` and start the retry timer at `now_ms`.
    pub fn await_source(&mut self, now_ms: u32) {
        if self.state != ClockState::AwaitingSource {
            debug!(from = ?self.state, "waiting for source");
        }
        self.state = ClockState::AwaitingSource;
        self.last_attempt_ms = Some(now_ms);
    }

    /// Whether the next source attempt may run.
    pub fn retry_due(&self, now_ms: u32) -> bool {
        match self.last_attempt_ms {
            Some(last) => now_ms.wrapping_sub(last) >= self.retry_interval_ms,
            None => true,
        }
    }

    pub fn mark_attempt(&mut self, now_ms: u32) {
        self.last_attempt_ms = Some(now_ms);
    }

    pub fn source_ready(&mut self, now_ms: u32) {
        info!(interval_ms = self.playback.target_interval_ms, "source ready");
        self.state = ClockState::Ready;
        self.playback.initialized = true;
        self.playback.current_frame_index = 0;
        self.playback.last_tick_ms = now_ms;
    }

    pub fn fail(&mut self) {
        self.state = ClockState::Failed;
    }

    /// Whether a frame step should run at `now_ms`. The first tick after
    /// the source becomes ready is always admitted.
    pub fn admit(&mut self, now_ms: u32) -> bool {
        match self.state {
            ClockState::Ready => {
                self.state = ClockState::Playing;
                self.playback.last_tick_ms = now_ms;
                true
            }
            ClockState::Playing => {
                let elapsed = now_ms.wrapping_sub(self.playback.last_tick_ms);
                if elapsed < self.playback.target_interval_ms {
                    return false;
                }
                self.playback.last_tick_ms = now_ms;
                true
            }
            _ => false,
        }
    }

    /// Record a presented frame; `wrapped` means the source looped to reach it.
    pub fn frame_shown(&mut self, wrapped: bool) {
        if wrapped {
            self.end_of_stream();
        }
        if self.state == ClockState::Playing {
            self.playback.current_frame_index = self.playback.current_frame_index.wrapping_add(1);
        }
    }

    /// The source ran out of frames. Returns the state afterwards.
    pub fn end_of_stream(&mut self) -> ClockState {
        self.state = ClockState::EndOfStream;
        if self.playback.looping {
            self.loops += 1;
            self.playback.current_frame_index = 0;
            self.state = ClockState::Playing;
            debug!(loops = self.loops, "looping to first frame");
        } else {
            info!(frames = self.playback.current_frame_index, "end of stream, stopping");
            self.state = ClockState::Stopped;
        }
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playing(interval: u32) -> PlaybackClock {
        let mut clock = PlaybackClock::new(interval, true, 5000);
        clock.source_ready(0);
        assert!(clock.admit(0));
        clock
    }

    #[test]
    fn ticks_are_gated_by_interval() {
        let mut clock = playing(100);
        assert!(!clock.admit(50));
        assert!(!clock.admit(99));
        assert!(clock.admit(100));
        assert!(!clock.admit(150));
        assert!(clock.admit(260));
    }

    #[test]
    fn elapsed_time_wraps() {
        let mut clock = PlaybackClock::new(30, true, 5000);
        clock.source_ready(u32::MAX - 10);
        assert!(clock.admit(u32::MAX - 10));
        assert!(!clock.admit(5));
        assert!(clock.admit(20));
    }

    #[test]
    fn retry_backoff() {
        let mut clock = PlaybackClock::new(30, true, 5000);
        assert!(clock.retry_due(0));
        clock.await_source(1000);
        assert_eq!(clock.state(), ClockState::AwaitingSource);
        assert!(!clock.retry_due(5999));
        assert!(clock.retry_due(6000));
        assert!(!clock.admit(6000));
    }

    #[test]
    fn end_of_stream_follows_loop_flag() {
        let mut clock = playing(10);
        clock.frame_shown(false);
        clock.frame_shown(false);
        assert_eq!(clock.playback().current_frame_index, 2);
        assert_eq!(clock.end_of_stream(), ClockState::Playing);
        assert_eq!(clock.playback().current_frame_index, 0);
        assert_eq!(clock.loops(), 1);

        clock.set_looping(false);
        assert_eq!(clock.end_of_stream(), ClockState::Stopped);
        assert!(!clock.admit(1_000));
    }

    #[test]
    fn failed_clock_never_admits() {
        let mut clock = playing(10);
        clock.fail();
        assert!(!clock.admit(100));
    }
}
