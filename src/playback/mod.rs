//! Timeline playback onto the LED strip.
//!
//! Position is derived from the clock instead of accumulated per tick:
//! `current = anchor_time + (now - anchor) * tempo`. Every transport change
//! (tempo, seek, pause, resume, loop) re-anchors so the position is
//! continuous across the change.

pub mod timeline;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::PlaybackSettings;
use crate::error::{LightsError, Result};
use crate::hub::{CoreEvent, EventHub};
use crate::keymap::KeyMapper;
use crate::led::{note_color, LedRenderer, OutputArbiter, Rgb};
use timeline::{MidiFileParser, Timeline};

const MIN_LOOP_SECS: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Idle,
    Playing,
    Paused,
    Stopped,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybackStatus {
    pub state: PlaybackState,
    pub filename: Option<String>,
    pub current_time: f64,
    pub total_duration: f64,
    pub tempo: f64,
    pub volume: f64,
    pub loop_enabled: bool,
    pub loop_start: f64,
    pub loop_end: f64,
    pub active_notes: usize,
}

#[derive(Debug, Clone, Copy)]
struct SoundingNote {
    note: u8,
    velocity: u8,
    end_time: f64,
}

#[derive(Debug)]
struct PlaybackSession {
    state: PlaybackState,
    filename: Option<String>,
    timeline: Option<Arc<Timeline>>,
    current_time: f64,
    tempo: f64,
    volume: f64,
    loop_enabled: bool,
    loop_start: f64,
    loop_end: f64,
    active: Vec<SoundingNote>,
    /// Next timeline note not yet considered for activation.
    cursor: usize,
    anchor_time: f64,
    anchor: Option<Instant>,
}

impl Default for PlaybackSession {
    fn default() -> Self {
        Self {
            state: PlaybackState::Idle,
            filename: None,
            timeline: None,
            current_time: 0.0,
            tempo: 1.0,
            volume: 1.0,
            loop_enabled: false,
            loop_start: 0.0,
            loop_end: 0.0,
            active: Vec::new(),
            cursor: 0,
            anchor_time: 0.0,
            anchor: None,
        }
    }
}

impl PlaybackSession {
    fn total_duration(&self) -> f64 {
        self.timeline.as_ref().map_or(0.0, |t| t.duration())
    }

    fn position(&self, now: Instant) -> f64 {
        match (self.state, self.anchor) {
            (PlaybackState::Playing, Some(anchor)) => {
                let elapsed = now.saturating_duration_since(anchor).as_secs_f64() * self.tempo;
                (self.anchor_time + elapsed).min(self.total_duration())
            }
            _ => self.current_time,
        }
    }

    fn reanchor(&mut self, time: f64, now: Instant) {
        self.current_time = time;
        self.anchor_time = time;
        self.anchor = Some(now);
    }

    /// Drop sounding notes and point the cursor at `time`.
    fn reposition(&mut self, time: f64, window: f64) {
        self.active.clear();
        self.cursor = self
            .timeline
            .as_ref()
            .map_or(0, |t| t.first_at_or_after(time - window));
    }

    fn reset_transport(&mut self) {
        self.current_time = 0.0;
        self.anchor = None;
        self.anchor_time = 0.0;
        self.active.clear();
        self.cursor = 0;
    }

    fn status(&self, now: Instant) -> PlaybackStatus {
        PlaybackStatus {
            state: self.state,
            filename: self.filename.clone(),
            current_time: self.position(now),
            total_duration: self.total_duration(),
            tempo: self.tempo,
            volume: self.volume,
            loop_enabled: self.loop_enabled,
            loop_start: self.loop_start,
            loop_end: self.loop_end,
            active_notes: self.active.len(),
        }
    }
}

struct Shared {
    session: Mutex<PlaybackSession>,
    /// Bumped on every start and halt; a loop exits once it is stale.
    generation: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PlaybackSession> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct PlaybackScheduler {
    shared: Arc<Shared>,
    renderer: Arc<LedRenderer>,
    mapper: Arc<KeyMapper>,
    arbiter: Arc<OutputArbiter>,
    hub: EventHub,
    parser: Arc<dyn MidiFileParser>,
    settings: PlaybackSettings,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackScheduler {
    pub fn new(
        settings: PlaybackSettings,
        renderer: Arc<LedRenderer>,
        mapper: Arc<KeyMapper>,
        arbiter: Arc<OutputArbiter>,
        hub: EventHub,
        parser: Arc<dyn MidiFileParser>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                session: Mutex::new(PlaybackSession::default()),
                generation: AtomicU64::new(0),
            }),
            renderer,
            mapper,
            arbiter,
            hub,
            parser,
            settings,
            worker: Mutex::new(None),
        }
    }

    fn window(&self) -> f64 {
        self.settings.onset_window_ms as f64 / 1000.0
    }

    fn publish_status(&self) {
        let status = self.shared.lock().status(Instant::now());
        self.hub.publish(CoreEvent::Playback(status));
    }

    /// Parse and install a new timeline. On failure the scheduler enters
    /// `Error`, any running playback halts and the old position is kept.
    pub async fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let parsed = match self.parser.parse(path) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::error!("could not load {}: {e}", path.display());
                self.shared.lock().state = PlaybackState::Error;
                self.halt().await;
                self.release_strip();
                self.publish_status();
                return Err(LightsError::Load(e));
            }
        };

        self.halt().await;
        let timeline = Timeline::from_parsed(parsed);
        log::info!(
            "loaded {} ({} notes, {:.1}s)",
            path.display(),
            timeline.notes().len(),
            timeline.duration()
        );
        {
            let mut session = self.shared.lock();
            session.loop_enabled = false;
            session.loop_start = 0.0;
            session.loop_end = timeline.duration();
            session.filename = path.file_name().map(|n| n.to_string_lossy().into_owned());
            session.timeline = Some(Arc::new(timeline));
            session.state = PlaybackState::Idle;
            session.reset_transport();
        }
        self.release_strip();
        self.publish_status();
        Ok(())
    }

    /// Begin (or resume) playback. Must run inside a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let now = Instant::now();
        let generation = {
            let mut session = self.shared.lock();
            let state = session.state;
            match state {
                PlaybackState::Error => return Err(LightsError::PlaybackFailed),
                PlaybackState::Playing => return Ok(()),
                PlaybackState::Paused => {
                    drop(session);
                    self.resume();
                    return Ok(());
                }
                _ if session.timeline.is_none() => return Err(LightsError::NotLoaded),
                _ => {}
            }
            let from = session.current_time;
            session.reanchor(from, now);
            session.reposition(from, self.window());
            session.state = PlaybackState::Playing;
            self.arbiter.claim_for_playback();
            self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1
        };
        self.spawn_loop(generation);
        self.publish_status();
        Ok(())
    }

    fn spawn_loop(&self, generation: u64) {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        // a previous loop may still be winding down after completion
        if let Some(previous) = worker.take() {
            previous.abort();
        }

        let render_hz = self.settings.render_hz.max(1.0);
        let status_hz = self.settings.status_hz.max(0.1);
        let scheduler_loop = SchedulerLoop {
            shared: Arc::clone(&self.shared),
            renderer: Arc::clone(&self.renderer),
            mapper: Arc::clone(&self.mapper),
            arbiter: Arc::clone(&self.arbiter),
            hub: self.hub.clone(),
            tick: Duration::from_millis(self.settings.tick_ms.max(1)),
            render_period: Duration::from_secs_f64(1.0 / render_hz),
            status_period: Duration::from_secs_f64(1.0 / status_hz),
            window: self.window(),
            generation,
        };
        *worker = Some(tokio::spawn(scheduler_loop.run()));
    }

    pub fn pause(&self) {
        let now = Instant::now();
        {
            let mut session = self.shared.lock();
            if session.state != PlaybackState::Playing {
                return;
            }
            session.current_time = session.position(now);
            session.anchor = None;
            session.state = PlaybackState::Paused;
        }
        self.publish_status();
    }

    pub fn resume(&self) {
        let now = Instant::now();
        {
            let mut session = self.shared.lock();
            if session.state != PlaybackState::Paused {
                return;
            }
            let at = session.current_time;
            session.reanchor(at, now);
            session.state = PlaybackState::Playing;
        }
        self.publish_status();
    }

    /// Stop the loop, blank the strip and rewind to zero.
    pub async fn stop(&self) {
        self.halt().await;
        {
            let mut session = self.shared.lock();
            if session.state != PlaybackState::Error {
                session.state = if session.timeline.is_some() {
                    PlaybackState::Stopped
                } else {
                    PlaybackState::Idle
                };
            }
            session.reset_transport();
        }
        self.release_strip();
        self.publish_status();
    }

    /// Blank the strip and hand it back to live input. Leaves the strip
    /// alone when live input already owns it.
    fn release_strip(&self) {
        if !self.arbiter.live_may_render() {
            self.renderer.clear();
            self.arbiter.release_to_live();
        }
    }

    /// Signal the loop and wait for it, bounded by the stop timeout.
    async fn halt(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(mut handle) = handle else {
            return;
        };
        let timeout = Duration::from_millis(self.settings.stop_timeout_ms);
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("playback loop failed: {e}"),
            Err(_) => {
                log::warn!("playback loop did not stop within {timeout:?}, aborting");
                handle.abort();
            }
        }
    }

    /// Jump to `time` seconds, clamped to the timeline.
    pub fn seek(&self, time: f64) -> f64 {
        let now = Instant::now();
        let target = {
            let mut session = self.shared.lock();
            let total = session.total_duration();
            let target = if time.is_finite() {
                time.clamp(0.0, total)
            } else {
                0.0
            };
            if session.state == PlaybackState::Playing {
                session.reanchor(target, now);
            } else {
                session.current_time = target;
            }
            session.reposition(target, self.window());
            target
        };
        if !self.arbiter.live_may_render() {
            self.renderer.clear();
        }
        self.publish_status();
        target
    }

    /// Change the tempo multiplier without moving the playhead.
    pub fn set_tempo(&self, multiplier: f64) -> f64 {
        let now = Instant::now();
        let applied = {
            let mut session = self.shared.lock();
            if !multiplier.is_finite() {
                log::warn!("ignoring tempo {multiplier}");
                return session.tempo;
            }
            let applied = multiplier.clamp(self.settings.tempo_min, self.settings.tempo_max);
            if session.state == PlaybackState::Playing {
                let at = session.position(now);
                session.reanchor(at, now);
            }
            session.tempo = applied;
            applied
        };
        self.publish_status();
        applied
    }

    pub fn set_volume(&self, volume: f64) -> f64 {
        let applied = if volume.is_finite() {
            volume.clamp(0.0, 1.0)
        } else {
            1.0
        };
        self.shared.lock().volume = applied;
        self.publish_status();
        applied
    }

    /// Configure the loop region. The region is at least one second long
    /// and always inside the timeline.
    pub fn set_loop(&self, enabled: bool, start: f64, end: f64) -> (f64, f64) {
        let region = {
            let mut session = self.shared.lock();
            let total = session.total_duration();
            let mut start = if start.is_finite() { start.clamp(0.0, total) } else { 0.0 };
            let end = if end.is_finite() { end } else { total };
            let end = end.max(start + MIN_LOOP_SECS).min(total);
            if end - start < MIN_LOOP_SECS {
                start = (end - MIN_LOOP_SECS).max(0.0);
            }
            if enabled && end <= start {
                log::warn!("timeline too short to loop");
            }
            session.loop_enabled = enabled && end > start;
            session.loop_start = start;
            session.loop_end = end;
            (start, end)
        };
        self.publish_status();
        region
    }

    pub fn current_time(&self) -> f64 {
        self.shared.lock().position(Instant::now())
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.lock().state
    }

    pub fn status(&self) -> PlaybackStatus {
        self.shared.lock().status(Instant::now())
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
    }
}

enum Step {
    Running,
    Paused,
    Looped,
    Finished,
    Exit,
}

struct SchedulerLoop {
    shared: Arc<Shared>,
    renderer: Arc<LedRenderer>,
    mapper: Arc<KeyMapper>,
    arbiter: Arc<OutputArbiter>,
    hub: EventHub,
    tick: Duration,
    render_period: Duration,
    status_period: Duration,
    window: f64,
    generation: u64,
}

impl SchedulerLoop {
    async fn run(self) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_render: Option<Instant> = None;
        let mut last_status: Option<Instant> = None;

        loop {
            ticker.tick().await;
            if self.is_stale() {
                break;
            }
            let now = Instant::now();

            match self.step(now) {
                Step::Running => {}
                Step::Paused => {}
                Step::Looped => {
                    self.renderer.clear();
                    last_render = None;
                }
                Step::Finished => {
                    log::info!("playback finished");
                    self.publish_status(now);
                    break;
                }
                Step::Exit => break,
            }

            if due(last_render, now, self.render_period) {
                if let Some(frame) = self.compose() {
                    self.renderer.render_frame(&frame);
                }
                last_render = Some(now);
            }
            if due(last_status, now, self.status_period) {
                self.publish_status(now);
                last_status = Some(now);
            }
        }
    }

    fn publish_status(&self, now: Instant) {
        let status = self.shared.lock().status(now);
        self.hub.publish(CoreEvent::Playback(status));
    }

    fn is_stale(&self) -> bool {
        self.shared.generation.load(Ordering::SeqCst) != self.generation
    }

    fn step(&self, now: Instant) -> Step {
        let mut session = self.shared.lock();
        if self.is_stale() {
            return Step::Exit;
        }
        match session.state {
            PlaybackState::Playing => {}
            PlaybackState::Paused => return Step::Paused,
            _ => return Step::Exit,
        }
        let Some(timeline) = session.timeline.clone() else {
            return Step::Exit;
        };

        let time = session.position(now);
        let looping = session.loop_enabled && session.loop_end > session.loop_start;
        if looping && time >= session.loop_end {
            let start = session.loop_start;
            session.reanchor(start, now);
            session.reposition(start, self.window);
            return Step::Looped;
        }
        if time >= timeline.duration() {
            // blank and release under the session lock so a concurrent
            // start() cannot claim the strip in between
            session.state = PlaybackState::Stopped;
            session.reset_transport();
            self.renderer.clear();
            self.arbiter.release_to_live();
            return Step::Finished;
        }
        session.current_time = time;

        let notes = timeline.notes();
        while let Some(next) = notes.get(session.cursor) {
            if next.onset > time + self.window {
                break;
            }
            if next.onset >= time - self.window {
                session.active.push(SoundingNote {
                    note: next.note,
                    velocity: next.velocity,
                    end_time: next.end(),
                });
            }
            session.cursor += 1;
        }
        session.active.retain(|n| n.end_time > time);
        Step::Running
    }

    /// Frame for the current active set, or `None` when not playing.
    fn compose(&self) -> Option<Vec<Rgb>> {
        let count = self.renderer.num_pixels();
        let session = self.shared.lock();
        if session.state != PlaybackState::Playing {
            return None;
        }
        let mut frame = vec![Rgb::BLACK; count];
        let volume = session.volume as f32;
        for sounding in &session.active {
            let color = note_color(sounding.note, sounding.velocity).scale(volume);
            for &index in self.mapper.leds_for(sounding.note) {
                if let Some(pixel) = frame.get_mut(index) {
                    *pixel = color;
                }
            }
        }
        Some(frame)
    }
}

fn due(last: Option<Instant>, now: Instant, period: Duration) -> bool {
    last.map_or(true, |at| now.saturating_duration_since(at) >= period)
}

#[cfg(test)]
mod tests {
    use super::timeline::{ParseError, ParsedEvent, ParsedMidi};
    use super::*;
    use crate::config::{MappingSettings, PianoSize};
    use crate::note::NoteKind;
    use std::collections::BTreeMap;

    struct FixedParser(ParsedMidi);

    impl MidiFileParser for FixedParser {
        fn parse(&self, _path: &Path) -> std::result::Result<ParsedMidi, ParseError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenParser;

    impl MidiFileParser for BrokenParser {
        fn parse(&self, _path: &Path) -> std::result::Result<ParsedMidi, ParseError> {
            Err(ParseError::Malformed("truncated track chunk".into()))
        }
    }

    fn note(onset_ms: f64, len_ms: f64, note: u8) -> [ParsedEvent; 2] {
        [
            ParsedEvent {
                time_ms: onset_ms,
                note,
                velocity: 100,
                kind: NoteKind::On,
            },
            ParsedEvent {
                time_ms: onset_ms + len_ms,
                note,
                velocity: 0,
                kind: NoteKind::Off,
            },
        ]
    }

    /// C4 at 0.0s and E4 at 0.6s, half a second each.
    fn two_notes() -> ParsedMidi {
        let mut events = Vec::new();
        events.extend(note(0.0, 500.0, 60));
        events.extend(note(600.0, 500.0, 64));
        ParsedMidi {
            events,
            duration: 1100.0,
            metadata: BTreeMap::new(),
        }
    }

    struct Rig {
        scheduler: PlaybackScheduler,
        renderer: Arc<LedRenderer>,
        mapper: Arc<KeyMapper>,
        arbiter: Arc<OutputArbiter>,
    }

    fn rig(parser: Arc<dyn MidiFileParser>) -> Rig {
        rig_with(parser, PlaybackSettings::default())
    }

    fn rig_with(parser: Arc<dyn MidiFileParser>, settings: PlaybackSettings) -> Rig {
        let renderer = Arc::new(LedRenderer::simulated(176));
        let mapper = Arc::new(KeyMapper::from_parts(
            PianoSize::Keys88.spec(),
            176,
            false,
            &MappingSettings::default(),
        ));
        let arbiter = Arc::new(OutputArbiter::new());
        let scheduler = PlaybackScheduler::new(
            settings,
            Arc::clone(&renderer),
            Arc::clone(&mapper),
            Arc::clone(&arbiter),
            EventHub::new(),
            parser,
        );
        Rig {
            scheduler,
            renderer,
            mapper,
            arbiter,
        }
    }

    fn lit(renderer: &LedRenderer) -> Vec<usize> {
        renderer
            .frame()
            .iter()
            .enumerate()
            .filter(|(_, px)| !px.is_black())
            .map(|(i, _)| i)
            .collect()
    }

    async fn sleep_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn plays_two_note_timeline_onto_leds() {
        let rig = rig(Arc::new(FixedParser(two_notes())));
        rig.scheduler.load("song.mid").await.unwrap();
        rig.scheduler.start().unwrap();
        assert!(!rig.arbiter.live_may_render());

        sleep_ms(100).await;
        assert_eq!(lit(&rig.renderer), rig.mapper.leds_for(60).to_vec());

        sleep_ms(600).await;
        assert_eq!(lit(&rig.renderer), rig.mapper.leds_for(64).to_vec());

        rig.scheduler.stop().await;
        assert!(lit(&rig.renderer).is_empty());
        assert!(rig.arbiter.live_may_render());
    }

    #[tokio::test(start_paused = true)]
    async fn tempo_change_keeps_position() {
        let rig = rig(Arc::new(FixedParser(two_notes())));
        rig.scheduler.load("song.mid").await.unwrap();
        rig.scheduler.start().unwrap();
        sleep_ms(300).await;

        let before = rig.scheduler.current_time();
        assert_eq!(rig.scheduler.set_tempo(2.0), 2.0);
        let after = rig.scheduler.current_time();
        assert!((before - after).abs() < 1e-6);

        sleep_ms(100).await;
        assert!((rig.scheduler.current_time() - (before + 0.2)).abs() < 1e-6);

        assert_eq!(rig.scheduler.set_tempo(100.0), 4.0);
        assert_eq!(rig.scheduler.set_tempo(0.0), 0.1);
        rig.scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn seek_clamps_to_timeline() {
        let rig = rig(Arc::new(FixedParser(two_notes())));
        rig.scheduler.load("song.mid").await.unwrap();

        assert_eq!(rig.scheduler.seek(-5.0), 0.0);
        assert_eq!(rig.scheduler.current_time(), 0.0);
        assert_eq!(rig.scheduler.seek(1.1 + 100.0), 1.1);
        assert_eq!(rig.scheduler.current_time(), 1.1);
    }

    #[tokio::test(start_paused = true)]
    async fn seek_while_playing_moves_the_playhead() {
        let rig = rig(Arc::new(FixedParser(two_notes())));
        rig.scheduler.load("song.mid").await.unwrap();
        rig.scheduler.start().unwrap();
        sleep_ms(50).await;

        rig.scheduler.seek(0.6);
        sleep_ms(50).await;
        assert!((rig.scheduler.current_time() - 0.65).abs() < 1e-6);
        assert_eq!(lit(&rig.renderer), rig.mapper.leds_for(64).to_vec());
        rig.scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pause_excludes_paused_time() {
        let rig = rig(Arc::new(FixedParser(two_notes())));
        rig.scheduler.load("song.mid").await.unwrap();
        rig.scheduler.start().unwrap();
        sleep_ms(200).await;

        rig.scheduler.pause();
        assert_eq!(rig.scheduler.state(), PlaybackState::Paused);
        sleep_ms(500).await;
        assert!((rig.scheduler.current_time() - 0.2).abs() < 1e-6);

        rig.scheduler.resume();
        sleep_ms(100).await;
        assert!((rig.scheduler.current_time() - 0.3).abs() < 1e-6);
        rig.scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn finishes_and_clears() {
        let rig = rig(Arc::new(FixedParser(two_notes())));
        rig.scheduler.load("song.mid").await.unwrap();
        rig.scheduler.start().unwrap();
        sleep_ms(1300).await;

        assert_eq!(rig.scheduler.state(), PlaybackState::Stopped);
        assert_eq!(rig.scheduler.current_time(), 0.0);
        assert!(lit(&rig.renderer).is_empty());
        assert!(rig.arbiter.live_may_render());

        // the timeline survives, playback can start again
        rig.scheduler.start().unwrap();
        assert_eq!(rig.scheduler.state(), PlaybackState::Playing);
        rig.scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn loop_region_wraps() {
        let mut events = Vec::new();
        events.extend(note(0.0, 500.0, 60));
        events.extend(note(2500.0, 500.0, 62));
        let parsed = ParsedMidi {
            events,
            duration: 3000.0,
            metadata: BTreeMap::new(),
        };
        let rig = rig(Arc::new(FixedParser(parsed)));
        rig.scheduler.load("song.mid").await.unwrap();
        assert_eq!(rig.scheduler.set_loop(true, 0.0, 1.0), (0.0, 1.0));
        rig.scheduler.start().unwrap();

        sleep_ms(1200).await;
        let t = rig.scheduler.current_time();
        assert!(t < 0.3, "expected to have wrapped, at {t}");
        assert_eq!(rig.scheduler.state(), PlaybackState::Playing);
        assert_eq!(lit(&rig.renderer), rig.mapper.leds_for(60).to_vec());
        rig.scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn loop_region_is_clamped() {
        let rig = rig(Arc::new(FixedParser(two_notes())));
        rig.scheduler.load("song.mid").await.unwrap();
        assert_eq!(rig.scheduler.set_loop(true, -3.0, 0.5), (0.0, 1.0));
        let (start, end) = rig.scheduler.set_loop(true, 1.0, 9.0);
        assert!((end - 1.1).abs() < 1e-9);
        assert!((start - 0.1).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn volume_scales_colour() {
        let rig = rig(Arc::new(FixedParser(two_notes())));
        rig.scheduler.load("song.mid").await.unwrap();
        assert_eq!(rig.scheduler.set_volume(7.0), 1.0);
        assert_eq!(rig.scheduler.set_volume(0.5), 0.5);
        rig.scheduler.start().unwrap();
        sleep_ms(50).await;

        let led = rig.mapper.primary_led(60).unwrap();
        let expected = note_color(60, 100).scale(0.5);
        assert_eq!(rig.renderer.pixel(led), Some(expected));
        rig.scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_load_enters_error() {
        let rig = rig(Arc::new(BrokenParser));
        let result = rig.scheduler.load("broken.mid").await;
        assert!(matches!(result, Err(LightsError::Load(ParseError::Malformed(_)))));
        assert_eq!(rig.scheduler.state(), PlaybackState::Error);
        assert!(matches!(rig.scheduler.start(), Err(LightsError::PlaybackFailed)));
        assert_eq!(rig.scheduler.current_time(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_needs_a_timeline() {
        let rig = rig(Arc::new(FixedParser(two_notes())));
        assert!(matches!(rig.scheduler.start(), Err(LightsError::NotLoaded)));
        assert_eq!(rig.scheduler.state(), PlaybackState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_transport_leaves_live_leds_alone() {
        let rig = rig(Arc::new(FixedParser(two_notes())));
        let held = Rgb::new(0, 80, 0);
        rig.renderer.set_pixel(5, held);

        rig.scheduler.load("song.mid").await.unwrap();
        rig.scheduler.seek(0.5);
        rig.scheduler.stop().await;
        assert_eq!(rig.renderer.pixel(5), Some(held));
        assert!(rig.arbiter.live_may_render());

        let broken = rig_with(Arc::new(BrokenParser), PlaybackSettings::default());
        broken.renderer.set_pixel(5, held);
        assert!(broken.scheduler.load("broken.mid").await.is_err());
        assert_eq!(broken.renderer.pixel(5), Some(held));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_while_previous_loop_winds_down() {
        let rig = rig(Arc::new(FixedParser(two_notes())));
        rig.scheduler.load("song.mid").await.unwrap();
        rig.scheduler.start().unwrap();
        sleep_ms(100).await;

        // completion as the loop records it, before its task has exited
        {
            let mut session = rig.scheduler.shared.lock();
            session.state = PlaybackState::Stopped;
            session.reset_transport();
            rig.renderer.clear();
            rig.arbiter.release_to_live();
        }
        rig.scheduler.start().unwrap();
        assert!(!rig.arbiter.live_may_render());

        sleep_ms(700).await;
        assert_eq!(rig.scheduler.state(), PlaybackState::Playing);
        assert_eq!(lit(&rig.renderer), rig.mapper.leds_for(64).to_vec());
        assert!(!rig.arbiter.live_may_render());
        rig.scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_aborts_a_loop_that_misses_the_timeout() {
        let settings = PlaybackSettings {
            stop_timeout_ms: 0,
            ..PlaybackSettings::default()
        };
        let rig = rig_with(Arc::new(FixedParser(two_notes())), settings);
        rig.scheduler.load("song.mid").await.unwrap();
        rig.scheduler.start().unwrap();
        sleep_ms(100).await;
        assert!(!lit(&rig.renderer).is_empty());

        rig.scheduler.stop().await;
        assert_eq!(rig.scheduler.state(), PlaybackState::Stopped);
        assert!(lit(&rig.renderer).is_empty());
        assert!(rig.arbiter.live_may_render());

        sleep_ms(100).await;
        assert!(lit(&rig.renderer).is_empty());
        assert_eq!(rig.scheduler.current_time(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn position_never_passes_the_end() {
        let mut parsed = two_notes();
        parsed.duration = 1103.0;
        let rig = rig(Arc::new(FixedParser(parsed)));
        rig.scheduler.load("song.mid").await.unwrap();
        rig.scheduler.start().unwrap();

        // between the 1.100s and 1.105s ticks
        sleep_ms(1104).await;
        let status = rig.scheduler.status();
        assert_eq!(status.state, PlaybackState::Playing);
        assert!(status.current_time <= status.total_duration);
        assert!(rig.scheduler.current_time() <= 1.103);
        rig.scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn empty_timeline_cannot_loop() {
        let parsed = ParsedMidi {
            events: Vec::new(),
            duration: 0.0,
            metadata: BTreeMap::new(),
        };
        let rig = rig(Arc::new(FixedParser(parsed)));
        rig.scheduler.load("empty.mid").await.unwrap();
        assert_eq!(rig.scheduler.set_loop(true, 0.0, 5.0), (0.0, 0.0));
        assert!(!rig.scheduler.status().loop_enabled);

        rig.scheduler.start().unwrap();
        sleep_ms(20).await;
        assert_eq!(rig.scheduler.state(), PlaybackState::Stopped);
        assert!(rig.arbiter.live_may_render());
    }
}
