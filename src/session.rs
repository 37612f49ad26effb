//! Session - one sound, its annotation, and the track cache, wired together.
//!
//! A session owns the sample buffer it loaded (shared read-only with any
//! in-flight analyses), the annotation bound to it, and a handle to an
//! analysis cache. Callers request measurements here: the session builds
//! the cache key, lets the cache deduplicate the computation, and announces
//! fresh results on the annotation's notifier so views can redraw without
//! polling.
//!
//! Analysis completion is announced *after* the cache call returns, never
//! from inside a store mutation, so the store can never deadlock against
//! the cache.

use std::sync::Arc;

use crate::annotation::{Annotation, EventId};
use crate::cache::{AnalysisCache, CacheConfig, CacheKey};
use crate::error::Result;
use crate::formant::{formant_track_cancellable, FormantParams};
use crate::intensity::{intensity_track_cancellable, IntensityParams};
use crate::notify::{events, ChangePayload};
use crate::pitch::{pitch_track_cancellable, PitchParams};
use crate::sound::Sound;
use crate::track::{Track, TrackKind};

/// An open analysis/annotation session over one sound.
pub struct Session {
    sound: Arc<Sound>,
    annotation: Annotation,
    cache: Arc<AnalysisCache>,
}

impl Session {
    /// Open a session over a freshly decoded sound, with its own cache.
    pub fn new(sound: Sound) -> Self {
        Self::with_cache(sound, Arc::new(AnalysisCache::new(CacheConfig::default())))
    }

    /// Open a session sharing an existing cache (e.g. one cache per
    /// application, many sessions).
    pub fn with_cache(sound: Sound, cache: Arc<AnalysisCache>) -> Self {
        let sound = Arc::new(sound);
        Self {
            annotation: Annotation::new(sound.clone()),
            sound,
            cache,
        }
    }

    pub fn sound(&self) -> &Arc<Sound> {
        &self.sound
    }

    pub fn annotation(&self) -> &Annotation {
        &self.annotation
    }

    pub fn annotation_mut(&mut self) -> &mut Annotation {
        &mut self.annotation
    }

    pub fn cache(&self) -> &Arc<AnalysisCache> {
        &self.cache
    }

    /// Pitch track over `[t0, t1)`, computed or served from the cache.
    ///
    /// Emits `analysis_ready` when a fresh computation completed.
    pub fn pitch(&self, t0: f64, t1: f64, params: &PitchParams) -> Result<Arc<Track>> {
        let key = CacheKey::pitch(self.sound.id(), t0, t1, *params);
        let mut fresh = false;
        let track = self.cache.get_or_compute(key, |cancel| {
            fresh = true;
            pitch_track_cancellable(&self.sound, t0, t1, params, cancel)
        })?;
        self.announce(fresh, TrackKind::Pitch)?;
        Ok(track)
    }

    /// Formant track over `[t0, t1)`, computed or served from the cache.
    pub fn formants(&self, t0: f64, t1: f64, params: &FormantParams) -> Result<Arc<Track>> {
        let key = CacheKey::formants(self.sound.id(), t0, t1, params.clone());
        let mut fresh = false;
        let track = self.cache.get_or_compute(key, |cancel| {
            fresh = true;
            formant_track_cancellable(&self.sound, t0, t1, params, cancel)
        })?;
        self.announce(fresh, TrackKind::Formants)?;
        Ok(track)
    }

    /// Intensity track over `[t0, t1)`, computed or served from the cache.
    pub fn intensity(&self, t0: f64, t1: f64, params: &IntensityParams) -> Result<Arc<Track>> {
        let key = CacheKey::intensity(self.sound.id(), t0, t1, *params);
        let mut fresh = false;
        let track = self.cache.get_or_compute(key, |cancel| {
            fresh = true;
            intensity_track_cancellable(&self.sound, t0, t1, params, cancel)
        })?;
        self.announce(fresh, TrackKind::Intensity)?;
        Ok(track)
    }

    /// Pitch over an event's span: annotation boundaries are the default
    /// analysis windows.
    pub fn pitch_for_event(&self, event: EventId, params: &PitchParams) -> Result<Arc<Track>> {
        let (t0, t1) = self.event_window(event, params.effective_time_step())?;
        self.pitch(t0, t1, params)
    }

    /// Formants over an event's span.
    pub fn formants_for_event(
        &self,
        event: EventId,
        params: &FormantParams,
    ) -> Result<Arc<Track>> {
        let (t0, t1) = self.event_window(event, params.effective_time_step())?;
        self.formants(t0, t1, params)
    }

    /// Intensity over an event's span.
    pub fn intensity_for_event(
        &self,
        event: EventId,
        params: &IntensityParams,
    ) -> Result<Arc<Track>> {
        let (t0, t1) = self.event_window(event, params.effective_time_step())?;
        self.intensity(t0, t1, params)
    }

    /// Close the session: cancel in-flight analyses for everyone sharing
    /// the cache and drop this sound's cached tracks.
    pub fn close(self) {
        self.cache.cancel_all();
        self.cache.invalidate_sound(self.sound.id());
    }

    /// The analysis window an event scopes: its own span, or one time step
    /// centered on a point event.
    fn event_window(&self, event: EventId, time_step: f64) -> Result<(f64, f64)> {
        let start = self.annotation.event_start(event)?;
        let end = self.annotation.event_end(event)?;
        if start == end {
            let half = time_step / 2.0;
            Ok((
                (start - half).max(0.0),
                (end + half).min(self.sound.duration()),
            ))
        } else {
            Ok((start, end))
        }
    }

    fn announce(&self, fresh: bool, kind: TrackKind) -> Result<()> {
        if fresh {
            self.annotation
                .notifier()
                .emit(events::ANALYSIS_READY, &ChangePayload::AnalysisReady { kind })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn sine_session(freq: f64, seconds: f64) -> Session {
        let rate = 22050.0;
        let n = (rate * seconds) as usize;
        let samples: Vec<f64> = (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64 / rate).sin())
            .collect();
        Session::new(Sound::from_mono(&samples, rate).unwrap())
    }

    #[test]
    fn repeated_requests_share_one_track() {
        let session = sine_session(200.0, 1.0);
        let params = PitchParams::default();
        let a = session.pitch(0.0, 1.0, &params).unwrap();
        let b = session.pitch(0.0, 1.0, &params).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn analysis_ready_fires_once_per_fresh_computation() {
        let session = sine_session(200.0, 1.0);
        let count = Rc::new(RefCell::new(0));
        {
            let count = count.clone();
            session
                .annotation()
                .notifier()
                .connect(events::ANALYSIS_READY, move |_| {
                    *count.borrow_mut() += 1;
                    Ok(())
                });
        }
        let params = PitchParams::default();
        session.pitch(0.0, 1.0, &params).unwrap();
        session.pitch(0.0, 1.0, &params).unwrap(); // cache hit, no event
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn event_span_scopes_the_analysis_window() {
        let mut session = sine_session(200.0, 2.0);
        let layer = session.annotation_mut().add_layer("words");
        let id = session
            .annotation_mut()
            .insert_event(layer, 0.5, 1.5, "vowel")
            .unwrap();

        let track = session
            .pitch_for_event(id, &PitchParams::default())
            .unwrap();
        let (t0, t1) = track.domain();
        assert_eq!((t0, t1), (0.5, 1.5));
        for i in 0..track.len() {
            let t = track.time(i);
            assert!((0.5..1.5).contains(&t));
        }
    }

    #[test]
    fn point_event_gets_a_one_step_window() {
        let mut session = sine_session(200.0, 2.0);
        let layer = session.annotation_mut().add_layer("pulses");
        let id = session
            .annotation_mut()
            .insert_event(layer, 1.0, 1.0, "p")
            .unwrap();

        let params = IntensityParams::default();
        let track = session.intensity_for_event(id, &params).unwrap();
        let (t0, t1) = track.domain();
        assert!((t1 - t0 - params.effective_time_step()).abs() < 1e-9);
    }

    #[test]
    fn close_drops_cached_tracks() {
        let cache = Arc::new(AnalysisCache::new(CacheConfig::default()));
        let session = {
            let rate = 22050.0;
            let samples: Vec<f64> = (0..(rate as usize))
                .map(|i| (2.0 * std::f64::consts::PI * 150.0 * i as f64 / rate).sin())
                .collect();
            Session::with_cache(Sound::from_mono(&samples, rate).unwrap(), cache.clone())
        };
        session.pitch(0.0, 1.0, &PitchParams::default()).unwrap();
        assert_eq!(cache.len(), 1);
        session.close();
        assert_eq!(cache.len(), 0);
    }
}
