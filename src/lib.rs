//! # phonolab
//!
//! Acoustic analysis engine with a time-aligned annotation model, for
//! linguistic and speech work: load a digitized recording, annotate it with
//! layers of labeled time events, and compute pitch, formant, and intensity
//! tracks synchronized to the same time axis.
//!
//! The crate is the in-process core of a larger application; decoding of
//! compressed audio, annotation file formats, scripting, and rendering are
//! collaborator concerns on the other side of this API.
//!
//! # Components
//!
//! - **[`Sound`]**: immutable multichannel sample buffer, shared read-only
//!   by every analysis.
//! - **Analysis algorithms** ([`pitch`], [`formant`], [`intensity`]): pure
//!   functions from a sample range and a parameter set to a [`Track`] of
//!   time-indexed measurements, with per-frame undefined markers where no
//!   reliable estimate exists.
//! - **[`AnalysisCache`]**: memoizes tracks by (sound, kind, domain,
//!   parameters); concurrent requests for one key compute once and share
//!   the result; least-recently-used eviction.
//! - **[`Annotation`]**: ordered layers of labeled, non-overlapping time
//!   events with stable handles and strict ordering invariants.
//! - **[`Notifier`]**: synchronous named-event publish/subscribe, so views
//!   and scripts observe annotation edits and analysis completion without
//!   polling.
//! - **[`Session`]**: binds one sound to its annotation and a cache.
//!
//! # Quick start
//!
//! ```no_run
//! use phonolab::{PitchParams, Session, Sound};
//!
//! let sound = Sound::from_file("speech.wav").unwrap();
//! let mut session = Session::new(sound);
//!
//! let layer = session.annotation_mut().add_layer("words");
//! let word = session
//!     .annotation_mut()
//!     .insert_event(layer, 0.25, 0.90, "hello")
//!     .unwrap();
//!
//! // Pitch over the word's span; cached for the next redraw.
//! let track = session.pitch_for_event(word, &PitchParams::default()).unwrap();
//! for i in 0..track.len() {
//!     match track.scalar(i) {
//!         Some(f0) => println!("{:.3}s  {f0:.1} Hz", track.time(i)),
//!         None => println!("{:.3}s  unvoiced", track.time(i)),
//!     }
//! }
//! ```
//!
//! # Concurrency
//!
//! Analyses are pure over the immutable sample buffer and may run on any
//! number of threads; the cache is the synchronization point and enforces
//! at-most-once computation per key. An [`Annotation`] (and its notifier)
//! is single-threaded: all mutations and notifications for one instance
//! are serialized, so observers never see a half-applied edit.

pub mod annotation;
pub mod cache;
pub mod error;
pub mod formant;
pub mod intensity;
pub mod notify;
pub mod pitch;
pub mod session;
pub mod sound;
pub mod track;

/// Error type and `Result` alias for all fallible operations.
pub use error::{Error, Result};

/// Annotation store: layers of non-overlapping time events.
pub use annotation::{Annotation, EventId, Layer};

/// Track cache with single-flight computation and LRU eviction.
pub use cache::{AnalysisCache, CacheConfig, CacheKey};

/// Formant estimation (Burg LPC).
pub use formant::{formant_track, formants_at, FormantParams};

/// Intensity contour (windowed energy in dB).
pub use intensity::{intensity_at, intensity_track, IntensityParams};

/// Change notifier: named-event synchronous publish/subscribe.
pub use notify::{events, ChangePayload, Notifier, SubscriptionId};

/// Pitch tracking (normalized autocorrelation).
pub use pitch::{pitch_at, pitch_track, PitchParams};

/// One sound, its annotation, and the cache, wired together.
pub use session::Session;

/// Immutable multichannel sample buffer.
pub use sound::Sound;

/// Time-indexed measurement sequences and cancellation.
pub use track::{CancelToken, Track, TrackKind, TrackSample};
