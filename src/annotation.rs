//! Annotation - ordered layers of labeled, non-overlapping time events.
//!
//! An annotation is bound to one sound (shared, not owned exclusively) and
//! holds any number of layers. Each layer is an ordered sequence of events
//! kept sorted by start time with `event[i].end <= event[i+1].start`, the
//! invariant every mutation either preserves or rejects without side
//! effects. An event with `start == end` is a point (instant); otherwise it
//! covers the half-open interval `[start, end)`.
//!
//! Events live in an arena of generation-tagged slots. The [`EventId`]
//! handles given out are plain copies of (slot, generation): they never
//! keep an event alive, and once the event is removed every operation on
//! the handle fails with `StaleHandle`. Each layer maintains a separate
//! sorted index of handles, so lookups are O(log n) and handles stay valid
//! across structural changes.
//!
//! All mutations are serialized through `&mut self`; observers connected to
//! the notifier are called only after a mutation is fully applied, so no
//! reader ever sees two events overlapping transiently.

use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::notify::{events, ChangePayload, Notifier};
use crate::sound::Sound;

/// Non-owning handle to an event: arena slot plus generation tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId {
    index: u32,
    generation: u32,
}

struct EventData {
    start: f64,
    end: f64,
    text: String,
    /// Back-reference to the owning layer; resolves "which layer does this
    /// event belong to", nothing more.
    layer: usize,
}

impl EventData {
    fn is_point(&self) -> bool {
        self.start == self.end
    }
}

struct EventSlot {
    generation: u32,
    data: Option<EventData>,
}

/// One named track of non-overlapping events.
pub struct Layer {
    label: String,
    /// Event handles sorted by start time.
    index: Vec<EventId>,
}

impl Layer {
    /// Layer label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Number of events on this layer.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

/// Ordered layers of time-aligned events over one bound sound.
pub struct Annotation {
    sound: Arc<Sound>,
    layers: Vec<Layer>,
    slots: Vec<EventSlot>,
    free: Vec<u32>,
    notifier: Notifier,
}

impl Annotation {
    /// Create an empty annotation bound to `sound`.
    ///
    /// All layers share the sound's time axis: every event must fall inside
    /// `[0, duration]`. Holding the `Arc` guarantees the annotation never
    /// outlives its sound.
    pub fn new(sound: Arc<Sound>) -> Self {
        Self {
            sound,
            layers: Vec::new(),
            slots: Vec::new(),
            free: Vec::new(),
            notifier: Notifier::new(),
        }
    }

    /// The bound sound.
    pub fn sound(&self) -> &Arc<Sound> {
        &self.sound
    }

    /// The change notifier scoped to this annotation. Clones share the
    /// registry, so observers keep their own copy to connect/disconnect.
    pub fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }

    /// Append a new empty layer; returns its position.
    pub fn add_layer(&mut self, label: &str) -> usize {
        self.layers.push(Layer {
            label: label.to_owned(),
            index: Vec::new(),
        });
        self.layers.len() - 1
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, index: usize) -> Result<&Layer> {
        self.layers
            .get(index)
            .ok_or_else(|| Error::NotFound(format!("layer {index}")))
    }

    // ========== Event lifecycle ==========

    /// Insert an event into a layer at its sort-preserving position.
    ///
    /// # Errors
    ///
    /// - `Range` if `start`/`end` fall outside `[0, duration]` or
    ///   `start > end`.
    /// - `Overlap` if the interior of `[start, end]` intersects an existing
    ///   event on the same layer. Touching endpoints are permitted.
    ///
    /// Emits `event_inserted` after the store is updated.
    pub fn insert_event(
        &mut self,
        layer: usize,
        start: f64,
        end: f64,
        text: &str,
    ) -> Result<EventId> {
        self.layer(layer)?;
        self.check_bounds(start, end)?;
        let pos = self.insertion_point(layer, start, end, None)?;

        let id = self.allocate(EventData {
            start,
            end,
            text: text.to_owned(),
            layer,
        });
        self.layers[layer].index.insert(pos, id);

        debug!(layer, start, end, "event inserted");
        self.notifier.emit(
            events::EVENT_INSERTED,
            &ChangePayload::EventInserted { layer, event: id },
        )?;
        Ok(id)
    }

    /// Remove an event from a layer. The handle becomes stale.
    ///
    /// # Errors
    ///
    /// - `StaleHandle` if the event was already removed.
    /// - `NotFound` if the event is live but belongs to a different layer.
    ///
    /// Emits `event_removed` after the store is updated.
    pub fn remove_event(&mut self, layer: usize, event: EventId) -> Result<()> {
        self.layer(layer)?;
        if self.data(event)?.layer != layer {
            return Err(Error::NotFound(format!(
                "event is not a member of layer {layer}"
            )));
        }

        let pos = self
            .position_in_layer(layer, event)
            .expect("live event is indexed by its owning layer");
        self.layers[layer].index.remove(pos);

        let slot = &mut self.slots[event.index as usize];
        slot.data = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(event.index);

        debug!(layer, "event removed");
        self.notifier.emit(
            events::EVENT_REMOVED,
            &ChangePayload::EventRemoved { layer, event },
        )?;
        Ok(())
    }

    /// Replace an event's text. Ordering is unaffected.
    ///
    /// Emits `event_text_changed`.
    pub fn set_event_text(&mut self, event: EventId, text: &str) -> Result<()> {
        self.data(event)?;
        self.data_mut(event).text = text.to_owned();

        self.notifier.emit(
            events::EVENT_TEXT_CHANGED,
            &ChangePayload::EventTextChanged { event },
        )?;
        Ok(())
    }

    /// Move one or both boundaries of an event.
    ///
    /// `None` keeps the current boundary. On failure the event, and every
    /// neighbor, is exactly as before the call.
    ///
    /// # Errors
    ///
    /// - `StaleHandle` for a removed event.
    /// - `Range` if the new boundaries leave `[0, duration]` or invert.
    /// - `Overlap` if the moved event would intrude on a neighbor.
    ///
    /// Emits `event_boundary_changed`.
    pub fn move_event_boundary(
        &mut self,
        event: EventId,
        new_start: Option<f64>,
        new_end: Option<f64>,
    ) -> Result<()> {
        let data = self.data(event)?;
        let layer = data.layer;
        let start = new_start.unwrap_or(data.start);
        let end = new_end.unwrap_or(data.end);

        self.check_bounds(start, end)?;
        // Validate against the would-be neighbors before touching anything.
        let pos = self.insertion_point(layer, start, end, Some(event))?;

        let old_pos = self
            .position_in_layer(layer, event)
            .expect("live event is indexed by its owning layer");
        self.layers[layer].index.remove(old_pos);
        // Removal left of the target shifts it down by one.
        let pos = if old_pos < pos { pos - 1 } else { pos };
        self.layers[layer].index.insert(pos, event);

        let data = self.data_mut(event);
        data.start = start;
        data.end = end;

        debug!(layer, start, end, "event boundary moved");
        self.notifier.emit(
            events::EVENT_BOUNDARY_CHANGED,
            &ChangePayload::EventBoundaryChanged { event },
        )?;
        Ok(())
    }

    // ========== Queries ==========

    /// The event whose span contains `time`, if any.
    ///
    /// Intervals contain `[start, end)`; point events match only exact
    /// equality. O(log n) through the sorted index.
    pub fn event_at(&self, layer: usize, time: f64) -> Result<Option<EventId>> {
        let layer = self.layer(layer)?;
        let pos = layer
            .index
            .partition_point(|&id| self.slot_data(id).start <= time);
        if pos == 0 {
            return Ok(None);
        }
        let id = layer.index[pos - 1];
        let data = self.slot_data(id);
        let contains = if data.is_point() {
            data.start == time
        } else {
            data.start <= time && time < data.end
        };
        Ok(contains.then_some(id))
    }

    /// Events overlapping the half-open range `[t0, t1)`, in start order.
    ///
    /// An interval overlaps if it has positive-length intersection with the
    /// range; a point event matches if it lies inside the range.
    pub fn events_in_range(&self, layer: usize, t0: f64, t1: f64) -> Result<Vec<EventId>> {
        let layer = self.layer(layer)?;
        // Ends are non-decreasing (the layer invariant), so binary search
        // for the first event reaching past t0. Among events ending exactly
        // at t0 only a point belongs in the result.
        let from = layer.index.partition_point(|&id| {
            let d = self.slot_data(id);
            d.end < t0 || (d.end == t0 && !d.is_point())
        });

        let mut found = Vec::new();
        for &id in &layer.index[from..] {
            if self.slot_data(id).start >= t1 {
                break;
            }
            found.push(id);
        }
        Ok(found)
    }

    /// The event preceding `event` on its layer, if any.
    pub fn previous_event(&self, event: EventId) -> Result<Option<EventId>> {
        let layer = self.data(event)?.layer;
        let pos = self
            .position_in_layer(layer, event)
            .expect("live event is indexed by its owning layer");
        Ok((pos > 0).then(|| self.layers[layer].index[pos - 1]))
    }

    /// The event following `event` on its layer, if any.
    pub fn next_event(&self, event: EventId) -> Result<Option<EventId>> {
        let layer = self.data(event)?.layer;
        let pos = self
            .position_in_layer(layer, event)
            .expect("live event is indexed by its owning layer");
        let index = &self.layers[layer].index;
        Ok((pos + 1 < index.len()).then(|| index[pos + 1]))
    }

    pub fn event_start(&self, event: EventId) -> Result<f64> {
        Ok(self.data(event)?.start)
    }

    pub fn event_end(&self, event: EventId) -> Result<f64> {
        Ok(self.data(event)?.end)
    }

    pub fn event_text(&self, event: EventId) -> Result<&str> {
        Ok(&self.data(event)?.text)
    }

    /// Which layer the event belongs to (the back-reference).
    pub fn event_layer(&self, event: EventId) -> Result<usize> {
        Ok(self.data(event)?.layer)
    }

    /// Whether the event is an instant (`start == end`).
    pub fn event_is_point(&self, event: EventId) -> Result<bool> {
        Ok(self.data(event)?.is_point())
    }

    // ========== Internals ==========

    fn check_bounds(&self, start: f64, end: f64) -> Result<()> {
        let duration = self.sound.duration();
        if !start.is_finite() || !end.is_finite() || start < 0.0 || end > duration {
            return Err(Error::Range(format!(
                "event [{start}, {end}] outside sound [0, {duration}]"
            )));
        }
        if start > end {
            return Err(Error::Range(format!(
                "event start {start} after end {end}"
            )));
        }
        Ok(())
    }

    /// Sorted position for `[start, end]` on `layer`, or `Overlap` if the
    /// neighbors there leave no room. `exclude` ignores one event (the one
    /// being moved).
    fn insertion_point(
        &self,
        layer: usize,
        start: f64,
        end: f64,
        exclude: Option<EventId>,
    ) -> Result<usize> {
        let index = &self.layers[layer].index;
        // Equal starts are legal when a point touches an interval; the
        // invariant orders them by (start, end), so search lexicographically.
        let pos = index.partition_point(|&id| {
            let d = self.slot_data(id);
            (d.start, d.end) < (start, end)
        });

        let prev = index[..pos]
            .iter()
            .rev()
            .find(|&&id| Some(id) != exclude)
            .copied();
        let next = index[pos..].iter().find(|&&id| Some(id) != exclude).copied();

        if let Some(prev) = prev {
            let d = self.slot_data(prev);
            if d.end > start {
                return Err(Error::Overlap(format!(
                    "[{start}, {end}] intrudes on [{}, {}] \"{}\"",
                    d.start, d.end, d.text
                )));
            }
        }
        if let Some(next) = next {
            let d = self.slot_data(next);
            if end > d.start {
                return Err(Error::Overlap(format!(
                    "[{start}, {end}] intrudes on [{}, {}] \"{}\"",
                    d.start, d.end, d.text
                )));
            }
        }
        Ok(pos)
    }

    fn position_in_layer(&self, layer: usize, event: EventId) -> Option<usize> {
        let index = &self.layers[layer].index;
        let start = self.slot_data(event).start;
        // Events can share a start time (a point touching an interval), so
        // scan the equal-start run for the exact handle.
        let mut pos = index.partition_point(|&id| self.slot_data(id).start < start);
        while pos < index.len() {
            if index[pos] == event {
                return Some(pos);
            }
            if self.slot_data(index[pos]).start > start {
                break;
            }
            pos += 1;
        }
        None
    }

    fn allocate(&mut self, data: EventData) -> EventId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.data = Some(data);
                EventId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(EventSlot {
                    generation: 0,
                    data: Some(data),
                });
                EventId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        }
    }

    /// Resolve a handle, failing with `StaleHandle` for removed events.
    fn data(&self, event: EventId) -> Result<&EventData> {
        self.slots
            .get(event.index as usize)
            .filter(|slot| slot.generation == event.generation)
            .and_then(|slot| slot.data.as_ref())
            .ok_or(Error::StaleHandle)
    }

    fn data_mut(&mut self, event: EventId) -> &mut EventData {
        self.slots[event.index as usize]
            .data
            .as_mut()
            .expect("handle was checked")
    }

    /// Like `data` but for handles known to be live (from a layer index).
    fn slot_data(&self, event: EventId) -> &EventData {
        self.slots[event.index as usize]
            .data
            .as_ref()
            .expect("indexed event is live")
    }
}
