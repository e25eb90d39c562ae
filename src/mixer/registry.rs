use std::collections::HashMap;
use std::sync::Arc;

use super::label::{Labeler, Naming};
use super::rules::{Effect, RuleEngine};
use super::types::*;
use crate::error::SessionError;

#[derive(Debug)]
struct Entry {
    object: AudioObject,
    effect: Effect,
    /// Label as derived from the properties, before dedup
    base: String,
    label: String,
    /// First-seen sequence number within the generation
    seen: u64,
}

/// Outcome of an add or update that touched a known object.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub id: ObjectRef,
    /// Set when a `volume-set` level became active (or changed) with this
    /// mutation and should be pushed to the server.
    pub newly_forced: Option<u32>,
}

/// Live objects of the current generation.
///
/// Owned by the Session context; the UI only ever sees the `Snapshot`s it
/// publishes.
#[derive(Debug)]
pub struct Registry {
    generation: Generation,
    entries: HashMap<Handle, Entry>,
    next_seen: u64,
    rules: Arc<RuleEngine>,
    scale: LevelScale,
    labeler: Labeler,
    revision: u64,
    published: Option<(u64, Arc<Snapshot>)>,
}

impl Registry {
    pub fn new(rules: Arc<RuleEngine>, scale: LevelScale, naming: Naming) -> Self {
        Self {
            generation: 0,
            entries: HashMap::new(),
            next_seen: 0,
            rules,
            scale,
            labeler: Labeler::new(naming),
            revision: 0,
            published: None,
        }
    }

    fn mark_changed(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn object_ref(&self, handle: &Handle) -> ObjectRef {
        ObjectRef {
            generation: self.generation,
            handle: handle.clone(),
        }
    }

    /// Drop every object and start a new generation. All previously issued
    /// `ObjectRef`s become stale.
    pub fn reset_generation(&mut self) {
        self.generation += 1;
        self.entries = HashMap::new();
        self.next_seen = 0;
        self.mark_changed();
        log::debug!("Registry reset, generation {}", self.generation);
    }

    /// Insert an object, or replace it if the handle is already live.
    pub fn apply_add(&mut self, object: AudioObject) -> Applied {
        let handle = object.handle.clone();
        let effect = self.rules.evaluate(&object.properties);
        let base = self.labeler.label(object.kind, &object.properties);
        let label = self.relabel(&handle, &base);

        let (seen, previous) = match self.entries.get(&handle) {
            Some(entry) => (entry.seen, Some(entry.effect)),
            None => {
                let seen = self.next_seen;
                self.next_seen += 1;
                (seen, None)
            }
        };

        let newly_forced = self.forced_transition(previous.as_ref(), &effect);
        self.entries.insert(
            handle.clone(),
            Entry {
                object,
                effect,
                base,
                label,
                seen,
            },
        );
        self.mark_changed();

        Applied {
            id: self.object_ref(&handle),
            newly_forced,
        }
    }

    pub fn apply_remove(&mut self, handle: &str) -> Option<AudioObject> {
        let entry = self.entries.remove(handle);
        if entry.is_some() {
            self.mark_changed();
        }
        entry.map(|e| e.object)
    }

    /// Merge a partial update. Unknown handles are ignored: the object may
    /// have been removed while the update was in flight.
    pub fn apply_update(&mut self, handle: &str, update: ObjectUpdate) -> Option<Applied> {
        let rules = self.rules.clone();
        let entry = self.entries.get_mut(handle)?;
        let mut changed = false;
        let previous = entry.effect;

        if let Some(volume) = update.volume
            && entry.object.volume != volume
        {
            entry.object.volume = volume;
            changed = true;
        }
        if let Some(muted) = update.muted
            && entry.object.muted != muted
        {
            entry.object.muted = muted;
            changed = true;
        }

        let mut relabel = false;
        if let Some(properties) = update.properties
            && entry.object.properties != properties
        {
            entry.object.properties = properties;
            entry.effect = rules.evaluate(&entry.object.properties);
            relabel = true;
            changed = true;
        }

        let handle = entry.object.handle.clone();
        let effect = entry.effect;
        if relabel {
            let kind = entry.object.kind;
            let props = entry.object.properties.clone();
            let base = self.labeler.label(kind, &props);
            let label = self.relabel(&handle, &base);
            if let Some(entry) = self.entries.get_mut(&handle) {
                entry.base = base;
                entry.label = label;
            }
        }

        let newly_forced = self.forced_transition(Some(&previous), &effect);
        if changed {
            self.mark_changed();
        }
        Some(Applied {
            id: self.object_ref(&handle),
            newly_forced,
        })
    }

    fn forced_transition(&self, previous: Option<&Effect>, current: &Effect) -> Option<u32> {
        let now = current.forced_level(&self.scale)?;
        match previous.and_then(|p| p.forced_level(&self.scale)) {
            Some(before) if before == now => None,
            _ => Some(now),
        }
    }

    /// Display label for `handle`. A known object whose base label did not
    /// change keeps the label it already has.
    fn relabel(&mut self, handle: &Handle, base: &str) -> String {
        if let Some(entry) = self.entries.get(handle)
            && entry.base == base
        {
            return entry.label.clone();
        }
        let taken = self
            .entries
            .iter()
            .any(|(h, e)| h != handle && e.label == base);
        if taken {
            self.labeler.unique(base)
        } else {
            base.to_string()
        }
    }

    pub fn get(&self, handle: &str) -> Option<&AudioObject> {
        self.entries.get(handle).map(|e| &e.object)
    }

    /// Look up an object by a UI-issued id, rejecting ids of older generations.
    pub fn resolve(&self, id: &ObjectRef) -> Result<&AudioObject, SessionError> {
        if id.generation != self.generation {
            return Err(SessionError::Stale);
        }
        self.get(&id.handle)
            .ok_or_else(|| SessionError::UnknownObject(id.handle.to_string()))
    }

    /// Handles of all live objects, optionally restricted to one kind.
    pub fn handles(&self, kind: Option<ObjectKind>) -> Vec<Handle> {
        let mut entries: Vec<&Entry> = self
            .entries
            .values()
            .filter(|e| kind.is_none_or(|k| e.object.kind == k))
            .collect();
        entries.sort_by_key(|e| (e.object.kind, e.seen));
        entries.iter().map(|e| e.object.handle.clone()).collect()
    }

    /// Display projection of one object, whether hidden or not.
    pub fn item(&self, handle: &str) -> Option<DisplayItem> {
        self.entries.get(handle).map(|e| self.project(e, 0))
    }

    fn project(&self, entry: &Entry, position: usize) -> DisplayItem {
        let (floor, ceiling) = entry.effect.bounds(&self.scale);
        let forced = entry.effect.forced_level(&self.scale);
        let level = forced.unwrap_or_else(|| {
            self.scale
                .clamp(entry.object.raw_level())
                .clamp(floor, ceiling)
        });
        DisplayItem {
            id: self.object_ref(&entry.object.handle),
            kind: entry.object.kind,
            label: entry.label.clone(),
            level,
            floor,
            ceiling,
            muted: entry.object.muted,
            hidden: entry.effect.is_hidden(),
            forced: forced.is_some(),
            position,
        }
    }

    /// Complete, immutable view of the current state. Rebuilt only when
    /// something changed since the last call.
    pub fn snapshot(&mut self) -> Arc<Snapshot> {
        if let Some((revision, snapshot)) = &self.published
            && *revision == self.revision
        {
            return snapshot.clone();
        }

        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by_key(|e| (e.object.kind, e.seen));

        let mut items = Vec::with_capacity(entries.len());
        let mut hidden = 0;
        for entry in entries {
            if entry.effect.is_hidden() {
                hidden += 1;
                continue;
            }
            items.push(self.project(entry, items.len()));
        }

        let snapshot = Arc::new(Snapshot {
            generation: self.generation,
            items,
            hidden,
        });
        self.published = Some((self.revision, snapshot.clone()));
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixer::rules::RuleSpec;
    use std::collections::BTreeMap;

    fn registry(rules: &[RuleSpec], scale: LevelScale) -> Registry {
        let engine = RuleEngine::compile(rules).unwrap();
        Registry::new(Arc::new(engine), scale, Naming::default())
    }

    fn stream(path: &str, app: &str) -> AudioObject {
        AudioObject::new(path, ObjectKind::Stream)
            .with_property("application.name", app)
            .with_volume(vec![20000, 20000])
    }

    fn sink(path: &str, alsa_id: &str) -> AudioObject {
        AudioObject::new(path, ObjectKind::Sink)
            .with_property("alsa.id", alsa_id)
            .with_volume(vec![30000])
    }

    fn hide_hdmi() -> RuleSpec {
        RuleSpec {
            matches: BTreeMap::from([("alsa.id".to_string(), r"^HDMI\b".to_string())]),
            hidden: Some(true),
            ..Default::default()
        }
    }

    #[test]
    fn test_snapshot_orders_devices_then_streams_by_first_seen() {
        let mut reg = registry(&[], LevelScale::default());
        reg.apply_add(stream("/s/1", "mpv"));
        reg.apply_add(sink("/d/1", "PCH"));
        reg.apply_add(stream("/s/0", "firefox"));
        reg.apply_add(sink("/d/0", "USB"));

        let snap = reg.snapshot();
        let labels: Vec<&str> = snap.items.iter().map(|i| i.label.as_str()).collect();
        assert_eq!(labels, ["PCH", "USB", "mpv", "firefox"]);
        let positions: Vec<usize> = snap.items.iter().map(|i| i.position).collect();
        assert_eq!(positions, [0, 1, 2, 3]);
    }

    #[test]
    fn test_volume_max_clamps_level() {
        let rule = RuleSpec {
            equals: BTreeMap::from([(
                "application.process.binary".to_string(),
                "vlc".to_string(),
            )]),
            volume_max: Some(0.2),
            ..Default::default()
        };
        let mut reg = registry(&[rule], LevelScale::new(0, 40000));
        reg.apply_add(
            AudioObject::new("/s/vlc", ObjectKind::Stream)
                .with_property("application.process.binary", "vlc")
                .with_volume(vec![30000, 30000]),
        );
        let item = reg.snapshot().items[0].clone();
        assert_eq!(item.ceiling, 8000);
        assert_eq!(item.level, 8000);
    }

    #[test]
    fn test_hidden_objects_stay_tracked() {
        let mut reg = registry(&[hide_hdmi()], LevelScale::default());
        reg.apply_add(sink("/d/hdmi", "HDMI 0"));
        reg.apply_add(sink("/d/pch", "PCH"));

        let snap = reg.snapshot();
        assert_eq!(snap.items.len(), 1);
        assert_eq!(snap.hidden, 1);
        assert!(reg.get("/d/hdmi").is_some());
        assert!(reg.item("/d/hdmi").unwrap().hidden);

        // Property change un-hides it
        let mut props = reg.get("/d/hdmi").unwrap().properties.clone();
        props.insert("alsa.id".into(), "Digital".into());
        reg.apply_update("/d/hdmi", ObjectUpdate::properties(props));
        let snap = reg.snapshot();
        assert_eq!(snap.items.len(), 2);
        assert_eq!(snap.hidden, 0);

        assert!(reg.apply_remove("/d/hdmi").is_some());
        assert_eq!(reg.snapshot().items.len(), 1);
    }

    #[test]
    fn test_volume_set_overrides_polled_volume() {
        let rule = RuleSpec {
            equals: BTreeMap::from([("application.name".to_string(), "mpv".to_string())]),
            volume_set: Some(0.5),
            ..Default::default()
        };
        let mut reg = registry(&[rule], LevelScale::new(0, 1000));
        let applied = reg.apply_add(stream("/s/1", "mpv").with_volume(vec![100]));
        assert_eq!(applied.newly_forced, Some(500));
        assert_eq!(reg.snapshot().items[0].level, 500);

        let applied = reg.apply_update("/s/1", ObjectUpdate::volume(vec![900])).unwrap();
        assert_eq!(applied.newly_forced, None);
        let item = reg.snapshot().items[0].clone();
        assert_eq!(item.level, 500);
        assert!(item.forced);

        // Rule stops matching: raw level shows through again
        let mut props = reg.get("/s/1").unwrap().properties.clone();
        props.insert("application.name".into(), "vlc".into());
        reg.apply_update("/s/1", ObjectUpdate::properties(props));
        let item = reg.snapshot().items[0].clone();
        assert_eq!(item.level, 900);
        assert!(!item.forced);
    }

    #[test]
    fn test_update_unknown_handle_is_noop() {
        let mut reg = registry(&[], LevelScale::default());
        let before = reg.revision();
        assert!(reg.apply_update("/nope", ObjectUpdate::muted(true)).is_none());
        assert_eq!(reg.revision(), before);
    }

    #[test]
    fn test_add_then_remove_leaves_no_trace() {
        let mut reg = registry(&[], LevelScale::default());
        reg.apply_add(sink("/d/0", "PCH"));
        let first = reg.snapshot();
        reg.apply_add(stream("/s/1", "mpv"));
        reg.apply_remove("/s/1");
        let second = reg.snapshot();
        assert_eq!(first.items, second.items);
        assert_eq!(second.hidden, 0);
    }

    #[test]
    fn test_reset_generation_invalidates_ids() {
        let mut reg = registry(&[], LevelScale::default());
        let id = reg.apply_add(stream("/s/1", "mpv")).id;
        assert!(reg.resolve(&id).is_ok());

        reg.reset_generation();
        assert!(reg.snapshot().items.is_empty());
        assert_eq!(reg.resolve(&id), Err(SessionError::Stale));

        // Same handle in the new generation is a different object
        let new_id = reg.apply_add(stream("/s/1", "vlc")).id;
        assert_ne!(id, new_id);
        assert_eq!(reg.resolve(&id), Err(SessionError::Stale));
        assert!(reg.resolve(&new_id).is_ok());
    }

    #[test]
    fn test_snapshot_is_immutable_and_cached() {
        let mut reg = registry(&[], LevelScale::default());
        reg.apply_add(stream("/s/1", "mpv"));
        let a = reg.snapshot();
        let b = reg.snapshot();
        assert!(Arc::ptr_eq(&a, &b));

        reg.apply_update("/s/1", ObjectUpdate::muted(true));
        let c = reg.snapshot();
        assert!(!a.items[0].muted);
        assert!(c.items[0].muted);
    }

    #[test]
    fn test_readd_keeps_position() {
        let mut reg = registry(&[], LevelScale::default());
        reg.apply_add(stream("/s/1", "mpv"));
        reg.apply_add(stream("/s/2", "vlc"));
        reg.apply_add(stream("/s/1", "mpv"));
        let labels: Vec<String> = reg.snapshot().items.iter().map(|i| i.label.clone()).collect();
        assert_eq!(labels, ["mpv", "vlc"]);
    }

    #[test]
    fn test_duplicate_labels_are_suffixed() {
        let mut reg = registry(&[], LevelScale::default());
        reg.apply_add(stream("/s/1", "mpv"));
        reg.apply_add(stream("/s/2", "mpv"));
        let snap = reg.snapshot();
        assert_eq!(snap.items[0].label, "mpv");
        assert_eq!(snap.items[1].label, "mpv #0");
    }

    #[test]
    fn test_refresh_keeps_dedup_suffix() {
        let mut reg = registry(&[], LevelScale::default());
        reg.apply_add(stream("/s/1", "mpv"));
        reg.apply_add(stream("/s/2", "mpv"));

        // Same name, other properties changed
        let mut props = reg.get("/s/2").unwrap().properties.clone();
        props.insert("media.name".into(), "track 2".into());
        reg.apply_update("/s/2", ObjectUpdate::properties(props));
        reg.apply_add(stream("/s/2", "mpv"));
        assert_eq!(reg.snapshot().items[1].label, "mpv #0");

        // A real rename is deduplicated afresh
        let mut props = reg.get("/s/2").unwrap().properties.clone();
        props.insert("application.name".into(), "vlc".into());
        reg.apply_update("/s/2", ObjectUpdate::properties(props));
        assert_eq!(reg.snapshot().items[1].label, "vlc");
    }
}
