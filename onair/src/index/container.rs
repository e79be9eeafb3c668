//! Value containers: the per-key payload of an inverted index.
//!
//! A key maps to a set of `(input id, value)` associations with at most one
//! value per input. Three flavours exist:
//!
//! - [`ValueContainer`]: a plain association set, the committed form;
//! - [`DeltaValueContainer`]: additions plus removed input ids recorded since
//!   the base revision, written back to the tree when evicted from cache;
//! - [`CompositeValueContainer`]: a delta overlaid on a lazily loaded base.
//!
//! # Serialized Form
//!
//! A sequence of `INT`-encoded chunks read until the input is exhausted:
//!
//! ```text
//! chunk := -inputId                                   (removal)
//!        | valueCount (value ids){valueCount}         (values)
//! ids   := inputId                                    (single input)
//!        | -count delta{count}                        (ascending, delta-encoded)
//! ```
//!
//! Input ids must be positive so that removals and value counts stay distinct.

use std::collections::{BTreeMap, BTreeSet};

use crate::index::descriptor::DataExternalizer;
use crate::storage::codec::{CodecError, read_int, write_int};

/// Associations of input ids to values for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueContainer<V> {
    values: BTreeMap<i32, V>,
}

impl<V> Default for ValueContainer<V> {
    fn default() -> Self {
        Self {
            values: BTreeMap::new(),
        }
    }
}

impl<V: Clone + PartialEq> ValueContainer<V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `value` with `input_id`, replacing any previous value.
    pub fn add_value(&mut self, input_id: i32, value: V) {
        self.values.insert(input_id, value);
    }

    /// Drop whatever value `input_id` contributed.
    pub fn remove_associated_value(&mut self, input_id: i32) -> Option<V> {
        self.values.remove(&input_id)
    }

    #[must_use]
    pub fn get(&self, input_id: i32) -> Option<&V> {
        self.values.get(&input_id)
    }

    /// Number of associations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Input ids in ascending order.
    pub fn input_ids(&self) -> impl Iterator<Item = i32> + '_ {
        self.values.keys().copied()
    }

    /// Distinct values, each with the ascending ids of the inputs that
    /// produced it. Values are ordered by their smallest input id.
    #[must_use]
    pub fn value_iterator(&self) -> Vec<(&V, Vec<i32>)> {
        let mut groups: Vec<(&V, Vec<i32>)> = Vec::new();
        for (id, value) in &self.values {
            match groups.iter_mut().find(|(v, _)| *v == value) {
                Some((_, ids)) => ids.push(*id),
                None => groups.push((value, vec![*id])),
            }
        }
        groups
    }

    /// Append the serialized form to `out`.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn save_to(&self, out: &mut Vec<u8>, externalizer: &dyn DataExternalizer<V>) {
        let groups = self.value_iterator();
        write_int(out, groups.len() as i32);
        for (value, ids) in groups {
            externalizer.save(out, value);
            if let [single] = ids.as_slice() {
                write_int(out, *single);
            } else {
                write_int(out, -(ids.len() as i32));
                let mut prev = 0;
                for id in ids {
                    write_int(out, id - prev);
                    prev = id;
                }
            }
        }
    }

    /// Decode a serialized container, applying removals in order.
    pub fn read_from(
        bytes: &[u8],
        externalizer: &dyn DataExternalizer<V>,
    ) -> Result<Self, CodecError> {
        let mut container = Self::new();
        read_chunks(bytes, externalizer, |chunk| match chunk {
            Chunk::Removed(id) => {
                container.remove_associated_value(id);
            }
            Chunk::Value(id, value) => container.add_value(id, value),
        })?;
        Ok(container)
    }
}

/// One decoded element of a serialized container.
enum Chunk<V> {
    Removed(i32),
    Value(i32, V),
}

/// Walk every chunk of a serialized container.
fn read_chunks<V: Clone>(
    bytes: &[u8],
    externalizer: &dyn DataExternalizer<V>,
    mut apply: impl FnMut(Chunk<V>),
) -> Result<(), CodecError> {
    let mut input = bytes;
    while !input.is_empty() {
        let count = read_int(&mut input)?;
        if count < 0 {
            let id = count
                .checked_neg()
                .ok_or_else(|| CodecError::Invalid(format!("removed id {count} out of range")))?;
            apply(Chunk::Removed(id));
            continue;
        }
        for _ in 0..count {
            let value = externalizer.read(&mut input)?;
            let ids = read_int(&mut input)?;
            if ids > 0 {
                apply(Chunk::Value(ids, value));
                continue;
            }
            let mut prev = 0i32;
            for _ in 0..ids.unsigned_abs() {
                let delta = read_int(&mut input)?;
                prev = prev.checked_add(delta).ok_or_else(|| {
                    CodecError::Invalid(format!("input id overflow after {prev}"))
                })?;
                apply(Chunk::Value(prev, value.clone()));
            }
        }
    }
    Ok(())
}

/// Changes to one key recorded since the base revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaValueContainer<V> {
    added: ValueContainer<V>,
    removed: BTreeSet<i32>,
    dirty: bool,
}

impl<V> Default for DeltaValueContainer<V> {
    fn default() -> Self {
        Self {
            added: ValueContainer::default(),
            removed: BTreeSet::new(),
            dirty: false,
        }
    }
}

impl<V: Clone + PartialEq> DeltaValueContainer<V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_value(&mut self, input_id: i32, value: V) {
        self.added.add_value(input_id, value);
        self.removed.remove(&input_id);
        self.dirty = true;
    }

    pub fn remove_associated_value(&mut self, input_id: i32) {
        self.added.remove_associated_value(input_id);
        self.removed.insert(input_id);
        self.dirty = true;
    }

    /// Whether the delta changed since it was loaded or last written back.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub const fn mark_clean(&mut self) {
        self.dirty = false;
    }

    #[must_use]
    pub const fn added(&self) -> &ValueContainer<V> {
        &self.added
    }

    #[must_use]
    pub const fn removed(&self) -> &BTreeSet<i32> {
        &self.removed
    }

    /// Removed ids as negative `INT`s, then the added values.
    pub fn save_to(&self, out: &mut Vec<u8>, externalizer: &dyn DataExternalizer<V>) {
        for id in &self.removed {
            write_int(out, -id);
        }
        self.added.save_to(out, externalizer);
    }

    /// Decode a delta written by [`DeltaValueContainer::save_to`]. The result
    /// is clean.
    pub fn read_from(
        bytes: &[u8],
        externalizer: &dyn DataExternalizer<V>,
    ) -> Result<Self, CodecError> {
        let mut delta = Self::new();
        read_chunks(bytes, externalizer, |chunk| match chunk {
            Chunk::Removed(id) => delta.remove_associated_value(id),
            Chunk::Value(id, value) => delta.add_value(id, value),
        })?;
        delta.mark_clean();
        Ok(delta)
    }

    /// Apply additions, then removals, onto `base`.
    pub fn apply_to(&self, base: &mut ValueContainer<V>) {
        for (id, value) in &self.added.values {
            base.add_value(*id, value.clone());
        }
        for id in &self.removed {
            base.remove_associated_value(*id);
        }
    }
}

/// A delta overlaid on a base container loaded on first use.
///
/// The merged view is computed at most once per container and then kept in
/// step with later mutations.
#[derive(Debug, Clone)]
pub struct CompositeValueContainer<V> {
    delta: DeltaValueContainer<V>,
    merged: Option<ValueContainer<V>>,
}

impl<V: Clone + PartialEq> CompositeValueContainer<V> {
    #[must_use]
    pub const fn new(delta: DeltaValueContainer<V>) -> Self {
        Self {
            delta,
            merged: None,
        }
    }

    pub fn add_value(&mut self, input_id: i32, value: V) {
        if let Some(merged) = &mut self.merged {
            merged.add_value(input_id, value.clone());
        }
        self.delta.add_value(input_id, value);
    }

    pub fn remove_associated_value(&mut self, input_id: i32) {
        if let Some(merged) = &mut self.merged {
            merged.remove_associated_value(input_id);
        }
        self.delta.remove_associated_value(input_id);
    }

    #[must_use]
    pub const fn delta(&self) -> &DeltaValueContainer<V> {
        &self.delta
    }

    pub const fn delta_mut(&mut self) -> &mut DeltaValueContainer<V> {
        &mut self.delta
    }

    /// Whether the merged view has been computed.
    #[must_use]
    pub const fn is_merged(&self) -> bool {
        self.merged.is_some()
    }

    /// The merged view, loading the base with `load_base` on first use.
    pub fn merged_with<E>(
        &mut self,
        load_base: impl FnOnce() -> Result<ValueContainer<V>, E>,
    ) -> Result<&ValueContainer<V>, E> {
        let merged = match self.merged.take() {
            Some(merged) => merged,
            None => {
                let mut base = load_base()?;
                self.delta.apply_to(&mut base);
                base
            }
        };
        Ok(self.merged.insert(merged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::descriptor::{IntExternalizer, StringExternalizer};

    fn strings(pairs: &[(i32, &str)]) -> ValueContainer<String> {
        let mut container = ValueContainer::new();
        for (id, value) in pairs {
            container.add_value(*id, (*value).to_string());
        }
        container
    }

    #[test]
    fn test_value_iterator_groups_inputs() {
        let container = strings(&[(3, "a"), (1, "b"), (2, "a"), (7, "b"), (5, "c")]);
        let groups: Vec<(String, Vec<i32>)> = container
            .value_iterator()
            .into_iter()
            .map(|(v, ids)| (v.clone(), ids))
            .collect();
        assert_eq!(
            groups,
            vec![
                ("b".to_string(), vec![1, 7]),
                ("a".to_string(), vec![2, 3]),
                ("c".to_string(), vec![5]),
            ]
        );
    }

    #[test]
    fn test_container_serialized_layout() {
        let mut container = ValueContainer::new();
        container.add_value(10, 7);
        container.add_value(4, 9);
        container.add_value(12, 9);

        let mut out = Vec::new();
        container.save_to(&mut out, &IntExternalizer);
        // 2 values; 9 -> [4, 12] as -2, +4, +8; 7 -> single input 10.
        assert_eq!(out, vec![2, 9, 0xfe, 0xff, 0xff, 0xff, 0x1f, 4, 8, 7, 10]);

        let decoded = ValueContainer::read_from(&out, &IntExternalizer).expect("decode");
        assert_eq!(decoded, container);
    }

    #[test]
    fn test_read_applies_removals() {
        let mut out = Vec::new();
        write_int(&mut out, 1);
        write_int(&mut out, 5);
        write_int(&mut out, 2);
        write_int(&mut out, -2);
        let decoded = ValueContainer::read_from(&out, &IntExternalizer).expect("decode");
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_delta_tracks_removed_ids() {
        let mut delta = DeltaValueContainer::new();
        assert!(!delta.is_dirty());
        delta.add_value(1, "x".to_string());
        delta.remove_associated_value(2);
        delta.remove_associated_value(1);
        delta.add_value(2, "y".to_string());
        assert!(delta.is_dirty());

        assert_eq!(delta.removed().iter().copied().collect::<Vec<_>>(), vec![1]);
        assert_eq!(delta.added().get(2), Some(&"y".to_string()));
        assert_eq!(delta.added().get(1), None);
    }

    #[test]
    fn test_delta_save_and_read_is_clean() {
        let mut delta = DeltaValueContainer::new();
        delta.add_value(3, "three".to_string());
        delta.add_value(4, "three".to_string());
        delta.remove_associated_value(9);

        let mut out = Vec::new();
        delta.save_to(&mut out, &StringExternalizer);
        let mut removal = Vec::new();
        write_int(&mut removal, -9);
        assert!(out.starts_with(&removal));

        let decoded = DeltaValueContainer::read_from(&out, &StringExternalizer).expect("decode");
        assert!(!decoded.is_dirty());
        assert_eq!(decoded.removed(), delta.removed());
        assert_eq!(decoded.added(), delta.added());
    }

    #[test]
    fn test_composite_merges_once() {
        let mut delta = DeltaValueContainer::new();
        delta.add_value(2, "new".to_string());
        delta.remove_associated_value(1);
        let mut composite = CompositeValueContainer::new(delta);
        assert!(!composite.is_merged());

        let mut loads = 0;
        let merged = composite
            .merged_with(|| {
                loads += 1;
                Ok::<_, CodecError>(strings(&[(1, "base"), (3, "base")]))
            })
            .expect("merge")
            .clone();
        assert_eq!(merged, strings(&[(2, "new"), (3, "base")]));

        composite.add_value(4, "later".to_string());
        composite.remove_associated_value(3);
        let merged = composite
            .merged_with(|| {
                loads += 1;
                Ok::<_, CodecError>(ValueContainer::new())
            })
            .expect("merge again")
            .clone();
        assert_eq!(merged, strings(&[(2, "new"), (4, "later")]));
        assert_eq!(loads, 1);
    }

    #[test]
    fn test_composite_propagates_load_error() {
        let mut composite = CompositeValueContainer::<String>::new(DeltaValueContainer::new());
        let result = composite.merged_with(|| Err(CodecError::Invalid("boom".to_string())));
        assert!(result.is_err());
        assert!(!composite.is_merged());
    }
}
