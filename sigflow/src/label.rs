//! Stream-aligned metadata labels.

use crate::value::Value;

/// A metadata point anchored to a stream element index.
///
/// The index counts elements of the carrying port's dtype, relative to the
/// front of the unconsumed stream on an input port, or to the count of
/// elements produced so far on an output port. `width` spans the number of
/// elements the label covers (at least one).
#[derive(Clone, Debug)]
pub struct Label {
    /// Identifier, e.g. `"rxTime"`.
    pub id: String,
    /// The payload.
    pub data: Value,
    /// Element index the label is anchored to.
    pub index: u64,
    /// Number of elements covered.
    pub width: u64,
}

impl Label {
    /// A new label of width one.
    pub fn new(id: impl Into<String>, data: Value, index: u64) -> Label {
        Label { id: id.into(), data, index, width: 1 }
    }

    /// Sets the element width.
    pub fn with_width(mut self, width: u64) -> Label {
        self.width = width.max(1);
        self
    }

    /// This label rescaled through a block's `(interp, decim)` ratio with
    /// floor rounding, for propagation from input to output streams.
    pub fn rescaled(&self, interp: u64, decim: u64) -> Label {
        debug_assert!(interp > 0 && decim > 0);
        Label {
            id: self.id.clone(),
            data: self.data.clone(),
            index: self.index * interp / decim,
            width: (self.width * interp / decim).max(1),
        }
    }
}

impl PartialEq for Label {
    fn eq(&self, other: &Label) -> bool {
        self.index == other.index && self.width == other.width && self.id == other.id && self.data == other.data
    }
}

/// Inserts a label into an index-sorted vector, after any equal indices so
/// arrival order is preserved among ties.
pub(crate) fn insert_sorted(labels: &mut Vec<Label>, label: Label) {
    let at = labels.partition_point(|l| l.index <= label.index);
    labels.insert(at, label);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescale_floors() {
        let label = Label::new("rxTime", Value::from(1_000_000_000u64), 6);
        let scaled = label.rescaled(1, 2);
        assert_eq!(scaled.index, 3);
        assert_eq!(scaled.data, Value::from(1_000_000_000u64));

        // Non-dividing ratios round down.
        assert_eq!(Label::new("t", Value::Null, 7).rescaled(1, 2).index, 3);
        assert_eq!(Label::new("t", Value::Null, 3).rescaled(3, 2).index, 4);
        // Width never collapses to zero.
        assert_eq!(Label::new("t", Value::Null, 0).rescaled(1, 4).width, 1);
    }

    #[test]
    fn sorted_insert_keeps_arrival_order_on_ties() {
        let mut labels = Vec::new();
        insert_sorted(&mut labels, Label::new("b", Value::Null, 4));
        insert_sorted(&mut labels, Label::new("a", Value::Null, 2));
        insert_sorted(&mut labels, Label::new("c", Value::Null, 4));
        let ids: Vec<_> = labels.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }
}
