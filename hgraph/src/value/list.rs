use derive_new::new;

use crate::value::Value;

/// Fixed-length array of identically-typed elements.
#[derive(new, Clone, Debug, Default, PartialEq)]
pub struct ListValue {
    items: Vec<Value>,
}

impl ListValue {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, ndx: usize) -> Option<&Value> {
        self.items.get(ndx)
    }

    pub fn get_mut(&mut self, ndx: usize) -> Option<&mut Value> {
        self.items.get_mut(ndx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.items.iter()
    }

    pub(crate) fn end_tick(&mut self) {
        for item in self.items.iter_mut() {
            item.end_tick();
        }
    }
}
