use std::collections::VecDeque;
use std::time::Duration;

use crate::meta::WindowPolicy;
use crate::time::EngineTime;
use crate::value::Value;

/// Window storage.  Fixed mode keeps two parallel cyclic buffers (values
/// and timestamps) with `capacity + 1` physical slots so the evicted
/// element remains addressable for one tick.  Period mode evicts by
/// duration relative to the newest timestamp.
#[derive(Clone, Debug, PartialEq)]
pub struct WindowValue {
    storage: WindowStorage,
}

#[derive(Clone, Debug, PartialEq)]
enum WindowStorage {
    Fixed {
        values: Vec<Option<Value>>,
        times: Vec<EngineTime>,
        tail: usize,
        len: usize,
        capacity: usize,
        evicted: Option<usize>,
    },
    Period {
        items: VecDeque<(Value, EngineTime)>,
        period: Duration,
        evicted: Option<Box<(Value, EngineTime)>>,
    },
}

impl WindowValue {
    pub fn new(policy: WindowPolicy) -> Self {
        let storage = match policy {
            WindowPolicy::Fixed(capacity) => WindowStorage::Fixed {
                values: (0..capacity + 1).map(|_| None).collect(),
                times: vec![EngineTime::MIN_DT; capacity + 1],
                tail: 0,
                len: 0,
                capacity,
                evicted: None,
            },
            WindowPolicy::Period(period) => WindowStorage::Period {
                items: VecDeque::new(),
                period,
                evicted: None,
            },
        };
        Self { storage }
    }

    pub fn len(&self) -> usize {
        match &self.storage {
            WindowStorage::Fixed { len, .. } => *len,
            WindowStorage::Period { items, .. } => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pushes a value with its timestamp.  Returns true when an element
    /// was evicted.
    pub fn push(&mut self, value: Value, time: EngineTime) -> bool {
        match &mut self.storage {
            WindowStorage::Fixed {
                values,
                times,
                tail,
                len,
                capacity,
                evicted,
            } => {
                let physical = values.len();
                let head = (*tail + *len) % physical;
                values[head] = Some(value);
                times[head] = time;
                if *len < *capacity {
                    *len += 1;
                    false
                } else {
                    *evicted = Some(*tail);
                    *tail = (*tail + 1) % physical;
                    true
                }
            }
            WindowStorage::Period {
                items,
                period,
                evicted,
            } => {
                items.push_back((value, time));
                let mut any = false;
                while let Some((_, oldest)) = items.front() {
                    if *oldest + *period <= time {
                        *evicted = items.pop_front().map(Box::new);
                        any = true;
                    } else {
                        break;
                    }
                }
                any
            }
        }
    }

    /// Ordered iteration, oldest to newest, with the sidecar timestamp.
    pub fn iter(&self) -> Box<dyn Iterator<Item = (&Value, EngineTime)> + '_> {
        match &self.storage {
            WindowStorage::Fixed {
                values,
                times,
                tail,
                len,
                ..
            } => {
                let physical = values.len();
                Box::new((0..*len).map(move |i| {
                    let slot = (*tail + i) % physical;
                    (values[slot].as_ref().unwrap(), times[slot])
                }))
            }
            WindowStorage::Period { items, .. } => {
                Box::new(items.iter().map(|(value, time)| (value, *time)))
            }
        }
    }

    /// The most recently evicted element, addressable until the tick ends.
    pub fn evicted(&self) -> Option<(&Value, EngineTime)> {
        match &self.storage {
            WindowStorage::Fixed {
                values,
                times,
                evicted,
                ..
            } => evicted.map(|slot| (values[slot].as_ref().unwrap(), times[slot])),
            WindowStorage::Period { evicted, .. } => {
                evicted.as_deref().map(|(value, time)| (value, *time))
            }
        }
    }

    pub(crate) fn end_tick(&mut self) {
        match &mut self.storage {
            WindowStorage::Fixed { evicted, .. } => *evicted = None,
            WindowStorage::Period { evicted, .. } => *evicted = None,
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::value::ScalarValue;

    fn int(v: i64) -> Value {
        Value::Scalar(ScalarValue::Int(v))
    }

    fn t(v: u64) -> EngineTime {
        EngineTime::new(v)
    }

    fn contents(window: &WindowValue) -> (Vec<i64>, Vec<u64>) {
        let mut values = vec![];
        let mut times = vec![];
        for (value, time) in window.iter() {
            match value {
                Value::Scalar(ScalarValue::Int(v)) => values.push(*v),
                _ => panic!(),
            }
            times.push(time.into());
        }
        (values, times)
    }

    #[test]
    fn fixed_window_evicts_oldest() {
        let mut window = WindowValue::new(WindowPolicy::Fixed(3));
        assert!(!window.push(int(10), t(0)));
        assert!(!window.push(int(20), t(1)));
        assert!(!window.push(int(30), t(2)));
        assert!(window.push(int(40), t(3)));
        let (values, times) = contents(&window);
        assert_eq!(values, vec![20, 30, 40]);
        assert_eq!(times, vec![1, 2, 3]);
        let (evicted, evicted_at) = window.evicted().unwrap();
        assert_eq!(evicted, &int(10));
        assert_eq!(evicted_at, t(0));
        window.end_tick();
        assert!(window.evicted().is_none());
    }

    #[test]
    fn period_window_evicts_by_age() {
        let mut window = WindowValue::new(WindowPolicy::Period(Duration::from_nanos(10)));
        window.push(int(1), t(0));
        window.push(int(2), t(5));
        assert!(window.push(int(3), t(12)));
        let (values, _) = contents(&window);
        assert_eq!(values, vec![2, 3]);
        assert_eq!(window.evicted().unwrap().0, &int(1));
    }
}
