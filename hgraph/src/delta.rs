//! Non-owning projections of what changed in the current tick.  A
//! [DeltaView] taken at time `t` is valid only while the tick at `t` is
//! open; the end-of-tick reset invalidates it.

use crate::meta::{TsKind, TypeMeta};
use crate::time::EngineTime;
use crate::tracker::{ModificationTracker, SlotTracker};
use crate::value::{
    MapValue, QueueValue, RefValue, ScalarValue, SetValue, Value, WindowValue,
};

/// Per-kind projection of the changes made during one tick.
pub enum DeltaView<'a> {
    Scalar(&'a ScalarValue),
    Bundle(BundleDelta<'a>),
    List(ListDelta<'a>),
    Set(SetDelta<'a>),
    Map(MapDelta<'a>),
    Window(WindowDelta<'a>),
    Queue(QueueDelta<'a>),
    Ref(RefDelta<'a>),
}

impl<'a> DeltaView<'a> {
    /// None unless the value was modified at `time`.
    pub(crate) fn new(
        meta: &'static TypeMeta,
        value: &'a Value,
        tracker: &'a ModificationTracker,
        time: EngineTime,
    ) -> Option<DeltaView<'a>> {
        if !tracker.modified_at(time) {
            return None;
        }
        Some(match meta.kind() {
            TsKind::Scalar => DeltaView::Scalar(value.as_scalar().unwrap()),
            TsKind::Bundle => DeltaView::Bundle(BundleDelta {
                meta,
                value,
                tracker,
                time,
            }),
            TsKind::List => DeltaView::List(ListDelta {
                len: meta.list_len().unwrap(),
                tracker,
                time,
            }),
            TsKind::Set => DeltaView::Set(SetDelta {
                set: value.as_set().unwrap(),
                slots: tracker.slots(),
            }),
            TsKind::Map => DeltaView::Map(MapDelta {
                map: value.as_map().unwrap(),
                slots: tracker.slots(),
            }),
            TsKind::Window => DeltaView::Window(WindowDelta {
                window: value.as_window().unwrap(),
                pushed: tracker.window().pushed,
            }),
            TsKind::Queue => DeltaView::Queue(QueueDelta {
                queue: value.as_queue().unwrap(),
            }),
            TsKind::Ref => DeltaView::Ref(RefDelta {
                value: value.as_ref_value().unwrap(),
                rebind_time: tracker.ref_tracker().rebind_time,
            }),
        })
    }

    pub fn as_scalar(&self) -> Option<&'a ScalarValue> {
        match self {
            DeltaView::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&SetDelta<'a>> {
        match self {
            DeltaView::Set(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapDelta<'a>> {
        match self {
            DeltaView::Map(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_window(&self) -> Option<&WindowDelta<'a>> {
        match self {
            DeltaView::Window(d) => Some(d),
            _ => None,
        }
    }
}

/// Bundle delta: iterate the fields modified this tick, each with its own
/// nested view.
pub struct BundleDelta<'a> {
    meta: &'static TypeMeta,
    value: &'a Value,
    tracker: &'a ModificationTracker,
    time: EngineTime,
}

impl<'a> BundleDelta<'a> {
    pub fn modified_fields(&self) -> impl Iterator<Item = (usize, &'a str, DeltaView<'a>)> + '_ {
        let bundle = self.value.as_bundle().unwrap();
        self.meta
            .fields()
            .iter()
            .enumerate()
            .filter_map(move |(ndx, field)| {
                DeltaView::new(
                    field.meta,
                    bundle.get(ndx).unwrap(),
                    self.tracker.field(ndx),
                    self.time,
                )
                .map(|delta| (ndx, field.name.as_str(), delta))
            })
    }
}

/// List delta: the indices modified this tick.
pub struct ListDelta<'a> {
    len: usize,
    tracker: &'a ModificationTracker,
    time: EngineTime,
}

impl ListDelta<'_> {
    pub fn modified_indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|&ndx| self.tracker.element_time(ndx) == self.time)
    }
}

/// Set delta: added and removed elements; removed slots stay addressable
/// until the tick ends.
pub struct SetDelta<'a> {
    set: &'a SetValue,
    slots: &'a SlotTracker,
}

impl<'a> SetDelta<'a> {
    pub fn added(&self) -> impl Iterator<Item = &'a ScalarValue> + '_ {
        self.slots
            .added()
            .iter()
            .map(|&slot| self.set.key_at(slot).unwrap())
    }

    pub fn removed(&self) -> impl Iterator<Item = &'a ScalarValue> + '_ {
        self.slots
            .removed()
            .iter()
            .map(|&slot| self.set.key_at(slot).unwrap())
    }
}

/// Map delta: added, removed and updated keys.  Entry values are replaced
/// wholesale on apply, so the nested per-entry delta is the entry value.
pub struct MapDelta<'a> {
    map: &'a MapValue,
    slots: &'a SlotTracker,
}

impl<'a> MapDelta<'a> {
    pub fn added(&self) -> impl Iterator<Item = (&'a ScalarValue, &'a Value)> + '_ {
        self.slots.added().iter().map(|&slot| {
            (
                self.map.key_at(slot).unwrap(),
                self.map.value_at(slot).unwrap(),
            )
        })
    }

    pub fn removed(&self) -> impl Iterator<Item = &'a ScalarValue> + '_ {
        self.slots
            .removed()
            .iter()
            .map(|&slot| self.map.key_at(slot).unwrap())
    }

    pub fn updated(&self) -> impl Iterator<Item = (&'a ScalarValue, &'a Value)> + '_ {
        self.slots.updated().iter().map(|&slot| {
            (
                self.map.key_at(slot).unwrap(),
                self.map.value_at(slot).unwrap(),
            )
        })
    }
}

/// Window delta: the elements pushed this tick plus the evicted element,
/// if any.
pub struct WindowDelta<'a> {
    window: &'a WindowValue,
    pushed: usize,
}

impl<'a> WindowDelta<'a> {
    pub fn pushed(&self) -> impl Iterator<Item = (&'a Value, EngineTime)> + '_ {
        let skip = self.window.len() - self.pushed.min(self.window.len());
        self.window.iter().skip(skip)
    }

    pub fn evicted(&self) -> Option<(&'a Value, EngineTime)> {
        self.window.evicted()
    }
}

/// Queue delta: the queue contents after this tick's pushes.
pub struct QueueDelta<'a> {
    queue: &'a QueueValue,
}

impl<'a> QueueDelta<'a> {
    pub fn contents(&self) -> impl Iterator<Item = &'a Value> + '_ {
        self.queue.iter()
    }
}

/// Ref delta: the current ref value; the rebind delta against the prior
/// target lives on the observing link
/// ([TsRefTargetLink](crate::ts::TsRefTargetLink)).
pub struct RefDelta<'a> {
    pub value: &'a RefValue,
    pub rebind_time: EngineTime,
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::engine::{EvaluationEngine, RunFor, RunMode};
    use crate::graph::GraphBuilder;
    use crate::value::HostValue;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn t(v: u64) -> EngineTime {
        EngineTime::new(v)
    }

    fn int(v: i64) -> HostValue {
        HostValue::Int(v)
    }

    fn s(v: &str) -> HostValue {
        HostValue::Str(v.to_string())
    }

    #[derive(Debug, Default, PartialEq)]
    struct MapTick {
        added: Vec<(String, i64)>,
        updated: Vec<(String, i64)>,
        removed: Vec<String>,
    }

    fn scalar_str(key: &ScalarValue) -> String {
        match key {
            ScalarValue::Str(v) => v.clone(),
            other => panic!("expected str key, got {other:?}"),
        }
    }

    fn scalar_int(value: &Value) -> i64 {
        match value {
            Value::Scalar(ScalarValue::Int(v)) => *v,
            other => panic!("expected int value, got {other:?}"),
        }
    }

    #[test]
    fn map_delta_tracks_added_updated_removed() {
        let map_meta = TypeMeta::map_of(TypeMeta::str(), TypeMeta::int()).unwrap();
        let mut builder = GraphBuilder::new();
        let src = builder.pull_source(
            "src",
            map_meta,
            vec![
                (t(0), HostValue::Map(vec![(s("a"), int(1))])),
                (t(1), HostValue::Map(vec![(s("a"), int(2))])),
                (t(2), HostValue::Map(vec![(s("a"), HostValue::Remove)])),
            ],
        );
        let ticks: Rc<RefCell<Vec<MapTick>>> = Default::default();
        let record = ticks.clone();
        builder.compute("observe", &[src], map_meta, move |ctx| {
            let now = ctx.time();
            let peer = ctx.input(0).peer().unwrap();
            let view = peer.view();
            let delta = view.delta(now).unwrap();
            let delta = delta.as_map().unwrap();
            record.borrow_mut().push(MapTick {
                added: delta
                    .added()
                    .map(|(k, v)| (scalar_str(k), scalar_int(v)))
                    .collect(),
                updated: delta
                    .updated()
                    .map(|(k, v)| (scalar_str(k), scalar_int(v)))
                    .collect(),
                removed: delta.removed().map(scalar_str).collect(),
            });
            Ok(())
        });
        let graph = builder.build().unwrap();
        let output = graph.output(src).unwrap();
        let mut engine = EvaluationEngine::new(graph, RunMode::HistoricalFrom(t(0)));
        engine.run(RunFor::Forever).unwrap();
        assert_eq!(
            &*ticks.borrow(),
            &[
                MapTick {
                    added: vec![("a".into(), 1)],
                    ..Default::default()
                },
                MapTick {
                    updated: vec![("a".into(), 2)],
                    ..Default::default()
                },
                MapTick {
                    removed: vec!["a".into()],
                    ..Default::default()
                },
            ]
        );
        // the tick at T2 is closed: the delta view is no longer valid and
        // the removed key is unreachable
        assert!(output.view().delta(t(2)).is_none());
        assert_eq!(output.to_host(), Some(HostValue::Map(vec![])));
    }

    #[test]
    fn window_delta_exposes_pushed_and_evicted() {
        let window_meta =
            TypeMeta::window_of(TypeMeta::int(), crate::meta::WindowPolicy::Fixed(3));
        let mut builder = GraphBuilder::new();
        let src = builder.pull_source(
            "src",
            TypeMeta::int(),
            vec![
                (t(0), int(10)),
                (t(1), int(20)),
                (t(2), int(30)),
                (t(3), int(40)),
            ],
        );
        let window = builder.compute("window", &[src], window_meta, |ctx| {
            if ctx.input(0).modified_at(ctx.time()) {
                ctx.apply(ctx.input(0).to_host().unwrap())?;
            }
            Ok(())
        });
        let seen: Rc<RefCell<Vec<(Vec<i64>, Option<i64>)>>> = Default::default();
        let record = seen.clone();
        builder.compute("observe", &[window], TypeMeta::int(), move |ctx| {
            let now = ctx.time();
            let peer = ctx.input(0).peer().unwrap();
            let view = peer.view();
            if let Some(delta) = view.delta(now) {
                let delta = delta.as_window().unwrap();
                let pushed = delta.pushed().map(|(v, _)| scalar_int(v)).collect();
                let evicted = delta.evicted().map(|(v, _)| scalar_int(v));
                record.borrow_mut().push((pushed, evicted));
            }
            Ok(())
        });
        let graph = builder.build().unwrap();
        let output = graph.output(window).unwrap();
        let mut engine = EvaluationEngine::new(graph, RunMode::HistoricalFrom(t(0)));
        engine.run(RunFor::Forever).unwrap();
        assert_eq!(
            &*seen.borrow(),
            &[
                (vec![10], None),
                (vec![20], None),
                (vec![30], None),
                (vec![40], Some(10)),
            ]
        );
        // ordered contents and sidecar timestamps after T3
        let view = output.view();
        let window_value = view.value().as_window().unwrap();
        let contents: Vec<(i64, u64)> = window_value
            .iter()
            .map(|(v, time)| (scalar_int(v), time.into()))
            .collect();
        assert_eq!(contents, vec![(20, 1), (30, 2), (40, 3)]);
        // the evicted slot was released when the tick closed
        assert!(window_value.evicted().is_none());
    }

    #[test]
    fn bundle_delta_iterates_modified_fields_only() {
        let bundle_meta = TypeMeta::bundle(vec![
            ("px", TypeMeta::float()),
            ("qty", TypeMeta::int()),
        ])
        .unwrap();
        let mut builder = GraphBuilder::new();
        let src = builder.pull_source(
            "src",
            bundle_meta,
            vec![
                (
                    t(0),
                    HostValue::Bundle(vec![
                        ("px".into(), HostValue::Float(1.5)),
                        ("qty".into(), int(10)),
                    ]),
                ),
                (t(1), HostValue::Bundle(vec![("qty".into(), int(20))])),
            ],
        );
        let seen: Rc<RefCell<Vec<Vec<String>>>> = Default::default();
        let record = seen.clone();
        builder.compute("observe", &[src], bundle_meta, move |ctx| {
            let now = ctx.time();
            let peer = ctx.input(0).peer().unwrap();
            let view = peer.view();
            if let Some(DeltaView::Bundle(delta)) = view.delta(now) {
                let fields = delta
                    .modified_fields()
                    .map(|(_, name, _)| name.to_string())
                    .collect();
                record.borrow_mut().push(fields);
            }
            Ok(())
        });
        let graph = builder.build().unwrap();
        let mut engine = EvaluationEngine::new(graph, RunMode::HistoricalFrom(t(0)));
        engine.run(RunFor::Forever).unwrap();
        assert_eq!(
            &*seen.borrow(),
            &[
                vec!["px".to_string(), "qty".to_string()],
                vec!["qty".to_string()],
            ]
        );
    }

    #[test]
    fn list_delta_reports_sparse_indices() {
        let list_meta = TypeMeta::list_of(TypeMeta::int(), 3);
        let mut builder = GraphBuilder::new();
        let src = builder.pull_source(
            "src",
            list_meta,
            vec![
                (t(0), HostValue::List(vec![int(1), int(2), int(3)])),
                (t(1), HostValue::Map(vec![(int(2), int(9))])),
            ],
        );
        let seen: Rc<RefCell<Vec<Vec<usize>>>> = Default::default();
        let record = seen.clone();
        builder.compute("observe", &[src], list_meta, move |ctx| {
            let now = ctx.time();
            let peer = ctx.input(0).peer().unwrap();
            let view = peer.view();
            if let Some(DeltaView::List(delta)) = view.delta(now) {
                record.borrow_mut().push(delta.modified_indices().collect());
            }
            Ok(())
        });
        let graph = builder.build().unwrap();
        let mut engine = EvaluationEngine::new(graph, RunMode::HistoricalFrom(t(0)));
        engine.run(RunFor::Forever).unwrap();
        assert_eq!(&*seen.borrow(), &[vec![0, 1, 2], vec![2]]);
    }
}
