use indexmap::IndexMap;
use std::rc::Rc;

use super::{SubGraphBuilder, SubGraphInstance, merge_preserved};
use crate::delta::DeltaView;
use crate::graph::{GraphBuilder, NodeId};
use crate::meta::{TsKind, TypeMeta};
use crate::node::{NodeBody, NodeContext, NodeKind};
use crate::time::EngineTime;
use crate::value::{HostValue, ScalarValue, Value};

/// Declares which peer instances an instance reads from.
pub type WiringRule = Rc<dyn Fn(&ScalarValue) -> Vec<ScalarValue>>;

pub struct MeshConfig {
    pub builder: SubGraphBuilder,
    /// Keys of the peer instances whose outputs wire into an instance's
    /// peer stub.
    pub dependencies: WiringRule,
    pub preserve_state: bool,
}

/// Map variant with data-dependent wiring: each instance's peer stub
/// (stub 1) receives a map of its declared peers' outputs, and instances
/// evaluate in dependency order so peer values written this tick are
/// visible to dependents within the same tick.  Stub 0 receives the
/// instance's own element value.
pub struct MeshBody {
    config: MeshConfig,
    instances: IndexMap<ScalarValue, SubGraphInstance>,
    preserved: Vec<(String, Value)>,
}

impl MeshBody {
    pub fn new(config: MeshConfig) -> Self {
        Self {
            config,
            instances: IndexMap::new(),
            preserved: Vec::new(),
        }
    }

    /// Live keys in dependency order.  A cycle among live keys is a
    /// wiring error surfaced as an eval error.
    fn dependency_order(&self) -> anyhow::Result<Vec<ScalarValue>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Visiting,
            Done,
        }
        fn visit(
            key: &ScalarValue,
            deps: &WiringRule,
            live: &IndexMap<ScalarValue, SubGraphInstance>,
            marks: &mut IndexMap<ScalarValue, Mark>,
            order: &mut Vec<ScalarValue>,
        ) -> anyhow::Result<()> {
            match marks.get(key).copied().unwrap_or(Mark::New) {
                Mark::Done => return Ok(()),
                Mark::Visiting => {
                    anyhow::bail!("cyclic mesh wiring through key {key}");
                }
                Mark::New => {}
            }
            marks.insert(key.clone(), Mark::Visiting);
            for dep in deps(key) {
                if live.contains_key(&dep) {
                    visit(&dep, deps, live, marks, order)?;
                }
            }
            marks.insert(key.clone(), Mark::Done);
            order.push(key.clone());
            Ok(())
        }
        let mut marks = IndexMap::new();
        let mut order = Vec::new();
        for key in self.instances.keys() {
            visit(
                key,
                &self.config.dependencies,
                &self.instances,
                &mut marks,
                &mut order,
            )?;
        }
        Ok(order)
    }

    fn key_delta(
        ctx: &NodeContext,
        now: EngineTime,
    ) -> (Vec<(ScalarValue, Option<HostValue>)>, Vec<ScalarValue>) {
        let mut upserts = Vec::new();
        let mut removed = Vec::new();
        let Some(peer) = ctx.input(0).peer() else {
            return (upserts, removed);
        };
        let value_meta = peer.meta().element();
        let view = peer.view();
        match view.delta(now) {
            Some(DeltaView::Set(delta)) => {
                for key in delta.added() {
                    upserts.push((key.clone(), None));
                }
                for key in delta.removed() {
                    removed.push(key.clone());
                }
            }
            Some(DeltaView::Map(delta)) => {
                let to_host = |value: &Value| {
                    value_meta.map(|meta| (meta.ops().to_host)(meta, value))
                };
                for (key, value) in delta.added() {
                    upserts.push((key.clone(), to_host(value)));
                }
                for (key, value) in delta.updated() {
                    upserts.push((key.clone(), to_host(value)));
                }
                for key in delta.removed() {
                    removed.push(key.clone());
                }
            }
            _ => {}
        }
        (upserts, removed)
    }
}

impl NodeBody for MeshBody {
    fn eval(&mut self, ctx: &mut NodeContext) -> anyhow::Result<()> {
        let now = ctx.time();
        let mut out_entries: Vec<(HostValue, HostValue)> = Vec::new();
        let mut fresh: Vec<ScalarValue> = Vec::new();
        if ctx.input(0).modified_at(now) {
            let (upserts, removed) = Self::key_delta(ctx, now);
            for key in removed {
                if let Some(instance) = self.instances.shift_remove(&key) {
                    let states = instance.teardown(now, self.config.preserve_state);
                    merge_preserved(&mut self.preserved, states);
                    out_entries.push((key.to_host(), HostValue::RemoveIfExists));
                }
            }
            for (key, value) in upserts {
                let element = value.unwrap_or_else(|| key.to_host());
                if self.instances.contains_key(&key) {
                    self.instances
                        .get_mut(&key)
                        .unwrap()
                        .inject(0, element, now);
                } else {
                    let mut instance = SubGraphInstance::build(
                        key.clone(),
                        &self.config.builder,
                        ctx.key(),
                        &self.preserved,
                        now,
                    )?;
                    instance.inject(0, element, now);
                    // seed the peer stub with the current outputs of
                    // declared peers
                    let mut seed: Vec<(HostValue, HostValue)> = Vec::new();
                    for dep in (self.config.dependencies)(&key) {
                        if let Some(peer) = self.instances.get(&dep)
                            && let Some(value) = peer.output_host()
                        {
                            seed.push((dep.to_host(), value));
                        }
                    }
                    if !seed.is_empty() {
                        instance.inject(1, HostValue::Map(seed), now);
                    }
                    fresh.push(key.clone());
                    self.instances.insert(key, instance);
                }
            }
        }
        let order = self.dependency_order()?;
        let mut next = EngineTime::MAX_DT;
        for key in &order {
            let instance = self.instances.get_mut(key).unwrap();
            instance.evaluate(now)?;
            let changed = instance.output_modified_at(now) || fresh.contains(key);
            let value = instance.output_host();
            next = next.min(instance.next_time());
            if changed && let Some(value) = value {
                out_entries.push((key.to_host(), value.clone()));
                // dependents evaluate later in the order and see this
                // tick's value
                let dependents: Vec<ScalarValue> = self
                    .instances
                    .keys()
                    .filter(|k| (self.config.dependencies)(k).contains(key))
                    .cloned()
                    .collect();
                for dependent in dependents {
                    let peer_entry = HostValue::Map(vec![(key.to_host(), value.clone())]);
                    if let Some(instance) = self.instances.get_mut(&dependent) {
                        instance.inject(1, peer_entry, now);
                        instance.evaluate(now)?;
                    }
                }
            }
        }
        if !out_entries.is_empty() {
            ctx.apply(HostValue::Map(out_entries))?;
        }
        if !next.is_never() {
            ctx.schedule(next);
        }
        Ok(())
    }

    fn stop(&mut self, ctx: &mut NodeContext) -> anyhow::Result<()> {
        let preserve = self.config.preserve_state;
        for (_, instance) in self.instances.drain(..) {
            let states = instance.teardown(ctx.time(), preserve);
            merge_preserved(&mut self.preserved, states);
        }
        Ok(())
    }

    fn on_tick_end(&mut self, time: EngineTime) {
        for instance in self.instances.values_mut() {
            instance.end_tick(time);
        }
    }
}

impl GraphBuilder {
    /// A mesh nested node over `keyed`, wiring peer outputs by
    /// `config.dependencies`.
    pub fn mesh_over(
        &mut self,
        name: &str,
        keyed: NodeId,
        out_meta: &'static TypeMeta,
        config: MeshConfig,
    ) -> NodeId {
        let id = self.add_node(name, NodeKind::Nested, MeshBody::new(config));
        self.set_output(id, out_meta);
        let keyed_meta = self
            .output_meta(keyed)
            .unwrap_or_else(|| panic!("mesh keyed source has no output"));
        assert!(
            matches!(keyed_meta.kind(), TsKind::Set | TsKind::Map),
            "mesh keyed input must be a set or map, got {keyed_meta}"
        );
        let input = self.add_input(id, "keys", keyed_meta);
        self.connect(keyed, id, input);
        id
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::engine::{EvaluationEngine, RunFor, RunMode};
    use crate::nested::NestedGraphSpec;
    use crate::value::HostValue;

    fn t(v: u64) -> EngineTime {
        EngineTime::new(v)
    }

    fn pricer() -> SubGraphBuilder {
        Rc::new(|key| {
            let base = match key {
                ScalarValue::Str(s) if s == "a" => 10,
                _ => 20,
            };
            let mut builder = GraphBuilder::new();
            let element = builder.push_source("element", TypeMeta::str());
            let peers = builder.push_source(
                "peers",
                TypeMeta::map_of(TypeMeta::str(), TypeMeta::int()).unwrap(),
            );
            let out = builder.compute(
                "price",
                &[element, peers],
                TypeMeta::int(),
                move |ctx| {
                    let peer_sum: i64 = ctx
                        .input(1)
                        .to_host()
                        .and_then(|v| match v {
                            HostValue::Map(entries) => Some(
                                entries
                                    .iter()
                                    .filter_map(|(_, v)| v.as_int())
                                    .sum::<i64>(),
                            ),
                            _ => None,
                        })
                        .unwrap_or(0);
                    ctx.apply(HostValue::Int(base + peer_sum))
                },
            );
            NestedGraphSpec {
                builder,
                inputs: vec![element, peers],
                output: out,
            }
        })
    }

    #[test]
    fn peer_outputs_wire_in_dependency_order() {
        let _ = env_logger::try_init();
        let set_meta = TypeMeta::set_of(TypeMeta::str()).unwrap();
        let mut builder = GraphBuilder::new();
        let keyed = builder.pull_source(
            "keys",
            set_meta,
            vec![(
                t(0),
                HostValue::Set(vec![
                    HostValue::Str("b".into()),
                    HostValue::Str("a".into()),
                ]),
            )],
        );
        let out_meta = TypeMeta::map_of(TypeMeta::str(), TypeMeta::int()).unwrap();
        let mesh = builder.mesh_over(
            "mesh",
            keyed,
            out_meta,
            MeshConfig {
                builder: pricer(),
                // b reads a's output
                dependencies: Rc::new(|key| match key {
                    ScalarValue::Str(s) if s == "b" => vec![ScalarValue::Str("a".into())],
                    _ => vec![],
                }),
                preserve_state: false,
            },
        );
        let graph = builder.build().unwrap();
        let output = graph.output(mesh).unwrap();
        let mut engine = EvaluationEngine::new(graph, RunMode::HistoricalFrom(t(0)));
        engine.run(RunFor::Forever).unwrap();
        // a evaluates before b despite arriving after it; b sees a's
        // freshly written output in the same tick
        assert_eq!(
            output.to_host(),
            Some(HostValue::Map(vec![
                (HostValue::Str("a".into()), HostValue::Int(10)),
                (HostValue::Str("b".into()), HostValue::Int(30)),
            ]))
        );
    }

    #[test]
    fn cyclic_wiring_fails_the_tick() {
        let set_meta = TypeMeta::set_of(TypeMeta::str()).unwrap();
        let mut builder = GraphBuilder::new();
        let keyed = builder.pull_source(
            "keys",
            set_meta,
            vec![(
                t(0),
                HostValue::Set(vec![
                    HostValue::Str("a".into()),
                    HostValue::Str("b".into()),
                ]),
            )],
        );
        let out_meta = TypeMeta::map_of(TypeMeta::str(), TypeMeta::int()).unwrap();
        builder.mesh_over(
            "mesh",
            keyed,
            out_meta,
            MeshConfig {
                builder: pricer(),
                dependencies: Rc::new(|key| match key {
                    ScalarValue::Str(s) if s == "b" => vec![ScalarValue::Str("a".into())],
                    _ => vec![ScalarValue::Str("b".into())],
                }),
                preserve_state: false,
            },
        );
        let graph = builder.build().unwrap();
        let mut engine = EvaluationEngine::new(graph, RunMode::HistoricalFrom(t(0)));
        let err = engine.run(RunFor::Forever).unwrap_err();
        assert!(err.to_string().contains("cyclic mesh wiring"));
    }
}
