use indexmap::IndexMap;

use super::{SubGraphBuilder, SubGraphInstance, merge_preserved};
use crate::delta::DeltaView;
use crate::graph::{GraphBuilder, NodeId};
use crate::meta::{TsKind, TypeMeta};
use crate::node::{NodeBody, NodeContext, NodeKind};
use crate::time::EngineTime;
use crate::value::{HostValue, ScalarValue, Value};

pub struct MapConfig {
    pub builder: SubGraphBuilder,
    pub preserve_state: bool,
}

/// Nested node that keeps one sub-graph per live key of its keyed input
/// (a set or map).  Instances are created on key-add and destroyed on
/// key-remove within the tick the change appears in the delta.  Input 0
/// is the keyed input; inputs 1.. broadcast into every instance's stubs
/// 1.. positionally; a map entry's value feeds stub 0.
pub struct MapBody {
    config: MapConfig,
    instances: IndexMap<ScalarValue, SubGraphInstance>,
    preserved: Vec<(String, Value)>,
}

impl MapBody {
    pub fn new(config: MapConfig) -> Self {
        Self {
            config,
            instances: IndexMap::new(),
            preserved: Vec::new(),
        }
    }

    /// Reads the keyed input's delta into owned create/update/remove
    /// work-lists.
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

impl NodeBody for MapBody {
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
                    // current broadcast values feed the new instance
                    for ndx in 1..ctx.input_count() {
                        if let Some(value) = ctx.input(ndx).to_host() {
                            instance.inject(ndx, value, now);
                        }
                    }
                    fresh.push(key.clone());
                    self.instances.insert(key, instance);
                }
            }
        }
        for ndx in 1..ctx.input_count() {
            if ctx.input(ndx).modified_at(now)
                && let Some(value) = ctx.input(ndx).to_host()
            {
                for instance in self.instances.values_mut() {
                    instance.inject(ndx, value.clone(), now);
                }
            }
        }
        let mut next = EngineTime::MAX_DT;
        for (key, instance) in self.instances.iter_mut() {
            instance.evaluate(now)?;
            if instance.output_modified_at(now) || fresh.contains(key) {
                if let Some(value) = instance.output_host() {
                    out_entries.push((key.to_host(), value));
                }
            }
            next = next.min(instance.next_time());
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
    /// A map nested node over `keyed` (a set or map output).  The output
    /// is a map from key to instance output.
    pub fn map_over(
        &mut self,
        name: &str,
        keyed: NodeId,
        broadcast: Vec<NodeId>,
        out_meta: &'static TypeMeta,
        config: MapConfig,
    ) -> NodeId {
        let id = self.add_node(name, NodeKind::Nested, MapBody::new(config));
        self.set_output(id, out_meta);
        let keyed_meta = self
            .output_meta(keyed)
            .unwrap_or_else(|| panic!("map keyed source has no output"));
        assert!(
            matches!(keyed_meta.kind(), TsKind::Set | TsKind::Map),
            "map keyed input must be a set or map, got {keyed_meta}"
        );
        let input = self.add_input(id, "keys", keyed_meta);
        self.connect(keyed, id, input);
        for (i, src) in broadcast.iter().enumerate() {
            let meta = self
                .output_meta(*src)
                .unwrap_or_else(|| panic!("map broadcast source {i} has no output"));
            let input = self.add_input(id, &format!("bcast{i}"), meta);
            self.connect(*src, id, input);
        }
        id
    }
}
