#[cfg(test)]
use super::NestedGraphSpec;
use super::{SubGraphBuilder, SubGraphInstance, merge_preserved};
use crate::graph::{GraphBuilder, NodeId};
use crate::meta::TypeMeta;
use crate::node::{NodeBody, NodeContext, NodeKind};
use crate::time::EngineTime;
use crate::value::{ScalarValue, Value};

/// Switch configuration: a catalog of sub-graph builders keyed by the key
/// input's value, plus an optional default.
pub struct SwitchConfig {
    pub builders: Vec<(ScalarValue, SubGraphBuilder)>,
    pub default_builder: Option<SubGraphBuilder>,
    /// Teardown and rebuild even when the key value is unchanged but the
    /// key input ticked this cycle.
    pub reload_on_ticked: bool,
    /// Carry recordable state across teardown into the next instance
    /// with the same recordable id.
    pub preserve_state: bool,
}

/// Nested node that keeps exactly one sub-graph live, chosen by its key
/// input.  Input 0 is the key; inputs 1.. forward into the sub-graph's
/// stub sources positionally.
pub struct SwitchBody {
    config: SwitchConfig,
    active: Option<SubGraphInstance>,
    preserved: Vec<(String, Value)>,
}

impl SwitchBody {
    pub fn new(config: SwitchConfig) -> Self {
        Self {
            config,
            active: None,
            preserved: Vec::new(),
        }
    }

    fn builder_for(&self, key: &ScalarValue) -> Option<&SubGraphBuilder> {
        self.config
            .builders
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, b)| b)
            .or(self.config.default_builder.as_ref())
    }
}

impl NodeBody for SwitchBody {
    fn eval(&mut self, ctx: &mut NodeContext) -> anyhow::Result<()> {
        let now = ctx.time();
        let key_ticked = ctx.input(0).modified_at(now);
        let key_host = match ctx.input(0).to_host() {
            Some(host) => host,
            None => return Ok(()),
        };
        let key_type = ctx.input(0).meta().scalar_type().ok_or_else(|| {
            anyhow::anyhow!("switch key input must be a scalar")
        })?;
        let key = ScalarValue::from_host(key_type, key_host)?;
        let key_changed = match &self.active {
            None => true,
            Some(instance) => instance.key() != &key,
        };
        let mut rebuilt = false;
        if key_changed || (self.config.reload_on_ticked && key_ticked) {
            if let Some(instance) = self.active.take() {
                let states = instance.teardown(now, self.config.preserve_state);
                merge_preserved(&mut self.preserved, states);
            }
            let builder = self
                .builder_for(&key)
                .ok_or_else(|| anyhow::anyhow!("no sub-graph registered for key {key}"))?
                .clone();
            let mut instance =
                SubGraphInstance::build(key, &builder, ctx.key(), &self.preserved, now)?;
            for ndx in 1..ctx.input_count() {
                if let Some(value) = ctx.input(ndx).to_host() {
                    instance.inject(ndx - 1, value, now);
                }
            }
            self.active = Some(instance);
            rebuilt = true;
        } else {
            let instance = self.active.as_mut().unwrap();
            for ndx in 1..ctx.input_count() {
                if ctx.input(ndx).modified_at(now)
                    && let Some(value) = ctx.input(ndx).to_host()
                {
                    instance.inject(ndx - 1, value, now);
                }
            }
        }
        let instance = self.active.as_mut().unwrap();
        instance.evaluate(now)?;
        if rebuilt || instance.output_modified_at(now) {
            if let Some(value) = instance.output_host() {
                ctx.apply(value)?;
            }
        }
        let next = instance.next_time();
        if !next.is_never() {
            ctx.schedule(next);
        }
        Ok(())
    }

    fn stop(&mut self, ctx: &mut NodeContext) -> anyhow::Result<()> {
        if let Some(instance) = self.active.take() {
            let states = instance.teardown(ctx.time(), self.config.preserve_state);
            merge_preserved(&mut self.preserved, states);
        }
        Ok(())
    }

    fn on_tick_end(&mut self, time: EngineTime) {
        if let Some(instance) = self.active.as_mut() {
            instance.end_tick(time);
        }
    }
}

impl GraphBuilder {
    /// A switch nested node: `key` selects the live sub-graph, `data`
    /// outputs forward into its stubs positionally.
    pub fn switch(
        &mut self,
        name: &str,
        key: NodeId,
        data: Vec<NodeId>,
        out_meta: &'static TypeMeta,
        config: SwitchConfig,
    ) -> NodeId {
        let id = self.add_node(name, NodeKind::Nested, SwitchBody::new(config));
        self.set_output(id, out_meta);
        let key_meta = self
            .output_meta(key)
            .unwrap_or_else(|| panic!("switch key has no output"));
        let input = self.add_input(id, "key", key_meta);
        self.connect(key, id, input);
        for (i, src) in data.iter().enumerate() {
            let meta = self
                .output_meta(*src)
                .unwrap_or_else(|| panic!("switch data source {i} has no output"));
            let input = self.add_input(id, &format!("data{i}"), meta);
            self.connect(*src, id, input);
        }
        id
    }
}
