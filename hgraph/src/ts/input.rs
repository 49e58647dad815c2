use std::cell::RefCell;
use std::rc::Rc;

use super::link::{LinkRef, TsRefTargetLink, set_link_active};
use super::output::OutputRef;
use crate::meta::{TsKind, TypeMeta};
use crate::node::NodeKey;
use crate::time::EngineTime;
use crate::value::{HostValue, RefPath, RefValue};

/// How an input sources its value.
pub enum InputBinding {
    /// Default: no peer, never modified.
    Unbound,
    /// Direct 1:1 binding; the same time-series kind on both sides.
    Peered(LinkRef),
    /// Collection bound element-wise through per-element links.
    NonPeered(Vec<LinkRef>),
    /// Non-Ref input watching a Ref output through the indirection link.
    RefObserver(Rc<RefCell<TsRefTargetLink>>),
    /// Ref input wrapping a non-Ref output as a synthetic ref value.
    RefWrapper {
        output: OutputRef,
        value: RefValue,
        bind_time: EngineTime,
    },
}

/// The readable endpoint of a time-series edge.  An input never owns
/// value data; it borrows through its link(s).
pub struct TsInput {
    name: String,
    meta: &'static TypeMeta,
    owner: NodeKey,
    binding: InputBinding,
}

impl TsInput {
    pub(crate) fn new(name: String, meta: &'static TypeMeta, owner: NodeKey) -> Self {
        Self {
            name,
            meta,
            owner,
            binding: InputBinding::Unbound,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn meta(&self) -> &'static TypeMeta {
        self.meta
    }

    pub fn owner(&self) -> NodeKey {
        self.owner
    }

    pub fn binding(&self) -> &InputBinding {
        &self.binding
    }

    pub fn bound(&self) -> bool {
        !matches!(self.binding, InputBinding::Unbound)
    }

    /// Only a direct 1:1 binding has a peer.
    pub fn has_peer(&self) -> bool {
        matches!(self.binding, InputBinding::Peered(_))
    }

    /// The output a peered input borrows from.
    pub fn peer(&self) -> Option<OutputRef> {
        match &self.binding {
            InputBinding::Peered(link) => link.borrow().output().cloned(),
            _ => None,
        }
    }

    pub fn ref_link(&self) -> Option<Rc<RefCell<TsRefTargetLink>>> {
        match &self.binding {
            InputBinding::RefObserver(link) => Some(link.clone()),
            _ => None,
        }
    }

    pub fn modified_at(&self, time: EngineTime) -> bool {
        match &self.binding {
            InputBinding::Unbound => false,
            InputBinding::Peered(link) => link.borrow().modified_at(time),
            InputBinding::NonPeered(links) => {
                links.iter().any(|link| link.borrow().modified_at(time))
            }
            InputBinding::RefObserver(link) => link.borrow().modified_at(time),
            InputBinding::RefWrapper { bind_time, .. } => *bind_time == time,
        }
    }

    pub fn last_modified_time(&self) -> EngineTime {
        match &self.binding {
            InputBinding::Unbound => EngineTime::MAX_DT,
            InputBinding::Peered(link) => link.borrow().last_modified_time(),
            InputBinding::NonPeered(links) => {
                let mut last = EngineTime::MAX_DT;
                for link in links {
                    let t = link.borrow().last_modified_time();
                    if !t.is_never() && (last.is_never() || t > last) {
                        last = t;
                    }
                }
                last
            }
            InputBinding::RefObserver(link) => link.borrow().last_modified_time(),
            InputBinding::RefWrapper { bind_time, .. } => *bind_time,
        }
    }

    pub fn valid(&self) -> bool {
        match &self.binding {
            InputBinding::Unbound => false,
            InputBinding::Peered(link) => {
                link.borrow().output().is_some_and(|output| output.valid())
            }
            InputBinding::NonPeered(links) => {
                !links.is_empty()
                    && links.iter().all(|link| {
                        link.borrow().output().is_some_and(|output| output.valid())
                    })
            }
            InputBinding::RefObserver(link) => link.borrow().read_host().is_some(),
            InputBinding::RefWrapper { bind_time, .. } => !bind_time.is_never(),
        }
    }

    /// The resolved value as a host representation; None while unbound or
    /// invalid.
    pub fn to_host(&self) -> Option<HostValue> {
        match &self.binding {
            InputBinding::Unbound => None,
            InputBinding::Peered(link) => link.borrow().output()?.to_host(),
            InputBinding::NonPeered(links) => {
                let elements: Vec<HostValue> = links
                    .iter()
                    .map(|link| {
                        link.borrow()
                            .output()
                            .and_then(|output| output.to_host())
                            .unwrap_or(HostValue::Null)
                    })
                    .collect();
                Some(match self.meta.kind() {
                    TsKind::Bundle => HostValue::Bundle(
                        self.meta
                            .fields()
                            .iter()
                            .zip(elements)
                            .map(|(field, value)| (field.name.clone(), value))
                            .collect(),
                    ),
                    _ => HostValue::List(elements),
                })
            }
            InputBinding::RefObserver(link) => link.borrow().read_host(),
            InputBinding::RefWrapper { value, .. } => Some(HostValue::Ref(value.clone())),
        }
    }

    /// Registers the link(s) with the owning output's overlay.
    pub fn make_active(&mut self) {
        self.set_active(true);
    }

    /// Removes the link(s) from the owning output's overlay.
    pub fn make_passive(&mut self) {
        self.set_active(false);
    }

    fn set_active(&mut self, active: bool) {
        match &self.binding {
            InputBinding::Unbound | InputBinding::RefWrapper { .. } => {}
            InputBinding::Peered(link) => set_link_active(link, active),
            InputBinding::NonPeered(links) => {
                for link in links {
                    set_link_active(link, active);
                }
            }
            InputBinding::RefObserver(link) => link.borrow_mut().set_active(active),
        }
    }

    pub fn active(&self) -> bool {
        match &self.binding {
            InputBinding::Unbound | InputBinding::RefWrapper { .. } => false,
            InputBinding::Peered(link) => link.borrow().active(),
            InputBinding::NonPeered(links) => links.iter().any(|link| link.borrow().active()),
            InputBinding::RefObserver(link) => link.borrow().active(),
        }
    }

    pub(crate) fn set_binding(&mut self, binding: InputBinding) {
        self.binding = binding;
    }

    /// RefWrapper inputs report modified only at bind time, which is the
    /// graph start.
    pub(crate) fn set_wrapper_bind_time(&mut self, time: EngineTime) {
        if let InputBinding::RefWrapper { bind_time, .. } = &mut self.binding {
            *bind_time = time;
        }
    }

    /// The synthetic ref path a RefWrapper presents.
    pub(crate) fn wrapper_value(output: OutputRef, path: RefPath) -> InputBinding {
        InputBinding::RefWrapper {
            output,
            value: RefValue::Peered(path),
            bind_time: EngineTime::MAX_DT,
        }
    }
}
