//! The time-series layer: writable outputs, bindable read-only inputs
//! and the links that mediate subscription between them.

mod hash_by_ref;
mod input;
mod link;
mod output;

pub(crate) use link::{bind_link, set_link_active};
pub use input::{InputBinding, TsInput};
pub use link::{LinkRef, Notify, RebindDelta, TsLink, TsRefTargetLink};
pub use output::{OutputDirectory, OutputRef, OutputView, Overlay, TsOutput};
pub(crate) use output::DirEntry;
