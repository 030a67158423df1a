pub mod error;
pub mod fields;
pub mod looping;
pub mod page;
pub mod rule;
pub mod script;
pub mod store;
pub mod traits;
pub mod util;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use error::HarvestError;
pub use fields::extract_fields;
pub use looping::{LoopEnd, LoopSummary, run_loop};
pub use page::{CompletionGate, Page, PageSession, SessionState};
pub use rule::{Field, Loop, Pattern, Prepare, Rule, parse_duration};
pub use script::ScriptBridge;
pub use store::{InstallOutcome, LoadResult, LoadStatus, RuleGroup, RuleStore};
pub use traits::{
    Browser, EventSink, FieldMap, Handler, LOAD_EVENT_FIRED, LoopControl, PendingResponse, Tab,
    TabEvent, TracingHandler,
};
