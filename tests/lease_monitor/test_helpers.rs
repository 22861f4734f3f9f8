//! Shared fixtures for lease monitor scenarios.

use kerneld::events::Event;
use kerneld::lease::{KeyEvent, MonitorExit};
use kerneld::test_support::ScriptEnd;
use rstest::fixture;

#[derive(Clone, Debug)]
pub struct LeaseContext {
    pub script: Vec<KeyEvent>,
    pub end: ScriptEnd,
    pub outcome: Option<Result<MonitorExit, String>>,
    pub closed: bool,
    pub delivered: Vec<Event>,
}

#[fixture]
pub fn lease_context() -> LeaseContext {
    LeaseContext {
        script: Vec::new(),
        end: ScriptEnd::Closed,
        outcome: None,
        closed: false,
        delivered: Vec::new(),
    }
}
