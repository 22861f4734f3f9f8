//! Shared fixtures for reaper scenarios.

use std::sync::Arc;

use kerneld::janitor::{LeakLedger, SweepSummary};
use kerneld::reaper::InstanceReaper;
use kerneld::test_support::ScriptedDriver;
use rstest::fixture;

#[derive(Clone, Debug)]
pub struct ReaperContext {
    pub driver: Arc<ScriptedDriver>,
    pub ledger: LeakLedger,
    pub reaper: Arc<InstanceReaper<ScriptedDriver>>,
    pub instance_id: Option<String>,
    pub kernel_ids: Vec<String>,
    pub sweep: Option<Result<SweepSummary, String>>,
}

impl ReaperContext {
    pub fn instance_id(&self) -> &str {
        self.instance_id
            .as_deref()
            .unwrap_or_else(|| panic!("test setup requires a launched instance"))
    }
}

#[fixture]
pub fn reaper_context() -> ReaperContext {
    let driver = Arc::new(ScriptedDriver::new());
    let ledger = LeakLedger::new();
    let reaper = Arc::new(InstanceReaper::new(Arc::clone(&driver), ledger.clone()));
    ReaperContext {
        driver,
        ledger,
        reaper,
        instance_id: None,
        kernel_ids: Vec::new(),
        sweep: None,
    }
}
