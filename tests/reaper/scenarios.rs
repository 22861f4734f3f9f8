//! BDD scenarios for the instance reaper.

use rstest_bdd_macros::scenario;

use super::test_helpers::{ReaperContext, reaper_context};

#[scenario(
    path = "tests/features/reaper.feature",
    name = "A lost agent releases its kernels and then its instance"
)]
fn scenario_lost_agent_released(reaper_context: ReaperContext) {
    let _ = reaper_context;
}

#[scenario(
    path = "tests/features/reaper.feature",
    name = "Unconfirmed teardown is left to the janitor"
)]
fn scenario_unconfirmed_teardown(reaper_context: ReaperContext) {
    let _ = reaper_context;
}
