//! BDD scenarios for the local process driver.

use rstest_bdd_macros::scenario;

use super::test_helpers::{LocalContext, local_context};

#[scenario(
    path = "tests/features/local_driver.feature",
    name = "A local kernel runs as a child process"
)]
fn scenario_local_kernel_lifecycle(local_context: LocalContext) {
    let _ = local_context;
}

#[scenario(
    path = "tests/features/local_driver.feature",
    name = "An instance without kernels can be destroyed"
)]
fn scenario_bare_instance_teardown(local_context: LocalContext) {
    let _ = local_context;
}
