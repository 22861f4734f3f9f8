//! BDD scenarios for lease expiry monitoring.

use rstest_bdd_macros::scenario;

use super::test_helpers::{LeaseContext, lease_context};

#[scenario(
    path = "tests/features/lease_monitor.feature",
    name = "An expired lease reports the lost agent"
)]
fn scenario_expired_lease(lease_context: LeaseContext) {
    let _ = lease_context;
}

#[scenario(
    path = "tests/features/lease_monitor.feature",
    name = "Keys outside the lease namespace are ignored"
)]
fn scenario_foreign_keys_ignored(lease_context: LeaseContext) {
    let _ = lease_context;
}

#[scenario(
    path = "tests/features/lease_monitor.feature",
    name = "Cancellation stops a waiting monitor"
)]
fn scenario_cancellation(lease_context: LeaseContext) {
    let _ = lease_context;
}

#[scenario(
    path = "tests/features/lease_monitor.feature",
    name = "A lost connection ends the monitor and releases the subscription"
)]
fn scenario_lost_connection(lease_context: LeaseContext) {
    let _ = lease_context;
}
