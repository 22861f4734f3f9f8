//! Unit tests for Scaleway lifecycle helpers.

use std::collections::HashMap;
use std::time::Duration;

use scaleway_rs::ScalewayImage;

use super::InstanceSnapshot;
use crate::config::ScalewayConfig;
use crate::scaleway::types::{Action, InstanceState, Zone};
use crate::scaleway::{ScalewayProvider, ScalewayProviderError};
use crate::vm::VmRequest;

fn snapshot(state: &str, allowed: &[&str], public_ip: Option<&str>) -> InstanceSnapshot {
    InstanceSnapshot {
        id: "srv-1".into(),
        state: InstanceState::from(state),
        allowed_actions: allowed.iter().copied().map(Action::from).collect(),
        public_ip: public_ip.map(str::to_owned),
    }
}

fn image(id: &str, arch: &str, state: &str, creation_date: &str) -> ScalewayImage {
    ScalewayImage {
        id: id.to_owned(),
        name: String::from("Docker"),
        arch: arch.to_owned(),
        creation_date: creation_date.to_owned(),
        modification_date: String::new(),
        from_server: None,
        organization: String::new(),
        public: true,
        state: state.to_owned(),
        project: String::new(),
        tags: vec![],
        zone: String::from("fr-par-1"),
        root_volume: scaleway_rs::ScalewayImageRootVolume {
            id: String::new(),
            name: String::new(),
            size: 0,
            volume_type: String::new(),
        },
        default_bootscript: None,
        extra_volumes: scaleway_rs::ScalewayImageExtraVolumes {
            volumes: HashMap::new(),
        },
    }
}

fn config() -> ScalewayConfig {
    ScalewayConfig {
        access_key: None,
        secret_key: String::from("secret"),
        default_organization_id: None,
        default_project_id: String::from("project"),
        default_zone: String::from("fr-par-1"),
        default_instance_type: String::from("DEV1-S"),
        default_image: String::from("Docker"),
        default_architecture: String::from("x86_64"),
        cloud_init_user_data: None,
    }
}

fn request() -> VmRequest {
    config()
        .as_request()
        .unwrap_or_else(|err| panic!("fixture request: {err}"))
}

fn provider(wait_timeout: Duration) -> ScalewayProvider {
    ScalewayProvider::new(config(), 2375)
        .unwrap_or_else(|err| panic!("fixture provider: {err}"))
        .with_poll_interval(Duration::from_millis(1))
        .with_wait_timeout(wait_timeout)
}

#[tokio::test]
async fn running_instance_is_not_powered_on_again() {
    let zone = Zone::from("fr-par-1");
    let result = provider(Duration::from_millis(5))
        .power_on_if_needed(&zone, &snapshot("running", &["poweroff"], Some("1.2.3.4")))
        .await;
    assert_eq!(result, Ok(()));
}

#[tokio::test]
async fn stopped_instance_without_poweron_action_is_rejected() {
    let zone = Zone::from("fr-par-1");
    let err = provider(Duration::from_millis(5))
        .power_on_if_needed(&zone, &snapshot("stopped", &[], None))
        .await
        .expect_err("power on must be refused");
    assert_eq!(
        err,
        ScalewayProviderError::PowerOnNotAllowed {
            instance_id: String::from("srv-1"),
            state: String::from("stopped"),
        }
    );
}
