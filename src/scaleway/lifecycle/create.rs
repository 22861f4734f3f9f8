//! Server creation and power-on.
//!
//! Servers are created stopped. User-data only reaches cloud-init when it is
//! part of the creation payload, so boot waits for an explicit poweron.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scaleway::INSTANCE_TAGS;
use crate::scaleway::types::Zone;
use crate::vm::VmRequest;

use super::super::{ScalewayProvider, ScalewayProviderError};
use super::InstanceSnapshot;

#[derive(Serialize)]
struct NewServer<'a> {
    name: String,
    commercial_type: &'a str,
    image: &'a str,
    project: &'a str,
    routed_ip_enabled: bool,
    dynamic_ip_required: bool,
    tags: &'static [&'static str],
    stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    cloud_init: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    organization: Option<&'a str>,
}

impl<'a> NewServer<'a> {
    fn stopped(request: &'a VmRequest, image_id: &'a str) -> Self {
        Self {
            name: format!("kerneld-{}", Uuid::new_v4().simple()),
            commercial_type: &request.instance_type,
            image: image_id,
            project: &request.project_id,
            routed_ip_enabled: true,
            dynamic_ip_required: true,
            tags: &INSTANCE_TAGS,
            stopped: true,
            cloud_init: request.user_data.as_deref(),
            organization: request.organisation_id.as_deref(),
        }
    }
}

#[derive(Deserialize)]
struct CreatedServer {
    server: scaleway_rs::ScalewayInstance,
}

/// Interprets the reply to a server creation call.
pub(super) fn created_server(
    status: StatusCode,
    body: &[u8],
    request: &VmRequest,
) -> Result<scaleway_rs::ScalewayInstance, ScalewayProviderError> {
    if status.is_success() {
        return serde_json::from_slice::<CreatedServer>(body)
            .map(|created| created.server)
            .map_err(ScalewayProviderError::provider);
    }

    let rejected_type = serde_json::from_slice::<scaleway_rs::ScalewayApiError>(body)
        .is_ok_and(|api_err| ScalewayProvider::is_instance_type_error(&api_err, request));
    if rejected_type {
        return Err(ScalewayProviderError::InstanceTypeUnavailable {
            instance_type: request.instance_type.clone(),
            zone: request.zone.clone(),
        });
    }
    Err(ScalewayProviderError::Provider {
        message: format!("{status}: {}", String::from_utf8_lossy(body)),
    })
}

impl ScalewayProvider {
    pub(in crate::scaleway) async fn power_on_if_needed(
        &self,
        zone: &Zone,
        snapshot: &InstanceSnapshot,
    ) -> Result<(), ScalewayProviderError> {
        if snapshot.state.is_running() {
            return Ok(());
        }
        if !snapshot.allowed_actions.iter().any(|action| action.is_power_on()) {
            return Err(ScalewayProviderError::PowerOnNotAllowed {
                instance_id: snapshot.id.to_string(),
                state: snapshot.state.to_string(),
            });
        }
        self.api
            .perform_instance_action_async(zone.as_str(), snapshot.id.as_str(), "poweron")
            .await?;
        Ok(())
    }

    /// Creates a stopped server tagged as a kernel host.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayProviderError::InstanceTypeUnavailable`] when the
    /// zone rejects the commercial type, or [`ScalewayProviderError::Provider`]
    /// for any other failed call.
    pub(in crate::scaleway) async fn create_instance_stopped(
        &self,
        request: &VmRequest,
        image_id: &str,
    ) -> Result<scaleway_rs::ScalewayInstance, ScalewayProviderError> {
        let url = format!(
            "{}/zones/{}/servers",
            super::SCALEWAY_INSTANCE_API_BASE,
            request.zone
        );
        let response = super::HTTP_CLIENT
            .post(&url)
            .header("X-Auth-Token", &self.config.secret_key)
            .json(&NewServer::stopped(request, image_id))
            .send()
            .await
            .map_err(ScalewayProviderError::provider)?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(ScalewayProviderError::provider)?;
        created_server(status, &body, request)
    }
}
