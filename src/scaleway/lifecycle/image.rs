//! Image label resolution for the Scaleway provider.
//!
//! Project-scoped images win over public ones. Within the chosen source the
//! newest available image matching the requested architecture is used.

use std::future::Future;

use scaleway_rs::{ScalewayImage, ScalewayListInstanceImagesBuilder};

use crate::vm::VmRequest;

use super::super::{ScalewayProvider, ScalewayProviderError};

const AVAILABLE: &str = "available";

impl ScalewayProvider {
    fn image_query(&self, request: &VmRequest) -> ScalewayListInstanceImagesBuilder {
        ScalewayListInstanceImagesBuilder::new(self.api.clone(), &request.zone)
            .public(true)
            .name(&request.image_label)
            .arch(&request.architecture)
    }

    pub(in crate::scaleway) async fn resolve_image_id(
        &self,
        request: &VmRequest,
    ) -> Result<String, ScalewayProviderError> {
        let project_lookup = || async move {
            if request.project_id.is_empty() {
                return Ok(Vec::new());
            }
            let mut query = self.image_query(request).project(&request.project_id);
            if let Some(org) = &request.organisation_id {
                query = query.organization(org);
            }
            query.run_async().await.map_err(ScalewayProviderError::from)
        };
        let public_lookup = || async move {
            self.image_query(request)
                .run_async()
                .await
                .map_err(ScalewayProviderError::from)
        };

        Self::resolve_image_id_with(request, project_lookup, public_lookup).await
    }

    /// Runs the project lookup, falling back to the public lookup only when
    /// the project has no matching images at all.
    pub(in crate::scaleway) async fn resolve_image_id_with<ProjectFut, PublicFut, Project, Public>(
        request: &VmRequest,
        project_lookup: Project,
        public_lookup: Public,
    ) -> Result<String, ScalewayProviderError>
    where
        Project: FnOnce() -> ProjectFut,
        Public: FnOnce() -> PublicFut,
        ProjectFut: Future<Output = Result<Vec<ScalewayImage>, ScalewayProviderError>>,
        PublicFut: Future<Output = Result<Vec<ScalewayImage>, ScalewayProviderError>>,
    {
        let project_images = project_lookup().await?;
        let images = if project_images.is_empty() {
            public_lookup().await?
        } else {
            project_images
        };
        Self::newest_available(images, request)
    }

    pub(in crate::scaleway) fn newest_available(
        images: Vec<ScalewayImage>,
        request: &VmRequest,
    ) -> Result<String, ScalewayProviderError> {
        images
            .into_iter()
            .filter(|image| image.arch == request.architecture && image.state == AVAILABLE)
            .max_by(|lhs, rhs| lhs.creation_date.cmp(&rhs.creation_date))
            .map(|image| image.id)
            .ok_or_else(|| ScalewayProviderError::ImageNotFound {
                label: request.image_label.clone(),
                arch: request.architecture.clone(),
                zone: request.zone.clone(),
            })
    }
}
