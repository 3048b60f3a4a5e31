//! Image rotation: retiring superseded uploads and removing retired images
//! nothing boots from any more.
//!
//! Publishing an image under a name that already exists retires the older
//! images: they are renamed to `Obsolete <name>` and flagged obsolete.
//! Rotation later deletes flagged images that no instance in any project
//! uses.

use tracing::{info, warn};

use crate::control_plane::{ControlPlane, ControlPlaneError, Image, ImageQuery};

/// Prefix given to the name of a retired image.
pub const OBSOLETE_PREFIX: &str = "Obsolete";

/// Name a retired image is renamed to.
#[must_use]
pub fn obsolete_name(name: &str) -> String {
    format!("{OBSOLETE_PREFIX} {name}")
}

/// Retires every image called `current.name` other than `current` itself.
///
/// # Errors
///
/// Returns the first [`ControlPlaneError`] raised while listing or
/// updating images.
pub async fn obsolete_older_images<C: ControlPlane>(
    plane: &C,
    current: &Image,
) -> Result<Vec<Image>, ControlPlaneError> {
    let query = ImageQuery::named(&current.name);
    let retired_name = obsolete_name(&current.name);
    let mut retired = Vec::new();
    for older in plane
        .list_images(&query)
        .await?
        .into_iter()
        .filter(|image| image.id != current.id)
    {
        let image = plane.mark_image_obsolete(&older.id, &retired_name).await?;
        info!(image_id = %image.id, name = %image.name, "image marked obsolete");
        retired.push(image);
    }
    Ok(retired)
}

/// Retires the image `id`. An image already flagged obsolete is returned
/// unchanged.
///
/// # Errors
///
/// Returns [`ControlPlaneError::NotFound`] for an unknown image and any
/// error raised by the update.
pub async fn mark_obsolete<C: ControlPlane>(
    plane: &C,
    id: &str,
) -> Result<Image, ControlPlaneError> {
    let image = plane.get_image(id).await?;
    if image.obsolete {
        info!(image_id = %image.id, name = %image.name, "image is already obsolete");
        return Ok(image);
    }
    let retired = plane
        .mark_image_obsolete(&image.id, &obsolete_name(&image.name))
        .await?;
    info!(image_id = %retired.id, name = %retired.name, "image marked obsolete");
    Ok(retired)
}

/// Obsolete images no instance boots from, optionally limited to those
/// retired from `name`.
///
/// # Errors
///
/// Returns the first [`ControlPlaneError`] raised while listing images or
/// instances.
pub async fn unused_obsolete_images<C: ControlPlane>(
    plane: &C,
    name: Option<&str>,
) -> Result<Vec<Image>, ControlPlaneError> {
    let query = ImageQuery {
        name: name.map(obsolete_name),
        obsolete: true,
    };
    let obsolete = plane.list_images(&query).await?;
    let in_use = plane.images_in_use().await?;
    Ok(obsolete
        .into_iter()
        .filter(|image| !in_use.contains(&image.id))
        .collect())
}

/// Outcome of a rotation pass.
#[derive(Debug, Default)]
pub struct Rotation {
    /// Unused obsolete images found.
    pub candidates: Vec<Image>,
    /// Identifiers of the candidates that were deleted.
    pub removed: Vec<String>,
    /// Candidates whose deletion failed.
    pub failed: Vec<(String, ControlPlaneError)>,
}

/// Deletes unused obsolete images, or only lists them when `dry_run` is set.
/// A failed deletion is recorded and the pass continues.
///
/// # Errors
///
/// Returns a [`ControlPlaneError`] when the candidates cannot be listed.
pub async fn rotate<C: ControlPlane>(
    plane: &C,
    name: Option<&str>,
    dry_run: bool,
) -> Result<Rotation, ControlPlaneError> {
    let mut rotation = Rotation {
        candidates: unused_obsolete_images(plane, name).await?,
        ..Rotation::default()
    };
    if dry_run {
        info!(count = rotation.candidates.len(), "dry run, nothing removed");
        return Ok(rotation);
    }
    for candidate in &rotation.candidates {
        match plane.delete_image(&candidate.id).await {
            Ok(()) => {
                info!(image_id = %candidate.id, name = %candidate.name, "removed obsolete image");
                rotation.removed.push(candidate.id.clone());
            }
            Err(err) => {
                warn!(image_id = %candidate.id, error = %err, "failed to remove obsolete image");
                rotation.failed.push((candidate.id.clone(), err));
            }
        }
    }
    Ok(rotation)
}
