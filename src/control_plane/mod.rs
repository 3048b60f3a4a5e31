//! Control-plane abstraction consumed by the provisioning session.
//!
//! The session only ever talks to the cloud through [`ControlPlane`], so the
//! REST client in [`crate::openstack`] and the scripted double in
//! [`crate::test_support`] are interchangeable.

mod error;
mod types;

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;

pub use error::ControlPlaneError;
pub use types::{
    BootRequest, Flavor, Image, ImageQuery, ImageUpload, Instance, InstanceStatus, Interface,
    Keypair, NicRequest,
};

/// Future returned by control-plane operations.
pub type PlaneFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ControlPlaneError>> + Send + 'a>>;

/// Remote operations needed to provision and tear down a test environment.
pub trait ControlPlane: Send + Sync {
    /// Generates and registers a new keypair called `name`.
    fn create_keypair<'a>(&'a self, name: &'a str) -> PlaneFuture<'a, Keypair>;

    /// Removes the keypair called `name`.
    fn delete_keypair<'a>(&'a self, name: &'a str) -> PlaneFuture<'a, ()>;

    /// Registers a new image record without data.
    fn create_image<'a>(&'a self, request: &'a ImageUpload) -> PlaneFuture<'a, Image>;

    /// Streams the local file named by `request` into the image `id`.
    fn upload_image_data<'a>(&'a self, id: &'a str, request: &'a ImageUpload)
    -> PlaneFuture<'a, ()>;

    /// Fetches an existing image.
    fn get_image<'a>(&'a self, id: &'a str) -> PlaneFuture<'a, Image>;

    /// Deletes an image.
    fn delete_image<'a>(&'a self, id: &'a str) -> PlaneFuture<'a, ()>;

    /// Lists the images that pass `query`.
    fn list_images<'a>(&'a self, query: &'a ImageQuery) -> PlaneFuture<'a, Vec<Image>>;

    /// Renames the image to `name` and flags it obsolete.
    fn mark_image_obsolete<'a>(&'a self, id: &'a str, name: &'a str) -> PlaneFuture<'a, Image>;

    /// Requests a new instance.
    fn boot_instance<'a>(&'a self, request: &'a BootRequest) -> PlaneFuture<'a, Instance>;

    /// Fetches the current view of an instance.
    fn get_instance<'a>(&'a self, id: &'a str) -> PlaneFuture<'a, Instance>;

    /// Deletes an instance.
    fn delete_instance<'a>(&'a self, id: &'a str) -> PlaneFuture<'a, ()>;

    /// Returns the instances called exactly `name`.
    fn find_instances_by_name<'a>(&'a self, name: &'a str) -> PlaneFuture<'a, Vec<Instance>>;

    /// Identifiers of every image some instance, in any project, boots from.
    fn images_in_use(&self) -> PlaneFuture<'_, BTreeSet<String>>;

    /// Looks up a flavor by identifier, returning `None` when absent.
    fn find_flavor_by_id<'a>(&'a self, id: &'a str) -> PlaneFuture<'a, Option<Flavor>>;

    /// Returns every flavor whose name equals `name`.
    fn find_flavor_by_name<'a>(&'a self, name: &'a str) -> PlaneFuture<'a, Vec<Flavor>>;

    /// Lists the interfaces attached to an instance.
    fn list_interfaces<'a>(&'a self, instance_id: &'a str) -> PlaneFuture<'a, Vec<Interface>>;
}
