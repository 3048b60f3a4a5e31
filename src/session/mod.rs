//! Provisioning and cleanup of one disposable test environment.
//!
//! A [`ProvisioningSession`] walks the keypair, image, instance, network and
//! SSH steps in order, each under its own [`Deadline`]. Any failure runs
//! [`ProvisioningSession::cleanup`] before the error is returned. Cleanup
//! runs at most once, removes the instance, the keypair and the image in that
//! order, and never deletes a resource the caller supplied unless told to.
//!
//! A resource is tracked as soon as the control plane may have created it:
//! the keypair by name before it is requested, the image once its record
//! exists and before its data is sent. An instance whose boot request never
//! answered is looked up by name during cleanup.

mod error;
mod network;
mod plan;
mod resources;
mod ssh;
mod timeouts;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

pub use error::{FlavorError, ProvisionError};
pub use network::select_primary_ip;
pub use plan::{
    FlavorSpec, ImageSource, NAME_PREFIX, SessionPlan, image_upload, published_name,
    published_upload, resource_name,
};
pub(crate) use plan::{check_glance, ssh_settings};
pub use resources::{ResourceKind, ResourceStatus};
pub use ssh::{DEFAULT_SSH_PORT, SshAccess, SshSettings};
pub use timeouts::{
    DEFAULT_ACTIVE_TIMEOUT, DEFAULT_CLEANUP_TIMEOUT, DEFAULT_CREATE_TIMEOUT,
    DEFAULT_KEYPAIR_TIMEOUT, DEFAULT_UPLOAD_TIMEOUT, SessionTimeouts,
};

use resources::TrackedResource;

use crate::control_plane::{
    BootRequest, ControlPlane, ControlPlaneError, Flavor, Image, ImageUpload, Instance,
    InstanceStatus, Interface,
};
use crate::deadline::{Deadline, DeadlineError};

/// Interval between instance status polls.
pub const ACTIVE_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Progress of a session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// Nothing has been created yet.
    Init,
    /// The keypair exists.
    KeypairReady,
    /// The image is uploaded or found.
    ImageReady,
    /// The instance has been requested.
    InstanceBooting,
    /// The instance reported `ACTIVE`.
    InstanceActive,
    /// The primary IP is known.
    NetworkResolved,
    /// SSH parameters are prepared (or SSH is not configured).
    SshReady,
    /// Every provisioning step succeeded.
    Ready,
    /// A provisioning step failed.
    Failed,
    /// Cleanup has run.
    CleanedUp,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "INIT",
            Self::KeypairReady => "KEYPAIR_READY",
            Self::ImageReady => "IMAGE_READY",
            Self::InstanceBooting => "INSTANCE_BOOTING",
            Self::InstanceActive => "INSTANCE_ACTIVE",
            Self::NetworkResolved => "NETWORK_RESOLVED",
            Self::SshReady => "SSH_READY",
            Self::Ready => "READY",
            Self::Failed => "FAILED",
            Self::CleanedUp => "CLEANED_UP",
        })
    }
}

/// One provisioning run against a control plane.
pub struct ProvisioningSession<C: ControlPlane> {
    plane: C,
    plan: SessionPlan,
    state: SessionState,
    poll_interval: Duration,
    keypair: Option<TrackedResource>,
    private_key: Option<Zeroizing<String>>,
    image: Option<TrackedResource>,
    instance: Option<TrackedResource>,
    instance_view: Option<Instance>,
    flavor: Option<Flavor>,
    interfaces: Vec<Interface>,
    main_ip: Option<String>,
    ssh: Option<SshAccess>,
    kept_key_file: Option<PathBuf>,
    keep_image: bool,
    keep_instance: bool,
    delete_existing_image: bool,
    instance_requested: bool,
    cleanup_started: bool,
}

impl<C: ControlPlane> fmt::Debug for ProvisioningSession<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningSession")
            .field("name", &self.plan.name)
            .field("state", &self.state)
            .field("keypair", &self.keypair)
            .field("image", &self.image)
            .field("instance", &self.instance)
            .field("main_ip", &self.main_ip)
            .finish_non_exhaustive()
    }
}

impl<C: ControlPlane> ProvisioningSession<C> {
    /// Creates a session that has not touched the control plane yet.
    #[must_use]
    pub fn new(plane: C, plan: SessionPlan) -> Self {
        Self {
            plane,
            plan,
            state: SessionState::Init,
            poll_interval: ACTIVE_POLL_INTERVAL,
            keypair: None,
            private_key: None,
            image: None,
            instance: None,
            instance_view: None,
            flavor: None,
            interfaces: Vec::new(),
            main_ip: None,
            ssh: None,
            kept_key_file: None,
            keep_image: false,
            keep_instance: false,
            delete_existing_image: false,
            instance_requested: false,
            cleanup_started: false,
        }
    }

    /// Overrides the status poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Lets cleanup delete a caller-supplied image when `allow` is set.
    /// Otherwise a pre-existing image is never removed.
    #[must_use]
    pub fn delete_existing_image(mut self, allow: bool) -> Self {
        self.delete_existing_image = allow;
        self
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Inputs the session runs with.
    #[must_use]
    pub const fn plan(&self) -> &SessionPlan {
        &self.plan
    }

    /// Provisions the environment.
    ///
    /// On failure cleanup has already run when this returns.
    ///
    /// # Errors
    ///
    /// Returns the [`ProvisionError`] of the first failing step.
    pub async fn prepare(&mut self) -> Result<(), ProvisionError> {
        match self.provision().await {
            Ok(()) => {
                self.state = SessionState::Ready;
                info!(name = %self.plan.name, "environment ready");
                Ok(())
            }
            Err(err) => {
                error!(state = %self.state, error = %err, "provisioning failed, cleaning up");
                self.state = SessionState::Failed;
                self.cleanup().await;
                Err(err)
            }
        }
    }

    async fn provision(&mut self) -> Result<(), ProvisionError> {
        self.create_keypair().await?;
        self.state = SessionState::KeypairReady;
        self.prepare_image().await?;
        self.state = SessionState::ImageReady;
        self.boot_instance().await?;
        self.state = SessionState::InstanceBooting;
        self.wait_for_active().await?;
        self.state = SessionState::InstanceActive;
        self.resolve_network().await?;
        self.state = SessionState::NetworkResolved;
        self.prepare_ssh();
        self.state = SessionState::SshReady;
        Ok(())
    }

    async fn create_keypair(&mut self) -> Result<(), ProvisionError> {
        let limit = self.plan.timeouts.keypair;
        info!(name = %self.plan.name, timeout_secs = limit.as_secs(), "creating keypair");
        let mut tracked =
            TrackedResource::created(ResourceKind::Keypair, &self.plan.name, &self.plan.name);
        if self.keep_instance {
            tracked.keep();
        }
        self.keypair = Some(tracked);

        let keypair = Deadline::new("create keypair", limit)
            .run(self.plane.create_keypair(&self.plan.name))
            .await
            .map_err(|err| ProvisionError::from_deadline(err, Some(self.plan.name.as_str())))?;
        self.private_key = Some(keypair.private_key);
        Ok(())
    }

    async fn prepare_image(&mut self) -> Result<(), ProvisionError> {
        let limit = self.plan.timeouts.upload;
        match &self.plan.image {
            ImageSource::Existing(id) => {
                info!(image_id = %id, timeout_secs = limit.as_secs(), "looking up existing image");
                let image = Deadline::new("find image", limit)
                    .run(self.plane.get_image(id))
                    .await
                    .map_err(|err| ProvisionError::from_deadline(err, Some(id.as_str())))?;
                info!(image_id = %image.id, name = %image.name, "found image");
                let mut tracked = TrackedResource::existing(ResourceKind::Image, image.id, image.name);
                if self.delete_existing_image {
                    tracked.allow_delete();
                }
                if self.keep_image {
                    tracked.keep();
                }
                self.image = Some(tracked);
            }
            ImageSource::Upload(upload) => {
                info!(
                    file = %upload.filename,
                    timeout_secs = limit.as_secs(),
                    "uploading image"
                );
                let plane = &self.plane;
                let slot = &mut self.image;
                let keep = self.keep_image;
                let id = Deadline::new("upload image", limit)
                    .run(async move {
                        let image = plane.create_image(upload).await?;
                        debug!(image_id = %image.id, "image record created");
                        let mut tracked =
                            TrackedResource::created(ResourceKind::Image, &image.id, &image.name);
                        if keep {
                            tracked.keep();
                        }
                        *slot = Some(tracked);
                        plane.upload_image_data(&image.id, upload).await?;
                        Ok::<_, ControlPlaneError>(image.id)
                    })
                    .await
                    .map_err(|err| ProvisionError::from_deadline(err, Some(upload.name.as_str())))?;
                info!(image_id = %id, "image uploaded");
            }
        }
        Ok(())
    }

    async fn boot_instance(&mut self) -> Result<(), ProvisionError> {
        let limit = self.plan.timeouts.create;
        let (Some(image), Some(keypair)) = (&self.image, &self.keypair) else {
            return Err(ProvisionError::Aborted {
                step: "create instance",
                message: String::from("image or keypair missing"),
            });
        };
        info!(name = %self.plan.name, timeout_secs = limit.as_secs(), "creating instance");

        let plane = &self.plane;
        let plan = &self.plan;
        let requested = &mut self.instance_requested;
        let image_id = image.id().to_owned();
        let key_name = keypair.id().to_owned();
        let (flavor, instance) = Deadline::new("create instance", limit)
            .run(async move {
                let flavor = resolve_flavor(plane, &plan.flavor).await?;
                let request = BootRequest {
                    name: plan.name.clone(),
                    image_id,
                    flavor_id: flavor.id.clone(),
                    key_name,
                    nics: plan.nics.clone(),
                    config_drive: plan.config_drive,
                    user_data: plan.user_data.clone(),
                    availability_zone: plan.availability_zone.clone(),
                };
                *requested = true;
                let instance = plane.boot_instance(&request).await.map_err(|source| {
                    ProvisionError::ControlPlane {
                        step: "create instance",
                        source,
                    }
                })?;
                Ok::<_, ProvisionError>((flavor, instance))
            })
            .await
            .map_err(|err| ProvisionError::from_nested(err, Some(self.plan.name.as_str())))?;

        info!(instance_id = %instance.id, flavor = %flavor.name, "instance created");
        let mut tracked =
            TrackedResource::created(ResourceKind::Instance, &instance.id, &instance.name);
        if self.keep_instance {
            tracked.keep();
        }
        self.instance = Some(tracked);
        self.flavor = Some(flavor);
        self.instance_view = Some(instance);
        Ok(())
    }

    async fn wait_for_active(&mut self) -> Result<(), ProvisionError> {
        let limit = self.plan.timeouts.active;
        let Some(current) = self.instance_view.clone() else {
            return Err(ProvisionError::Aborted {
                step: "wait for instance",
                message: String::from("instance missing"),
            });
        };
        let id = current.id.clone();
        info!(instance_id = %id, timeout_secs = limit.as_secs(), "waiting for instance to become active");

        let plane = &self.plane;
        let interval = self.poll_interval;
        let active = Deadline::new("wait for instance", limit)
            .run(async move {
                let mut instance = current;
                loop {
                    if instance.status == InstanceStatus::Active {
                        return Ok(instance);
                    }
                    if instance.status.is_terminal_failure() {
                        return Err(ProvisionError::Instance {
                            id: instance.id,
                            status: instance.status.to_string(),
                            fault: instance.fault,
                        });
                    }
                    debug!(instance_id = %instance.id, status = %instance.status, "instance not active yet");
                    sleep(interval).await;
                    instance = plane.get_instance(&instance.id).await.map_err(|source| {
                        ProvisionError::ControlPlane {
                            step: "wait for instance",
                            source,
                        }
                    })?;
                }
            })
            .await
            .map_err(|err| ProvisionError::from_nested(err, Some(id.as_str())))?;

        info!(instance_id = %id, "instance is active");
        self.instance_view = Some(active);
        Ok(())
    }

    async fn resolve_network(&mut self) -> Result<(), ProvisionError> {
        let Some(instance) = &self.instance_view else {
            return Err(ProvisionError::Aborted {
                step: "resolve network",
                message: String::from("instance missing"),
            });
        };
        let ip = select_primary_ip(&instance.networks, self.plan.main_nic_regexp.as_ref())?;
        info!(instance_id = %instance.id, ip = %ip, "resolved primary address");

        let interfaces = Deadline::new("list interfaces", self.plan.timeouts.create)
            .run(self.plane.list_interfaces(&instance.id))
            .await
            .map_err(|err| ProvisionError::from_deadline(err, Some(instance.id.as_str())))?;
        self.interfaces = interfaces;
        self.main_ip = Some(ip);
        Ok(())
    }

    fn prepare_ssh(&mut self) {
        let (Some(settings), Some(ip), Some(key)) =
            (&self.plan.ssh, &self.main_ip, &self.private_key)
        else {
            debug!("no ssh section configured, ssh-based tests are skipped");
            return;
        };
        self.ssh = Some(SshAccess::new(ip.clone(), settings, key.clone()));
    }

    /// Keeps the image when cleanup runs. Ignored once cleanup has started.
    pub fn keep_failed_image(&mut self) {
        if self.cleanup_started {
            warn!("cleanup already started, image deletion can no longer change");
            return;
        }
        self.keep_image = true;
        if let Some(image) = self.image.as_mut() {
            image.keep();
        }
    }

    /// Keeps the instance and its keypair when cleanup runs. Ignored once
    /// cleanup has started.
    pub fn keep_failed_instance(&mut self) {
        if self.cleanup_started {
            warn!("cleanup already started, instance deletion can no longer change");
            return;
        }
        self.keep_instance = true;
        for resource in [self.instance.as_mut(), self.keypair.as_mut()]
            .into_iter()
            .flatten()
        {
            resource.keep();
        }
    }

    /// Removes every deletable resource: instance, then keypair and key
    /// material, then image. Runs at most once; each step is best-effort.
    pub async fn cleanup(&mut self) {
        if self.cleanup_started {
            debug!("cleanup already ran");
            return;
        }
        self.cleanup_started = true;
        info!("clearing up");
        self.cleanup_instance().await;
        self.cleanup_keypair().await;
        self.cleanup_image().await;
        self.state = SessionState::CleanedUp;
        info!("clearing done");
    }

    /// Returns `true` once cleanup has started.
    #[must_use]
    pub const fn cleanup_started(&self) -> bool {
        self.cleanup_started
    }

    async fn cleanup_instance(&mut self) {
        let limit = self.plan.timeouts.cleanup;
        if self.instance.is_none() && self.instance_requested {
            self.adopt_unanswered_instance().await;
        }
        let Some(instance) = self.instance.as_mut() else {
            return;
        };
        if !instance.deletable() {
            info!(instance_id = %instance.id(), "not removing instance");
            return;
        }
        info!(instance_id = %instance.id(), "removing instance");
        let result = Deadline::new("delete instance", limit)
            .run(self.plane.delete_instance(instance.id()))
            .await;
        record_removal(instance, result);
    }

    /// Finds an instance whose boot request never answered, so cleanup can
    /// remove it like any other.
    async fn adopt_unanswered_instance(&mut self) {
        let name = &self.plan.name;
        info!(name = %name, "instance request did not complete, looking it up by name");
        let found = Deadline::new("find instance", self.plan.timeouts.cleanup)
            .run(self.plane.find_instances_by_name(name))
            .await;
        match found {
            Ok(instances) => {
                let mut matches = instances.into_iter();
                let Some(instance) = matches.next() else {
                    debug!(name = %name, "no instance was created");
                    return;
                };
                if matches.next().is_some() {
                    warn!(name = %name, "several instances share the session name, removing the first");
                }
                let mut tracked =
                    TrackedResource::created(ResourceKind::Instance, &instance.id, &instance.name);
                if self.keep_instance {
                    tracked.keep();
                }
                self.instance = Some(tracked);
            }
            Err(err) => warn!(name = %name, error = %err, "failed to look up instance by name"),
        }
    }

    async fn cleanup_keypair(&mut self) {
        let limit = self.plan.timeouts.cleanup;
        let Some(keypair) = self.keypair.as_mut() else {
            return;
        };
        if keypair.deletable() {
            info!(keypair = %keypair.id(), "removing keypair");
            let result = Deadline::new("delete keypair", limit)
                .run(self.plane.delete_keypair(keypair.id()))
                .await;
            record_removal(keypair, result);
            self.ssh = None;
            self.private_key = None;
            return;
        }

        info!(keypair = %keypair.id(), "not removing keypair");
        if let Some(ssh) = self.ssh.as_mut() {
            match ssh.keep_key_file() {
                Ok(path) => {
                    info!(path = %path.display(), "ssh private key kept");
                    self.kept_key_file = Some(path);
                }
                Err(err) => warn!(error = %err, "failed to keep ssh private key"),
            }
        }
    }

    async fn cleanup_image(&mut self) {
        let limit = self.plan.timeouts.cleanup;
        let Some(image) = self.image.as_mut() else {
            return;
        };
        if !image.deletable() {
            info!(image_id = %image.id(), "not removing image");
            return;
        }
        info!(image_id = %image.id(), "removing image");
        let result = Deadline::new("delete image", limit)
            .run(self.plane.delete_image(image.id()))
            .await;
        record_removal(image, result);
    }

    /// Status of the keypair, once created.
    #[must_use]
    pub fn keypair_status(&self) -> Option<ResourceStatus> {
        self.keypair.as_ref().map(TrackedResource::status)
    }

    /// Status of the image, once uploaded or found.
    #[must_use]
    pub fn image_status(&self) -> Option<ResourceStatus> {
        self.image.as_ref().map(TrackedResource::status)
    }

    /// Status of the instance, once requested.
    #[must_use]
    pub fn instance_status(&self) -> Option<ResourceStatus> {
        self.instance.as_ref().map(TrackedResource::status)
    }

    /// Status of every tracked resource in cleanup order.
    #[must_use]
    pub fn resources(&self) -> Vec<ResourceStatus> {
        [&self.instance, &self.keypair, &self.image]
            .into_iter()
            .flatten()
            .map(TrackedResource::status)
            .collect()
    }

    /// Latest view of the instance.
    #[must_use]
    pub const fn instance(&self) -> Option<&Instance> {
        self.instance_view.as_ref()
    }

    /// Resolved flavor.
    #[must_use]
    pub const fn flavor(&self) -> Option<&Flavor> {
        self.flavor.as_ref()
    }

    /// Interfaces attached to the instance.
    #[must_use]
    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    /// Primary IP address.
    #[must_use]
    pub fn main_ip(&self) -> Option<&str> {
        self.main_ip.as_deref()
    }

    /// SSH access, when the image declares an SSH section.
    pub fn ssh(&mut self) -> Option<&mut SshAccess> {
        self.ssh.as_mut()
    }

    /// Path of the private key file kept for a retained instance.
    #[must_use]
    pub fn kept_key_file(&self) -> Option<&std::path::Path> {
        self.kept_key_file.as_deref()
    }

    /// Facts about the environment exported to test adapters, keyed without
    /// prefix.
    #[must_use]
    pub fn env_config(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let Some(instance) = &self.instance_view {
            env.insert(String::from("instance_uuid"), instance.id.clone());
            env.insert(String::from("instance_name"), instance.name.to_lowercase());
            for (index, ip) in instance.ips().into_iter().enumerate() {
                env.insert(format!("ip_{}", index + 1), ip.to_owned());
            }
        }
        if let Some(ip) = &self.main_ip {
            env.insert(String::from("main_ip"), ip.clone());
        }
        if let Some(flavor) = &self.flavor {
            env.insert(String::from("flavor_id"), flavor.id.clone());
            env.insert(String::from("flavor_name"), flavor.name.clone());
            env.insert(String::from("flavor_ram"), flavor.ram.to_string());
            env.insert(String::from("flavor_vcpus"), flavor.vcpus.to_string());
            env.insert(String::from("flavor_disk"), flavor.disk.to_string());
            for (key, value) in &flavor.extra_specs {
                env.insert(format!("flavor_meta_{key}"), value.clone());
            }
        }
        for (index, interface) in self.interfaces.iter().enumerate() {
            env.insert(
                format!("iface_{}_info", index + 1),
                serde_json::to_string(interface).unwrap_or_default(),
            );
        }
        env
    }
}

impl<C: ControlPlane> Drop for ProvisioningSession<C> {
    fn drop(&mut self) {
        if !self.cleanup_started && !self.resources().is_empty() {
            warn!(name = %self.plan.name, "session dropped without cleanup, resources may be left behind");
        }
    }
}

/// Uploads an image that outlives the run; the image is the product.
///
/// Only an incomplete upload is removed: when sending the data fails or
/// outlasts `limit`, the created record is deleted under `cleanup_limit`.
///
/// # Errors
///
/// Returns [`ProvisionError::DeadlineExceeded`] when the upload outlasts
/// `limit` and [`ProvisionError::ControlPlane`] when the service rejects it.
pub async fn publish_image<C: ControlPlane>(
    plane: &C,
    upload: &ImageUpload,
    limit: Duration,
    cleanup_limit: Duration,
) -> Result<Image, ProvisionError> {
    info!(
        name = %upload.name,
        file = %upload.filename,
        timeout_secs = limit.as_secs(),
        "uploading image"
    );
    let mut created: Option<Image> = None;
    let slot = &mut created;
    let outcome = Deadline::new("upload image", limit)
        .run(async move {
            let image = plane.create_image(upload).await?;
            *slot = Some(image.clone());
            plane.upload_image_data(&image.id, upload).await?;
            Ok::<_, ControlPlaneError>(image)
        })
        .await;

    match outcome {
        Ok(image) => {
            info!(image_id = %image.id, name = %image.name, "image uploaded");
            Ok(image)
        }
        Err(err) => {
            if let Some(partial) = created {
                warn!(image_id = %partial.id, "upload incomplete, removing image");
                let removal = Deadline::new("delete image", cleanup_limit)
                    .run(plane.delete_image(&partial.id))
                    .await;
                if let Err(cleanup) = removal {
                    warn!(image_id = %partial.id, error = %cleanup, "failed to remove partially uploaded image");
                }
            }
            Err(ProvisionError::from_deadline(err, Some(upload.name.as_str())))
        }
    }
}

async fn resolve_flavor<C: ControlPlane>(
    plane: &C,
    spec: &FlavorSpec,
) -> Result<Flavor, ProvisionError> {
    let lookup_failed = |source: ControlPlaneError| ProvisionError::ControlPlane {
        step: "resolve flavor",
        source,
    };
    match spec {
        FlavorSpec::Id(id) => plane
            .find_flavor_by_id(id)
            .await
            .map_err(lookup_failed)?
            .ok_or_else(|| FlavorError::NotFound(id.clone()).into()),
        FlavorSpec::Name(name) => {
            if let Some(flavor) = plane.find_flavor_by_id(name).await.map_err(lookup_failed)? {
                return Ok(flavor);
            }
            let mut matches = plane.find_flavor_by_name(name).await.map_err(lookup_failed)?;
            match matches.len() {
                0 => Err(FlavorError::NotFound(name.clone()).into()),
                1 => Ok(matches.remove(0)),
                count => Err(FlavorError::Ambiguous {
                    name: name.clone(),
                    count,
                }
                .into()),
            }
        }
    }
}

fn record_removal(resource: &mut TrackedResource, result: Result<(), DeadlineError<ControlPlaneError>>) {
    match result {
        Ok(()) => resource.mark_removed(),
        Err(DeadlineError::Failed { source, .. }) if source.is_not_found() => {
            debug!(kind = %resource.kind(), id = %resource.id(), "already gone");
            resource.mark_removed();
        }
        Err(err) => warn!(
            kind = %resource.kind(),
            id = %resource.id(),
            error = %err,
            "error while clearing up"
        ),
    }
}

#[cfg(test)]
mod tests;
