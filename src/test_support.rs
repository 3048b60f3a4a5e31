//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use crate::control_plane::{
    BootRequest, ControlPlane, ControlPlaneError, Flavor, Image, ImageQuery, ImageUpload, Instance,
    InstanceStatus, Interface, Keypair, PlaneFuture,
};
use crate::process::{CommandError, CommandOutput, CommandRunner};

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic adapter outcomes without spawning processes.
/// Once the queue is empty every further call succeeds.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Extra environment passed to the program.
    pub env: BTreeMap<String, String>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_exit_code(0);
    }

    /// Pushes a specific exit code.
    pub fn push_exit_code(&self, code: i32) {
        lock(&self.responses).push_back(CommandOutput { code: Some(code) });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        env: &BTreeMap<String, String>,
        _cancel: &CancellationToken,
    ) -> Result<CommandOutput, CommandError> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
            env: env.clone(),
        });
        Ok(lock(&self.responses)
            .pop_front()
            .unwrap_or(CommandOutput { code: Some(0) }))
    }
}

/// Control-plane call recorded by [`ScriptedControlPlane`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PlaneCall {
    /// `create_keypair(name)`.
    CreateKeypair(String),
    /// `delete_keypair(name)`.
    DeleteKeypair(String),
    /// `create_image(name)`.
    CreateImage(String),
    /// `upload_image_data(id)`.
    UploadImageData(String),
    /// `get_image(id)`.
    GetImage(String),
    /// `delete_image(id)`.
    DeleteImage(String),
    /// `list_images(query)`.
    ListImages(ImageQuery),
    /// `mark_image_obsolete(id, name)`.
    MarkImageObsolete(String, String),
    /// `boot_instance(request)`.
    BootInstance(BootRequest),
    /// `get_instance(id)`.
    GetInstance(String),
    /// `delete_instance(id)`.
    DeleteInstance(String),
    /// `find_instances_by_name(name)`.
    FindInstancesByName(String),
    /// `images_in_use()`.
    ImagesInUse,
    /// `find_flavor_by_id(id)`.
    FindFlavorById(String),
    /// `find_flavor_by_name(name)`.
    FindFlavorByName(String),
    /// `list_interfaces(instance_id)`.
    ListInterfaces(String),
}

impl PlaneCall {
    /// Short operation name, used to match injected failures.
    #[must_use]
    pub const fn operation(&self) -> &'static str {
        match self {
            Self::CreateKeypair(_) => "create_keypair",
            Self::DeleteKeypair(_) => "delete_keypair",
            Self::CreateImage(_) => "create_image",
            Self::UploadImageData(_) => "upload_image_data",
            Self::GetImage(_) => "get_image",
            Self::DeleteImage(_) => "delete_image",
            Self::ListImages(_) => "list_images",
            Self::MarkImageObsolete(..) => "mark_image_obsolete",
            Self::BootInstance(_) => "boot_instance",
            Self::GetInstance(_) => "get_instance",
            Self::DeleteInstance(_) => "delete_instance",
            Self::FindInstancesByName(_) => "find_instances_by_name",
            Self::ImagesInUse => "images_in_use",
            Self::FindFlavorById(_) => "find_flavor_by_id",
            Self::FindFlavorByName(_) => "find_flavor_by_name",
            Self::ListInterfaces(_) => "list_interfaces",
        }
    }
}

/// Identifier given to uploaded images.
pub const UPLOADED_IMAGE_ID: &str = "image-uploaded";
/// Identifier given to booted instances.
pub const INSTANCE_ID: &str = "instance-1";

#[derive(Debug, Default)]
struct PlaneScript {
    calls: Vec<PlaneCall>,
    failures: BTreeMap<&'static str, ControlPlaneError>,
    hangs: BTreeSet<&'static str>,
    statuses: VecDeque<InstanceStatus>,
    fault: Option<String>,
    images: BTreeMap<String, Image>,
    in_use: BTreeSet<String>,
    booted: Option<Instance>,
    flavors: Vec<Flavor>,
    networks: BTreeMap<String, Vec<String>>,
    interfaces: Vec<Interface>,
}

/// In-memory control plane that records every call.
///
/// Booted instances start as `BUILDING`; each `get_instance` pops the next
/// scripted status, repeating the last one once the script is exhausted.
/// A scripted hang or failure is applied after the call's effect, so a hung
/// `boot_instance` still leaves an instance behind, as a slow provider would.
/// Clones share state, so a test can keep a handle after moving one into a
/// session.
#[derive(Clone, Debug, Default)]
pub struct ScriptedControlPlane {
    script: Arc<Mutex<PlaneScript>>,
}

impl ScriptedControlPlane {
    /// A control plane with one `m1.small` flavor and one `public` network.
    #[must_use]
    pub fn new() -> Self {
        let plane = Self::default();
        plane.add_flavor(Flavor {
            id: String::from("flavor-1"),
            name: String::from("m1.small"),
            ram: 2048,
            vcpus: 1,
            disk: 20,
            extra_specs: BTreeMap::from([(String::from("hw:cpu_policy"), String::from("shared"))]),
        });
        plane.set_networks(&[("public", &["192.0.2.10"])]);
        plane.set_statuses(&[InstanceStatus::Active]);
        plane
    }

    /// Registers an existing image.
    pub fn add_image(&self, id: &str, name: &str) {
        self.insert_image(id, name, false);
    }

    /// Registers an existing image already flagged obsolete.
    pub fn add_obsolete_image(&self, id: &str, name: &str) {
        self.insert_image(id, name, true);
    }

    fn insert_image(&self, id: &str, name: &str, obsolete: bool) {
        lock(&self.script).images.insert(
            id.to_owned(),
            Image {
                id: id.to_owned(),
                name: name.to_owned(),
                status: String::from("active"),
                obsolete,
            },
        );
    }

    /// Returns the images currently registered, keyed by identifier.
    #[must_use]
    pub fn images(&self) -> BTreeMap<String, Image> {
        lock(&self.script).images.clone()
    }

    /// Declares the images some instance boots from.
    pub fn set_images_in_use(&self, ids: &[&str]) {
        lock(&self.script).in_use = ids.iter().map(|id| (*id).to_owned()).collect();
    }

    /// Registers a flavor.
    pub fn add_flavor(&self, flavor: Flavor) {
        lock(&self.script).flavors.push(flavor);
    }

    /// Replaces the networks reported for booted instances.
    pub fn set_networks(&self, networks: &[(&str, &[&str])]) {
        lock(&self.script).networks = networks
            .iter()
            .map(|(name, addresses)| {
                (
                    (*name).to_owned(),
                    addresses.iter().map(|address| (*address).to_owned()).collect(),
                )
            })
            .collect();
    }

    /// Sets the interfaces reported for booted instances.
    pub fn set_interfaces(&self, interfaces: Vec<Interface>) {
        lock(&self.script).interfaces = interfaces;
    }

    /// Scripts the statuses returned by successive `get_instance` calls.
    pub fn set_statuses(&self, statuses: &[InstanceStatus]) {
        lock(&self.script).statuses = statuses.iter().cloned().collect();
    }

    /// Fault message reported alongside failed statuses.
    pub fn set_fault(&self, fault: &str) {
        lock(&self.script).fault = Some(fault.to_owned());
    }

    /// Makes every call to `operation` fail with `error`.
    pub fn fail(&self, operation: &'static str, error: ControlPlaneError) {
        lock(&self.script).failures.insert(operation, error);
    }

    /// Makes every call to `operation` hang until cancelled.
    pub fn hang(&self, operation: &'static str) {
        lock(&self.script).hangs.insert(operation);
    }

    /// Returns every call recorded so far.
    #[must_use]
    pub fn calls(&self) -> Vec<PlaneCall> {
        lock(&self.script).calls.clone()
    }

    /// Counts recorded calls to `operation`.
    #[must_use]
    pub fn count(&self, operation: &str) -> usize {
        lock(&self.script)
            .calls
            .iter()
            .filter(|call| call.operation() == operation)
            .count()
    }

    /// Operation names in call order, for ordering assertions.
    #[must_use]
    pub fn operations(&self) -> Vec<&'static str> {
        lock(&self.script)
            .calls
            .iter()
            .map(PlaneCall::operation)
            .collect()
    }

    fn record<'a, T, F>(&'a self, call: PlaneCall, respond: F) -> PlaneFuture<'a, T>
    where
        T: Send + 'a,
        F: FnOnce(&mut PlaneScript) -> Result<T, ControlPlaneError> + Send + 'a,
    {
        Box::pin(async move {
            let operation = call.operation();
            let (hang, outcome) = {
                let mut script = lock(&self.script);
                script.calls.push(call);
                let hang = script.hangs.contains(operation);
                let outcome = match script.failures.get(operation).cloned() {
                    Some(error) => Err(error),
                    None => respond(&mut *script),
                };
                (hang, outcome)
            };
            if hang {
                std::future::pending::<()>().await;
            }
            outcome
        })
    }

    fn instance_view(script: &PlaneScript, status: InstanceStatus) -> Instance {
        let failed = status.is_terminal_failure();
        Instance {
            id: String::from(INSTANCE_ID),
            name: String::from("VETTER-instance"),
            status,
            fault: if failed { script.fault.clone() } else { None },
            image_id: None,
            networks: script.networks.clone(),
        }
    }
}

impl ControlPlane for ScriptedControlPlane {
    fn create_keypair<'a>(&'a self, name: &'a str) -> PlaneFuture<'a, Keypair> {
        self.record(PlaneCall::CreateKeypair(name.to_owned()), move |_| {
            Ok(Keypair {
                name: name.to_owned(),
                private_key: Zeroizing::new(String::from("-----BEGIN TEST KEY-----")),
            })
        })
    }

    fn delete_keypair<'a>(&'a self, name: &'a str) -> PlaneFuture<'a, ()> {
        self.record(PlaneCall::DeleteKeypair(name.to_owned()), |_| Ok(()))
    }

    fn create_image<'a>(&'a self, request: &'a ImageUpload) -> PlaneFuture<'a, Image> {
        self.record(PlaneCall::CreateImage(request.name.clone()), move |script| {
            let image = Image {
                id: String::from(UPLOADED_IMAGE_ID),
                name: request.name.clone(),
                status: String::from("queued"),
                obsolete: false,
            };
            script.images.insert(image.id.clone(), image.clone());
            Ok(image)
        })
    }

    fn upload_image_data<'a>(
        &'a self,
        id: &'a str,
        _request: &'a ImageUpload,
    ) -> PlaneFuture<'a, ()> {
        self.record(PlaneCall::UploadImageData(id.to_owned()), move |script| {
            let image = script
                .images
                .get_mut(id)
                .ok_or_else(|| ControlPlaneError::NotFound {
                    resource: "image",
                    id: id.to_owned(),
                })?;
            image.status = String::from("active");
            Ok(())
        })
    }

    fn get_image<'a>(&'a self, id: &'a str) -> PlaneFuture<'a, Image> {
        self.record(PlaneCall::GetImage(id.to_owned()), move |script| {
            script
                .images
                .get(id)
                .cloned()
                .ok_or_else(|| ControlPlaneError::NotFound {
                    resource: "image",
                    id: id.to_owned(),
                })
        })
    }

    fn delete_image<'a>(&'a self, id: &'a str) -> PlaneFuture<'a, ()> {
        self.record(PlaneCall::DeleteImage(id.to_owned()), move |script| {
            script.images.remove(id);
            Ok(())
        })
    }

    fn list_images<'a>(&'a self, query: &'a ImageQuery) -> PlaneFuture<'a, Vec<Image>> {
        self.record(PlaneCall::ListImages(query.clone()), move |script| {
            Ok(script
                .images
                .values()
                .filter(|image| query.matches(image))
                .cloned()
                .collect())
        })
    }

    fn mark_image_obsolete<'a>(&'a self, id: &'a str, name: &'a str) -> PlaneFuture<'a, Image> {
        self.record(
            PlaneCall::MarkImageObsolete(id.to_owned(), name.to_owned()),
            move |script| {
                let image = script
                    .images
                    .get_mut(id)
                    .ok_or_else(|| ControlPlaneError::NotFound {
                        resource: "image",
                        id: id.to_owned(),
                    })?;
                name.clone_into(&mut image.name);
                image.obsolete = true;
                Ok(image.clone())
            },
        )
    }

    fn boot_instance<'a>(&'a self, request: &'a BootRequest) -> PlaneFuture<'a, Instance> {
        self.record(PlaneCall::BootInstance(request.clone()), move |script| {
            let mut instance = Self::instance_view(script, InstanceStatus::Building);
            request.name.clone_into(&mut instance.name);
            script.booted = Some(instance.clone());
            Ok(instance)
        })
    }

    fn get_instance<'a>(&'a self, id: &'a str) -> PlaneFuture<'a, Instance> {
        self.record(PlaneCall::GetInstance(id.to_owned()), |script| {
            let next = if script.statuses.len() > 1 {
                script.statuses.pop_front()
            } else {
                script.statuses.front().cloned()
            };
            let status = next.unwrap_or(InstanceStatus::Active);
            Ok(Self::instance_view(script, status))
        })
    }

    fn delete_instance<'a>(&'a self, id: &'a str) -> PlaneFuture<'a, ()> {
        self.record(PlaneCall::DeleteInstance(id.to_owned()), |script| {
            script.booted = None;
            Ok(())
        })
    }

    fn find_instances_by_name<'a>(&'a self, name: &'a str) -> PlaneFuture<'a, Vec<Instance>> {
        self.record(PlaneCall::FindInstancesByName(name.to_owned()), move |script| {
            Ok(script
                .booted
                .iter()
                .filter(|instance| instance.name == name)
                .cloned()
                .collect())
        })
    }

    fn images_in_use(&self) -> PlaneFuture<'_, BTreeSet<String>> {
        self.record(PlaneCall::ImagesInUse, |script| Ok(script.in_use.clone()))
    }

    fn find_flavor_by_id<'a>(&'a self, id: &'a str) -> PlaneFuture<'a, Option<Flavor>> {
        self.record(PlaneCall::FindFlavorById(id.to_owned()), move |script| {
            Ok(script.flavors.iter().find(|flavor| flavor.id == id).cloned())
        })
    }

    fn find_flavor_by_name<'a>(&'a self, name: &'a str) -> PlaneFuture<'a, Vec<Flavor>> {
        self.record(PlaneCall::FindFlavorByName(name.to_owned()), move |script| {
            Ok(script
                .flavors
                .iter()
                .filter(|flavor| flavor.name == name)
                .cloned()
                .collect())
        })
    }

    fn list_interfaces<'a>(&'a self, instance_id: &'a str) -> PlaneFuture<'a, Vec<Interface>> {
        self.record(PlaneCall::ListInterfaces(instance_id.to_owned()), |script| {
            Ok(script.interfaces.clone())
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
