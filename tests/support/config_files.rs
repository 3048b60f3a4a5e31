//! YAML fixtures written into a temporary directory.
//!
//! Integration tests are compiled as separate crates (one per top-level file
//! in `tests/`), so helpers are shared via:
//!
//! ```rust
//! #[path = "support/config_files.rs"]
//! mod config_files;
//! ```

use camino::Utf8PathBuf;
use tempfile::TempDir;

pub const IMAGES_YAML: &str = r"
cirros:
  filename: cirros.qcow2
  glance:
    disk_format: qcow2
    upload_timeout: 120
    properties:
      os_distro: cirros
  tests:
    environment_name: lab
    environment_variables:
      proxy:
        host: proxy.local
      packages: [curl, jq]
    ssh:
      username: cirros
    tests_list:
      - pytest: tests/test_boot.py
        timeout: 60
      - pytest: tests/test_network.py
no-tests:
  filename: plain.qcow2
";

pub const TEST_YAML: &str = r"
lab:
  keystone:
    auth_url: http://127.0.0.1:9/v3
    api_version: 3
    password: secret
    project_name: demo
  nova:
    flavor: m1.small
    nics:
      - net_id: net-1
    active_timeout: 600
";

pub const UPLOAD_YAML: &str = r"
prod:
  keystone:
    auth_url: http://127.0.0.1:9/v3
    api_version: 3
    password: secret
    project_name: demo
  glance:
    upload_timeout: 30
    public: true
";

/// Temporary directory holding `images.yaml`, `test.yaml` and `upload.yaml`.
pub struct ConfigDir {
    dir: TempDir,
}

impl ConfigDir {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        for (name, contents) in [
            ("images.yaml", IMAGES_YAML),
            ("test.yaml", TEST_YAML),
            ("upload.yaml", UPLOAD_YAML),
        ] {
            std::fs::write(dir.path().join(name), contents)
                .unwrap_or_else(|err| panic!("write {name}: {err}"));
        }
        Self { dir }
    }

    pub fn path(&self, name: &str) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(self.dir.path().join(name))
            .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()))
    }
}
