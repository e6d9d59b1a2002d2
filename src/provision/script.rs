//! Bootstrap script served to a freshly created host.
//!
//! The script runs steps 1 to 3 and reports each through the signed
//! callback URL; the control plane takes over over SSH once step 3
//! completes.

use std::path::Path;

use tera::{Context, Tera};

use crate::error::{HostwrightError, Result};
use crate::model::Server;

const BOOTSTRAP_TEMPLATE: &str = r#"#!/bin/bash
set -euo pipefail

CALLBACK_URL='{{ callback_url }}'
LOG_FILE="/var/log/hostwright-provision.log"
CURRENT_STEP=1

log() {
  echo "[$(date '+%H:%M:%S')] $1" | tee -a "$LOG_FILE"
}

report() {
  curl -fsS -X POST --retry 5 --retry-delay 3 \
    --data "step=$1&status=$2" "$CALLBACK_URL" > /dev/null || log "Could not report step $1 ($2)"
}

trap 'report "$CURRENT_STEP" failed' ERR

if [ "$(id -u)" -ne 0 ]; then
  echo "This script must run as root." >&2
  exit 1
fi

###################
# Step 1: connection
###################
log "Connecting {{ server_name }} to the control plane"
report 1 completed

###################
# Step 2: system
###################
CURRENT_STEP=2
report 2 installing
export DEBIAN_FRONTEND=noninteractive

log "Updating packages"
apt-get -o DPkg::Lock::Timeout=120 update -y
apt-get -o DPkg::Lock::Timeout=120 install -y {{ packages }}

if ! swapon --show | grep -q .; then
  log "Creating {{ swap_mb }}M swap file"
  fallocate -l {{ swap_mb }}M /swapfile
  chmod 600 /swapfile
  mkswap /swapfile
  swapon /swapfile
  echo '/swapfile none swap sw 0 0' >> /etc/fstab
fi

timedatectl set-timezone UTC || ln -sf /usr/share/zoneinfo/UTC /etc/localtime
echo 'root:{{ root_password }}' | chpasswd

if ! id -u {{ sites_user }} > /dev/null 2>&1; then
  log "Creating user {{ sites_user }}"
  useradd --create-home --shell /bin/bash {{ sites_user }}
  usermod -aG www-data {{ sites_user }}
fi
report 2 completed

###################
# Step 3: control plane key
###################
CURRENT_STEP=3
report 3 installing

authorize() {
  local home="$1" owner="$2"
  mkdir -p "$home/.ssh"
  touch "$home/.ssh/authorized_keys"
  if ! grep -qF '{{ public_key }}' "$home/.ssh/authorized_keys"; then
    echo '{{ public_key }}' >> "$home/.ssh/authorized_keys"
  fi
  chmod 700 "$home/.ssh"
  chmod 600 "$home/.ssh/authorized_keys"
  chown -R "$owner:$owner" "$home/.ssh"
}

authorize /root root
authorize /home/{{ sites_user }} {{ sites_user }}
report 3 completed

log "Bootstrap finished; the control plane continues over SSH"
"#;

const BASE_PACKAGES: &[&str] = &[
    "acl",
    "ca-certificates",
    "cron",
    "curl",
    "git",
    "gnupg",
    "software-properties-common",
    "supervisor",
    "ufw",
    "unzip",
    "zip",
];

const SWAP_MB: u32 = 1024;

/// Values substituted into the bootstrap script.
#[derive(Debug)]
pub struct ScriptInput<'a> {
    pub server: &'a Server,
    pub callback_url: &'a str,
    /// Control plane public key authorized on the host.
    pub public_key: &'a str,
    pub sites_user: &'a str,
}

pub fn render_bootstrap_script(input: &ScriptInput<'_>) -> Result<String> {
    let mut tera = Tera::default();
    tera.add_raw_template("bootstrap.sh", BOOTSTRAP_TEMPLATE)?;

    let mut context = Context::new();
    context.insert("server_name", &input.server.name);
    context.insert("callback_url", input.callback_url);
    context.insert("root_password", &input.server.root_password);
    context.insert("public_key", input.public_key.trim());
    context.insert("sites_user", input.sites_user);
    context.insert("packages", &BASE_PACKAGES.join(" "));
    context.insert("swap_mb", &SWAP_MB);

    Ok(tera.render("bootstrap.sh", &context)?)
}

/// Reads the public half of the control plane key (`<key>.pub`).
pub fn read_public_key(private_key_path: &Path) -> Result<String> {
    let mut public_key_path = private_key_path.as_os_str().to_owned();
    public_key_path.push(".pub");

    let key = std::fs::read_to_string(&public_key_path).map_err(|e| {
        HostwrightError::Config(format!(
            "Failed to read SSH public key '{}': {}. Make sure the key exists.",
            Path::new(&public_key_path).display(),
            e
        ))
    })?;
    let key = key.trim();
    if key.contains('\'') || key.contains('\n') {
        return Err(HostwrightError::Config(format!(
            "SSH public key '{}' is not a single-line key.",
            Path::new(&public_key_path).display()
        )));
    }
    Ok(key.to_string())
}
