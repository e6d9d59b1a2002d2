//! PHP and Node.js runtimes.
//!
//! Several versions of each can live side by side on one server. PHP comes
//! from the ondrej PPA as `php<version>`; Node.js is unpacked per major
//! version under `/opt/nodejs/<version>`.

use super::APT;
use crate::error::{HostwrightError, Result};
use crate::model::ResourceSpec;
use crate::transport::RemoteCommand;

const PHP_EXTENSIONS: [&str; 12] = [
    "fpm", "cli", "common", "mysql", "pgsql", "redis", "mbstring", "xml", "curl", "zip", "bcmath",
    "intl",
];

/// Interpreter for one PHP version; never the global `php`.
pub fn php_binary(version: &str) -> String {
    format!("/usr/bin/php{}", version)
}

/// Directory holding `node`, `npm` and `npx` for one Node.js version.
pub fn node_bin_dir(version: &str) -> String {
    format!("/opt/nodejs/{}/bin", version)
}

fn php_packages(version: &str) -> String {
    PHP_EXTENSIONS
        .iter()
        .map(|ext| format!("php{}-{}", version, ext))
        .collect::<Vec<_>>()
        .join(" ")
}

pub(super) fn install_php(version: &str) -> Vec<RemoteCommand> {
    vec![
        RemoteCommand::new(format!(
            "if ! grep -rq 'ondrej/php' /etc/apt/sources.list.d/; then \
             {apt} install -y software-properties-common && add-apt-repository -y ppa:ondrej/php; fi",
            apt = APT
        )),
        RemoteCommand::new(format!(
            "{apt} update -y && {apt} install -y {packages}",
            apt = APT,
            packages = php_packages(version)
        )),
        RemoteCommand::new(format!(
            "systemctl enable php{v}-fpm && systemctl restart php{v}-fpm",
            v = version
        )),
    ]
}

pub(super) fn upgrade_php(version: &str) -> Vec<RemoteCommand> {
    vec![
        RemoteCommand::new(format!(
            "{apt} update -y && {apt} install -y --only-upgrade {packages}",
            apt = APT,
            packages = php_packages(version)
        )),
        RemoteCommand::new(format!("systemctl restart php{}-fpm", version)),
    ]
}

pub(super) fn remove_php(version: &str) -> Vec<RemoteCommand> {
    vec![
        RemoteCommand::best_effort(format!("systemctl stop php{}-fpm", version)),
        RemoteCommand::new(format!(
            "{apt} purge -y 'php{v}-*' && {apt} autoremove -y",
            apt = APT,
            v = version
        )),
    ]
}

pub(super) fn install_node(version: &str) -> Vec<RemoteCommand> {
    let dist = format!("https://nodejs.org/dist/latest-v{}.x", version);
    vec![RemoteCommand::new(format!(
        "ARCH=$(dpkg --print-architecture | sed 's/amd64/x64/')\n\
         ARCHIVE=$(curl -fsSL {dist}/SHASUMS256.txt | awk '{{print $2}}' | grep \"linux-$ARCH.tar.xz$\" | head -n1)\n\
         test -n \"$ARCHIVE\"\n\
         rm -rf /opt/nodejs/{v}.tmp && mkdir -p /opt/nodejs/{v}.tmp\n\
         curl -fsSL \"{dist}/$ARCHIVE\" | tar -xJ -C /opt/nodejs/{v}.tmp --strip-components=1\n\
         rm -rf /opt/nodejs/{v} && mv /opt/nodejs/{v}.tmp /opt/nodejs/{v}\n\
         {bin}/node --version",
        dist = dist,
        v = version,
        bin = node_bin_dir(version)
    ))]
}

pub(super) fn remove_node(version: &str) -> Vec<RemoteCommand> {
    vec![RemoteCommand::new(format!("rm -rf /opt/nodejs/{}", version))]
}

pub(super) fn make_cli_default(spec: &ResourceSpec) -> Result<Vec<RemoteCommand>> {
    match spec {
        ResourceSpec::PhpRuntime { version } => Ok(vec![RemoteCommand::new(format!(
            "update-alternatives --set php {bin} && \
             update-alternatives --set phar /usr/bin/phar{v} && \
             update-alternatives --set phar.phar /usr/bin/phar.phar{v}",
            bin = php_binary(version),
            v = version
        ))]),
        ResourceSpec::NodeRuntime { version } => {
            let bin = node_bin_dir(version);
            Ok(vec![RemoteCommand::new(format!(
                "for tool in node npm npx; do ln -sfn {bin}/$tool /usr/local/bin/$tool; done",
                bin = bin
            ))])
        }
        other => Err(HostwrightError::conflict(format!(
            "A {} cannot be made the CLI default.",
            other.category()
        ))),
    }
}

pub(super) fn classify(stderr: &str) -> Option<&'static str> {
    if stderr.contains("Unable to locate package php") || stderr.contains("has no installation candidate") {
        Some("This PHP version is not available for the server's distribution.")
    } else if stderr.contains("404 Not Found") || stderr.contains("The requested URL returned error: 404") {
        Some("This Node.js version could not be downloaded. Check that the major version exists.")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::tests::script;

    #[test]
    fn test_php_binary_is_versioned() {
        assert_eq!(php_binary("8.2"), "/usr/bin/php8.2");
        assert_eq!(node_bin_dir("20"), "/opt/nodejs/20/bin");
    }

    #[test]
    fn test_install_php_installs_extensions_for_version() {
        let script = script(&install_php("8.3"));
        assert!(script.contains("php8.3-fpm"));
        assert!(script.contains("php8.3-intl"));
        assert!(script.contains("systemctl restart php8.3-fpm"));
    }

    #[test]
    fn test_make_cli_default_php_uses_alternatives() {
        let commands = make_cli_default(&ResourceSpec::PhpRuntime {
            version: "8.2".to_string(),
        })
        .unwrap();
        assert!(commands[0].script.contains("update-alternatives --set php /usr/bin/php8.2"));
    }

    #[test]
    fn test_make_cli_default_rejects_non_runtime() {
        assert!(make_cli_default(&ResourceSpec::Firewall).is_err());
    }

    #[test]
    fn test_node_install_is_swapped_into_place() {
        let script = script(&install_node("20"));
        assert!(script.contains("https://nodejs.org/dist/latest-v20.x"));
        assert!(script.contains("mv /opt/nodejs/20.tmp /opt/nodejs/20"));
    }
}
