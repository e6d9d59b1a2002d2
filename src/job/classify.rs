//! Turns a failed command into an actionable error log.
//!
//! The failing command text and its stderr are scanned for known
//! signatures; a match prepends a hint to the raw output. Unrecognised
//! failures keep the raw output only.

use crate::installer;
use crate::model::ResourceSpec;
use crate::transport::{CommandResult, Execution};

struct Signature {
    command: &'static [&'static str],
    stderr: &'static [&'static str],
    hint: &'static str,
}

impl Signature {
    fn matches(&self, command: &str, stderr: &str) -> bool {
        self.command.iter().any(|needle| command.contains(needle))
            || self.stderr.iter().any(|needle| stderr.contains(needle))
    }
}

const SIGNATURES: &[Signature] = &[
    Signature {
        command: &["nginx -t"],
        stderr: &["nginx: configuration file /etc/nginx/nginx.conf test failed"],
        hint: "The nginx configuration test failed. Check the site configuration for syntax errors; the previous configuration is still active.",
    },
    Signature {
        command: &["git clone", "git fetch"],
        stderr: &["Could not read from remote repository", "Repository not found"],
        hint: "The repository could not be cloned. Check the repository URL and that the server's deploy key has access to it.",
    },
    Signature {
        command: &["composer install"],
        stderr: &[],
        hint: "Composer could not install the dependencies. Check composer.json, composer.lock and the site's PHP version.",
    },
    Signature {
        command: &["npm ci", "npm install", "npm run build"],
        stderr: &[],
        hint: "npm could not install or build the front-end assets. Check package.json and the site's Node.js version.",
    },
    Signature {
        command: &["artisan migrate"],
        stderr: &[],
        hint: "The database migration failed. Check the database credentials in the shared .env file and the migration output below.",
    },
    Signature {
        command: &[],
        stderr: &[
            "Could not get lock",
            "Unable to acquire the dpkg frontend lock",
            "dpkg was interrupted",
        ],
        hint: "Another package manager process is running on the server. Wait for it to finish, then retry.",
    },
    Signature {
        command: &[],
        stderr: &["Permission denied"],
        hint: "A command was denied permission. Check file ownership on the server and that the SSH user may run it.",
    },
    Signature {
        command: &[],
        stderr: &["Failed to connect to", "Authentication failed for"],
        hint: "The server could not be reached over SSH. Check that it is online and that the control plane key is authorized.",
    },
    Signature {
        command: &[],
        stderr: &["Command timed out"],
        hint: "The command did not finish in time. It may still be running on the server; check it before retrying.",
    },
];

/// Hint for a failing command, kind-specific signatures first.
pub fn hint(spec: Option<&ResourceSpec>, command: &str, stderr: &str) -> Option<&'static str> {
    spec.and_then(|spec| installer::classify_error(spec, command, stderr))
        .or_else(|| {
            SIGNATURES
                .iter()
                .find(|sig| sig.matches(command, stderr))
                .map(|sig| sig.hint)
        })
}

/// Raw output of a failed command: stderr, falling back to stdout.
fn raw_output(result: &CommandResult) -> String {
    let stderr = result.stderr.trim();
    let output = if stderr.is_empty() {
        result.stdout.trim()
    } else {
        stderr
    };
    if output.is_empty() {
        format!("Command exited with status {}.", result.exit_code)
    } else {
        output.to_string()
    }
}

/// Error log for a failed execution: hint, blank line, raw output.
pub fn error_log(spec: Option<&ResourceSpec>, execution: &Execution) -> String {
    let Some(failure) = execution.failure() else {
        return String::new();
    };
    let raw = raw_output(failure);
    match hint(spec, &failure.command, &failure.stderr) {
        Some(hint) => format!("{}\n\n{}", hint, raw),
        None => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(command: &str, stderr: &str) -> CommandResult {
        CommandResult {
            command: command.to_string(),
            exit_code: 1,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_known_signatures() {
        assert!(hint(None, "nginx -t && systemctl reload nginx", "")
            .unwrap()
            .contains("nginx"));
        assert!(hint(None, "git clone --branch main x", "fatal")
            .unwrap()
            .contains("repository"));
        assert!(hint(None, "/usr/bin/php8.3 /usr/local/bin/composer install", "")
            .unwrap()
            .contains("Composer"));
        assert!(hint(None, "php8.3 artisan migrate --force", "")
            .unwrap()
            .contains("migration"));
        assert!(hint(None, "mkdir /var/www", "mkdir: Permission denied")
            .unwrap()
            .contains("permission"));
    }

    #[test]
    fn test_unknown_failure_has_no_hint() {
        assert_eq!(hint(None, "true", "segfault"), None);
    }

    #[test]
    fn test_kind_specific_hint_wins() {
        let spec = ResourceSpec::Cache {
            engine: crate::model::CacheEngine::Redis,
            port: 6379,
        };
        let found = hint(Some(&spec), "systemctl restart redis-server", "Address already in use");
        assert!(found.unwrap().contains("port"));
    }

    #[test]
    fn test_raw_output_fallbacks() {
        let mut r = result("x", "");
        assert_eq!(raw_output(&r), "Command exited with status 1.");
        r.stdout = "out".to_string();
        assert_eq!(raw_output(&r), "out");
    }
}
