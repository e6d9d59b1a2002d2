//! Release-based deployment commands.
//!
//! Layout under the site root:
//!
//! ```text
//! releases/<YYYYmmddHHMMSS>/   one checkout per deployment
//! shared/                      paths that survive releases
//! current -> releases/<...>    the active release
//! ```
//!
//! `current` is only repointed after the checkout, links and build
//! succeeded, and the swap is a rename so readers never see a missing link.

use crate::error::{Result, ValidationErrors};
use crate::installer::{node_bin_dir, php_binary};
use crate::model::{Deployment, SharedPath, SharedPathKind, Site};
use crate::transport::RemoteCommand;
use crate::utils::shell_quote;

/// Paths of one release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseLayout {
    pub site_root: String,
    pub release_dir: String,
    pub shared_dir: String,
    pub current: String,
}

impl ReleaseLayout {
    pub fn new(site: &Site, sites_user: &str, release: &str) -> Self {
        let site_root = site.root_path(sites_user);
        Self {
            release_dir: format!("{}/releases/{}", site_root, release),
            shared_dir: format!("{}/shared", site_root),
            current: format!("{}/current", site_root),
            site_root,
        }
    }
}

/// Commands of one deployment, plus where to read the resolved commit.
#[derive(Debug, Clone)]
pub struct DeployPlan {
    pub layout: ReleaseLayout,
    pub commands: Vec<RemoteCommand>,
    /// Index of the `git rev-parse HEAD` command.
    pub revision_index: usize,
}

pub struct PipelineSettings<'a> {
    pub sites_user: &'a str,
    pub keep_releases: usize,
    pub release: &'a str,
    /// Finished earlier deployments of the site.
    pub past_releases: &'a [PastRelease],
}

/// Release of an earlier deployment and whether it went live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PastRelease {
    pub name: String,
    pub live: bool,
}

/// Releases to delete once `current` is active: live releases beyond the
/// newest `keep`, and failed ones older than the oldest live release kept.
/// Failed releases never count towards `keep`, so the rollback target
/// survives a run of failed deployments.
pub fn prunable(current: &str, past: &[PastRelease], keep: usize) -> Vec<String> {
    let mut live: Vec<&str> = past
        .iter()
        .filter(|r| r.live && r.name != current)
        .map(|r| r.name.as_str())
        .chain(std::iter::once(current))
        .collect();
    live.sort_unstable_by(|a, b| b.cmp(a));

    let keep = keep.max(1).min(live.len());
    let oldest_kept = live[keep - 1];
    let mut prune: Vec<String> = live[keep..].iter().map(|name| name.to_string()).collect();
    prune.extend(
        past.iter()
            .filter(|r| !r.live && r.name.as_str() < oldest_kept)
            .map(|r| r.name.clone()),
    );
    prune.sort_unstable();
    prune.dedup();
    prune
}

fn parent(path: &str) -> &str {
    path.rsplit_once('/').map_or(".", |(dir, _)| dir)
}

/// Replaces `path` inside the release with a link into the shared
/// directory. Anything the checkout brought at that name is removed first,
/// otherwise `ln` would create the link inside an existing directory.
fn link_shared(layout: &ReleaseLayout, shared: &SharedPath) -> RemoteCommand {
    let target = shell_quote(&format!("{}/{}", layout.shared_dir, shared.path));
    let link = shell_quote(&format!("{}/{}", layout.release_dir, shared.path));
    let target_parent = shell_quote(parent(&format!("{}/{}", layout.shared_dir, shared.path)));
    let link_parent = shell_quote(parent(&format!("{}/{}", layout.release_dir, shared.path)));

    let (seed, remove) = match shared.kind {
        SharedPathKind::Directory => (format!("mkdir -p {}", target), "rm -rf"),
        SharedPathKind::File => (format!("touch {}", target), "rm -f"),
    };

    RemoteCommand::new(format!(
        "if [ ! -e {target} ]; then mkdir -p {target_parent}; \
         if [ -e {link} ]; then mv {link} {target}; else {seed}; fi; fi && \
         {remove} {link} && mkdir -p {link_parent} && ln -s {target} {link}",
        target = target,
        target_parent = target_parent,
        link = link,
        seed = seed,
        remove = remove,
        link_parent = link_parent,
    ))
}

/// Site settings the pipeline depends on.
pub fn validate_site(site: &Site) -> std::result::Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::new();
    if site.run_migrations && site.php_version.is_none() {
        errors.add(
            "php_version",
            "Migrations need a PHP version configured on the site.",
        );
    }
    for shared in &site.shared_paths {
        let path = shared.path.as_str();
        if path.is_empty()
            || path.starts_with('/')
            || path.split('/').any(|part| part.is_empty() || part == "." || part == "..")
        {
            errors.add(
                "shared_paths",
                format!("\"{}\" is not a relative path inside the release.", path),
            );
        }
    }
    errors.into_result()
}

pub fn build(site: &Site, deployment: &Deployment, settings: &PipelineSettings<'_>) -> Result<DeployPlan> {
    validate_site(site)?;
    let repository = site.repository.as_ref().ok_or_else(|| {
        ValidationErrors::single("repository", "The site has no git repository to deploy.")
    })?;

    let layout = ReleaseLayout::new(site, settings.sites_user, settings.release);
    let release = shell_quote(&layout.release_dir);
    let php = site.php_version.as_deref().map(php_binary);
    let mut commands = Vec::new();

    commands.push(RemoteCommand::new(format!(
        "mkdir -p {} {}",
        shell_quote(&format!("{}/releases", layout.site_root)),
        shell_quote(&layout.shared_dir)
    )));

    let mut clone = format!(
        "git clone --branch {} --single-branch {} {}",
        shell_quote(&deployment.branch),
        shell_quote(&repository.url),
        release
    );
    if let Some(sha) = &deployment.commit_sha {
        clone.push_str(&format!(" && git -C {} checkout --quiet {}", release, shell_quote(sha)));
    }
    commands.push(RemoteCommand::new(clone));

    let revision_index = commands.len();
    commands.push(RemoteCommand::new(format!("git -C {} rev-parse HEAD", release)));

    for shared in &site.shared_paths {
        commands.push(link_shared(&layout, shared));
    }

    if let Some(php) = &php {
        commands.push(RemoteCommand::new(format!(
            "cd {} && if [ -f composer.json ]; then COMPOSER_ALLOW_SUPERUSER=1 {} /usr/local/bin/composer install \
             --no-dev --no-interaction --prefer-dist --optimize-autoloader; fi",
            release, php
        )));
    }

    if let Some(node) = &site.node_version {
        commands.push(RemoteCommand::new(format!(
            "cd {} && if [ -f package.json ]; then export PATH={}:$PATH && npm ci && npm run build --if-present; fi",
            release,
            node_bin_dir(node)
        )));
    }

    if site.run_migrations {
        if let Some(php) = &php {
            commands.push(RemoteCommand::new(format!(
                "cd {} && {} artisan migrate --force",
                release, php
            )));
        }
    }

    if !deployment.deployment_script.trim().is_empty() {
        commands.push(RemoteCommand::new(format!(
            "cd {release} && export PHP_BIN={php} RELEASE_DIR={release} SHARED_DIR={shared} \
             SITE_ROOT={root} BRANCH={branch}\n{script}",
            release = release,
            php = shell_quote(php.as_deref().unwrap_or("")),
            shared = shell_quote(&layout.shared_dir),
            root = shell_quote(&layout.site_root),
            branch = shell_quote(&deployment.branch),
            script = deployment.deployment_script.trim_end(),
        )));
    }

    commands.push(RemoteCommand::new(format!(
        "chown -R {user}:{user} {release} {shared}",
        user = settings.sites_user,
        release = release,
        shared = shell_quote(&layout.shared_dir)
    )));

    let staged = shell_quote(&format!("{}.tmp", layout.current));
    commands.push(RemoteCommand::new(format!(
        "ln -sfn {} {} && mv -Tf {} {}",
        release,
        staged,
        staged,
        shell_quote(&layout.current)
    )));

    if let Some(version) = &site.php_version {
        commands.push(RemoteCommand::best_effort(format!(
            "systemctl reload php{}-fpm",
            version
        )));
    }

    let prune = prunable(settings.release, settings.past_releases, settings.keep_releases);
    if !prune.is_empty() {
        let names: Vec<String> = prune.iter().map(|name| shell_quote(name)).collect();
        commands.push(RemoteCommand::best_effort(format!(
            "cd {} && rm -rf -- {}",
            shell_quote(&format!("{}/releases", layout.site_root)),
            names.join(" ")
        )));
    }

    Ok(DeployPlan {
        layout,
        commands,
        revision_index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CommitInfo, Repository, ServerId};

    const ROOT: &str = "/home/hostwright/shop.example.com";
    const RELEASE: &str = "/home/hostwright/shop.example.com/releases/20240102030405";

    fn site() -> Site {
        let mut site = Site::new(ServerId::new(), "shop.example.com");
        site.repository = Some(Repository {
            url: "git@github.com:acme/shop.git".to_string(),
            full_name: "acme/shop".to_string(),
            branch: "main".to_string(),
        });
        site.php_version = Some("8.3".to_string());
        site.deployment_script = "php artisan optimize".to_string();
        site
    }

    fn plan(site: &Site, commit: CommitInfo) -> DeployPlan {
        let deployment = Deployment::for_site(site, commit).unwrap();
        build(
            site,
            &deployment,
            &PipelineSettings {
                sites_user: "hostwright",
                keep_releases: 5,
                release: "20240102030405",
                past_releases: &[],
            },
        )
        .unwrap()
    }

    fn scripts(plan: &DeployPlan) -> Vec<&str> {
        plan.commands.iter().map(|c| c.script.as_str()).collect()
    }

    #[test]
    fn test_clone_into_timestamped_release() {
        let plan = plan(&site(), CommitInfo::default());
        assert_eq!(plan.layout.release_dir, RELEASE);
        let scripts = scripts(&plan);
        assert_eq!(
            scripts[1],
            format!(
                "git clone --branch 'main' --single-branch 'git@github.com:acme/shop.git' '{}'",
                RELEASE
            )
        );
        assert_eq!(scripts[plan.revision_index], format!("git -C '{}' rev-parse HEAD", RELEASE));
    }

    #[test]
    fn test_pinned_commit_is_checked_out() {
        let plan = plan(
            &site(),
            CommitInfo {
                commit_sha: Some("abc123".to_string()),
                ..CommitInfo::default()
            },
        );
        assert!(scripts(&plan)[1].ends_with("checkout --quiet 'abc123'"));
    }

    #[test]
    fn test_shared_directory_removed_before_linking() {
        let plan = plan(&site(), CommitInfo::default());
        let storage = scripts(&plan)
            .into_iter()
            .find(|s| s.contains("ln -s '/home/hostwright/shop.example.com/shared/storage'"))
            .unwrap();

        let remove = storage
            .find(&format!("rm -rf '{}/storage'", RELEASE))
            .unwrap();
        let link = storage.find("ln -s").unwrap();
        assert!(remove < link);
    }

    #[test]
    fn test_shared_file_uses_plain_remove() {
        let plan = plan(&site(), CommitInfo::default());
        let env = scripts(&plan)
            .into_iter()
            .find(|s| s.contains("/shared/.env'"))
            .unwrap();
        assert!(env.contains(&format!("rm -f '{}/.env'", RELEASE)));
        assert!(env.contains("touch '/home/hostwright/shop.example.com/shared/.env'"));
        assert!(!env.contains("rm -rf"));
    }

    #[test]
    fn test_build_uses_site_runtime_versions() {
        let mut site = site();
        site.node_version = Some("20".to_string());
        site.run_migrations = true;
        let plan = plan(&site, CommitInfo::default());
        let all = scripts(&plan).join("\n");

        assert!(all.contains("/usr/bin/php8.3 /usr/local/bin/composer install"));
        assert!(all.contains("export PATH=/opt/nodejs/20/bin:$PATH && npm ci"));
        assert!(all.contains("/usr/bin/php8.3 artisan migrate --force"));
        assert!(!all.contains(" php artisan migrate"));
    }

    #[test]
    fn test_activation_comes_after_build_and_script() {
        let plan = plan(&site(), CommitInfo::default());
        let scripts = scripts(&plan);
        let script = scripts
            .iter()
            .position(|s| s.contains("php artisan optimize"))
            .unwrap();
        let activation = scripts
            .iter()
            .position(|s| s.starts_with("ln -sfn"))
            .unwrap();
        assert!(script < activation);
        assert_eq!(
            scripts[activation],
            format!(
                "ln -sfn '{release}' '{root}/current.tmp' && mv -Tf '{root}/current.tmp' '{root}/current'",
                release = RELEASE,
                root = ROOT
            )
        );
        assert!(!plan.commands[activation].best_effort);
        assert!(plan.commands[activation + 1..].iter().all(|c| c.best_effort));
    }

    #[test]
    fn test_deployment_script_gets_environment() {
        let plan = plan(&site(), CommitInfo::default());
        let script = scripts(&plan)
            .into_iter()
            .find(|s| s.contains("php artisan optimize"))
            .unwrap();
        assert!(script.contains("PHP_BIN='/usr/bin/php8.3'"));
        assert!(script.contains(&format!("RELEASE_DIR='{}'", RELEASE)));
        assert!(script.contains("BRANCH='main'"));
    }

    fn past(name: &str, live: bool) -> PastRelease {
        PastRelease {
            name: name.to_string(),
            live,
        }
    }

    #[test]
    fn test_failed_releases_do_not_push_out_rollback_target() {
        let history = [
            past("20240101000000", true),
            past("20240101010000", true),
            past("20240101020000", false),
            past("20240101030000", false),
            past("20240101040000", false),
        ];

        assert_eq!(prunable("20240101050000", &history, 2), ["20240101000000"]);
        assert_eq!(
            prunable("20240101050000", &history, 1),
            [
                "20240101000000",
                "20240101010000",
                "20240101020000",
                "20240101030000",
                "20240101040000"
            ]
        );
        assert!(prunable("20240101050000", &history, 5).is_empty());
    }

    #[test]
    fn test_prune_command_names_releases() {
        let site = site();
        let deployment = Deployment::for_site(&site, CommitInfo::default()).unwrap();
        let history = [past("20240101000000", true), past("20240101010000", false)];
        let pruned = build(
            &site,
            &deployment,
            &PipelineSettings {
                sites_user: "hostwright",
                keep_releases: 1,
                release: "20240102030405",
                past_releases: &history,
            },
        )
        .unwrap();

        let prune = pruned.commands.last().unwrap();
        assert!(prune.best_effort);
        assert_eq!(
            prune.script,
            format!("cd '{}/releases' && rm -rf -- '20240101000000' '20240101010000'", ROOT)
        );
        assert!(!scripts(&plan(&site, CommitInfo::default()))
            .iter()
            .any(|s| s.contains("rm -rf --")));
    }

    #[test]
    fn test_migrations_need_php_version() {
        let mut site = site();
        site.php_version = None;
        site.run_migrations = true;
        let deployment = Deployment::for_site(&site, CommitInfo::default()).unwrap();
        let err = build(
            &site,
            &deployment,
            &PipelineSettings {
                sites_user: "hostwright",
                keep_releases: 5,
                release: "20240102030405",
                past_releases: &[],
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("PHP version"));
    }

    #[test]
    fn test_shared_paths_must_stay_inside_release() {
        let mut site = site();
        site.shared_paths.push(SharedPath::directory("../escape"));
        let deployment = Deployment::for_site(&site, CommitInfo::default()).unwrap();
        assert!(build(
            &site,
            &deployment,
            &PipelineSettings {
                sites_user: "hostwright",
                keep_releases: 5,
                release: "20240102030405",
                past_releases: &[],
            },
        )
        .is_err());
    }
}
