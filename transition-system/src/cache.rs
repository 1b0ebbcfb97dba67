use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::lock::{LockError, LockToken};
use crate::protocol::is_valid_package_name;

/// dpkg status letters for packages that still have files on disk.
const REMOVABLE_STATES: &str = "iUHFWt";

#[derive(Debug, Error)]
pub enum PackageError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} failed ({status}): {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },
}

/// The package database the service mutates.
#[async_trait]
pub trait PackageSystem: Send + Sync {
    type Lock: Send + Sync;
    type Session: CacheSession;

    /// Takes the package-manager lock; `Ok(None)` when another process holds it.
    fn try_lock(&self) -> Result<Option<Self::Lock>, PackageError>;

    /// Refreshes the package index ahead of opening the cache.
    async fn refresh_index(&self) -> Result<(), PackageError>;

    async fn open_cache(&self) -> Result<Self::Session, PackageError>;
}

/// An open view of the package database with staged removals.
#[async_trait]
pub trait CacheSession: Send + Sync {
    /// Stages `name` for removal and returns the name the package system
    /// resolved it to, or `None` when it is not installed.
    fn mark_delete(&mut self, name: &str) -> Option<String>;

    /// Applies every staged removal.
    async fn commit(&mut self) -> Result<(), PackageError>;

    fn marked(&self) -> &[String];
}

/// Debian package system driven through apt-get, dpkg-query and dpkg.
pub struct Apt {
    lock_path: PathBuf,
    refresh_index: bool,
}

impl Apt {
    pub fn new(lock_path: impl Into<PathBuf>, refresh_index: bool) -> Self {
        Self {
            lock_path: lock_path.into(),
            refresh_index,
        }
    }
}

#[async_trait]
impl PackageSystem for Apt {
    type Lock = LockToken;
    type Session = DpkgSession;

    fn try_lock(&self) -> Result<Option<LockToken>, PackageError> {
        Ok(LockToken::try_acquire(&self.lock_path)?)
    }

    async fn refresh_index(&self) -> Result<(), PackageError> {
        if !self.refresh_index {
            return Ok(());
        }

        run("apt-get", &["update", "-q"], &[]).await.map(|_| ())
    }

    async fn open_cache(&self) -> Result<DpkgSession, PackageError> {
        let status = run(
            "dpkg-query",
            &["-W", "-f", "${Package}\t${Architecture}\t${db:Status-Abbrev}\n"],
            &[],
        )
        .await?;

        Ok(DpkgSession::from_status(&status))
    }
}

/// Installed packages as reported by dpkg-query, plus the staged removals.
#[derive(Debug, Default)]
pub struct DpkgSession {
    installed: HashMap<String, Vec<String>>,
    marked: Vec<String>,
}

impl DpkgSession {
    /// Parses `package\tarch\tstatus` lines.
    pub fn from_status(status: &str) -> Self {
        let mut installed: HashMap<String, Vec<String>> = HashMap::new();

        for line in status.lines() {
            let mut fields = line.split('\t');
            let (Some(package), Some(arch), Some(abbrev)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };

            let removable = abbrev
                .chars()
                .nth(1)
                .is_some_and(|state| REMOVABLE_STATES.contains(state));
            if removable {
                installed
                    .entry(package.to_owned())
                    .or_default()
                    .push(arch.to_owned());
            }
        }

        Self {
            installed,
            marked: Vec::new(),
        }
    }

    fn resolve(&self, name: &str) -> Option<String> {
        if !is_valid_package_name(name) {
            return None;
        }

        match name.split_once(':') {
            Some((package, arch)) => self
                .installed
                .get(package)
                .filter(|archs| archs.iter().any(|a| a == arch))
                .map(|_| name.to_owned()),
            None => self.installed.get(name).map(|_| name.to_owned()),
        }
    }
}

#[async_trait]
impl CacheSession for DpkgSession {
    fn mark_delete(&mut self, name: &str) -> Option<String> {
        let resolved = self.resolve(name)?;
        if !self.marked.contains(&resolved) {
            self.marked.push(resolved.clone());
        }

        Some(resolved)
    }

    async fn commit(&mut self) -> Result<(), PackageError> {
        if self.marked.is_empty() {
            return Ok(());
        }

        let mut args = vec!["--remove"];
        args.extend(self.marked.iter().map(String::as_str));

        // The service already holds the frontend lock; dpkg must not take it again.
        run("dpkg", &args, &[("DPKG_FRONTEND_LOCKED", "1")]).await?;

        for package in self.marked.drain(..) {
            self.installed.remove(package.split(':').next().unwrap_or(&package));
        }

        Ok(())
    }

    fn marked(&self) -> &[String] {
        &self.marked
    }
}

async fn run(program: &str, args: &[&str], env: &[(&str, &str)]) -> Result<String, PackageError> {
    tracing::debug!(target: "TransitionSystem::Cache", "Running {program} {}", args.join(" "));

    let output = Command::new(program)
        .args(args)
        .envs(env.iter().copied())
        .env("DEBIAN_FRONTEND", "noninteractive")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| PackageError::Spawn {
            program: program.to_owned(),
            source,
        })?;

    if !output.status.success() {
        return Err(PackageError::Command {
            program: program.to_owned(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
